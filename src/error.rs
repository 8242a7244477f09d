//! Error types
//!
//! Each layer has its own error enum so callers can match on the failure
//! class that matters to them. [`Error`] wraps all of them.

use thiserror::Error;

pub use crate::registry::error::SessionError;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-level error
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure to bring up the capture helper for a device
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LaunchError {
    /// The control channel (adb) could not reach the device
    #[error("device unreachable: {0}")]
    DeviceUnreachable(String),

    /// The helper exited immediately or never completed its socket handshake
    #[error("capture helper failed to start: {0}")]
    HelperStartFailed(String),

    /// Every port in the tunnel range is leased or bound by someone else
    #[error("no free tunnel port in {first}..={last}")]
    PortExhausted { first: u16, last: u16 },
}

/// Failure while turning tunnel bytes into NAL units
///
/// Both variants end the session; the ingester never resynchronizes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    /// Bytes could not be framed into units
    #[error("framing error: {0}")]
    FramingError(String),

    /// The tunnel socket reached EOF or was reset
    #[error("stream ended: {0}")]
    StreamEnded(String),
}

/// Consumer-side decode failure
#[derive(Debug, Error)]
pub enum DecodeError {
    /// A slice arrived before the SPS/PPS it depends on
    #[error("slice received before parameter sets")]
    MissingParameterSets,

    /// An inter frame arrived before any intra frame
    #[error("inter frame without a preceding intra frame")]
    MissingReference,

    /// The decoder's buffer is full
    #[error("decoder buffer error: {0}")]
    Buffer(String),

    /// Output sink write failed
    #[error("sink write failed: {0}")]
    Sink(#[from] std::io::Error),
}

/// Consumer-side transport failure
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connect timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("invalid relay message: {0}")]
    InvalidMessage(#[from] serde_json::Error),
}
