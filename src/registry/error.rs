//! Session error types

use thiserror::Error;

use crate::device::DeviceId;
use crate::error::{IngestError, LaunchError};

/// Error type for session operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The capture could not be started; the session is `Failed`
    #[error("failed to start capture for {device}: {source}")]
    Launch {
        device: DeviceId,
        #[source]
        source: LaunchError,
    },

    /// Ingestion stopped; the session is torn down by the reaper
    #[error("stream for {device} ended: {source}")]
    Ended {
        device: DeviceId,
        #[source]
        source: IngestError,
    },

    /// No session exists for the device
    #[error("no session for {0}")]
    NotFound(DeviceId),
}

impl SessionError {
    pub fn device(&self) -> &DeviceId {
        match self {
            SessionError::Launch { device, .. }
            | SessionError::Ended { device, .. }
            | SessionError::NotFound(device) => device,
        }
    }
}
