//! screen-relay: low-latency Android screen mirroring
//!
//! Captures a device screen with the scrcpy helper over adb, frames the
//! H.264 elementary stream into NAL units and fans them out to any number of
//! WebSocket consumers. Late joiners are primed with the cached parameter
//! sets and the latest intra frame so they can render immediately.
//!
//! ```text
//! adb + scrcpy ──► StreamIngester ──► ParameterCache ──► Broadcaster ──► WebSocket
//!                                                                          │
//!                                        PlaybackClient ◄──────────────────┘
//! ```
//!
//! # Relay
//!
//! ```no_run
//! use screen_relay::{AdbLauncher, CaptureConfig, RelayServer, ServerConfig};
//!
//! # async fn run() -> screen_relay::Result<()> {
//! let launcher = AdbLauncher::new(CaptureConfig::from_env());
//! let server = RelayServer::new(ServerConfig::default(), launcher);
//! server.run().await
//! # }
//! ```
//!
//! # Playback
//!
//! ```no_run
//! use screen_relay::playback::{PlaybackClient, PlaybackConfig, SinkFactory, WsConnector};
//!
//! # async fn play() {
//! let connector = WsConnector::for_device("127.0.0.1:8765", "emulator-5554");
//! let client = PlaybackClient::new(connector, SinkFactory::new(std::io::stdout), PlaybackConfig::default());
//! let _outcome = client.run().await;
//! # }
//! ```

pub mod capture;
pub mod device;
pub mod error;
pub mod ingest;
pub mod media;
pub mod playback;
pub mod registry;
pub mod server;
pub mod stats;

pub use capture::{AdbLauncher, CaptureConfig, CaptureHandle, CaptureLauncher};
pub use device::{DeviceId, Resolution, StreamInfo};
pub use error::{Error, Result};
pub use ingest::{StreamIngester, TunnelMode};
pub use registry::{RelayConfig, SessionRegistry, SessionState};
pub use server::{RelayServer, ServerConfig};
