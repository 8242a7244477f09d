//! WebSocket relay server
//!
//! Accepts consumer connections on `/video/{device_id}` and forwards the
//! device's NAL units to them.

pub mod config;
pub mod connection;
pub mod listener;
pub mod message;

pub use config::ServerConfig;
pub use connection::device_from_path;
pub use listener::RelayServer;
pub use message::{IncomingText, RelayMessage};
