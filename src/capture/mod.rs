//! Device-side capture
//!
//! [`AdbLauncher`] pushes and starts scrcpy-server on the device over adb and
//! hands back a [`CaptureHandle`] carrying the forwarded tunnel socket.
//! [`CaptureLauncher`] is the seam the session layer depends on, so tests can
//! substitute an in-memory tunnel.

pub mod adb;
pub mod config;
pub mod launcher;
pub mod port;

pub use config::CaptureConfig;
pub use launcher::{AdbLauncher, CaptureHandle, CaptureLauncher, TunnelStream};
pub use port::{PortLease, PortPool};
