//! Capture configuration

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::TunnelMode;

/// Helper version the launcher speaks to
pub const SERVER_VERSION: &str = "3.3.3";

/// Where the helper is pushed on the device
pub const REMOTE_SERVER_PATH: &str = "/data/local/tmp/scrcpy-server";

/// System locations searched for the helper after the working directory
const SYSTEM_SERVER_PATHS: &[&str] = &[
    "/opt/homebrew/Cellar/scrcpy/3.3.3/share/scrcpy/scrcpy-server",
    "/usr/local/share/scrcpy/scrcpy-server",
    "/usr/share/scrcpy/scrcpy-server",
];

/// Capture helper configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// adb executable
    pub adb_path: PathBuf,

    /// Local helper jar to push (None = locate on start)
    pub server_path: Option<PathBuf>,

    /// Helper protocol version
    pub server_version: String,

    /// Device path the helper is pushed to
    pub remote_path: String,

    /// Longest side of the encoded picture (0 = native)
    pub max_size: u32,

    /// Encoder bit rate in bits per second
    pub bit_rate: u32,

    /// Seconds between forced keyframes
    pub i_frame_interval: u32,

    /// Local ports the tunnel may use
    pub port_range: RangeInclusive<u16>,

    /// Tunnel byte layout
    pub tunnel_mode: TunnelMode,

    /// Socket handshake must complete within this time
    pub handshake_timeout: Duration,

    /// Timeout for every adb invocation
    pub command_timeout: Duration,

    /// Wait between graceful and hard kill
    pub kill_grace: Duration,

    /// Wait between tunnel connect attempts during the handshake
    pub connect_retry_interval: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            adb_path: PathBuf::from("adb"),
            server_path: None,
            server_version: SERVER_VERSION.to_string(),
            remote_path: REMOTE_SERVER_PATH.to_string(),
            max_size: 1280,
            bit_rate: 2_000_000,
            i_frame_interval: 1,
            port_range: 27183..=27283,
            tunnel_mode: TunnelMode::Framed,
            handshake_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(10),
            kill_grace: Duration::from_secs(2),
            connect_retry_interval: Duration::from_millis(100),
        }
    }
}

impl CaptureConfig {
    /// Defaults, with `ADB_PATH` and `SCRCPY_SERVER_PATH` honoured
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(adb) = std::env::var_os("ADB_PATH") {
            config.adb_path = PathBuf::from(adb);
        }
        if let Some(server) = std::env::var_os("SCRCPY_SERVER_PATH") {
            config.server_path = Some(PathBuf::from(server));
        }
        config
    }

    /// Set the adb executable
    pub fn adb_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.adb_path = path.into();
        self
    }

    /// Set the local helper jar
    pub fn server_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.server_path = Some(path.into());
        self
    }

    /// Set the longest encoded side
    pub fn max_size(mut self, max_size: u32) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set the encoder bit rate
    pub fn bit_rate(mut self, bit_rate: u32) -> Self {
        self.bit_rate = bit_rate;
        self
    }

    /// Set the tunnel port range
    pub fn port_range(mut self, range: RangeInclusive<u16>) -> Self {
        self.port_range = range;
        self
    }

    /// Set the tunnel layout
    pub fn tunnel_mode(mut self, mode: TunnelMode) -> Self {
        self.tunnel_mode = mode;
        self
    }

    /// Set the handshake timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the kill grace period
    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Find the helper jar
    ///
    /// Order: configured path, `scrcpy-server-v{version}` in the working
    /// directory, then the usual install locations.
    pub fn locate_server(&self) -> Option<PathBuf> {
        if let Some(path) = &self.server_path {
            return path.is_file().then(|| path.clone());
        }

        let local = PathBuf::from(format!("scrcpy-server-v{}", self.server_version));
        if local.is_file() {
            return Some(local);
        }

        SYSTEM_SERVER_PATHS
            .iter()
            .map(Path::new)
            .find(|path| path.is_file())
            .map(Path::to_path_buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CaptureConfig::default();

        assert_eq!(config.adb_path, PathBuf::from("adb"));
        assert_eq!(config.server_version, "3.3.3");
        assert_eq!(config.max_size, 1280);
        assert_eq!(config.bit_rate, 2_000_000);
        assert_eq!(config.i_frame_interval, 1);
        assert_eq!(config.tunnel_mode, TunnelMode::Framed);
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.kill_grace, Duration::from_secs(2));
        assert!(config.port_range.contains(&27183));
    }

    #[test]
    fn test_builder_chaining() {
        let config = CaptureConfig::default()
            .adb_path("/opt/android/platform-tools/adb")
            .max_size(720)
            .bit_rate(4_000_000)
            .port_range(30000..=30010)
            .tunnel_mode(TunnelMode::Raw)
            .handshake_timeout(Duration::from_secs(1))
            .kill_grace(Duration::from_millis(500));

        assert_eq!(config.adb_path, PathBuf::from("/opt/android/platform-tools/adb"));
        assert_eq!(config.max_size, 720);
        assert_eq!(config.bit_rate, 4_000_000);
        assert_eq!(config.port_range, 30000..=30010);
        assert_eq!(config.tunnel_mode, TunnelMode::Raw);
        assert_eq!(config.handshake_timeout, Duration::from_secs(1));
        assert_eq!(config.kill_grace, Duration::from_millis(500));
    }

    #[test]
    fn test_locate_server_missing_configured_path() {
        let config = CaptureConfig::default().server_path("/nonexistent/scrcpy-server");
        assert_eq!(config.locate_server(), None);
    }
}
