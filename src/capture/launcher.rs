//! Capture helper lifecycle
//!
//! Start sequence for one device:
//!
//! ```text
//! kill stale helper -> push jar -> wm size -> lease port
//!   -> adb forward tcp:PORT localabstract:scrcpy_SCID
//!   -> adb shell app_process ... (helper)
//!   -> connect + dummy byte -> [device name + codec header]
//! ```
//!
//! In forward mode adb accepts the local connection even before the helper
//! listens, then closes it. The handshake therefore reconnects until the
//! helper's dummy byte arrives or the handshake timeout expires.

use std::future::Future;
use std::hash::{BuildHasher, Hasher};
use std::net::Ipv4Addr;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::process::Child;

use super::adb::Adb;
use super::config::CaptureConfig;
use super::port::{PortLease, PortPool};
use crate::device::{DeviceId, Resolution, StreamInfo};
use crate::error::LaunchError;
use crate::ingest::TunnelMode;

/// Codec id the helper announces for H.264 ("h264")
pub const CODEC_ID_H264: u32 = 0x6832_3634;

/// Length of the device name field in the helper preamble
pub const DEVICE_NAME_LEN: usize = 64;

const HELPER_MAIN_CLASS: &str = "com.genymobile.scrcpy.Server";
const STALE_HELPER_PATTERN: &str = "app_process.*scrcpy";
const HELPER_START_ATTEMPTS: u32 = 3;
const STDERR_LIMIT: u64 = 4096;

/// Byte stream carrying the encoded video
pub type TunnelStream = Box<dyn AsyncRead + Send + Sync + Unpin>;

/// A running capture for one device
///
/// Returned by [`CaptureLauncher::start`]. The ingester takes the tunnel
/// stream; the rest stays with the handle until [`CaptureLauncher::stop`].
pub struct CaptureHandle {
    device: DeviceId,
    info: StreamInfo,
    mode: TunnelMode,
    device_name: Option<String>,
    stream: Option<TunnelStream>,
    process: Option<HelperProcess>,
}

impl CaptureHandle {
    /// Handle for a tunnel not backed by a helper process
    pub fn new(device: DeviceId, stream: TunnelStream, mode: TunnelMode, info: StreamInfo) -> Self {
        Self {
            device,
            info,
            mode,
            device_name: None,
            stream: Some(stream),
            process: None,
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// Resolutions known at start
    pub fn info(&self) -> StreamInfo {
        self.info
    }

    pub fn mode(&self) -> TunnelMode {
        self.mode
    }

    /// Device model name from the helper preamble (framed mode only)
    pub fn device_name(&self) -> Option<&str> {
        self.device_name.as_deref()
    }

    /// Local tunnel port, if a helper is attached
    pub fn port(&self) -> Option<u16> {
        self.process.as_ref().map(|p| p.lease.port())
    }

    /// Take the tunnel stream (only once)
    pub fn take_stream(&mut self) -> Option<TunnelStream> {
        self.stream.take()
    }

    /// Health check: false once the helper process has exited
    ///
    /// Handles without a helper process are always alive.
    pub fn is_alive(&mut self) -> bool {
        match &mut self.process {
            Some(process) => matches!(process.child.try_wait(), Ok(None)),
            None => true,
        }
    }
}

impl std::fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureHandle")
            .field("device", &self.device)
            .field("info", &self.info)
            .field("mode", &self.mode)
            .field("port", &self.port())
            .finish_non_exhaustive()
    }
}

/// Starts and stops capture helpers
///
/// Implementations must make `stop` idempotent: after it returns the tunnel
/// port is released and no helper process is left behind.
pub trait CaptureLauncher: Send + Sync + 'static {
    fn start(
        &self,
        device: &DeviceId,
    ) -> impl Future<Output = Result<CaptureHandle, LaunchError>> + Send;

    fn stop(&self, handle: &mut CaptureHandle) -> impl Future<Output = ()> + Send;
}

/// Helper process plus the resources leased for it
struct HelperProcess {
    adb: Adb,
    device: DeviceId,
    scid: u32,
    child: Child,
    lease: PortLease,
    kill_grace: std::time::Duration,
}

impl HelperProcess {
    fn pattern(&self) -> String {
        format!("scid={:08x}", self.scid)
    }

    /// Graceful kill, hard kill after the grace period, then drop the forward
    async fn shutdown(mut self) {
        let port = self.lease.port();
        let pattern = self.pattern();

        self.adb.kill_matching(&self.device, "-15", &pattern).await;
        match tokio::time::timeout(self.kill_grace, self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                tracing::debug!(device = %self.device, port = port, "Helper ignored SIGTERM, killing");
                self.adb.kill_matching(&self.device, "-9", &pattern).await;
                if let Err(e) = self.child.kill().await {
                    tracing::debug!(device = %self.device, error = %e, "Failed to kill adb shell");
                }
            }
        }

        self.adb.remove_forward(&self.device, port).await;
        tracing::debug!(device = %self.device, port = port, "Capture helper stopped");
    }

    async fn exit_message(&mut self, status: ExitStatus) -> String {
        let mut stderr = String::new();
        if let Some(pipe) = self.child.stderr.take() {
            let _ = pipe.take(STDERR_LIMIT).read_to_string(&mut stderr).await;
        }
        let stderr = stderr.trim();
        if stderr.is_empty() {
            format!("helper exited with {status}")
        } else {
            format!("helper exited with {status}: {stderr}")
        }
    }
}

/// What the handshake learned from the helper
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Preamble {
    pub device_name: String,
    pub encoded: Option<Resolution>,
}

/// Read the framed-mode preamble: device name, then codec id and size
pub async fn read_preamble<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Preamble, LaunchError> {
    let short = |e: std::io::Error| LaunchError::HelperStartFailed(format!("short preamble: {e}"));

    let mut name = [0u8; DEVICE_NAME_LEN];
    reader.read_exact(&mut name).await.map_err(short)?;
    let end = name.iter().position(|&b| b == 0).unwrap_or(DEVICE_NAME_LEN);
    let device_name = String::from_utf8_lossy(&name[..end]).into_owned();

    let codec_id = reader.read_u32().await.map_err(short)?;
    match codec_id {
        CODEC_ID_H264 => {}
        0 => return Err(LaunchError::HelperStartFailed("video stream disabled by helper".into())),
        1 => return Err(LaunchError::HelperStartFailed("helper reported a configuration error".into())),
        other => {
            return Err(LaunchError::HelperStartFailed(format!(
                "unsupported codec 0x{other:08x}"
            )))
        }
    }

    let width = reader.read_u32().await.map_err(short)?;
    let height = reader.read_u32().await.map_err(short)?;
    let encoded = (width > 0 && height > 0).then(|| Resolution::new(width, height));

    Ok(Preamble {
        device_name,
        encoded,
    })
}

/// Production launcher driving scrcpy-server over adb
#[derive(Debug)]
pub struct AdbLauncher {
    config: CaptureConfig,
    adb: Adb,
    ports: PortPool,
    next_scid: AtomicU32,
}

impl AdbLauncher {
    pub fn new(config: CaptureConfig) -> Self {
        let adb = Adb::new(config.adb_path.clone(), config.command_timeout);
        let ports = PortPool::new(config.port_range.clone());
        let seed = std::collections::hash_map::RandomState::new()
            .build_hasher()
            .finish() as u32;

        Self {
            config,
            adb,
            ports,
            next_scid: AtomicU32::new(seed),
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Session id, 31 bits as the helper expects
    fn next_scid(&self) -> u32 {
        self.next_scid.fetch_add(1, Ordering::Relaxed) & 0x7FFF_FFFF
    }

    /// Helper command line after `adb shell`
    pub fn server_args(&self, scid: u32) -> Vec<String> {
        let config = &self.config;
        let mut args = vec![
            format!("CLASSPATH={}", config.remote_path),
            "app_process".to_string(),
            "/".to_string(),
            HELPER_MAIN_CLASS.to_string(),
            config.server_version.clone(),
            format!("scid={scid:08x}"),
            "log_level=info".to_string(),
            format!("max_size={}", config.max_size),
            format!("video_bit_rate={}", config.bit_rate),
            "video_codec=h264".to_string(),
            format!("video_codec_options=i-frame-interval={}", config.i_frame_interval),
            "tunnel_forward=true".to_string(),
            "audio=false".to_string(),
            "control=false".to_string(),
            "cleanup=false".to_string(),
        ];
        if config.tunnel_mode == TunnelMode::Raw {
            args.extend(
                ["send_device_meta=false", "send_frame_meta=false", "send_codec_meta=false"]
                    .map(String::from),
            );
        }
        args
    }

    async fn launch_once(
        &self,
        device: &DeviceId,
        physical: Option<Resolution>,
    ) -> Result<CaptureHandle, LaunchError> {
        let lease = self.ports.lease()?;
        let port = lease.port();
        let scid = self.next_scid();
        let socket_name = format!("scrcpy_{scid:08x}");

        self.adb.forward(device, port, &socket_name).await?;

        let child = match self.adb.spawn_shell(device, self.server_args(scid)) {
            Ok(child) => child,
            Err(e) => {
                self.adb.remove_forward(device, port).await;
                return Err(e);
            }
        };

        let mut process = HelperProcess {
            adb: self.adb.clone(),
            device: device.clone(),
            scid,
            child,
            lease,
            kill_grace: self.config.kill_grace,
        };

        let handshake = tokio::time::timeout(
            self.config.handshake_timeout,
            self.handshake(&mut process, port),
        )
        .await
        .unwrap_or_else(|_| {
            Err(LaunchError::HelperStartFailed(format!(
                "handshake did not complete within {:?}",
                self.config.handshake_timeout
            )))
        });

        let (stream, preamble) = match handshake {
            Ok(result) => result,
            Err(e) => {
                process.shutdown().await;
                return Err(e);
            }
        };

        tracing::info!(
            device = %device,
            port = port,
            scid = %format_args!("{scid:08x}"),
            encoded = ?preamble.encoded,
            "Capture helper started"
        );

        Ok(CaptureHandle {
            device: device.clone(),
            info: StreamInfo::new(physical, preamble.encoded),
            mode: self.config.tunnel_mode,
            device_name: (!preamble.device_name.is_empty()).then_some(preamble.device_name),
            stream: Some(Box::new(stream)),
            process: Some(process),
        })
    }

    async fn handshake(
        &self,
        process: &mut HelperProcess,
        port: u16,
    ) -> Result<(TcpStream, Preamble), LaunchError> {
        let mut stream = loop {
            if let Ok(Some(status)) = process.child.try_wait() {
                return Err(LaunchError::HelperStartFailed(process.exit_message(status).await));
            }

            if let Ok(mut stream) = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await {
                let mut dummy = [0u8; 1];
                if let Ok(1) = stream.read(&mut dummy).await {
                    break stream;
                }
            }

            tokio::time::sleep(self.config.connect_retry_interval).await;
        };

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY on tunnel");
        }

        let preamble = match self.config.tunnel_mode {
            TunnelMode::Framed => read_preamble(&mut stream).await?,
            TunnelMode::Raw => Preamble::default(),
        };

        Ok((stream, preamble))
    }
}

impl CaptureLauncher for AdbLauncher {
    async fn start(&self, device: &DeviceId) -> Result<CaptureHandle, LaunchError> {
        let jar = self.config.locate_server().ok_or_else(|| {
            LaunchError::HelperStartFailed("scrcpy-server not found; set SCRCPY_SERVER_PATH".into())
        })?;

        self.adb.kill_matching(device, "-9", STALE_HELPER_PATTERN).await;
        self.adb.push(device, &jar, &self.config.remote_path).await?;
        let physical = self.adb.screen_size(device).await?;

        let mut attempt = 1;
        loop {
            match self.launch_once(device, physical).await {
                Err(LaunchError::HelperStartFailed(msg))
                    if msg.contains("Address already in use") && attempt < HELPER_START_ATTEMPTS =>
                {
                    tracing::warn!(device = %device, attempt = attempt, "Helper socket in use, retrying");
                    self.adb.kill_matching(device, "-9", STALE_HELPER_PATTERN).await;
                    tokio::time::sleep(self.config.kill_grace).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn stop(&self, handle: &mut CaptureHandle) {
        handle.stream = None;
        if let Some(process) = handle.process.take() {
            process.shutdown().await;
        }
    }
}
