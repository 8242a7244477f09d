//! adb control channel

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};

use crate::device::{DeviceId, Resolution};
use crate::error::LaunchError;

/// Thin async wrapper over the adb executable
#[derive(Debug, Clone)]
pub struct Adb {
    path: PathBuf,
    timeout: Duration,
}

impl Adb {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    fn command<I, S>(&self, device: &DeviceId, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.path);
        cmd.arg("-s")
            .arg(device.as_str())
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    /// Run an adb command to completion and return its stdout
    pub async fn run<I, S>(&self, device: &DeviceId, args: I) -> Result<String, LaunchError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = self.command(device, args);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                LaunchError::DeviceUnreachable(format!(
                    "adb did not answer within {:?}",
                    self.timeout
                ))
            })?
            .map_err(|e| {
                LaunchError::DeviceUnreachable(format!("failed to run {}: {e}", self.path.display()))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LaunchError::DeviceUnreachable(format!(
                "adb exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Copy a local file to the device
    pub async fn push(&self, device: &DeviceId, local: &Path, remote: &str) -> Result<(), LaunchError> {
        self.run(device, [OsStr::new("push"), local.as_os_str(), OsStr::new(remote)])
            .await
            .map(drop)
    }

    /// Forward a local TCP port to an abstract socket on the device
    pub async fn forward(&self, device: &DeviceId, port: u16, socket_name: &str) -> Result<(), LaunchError> {
        let local = format!("tcp:{port}");
        let remote = format!("localabstract:{socket_name}");
        self.run(device, ["forward", local.as_str(), remote.as_str()])
            .await
            .map(drop)
    }

    /// Remove a forward; failures are only logged
    pub async fn remove_forward(&self, device: &DeviceId, port: u16) {
        let local = format!("tcp:{port}");
        if let Err(e) = self.run(device, ["forward", "--remove", local.as_str()]).await {
            tracing::debug!(device = %device, port = port, error = %e, "Forward removal failed");
        }
    }

    /// Kill helper processes on the device whose command line matches `pattern`
    pub async fn kill_matching(&self, device: &DeviceId, signal: &str, pattern: &str) {
        // pkill exits non-zero when nothing matched
        let _ = self
            .run(device, ["shell", "pkill", signal, "-f", pattern])
            .await;
    }

    /// Display size, override size preferred over physical size
    pub async fn screen_size(&self, device: &DeviceId) -> Result<Option<Resolution>, LaunchError> {
        let output = self.run(device, ["shell", "wm", "size"]).await?;
        Ok(parse_wm_size(&output))
    }

    /// Spawn a long-running shell command
    pub fn spawn_shell<I, S>(&self, device: &DeviceId, args: I) -> Result<Child, LaunchError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = self.command(device, ["shell"]);
        cmd.args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        cmd.spawn().map_err(|e| {
            LaunchError::DeviceUnreachable(format!("failed to run {}: {e}", self.path.display()))
        })
    }
}

/// Parse `wm size` output
///
/// ```text
/// Physical size: 1080x2400
/// Override size: 720x1600
/// ```
pub fn parse_wm_size(output: &str) -> Option<Resolution> {
    let mut physical = None;
    let mut overridden = None;

    for line in output.lines() {
        let Some((label, value)) = line.split_once(':') else {
            continue;
        };
        let Some((w, h)) = value.trim().split_once('x') else {
            continue;
        };
        let (Ok(width), Ok(height)) = (w.trim().parse::<u32>(), h.trim().parse::<u32>()) else {
            continue;
        };

        let resolution = Resolution { width, height };
        match label.trim() {
            "Physical size" => physical = Some(resolution),
            "Override size" => overridden = Some(resolution),
            _ => {}
        }
    }

    overridden.or(physical)
}
