//! Device identity and resolution reporting

use serde::{Deserialize, Serialize};

/// Identifier of an Android device as adb knows it (serial or `host:port`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(serial: impl Into<String>) -> Self {
        Self(serial.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Width x height in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Resolutions a consumer needs to map pointer coordinates back to the device
///
/// The encoded size is usually smaller than the physical size (the helper
/// downscales to `max_size`) and flips when the device rotates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamInfo {
    /// Physical display size reported by the device
    pub device: Option<Resolution>,
    /// Size of the encoded video
    pub encoded: Option<Resolution>,
}

impl StreamInfo {
    pub fn new(device: Option<Resolution>, encoded: Option<Resolution>) -> Self {
        Self { device, encoded }
    }
}
