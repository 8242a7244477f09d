//! Fake capture launcher serving scrcpy-framed tunnels from memory

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::Mutex;

use screen_relay::error::LaunchError;
use screen_relay::ingest::framer::PacketHeader;
use screen_relay::registry::{StreamEvent, Subscription};
use screen_relay::{CaptureHandle, CaptureLauncher, DeviceId, Resolution, StreamInfo, TunnelMode};

pub const SPS: &[u8] = &[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x0A, 0xFB, 0x90];
pub const PPS: &[u8] = &[0, 0, 0, 1, 0x68, 0xCE, 0x38, 0x80];
pub const IDR: &[u8] = &[0, 0, 0, 1, 0x65, 0x88, 0x84, 0x21];
pub const P0: &[u8] = &[0, 0, 0, 1, 0x41, 0x9A, 0x00];
pub const P1: &[u8] = &[0, 0, 0, 1, 0x41, 0x9A, 0x01];
pub const P2: &[u8] = &[0, 0, 0, 1, 0x41, 0x9A, 0x02];

/// Devices whose serial starts with this are unreachable
pub const OFFLINE_PREFIX: &str = "offline";

#[derive(Default)]
pub struct FakeLauncher {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    /// Fail this many start attempts before succeeding
    pub failures_left: AtomicUsize,
    pub start_delay: Option<Duration>,
    tunnels: Mutex<HashMap<DeviceId, DuplexStream>>,
}

impl FakeLauncher {
    pub fn with_start_delay(delay: Duration) -> Self {
        Self {
            start_delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub async fn has_tunnel(&self, device: &DeviceId) -> bool {
        self.tunnels.lock().await.contains_key(device)
    }

    /// Write one scrcpy packet (12-byte header + Annex-B payload)
    pub async fn send_packet(&self, device: &DeviceId, pts: Option<u64>, units: &[&[u8]]) {
        let payload: Vec<u8> = units.concat();
        let key = units.iter().any(|u| u.get(4).is_some_and(|h| h & 0x1F == 5));
        let header = PacketHeader::encode(pts, key, payload.len() as u32);

        let mut tunnels = self.tunnels.lock().await;
        let tunnel = tunnels.get_mut(device).expect("no tunnel for device");
        tunnel.write_all(&header).await.unwrap();
        tunnel.write_all(&payload).await.unwrap();
    }

    /// Write a packet header announcing zero bytes, which no framer accepts
    pub async fn send_garbage(&self, device: &DeviceId) {
        let mut tunnels = self.tunnels.lock().await;
        let tunnel = tunnels.get_mut(device).expect("no tunnel for device");
        tunnel.write_all(&PacketHeader::encode(Some(0), false, 0)).await.unwrap();
    }
}

impl CaptureLauncher for FakeLauncher {
    async fn start(&self, device: &DeviceId) -> Result<CaptureHandle, LaunchError> {
        if let Some(delay) = self.start_delay {
            tokio::time::sleep(delay).await;
        }
        if device.as_str().starts_with(OFFLINE_PREFIX) {
            return Err(LaunchError::DeviceUnreachable(format!(
                "device '{}' not found",
                device
            )));
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(LaunchError::HelperStartFailed("helper exited with status 1".into()));
        }

        self.starts.fetch_add(1, Ordering::SeqCst);
        let (writer, reader) = tokio::io::duplex(64 * 1024);
        self.tunnels.lock().await.insert(device.clone(), writer);

        Ok(CaptureHandle::new(
            device.clone(),
            Box::new(reader),
            TunnelMode::Framed,
            StreamInfo::new(
                Some(Resolution::new(1080, 2400)),
                Some(Resolution::new(16, 16)),
            ),
        ))
    }

    async fn stop(&self, handle: &mut CaptureHandle) {
        handle.take_stream();
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Next unit on a subscription, skipping info events; `None` once it ends
pub async fn next_unit(sub: &mut Subscription) -> Option<Bytes> {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("timed out waiting for a unit");
        match event {
            Some(StreamEvent::Unit(unit)) => return Some(unit.data().clone()),
            Some(StreamEvent::Info(_)) => continue,
            Some(StreamEvent::Ended(_)) | None => return None,
        }
    }
}

pub async fn next_units(sub: &mut Subscription, n: usize) -> Vec<Bytes> {
    let mut units = Vec::with_capacity(n);
    for _ in 0..n {
        units.push(next_unit(sub).await.expect("stream ended early"));
    }
    units
}

pub fn expected(units: &[&[u8]]) -> Vec<Bytes> {
    units.iter().map(|u| Bytes::copy_from_slice(u)).collect()
}
