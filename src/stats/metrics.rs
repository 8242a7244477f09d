//! Statistics for streaming sessions and the relay server

use std::time::{Duration, Instant};

use crate::device::Resolution;
use crate::media::h264::{NalUnit, UnitKind};

/// Per-device session statistics
#[derive(Debug, Clone)]
pub struct SessionStats {
    /// When ingestion started
    pub started_at: Instant,
    /// Total bytes of NAL units ingested
    pub bytes_received: u64,
    /// NAL units ingested
    pub units: u64,
    /// IDR units ingested
    pub intra_frames: u64,
    /// SPS and PPS units ingested
    pub parameter_sets: u64,
    /// Parameter bundles committed to the cache
    pub bundles_committed: u64,
    /// Configuration epoch of the cache; bumps on every new SPS
    pub parameter_epoch: u64,
    /// Consumers detached because their queue was full
    pub slow_consumer_drops: u64,
    /// Currently attached consumers
    pub consumers: usize,
    /// Highest number of consumers attached at once
    pub peak_consumers: usize,
    /// Encoded resolution from the latest SPS
    pub resolution: Option<Resolution>,
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            bytes_received: 0,
            units: 0,
            intra_frames: 0,
            parameter_sets: 0,
            bundles_committed: 0,
            parameter_epoch: 0,
            slow_consumer_drops: 0,
            consumers: 0,
            peak_consumers: 0,
            resolution: None,
        }
    }

    /// Count one ingested unit
    pub fn record_unit(&mut self, unit: &NalUnit) {
        self.units += 1;
        self.bytes_received += unit.len() as u64;
        match unit.kind() {
            UnitKind::Intra => self.intra_frames += 1,
            UnitKind::ParameterSetA | UnitKind::ParameterSetB => self.parameter_sets += 1,
            UnitKind::Inter | UnitKind::Other => {}
        }
    }

    /// Track the attached consumer count
    pub fn set_consumers(&mut self, consumers: usize) {
        self.consumers = consumers;
        self.peak_consumers = self.peak_consumers.max(consumers);
    }

    /// Get duration since ingestion started
    pub fn duration(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Calculate bitrate in bits per second
    pub fn bitrate(&self) -> u64 {
        let secs = self.duration().as_secs();
        if secs > 0 {
            (self.bytes_received * 8) / secs
        } else {
            0
        }
    }

    /// Average keyframe interval in units, if any keyframe was seen
    pub fn units_per_intra(&self) -> Option<f64> {
        (self.intra_frames > 0).then(|| self.units as f64 / self.intra_frames as f64)
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Relay server statistics
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    /// Total connections ever accepted
    pub total_connections: u64,
    /// Current active connections
    pub active_connections: u64,
    /// Connections rejected by the connection limit
    pub rejected_connections: u64,
    /// Binary messages sent to consumers
    pub units_sent: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn unit(header: u8, len: usize) -> NalUnit {
        let mut data = vec![0, 0, 0, 1, header];
        data.resize(len, 0xAB);
        NalUnit::new(Bytes::from(data), None).unwrap()
    }

    #[test]
    fn test_session_stats_new() {
        let stats = SessionStats::new();
        assert_eq!(stats.bytes_received, 0);
        assert_eq!(stats.units, 0);
        assert_eq!(stats.intra_frames, 0);
        assert_eq!(stats.consumers, 0);
        assert!(stats.resolution.is_none());
        assert!(stats.units_per_intra().is_none());
    }

    #[test]
    fn test_record_unit() {
        let mut stats = SessionStats::new();
        stats.record_unit(&unit(0x67, 10));
        stats.record_unit(&unit(0x68, 8));
        stats.record_unit(&unit(0x65, 100));
        stats.record_unit(&unit(0x41, 20));

        assert_eq!(stats.units, 4);
        assert_eq!(stats.bytes_received, 138);
        assert_eq!(stats.parameter_sets, 2);
        assert_eq!(stats.intra_frames, 1);
        assert_eq!(stats.units_per_intra(), Some(4.0));
    }

    #[test]
    fn test_peak_consumers() {
        let mut stats = SessionStats::new();
        stats.set_consumers(3);
        stats.set_consumers(1);

        assert_eq!(stats.consumers, 1);
        assert_eq!(stats.peak_consumers, 3);
    }

    #[test]
    fn test_bitrate_zero_duration() {
        let mut stats = SessionStats::new();
        stats.bytes_received = 1_000_000;

        // Less than a second has passed
        assert_eq!(stats.bitrate(), 0);
    }

    #[test]
    fn test_bitrate() {
        let mut stats = SessionStats::new();
        stats.bytes_received = 1_000_000;
        stats.started_at = Instant::now() - Duration::from_secs(10);

        assert_eq!(stats.bitrate(), 800_000);
    }

    #[test]
    fn test_server_stats_new() {
        let stats = ServerStats::new();
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.rejected_connections, 0);
    }
}
