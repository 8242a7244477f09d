//! Relay configuration

use std::time::Duration;

use crate::ingest::{DEFAULT_IDLE_FLUSH, DEFAULT_MAX_UNIT_SIZE};

/// Session registry configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// How long a session without consumers keeps its capture running
    pub grace_period: Duration,

    /// Per-consumer queue depth in units; a full queue detaches the consumer
    pub consumer_queue_depth: usize,

    /// How often the reaper checks sessions
    pub cleanup_interval: Duration,

    /// Largest NAL unit accepted from the tunnel
    pub max_unit_size: usize,

    /// Raw tunnels: emit the buffered unit after this long without bytes
    pub idle_flush: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
            consumer_queue_depth: 256,
            cleanup_interval: Duration::from_secs(1),
            max_unit_size: DEFAULT_MAX_UNIT_SIZE,
            idle_flush: DEFAULT_IDLE_FLUSH,
        }
    }
}

impl RelayConfig {
    /// Set the grace period
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Set the per-consumer queue depth
    pub fn consumer_queue_depth(mut self, depth: usize) -> Self {
        self.consumer_queue_depth = depth;
        self
    }

    /// Set the reaper interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Set the raw-mode idle flush delay
    pub fn idle_flush(mut self, after: Duration) -> Self {
        self.idle_flush = after;
        self
    }

    /// Set the largest accepted unit
    pub fn max_unit_size(mut self, size: usize) -> Self {
        self.max_unit_size = size;
        self
    }
}
