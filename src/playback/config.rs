//! Playback configuration

use std::time::Duration;

/// Consumer-side timing policy
///
/// The resync thresholds are empirical; only their ordering matters
/// (`fast_resync_window` short, `quiet_window` long enough to ride out a
/// burst of recoverable errors).
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Fallback if no unit arrives this long after the handshake
    pub data_timeout: Duration,

    /// Give up on a connect attempt after this long
    pub connect_timeout: Duration,

    /// Decode errors this soon after (re)connecting resync immediately
    pub fast_resync_window: Duration,

    /// Later decode errors resync after this long without another error
    pub quiet_window: Duration,

    /// Longest a burst of decode errors can postpone the resync
    pub max_degraded: Duration,

    /// Decode errors this soon after a resync are ignored
    pub resync_cooldown: Duration,

    /// Fixed delay before reconnecting
    pub reconnect_backoff: Duration,

    /// Consecutive attempts that never stream before falling back
    pub max_reconnect_attempts: u32,

    /// Buffered-but-undisplayed duration considered high latency
    pub latency_threshold: Duration,

    /// How often the decoder buffer level is sampled
    pub latency_poll: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            data_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            fast_resync_window: Duration::from_secs(2),
            quiet_window: Duration::from_millis(1500),
            max_degraded: Duration::from_secs(5),
            resync_cooldown: Duration::from_secs(1),
            reconnect_backoff: Duration::from_secs(1),
            max_reconnect_attempts: 5,
            latency_threshold: Duration::from_millis(250),
            latency_poll: Duration::from_millis(500),
        }
    }
}

impl PlaybackConfig {
    /// Set the data timeout
    pub fn data_timeout(mut self, timeout: Duration) -> Self {
        self.data_timeout = timeout;
        self
    }

    /// Set the connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the fast resync window
    pub fn fast_resync_window(mut self, window: Duration) -> Self {
        self.fast_resync_window = window;
        self
    }

    /// Set the quiet window
    pub fn quiet_window(mut self, window: Duration) -> Self {
        self.quiet_window = window;
        self
    }

    /// Set the upper bound on the debounce of a degraded stream
    pub fn max_degraded(mut self, bound: Duration) -> Self {
        self.max_degraded = bound;
        self
    }

    /// Set the resync cooldown
    pub fn resync_cooldown(mut self, cooldown: Duration) -> Self {
        self.resync_cooldown = cooldown;
        self
    }

    /// Set the reconnect backoff
    pub fn reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    /// Set the attempt limit before sustained-failure fallback
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts.max(1);
        self
    }

    /// Set the latency threshold
    pub fn latency_threshold(mut self, threshold: Duration) -> Self {
        self.latency_threshold = threshold;
        self
    }

    /// Set the buffer sampling interval
    pub fn latency_poll(mut self, interval: Duration) -> Self {
        self.latency_poll = interval;
        self
    }
}
