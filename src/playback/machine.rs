//! Playback state machine
//!
//! All transport events, decoder reports and timer expiries go through
//! [`PlaybackMachine::handle`], which returns the effects the driver must
//! perform. The machine does no I/O and reads no clock.
//!
//! ```text
//!  Connecting ──► AwaitingData ──► Streaming ◄──► Degraded
//!      ▲               │               │              │
//!      │               │ (no data)     └──────┬───────┘
//!      │               ▼                      ▼ (closed)
//!      │           Fallback            Disconnected
//!      └──────────── (backoff) ──────────────┘
//!
//!  Degraded ──(resync)──► Connecting
//! ```

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use super::config::PlaybackConfig;

/// Consumer-side connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// Opening a transport
    Connecting,
    /// Handshake done, no unit received yet
    AwaitingData,
    /// Units are flowing and decoding
    Streaming,
    /// Decoder reported an error; a resync may follow
    Degraded,
    /// Transport gone, waiting out the backoff
    Disconnected,
    /// Terminal: the caller should switch to the fallback display
    Fallback,
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlaybackState::Connecting => "connecting",
            PlaybackState::AwaitingData => "awaiting-data",
            PlaybackState::Streaming => "streaming",
            PlaybackState::Degraded => "degraded",
            PlaybackState::Disconnected => "disconnected",
            PlaybackState::Fallback => "fallback",
        };
        f.write_str(s)
    }
}

/// Why playback gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// Connected but no data arrived within the data timeout
    DataTimeout,
    /// Too many consecutive attempts never reached streaming
    SustainedFailure,
}

/// Timers owned by the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    DataTimeout,
    Resync,
    Reconnect,
}

impl TimerKind {
    pub const ALL: [TimerKind; 3] = [TimerKind::DataTimeout, TimerKind::Resync, TimerKind::Reconnect];

    pub(crate) fn index(self) -> usize {
        match self {
            TimerKind::DataTimeout => 0,
            TimerKind::Resync => 1,
            TimerKind::Reconnect => 2,
        }
    }
}

/// Input to the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// Transport handshake completed
    Connected,
    /// Transport could not be opened
    ConnectFailed(String),
    /// A unit arrived and was handed to the decoder
    UnitReceived,
    /// The relay reported an error instead of video
    ServerError(String),
    /// Transport closed or failed
    TransportClosed,
    /// Decoder reported a buffer or decode error
    DecodeError,
    /// Decoder decoded cleanly again after an error
    DecoderRecovered,
    /// Current buffered-but-undisplayed duration
    BufferLevel(Duration),
    /// A timer armed by [`Effect::ArmTimer`] expired
    TimerFired { timer: TimerKind, token: u64 },
}

/// Action requested by the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Create a fresh decoder and open a new transport
    OpenTransport,
    /// Drop the current transport and decoder
    CloseTransport,
    /// Fire [`PlaybackEvent::TimerFired`] with `token` after `after`
    ArmTimer {
        timer: TimerKind,
        after: Duration,
        token: u64,
    },
    /// Disarm a timer
    CancelTimer(TimerKind),
    /// Tell the embedding application to switch to the fallback display
    SignalFallback(FallbackReason),
    /// Latency crossed the threshold
    ReportLatency(Duration),
}

/// Pure playback decision logic
#[derive(Debug)]
pub struct PlaybackMachine {
    config: PlaybackConfig,
    state: PlaybackState,

    /// Token of the armed instance of each timer; stale expiries are ignored
    armed: [Option<u64>; 3],
    next_token: u64,

    /// Consecutive attempts that ended before streaming
    failed_attempts: u32,
    /// Whether the current attempt reached `Streaming`
    streamed: bool,

    connected_at: Option<Instant>,
    last_unit_at: Option<Instant>,
    last_resync: Option<Instant>,
    /// First decode error of the current degraded stretch
    degraded_since: Option<Instant>,

    latency_high: bool,
    resyncs: u64,
}

impl PlaybackMachine {
    pub fn new(config: PlaybackConfig) -> Self {
        Self {
            config,
            state: PlaybackState::Connecting,
            armed: [None; 3],
            next_token: 1,
            failed_attempts: 0,
            streamed: false,
            connected_at: None,
            last_unit_at: None,
            last_resync: None,
            degraded_since: None,
            latency_high: false,
            resyncs: 0,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    /// Number of resyncs performed
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    /// Consecutive attempts that failed before streaming
    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    pub fn is_terminal(&self) -> bool {
        self.state == PlaybackState::Fallback
    }

    /// Begin the first connection attempt
    pub fn start(&mut self, _now: Instant) -> Vec<Effect> {
        self.state = PlaybackState::Connecting;
        self.streamed = false;
        vec![Effect::OpenTransport]
    }

    /// Apply one event
    pub fn handle(&mut self, now: Instant, event: PlaybackEvent) -> Vec<Effect> {
        if self.is_terminal() {
            return Vec::new();
        }

        let mut effects = Vec::new();
        match event {
            PlaybackEvent::Connected => {
                if self.state == PlaybackState::Connecting {
                    self.state = PlaybackState::AwaitingData;
                    self.connected_at = Some(now);
                    self.last_unit_at = None;
                    let after = self.config.data_timeout;
                    effects.push(self.arm(TimerKind::DataTimeout, after));
                }
            }

            PlaybackEvent::ConnectFailed(_)
            | PlaybackEvent::ServerError(_)
            | PlaybackEvent::TransportClosed => {
                if self.is_attempt_live() {
                    self.disconnect(&mut effects);
                }
            }

            PlaybackEvent::UnitReceived => {
                self.last_unit_at = Some(now);
                if self.state == PlaybackState::AwaitingData {
                    self.state = PlaybackState::Streaming;
                    self.streamed = true;
                    self.failed_attempts = 0;
                    effects.push(self.cancel(TimerKind::DataTimeout));
                }
            }

            PlaybackEvent::DecodeError => self.on_decode_error(now, &mut effects),

            PlaybackEvent::DecoderRecovered => {
                if self.state == PlaybackState::Degraded {
                    self.state = PlaybackState::Streaming;
                    self.degraded_since = None;
                    effects.push(self.cancel(TimerKind::Resync));
                }
            }

            PlaybackEvent::BufferLevel(level) => self.on_buffer_level(now, level, &mut effects),

            PlaybackEvent::TimerFired { timer, token } => {
                if self.armed[timer.index()] != Some(token) {
                    return effects;
                }
                self.armed[timer.index()] = None;
                self.on_timer(now, timer, &mut effects);
            }
        }
        effects
    }

    fn is_attempt_live(&self) -> bool {
        matches!(
            self.state,
            PlaybackState::Connecting
                | PlaybackState::AwaitingData
                | PlaybackState::Streaming
                | PlaybackState::Degraded
        )
    }

    fn on_decode_error(&mut self, now: Instant, effects: &mut Vec<Effect>) {
        if !matches!(self.state, PlaybackState::Streaming | PlaybackState::Degraded) {
            return;
        }
        if self
            .last_resync
            .is_some_and(|at| now.saturating_duration_since(at) < self.config.resync_cooldown)
        {
            return;
        }

        self.state = PlaybackState::Degraded;
        let degraded_since = *self.degraded_since.get_or_insert(now);

        let since_connect = self
            .connected_at
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default();

        if since_connect < self.config.fast_resync_window {
            // Early failure: the connection itself is suspect
            self.resync(now, effects);
        } else {
            // Steady state: each error re-arms the quiet window, but never
            // past max_degraded from the first error
            let elapsed = now.saturating_duration_since(degraded_since);
            let remaining = self.config.max_degraded.saturating_sub(elapsed);
            if remaining.is_zero() {
                self.resync(now, effects);
            } else {
                let after = self.config.quiet_window.min(remaining);
                effects.push(self.arm(TimerKind::Resync, after));
            }
        }
    }

    fn on_buffer_level(&mut self, now: Instant, level: Duration, effects: &mut Vec<Effect>) {
        if level > self.config.latency_threshold {
            if !self.latency_high {
                self.latency_high = true;
                effects.push(Effect::ReportLatency(level));
            }
        } else {
            self.latency_high = false;
        }

        // Stalled transport: connected, was streaming, but units stopped
        if matches!(self.state, PlaybackState::Streaming | PlaybackState::Degraded)
            && self
                .last_unit_at
                .is_some_and(|at| now.saturating_duration_since(at) >= self.config.data_timeout)
        {
            self.disconnect(effects);
        }
    }

    fn on_timer(&mut self, now: Instant, timer: TimerKind, effects: &mut Vec<Effect>) {
        match (timer, self.state) {
            (TimerKind::DataTimeout, PlaybackState::AwaitingData) => {
                self.fallback(FallbackReason::DataTimeout, effects);
            }
            (TimerKind::Resync, PlaybackState::Degraded) => {
                self.resync(now, effects);
            }
            (TimerKind::Reconnect, PlaybackState::Disconnected) => {
                self.state = PlaybackState::Connecting;
                self.streamed = false;
                effects.push(Effect::OpenTransport);
            }
            _ => {}
        }
    }

    /// Replace transport and decoder with fresh ones
    fn resync(&mut self, now: Instant, effects: &mut Vec<Effect>) {
        self.resyncs += 1;
        self.last_resync = Some(now);
        self.degraded_since = None;
        self.cancel_all(effects);
        effects.push(Effect::CloseTransport);
        effects.push(Effect::OpenTransport);
        self.state = PlaybackState::Connecting;
        self.streamed = false;
    }

    fn disconnect(&mut self, effects: &mut Vec<Effect>) {
        self.degraded_since = None;
        self.cancel_all(effects);
        effects.push(Effect::CloseTransport);

        if !self.streamed {
            self.failed_attempts += 1;
            if self.failed_attempts >= self.config.max_reconnect_attempts {
                self.fallback(FallbackReason::SustainedFailure, effects);
                return;
            }
        }

        self.state = PlaybackState::Disconnected;
        let after = self.config.reconnect_backoff;
        effects.push(self.arm(TimerKind::Reconnect, after));
    }

    fn fallback(&mut self, reason: FallbackReason, effects: &mut Vec<Effect>) {
        if self.state == PlaybackState::Fallback {
            return;
        }
        self.cancel_all(effects);
        if !effects.contains(&Effect::CloseTransport) {
            effects.push(Effect::CloseTransport);
        }
        self.state = PlaybackState::Fallback;
        effects.push(Effect::SignalFallback(reason));
    }

    fn arm(&mut self, timer: TimerKind, after: Duration) -> Effect {
        let token = self.next_token;
        self.next_token += 1;
        self.armed[timer.index()] = Some(token);
        Effect::ArmTimer { timer, after, token }
    }

    fn cancel(&mut self, timer: TimerKind) -> Effect {
        self.armed[timer.index()] = None;
        Effect::CancelTimer(timer)
    }

    fn cancel_all(&mut self, effects: &mut Vec<Effect>) {
        for timer in TimerKind::ALL {
            if self.armed[timer.index()].is_some() {
                effects.push(self.cancel(timer));
            }
        }
    }
}
