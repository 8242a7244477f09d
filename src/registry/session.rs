//! Per-device streaming session
//!
//! ```text
//!          attach                 last detach            grace elapsed
//!   Idle ─────────► Starting ──► Running ──────────► Stopping ──────────► Idle
//!                      │            ▲                    │      (torn down)
//!                      │            └────── attach ──────┘
//!                      ▼
//!                   Failed  ◄── launch error / ingest error
//! ```
//!
//! One worker task per session does `read unit -> update cache -> fan out`
//! while holding the session core lock, so a consumer attaching concurrently
//! sees either the state before a unit or after it, never in between.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::broadcaster::{Broadcaster, ConsumerId, DetachReason, Detached, Subscription};
use super::config::RelayConfig;
use super::error::SessionError;
use crate::capture::{CaptureHandle, CaptureLauncher};
use crate::device::{DeviceId, StreamInfo};
use crate::error::{IngestError, LaunchError};
use crate::ingest::StreamIngester;
use crate::media::cache::ParameterCache;
use crate::media::h264::{NalUnit, UnitKind};
use crate::media::sps::Sps;
use crate::stats::SessionStats;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No capture running
    Idle,
    /// Capture helper being launched
    Starting,
    /// Capture running with at least one consumer
    Running,
    /// Capture running without consumers, within the grace period
    Stopping,
    /// Launch or ingestion failed
    Failed,
}

/// State shared between the worker task and attach/detach
#[derive(Debug)]
pub(crate) struct SessionCore {
    cache: ParameterCache,
    broadcaster: Broadcaster,
    info: StreamInfo,
    stats: SessionStats,
    ended: Option<IngestError>,
}

impl SessionCore {
    fn new(info: StreamInfo, queue_depth: usize) -> Self {
        let mut stats = SessionStats::new();
        stats.resolution = info.encoded;

        Self {
            cache: ParameterCache::new(),
            broadcaster: Broadcaster::new(queue_depth),
            info,
            stats,
            ended: None,
        }
    }

    /// One serialized ingestion step
    pub(crate) fn ingest(&mut self, device: &DeviceId, unit: NalUnit) {
        self.stats.record_unit(&unit);

        if unit.kind() == UnitKind::ParameterSetA {
            self.check_resolution(device, &unit);
        }

        let committed = self.cache.on_unit(&unit);
        let detached = self.broadcaster.broadcast(&unit, committed);
        self.stats.bundles_committed = self.cache.commits();
        self.stats.parameter_epoch = self.cache.epoch();
        self.record_detached(device, detached);
    }

    fn check_resolution(&mut self, device: &DeviceId, sps: &NalUnit) {
        let resolution = match Sps::parse(sps.payload()) {
            Ok(parsed) => parsed.resolution(),
            Err(e) => {
                tracing::debug!(device = %device, error = %e, "Unparseable SPS");
                return;
            }
        };
        if self.info.encoded == Some(resolution) {
            return;
        }

        tracing::info!(
            device = %device,
            previous = ?self.info.encoded,
            resolution = %resolution,
            "Encoded resolution changed"
        );
        self.info.encoded = Some(resolution);
        self.stats.resolution = Some(resolution);
        let detached = self.broadcaster.announce(self.info);
        self.record_detached(device, detached);
    }

    fn record_detached(&mut self, device: &DeviceId, detached: Vec<Detached>) {
        if detached.is_empty() {
            return;
        }
        for d in &detached {
            if d.reason == DetachReason::SlowConsumer {
                self.stats.slow_consumer_drops += 1;
                tracing::warn!(
                    device = %device,
                    consumer = d.id,
                    delivered = d.delivered,
                    "Consumer queue full, detaching"
                );
            } else {
                tracing::debug!(device = %device, consumer = d.id, reason = %d.reason, "Consumer gone");
            }
        }
        self.stats.set_consumers(self.broadcaster.len());
    }

    fn end(&mut self, device: &DeviceId, err: IngestError) {
        let closed = self.broadcaster.close_all(&err.to_string());
        tracing::warn!(
            device = %device,
            error = %err,
            consumers = closed,
            reason = %DetachReason::SessionEnded,
            "Ingestion stopped"
        );
        self.stats.set_consumers(0);
        self.ended = Some(err);
    }
}

/// Coordinator for one device's capture and consumers
#[derive(Debug)]
pub struct StreamingSession {
    device: DeviceId,
    state: SessionState,
    core: Arc<Mutex<SessionCore>>,
    capture: Option<CaptureHandle>,
    worker: Option<JoinHandle<()>>,
    /// When the last consumer left
    idle_since: Option<Instant>,
    /// Error of the last failed launch
    launch_error: Option<LaunchError>,
    /// Set once the reaper removed this session from the registry
    retired: bool,
}

impl StreamingSession {
    pub fn new(device: DeviceId, queue_depth: usize) -> Self {
        Self {
            device,
            state: SessionState::Idle,
            core: Arc::new(Mutex::new(SessionCore::new(StreamInfo::default(), queue_depth))),
            capture: None,
            worker: None,
            idle_since: None,
            launch_error: None,
            retired: false,
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Launch the capture and spawn the ingest worker
    ///
    /// On failure the session is `Failed` and holds no resources.
    pub async fn start<L: CaptureLauncher>(
        &mut self,
        launcher: &L,
        config: &RelayConfig,
        reaper: &Arc<Notify>,
    ) -> Result<(), SessionError> {
        self.state = SessionState::Starting;
        self.launch_error = None;
        tracing::info!(device = %self.device, "Starting capture");

        let mut capture = match launcher.start(&self.device).await {
            Ok(capture) => capture,
            Err(source) => return Err(self.fail_launch(source)),
        };
        let Some(stream) = capture.take_stream() else {
            launcher.stop(&mut capture).await;
            return Err(self.fail_launch(LaunchError::HelperStartFailed(
                "capture handle carries no tunnel stream".into(),
            )));
        };

        let core = Arc::new(Mutex::new(SessionCore::new(
            capture.info(),
            config.consumer_queue_depth,
        )));
        let mut ingester = StreamIngester::new(stream, capture.mode(), config.max_unit_size)
            .with_idle_flush(config.idle_flush);

        let worker = {
            let core = Arc::clone(&core);
            let device = self.device.clone();
            let reaper = Arc::clone(reaper);

            tokio::spawn(async move {
                let err = loop {
                    match ingester.next_unit().await {
                        Ok(unit) => core.lock().await.ingest(&device, unit),
                        Err(e) => break e,
                    }
                };
                core.lock().await.end(&device, err);
                reaper.notify_one();
            })
        };

        tracing::info!(
            device = %self.device,
            port = ?capture.port(),
            info = ?capture.info(),
            "Capture running"
        );

        self.core = core;
        self.capture = Some(capture);
        self.worker = Some(worker);
        self.state = SessionState::Running;
        self.idle_since = None;
        Ok(())
    }

    fn fail_launch(&mut self, source: LaunchError) -> SessionError {
        tracing::error!(device = %self.device, error = %source, "Capture failed to start");
        self.state = SessionState::Failed;
        self.launch_error = Some(source.clone());
        SessionError::Launch {
            device: self.device.clone(),
            source,
        }
    }

    /// Enroll a consumer, primed with the cached bundle when there is one
    pub async fn attach(&mut self) -> Subscription {
        let mut core = self.core.lock().await;
        let core = &mut *core;
        let subscription = core.broadcaster.attach(core.info, core.cache.current_bundle());
        core.stats.set_consumers(core.broadcaster.len());

        if self.state == SessionState::Stopping {
            tracing::info!(device = %self.device, "Consumer returned within grace period");
            self.state = SessionState::Running;
            self.idle_since = None;
        }

        tracing::info!(
            device = %self.device,
            consumer = subscription.id(),
            consumers = core.broadcaster.len(),
            primed = core.cache.is_ready(),
            "Consumer attached"
        );
        subscription
    }

    /// Remove a consumer; the last one out starts the grace period
    pub async fn detach(&mut self, id: ConsumerId, now: Instant) {
        let mut core = self.core.lock().await;
        if core.broadcaster.detach(id) {
            let remaining = core.broadcaster.len();
            core.stats.set_consumers(remaining);
            tracing::info!(
                device = %self.device,
                consumer = id,
                consumers = remaining,
                reason = %DetachReason::Requested,
                "Consumer detached"
            );
        }
        let empty = core.broadcaster.is_empty();
        drop(core);

        if empty && self.state == SessionState::Running {
            self.enter_grace(now);
        }
    }

    fn enter_grace(&mut self, now: Instant) {
        tracing::info!(device = %self.device, "No consumers left, entering grace period");
        self.state = SessionState::Stopping;
        self.idle_since = Some(now);
    }

    /// Advance the lifecycle; returns true when the session should be torn down
    pub async fn poll(&mut self, now: Instant, grace: Duration) -> bool {
        let mut core = self.core.lock().await;
        let empty = core.broadcaster.is_empty();
        if core.ended.is_none() && self.capture.as_mut().is_some_and(|c| !c.is_alive()) {
            core.end(
                &self.device,
                IngestError::StreamEnded("capture helper exited".into()),
            );
        }
        let ended = core.ended.is_some();
        drop(core);

        match self.state {
            SessionState::Running | SessionState::Stopping if ended => {
                self.state = SessionState::Failed;
                true
            }
            SessionState::Running if empty => {
                // Consumers removed by the broadcaster itself
                self.enter_grace(now);
                false
            }
            SessionState::Stopping => self
                .idle_since
                .is_some_and(|since| now.saturating_duration_since(since) >= grace),
            SessionState::Failed => true,
            SessionState::Idle | SessionState::Starting | SessionState::Running => false,
        }
    }

    /// Whether the worker reported a terminal ingest error
    pub async fn has_ended(&self) -> bool {
        self.core.lock().await.ended.is_some()
    }

    /// Stop the worker and the capture; consumers see their queue close
    pub async fn teardown<L: CaptureLauncher>(&mut self, launcher: &L) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
            let _ = worker.await;
        }

        let closed = self.core.lock().await.broadcaster.close_all("session stopped");

        if let Some(mut capture) = self.capture.take() {
            launcher.stop(&mut capture).await;
        }

        tracing::info!(
            device = %self.device,
            state = ?self.state,
            consumers = closed,
            "Session torn down"
        );

        if self.state != SessionState::Failed {
            self.state = SessionState::Idle;
        }
        self.idle_since = None;
    }

    pub(crate) fn retire(&mut self) {
        self.retired = true;
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired
    }

    pub async fn consumer_count(&self) -> usize {
        self.core.lock().await.broadcaster.len()
    }

    pub async fn stats(&self) -> SessionStats {
        self.core.lock().await.stats.clone()
    }

    pub async fn info(&self) -> StreamInfo {
        self.core.lock().await.info
    }

    /// Why the session is unhealthy: the last launch failure, else the
    /// terminal ingest error
    pub async fn failure(&self) -> Option<SessionError> {
        if let Some(source) = &self.launch_error {
            return Some(SessionError::Launch {
                device: self.device.clone(),
                source: source.clone(),
            });
        }
        let ended = self.core.lock().await.ended.clone()?;
        Some(SessionError::Ended {
            device: self.device.clone(),
            source: ended,
        })
    }
}
