//! Session registry implementation
//!
//! Owns the per-device session table. The map lock is only held to look up
//! or insert an entry; launching, ingesting and tearing down happen under
//! the per-device session lock, so a slow device never blocks another.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;

use super::broadcaster::{ConsumerId, Subscription};
use super::config::RelayConfig;
use super::error::SessionError;
use super::session::{SessionState, StreamingSession};
use crate::capture::CaptureLauncher;
use crate::device::{DeviceId, StreamInfo};
use crate::stats::SessionStats;

type SessionEntry = Arc<Mutex<StreamingSession>>;

/// Registry of streaming sessions, at most one per device
pub struct SessionRegistry<L> {
    /// Map of device to session
    sessions: RwLock<HashMap<DeviceId, SessionEntry>>,

    /// Starts and stops capture helpers
    launcher: Arc<L>,

    /// Configuration
    config: RelayConfig,

    /// Woken by session workers when ingestion stops
    reaper: Arc<Notify>,
}

impl<L: CaptureLauncher> SessionRegistry<L> {
    /// Create a registry with default configuration
    pub fn new(launcher: L) -> Self {
        Self::with_config(launcher, RelayConfig::default())
    }

    /// Create a registry with custom configuration
    pub fn with_config(launcher: L, config: RelayConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            launcher: Arc::new(launcher),
            config,
            reaper: Arc::new(Notify::new()),
        }
    }

    /// Get the registry configuration
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn launcher(&self) -> &Arc<L> {
        &self.launcher
    }

    async fn get_or_insert(&self, device: &DeviceId) -> SessionEntry {
        if let Some(entry) = self.sessions.read().await.get(device) {
            return Arc::clone(entry);
        }

        let mut sessions = self.sessions.write().await;
        Arc::clone(sessions.entry(device.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(StreamingSession::new(
                device.clone(),
                self.config.consumer_queue_depth,
            )))
        }))
    }

    async fn get(&self, device: &DeviceId) -> Option<SessionEntry> {
        self.sessions.read().await.get(device).cloned()
    }

    /// Attach a consumer to a device's stream
    ///
    /// The first attach starts the capture. Concurrent attaches for the same
    /// device wait for that start instead of launching a second helper. A
    /// session whose ingestion ended is torn down and started fresh.
    pub async fn attach(&self, device: &DeviceId) -> Result<Subscription, SessionError> {
        loop {
            let entry = self.get_or_insert(device).await;
            let mut session = entry.lock().await;

            if session.is_retired() {
                // Removed by the reaper while we waited for the lock
                drop(session);
                tokio::task::yield_now().await;
                continue;
            }

            if session.has_ended().await {
                session.teardown(&*self.launcher).await;
            }

            match session.state() {
                SessionState::Idle | SessionState::Failed => {
                    session
                        .start(&*self.launcher, &self.config, &self.reaper)
                        .await?;
                }
                SessionState::Starting | SessionState::Running | SessionState::Stopping => {}
            }

            return Ok(session.attach().await);
        }
    }

    /// Detach a consumer; unknown devices and consumers are ignored
    pub async fn detach(&self, device: &DeviceId, consumer: ConsumerId) {
        if let Some(entry) = self.get(device).await {
            entry.lock().await.detach(consumer, Instant::now()).await;
        }
    }

    /// Lifecycle state of a device's session
    pub async fn session_state(&self, device: &DeviceId) -> Option<SessionState> {
        let entry = self.get(device).await?;
        let state = entry.lock().await.state();
        Some(state)
    }

    /// Lifecycle state, or why the device has no healthy session
    pub async fn health(&self, device: &DeviceId) -> Result<SessionState, SessionError> {
        let entry = self
            .get(device)
            .await
            .ok_or_else(|| SessionError::NotFound(device.clone()))?;
        let session = entry.lock().await;
        match session.failure().await {
            Some(err) => Err(err),
            None => Ok(session.state()),
        }
    }

    /// Statistics of a device's session
    pub async fn session_stats(&self, device: &DeviceId) -> Option<SessionStats> {
        let entry = self.get(device).await?;
        let session = entry.lock().await;
        Some(session.stats().await)
    }

    /// Current resolutions of a device's stream
    pub async fn stream_info(&self, device: &DeviceId) -> Option<StreamInfo> {
        let entry = self.get(device).await?;
        let session = entry.lock().await;
        Some(session.info().await)
    }

    /// Number of consumers attached to a device
    pub async fn consumer_count(&self, device: &DeviceId) -> usize {
        match self.get(device).await {
            Some(entry) => entry.lock().await.consumer_count().await,
            None => 0,
        }
    }

    /// Get total number of sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Run cleanup once
    ///
    /// Tears down and removes sessions that:
    /// - Have had no consumers for longer than `grace_period`
    /// - Stopped ingesting (stream ended or framing error)
    /// - Failed to launch
    ///
    /// Sessions busy starting or attaching are skipped until the next pass.
    pub async fn cleanup(&self) {
        let now = Instant::now();
        let entries: Vec<(DeviceId, SessionEntry)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(device, entry)| (device.clone(), Arc::clone(entry)))
            .collect();

        for (device, entry) in entries {
            let Ok(mut session) = entry.try_lock() else {
                continue;
            };
            if !session.poll(now, self.config.grace_period).await {
                continue;
            }

            session.teardown(&*self.launcher).await;
            session.retire();
            drop(session);

            let mut sessions = self.sessions.write().await;
            if sessions.get(&device).is_some_and(|e| Arc::ptr_eq(e, &entry)) {
                sessions.remove(&device);
                tracing::info!(device = %device, "Session removed by cleanup");
            }
        }
    }

    /// Tear down every session
    pub async fn shutdown(&self) {
        let entries: Vec<(DeviceId, SessionEntry)> =
            self.sessions.write().await.drain().collect();

        for (device, entry) in entries {
            let mut session = entry.lock().await;
            session.teardown(&*self.launcher).await;
            session.retire();
            tracing::debug!(device = %device, "Session shut down");
        }
    }

    /// Spawn background cleanup task
    ///
    /// Runs every `cleanup_interval` and whenever a session's ingestion
    /// stops. Returns a handle that can be used to abort the task.
    pub fn spawn_cleanup_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = registry.config.cleanup_interval;
        let reaper = Arc::clone(&registry.reaper);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = reaper.notified() => {}
                }
                registry.cleanup().await;
            }
        })
    }
}
