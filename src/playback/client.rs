//! Playback client driver
//!
//! Runs a [`PlaybackMachine`] in a single task: transport messages, connect
//! results, timer expiries and buffer samples become events, and the
//! machine's effects are carried out in order before the next event.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::{pin, Pin};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Instant;

use super::config::PlaybackConfig;
use super::decoder::{Decoder, DecoderFactory};
use super::machine::{Effect, FallbackReason, PlaybackEvent, PlaybackMachine, PlaybackState, TimerKind};
use super::transport::{Connection, Connector, Incoming};
use crate::device::StreamInfo;
use crate::error::ConnectError;
use crate::media::{NalUnit, UnitKind};

type ConnectFuture<T> = Pin<Box<dyn Future<Output = Result<T, ConnectError>> + Send>>;

/// Snapshot published on every change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackStatus {
    pub state: PlaybackState,
    /// Latest resolutions announced by the relay
    pub info: Option<StreamInfo>,
    /// Units handed to decoders across all attempts
    pub units: u64,
    pub resyncs: u64,
    /// Times buffered latency crossed the threshold
    pub latency_reports: u64,
}

/// How [`PlaybackClient::run_until`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// The embedding application should switch to the fallback display
    Fallback(FallbackReason),
    /// The stop signal completed
    Stopped,
}

/// Armed timer deadlines
#[derive(Debug, Default)]
struct Timers {
    slots: [Option<(Instant, u64)>; 3],
}

impl Timers {
    fn arm(&mut self, timer: TimerKind, at: Instant, token: u64) {
        self.slots[timer.index()] = Some((at, token));
    }

    fn cancel(&mut self, timer: TimerKind) {
        self.slots[timer.index()] = None;
    }

    fn next(&self) -> Option<(TimerKind, Instant, u64)> {
        TimerKind::ALL
            .into_iter()
            .filter_map(|timer| self.slots[timer.index()].map(|(at, token)| (timer, at, token)))
            .min_by_key(|(_, at, _)| *at)
    }
}

enum Step<T> {
    Stop,
    Connect(Result<T, ConnectError>),
    Message(Option<Result<Incoming, ConnectError>>),
    Timer(TimerKind, u64),
    Sample,
}

/// Consumer of one device stream
pub struct PlaybackClient<C: Connector, F: DecoderFactory> {
    connector: Arc<C>,
    factory: F,
    machine: PlaybackMachine,
    status: watch::Sender<PlaybackStatus>,
}

impl<C: Connector, F: DecoderFactory> PlaybackClient<C, F> {
    pub fn new(connector: C, factory: F, config: PlaybackConfig) -> Self {
        let (status, _) = watch::channel(PlaybackStatus {
            state: PlaybackState::Connecting,
            info: None,
            units: 0,
            resyncs: 0,
            latency_reports: 0,
        });
        Self {
            connector: Arc::new(connector),
            factory,
            machine: PlaybackMachine::new(config),
            status,
        }
    }

    /// Watch status changes
    pub fn subscribe(&self) -> watch::Receiver<PlaybackStatus> {
        self.status.subscribe()
    }

    /// Play until a fallback decision
    pub async fn run(self) -> PlaybackOutcome {
        self.run_until(std::future::pending()).await
    }

    /// Play until a fallback decision or until `stop` completes
    pub async fn run_until<S>(mut self, stop: S) -> PlaybackOutcome
    where
        S: Future<Output = ()>,
    {
        let mut stop = pin!(stop);
        let mut timers = Timers::default();
        let mut connection: Option<C::Conn> = None;
        let mut connecting: Option<ConnectFuture<C::Conn>> = None;
        let mut decoder: Option<F::Decoder> = None;

        let mut sampler = tokio::time::interval(self.machine.config().latency_poll);
        sampler.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut effects: VecDeque<Effect> = self.machine.start(Instant::now()).into();

        loop {
            while let Some(effect) = effects.pop_front() {
                match effect {
                    Effect::OpenTransport => {
                        decoder = Some(self.factory.create());
                        connecting = Some(self.open());
                    }
                    Effect::CloseTransport => {
                        connecting = None;
                        decoder = None;
                        if let Some(mut conn) = connection.take() {
                            conn.close().await;
                        }
                    }
                    Effect::ArmTimer { timer, after, token } => {
                        timers.arm(timer, Instant::now() + after, token);
                    }
                    Effect::CancelTimer(timer) => timers.cancel(timer),
                    Effect::ReportLatency(level) => {
                        tracing::warn!(
                            buffered_ms = level.as_millis() as u64,
                            threshold_ms = self.machine.config().latency_threshold.as_millis() as u64,
                            "Playback latency above threshold"
                        );
                        self.publish(|s| s.latency_reports += 1);
                    }
                    Effect::SignalFallback(reason) => {
                        if let Some(mut conn) = connection.take() {
                            conn.close().await;
                        }
                        self.publish(|_| {});
                        tracing::warn!(reason = ?reason, "Switching to fallback display");
                        return PlaybackOutcome::Fallback(reason);
                    }
                }
            }
            self.publish(|_| {});

            let step = tokio::select! {
                _ = &mut stop => Step::Stop,
                result = next_connect(&mut connecting) => Step::Connect(result),
                msg = next_message(&mut connection) => Step::Message(msg),
                (timer, token) = next_timer(&timers) => Step::Timer(timer, token),
                _ = sampler.tick() => Step::Sample,
            };

            let now = Instant::now();
            match step {
                Step::Stop => {
                    if let Some(mut conn) = connection.take() {
                        conn.close().await;
                    }
                    tracing::debug!("Playback stopped");
                    return PlaybackOutcome::Stopped;
                }
                Step::Connect(result) => {
                    connecting = None;
                    let event = match result {
                        Ok(conn) => {
                            connection = Some(conn);
                            PlaybackEvent::Connected
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "Connect failed");
                            PlaybackEvent::ConnectFailed(e.to_string())
                        }
                    };
                    effects.extend(self.machine.handle(now, event));
                }
                Step::Message(Some(Ok(Incoming::Unit(data)))) => {
                    let was_degraded = self.machine.state() == PlaybackState::Degraded;
                    effects.extend(self.machine.handle(now, PlaybackEvent::UnitReceived));

                    let event = match (NalUnit::new(data, None), decoder.as_mut()) {
                        (Some(unit), Some(decoder)) => match decoder.feed(&unit) {
                            Ok(()) => {
                                self.publish(|s| s.units += 1);
                                (was_degraded && unit.kind() == UnitKind::Intra)
                                    .then_some(PlaybackEvent::DecoderRecovered)
                            }
                            Err(e) => {
                                tracing::debug!(error = %e, "Decode error");
                                Some(PlaybackEvent::DecodeError)
                            }
                        },
                        (None, _) => Some(PlaybackEvent::DecodeError),
                        (Some(_), None) => None,
                    };
                    if let Some(event) = event {
                        effects.extend(self.machine.handle(now, event));
                    }
                }
                Step::Message(Some(Ok(Incoming::Metadata(info)))) => {
                    tracing::debug!(
                        device = ?info.device,
                        encoded = ?info.encoded,
                        "Stream metadata"
                    );
                    self.publish(|s| s.info = Some(info));
                }
                Step::Message(Some(Ok(Incoming::Error(error)))) => {
                    tracing::warn!(error = %error, "Relay reported an error");
                    effects.extend(self.machine.handle(now, PlaybackEvent::ServerError(error)));
                }
                Step::Message(Some(Err(e))) => {
                    tracing::debug!(error = %e, "Transport error");
                    effects.extend(self.machine.handle(now, PlaybackEvent::TransportClosed));
                }
                Step::Message(None) => {
                    connection = None;
                    effects.extend(self.machine.handle(now, PlaybackEvent::TransportClosed));
                }
                Step::Timer(timer, token) => {
                    timers.cancel(timer);
                    effects.extend(
                        self.machine
                            .handle(now, PlaybackEvent::TimerFired { timer, token }),
                    );
                }
                Step::Sample => {
                    if let Some(decoder) = decoder.as_ref() {
                        let level = decoder.buffered();
                        effects.extend(self.machine.handle(now, PlaybackEvent::BufferLevel(level)));
                    }
                }
            }
        }
    }

    fn open(&self) -> ConnectFuture<C::Conn> {
        let connector = Arc::clone(&self.connector);
        let timeout = self.machine.config().connect_timeout;
        Box::pin(async move {
            match tokio::time::timeout(timeout, connector.connect()).await {
                Ok(result) => result,
                Err(_) => Err(ConnectError::Timeout(timeout)),
            }
        })
    }

    fn publish(&self, update: impl FnOnce(&mut PlaybackStatus)) {
        let state = self.machine.state();
        let resyncs = self.machine.resyncs();
        self.status.send_if_modified(|status| {
            let before = status.clone();
            update(status);
            status.state = state;
            status.resyncs = resyncs;
            if before.state != status.state {
                tracing::info!(from = %before.state, to = %status.state, "Playback state changed");
            }
            *status != before
        });
    }
}

async fn next_connect<T>(connecting: &mut Option<ConnectFuture<T>>) -> Result<T, ConnectError> {
    match connecting {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn next_message<C: Connection>(
    connection: &mut Option<C>,
) -> Option<Result<Incoming, ConnectError>> {
    match connection {
        Some(conn) => conn.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_timer(timers: &Timers) -> (TimerKind, u64) {
    match timers.next() {
        Some((timer, at, token)) => {
            tokio::time::sleep_until(at).await;
            (timer, token)
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::sync::{mpsc, oneshot};

    use super::*;
    use crate::device::Resolution;
    use crate::playback::decoder::SinkFactory;

    /// Each connect takes the next scripted connection; none left means refused
    #[derive(Default)]
    struct ScriptedConnector {
        scripts: Mutex<VecDeque<mpsc::UnboundedReceiver<Incoming>>>,
        connects: AtomicUsize,
    }

    impl ScriptedConnector {
        fn push(&self) -> mpsc::UnboundedSender<Incoming> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.scripts.lock().unwrap().push_back(rx);
            tx
        }
    }

    impl Connector for Arc<ScriptedConnector> {
        type Conn = ScriptedConnection;

        async fn connect(&self) -> Result<ScriptedConnection, ConnectError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let next = self.scripts.lock().unwrap().pop_front();
            match next {
                Some(rx) => Ok(ScriptedConnection { rx }),
                None => Err(ConnectError::Timeout(Duration::ZERO)),
            }
        }
    }

    struct ScriptedConnection {
        rx: mpsc::UnboundedReceiver<Incoming>,
    }

    impl Connection for ScriptedConnection {
        async fn recv(&mut self) -> Option<Result<Incoming, ConnectError>> {
            self.rx.recv().await.map(Ok)
        }

        async fn close(&mut self) {
            self.rx.close();
        }
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Output that refuses writes while the gate is closed
    struct Gated(Arc<AtomicBool>);

    impl Write for Gated {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if !self.0.load(Ordering::SeqCst) {
                return Err(std::io::ErrorKind::WouldBlock.into());
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn unit(header: u8) -> Incoming {
        Incoming::Unit(Bytes::from(vec![0, 0, 0, 1, header, 0xAA]))
    }

    fn config() -> PlaybackConfig {
        PlaybackConfig::default()
            .data_timeout(Duration::from_secs(5))
            .reconnect_backoff(Duration::from_secs(1))
            .max_reconnect_attempts(3)
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_data_falls_back() {
        let connector = Arc::new(ScriptedConnector::default());
        let _tx = connector.push();

        let client = PlaybackClient::new(
            Arc::clone(&connector),
            SinkFactory::new(std::io::sink),
            config(),
        );
        let status = client.subscribe();

        let started = Instant::now();
        let outcome = client.run().await;

        assert_eq!(outcome, PlaybackOutcome::Fallback(FallbackReason::DataTimeout));
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(status.borrow().state, PlaybackState::Fallback);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_connects_fall_back() {
        let connector = Arc::new(ScriptedConnector::default());
        let client = PlaybackClient::new(
            Arc::clone(&connector),
            SinkFactory::new(std::io::sink),
            config(),
        );

        let outcome = client.run().await;

        assert_eq!(
            outcome,
            PlaybackOutcome::Fallback(FallbackReason::SustainedFailure)
        );
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_streams_until_stopped() {
        let connector = Arc::new(ScriptedConnector::default());
        let tx = connector.push();
        let out = SharedBuf::default();
        let sink = out.clone();

        let client = PlaybackClient::new(
            Arc::clone(&connector),
            SinkFactory::new(move || sink.clone()),
            config(),
        );
        let mut status = client.subscribe();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(client.run_until(async {
            let _ = stop_rx.await;
        }));

        tx.send(Incoming::Metadata(StreamInfo::new(
            Some(Resolution::new(1080, 2400)),
            Some(Resolution::new(576, 1280)),
        )))
        .unwrap();
        for header in [0x67, 0x68, 0x65, 0x41] {
            tx.send(unit(header)).unwrap();
        }

        let snapshot = status
            .wait_for(|s| s.units == 4)
            .await
            .unwrap()
            .clone();
        assert_eq!(snapshot.state, PlaybackState::Streaming);
        assert_eq!(snapshot.info.unwrap().encoded, Some(Resolution::new(576, 1280)));

        stop_tx.send(()).unwrap();
        assert_eq!(task.await.unwrap(), PlaybackOutcome::Stopped);
        assert_eq!(out.0.lock().unwrap().len(), 4 * 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_decode_error_opens_fresh_connection() {
        let connector = Arc::new(ScriptedConnector::default());
        let first = connector.push();
        let second = connector.push();

        let client = PlaybackClient::new(
            Arc::clone(&connector),
            SinkFactory::new(std::io::sink),
            config(),
        );
        let mut status = client.subscribe();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(client.run_until(async {
            let _ = stop_rx.await;
        }));

        // Inter slice with no parameter sets: the decoder rejects it
        first.send(unit(0x41)).unwrap();
        status.wait_for(|s| s.resyncs == 1).await.unwrap();

        for header in [0x67, 0x68, 0x65] {
            second.send(unit(header)).unwrap();
        }
        let snapshot = status
            .wait_for(|s| s.state == PlaybackState::Streaming && s.units == 3)
            .await
            .unwrap()
            .clone();
        assert_eq!(snapshot.resyncs, 1);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

        stop_tx.send(()).unwrap();
        assert_eq!(task.await.unwrap(), PlaybackOutcome::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_error_reconnects() {
        let connector = Arc::new(ScriptedConnector::default());
        let first = connector.push();
        let second = connector.push();

        let client = PlaybackClient::new(
            Arc::clone(&connector),
            SinkFactory::new(std::io::sink),
            config(),
        );
        let mut status = client.subscribe();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(client.run_until(async {
            let _ = stop_rx.await;
        }));

        first
            .send(Incoming::Error("capture helper failed to start".into()))
            .unwrap();
        status
            .wait_for(|s| s.state == PlaybackState::Disconnected)
            .await
            .unwrap();

        second.send(unit(0x67)).unwrap();
        status
            .wait_for(|s| s.state == PlaybackState::Streaming)
            .await
            .unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

        stop_tx.send(()).unwrap();
        assert_eq!(task.await.unwrap(), PlaybackOutcome::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_output_reports_latency_once() {
        let connector = Arc::new(ScriptedConnector::default());
        let tx = connector.push();
        let open = Arc::new(AtomicBool::new(true));
        let gate = Arc::clone(&open);

        let client = PlaybackClient::new(
            Arc::clone(&connector),
            SinkFactory::new(move || Gated(Arc::clone(&gate))),
            config().latency_poll(Duration::from_millis(100)),
        );
        let mut status = client.subscribe();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(client.run_until(async {
            let _ = stop_rx.await;
        }));

        for header in [0x67, 0x68, 0x65] {
            tx.send(unit(header)).unwrap();
        }
        status.wait_for(|s| s.units == 3).await.unwrap();

        // The player stops reading; units pile up in the sink
        open.store(false, Ordering::SeqCst);
        tx.send(unit(0x41)).unwrap();
        let snapshot = status
            .wait_for(|s| s.latency_reports == 1)
            .await
            .unwrap()
            .clone();
        assert_eq!(snapshot.state, PlaybackState::Streaming);

        // Still high: no second report for the same excursion
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(status.borrow().latency_reports, 1);
        assert_eq!(status.borrow().resyncs, 0);

        stop_tx.send(()).unwrap();
        assert_eq!(task.await.unwrap(), PlaybackOutcome::Stopped);
    }
}
