//! Session lifecycle against a fake capture launcher

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use screen_relay::error::LaunchError;
use screen_relay::registry::{SessionError, StreamEvent};
use screen_relay::{DeviceId, RelayConfig, SessionRegistry, SessionState};

#[tokio::test]
async fn test_late_joiner_starts_from_cached_bundle() {
    let registry = SessionRegistry::new(FakeLauncher::default());
    let device = DeviceId::from("emulator-5554");

    let mut early = registry.attach(&device).await.unwrap();
    let launcher = registry.launcher();
    launcher.send_packet(&device, None, &[SPS, PPS]).await;
    launcher.send_packet(&device, Some(0), &[IDR]).await;
    launcher.send_packet(&device, Some(16_666), &[P1]).await;

    assert_eq!(next_units(&mut early, 4).await, expected(&[SPS, PPS, IDR, P1]));

    // P1 is fully fanned out; the new consumer only sees what follows
    let mut late = registry.attach(&device).await.unwrap();
    launcher.send_packet(&device, Some(33_333), &[P2]).await;

    assert_eq!(next_unit(&mut early).await.unwrap(), expected(&[P2])[0]);
    assert_eq!(next_units(&mut late, 4).await, expected(&[SPS, PPS, IDR, P2]));
    assert_eq!(registry.consumer_count(&device).await, 2);
    assert_eq!(launcher.starts(), 1);
}

#[tokio::test]
async fn test_consumer_before_first_intra_waits_for_it() {
    let registry = SessionRegistry::new(FakeLauncher::default());
    let device = DeviceId::from("emulator-5554");

    let mut sub = registry.attach(&device).await.unwrap();
    let launcher = registry.launcher();

    // Inter slice with nothing to decode it against is never delivered
    launcher.send_packet(&device, Some(0), &[P0]).await;
    launcher.send_packet(&device, None, &[SPS, PPS]).await;
    launcher.send_packet(&device, Some(16_666), &[IDR]).await;
    launcher.send_packet(&device, Some(33_333), &[P1]).await;

    assert_eq!(next_units(&mut sub, 4).await, expected(&[SPS, PPS, IDR, P1]));

    let stats = registry.session_stats(&device).await.unwrap();
    assert_eq!(stats.units, 5);
    assert_eq!(stats.bundles_committed, 1);
}

#[tokio::test]
async fn test_first_event_is_stream_info() {
    let registry = SessionRegistry::new(FakeLauncher::default());
    let device = DeviceId::from("emulator-5554");

    let mut sub = registry.attach(&device).await.unwrap();
    match sub.recv().await {
        Some(StreamEvent::Info(info)) => {
            assert_eq!(info.device.map(|r| r.width), Some(1080));
            assert_eq!(info.encoded.map(|r| r.height), Some(16));
        }
        other => panic!("expected info, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_grace_period_reuse_then_teardown() {
    let config = RelayConfig::default().grace_period(Duration::from_secs(10));
    let registry = SessionRegistry::with_config(FakeLauncher::default(), config);
    let device = DeviceId::from("emulator-5554");

    let sub = registry.attach(&device).await.unwrap();
    registry.detach(&device, sub.id()).await;
    assert_eq!(registry.session_state(&device).await, Some(SessionState::Stopping));

    tokio::time::advance(Duration::from_secs(5)).await;
    registry.cleanup().await;

    let sub = registry.attach(&device).await.unwrap();
    assert_eq!(registry.session_state(&device).await, Some(SessionState::Running));
    assert_eq!(registry.launcher().starts(), 1);
    assert_eq!(registry.launcher().stops(), 0);

    registry.detach(&device, sub.id()).await;
    tokio::time::advance(Duration::from_secs(11)).await;
    registry.cleanup().await;

    assert_eq!(registry.session_count().await, 0);
    assert_eq!(registry.launcher().stops(), 1);

    // A new attach starts a fresh capture
    let _sub = registry.attach(&device).await.unwrap();
    assert_eq!(registry.launcher().starts(), 2);
}

#[tokio::test]
async fn test_device_failure_is_isolated() {
    let registry = SessionRegistry::new(FakeLauncher::default());
    let good = DeviceId::from("emulator-5554");
    let broken = DeviceId::from("emulator-5556");

    let mut good_sub = registry.attach(&good).await.unwrap();
    let mut broken_sub = registry.attach(&broken).await.unwrap();
    let launcher = registry.launcher();

    launcher.send_garbage(&broken).await;
    assert_eq!(next_unit(&mut broken_sub).await, None);

    launcher.send_packet(&good, None, &[SPS, PPS]).await;
    launcher.send_packet(&good, Some(0), &[IDR]).await;
    assert_eq!(next_units(&mut good_sub, 3).await, expected(&[SPS, PPS, IDR]));
    assert_eq!(registry.session_state(&good).await, Some(SessionState::Running));

    // Offline devices fail without touching the others
    let err = registry.attach(&DeviceId::from("offline-1")).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Launch {
            source: LaunchError::DeviceUnreachable(_),
            ..
        }
    ));
    assert_eq!(registry.consumer_count(&good).await, 1);
}

#[tokio::test]
async fn test_launch_failure_then_retry() {
    let launcher = FakeLauncher::default();
    launcher
        .failures_left
        .store(1, std::sync::atomic::Ordering::SeqCst);
    let registry = SessionRegistry::new(launcher);
    let device = DeviceId::from("emulator-5554");

    let err = registry.attach(&device).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Launch {
            source: LaunchError::HelperStartFailed(_),
            ..
        }
    ));
    assert_eq!(err.device(), &device);
    assert_eq!(registry.session_state(&device).await, Some(SessionState::Failed));

    // Retried only by a new explicit attach
    let _sub = registry.attach(&device).await.unwrap();
    assert_eq!(registry.session_state(&device).await, Some(SessionState::Running));
    assert_eq!(registry.launcher().starts(), 1);
}

#[tokio::test]
async fn test_concurrent_attaches_start_once() {
    let registry = Arc::new(SessionRegistry::new(FakeLauncher::with_start_delay(
        Duration::from_millis(50),
    )));
    let device = DeviceId::from("emulator-5554");

    let attaches = (0..8).map(|_| {
        let registry = Arc::clone(&registry);
        let device = device.clone();
        tokio::spawn(async move { registry.attach(&device).await })
    });
    let subs: Vec<_> = futures_util::future::join_all(attaches)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    assert_eq!(subs.len(), 8);
    assert_eq!(registry.launcher().starts(), 1);
    assert_eq!(registry.consumer_count(&device).await, 8);
}

#[tokio::test]
async fn test_stream_end_notifies_consumers_and_restarts() {
    let registry = Arc::new(SessionRegistry::new(FakeLauncher::default()));
    let cleanup = registry.spawn_cleanup_task();
    let device = DeviceId::from("emulator-5554");

    let mut sub = registry.attach(&device).await.unwrap();
    registry.launcher().send_garbage(&device).await;

    let ended = loop {
        match sub.recv().await {
            Some(StreamEvent::Ended(reason)) => break reason,
            Some(_) => continue,
            None => panic!("queue closed without an end event"),
        }
    };
    assert!(ended.contains("framing error"));

    let _sub = registry.attach(&device).await.unwrap();
    assert_eq!(registry.launcher().starts(), 2);
    assert_eq!(registry.launcher().stops(), 1);

    cleanup.abort();
}
