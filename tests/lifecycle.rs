mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ClosingConnector, config, eventually, loopback, scripted_frame, session, wait_for_state};
use voice_agent::device::Direction;
use voice_agent::device::sim::SimBackend;
use voice_agent::error::DeviceError;
use voice_agent::{Session, SessionError, SessionState};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_stop_is_rejected() {
    let backend = SimBackend::new();
    let s = session(&backend, loopback());
    s.start().await.unwrap();
    wait_for_state(&s, SessionState::Running).await;

    s.stop().await.unwrap();
    assert_eq!(s.state(), SessionState::Stopped);
    assert_eq!(s.stop().await, Err(SessionError::AlreadyStopped));
    assert_eq!(s.state(), SessionState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_stops_only_one_wins() {
    let backend = SimBackend::new();
    let s = Arc::new(session(&backend, loopback()));
    s.start().await.unwrap();
    wait_for_state(&s, SessionState::Running).await;

    let a = tokio::spawn({
        let s = s.clone();
        async move { s.stop().await }
    });
    let b = tokio::spawn({
        let s = s.clone();
        async move { s.stop().await }
    });
    let results = [a.await.unwrap(), b.await.unwrap()];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.contains(&Err(SessionError::AlreadyStopped)));
    assert_eq!(s.wait_terminal().await, SessionState::Stopped);
}

#[tokio::test]
async fn missing_device_is_unavailable() {
    let backend = SimBackend::builder().device("hw:0,0").build();
    let s = session(&backend, loopback());

    match s.start().await {
        Err(SessionError::Device(DeviceError::DeviceUnavailable(msg))) => {
            assert!(msg.contains("default"))
        }
        other => panic!("expected DeviceUnavailable, got {:?}", other),
    }
    assert_eq!(s.state(), SessionState::Failed);
    assert!(s.failure().is_some());
}

#[tokio::test]
async fn unsupported_rate_is_unavailable() {
    let backend = SimBackend::builder().sample_rates(&[16_000]).build();
    let s = session(&backend, loopback());
    assert!(matches!(
        s.start().await,
        Err(SessionError::Device(DeviceError::DeviceUnavailable(_)))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn device_fault_fails_session_and_releases_devices() {
    let backend = SimBackend::new();
    let s = session(&backend, loopback());
    s.start().await.unwrap();
    wait_for_state(&s, SessionState::Running).await;

    backend.inject_fault(Direction::Playback);
    assert_eq!(s.wait_terminal().await, SessionState::Failed);
    assert_eq!(s.failed_transitions(), 1);
    assert!(s.failure().unwrap().contains("playback"));

    // devices are stopped by the time Failed is observable
    let rendered = backend.rendered().len();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.rendered().len(), rendered);

    assert_eq!(s.stop().await, Err(SessionError::AlreadyStopped));
    assert_eq!(s.failed_transitions(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_close_stops_gracefully() {
    let backend = SimBackend::new();
    let s = Session::new(
        config(),
        Arc::new(backend.clone()),
        Arc::new(ClosingConnector { after: 3 }),
    )
    .unwrap();
    let samples = config().stream.samples_per_frame();

    s.start().await.unwrap();
    wait_for_state(&s, SessionState::Running).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    backend.push_capture((0..5).map(|i| scripted_frame(i, samples)));

    let state = tokio::time::timeout(Duration::from_secs(3), s.wait_terminal())
        .await
        .unwrap();
    assert_eq!(state, SessionState::Stopped);
    assert_eq!(s.failed_transitions(), 0);
    assert!(eventually(|| !backend.played_seqs().is_empty()).await);
}
