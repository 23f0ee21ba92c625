mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{config, session, wait_for_state};
use voice_agent::device::sim::SimBackend;
use voice_agent::transport::loopback::LoopbackConnector;
use voice_agent::SessionState;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failures_below_ceiling_keep_running() {
    let ceiling = config().transport.reconnect_ceiling;
    let backend = SimBackend::new();
    let connector = Arc::new(LoopbackConnector::new().fail_first(ceiling - 1));
    let s = session(&backend, connector.clone());

    s.start().await.unwrap();
    wait_for_state(&s, SessionState::Running).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(s.state(), SessionState::Running);
    assert_eq!(connector.attempts(), ceiling);
    assert_eq!(s.stats().reconnects, (ceiling - 1) as u64);

    s.stop().await.unwrap();
    assert_eq!(s.failed_transitions(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reaching_ceiling_fails_once() {
    let ceiling = config().transport.reconnect_ceiling;
    let backend = SimBackend::new();
    let connector = Arc::new(LoopbackConnector::new().fail_first(ceiling));
    let s = session(&backend, connector.clone());

    s.start().await.unwrap();
    assert_eq!(s.wait_terminal().await, SessionState::Failed);
    assert_eq!(s.failed_transitions(), 1);
    assert!(s.failure().unwrap().contains("transport fatal"));
    assert_eq!(connector.attempts(), ceiling);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(s.state(), SessionState::Failed);
    assert_eq!(s.failed_transitions(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn endpoint_that_never_answers_fails_once() {
    let backend = SimBackend::new();
    let s = session(
        &backend,
        Arc::new(LoopbackConnector::new().fail_first(u32::MAX)),
    );

    s.start().await.unwrap();
    assert_eq!(s.wait_terminal().await, SessionState::Failed);
    assert_eq!(s.failed_transitions(), 1);
}
