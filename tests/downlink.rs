mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ScriptedConnector, config, eventually, framed, raw, wait_for_state};
use voice_agent::config::{Framing, OverflowPolicy, SessionConfig};
use voice_agent::device::sim::SimBackend;
use voice_agent::protocol::WireMessage;
use voice_agent::{Session, SessionState};

fn start(cfg: SessionConfig, backend: &SimBackend, connector: ScriptedConnector) -> Session {
    Session::new(cfg, Arc::new(backend.clone()), Arc::new(connector)).unwrap()
}

fn strictly_increasing(seqs: &[u64]) -> bool {
    seqs.windows(2).all(|w| w[0] < w[1])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn raw_burst_plays_out_in_full() {
    let mut cfg = config();
    cfg.wire.framing = Framing::Raw;
    cfg.wire.downlink_sample_rate = 16_000;
    let backend = SimBackend::new();
    // one second of 16 kHz speech in a single message
    let s = start(cfg, &backend, ScriptedConnector::burst([raw(&[1000; 16_000])]));

    s.start().await.unwrap();
    wait_for_state(&s, SessionState::Running).await;
    assert!(eventually(|| backend.played_seqs().len() >= 49).await);
    s.stop().await.unwrap();

    let played = backend.played_seqs();
    assert!(strictly_increasing(&played), "out of order: {:?}", played);
    let stats = s.stats();
    assert_eq!(stats.playback_drops, 0);
    assert_eq!(stats.frames_returned, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn barge_in_cuts_playback_short() {
    let mut cfg = config();
    cfg.wire.framing = Framing::Raw;
    let backend = SimBackend::new();
    // two seconds of reply, interrupted after 200 ms
    let connector = ScriptedConnector {
        script: vec![
            (Duration::ZERO, raw(&[500; 96_000])),
            (
                Duration::from_millis(200),
                WireMessage::Text(r#"{"type":"UserStartedSpeaking"}"#.to_string()),
            ),
        ],
    };
    let s = start(cfg, &backend, connector);

    s.start().await.unwrap();
    wait_for_state(&s, SessionState::Running).await;
    assert!(eventually(|| s.stats().barge_ins == 1).await);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let after_flush = backend.played_seqs().len();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(backend.played_seqs().len(), after_flush);
    assert!(after_flush < 40, "{} of 100 frames played", after_flush);

    s.stop().await.unwrap();
    assert_eq!(s.stats().barge_ins, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_plays_out_queued_frames() {
    let mut cfg = config();
    cfg.drain_timeout = Duration::from_secs(3);
    let backend = SimBackend::new();
    let samples = cfg.stream.samples_per_frame();
    let s = start(
        cfg,
        &backend,
        ScriptedConnector::burst((0..25).map(|seq| framed(seq, &vec![seq as i16 + 1; samples]))),
    );

    s.start().await.unwrap();
    wait_for_state(&s, SessionState::Running).await;
    assert!(eventually(|| !backend.played_seqs().is_empty()).await);
    s.stop().await.unwrap();

    assert_eq!(s.state(), SessionState::Stopped);
    assert_eq!(backend.played_seqs(), (0..25).collect::<Vec<_>>());
    for r in backend.rendered().iter().filter(|r| r.seq.is_some()) {
        let seq = r.seq.unwrap();
        assert_eq!(r.samples[0], seq as i16 + 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_playback_waits_instead_of_dropping() {
    let mut cfg = config();
    cfg.buffer.policy = OverflowPolicy::Block {
        timeout: Duration::from_millis(5),
    };
    // the device drains at half the rate frames arrive
    let backend = SimBackend::builder().period(Duration::from_millis(40)).build();
    let samples = cfg.stream.samples_per_frame();
    let s = start(
        cfg,
        &backend,
        ScriptedConnector::burst((0..20).map(|seq| framed(seq, &vec![7; samples]))),
    );

    s.start().await.unwrap();
    wait_for_state(&s, SessionState::Running).await;
    assert!(eventually(|| backend.played_seqs().len() >= 20).await);
    s.stop().await.unwrap();

    assert_eq!(backend.played_seqs(), (0..20).collect::<Vec<_>>());
    let stats = s.stats();
    assert_eq!(stats.playback_drops, 0);
    assert!(stats.buffer_timeouts > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_stage_counts_overrun() {
    let mut cfg = config();
    cfg.stream.frame_size = 48; // 1 ms
    cfg.buffer.policy = OverflowPolicy::Block {
        timeout: Duration::from_millis(10),
    };
    let backend = SimBackend::builder().period(Duration::from_millis(20)).build();
    let s = start(
        cfg,
        &backend,
        ScriptedConnector::burst((0..30).map(|seq| framed(seq, &[3; 48]))),
    );

    s.start().await.unwrap();
    wait_for_state(&s, SessionState::Running).await;
    // waiting 10 ms on a full ring is ten frame periods
    assert!(eventually(|| s.stats().stage_overruns > 0).await);
    s.stop().await.unwrap();
    assert_eq!(s.stats().playback_drops, 0);
}
