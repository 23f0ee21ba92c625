//! Session counters.
//!
//! All updates are relaxed atomics so they can be bumped from the hardware
//! contexts. An external logging/metrics layer polls [`SessionStats::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::state_machine::SessionState;

/// Sentinel for "nothing played yet".
const NO_SEQ: u64 = u64::MAX;

#[derive(Debug)]
pub struct SessionStats {
    pub frames_captured: AtomicU64,
    pub capture_drops: AtomicU64,
    pub frames_played: AtomicU64,
    /// Periods where playback had nothing and rendered silence.
    pub underruns: AtomicU64,
    pub playback_drops: AtomicU64,
    pub buffer_timeouts: AtomicU64,
    pub frames_forwarded: AtomicU64,
    pub frames_returned: AtomicU64,
    /// Silence frames inserted for missing sequence numbers.
    pub gap_frames: AtomicU64,
    /// Frames discarded because they arrived behind the playout point.
    pub late_frames: AtomicU64,
    pub stage_overruns: AtomicU64,
    pub codec_errors: AtomicU64,
    pub transport_drops: AtomicU64,
    /// Consecutive frames dropped by the transport; reset on the next successful send.
    pub drop_run: AtomicU64,
    pub reconnects: AtomicU64,
    pub pool_misses: AtomicU64,
    /// Times queued return audio was discarded because the user spoke.
    pub barge_ins: AtomicU64,
    last_played_seq: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub state: SessionState,
    pub frames_captured: u64,
    pub capture_drops: u64,
    pub frames_played: u64,
    pub underruns: u64,
    pub playback_drops: u64,
    pub buffer_timeouts: u64,
    pub frames_forwarded: u64,
    pub frames_returned: u64,
    pub gap_frames: u64,
    pub late_frames: u64,
    pub stage_overruns: u64,
    pub codec_errors: u64,
    pub transport_drops: u64,
    pub drop_run: u64,
    pub reconnects: u64,
    pub pool_misses: u64,
    pub barge_ins: u64,
    pub last_played_seq: Option<u64>,
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            frames_captured: AtomicU64::new(0),
            capture_drops: AtomicU64::new(0),
            frames_played: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            playback_drops: AtomicU64::new(0),
            buffer_timeouts: AtomicU64::new(0),
            frames_forwarded: AtomicU64::new(0),
            frames_returned: AtomicU64::new(0),
            gap_frames: AtomicU64::new(0),
            late_frames: AtomicU64::new(0),
            stage_overruns: AtomicU64::new(0),
            codec_errors: AtomicU64::new(0),
            transport_drops: AtomicU64::new(0),
            drop_run: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            pool_misses: AtomicU64::new(0),
            barge_ins: AtomicU64::new(0),
            last_played_seq: AtomicU64::new(NO_SEQ),
        }
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_played(&self, seq: u64) {
        self.frames_played.fetch_add(1, Ordering::Relaxed);
        self.last_played_seq.store(seq, Ordering::Relaxed);
    }

    pub fn last_played_seq(&self) -> Option<u64> {
        match self.last_played_seq.load(Ordering::Relaxed) {
            NO_SEQ => None,
            seq => Some(seq),
        }
    }

    pub fn snapshot(&self, state: SessionState) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            state,
            frames_captured: get(&self.frames_captured),
            capture_drops: get(&self.capture_drops),
            frames_played: get(&self.frames_played),
            underruns: get(&self.underruns),
            playback_drops: get(&self.playback_drops),
            buffer_timeouts: get(&self.buffer_timeouts),
            frames_forwarded: get(&self.frames_forwarded),
            frames_returned: get(&self.frames_returned),
            gap_frames: get(&self.gap_frames),
            late_frames: get(&self.late_frames),
            stage_overruns: get(&self.stage_overruns),
            codec_errors: get(&self.codec_errors),
            transport_drops: get(&self.transport_drops),
            drop_run: get(&self.drop_run),
            reconnects: get(&self.reconnects),
            pool_misses: get(&self.pool_misses),
            barge_ins: get(&self.barge_ins),
            last_played_seq: self.last_played_seq(),
        }
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = SessionStats::new();
        SessionStats::incr(&stats.frames_captured);
        SessionStats::incr(&stats.frames_captured);
        stats.record_played(7);

        let snap = stats.snapshot(SessionState::Running);
        assert_eq!(snap.frames_captured, 2);
        assert_eq!(snap.frames_played, 1);
        assert_eq!(snap.last_played_seq, Some(7));
        assert_eq!(snap.state, SessionState::Running);
    }

    #[test]
    fn snapshot_serializes() {
        let stats = SessionStats::new();
        let json = serde_json::to_string(&stats.snapshot(SessionState::Idle)).unwrap();
        assert!(json.contains(r#""state":"idle""#));
        assert!(json.contains(r#""last_played_seq":null"#));
    }
}
