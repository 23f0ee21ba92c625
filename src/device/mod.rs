//! Device interface.
//!
//! A backend opens one capture and one playback stream per session. Each
//! stream runs its own OS thread (the hardware context) and talks to the
//! rest of the system only through a ring buffer half plus atomics:
//!
//! - capture: hardware → [`CaptureSink`] → capture ring
//! - playback: playback ring → [`PlaybackSource`] → hardware
//!
//! Neither side blocks on locks or I/O outside the driver call itself, and
//! neither allocates in steady state.

#[cfg(feature = "alsa-backend")]
pub mod alsa_device;
pub mod sim;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::audio::{AudioFrame, FramePool, RingConsumer, RingProducer};
use crate::config::StreamConfig;
use crate::error::DeviceError;
use crate::stats::SessionStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Capture,
    Playback,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capture => f.write_str("capture"),
            Self::Playback => f.write_str("playback"),
        }
    }
}

/// Out-of-band notifications from the hardware contexts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The stream completed its first callback.
    FirstCallback(Direction),
    /// Unrecoverable device error; the stream has stopped.
    Fault { direction: Direction, message: String },
}

pub type DeviceEvents = mpsc::UnboundedSender<DeviceEvent>;

/// An opened stream.
pub trait DeviceHandle: Send {
    fn direction(&self) -> Direction;

    /// Begin delivering (capture) or requesting (playback) frames.
    fn start(&mut self) -> Result<(), DeviceError>;

    /// Halt the stream and join its context. After this returns no further
    /// callbacks happen. A second call fails with `AlreadyStopped`.
    fn stop(&mut self) -> Result<(), DeviceError>;
}

/// Native audio driver abstraction.
pub trait DeviceBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Open the input device named by `config.input_device`.
    /// Fails with `DeviceUnavailable` when it does not exist or cannot run
    /// at the requested rate and format.
    fn open_capture(
        &self,
        config: &StreamConfig,
        sink: CaptureSink,
    ) -> Result<Box<dyn DeviceHandle>, DeviceError>;

    /// Open the output device named by `config.output_device`.
    fn open_playback(
        &self,
        config: &StreamConfig,
        source: PlaybackSource,
    ) -> Result<Box<dyn DeviceHandle>, DeviceError>;
}

// ======================== Capture side ========================

/// Where a capture context hands its frames.
pub struct CaptureSink {
    ring: RingProducer,
    pool: FramePool,
    stats: Arc<SessionStats>,
    accepting: Arc<AtomicBool>,
    events: DeviceEvents,
    channels: u16,
    epoch: Instant,
    next_seq: u64,
    alive: bool,
}

impl CaptureSink {
    pub fn new(
        ring: RingProducer,
        pool: FramePool,
        stats: Arc<SessionStats>,
        accepting: Arc<AtomicBool>,
        events: DeviceEvents,
        channels: u16,
        epoch: Instant,
    ) -> Self {
        Self {
            ring,
            pool,
            stats,
            accepting,
            events,
            channels,
            epoch,
            next_seq: 0,
            alive: false,
        }
    }

    /// Interleaved samples in one frame.
    pub fn frame_samples(&self) -> usize {
        self.pool.frame_samples()
    }

    /// Report the first callback once.
    pub fn mark_alive(&mut self) {
        if !self.alive {
            self.alive = true;
            let _ = self
                .events
                .send(DeviceEvent::FirstCallback(Direction::Capture));
        }
    }

    /// Hand over one period of captured audio. Short input is zero-padded,
    /// long input truncated to one frame.
    pub fn deliver(&mut self, pcm: &[i16]) {
        self.mark_alive();
        if !self.accepting.load(Ordering::Acquire) {
            return;
        }

        let (mut buf, miss) = self.pool.acquire();
        if miss {
            SessionStats::incr(&self.stats.pool_misses);
        }
        let n = pcm.len().min(buf.len());
        buf[..n].copy_from_slice(&pcm[..n]);
        buf[n..].fill(0);

        let timestamp_us = self.epoch.elapsed().as_micros() as u64;
        let frame = AudioFrame::new(self.next_seq, timestamp_us, self.channels, buf);
        self.next_seq += 1;
        SessionStats::incr(&self.stats.frames_captured);

        // Capture ring is always drop-oldest, push never waits here.
        if !matches!(self.ring.push(frame), Ok(true)) {
            SessionStats::incr(&self.stats.capture_drops);
        }
    }

    pub fn fault(&self, message: impl Into<String>) {
        let _ = self.events.send(DeviceEvent::Fault {
            direction: Direction::Capture,
            message: message.into(),
        });
    }
}

// ======================== Playback side ========================

/// What the playback context rendered in one period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Played {
    pub seq: u64,
    /// The frame was silence inserted for a missing sequence number.
    pub filler: bool,
}

/// Where a playback context gets its frames.
pub struct PlaybackSource {
    ring: RingConsumer,
    pool: FramePool,
    stats: Arc<SessionStats>,
    flush: Arc<AtomicBool>,
    events: DeviceEvents,
    wait: Duration,
    last_seq: Option<u64>,
    alive: bool,
}

impl PlaybackSource {
    pub fn new(
        ring: RingConsumer,
        pool: FramePool,
        stats: Arc<SessionStats>,
        flush: Arc<AtomicBool>,
        events: DeviceEvents,
        wait: Duration,
    ) -> Self {
        Self {
            ring,
            pool,
            stats,
            flush,
            events,
            wait,
            last_seq: None,
            alive: false,
        }
    }

    pub fn frame_samples(&self) -> usize {
        self.pool.frame_samples()
    }

    pub fn mark_alive(&mut self) {
        if !self.alive {
            self.alive = true;
            let _ = self
                .events
                .send(DeviceEvent::FirstCallback(Direction::Playback));
        }
    }

    /// Fill `out` with the next frame, waiting at most the configured bound.
    /// Renders silence and returns `None` when nothing arrived in time.
    pub fn pull(&mut self, out: &mut [i16]) -> Option<Played> {
        self.mark_alive();

        if self.flush.swap(false, Ordering::AcqRel) {
            for frame in self.ring.drain() {
                SessionStats::incr(&self.stats.playback_drops);
                self.pool.release(frame);
            }
        }

        loop {
            let Some(frame) = self.ring.pop_timeout(self.wait) else {
                out.fill(0);
                SessionStats::incr(&self.stats.underruns);
                return None;
            };

            // The sequencer upstream keeps order; never render backwards.
            if self.last_seq.is_some_and(|last| frame.seq() < last) {
                SessionStats::incr(&self.stats.late_frames);
                self.pool.release(frame);
                continue;
            }

            let samples = frame.samples();
            let n = samples.len().min(out.len());
            out[..n].copy_from_slice(&samples[..n]);
            out[n..].fill(0);

            let played = Played {
                seq: frame.seq(),
                filler: frame.is_filler(),
            };
            self.last_seq = Some(played.seq);
            self.stats.record_played(played.seq);
            self.pool.release(frame);
            return Some(played);
        }
    }

    pub fn fault(&self, message: impl Into<String>) {
        let _ = self.events.send(DeviceEvent::Fault {
            direction: Direction::Playback,
            message: message.into(),
        });
    }
}

// ======================== Stream thread ========================

type StreamBody = Box<dyn FnOnce(Arc<AtomicBool>) + Send>;

/// Start/stop bookkeeping shared by the backends: one named OS thread per
/// stream, a running flag, and the double-stop check.
pub(crate) struct StreamThread {
    name: String,
    direction: Direction,
    running: Arc<AtomicBool>,
    body: Option<StreamBody>,
    handle: Option<JoinHandle<()>>,
    stopped: bool,
}

impl StreamThread {
    pub(crate) fn new(
        name: impl Into<String>,
        direction: Direction,
        body: impl FnOnce(Arc<AtomicBool>) + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            direction,
            running: Arc::new(AtomicBool::new(false)),
            body: Some(Box::new(body)),
            handle: None,
            stopped: false,
        }
    }
}

impl DeviceHandle for StreamThread {
    fn direction(&self) -> Direction {
        self.direction
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        if self.stopped {
            return Err(DeviceError::AlreadyStopped);
        }
        let body = self.body.take().ok_or(DeviceError::AlreadyStarted)?;
        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || body(running))
            .map_err(|e| DeviceError::Fault(format!("spawn {}: {}", self.name, e)))?;
        self.handle = Some(handle);
        log::debug!("{} stream started", self.direction);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        if self.stopped {
            return Err(DeviceError::AlreadyStopped);
        }
        self.stopped = true;
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            if h.join().is_err() {
                log::error!("{} thread panicked", self.name);
            }
        }
        log::debug!("{} stream stopped", self.direction);
        Ok(())
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        if !self.stopped {
            let _ = self.stop();
        }
    }
}

/// Sleep until `deadline` if it is still ahead.
pub(crate) fn sleep_until(deadline: Instant) {
    let now = Instant::now();
    if deadline > now {
        thread::sleep(deadline - now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::ring_buffer;
    use crate::config::OverflowPolicy;

    fn events() -> (DeviceEvents, mpsc::UnboundedReceiver<DeviceEvent>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn capture_sink_numbers_frames() {
        let (tx, rx) = ring_buffer(4, OverflowPolicy::DropOldest);
        let (ev_tx, mut ev_rx) = events();
        let stats = Arc::new(SessionStats::new());
        let mut sink = CaptureSink::new(
            tx,
            FramePool::new(3, 4),
            stats.clone(),
            Arc::new(AtomicBool::new(true)),
            ev_tx,
            1,
            Instant::now(),
        );

        sink.deliver(&[1, 2, 3]);
        sink.deliver(&[4, 5]);

        let a = rx.pop().unwrap();
        let b = rx.pop().unwrap();
        assert_eq!((a.seq(), b.seq()), (0, 1));
        assert_eq!(b.samples(), &[4, 5, 0]);
        assert_eq!(
            ev_rx.try_recv().unwrap(),
            DeviceEvent::FirstCallback(Direction::Capture)
        );
        assert!(ev_rx.try_recv().is_err(), "first callback is reported once");
        assert_eq!(stats.frames_captured.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn capture_sink_discards_while_not_accepting() {
        let (tx, rx) = ring_buffer(4, OverflowPolicy::DropOldest);
        let (ev_tx, _ev_rx) = events();
        let accepting = Arc::new(AtomicBool::new(false));
        let mut sink = CaptureSink::new(
            tx,
            FramePool::new(2, 1),
            Arc::new(SessionStats::new()),
            accepting,
            ev_tx,
            1,
            Instant::now(),
        );
        sink.deliver(&[1, 1]);
        assert!(rx.is_empty());
    }

    #[test]
    fn playback_source_renders_silence_on_underrun() {
        let (_tx, rx) = ring_buffer(2, OverflowPolicy::DropOldest);
        let (ev_tx, _ev_rx) = events();
        let stats = Arc::new(SessionStats::new());
        let mut source = PlaybackSource::new(
            rx,
            FramePool::new(2, 2),
            stats.clone(),
            Arc::new(AtomicBool::new(false)),
            ev_tx,
            Duration::from_millis(1),
        );
        let mut out = [7i16; 2];
        assert_eq!(source.pull(&mut out), None);
        assert_eq!(out, [0, 0]);
        assert_eq!(stats.underruns.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn playback_source_skips_backwards_frames() {
        let (tx, rx) = ring_buffer(4, OverflowPolicy::DropOldest);
        let (ev_tx, _ev_rx) = events();
        let stats = Arc::new(SessionStats::new());
        let mut source = PlaybackSource::new(
            rx,
            FramePool::new(1, 2),
            stats.clone(),
            Arc::new(AtomicBool::new(false)),
            ev_tx,
            Duration::ZERO,
        );
        tx.push(AudioFrame::new(5, 0, 1, vec![5])).unwrap();
        tx.push(AudioFrame::new(3, 0, 1, vec![3])).unwrap();
        tx.push(AudioFrame::new(6, 0, 1, vec![6])).unwrap();

        let mut out = [0i16; 1];
        assert_eq!(source.pull(&mut out).map(|p| p.seq), Some(5));
        assert_eq!(source.pull(&mut out).map(|p| p.seq), Some(6));
        assert_eq!(out, [6]);
        assert_eq!(stats.late_frames.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn flush_empties_the_queue() {
        let (tx, rx) = ring_buffer(4, OverflowPolicy::DropOldest);
        let (ev_tx, _ev_rx) = events();
        let flush = Arc::new(AtomicBool::new(false));
        let mut source = PlaybackSource::new(
            rx,
            FramePool::new(1, 4),
            Arc::new(SessionStats::new()),
            flush.clone(),
            ev_tx,
            Duration::ZERO,
        );
        tx.push(AudioFrame::new(0, 0, 1, vec![1])).unwrap();
        tx.push(AudioFrame::new(1, 0, 1, vec![1])).unwrap();
        flush.store(true, Ordering::Release);

        let mut out = [0i16; 1];
        assert_eq!(source.pull(&mut out), None);
        assert!(tx.is_empty());
    }

    #[test]
    fn stream_thread_double_stop() {
        let mut t = StreamThread::new("test-stream", Direction::Capture, |running| {
            while running.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(1));
            }
        });
        t.start().unwrap();
        assert_eq!(t.start(), Err(DeviceError::AlreadyStarted));
        t.stop().unwrap();
        assert_eq!(t.stop(), Err(DeviceError::AlreadyStopped));
    }
}
