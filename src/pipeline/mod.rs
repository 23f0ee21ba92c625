//! Processing pipeline.
//!
//! Runs on its own OS thread between the two ring buffers:
//!
//! ```text
//! capture ring → resample → encode → forward ─┐
//!                                         transport
//! playback ring ← playout ← resample back ← decode ─┘
//! ```
//!
//! Each tick the uplink empties the capture ring unless the transport pushes
//! back, then the downlink waits up to one tick for returned frames. Return
//! audio is cut into device frames and held in a bounded backlog until the
//! playback ring has room; a full backlog stops reads from the inbound queue.

pub mod playout;

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::audio::resample::convert_channels;
use crate::audio::{
    AudioFrame, FramePool, Offer, RingConsumer, RingProducer, StreamDecoder, StreamEncoder,
    StreamResampler, create_decoder, create_encoder,
};
use crate::config::{Framing, SessionConfig};
use crate::error::{PipelineError, TransportError};
use crate::protocol::EncodedFrame;
use crate::stats::SessionStats;
use crate::transport::{SendOutcome, TransportHandle};
use playout::{Admission, PlayoutSequencer, Reframer};

/// Longest the downlink waits per tick.
const MAX_TICK: Duration = Duration::from_millis(5);

/// Flags shared between the pipeline thread and the session.
#[derive(Debug, Default)]
pub struct PipelineControl {
    running: AtomicBool,
    draining: AtomicBool,
    barge_in: AtomicBool,
    drained: Notify,
}

/// Run `f` and count it as an overrun when it takes longer than a frame.
fn timed<T>(stats: &SessionStats, period: Duration, stage: &'static str, f: impl FnOnce() -> T) -> T {
    let started = Instant::now();
    let out = f();
    let elapsed = started.elapsed();
    if elapsed > period {
        SessionStats::incr(&stats.stage_overruns);
        log::debug!(
            "{}",
            PipelineError::PipelineStageTimeout {
                stage,
                elapsed,
                period
            }
        );
    }
    out
}

pub struct Pipeline {
    config: SessionConfig,
    capture: RingConsumer,
    playback: RingProducer,
    transport: TransportHandle,
    pool: FramePool,
    stats: Arc<SessionStats>,
    control: Arc<PipelineControl>,
    playback_flush: Arc<AtomicBool>,
    encoder: Box<dyn StreamEncoder>,
    decoder: Box<dyn StreamDecoder>,
    uplink_resampler: StreamResampler,
    /// Resampled capture audio, cut into wire frames.
    uplink_frames: Reframer,
    downlink_resampler: StreamResampler,
    sequencer: PlayoutSequencer,
    /// Return audio at the device rate, cut into device frames.
    playout: Reframer,
    /// Frame the playback ring had no room for.
    held: Option<AudioFrame>,
    backlog_limit: usize,
    epoch: Instant,
    period: Duration,
    tick: Duration,
    last_downlink: Instant,
    drained_reported: bool,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &SessionConfig,
        capture: RingConsumer,
        playback: RingProducer,
        transport: TransportHandle,
        pool: FramePool,
        stats: Arc<SessionStats>,
        playback_flush: Arc<AtomicBool>,
        epoch: Instant,
    ) -> Result<Self, PipelineError> {
        let encoder = create_encoder(&config.wire).map_err(|e| PipelineError::Codec(e.to_string()))?;
        let decoder = create_decoder(&config.wire).map_err(|e| PipelineError::Codec(e.to_string()))?;
        let stream = &config.stream;
        let wire = &config.wire;
        let period = stream.frame_duration();

        let uplink_resampler = StreamResampler::new(
            stream.sample_rate,
            wire.uplink_sample_rate,
            wire.channels,
            stream.frame_size,
        )?;
        let downlink_resampler = StreamResampler::new(
            wire.downlink_sample_rate,
            stream.sample_rate,
            stream.channels,
            config.downlink_frame_size(),
        )?;

        Ok(Self {
            config: config.clone(),
            capture,
            sequencer: PlayoutSequencer::new(playback.capacity()),
            playback,
            transport,
            pool,
            stats,
            control: Arc::new(PipelineControl::default()),
            playback_flush,
            encoder,
            decoder,
            uplink_resampler,
            uplink_frames: Reframer::new(
                config.uplink_frame_size() * wire.channels as usize,
                wire.channels,
            ),
            downlink_resampler,
            playout: Reframer::new(stream.samples_per_frame(), stream.channels),
            held: None,
            backlog_limit: config.backlog_samples().max(stream.samples_per_frame()),
            epoch,
            period,
            tick: (period / 4).clamp(Duration::from_millis(1), MAX_TICK),
            last_downlink: Instant::now(),
            drained_reported: false,
        })
    }

    pub fn spawn(self) -> io::Result<PipelineHandle> {
        let control = self.control.clone();
        control.running.store(true, Ordering::SeqCst);
        let thread = thread::Builder::new()
            .name("pipeline".to_string())
            .spawn(move || self.run())?;
        Ok(PipelineHandle {
            control,
            thread: Some(thread),
        })
    }

    fn run(mut self) {
        log::info!(
            "Pipeline started: {} Hz/{} ch device, {} Hz up/{} Hz down {:?} {:?}",
            self.config.stream.sample_rate,
            self.config.stream.channels,
            self.config.wire.uplink_sample_rate,
            self.config.wire.downlink_sample_rate,
            self.config.wire.codec,
            self.config.wire.framing,
        );

        while self.control.running.load(Ordering::Acquire) {
            if self.control.barge_in.swap(false, Ordering::AcqRel) {
                self.barge_in();
            }

            self.uplink();

            if self.backlog_full() {
                // the inbound queue holds the rest until playback catches up
                thread::sleep(self.tick);
            } else {
                match self.transport.receive(self.tick) {
                    Ok(frame) => {
                        self.downlink(frame);
                        while !self.backlog_full() {
                            let Some(frame) = self.transport.try_receive() else {
                                break;
                            };
                            self.downlink(frame);
                        }
                    }
                    Err(TransportError::Timeout) => {}
                    Err(_) => thread::sleep(self.tick),
                }
            }

            self.pump_playout();

            if self.control.draining.load(Ordering::Acquire) {
                self.check_drained();
            }
        }

        for frame in self.capture.drain() {
            self.pool.release(frame);
        }
        log::info!("Pipeline stopped");
    }

    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    // ======================== uplink ========================

    fn uplink(&mut self) {
        while let Some(frame) = self.capture.pop() {
            let outcome = self.forward(&frame);
            self.pool.release(frame);
            if outcome == Some(SendOutcome::Full) {
                // leave the rest to the capture ring's drop policy
                break;
            }
        }
    }

    fn forward(&mut self, frame: &AudioFrame) -> Option<SendOutcome> {
        let device_ch = self.config.stream.channels;
        let wire_ch = self.config.wire.channels;
        let stats = self.stats.clone();

        let resampled = timed(&stats, self.period, "resample", || {
            let mixed = convert_channels(frame.samples(), device_ch, wire_ch);
            self.uplink_resampler.process(&mixed)
        });
        match resampled {
            Ok(pcm) => self.uplink_frames.push(&pcm),
            Err(e) => {
                SessionStats::incr(&stats.codec_errors);
                log::warn!("Resample error on frame {}: {}", frame.seq(), e);
                return None;
            }
        }

        let mut outcome = None;
        while let Some(wire) = self.uplink_frames.next_frame(frame.timestamp_us()) {
            let payload = match timed(&stats, self.period, "encode", || {
                self.encoder.encode(wire.samples())
            }) {
                Ok(p) => p,
                Err(e) => {
                    SessionStats::incr(&stats.codec_errors);
                    log::warn!("Encode error on frame {}: {}", wire.seq(), e);
                    continue;
                }
            };
            let encoded = EncodedFrame::new(wire.seq(), wire.timestamp_us(), payload);
            let sent = timed(&stats, self.period, "forward", || self.transport.send(encoded));
            if outcome != Some(SendOutcome::Full) {
                outcome = Some(sent);
            }
        }
        outcome
    }

    // ======================== downlink ========================

    fn backlog_full(&self) -> bool {
        self.playout.pending() >= self.backlog_limit
    }

    fn downlink(&mut self, frame: EncodedFrame) {
        SessionStats::incr(&self.stats.frames_returned);
        self.last_downlink = Instant::now();
        let stats = self.stats.clone();

        let pcm = match timed(&stats, self.period, "decode", || self.decoder.decode(&frame.payload)) {
            Ok(pcm) => pcm,
            Err(e) => {
                SessionStats::incr(&stats.codec_errors);
                log::warn!("Decode error: {}", e);
                return;
            }
        };
        let mixed = convert_channels(&pcm, self.config.wire.channels, self.config.stream.channels);

        // raw messages carry no sequence number; order is arrival order
        if self.config.wire.framing == Framing::Framed {
            match self.sequencer.admit(frame.seq) {
                Admission::Late => {
                    SessionStats::incr(&stats.late_frames);
                    return;
                }
                Admission::Resync { skipped } => {
                    log::debug!("Downlink skipped {} frames, resyncing at {}", skipped, frame.seq);
                }
                Admission::Play { fill } => {
                    if !fill.is_empty() {
                        self.fill_gap(fill.end - fill.start, mixed.len());
                    }
                }
            }
        }

        match timed(&stats, self.period, "resample_back", || {
            self.downlink_resampler.process(&mixed)
        }) {
            Ok(samples) => self.playout.push(&samples),
            Err(e) => {
                SessionStats::incr(&stats.codec_errors);
                log::warn!("Resample error on downlink: {}", e);
            }
        }
    }

    /// Silence for `missing` frames of `wire_samples` each, after whatever
    /// the resampler still holds from before the gap.
    fn fill_gap(&mut self, missing: u64, wire_samples: usize) {
        self.stats.gap_frames.fetch_add(missing, Ordering::Relaxed);
        match self.downlink_resampler.flush() {
            Ok(tail) => self.playout.push(&tail),
            Err(e) => log::warn!("Resampler flush failed: {}", e),
        }

        let stream = &self.config.stream;
        let ch = stream.channels.max(1) as usize;
        let per_frame = (wire_samples / ch) as u64 * stream.sample_rate as u64
            / self.config.wire.downlink_sample_rate.max(1) as u64;
        self.playout
            .push_silence(missing as usize * per_frame as usize * ch);
    }

    /// Move cut frames into the playback ring while it has room. Under the
    /// block policy a full ring is waited on once per tick.
    fn pump_playout(&mut self) {
        let stats = self.stats.clone();
        loop {
            let frame = match self.held.take() {
                Some(frame) => frame,
                None => {
                    let now = self.now_us();
                    match self.playout.next_frame(now) {
                        Some(frame) => frame,
                        None => return,
                    }
                }
            };

            let was_full = self.playback.len() >= self.playback.capacity();
            match timed(&stats, self.period, "playout", || self.playback.offer(frame)) {
                Offer::Queued => {}
                Offer::Full(frame) => {
                    self.held = Some(frame);
                    return;
                }
                Offer::TimedOut(frame) => {
                    SessionStats::incr(&stats.buffer_timeouts);
                    log::debug!("Playback ring still full, holding frame {}", frame.seq());
                    self.held = Some(frame);
                    return;
                }
                Offer::Closed => return,
            }
            if was_full {
                return;
            }
        }
    }

    fn barge_in(&mut self) {
        let mut dropped = 0;
        while self.transport.try_receive().is_some() {
            dropped += 1;
        }
        let backlog = self.playout.pending() / self.config.stream.samples_per_frame().max(1)
            + usize::from(self.held.is_some());
        self.playout.reset();
        self.held = None;
        if let Err(e) = self.downlink_resampler.reset() {
            log::warn!("Resampler reset failed: {}", e);
        }
        self.playback_flush.store(true, Ordering::Release);
        SessionStats::incr(&self.stats.barge_ins);
        log::info!(
            "Barge-in: flushed playback ({} queued messages, {} backlog frames dropped)",
            dropped,
            backlog
        );
    }

    fn check_drained(&mut self) {
        if self.drained_reported {
            return;
        }
        let quiet =
            self.last_downlink.elapsed() >= self.period * 2 && self.transport.inbound_idle();
        if !quiet {
            return;
        }

        // play out the tail of the last message too
        if self.downlink_resampler.pending() > 0 {
            match self.downlink_resampler.flush() {
                Ok(tail) => self.playout.push(&tail),
                Err(e) => log::warn!("Resampler flush failed: {}", e),
            }
        }
        self.playout.pad_to_frame();

        if self.held.is_none()
            && self.playout.pending() == 0
            && self.capture.is_empty()
            && self.transport.outbound_idle()
            && self.playback.is_empty()
        {
            self.drained_reported = true;
            log::debug!("Pipeline drained");
            self.control.drained.notify_one();
        }
    }
}

/// Completion signal returned by [`PipelineHandle::begin_drain`].
pub struct Drained(Arc<PipelineControl>);

impl Drained {
    pub async fn wait(&self) {
        self.0.drained.notified().await
    }
}

/// Owner's side of the pipeline thread.
pub struct PipelineHandle {
    control: Arc<PipelineControl>,
    thread: Option<JoinHandle<()>>,
}

impl PipelineHandle {
    /// Keep running, and report once every queue is empty and the downlink
    /// has gone quiet.
    pub fn begin_drain(&self) -> Drained {
        self.control.draining.store(true, Ordering::Release);
        Drained(self.control.clone())
    }

    /// Discard queued return audio (the user started talking).
    pub fn barge_in(&self) {
        self.control.barge_in.store(true, Ordering::Release);
    }

    /// Stop and join the thread. Idempotent.
    pub fn stop(&mut self) {
        self.control.running.store(false, Ordering::Release);
        if let Some(t) = self.thread.take() {
            if t.join().is_err() {
                log::error!("Pipeline thread panicked");
            }
        }
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
