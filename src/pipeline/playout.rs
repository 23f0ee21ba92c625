//! Ordering and framing helpers: sequence checks on the return path, and
//! re-chunking of resampled audio into fixed frames.

use std::collections::VecDeque;
use std::ops::Range;

use crate::audio::AudioFrame;

/// What to do with a frame arriving at the playout point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Play it, after silence for every sequence number in `fill`.
    Play { fill: Range<u64> },
    /// The gap is larger than the buffer could hold; play it without filling.
    Resync { skipped: u64 },
    /// At or behind the playout point; discard.
    Late,
}

/// Keeps forwarded playback sequence numbers strictly increasing.
#[derive(Debug, Clone)]
pub struct PlayoutSequencer {
    last: Option<u64>,
    max_fill: u64,
}

impl PlayoutSequencer {
    /// `max_fill` bounds the silence inserted for a single gap; normally
    /// the playback ring capacity.
    pub fn new(max_fill: usize) -> Self {
        Self {
            last: None,
            max_fill: max_fill as u64,
        }
    }

    pub fn last(&self) -> Option<u64> {
        self.last
    }

    pub fn admit(&mut self, seq: u64) -> Admission {
        let Some(last) = self.last else {
            self.last = Some(seq);
            return Admission::Play { fill: seq..seq };
        };
        if seq <= last {
            return Admission::Late;
        }
        self.last = Some(seq);
        let gap = seq - last - 1;
        if gap > self.max_fill {
            Admission::Resync { skipped: gap }
        } else {
            Admission::Play {
                fill: last + 1..seq,
            }
        }
    }
}

/// Cuts an arbitrary-length sample stream into fixed frames and numbers them.
///
/// Silence inserted with [`Reframer::push_silence`] is remembered by stream
/// position, so a frame made only of it comes out as a filler frame.
#[derive(Debug)]
pub struct Reframer {
    frame_samples: usize,
    channels: u16,
    pending: VecDeque<i16>,
    /// Stream position of `pending[0]`.
    head: u64,
    filler: VecDeque<Range<u64>>,
    next_seq: u64,
}

impl Reframer {
    /// `frame_samples` counts interleaved samples.
    pub fn new(frame_samples: usize, channels: u16) -> Self {
        Self {
            frame_samples,
            channels,
            pending: VecDeque::with_capacity(frame_samples * 2),
            head: 0,
            filler: VecDeque::new(),
            next_seq: 0,
        }
    }

    fn tail(&self) -> u64 {
        self.head + self.pending.len() as u64
    }

    pub fn push(&mut self, pcm: &[i16]) {
        self.pending.extend(pcm);
    }

    /// Append `n` zero samples standing in for lost audio.
    pub fn push_silence(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        let start = self.tail();
        let end = start + n as u64;
        match self.filler.back_mut() {
            Some(span) if span.end == start => span.end = end,
            _ => self.filler.push_back(start..end),
        }
        self.pending.extend(std::iter::repeat_n(0, n));
    }

    /// Complete a trailing partial frame with zeros.
    pub fn pad_to_frame(&mut self) {
        if self.frame_samples == 0 {
            return;
        }
        let rem = self.pending.len() % self.frame_samples;
        if rem != 0 {
            self.pending
                .extend(std::iter::repeat_n(0, self.frame_samples - rem));
        }
    }

    /// Next complete frame, if enough samples are buffered.
    pub fn next_frame(&mut self, timestamp_us: u64) -> Option<AudioFrame> {
        if self.frame_samples == 0 || self.pending.len() < self.frame_samples {
            return None;
        }
        let span = self.head..self.head + self.frame_samples as u64;
        let filler = self
            .filler
            .iter()
            .any(|f| f.start <= span.start && f.end >= span.end);
        let samples: Vec<i16> = self.pending.drain(..self.frame_samples).collect();
        self.head = span.end;
        while self.filler.front().is_some_and(|f| f.end <= span.end) {
            self.filler.pop_front();
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        Some(if filler {
            AudioFrame::silence(seq, timestamp_us, self.channels, samples.len())
        } else {
            AudioFrame::new(seq, timestamp_us, self.channels, samples)
        })
    }

    /// Samples waiting to be cut.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Drop buffered samples (barge-in). Numbering continues.
    pub fn reset(&mut self) {
        self.head = self.tail();
        self.pending.clear();
        self.filler.clear();
    }
}
