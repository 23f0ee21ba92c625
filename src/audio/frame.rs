//! Audio frames and the recycled buffer pool behind them.

use crossbeam_channel::{Receiver, Sender, bounded};

/// One fixed-size block of interleaved 16-bit PCM.
///
/// Frames are immutable once built and move between stages by value; the
/// sample buffer goes back to a [`FramePool`] when the last stage is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    seq: u64,
    timestamp_us: u64,
    channels: u16,
    filler: bool,
    samples: Vec<i16>,
}

impl AudioFrame {
    pub fn new(seq: u64, timestamp_us: u64, channels: u16, samples: Vec<i16>) -> Self {
        Self {
            seq,
            timestamp_us,
            channels,
            filler: false,
            samples,
        }
    }

    /// Zero-filled frame standing in for a missing sequence number.
    pub fn silence(seq: u64, timestamp_us: u64, channels: u16, len: usize) -> Self {
        Self {
            seq,
            timestamp_us,
            channels,
            filler: true,
            samples: vec![0; len],
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Microseconds since session start.
    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Samples per channel.
    pub fn frame_len(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// True for silence inserted by the playout sequencer.
    pub fn is_filler(&self) -> bool {
        self.filler
    }

    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }
}

/// Pool of pre-allocated sample buffers.
///
/// The capture context takes buffers and the playback context returns them,
/// so steady-state operation never allocates on a hardware thread.
#[derive(Debug, Clone)]
pub struct FramePool {
    frame_samples: usize,
    tx: Sender<Vec<i16>>,
    rx: Receiver<Vec<i16>>,
}

impl FramePool {
    /// Pool of `slots` buffers of `frame_samples` interleaved samples each.
    pub fn new(frame_samples: usize, slots: usize) -> Self {
        let (tx, rx) = bounded(slots.max(1));
        for _ in 0..slots {
            let _ = tx.try_send(vec![0i16; frame_samples]);
        }
        Self {
            frame_samples,
            tx,
            rx,
        }
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Take a buffer sized to one frame. The second value is true when the
    /// pool was empty and a fresh buffer had to be allocated.
    pub fn acquire(&self) -> (Vec<i16>, bool) {
        match self.rx.try_recv() {
            Ok(buf) => (buf, false),
            Err(_) => (vec![0i16; self.frame_samples], true),
        }
    }

    /// Return a frame's buffer. Buffers of the wrong size, or beyond the pool
    /// capacity, are simply dropped.
    pub fn release(&self, frame: AudioFrame) {
        let buf = frame.into_samples();
        if buf.len() == self.frame_samples {
            let _ = self.tx.try_send(buf);
        }
    }

    /// Buffers currently idle in the pool.
    pub fn available(&self) -> usize {
        self.rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_accessors() {
        let frame = AudioFrame::new(3, 60_000, 2, vec![1, 2, 3, 4]);
        assert_eq!(frame.seq(), 3);
        assert_eq!(frame.timestamp_us(), 60_000);
        assert_eq!(frame.frame_len(), 2);
        assert!(!frame.is_filler());
    }

    #[test]
    fn silence_is_zeroed_filler() {
        let frame = AudioFrame::silence(9, 0, 1, 480);
        assert!(frame.is_filler());
        assert!(frame.samples().iter().all(|&s| s == 0));
        assert_eq!(frame.frame_len(), 480);
    }

    #[test]
    fn pool_recycles_buffers() {
        let pool = FramePool::new(4, 2);
        assert_eq!(pool.available(), 2);

        let (a, miss_a) = pool.acquire();
        let (_b, miss_b) = pool.acquire();
        let (_c, miss_c) = pool.acquire();
        assert!(!miss_a && !miss_b);
        assert!(miss_c, "third acquire exceeds the pool");

        pool.release(AudioFrame::new(0, 0, 1, a));
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn pool_ignores_foreign_sizes() {
        let pool = FramePool::new(4, 1);
        let _ = pool.acquire();
        pool.release(AudioFrame::new(0, 0, 1, vec![0; 3]));
        assert_eq!(pool.available(), 0);
    }
}
