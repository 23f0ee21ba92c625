//! Fixed-capacity single-producer/single-consumer frame queue.
//!
//! Backed by a bounded `crossbeam-channel` (array flavour: slots are
//! allocated once, push/pop are lock-free). The producer also holds a
//! receiving handle so that under [`OverflowPolicy::DropOldest`] it can evict
//! the head itself; eviction always removes the oldest queued frame.
//!
//! The two halves are not `Clone`: exactly one stage pushes and one pops.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TryIter, TrySendError, bounded};

use super::frame::{AudioFrame, FramePool};
use crate::config::OverflowPolicy;
use crate::error::BufferError;

#[derive(Debug)]
struct Shared {
    capacity: usize,
    drops: AtomicU64,
}

/// Outcome of [`RingProducer::offer`].
#[derive(Debug)]
pub enum Offer {
    Queued,
    /// Ring full under the drop policy; the frame comes back untouched.
    Full(AudioFrame),
    /// Block policy waited out its timeout; the frame comes back untouched.
    TimedOut(AudioFrame),
    Closed,
}

/// Producer half.
#[derive(Debug)]
pub struct RingProducer {
    tx: Sender<AudioFrame>,
    evict: Receiver<AudioFrame>,
    policy: OverflowPolicy,
    recycle: Option<FramePool>,
    shared: Arc<Shared>,
}

/// Consumer half.
#[derive(Debug)]
pub struct RingConsumer {
    rx: Receiver<AudioFrame>,
    shared: Arc<Shared>,
}

/// Create a matched producer/consumer pair.
///
/// `capacity` must be at least 1 (validated by `SessionConfig`); 0 is bumped to 1
/// since a zero-capacity channel would be a rendezvous.
pub fn ring_buffer(capacity: usize, policy: OverflowPolicy) -> (RingProducer, RingConsumer) {
    let capacity = capacity.max(1);
    let (tx, rx) = bounded(capacity);
    let shared = Arc::new(Shared {
        capacity,
        drops: AtomicU64::new(0),
    });
    (
        RingProducer {
            tx,
            evict: rx.clone(),
            policy,
            recycle: None,
            shared: shared.clone(),
        },
        RingConsumer { rx, shared },
    )
}

impl RingProducer {
    /// Return evicted or timed-out frames to `pool` instead of freeing them.
    pub fn with_recycling(mut self, pool: FramePool) -> Self {
        self.recycle = Some(pool);
        self
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Queue a frame.
    ///
    /// Drop policy: never waits. Returns `Ok(false)` when the buffer was full
    /// and the oldest frame was discarded to make room.
    /// Block policy: waits up to the timeout, then discards `frame` and fails
    /// with [`BufferError::BufferTimeout`]. Both cases bump the drop count.
    pub fn push(&self, frame: AudioFrame) -> Result<bool, BufferError> {
        match self.policy {
            OverflowPolicy::DropOldest => Ok(self.push_drop_oldest(frame)),
            OverflowPolicy::Block { timeout } => self.push_blocking(frame, timeout),
        }
    }

    /// Queue a frame without discarding anything.
    ///
    /// For producers that can hold on to their own backlog: a full ring hands
    /// the frame back instead of evicting, immediately under the drop policy
    /// and after the configured wait under the block policy.
    pub fn offer(&self, frame: AudioFrame) -> Offer {
        let sent = match self.policy {
            OverflowPolicy::DropOldest => self.tx.try_send(frame).map_err(|e| match e {
                TrySendError::Full(back) => Offer::Full(back),
                TrySendError::Disconnected(back) => {
                    self.recycle(back);
                    Offer::Closed
                }
            }),
            OverflowPolicy::Block { timeout } => {
                self.tx.send_timeout(frame, timeout).map_err(|e| match e {
                    SendTimeoutError::Timeout(back) => Offer::TimedOut(back),
                    SendTimeoutError::Disconnected(back) => {
                        self.recycle(back);
                        Offer::Closed
                    }
                })
            }
        };
        match sent {
            Ok(()) => Offer::Queued,
            Err(offer) => offer,
        }
    }

    fn push_drop_oldest(&self, mut frame: AudioFrame) -> bool {
        let mut clean = true;
        // Each round either succeeds or evicts one frame; the consumer can only
        // make more room, so this terminates within capacity + 1 rounds.
        for _ in 0..=self.shared.capacity {
            match self.tx.try_send(frame) {
                Ok(()) => return clean,
                Err(TrySendError::Full(back)) => {
                    frame = back;
                    if let Ok(oldest) = self.evict.try_recv() {
                        self.shared.drops.fetch_add(1, Ordering::Relaxed);
                        self.recycle(oldest);
                        clean = false;
                    }
                }
                Err(TrySendError::Disconnected(back)) => {
                    self.recycle(back);
                    return false;
                }
            }
        }
        self.shared.drops.fetch_add(1, Ordering::Relaxed);
        self.recycle(frame);
        false
    }

    fn push_blocking(&self, frame: AudioFrame, timeout: Duration) -> Result<bool, BufferError> {
        match self.tx.send_timeout(frame, timeout) {
            Ok(()) => Ok(true),
            Err(SendTimeoutError::Timeout(back)) => {
                self.shared.drops.fetch_add(1, Ordering::Relaxed);
                self.recycle(back);
                Err(BufferError::BufferTimeout(timeout))
            }
            Err(SendTimeoutError::Disconnected(back)) => {
                self.recycle(back);
                Err(BufferError::Disconnected)
            }
        }
    }

    fn recycle(&self, frame: AudioFrame) {
        if let Some(pool) = &self.recycle {
            pool.release(frame);
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn drops(&self) -> u64 {
        self.shared.drops.load(Ordering::Relaxed)
    }
}

impl RingConsumer {
    pub fn pop(&self) -> Option<AudioFrame> {
        self.rx.try_recv().ok()
    }

    /// Wait at most `timeout` for a frame.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<AudioFrame> {
        if timeout.is_zero() {
            return self.pop();
        }
        self.rx.recv_timeout(timeout).ok()
    }

    /// Remove everything currently queued.
    pub fn drain(&self) -> TryIter<'_, AudioFrame> {
        self.rx.try_iter()
    }

    /// Discard everything queued, returning how many frames were dropped.
    pub fn clear(&self) -> usize {
        self.drain().count()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn drops(&self) -> u64 {
        self.shared.drops.load(Ordering::Relaxed)
    }
}
