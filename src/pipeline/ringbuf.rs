//! Bounded drop-oldest frame queue shared between ingestion and senders

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

use crate::capture::NormalizedFrame;

/// Default number of frames retained before the oldest is evicted
pub const DEFAULT_CAPACITY: usize = 10;

/// Mutex-guarded FIFO of frames with drop-oldest eviction.
///
/// `push` never blocks and never rejects; when full the head is evicted first.
/// Consumers either poll with `try_pop` or wait on `pop_timeout`.
pub struct FrameBuffer {
    ring: Mutex<HeapRb<NormalizedFrame>>,
    available: Condvar,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_pushed: AtomicUsize,
    frames_popped: AtomicUsize,
    frames_evicted: AtomicUsize,
}

/// Counter snapshot of a `FrameBuffer`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub pushed: usize,
    pub popped: usize,
    pub evicted: usize,
}

impl FrameBuffer {
    /// Capacity of zero is raised to one
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(HeapRb::new(capacity.max(1))),
            available: Condvar::new(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HeapRb<NormalizedFrame>> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Producer: append a frame, evicting the oldest when full.
    ///
    /// The evicted frame is handed back so it is dropped outside the lock.
    pub fn push(&self, frame: NormalizedFrame) -> Option<NormalizedFrame> {
        let evicted = self.lock().push_overwrite(frame);
        self.available.notify_one();

        self.stats.frames_pushed.fetch_add(1, Ordering::Relaxed);
        if evicted.is_some() {
            self.stats.frames_evicted.fetch_add(1, Ordering::Relaxed);
        }
        evicted
    }

    /// Consumer: take the oldest frame, or `None` when empty
    pub fn try_pop(&self) -> Option<NormalizedFrame> {
        let frame = self.lock().try_pop();
        if frame.is_some() {
            self.stats.frames_popped.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    /// Consumer: wait up to `timeout` for a frame to become available
    pub fn pop_timeout(&self, timeout: Duration) -> Option<NormalizedFrame> {
        let guard = self.lock();
        let (mut ring, _) = self
            .available
            .wait_timeout_while(guard, timeout, |ring| ring.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        let frame = ring.try_pop();
        drop(ring);

        if frame.is_some() {
            self.stats.frames_popped.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    pub fn len(&self) -> usize {
        self.lock().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity().get()
    }

    /// Drop every retained frame, returning how many were removed
    pub fn clear(&self) -> usize {
        let drained: Vec<NormalizedFrame> = self.lock().pop_iter().collect();
        drained.len()
    }

    /// Clones of the retained frames, oldest first
    pub fn snapshot(&self) -> Vec<NormalizedFrame> {
        self.lock().iter().cloned().collect()
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            pushed: self.stats.frames_pushed.load(Ordering::Relaxed),
            popped: self.stats.frames_popped.load(Ordering::Relaxed),
            evicted: self.stats.frames_evicted.load(Ordering::Relaxed),
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
