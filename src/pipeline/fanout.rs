//! Ingestion-side staging buffer plus per-client queues for broadcast.
//!
//! Every ingested frame goes into the staging `FrameBuffer` and, when
//! anyone subscribed, into each subscriber's own bounded queue. Frame planes
//! are reference counted, so a clone costs a few atomic increments rather
//! than a copy.
//!
//! `publish` and `subscribe` hold the subscriber lock across both the staging
//! buffer and the subscriber list, so a new subscriber's backlog and the
//! frames published to it afterwards never leave a gap.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::ringbuf::FrameBuffer;
use crate::capture::NormalizedFrame;

pub struct FanOut {
    staging: Arc<FrameBuffer>,
    subscribers: Mutex<Vec<(u64, Arc<FrameBuffer>)>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

/// Evictions caused by one `publish`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Published {
    /// The staging buffer dropped its oldest frame
    pub staged_evicted: bool,
    /// Subscriber queues that dropped their oldest frame
    pub dedicated_evicted: usize,
}

impl FanOut {
    pub fn new(staging: Arc<FrameBuffer>, queue_capacity: usize) -> Self {
        Self {
            staging,
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            queue_capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(u64, Arc<FrameBuffer>)>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn staging(&self) -> &Arc<FrameBuffer> {
        &self.staging
    }

    /// Register a new queue, pre-filled with the frames currently staged.
    ///
    /// The queue is removed again when the returned `Subscription` is dropped.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let queue = Arc::new(FrameBuffer::new(self.queue_capacity));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut subscribers = self.lock();
        for frame in self.staging.snapshot() {
            queue.push(frame);
        }
        subscribers.push((id, Arc::clone(&queue)));
        drop(subscribers);

        Subscription {
            id,
            queue,
            fanout: Arc::clone(self),
        }
    }

    /// Stage `frame` and push a clone to every subscriber
    pub fn publish(&self, frame: NormalizedFrame) -> Published {
        let mut evicted = Vec::new();
        let mut published = Published::default();

        let subscribers = self.lock();
        for (_, queue) in subscribers.iter() {
            if let Some(old) = queue.push(frame.clone()) {
                published.dedicated_evicted += 1;
                evicted.push(old);
            }
        }
        if let Some(old) = self.staging.push(frame) {
            published.staged_evicted = true;
            evicted.push(old);
        }
        drop(subscribers);

        // Evicted frames are released here, outside the lock
        drop(evicted);
        published
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn unsubscribe(&self, id: u64) {
        self.lock().retain(|(sub_id, _)| *sub_id != id);
    }
}

/// A registered per-client queue
pub struct Subscription {
    id: u64,
    queue: Arc<FrameBuffer>,
    fanout: Arc<FanOut>,
}

impl Subscription {
    pub fn queue(&self) -> &Arc<FrameBuffer> {
        &self.queue
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.fanout.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn frame(id: u32) -> NormalizedFrame {
        NormalizedFrame {
            timestamp_us: 0,
            frame_id: id,
            depth: None,
            rgb: None,
            ir: None,
        }
    }

    fn fanout(staging: usize, queues: usize) -> Arc<FanOut> {
        Arc::new(FanOut::new(Arc::new(FrameBuffer::new(staging)), queues))
    }

    fn drain(queue: &FrameBuffer) -> Vec<u32> {
        std::iter::from_fn(|| queue.try_pop())
            .map(|f| f.frame_id)
            .collect()
    }

    #[test]
    fn every_subscriber_sees_every_frame() {
        let fanout = fanout(10, 10);
        let a = fanout.subscribe();
        let b = fanout.subscribe();

        for id in 1..=3 {
            fanout.publish(frame(id));
        }

        for sub in [&a, &b] {
            assert_eq!(drain(sub.queue()), vec![1, 2, 3]);
        }
        assert_eq!(drain(fanout.staging()), vec![1, 2, 3]);
    }

    #[test]
    fn staged_frames_seed_new_queue() {
        let fanout = fanout(10, 10);
        fanout.publish(frame(7));
        fanout.publish(frame(8));

        let sub = fanout.subscribe();
        fanout.publish(frame(9));

        assert_eq!(drain(sub.queue()), vec![7, 8, 9]);
    }

    #[test]
    fn dropping_subscription_unregisters() {
        let fanout = fanout(10, 10);
        let a = fanout.subscribe();
        let b = fanout.subscribe();
        assert_eq!(fanout.subscriber_count(), 2);

        drop(a);
        assert_eq!(fanout.subscriber_count(), 1);
        drop(b);
        assert_eq!(fanout.subscriber_count(), 0);
    }

    #[test]
    fn slow_subscriber_evicts_independently() {
        let fanout = fanout(10, 2);
        let slow = fanout.subscribe();
        let fast = fanout.subscribe();

        let mut evicted = 0;
        for id in 1..=3 {
            let published = fanout.publish(frame(id));
            assert!(!published.staged_evicted);
            evicted += published.dedicated_evicted;
            fast.queue().try_pop();
        }

        assert_eq!(evicted, 1);
        assert_eq!(slow.queue().len(), 2);
        assert!(fast.queue().is_empty());
    }

    #[test]
    fn staging_eviction_is_reported_separately() {
        let fanout = fanout(2, 10);
        let _sub = fanout.subscribe();

        assert_eq!(fanout.publish(frame(1)), Published::default());
        fanout.publish(frame(2));
        let published = fanout.publish(frame(3));
        assert!(published.staged_evicted);
        assert_eq!(published.dedicated_evicted, 0);
    }

    #[test]
    fn subscribing_during_publish_leaves_no_gap() {
        const FRAMES: u32 = 2000;
        let fanout = fanout(FRAMES as usize, FRAMES as usize);

        let publisher = {
            let fanout = Arc::clone(&fanout);
            thread::spawn(move || {
                for id in 1..=FRAMES {
                    fanout.publish(frame(id));
                }
            })
        };

        let subs: Vec<Subscription> = (0..20)
            .map(|_| {
                thread::yield_now();
                fanout.subscribe()
            })
            .collect();
        publisher.join().unwrap();

        for sub in &subs {
            assert_eq!(drain(sub.queue()), (1..=FRAMES).collect::<Vec<_>>());
        }
    }
}
