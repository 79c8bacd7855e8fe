//! Non-pooled creation throttle.
//!
//! Every non-pooled (completion-handle) open is assigned to one of a fixed
//! number of slots; creations sharing a slot run strictly one after another,
//! capping concurrent non-pooled opens at the slot count without any queue
//! bookkeeping of its own.

use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;

type CreationSlot = Shared<BoxFuture<'static, ()>>;

pub(crate) struct NonPooledThrottle {
    slots: Mutex<Vec<Option<CreationSlot>>>,
    next: AtomicUsize,
}

impl NonPooledThrottle {
    pub(crate) fn new(slot_count: usize) -> Self {
        let slot_count = slot_count.max(1);
        Self {
            slots: Mutex::new((0..slot_count).map(|_| None).collect()),
            next: AtomicUsize::new(0),
        }
    }

    /// Schedule one creation.
    ///
    /// Prefers an empty or finished slot; when all are busy, rotates through
    /// them round-robin. The new creation awaits the slot's current occupant
    /// before running and then becomes the occupant itself, so creations in
    /// one slot serialize. Returns immediately; the creation runs on its own
    /// task and reports through whatever channel `create` carries.
    pub(crate) fn schedule<F>(&self, create: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = {
            let mut slots = self.slots.lock();
            let index = slots
                .iter()
                .position(|slot| slot.as_ref().is_none_or(|f| f.peek().is_some()))
                .unwrap_or_else(|| self.next.fetch_add(1, Ordering::Relaxed) % slots.len());
            // A finished occupant resolves instantly when awaited.
            let predecessor = slots[index].take();
            let task: CreationSlot = async move {
                if let Some(previous) = predecessor {
                    previous.await;
                }
                create.await;
            }
            .boxed()
            .shared();
            slots[index] = Some(task.clone());
            tracing::trace!(slot = index, "scheduled non-pooled creation");
            task
        };
        tokio::spawn(task);
    }
}

impl std::fmt::Debug for NonPooledThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonPooledThrottle")
            .field("slots", &self.slots.lock().len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    /// Tracks how many creations run at once.
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
        done: AtomicUsize,
    }

    impl Gauge {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                done: AtomicUsize::new(0),
            })
        }

        async fn run(self: Arc<Self>) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            self.done.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_slot_count_caps_concurrency() {
        let throttle = NonPooledThrottle::new(2);
        let gauge = Gauge::new();

        for _ in 0..3 {
            throttle.schedule(Arc::clone(&gauge).run());
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(gauge.done.load(Ordering::SeqCst), 3);
        assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_finished_slot_is_reused_without_waiting() {
        let throttle = NonPooledThrottle::new(1);
        let gauge = Gauge::new();

        throttle.schedule(Arc::clone(&gauge).run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(gauge.done.load(Ordering::SeqCst), 1);

        throttle.schedule(Arc::clone(&gauge).run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(gauge.done.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_slots_clamped_to_one() {
        let throttle = NonPooledThrottle::new(0);
        let gauge = Gauge::new();

        throttle.schedule(Arc::clone(&gauge).run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(gauge.done.load(Ordering::SeqCst), 1);
    }
}
