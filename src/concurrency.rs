//! Counting permit pool bounding how many jobs are in flight at once.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug)]
pub struct ConcurrencyController {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

/// A held concurrency slot. Dropping it returns the slot to the pool, so the
/// slot comes back even if the job errors, panics or is cancelled.
#[derive(Debug)]
pub struct Slot {
    _permit: OwnedSemaphorePermit,
}

impl Slot {
    /// Returns the slot to the pool.
    pub fn release(self) {}
}

impl ConcurrencyController {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Waits for a free slot. Returns `None` once the controller is closed.
    pub async fn acquire_slot(&self) -> Option<Slot> {
        let permit = Arc::clone(&self.semaphore).acquire_owned().await.ok()?;
        Some(Slot { _permit: permit })
    }

    /// Refuses all further acquisitions, waking current waiters with `None`.
    /// Slots already handed out keep working until released.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Slots currently held.
    pub fn in_flight(&self) -> usize {
        self.limit - self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn slots_are_counted_and_released() {
        let slots = ConcurrencyController::new(2);
        let a = slots.acquire_slot().await.unwrap();
        let b = slots.acquire_slot().await.unwrap();
        assert_eq!(slots.in_flight(), 2);

        a.release();
        assert_eq!(slots.in_flight(), 1);
        drop(b);
        assert_eq!(slots.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn never_more_than_limit_in_flight() {
        let slots = Arc::new(ConcurrencyController::new(3));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..20u64 {
            let slot = slots.acquire_slot().await.unwrap();
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10 + i % 4 * 5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                slot.release();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(slots.in_flight(), 0);
    }

    #[tokio::test]
    async fn slot_released_when_task_panics() {
        let slots = ConcurrencyController::new(1);
        let slot = slots.acquire_slot().await.unwrap();

        let result = tokio::spawn(async move {
            let _slot = slot;
            panic!("job blew up");
        })
        .await;

        assert!(result.is_err());
        assert_eq!(slots.in_flight(), 0);
    }

    #[tokio::test]
    async fn closed_controller_refuses_slots() {
        let slots = ConcurrencyController::new(1);
        let held = slots.acquire_slot().await.unwrap();
        slots.close();
        assert!(slots.acquire_slot().await.is_none());
        held.release();
    }
}
