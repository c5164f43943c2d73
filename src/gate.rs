//! Concurrency gate bounding how many engine processes run at once.
//!
//! The limit is global rather than per engine: the scarce resource is host
//! memory and CPU. Waiters poll with exponential backoff instead of a tight
//! loop, and a held slot is released when its guard drops, so an execution
//! that errors or panics can never leak a slot.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, trace};

/// First backoff delay when no slot is free.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Upper bound for the backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Fixed-size slot pool shared by every engine.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: Arc<AtomicUsize>,
    initial_backoff: Duration,
    max_backoff: Duration,
}

/// Ownership token for one running execution. Dropping it releases the slot.
#[derive(Debug)]
pub struct ConcurrencySlot {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for ConcurrencySlot {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencySlot {
    /// Release explicitly; equivalent to dropping the slot.
    pub fn release(self) {}
}

impl ConcurrencyGate {
    /// Create a gate with `capacity` slots (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_flight: Arc::new(AtomicUsize::new(0)),
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
        }
    }

    /// Override the backoff schedule (mainly for tests).
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently held.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Reserve a slot without waiting.
    pub fn try_acquire(&self) -> Option<ConcurrencySlot> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                Some(ConcurrencySlot {
                    _permit: permit,
                    in_flight: self.in_flight.clone(),
                })
            }
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => None,
        }
    }

    /// Wait until a slot is free, backing off 100ms → 200ms → … → 5s.
    pub async fn acquire(&self) -> ConcurrencySlot {
        let mut delay = self.initial_backoff;
        let mut attempts = 0u32;
        loop {
            if let Some(slot) = self.try_acquire() {
                if attempts > 0 {
                    debug!(attempts, in_flight = self.in_flight(), "acquired slot after waiting");
                }
                return slot;
            }
            attempts += 1;
            trace!(delay_ms = delay.as_millis() as u64, "all slots busy, backing off");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.max_backoff);
        }
    }

    /// Acquire a slot, run `fut`, and release the slot however `fut` ends.
    pub async fn run<F, T>(&self, fut: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let _slot = self.acquire().await;
        fut.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_capacity_is_clamped() {
        assert_eq!(ConcurrencyGate::new(0).capacity(), 1);
    }

    #[test]
    fn test_try_acquire_respects_capacity() {
        let gate = ConcurrencyGate::new(2);
        let a = gate.try_acquire().unwrap();
        let _b = gate.try_acquire().unwrap();
        assert!(gate.try_acquire().is_none());
        assert_eq!(gate.in_flight(), 2);

        a.release();
        assert_eq!(gate.in_flight(), 1);
        assert!(gate.try_acquire().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_with_backoff() {
        let gate = ConcurrencyGate::new(1);
        let held = gate.acquire().await;

        let waiter_gate = gate.clone();
        let waiter = tokio::spawn(async move {
            let _slot = waiter_gate.acquire().await;
            tokio::time::Instant::now()
        });

        let released_at = tokio::time::Instant::now() + Duration::from_millis(250);
        tokio::time::sleep(Duration::from_millis(250)).await;
        drop(held);

        let acquired_at = waiter.await.unwrap();
        // backoff schedule: 100ms, 200ms → next poll at 300ms
        assert!(acquired_at >= released_at);
        assert!(acquired_at - released_at <= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_never_exceeds_capacity_under_contention() {
        let gate = ConcurrencyGate::new(3).with_backoff(Duration::from_millis(1), Duration::from_millis(5));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..20 {
            let gate = gate.clone();
            let current = current.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                gate.run(async {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    if i % 4 == 0 {
                        Err::<(), &str>("engine blew up")
                    } else {
                        Ok(())
                    }
                })
                .await
            }));
        }
        for handle in handles {
            let _ = handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_slot_released_when_task_panics() {
        let gate = ConcurrencyGate::new(1);
        let panicking_gate = gate.clone();
        let result = tokio::spawn(async move {
            let _slot = panicking_gate.acquire().await;
            panic!("engine task crashed");
        })
        .await;
        assert!(result.is_err());
        assert_eq!(gate.in_flight(), 0);
        assert!(gate.try_acquire().is_some());
    }
}
