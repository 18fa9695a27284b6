//! Bounded pool for fire-and-forget deliveries.
//!
//! Callers hand off work they do not want to wait on (mostly email sends).
//! At most `capacity` tasks run at once; `submit` waits for a free slot, which
//! applies backpressure to bursts instead of letting them reach the provider
//! unbounded. Every task runs inside a log-and-continue boundary.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Semaphore;

#[derive(Clone)]
pub struct DeliveryPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    panicked: Arc<AtomicU64>,
}

impl DeliveryPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            panicked: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawn `work` once a slot is free. The slot is held until `work` finishes.
    pub async fn submit<F>(&self, label: &'static str, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!(task = label, "Delivery pool closed, dropping task");
                return;
            }
        };

        let panicked = self.panicked.clone();
        tokio::spawn(async move {
            // A panicking delivery must not take the slot with it.
            if let Err(e) = tokio::spawn(work).await {
                panicked.fetch_add(1, Ordering::Relaxed);
                tracing::error!(task = label, error = %e, "Delivery task aborted");
            }
            drop(permit);
        });
    }

    /// Wait until every submitted task has finished.
    pub async fn drain(&self) {
        if let Ok(all) = self.semaphore.acquire_many(self.capacity as u32).await {
            drop(all);
        }
    }

    /// Number of tasks currently running.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    /// Number of tasks that panicked since start.
    pub fn panicked(&self) -> u64 {
        self.panicked.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_drain_waits_for_tasks() {
        let pool = DeliveryPool::new(2);
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let done = done.clone();
            pool.submit("test", async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                done.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        }

        pool.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = DeliveryPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            pool.submit("test", async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            })
            .await;
        }

        pool.drain().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_panic_releases_slot() {
        let pool = DeliveryPool::new(1);
        pool.submit("boom", async { panic!("delivery exploded") }).await;
        pool.drain().await;

        assert_eq!(pool.panicked(), 1);
        assert_eq!(pool.in_flight(), 0);
    }
}
