use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Concurrency gate for top-level ingestion: one permit per in-flight message,
/// sized by the channel's processing budget. Always bounded.
#[derive(Clone)]
pub struct BackpressureController {
    semaphore: Arc<Semaphore>,
    metrics: Arc<ControllerMetrics>,
}

impl BackpressureController {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            metrics: Arc::new(ControllerMetrics {
                limit,
                throttled: AtomicU64::new(0),
                inflight: AtomicU64::new(0),
            }),
        }
    }

    pub async fn acquire(&self) -> BackpressurePermit {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => self.admit(permit),
            Err(_) => {
                self.metrics.throttled.fetch_add(1, Ordering::Relaxed);
                let permit = self
                    .semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("ingestion semaphore closed");
                self.admit(permit)
            }
        }
    }

    pub fn try_acquire_now(&self) -> Option<BackpressurePermit> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Some(self.admit(permit)),
            Err(_) => {
                self.metrics.throttled.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Resolves once every outstanding permit has been released. Callers
    /// quiesce producers first; an acquisition racing this call may still be
    /// admitted ahead of it.
    pub async fn wait_idle(&self) {
        let _all = self
            .semaphore
            .acquire_many(self.metrics.limit as u32)
            .await
            .expect("ingestion semaphore closed");
    }

    fn admit(&self, permit: OwnedSemaphorePermit) -> BackpressurePermit {
        self.metrics.inflight.fetch_add(1, Ordering::Relaxed);
        BackpressurePermit {
            _inner: permit,
            metrics: Arc::clone(&self.metrics),
        }
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            limit: self.metrics.limit,
            inflight: self.metrics.inflight.load(Ordering::Relaxed),
            throttled: self.metrics.throttled.load(Ordering::Relaxed),
        }
    }
}

pub struct BackpressurePermit {
    _inner: OwnedSemaphorePermit,
    metrics: Arc<ControllerMetrics>,
}

impl Drop for BackpressurePermit {
    fn drop(&mut self) {
        self.metrics.inflight.fetch_sub(1, Ordering::Relaxed);
    }
}

struct ControllerMetrics {
    limit: usize,
    throttled: AtomicU64,
    inflight: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct ControllerSnapshot {
    pub limit: usize,
    pub inflight: u64,
    pub throttled: u64,
}

impl ControllerSnapshot {
    pub fn saturated(&self) -> bool {
        self.inflight >= self.limit as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permits_are_bounded_and_released_on_drop() {
        let controller = BackpressureController::new(2);
        let first = controller.acquire().await;
        let second = controller.acquire().await;
        assert!(controller.try_acquire_now().is_none());
        assert!(controller.snapshot().saturated());

        drop(first);
        let third = controller.try_acquire_now();
        assert!(third.is_some());

        drop(second);
        drop(third);
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.inflight, 0);
        assert!(snapshot.throttled >= 1);
    }

    #[test]
    fn zero_limit_is_clamped_to_one() {
        let controller = BackpressureController::new(0);
        assert_eq!(controller.snapshot().limit, 1);
    }

    #[tokio::test]
    async fn wait_idle_waits_for_outstanding_permits() {
        let controller = BackpressureController::new(1);
        controller.wait_idle().await;

        let permit = controller.acquire().await;
        let waiter = tokio::spawn({
            let controller = controller.clone();
            async move { controller.wait_idle().await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(permit);
        waiter.await.expect("wait_idle task panicked");
    }
}
