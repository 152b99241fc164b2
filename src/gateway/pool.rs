//! Native call concurrency control
//!
//! Two independent permit pools, one per [`Priority`]. Background prefetch
//! can saturate its own pool without ever delaying a foreground request.
//!
//! A background request that a foreground caller attaches to is *promoted*:
//! if it is still waiting for a background permit it switches to the
//! foreground pool instead.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use super::types::Priority;
use crate::error::{AccelError, Result};

/// Promotion signal shared between an in-flight request and its waiters
#[derive(Debug, Default)]
pub(crate) struct PriorityHint {
    promoted: AtomicBool,
    notify: Notify,
}

impl PriorityHint {
    pub fn new(priority: Priority) -> Self {
        Self {
            promoted: AtomicBool::new(priority == Priority::Foreground),
            notify: Notify::new(),
        }
    }

    pub fn promote(&self) {
        if !self.promoted.swap(true, Ordering::AcqRel) {
            // notify_one stores a permit if nobody is waiting yet
            self.notify.notify_one();
        }
    }

    pub fn is_foreground(&self) -> bool {
        self.promoted.load(Ordering::Acquire)
    }
}

/// Permit held for the duration of one native execution
pub(crate) struct WorkerPermit {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl Drop for WorkerPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Pool utilization snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub foreground_capacity: usize,
    pub background_capacity: usize,
    /// Native executions currently holding a permit
    pub active: usize,
}

pub(crate) struct WorkerPool {
    foreground: Arc<Semaphore>,
    background: Arc<Semaphore>,
    foreground_capacity: usize,
    background_capacity: usize,
    active: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(foreground: usize, background: usize) -> Self {
        let foreground = foreground.max(1);
        let background = background.max(1);
        Self {
            foreground: Arc::new(Semaphore::new(foreground)),
            background: Arc::new(Semaphore::new(background)),
            foreground_capacity: foreground,
            background_capacity: background,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for a permit in the pool matching the hint's current priority
    pub async fn acquire(&self, hint: &PriorityHint) -> Result<WorkerPermit> {
        let permit = if hint.is_foreground() {
            self.foreground.clone().acquire_owned().await
        } else {
            tokio::select! {
                permit = self.background.clone().acquire_owned() => permit,
                _ = hint.notify.notified() => self.foreground.clone().acquire_owned().await,
            }
        };
        let permit =
            permit.map_err(|_| AccelError::Unavailable("worker pool closed".to_string()))?;

        self.active.fetch_add(1, Ordering::Relaxed);
        Ok(WorkerPermit {
            _permit: permit,
            active: self.active.clone(),
        })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            foreground_capacity: self.foreground_capacity,
            background_capacity: self.background_capacity,
            active: self.active.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_foreground_not_blocked_by_background() {
        let pool = WorkerPool::new(1, 1);
        let background = PriorityHint::new(Priority::Background);
        let _held = pool.acquire(&background).await.unwrap();

        let foreground = PriorityHint::new(Priority::Foreground);
        let permit = tokio::time::timeout(Duration::from_millis(100), pool.acquire(&foreground))
            .await
            .expect("foreground permit should be immediate");
        assert!(permit.is_ok());
        assert_eq!(pool.stats().active, 2);
    }

    #[tokio::test]
    async fn test_promotion_moves_waiter_to_foreground_pool() {
        let pool = Arc::new(WorkerPool::new(1, 1));
        let _held = pool.acquire(&PriorityHint::new(Priority::Background)).await.unwrap();

        let hint = Arc::new(PriorityHint::new(Priority::Background));
        let waiter = {
            let pool = pool.clone();
            let hint = hint.clone();
            tokio::spawn(async move { pool.acquire(&hint).await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        hint.promote();
        let result = tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .expect("promoted waiter should get a foreground permit");
        assert!(result.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_permit_release_updates_stats() {
        let pool = WorkerPool::new(2, 1);
        {
            let _permit = pool.acquire(&PriorityHint::new(Priority::Foreground)).await.unwrap();
            assert_eq!(pool.stats().active, 1);
        }
        assert_eq!(pool.stats().active, 0);
    }
}
