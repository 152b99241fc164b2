//! In-flight request table
//!
//! At most one pending execution exists per [`CacheKey`]. A caller that finds
//! an entry attaches to its [`Shared`] future instead of starting new work.
//! The table is sharded by cache bucket so unrelated documents never contend.
//!
//! The executing task removes its own entry only after the result has been
//! stored, and `claim` re-checks the cache under the shard lock, so a caller
//! arriving between those two steps sees the cached value rather than
//! starting a duplicate execution.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};

use super::pool::PriorityHint;
use super::types::Priority;
use crate::cache::{BucketId, CacheKey};
use crate::error::Result;

pub(crate) type SharedResult<T> = Shared<BoxFuture<'static, Result<T>>>;

struct Pending<T: Clone> {
    future: SharedResult<T>,
    hint: Arc<PriorityHint>,
}

type Shard<T> = Arc<Mutex<HashMap<usize, Pending<T>>>>;

pub(crate) enum Claim<T: Clone> {
    /// The result landed in the cache while the caller was looking
    Cached(T),
    /// A pending execution; `leader` is set when this call started it
    Pending {
        future: SharedResult<T>,
        leader: bool,
    },
}

pub(crate) struct InFlightTable<T: Clone> {
    shards: RwLock<HashMap<BucketId, Shard<T>>>,
}

impl<T> InFlightTable<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            shards: RwLock::new(HashMap::new()),
        }
    }

    /// Attach to the pending execution for `key`, or start one with `start`
    ///
    /// `cached` runs under the shard lock when nothing is pending. `start`
    /// receives the promotion hint the execution should acquire its permit
    /// with, and must not block.
    pub fn claim<C, S>(&self, key: &CacheKey, priority: Priority, cached: C, start: S) -> Claim<T>
    where
        C: FnOnce() -> Option<T>,
        S: FnOnce(Arc<PriorityHint>) -> BoxFuture<'static, Result<T>>,
    {
        let id = key.bucket();
        let page = key.page.page;

        // The shard map guard is held while the shard is locked so `finish`
        // cannot drop the shard from under us
        let shards = self.shards.read();
        if let Some(shard) = shards.get(&id) {
            let mut pending = shard.lock();
            return Self::claim_in(&mut pending, page, priority, cached, start);
        }
        drop(shards);

        let mut shards = self.shards.write();
        let shard = shards.entry(id).or_default().clone();
        let mut pending = shard.lock();
        Self::claim_in(&mut pending, page, priority, cached, start)
    }

    fn claim_in<C, S>(
        pending: &mut HashMap<usize, Pending<T>>,
        page: usize,
        priority: Priority,
        cached: C,
        start: S,
    ) -> Claim<T>
    where
        C: FnOnce() -> Option<T>,
        S: FnOnce(Arc<PriorityHint>) -> BoxFuture<'static, Result<T>>,
    {
        if let Some(existing) = pending.get(&page) {
            if priority == Priority::Foreground {
                existing.hint.promote();
            }
            return Claim::Pending {
                future: existing.future.clone(),
                leader: false,
            };
        }

        if let Some(value) = cached() {
            return Claim::Cached(value);
        }

        let hint = Arc::new(PriorityHint::new(priority));
        let future = start(hint.clone()).shared();
        pending.insert(
            page,
            Pending {
                future: future.clone(),
                hint,
            },
        );
        Claim::Pending {
            future,
            leader: true,
        }
    }

    /// Remove the entry for `key` once its result is stored
    pub fn finish(&self, key: &CacheKey) {
        let id = key.bucket();
        let mut shards = self.shards.write();
        let now_empty = match shards.get(&id) {
            Some(shard) => {
                let mut pending = shard.lock();
                pending.remove(&key.page.page);
                pending.is_empty()
            }
            None => false,
        };
        if now_empty {
            shards.remove(&id);
        }
    }

    /// Number of pending executions
    pub fn len(&self) -> usize {
        self.shards
            .read()
            .values()
            .map(|shard| shard.lock().len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentId, PageKey, QualityTier};
    use futures::future;

    fn key(page: usize) -> CacheKey {
        CacheKey::image(PageKey::new(DocumentId::new(), page, QualityTier::Draft))
    }

    #[tokio::test]
    async fn test_second_claim_attaches() {
        let table: InFlightTable<u32> = InFlightTable::new();
        let key = key(0);

        let first = table.claim(&key, Priority::Foreground, || None, |_| {
            future::ready(Ok(7)).boxed()
        });
        let second = table.claim(&key, Priority::Foreground, || None, |_| {
            panic!("a second execution must not start")
        });

        match (first, second) {
            (
                Claim::Pending { future: a, leader: true },
                Claim::Pending { future: b, leader: false },
            ) => {
                assert_eq!(a.await, Ok(7));
                assert_eq!(b.await, Ok(7));
            }
            _ => panic!("expected leader then follower"),
        }
        assert_eq!(table.len(), 1);
        table.finish(&key);
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_cached_value_short_circuits() {
        let table: InFlightTable<u32> = InFlightTable::new();
        let claim = table.claim(&key(1), Priority::Background, || Some(3), |_| {
            panic!("cached value must win")
        });
        assert!(matches!(claim, Claim::Cached(3)));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_foreground_attach_promotes() {
        let table: InFlightTable<u32> = InFlightTable::new();
        let key = key(2);
        let mut captured = None;
        let _leader = table.claim(&key, Priority::Background, || None, |hint| {
            captured = Some(hint);
            future::pending().boxed()
        });
        let hint = captured.unwrap();
        assert!(!hint.is_foreground());

        let _follower = table.claim(&key, Priority::Foreground, || None, |_| {
            future::pending().boxed()
        });
        assert!(hint.is_foreground());
    }
}
