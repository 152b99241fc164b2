//! Byte-budgeted artifact store with bucketed LRU eviction
//!
//! Entries live in buckets keyed by (document, quality tier, artifact kind).
//! Each bucket is an [`LruCache`] behind its own lock, so lookups in
//! different documents never contend. Admission (`put`) and removal
//! (`invalidate`, shrinking) are serialized by the usage lock, which is what
//! keeps the per-kind byte totals exact.
//!
//! # Eviction
//!
//! When a kind's budget would be exceeded, the inserting bucket first evicts
//! its own least recently used entries, but only while it holds more than its
//! fair share (budget divided by the number of non-empty buckets of that
//! kind). Anything still over budget is reclaimed from the globally least
//! recently used entry of that kind, whichever bucket it sits in.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};

use super::types::{
    BucketId, CacheEntry, CacheKey, CacheStats, DocumentCacheStats, InvalidateScope, KindUsage,
};
use crate::config::KindBudgets;
use crate::document::{ArtifactKind, DocumentId, QualityTier};
use crate::error::{AccelError, Result};

struct Bucket {
    /// Page index -> entry, most recently used first
    entries: LruCache<usize, CacheEntry>,
    bytes: usize,
}

impl Bucket {
    fn new() -> Self {
        Self {
            entries: LruCache::unbounded(),
            bytes: 0,
        }
    }

    fn lru_recency(&self) -> Option<(u64, u64)> {
        self.entries.peek_lru().map(|(_, entry)| entry.recency())
    }

    fn pop_lru(&mut self) -> Option<CacheEntry> {
        let (_, entry) = self.entries.pop_lru()?;
        self.bytes = self.bytes.saturating_sub(entry.size);
        Some(entry)
    }

    fn remove(&mut self, page: usize) -> Option<CacheEntry> {
        let entry = self.entries.pop(&page)?;
        self.bytes = self.bytes.saturating_sub(entry.size);
        Some(entry)
    }

    fn insert(&mut self, page: usize, entry: CacheEntry) {
        self.bytes += entry.size;
        self.entries.put(page, entry);
    }
}

type SharedBucket = Arc<RwLock<Bucket>>;

#[derive(Default)]
struct LookupCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

struct StoreInner {
    budgets: KindBudgets,
    buckets: RwLock<HashMap<BucketId, SharedBucket>>,
    /// Admission lock and per-kind byte totals
    usage: Mutex<KindUsage>,
    /// Logical clock ordering accesses and insertions
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    per_document: RwLock<HashMap<DocumentId, Arc<LookupCounters>>>,
    /// Closed documents; admissions for them are refused. Ids are never
    /// reused, so the set only grows.
    retired: RwLock<HashSet<DocumentId>>,
}

/// Thread-safe artifact cache
///
/// Cloning is cheap and yields a handle to the same store.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<StoreInner>,
}

impl CacheStore {
    pub fn new(budgets: KindBudgets) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                budgets,
                buckets: RwLock::new(HashMap::new()),
                usage: Mutex::new(KindUsage::default()),
                clock: AtomicU64::new(0),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
                per_document: RwLock::new(HashMap::new()),
                retired: RwLock::new(HashSet::new()),
            }),
        }
    }

    pub fn budgets(&self) -> KindBudgets {
        self.inner.budgets
    }

    fn tick(&self) -> u64 {
        self.inner.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn bucket(&self, id: &BucketId) -> Option<SharedBucket> {
        self.inner.buckets.read().get(id).cloned()
    }

    fn bucket_or_insert(&self, id: BucketId) -> SharedBucket {
        if let Some(bucket) = self.bucket(&id) {
            return bucket;
        }
        self.inner
            .buckets
            .write()
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(Bucket::new())))
            .clone()
    }

    fn document_counters(&self, document: DocumentId) -> Arc<LookupCounters> {
        if let Some(counters) = self.inner.per_document.read().get(&document) {
            return counters.clone();
        }
        self.inner
            .per_document
            .write()
            .entry(document)
            .or_default()
            .clone()
    }

    fn count_lookup(&self, document: DocumentId, hit: bool) {
        if hit {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.misses.fetch_add(1, Ordering::Relaxed);
        }
        if self.is_retired(document) {
            return;
        }
        let counters = self.document_counters(document);
        if hit {
            counters.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Whether the document was closed with [`retire_document`](Self::retire_document)
    pub fn is_retired(&self, document: DocumentId) -> bool {
        self.inner.retired.read().contains(&document)
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    /// Fetch an entry, marking it most recently used
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let found = self.bucket(&key.bucket()).and_then(|bucket| {
            let mut bucket = bucket.write();
            let entry = bucket.entries.get_mut(&key.page.page)?;
            entry.access_seq = self.tick();
            entry.last_accessed_at = Utc::now();
            Some(entry.clone())
        });
        self.count_lookup(key.page.document, found.is_some());
        found
    }

    /// Fetch an entry without touching LRU order or hit/miss counters
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        let bucket = self.bucket(&key.bucket())?;
        let bucket = bucket.read();
        bucket.entries.peek(&key.page.page).cloned()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        match self.bucket(&key.bucket()) {
            Some(bucket) => {
                let bucket = bucket.read();
                bucket.entries.contains(&key.page.page)
            }
            None => false,
        }
    }

    /// Page indices cached for a document at a tier, ascending
    pub fn cached_pages(
        &self,
        document: DocumentId,
        quality: QualityTier,
        kind: ArtifactKind,
    ) -> Vec<usize> {
        let id = BucketId {
            document,
            quality,
            kind,
        };
        let mut pages: Vec<usize> = match self.bucket(&id) {
            Some(bucket) => {
                let bucket = bucket.read();
                bucket.entries.iter().map(|(page, _)| *page).collect()
            }
            None => Vec::new(),
        };
        pages.sort_unstable();
        pages
    }

    /// Page indices holding any artifact of a document, ascending
    pub fn document_pages(&self, document: DocumentId) -> Vec<usize> {
        let buckets: Vec<SharedBucket> = self
            .inner
            .buckets
            .read()
            .iter()
            .filter(|(id, _)| id.document == document)
            .map(|(_, bucket)| bucket.clone())
            .collect();

        let mut pages: Vec<usize> = buckets
            .iter()
            .flat_map(|bucket| {
                let bucket = bucket.read();
                bucket.entries.iter().map(|(page, _)| *page).collect::<Vec<_>>()
            })
            .collect();
        pages.sort_unstable();
        pages.dedup();
        pages
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// Insert or replace an entry, evicting as needed to stay within budget
    ///
    /// An entry larger than its kind's whole budget is rejected with
    /// [`AccelError::CapacityExceeded`] and not stored. Entries of a retired
    /// document are rejected with [`AccelError::DocumentNotOpen`].
    pub fn put(&self, key: CacheKey, mut entry: CacheEntry) -> Result<()> {
        let kind = key.kind;
        let budget = self.inner.budgets.for_kind(kind);
        if entry.size > budget {
            tracing::warn!(
                key = %key.page,
                kind = ?kind,
                size = entry.size,
                budget = budget,
                "Artifact exceeds cache budget, not cached"
            );
            return Err(AccelError::CapacityExceeded {
                size: entry.size,
                budget,
            });
        }

        let id = key.bucket();
        let page = key.page.page;
        let size = entry.size;

        let mut usage = self.inner.usage.lock();
        // Checked under the admission lock so it cannot interleave with
        // retire_document
        if self.is_retired(key.page.document) {
            return Err(AccelError::DocumentNotOpen(key.page.document.to_string()));
        }
        let bucket = self.bucket_or_insert(id);

        if let Some(old) = bucket.write().remove(page) {
            usage.remove(kind, old.size);
        }

        let fair_share = budget / self.active_buckets(kind, id).max(1);
        {
            let mut own = bucket.write();
            while usage.bytes(kind) + size > budget && own.bytes + size > fair_share {
                match own.pop_lru() {
                    Some(evicted) => {
                        usage.remove(kind, evicted.size);
                        self.inner.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                    None => break,
                }
            }
        }

        while usage.bytes(kind) + size > budget {
            if self.evict_lru_where(&mut usage, kind, |_| true).is_none() {
                break;
            }
        }

        let seq = self.tick();
        let now = Utc::now();
        entry.kind = kind;
        entry.created_seq = seq;
        entry.access_seq = seq;
        entry.created_at = now;
        entry.last_accessed_at = now;

        bucket.write().insert(page, entry);
        usage.add(kind, size);
        Ok(())
    }

    /// Buckets of `kind` holding data, counting `own` even when empty
    fn active_buckets(&self, kind: ArtifactKind, own: BucketId) -> usize {
        self.inner
            .buckets
            .read()
            .iter()
            .filter(|(id, bucket)| id.kind == kind && (**id == own || bucket.read().bytes > 0))
            .count()
    }

    /// Evict the least recently used entry of `kind` among matching buckets
    fn evict_lru_where(
        &self,
        usage: &mut KindUsage,
        kind: ArtifactKind,
        filter: impl Fn(&BucketId) -> bool,
    ) -> Option<CacheEntry> {
        let victim = {
            let buckets = self.inner.buckets.read();
            buckets
                .iter()
                .filter(|(id, _)| id.kind == kind && filter(*id))
                .filter_map(|(id, bucket)| {
                    let recency = bucket.read().lru_recency()?;
                    Some((recency, *id, bucket.clone()))
                })
                .min_by_key(|(recency, _, _)| *recency)
        };

        let (_, id, bucket) = victim?;
        let evicted = bucket.write().pop_lru()?;
        usage.remove(kind, evicted.size);
        self.inner.evictions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            document = %id.document,
            quality = %id.quality,
            kind = ?kind,
            size = evicted.size,
            "Evicted cache entry"
        );
        Some(evicted)
    }

    // ========================================================================
    // Removal
    // ========================================================================

    /// Drop every entry matching `scope`, returning how many were removed
    pub fn invalidate(&self, scope: InvalidateScope) -> usize {
        let mut usage = self.inner.usage.lock();
        let mut buckets = self.inner.buckets.write();
        let mut removed = 0;

        match scope.page_filter() {
            Some(page) => {
                for (id, bucket) in buckets.iter().filter(|(id, _)| scope.matches_bucket(id)) {
                    if let Some(entry) = bucket.write().remove(page) {
                        usage.remove(id.kind, entry.size);
                        removed += 1;
                    }
                }
            }
            None => {
                buckets.retain(|id, bucket| {
                    if !scope.matches_bucket(id) {
                        return true;
                    }
                    let bucket = bucket.read();
                    for (_, entry) in bucket.entries.iter() {
                        usage.remove(id.kind, entry.size);
                    }
                    removed += bucket.entries.len();
                    false
                });
            }
        }

        match scope {
            InvalidateScope::Everything => {
                usage.clear();
                self.inner.hits.store(0, Ordering::Relaxed);
                self.inner.misses.store(0, Ordering::Relaxed);
                self.inner.evictions.store(0, Ordering::Relaxed);
                self.inner.per_document.write().clear();
            }
            InvalidateScope::Document(document) => {
                self.inner.per_document.write().remove(&document);
            }
            _ => {}
        }

        if removed > 0 {
            tracing::debug!(scope = ?scope, removed = removed, "Invalidated cache entries");
        }
        removed
    }

    /// Drop a closed document's entries and refuse any later admission for
    /// it; returns how many entries were removed
    ///
    /// Work already in flight for the document finishes without being
    /// cached.
    pub fn retire_document(&self, document: DocumentId) -> usize {
        {
            let _admission = self.inner.usage.lock();
            self.inner.retired.write().insert(document);
        }
        self.invalidate(InvalidateScope::Document(document))
    }

    /// Evict a document's least recently used entries until each kind fits
    /// `limits`; returns the bytes freed
    pub fn shrink_document(&self, document: DocumentId, limits: KindBudgets) -> usize {
        let mut usage = self.inner.usage.lock();
        let mut freed = 0;
        for kind in ArtifactKind::ALL {
            let limit = limits.for_kind(kind);
            while self.document_bytes(document, kind) > limit {
                match self.evict_lru_where(&mut usage, kind, |id| id.document == document) {
                    Some(evicted) => freed += evicted.size,
                    None => break,
                }
            }
        }
        freed
    }

    /// Evict globally least recently used entries until each kind fits
    /// `limits`; returns the bytes freed
    pub fn shrink_to(&self, limits: KindBudgets) -> usize {
        let mut usage = self.inner.usage.lock();
        let mut freed = 0;
        for kind in ArtifactKind::ALL {
            let limit = limits.for_kind(kind);
            while usage.bytes(kind) > limit {
                match self.evict_lru_where(&mut usage, kind, |_| true) {
                    Some(evicted) => freed += evicted.size,
                    None => break,
                }
            }
        }
        freed
    }

    fn document_bytes(&self, document: DocumentId, kind: ArtifactKind) -> usize {
        self.inner
            .buckets
            .read()
            .iter()
            .filter(|(id, _)| id.document == document && id.kind == kind)
            .map(|(_, bucket)| bucket.read().bytes)
            .sum()
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> CacheStats {
        let usage = *self.inner.usage.lock();
        CacheStats {
            entry_count: usage.total_entries(),
            total_bytes: usage.total_bytes(),
            hit_count: self.inner.hits.load(Ordering::Relaxed),
            miss_count: self.inner.misses.load(Ordering::Relaxed),
            eviction_count: self.inner.evictions.load(Ordering::Relaxed),
        }
    }

    /// Current bytes and entries per artifact kind
    pub fn usage(&self) -> KindUsage {
        *self.inner.usage.lock()
    }

    pub fn document_stats(&self, document: DocumentId) -> DocumentCacheStats {
        let (entry_count, total_bytes) = self
            .inner
            .buckets
            .read()
            .iter()
            .filter(|(id, _)| id.document == document)
            .fold((0, 0), |(count, bytes), (_, bucket)| {
                let bucket = bucket.read();
                (count + bucket.entries.len(), bytes + bucket.bytes)
            });

        let hit_rate = self
            .inner
            .per_document
            .read()
            .get(&document)
            .map(|counters| {
                let hits = counters.hits.load(Ordering::Relaxed);
                let total = hits + counters.misses.load(Ordering::Relaxed);
                if total == 0 {
                    0.0
                } else {
                    hits as f64 / total as f64
                }
            })
            .unwrap_or(0.0);

        DocumentCacheStats {
            entry_count,
            total_bytes,
            hit_rate,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.usage.lock().total_entries()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::PageKey;

    fn budgets(image: usize) -> KindBudgets {
        KindBudgets {
            image,
            text: 1024,
            metrics: 256,
        }
    }

    fn image_entry(size: usize) -> CacheEntry {
        CacheEntry::new(ArtifactKind::Image, Arc::from(vec![7u8; size])).with_dimensions(10, 10)
    }

    fn image_key(document: DocumentId, page: usize) -> CacheKey {
        CacheKey::image(PageKey::new(document, page, QualityTier::Standard))
    }

    #[test]
    fn test_put_then_get_hits() {
        let store = CacheStore::new(budgets(1000));
        let doc = DocumentId::new();
        let key = image_key(doc, 0);

        assert!(store.get(&key).is_none());
        store.put(key, image_entry(100)).unwrap();
        let entry = store.get(&key).unwrap();

        assert_eq!(entry.size, 100);
        assert_eq!(entry.dimensions, Some((10, 10)));
        let stats = store.stats();
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.total_bytes, 100);
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.miss_count, 1);
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn test_lru_eviction_respects_access_order() {
        let store = CacheStore::new(budgets(300));
        let doc = DocumentId::new();
        for page in 0..3 {
            store.put(image_key(doc, page), image_entry(100)).unwrap();
        }

        // Page 0 becomes most recently used, so page 1 is the victim
        store.get(&image_key(doc, 0)).unwrap();
        store.put(image_key(doc, 3), image_entry(100)).unwrap();

        assert!(store.contains(&image_key(doc, 0)));
        assert!(!store.contains(&image_key(doc, 1)));
        assert!(store.contains(&image_key(doc, 2)));
        assert!(store.contains(&image_key(doc, 3)));
        assert_eq!(store.stats().eviction_count, 1);
    }

    #[test]
    fn test_oversized_entry_is_rejected() {
        let store = CacheStore::new(budgets(300));
        let doc = DocumentId::new();
        store.put(image_key(doc, 0), image_entry(100)).unwrap();

        let result = store.put(image_key(doc, 1), image_entry(301));
        assert_eq!(
            result,
            Err(AccelError::CapacityExceeded {
                size: 301,
                budget: 300
            })
        );
        assert!(!store.contains(&image_key(doc, 1)));
        // Existing entries are untouched
        assert!(store.contains(&image_key(doc, 0)));
    }

    #[test]
    fn test_total_bytes_never_exceed_budget() {
        let store = CacheStore::new(budgets(1000));
        let docs = [DocumentId::new(), DocumentId::new(), DocumentId::new()];
        for i in 0..200usize {
            let doc = docs[i % docs.len()];
            let size = 37 + (i * 53) % 400;
            store.put(image_key(doc, i), image_entry(size)).unwrap();
            assert!(store.stats().total_bytes <= 1000);
        }
    }

    #[test]
    fn test_replacing_key_does_not_double_count() {
        let store = CacheStore::new(budgets(1000));
        let key = image_key(DocumentId::new(), 4);
        store.put(key, image_entry(100)).unwrap();
        store.put(key, image_entry(250)).unwrap();

        let stats = store.stats();
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.total_bytes, 250);
    }

    #[test]
    fn test_new_document_does_not_evict_other_document_entirely() {
        let store = CacheStore::new(budgets(400));
        let a = DocumentId::new();
        let b = DocumentId::new();
        for page in 0..4 {
            store.put(image_key(a, page), image_entry(100)).unwrap();
        }
        for page in 0..3 {
            store.put(image_key(b, page), image_entry(100)).unwrap();
        }

        assert_eq!(
            store.cached_pages(a, QualityTier::Standard, ArtifactKind::Image),
            vec![2, 3]
        );
        assert_eq!(
            store.cached_pages(b, QualityTier::Standard, ArtifactKind::Image),
            vec![1, 2]
        );
    }

    #[test]
    fn test_kinds_have_independent_budgets() {
        let store = CacheStore::new(budgets(100));
        let doc = DocumentId::new();
        store.put(image_key(doc, 0), image_entry(100)).unwrap();
        store
            .put(
                CacheKey::text(doc, 0),
                CacheEntry::new(ArtifactKind::Text, Arc::from(&b"hello"[..])),
            )
            .unwrap();

        assert!(store.contains(&image_key(doc, 0)));
        assert!(store.contains(&CacheKey::text(doc, 0)));
        assert_eq!(store.usage().bytes(ArtifactKind::Text), 5);
    }

    #[test]
    fn test_invalidate_scopes() {
        let store = CacheStore::new(budgets(10_000));
        let a = DocumentId::new();
        let b = DocumentId::new();
        for page in 0..3 {
            store.put(image_key(a, page), image_entry(10)).unwrap();
            store.put(image_key(b, page), image_entry(10)).unwrap();
        }
        store
            .put(
                CacheKey::text(a, 1),
                CacheEntry::new(ArtifactKind::Text, Arc::from(&b"text"[..])),
            )
            .unwrap();

        assert_eq!(store.invalidate(InvalidateScope::Key(image_key(a, 0).page)), 1);
        assert_eq!(store.invalidate(InvalidateScope::Page { document: a, page: 1 }), 2);
        assert_eq!(
            store.invalidate(InvalidateScope::Kind {
                document: None,
                kind: ArtifactKind::Image
            }),
            4
        );
        assert!(store.is_empty());

        store.put(image_key(b, 9), image_entry(10)).unwrap();
        assert_eq!(store.invalidate(InvalidateScope::Document(a)), 0);
        assert_eq!(store.invalidate(InvalidateScope::Document(b)), 1);
    }

    #[test]
    fn test_invalidate_everything_is_idempotent() {
        let store = CacheStore::new(budgets(1000));
        let doc = DocumentId::new();
        store.put(image_key(doc, 0), image_entry(10)).unwrap();
        store.get(&image_key(doc, 0));
        store.get(&image_key(doc, 1));

        store.invalidate(InvalidateScope::Everything);
        assert_eq!(store.stats(), CacheStats::default());
        store.invalidate(InvalidateScope::Everything);
        assert_eq!(store.stats(), CacheStats::default());
    }

    #[test]
    fn test_shrink_document_only_touches_that_document() {
        let store = CacheStore::new(budgets(10_000));
        let a = DocumentId::new();
        let b = DocumentId::new();
        for page in 0..5 {
            store.put(image_key(a, page), image_entry(100)).unwrap();
            store.put(image_key(b, page), image_entry(100)).unwrap();
        }

        let freed = store.shrink_document(a, budgets(200));
        assert_eq!(freed, 300);
        assert_eq!(store.document_stats(a).total_bytes, 200);
        assert_eq!(store.document_stats(b).total_bytes, 500);
        // Most recent pages survive
        assert_eq!(
            store.cached_pages(a, QualityTier::Standard, ArtifactKind::Image),
            vec![3, 4]
        );
    }

    #[test]
    fn test_document_stats_hit_rate() {
        let store = CacheStore::new(budgets(1000));
        let doc = DocumentId::new();
        store.put(image_key(doc, 0), image_entry(10)).unwrap();
        store.get(&image_key(doc, 0));
        store.get(&image_key(doc, 0));
        store.get(&image_key(doc, 0));
        store.get(&image_key(doc, 1));

        let stats = store.document_stats(doc);
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.total_bytes, 10);
        assert!((stats.hit_rate - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_retired_document_refuses_late_entries() {
        let store = CacheStore::new(budgets(1000));
        let closed = DocumentId::new();
        let open = DocumentId::new();
        store.put(image_key(closed, 0), image_entry(100)).unwrap();
        store.put(image_key(open, 0), image_entry(100)).unwrap();

        assert_eq!(store.retire_document(closed), 1);
        assert!(store.is_retired(closed));
        assert!(matches!(
            store.put(image_key(closed, 1), image_entry(100)),
            Err(AccelError::DocumentNotOpen(_))
        ));
        assert!(store.get(&image_key(closed, 1)).is_none());

        assert!(store.document_pages(closed).is_empty());
        assert_eq!(store.document_stats(closed).entry_count, 0);
        assert_eq!(store.len(), 1);
        assert!(store.contains(&image_key(open, 0)));
        store.put(image_key(open, 1), image_entry(100)).unwrap();
    }
}
