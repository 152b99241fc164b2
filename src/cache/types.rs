//! Cache entry and scope types

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::document::{ArtifactKind, DocumentId, PageKey, QualityTier};

/// Cache identity: a page key plus the kind of artifact stored for it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub page: PageKey,
    pub kind: ArtifactKind,
}

impl CacheKey {
    pub fn new(page: PageKey, kind: ArtifactKind) -> Self {
        Self { page, kind }
    }

    pub fn image(page: PageKey) -> Self {
        Self::new(page, ArtifactKind::Image)
    }

    pub fn text(document: DocumentId, page: usize) -> Self {
        Self::new(PageKey::untiered(document, page), ArtifactKind::Text)
    }

    pub fn metrics(document: DocumentId, page: usize) -> Self {
        Self::new(PageKey::untiered(document, page), ArtifactKind::Metrics)
    }

    pub(crate) fn bucket(&self) -> BucketId {
        BucketId {
            document: self.page.document,
            quality: self.page.quality,
            kind: self.kind,
        }
    }
}

/// Eviction scope: one document at one quality tier for one artifact kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct BucketId {
    pub document: DocumentId,
    pub quality: QualityTier,
    pub kind: ArtifactKind,
}

/// A cached artifact
///
/// The size is fixed at construction so budget accounting never re-measures.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub kind: ArtifactKind,
    pub data: Arc<[u8]>,
    pub size: usize,
    /// Pixel dimensions for image artifacts
    pub dimensions: Option<(u32, u32)>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub(crate) created_seq: u64,
    pub(crate) access_seq: u64,
}

impl CacheEntry {
    pub fn new(kind: ArtifactKind, data: Arc<[u8]>) -> Self {
        let now = Utc::now();
        Self {
            kind,
            size: data.len(),
            data,
            dimensions: None,
            created_at: now,
            last_accessed_at: now,
            created_seq: 0,
            access_seq: 0,
        }
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.dimensions = Some((width, height));
        self
    }

    /// LRU ordering: last access first, creation breaks ties
    pub(crate) fn recency(&self) -> (u64, u64) {
        (self.access_seq, self.created_seq)
    }
}

/// What to drop from the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidateScope {
    /// Every artifact kind stored under one page key
    Key(PageKey),
    /// One page of a document across all tiers and kinds
    Page { document: DocumentId, page: usize },
    /// Everything belonging to a document
    Document(DocumentId),
    /// One artifact kind, optionally restricted to a document
    Kind {
        document: Option<DocumentId>,
        kind: ArtifactKind,
    },
    /// The whole cache, including hit/miss counters
    Everything,
}

impl InvalidateScope {
    pub(crate) fn matches_bucket(&self, bucket: &BucketId) -> bool {
        match self {
            InvalidateScope::Key(key) => {
                bucket.document == key.document && bucket.quality == key.quality
            }
            InvalidateScope::Page { document, .. } | InvalidateScope::Document(document) => {
                bucket.document == *document
            }
            InvalidateScope::Kind { document, kind } => {
                bucket.kind == *kind && document.map_or(true, |doc| doc == bucket.document)
            }
            InvalidateScope::Everything => true,
        }
    }

    /// Page index the scope is restricted to inside matching buckets
    pub(crate) fn page_filter(&self) -> Option<usize> {
        match self {
            InvalidateScope::Key(key) => Some(key.page),
            InvalidateScope::Page { page, .. } => Some(*page),
            _ => None,
        }
    }
}

/// Snapshot of cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entry_count: usize,
    pub total_bytes: usize,
    pub hit_count: u64,
    pub miss_count: u64,
    pub eviction_count: u64,
}

impl CacheStats {
    /// Hit rate in 0.0..=1.0
    pub fn hit_rate(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }
}

/// Per-document cache snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentCacheStats {
    pub entry_count: usize,
    pub total_bytes: usize,
    pub hit_rate: f64,
}

/// Bytes and entries held per artifact kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindUsage {
    bytes: [usize; 3],
    entries: [usize; 3],
}

impl KindUsage {
    fn slot(kind: ArtifactKind) -> usize {
        match kind {
            ArtifactKind::Image => 0,
            ArtifactKind::Text => 1,
            ArtifactKind::Metrics => 2,
        }
    }

    pub fn bytes(&self, kind: ArtifactKind) -> usize {
        self.bytes[Self::slot(kind)]
    }

    pub fn entries(&self, kind: ArtifactKind) -> usize {
        self.entries[Self::slot(kind)]
    }

    pub fn total_bytes(&self) -> usize {
        self.bytes.iter().sum()
    }

    pub fn total_entries(&self) -> usize {
        self.entries.iter().sum()
    }

    pub(crate) fn add(&mut self, kind: ArtifactKind, size: usize) {
        let slot = Self::slot(kind);
        self.bytes[slot] += size;
        self.entries[slot] += 1;
    }

    pub(crate) fn remove(&mut self, kind: ArtifactKind, size: usize) {
        let slot = Self::slot(kind);
        self.bytes[slot] = self.bytes[slot].saturating_sub(size);
        self.entries[slot] = self.entries[slot].saturating_sub(1);
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }
}
