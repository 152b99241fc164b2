//! Core document types
//!
//! Identity types shared by the cache, the gateway and the scheduler.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Opaque document identifier, assigned on open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(Uuid);

impl DocumentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DocumentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Render quality tier
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Draft,
    #[default]
    Standard,
    High,
}

impl QualityTier {
    pub const ALL: [QualityTier; 3] = [QualityTier::Draft, QualityTier::Standard, QualityTier::High];

    /// Device pixels per layout cell at this tier
    pub fn scale(&self) -> u32 {
        match self {
            QualityTier::Draft => 1,
            QualityTier::Standard => 2,
            QualityTier::High => 4,
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QualityTier::Draft => "draft",
            QualityTier::Standard => "standard",
            QualityTier::High => "high",
        };
        f.write_str(name)
    }
}

impl FromStr for QualityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "draft" => Ok(QualityTier::Draft),
            "standard" => Ok(QualityTier::Standard),
            "high" => Ok(QualityTier::High),
            other => Err(format!("unknown quality tier: {other}")),
        }
    }
}

/// Kind of artifact stored for a page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Image,
    Text,
    Metrics,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 3] = [ArtifactKind::Image, ArtifactKind::Text, ArtifactKind::Metrics];
}

/// Identity of a cacheable unit of work
///
/// Equality is structural. Tier-independent artifacts (text, metrics) are
/// keyed with [`PageKey::untiered`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageKey {
    pub document: DocumentId,
    pub page: usize,
    pub quality: QualityTier,
}

impl PageKey {
    pub fn new(document: DocumentId, page: usize, quality: QualityTier) -> Self {
        Self {
            document,
            page,
            quality,
        }
    }

    /// Key for artifacts that do not depend on the render tier
    pub fn untiered(document: DocumentId, page: usize) -> Self {
        Self::new(document, page, QualityTier::Standard)
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.document, self.page, self.quality)
    }
}

/// Password state of an opened document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LockState {
    /// Document carries no password
    Open,
    /// Document is password protected and was unlocked on open
    Unlocked,
}

/// Describes the byte source a document was opened from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDescriptor {
    /// SHA-256 of the source bytes, hex encoded
    pub digest: String,
    pub byte_len: usize,
}

impl SourceDescriptor {
    pub fn of(bytes: &[u8]) -> Self {
        Self {
            digest: hex::encode(Sha256::digest(bytes)),
            byte_len: bytes.len(),
        }
    }
}

/// Shared, immutable source bytes handed to the renderer
pub type SourceBytes = Arc<[u8]>;

/// An opened document
///
/// Immutable once open; dropped on close or teardown.
#[derive(Debug, Clone)]
pub struct DocumentHandle {
    id: DocumentId,
    source: SourceBytes,
    descriptor: SourceDescriptor,
    page_count: usize,
    lock_state: LockState,
}

impl DocumentHandle {
    pub fn new(source: SourceBytes, page_count: usize, lock_state: LockState) -> Self {
        let descriptor = SourceDescriptor::of(&source);
        Self {
            id: DocumentId::new(),
            source,
            descriptor,
            page_count,
            lock_state,
        }
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn source(&self) -> &SourceBytes {
        &self.source
    }

    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn lock_state(&self) -> LockState {
        self.lock_state
    }

    pub fn contains_page(&self, page: usize) -> bool {
        page < self.page_count
    }

    pub fn key(&self, page: usize, quality: QualityTier) -> PageKey {
        PageKey::new(self.id, page, quality)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_key_equality_is_structural() {
        let doc = DocumentId::new();
        let a = PageKey::new(doc, 3, QualityTier::High);
        let b = PageKey::new(doc, 3, QualityTier::High);
        assert_eq!(a, b);
        assert_ne!(a, PageKey::new(doc, 3, QualityTier::Draft));
        assert_ne!(a, PageKey::new(DocumentId::new(), 3, QualityTier::High));
    }

    #[test]
    fn test_quality_tier_parsing() {
        assert_eq!("HIGH".parse::<QualityTier>().unwrap(), QualityTier::High);
        assert_eq!("draft".parse::<QualityTier>().unwrap(), QualityTier::Draft);
        assert!("ultra".parse::<QualityTier>().is_err());
        assert_eq!(QualityTier::default(), QualityTier::Standard);
    }

    #[test]
    fn test_source_descriptor_digest() {
        let descriptor = SourceDescriptor::of(b"abc");
        assert_eq!(descriptor.byte_len, 3);
        assert_eq!(
            descriptor.digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_handle_page_bounds() {
        let handle = DocumentHandle::new(Arc::from(&b"x"[..]), 4, LockState::Open);
        assert!(handle.contains_page(3));
        assert!(!handle.contains_page(4));
        assert_eq!(handle.key(2, QualityTier::Draft).document, handle.id());
    }
}
