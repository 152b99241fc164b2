//! Document identity and lifecycle
//!
//! A [`DocumentHandle`] is created when a document is opened and is immutable
//! afterwards. Every cached artifact and in-flight request is keyed by a
//! [`PageKey`] derived from the handle's id.

mod registry;
mod types;

pub use registry::DocumentRegistry;
pub use types::{
    ArtifactKind, DocumentHandle, DocumentId, LockState, PageKey, QualityTier, SourceBytes,
    SourceDescriptor,
};
