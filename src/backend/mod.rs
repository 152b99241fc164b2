//! Native renderer seam
//!
//! The engine never rasterizes or parses documents itself. It drives a
//! [`RenderBackend`] through one of two routes:
//!
//! - the **fast path**, a backend called directly on the caller's task
//! - the **fallback path**, usually a [`BridgeBackend`] that forwards every
//!   call over a channel to a dedicated worker and is always available
//!
//! [`PlainTextBackend`] is the bundled reference renderer for plain-text
//! documents.

mod bridge;
mod plain;

pub use bridge::BridgeBackend;
pub use plain::PlainTextBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::{QualityTier, SourceBytes};

/// Errors reported by a renderer backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("Backend failure: {0}")]
    Failed(String),

    #[error("Page {0} out of range")]
    PageOutOfRange(usize),

    #[error("Password required")]
    PasswordRequired,

    #[error("Invalid password")]
    InvalidPassword,

    #[error("Unsupported document: {0}")]
    Unsupported(String),
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// What a backend learns from opening a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentInfo {
    pub page_count: usize,
    pub encrypted: bool,
}

/// Encoded page image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Page size in points
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageSize {
    pub width: f32,
    pub height: f32,
}

/// Format-agnostic renderer
///
/// Implementations are stateless with respect to documents: every call
/// receives the source bytes it operates on.
#[async_trait]
pub trait RenderBackend: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Whether this backend can serve calls in the current environment
    async fn probe(&self) -> bool;

    /// Inspect a document, checking the password when it is protected
    async fn open(&self, source: &SourceBytes, password: Option<&str>) -> BackendResult<DocumentInfo>;

    /// Render one page to an encoded image
    async fn render_page(
        &self,
        source: &SourceBytes,
        page: usize,
        quality: QualityTier,
    ) -> BackendResult<RenderedPage>;

    /// Page dimensions without rendering
    async fn page_size(&self, source: &SourceBytes, page: usize) -> BackendResult<PageSize>;

    /// Plain text of one page
    async fn extract_text(&self, source: &SourceBytes, page: usize) -> BackendResult<String>;
}
