//! Gateway request and result types

use std::sync::Arc;

use serde::Serialize;

/// Route that produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PathUsed {
    Cache,
    Fast,
    Fallback,
}

/// Scheduling class of a request
///
/// Foreground work never waits for a background permit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Foreground,
    Background,
}

/// Outcome of a render request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderResult {
    #[serde(skip)]
    pub artifact: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    /// Time the caller spent waiting, including any in-flight attach
    pub duration_ms: u64,
    pub path_used: PathUsed,
}

impl RenderResult {
    pub fn byte_len(&self) -> usize {
        self.artifact.len()
    }
}

/// Page dimensions in points
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMetrics {
    pub width: f32,
    pub height: f32,
    pub from_cache: bool,
}

/// One search hit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TextMatch {
    pub page: usize,
    /// Character offset of the match within the page text
    pub position: usize,
    /// Surrounding text on a single line
    pub context: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Availability {
    pub fast_path_available: bool,
}

/// Image produced by a single render execution, shared by every waiter
#[derive(Debug, Clone)]
pub(crate) struct RenderedArtifact {
    pub data: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    pub path: PathUsed,
}
