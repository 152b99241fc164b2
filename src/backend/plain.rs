//! Plain-text reference renderer
//!
//! Pages are separated by form feeds. Rendering rasterizes the page's
//! character grid into a grayscale PNG: every non-blank character becomes a
//! dark cell, `quality.scale()` pixels wide and twice that tall.
//!
//! A first line of the form `%LOCKED <sha256-hex>` marks the document as
//! password protected.

use std::io::Cursor;

use async_trait::async_trait;
use image::{GrayImage, ImageFormat, Luma};
use sha2::{Digest, Sha256};

use super::{BackendError, BackendResult, DocumentInfo, PageSize, RenderBackend, RenderedPage};
use crate::document::{QualityTier, SourceBytes};

const PAGE_BREAK: char = '\x0c';
const LOCK_MARKER: &str = "%LOCKED ";
/// Points per character column
const COLUMN_WIDTH_PT: f32 = 6.0;
/// Points per text line
const LINE_HEIGHT_PT: f32 = 12.0;
const DEFAULT_MAX_DIMENSION: u32 = 4096;

/// Parsed view of a plain-text document
struct TextDocument<'a> {
    lock_digest: Option<&'a str>,
    pages: Vec<&'a str>,
}

impl<'a> TextDocument<'a> {
    fn parse(source: &'a [u8]) -> BackendResult<Self> {
        let text = std::str::from_utf8(source)
            .map_err(|e| BackendError::Unsupported(format!("not UTF-8 text: {}", e)))?;

        let (lock_digest, body) = match text.strip_prefix(LOCK_MARKER) {
            Some(rest) => {
                let (digest, body) = rest.split_once('\n').unwrap_or((rest, ""));
                (Some(digest.trim()), body)
            }
            None => (None, text),
        };

        let body = body.strip_suffix(PAGE_BREAK).unwrap_or(body);
        Ok(Self {
            lock_digest,
            pages: body.split(PAGE_BREAK).collect(),
        })
    }

    fn page(&self, index: usize) -> BackendResult<&'a str> {
        self.pages
            .get(index)
            .copied()
            .ok_or(BackendError::PageOutOfRange(index))
    }
}

/// Character grid dimensions of a page: (columns, lines), never zero
fn grid_size(page: &str) -> (usize, usize) {
    let columns = page.lines().map(|line| line.chars().count()).max().unwrap_or(0);
    let lines = page.lines().count();
    (columns.max(1), lines.max(1))
}

fn rasterize(page: &str, quality: QualityTier, max_dimension: u32) -> BackendResult<RenderedPage> {
    let cell_width = quality.scale();
    let cell_height = quality.scale() * 2;
    let (columns, lines) = grid_size(page);

    let max_columns = (max_dimension / cell_width).max(1) as usize;
    let max_lines = (max_dimension / cell_height).max(1) as usize;
    let columns = columns.min(max_columns);
    let lines = lines.min(max_lines);

    let mut inked = vec![false; columns * lines];
    for (row, line) in page.lines().take(lines).enumerate() {
        for (col, ch) in line.chars().take(columns).enumerate() {
            inked[row * columns + col] = !ch.is_whitespace();
        }
    }

    let width = columns as u32 * cell_width;
    let height = lines as u32 * cell_height;
    let image = GrayImage::from_fn(width, height, |x, y| {
        let col = (x / cell_width) as usize;
        let row = (y / cell_height) as usize;
        if inked[row * columns + col] {
            Luma([0u8])
        } else {
            Luma([255u8])
        }
    });

    let mut data = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut data), ImageFormat::Png)
        .map_err(|e| BackendError::Failed(format!("failed to encode page: {}", e)))?;

    Ok(RenderedPage {
        data,
        width,
        height,
    })
}

/// Renderer for form-feed paginated UTF-8 text
#[derive(Debug, Clone)]
pub struct PlainTextBackend {
    max_dimension: u32,
}

impl Default for PlainTextBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PlainTextBackend {
    pub fn new() -> Self {
        Self {
            max_dimension: DEFAULT_MAX_DIMENSION,
        }
    }

    /// Cap rendered images at `max_dimension` pixels per side
    pub fn with_max_dimension(mut self, max_dimension: u32) -> Self {
        self.max_dimension = max_dimension.max(1);
        self
    }

    /// Build the lock marker line for a password, for producing test documents
    pub fn lock_marker(password: &str) -> String {
        format!("{}{}\n", LOCK_MARKER, hex::encode(Sha256::digest(password.as_bytes())))
    }
}

#[async_trait]
impl RenderBackend for PlainTextBackend {
    fn name(&self) -> &str {
        "plain-text"
    }

    async fn probe(&self) -> bool {
        true
    }

    async fn open(&self, source: &SourceBytes, password: Option<&str>) -> BackendResult<DocumentInfo> {
        let document = TextDocument::parse(source)?;

        if let Some(expected) = document.lock_digest {
            let password = password.ok_or(BackendError::PasswordRequired)?;
            let actual = hex::encode(Sha256::digest(password.as_bytes()));
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(BackendError::InvalidPassword);
            }
        }

        Ok(DocumentInfo {
            page_count: document.pages.len(),
            encrypted: document.lock_digest.is_some(),
        })
    }

    async fn render_page(
        &self,
        source: &SourceBytes,
        page: usize,
        quality: QualityTier,
    ) -> BackendResult<RenderedPage> {
        let text = TextDocument::parse(source)?.page(page)?.to_string();
        let max_dimension = self.max_dimension;

        // Offload CPU-bound rasterization to the blocking pool
        tokio::task::spawn_blocking(move || rasterize(&text, quality, max_dimension))
            .await
            .map_err(|e| BackendError::Failed(format!("Task join error: {}", e)))?
    }

    async fn page_size(&self, source: &SourceBytes, page: usize) -> BackendResult<PageSize> {
        let text = TextDocument::parse(source)?.page(page)?;
        let (columns, lines) = grid_size(text);
        Ok(PageSize {
            width: columns as f32 * COLUMN_WIDTH_PT,
            height: lines as f32 * LINE_HEIGHT_PT,
        })
    }

    async fn extract_text(&self, source: &SourceBytes, page: usize) -> BackendResult<String> {
        Ok(TextDocument::parse(source)?.page(page)?.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn source(text: &str) -> SourceBytes {
        Arc::from(text.as_bytes())
    }

    #[tokio::test]
    async fn test_open_counts_pages() {
        let backend = PlainTextBackend::new();
        let info = backend
            .open(&source("one\x0ctwo\x0cthree\x0c"), None)
            .await
            .unwrap();
        assert_eq!(info.page_count, 3);
        assert!(!info.encrypted);
    }

    #[tokio::test]
    async fn test_locked_document_requires_password() {
        let backend = PlainTextBackend::new();
        let text = format!("{}secret page", PlainTextBackend::lock_marker("hunter2"));
        let doc = source(&text);

        assert_eq!(backend.open(&doc, None).await, Err(BackendError::PasswordRequired));
        assert_eq!(
            backend.open(&doc, Some("wrong")).await,
            Err(BackendError::InvalidPassword)
        );
        let info = backend.open(&doc, Some("hunter2")).await.unwrap();
        assert!(info.encrypted);
        assert_eq!(backend.extract_text(&doc, 0).await.unwrap(), "secret page");
    }

    #[tokio::test]
    async fn test_render_dimensions_follow_quality() {
        let backend = PlainTextBackend::new();
        let doc = source("abcd\nxy");

        let draft = backend.render_page(&doc, 0, QualityTier::Draft).await.unwrap();
        assert_eq!((draft.width, draft.height), (4, 4));

        let high = backend.render_page(&doc, 0, QualityTier::High).await.unwrap();
        assert_eq!((high.width, high.height), (16, 16));
        assert!(high.data.starts_with(&[0x89, b'P', b'N', b'G']));
    }

    #[tokio::test]
    async fn test_render_respects_max_dimension() {
        let backend = PlainTextBackend::new().with_max_dimension(8);
        let doc = source(&"x".repeat(100));
        let page = backend.render_page(&doc, 0, QualityTier::Standard).await.unwrap();
        assert_eq!(page.width, 8);
    }

    #[tokio::test]
    async fn test_page_out_of_range() {
        let backend = PlainTextBackend::new();
        let doc = source("only page");
        assert_eq!(
            backend.page_size(&doc, 1).await,
            Err(BackendError::PageOutOfRange(1))
        );
    }

    #[tokio::test]
    async fn test_page_size_in_points() {
        let backend = PlainTextBackend::new();
        let size = backend.page_size(&source("12345\n1\n1"), 0).await.unwrap();
        assert_eq!(size.width, 30.0);
        assert_eq!(size.height, 36.0);
    }

    #[tokio::test]
    async fn test_non_utf8_is_unsupported() {
        let backend = PlainTextBackend::new();
        let doc: SourceBytes = Arc::from(&[0xffu8, 0xfe, 0x00][..]);
        assert!(matches!(
            backend.open(&doc, None).await,
            Err(BackendError::Unsupported(_))
        ));
    }
}
