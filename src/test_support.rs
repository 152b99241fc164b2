//! Shared fixtures for unit tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::backend::{
    BackendError, BackendResult, DocumentInfo, PageSize, PlainTextBackend, RenderBackend,
    RenderedPage,
};
use crate::document::{QualityTier, SourceBytes};

/// Plain-text document with `count` pages reading "page 0", "page 1", ...
pub(crate) fn text_pages(count: usize) -> SourceBytes {
    let body = (0..count)
        .map(|page| format!("page {}", page))
        .collect::<Vec<_>>()
        .join("\x0c");
    Arc::from(body.as_bytes())
}

/// Wraps [`PlainTextBackend`] with call accounting, latency and failure
/// injection
pub(crate) struct ScriptedBackend {
    name: &'static str,
    renderer: PlainTextBackend,
    available: AtomicBool,
    delay: Duration,
    fail_next: AtomicUsize,
    always_fail: AtomicBool,
    rendered: Mutex<Vec<usize>>,
    size_calls: AtomicUsize,
    text_calls: AtomicUsize,
    open_calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            renderer: PlainTextBackend::new(),
            available: AtomicBool::new(true),
            delay: Duration::ZERO,
            fail_next: AtomicUsize::new(0),
            always_fail: AtomicBool::new(false),
            rendered: Mutex::new(Vec::new()),
            size_calls: AtomicUsize::new(0),
            text_calls: AtomicUsize::new(0),
            open_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn unavailable(self) -> Self {
        self.available.store(false, Ordering::SeqCst);
        self
    }

    /// Fail the next `count` page calls
    pub fn failing_times(self, count: usize) -> Self {
        self.fail_next.store(count, Ordering::SeqCst);
        self
    }

    pub fn always_failing(self) -> Self {
        self.always_fail.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_always_failing(&self, fail: bool) {
        self.always_fail.store(fail, Ordering::SeqCst);
    }

    pub fn rendered_pages(&self) -> Vec<usize> {
        self.rendered.lock().clone()
    }

    pub fn render_calls(&self) -> usize {
        self.rendered.lock().len()
    }

    pub fn size_calls(&self) -> usize {
        self.size_calls.load(Ordering::SeqCst)
    }

    pub fn text_calls(&self) -> usize {
        self.text_calls.load(Ordering::SeqCst)
    }

    /// Every native call except probes
    pub fn calls(&self) -> usize {
        self.render_calls() + self.size_calls() + self.text_calls()
            + self.open_calls.load(Ordering::SeqCst)
    }

    async fn before_call(&self) -> BackendResult<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.always_fail.load(Ordering::SeqCst) {
            return Err(BackendError::Failed(format!("{} failure", self.name)));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BackendError::Failed(format!("{} transient failure", self.name)));
        }
        Ok(())
    }
}

#[async_trait]
impl RenderBackend for ScriptedBackend {
    fn name(&self) -> &str {
        self.name
    }

    async fn probe(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn open(&self, source: &SourceBytes, password: Option<&str>) -> BackendResult<DocumentInfo> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        self.renderer.open(source, password).await
    }

    async fn render_page(
        &self,
        source: &SourceBytes,
        page: usize,
        quality: QualityTier,
    ) -> BackendResult<RenderedPage> {
        self.rendered.lock().push(page);
        self.before_call().await?;
        self.renderer.render_page(source, page, quality).await
    }

    async fn page_size(&self, source: &SourceBytes, page: usize) -> BackendResult<PageSize> {
        self.size_calls.fetch_add(1, Ordering::SeqCst);
        self.before_call().await?;
        self.renderer.page_size(source, page).await
    }

    async fn extract_text(&self, source: &SourceBytes, page: usize) -> BackendResult<String> {
        self.text_calls.fetch_add(1, Ordering::SeqCst);
        self.before_call().await?;
        self.renderer.extract_text(source, page).await
    }
}
