//! Engine facade
//!
//! [`AccelEngine`] wires the registry, cache, gateway, scheduler, governor
//! and sampler together and exposes the document-id based contract consumed
//! by viewing surfaces.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::backend::{BridgeBackend, PlainTextBackend, RenderBackend};
use crate::cache::{CacheStats, CacheStore, DocumentCacheStats, InvalidateScope};
use crate::config::EngineConfig;
use crate::document::{
    ArtifactKind, DocumentHandle, DocumentId, DocumentRegistry, LockState, PageKey, QualityTier,
    SourceBytes,
};
use crate::error::{AccelError, Result};
use crate::gateway::{
    AccelerationGateway, PageMetrics, PathUsed, Priority, RenderResult, TextMatch,
};
use crate::governor::{MemoryGovernor, MemoryReport};
use crate::sampler::{PerformanceSampler, PerformanceSummary};
use crate::scheduler::{PreloadScheduler, PreloadTicket, ProgressiveOutcome};

/// Part of a document's cache to clear
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum CacheScope {
    /// Every artifact of the document
    Document,
    /// One page across tiers and kinds
    Page { page: usize },
    /// Artifacts stored under one tier of one page
    Rendition { page: usize, quality: QualityTier },
    /// One artifact kind
    Kind { kind: ArtifactKind },
}

impl CacheScope {
    fn for_document(self, document: DocumentId) -> InvalidateScope {
        match self {
            CacheScope::Document => InvalidateScope::Document(document),
            CacheScope::Page { page } => InvalidateScope::Page { document, page },
            CacheScope::Rendition { page, quality } => {
                InvalidateScope::Key(PageKey::new(document, page, quality))
            }
            CacheScope::Kind { kind } => InvalidateScope::Kind {
                document: Some(document),
                kind,
            },
        }
    }
}

/// Serializable render outcome, successful or not
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderResponse {
    pub success: bool,
    #[serde(skip)]
    pub artifact: Option<Arc<[u8]>>,
    pub artifact_len: Option<usize>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_ms: u64,
    pub path_used: Option<PathUsed>,
    pub error: Option<String>,
}

impl RenderResponse {
    fn from_result(result: Result<RenderResult>, started: Instant) -> Self {
        match result {
            Ok(render) => Self {
                success: true,
                artifact_len: Some(render.byte_len()),
                artifact: Some(render.artifact),
                width: Some(render.width),
                height: Some(render.height),
                duration_ms: render.duration_ms,
                path_used: Some(render.path_used),
                error: None,
            },
            Err(err) => Self {
                success: false,
                artifact: None,
                artifact_len: None,
                width: None,
                height: None,
                duration_ms: started.elapsed().as_millis() as u64,
                path_used: None,
                error: Some(err.to_string()),
            },
        }
    }
}

struct EngineInner {
    config: EngineConfig,
    registry: DocumentRegistry,
    cache: CacheStore,
    sampler: PerformanceSampler,
    gateway: AccelerationGateway,
    scheduler: PreloadScheduler,
    governor: MemoryGovernor,
}

/// Page acceleration engine
///
/// Cloning is cheap; clones share every component.
#[derive(Clone)]
pub struct AccelEngine {
    inner: Arc<EngineInner>,
}

impl AccelEngine {
    pub fn new(
        config: EngineConfig,
        fast: Arc<dyn RenderBackend>,
        fallback: Arc<dyn RenderBackend>,
    ) -> Self {
        let cache = CacheStore::new(config.cache.budgets);
        let sampler = PerformanceSampler::new(config.sampler.capacity);
        let gateway = AccelerationGateway::new(
            fast,
            fallback,
            cache.clone(),
            sampler.clone(),
            config.gateway.clone(),
        );
        let governor = MemoryGovernor::new(cache.clone(), config.cache.clone());
        let scheduler =
            PreloadScheduler::new(gateway.clone(), governor.clone(), config.preload.clone());

        Self {
            inner: Arc::new(EngineInner {
                config,
                registry: DocumentRegistry::new(),
                cache,
                sampler,
                gateway,
                scheduler,
                governor,
            }),
        }
    }

    /// Engine for plain-text documents
    ///
    /// The renderer is called directly on the fast path and through a
    /// [`BridgeBackend`] on the fallback path. Must be called from within a
    /// tokio runtime.
    pub fn with_plain_text(config: EngineConfig) -> Self {
        let renderer = Arc::new(PlainTextBackend::new());
        let bridge = Arc::new(BridgeBackend::spawn(renderer.clone()));
        Self::new(config, renderer, bridge)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &DocumentRegistry {
        &self.inner.registry
    }

    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    pub fn gateway(&self) -> &AccelerationGateway {
        &self.inner.gateway
    }

    pub fn scheduler(&self) -> &PreloadScheduler {
        &self.inner.scheduler
    }

    pub fn governor(&self) -> &MemoryGovernor {
        &self.inner.governor
    }

    pub fn sampler(&self) -> &PerformanceSampler {
        &self.inner.sampler
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Open a document from its source bytes
    ///
    /// Password protected documents fail with `Locked` unless `password`
    /// unlocks them.
    pub async fn open_document(
        &self,
        source: impl Into<SourceBytes>,
        password: Option<&str>,
    ) -> Result<Arc<DocumentHandle>> {
        let source: SourceBytes = source.into();
        let info = self.inner.gateway.open(&source, password).await?;
        let lock_state = if info.encrypted {
            LockState::Unlocked
        } else {
            LockState::Open
        };

        let handle = self
            .inner
            .registry
            .insert(DocumentHandle::new(source, info.page_count, lock_state));
        tracing::info!(
            document = %handle.id(),
            pages = handle.page_count(),
            bytes = handle.descriptor().byte_len,
            digest = %handle.descriptor().digest,
            "Opened document"
        );
        Ok(handle)
    }

    pub fn document(&self, document: DocumentId) -> Result<Arc<DocumentHandle>> {
        self.inner.registry.get(document)
    }

    /// Close a document, dropping its cache entries and scheduling state;
    /// returns the number of cache entries removed
    ///
    /// Prefetches still running are aborted, and results of executions that
    /// were already in flight are not cached.
    pub fn close_document(&self, document: DocumentId) -> Result<usize> {
        let handle = self
            .inner
            .registry
            .remove(document)
            .ok_or_else(|| AccelError::DocumentNotOpen(document.to_string()))?;
        self.inner.scheduler.forget(document);
        let removed = self.inner.cache.retire_document(document);
        tracing::info!(
            document = %document,
            pages = handle.page_count(),
            removed_entries = removed,
            "Closed document"
        );
        Ok(removed)
    }

    /// Lifecycle notification from the viewing surface; same as
    /// [`close_document`](Self::close_document)
    pub fn on_document_closed(&self, document: DocumentId) -> Result<usize> {
        self.close_document(document)
    }

    // ========================================================================
    // Page operations
    // ========================================================================

    pub async fn render_page(
        &self,
        document: DocumentId,
        page: usize,
        quality: QualityTier,
    ) -> Result<RenderResult> {
        let handle = self.document(document)?;
        self.inner
            .gateway
            .render_page(&handle, page, quality, Priority::Foreground)
            .await
    }

    /// Render as a serializable response that carries failures inline
    pub async fn render_page_response(
        &self,
        document: DocumentId,
        page: usize,
        quality: QualityTier,
    ) -> RenderResponse {
        let started = Instant::now();
        RenderResponse::from_result(self.render_page(document, page, quality).await, started)
    }

    pub async fn get_page_metrics(&self, document: DocumentId, page: usize) -> Result<PageMetrics> {
        let handle = self.document(document)?;
        self.inner
            .gateway
            .get_metrics(&handle, page, Priority::Foreground)
            .await
    }

    /// Search pages `start_page..=end_page`
    pub async fn search_text(
        &self,
        document: DocumentId,
        query: &str,
        start_page: usize,
        end_page: usize,
        case_sensitive: bool,
    ) -> Result<Vec<TextMatch>> {
        let handle = self.document(document)?;
        self.inner
            .gateway
            .search_text(&handle, query, start_page..=end_page, case_sensitive)
            .await
    }

    // ========================================================================
    // Cache control
    // ========================================================================

    /// Returns the number of entries removed
    pub fn clear_cache(&self, document: DocumentId, scope: CacheScope) -> Result<usize> {
        self.document(document)?;
        Ok(self.inner.cache.invalidate(scope.for_document(document)))
    }

    /// Shrink a document's cache to the optimized budget; returns bytes freed
    pub fn optimize_memory(&self, document: DocumentId) -> Result<usize> {
        self.document(document)?;
        Ok(self.inner.governor.optimize(document))
    }

    pub fn get_cache_stats(&self, document: DocumentId) -> Result<DocumentCacheStats> {
        self.document(document)?;
        Ok(self.inner.cache.document_stats(document))
    }

    pub fn global_cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub fn memory_report(&self) -> MemoryReport {
        self.inner.governor.report()
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Viewing surface moved to `page`; warms the configured radius around it
    pub fn on_page_changed(
        &self,
        document: DocumentId,
        page: usize,
        total_pages: usize,
    ) -> Result<PreloadTicket> {
        let handle = self.document(document)?;
        let radius = self.inner.config.preload.radius;
        Ok(self
            .inner
            .scheduler
            .on_page_changed(&handle, page, radius, total_pages))
    }

    /// Load the document from `start_page` in configured batches
    pub async fn progressive_load<F>(
        &self,
        document: DocumentId,
        start_page: usize,
        on_progress: F,
    ) -> Result<ProgressiveOutcome>
    where
        F: FnMut(usize, usize) + Send,
    {
        let handle = self.document(document)?;
        let batch_size = self.inner.config.preload.batch_size;
        self.inner
            .scheduler
            .progressive_load(&handle, start_page, batch_size, on_progress)
            .await
    }

    pub fn pin_pages(&self, document: DocumentId, pages: &[usize]) -> Result<()> {
        self.document(document)?;
        self.inner.scheduler.pin(document, pages.iter().copied());
        Ok(())
    }

    // ========================================================================
    // Capability and instrumentation
    // ========================================================================

    pub async fn check_fast_path_availability(&self) -> bool {
        self.inner.gateway.availability().await.fast_path_available
    }

    pub fn performance_summary(&self) -> PerformanceSummary {
        self.inner.sampler.aggregate()
    }
}
