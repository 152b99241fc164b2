//! Acceleration gateway
//!
//! Every page operation follows the same route:
//!
//! ```text
//! cache hit ─────────────────────────────────────────────► cached result
//! cache miss ─► in-flight? ─ yes ─► attach ──────────────► shared result
//!                          └ no ──► permit ─► fast path ─► store, result
//!                                               │ fails
//!                                               ▼
//!                                          fallback path ─► store, result
//!                                               │ fails
//!                                               ▼
//!                                             error
//! ```
//!
//! The fast path is skipped entirely when its probe reports it unavailable.
//! Only one fallback attempt is made per execution. Executions run on their
//! own tokio task, so a caller that stops waiting does not abandon the
//! native call; its result is still cached.

use std::future::Future;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;

use super::inflight::{Claim, InFlightTable};
use super::pool::{PoolStats, PriorityHint, WorkerPool};
use super::search::find_matches;
use super::types::{
    Availability, PageMetrics, PathUsed, Priority, RenderResult, RenderedArtifact, TextMatch,
};
use crate::backend::{BackendError, BackendResult, DocumentInfo, PageSize, RenderBackend};
use crate::cache::{CacheEntry, CacheKey, CacheStore};
use crate::config::GatewayConfig;
use crate::document::{ArtifactKind, DocumentHandle, QualityTier, SourceBytes};
use crate::error::{AccelError, Result};
use crate::sampler::{Operation, Outcome, PerformanceSample, PerformanceSampler, SampleScope};

/// Whether a backend error is a failure of the route rather than a verdict
/// about the request; only route failures are retried on the fallback path
fn is_path_failure(err: &BackendError) -> bool {
    matches!(err, BackendError::Failed(_))
}

fn into_accel_error(err: BackendError, page_count: usize) -> AccelError {
    match err {
        BackendError::PageOutOfRange(page) => AccelError::NotFound { page, page_count },
        BackendError::PasswordRequired => AccelError::Locked("password required".to_string()),
        BackendError::InvalidPassword => AccelError::Locked("invalid password".to_string()),
        BackendError::Unsupported(msg) => AccelError::InvalidRequest(msg),
        BackendError::Failed(msg) => AccelError::NativePathFailure(msg),
    }
}

fn check_page(handle: &DocumentHandle, page: usize) -> Result<()> {
    if handle.contains_page(page) {
        Ok(())
    } else {
        Err(AccelError::NotFound {
            page,
            page_count: handle.page_count(),
        })
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Run `task` on its own tokio task and expose it as a shareable future
fn spawn_shared<T, F>(task: F) -> BoxFuture<'static, Result<T>>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let handle = tokio::spawn(task);
    async move {
        handle.await.unwrap_or_else(|e| {
            Err(AccelError::NativePathFailure(format!("Task join error: {}", e)))
        })
    }
    .boxed()
}

fn decode_metrics(entry: &CacheEntry) -> Option<PageSize> {
    serde_json::from_slice(&entry.data).ok()
}

fn decode_text(entry: &CacheEntry) -> Option<Arc<str>> {
    std::str::from_utf8(&entry.data).ok().map(Arc::from)
}

fn cached_artifact(entry: CacheEntry) -> RenderedArtifact {
    let (width, height) = entry.dimensions.unwrap_or((0, 0));
    RenderedArtifact {
        data: entry.data,
        width,
        height,
        path: PathUsed::Cache,
    }
}

struct GatewayInner {
    fast: Arc<dyn RenderBackend>,
    fallback: Arc<dyn RenderBackend>,
    cache: CacheStore,
    sampler: PerformanceSampler,
    pool: WorkerPool,
    config: GatewayConfig,
    /// Fast path probe result, `None` until first probed
    fast_available: RwLock<Option<bool>>,
    renders: InFlightTable<RenderedArtifact>,
    metrics: InFlightTable<PageSize>,
    texts: InFlightTable<Arc<str>>,
}

impl GatewayInner {
    fn record(&self, operation: Operation, scope: SampleScope, duration: Duration, outcome: Outcome) {
        self.sampler
            .record(PerformanceSample::new(operation, scope, duration, outcome));
    }

    async fn probe(&self, force: bool) -> bool {
        if !force {
            let known = *self.fast_available.read();
            if let Some(available) = known {
                return available;
            }
        }

        let available = self.fast.probe().await;
        let previous = self.fast_available.write().replace(available);
        if !available && previous != Some(false) {
            tracing::warn!(
                backend = self.fast.name(),
                fallback = self.fallback.name(),
                "Fast path unavailable, using fallback path"
            );
        } else if available && previous != Some(true) {
            tracing::info!(backend = self.fast.name(), "Fast path available");
        }
        available
    }

    /// Run one native call through the fast path, retrying once on the
    /// fallback path when the fast path fails or times out
    async fn execute<T, F, Fut>(
        &self,
        operation: Operation,
        scope: SampleScope,
        page_count: usize,
        call: F,
    ) -> Result<(T, PathUsed)>
    where
        F: Fn(Arc<dyn RenderBackend>) -> Fut,
        Fut: Future<Output = BackendResult<T>>,
    {
        let started = Instant::now();

        if self.probe(false).await {
            let fast_timeout = self.config.fast_timeout();
            let failure = match tokio::time::timeout(fast_timeout, call(self.fast.clone())).await {
                Ok(Ok(value)) => {
                    self.record(operation, scope, started.elapsed(), Outcome::Miss);
                    return Ok((value, PathUsed::Fast));
                }
                Ok(Err(err)) if !is_path_failure(&err) => {
                    self.record(operation, scope, started.elapsed(), Outcome::Error);
                    return Err(into_accel_error(err, page_count));
                }
                Ok(Err(err)) => err.to_string(),
                Err(_) => format!("timed out after {} ms", fast_timeout.as_millis()),
            };
            self.record(operation, scope, started.elapsed(), Outcome::Error);
            tracing::warn!(
                operation = ?operation,
                backend = self.fast.name(),
                error = %failure,
                "Fast path failed, retrying on fallback path"
            );
        }

        let fallback_timeout = self.config.fallback_timeout();
        match tokio::time::timeout(fallback_timeout, call(self.fallback.clone())).await {
            Ok(Ok(value)) => {
                self.record(operation, scope, started.elapsed(), Outcome::Fallback);
                Ok((value, PathUsed::Fallback))
            }
            Ok(Err(err)) => {
                self.record(operation, scope, started.elapsed(), Outcome::Error);
                tracing::warn!(
                    operation = ?operation,
                    backend = self.fallback.name(),
                    error = %err,
                    "Fallback path failed"
                );
                Err(into_accel_error(err, page_count))
            }
            Err(_) => {
                self.record(operation, scope, started.elapsed(), Outcome::Error);
                Err(AccelError::Timeout(fallback_timeout.as_millis() as u64))
            }
        }
    }

    /// Queued work for a closed document is dropped once it gets a permit
    fn ensure_open(&self, key: &CacheKey) -> Result<()> {
        let document = key.page.document;
        if self.cache.is_retired(document) {
            return Err(AccelError::DocumentNotOpen(document.to_string()));
        }
        Ok(())
    }

    fn store(&self, key: CacheKey, entry: CacheEntry) {
        if let Err(err) = self.cache.put(key, entry) {
            tracing::debug!(key = %key.page, error = %err, "Result returned without caching");
        }
    }

    /// Cache a successful result, then release the in-flight slot
    fn conclude<T>(
        &self,
        table: &InFlightTable<T>,
        key: CacheKey,
        result: &Result<T>,
        entry: impl FnOnce(&T) -> Option<CacheEntry>,
    ) where
        T: Clone + Send + Sync + 'static,
    {
        if let Ok(value) = result {
            if let Some(entry) = entry(value) {
                self.store(key, entry);
            }
        }
        table.finish(&key);
    }

    async fn render_task(
        self: Arc<Self>,
        key: CacheKey,
        source: SourceBytes,
        page_count: usize,
        hint: Arc<PriorityHint>,
    ) -> Result<RenderedArtifact> {
        let result = async {
            let _permit = self.pool.acquire(&hint).await?;
            self.ensure_open(&key)?;
            let (page, quality) = (key.page.page, key.page.quality);
            let (rendered, path) = self
                .execute(Operation::Render, SampleScope::Page(key.page), page_count, |backend| {
                    let source = source.clone();
                    async move { backend.render_page(&source, page, quality).await }
                })
                .await?;
            Ok(RenderedArtifact {
                data: Arc::from(rendered.data),
                width: rendered.width,
                height: rendered.height,
                path,
            })
        }
        .await;

        self.conclude(&self.renders, key, &result, |artifact: &RenderedArtifact| {
            Some(
                CacheEntry::new(ArtifactKind::Image, artifact.data.clone())
                    .with_dimensions(artifact.width, artifact.height),
            )
        });
        result
    }

    async fn metrics_task(
        self: Arc<Self>,
        key: CacheKey,
        source: SourceBytes,
        page_count: usize,
        hint: Arc<PriorityHint>,
    ) -> Result<PageSize> {
        let result = async {
            let _permit = self.pool.acquire(&hint).await?;
            self.ensure_open(&key)?;
            let page = key.page.page;
            let (size, _) = self
                .execute(Operation::Metrics, SampleScope::Page(key.page), page_count, |backend| {
                    let source = source.clone();
                    async move { backend.page_size(&source, page).await }
                })
                .await?;
            Ok(size)
        }
        .await;

        self.conclude(&self.metrics, key, &result, |size: &PageSize| {
            let encoded = serde_json::to_vec(size).ok()?;
            Some(CacheEntry::new(ArtifactKind::Metrics, Arc::from(encoded)))
        });
        result
    }

    async fn text_task(
        self: Arc<Self>,
        key: CacheKey,
        source: SourceBytes,
        page_count: usize,
        hint: Arc<PriorityHint>,
    ) -> Result<Arc<str>> {
        let result = async {
            let _permit = self.pool.acquire(&hint).await?;
            self.ensure_open(&key)?;
            let page = key.page.page;
            let (text, _) = self
                .execute(Operation::Text, SampleScope::Page(key.page), page_count, |backend| {
                    let source = source.clone();
                    async move { backend.extract_text(&source, page).await }
                })
                .await?;
            Ok(Arc::<str>::from(text))
        }
        .await;

        self.conclude(&self.texts, key, &result, |text: &Arc<str>| {
            Some(CacheEntry::new(ArtifactKind::Text, Arc::from(text.as_bytes())))
        });
        result
    }
}

/// Single entry point for page operations
///
/// Cloning is cheap; clones share the cache, in-flight tables and worker
/// pool.
#[derive(Clone)]
pub struct AccelerationGateway {
    inner: Arc<GatewayInner>,
}

impl AccelerationGateway {
    pub fn new(
        fast: Arc<dyn RenderBackend>,
        fallback: Arc<dyn RenderBackend>,
        cache: CacheStore,
        sampler: PerformanceSampler,
        config: GatewayConfig,
    ) -> Self {
        let pool = WorkerPool::new(config.foreground_workers, config.background_workers);
        Self {
            inner: Arc::new(GatewayInner {
                fast,
                fallback,
                cache,
                sampler,
                pool,
                config,
                fast_available: RwLock::new(None),
                renders: InFlightTable::new(),
                metrics: InFlightTable::new(),
                texts: InFlightTable::new(),
            }),
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    pub fn sampler(&self) -> &PerformanceSampler {
        &self.inner.sampler
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// Pending executions across all operations
    pub fn in_flight(&self) -> usize {
        self.inner.renders.len() + self.inner.metrics.len() + self.inner.texts.len()
    }

    // ========================================================================
    // Capability
    // ========================================================================

    /// Fast path capability, probed once and cached
    pub async fn availability(&self) -> Availability {
        Availability {
            fast_path_available: self.inner.probe(false).await,
        }
    }

    /// Probe the fast path, re-running the probe when `force` is set
    pub async fn probe_availability(&self, force: bool) -> bool {
        self.inner.probe(force).await
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Inspect a document's source bytes through the usual path selection
    pub async fn open(&self, source: &SourceBytes, password: Option<&str>) -> Result<DocumentInfo> {
        let hint = PriorityHint::new(Priority::Foreground);
        let _permit = self.inner.pool.acquire(&hint).await?;
        let password = password.map(str::to_string);
        let (info, path) = self
            .inner
            .execute(Operation::Open, SampleScope::Global, 0, |backend| {
                let source = source.clone();
                let password = password.clone();
                async move { backend.open(&source, password.as_deref()).await }
            })
            .await?;
        tracing::debug!(path = ?path, pages = info.page_count, "Document inspected");
        Ok(info)
    }

    /// Wait for a claim; the flag is set when the value came from the cache
    async fn settle<T>(
        &self,
        claim: Claim<T>,
        key: &CacheKey,
        operation: Operation,
        started: Instant,
    ) -> Result<(T, bool)>
    where
        T: Clone + Send + Sync + 'static,
    {
        match claim {
            Claim::Cached(value) => {
                self.inner.record(
                    operation,
                    SampleScope::Page(key.page),
                    started.elapsed(),
                    Outcome::Hit,
                );
                Ok((value, true))
            }
            Claim::Pending { future, leader } => {
                if !leader {
                    tracing::debug!(key = %key.page, operation = ?operation, "Attached to in-flight request");
                }
                future.await.map(|value| (value, false))
            }
        }
    }

    /// Render a page image
    pub async fn render_page(
        &self,
        handle: &DocumentHandle,
        page: usize,
        quality: QualityTier,
        priority: Priority,
    ) -> Result<RenderResult> {
        let started = Instant::now();
        check_page(handle, page)?;
        let key = CacheKey::image(handle.key(page, quality));

        let artifact = match self.inner.cache.get(&key) {
            Some(entry) => {
                self.inner.record(
                    Operation::Render,
                    SampleScope::Page(key.page),
                    started.elapsed(),
                    Outcome::Hit,
                );
                tracing::debug!(key = %key.page, "Render served from cache");
                cached_artifact(entry)
            }
            None => {
                let inner = self.inner.clone();
                let source = handle.source().clone();
                let page_count = handle.page_count();
                let claim = self.inner.renders.claim(
                    &key,
                    priority,
                    || self.inner.cache.peek(&key).map(cached_artifact),
                    |hint| spawn_shared(inner.render_task(key, source, page_count, hint)),
                );
                self.settle(claim, &key, Operation::Render, started).await?.0
            }
        };

        Ok(RenderResult {
            artifact: artifact.data,
            width: artifact.width,
            height: artifact.height,
            duration_ms: elapsed_ms(started),
            path_used: artifact.path,
        })
    }

    /// Page dimensions in points
    pub async fn get_metrics(
        &self,
        handle: &DocumentHandle,
        page: usize,
        priority: Priority,
    ) -> Result<PageMetrics> {
        let started = Instant::now();
        check_page(handle, page)?;
        let key = CacheKey::metrics(handle.id(), page);

        let cached = self.inner.cache.get(&key).as_ref().and_then(decode_metrics);
        let (size, from_cache) = match cached {
            Some(size) => {
                self.inner.record(
                    Operation::Metrics,
                    SampleScope::Page(key.page),
                    started.elapsed(),
                    Outcome::Hit,
                );
                (size, true)
            }
            None => {
                let inner = self.inner.clone();
                let source = handle.source().clone();
                let page_count = handle.page_count();
                let claim = self.inner.metrics.claim(
                    &key,
                    priority,
                    || self.inner.cache.peek(&key).as_ref().and_then(decode_metrics),
                    |hint| spawn_shared(inner.metrics_task(key, source, page_count, hint)),
                );
                self.settle(claim, &key, Operation::Metrics, started).await?
            }
        };

        Ok(PageMetrics {
            width: size.width,
            height: size.height,
            from_cache,
        })
    }

    /// Plain text of a page, cached as a text artifact
    pub async fn extract_text(
        &self,
        handle: &DocumentHandle,
        page: usize,
        priority: Priority,
    ) -> Result<Arc<str>> {
        let started = Instant::now();
        check_page(handle, page)?;
        let key = CacheKey::text(handle.id(), page);

        if let Some(text) = self.inner.cache.get(&key).as_ref().and_then(decode_text) {
            self.inner.record(
                Operation::Text,
                SampleScope::Page(key.page),
                started.elapsed(),
                Outcome::Hit,
            );
            return Ok(text);
        }

        let inner = self.inner.clone();
        let source = handle.source().clone();
        let page_count = handle.page_count();
        let claim = self.inner.texts.claim(
            &key,
            priority,
            || self.inner.cache.peek(&key).as_ref().and_then(decode_text),
            |hint| spawn_shared(inner.text_task(key, source, page_count, hint)),
        );
        Ok(self.settle(claim, &key, Operation::Text, started).await?.0)
    }

    /// Search pages in `pages` (inclusive) for `query`
    ///
    /// The end of the range is clamped to the last page; the start must be a
    /// valid page. An empty query matches nothing.
    pub async fn search_text(
        &self,
        handle: &DocumentHandle,
        query: &str,
        pages: RangeInclusive<usize>,
        case_sensitive: bool,
    ) -> Result<Vec<TextMatch>> {
        let (start, end) = (*pages.start(), *pages.end());
        if start > end {
            return Err(AccelError::InvalidRequest(format!(
                "empty page range {}..={}",
                start, end
            )));
        }
        if query.is_empty() {
            return Ok(Vec::new());
        }
        check_page(handle, start)?;
        let end = end.min(handle.page_count().saturating_sub(1));

        let limit = self.inner.config.max_search_results;
        let context_chars = self.inner.config.search_context_chars;
        let mut results = Vec::new();
        for page in start..=end {
            let text = self.extract_text(handle, page, Priority::Foreground).await?;
            let remaining = limit - results.len();
            results.extend(
                find_matches(&text, query, case_sensitive, context_chars, remaining)
                    .into_iter()
                    .map(|(position, context)| TextMatch {
                        page,
                        position,
                        context,
                    }),
            );
            if results.len() >= limit {
                tracing::debug!(limit = limit, page = page, "Search result limit reached");
                break;
            }
        }

        tracing::debug!(
            document = %handle.id(),
            start = start,
            end = end,
            matches = results.len(),
            "Search complete"
        );
        Ok(results)
    }
}
