//! Preload scheduler
//!
//! Keeps a window of pages warm around the page being viewed. All prefetch
//! goes through the gateway at background priority, so it shares the cache
//! and in-flight deduplication with foreground calls without ever queueing
//! ahead of them.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures::stream::{FuturesOrdered, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::{AbortHandle, JoinHandle};

use super::cancel::CancellationToken;
use super::window::PreloadWindow;
use crate::cache::{CacheKey, InvalidateScope};
use crate::config::PreloadConfig;
use crate::document::{DocumentHandle, DocumentId};
use crate::error::{AccelError, Result};
use crate::gateway::{AccelerationGateway, Priority};
use crate::governor::MemoryGovernor;

#[derive(Default)]
struct DocumentState {
    window: Option<PreloadWindow>,
    pinned: BTreeSet<usize>,
    /// Token of the progressive load currently running for the document
    progressive: Option<CancellationToken>,
    /// Prefetch tasks that may still be running
    prefetches: Vec<AbortHandle>,
}

/// Handle on the prefetch work issued by one page change
///
/// Dropping it does not cancel anything; the prefetches run to completion
/// unless the document is forgotten first.
#[derive(Debug, Default)]
pub struct PreloadTicket {
    window: Option<PreloadWindow>,
    requested: Vec<usize>,
    invalidated: Vec<usize>,
    freed_bytes: usize,
    tasks: Vec<JoinHandle<bool>>,
}

impl PreloadTicket {
    pub fn window(&self) -> Option<&PreloadWindow> {
        self.window.as_ref()
    }

    /// Pages a prefetch was issued for, ascending
    pub fn requested(&self) -> &[usize] {
        &self.requested
    }

    /// Far pages dropped from the cache, ascending
    pub fn invalidated(&self) -> &[usize] {
        &self.invalidated
    }

    /// Bytes released by the governor after the window moved
    pub fn freed_bytes(&self) -> usize {
        self.freed_bytes
    }

    /// Wait for every prefetch, returning how many pages loaded cleanly
    pub async fn wait(self) -> usize {
        let mut loaded = 0;
        for task in self.tasks {
            if matches!(task.await, Ok(true)) {
                loaded += 1;
            }
        }
        loaded
    }
}

/// Result of a progressive load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressiveOutcome {
    pub loaded: usize,
    pub failed: usize,
    pub total: usize,
    /// Stopped early because a newer request superseded it
    pub cancelled: bool,
}

struct SchedulerInner {
    gateway: AccelerationGateway,
    governor: MemoryGovernor,
    config: PreloadConfig,
    documents: Mutex<HashMap<DocumentId, DocumentState>>,
}

#[derive(Clone)]
pub struct PreloadScheduler {
    inner: Arc<SchedulerInner>,
}

impl PreloadScheduler {
    pub fn new(gateway: AccelerationGateway, governor: MemoryGovernor, config: PreloadConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                gateway,
                governor,
                config,
                documents: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &PreloadConfig {
        &self.inner.config
    }

    /// Move the preload window of a document
    ///
    /// Cancels the document's progressive load, drops cached pages more than
    /// twice the radius away (pinned pages excepted) and issues background
    /// prefetches for every window page not already cached. Must be called
    /// from within a tokio runtime; returns without waiting for the
    /// prefetches.
    pub fn on_page_changed(
        &self,
        handle: &Arc<DocumentHandle>,
        center: usize,
        radius: usize,
        total_pages: usize,
    ) -> PreloadTicket {
        let document = handle.id();
        let total_pages = total_pages.min(handle.page_count());
        let window = PreloadWindow::compute(document, center, radius, total_pages);

        let pinned = {
            let mut documents = self.inner.documents.lock();
            let state = documents.entry(document).or_default();
            if let Some(token) = state.progressive.take() {
                token.cancel();
                tracing::debug!(document = %document, "Cancelled progressive load");
            }
            state.window = window.clone();
            state.pinned.clone()
        };

        let Some(window) = window else {
            return PreloadTicket::default();
        };

        let invalidated = self.invalidate_far(document, &window, &pinned);
        let (requested, tasks) = self.prefetch(handle, &window, &pinned);
        self.track_prefetches(document, &tasks);
        let freed_bytes = self.inner.governor.relieve();

        tracing::debug!(
            document = %document,
            first = window.first,
            last = window.last,
            requested = requested.len(),
            invalidated = invalidated.len(),
            "Preload window moved"
        );

        PreloadTicket {
            window: Some(window),
            requested,
            invalidated,
            freed_bytes,
            tasks,
        }
    }

    fn track_prefetches(&self, document: DocumentId, tasks: &[JoinHandle<bool>]) {
        let mut documents = self.inner.documents.lock();
        match documents.get_mut(&document) {
            Some(state) => {
                state.prefetches.retain(|task| !task.is_finished());
                state
                    .prefetches
                    .extend(tasks.iter().map(JoinHandle::abort_handle));
            }
            // Forgotten while the prefetches were being issued
            None => tasks.iter().for_each(JoinHandle::abort),
        }
    }

    fn invalidate_far(
        &self,
        document: DocumentId,
        window: &PreloadWindow,
        pinned: &BTreeSet<usize>,
    ) -> Vec<usize> {
        let cache = self.inner.gateway.cache();
        let far: Vec<usize> = cache
            .document_pages(document)
            .into_iter()
            .filter(|page| window.is_far(*page) && !pinned.contains(page))
            .collect();
        for &page in &far {
            cache.invalidate(InvalidateScope::Page { document, page });
        }
        far
    }

    fn prefetch(
        &self,
        handle: &Arc<DocumentHandle>,
        window: &PreloadWindow,
        pinned: &BTreeSet<usize>,
    ) -> (Vec<usize>, Vec<JoinHandle<bool>>) {
        let cache = self.inner.gateway.cache();
        let quality = self.inner.config.quality;
        let warm_metrics = self.inner.config.warm_metrics;

        let mut order = window.by_distance();
        // Stable: pinned pages first, otherwise nearest first
        order.sort_by_key(|page| !pinned.contains(page));

        let mut requested = Vec::new();
        let mut tasks = Vec::new();
        for page in order {
            let need_image = !cache.contains(&CacheKey::image(handle.key(page, quality)));
            let need_metrics =
                warm_metrics && !cache.contains(&CacheKey::metrics(handle.id(), page));
            if !need_image && !need_metrics {
                continue;
            }

            requested.push(page);
            let gateway = self.inner.gateway.clone();
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                let mut ok = true;
                if need_image {
                    if let Err(err) = gateway
                        .render_page(&handle, page, quality, Priority::Background)
                        .await
                    {
                        tracing::debug!(page = page, error = %err, "Prefetch render failed");
                        ok = false;
                    }
                }
                if need_metrics {
                    if let Err(err) = gateway.get_metrics(&handle, page, Priority::Background).await {
                        tracing::debug!(page = page, error = %err, "Prefetch metrics failed");
                        ok = false;
                    }
                }
                ok
            }));
        }
        requested.sort_unstable();
        (requested, tasks)
    }

    /// Load pages from `start` to the end in sequential batches
    ///
    /// Pinned pages are loaded first. `on_progress(completed, total)` runs
    /// after every page. A later `on_page_changed` or `progressive_load` for
    /// the same document stops this load at the next page boundary; pages
    /// already dispatched still complete and stay cached.
    pub async fn progressive_load<F>(
        &self,
        handle: &Arc<DocumentHandle>,
        start: usize,
        batch_size: usize,
        mut on_progress: F,
    ) -> Result<ProgressiveOutcome>
    where
        F: FnMut(usize, usize) + Send,
    {
        if batch_size == 0 {
            return Err(AccelError::InvalidRequest("batch size must be positive".to_string()));
        }
        if !handle.contains_page(start) {
            return Err(AccelError::NotFound {
                page: start,
                page_count: handle.page_count(),
            });
        }

        let document = handle.id();
        let token = CancellationToken::new();
        let pinned = {
            let mut documents = self.inner.documents.lock();
            let state = documents.entry(document).or_default();
            if let Some(previous) = state.progressive.replace(token.clone()) {
                previous.cancel();
            }
            state.pinned.clone()
        };

        let order: Vec<usize> = pinned
            .iter()
            .copied()
            .filter(|page| handle.contains_page(*page))
            .chain((start..handle.page_count()).filter(|page| !pinned.contains(page)))
            .collect();
        let total = order.len();
        let quality = self.inner.config.quality;
        let gateway = &self.inner.gateway;

        let mut outcome = ProgressiveOutcome {
            loaded: 0,
            failed: 0,
            total,
            cancelled: false,
        };

        'batches: for batch in order.chunks(batch_size) {
            if token.is_cancelled() {
                outcome.cancelled = true;
                break;
            }

            let mut pending: FuturesOrdered<_> = batch
                .iter()
                .map(|&page| async move {
                    (page, gateway.render_page(handle, page, quality, Priority::Background).await)
                })
                .collect();

            while let Some((page, result)) = pending.next().await {
                match result {
                    Ok(_) => outcome.loaded += 1,
                    Err(err) => {
                        tracing::debug!(page = page, error = %err, "Progressive load page failed");
                        outcome.failed += 1;
                    }
                }
                on_progress(outcome.loaded + outcome.failed, total);

                if token.is_cancelled() {
                    outcome.cancelled = true;
                    break 'batches;
                }
            }
        }

        {
            let mut documents = self.inner.documents.lock();
            if let Some(state) = documents.get_mut(&document) {
                if state.progressive.as_ref().is_some_and(|t| t.same_as(&token)) {
                    state.progressive = None;
                }
            }
        }

        if outcome.cancelled {
            tracing::debug!(
                document = %document,
                loaded = outcome.loaded,
                total = total,
                "Progressive load superseded"
            );
        }
        Ok(outcome)
    }

    /// Exempt pages from far-page invalidation and load them first
    pub fn pin(&self, document: DocumentId, pages: impl IntoIterator<Item = usize>) {
        let mut documents = self.inner.documents.lock();
        documents.entry(document).or_default().pinned.extend(pages);
    }

    pub fn unpin(&self, document: DocumentId, pages: impl IntoIterator<Item = usize>) {
        let mut documents = self.inner.documents.lock();
        if let Some(state) = documents.get_mut(&document) {
            for page in pages {
                state.pinned.remove(&page);
            }
        }
    }

    pub fn pinned(&self, document: DocumentId) -> Vec<usize> {
        self.inner
            .documents
            .lock()
            .get(&document)
            .map(|state| state.pinned.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Most recent window of a document
    pub fn window(&self, document: DocumentId) -> Option<PreloadWindow> {
        self.inner
            .documents
            .lock()
            .get(&document)
            .and_then(|state| state.window.clone())
    }

    /// Cancel the document's progressive load; returns whether one was running
    pub fn cancel_progressive(&self, document: DocumentId) -> bool {
        let token = self
            .inner
            .documents
            .lock()
            .get_mut(&document)
            .and_then(|state| state.progressive.take());
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop all scheduling state of a closed document, cancelling its
    /// progressive load and aborting its outstanding prefetches
    pub fn forget(&self, document: DocumentId) {
        let Some(state) = self.inner.documents.lock().remove(&document) else {
            return;
        };
        if let Some(token) = state.progressive {
            token.cancel();
        }
        let pending = state
            .prefetches
            .iter()
            .filter(|task| !task.is_finished())
            .count();
        state.prefetches.iter().for_each(AbortHandle::abort);
        if pending > 0 {
            tracing::debug!(document = %document, aborted = pending, "Aborted prefetches");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{PlainTextBackend, RenderBackend};
    use crate::cache::CacheStore;
    use crate::config::{CacheConfig, GatewayConfig, KindBudgets};
    use crate::document::{ArtifactKind, LockState, QualityTier};
    use crate::sampler::PerformanceSampler;
    use crate::test_support::{text_pages, ScriptedBackend};
    use std::time::Duration;

    struct Fixture {
        scheduler: PreloadScheduler,
        gateway: AccelerationGateway,
        fast: Arc<ScriptedBackend>,
    }

    fn fixture_with(image_budget: usize, gateway_config: GatewayConfig) -> Fixture {
        fixture_from(ScriptedBackend::new("fast"), image_budget, gateway_config)
    }

    fn fixture_from(
        fast: ScriptedBackend,
        image_budget: usize,
        gateway_config: GatewayConfig,
    ) -> Fixture {
        let fast = Arc::new(fast);
        let cache_config = CacheConfig {
            budgets: KindBudgets {
                image: image_budget,
                text: 1 << 16,
                metrics: 1 << 16,
            },
            ..CacheConfig::default()
        };
        let cache = CacheStore::new(cache_config.budgets);
        let gateway = AccelerationGateway::new(
            fast.clone(),
            Arc::new(ScriptedBackend::new("fallback")),
            cache.clone(),
            PerformanceSampler::new(100),
            gateway_config,
        );
        let governor = MemoryGovernor::new(cache, cache_config);
        let preload = PreloadConfig {
            warm_metrics: false,
            ..PreloadConfig::default()
        };
        Fixture {
            scheduler: PreloadScheduler::new(gateway.clone(), governor, preload),
            gateway,
            fast,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(1 << 24, GatewayConfig::default())
    }

    fn document(pages: usize) -> Arc<DocumentHandle> {
        Arc::new(DocumentHandle::new(text_pages(pages), pages, LockState::Open))
    }

    fn cached_images(gateway: &AccelerationGateway, doc: DocumentId) -> Vec<usize> {
        gateway
            .cache()
            .cached_pages(doc, QualityTier::Standard, ArtifactKind::Image)
    }

    #[tokio::test]
    async fn test_window_requests_exactly_its_pages() {
        let f = fixture();
        let doc = document(100);

        let ticket = f.scheduler.on_page_changed(&doc, 50, 3, 100);
        assert_eq!(ticket.requested(), &[47, 48, 49, 50, 51, 52, 53]);
        assert_eq!(ticket.wait().await, 7);

        let mut rendered = f.fast.rendered_pages();
        rendered.sort_unstable();
        assert_eq!(rendered, (47..=53).collect::<Vec<_>>());
        assert_eq!(cached_images(&f.gateway, doc.id()), (47..=53).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_cached_pages_are_not_requested_again() {
        let f = fixture();
        let doc = document(10);
        f.gateway
            .render_page(&doc, 4, QualityTier::Standard, Priority::Foreground)
            .await
            .unwrap();

        let ticket = f.scheduler.on_page_changed(&doc, 4, 1, 10);
        assert_eq!(ticket.requested(), &[3, 5]);
        ticket.wait().await;
        assert_eq!(f.fast.render_calls(), 3);
    }

    #[tokio::test]
    async fn test_far_pages_are_invalidated_unless_pinned() {
        let f = fixture();
        let doc = document(20);
        for page in 0..=10 {
            f.gateway
                .render_page(&doc, page, QualityTier::Standard, Priority::Foreground)
                .await
                .unwrap();
        }
        f.scheduler.pin(doc.id(), [1]);

        let ticket = f.scheduler.on_page_changed(&doc, 10, 2, 20);
        assert_eq!(ticket.invalidated(), &[0, 2, 3, 4, 5]);
        ticket.wait().await;

        let cached = cached_images(&f.gateway, doc.id());
        assert_eq!(cached, vec![1, 6, 7, 8, 9, 10, 11, 12]);
    }

    #[tokio::test]
    async fn test_sequential_navigation_stays_within_budget() {
        let doc = document(10);
        let page_size = PlainTextBackend::new()
            .render_page(doc.source(), 0, QualityTier::Standard)
            .await
            .unwrap()
            .data
            .len();
        let config = GatewayConfig {
            background_workers: 1,
            ..GatewayConfig::default()
        };
        let f = fixture_with(page_size * 5, config);

        for center in 0..10 {
            f.scheduler.on_page_changed(&doc, center, 2, 10).wait().await;
            assert!(f.gateway.cache().usage().entries(ArtifactKind::Image) <= 5);
        }

        let cached = cached_images(&f.gateway, doc.id());
        assert!(cached.len() <= 5);
        for page in 7..=9 {
            assert!(cached.contains(&page));
        }
        assert!(cached.iter().all(|page| *page >= 5));
    }

    #[tokio::test]
    async fn test_progressive_load_loads_pinned_first() {
        let f = fixture();
        let doc = document(10);
        f.scheduler.pin(doc.id(), [7]);

        let mut progress = Vec::new();
        let outcome = f
            .scheduler
            .progressive_load(&doc, 5, 1, |current, total| progress.push((current, total)))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ProgressiveOutcome {
                loaded: 5,
                failed: 0,
                total: 5,
                cancelled: false
            }
        );
        assert_eq!(progress, vec![(1, 5), (2, 5), (3, 5), (4, 5), (5, 5)]);
        assert_eq!(f.fast.rendered_pages(), vec![7, 5, 6, 8, 9]);
    }

    #[tokio::test]
    async fn test_page_change_cancels_progressive_load() {
        let f = fixture();
        let doc = document(10);
        let scheduler = f.scheduler.clone();

        let mut progress = Vec::new();
        let outcome = f
            .scheduler
            .progressive_load(&doc, 0, 1, |current, total| {
                progress.push((current, total));
                if current == 3 {
                    scheduler.on_page_changed(&doc, 0, 10, 10);
                }
            })
            .await
            .unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.loaded, 3);
        assert_eq!(progress, vec![(1, 10), (2, 10), (3, 10)]);
        let cached = cached_images(&f.gateway, doc.id());
        assert!(cached.starts_with(&[0, 1, 2]));
    }

    #[tokio::test]
    async fn test_progressive_load_rejects_bad_requests() {
        let f = fixture();
        let doc = document(3);
        assert!(matches!(
            f.scheduler.progressive_load(&doc, 0, 0, |_, _| {}).await,
            Err(AccelError::InvalidRequest(_))
        ));
        assert!(matches!(
            f.scheduler.progressive_load(&doc, 3, 1, |_, _| {}).await,
            Err(AccelError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_forget_drops_state() {
        let f = fixture();
        let doc = document(5);
        f.scheduler.pin(doc.id(), [1, 2]);
        f.scheduler.on_page_changed(&doc, 2, 1, 5).wait().await;
        assert!(f.scheduler.window(doc.id()).is_some());

        f.scheduler.forget(doc.id());
        assert!(f.scheduler.window(doc.id()).is_none());
        assert!(f.scheduler.pinned(doc.id()).is_empty());
        assert!(!f.scheduler.cancel_progressive(doc.id()));
    }

    #[tokio::test]
    async fn test_forget_aborts_outstanding_prefetches() {
        let config = GatewayConfig {
            background_workers: 1,
            ..GatewayConfig::default()
        };
        let slow = ScriptedBackend::new("slow").with_delay(Duration::from_millis(50));
        let f = fixture_from(slow, 1 << 24, config);
        let doc = document(10);

        let ticket = f.scheduler.on_page_changed(&doc, 5, 2, 10);
        assert_eq!(ticket.requested().len(), 5);
        tokio::time::sleep(Duration::from_millis(10)).await;
        f.scheduler.forget(doc.id());

        // Nothing had finished when the prefetches were aborted
        assert_eq!(ticket.wait().await, 0);
    }
}
