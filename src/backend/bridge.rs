//! Asynchronous bridge to a renderer
//!
//! Every call is serialized into a [`BridgeJob`], queued on a bounded channel
//! and executed one at a time by a dedicated worker task, which answers over
//! a oneshot channel. Slower than calling the backend directly, but it never
//! shares the caller's task with native work.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::{BackendError, BackendResult, DocumentInfo, PageSize, RenderBackend, RenderedPage};
use crate::document::{QualityTier, SourceBytes};

const DEFAULT_QUEUE_DEPTH: usize = 64;

enum BridgeJob {
    Probe {
        reply: oneshot::Sender<bool>,
    },
    Open {
        source: SourceBytes,
        password: Option<String>,
        reply: oneshot::Sender<BackendResult<DocumentInfo>>,
    },
    Render {
        source: SourceBytes,
        page: usize,
        quality: QualityTier,
        reply: oneshot::Sender<BackendResult<RenderedPage>>,
    },
    PageSize {
        source: SourceBytes,
        page: usize,
        reply: oneshot::Sender<BackendResult<PageSize>>,
    },
    Text {
        source: SourceBytes,
        page: usize,
        reply: oneshot::Sender<BackendResult<String>>,
    },
}

/// Worker loop; exits when every sender is gone
async fn run_bridge(backend: Arc<dyn RenderBackend>, mut jobs: mpsc::Receiver<BridgeJob>) {
    while let Some(job) = jobs.recv().await {
        // A dropped receiver means the caller stopped waiting; the work is
        // still carried out so the backend is never left mid-operation.
        match job {
            BridgeJob::Probe { reply } => {
                let _ = reply.send(backend.probe().await);
            }
            BridgeJob::Open {
                source,
                password,
                reply,
            } => {
                let _ = reply.send(backend.open(&source, password.as_deref()).await);
            }
            BridgeJob::Render {
                source,
                page,
                quality,
                reply,
            } => {
                let _ = reply.send(backend.render_page(&source, page, quality).await);
            }
            BridgeJob::PageSize {
                source,
                page,
                reply,
            } => {
                let _ = reply.send(backend.page_size(&source, page).await);
            }
            BridgeJob::Text {
                source,
                page,
                reply,
            } => {
                let _ = reply.send(backend.extract_text(&source, page).await);
            }
        }
    }
    tracing::debug!(backend = backend.name(), "Bridge worker stopped");
}

/// Channel-backed adapter that runs another backend on its own worker task
#[derive(Clone)]
pub struct BridgeBackend {
    name: String,
    jobs: mpsc::Sender<BridgeJob>,
}

impl BridgeBackend {
    /// Start the bridge worker
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(backend: Arc<dyn RenderBackend>) -> Self {
        Self::with_queue_depth(backend, DEFAULT_QUEUE_DEPTH)
    }

    pub fn with_queue_depth(backend: Arc<dyn RenderBackend>, queue_depth: usize) -> Self {
        let (jobs, receiver) = mpsc::channel(queue_depth.max(1));
        let name = format!("bridge({})", backend.name());
        tokio::spawn(run_bridge(backend, receiver));
        Self { name, jobs }
    }

    async fn call<T>(&self, job: impl FnOnce(oneshot::Sender<T>) -> BridgeJob) -> BackendResult<T> {
        let (reply, response) = oneshot::channel();
        self.jobs
            .send(job(reply))
            .await
            .map_err(|_| BackendError::Failed("bridge worker is gone".to_string()))?;
        response
            .await
            .map_err(|_| BackendError::Failed("bridge worker dropped the reply".to_string()))
    }
}

#[async_trait]
impl RenderBackend for BridgeBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> bool {
        self.call(|reply| BridgeJob::Probe { reply })
            .await
            .unwrap_or(false)
    }

    async fn open(&self, source: &SourceBytes, password: Option<&str>) -> BackendResult<DocumentInfo> {
        let source = source.clone();
        let password = password.map(str::to_string);
        self.call(|reply| BridgeJob::Open {
            source,
            password,
            reply,
        })
        .await?
    }

    async fn render_page(
        &self,
        source: &SourceBytes,
        page: usize,
        quality: QualityTier,
    ) -> BackendResult<RenderedPage> {
        let source = source.clone();
        self.call(|reply| BridgeJob::Render {
            source,
            page,
            quality,
            reply,
        })
        .await?
    }

    async fn page_size(&self, source: &SourceBytes, page: usize) -> BackendResult<PageSize> {
        let source = source.clone();
        self.call(|reply| BridgeJob::PageSize {
            source,
            page,
            reply,
        })
        .await?
    }

    async fn extract_text(&self, source: &SourceBytes, page: usize) -> BackendResult<String> {
        let source = source.clone();
        self.call(|reply| BridgeJob::Text {
            source,
            page,
            reply,
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PlainTextBackend;

    #[tokio::test]
    async fn test_bridge_forwards_calls() {
        let bridge = BridgeBackend::spawn(Arc::new(PlainTextBackend::new()));
        let source: SourceBytes = Arc::from(&b"first\x0csecond"[..]);

        assert!(bridge.probe().await);
        assert_eq!(bridge.name(), "bridge(plain-text)");
        assert_eq!(bridge.open(&source, None).await.unwrap().page_count, 2);
        assert_eq!(bridge.extract_text(&source, 1).await.unwrap(), "second");
        assert_eq!(
            bridge.render_page(&source, 5, QualityTier::Draft).await,
            Err(BackendError::PageOutOfRange(5))
        );
    }

    #[tokio::test]
    async fn test_bridge_handles_concurrent_callers() {
        let bridge = BridgeBackend::with_queue_depth(Arc::new(PlainTextBackend::new()), 2);
        let source: SourceBytes = Arc::from(&b"a\x0cb\x0cc\x0cd"[..]);

        let calls = (0..4).map(|page| {
            let bridge = bridge.clone();
            let source = source.clone();
            async move { bridge.extract_text(&source, page).await }
        });
        let texts: Vec<_> = futures::future::join_all(calls)
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(texts, vec!["a", "b", "c", "d"]);
    }
}
