//! Page Accel CLI
//!
//! Opens a plain-text document, renders a page, warms the pages around it
//! and prints the engine's view of the session as JSON.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use page_accel::cache::DocumentCacheStats;
use page_accel::gateway::TextMatch;
use page_accel::governor::MemoryReport;
use page_accel::sampler::PerformanceSummary;
use page_accel::{AccelEngine, EngineConfig, QualityTier, RenderResponse};

#[derive(Parser, Debug)]
#[command(name = "page-accel", version, about = "Render and cache document pages")]
struct Args {
    /// Document to open (form-feed paginated UTF-8 text)
    file: PathBuf,

    /// Page to render
    #[arg(long, default_value_t = 0)]
    page: usize,

    /// Prefetch radius around the rendered page
    #[arg(long)]
    radius: Option<usize>,

    /// Render quality: draft, standard or high
    #[arg(long, default_value_t = QualityTier::Standard)]
    quality: QualityTier,

    /// Search the whole document for this text
    #[arg(long)]
    search: Option<String>,

    /// Password for locked documents
    #[arg(long)]
    password: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Report {
    document: String,
    page_count: usize,
    render: RenderResponse,
    prefetched: Vec<usize>,
    matches: Option<Vec<TextMatch>>,
    cache: DocumentCacheStats,
    memory: MemoryReport,
    performance: PerformanceSummary,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "page_accel=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    dotenvy::dotenv().ok();

    let args = Args::parse();

    let mut config = EngineConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        EngineConfig::default()
    });
    if let Some(radius) = args.radius {
        config.preload.radius = radius;
    }

    tracing::info!("Starting Page Accel v{}", env!("CARGO_PKG_VERSION"));

    let bytes = tokio::fs::read(&args.file)
        .await
        .with_context(|| format!("failed to read {}", args.file.display()))?;

    let engine = AccelEngine::with_plain_text(config);
    let handle = engine
        .open_document(bytes, args.password.as_deref())
        .await
        .context("failed to open document")?;
    let document = handle.id();

    let render = engine
        .render_page_response(document, args.page, args.quality)
        .await;

    let ticket = engine.on_page_changed(document, args.page, handle.page_count())?;
    let prefetched = ticket.requested().to_vec();
    let loaded = ticket.wait().await;
    if loaded < prefetched.len() {
        tracing::warn!(failed = prefetched.len() - loaded, "Some prefetches failed");
    }

    let matches = match args.search.as_deref() {
        Some(query) => Some(
            engine
                .search_text(document, query, 0, handle.page_count().saturating_sub(1), false)
                .await?,
        ),
        None => None,
    };

    let report = Report {
        document: document.to_string(),
        page_count: handle.page_count(),
        render,
        prefetched,
        matches,
        cache: engine.get_cache_stats(document)?,
        memory: engine.memory_report(),
        performance: engine.performance_summary(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    engine.close_document(document)?;
    Ok(())
}
