//! Configuration management for the acceleration engine

use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::document::{ArtifactKind, QualityTier};

const MB: usize = 1024 * 1024;
const KB: usize = 1024;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub gateway: GatewayConfig,
    pub preload: PreloadConfig,
    pub sampler: SamplerConfig,
}

/// Byte budgets per artifact kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct KindBudgets {
    pub image: usize,
    pub text: usize,
    pub metrics: usize,
}

impl KindBudgets {
    pub fn total(&self) -> usize {
        self.image + self.text + self.metrics
    }

    pub fn for_kind(&self, kind: ArtifactKind) -> usize {
        match kind {
            ArtifactKind::Image => self.image,
            ArtifactKind::Text => self.text,
            ArtifactKind::Metrics => self.metrics,
        }
    }

    /// Scale every budget by `ratio` (clamped to 0.0..=1.0)
    pub fn scaled(&self, ratio: f64) -> Self {
        let ratio = ratio.clamp(0.0, 1.0);
        Self {
            image: (self.image as f64 * ratio) as usize,
            text: (self.text as f64 * ratio) as usize,
            metrics: (self.metrics as f64 * ratio) as usize,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Normal operating budgets
    pub budgets: KindBudgets,
    /// Fraction of the normal budget a document keeps after `optimize`
    pub optimized_ratio: f64,
    /// Utilization above which the governor reports critical pressure
    pub critical_threshold: f64,
    /// Utilization the governor evicts down to when relieving pressure
    pub target_utilization: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            budgets: KindBudgets {
                image: 256 * MB,
                text: 16 * MB,
                metrics: 512 * KB,
            },
            optimized_ratio: 0.25,
            critical_threshold: 0.9,
            target_utilization: 0.8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Concurrent native calls for caller-initiated work
    pub foreground_workers: usize,
    /// Concurrent native calls for prefetch work
    pub background_workers: usize,
    /// Deadline for a fast path call
    pub fast_timeout_ms: u64,
    /// Deadline for a fallback path call
    pub fallback_timeout_ms: u64,
    /// Upper bound on matches returned by a single search
    pub max_search_results: usize,
    /// Characters of context on each side of a search match
    pub search_context_chars: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            foreground_workers: 4,
            background_workers: 2,
            fast_timeout_ms: 5_000,
            fallback_timeout_ms: 30_000,
            max_search_results: 500,
            search_context_chars: 40,
        }
    }
}

impl GatewayConfig {
    pub fn fast_timeout(&self) -> Duration {
        Duration::from_millis(self.fast_timeout_ms)
    }

    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_millis(self.fallback_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreloadConfig {
    pub radius: usize,
    pub batch_size: usize,
    /// Quality tier used for prefetched renders
    pub quality: QualityTier,
    /// Also warm page metrics alongside renders
    pub warm_metrics: bool,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            radius: 2,
            batch_size: 4,
            quality: QualityTier::Standard,
            warm_metrics: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SamplerConfig {
    pub capacity: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self { capacity: 1000 }
    }
}

/// Error raised when an environment variable is present but malformed
#[derive(Debug, thiserror::Error)]
#[error("Invalid value for {name}: {value:?}")]
pub struct ConfigError {
    pub name: &'static str,
    pub value: String,
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError { name, value }),
        Err(_) => Ok(default),
    }
}

/// Budget variable given in `unit`-sized blocks, converted to bytes
fn parse_bytes(name: &'static str, default: usize, unit: usize) -> Result<usize, ConfigError> {
    let blocks: usize = parse_var(name, default)?;
    to_bytes(name, blocks, unit)
}

fn to_bytes(name: &'static str, blocks: usize, unit: usize) -> Result<usize, ConfigError> {
    blocks.checked_mul(unit).ok_or_else(|| ConfigError {
        name,
        value: blocks.to_string(),
    })
}

impl EngineConfig {
    /// Build a configuration from `PAGE_ACCEL_*` variables, defaulting any
    /// that are unset
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = EngineConfig::default();

        let quality = match env::var("PAGE_ACCEL_PRELOAD_QUALITY") {
            Ok(value) => value.parse().map_err(|_| ConfigError {
                name: "PAGE_ACCEL_PRELOAD_QUALITY",
                value,
            })?,
            Err(_) => defaults.preload.quality,
        };

        Ok(EngineConfig {
            cache: CacheConfig {
                budgets: KindBudgets {
                    image: parse_bytes(
                        "PAGE_ACCEL_IMAGE_BUDGET_MB",
                        defaults.cache.budgets.image / MB,
                        MB,
                    )?,
                    text: parse_bytes(
                        "PAGE_ACCEL_TEXT_BUDGET_MB",
                        defaults.cache.budgets.text / MB,
                        MB,
                    )?,
                    metrics: parse_bytes(
                        "PAGE_ACCEL_METRICS_BUDGET_KB",
                        defaults.cache.budgets.metrics / KB,
                        KB,
                    )?,
                },
                optimized_ratio: parse_var(
                    "PAGE_ACCEL_OPTIMIZED_RATIO",
                    defaults.cache.optimized_ratio,
                )?,
                ..defaults.cache
            },
            gateway: GatewayConfig {
                foreground_workers: parse_var(
                    "PAGE_ACCEL_FOREGROUND_WORKERS",
                    defaults.gateway.foreground_workers,
                )?,
                background_workers: parse_var(
                    "PAGE_ACCEL_BACKGROUND_WORKERS",
                    defaults.gateway.background_workers,
                )?,
                fast_timeout_ms: parse_var(
                    "PAGE_ACCEL_FAST_TIMEOUT_MS",
                    defaults.gateway.fast_timeout_ms,
                )?,
                fallback_timeout_ms: parse_var(
                    "PAGE_ACCEL_FALLBACK_TIMEOUT_MS",
                    defaults.gateway.fallback_timeout_ms,
                )?,
                ..defaults.gateway
            },
            preload: PreloadConfig {
                radius: parse_var("PAGE_ACCEL_PRELOAD_RADIUS", defaults.preload.radius)?,
                batch_size: parse_var("PAGE_ACCEL_BATCH_SIZE", defaults.preload.batch_size)?,
                quality,
                ..defaults.preload
            },
            sampler: SamplerConfig {
                capacity: parse_var("PAGE_ACCEL_SAMPLE_CAPACITY", defaults.sampler.capacity)?,
            },
        })
    }
}
