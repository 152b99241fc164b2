//! Memory governor
//!
//! Watches cache utilization against the per-kind budgets and reclaims
//! memory in two situations: an explicit `optimize` for one document, and
//! `relieve` when utilization of any kind crosses the critical threshold.

use serde::Serialize;

use crate::cache::CacheStore;
use crate::config::{CacheConfig, KindBudgets};
use crate::document::{ArtifactKind, DocumentId};

/// Memory pressure level derived from utilization
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPressure {
    /// Below 50% utilization
    Low,
    /// 50% up to 75%
    Moderate,
    /// 75% up to the critical threshold
    High,
    /// At or above the critical threshold
    Critical,
}

impl MemoryPressure {
    pub fn from_utilization(utilization: f64, critical_threshold: f64) -> Self {
        if utilization >= critical_threshold {
            MemoryPressure::Critical
        } else if utilization >= 0.75 {
            MemoryPressure::High
        } else if utilization >= 0.5 {
            MemoryPressure::Moderate
        } else {
            MemoryPressure::Low
        }
    }
}

/// Snapshot of memory state
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryReport {
    pub pressure: MemoryPressure,
    /// Highest utilization across artifact kinds
    pub utilization: f64,
    pub total_bytes: usize,
    pub budget_bytes: usize,
}

#[derive(Clone)]
pub struct MemoryGovernor {
    cache: CacheStore,
    config: CacheConfig,
}

impl MemoryGovernor {
    pub fn new(cache: CacheStore, config: CacheConfig) -> Self {
        Self { cache, config }
    }

    /// Normal operating budgets, as enforced by the cache
    pub fn budgets(&self) -> KindBudgets {
        self.cache.budgets()
    }

    /// Reduced budgets a document is shrunk to by `optimize`
    pub fn optimized_budgets(&self) -> KindBudgets {
        self.budgets().scaled(self.config.optimized_ratio)
    }

    pub fn kind_utilization(&self, kind: ArtifactKind) -> f64 {
        let budget = self.budgets().for_kind(kind);
        if budget == 0 {
            return 0.0;
        }
        self.cache.usage().bytes(kind) as f64 / budget as f64
    }

    /// Highest utilization across artifact kinds
    pub fn utilization(&self) -> f64 {
        ArtifactKind::ALL
            .iter()
            .map(|kind| self.kind_utilization(*kind))
            .fold(0.0, f64::max)
    }

    pub fn pressure(&self) -> MemoryPressure {
        MemoryPressure::from_utilization(self.utilization(), self.config.critical_threshold)
    }

    pub fn report(&self) -> MemoryReport {
        MemoryReport {
            pressure: self.pressure(),
            utilization: self.utilization(),
            total_bytes: self.cache.usage().total_bytes(),
            budget_bytes: self.budgets().total(),
        }
    }

    /// Shrink one document's entries to the optimized budget per kind;
    /// returns the bytes freed
    pub fn optimize(&self, document: DocumentId) -> usize {
        let limits = self.optimized_budgets();
        let freed = self.cache.shrink_document(document, limits);
        tracing::info!(
            document = %document,
            freed_bytes = freed,
            image_limit = limits.image,
            "Optimized document memory"
        );
        freed
    }

    /// Under critical pressure, evict down to the target utilization;
    /// returns the bytes freed
    pub fn relieve(&self) -> usize {
        let pressure = self.pressure();
        if pressure != MemoryPressure::Critical {
            return 0;
        }
        let freed = self
            .cache
            .shrink_to(self.budgets().scaled(self.config.target_utilization));
        tracing::info!(
            freed_bytes = freed,
            utilization = self.utilization(),
            "Relieved critical memory pressure"
        );
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheEntry, CacheKey};
    use crate::document::{PageKey, QualityTier};
    use std::sync::Arc;

    fn governor(image_budget: usize) -> MemoryGovernor {
        let config = CacheConfig {
            budgets: KindBudgets {
                image: image_budget,
                text: 1000,
                metrics: 100,
            },
            ..CacheConfig::default()
        };
        MemoryGovernor::new(CacheStore::new(config.budgets), config)
    }

    fn fill(governor: &MemoryGovernor, document: DocumentId, pages: usize, size: usize) {
        for page in 0..pages {
            governor
                .cache
                .put(
                    CacheKey::image(PageKey::new(document, page, QualityTier::Standard)),
                    CacheEntry::new(ArtifactKind::Image, Arc::from(vec![0u8; size])),
                )
                .unwrap();
        }
    }

    #[test]
    fn test_pressure_levels() {
        assert_eq!(MemoryPressure::from_utilization(0.1, 0.9), MemoryPressure::Low);
        assert_eq!(MemoryPressure::from_utilization(0.5, 0.9), MemoryPressure::Moderate);
        assert_eq!(MemoryPressure::from_utilization(0.8, 0.9), MemoryPressure::High);
        assert_eq!(MemoryPressure::from_utilization(0.9, 0.9), MemoryPressure::Critical);
    }

    #[test]
    fn test_optimize_shrinks_document_to_reduced_budget() {
        let governor = governor(1000);
        let doc = DocumentId::new();
        let other = DocumentId::new();
        fill(&governor, doc, 6, 100);
        fill(&governor, other, 2, 100);

        let freed = governor.optimize(doc);

        // Optimized budget is a quarter of 1000
        assert_eq!(freed, 400);
        assert!(governor.cache.document_stats(doc).total_bytes <= 250);
        assert_eq!(governor.cache.document_stats(other).total_bytes, 200);
    }

    #[test]
    fn test_relieve_only_acts_under_critical_pressure() {
        let governor = governor(1000);
        let doc = DocumentId::new();
        fill(&governor, doc, 7, 100);
        assert_eq!(governor.pressure(), MemoryPressure::Moderate);
        assert_eq!(governor.relieve(), 0);

        fill(&governor, DocumentId::new(), 3, 100);
        assert_eq!(governor.pressure(), MemoryPressure::Critical);
        assert_eq!(governor.relieve(), 200);
        assert_eq!(governor.report().total_bytes, 800);
        assert_eq!(governor.pressure(), MemoryPressure::High);
    }
}
