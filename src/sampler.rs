//! Rolling performance statistics
//!
//! Every gateway operation records one [`PerformanceSample`]. Samples live in a
//! fixed-capacity ring; once full, the oldest sample is overwritten. All
//! aggregates are computed over the current ring contents only.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::document::PageKey;

/// Operation a sample was taken for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    Open,
    Render,
    Metrics,
    Text,
}

/// What a sample measured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SampleScope {
    Page(PageKey),
    /// Not tied to a page, such as opening a document
    Global,
}

/// How an operation was served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    /// Served from the cache
    Hit,
    /// Executed on the fast path
    Miss,
    /// Executed on the fallback path
    Fallback,
    /// The attempted path failed
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSample {
    pub operation: Operation,
    pub scope: SampleScope,
    pub duration: Duration,
    pub outcome: Outcome,
    pub timestamp: DateTime<Utc>,
}

impl PerformanceSample {
    pub fn new(operation: Operation, scope: SampleScope, duration: Duration, outcome: Outcome) -> Self {
        Self {
            operation,
            scope,
            duration,
            outcome,
            timestamp: Utc::now(),
        }
    }
}

/// Aggregate over the sampler's current contents
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSummary {
    pub count: usize,
    pub avg_duration_ms: f64,
    /// Cache hits among successful operations
    pub hit_rate: f64,
    /// Fast path executions among native executions that succeeded
    pub fast_path_rate: f64,
    pub error_count: usize,
    pub fallback_count: usize,
    pub p95_duration_ms: f64,
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Thread-safe fixed-capacity sample ring
///
/// Cloning yields a handle to the same ring.
#[derive(Clone)]
pub struct PerformanceSampler {
    samples: Arc<Mutex<VecDeque<PerformanceSample>>>,
    capacity: usize,
}

impl PerformanceSampler {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn record(&self, sample: PerformanceSample) {
        let mut samples = self.samples.lock();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    pub fn aggregate(&self) -> PerformanceSummary {
        let samples = self.samples.lock();
        let count = samples.len();
        if count == 0 {
            return PerformanceSummary::default();
        }

        let (mut hits, mut fast, mut fallback, mut errors) = (0, 0, 0, 0);
        let mut durations: Vec<f64> = Vec::with_capacity(count);
        for sample in samples.iter() {
            match sample.outcome {
                Outcome::Hit => hits += 1,
                Outcome::Miss => fast += 1,
                Outcome::Fallback => fallback += 1,
                Outcome::Error => errors += 1,
            }
            durations.push(sample.duration.as_secs_f64() * 1000.0);
        }
        drop(samples);

        let avg_duration_ms = durations.iter().sum::<f64>() / count as f64;
        durations.sort_by(|a, b| a.total_cmp(b));
        // Nearest-rank percentile
        let rank = ((count as f64) * 0.95).ceil() as usize;
        let p95_duration_ms = durations[rank.clamp(1, count) - 1];

        PerformanceSummary {
            count,
            avg_duration_ms,
            hit_rate: ratio(hits, hits + fast + fallback),
            fast_path_rate: ratio(fast, fast + fallback),
            error_count: errors,
            fallback_count: fallback,
            p95_duration_ms,
        }
    }

    /// Snapshot of the ring, oldest first
    pub fn samples(&self) -> Vec<PerformanceSample> {
        self.samples.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    pub fn reset(&self) {
        self.samples.lock().clear();
    }
}

impl Default for PerformanceSampler {
    fn default() -> Self {
        Self::new(crate::config::SamplerConfig::default().capacity)
    }
}
