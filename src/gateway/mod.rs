//! Acceleration gateway
//!
//! Translates logical page operations into native calls on the fast or the
//! fallback path, with caching, in-flight deduplication and a
//! priority-aware worker pool.

mod inflight;
mod pool;
mod search;
mod service;
mod types;

pub use pool::PoolStats;
pub use service::AccelerationGateway;
pub use types::{Availability, PageMetrics, PathUsed, Priority, RenderResult, TextMatch};
