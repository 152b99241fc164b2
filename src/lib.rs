//! Page Acceleration Engine
//!
//! Caches and accelerates page rendering, metrics and text extraction for
//! document viewers. Native work is routed through a fast path with an
//! always-available fallback; identical concurrent requests share one
//! execution.
//!
//! # Modules
//!
//! - `backend`: Native renderer seam and the bundled plain-text renderer
//! - `cache`: Byte-budgeted artifact cache
//! - `config`: Engine configuration
//! - `document`: Document identity and registry
//! - `engine`: [`AccelEngine`] facade used by viewing surfaces
//! - `gateway`: Path selection, deduplication and worker scheduling
//! - `governor`: Memory pressure tracking and cache shrinking
//! - `sampler`: Bounded performance sample ring
//! - `scheduler`: Viewport prefetch and progressive loading

pub mod backend;
pub mod cache;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod governor;
pub mod sampler;
pub mod scheduler;

#[cfg(test)]
mod test_support;

pub use config::EngineConfig;
pub use document::{DocumentId, QualityTier};
pub use engine::{AccelEngine, CacheScope, RenderResponse};
pub use error::{AccelError, Result};
