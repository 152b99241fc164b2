//! Session artifact cache
//!
//! Stores rendered images, extracted text and page metrics keyed by
//! [`CacheKey`], bounded by a byte budget per artifact kind.

mod store;
mod types;

pub use store::CacheStore;
pub(crate) use types::BucketId;
pub use types::{
    CacheEntry, CacheKey, CacheStats, DocumentCacheStats, InvalidateScope, KindUsage,
};
