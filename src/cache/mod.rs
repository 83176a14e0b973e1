//! Response cache for offline support.
//!
//! This module provides the storage-agnostic caching mechanism that:
//! - Keeps responses in named namespaces (static/API and tile partitions)
//! - Implements cache-first and network-first strategies over a fetch closure
//! - Writes fetched responses behind the response path

mod layer;
mod storage;
mod traits;

pub use layer::StrategyLayer;
pub use storage::{MemoryCacheStore, SqliteCacheStore};
pub use traits::{request_key, CacheResult, CacheSource, CacheStore, CachedEntry, Partition};
