//! Core traits and types for the response cache.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use reqwest::Method;
use std::collections::BTreeSet;
use url::Url;

use crate::net::Response;

/// Logical cache partitions.
///
/// Each partition maps to a namespace (see `CacheConfig::namespace`) so a
/// whole generation can be dropped without touching the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
  /// App shell assets and API reads
  Static,
  /// Map tile imagery
  Tile,
}

/// A response held in the cache.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: Response,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Policy-free key-value storage for responses.
///
/// Keys are request identities (see [`request_key`]) or, in the tile
/// partition, exact tile URLs. `put` overwrites.
pub trait CacheStore: Send + Sync {
  /// Look up a cached response.
  fn get(&self, namespace: &str, key: &str) -> Result<Option<CachedEntry>>;

  /// Store a response, replacing any previous entry for the key.
  fn put(&self, namespace: &str, key: &str, response: &Response) -> Result<()>;

  /// Store several responses at once. Either all are written or none are.
  fn put_all(&self, namespace: &str, entries: &[(String, Response)]) -> Result<()>;

  /// Remove an entry. Returns whether one existed.
  fn delete(&self, namespace: &str, key: &str) -> Result<bool>;

  /// All keys in a namespace.
  fn keys(&self, namespace: &str) -> Result<BTreeSet<String>>;

  /// All namespaces holding at least one entry.
  fn namespaces(&self) -> Result<BTreeSet<String>>;

  /// Drop an entire namespace in one step. Returns the number of entries removed.
  fn drop_namespace(&self, namespace: &str) -> Result<usize>;
}

/// Normalized request identity: method plus URL without fragment.
pub fn request_key(method: &Method, url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);
  format!("{} {}", method.as_str(), url)
}

/// Result from a cache strategy, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from a cache hit.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Cache hit served without touching the network
  Cache,
  /// Network unavailable, serving cached data
  Offline,
}
