//! Cache layer that orchestrates caching strategies with network fetching.

use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::traits::{CacheResult, CacheStore, CachedEntry};
use crate::net::{FetchError, Response, ResponseKind};

/// Cache layer that applies a caching strategy around a network fetch.
///
/// Cache writes triggered by a fetch are written behind: the response is
/// handed back before the write lands. A failed write only costs the entry.
pub struct StrategyLayer<S: CacheStore> {
  storage: Arc<S>,
  pending: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl<S: CacheStore + 'static> StrategyLayer<S> {
  /// Create a new strategy layer with the given storage backend.
  pub fn new(storage: Arc<S>) -> Self {
    Self {
      storage,
      pending: Arc::new(Mutex::new(Vec::new())),
    }
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  /// Read from cache, treating storage failures as a miss.
  pub fn lookup(&self, namespace: &str, key: &str) -> Option<CachedEntry> {
    match self.storage.get(namespace, key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(namespace, key, error = %e, "Cache read failed, treating as miss");
        None
      }
    }
  }

  /// Fetch with cache-first strategy.
  ///
  /// 1. Serve from cache if present
  /// 2. Otherwise fetch from network
  /// 3. Cache 2xx same-origin responses
  /// 4. Network failure with no cache propagates the error
  pub async fn cache_first<F, Fut>(
    &self,
    namespace: &str,
    key: &str,
    fetcher: F,
  ) -> Result<CacheResult<Response>, FetchError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response, FetchError>>,
  {
    if let Some(cached) = self.lookup(namespace, key) {
      debug!(namespace, key, "Cache hit");
      return Ok(CacheResult::from_cache(cached.response, cached.cached_at));
    }

    let response = fetcher().await?;
    if response.is_ok() && response.kind == ResponseKind::Basic {
      self.write_behind(namespace, key, &response);
    }
    Ok(CacheResult::from_network(response))
  }

  /// Fetch with network-first strategy.
  ///
  /// 1. Fetch from network, cache whatever comes back
  /// 2. On network failure, return the cached copy (offline mode)
  /// 3. Network failure with no cache propagates the error
  pub async fn network_first<F, Fut>(
    &self,
    namespace: &str,
    key: &str,
    fetcher: F,
  ) -> Result<CacheResult<Response>, FetchError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response, FetchError>>,
  {
    match fetcher().await {
      Ok(response) => {
        self.write_behind(namespace, key, &response);
        Ok(CacheResult::from_network(response))
      }
      Err(e) => match self.lookup(namespace, key) {
        Some(cached) => {
          debug!(namespace, key, error = %e, "Network failed, serving cached copy");
          Ok(CacheResult::offline(cached.response, cached.cached_at))
        }
        None => Err(e),
      },
    }
  }

  /// Store a copy of `response` without holding up the caller.
  pub fn write_behind(&self, namespace: &str, key: &str, response: &Response) {
    let storage = Arc::clone(&self.storage);
    let namespace = namespace.to_string();
    let key = key.to_string();
    let response = response.clone();

    let handle = tokio::task::spawn_blocking(move || {
      if let Err(e) = storage.put(&namespace, &key, &response) {
        warn!(namespace = %namespace, key = %key, error = %e, "Cache write failed");
      }
    });

    match self.pending.lock() {
      Ok(mut pending) => {
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
      }
      Err(e) => warn!(error = %e, "Pending write list poisoned"),
    }
  }

  /// Wait for every write-behind issued so far to land.
  pub async fn flush(&self) {
    let handles: Vec<JoinHandle<()>> = match self.pending.lock() {
      Ok(mut pending) => pending.drain(..).collect(),
      Err(_) => return,
    };

    for handle in handles {
      if let Err(e) = handle.await {
        warn!(error = %e, "Cache write task failed");
      }
    }
  }
}

impl<S: CacheStore> Clone for StrategyLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      pending: Arc::clone(&self.pending),
    }
  }
}
