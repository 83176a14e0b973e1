//! Bulk tile download into the tile partition.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::coord::{Bounds, TileId};
use super::planner::{plan_len, plan_tiles};
use crate::cache::CacheStore;
use crate::net::{Fetcher, InterceptedRequest, RequestMode};

/// Outcome of one prefetch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefetchReport {
  /// Tiles the planner produced before truncation
  pub planned: usize,
  /// Tiles kept after applying the cap
  pub requested: usize,
  /// Already present, not fetched again
  pub skipped: usize,
  pub cached: usize,
  pub failed: usize,
}

enum TileOutcome {
  Skipped,
  Cached,
  Failed,
}

/// Downloads the tiles around a viewport ahead of losing connectivity.
pub struct TilePrefetcher<S: CacheStore, F: Fetcher> {
  store: Arc<S>,
  fetcher: Arc<F>,
  namespace: String,
  template: String,
  subdomain: String,
  max_tiles: usize,
  concurrency: usize,
}

impl<S: CacheStore, F: Fetcher> TilePrefetcher<S, F> {
  pub fn new(store: Arc<S>, fetcher: Arc<F>, namespace: &str, template: &str) -> Self {
    Self {
      store,
      fetcher,
      namespace: namespace.to_string(),
      template: template.to_string(),
      subdomain: "a".to_string(),
      max_tiles: 200,
      concurrency: 8,
    }
  }

  pub fn with_subdomain(mut self, subdomain: &str) -> Self {
    self.subdomain = subdomain.to_string();
    self
  }

  pub fn with_max_tiles(mut self, max_tiles: usize) -> Self {
    self.max_tiles = max_tiles;
    self
  }

  pub fn with_concurrency(mut self, concurrency: usize) -> Self {
    self.concurrency = concurrency.max(1);
    self
  }

  /// The tiles a prefetch of `bounds` would request, after the cap, and the
  /// size of the uncapped plan.
  pub fn plan(&self, bounds: &Bounds, zoom: u8) -> (usize, Vec<TileId>) {
    let planned = plan_len(bounds, zoom);
    let tiles = plan_tiles(bounds, zoom).take(self.max_tiles).collect();
    (planned, tiles)
  }

  /// Fetch every planned tile not yet cached.
  ///
  /// Failures are counted per tile; a run never aborts part way.
  pub async fn prefetch(&self, bounds: &Bounds, zoom: u8) -> PrefetchReport {
    let (planned, tiles) = self.plan(bounds, zoom);
    let mut report = PrefetchReport {
      planned,
      requested: tiles.len(),
      ..Default::default()
    };

    let outcomes: Vec<TileOutcome> = stream::iter(tiles)
      .map(|tile| self.fetch_tile(tile))
      .buffer_unordered(self.concurrency)
      .collect()
      .await;

    for outcome in outcomes {
      match outcome {
        TileOutcome::Skipped => report.skipped += 1,
        TileOutcome::Cached => report.cached += 1,
        TileOutcome::Failed => report.failed += 1,
      }
    }

    info!(
      planned = report.planned,
      cached = report.cached,
      skipped = report.skipped,
      failed = report.failed,
      "Tile prefetch finished"
    );
    report
  }

  async fn fetch_tile(&self, tile: TileId) -> TileOutcome {
    let url = match Url::parse(&tile.url(&self.template, &self.subdomain)) {
      Ok(url) => url,
      Err(e) => {
        warn!(%tile, error = %e, "Invalid tile URL");
        return TileOutcome::Failed;
      }
    };
    let key = url.as_str();

    if matches!(self.store.get(&self.namespace, key), Ok(Some(_))) {
      return TileOutcome::Skipped;
    }

    let request = InterceptedRequest::get(url.clone()).with_mode(RequestMode::Cors);
    match self.fetcher.fetch(&request).await {
      Ok(response) if response.is_ok() => match self.store.put(&self.namespace, key, &response) {
        Ok(()) => {
          debug!(%tile, "Tile cached");
          TileOutcome::Cached
        }
        Err(e) => {
          warn!(%tile, error = %e, "Failed to store tile");
          TileOutcome::Failed
        }
      },
      Ok(response) => {
        debug!(%tile, status = response.status, "Tile fetch rejected");
        TileOutcome::Failed
      }
      Err(e) => {
        debug!(%tile, error = %e, "Tile fetch failed");
        TileOutcome::Failed
      }
    }
  }
}
