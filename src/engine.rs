//! Composition root: wires the stores, router and reconciler together and
//! exposes one handler per client event (install, activate, fetch, message,
//! connectivity).

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use crate::assignments::{AssignmentStore, EmergencyAssignmentSnapshot};
use crate::cache::{request_key, CacheStore, Partition, SqliteCacheStore};
use crate::config::Config;
use crate::db::Database;
use crate::locations::LocationLog;
use crate::message::EngineMessage;
use crate::net::{Fetcher, HttpFetcher, InterceptedRequest, Response};
use crate::outbox::{DurableOutbox, SqliteOutbox};
use crate::router::{Connectivity, Interception, RequestRouter, RouteError, RouterSettings};
use crate::sync::{SyncReconciler, SyncReport};
use crate::tiles::{Bounds, PrefetchReport, TilePrefetcher};

pub struct OfflineEngine<S: CacheStore, O: DurableOutbox, F: Fetcher> {
  config: Config,
  cache: Arc<S>,
  outbox: Arc<O>,
  fetcher: Arc<F>,
  router: RequestRouter<S, O, F>,
  reconciler: SyncReconciler<O, F>,
  assignments: AssignmentStore,
  locations: LocationLog,
  connectivity: watch::Sender<Connectivity>,
}

impl OfflineEngine<SqliteCacheStore, SqliteOutbox, HttpFetcher> {
  /// Open the engine on the configured database with live network access.
  pub fn open(config: Config) -> Result<Self> {
    let path = config.database_path()?;
    let db = Database::open(&path)?;
    let fetcher = HttpFetcher::new(config.origin_url()?)
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;
    debug!(database = %path.display(), "Opened offline store");
    OfflineEngine::with_database(config, db, Arc::new(fetcher))
  }
}

impl<F: Fetcher + 'static> OfflineEngine<SqliteCacheStore, SqliteOutbox, F> {
  /// Keep every partition in `db`.
  pub fn with_database(config: Config, db: Database, fetcher: Arc<F>) -> Result<Self> {
    let cache = Arc::new(SqliteCacheStore::new(db.clone()));
    let outbox = Arc::new(SqliteOutbox::new(db.clone()));
    Self::new(config, db, cache, outbox, fetcher)
  }
}

impl<S, O, F> OfflineEngine<S, O, F>
where
  S: CacheStore + 'static,
  O: DurableOutbox,
  F: Fetcher,
{
  pub fn new(
    config: Config,
    db: Database,
    cache: Arc<S>,
    outbox: Arc<O>,
    fetcher: Arc<F>,
  ) -> Result<Self> {
    let assignments = AssignmentStore::new(db.clone());
    let locations = LocationLog::new(db);

    let router = RequestRouter::new(
      RouterSettings::from_config(&config)?,
      Arc::clone(&cache),
      Arc::clone(&outbox),
      Arc::clone(&fetcher),
    )
    .with_assignments(assignments.clone());

    let reconciler = SyncReconciler::new(Arc::clone(&outbox), Arc::clone(&fetcher))
      .with_locations(locations.clone(), config.resolve(&config.location_endpoint)?);

    let (connectivity, _) = watch::channel(Connectivity::Online);

    Ok(Self {
      config,
      cache,
      outbox,
      fetcher,
      router,
      reconciler,
      assignments,
      locations,
      connectivity,
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn cache(&self) -> &Arc<S> {
    &self.cache
  }

  pub fn outbox(&self) -> &Arc<O> {
    &self.outbox
  }

  pub fn fetcher(&self) -> &Arc<F> {
    &self.fetcher
  }

  pub fn locations(&self) -> &LocationLog {
    &self.locations
  }

  /// Precache the configured static assets.
  ///
  /// Nothing is written unless every asset was fetched with a 2xx status.
  pub async fn install(&self) -> Result<usize> {
    let requests = self
      .config
      .precache
      .iter()
      .map(|asset| self.config.resolve(asset).map(InterceptedRequest::get))
      .collect::<Result<Vec<_>>>()?;

    let fetched = try_join_all(requests.iter().map(|request| async move {
      let response = self
        .fetcher
        .fetch(request)
        .await
        .map_err(|e| eyre!("Failed to precache {}: {}", request.url, e))?;
      if !response.is_ok() {
        return Err(eyre!("Failed to precache {}: status {}", request.url, response.status));
      }
      Ok::<_, color_eyre::Report>((request_key(&Method::GET, &request.url), response))
    }))
    .await?;

    let namespace = self.config.cache.namespace(Partition::Static);
    self.cache.put_all(namespace, &fetched)?;

    info!(assets = fetched.len(), namespace = %namespace, "Precached static assets");
    Ok(fetched.len())
  }

  /// Drop every cache namespace other than the current static and tile ones.
  pub fn activate(&self) -> Result<Vec<String>> {
    let keep = [
      self.config.cache.namespace(Partition::Static),
      self.config.cache.namespace(Partition::Tile),
    ];

    let mut dropped = Vec::new();
    for namespace in self.cache.namespaces()? {
      if keep.contains(&namespace.as_str()) {
        continue;
      }
      let entries = self.cache.drop_namespace(&namespace)?;
      info!(namespace = %namespace, entries, "Deleted old cache");
      dropped.push(namespace);
    }
    Ok(dropped)
  }

  /// Route one intercepted request under the current connectivity.
  pub async fn fetch(&self, request: &InterceptedRequest) -> Result<Interception, RouteError> {
    self.router.handle(request, self.connectivity()).await
  }

  /// Handle a message posted by the client.
  pub fn handle_message(&self, message: EngineMessage) -> Result<()> {
    match message {
      EngineMessage::CacheEmergency { emergency_call } => {
        self.cache_emergency(emergency_call)?;
      }
      EngineMessage::SyncComplete { .. } => {
        debug!("Ignoring engine-bound sync-complete message");
      }
    }
    Ok(())
  }

  /// Keep `payload` as the fallback for failed assignment fetches.
  pub fn cache_emergency(&self, payload: Value) -> Result<EmergencyAssignmentSnapshot> {
    let snapshot = EmergencyAssignmentSnapshot::new(payload);
    self.assignments.save(&snapshot)?;

    let key = self.router.settings().cached_assignment_key();
    self.cache.put(
      self.config.cache.namespace(Partition::Static),
      &key,
      &Response::json(&snapshot.fallback_body()),
    )?;

    info!(id = ?snapshot.id, "Emergency assignment cached for offline use");
    Ok(snapshot)
  }

  pub fn connectivity(&self) -> Connectivity {
    *self.connectivity.borrow()
  }

  /// Receiver that observes every connectivity change.
  pub fn watch_connectivity(&self) -> watch::Receiver<Connectivity> {
    self.connectivity.subscribe()
  }

  /// Record a connectivity change. Coming back online runs a sync pass.
  pub async fn set_online(&self, online: bool) -> Result<Option<SyncReport>> {
    let next = Connectivity::from_online(online);
    let previous = self.connectivity.send_replace(next);

    if previous == next {
      return Ok(None);
    }

    info!(?next, "Connectivity changed");
    if next.is_online() {
      return self.sync().await.map(Some);
    }
    Ok(None)
  }

  /// Run a reconciliation pass now.
  pub async fn sync(&self) -> Result<SyncReport> {
    self.reconciler.reconcile().await
  }

  /// Register for `sync-complete` notifications.
  pub fn subscribe(&self) -> broadcast::Receiver<EngineMessage> {
    self.reconciler.subscribe()
  }

  /// Buffer a position sample for the next sync.
  pub fn record_location(&self, ambulance_id: &str, latitude: f64, longitude: f64) -> bool {
    self.locations.record(ambulance_id, latitude, longitude)
  }

  /// Tile prefetcher configured for the tile partition.
  pub fn prefetcher(&self) -> TilePrefetcher<S, F> {
    TilePrefetcher::new(
      Arc::clone(&self.cache),
      Arc::clone(&self.fetcher),
      self.config.cache.namespace(Partition::Tile),
      &self.config.tile_url_template,
    )
    .with_subdomain(&self.config.tile_subdomain)
    .with_max_tiles(self.config.prefetch.max_tiles)
    .with_concurrency(self.config.prefetch.concurrency)
  }

  /// Download the tiles around a viewport.
  pub async fn prefetch(&self, bounds: &Bounds, zoom: u8) -> PrefetchReport {
    self.prefetcher().prefetch(bounds, zoom).await
  }

  /// Wait for cache writes issued while serving requests.
  pub async fn flush(&self) {
    self.router.flush().await;
  }
}
