//! Request interception policy.
//!
//! Every request is classified once, in a fixed precedence order, and handled
//! by the strategy for its class:
//!
//! | Class      | Strategy                                        |
//! |------------|-------------------------------------------------|
//! | Tile       | network, cache the copy, fall back to the cache |
//! | API read   | network-first, then cache, snapshot, synthesized |
//! | API write  | queue when offline, pass through when online    |
//! | Static     | cache-first, offline page for navigations       |
//! | Foreign    | not handled                                     |

use color_eyre::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::assignments::AssignmentStore;
use crate::cache::{request_key, CacheSource, CacheStore, Partition, StrategyLayer};
use crate::config::Config;
use crate::net::{FetchError, Fetcher, InterceptedRequest, RequestMode, Response};
use crate::outbox::{DurableOutbox, NewOutboxItem};

/// Whether the client currently believes it can reach the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Connectivity {
  #[default]
  Online,
  Offline,
}

impl Connectivity {
  pub fn from_online(online: bool) -> Self {
    if online {
      Self::Online
    } else {
      Self::Offline
    }
  }

  pub fn is_online(&self) -> bool {
    *self == Self::Online
  }
}

/// Request classes, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  Tile,
  ApiRead,
  ApiWrite,
  Static,
  /// Neither same-origin nor a tile
  Foreign,
}

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  Network,
  /// Cache hit without touching the network
  Cache,
  /// Network failed, cached copy served
  CacheFallback,
  AssignmentSnapshot,
  OfflinePage,
  /// Offline body built by the engine
  Synthesized,
  /// Acknowledgment for a request placed in the outbox
  Queued,
}

impl From<CacheSource> for ResponseSource {
  fn from(source: CacheSource) -> Self {
    match source {
      CacheSource::Network => Self::Network,
      CacheSource::Cache => Self::Cache,
      CacheSource::Offline => Self::CacheFallback,
    }
  }
}

#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: ResponseSource,
}

impl Served {
  fn new(response: Response, source: ResponseSource) -> Self {
    Self { response, source }
  }
}

/// What the engine decided to do with a request.
#[derive(Debug, Clone)]
pub enum Interception {
  Respond(Served),
  /// Tile fetch failed with nothing cached; the map shows a gap
  TileUnavailable,
  /// Navigation failed and the offline page is not cached either
  OfflinePage(Url),
  /// Left to the default network path
  Passthrough,
}

impl Interception {
  /// The served response, if the engine produced one.
  pub fn served(&self) -> Option<&Served> {
    match self {
      Self::Respond(served) => Some(served),
      _ => None,
    }
  }
}

#[derive(Error, Debug)]
pub enum RouteError {
  /// A non-navigation static asset could not be fetched or served from cache
  #[error(transparent)]
  Network(#[from] FetchError),

  /// The outbox rejected a write; nothing was queued
  #[error("Failed to queue request: {0}")]
  Store(color_eyre::Report),
}

/// Settings the router needs, resolved once from [`Config`].
#[derive(Debug, Clone)]
pub struct RouterSettings {
  pub origin: Url,
  pub api_prefix: String,
  pub assignment_path: String,
  pub cached_assignment_url: Url,
  pub tile_host_pattern: String,
  pub offline_page: Url,
  pub static_namespace: String,
  pub tile_namespace: String,
}

impl RouterSettings {
  pub fn from_config(config: &Config) -> Result<Self> {
    Ok(Self {
      origin: config.origin_url()?,
      api_prefix: config.api_prefix.clone(),
      assignment_path: config.assignment_path.clone(),
      cached_assignment_url: config.resolve(&config.cached_assignment_path)?,
      tile_host_pattern: config.tile_host_pattern.clone(),
      offline_page: config.resolve(&config.offline_page)?,
      static_namespace: config.cache.namespace(Partition::Static).to_string(),
      tile_namespace: config.cache.namespace(Partition::Tile).to_string(),
    })
  }

  /// Cache key of the synthesized assignment fallback.
  pub fn cached_assignment_key(&self) -> String {
    request_key(&reqwest::Method::GET, &self.cached_assignment_url)
  }
}

pub fn offline_body() -> Value {
  json!({
    "offline": true,
    "success": false,
    "error": "You are currently offline",
  })
}

pub fn queued_body() -> Value {
  json!({
    "offline": true,
    "queued": true,
    "message": "Request stored for processing when online",
  })
}

/// Classifies intercepted requests and applies the matching strategy.
pub struct RequestRouter<S: CacheStore, O: DurableOutbox, F: Fetcher> {
  settings: RouterSettings,
  layer: StrategyLayer<S>,
  outbox: Arc<O>,
  fetcher: Arc<F>,
  assignments: Option<AssignmentStore>,
}

impl<S, O, F> RequestRouter<S, O, F>
where
  S: CacheStore + 'static,
  O: DurableOutbox,
  F: Fetcher,
{
  pub fn new(settings: RouterSettings, cache: Arc<S>, outbox: Arc<O>, fetcher: Arc<F>) -> Self {
    Self {
      settings,
      layer: StrategyLayer::new(cache),
      outbox,
      fetcher,
      assignments: None,
    }
  }

  /// Use `store` as the last fallback for failed assignment fetches.
  pub fn with_assignments(mut self, store: AssignmentStore) -> Self {
    self.assignments = Some(store);
    self
  }

  pub fn settings(&self) -> &RouterSettings {
    &self.settings
  }

  pub fn layer(&self) -> &StrategyLayer<S> {
    &self.layer
  }

  pub fn classify(&self, request: &InterceptedRequest) -> RequestClass {
    let url = &request.url;

    if url
      .host_str()
      .is_some_and(|host| host.contains(&self.settings.tile_host_pattern))
    {
      return RequestClass::Tile;
    }

    if url.origin() != self.settings.origin.origin() {
      return RequestClass::Foreign;
    }

    if url.path().starts_with(&self.settings.api_prefix) {
      if request.method.is_safe() {
        RequestClass::ApiRead
      } else {
        RequestClass::ApiWrite
      }
    } else {
      RequestClass::Static
    }
  }

  /// Decide and produce the outcome for one request.
  ///
  /// Only two paths return an error: a non-navigation static asset that is
  /// neither reachable nor cached, and an outbox that refuses a write.
  pub async fn handle(
    &self,
    request: &InterceptedRequest,
    connectivity: Connectivity,
  ) -> Result<Interception, RouteError> {
    let class = self.classify(request);
    debug!(method = %request.method, url = %request.url, ?class, ?connectivity, "Routing request");

    match class {
      RequestClass::Tile => Ok(self.tile(request).await),
      RequestClass::ApiRead => Ok(self.api_read(request).await),
      RequestClass::ApiWrite if !connectivity.is_online() => self.queue(request),
      RequestClass::ApiWrite => Ok(Interception::Passthrough),
      RequestClass::Static if request.method.is_safe() => self.static_asset(request).await,
      RequestClass::Static | RequestClass::Foreign => Ok(Interception::Passthrough),
    }
  }

  async fn tile(&self, request: &InterceptedRequest) -> Interception {
    let namespace = &self.settings.tile_namespace;
    let key = request.url.as_str();

    match self
      .layer
      .network_first(namespace, key, || self.fetcher.fetch(request))
      .await
    {
      Ok(result) => Interception::Respond(Served::new(result.data, result.source.into())),
      Err(e) => {
        debug!(url = %request.url, error = %e, "Tile unavailable offline");
        Interception::TileUnavailable
      }
    }
  }

  async fn api_read(&self, request: &InterceptedRequest) -> Interception {
    let namespace = &self.settings.static_namespace;
    let key = request_key(&request.method, &request.url);

    let error = match self
      .layer
      .network_first(namespace, &key, || self.fetcher.fetch(request))
      .await
    {
      Ok(result) => {
        return Interception::Respond(Served::new(result.data, result.source.into()));
      }
      Err(e) => e,
    };

    if request.url.path().contains(&self.settings.assignment_path) {
      if let Some(response) = self.assignment_fallback() {
        info!(url = %request.url, "Serving cached emergency assignment");
        return Interception::Respond(Served::new(response, ResponseSource::AssignmentSnapshot));
      }
    }

    debug!(url = %request.url, error = %error, "API read failed with no cached copy");
    Interception::Respond(Served::new(
      Response::json(&offline_body()),
      ResponseSource::Synthesized,
    ))
  }

  fn assignment_fallback(&self) -> Option<Response> {
    let key = self.settings.cached_assignment_key();
    if let Some(entry) = self.layer.lookup(&self.settings.static_namespace, &key) {
      return Some(entry.response);
    }

    let store = self.assignments.as_ref()?;
    match store.latest() {
      Ok(snapshot) => snapshot.map(|s| Response::json(&s.fallback_body())),
      Err(e) => {
        warn!(error = %e, "Failed to read assignment snapshot");
        None
      }
    }
  }

  fn queue(&self, request: &InterceptedRequest) -> Result<Interception, RouteError> {
    let item = self
      .outbox
      .enqueue(NewOutboxItem::from_request(request))
      .map_err(RouteError::Store)?;

    info!(id = item.id, method = %item.method, url = %item.url, "Queued request while offline");
    Ok(Interception::Respond(Served::new(
      Response::json(&queued_body()),
      ResponseSource::Queued,
    )))
  }

  async fn static_asset(&self, request: &InterceptedRequest) -> Result<Interception, RouteError> {
    let namespace = &self.settings.static_namespace;
    let key = request_key(&request.method, &request.url);

    match self
      .layer
      .cache_first(namespace, &key, || self.fetcher.fetch(request))
      .await
    {
      Ok(result) => Ok(Interception::Respond(Served::new(
        result.data,
        result.source.into(),
      ))),
      Err(e) if request.mode == RequestMode::Navigate => {
        debug!(url = %request.url, error = %e, "Navigation failed, serving offline page");
        let offline_key = request_key(&reqwest::Method::GET, &self.settings.offline_page);
        Ok(match self.layer.lookup(namespace, &offline_key) {
          Some(entry) => Interception::Respond(Served::new(entry.response, ResponseSource::OfflinePage)),
          None => Interception::OfflinePage(self.settings.offline_page.clone()),
        })
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Static asset unavailable");
        Err(RouteError::Network(e))
      }
    }
  }

  /// Wait for cache writes issued by earlier requests.
  pub async fn flush(&self) {
    self.layer.flush().await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::assignments::EmergencyAssignmentSnapshot;
  use crate::cache::MemoryCacheStore;
  use crate::db::Database;
  use crate::outbox::MemoryOutbox;
  use crate::testing::StubFetcher;
  use reqwest::Method;

  const ORIGIN: &str = "http://localhost:5000";

  struct Harness {
    router: RequestRouter<MemoryCacheStore, MemoryOutbox, StubFetcher>,
    cache: Arc<MemoryCacheStore>,
    outbox: Arc<MemoryOutbox>,
    fetcher: Arc<StubFetcher>,
    assignments: AssignmentStore,
  }

  fn harness() -> Harness {
    let settings = RouterSettings::from_config(&Config::default()).unwrap();
    let cache = Arc::new(MemoryCacheStore::new());
    let outbox = Arc::new(MemoryOutbox::new());
    let fetcher = Arc::new(StubFetcher::new());
    let assignments = AssignmentStore::new(Database::open_in_memory().unwrap());
    let router = RequestRouter::new(
      settings,
      Arc::clone(&cache),
      Arc::clone(&outbox),
      Arc::clone(&fetcher),
    )
    .with_assignments(assignments.clone());

    Harness {
      router,
      cache,
      outbox,
      fetcher,
      assignments,
    }
  }

  fn url(path: &str) -> Url {
    Url::parse(&format!("{}{}", ORIGIN, path)).unwrap()
  }

  fn served(outcome: Interception) -> Served {
    match outcome {
      Interception::Respond(served) => served,
      other => panic!("expected a response, got {:?}", other),
    }
  }

  #[test]
  fn test_classification_precedence() {
    let h = harness();
    let tile = Url::parse("https://a.tile.openstreetmap.org/14/11724/7536.png").unwrap();
    let cdn = Url::parse("https://cdnjs.cloudflare.com/ajax/libs/leaflet/1.7.1/leaflet.js").unwrap();

    let cases = [
      (InterceptedRequest::get(tile), RequestClass::Tile),
      (InterceptedRequest::get(url("/api/ambulance/all")), RequestClass::ApiRead),
      (InterceptedRequest::new(Method::HEAD, url("/api/ambulance/all")), RequestClass::ApiRead),
      (InterceptedRequest::new(Method::POST, url("/api/ambulance/mark-arrived")), RequestClass::ApiWrite),
      (InterceptedRequest::new(Method::DELETE, url("/api/ambulance/1")), RequestClass::ApiWrite),
      (InterceptedRequest::navigate(url("/frontend/ambulance_app/index.html")), RequestClass::Static),
      (InterceptedRequest::get(cdn), RequestClass::Foreign),
    ];

    for (request, expected) in cases {
      assert_eq!(h.router.classify(&request), expected, "{}", request.url);
    }
  }

  #[tokio::test]
  async fn test_offline_write_queues_exactly_one_item() {
    let h = harness();
    let request = InterceptedRequest::new(Method::POST, url("/api/ambulance/mark-arrived"))
      .with_json(&json!({"ambulance_id": "AMB-1", "emergency_id": 9}));

    let served = served(h.router.handle(&request, Connectivity::Offline).await.unwrap());
    assert_eq!(served.source, ResponseSource::Queued);
    let body = served.response.json_body().unwrap();
    assert_eq!(body["queued"], true);
    assert_eq!(body, queued_body());

    let items = h.outbox.list_all().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].method, "POST");
    assert_eq!(items[0].url, "http://localhost:5000/api/ambulance/mark-arrived");
    assert_eq!(items[0].body, json!({"ambulance_id": "AMB-1", "emergency_id": 9}));
    assert_eq!(h.fetcher.call_count(), 0);
  }

  #[tokio::test]
  async fn test_online_write_passes_through() {
    let h = harness();
    let request = InterceptedRequest::new(Method::PUT, url("/api/ambulance/register"));

    let outcome = h.router.handle(&request, Connectivity::Online).await.unwrap();
    assert!(matches!(outcome, Interception::Passthrough));
    assert!(h.outbox.list_all().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_static_cache_first_serves_same_bytes_offline() {
    let h = harness();
    let page = url("/frontend/ambulance_app/js/app.js");
    h.fetcher.respond("GET", page.as_str(), Response::new(200, "initMap();"));

    let request = InterceptedRequest::get(page);
    let first = served(h.router.handle(&request, Connectivity::Online).await.unwrap());
    assert_eq!(first.source, ResponseSource::Network);
    h.router.flush().await;

    h.fetcher.set_offline(true);
    let second = served(h.router.handle(&request, Connectivity::Offline).await.unwrap());
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(second.response.body, first.response.body);
  }

  #[tokio::test]
  async fn test_failed_navigation_gets_offline_page() {
    let h = harness();
    h.fetcher.set_offline(true);
    let request = InterceptedRequest::navigate(url("/frontend/ambulance_app/dispatch.html"));

    match h.router.handle(&request, Connectivity::Offline).await.unwrap() {
      Interception::OfflinePage(page) => {
        assert_eq!(page.as_str(), "http://localhost:5000/frontend/ambulance_app/offline.html")
      }
      other => panic!("expected offline page, got {:?}", other),
    }

    let offline_page = h.router.settings().offline_page.clone();
    h.cache
      .put(
        "ers-ambulance-app-v1",
        &request_key(&Method::GET, &offline_page),
        &Response::new(200, "<h1>Offline</h1>"),
      )
      .unwrap();
    let served = served(h.router.handle(&request, Connectivity::Offline).await.unwrap());
    assert_eq!(served.source, ResponseSource::OfflinePage);
    assert_eq!(served.response.body, b"<h1>Offline</h1>");
  }

  #[tokio::test]
  async fn test_failed_subresource_propagates() {
    let h = harness();
    h.fetcher.set_offline(true);
    let request = InterceptedRequest::get(url("/frontend/ambulance_app/css/styles.css"));

    let result = h.router.handle(&request, Connectivity::Offline).await;
    assert!(matches!(result, Err(RouteError::Network(_))));
  }

  #[tokio::test]
  async fn test_api_read_falls_back_to_cached_copy() {
    let h = harness();
    let list = url("/api/ambulance/all");
    h.fetcher.respond("GET", list.as_str(), Response::json(&json!([{"id": 1}])));
    let request = InterceptedRequest::get(list);

    h.router.handle(&request, Connectivity::Online).await.unwrap();
    h.router.flush().await;

    h.fetcher.set_offline(true);
    let served = served(h.router.handle(&request, Connectivity::Offline).await.unwrap());
    assert_eq!(served.source, ResponseSource::CacheFallback);
    assert_eq!(served.response.json_body().unwrap(), json!([{"id": 1}]));
  }

  #[tokio::test]
  async fn test_api_read_without_cache_is_synthesized() {
    let h = harness();
    h.fetcher.set_offline(true);
    let request = InterceptedRequest::get(url("/api/ambulance/status"));

    let served = served(h.router.handle(&request, Connectivity::Offline).await.unwrap());
    assert_eq!(served.source, ResponseSource::Synthesized);
    assert_eq!(served.response.json_body().unwrap(), offline_body());
  }

  #[tokio::test]
  async fn test_assignment_fetch_uses_snapshot() {
    let h = harness();
    h.fetcher.set_offline(true);
    let request = InterceptedRequest::get(url("/api/ambulance/get-assignment/AMB-1"));

    // No snapshot yet: the generic offline body
    let before = served(h.router.handle(&request, Connectivity::Offline).await.unwrap());
    assert_eq!(before.source, ResponseSource::Synthesized);

    h.assignments
      .save(&EmergencyAssignmentSnapshot::new(json!({"id": 9, "address": "Ring Road"})))
      .unwrap();
    let after = served(h.router.handle(&request, Connectivity::Offline).await.unwrap());
    assert_eq!(after.source, ResponseSource::AssignmentSnapshot);
    let body = after.response.json_body().unwrap();
    assert_eq!(body["has_assignment"], true);
    assert_eq!(body["emergency_call"]["address"], "Ring Road");
  }

  #[tokio::test]
  async fn test_tile_is_cached_by_exact_url() {
    let h = harness();
    let tile = "https://a.tile.openstreetmap.org/15/23449/15072.png";
    h.fetcher.respond("GET", tile, Response::new(200, "png-bytes"));
    let request = InterceptedRequest::get(Url::parse(tile).unwrap()).with_mode(RequestMode::Cors);

    served(h.router.handle(&request, Connectivity::Online).await.unwrap());
    h.router.flush().await;
    assert!(h.cache.get("map-tiles-cache", tile).unwrap().is_some());

    h.fetcher.set_offline(true);
    let again = served(h.router.handle(&request, Connectivity::Offline).await.unwrap());
    assert_eq!(again.source, ResponseSource::CacheFallback);
    assert_eq!(again.response.body, b"png-bytes");

    let missing = InterceptedRequest::get(
      Url::parse("https://a.tile.openstreetmap.org/15/1/1.png").unwrap(),
    );
    assert!(matches!(
      h.router.handle(&missing, Connectivity::Offline).await.unwrap(),
      Interception::TileUnavailable
    ));
  }

  #[tokio::test]
  async fn test_foreign_and_non_safe_static_pass_through() {
    let h = harness();
    let cdn = InterceptedRequest::get(
      Url::parse("https://cdnjs.cloudflare.com/ajax/libs/socket.io/4.0.1/socket.io.min.js").unwrap(),
    );
    let form = InterceptedRequest::new(Method::POST, url("/login"));

    for request in [cdn, form] {
      assert!(matches!(
        h.router.handle(&request, Connectivity::Offline).await.unwrap(),
        Interception::Passthrough
      ));
    }
    assert_eq!(h.fetcher.call_count(), 0);
  }
}
