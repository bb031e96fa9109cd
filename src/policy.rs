//! Policy executors: one fetch/cache/fallback sequence per route.
//!
//! All three absorb transient network failures into something the page can
//! use - a cached snapshot, a synthesized offline response, or (static
//! assets only) a propagated failure.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheStore, StorageError};
use crate::config::Config;
use crate::http::{FetchRequest, ResponseSnapshot};
use crate::net::{NetworkError, NetworkFetch};
use crate::queue::SyncQueue;
use crate::router::Route;

/// Failure surfaced to the page after every fallback was exhausted.
#[derive(Debug, Clone, Error)]
pub enum FetchFailure {
  #[error(transparent)]
  Network(#[from] NetworkError),
  #[error(transparent)]
  Storage(#[from] StorageError),
  #[error("controller is gone")]
  ControllerClosed,
}

/// Policy-relevant slice of the configuration.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
  pub static_generation: String,
  pub dynamic_generation: String,
  pub api_prefix: String,
  pub critical_api: Vec<String>,
  pub root_page: String,
}

impl PolicyConfig {
  pub fn from_config(config: &Config) -> Self {
    Self {
      static_generation: config.static_generation(),
      dynamic_generation: config.dynamic_generation(),
      api_prefix: config.api_prefix.clone(),
      critical_api: config.critical_api.clone(),
      root_page: config.root_page.clone(),
    }
  }
}

/// Executes the per-route caching strategies against a store and a
/// network transport.
pub struct PolicyEngine<S: CacheStore, N: NetworkFetch> {
  store: Arc<S>,
  queue: Arc<SyncQueue>,
  net: N,
  cfg: PolicyConfig,
}

impl<S: CacheStore, N: NetworkFetch> PolicyEngine<S, N> {
  pub fn new(store: Arc<S>, queue: Arc<SyncQueue>, net: N, cfg: PolicyConfig) -> Self {
    Self {
      store,
      queue,
      net,
      cfg,
    }
  }

  pub fn network(&self) -> &N {
    &self.net
  }

  /// Dispatch a classified request to its executor.
  pub async fn execute(
    &self,
    route: Route,
    request: &FetchRequest,
  ) -> Result<ResponseSnapshot, FetchFailure> {
    match route {
      Route::CacheFirst => self.cache_first(request).await,
      Route::NetworkFirst => self.network_first(request).await,
      Route::Navigation => self.navigation(request).await,
    }
  }

  /// Static assets: a cache hit returns with no network contact at all.
  /// On miss, fetch and write through; a network failure is a hard miss.
  async fn cache_first(&self, request: &FetchRequest) -> Result<ResponseSnapshot, FetchFailure> {
    let key = request.cache_key();

    if let Some(cached) = self.store.lookup(&self.cfg.static_generation, &key)? {
      return Ok(cached);
    }

    let response = self.net.fetch(request).await?;
    if response.is_success() {
      self
        .store
        .put(&self.cfg.static_generation, &key, &response)?;
    }

    Ok(response)
  }

  /// API calls: freshness preferred over speed. Live read responses are
  /// written through; on network failure reads fall back to the dynamic
  /// generation, then to a synthesized 503 for critical paths.
  ///
  /// Writes are never cached and never answered from cache - the entry
  /// key carries no body, so a cached POST response would stand in for a
  /// different payload. An offline write is deferred for replay and then
  /// answered by the 503/propagate tail of the ladder.
  async fn network_first(&self, request: &FetchRequest) -> Result<ResponseSnapshot, FetchFailure> {
    let key = request.cache_key();

    match self.net.fetch(request).await {
      Ok(response) => {
        if response.is_success() && !request.method.is_mutating() {
          self
            .store
            .put(&self.cfg.dynamic_generation, &key, &response)?;
        }
        Ok(response)
      }
      Err(network_err) => {
        debug!(url = %request.url, error = %network_err, "network failed, trying cache");

        if request.method.is_mutating() {
          self.defer_mutation(request);

          if self.is_critical_api(request.path()) {
            return Ok(ResponseSnapshot::offline_api());
          }
          return Err(network_err.into());
        }

        if let Some(cached) = self.store.lookup(&self.cfg.dynamic_generation, &key)? {
          return Ok(cached);
        }

        if self.is_critical_api(request.path()) {
          return Ok(ResponseSnapshot::offline_api());
        }

        Err(network_err.into())
      }
    }
  }

  /// Navigations: network, then the exact cached page, then the cached
  /// root page, then a synthesized offline page. Never hard-fails.
  async fn navigation(&self, request: &FetchRequest) -> Result<ResponseSnapshot, FetchFailure> {
    match self.net.fetch(request).await {
      Ok(response) => Ok(response),
      Err(network_err) => {
        debug!(url = %request.url, error = %network_err, "navigation fetch failed, walking fallbacks");

        if let Some(cached) = self.match_any(&request.cache_key())? {
          return Ok(cached);
        }

        let root_key = request.for_page(&self.cfg.root_page).cache_key();
        if let Some(cached) = self.match_any(&root_key)? {
          return Ok(cached);
        }

        Ok(ResponseSnapshot::offline_page())
      }
    }
  }

  /// Precache the configured asset list into the static generation.
  /// Fetches run concurrently; individual failures are logged and
  /// skipped so one bad asset does not abort install.
  pub async fn precache(&self, origin: &Url, assets: &[String]) -> Result<usize, StorageError> {
    self.store.ensure(&self.cfg.static_generation)?;
    self.store.ensure(&self.cfg.dynamic_generation)?;

    let requests: Vec<FetchRequest> = assets
      .iter()
      .filter_map(|path| match origin.join(path) {
        Ok(url) => Some(FetchRequest::get(url)),
        Err(e) => {
          warn!(path = %path, error = %e, "skipping unjoinable precache path");
          None
        }
      })
      .collect();

    let results =
      futures::future::join_all(requests.iter().map(|request| self.net.fetch(request))).await;

    let mut cached = 0;
    for (request, result) in requests.iter().zip(results) {
      match result {
        Ok(response) if response.is_success() => {
          self
            .store
            .put(&self.cfg.static_generation, &request.cache_key(), &response)?;
          cached += 1;
        }
        Ok(response) => {
          warn!(url = %request.url, status = response.status, "precache fetch returned non-success");
        }
        Err(e) => {
          warn!(url = %request.url, error = %e, "precache fetch failed");
        }
      }
    }

    Ok(cached)
  }

  /// Look a key up in the static generation first, then the dynamic one.
  fn match_any(&self, key: &str) -> Result<Option<ResponseSnapshot>, StorageError> {
    if let Some(cached) = self.store.lookup(&self.cfg.static_generation, key)? {
      return Ok(Some(cached));
    }
    self.store.lookup(&self.cfg.dynamic_generation, key)
  }

  fn is_critical_api(&self, path: &str) -> bool {
    self
      .cfg
      .critical_api
      .iter()
      .any(|pattern| path.starts_with(pattern.as_str()))
  }

  /// Hand a failed mutating request to the sync queue. Enqueue failures
  /// are logged, not surfaced - the page already gets the offline
  /// fallback either way.
  fn defer_mutation(&self, request: &FetchRequest) {
    let Some(class) = resource_class(request.path(), &self.cfg.api_prefix) else {
      return;
    };

    let payload = request.body.clone().unwrap_or_default();
    match self
      .queue
      .enqueue(class, &request.path_and_query(), request.method, &payload)
    {
      Ok(id) => debug!(class, id, url = %request.url, "deferred offline mutation"),
      Err(e) => warn!(url = %request.url, error = %e, "failed to defer offline mutation"),
    }
  }
}

/// First path segment after the API prefix ("/api/sales" -> "sales").
fn resource_class<'a>(path: &'a str, api_prefix: &str) -> Option<&'a str> {
  path
    .strip_prefix(api_prefix)?
    .split('/')
    .next()
    .filter(|segment| !segment.is_empty())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStore;
  use crate::http::HttpMethod;
  use crate::net::testing::MockNetwork;

  fn policy_config() -> PolicyConfig {
    PolicyConfig {
      static_generation: "static-v1".to_string(),
      dynamic_generation: "dynamic-v1".to_string(),
      api_prefix: "/api/".to_string(),
      critical_api: vec![
        "/api/products".to_string(),
        "/api/inventory".to_string(),
        "/api/customers".to_string(),
        "/api/shop".to_string(),
      ],
      root_page: "/".to_string(),
    }
  }

  fn engine() -> (
    PolicyEngine<SqliteStore, Arc<MockNetwork>>,
    Arc<SqliteStore>,
    Arc<SyncQueue>,
    Arc<MockNetwork>,
  ) {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let queue = Arc::new(SyncQueue::in_memory().unwrap());
    let net = Arc::new(MockNetwork::new());
    let engine = PolicyEngine::new(
      Arc::clone(&store),
      Arc::clone(&queue),
      Arc::clone(&net),
      policy_config(),
    );
    (engine, store, queue, net)
  }

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  fn snapshot(body: &str) -> ResponseSnapshot {
    ResponseSnapshot {
      status: 200,
      headers: vec![("content-type".to_string(), "application/json".to_string())],
      body: body.as_bytes().to_vec(),
    }
  }

  #[tokio::test]
  async fn test_cache_first_hit_makes_no_network_call() {
    let (engine, store, _, net) = engine();
    let request = FetchRequest::get(url("https://shop.example.com/app.js"));
    store
      .put("static-v1", &request.cache_key(), &snapshot("cached"))
      .unwrap();

    let response = engine.execute(Route::CacheFirst, &request).await.unwrap();

    assert_eq!(response.body, b"cached");
    assert_eq!(net.calls(), 0);
  }

  #[tokio::test]
  async fn test_cache_first_miss_writes_through() {
    let (engine, store, _, net) = engine();
    let request = FetchRequest::get(url("https://shop.example.com/app.js"));
    net.respond_ok(HttpMethod::Get, "https://shop.example.com/app.js", "fresh");

    let response = engine.execute(Route::CacheFirst, &request).await.unwrap();

    assert_eq!(response.body, b"fresh");
    let cached = store.lookup("static-v1", &request.cache_key()).unwrap();
    assert_eq!(cached.unwrap().body, b"fresh");
  }

  #[tokio::test]
  async fn test_cache_first_offline_miss_propagates_failure() {
    let (engine, _, _, net) = engine();
    net.set_offline(true);
    let request = FetchRequest::get(url("https://shop.example.com/app.js"));

    let result = engine.execute(Route::CacheFirst, &request).await;

    assert!(matches!(result, Err(FetchFailure::Network(_))));
  }

  #[tokio::test]
  async fn test_network_first_success_writes_through() {
    let (engine, store, _, net) = engine();
    let request = FetchRequest::get(url("https://shop.example.com/api/products"));
    net.respond_ok(
      HttpMethod::Get,
      "https://shop.example.com/api/products",
      "[1,2]",
    );

    let response = engine.execute(Route::NetworkFirst, &request).await.unwrap();

    assert_eq!(response.body, b"[1,2]");
    let cached = store.lookup("dynamic-v1", &request.cache_key()).unwrap();
    assert_eq!(cached.unwrap().body, b"[1,2]");
  }

  #[tokio::test]
  async fn test_network_first_offline_serves_cached_match() {
    let (engine, store, _, net) = engine();
    let request = FetchRequest::get(url("https://shop.example.com/api/products"));
    store
      .put("dynamic-v1", &request.cache_key(), &snapshot("stale"))
      .unwrap();
    net.set_offline(true);

    let response = engine.execute(Route::NetworkFirst, &request).await.unwrap();

    assert_eq!(response.body, b"stale");
  }

  #[tokio::test]
  async fn test_network_first_offline_critical_miss_synthesizes_503() {
    let (engine, _, _, net) = engine();
    net.set_offline(true);
    let request = FetchRequest::get(url("https://shop.example.com/api/products"));

    let response = engine.execute(Route::NetworkFirst, &request).await.unwrap();

    assert_eq!(response.status, 503);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["offline"], true);
  }

  #[tokio::test]
  async fn test_network_first_offline_noncritical_miss_propagates() {
    let (engine, _, _, net) = engine();
    net.set_offline(true);
    let request = FetchRequest::get(url("https://shop.example.com/api/reports/weekly"));

    let result = engine.execute(Route::NetworkFirst, &request).await;

    assert!(matches!(result, Err(FetchFailure::Network(_))));
  }

  #[tokio::test]
  async fn test_network_first_success_mutation_is_not_cached() {
    let (engine, store, _, net) = engine();
    let request = FetchRequest {
      url: url("https://shop.example.com/api/inventory/7"),
      method: HttpMethod::Put,
      headers: Vec::new(),
      body: Some(b"{\"count\":3}".to_vec()),
      mode: Default::default(),
    };
    net.respond_ok(
      HttpMethod::Put,
      "https://shop.example.com/api/inventory/7",
      "{\"ok\":true}",
    );

    let response = engine.execute(Route::NetworkFirst, &request).await.unwrap();

    assert_eq!(response.status, 200);
    assert!(store
      .lookup("dynamic-v1", &request.cache_key())
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_offline_mutation_is_never_answered_from_cache() {
    let (engine, store, queue, net) = engine();
    let request = FetchRequest {
      url: url("https://shop.example.com/api/products"),
      method: HttpMethod::Post,
      headers: Vec::new(),
      body: Some(b"{\"sku\":\"new\"}".to_vec()),
      mode: Default::default(),
    };
    // A stale entry under the same method + URL must not stand in for a
    // write with a different payload.
    store
      .put("dynamic-v1", &request.cache_key(), &snapshot("{\"sku\":\"old\"}"))
      .unwrap();
    net.set_offline(true);

    let response = engine.execute(Route::NetworkFirst, &request).await.unwrap();

    assert_eq!(response.status, 503);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["offline"], true);
    assert_eq!(queue.pending("products").unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_offline_noncritical_mutation_propagates_after_deferral() {
    let (engine, store, queue, net) = engine();
    let request = FetchRequest {
      url: url("https://shop.example.com/api/sales"),
      method: HttpMethod::Post,
      headers: Vec::new(),
      body: Some(b"{\"total\":9}".to_vec()),
      mode: Default::default(),
    };
    store
      .put("dynamic-v1", &request.cache_key(), &snapshot("{\"total\":1}"))
      .unwrap();
    net.set_offline(true);

    let result = engine.execute(Route::NetworkFirst, &request).await;

    assert!(matches!(result, Err(FetchFailure::Network(_))));
    assert_eq!(queue.len("sales").unwrap(), 1);
  }

  #[tokio::test]
  async fn test_network_first_offline_mutation_is_deferred() {
    let (engine, _, queue, net) = engine();
    net.set_offline(true);
    let request = FetchRequest {
      url: url("https://shop.example.com/api/sales"),
      method: HttpMethod::Post,
      headers: Vec::new(),
      body: Some(b"{\"total\":12}".to_vec()),
      mode: Default::default(),
    };

    let _ = engine.execute(Route::NetworkFirst, &request).await;

    let pending = queue.pending("sales").unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].target, "/api/sales");
    assert_eq!(pending[0].payload, b"{\"total\":12}");
  }

  #[tokio::test]
  async fn test_navigation_offline_falls_back_to_exact_page() {
    let (engine, store, _, net) = engine();
    let request = FetchRequest::navigation(url("https://shop.example.com/dashboard"));
    store
      .put("static-v1", &request.cache_key(), &snapshot("<html>dash</html>"))
      .unwrap();
    net.set_offline(true);

    let response = engine.execute(Route::Navigation, &request).await.unwrap();

    assert_eq!(response.body, b"<html>dash</html>");
  }

  #[tokio::test]
  async fn test_navigation_offline_falls_back_to_cached_root() {
    let (engine, store, _, net) = engine();
    let request = FetchRequest::navigation(url("https://shop.example.com/dashboard"));
    let root_key = request.for_page("/").cache_key();
    store
      .put("static-v1", &root_key, &snapshot("<html>root</html>"))
      .unwrap();
    net.set_offline(true);

    let response = engine.execute(Route::Navigation, &request).await.unwrap();

    assert_eq!(response.body, b"<html>root</html>");
  }

  #[tokio::test]
  async fn test_navigation_offline_with_nothing_cached_serves_offline_page() {
    let (engine, _, _, net) = engine();
    net.set_offline(true);
    let request = FetchRequest::navigation(url("https://shop.example.com/dashboard"));

    let response = engine.execute(Route::Navigation, &request).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.content_type(), Some("text/html"));
    assert!(String::from_utf8_lossy(&response.body).contains("You're Offline"));
  }

  #[tokio::test]
  async fn test_precache_fills_static_generation_and_skips_failures() {
    let (engine, store, _, net) = engine();
    net.respond_ok(HttpMethod::Get, "https://shop.example.com/", "<html>");
    net.respond_ok(
      HttpMethod::Get,
      "https://shop.example.com/manifest.json",
      "{}",
    );
    net.fail(HttpMethod::Get, "https://shop.example.com/sign-in");

    let assets = vec![
      "/".to_string(),
      "/sign-in".to_string(),
      "/manifest.json".to_string(),
    ];
    let cached = engine
      .precache(&url("https://shop.example.com"), &assets)
      .await
      .unwrap();

    assert_eq!(cached, 2);
    let root = FetchRequest::get(url("https://shop.example.com/"));
    assert!(store
      .lookup("static-v1", &root.cache_key())
      .unwrap()
      .is_some());
  }

  #[test]
  fn test_resource_class_extraction() {
    assert_eq!(resource_class("/api/sales", "/api/"), Some("sales"));
    assert_eq!(resource_class("/api/inventory/42", "/api/"), Some("inventory"));
    assert_eq!(resource_class("/other/sales", "/api/"), None);
    assert_eq!(resource_class("/api/", "/api/"), None);
  }
}
