//! Cache proxy that applies a caching policy per request class.

use reqwest::Method;
use std::sync::Arc;
use url::Url;

use super::routes::{Namespace, RouteTable, Strategy};
use super::storage::{CacheEntry, CacheStorage};
use super::traits::{Fetch, ProxyRequest, ProxyResponse, ResponseSource};
use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::error::{Error, NetworkError, Result};

const BUILTIN_OFFLINE_PAGE: &str = "<!DOCTYPE html><html><head><title>Offline</title></head>\
<body><h1>You are offline</h1><p>Messages you send will be delivered once the connection \
returns.</p></body></html>";

/// Outcome of [`CacheProxy::precache`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PrecacheReport {
  pub cached: Vec<String>,
  pub failed: Vec<String>,
}

/// Intercepts outbound reads and decides whether to serve them from the
/// cache or the network.
///
/// Storage failures never fail a request: they are logged and the proxy
/// behaves as if the entry were absent.
pub struct CacheProxy<F: Fetch, S: CacheStorage> {
  fetcher: F,
  storage: Arc<S>,
  routes: RouteTable,
  clock: Arc<dyn Clock>,
  base_url: Url,
  offline_fallback: String,
  version: String,
}

impl<F: Fetch, S: CacheStorage> CacheProxy<F, S> {
  pub fn new(
    fetcher: F,
    storage: S,
    config: &CacheConfig,
    base_url: Url,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      fetcher,
      storage: Arc::new(storage),
      routes: RouteTable::new(config),
      clock,
      base_url,
      offline_fallback: config.offline_fallback.clone(),
      version: config.version.clone(),
    }
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  /// Resolve a path (or absolute URL) against the server base URL.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self.base_url.join(path).map_err(|e| Error::InvalidUrl {
      url: path.to_string(),
      message: e.to_string(),
    })
  }

  /// GET a path through the proxy.
  pub async fn get(&self, path: &str) -> Result<ProxyResponse> {
    let request = ProxyRequest::get(self.resolve(path)?);
    Ok(self.handle(&request).await?)
  }

  /// Navigate to a page through the proxy.
  pub async fn navigate(&self, path: &str) -> Result<ProxyResponse> {
    let request = ProxyRequest::navigate(self.resolve(path)?);
    Ok(self.handle(&request).await?)
  }

  /// Handle a request.
  ///
  /// Non-GET requests bypass the cache. A generic failure is returned only
  /// when a cache-first subresource misses and the network is unreachable.
  pub async fn handle(&self, request: &ProxyRequest) -> Result<ProxyResponse, NetworkError> {
    if request.method != Method::GET {
      return self.fetcher.fetch(request).await;
    }

    match self.routes.classify(request.url.path()) {
      strategy @ Strategy::CacheFirst { .. } => self.cache_first(request, strategy).await,
      strategy @ Strategy::NetworkFirst { .. } => self.network_first(request, strategy).await,
    }
  }

  async fn cache_first(
    &self,
    request: &ProxyRequest,
    strategy: Strategy,
  ) -> Result<ProxyResponse, NetworkError> {
    if let Some(entry) = self.lookup(request) {
      return Ok(entry.into_response());
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        self.remember(request, &response, strategy);
        Ok(response)
      }
      Err(e) if request.navigation => {
        tracing::debug!(url = %request.url, error = %e, "Serving offline fallback");
        Ok(self.offline_fallback())
      }
      Err(e) => Err(e),
    }
  }

  async fn network_first(
    &self,
    request: &ProxyRequest,
    strategy: Strategy,
  ) -> Result<ProxyResponse, NetworkError> {
    match self.fetcher.fetch(request).await {
      Ok(response) => {
        self.remember(request, &response, strategy);
        Ok(response)
      }
      Err(e) => {
        tracing::debug!(url = %request.url, error = %e, "Network failed, trying cache");
        if let Some(entry) = self.lookup(request) {
          Ok(entry.into_response())
        } else if request.navigation {
          Ok(self.offline_fallback())
        } else {
          Ok(ProxyResponse::service_unavailable())
        }
      }
    }
  }

  fn lookup(&self, request: &ProxyRequest) -> Option<CacheEntry> {
    match self.storage.lookup(&request.cache_key()) {
      Ok(entry) => entry,
      Err(e) => {
        tracing::warn!(url = %request.url, error = %e, "Cache lookup failed");
        None
      }
    }
  }

  /// Store a successful response and trim its namespace.
  fn remember(&self, request: &ProxyRequest, response: &ProxyResponse, strategy: Strategy) {
    if !response.is_success() {
      return;
    }

    let entry = CacheEntry {
      key: request.cache_key(),
      namespace: strategy.namespace().as_str().to_string(),
      url: request.url.to_string(),
      status: response.status,
      content_type: response.content_type.clone(),
      body: response.body.clone(),
      stored_at: self.clock.now_millis(),
    };

    if let Err(e) = self.storage.store(&entry, strategy.capacity()) {
      tracing::warn!(url = %request.url, error = %e, "Failed to cache response");
    }
  }

  fn offline_fallback(&self) -> ProxyResponse {
    let cached = self
      .resolve(&self.offline_fallback)
      .ok()
      .and_then(|url| self.lookup(&ProxyRequest::get(url)));

    match cached {
      Some(entry) => ProxyResponse {
        source: ResponseSource::OfflineFallback,
        ..entry.into_response()
      },
      None => ProxyResponse {
        status: 503,
        content_type: Some("text/html".to_string()),
        body: BUILTIN_OFFLINE_PAGE.as_bytes().to_vec(),
        source: ResponseSource::OfflineFallback,
      },
    }
  }

  /// Fetch and store the offline fallback page and the given shell assets
  /// in the static namespace.
  pub async fn precache(&self, paths: &[String]) -> PrecacheReport {
    let mut report = PrecacheReport::default();
    let capacity = self.routes.capacity(Namespace::Static);
    let strategy = Strategy::CacheFirst {
      namespace: Namespace::Static,
      capacity,
    };

    let mut targets: Vec<&str> = vec![self.offline_fallback.as_str()];
    targets.extend(
      paths
        .iter()
        .map(String::as_str)
        .filter(|p| *p != self.offline_fallback),
    );

    for path in targets {
      let url = match self.resolve(path) {
        Ok(url) => url,
        Err(e) => {
          tracing::warn!(path, error = %e, "Skipping precache entry");
          report.failed.push(path.to_string());
          continue;
        }
      };

      let request = ProxyRequest::get(url);
      match self.fetcher.fetch(&request).await {
        Ok(response) if response.is_success() => {
          self.remember(&request, &response, strategy);
          report.cached.push(path.to_string());
        }
        Ok(response) => {
          tracing::warn!(path, status = response.status, "Precache fetch rejected");
          report.failed.push(path.to_string());
        }
        Err(e) => {
          tracing::warn!(path, error = %e, "Precache fetch failed");
          report.failed.push(path.to_string());
        }
      }
    }

    tracing::info!(
      cached = report.cached.len(),
      failed = report.failed.len(),
      "Precache finished"
    );
    report
  }

  /// Drop every namespace populated under a different cache version, then
  /// record the current version. Returns the cleared namespaces.
  pub fn activate(&self) -> Vec<Namespace> {
    let now = self.clock.now_millis();
    let mut cleared = Vec::new();

    for namespace in Namespace::ALL {
      let recorded = match self.storage.namespace_version(namespace) {
        Ok(recorded) => recorded,
        Err(e) => {
          tracing::warn!(namespace = namespace.as_str(), error = %e, "Cannot read cache version");
          continue;
        }
      };

      if recorded.as_deref() == Some(self.version.as_str()) {
        continue;
      }

      if recorded.is_some() {
        match self.storage.clear_namespace(namespace) {
          Ok(removed) => {
            tracing::info!(namespace = namespace.as_str(), removed, "Cleared outdated cache");
            cleared.push(namespace);
          }
          Err(e) => {
            tracing::warn!(namespace = namespace.as_str(), error = %e, "Failed to clear cache");
            continue;
          }
        }
      }

      if let Err(e) = self.storage.set_namespace_version(namespace, &self.version, now) {
        tracing::warn!(namespace = namespace.as_str(), error = %e, "Cannot record cache version");
      }
    }

    cleared
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::StoreStorage;
  use crate::clock::SystemClock;
  use crate::store::{Store, SCHEMA_VERSION};
  use async_trait::async_trait;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
  use std::sync::Mutex;

  /// Serves canned bodies by path; fails every request while offline.
  #[derive(Default)]
  struct ScriptedFetcher {
    offline: AtomicBool,
    bodies: Mutex<HashMap<String, (u16, String)>>,
    calls: AtomicUsize,
  }

  impl ScriptedFetcher {
    fn serve(&self, path: &str, status: u16, body: &str) {
      self
        .bodies
        .lock()
        .unwrap()
        .insert(path.to_string(), (status, body.to_string()));
    }

    fn go_offline(&self) {
      self.offline.store(true, Ordering::SeqCst);
    }
  }

  #[async_trait]
  impl Fetch for Arc<ScriptedFetcher> {
    async fn fetch(&self, request: &ProxyRequest) -> Result<ProxyResponse, NetworkError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if self.offline.load(Ordering::SeqCst) {
        return Err(NetworkError::unreachable("offline"));
      }
      let bodies = self.bodies.lock().unwrap();
      let (status, body) = bodies
        .get(request.url.path())
        .cloned()
        .unwrap_or((404, "not found".to_string()));
      Ok(ProxyResponse::from_network(
        status,
        Some("text/plain".to_string()),
        body.into_bytes(),
      ))
    }
  }

  fn proxy(
    config: &CacheConfig,
  ) -> (
    CacheProxy<Arc<ScriptedFetcher>, StoreStorage>,
    Arc<ScriptedFetcher>,
    Arc<Store>,
  ) {
    let fetcher = Arc::new(ScriptedFetcher::default());
    let store = Arc::new(Store::open_in_memory(SCHEMA_VERSION).unwrap());
    let proxy = CacheProxy::new(
      Arc::clone(&fetcher),
      StoreStorage::new(Arc::clone(&store)),
      config,
      Url::parse("http://agribot.local").unwrap(),
      Arc::new(SystemClock),
    );
    (proxy, fetcher, store)
  }

  #[tokio::test]
  async fn test_cache_first_serves_hit_without_network() {
    let (proxy, fetcher, _) = proxy(&CacheConfig::default());
    fetcher.serve("/static/app.js", 200, "console.log(1)");

    let first = proxy.get("/static/app.js").await.unwrap();
    assert_eq!(first.source, ResponseSource::Network);

    let second = proxy.get("/static/app.js").await.unwrap();
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(second.text(), "console.log(1)");
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_cache_first_miss_offline() {
    let (proxy, fetcher, _) = proxy(&CacheConfig::default());
    fetcher.serve("/offline.html", 200, "<h1>offline</h1>");
    proxy.precache(&[]).await;
    fetcher.go_offline();

    // Subresource: generic failure.
    let err = proxy.get("/static/missing.css").await.unwrap_err();
    assert!(matches!(err, Error::Network(NetworkError::NetworkUnreachable(_))));

    // Navigation: the precached fallback page.
    let page = proxy.navigate("/static/page.png").await.unwrap();
    assert_eq!(page.source, ResponseSource::OfflineFallback);
    assert_eq!(page.text(), "<h1>offline</h1>");
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_cache_then_503() {
    let (proxy, fetcher, _) = proxy(&CacheConfig::default());
    fetcher.serve("/api/v1/knowledge/crops", 200, "[\"maize\"]");

    let fresh = proxy.get("/api/v1/knowledge/crops").await.unwrap();
    assert_eq!(fresh.source, ResponseSource::Network);

    fetcher.go_offline();
    let cached = proxy.get("/api/v1/knowledge/crops").await.unwrap();
    assert_eq!(cached.source, ResponseSource::Cache);
    assert_eq!(cached.text(), "[\"maize\"]");

    let missing = proxy.get("/chat/suggestions").await.unwrap();
    assert_eq!(missing.status, 503);
    assert_eq!(missing.source, ResponseSource::Synthesized);

    let page = proxy.navigate("/chatbot.html").await.unwrap();
    assert_eq!(page.source, ResponseSource::OfflineFallback);
    assert_eq!(page.status, 503);
  }

  #[tokio::test]
  async fn test_error_responses_are_not_cached() {
    let (proxy, fetcher, _) = proxy(&CacheConfig::default());
    fetcher.serve("/chat/suggestions", 500, "boom");

    let response = proxy.get("/chat/suggestions").await.unwrap();
    assert_eq!(response.status, 500);
    assert_eq!(proxy.storage().len(Namespace::Runtime).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_runtime_namespace_is_bounded() {
    let config = CacheConfig {
      runtime_capacity: 3,
      ..CacheConfig::default()
    };
    let (proxy, fetcher, _) = proxy(&config);
    for n in 0..8 {
      let path = format!("/chat/item/{}", n);
      fetcher.serve(&path, 200, &n.to_string());
      proxy.get(&path).await.unwrap();
    }

    assert_eq!(proxy.storage().len(Namespace::Runtime).unwrap(), 3);
    fetcher.go_offline();
    assert_eq!(proxy.get("/chat/item/7").await.unwrap().source, ResponseSource::Cache);
    assert_eq!(proxy.get("/chat/item/4").await.unwrap().status, 503);
  }

  #[tokio::test]
  async fn test_non_get_requests_bypass_cache() {
    let (proxy, fetcher, _) = proxy(&CacheConfig::default());
    fetcher.serve("/static/form.js", 200, "x");
    let request = ProxyRequest {
      method: Method::POST,
      url: proxy.resolve("/static/form.js").unwrap(),
      navigation: false,
    };

    proxy.handle(&request).await.unwrap();
    proxy.handle(&request).await.unwrap();

    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    assert_eq!(proxy.storage().len(Namespace::Static).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_activate_clears_namespaces_from_older_version() {
    let (proxy, fetcher, store) = proxy(&CacheConfig::default());
    assert!(proxy.activate().is_empty());

    fetcher.serve("/static/app.css", 200, "body{}");
    proxy.get("/static/app.css").await.unwrap();
    assert_eq!(proxy.storage().len(Namespace::Static).unwrap(), 1);

    let upgraded = CacheProxy::new(
      Arc::clone(&fetcher),
      StoreStorage::new(Arc::clone(&store)),
      &CacheConfig {
        version: "v2".to_string(),
        ..CacheConfig::default()
      },
      Url::parse("http://agribot.local").unwrap(),
      Arc::new(SystemClock),
    );
    assert_eq!(upgraded.activate(), Namespace::ALL.to_vec());
    assert_eq!(upgraded.storage().len(Namespace::Static).unwrap(), 0);
    assert!(upgraded.activate().is_empty());
  }
}
