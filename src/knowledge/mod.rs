//! Read-through cache of semi-static reference data.
//!
//! Each category payload is persisted with a fixed 7-day TTL. Reads go to
//! the network when online and fall back to the last persisted payload
//! within the same call; expired payloads read as absent but are kept
//! until a later refresh overwrites them.

mod search;

pub use search::{tokenize, SearchHit};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use url::Url;

use crate::cache::{Fetch, ProxyRequest};
use crate::clock::{self, Clock};
use crate::config::KnowledgeConfig;
use crate::connectivity::Connectivity;
use crate::error::{Error, NetworkError, Result, StoreError};
use crate::settings::{self, Setting};
use crate::store::{Store, KNOWLEDGE_ENTRIES, PREFERENCES};

/// Reference categories served by the chat server.
pub const DEFAULT_CATEGORIES: &[&str] = &[
  "crops",
  "diseases",
  "pests",
  "best-practices",
  "seasonal-calendar",
  "soil-management",
  "irrigation",
  "fertilizers",
  "weather-tips",
  "market-info",
];

const VERSION_PREF: &str = "knowledge.cacheVersion";
const LAST_REFRESH_PREF: &str = "knowledge.lastRefresh";

/// Fixed lifetime of a knowledge entry.
pub fn ttl() -> Duration {
  Duration::days(7)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeEntry {
  pub category: String,
  pub payload: Value,
  pub last_updated: i64,
  pub expires_at: i64,
}

impl KnowledgeEntry {
  pub fn is_fresh(&self, now: i64) -> bool {
    now < self.expires_at
  }
}

/// Payload returned by [`KnowledgeCache::get`].
#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeResult {
  pub category: String,
  pub payload: Value,
  /// True when the network could not be used and the payload was read
  /// from the local store
  pub from_cache: bool,
  pub last_updated: DateTime<Utc>,
}

/// Outcome of a bulk refresh.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshReport {
  pub refreshed: Vec<String>,
  pub failed: Vec<String>,
}

/// Freshness of a cached category, for status displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedCategory {
  pub category: String,
  pub last_updated: DateTime<Utc>,
  pub expired: bool,
}

pub struct KnowledgeCache<F: Fetch> {
  fetcher: F,
  store: Arc<Store>,
  connectivity: Connectivity,
  clock: Arc<dyn Clock>,
  base_url: Url,
  config: KnowledgeConfig,
}

impl<F: Fetch> KnowledgeCache<F> {
  pub fn new(
    fetcher: F,
    store: Arc<Store>,
    connectivity: Connectivity,
    clock: Arc<dyn Clock>,
    base_url: Url,
    config: KnowledgeConfig,
  ) -> Self {
    Self {
      fetcher,
      store,
      connectivity,
      clock,
      base_url,
      config,
    }
  }

  pub fn categories(&self) -> &[String] {
    &self.config.categories
  }

  fn ensure_known(&self, category: &str) -> Result<()> {
    if self.config.categories.iter().any(|c| c == category) {
      Ok(())
    } else {
      Err(Error::UnknownCategory(category.to_string()))
    }
  }

  fn endpoint(&self, category: &str) -> Result<Url> {
    let path = self.config.endpoint.replace("{category}", category);
    self.base_url.join(&path).map_err(|e| Error::InvalidUrl {
      url: path,
      message: e.to_string(),
    })
  }

  /// Payload for a category: fresh from the network when online, else the
  /// last persisted payload if it has not expired.
  pub async fn get(&self, category: &str) -> Result<Option<KnowledgeResult>> {
    self.ensure_known(category)?;

    if self.connectivity.is_online() {
      match self.fetch_category(category).await {
        Ok(payload) => {
          let now = self.clock.now();
          if let Err(e) = self.persist(category, &payload, now.timestamp_millis()) {
            tracing::warn!(category, error = %e, "Failed to persist knowledge entry");
          }
          return Ok(Some(KnowledgeResult {
            category: category.to_string(),
            payload,
            from_cache: false,
            last_updated: now,
          }));
        }
        Err(e) => {
          tracing::info!(category, error = %e, "Knowledge fetch failed, using cache");
        }
      }
    }

    Ok(self.cached(category))
  }

  /// The persisted, non-expired entry for a category.
  pub fn cached(&self, category: &str) -> Option<KnowledgeResult> {
    let entry = match self.store.get::<KnowledgeEntry>(KNOWLEDGE_ENTRIES, category) {
      Ok(entry) => entry?,
      Err(e) => {
        tracing::warn!(category, error = %e, "Failed to read knowledge entry");
        return None;
      }
    };

    if !entry.is_fresh(self.clock.now_millis()) {
      tracing::debug!(category, "Knowledge entry expired");
      return None;
    }

    Some(KnowledgeResult {
      last_updated: clock::from_millis(entry.last_updated).unwrap_or_default(),
      category: entry.category,
      payload: entry.payload,
      from_cache: true,
    })
  }

  async fn fetch_category(&self, category: &str) -> Result<Value> {
    let request = ProxyRequest::get(self.endpoint(category)?);
    let response = self.fetcher.fetch(&request).await?;
    if !response.is_success() {
      return Err(NetworkError::rejected(response.status, format!("fetching {}", category)).into());
    }
    response.json().map_err(|e| {
      let message = format!("invalid JSON for {}: {}", category, e);
      NetworkError::rejected(response.status, message).into()
    })
  }

  fn persist(&self, category: &str, payload: &Value, now: i64) -> Result<(), StoreError> {
    let entry = KnowledgeEntry {
      category: category.to_string(),
      payload: payload.clone(),
      last_updated: now,
      expires_at: now + ttl().num_milliseconds(),
    };
    self.store.put(KNOWLEDGE_ENTRIES, &entry).map(|_| ())
  }

  /// Search the cached payloads of `categories` (all known categories when
  /// `None`). Hits are sorted by descending score; ties keep category and
  /// document order.
  pub fn search(
    &self,
    query: &str,
    categories: Option<&[String]>,
    limit: Option<usize>,
  ) -> Vec<SearchHit> {
    let terms = tokenize(query);
    if terms.is_empty() {
      return Vec::new();
    }

    let categories = categories.unwrap_or(&self.config.categories);
    let mut hits: Vec<SearchHit> = categories
      .iter()
      .filter_map(|category| self.cached(category))
      .flat_map(|result| search::scan(&result.category, &result.payload, &terms))
      .collect();

    hits.sort_by(|a, b| b.score.cmp(&a.score));
    if let Some(limit) = limit {
      hits.truncate(limit);
    }
    hits
  }

  /// Fetch only categories without a fresh entry.
  pub async fn initialize_cache(&self) -> Result<RefreshReport> {
    let missing: Vec<String> = self
      .config
      .categories
      .iter()
      .filter(|c| self.cached(c).is_none())
      .cloned()
      .collect();
    self.refresh_categories(&missing).await
  }

  /// Refetch every known category.
  pub async fn refresh_cache(&self) -> Result<RefreshReport> {
    let categories = self.config.categories.clone();
    self.refresh_categories(&categories).await
  }

  /// Refresh when online and [`Self::needs_refresh`] says so.
  pub async fn refresh_if_due(&self) -> Result<Option<RefreshReport>> {
    if !self.connectivity.is_online() || !self.needs_refresh()? {
      return Ok(None);
    }
    self.refresh_cache().await.map(Some)
  }

  async fn refresh_categories(&self, categories: &[String]) -> Result<RefreshReport> {
    let mut report = RefreshReport::default();

    for (i, category) in categories.iter().enumerate() {
      if i > 0 && !self.config.refresh_delay().is_zero() {
        tokio::time::sleep(self.config.refresh_delay()).await;
      }

      let outcome = match self.fetch_category(category).await {
        Ok(payload) => self
          .persist(category, &payload, self.clock.now_millis())
          .map_err(Error::from),
        Err(e) => Err(e),
      };

      match outcome {
        Ok(()) => report.refreshed.push(category.clone()),
        Err(e) => {
          tracing::warn!(category = %category, error = %e, "Skipping knowledge category");
          report.failed.push(category.clone());
        }
      }
    }

    if !report.refreshed.is_empty() {
      self.record_refresh()?;
    }

    tracing::info!(
      refreshed = report.refreshed.len(),
      failed = report.failed.len(),
      "Knowledge refresh finished"
    );
    Ok(report)
  }

  fn record_refresh(&self) -> Result<(), StoreError> {
    let now = self.clock.now_millis();
    let version = Setting::new(VERSION_PREF, &self.config.cache_version, now)?;
    let last_refresh = Setting::new(LAST_REFRESH_PREF, now, now)?;
    self.store.run_in_transaction(&[PREFERENCES], |tx| {
      settings::write_in(tx, PREFERENCES, &version)?;
      settings::write_in(tx, PREFERENCES, &last_refresh)
    })
  }

  /// Due when the recorded cache version differs from the configured one,
  /// when no refresh was ever recorded, or when the last one is older than
  /// the TTL.
  pub fn needs_refresh(&self) -> Result<bool, StoreError> {
    let now = self.clock.now_millis();
    let version: Option<String> = settings::read(&self.store, PREFERENCES, VERSION_PREF, now)?;
    if version.as_deref() != Some(self.config.cache_version.as_str()) {
      return Ok(true);
    }

    let last_refresh: Option<i64> =
      settings::read(&self.store, PREFERENCES, LAST_REFRESH_PREF, now)?;
    Ok(match last_refresh {
      Some(at) => now - at > ttl().num_milliseconds(),
      None => true,
    })
  }

  /// Cached categories with their freshness, most recently updated first.
  pub fn cached_categories(&self) -> Result<Vec<CachedCategory>, StoreError> {
    let now = self.clock.now_millis();
    let entries: Vec<KnowledgeEntry> = self.store.get_all(KNOWLEDGE_ENTRIES)?;
    let mut categories: Vec<CachedCategory> = entries
      .into_iter()
      .map(|entry| CachedCategory {
        expired: !entry.is_fresh(now),
        last_updated: clock::from_millis(entry.last_updated).unwrap_or_default(),
        category: entry.category,
      })
      .collect();
    categories.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
    Ok(categories)
  }

  /// Drop every entry and the refresh bookkeeping.
  pub fn clear(&self) -> Result<(), StoreError> {
    self.store.run_in_transaction(&[KNOWLEDGE_ENTRIES, PREFERENCES], |tx| {
      tx.clear(KNOWLEDGE_ENTRIES)?;
      tx.delete(PREFERENCES, VERSION_PREF)?;
      tx.delete(PREFERENCES, LAST_REFRESH_PREF)?;
      Ok(())
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::ProxyResponse;
  use crate::clock::ManualClock;
  use crate::store::SCHEMA_VERSION;
  use async_trait::async_trait;
  use chrono::TimeZone;
  use pretty_assertions::assert_eq;
  use serde_json::json;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::Mutex;

  #[derive(Default)]
  struct FakeServer {
    down: AtomicBool,
    payloads: Mutex<HashMap<String, Value>>,
    requested: Mutex<Vec<String>>,
  }

  impl FakeServer {
    fn publish(&self, category: &str, payload: Value) {
      self
        .payloads
        .lock()
        .unwrap()
        .insert(format!("/api/v1/knowledge/{}", category), payload);
    }
  }

  #[async_trait]
  impl Fetch for Arc<FakeServer> {
    async fn fetch(&self, request: &ProxyRequest) -> Result<ProxyResponse, NetworkError> {
      let path = request.url.path().to_string();
      self.requested.lock().unwrap().push(path.clone());
      if self.down.load(Ordering::SeqCst) {
        return Err(NetworkError::unreachable("connection refused"));
      }
      match self.payloads.lock().unwrap().get(&path) {
        Some(payload) => Ok(ProxyResponse::from_network(
          200,
          Some("application/json".to_string()),
          payload.to_string().into_bytes(),
        )),
        None => Ok(ProxyResponse::from_network(404, None, Vec::new())),
      }
    }
  }

  struct Fixture {
    cache: KnowledgeCache<Arc<FakeServer>>,
    server: Arc<FakeServer>,
    clock: ManualClock,
    connectivity: Connectivity,
  }

  fn fixture() -> Fixture {
    let server = Arc::new(FakeServer::default());
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap());
    let connectivity = Connectivity::new(true);
    let config = KnowledgeConfig {
      refresh_delay_ms: 0,
      ..KnowledgeConfig::default()
    };
    let cache = KnowledgeCache::new(
      Arc::clone(&server),
      Arc::new(Store::open_in_memory(SCHEMA_VERSION).unwrap()),
      connectivity.clone(),
      Arc::new(clock.clone()),
      Url::parse("http://agribot.local").unwrap(),
      config,
    );
    Fixture {
      cache,
      server,
      clock,
      connectivity,
    }
  }

  #[tokio::test]
  async fn test_get_online_fetches_and_persists() {
    let f = fixture();
    f.server.publish("crops", json!({"crops": ["maize", "cassava"]}));

    let result = f.cache.get("crops").await.unwrap().unwrap();
    assert!(!result.from_cache);
    assert_eq!(result.payload["crops"][1], "cassava");

    let cached = f.cache.cached("crops").unwrap();
    assert_eq!(cached.payload, result.payload);
    assert_eq!(cached.last_updated, f.clock.now());
  }

  #[tokio::test]
  async fn test_network_failure_serves_cached_payload_with_flag() {
    let f = fixture();
    f.server.publish("crops", json!({"crops": ["maize"]}));
    f.cache.get("crops").await.unwrap();

    f.server.down.store(true, Ordering::SeqCst);
    f.clock.advance(Duration::hours(3));

    let result = f.cache.get("crops").await.unwrap().unwrap();
    assert!(result.from_cache);
    assert_eq!(result.payload, json!({"crops": ["maize"]}));
  }

  #[tokio::test]
  async fn test_ttl_served_at_six_days_absent_at_eight() {
    let f = fixture();
    f.server.publish("diseases", json!(["leaf blight"]));
    f.cache.get("diseases").await.unwrap();
    f.connectivity.set_online(false);

    f.clock.advance(Duration::days(6));
    let result = f.cache.get("diseases").await.unwrap().unwrap();
    assert!(result.from_cache);

    f.clock.advance(Duration::days(2));
    assert_eq!(f.cache.get("diseases").await.unwrap(), None);

    // Absent, but not deleted.
    assert_eq!(f.cache.cached_categories().unwrap().len(), 1);
    assert!(f.cache.cached_categories().unwrap()[0].expired);
  }

  #[tokio::test]
  async fn test_offline_get_never_touches_network() {
    let f = fixture();
    f.connectivity.set_online(false);

    assert_eq!(f.cache.get("pests").await.unwrap(), None);
    assert!(f.server.requested.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_error_status_falls_back_to_cache() {
    let f = fixture();
    // Nothing published: the server answers 404.
    assert_eq!(f.cache.get("irrigation").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_unknown_category_is_rejected() {
    let f = fixture();
    assert!(matches!(
      f.cache.get("astrology").await,
      Err(Error::UnknownCategory(_))
    ));
  }

  #[tokio::test]
  async fn test_refresh_records_version_and_skips_failures() {
    let f = fixture();
    f.server.publish("crops", json!({"maize": "staple"}));
    f.server.publish("pests", json!({"armyworm": "maize pest"}));
    assert!(f.cache.needs_refresh().unwrap());

    let report = f.cache.refresh_cache().await.unwrap();
    assert_eq!(report.refreshed, vec!["crops".to_string(), "pests".to_string()]);
    assert_eq!(report.failed.len(), DEFAULT_CATEGORIES.len() - 2);
    assert_eq!(
      f.server.requested.lock().unwrap().len(),
      DEFAULT_CATEGORIES.len()
    );

    assert!(!f.cache.needs_refresh().unwrap());
    f.clock.advance(Duration::days(7) + Duration::minutes(1));
    assert!(f.cache.needs_refresh().unwrap());
  }

  #[tokio::test]
  async fn test_version_change_makes_refresh_due() {
    let mut f = fixture();
    f.server.publish("crops", json!({}));
    f.cache.refresh_cache().await.unwrap();
    assert!(!f.cache.needs_refresh().unwrap());

    f.cache.config.cache_version = "2".to_string();
    assert!(f.cache.needs_refresh().unwrap());
  }

  #[tokio::test]
  async fn test_initialize_fetches_only_missing_categories() {
    let f = fixture();
    f.server.publish("crops", json!({}));
    f.cache.get("crops").await.unwrap();
    f.server.requested.lock().unwrap().clear();

    f.cache.initialize_cache().await.unwrap();

    let requested = f.server.requested.lock().unwrap();
    assert_eq!(requested.len(), DEFAULT_CATEGORIES.len() - 1);
    assert!(!requested.contains(&"/api/v1/knowledge/crops".to_string()));
  }

  #[tokio::test]
  async fn test_search_ranks_by_term_hits() {
    let f = fixture();
    f.server.publish(
      "crops",
      json!({"maize": {"planting": "Plant maize at the start of the rains"}}),
    );
    f.server.publish(
      "pests",
      json!({"armyworm": "Fall armyworm attacks maize; scout maize fields weekly"}),
    );
    f.cache.refresh_cache().await.unwrap();

    let hits = f.cache.search("maize armyworm", None, None);
    let summary: Vec<(&str, &str, usize)> = hits
      .iter()
      .map(|h| (h.category.as_str(), h.pointer.as_str(), h.score))
      .collect();
    assert_eq!(
      summary,
      vec![
        ("pests", "/armyworm", 3),
        ("crops", "/maize", 1),
        ("crops", "/maize/planting", 1),
        ("pests", "/armyworm", 1),
      ]
    );

    let only_crops = f
      .cache
      .search("maize", Some(&["crops".to_string()]), Some(1));
    assert_eq!(only_crops.len(), 1);
    assert_eq!(only_crops[0].category, "crops");

    assert!(f.cache.search("an of", None, None).is_empty());
  }

  #[tokio::test]
  async fn test_clear_drops_entries_and_bookkeeping() {
    let f = fixture();
    f.server.publish("crops", json!({}));
    f.cache.refresh_cache().await.unwrap();

    f.cache.clear().unwrap();
    assert!(f.cache.cached("crops").is_none());
    assert!(f.cache.needs_refresh().unwrap());
  }
}
