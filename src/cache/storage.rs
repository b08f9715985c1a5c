//! Cache storage trait and store-backed implementation.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::routes::Namespace;
use super::traits::{ProxyResponse, ResponseSource};
use crate::error::StoreError;
use crate::settings::{self, Setting};
use crate::store::{IndexQuery, Store, CACHE_ENTRIES, CACHE_METADATA};

/// A stored response, keyed by request identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
  pub key: String,
  pub namespace: String,
  pub url: String,
  pub status: u16,
  pub content_type: Option<String>,
  #[serde(with = "crate::encoding::hex_bytes")]
  pub body: Vec<u8>,
  pub stored_at: i64,
}

impl CacheEntry {
  pub fn into_response(self) -> ProxyResponse {
    ProxyResponse {
      status: self.status,
      content_type: self.content_type,
      body: self.body,
      source: ResponseSource::Cache,
    }
  }
}

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync {
  /// Get the cached entry for a request key.
  fn lookup(&self, key: &str) -> Result<Option<CacheEntry>, StoreError>;

  /// Store an entry, then evict the oldest entries of its namespace beyond
  /// `capacity`. Returns how many were evicted.
  fn store(&self, entry: &CacheEntry, capacity: usize) -> Result<usize, StoreError>;

  /// Number of entries in a namespace.
  fn len(&self, namespace: Namespace) -> Result<usize, StoreError>;

  /// Drop every entry of a namespace.
  fn clear_namespace(&self, namespace: Namespace) -> Result<usize, StoreError>;

  /// Version a namespace was populated under, if recorded.
  fn namespace_version(&self, namespace: Namespace) -> Result<Option<String>, StoreError>;

  fn set_namespace_version(
    &self,
    namespace: Namespace,
    version: &str,
    now: i64,
  ) -> Result<(), StoreError>;
}

impl<S: CacheStorage + ?Sized> CacheStorage for Box<S> {
  fn lookup(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
    (**self).lookup(key)
  }

  fn store(&self, entry: &CacheEntry, capacity: usize) -> Result<usize, StoreError> {
    (**self).store(entry, capacity)
  }

  fn len(&self, namespace: Namespace) -> Result<usize, StoreError> {
    (**self).len(namespace)
  }

  fn clear_namespace(&self, namespace: Namespace) -> Result<usize, StoreError> {
    (**self).clear_namespace(namespace)
  }

  fn namespace_version(&self, namespace: Namespace) -> Result<Option<String>, StoreError> {
    (**self).namespace_version(namespace)
  }

  fn set_namespace_version(
    &self,
    namespace: Namespace,
    version: &str,
    now: i64,
  ) -> Result<(), StoreError> {
    (**self).set_namespace_version(namespace, version, now)
  }
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn lookup(&self, _key: &str) -> Result<Option<CacheEntry>, StoreError> {
    Ok(None) // Always miss
  }

  fn store(&self, _entry: &CacheEntry, _capacity: usize) -> Result<usize, StoreError> {
    Ok(0) // Discard
  }

  fn len(&self, _namespace: Namespace) -> Result<usize, StoreError> {
    Ok(0)
  }

  fn clear_namespace(&self, _namespace: Namespace) -> Result<usize, StoreError> {
    Ok(0)
  }

  fn namespace_version(&self, _namespace: Namespace) -> Result<Option<String>, StoreError> {
    Ok(None)
  }

  fn set_namespace_version(
    &self,
    _namespace: Namespace,
    _version: &str,
    _now: i64,
  ) -> Result<(), StoreError> {
    Ok(())
  }
}

/// Cache storage over the durable local store.
pub struct StoreStorage {
  store: Arc<Store>,
}

impl StoreStorage {
  pub fn new(store: Arc<Store>) -> Self {
    Self { store }
  }
}

fn version_setting_name(namespace: Namespace) -> String {
  format!("namespace-version:{}", namespace.as_str())
}

impl CacheStorage for StoreStorage {
  fn lookup(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
    self.store.get(CACHE_ENTRIES, key)
  }

  fn store(&self, entry: &CacheEntry, capacity: usize) -> Result<usize, StoreError> {
    self.store.run_in_transaction(&[CACHE_ENTRIES], |tx| {
      tx.put(CACHE_ENTRIES, entry)?;

      // Oldest-inserted first; re-stored keys count as new insertions.
      let keys = tx.keys_by_index(
        CACHE_ENTRIES,
        "namespace",
        IndexQuery::eq(entry.namespace.as_str()),
      )?;
      let excess = keys.len().saturating_sub(capacity);
      for key in keys.into_iter().take(excess) {
        tx.delete(CACHE_ENTRIES, key)?;
      }

      if excess > 0 {
        tracing::debug!(namespace = %entry.namespace, evicted = excess, "Evicted cache entries");
      }
      Ok(excess)
    })
  }

  fn len(&self, namespace: Namespace) -> Result<usize, StoreError> {
    let keys = self
      .store
      .keys_by_index(CACHE_ENTRIES, "namespace", IndexQuery::eq(namespace.as_str()))?;
    Ok(keys.len())
  }

  fn clear_namespace(&self, namespace: Namespace) -> Result<usize, StoreError> {
    self.store.run_in_transaction(&[CACHE_ENTRIES], |tx| {
      let keys =
        tx.keys_by_index(CACHE_ENTRIES, "namespace", IndexQuery::eq(namespace.as_str()))?;
      let count = keys.len();
      for key in keys {
        tx.delete(CACHE_ENTRIES, key)?;
      }
      Ok(count)
    })
  }

  fn namespace_version(&self, namespace: Namespace) -> Result<Option<String>, StoreError> {
    // Versions never expire; the clock value is irrelevant here.
    settings::read(&self.store, CACHE_METADATA, &version_setting_name(namespace), 0)
  }

  fn set_namespace_version(
    &self,
    namespace: Namespace,
    version: &str,
    now: i64,
  ) -> Result<(), StoreError> {
    let setting = Setting::new(version_setting_name(namespace), version, now)?;
    settings::write(&self.store, CACHE_METADATA, &setting)
  }
}
