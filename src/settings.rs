//! Key-value bookkeeping records with optional TTL.
//!
//! Used for both the `preferences` and `cache-metadata` collections.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;
use crate::store::{IndexQuery, Store, Transaction, CACHE_METADATA};

/// A named value. Expired settings read as absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Setting {
  pub name: String,
  pub value: Value,
  pub updated_at: i64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub expires_at: Option<i64>,
}

impl Setting {
  pub fn new(name: impl Into<String>, value: impl Serialize, now: i64) -> Result<Self, StoreError> {
    Ok(Self {
      name: name.into(),
      value: serde_json::to_value(value)?,
      updated_at: now,
      expires_at: None,
    })
  }

  pub fn with_ttl_millis(mut self, ttl: i64) -> Self {
    self.expires_at = Some(self.updated_at.saturating_add(ttl));
    self
  }

  pub fn is_expired(&self, now: i64) -> bool {
    self.expires_at.is_some_and(|expires| now >= expires)
  }
}

/// Read a setting's value, treating expired entries as absent.
pub fn read<T: DeserializeOwned>(
  store: &Store,
  collection: &str,
  name: &str,
  now: i64,
) -> Result<Option<T>, StoreError> {
  let setting: Option<Setting> = store.get(collection, name)?;
  match setting {
    Some(setting) if !setting.is_expired(now) => Ok(Some(serde_json::from_value(setting.value)?)),
    _ => Ok(None),
  }
}

pub fn write(store: &Store, collection: &str, setting: &Setting) -> Result<(), StoreError> {
  store.put(collection, setting).map(|_| ())
}

pub fn write_in(
  tx: &Transaction<'_>,
  collection: &str,
  setting: &Setting,
) -> Result<(), StoreError> {
  tx.put(collection, setting).map(|_| ())
}

/// Delete cache metadata whose TTL has passed. Returns how many were removed.
pub fn purge_expired_metadata(store: &Store, now: i64) -> Result<usize, StoreError> {
  store.run_in_transaction(&[CACHE_METADATA], |tx| {
    let expired = tx.keys_by_index(CACHE_METADATA, "expiresAt", IndexQuery::at_most(now))?;
    let mut removed = 0;
    for key in expired {
      if tx.delete(CACHE_METADATA, key)? {
        removed += 1;
      }
    }
    Ok(removed)
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::{PREFERENCES, SCHEMA_VERSION};

  #[test]
  fn test_expired_setting_reads_as_absent() {
    let store = Store::open_in_memory(SCHEMA_VERSION).unwrap();
    let setting = Setting::new("token", "abc", 1_000).unwrap().with_ttl_millis(500);
    write(&store, PREFERENCES, &setting).unwrap();

    let fresh: Option<String> = read(&store, PREFERENCES, "token", 1_499).unwrap();
    assert_eq!(fresh.as_deref(), Some("abc"));

    let stale: Option<String> = read(&store, PREFERENCES, "token", 1_500).unwrap();
    assert_eq!(stale, None);
  }

  #[test]
  fn test_purge_expired_metadata_uses_expiry_index() {
    let store = Store::open_in_memory(SCHEMA_VERSION).unwrap();
    let short = Setting::new("a", 1, 0).unwrap().with_ttl_millis(10);
    let long = Setting::new("b", 2, 0).unwrap().with_ttl_millis(1_000);
    let forever = Setting::new("c", 3, 0).unwrap();
    for setting in [&short, &long, &forever] {
      write(&store, CACHE_METADATA, setting).unwrap();
    }

    assert_eq!(purge_expired_metadata(&store, 100).unwrap(), 1);
    assert_eq!(store.count(CACHE_METADATA).unwrap(), 2);
  }
}
