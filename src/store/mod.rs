//! Durable local store.
//!
//! A versioned, multi-collection object store over SQLite. Records are JSON
//! documents keyed by a field of the record (or an auto-assigned id), with
//! optional secondary indexes over top-level fields. Every operation is
//! atomic per record; [`Store::run_in_transaction`] spans several
//! collections with commit-or-rollback on every exit path.

mod key;
pub mod schema;

pub use key::{IndexQuery, Key};
pub use schema::{
  ACTION_QUEUE, CACHE_ENTRIES, CACHE_METADATA, KNOWLEDGE_ENTRIES, PREFERENCES, SCHEMA_VERSION,
};

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::StoreError;
use schema::{Catalog, CollectionInfo};

type StoreResult<T> = Result<T, StoreError>;

/// Handle to the local store. Share it behind an `Arc`.
pub struct Store {
  conn: Mutex<Connection>,
  catalog: Catalog,
  path: Option<PathBuf>,
  version: u32,
}

impl Store {
  /// Open or create the store at `path`, upgrading it to `version`.
  pub fn open(path: &Path, version: u32) -> StoreResult<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        StoreError::StorageUnavailable(format!(
          "failed to create store directory {}: {}",
          parent.display(),
          e
        ))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      StoreError::StorageUnavailable(format!("failed to open {}: {}", path.display(), e))
    })?;

    let journal: String = conn
      .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
      .map_err(|e| StoreError::StorageUnavailable(format!("failed to enable WAL: {}", e)))?;
    tracing::debug!(path = %path.display(), journal = %journal, "Opened local store");

    Self::init(conn, Some(path.to_path_buf()), version)
  }

  /// Open a store that lives only as long as this handle.
  pub fn open_in_memory(version: u32) -> StoreResult<Self> {
    let conn = Connection::open_in_memory().map_err(|e| {
      StoreError::StorageUnavailable(format!("failed to open in-memory store: {}", e))
    })?;
    Self::init(conn, None, version)
  }

  /// Open the store at `path`, falling back to an in-memory store when
  /// persistent storage is unavailable. Check [`Store::is_durable`] to warn
  /// the user that queued work will not survive a restart.
  pub fn open_or_degrade(path: &Path, version: u32) -> StoreResult<Self> {
    match Self::open(path, version) {
      Ok(store) => Ok(store),
      Err(StoreError::StorageUnavailable(reason)) => {
        tracing::warn!(%reason, "Persistent storage unavailable, continuing in memory");
        Self::open_in_memory(version)
      }
      Err(e) => Err(e),
    }
  }

  fn init(mut conn: Connection, path: Option<PathBuf>, version: u32) -> StoreResult<Self> {
    if version == 0 {
      return Err(StoreError::StorageUnavailable(
        "schema version must be at least 1".to_string(),
      ));
    }

    conn
      .busy_timeout(Duration::from_secs(5))
      .map_err(|e| StoreError::StorageUnavailable(e.to_string()))?;

    let catalog = schema::migrate(&mut conn, version).map_err(|e| match e {
      StoreError::StorageUnavailable(_) => e,
      other => StoreError::StorageUnavailable(format!("schema upgrade failed: {}", other)),
    })?;

    Ok(Self {
      conn: Mutex::new(conn),
      catalog,
      path,
      version,
    })
  }

  /// Whether records survive a restart.
  pub fn is_durable(&self) -> bool {
    self.path.is_some()
  }

  pub fn path(&self) -> Option<&Path> {
    self.path.as_deref()
  }

  pub fn schema_version(&self) -> u32 {
    self.version
  }

  /// Names of the registered collections.
  pub fn collections(&self) -> Vec<&str> {
    let mut names: Vec<&str> = self.catalog.keys().map(String::as_str).collect();
    names.sort_unstable();
    names
  }

  /// Names of the indexes registered on a collection.
  pub fn indexes(&self, collection: &str) -> StoreResult<Vec<&str>> {
    let info = self.info(collection)?;
    Ok(info.indexes.iter().map(|(name, _)| name.as_str()).collect())
  }

  fn info(&self, collection: &str) -> StoreResult<&CollectionInfo> {
    self
      .catalog
      .get(collection)
      .ok_or_else(|| StoreError::UnknownCollection(collection.to_string()))
  }

  fn lock(&self) -> MutexGuard<'_, Connection> {
    // A panic inside a transaction rolls it back before the guard is
    // released, so the connection is consistent even when poisoned.
    self.conn.lock().unwrap_or_else(|poisoned| {
      tracing::warn!("Store lock was poisoned, recovering connection");
      poisoned.into_inner()
    })
  }

  /// Insert or replace a record. Returns the record's key.
  pub fn put<T: Serialize>(&self, collection: &str, record: &T) -> StoreResult<Key> {
    self.run_in_transaction(&[collection], |tx| tx.put(collection, record))
  }

  pub fn get<T: DeserializeOwned>(
    &self,
    collection: &str,
    key: impl Into<Key>,
  ) -> StoreResult<Option<T>> {
    let conn = self.lock();
    self.reader(&conn).get(collection, key)
  }

  /// All records of a collection in insertion order (key order for
  /// auto-increment collections).
  pub fn get_all<T: DeserializeOwned>(&self, collection: &str) -> StoreResult<Vec<T>> {
    let conn = self.lock();
    self.reader(&conn).get_all(collection)
  }

  /// Delete a record. Returns whether it existed.
  pub fn delete(&self, collection: &str, key: impl Into<Key>) -> StoreResult<bool> {
    let key = key.into();
    self.run_in_transaction(&[collection], |tx| tx.delete(collection, key))
  }

  pub fn count(&self, collection: &str) -> StoreResult<usize> {
    let conn = self.lock();
    self.reader(&conn).count(collection)
  }

  /// Remove every record of a collection.
  pub fn clear(&self, collection: &str) -> StoreResult<usize> {
    self.run_in_transaction(&[collection], |tx| tx.clear(collection))
  }

  /// Records matching an index query, ordered by index value, then by key
  /// for auto-increment collections or by latest write otherwise.
  pub fn query_by_index<T: DeserializeOwned>(
    &self,
    collection: &str,
    index: &str,
    query: IndexQuery,
  ) -> StoreResult<Vec<T>> {
    let conn = self.lock();
    self.reader(&conn).query_by_index(collection, index, query)
  }

  /// Keys matching an index query, in the same order as
  /// [`Store::query_by_index`].
  pub fn keys_by_index(
    &self,
    collection: &str,
    index: &str,
    query: IndexQuery,
  ) -> StoreResult<Vec<Key>> {
    let conn = self.lock();
    self.reader(&conn).keys_by_index(collection, index, query)
  }

  /// Run `f` inside a write transaction over `collections`.
  ///
  /// The transaction commits when `f` returns `Ok` and rolls back when it
  /// returns `Err` or panics. The write lock is taken up front, so other
  /// handles on the same file wait (up to the busy timeout) instead of
  /// reading state that is about to change.
  pub fn run_in_transaction<T, E, F>(&self, collections: &[&str], f: F) -> Result<T, E>
  where
    F: FnOnce(&Transaction<'_>) -> Result<T, E>,
    E: From<StoreError>,
  {
    for collection in collections {
      self.info(collection)?;
    }

    let mut conn = self.lock();
    let tx = conn
      .transaction_with_behavior(TransactionBehavior::Immediate)
      .map_err(StoreError::from)?;
    let scoped = Transaction {
      conn: &tx,
      catalog: &self.catalog,
      scope: Some(collections),
    };
    let result = f(&scoped)?;
    tx.commit().map_err(StoreError::from)?;
    Ok(result)
  }

  fn reader<'a>(&'a self, conn: &'a Connection) -> Transaction<'a> {
    Transaction {
      conn,
      catalog: &self.catalog,
      scope: None,
    }
  }
}

/// Record operations bound to a connection, optionally limited to a set of
/// collections.
pub struct Transaction<'a> {
  conn: &'a Connection,
  catalog: &'a Catalog,
  scope: Option<&'a [&'a str]>,
}

impl Transaction<'_> {
  fn info(&self, collection: &str) -> StoreResult<&CollectionInfo> {
    if let Some(scope) = self.scope {
      if !scope.contains(&collection) {
        return Err(StoreError::CollectionNotInScope(collection.to_string()));
      }
    }
    self
      .catalog
      .get(collection)
      .ok_or_else(|| StoreError::UnknownCollection(collection.to_string()))
  }

  pub fn put<T: Serialize>(&self, collection: &str, record: &T) -> StoreResult<Key> {
    let info = self.info(collection)?;
    let mut value = serde_json::to_value(record)?;
    let object = value
      .as_object_mut()
      .ok_or_else(|| StoreError::MissingKey(collection.to_string()))?;

    let key = match object.get(&info.key_field).and_then(Key::from_json) {
      Some(key) => {
        if info.auto_increment {
          if let Key::Int(id) = key {
            // Explicit ids keep the counter ahead of them.
            self.conn.execute(
              "UPDATE collections SET next_id = MAX(next_id, ?) WHERE name = ?",
              params![id.saturating_add(1), collection],
            )?;
          }
        }
        key
      }
      None if info.auto_increment => {
        let id: i64 = self.conn.query_row(
          "SELECT next_id FROM collections WHERE name = ?",
          params![collection],
          |row| row.get(0),
        )?;
        self.conn.execute(
          "UPDATE collections SET next_id = ? WHERE name = ?",
          params![id + 1, collection],
        )?;
        object.insert(info.key_field.clone(), Value::from(id));
        Key::Int(id)
      }
      None => return Err(StoreError::MissingKey(collection.to_string())),
    };

    self.remove(collection, &key)?;
    self.conn.execute(
      "INSERT INTO records (collection, record_key, data) VALUES (?, ?, ?)",
      params![collection, key, value.to_string()],
    )?;

    for (index, field) in &info.indexes {
      if let Some(index_value) = value.get(field).and_then(Key::from_json) {
        self.conn.execute(
          "INSERT INTO record_index_entries (collection, index_name, value, record_key)
           VALUES (?, ?, ?, ?)",
          params![collection, index, index_value, key],
        )?;
      }
    }

    Ok(key)
  }

  pub fn get<T: DeserializeOwned>(
    &self,
    collection: &str,
    key: impl Into<Key>,
  ) -> StoreResult<Option<T>> {
    self.info(collection)?;
    let key = key.into();
    let data: Option<String> = self
      .conn
      .query_row(
        "SELECT data FROM records WHERE collection = ? AND record_key = ?",
        params![collection, key],
        |row| row.get(0),
      )
      .optional()?;

    match data {
      Some(data) => Ok(Some(serde_json::from_str(&data)?)),
      None => Ok(None),
    }
  }

  pub fn get_all<T: DeserializeOwned>(&self, collection: &str) -> StoreResult<Vec<T>> {
    let info = self.info(collection)?;
    let sql = format!(
      "SELECT r.data FROM records r WHERE r.collection = ? ORDER BY {}",
      tie_break(info)
    );
    let mut stmt = self.conn.prepare(&sql)?;
    let rows = stmt.query_map(params![collection], |row| row.get::<_, String>(0))?;
    decode_rows(collection, rows)
  }

  pub fn delete(&self, collection: &str, key: impl Into<Key>) -> StoreResult<bool> {
    self.info(collection)?;
    self.remove(collection, &key.into())
  }

  pub fn count(&self, collection: &str) -> StoreResult<usize> {
    self.info(collection)?;
    let count: i64 = self.conn.query_row(
      "SELECT COUNT(*) FROM records WHERE collection = ?",
      params![collection],
      |row| row.get(0),
    )?;
    Ok(count as usize)
  }

  pub fn clear(&self, collection: &str) -> StoreResult<usize> {
    self.info(collection)?;
    self.conn.execute(
      "DELETE FROM record_index_entries WHERE collection = ?",
      params![collection],
    )?;
    let removed = self
      .conn
      .execute("DELETE FROM records WHERE collection = ?", params![collection])?;
    Ok(removed)
  }

  pub fn query_by_index<T: DeserializeOwned>(
    &self,
    collection: &str,
    index: &str,
    query: IndexQuery,
  ) -> StoreResult<Vec<T>> {
    let mut stmt = self.index_statement("r.data", collection, index, &query)?;
    let values = index_params(collection, index, query);
    let rows = stmt.query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(0))?;
    decode_rows(collection, rows)
  }

  pub fn keys_by_index(
    &self,
    collection: &str,
    index: &str,
    query: IndexQuery,
  ) -> StoreResult<Vec<Key>> {
    let mut stmt = self.index_statement("r.record_key", collection, index, &query)?;
    let values = index_params(collection, index, query);
    let rows = stmt.query_map(params_from_iter(values.iter()), |row| row.get::<_, Key>(0))?;
    Ok(rows.collect::<Result<_, _>>()?)
  }

  fn index_statement(
    &self,
    column: &str,
    collection: &str,
    index: &str,
    query: &IndexQuery,
  ) -> StoreResult<rusqlite::Statement<'_>> {
    let info = self.info(collection)?;
    if info.index_field(index).is_none() {
      return Err(StoreError::UnknownIndex {
        collection: collection.to_string(),
        index: index.to_string(),
      });
    }

    let (condition, _) = query.to_sql();
    let sql = format!(
      "SELECT {} FROM record_index_entries e
       INNER JOIN records r ON r.collection = e.collection AND r.record_key = e.record_key
       WHERE e.collection = ? AND e.index_name = ?{}
       ORDER BY e.value, {}",
      column,
      condition,
      tie_break(info)
    );
    Ok(self.conn.prepare(&sql)?)
  }

  fn remove(&self, collection: &str, key: &Key) -> StoreResult<bool> {
    self.conn.execute(
      "DELETE FROM record_index_entries WHERE collection = ? AND record_key = ?",
      params![collection, key],
    )?;
    let removed = self.conn.execute(
      "DELETE FROM records WHERE collection = ? AND record_key = ?",
      params![collection, key],
    )?;
    Ok(removed > 0)
  }
}

/// Auto-assigned ids are stable across upserts, so they keep creation order
/// when a record is rewritten. Other collections order by latest write.
fn tie_break(info: &CollectionInfo) -> &'static str {
  if info.auto_increment {
    "r.record_key"
  } else {
    "r.seq"
  }
}

fn index_params(collection: &str, index: &str, query: IndexQuery) -> Vec<rusqlite::types::Value> {
  let (_, bounds) = query.to_sql();
  let mut values = vec![
    rusqlite::types::Value::Text(collection.to_string()),
    rusqlite::types::Value::Text(index.to_string()),
  ];
  values.extend(bounds);
  values
}

/// Decode JSON rows, skipping records that no longer match the expected
/// shape.
fn decode_rows<T, I>(collection: &str, rows: I) -> StoreResult<Vec<T>>
where
  T: DeserializeOwned,
  I: Iterator<Item = rusqlite::Result<String>>,
{
  let mut records = Vec::new();
  for row in rows {
    let data = row?;
    match serde_json::from_str(&data) {
      Ok(record) => records.push(record),
      Err(e) => tracing::warn!(collection, error = %e, "Skipping undecodable record"),
    }
  }
  Ok(records)
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use serde::Deserialize;
  use serde_json::json;

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  #[serde(rename_all = "camelCase")]
  struct Item {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<i64>,
    status: String,
    created_at: i64,
  }

  fn item(status: &str, created_at: i64) -> Item {
    Item {
      id: None,
      status: status.to_string(),
      created_at,
    }
  }

  fn memory_store() -> Store {
    Store::open_in_memory(SCHEMA_VERSION).unwrap()
  }

  #[test]
  fn test_open_creates_all_collections() {
    let store = memory_store();
    assert_eq!(
      store.collections(),
      vec![
        ACTION_QUEUE,
        CACHE_ENTRIES,
        CACHE_METADATA,
        KNOWLEDGE_ENTRIES,
        PREFERENCES
      ]
    );
    assert_eq!(store.indexes(CACHE_ENTRIES).unwrap(), vec!["namespace"]);
    assert!(!store.is_durable());
  }

  #[test]
  fn test_auto_increment_keys_are_written_back() {
    let store = memory_store();
    let first = store.put(ACTION_QUEUE, &item("pending", 10)).unwrap();
    let second = store.put(ACTION_QUEUE, &item("pending", 20)).unwrap();

    assert_eq!(first, Key::Int(1));
    assert_eq!(second, Key::Int(2));

    let stored: Item = store.get(ACTION_QUEUE, 2).unwrap().unwrap();
    assert_eq!(stored.id, Some(2));
    assert_eq!(stored.created_at, 20);
  }

  #[test]
  fn test_put_is_upsert() {
    let store = memory_store();
    store.put(ACTION_QUEUE, &item("pending", 10)).unwrap();

    let mut updated: Item = store.get(ACTION_QUEUE, 1).unwrap().unwrap();
    updated.status = "failed".to_string();
    store.put(ACTION_QUEUE, &updated).unwrap();

    assert_eq!(store.count(ACTION_QUEUE).unwrap(), 1);
    let failed: Vec<Item> = store
      .query_by_index(ACTION_QUEUE, "status", IndexQuery::eq("failed"))
      .unwrap();
    assert_eq!(failed, vec![updated]);
    let pending: Vec<Item> = store
      .query_by_index(ACTION_QUEUE, "status", IndexQuery::eq("pending"))
      .unwrap();
    assert!(pending.is_empty());
  }

  #[test]
  fn test_explicit_key_required_for_field_collections() {
    let store = memory_store();
    let err = store
      .put(PREFERENCES, &json!({"value": "no name"}))
      .unwrap_err();
    assert!(matches!(err, StoreError::MissingKey(_)));
  }

  #[test]
  fn test_query_by_index_orders_by_value_then_insertion() {
    let store = memory_store();
    store.put(ACTION_QUEUE, &item("pending", 30)).unwrap();
    store.put(ACTION_QUEUE, &item("pending", 10)).unwrap();
    store.put(ACTION_QUEUE, &item("pending", 10)).unwrap();
    store.put(ACTION_QUEUE, &item("pending", 20)).unwrap();

    let ordered: Vec<Item> = store
      .query_by_index(ACTION_QUEUE, "createdAt", IndexQuery::All)
      .unwrap();
    let ids: Vec<i64> = ordered.iter().filter_map(|i| i.id).collect();
    assert_eq!(ids, vec![2, 3, 4, 1]);

    let ranged: Vec<Item> = store
      .query_by_index(ACTION_QUEUE, "createdAt", IndexQuery::between(15, 30))
      .unwrap();
    let ids: Vec<i64> = ranged.iter().filter_map(|i| i.id).collect();
    assert_eq!(ids, vec![4, 1]);
  }

  #[test]
  fn test_rewrite_keeps_creation_order_for_auto_keys() {
    let store = memory_store();
    store.put(ACTION_QUEUE, &item("pending", 10)).unwrap();
    store.put(ACTION_QUEUE, &item("pending", 10)).unwrap();

    let mut first: Item = store.get(ACTION_QUEUE, 1).unwrap().unwrap();
    first.status = "failed".to_string();
    store.put(ACTION_QUEUE, &first).unwrap();
    first.status = "pending".to_string();
    store.put(ACTION_QUEUE, &first).unwrap();

    let ordered: Vec<Item> = store
      .query_by_index(ACTION_QUEUE, "createdAt", IndexQuery::All)
      .unwrap();
    let ids: Vec<i64> = ordered.iter().filter_map(|i| i.id).collect();
    assert_eq!(ids, vec![1, 2]);
    let all: Vec<Item> = store.get_all(ACTION_QUEUE).unwrap();
    assert_eq!(all.iter().filter_map(|i| i.id).collect::<Vec<_>>(), vec![1, 2]);
  }

  #[test]
  fn test_unknown_collection_and_index() {
    let store = memory_store();
    assert!(matches!(
      store.count("nope"),
      Err(StoreError::UnknownCollection(_))
    ));
    assert!(matches!(
      store.query_by_index::<Item>(ACTION_QUEUE, "nope", IndexQuery::All),
      Err(StoreError::UnknownIndex { .. })
    ));
  }

  #[test]
  fn test_delete_and_clear() {
    let store = memory_store();
    store.put(ACTION_QUEUE, &item("pending", 1)).unwrap();
    store.put(ACTION_QUEUE, &item("pending", 2)).unwrap();

    assert!(store.delete(ACTION_QUEUE, 1).unwrap());
    assert!(!store.delete(ACTION_QUEUE, 1).unwrap());
    assert_eq!(store.count(ACTION_QUEUE).unwrap(), 1);

    assert_eq!(store.clear(ACTION_QUEUE).unwrap(), 1);
    let remaining: Vec<Item> = store
      .query_by_index(ACTION_QUEUE, "status", IndexQuery::All)
      .unwrap();
    assert!(remaining.is_empty());
  }

  #[test]
  fn test_transaction_rolls_back_on_error() {
    let store = memory_store();
    let result: Result<(), StoreError> =
      store.run_in_transaction(&[ACTION_QUEUE, PREFERENCES], |tx| {
        tx.put(ACTION_QUEUE, &item("pending", 1))?;
        tx.put(PREFERENCES, &json!({"name": "sync.lastRun", "value": 1}))?;
        Err(StoreError::MissingKey("forced".to_string()))
      });

    assert!(result.is_err());
    assert_eq!(store.count(ACTION_QUEUE).unwrap(), 0);
    assert_eq!(store.count(PREFERENCES).unwrap(), 0);
  }

  #[test]
  fn test_transaction_rolls_back_on_panic() {
    let store = memory_store();
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
      let _: Result<(), StoreError> = store.run_in_transaction(&[ACTION_QUEUE], |tx| {
        tx.put(ACTION_QUEUE, &item("pending", 1))?;
        panic!("boom");
      });
    }));

    assert!(outcome.is_err());
    assert_eq!(store.count(ACTION_QUEUE).unwrap(), 0);
    store.put(ACTION_QUEUE, &item("pending", 2)).unwrap();
    assert_eq!(store.count(ACTION_QUEUE).unwrap(), 1);
  }

  #[test]
  fn test_transaction_scope_is_enforced() {
    let store = memory_store();
    let result = store.run_in_transaction(&[ACTION_QUEUE], |tx| {
      tx.put(PREFERENCES, &json!({"name": "x", "value": 1}))
    });
    assert!(matches!(result, Err(StoreError::CollectionNotInScope(_))));
  }

  #[test]
  fn test_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("store.db");

    {
      let store = Store::open(&path, SCHEMA_VERSION).unwrap();
      assert!(store.is_durable());
      store.put(ACTION_QUEUE, &item("pending", 5)).unwrap();
    }

    let store = Store::open(&path, SCHEMA_VERSION).unwrap();
    let items: Vec<Item> = store.get_all(ACTION_QUEUE).unwrap();
    assert_eq!(items.len(), 1);
    // Counter continues after reopen.
    assert_eq!(store.put(ACTION_QUEUE, &item("pending", 6)).unwrap(), Key::Int(2));
  }

  #[test]
  fn test_upgrade_adds_index_without_touching_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");

    {
      let store = Store::open(&path, 1).unwrap();
      assert!(store.indexes(CACHE_ENTRIES).unwrap().is_empty());
      store
        .put(
          CACHE_ENTRIES,
          &json!({"key": "a", "namespace": "static", "body": "x"}),
        )
        .unwrap();
    }

    let store = Store::open(&path, 2).unwrap();
    assert_eq!(store.schema_version(), 2);
    let by_namespace: Vec<Value> = store
      .query_by_index(CACHE_ENTRIES, "namespace", IndexQuery::eq("static"))
      .unwrap();
    assert_eq!(by_namespace.len(), 1);
    assert_eq!(by_namespace[0]["body"], "x");
  }

  #[test]
  fn test_newer_on_disk_version_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");
    drop(Store::open(&path, 2).unwrap());

    assert!(matches!(
      Store::open(&path, 1),
      Err(StoreError::StorageUnavailable(_))
    ));

    let degraded = Store::open_or_degrade(&path, 1).unwrap();
    assert!(!degraded.is_durable());
  }

  #[test]
  fn test_open_or_degrade_on_unwritable_path() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("file");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let store = Store::open_or_degrade(&blocker.join("store.db"), SCHEMA_VERSION).unwrap();
    assert!(!store.is_durable());
    store.put(ACTION_QUEUE, &item("pending", 1)).unwrap();
    assert_eq!(store.count(ACTION_QUEUE).unwrap(), 1);
  }
}
