//! Collection catalog and on-disk layout.
//!
//! Schema upgrades are additive only: opening at a newer version registers
//! collections and indexes introduced since the on-disk version and
//! back-fills index entries for records that already exist.

use rusqlite::{params, Connection};
use std::collections::HashMap;

use super::key::Key;
use crate::error::StoreError;

/// Latest schema version known to this build.
pub const SCHEMA_VERSION: u32 = 2;

pub const ACTION_QUEUE: &str = "action-queue";
pub const CACHE_ENTRIES: &str = "cache-entries";
pub const KNOWLEDGE_ENTRIES: &str = "knowledge-entries";
pub const PREFERENCES: &str = "preferences";
pub const CACHE_METADATA: &str = "cache-metadata";

/// How a collection derives record keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPath {
  /// Key is read from the named field; records without it are rejected.
  Field(&'static str),
  /// Key is read from the named field, or assigned from a counter and
  /// written back into the record when absent.
  AutoIncrement(&'static str),
}

impl KeyPath {
  pub fn field(&self) -> &'static str {
    match self {
      KeyPath::Field(f) | KeyPath::AutoIncrement(f) => f,
    }
  }

  pub fn is_auto(&self) -> bool {
    matches!(self, KeyPath::AutoIncrement(_))
  }
}

#[derive(Debug, Clone, Copy)]
pub struct IndexSchema {
  pub name: &'static str,
  pub field: &'static str,
  pub since: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct CollectionSchema {
  pub name: &'static str,
  pub key: KeyPath,
  pub indexes: &'static [IndexSchema],
  pub since: u32,
}

/// Every collection the engine knows about, with the version that
/// introduced it.
pub const COLLECTIONS: &[CollectionSchema] = &[
  CollectionSchema {
    name: ACTION_QUEUE,
    key: KeyPath::AutoIncrement("id"),
    indexes: &[
      IndexSchema {
        name: "createdAt",
        field: "createdAt",
        since: 1,
      },
      IndexSchema {
        name: "status",
        field: "status",
        since: 1,
      },
    ],
    since: 1,
  },
  CollectionSchema {
    name: CACHE_ENTRIES,
    key: KeyPath::Field("key"),
    indexes: &[IndexSchema {
      name: "namespace",
      field: "namespace",
      since: 2,
    }],
    since: 1,
  },
  CollectionSchema {
    name: KNOWLEDGE_ENTRIES,
    key: KeyPath::Field("category"),
    indexes: &[IndexSchema {
      name: "lastUpdated",
      field: "lastUpdated",
      since: 1,
    }],
    since: 1,
  },
  CollectionSchema {
    name: PREFERENCES,
    key: KeyPath::Field("name"),
    indexes: &[],
    since: 1,
  },
  CollectionSchema {
    name: CACHE_METADATA,
    key: KeyPath::Field("name"),
    indexes: &[IndexSchema {
      name: "expiresAt",
      field: "expiresAt",
      since: 1,
    }],
    since: 1,
  },
];

/// Base tables. Collections are logical rows in `collections`.
const BASE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS collections (
    name TEXT PRIMARY KEY,
    key_field TEXT NOT NULL,
    auto_increment INTEGER NOT NULL,
    next_id INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS collection_indexes (
    collection TEXT NOT NULL,
    name TEXT NOT NULL,
    field TEXT NOT NULL,
    PRIMARY KEY (collection, name),
    FOREIGN KEY (collection) REFERENCES collections(name)
);

-- seq tracks insertion order; an upsert re-inserts and gets a new seq
CREATE TABLE IF NOT EXISTS records (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL,
    record_key NOT NULL,
    data TEXT NOT NULL,
    UNIQUE (collection, record_key)
);

CREATE TABLE IF NOT EXISTS record_index_entries (
    collection TEXT NOT NULL,
    index_name TEXT NOT NULL,
    value NOT NULL,
    record_key NOT NULL,
    PRIMARY KEY (collection, index_name, record_key)
);

CREATE INDEX IF NOT EXISTS idx_record_index_value
    ON record_index_entries(collection, index_name, value);
"#;

/// Runtime view of a registered collection.
#[derive(Debug, Clone)]
pub struct CollectionInfo {
  pub key_field: String,
  pub auto_increment: bool,
  /// (index name, field)
  pub indexes: Vec<(String, String)>,
}

impl CollectionInfo {
  pub fn index_field(&self, index: &str) -> Option<&str> {
    self
      .indexes
      .iter()
      .find(|(name, _)| name == index)
      .map(|(_, field)| field.as_str())
  }
}

pub type Catalog = HashMap<String, CollectionInfo>;

/// Bring the database up to `target` and return the resulting catalog.
pub fn migrate(conn: &mut Connection, target: u32) -> Result<Catalog, StoreError> {
  let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

  if current > target {
    return Err(StoreError::StorageUnavailable(format!(
      "on-disk schema version {} is newer than requested {}",
      current, target
    )));
  }

  if current < target {
    let tx = conn.transaction()?;
    tx.execute_batch(BASE_SCHEMA)?;
    for version in (current + 1)..=target {
      tracing::info!(version, "Upgrading local store schema");
      apply_version(&tx, version)?;
    }
    tx.pragma_update(None, "user_version", target)?;
    tx.commit()?;
  }

  load_catalog(conn)
}

/// Register everything introduced at exactly `version`.
fn apply_version(conn: &Connection, version: u32) -> Result<(), StoreError> {
  for collection in COLLECTIONS {
    if collection.since == version {
      conn.execute(
        "INSERT OR IGNORE INTO collections (name, key_field, auto_increment, next_id)
         VALUES (?, ?, ?, 1)",
        params![
          collection.name,
          collection.key.field(),
          collection.key.is_auto()
        ],
      )?;
    }

    for index in collection.indexes {
      // An index never predates its collection.
      if index.since.max(collection.since) == version {
        create_index(conn, collection.name, index)?;
      }
    }
  }
  Ok(())
}

fn create_index(
  conn: &Connection,
  collection: &str,
  index: &IndexSchema,
) -> Result<(), StoreError> {
  let inserted = conn.execute(
    "INSERT OR IGNORE INTO collection_indexes (collection, name, field) VALUES (?, ?, ?)",
    params![collection, index.name, index.field],
  )?;
  if inserted == 0 {
    return Ok(());
  }

  // Back-fill entries for records written before the index existed.
  let existing: Vec<(Key, String)> = {
    let mut stmt = conn.prepare("SELECT record_key, data FROM records WHERE collection = ?")?;
    let rows = stmt.query_map(params![collection], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect::<Result<_, _>>()?
  };

  let mut backfilled = 0usize;
  for (key, data) in existing {
    let record: serde_json::Value = serde_json::from_str(&data)?;
    if let Some(value) = record.get(index.field).and_then(Key::from_json) {
      conn.execute(
        "INSERT OR REPLACE INTO record_index_entries (collection, index_name, value, record_key)
         VALUES (?, ?, ?, ?)",
        params![collection, index.name, value, key],
      )?;
      backfilled += 1;
    }
  }

  tracing::debug!(collection, index = index.name, backfilled, "Created index");
  Ok(())
}

fn load_catalog(conn: &Connection) -> Result<Catalog, StoreError> {
  let mut catalog = Catalog::new();

  let mut stmt = conn.prepare("SELECT name, key_field, auto_increment FROM collections")?;
  let rows = stmt.query_map([], |row| {
    Ok((
      row.get::<_, String>(0)?,
      row.get::<_, String>(1)?,
      row.get::<_, bool>(2)?,
    ))
  })?;
  for row in rows {
    let (name, key_field, auto_increment) = row?;
    catalog.insert(
      name,
      CollectionInfo {
        key_field,
        auto_increment,
        indexes: Vec::new(),
      },
    );
  }

  let mut stmt = conn.prepare("SELECT collection, name, field FROM collection_indexes")?;
  let rows = stmt.query_map([], |row| {
    Ok((
      row.get::<_, String>(0)?,
      row.get::<_, String>(1)?,
      row.get::<_, String>(2)?,
    ))
  })?;
  for row in rows {
    let (collection, name, field) = row?;
    if let Some(info) = catalog.get_mut(&collection) {
      info.indexes.push((name, field));
    }
  }

  Ok(catalog)
}
