//! Error taxonomy for the sync engine.
//!
//! Storage and network failures are typed so callers can decide whether a
//! fallback exists (serve stale cache, keep an action queued) or whether the
//! failure has to be surfaced.

use thiserror::Error;

/// Errors raised by the durable local store.
#[derive(Debug, Error)]
pub enum StoreError {
  /// The store could not be opened or persisted. Callers should continue
  /// without durability instead of failing.
  #[error("storage unavailable: {0}")]
  StorageUnavailable(String),

  #[error("unknown collection: {0}")]
  UnknownCollection(String),

  #[error("unknown index '{index}' on collection {collection}")]
  UnknownIndex { collection: String, index: String },

  #[error("collection {0} is not part of the current transaction")]
  CollectionNotInScope(String),

  #[error("record in {0} has no usable key")]
  MissingKey(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("SQLite error: {0}")]
  Sqlite(#[from] rusqlite::Error),
}

/// Outcome of a failed request at the network boundary.
///
/// Both variants count identically towards an action's retry budget: the
/// engine cannot tell a transient server error from a permanent one.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NetworkError {
  /// No response: connection refused, DNS failure, timeout.
  #[error("network unreachable: {0}")]
  NetworkUnreachable(String),

  /// The server answered with a non-success status.
  #[error("server rejected request ({status}): {message}")]
  ServerRejected { status: u16, message: String },
}

impl NetworkError {
  pub fn unreachable(message: impl Into<String>) -> Self {
    Self::NetworkUnreachable(message.into())
  }

  pub fn rejected(status: u16, message: impl Into<String>) -> Self {
    Self::ServerRejected {
      status,
      message: message.into(),
    }
  }
}

impl From<reqwest::Error> for NetworkError {
  fn from(err: reqwest::Error) -> Self {
    match err.status() {
      Some(status) => Self::rejected(status.as_u16(), err.to_string()),
      None => Self::unreachable(err.to_string()),
    }
  }
}

/// Crate-level error.
#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Network(#[from] NetworkError),

  /// Terminal per-action failure, surfaced to the user as a failed item.
  #[error("action {id} failed after {attempts} attempts")]
  MaxRetriesExceeded { id: i64, attempts: u32 },

  #[error("invalid attachment: {0}")]
  InvalidAttachment(String),

  #[error("unknown knowledge category: {0}")]
  UnknownCategory(String),

  #[error("invalid url '{url}': {message}")]
  InvalidUrl { url: String, message: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
