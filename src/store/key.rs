//! Record keys and index queries.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Value, ValueRef};
use serde_json::Value as Json;
use std::fmt;

/// A primary key or secondary index value.
///
/// Only integers and strings are valid keys. Integers sort before strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
  Int(i64),
  Text(String),
}

impl Key {
  /// Extract a key from a JSON value, if it is of a keyable type.
  pub fn from_json(value: &Json) -> Option<Self> {
    match value {
      Json::Number(n) => n.as_i64().map(Key::Int),
      Json::String(s) => Some(Key::Text(s.clone())),
      _ => None,
    }
  }

  pub fn as_int(&self) -> Option<i64> {
    match self {
      Key::Int(i) => Some(*i),
      Key::Text(_) => None,
    }
  }

  pub(crate) fn to_sql_value(&self) -> Value {
    match self {
      Key::Int(i) => Value::Integer(*i),
      Key::Text(s) => Value::Text(s.clone()),
    }
  }
}

impl fmt::Display for Key {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Key::Int(i) => write!(f, "{}", i),
      Key::Text(s) => f.write_str(s),
    }
  }
}

impl From<i64> for Key {
  fn from(value: i64) -> Self {
    Key::Int(value)
  }
}

impl From<&str> for Key {
  fn from(value: &str) -> Self {
    Key::Text(value.to_string())
  }
}

impl From<String> for Key {
  fn from(value: String) -> Self {
    Key::Text(value)
  }
}

impl From<&String> for Key {
  fn from(value: &String) -> Self {
    Key::Text(value.clone())
  }
}

impl ToSql for Key {
  fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
    Ok(match self {
      Key::Int(i) => ToSqlOutput::from(*i),
      Key::Text(s) => ToSqlOutput::from(s.as_str()),
    })
  }
}

impl FromSql for Key {
  fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
    match value {
      ValueRef::Integer(i) => Ok(Key::Int(i)),
      ValueRef::Text(t) => std::str::from_utf8(t)
        .map(|s| Key::Text(s.to_string()))
        .map_err(|e| FromSqlError::Other(Box::new(e))),
      _ => Err(FromSqlError::InvalidType),
    }
  }
}

/// Selection over a secondary index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexQuery {
  /// Every record that has a value for the index.
  All,
  /// Records whose index value equals the key.
  Eq(Key),
  /// Records whose index value lies within the inclusive bounds.
  Range {
    lower: Option<Key>,
    upper: Option<Key>,
  },
}

impl IndexQuery {
  pub fn eq(key: impl Into<Key>) -> Self {
    IndexQuery::Eq(key.into())
  }

  pub fn at_most(upper: impl Into<Key>) -> Self {
    IndexQuery::Range {
      lower: None,
      upper: Some(upper.into()),
    }
  }

  pub fn at_least(lower: impl Into<Key>) -> Self {
    IndexQuery::Range {
      lower: Some(lower.into()),
      upper: None,
    }
  }

  pub fn between(lower: impl Into<Key>, upper: impl Into<Key>) -> Self {
    IndexQuery::Range {
      lower: Some(lower.into()),
      upper: Some(upper.into()),
    }
  }

  /// SQL condition on `e.value` and its parameters.
  pub(crate) fn to_sql(&self) -> (String, Vec<Value>) {
    match self {
      IndexQuery::All => (String::new(), Vec::new()),
      IndexQuery::Eq(key) => (" AND e.value = ?".to_string(), vec![key.to_sql_value()]),
      IndexQuery::Range { lower, upper } => {
        let mut clause = String::new();
        let mut values = Vec::new();
        if let Some(lower) = lower {
          clause.push_str(" AND e.value >= ?");
          values.push(lower.to_sql_value());
        }
        if let Some(upper) = upper {
          clause.push_str(" AND e.value <= ?");
          values.push(upper.to_sql_value());
        }
        (clause, values)
      }
    }
  }
}
