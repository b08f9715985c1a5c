//! Term-count scoring over cached JSON payloads.

use serde_json::Value;

/// A matching piece of text inside a category payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
  pub category: String,
  /// JSON pointer to the matched value (or object key)
  pub pointer: String,
  pub text: String,
  /// Total occurrences of all query terms in `text`
  pub score: usize,
}

/// Lowercased query terms longer than two characters.
pub fn tokenize(query: &str) -> Vec<String> {
  query
    .split_whitespace()
    .map(|t| t.to_lowercase())
    .filter(|t| t.chars().count() > 2)
    .collect()
}

/// Count non-overlapping occurrences of every term in `text`.
pub fn score(text: &str, terms: &[String]) -> usize {
  let haystack = text.to_lowercase();
  terms.iter().map(|term| haystack.matches(term.as_str()).count()).sum()
}

/// Collect every string leaf and object key of `payload` that matches at
/// least one term, in document order.
pub fn scan(category: &str, payload: &Value, terms: &[String]) -> Vec<SearchHit> {
  let mut hits = Vec::new();
  walk(category, payload, String::new(), terms, &mut hits);
  hits
}

fn walk(
  category: &str,
  value: &Value,
  pointer: String,
  terms: &[String],
  hits: &mut Vec<SearchHit>,
) {
  match value {
    Value::String(text) => push_hit(category, &pointer, text, terms, hits),
    Value::Array(items) => {
      for (i, item) in items.iter().enumerate() {
        walk(category, item, format!("{}/{}", pointer, i), terms, hits);
      }
    }
    Value::Object(map) => {
      for (key, item) in map {
        let child = format!("{}/{}", pointer, escape(key));
        push_hit(category, &child, key, terms, hits);
        walk(category, item, child, terms, hits);
      }
    }
    _ => {}
  }
}

fn push_hit(
  category: &str,
  pointer: &str,
  text: &str,
  terms: &[String],
  hits: &mut Vec<SearchHit>,
) {
  let score = score(text, terms);
  if score > 0 {
    hits.push(SearchHit {
      category: category.to_string(),
      pointer: pointer.to_string(),
      text: text.to_string(),
      score,
    });
  }
}

/// RFC 6901 escaping for pointer segments.
fn escape(segment: &str) -> String {
  segment.replace('~', "~0").replace('/', "~1")
}
