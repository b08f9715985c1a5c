//! Request classification into caching policies.

use crate::config::CacheConfig;

/// Cache namespace. Each namespace is bounded independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
  Static,
  Knowledge,
  Runtime,
}

impl Namespace {
  pub const ALL: [Namespace; 3] = [Namespace::Static, Namespace::Knowledge, Namespace::Runtime];

  pub fn as_str(&self) -> &'static str {
    match self {
      Namespace::Static => "static",
      Namespace::Knowledge => "knowledge",
      Namespace::Runtime => "runtime",
    }
  }
}

/// Policy applied to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Serve from cache when present, fetch only on a miss.
  CacheFirst { namespace: Namespace, capacity: usize },
  /// Always try the network, fall back to the cache on failure.
  NetworkFirst { namespace: Namespace, capacity: usize },
}

impl Strategy {
  pub fn namespace(&self) -> Namespace {
    match self {
      Strategy::CacheFirst { namespace, .. } | Strategy::NetworkFirst { namespace, .. } => {
        *namespace
      }
    }
  }

  pub fn capacity(&self) -> usize {
    match self {
      Strategy::CacheFirst { capacity, .. } | Strategy::NetworkFirst { capacity, .. } => *capacity,
    }
  }
}

/// Matches request paths against static-asset and knowledge patterns.
#[derive(Debug, Clone)]
pub struct RouteTable {
  static_prefixes: Vec<String>,
  static_extensions: Vec<String>,
  knowledge_prefixes: Vec<String>,
  static_capacity: usize,
  knowledge_capacity: usize,
  runtime_capacity: usize,
}

impl RouteTable {
  pub fn new(config: &CacheConfig) -> Self {
    Self {
      static_prefixes: config.static_prefixes.clone(),
      static_extensions: config
        .static_extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_lowercase())
        .collect(),
      knowledge_prefixes: config.knowledge_prefixes.clone(),
      static_capacity: config.static_capacity,
      knowledge_capacity: config.knowledge_capacity,
      runtime_capacity: config.runtime_capacity,
    }
  }

  pub fn capacity(&self, namespace: Namespace) -> usize {
    match namespace {
      Namespace::Static => self.static_capacity,
      Namespace::Knowledge => self.knowledge_capacity,
      Namespace::Runtime => self.runtime_capacity,
    }
  }

  /// Pick the policy for a request path. Static assets win over knowledge
  /// endpoints; anything else is short-retention network-first.
  pub fn classify(&self, path: &str) -> Strategy {
    if self.is_static(path) {
      return Strategy::CacheFirst {
        namespace: Namespace::Static,
        capacity: self.static_capacity,
      };
    }

    if self.knowledge_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
      return Strategy::NetworkFirst {
        namespace: Namespace::Knowledge,
        capacity: self.knowledge_capacity,
      };
    }

    Strategy::NetworkFirst {
      namespace: Namespace::Runtime,
      capacity: self.runtime_capacity,
    }
  }

  fn is_static(&self, path: &str) -> bool {
    if self.static_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
      return true;
    }

    let file_name = path.rsplit('/').next().unwrap_or("");
    match file_name.rsplit_once('.') {
      Some((stem, ext)) if !stem.is_empty() => {
        let ext = ext.to_lowercase();
        self.static_extensions.iter().any(|e| *e == ext)
      }
      _ => false,
    }
  }
}
