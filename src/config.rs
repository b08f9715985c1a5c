use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `server.url`.
pub const SERVER_URL_ENV: &str = "AGRISYNC_SERVER_URL";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub server: ServerConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub knowledge: KnowledgeConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  /// Base URL of the chat server
  pub url: String,
  /// A request with no response within this bound counts as unreachable
  pub request_timeout_secs: u64,
  /// Profile fields sent along with every chat message
  pub user_name: Option<String>,
  pub user_region: Option<String>,
  pub language: Option<String>,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      url: "http://localhost:5000".to_string(),
      request_timeout_secs: 30,
      user_name: None,
      user_region: None,
      language: None,
    }
  }
}

impl ServerConfig {
  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Store file (defaults to $XDG_DATA_HOME/agrisync/agrisync.db)
  pub path: Option<PathBuf>,
}

impl StorageConfig {
  pub fn resolve_path(&self) -> Result<PathBuf> {
    match &self.path {
      Some(path) => Ok(path.clone()),
      None => Ok(data_dir()?.join("agrisync.db")),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Attempts before an action is marked failed
  pub max_retries: u32,
  /// Periodic sweep interval
  pub interval_secs: u64,
  /// Pause between consecutive sends within a sweep
  pub send_delay_ms: u64,
  /// How long a sweep's claim on the queue outlives its last heartbeat.
  /// Other processes sharing the store wait this long after a crash.
  pub lease_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      interval_secs: 60,
      send_delay_ms: 500,
      lease_secs: 120,
    }
  }
}

impl SyncConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs)
  }

  pub fn send_delay(&self) -> Duration {
    Duration::from_millis(self.send_delay_ms)
  }

  pub fn lease_millis(&self) -> i64 {
    i64::try_from(self.lease_secs.saturating_mul(1_000)).unwrap_or(i64::MAX)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// When false, every request goes straight to the network
  pub enabled: bool,
  /// Bumping this clears namespaces cached under an older version
  pub version: String,
  /// Path prefixes served cache-first
  pub static_prefixes: Vec<String>,
  /// File extensions served cache-first (without the dot)
  pub static_extensions: Vec<String>,
  /// Path prefixes of reference-data endpoints (network-first, long retention)
  pub knowledge_prefixes: Vec<String>,
  pub static_capacity: usize,
  pub knowledge_capacity: usize,
  pub runtime_capacity: usize,
  /// Page served for failed navigations with no cached copy
  pub offline_fallback: String,
  /// Assets fetched up front by `precache`
  pub precache: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      version: "v1".to_string(),
      static_prefixes: vec!["/static/".to_string()],
      static_extensions: [
        "css", "js", "png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "woff", "woff2",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
      knowledge_prefixes: vec!["/api/v1/".to_string()],
      static_capacity: 200,
      knowledge_capacity: 100,
      runtime_capacity: 50,
      offline_fallback: "/offline.html".to_string(),
      precache: vec!["/".to_string(), "/offline.html".to_string()],
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
  /// Categories refreshed by `initialize_cache` / `refresh_cache`
  pub categories: Vec<String>,
  /// Endpoint path; `{category}` is replaced by the category name
  pub endpoint: String,
  /// Pause between category fetches during a full refresh
  pub refresh_delay_ms: u64,
  /// Bumping this forces a full refresh
  pub cache_version: String,
}

impl Default for KnowledgeConfig {
  fn default() -> Self {
    Self {
      categories: crate::knowledge::DEFAULT_CATEGORIES
        .iter()
        .map(|s| s.to_string())
        .collect(),
      endpoint: "/api/v1/knowledge/{category}".to_string(),
      refresh_delay_ms: 100,
      cache_version: "1".to_string(),
    }
  }
}

impl KnowledgeConfig {
  pub fn refresh_delay(&self) -> Duration {
    Duration::from_millis(self.refresh_delay_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  /// Path polled to decide whether the server is reachable
  pub health_path: String,
  pub probe_interval_secs: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      health_path: "/chat/health".to_string(),
      probe_interval_secs: 30,
    }
  }
}

impl ConnectivityConfig {
  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs)
  }
}

/// Per-user data directory ($XDG_DATA_HOME/agrisync).
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("agrisync"))
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./agrisync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/agrisync/config.yaml
  ///
  /// With no file found the defaults are used. `AGRISYNC_SERVER_URL`
  /// overrides the server URL either way.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => {
        tracing::debug!("No configuration file found, using defaults");
        Config::default()
      }
    };

    if let Ok(url) = std::env::var(SERVER_URL_ENV) {
      config.server.url = url;
    }

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("agrisync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("agrisync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    url::Url::parse(&self.server.url)
      .map_err(|e| eyre!("Invalid server url '{}': {}", self.server.url, e))?;
    if self.sync.max_retries == 0 {
      return Err(eyre!("sync.max_retries must be at least 1"));
    }
    for (name, value) in [
      ("sync.interval_secs", self.sync.interval_secs),
      ("sync.lease_secs", self.sync.lease_secs),
      ("connectivity.probe_interval_secs", self.connectivity.probe_interval_secs),
    ] {
      if value == 0 {
        return Err(eyre!("{} must be at least 1", name));
      }
    }
    if !self.knowledge.endpoint.contains("{category}") {
      return Err(eyre!("knowledge.endpoint must contain {{category}}"));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = Config::from_yaml(
      r#"
server:
  url: https://agribot.example.org
sync:
  max_retries: 5
cache:
  runtime_capacity: 10
"#,
    )
    .unwrap();

    assert_eq!(config.server.url, "https://agribot.example.org");
    assert_eq!(config.server.request_timeout_secs, 30);
    assert_eq!(config.sync.max_retries, 5);
    assert_eq!(config.sync.interval(), Duration::from_secs(60));
    assert_eq!(config.cache.runtime_capacity, 10);
    assert_eq!(config.cache.knowledge_capacity, 100);
    assert_eq!(config.knowledge.categories.len(), 10);
  }

  #[test]
  fn test_validate_rejects_zero_retries() {
    let config = Config::from_yaml("sync:\n  max_retries: 0\n").unwrap();
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_validate_rejects_zero_intervals() {
    for yaml in [
      "sync:\n  interval_secs: 0\n",
      "sync:\n  lease_secs: 0\n",
      "connectivity:\n  probe_interval_secs: 0\n",
    ] {
      let config = Config::from_yaml(yaml).unwrap();
      assert!(config.validate().is_err(), "accepted {:?}", yaml);
    }
    assert!(Config::default().validate().is_ok());
  }

  #[test]
  fn test_missing_explicit_file_is_an_error() {
    assert!(Config::load(Some(Path::new("/definitely/not/here.yaml"))).is_err());
  }
}
