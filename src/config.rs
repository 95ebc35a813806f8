use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::market::ResourceTtls;
use crate::queue::RetryPolicy;

/// Environment variable holding the backend API token.
pub const TOKEN_ENV: &str = "MARKETSYNC_API_TOKEN";

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
  pub backend: BackendConfig,
  pub storage: StorageConfig,
  pub cache: CacheConfig,
  pub queue: QueueConfig,
  pub sync: SyncConfig,
  pub connectivity: ConnectivityConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
  pub url: String,
  /// Upper bound on every remote fetch
  pub timeout_secs: u64,
}

impl Default for BackendConfig {
  fn default() -> Self {
    Self {
      url: "http://localhost:8080/api/".to_string(),
      timeout_secs: 15,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
  /// Database file (defaults to $XDG_DATA_HOME/marketsync/store.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
  pub namespace: String,
  pub listings_ttl_secs: u64,
  pub categories_ttl_secs: u64,
  pub profile_ttl_secs: u64,
  /// How often expired rows are swept; 0 disables the sweep
  pub purge_interval_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      namespace: "market".to_string(),
      listings_ttl_secs: 30 * 60,
      categories_ttl_secs: 24 * 60 * 60,
      profile_ttl_secs: 10 * 60,
      purge_interval_secs: 10 * 60,
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
  pub max_attempts: u32,
  pub base_backoff_ms: u64,
  pub max_backoff_ms: u64,
  pub submit_timeout_secs: u64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      base_backoff_ms: 2_000,
      max_backoff_ms: 300_000,
      submit_timeout_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
  pub interval_secs: u64,
  /// Cache keys dropped after a queued operation is accepted
  pub invalidate_keys: Vec<String>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      interval_secs: 60,
      invalidate_keys: vec!["listings".to_string()],
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectivityConfig {
  /// Probed with HEAD; defaults to the backend url
  pub probe_url: Option<String>,
  pub probe_timeout_secs: u64,
  pub poll_interval_secs: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_url: None,
      probe_timeout_secs: 3,
      poll_interval_secs: 15,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./marketsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/marketsync/config.yaml
  ///
  /// Falls back to defaults when no file exists.
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("marketsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("marketsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    // An empty file deserializes as null
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }

  /// Get the backend API token from the environment, if set.
  pub fn api_token() -> Option<String> {
    std::env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty())
  }

  pub fn storage_path(&self) -> Result<PathBuf> {
    match &self.storage.path {
      Some(path) => Ok(path.clone()),
      None => crate::db::Database::default_path(),
    }
  }

  pub fn probe_url(&self) -> &str {
    self
      .connectivity
      .probe_url
      .as_deref()
      .unwrap_or(&self.backend.url)
  }

  pub fn fetch_timeout(&self) -> Duration {
    Duration::from_secs(self.backend.timeout_secs)
  }

  pub fn resource_ttls(&self) -> ResourceTtls {
    ResourceTtls {
      listings: Duration::from_secs(self.cache.listings_ttl_secs),
      categories: Duration::from_secs(self.cache.categories_ttl_secs),
      profile: Duration::from_secs(self.cache.profile_ttl_secs),
    }
  }

  pub fn purge_interval(&self) -> Option<Duration> {
    match self.cache.purge_interval_secs {
      0 => None,
      secs => Some(Duration::from_secs(secs)),
    }
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_attempts: self.queue.max_attempts.max(1),
      base_delay: Duration::from_millis(self.queue.base_backoff_ms),
      max_delay: Duration::from_millis(self.queue.max_backoff_ms),
    }
  }

  pub fn submit_timeout(&self) -> Duration {
    Duration::from_secs(self.queue.submit_timeout_secs)
  }

  pub fn sync_interval(&self) -> Duration {
    Duration::from_secs(self.sync.interval_secs.max(1))
  }

  pub fn probe_timeout(&self) -> Duration {
    Duration::from_secs(self.connectivity.probe_timeout_secs)
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.connectivity.poll_interval_secs.max(1))
  }
}
