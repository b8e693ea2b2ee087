use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the household API, e.g. https://household.example.com/api
  pub base_url: String,
  /// Per-call timeout; exceeding it counts as a retryable failure
  #[serde(default = "default_timeout_ms")]
  pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// How long a cached GET response is considered fresh
  #[serde(default = "default_ttl_secs")]
  pub ttl_secs: u64,
  /// Database location (defaults to the platform data directory)
  pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl_secs: default_ttl_secs(),
      path: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  #[serde(default = "default_base_delay_ms")]
  pub base_delay_ms: u64,
  #[serde(default = "default_max_delay_ms")]
  pub max_delay_ms: u64,
  /// Retryable failures beyond this count are treated as terminal
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
  /// Operations older than this are treated as terminal on their next failure
  #[serde(default = "default_max_age_hours")]
  pub max_age_hours: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      base_delay_ms: default_base_delay_ms(),
      max_delay_ms: default_max_delay_ms(),
      max_retries: default_max_retries(),
      max_age_hours: default_max_age_hours(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectivityConfig {
  /// A reachability change must hold this long before an edge is reported
  #[serde(default = "default_debounce_ms")]
  pub debounce_ms: u64,
  #[serde(default = "default_probe_interval_secs")]
  pub probe_interval_secs: u64,
  #[serde(default = "default_probe_endpoint")]
  pub probe_endpoint: String,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      debounce_ms: default_debounce_ms(),
      probe_interval_secs: default_probe_interval_secs(),
      probe_endpoint: default_probe_endpoint(),
    }
  }
}

fn default_timeout_ms() -> u64 {
  10_000
}

fn default_ttl_secs() -> u64 {
  300
}

fn default_base_delay_ms() -> u64 {
  1_000
}

fn default_max_delay_ms() -> u64 {
  300_000
}

fn default_max_retries() -> u32 {
  8
}

fn default_max_age_hours() -> u64 {
  72
}

fn default_debounce_ms() -> u64 {
  750
}

fn default_probe_interval_secs() -> u64 {
  15
}

fn default_probe_endpoint() -> String {
  "/health".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./hearth.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/hearth/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/hearth/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("hearth.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("hearth").join("config.yaml");
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

  /// Parse configuration from a YAML document.
  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    url::Url::parse(&config.api.base_url)
      .map_err(|e| eyre!("Invalid api.base_url '{}': {}", config.api.base_url, e))?;
    Ok(config)
  }

  /// Get the API token from environment variables, if any.
  ///
  /// Checks HEARTH_API_TOKEN first, then HOUSEHOLD_API_TOKEN as fallback.
  pub fn get_api_token() -> Option<String> {
    std::env::var("HEARTH_API_TOKEN")
      .or_else(|_| std::env::var("HOUSEHOLD_API_TOKEN"))
      .ok()
  }

  /// Resolve the database path, falling back to the platform data directory.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.cache.path {
      return Ok(path.clone());
    }
    Ok(Self::data_dir()?.join("hearth.db"))
  }

  /// Directory for the database and log files.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("hearth"))
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_millis(self.api.timeout_ms)
  }

  pub fn cache_ttl(&self) -> Duration {
    Duration::from_secs(self.cache.ttl_secs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::from_yaml("api:\n  base_url: https://household.example.com/api\n").unwrap();

    assert_eq!(config.api.timeout_ms, 10_000);
    assert_eq!(config.cache.ttl_secs, 300);
    assert_eq!(config.sync.max_retries, 8);
    assert_eq!(config.connectivity.probe_endpoint, "/health");
    assert!(config.cache.path.is_none());
  }

  #[test]
  fn test_overrides() {
    let yaml = r#"
api:
  base_url: http://localhost:5000/api
  timeout_ms: 2500
cache:
  ttl_secs: 60
  path: /tmp/hearth-test.db
sync:
  base_delay_ms: 200
  max_retries: 3
"#;
    let config = Config::from_yaml(yaml).unwrap();

    assert_eq!(config.request_timeout(), Duration::from_millis(2500));
    assert_eq!(config.cache_ttl(), Duration::from_secs(60));
    assert_eq!(config.sync.base_delay_ms, 200);
    assert_eq!(config.sync.max_delay_ms, 300_000);
    assert_eq!(config.sync.max_retries, 3);
    assert_eq!(
      config.database_path().unwrap(),
      PathBuf::from("/tmp/hearth-test.db")
    );
  }

  #[test]
  fn test_rejects_invalid_base_url() {
    assert!(Config::from_yaml("api:\n  base_url: not a url\n").is_err());
  }

  #[test]
  fn test_missing_explicit_path() {
    let err = Config::load(Some(Path::new("/nonexistent/hearth.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
