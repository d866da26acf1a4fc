use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the intercepted application is served from
  pub origin: String,
  /// Generation tag of the caches this deploy should serve from (e.g. "v3")
  pub generation: String,
  /// Prefix for physical cache names, "{prefix}-{kind}-{generation}"
  #[serde(default = "default_cache_prefix")]
  pub cache_prefix: String,
  /// Critical-path assets that must be cached before a generation can activate
  #[serde(default)]
  pub precache: Vec<String>,
  /// Page served to navigations that cannot be answered otherwise
  pub offline_page: Option<String>,
  #[serde(default)]
  pub routes: RoutesConfig,
  #[serde(default)]
  pub limits: LimitsConfig,
  #[serde(default)]
  pub install: InstallConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  /// Maximum number of concurrent background refreshes
  #[serde(default = "default_refresh_pool_size")]
  pub refresh_pool_size: usize,
  /// Database path (default: $XDG_DATA_HOME/offgrid/offgrid.db)
  pub database: Option<PathBuf>,
  /// Also write logs to this file
  pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutesConfig {
  /// Path prefixes holding fingerprinted build output
  #[serde(default = "default_static_prefixes")]
  pub static_prefixes: Vec<String>,
  /// Path prefixes of content API calls
  #[serde(default = "default_api_prefixes")]
  pub api_prefixes: Vec<String>,
  /// Hosts of the content backend (matched case-insensitively)
  #[serde(default, deserialize_with = "deserialize_lowercase_vec")]
  pub api_hosts: Vec<String>,
}

impl Default for RoutesConfig {
  fn default() -> Self {
    Self {
      static_prefixes: default_static_prefixes(),
      api_prefixes: default_api_prefixes(),
      api_hosts: Vec::new(),
    }
  }
}

fn deserialize_lowercase_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| s.to_lowercase()).collect())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
  /// Responses larger than this are served but never stored
  pub max_body_bytes: usize,
  pub network_timeout_secs: u64,
  /// A cache read slower than this is treated as a miss
  pub cache_read_timeout_ms: u64,
  /// Age after which dynamic entries are swept
  pub dynamic_max_age_secs: u64,
  pub sweep_interval_secs: u64,
}

impl Default for LimitsConfig {
  fn default() -> Self {
    Self {
      max_body_bytes: 5 * 1024 * 1024,
      network_timeout_secs: 10,
      cache_read_timeout_ms: 250,
      dynamic_max_age_secs: 24 * 60 * 60,
      sweep_interval_secs: 60 * 60,
    }
  }
}

impl LimitsConfig {
  pub fn network_timeout(&self) -> Duration {
    Duration::from_secs(self.network_timeout_secs)
  }

  pub fn cache_read_timeout(&self) -> Duration {
    Duration::from_millis(self.cache_read_timeout_ms)
  }

  pub fn dynamic_max_age(&self) -> Duration {
    Duration::from_secs(self.dynamic_max_age_secs)
  }

  pub fn sweep_interval(&self) -> Duration {
    Duration::from_secs(self.sweep_interval_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
  pub max_attempts: u32,
  pub backoff_base_ms: u64,
  pub backoff_max_secs: u64,
}

impl Default for InstallConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      backoff_base_ms: 500,
      backoff_max_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Deliveries attempted before a mutation is given up as rejected
  pub max_attempts: u32,
  pub backoff_base_ms: u64,
  pub backoff_max_secs: u64,
  /// How often the origin is probed for connectivity
  pub probe_interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_attempts: 8,
      backoff_base_ms: 1000,
      backoff_max_secs: 300,
      probe_interval_secs: 15,
    }
  }
}

fn default_cache_prefix() -> String {
  "offgrid".to_string()
}

fn default_refresh_pool_size() -> usize {
  8
}

fn default_static_prefixes() -> Vec<String> {
  vec!["/_next/static/".to_string(), "/static/".to_string()]
}

fn default_api_prefixes() -> Vec<String> {
  vec!["/api/".to_string()]
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offgrid.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offgrid/config.yaml
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
        "No configuration file found. Create one at ~/.config/offgrid/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offgrid.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offgrid").join("config.yaml");
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
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    let origin = self.origin_url()?;
    if !matches!(origin.scheme(), "http" | "https") {
      return Err(eyre!("origin must be an http(s) URL, got {}", self.origin));
    }
    if self.generation.trim().is_empty() {
      return Err(eyre!("generation must not be empty"));
    }
    if self.generation.contains('-') || self.cache_prefix.contains('-') {
      return Err(eyre!("generation and cache_prefix must not contain '-'"));
    }
    if self.install.max_attempts == 0 {
      return Err(eyre!("install.max_attempts must be at least 1"));
    }
    if self.limits.network_timeout_secs == 0 {
      return Err(eyre!("limits.network_timeout_secs must be at least 1"));
    }
    if self.limits.cache_read_timeout_ms == 0 {
      return Err(eyre!("limits.cache_read_timeout_ms must be at least 1"));
    }
    if self.limits.sweep_interval_secs == 0 {
      return Err(eyre!("limits.sweep_interval_secs must be at least 1"));
    }
    if self.refresh_pool_size == 0 {
      return Err(eyre!("refresh_pool_size must be at least 1"));
    }
    for path in self.precache.iter().chain(self.offline_page.iter()) {
      origin
        .join(path)
        .map_err(|e| eyre!("Invalid asset path '{}': {}", path, e))?;
    }
    Ok(())
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Database path, falling back to the platform data directory.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offgrid").join("offgrid.db"))
  }
}
