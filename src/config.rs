use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SERVER: &str = "https://rally1.rallydev.com";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub rally: RallyConfig,
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RallyConfig {
  /// Base server URL (without the `/slm/webservice/...` suffix)
  #[serde(default = "default_server")]
  pub server: String,
  /// Workspace name; resolved from the user's profile when unset
  pub workspace: Option<String>,
  /// Project name; resolved from the user's profile when unset
  pub project: Option<String>,
}

impl Default for RallyConfig {
  fn default() -> Self {
    Self {
      server: default_server(),
      workspace: None,
      project: None,
    }
  }
}

fn default_server() -> String {
  DEFAULT_SERVER.to_string()
}

/// Network tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  /// Maximum number of HTTP requests in flight at once
  pub max_concurrent_requests: usize,
  /// Per-request timeout
  pub request_timeout_secs: u64,
  /// Page size for list queries
  pub page_size: usize,
  /// Upper bound on records fetched per ticket type
  pub max_results: usize,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      max_concurrent_requests: 5,
      request_timeout_secs: 30,
      page_size: 200,
      max_results: 1000,
    }
  }
}

impl ApiConfig {
  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }
}

/// Local ticket cache settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub enabled: bool,
  /// Minutes before a snapshot is considered stale
  pub ttl_minutes: i64,
  /// Suggest a background refresh when serving a stale snapshot
  pub auto_refresh: bool,
  /// Cache directory (default: $XDG_CACHE_HOME/r9s)
  pub dir: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      ttl_minutes: 15,
      auto_refresh: true,
      dir: None,
    }
  }
}

impl CacheConfig {
  /// Directory holding the cache files.
  pub fn resolve_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.dir {
      return Ok(dir.clone());
    }
    let cache_dir = dirs::cache_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".cache")))
      .ok_or_else(|| eyre!("Could not determine cache directory"))?;

    Ok(cache_dir.join("r9s"))
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./r9s.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/r9s/config.yaml
  ///
  /// Without any file the defaults are used; workspace and project are then
  /// resolved from the user's Rally profile.
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
    // Check current directory
    let local = PathBuf::from("r9s.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("r9s").join("config.yaml");
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
    if config.api.max_concurrent_requests == 0 {
      return Err(eyre!("api.max_concurrent_requests must be at least 1"));
    }
    Ok(config)
  }

  /// Get the Rally API key from environment variables.
  ///
  /// Checks R9S_RALLY_APIKEY first, then RALLY_APIKEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("R9S_RALLY_APIKEY")
      .or_else(|_| std::env::var("RALLY_APIKEY"))
      .map_err(|_| {
        eyre!("Rally API key not found. Set R9S_RALLY_APIKEY or RALLY_APIKEY environment variable.")
      })
  }
}
