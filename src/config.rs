use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::StalePolicy;
use crate::network::ProbeFailurePolicy;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub backend: BackendConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub network: NetworkConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendConfig {
  /// Project URL of the hosted backend (e.g. https://project.example.co)
  pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
  /// Per-process map, gone on exit
  Memory,
  /// SQLite file shared between runs
  #[default]
  Sqlite,
  /// Caching disabled
  None,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub storage: StorageKind,
  /// SQLite database path (defaults to the platform data directory)
  pub path: Option<PathBuf>,
  /// TTL for reads that don't pick their own
  pub default_ttl_ms: u64,
  pub stale_fallback: StalePolicy,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      storage: StorageKind::default(),
      path: None,
      default_ttl_ms: 5 * 60 * 1000,
      stale_fallback: StalePolicy::default(),
    }
  }
}

impl CacheConfig {
  pub fn default_ttl(&self) -> Duration {
    Duration::milliseconds(i64::try_from(self.default_ttl_ms).unwrap_or(i64::MAX))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// When false the network is always assumed reachable
  pub probe: bool,
  /// URL to probe (defaults to the backend URL)
  pub probe_url: Option<String>,
  pub probe_timeout_ms: u64,
  pub on_probe_error: ProbeFailurePolicy,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      probe: true,
      probe_url: None,
      probe_timeout_ms: 3000,
      on_probe_error: ProbeFailurePolicy::default(),
    }
  }
}

impl NetworkConfig {
  pub fn probe_timeout(&self) -> std::time::Duration {
    std::time::Duration::from_millis(self.probe_timeout_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Filter used when RUST_LOG is unset
  pub level: String,
  /// Also append logs to this file
  pub file: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "warn".to_string(),
      file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./hrcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/hrcache/config.yaml
  ///
  /// With no explicit path and no file found, defaults are used.
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
    let local = PathBuf::from("hrcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("hrcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// The backend URL, required for any command that talks to the backend.
  pub fn backend_url(&self) -> Result<Url> {
    let raw = self.backend.url.as_deref().ok_or_else(|| {
      eyre!("No backend URL configured. Set backend.url in ~/.config/hrcache/config.yaml")
    })?;

    Url::parse(raw).map_err(|e| eyre!("Invalid backend URL '{}': {}", raw, e))
  }

  /// The URL the network probe targets.
  pub fn probe_url(&self) -> Result<Url> {
    match &self.network.probe_url {
      Some(raw) => Url::parse(raw).map_err(|e| eyre!("Invalid probe URL '{}': {}", raw, e)),
      None => self.backend_url(),
    }
  }

  /// Get the backend API key from environment variables.
  ///
  /// Checks HRCACHE_API_KEY first, then SUPABASE_ANON_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("HRCACHE_API_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .map_err(|_| {
        eyre!("Backend API key not found. Set HRCACHE_API_KEY or SUPABASE_ANON_KEY environment variable.")
      })
  }
}
