//! Core traits and types for the caching system.

use chrono::{DateTime, Duration, Utc};
use color_eyre::Report;

/// Trait for values that identify a cached read.
///
/// Callers are responsible for embedding every parameter the read depends on
/// (entity id, filters) into the key.
pub trait QueryKey {
  /// Storage key for this read (e.g. `company_details_42`)
  fn cache_key(&self) -> String;

  /// Human readable description for logs
  fn description(&self) -> String {
    self.cache_key()
  }
}

impl QueryKey for str {
  fn cache_key(&self) -> String {
    self.to_string()
  }
}

impl QueryKey for String {
  fn cache_key(&self) -> String {
    self.clone()
  }
}

/// Per-read caching options.
#[derive(Debug, Clone, Copy)]
pub struct QueryOptions {
  /// Skip the cache lookup and always call the fetcher
  pub force_refresh: bool,
  /// How long a stored value stays fresh
  pub cache_ttl: Duration,
  /// Whether stale data may be served when the live fetch fails
  pub critical_data: bool,
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self {
      force_refresh: false,
      cache_ttl: Duration::minutes(5),
      critical_data: false,
    }
  }
}

impl QueryOptions {
  pub fn new(cache_ttl: Duration) -> Self {
    Self {
      cache_ttl,
      ..Self::default()
    }
  }

  pub fn critical(mut self, critical_data: bool) -> Self {
    self.critical_data = critical_data;
    self
  }

  pub fn force_refresh(mut self, force_refresh: bool) -> Self {
    self.force_refresh = force_refresh;
    self
  }
}

/// When a stale entry may stand in for a failed fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalePolicy {
  /// Only reads marked `critical_data` fall back to stale entries
  #[default]
  CriticalOnly,
  /// Any read with a previous entry falls back
  Always,
  /// Fetch failures always propagate
  Never,
}

impl StalePolicy {
  pub fn allows(self, options: &QueryOptions) -> bool {
    match self {
      Self::CriticalOnly => options.critical_data,
      Self::Always => true,
      Self::Never => false,
    }
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
  /// The fetch error that caused stale data to be served
  pub error: Option<Report>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
      error: None,
    }
  }

  /// Create a new cache result from a fresh cache hit.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at: Some(cached_at),
      error: None,
    }
  }

  /// Create a result that serves a previous entry after the fetch failed.
  pub fn stale(data: T, cached_at: DateTime<Utc>, online: bool, error: Report) -> Self {
    Self {
      data,
      source: if online {
        CacheSource::CacheStale
      } else {
        CacheSource::Offline
      },
      cached_at: Some(cached_at),
      error: Some(error),
    }
  }

  /// True for every source except a live fetch.
  pub fn is_from_cache(&self) -> bool {
    self.source != CacheSource::Network
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache after a failed fetch while the network looked reachable
  CacheStale,
  /// Offline mode - network unavailable, serving cached data
  Offline,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::Network => "network",
      Self::CacheFresh => "cache",
      Self::CacheStale => "stale cache",
      Self::Offline => "offline cache",
    };
    f.write_str(s)
  }
}
