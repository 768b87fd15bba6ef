//! Cache storage trait and its in-memory, SQLite and no-op implementations.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

use super::entry::{CacheEntry, KeyPattern};
use crate::config::{CacheConfig, StorageKind};

/// Trait for cache storage backends.
///
/// Each call is synchronous and holds any internal lock only for its own
/// duration, so callers may use it freely between `.await` points.
pub trait CacheStorage: Send + Sync {
  /// Get the entry stored under `key`.
  fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

  /// Store an entry, replacing any previous entry with the same key.
  fn put(&self, entry: CacheEntry) -> Result<()>;

  /// Remove a single entry. Returns whether it existed.
  fn remove(&self, key: &str) -> Result<bool>;

  /// Remove every entry whose key starts with `prefix`. Returns the count removed.
  fn remove_prefix(&self, prefix: &str) -> Result<usize>;

  /// All stored entries, ordered by key.
  fn entries(&self) -> Result<Vec<CacheEntry>>;

  /// Remove everything. Returns the count removed.
  fn clear(&self) -> Result<usize> {
    self.remove_prefix("")
  }
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn get(&self, _key: &str) -> Result<Option<CacheEntry>> {
    Ok(None) // Always miss
  }

  fn put(&self, _entry: CacheEntry) -> Result<()> {
    Ok(()) // Discard
  }

  fn remove(&self, _key: &str) -> Result<bool> {
    Ok(false)
  }

  fn remove_prefix(&self, _prefix: &str) -> Result<usize> {
    Ok(0)
  }

  fn entries(&self) -> Result<Vec<CacheEntry>> {
    Ok(Vec::new())
  }
}

/// Process-local storage. Contents are lost when the process exits.
#[derive(Default)]
pub struct MemoryStorage {
  entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, CacheEntry>>> {
    self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for MemoryStorage {
  fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
    Ok(self.lock()?.get(key).cloned())
  }

  fn put(&self, entry: CacheEntry) -> Result<()> {
    self.lock()?.insert(entry.key.clone(), entry);
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<bool> {
    Ok(self.lock()?.remove(key).is_some())
  }

  fn remove_prefix(&self, prefix: &str) -> Result<usize> {
    let pattern = KeyPattern::Prefix(prefix);
    let mut entries = self.lock()?;
    let before = entries.len();
    entries.retain(|key, _| !pattern.matches(key));
    Ok(before - entries.len())
  }

  fn entries(&self) -> Result<Vec<CacheEntry>> {
    let mut entries: Vec<CacheEntry> = self.lock()?.values().cloned().collect();
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(entries)
  }
}

/// SQLite-based cache storage implementation.
///
/// Lets separate processes (e.g. repeated CLI invocations) share one cache.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Create a new SQLite storage at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  /// Create a new SQLite storage at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Create a storage backed by a private in-memory database.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("hrcache").join("cache.db"))
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    ttl_ms INTEGER NOT NULL,
    critical INTEGER NOT NULL DEFAULT 0
);
"#;

type EntryRow = (String, Vec<u8>, String, i64, bool);

impl CacheStorage for SqliteStorage {
  fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
    let conn = self.lock()?;

    let row: Option<EntryRow> = conn
      .query_row(
        "SELECT key, data, stored_at, ttl_ms, critical FROM cache_entries WHERE key = ?",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry {}: {}", key, e))?;

    row.map(entry_from_row).transpose()
  }

  fn put(&self, entry: CacheEntry) -> Result<()> {
    let conn = self.lock()?;
    let data = serde_json::to_vec(&entry.value)
      .map_err(|e| eyre!("Failed to serialize cache entry: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries (key, data, stored_at, ttl_ms, critical)
         VALUES (?, ?, ?, ?, ?)",
        params![
          entry.key,
          data,
          format_datetime(entry.stored_at),
          entry.ttl.num_milliseconds(),
          entry.critical
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry {}: {}", entry.key, e))?;

    Ok(())
  }

  fn remove(&self, key: &str) -> Result<bool> {
    let removed = self
      .lock()?
      .execute("DELETE FROM cache_entries WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to delete cache entry {}: {}", key, e))?;

    Ok(removed > 0)
  }

  fn remove_prefix(&self, prefix: &str) -> Result<usize> {
    // substr() counts characters, not bytes
    let removed = self
      .lock()?
      .execute(
        "DELETE FROM cache_entries WHERE substr(key, 1, ?) = ?",
        params![prefix.chars().count() as i64, prefix],
      )
      .map_err(|e| eyre!("Failed to delete cache entries {}*: {}", prefix, e))?;

    Ok(removed)
  }

  fn entries(&self) -> Result<Vec<CacheEntry>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT key, data, stored_at, ttl_ms, critical FROM cache_entries ORDER BY key")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<EntryRow> = stmt
      .query_map([], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
      })
      .map_err(|e| eyre!("Failed to query cache entries: {}", e))?
      .filter_map(|r| match r {
        Ok(row) => Some(row),
        Err(e) => {
          warn!(error = %e, "skipping unreadable cache row");
          None
        }
      })
      .collect();

    // A corrupt row hides only itself
    Ok(
      rows
        .into_iter()
        .filter_map(|row| match entry_from_row(row) {
          Ok(entry) => Some(entry),
          Err(e) => {
            warn!(error = %e, "skipping corrupt cache entry");
            None
          }
        })
        .collect(),
    )
  }
}

fn entry_from_row((key, data, stored_at, ttl_ms, critical): EntryRow) -> Result<CacheEntry> {
  let value = serde_json::from_slice(&data)
    .map_err(|e| eyre!("Failed to deserialize cache entry {}: {}", key, e))?;
  let stored_at = parse_datetime(&stored_at)?;

  Ok(CacheEntry::new(key, value, stored_at, Duration::milliseconds(ttl_ms)).with_critical(critical))
}

fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a timestamp written by `format_datetime`.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

/// Storage selected at runtime from configuration.
pub enum ConfiguredStorage {
  Memory(MemoryStorage),
  Sqlite(SqliteStorage),
  Noop(NoopStorage),
}

impl ConfiguredStorage {
  pub fn from_config(config: &CacheConfig) -> Result<Self> {
    Ok(match config.storage {
      StorageKind::Memory => Self::Memory(MemoryStorage::new()),
      StorageKind::Sqlite => match &config.path {
        Some(path) => Self::Sqlite(SqliteStorage::open_at(path)?),
        None => Self::Sqlite(SqliteStorage::open()?),
      },
      StorageKind::None => Self::Noop(NoopStorage),
    })
  }

  fn inner(&self) -> &dyn CacheStorage {
    match self {
      Self::Memory(s) => s,
      Self::Sqlite(s) => s,
      Self::Noop(s) => s,
    }
  }
}

impl CacheStorage for ConfiguredStorage {
  fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
    self.inner().get(key)
  }

  fn put(&self, entry: CacheEntry) -> Result<()> {
    self.inner().put(entry)
  }

  fn remove(&self, key: &str) -> Result<bool> {
    self.inner().remove(key)
  }

  fn remove_prefix(&self, prefix: &str) -> Result<usize> {
    self.inner().remove_prefix(prefix)
  }

  fn entries(&self) -> Result<Vec<CacheEntry>> {
    self.inner().entries()
  }

  fn clear(&self) -> Result<usize> {
    self.inner().clear()
  }
}
