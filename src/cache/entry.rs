//! Stored cache entries and invalidation patterns.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

/// A single stored value with its freshness metadata.
///
/// Entries never expire on their own; staleness is decided at read time.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub key: String,
  /// Serialized value as returned by the fetcher
  pub value: Value,
  pub stored_at: DateTime<Utc>,
  pub ttl: Duration,
  /// Whether the read that stored this entry was marked critical
  pub critical: bool,
}

impl CacheEntry {
  pub fn new(key: impl Into<String>, value: Value, stored_at: DateTime<Utc>, ttl: Duration) -> Self {
    Self {
      key: key.into(),
      value,
      stored_at,
      ttl,
      critical: false,
    }
  }

  pub fn with_critical(mut self, critical: bool) -> Self {
    self.critical = critical;
    self
  }

  /// Age of the entry at `now`.
  pub fn age(&self, now: DateTime<Utc>) -> Duration {
    now - self.stored_at
  }

  /// Check if the entry is past its TTL at `now`.
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    self.age(now) > self.ttl
  }
}

/// Target of an invalidation: one key, or every key sharing a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPattern<'a> {
  Exact(&'a str),
  Prefix(&'a str),
}

impl<'a> KeyPattern<'a> {
  /// Parse a key or a trailing-`*` wildcard.
  ///
  /// Only a single trailing `*` is special; a `*` anywhere else is part of the key.
  pub fn parse(pattern: &'a str) -> Self {
    match pattern.strip_suffix('*') {
      Some(prefix) => Self::Prefix(prefix),
      None => Self::Exact(pattern),
    }
  }

  pub fn matches(&self, key: &str) -> bool {
    match self {
      Self::Exact(exact) => key == *exact,
      Self::Prefix(prefix) => key.starts_with(prefix),
    }
  }
}
