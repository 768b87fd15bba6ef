//! Cache layer that orchestrates caching logic with network fetching.

use color_eyre::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::entry::{CacheEntry, KeyPattern};
use super::storage::CacheStorage;
use super::traits::{CacheResult, QueryKey, QueryOptions, StalePolicy};
use crate::network::{NetworkProbe, ProbeFailurePolicy, StaticProbe};

/// Freshness of a stored entry at the time it was inspected.
#[derive(Debug, Clone)]
pub struct EntryStatus {
  pub entry: CacheEntry,
  pub expired: bool,
}

/// Cache layer that manages caching logic and network fetching.
///
/// This layer sits between the application and the network client,
/// providing transparent caching with offline support. Clones share
/// the same storage.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  clock: Arc<dyn Clock>,
  probe: Arc<dyn NetworkProbe>,
  stale_policy: StalePolicy,
  probe_failure: ProbeFailurePolicy,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a new cache layer with the given storage backend.
  ///
  /// The network is assumed reachable until a probe is configured.
  pub fn new(storage: S) -> Self {
    Self {
      storage: Arc::new(storage),
      clock: Arc::new(SystemClock),
      probe: Arc::new(StaticProbe(true)),
      stale_policy: StalePolicy::default(),
      probe_failure: ProbeFailurePolicy::default(),
    }
  }

  pub fn with_probe(mut self, probe: impl NetworkProbe + 'static) -> Self {
    self.probe = Arc::new(probe);
    self
  }

  #[cfg_attr(not(test), allow(dead_code))]
  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn with_stale_policy(mut self, stale_policy: StalePolicy) -> Self {
    self.stale_policy = stale_policy;
    self
  }

  pub fn with_probe_failure(mut self, probe_failure: ProbeFailurePolicy) -> Self {
    self.probe_failure = probe_failure;
    self
  }

  /// Read through the cache.
  ///
  /// 1. Unless `force_refresh`, a fresh entry is returned without calling `fetcher`
  /// 2. Otherwise fetch, store and return the live value
  /// 3. On fetch failure, fall back to the previous entry if the stale policy
  ///    allows it; otherwise return the fetch error
  ///
  /// Concurrent calls for the same key are not coalesced; each one that
  /// misses calls its own fetcher.
  pub async fn cached_query<K, T, F, Fut>(
    &self,
    key: &K,
    options: QueryOptions,
    fetcher: F,
  ) -> Result<CacheResult<T>>
  where
    K: QueryKey + ?Sized,
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let cache_key = key.cache_key();

    if !options.force_refresh {
      if let Some((data, entry)) = self.lookup::<T>(&cache_key) {
        if !entry.is_expired(self.clock.now()) {
          debug!(key = %cache_key, "cache hit");
          return Ok(CacheResult::from_cache(data, entry.stored_at));
        }
        debug!(key = %cache_key, "cache entry expired");
      } else {
        debug!(key = %cache_key, "cache miss");
      }
    }

    match fetcher().await {
      Ok(data) => {
        self.store(&cache_key, &data, &options);
        Ok(CacheResult::from_network(data))
      }
      Err(error) => {
        // Re-read: the entry may have been invalidated while the fetch was in flight
        let previous = if self.stale_policy.allows(&options) {
          self.lookup::<T>(&cache_key)
        } else {
          None
        };

        match previous {
          Some((data, entry)) => {
            let online = self.is_network_available().await;
            info!(
              key = %cache_key,
              description = %key.description(),
              online,
              error = %error,
              "fetch failed, serving cached data"
            );
            Ok(CacheResult::stale(data, entry.stored_at, online, error))
          }
          None => Err(error.wrap_err(format!("Failed to load {}", key.description()))),
        }
      }
    }
  }

  /// Invalidate one key, or every key sharing a prefix when the pattern ends in `*`.
  ///
  /// Returns how many entries were removed; zero is not an error.
  pub fn clear_cache(&self, key_or_pattern: &str) -> Result<usize> {
    let removed = match KeyPattern::parse(key_or_pattern) {
      KeyPattern::Exact(key) => usize::from(self.storage.remove(key)?),
      KeyPattern::Prefix("") => self.storage.clear()?,
      KeyPattern::Prefix(prefix) => self.storage.remove_prefix(prefix)?,
    };

    info!(pattern = %key_or_pattern, removed, "cache invalidated");
    Ok(removed)
  }

  /// Probe the network, applying the probe failure policy if the probe errors.
  pub async fn is_network_available(&self) -> bool {
    match self.probe.probe().await {
      Ok(available) => available,
      Err(e) => {
        let assumed = self.probe_failure.assumed_available();
        warn!(error = %e, assumed, "network probe failed");
        assumed
      }
    }
  }

  /// Snapshot of every stored entry with its current freshness.
  pub fn entries(&self) -> Result<Vec<EntryStatus>> {
    let now = self.clock.now();
    Ok(
      self
        .storage
        .entries()?
        .into_iter()
        .map(|entry| EntryStatus {
          expired: entry.is_expired(now),
          entry,
        })
        .collect(),
    )
  }

  /// Load and decode an entry. Storage faults and undecodable values count as misses.
  fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<(T, CacheEntry)> {
    let entry = match self.storage.get(key) {
      Ok(entry) => entry?,
      Err(e) => {
        warn!(key, error = %e, "cache read failed");
        return None;
      }
    };

    match serde_json::from_value(entry.value.clone()) {
      Ok(data) => Some((data, entry)),
      Err(e) => {
        warn!(key, error = %e, "discarding undecodable cache entry");
        None
      }
    }
  }

  fn store<T: Serialize>(&self, key: &str, data: &T, options: &QueryOptions) {
    let value = match serde_json::to_value(data) {
      Ok(value) => value,
      Err(e) => {
        warn!(key, error = %e, "cannot serialize value for cache");
        return;
      }
    };

    let entry = CacheEntry::new(key, value, self.clock.now(), options.cache_ttl)
      .with_critical(options.critical_data);

    match self.storage.put(entry) {
      Ok(()) => debug!(key, "cache stored"),
      Err(e) => warn!(key, error = %e, "cache write failed"),
    }
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      clock: Arc::clone(&self.clock),
      probe: Arc::clone(&self.probe),
      stale_policy: self.stale_policy,
      probe_failure: self.probe_failure,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::clock::ManualClock;
  use crate::cache::storage::{MemoryStorage, SqliteStorage};
  use crate::network::FailingProbe;
  use chrono::{Duration, Utc};
  use color_eyre::eyre::eyre;
  use serde::Deserialize;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Company {
    id: String,
    name: String,
  }

  fn company(name: &str) -> Company {
    Company {
      id: "abc".to_string(),
      name: name.to_string(),
    }
  }

  fn layer_with_clock() -> (CacheLayer<MemoryStorage>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let layer = CacheLayer::new(MemoryStorage::new()).with_clock(clock.clone());
    (layer, clock)
  }

  /// Fetcher that counts invocations and returns `value`.
  fn counting_ok<T>(
    calls: &Arc<AtomicUsize>,
    value: T,
  ) -> impl FnOnce() -> futures::future::Ready<Result<T>> {
    let calls = calls.clone();
    move || {
      calls.fetch_add(1, Ordering::SeqCst);
      futures::future::ready(Ok(value))
    }
  }

  fn failing<T>(calls: &Arc<AtomicUsize>) -> impl FnOnce() -> futures::future::Ready<Result<T>> {
    let calls = calls.clone();
    move || {
      calls.fetch_add(1, Ordering::SeqCst);
      futures::future::ready(Err(eyre!("backend unreachable")))
    }
  }

  fn ttl_ms(ms: i64) -> QueryOptions {
    QueryOptions::new(Duration::milliseconds(ms))
  }

  #[tokio::test]
  async fn test_second_read_within_ttl_fetches_once() {
    let (layer, clock) = layer_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));

    let first = layer
      .cached_query("k", ttl_ms(1000), counting_ok(&calls, 1))
      .await
      .unwrap();
    clock.advance(Duration::milliseconds(500));
    let second = layer
      .cached_query("k", ttl_ms(1000), counting_ok(&calls, 2))
      .await
      .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!first.is_from_cache());
    assert!(second.is_from_cache());
    assert_eq!(second.data, 1);
    assert!(second.error.is_none());
  }

  #[tokio::test]
  async fn test_force_refresh_always_fetches() {
    let (layer, _clock) = layer_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));

    layer
      .cached_query("k", ttl_ms(60_000), counting_ok(&calls, 1))
      .await
      .unwrap();
    let refreshed = layer
      .cached_query("k", ttl_ms(60_000).force_refresh(true), counting_ok(&calls, 2))
      .await
      .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(refreshed.data, 2);
    assert!(!refreshed.is_from_cache());

    // The refresh overwrote the entry
    let cached = layer
      .cached_query("k", ttl_ms(60_000), counting_ok(&calls, 3))
      .await
      .unwrap();
    assert_eq!(cached.data, 2);
    assert_eq!(layer.entries().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_expired_entry_is_refetched() {
    let (layer, clock) = layer_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));

    layer
      .cached_query("k", ttl_ms(1000), counting_ok(&calls, 1))
      .await
      .unwrap();
    clock.advance(Duration::milliseconds(1001));
    let result = layer
      .cached_query("k", ttl_ms(1000), counting_ok(&calls, 2))
      .await
      .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(result.data, 2);
  }

  #[tokio::test]
  async fn test_critical_read_serves_stale_entry_on_failure() {
    let (layer, clock) = layer_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = ttl_ms(1000).critical(true);

    layer
      .cached_query("company_details_abc", options, counting_ok(&calls, company("Acme")))
      .await
      .unwrap();
    clock.advance(Duration::milliseconds(1001));

    let result = layer
      .cached_query("company_details_abc", options, failing::<Company>(&calls))
      .await
      .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(result.data, company("Acme"));
    assert!(result.is_from_cache());
    assert!(result.error.is_some());
    assert_eq!(result.source, crate::cache::CacheSource::CacheStale);
  }

  #[tokio::test]
  async fn test_non_critical_read_fails_past_ttl() {
    let (layer, clock) = layer_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));

    layer
      .cached_query("k", ttl_ms(1000), counting_ok(&calls, 1))
      .await
      .unwrap();
    clock.advance(Duration::milliseconds(1001));

    let result = layer
      .cached_query("k", ttl_ms(1000), failing::<i32>(&calls))
      .await;

    let error = result.unwrap_err();
    assert!(error
      .chain()
      .any(|cause| cause.to_string().contains("backend unreachable")));
  }

  #[tokio::test]
  async fn test_always_policy_serves_non_critical_stale_entry() {
    let (layer, clock) = layer_with_clock();
    let layer = layer.with_stale_policy(StalePolicy::Always);
    let calls = Arc::new(AtomicUsize::new(0));

    layer
      .cached_query("k", ttl_ms(1000), counting_ok(&calls, 1))
      .await
      .unwrap();
    clock.advance(Duration::milliseconds(1001));

    let result = layer
      .cached_query("k", ttl_ms(1000), failing::<i32>(&calls))
      .await
      .unwrap();
    assert_eq!(result.data, 1);
  }

  #[tokio::test]
  async fn test_never_policy_propagates_critical_failure() {
    let (layer, clock) = layer_with_clock();
    let layer = layer.with_stale_policy(StalePolicy::Never);
    let calls = Arc::new(AtomicUsize::new(0));
    let options = ttl_ms(1000).critical(true);

    layer
      .cached_query("k", options, counting_ok(&calls, 1))
      .await
      .unwrap();
    clock.advance(Duration::milliseconds(1001));

    assert!(layer
      .cached_query("k", options, failing::<i32>(&calls))
      .await
      .is_err());
  }

  #[tokio::test]
  async fn test_failure_without_previous_entry_is_hard_error() {
    let (layer, _clock) = layer_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));

    let result = layer
      .cached_query("k", ttl_ms(1000).critical(true), failing::<i32>(&calls))
      .await;

    assert!(result.is_err());
    assert!(layer.entries().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_offline_source_when_probe_reports_down() {
    let (layer, clock) = layer_with_clock();
    let layer = layer.with_probe(StaticProbe(false));
    let calls = Arc::new(AtomicUsize::new(0));
    let options = ttl_ms(1000).critical(true);

    layer
      .cached_query("k", options, counting_ok(&calls, 1))
      .await
      .unwrap();
    clock.advance(Duration::milliseconds(5000));

    let result = layer
      .cached_query("k", options, failing::<i32>(&calls))
      .await
      .unwrap();
    assert_eq!(result.source, crate::cache::CacheSource::Offline);
  }

  #[tokio::test]
  async fn test_forced_refresh_failure_falls_back_to_fresh_critical_entry() {
    let (layer, _clock) = layer_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = ttl_ms(60_000).critical(true);

    layer
      .cached_query("k", options, counting_ok(&calls, 1))
      .await
      .unwrap();
    let result = layer
      .cached_query("k", options.force_refresh(true), failing::<i32>(&calls))
      .await
      .unwrap();

    assert_eq!(result.data, 1);
    assert!(result.error.is_some());
  }

  #[tokio::test]
  async fn test_concurrent_cold_reads_are_not_coalesced() {
    let (layer, _clock) = layer_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));

    let fetch = |value: i32| {
      let calls = calls.clone();
      move || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        Ok::<_, color_eyre::Report>(value)
      }
    };

    let (a, b) = tokio::join!(
      layer.cached_query("cold", ttl_ms(60_000), fetch(1)),
      layer.cached_query("cold", ttl_ms(60_000), fetch(2)),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(!a.unwrap().is_from_cache());
    assert!(!b.unwrap().is_from_cache());
    assert_eq!(layer.entries().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_clear_cache_wildcard_leaves_other_prefixes() {
    let (layer, _clock) = layer_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));
    for key in ["companies_all", "companies_active", "company_details_42", "employees_42"] {
      layer
        .cached_query(key, ttl_ms(60_000), counting_ok(&calls, 0))
        .await
        .unwrap();
    }

    assert_eq!(layer.clear_cache("companies_*").unwrap(), 2);

    let keys: Vec<String> = layer
      .entries()
      .unwrap()
      .into_iter()
      .map(|s| s.entry.key)
      .collect();
    assert_eq!(keys, vec!["company_details_42", "employees_42"]);
  }

  #[tokio::test]
  async fn test_clear_cache_star_removes_everything() {
    let (layer, _clock) = layer_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));
    for key in ["companies_all", "company_details_42", "employees_42"] {
      layer
        .cached_query(key, ttl_ms(60_000), counting_ok(&calls, 0))
        .await
        .unwrap();
    }

    assert_eq!(layer.clear_cache("*").unwrap(), 3);
    assert!(layer.entries().unwrap().is_empty());
    assert_eq!(layer.clear_cache("*").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_entry_cleared_during_failed_fetch_is_not_served() {
    let (layer, _clock) = layer_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = ttl_ms(60_000).critical(true);

    layer
      .cached_query("company_details_abc", options, counting_ok(&calls, company("Acme")))
      .await
      .unwrap();

    let result = layer
      .cached_query("company_details_abc", options.force_refresh(true), || {
        layer.clear_cache("company_details_abc").unwrap();
        futures::future::ready(Err::<Company, _>(eyre!("backend unreachable")))
      })
      .await;

    assert!(result.is_err());
    assert!(layer.entries().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_clear_cache_exact_key() {
    let (layer, _clock) = layer_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));
    for key in ["company_details_42", "company_details_420"] {
      layer
        .cached_query(key, ttl_ms(60_000), counting_ok(&calls, 0))
        .await
        .unwrap();
    }

    assert_eq!(layer.clear_cache("company_details_42").unwrap(), 1);
    assert_eq!(layer.clear_cache("company_details_42").unwrap(), 0);
    assert_eq!(layer.entries().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_company_details_end_to_end() {
    let (layer, clock) = layer_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = QueryOptions::new(Duration::milliseconds(600_000)).critical(true);
    let key = "company_details_abc";

    let first = layer
      .cached_query(key, options, counting_ok(&calls, company("Acme")))
      .await
      .unwrap();
    assert!(!first.is_from_cache());

    clock.advance(Duration::minutes(9));
    let second = layer
      .cached_query(key, options, counting_ok(&calls, company("Other")))
      .await
      .unwrap();
    assert!(second.is_from_cache());
    assert_eq!(second.data, company("Acme"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    layer.clear_cache(key).unwrap();
    let third = layer
      .cached_query(key, options, counting_ok(&calls, company("Renamed")))
      .await
      .unwrap();
    assert!(!third.is_from_cache());
    assert_eq!(third.data, company("Renamed"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_undecodable_entry_is_a_miss() {
    let (layer, _clock) = layer_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));

    layer
      .cached_query("k", ttl_ms(60_000), counting_ok(&calls, "not a company".to_string()))
      .await
      .unwrap();
    let result = layer
      .cached_query("k", ttl_ms(60_000), counting_ok(&calls, company("Acme")))
      .await
      .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(result.data, company("Acme"));
  }

  #[tokio::test]
  async fn test_entries_report_expiry() {
    let (layer, clock) = layer_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));

    layer
      .cached_query("short", ttl_ms(10).critical(true), counting_ok(&calls, 1))
      .await
      .unwrap();
    layer
      .cached_query("long", ttl_ms(60_000), counting_ok(&calls, 2))
      .await
      .unwrap();
    clock.advance(Duration::milliseconds(100));

    let entries = layer.entries().unwrap();
    let short = entries.iter().find(|s| s.entry.key == "short").unwrap();
    let long = entries.iter().find(|s| s.entry.key == "long").unwrap();
    assert!(short.expired);
    assert!(short.entry.critical);
    assert!(!long.expired);
  }

  #[tokio::test]
  async fn test_probe_failure_policy() {
    let (layer, _clock) = layer_with_clock();

    let open = layer.clone().with_probe(FailingProbe);
    assert!(open.is_network_available().await);

    let closed = layer
      .with_probe(FailingProbe)
      .with_probe_failure(ProbeFailurePolicy::AssumeOffline);
    assert!(!closed.is_network_available().await);
  }

  #[tokio::test]
  async fn test_clones_share_storage() {
    let layer = CacheLayer::new(SqliteStorage::open_in_memory().unwrap());
    let other = layer.clone();
    let calls = Arc::new(AtomicUsize::new(0));

    layer
      .cached_query("k", ttl_ms(60_000), counting_ok(&calls, 1))
      .await
      .unwrap();
    let result = other
      .cached_query("k", ttl_ms(60_000), counting_ok(&calls, 2))
      .await
      .unwrap();

    assert_eq!(result.data, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }
}
