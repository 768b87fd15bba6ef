//! Cached backend client that wraps BackendClient with transparent caching.

use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};

use crate::cache::{CacheLayer, CacheResult, ConfiguredStorage, QueryKey, QueryOptions};

use super::cache::HrQueryKey;
use super::client::BackendClient;
use super::types::{Company, CompanyStatus, Employee};

/// Company details change rarely and are shown on most admin screens.
const COMPANY_DETAILS_TTL_MINUTES: i64 = 10;

/// Backend client with transparent caching support.
///
/// Company reads are critical: once fetched they stay available offline.
/// Employee reads are not, and fail when the backend can't be reached
/// after their TTL.
#[derive(Clone)]
pub struct CachedBackend {
  inner: BackendClient,
  cache: CacheLayer<ConfiguredStorage>,
  default_ttl: Duration,
}

impl CachedBackend {
  pub fn new(inner: BackendClient, cache: CacheLayer<ConfiguredStorage>, default_ttl: Duration) -> Self {
    Self {
      inner,
      cache,
      default_ttl,
    }
  }

  /// Get a single company with caching.
  pub async fn company(&self, id: &str, refresh: bool) -> Result<CacheResult<Company>> {
    let key = HrQueryKey::CompanyDetails { id: id.to_string() };
    let options = QueryOptions::new(Duration::minutes(COMPANY_DETAILS_TTL_MINUTES))
      .critical(true)
      .force_refresh(refresh);

    self
      .cache
      .cached_query(&key, options, || {
        let inner = self.inner.clone();
        let id = id.to_string();
        async move { inner.get_company(&id).await }
      })
      .await
  }

  /// Get companies with caching.
  pub async fn companies(
    &self,
    status: Option<CompanyStatus>,
    refresh: bool,
  ) -> Result<CacheResult<Vec<Company>>> {
    let key = HrQueryKey::Companies { status };
    let options = QueryOptions::new(self.default_ttl)
      .critical(true)
      .force_refresh(refresh);

    self
      .cache
      .cached_query(&key, options, || {
        let inner = self.inner.clone();
        async move { inner.get_companies(status).await }
      })
      .await
  }

  /// Get a company's employees with caching.
  pub async fn employees(&self, company_id: &str, refresh: bool) -> Result<CacheResult<Vec<Employee>>> {
    let key = HrQueryKey::Employees {
      company_id: company_id.to_string(),
    };
    let options = QueryOptions::new(self.default_ttl).force_refresh(refresh);

    self
      .cache
      .cached_query(&key, options, || {
        let inner = self.inner.clone();
        let company_id = company_id.to_string();
        async move { inner.get_employees(&company_id).await }
      })
      .await
  }

  /// Get a single employee with caching.
  pub async fn employee(&self, id: &str, refresh: bool) -> Result<CacheResult<Employee>> {
    let key = HrQueryKey::EmployeeDetails { id: id.to_string() };
    let options = QueryOptions::new(self.default_ttl).force_refresh(refresh);

    self
      .cache
      .cached_query(&key, options, || {
        let inner = self.inner.clone();
        let id = id.to_string();
        async move { inner.get_employee(&id).await }
      })
      .await
  }

  /// Update company status (not cached - write operation).
  ///
  /// Refuses to start while offline. On success the company's details and
  /// every company list are invalidated.
  pub async fn set_company_status(&self, id: &str, status: CompanyStatus) -> Result<()> {
    if !self.cache.is_network_available().await {
      return Err(eyre!(
        "No network connection. Company status can't be changed while offline."
      ));
    }

    self.inner.update_company_status(id, status).await?;
    info!(company = %id, status = status.as_str(), "company status updated");

    // The write has committed, so invalidation faults are only logged
    let details = HrQueryKey::CompanyDetails { id: id.to_string() };
    let lists = HrQueryKey::Companies { status: None };
    self.invalidate(&details.cache_key());
    self.invalidate(lists.family_pattern());

    Ok(())
  }

  fn invalidate(&self, key_or_pattern: &str) {
    if let Err(e) = self.cache.clear_cache(key_or_pattern) {
      warn!(pattern = %key_or_pattern, error = %e, "cache invalidation failed");
    }
  }
}
