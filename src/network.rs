//! Network reachability probing.
//!
//! A probe answers "can we reach the backend right now?". It is consulted on
//! demand, immediately before network-dependent actions, and never cached.

use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// A reachability check that may itself fail.
pub trait NetworkProbe: Send + Sync {
  /// `Ok(true)` when reachable, `Ok(false)` when not, `Err` when the probe
  /// could not decide.
  fn probe(&self) -> BoxFuture<'_, Result<bool>>;
}

/// What to assume when the probe itself errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeFailurePolicy {
  /// Fail open so actions are not blocked by a broken probe
  #[default]
  AssumeOnline,
  AssumeOffline,
}

impl ProbeFailurePolicy {
  pub fn assumed_available(self) -> bool {
    matches!(self, Self::AssumeOnline)
  }
}

/// Probe that issues a `HEAD` request against a URL.
///
/// Any HTTP response, whatever the status, counts as reachable.
pub struct HttpProbe {
  client: reqwest::Client,
  url: Url,
}

impl HttpProbe {
  pub fn new(url: Url, timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .connect_timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to build probe client: {}", e))?;

    Ok(Self { client, url })
  }

  /// Probe that bypasses any configured proxy, for tests against local listeners.
  #[cfg(test)]
  fn direct(url: Url, timeout: Duration) -> Self {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .no_proxy()
      .build()
      .unwrap();
    Self { client, url }
  }
}

impl NetworkProbe for HttpProbe {
  fn probe(&self) -> BoxFuture<'_, Result<bool>> {
    async move {
      match self.client.head(self.url.clone()).send().await {
        Ok(response) => {
          tracing::debug!(url = %self.url, status = %response.status(), "probe reached backend");
          Ok(true)
        }
        Err(e) if e.is_connect() || e.is_timeout() => {
          tracing::debug!(url = %self.url, error = %e, "probe could not reach backend");
          Ok(false)
        }
        Err(e) => Err(eyre!("Network probe to {} failed: {}", self.url, e)),
      }
    }
    .boxed()
  }
}

/// Probe with a fixed answer. Used when probing is disabled.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub bool);

impl NetworkProbe for StaticProbe {
  fn probe(&self) -> BoxFuture<'_, Result<bool>> {
    let available = self.0;
    async move { Ok(available) }.boxed()
  }
}

#[cfg(test)]
pub use testing::FailingProbe;
