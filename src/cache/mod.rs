//! Generic caching layer for backend reads with offline support.
//!
//! This module provides a backend-agnostic caching mechanism that:
//! - Serves fresh entries without touching the network
//! - Stores every successful fetch with a per-read TTL
//! - Falls back to stale entries when a fetch fails (per `StalePolicy`)
//! - Invalidates single keys or whole key families (`companies_*`)

mod clock;
mod entry;
mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::ConfiguredStorage;
pub use traits::{CacheResult, QueryKey, QueryOptions, StalePolicy};

#[cfg(test)]
pub use entry::KeyPattern;
#[cfg(test)]
pub use storage::MemoryStorage;
#[cfg(test)]
pub use traits::CacheSource;
