//! HR backend access: REST client, cache keys and the cached facade.

mod cache;
mod cached_client;
mod client;
mod types;

pub use cached_client::CachedBackend;
pub use client::BackendClient;
pub use types::CompanyStatus;
