//! Client for the population proxy.
//!
//! The proxy forwards a location-name query to the city's open-data API and
//! reshapes the answer. `ApiClient` performs single requests against it;
//! `fetch` layers timeouts, exponential backoff and name fallbacks on top of
//! any `SnapshotSource`.

pub mod client;
pub mod error;
pub mod fetch;
pub mod wire;

use async_trait::async_trait;

use crate::models::LocationSnapshot;

pub use client::ApiClient;
pub use error::ApiError;
pub use fetch::{fetch_with_retry, fetch_with_timeout, RetryPolicy};

/// Anything that can produce a fresh snapshot for a location name.
///
/// One call is one upstream request; retries are layered on by `fetch`.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self, location: &str) -> Result<LocationSnapshot, ApiError>;
}
