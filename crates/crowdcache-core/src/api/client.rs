//! HTTP client for the population proxy.
//!
//! Two endpoints are used: `GET {base}/population?area=<name>` for one
//! location's live data and `GET {base}/areas` for the static directory.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::wire::PopulationResponse;
use super::{ApiError, SnapshotSource};
use crate::models::area::AreasResponse;
use crate::models::{AreaDirectory, LocationSnapshot};

// ============================================================================
// Constants
// ============================================================================

/// Default proxy base URL, used when no configuration overrides it.
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:3000/api";

/// HTTP request timeout in seconds.
pub const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Longest location name the upstream API accepts.
const MAX_LOCATION_NAME_LENGTH: usize = 100;

/// API client for the population proxy.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    /// UTC offset of the upstream's local timestamps.
    upstream_offset: FixedOffset,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str, timeout: Duration, upstream_offset: FixedOffset) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::InvalidRequest(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            upstream_offset,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check if response is successful, returning a classified error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn get<T: DeserializeOwned>(&self, url: &str, query: &[(&str, &str)]) -> Result<T, ApiError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| ApiError::from_transport(&e))?;

        let response = Self::check_response(response).await?;

        let text = response
            .text()
            .await
            .map_err(|e| ApiError::from_transport(&e))?;
        serde_json::from_str(&text)
            .map_err(|e| ApiError::MalformedResponse(format!("Failed to parse JSON from {}: {}", url, e)))
    }

    // ===== Data Fetching Methods =====

    /// Fetch live data for one location by display name.
    pub async fn fetch_population(&self, location: &str) -> Result<LocationSnapshot, ApiError> {
        let name = location.trim();
        if name.is_empty() {
            return Err(ApiError::InvalidRequest("empty location name".to_string()));
        }
        if name.chars().count() > MAX_LOCATION_NAME_LENGTH {
            return Err(ApiError::InvalidRequest(format!(
                "location name longer than {} characters",
                MAX_LOCATION_NAME_LENGTH
            )));
        }

        let url = format!("{}/population", self.base_url);
        let response: PopulationResponse = self.get(&url, &[("area", name)]).await?;
        debug!(
            location = %name,
            places = response.places.len(),
            "Population response received"
        );

        response
            .into_place(name)?
            .into_snapshot(name, Utc::now(), self.upstream_offset)
    }

    /// Fetch the directory of known locations and categories.
    pub async fn fetch_areas(&self) -> Result<AreaDirectory, ApiError> {
        let url = format!("{}/areas", self.base_url);
        let response: AreasResponse = self.get(&url, &[]).await?;
        debug!(
            areas = response.areas.len(),
            categories = response.categories.len(),
            "Area directory received"
        );
        Ok(AreaDirectory::from_response(response))
    }
}

#[async_trait]
impl SnapshotSource for ApiClient {
    async fn fetch_snapshot(&self, location: &str) -> Result<LocationSnapshot, ApiError> {
        self.fetch_population(location).await
    }
}
