//! Timeouts, retries and name fallbacks around a `SnapshotSource`.

use std::time::Duration;

use tracing::{debug, warn};

use super::client::REQUEST_TIMEOUT_SECS;
use super::{ApiError, SnapshotSource};
use crate::models::{fallback_names, resolve_alias, LocationSnapshot};

/// Attempts per name (first try included) for transient failures.
const MAX_ATTEMPTS: u32 = 3;

/// Initial backoff delay in milliseconds, doubled after each transient failure.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// How a user-triggered fetch retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    /// Per-attempt timeout.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
        }
    }
}

/// One request, failed as `Timeout` if it outlives `timeout`.
pub async fn fetch_with_timeout(
    source: &dyn SnapshotSource,
    location: &str,
    timeout: Duration,
) -> Result<LocationSnapshot, ApiError> {
    match tokio::time::timeout(timeout, source.fetch_snapshot(location)).await {
        Ok(result) => result,
        Err(_) => Err(ApiError::Timeout),
    }
}

async fn fetch_with_backoff(
    source: &dyn SnapshotSource,
    location: &str,
    policy: &RetryPolicy,
) -> Result<LocationSnapshot, ApiError> {
    let mut attempt = 1;
    let mut backoff = policy.initial_backoff;

    loop {
        match fetch_with_timeout(source, location, policy.timeout).await {
            Ok(snapshot) => return Ok(snapshot),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                warn!(
                    location = %location,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Transient fetch failure, backing off"
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2; // Exponential backoff
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Fetch a location the way a user-triggered request does.
///
/// Known aliases are applied first. Transient failures are retried with
/// exponential backoff; `NotFound` moves on to the known fallback names.
/// Every other failure surfaces immediately.
pub async fn fetch_with_retry(
    source: &dyn SnapshotSource,
    location: &str,
    policy: &RetryPolicy,
) -> Result<LocationSnapshot, ApiError> {
    let name = resolve_alias(location);
    if name != location.trim() {
        debug!(from = %location, to = %name, "Using alias for location name");
    }

    match fetch_with_backoff(source, name, policy).await {
        Err(ApiError::NotFound(_)) => {
            for fallback in fallback_names(name) {
                debug!(from = %name, to = %fallback, "No data, trying fallback name");
                match fetch_with_backoff(source, &fallback, policy).await {
                    Ok(snapshot) => return Ok(snapshot),
                    Err(ApiError::NotFound(_)) => continue,
                    Err(e) => return Err(e),
                }
            }
            Err(ApiError::NotFound(name.to_string()))
        }
        other => other,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::snapshot::fixtures::snapshot;
    use crate::models::{AgeBracket, CongestionLevel};
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// Source that replays scripted outcomes per name and records every call.
    #[derive(Default)]
    pub struct ScriptedSource {
        pub script: Mutex<HashMap<String, VecDeque<Result<(), ApiError>>>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl ScriptedSource {
        pub fn push(&self, name: &str, outcome: Result<(), ApiError>) {
            self.script
                .lock()
                .unwrap()
                .entry(name.to_string())
                .or_default()
                .push_back(outcome);
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SnapshotSource for ScriptedSource {
        async fn fetch_snapshot(&self, location: &str) -> Result<LocationSnapshot, ApiError> {
            self.calls.lock().unwrap().push(location.to_string());
            let outcome = self
                .script
                .lock()
                .unwrap()
                .get_mut(location)
                .and_then(|q| q.pop_front())
                .unwrap_or_else(|| Err(ApiError::NotFound(location.to_string())));
            outcome.map(|_| snapshot(location, CongestionLevel::Normal, AgeBracket::Twenties, 20.0))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retried_until_success() {
        let source = ScriptedSource::default();
        source.push("서울역", Err(ApiError::Timeout));
        source.push("서울역", Err(ApiError::UpstreamServerError("503".into())));
        source.push("서울역", Ok(()));

        let start = tokio::time::Instant::now();
        let snap = fetch_with_retry(&source, "서울역", &RetryPolicy::default()).await.unwrap();
        assert_eq!(snap.location_id, "서울역");
        assert_eq!(source.calls().len(), 3);
        // 1s + 2s of backoff
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhausted() {
        let source = ScriptedSource::default();
        for _ in 0..5 {
            source.push("서울역", Err(ApiError::NetworkUnavailable("refused".into())));
        }
        let err = fetch_with_retry(&source, "서울역", &RetryPolicy::default()).await.unwrap_err();
        assert!(matches!(err, ApiError::NetworkUnavailable(_)));
        assert_eq!(source.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_surfaces_immediately() {
        let source = ScriptedSource::default();
        source.push("서울역", Err(ApiError::RateLimited));
        let err = fetch_with_retry(&source, "서울역", &RetryPolicy::default()).await.unwrap_err();
        assert_eq!(err, ApiError::RateLimited);
        assert_eq!(source.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_tries_fallback_names() {
        let source = ScriptedSource::default();
        source.push("동대문", Err(ApiError::NotFound("동대문".into())));
        source.push("동대문 관광특구", Ok(()));

        let snap = fetch_with_retry(&source, "동대문", &RetryPolicy::default()).await.unwrap();
        assert_eq!(snap.location_id, "동대문 관광특구");
        assert_eq!(source.calls(), vec!["동대문", "동대문 관광특구"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_alias_applied_before_request() {
        let source = ScriptedSource::default();
        source.push("홍대입구역(2호선)", Ok(()));
        fetch_with_retry(&source, "홍대입구", &RetryPolicy::default()).await.unwrap();
        assert_eq!(source.calls(), vec!["홍대입구역(2호선)"]);
    }

    struct HangingSource;

    #[async_trait]
    impl SnapshotSource for HangingSource {
        async fn fetch_snapshot(&self, _location: &str) -> Result<LocationSnapshot, ApiError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_request_times_out() {
        let err = fetch_with_timeout(&HangingSource, "서울역", Duration::from_secs(10))
            .await
            .unwrap_err();
        assert_eq!(err, ApiError::Timeout);
    }
}
