//! Dashboard state manager.
//!
//! `Dashboard` owns everything the user-facing surface needs: the snapshot
//! store, the request coordinator, the background collector, the
//! recommendation aggregator, the area directory and the user's preferences.
//! Persistent dashboard state is loaded once when the dashboard opens and
//! written back by `close()`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::api::{fetch_with_retry, ApiClient, ApiError, RetryPolicy, SnapshotSource};
use crate::cache::{CachePolicy, FileStorage, ImportantLocations, SharedStore, SnapshotStore, StoreStatus};
use crate::collector::{BackgroundCollector, CollectionProgress, CollectorSettings};
use crate::config::Config;
use crate::coordinator::{Priority, RequestCoordinator};
use crate::models::{resolve_alias, AgeBracket, AreaDirectory, LocationSnapshot, SearchResult, UserPreferences};
use crate::recommend::{rank_by_age_bracket, Aggregator, RecommendationEntry};

/// Storage key for persisted dashboard state.
const STATE_KEY: &str = "dashboard_state";

/// What survives between sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct DashboardState {
    preferences: UserPreferences,
    selected_location: Option<String>,
}

/// Where a displayed snapshot came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewSource {
    /// Fresh cache hit, no request made.
    Cache,
    /// Fetched just now.
    Network,
    /// The fetch failed; this is the last cached copy, possibly stale.
    Degraded { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocationView {
    pub snapshot: LocationSnapshot,
    pub source: ViewSource,
    /// When the shown data was stored locally.
    pub cached_at: DateTime<Utc>,
}

impl LocationView {
    pub fn is_degraded(&self) -> bool {
        matches!(self.source, ViewSource::Degraded { .. })
    }
}

struct ComputedRecommendations {
    generation: u64,
    entries: Vec<RecommendationEntry>,
}

pub struct Dashboard {
    store: SharedStore,
    coordinator: Arc<RequestCoordinator>,
    collector: BackgroundCollector,
    source: Arc<dyn SnapshotSource>,
    aggregator: Aggregator,
    directory: AreaDirectory,
    retry: RetryPolicy,
    state: DashboardState,
    recommendations: Option<ComputedRecommendations>,
    /// Set when preferences or reference data changed since the last computation.
    dirty: bool,
}

impl Dashboard {
    /// Open the file-backed dashboard described by `config`.
    pub fn open(config: &Config, source: Arc<dyn SnapshotSource>) -> Result<Self> {
        let dir = config.cache_dir()?;
        let backend = FileStorage::new(dir.clone())
            .with_context(|| format!("Failed to open cache directory: {}", dir.display()))?;
        let policy = CachePolicy::new(ImportantLocations::curated(), config.local_offset());
        let store = SnapshotStore::new(Box::new(backend), policy, config.max_cached);

        let retry = RetryPolicy {
            timeout: config.request_timeout(),
            ..RetryPolicy::default()
        };
        Ok(Self::with_store(
            store,
            source,
            config.request_delay(),
            config.collector_settings(),
            retry,
        ))
    }

    /// Build around an existing store. Must run inside a tokio runtime.
    pub fn with_store(
        store: SnapshotStore,
        source: Arc<dyn SnapshotSource>,
        request_delay: Duration,
        collector_settings: CollectorSettings,
        retry: RetryPolicy,
    ) -> Self {
        let state = match store.read_value::<DashboardState>(STATE_KEY) {
            Ok(Some(state)) => {
                debug!(selected = ?state.selected_location, "Restored dashboard state");
                state
            }
            Ok(None) => DashboardState::default(),
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable dashboard state");
                DashboardState::default()
            }
        };

        let store = store.into_shared();
        let coordinator = Arc::new(RequestCoordinator::spawn(request_delay));
        let collector = BackgroundCollector::new(
            Arc::clone(&store),
            Arc::clone(&coordinator),
            Arc::clone(&source),
            collector_settings,
        );
        let directory = AreaDirectory::builtin();
        let aggregator = Aggregator::new(directory.category_map());

        Self {
            store,
            coordinator,
            collector,
            source,
            aggregator,
            directory,
            retry,
            state,
            recommendations: None,
            dirty: true,
        }
    }

    // ===== Locations =====

    /// Map free text to a location id, falling back to the text itself.
    pub fn resolve_location(&self, name: &str) -> String {
        match self.directory.resolve(name) {
            Some(area) => area.id.clone(),
            None => resolve_alias(name).trim().to_string(),
        }
    }

    /// Select a location and show it. Selecting the current location again
    /// bypasses the cache.
    pub async fn select_location(&mut self, name: &str) -> Result<LocationView, ApiError> {
        let id = self.resolve_location(name);
        let reselect = self.state.selected_location.as_deref() == Some(id.as_str());
        self.state.selected_location = Some(id.clone());
        if reselect {
            info!(location = %id, "Location reselected, forcing refresh");
        }
        self.fetch_location(&id, reselect).await
    }

    pub fn selected_location(&self) -> Option<&str> {
        self.state.selected_location.as_deref()
    }

    /// Serve a location from cache when fresh, otherwise fetch it at high
    /// priority. When the fetch fails, the last cached copy is served as
    /// degraded; only without one does the error surface.
    pub async fn fetch_location(&mut self, location_id: &str, force_refresh: bool) -> Result<LocationView, ApiError> {
        // A stale entry stays in storage until a successful fetch replaces it,
        // so every failed fetch can still fall back to it
        let stored = {
            let store = self.store.lock().await;
            let stored = store.peek(location_id);
            if !force_refresh {
                if let Some(entry) = &stored {
                    if !store.policy().is_stale(location_id, entry.captured_at, Utc::now()) {
                        debug!(location = %location_id, "Cache hit");
                        return Ok(LocationView {
                            snapshot: entry.snapshot.clone(),
                            source: ViewSource::Cache,
                            cached_at: entry.captured_at,
                        });
                    }
                }
            }
            stored
        };

        let source = Arc::clone(&self.source);
        let retry = self.retry;
        let name = location_id.to_string();
        let rx = self
            .coordinator
            .submit(Priority::High, format!("fetch {}", location_id), async move {
                fetch_with_retry(source.as_ref(), &name, &retry).await
            })
            .await;
        let result = rx
            .await
            .unwrap_or_else(|_| Err(ApiError::NetworkUnavailable("request queue stopped".to_string())));

        match result {
            Ok(snapshot) => {
                let now = Utc::now();
                let id = snapshot.location_id.clone();
                if !self.store.lock().await.save_at(&id, snapshot.clone(), now) {
                    warn!(location = %id, "Fetched snapshot could not be cached");
                }
                self.collector.refresh_progress().await;
                Ok(LocationView {
                    snapshot,
                    source: ViewSource::Network,
                    cached_at: now,
                })
            }
            Err(e) => match stored {
                Some(entry) => {
                    warn!(location = %location_id, error = %e, "Fetch failed, serving cached copy");
                    Ok(LocationView {
                        snapshot: entry.snapshot,
                        source: ViewSource::Degraded { reason: e.to_string() },
                        cached_at: entry.captured_at,
                    })
                }
                None => {
                    warn!(location = %location_id, error = %e, "Fetch failed with nothing cached");
                    Err(e)
                }
            },
        }
    }

    // ===== Preferences & recommendations =====

    pub fn preferences(&self) -> &UserPreferences {
        &self.state.preferences
    }

    pub fn set_preferences(&mut self, preferences: UserPreferences) {
        if preferences != self.state.preferences {
            debug!(?preferences, "Preferences changed");
            self.state.preferences = preferences;
            self.dirty = true;
        }
    }

    /// Current recommendations, recomputed only when preferences or the
    /// cache changed since the last computation.
    ///
    /// Also kicks the collector, even when paused, while important
    /// locations are still missing.
    pub async fn get_recommendations(&mut self) -> Vec<RecommendationEntry> {
        let progress = self.collector.refresh_progress().await;
        if !progress.is_complete() && self.collector.start(true) {
            info!(
                loaded = progress.loaded_important,
                total = progress.total_important,
                "Starting collection for recommendations"
            );
        }

        let generation = self.store.lock().await.generation();
        if let Some(ref computed) = self.recommendations {
            if !self.dirty && computed.generation == generation {
                return computed.entries.clone();
            }
        }

        match self
            .aggregator
            .compute_recommendations(&self.store, &self.state.preferences)
            .await
        {
            Some(entries) => {
                // Reading may have dropped stale entries, so take the generation afterwards
                let generation = self.store.lock().await.generation();
                self.recommendations = Some(ComputedRecommendations {
                    generation,
                    entries: entries.clone(),
                });
                self.dirty = false;
                entries
            }
            None => self
                .recommendations
                .as_ref()
                .map(|c| c.entries.clone())
                .unwrap_or_default(),
        }
    }

    /// Fresh cached locations ordered by the share of one age bracket.
    pub async fn rank_by_age(&self, bracket: AgeBracket) -> Vec<LocationSnapshot> {
        let snapshots = self.store.lock().await.load_all();
        rank_by_age_bracket(snapshots, bracket)
    }

    // ===== Collection =====

    pub fn collector(&self) -> &BackgroundCollector {
        &self.collector
    }

    pub fn start_collection(&self) -> bool {
        self.collector.start(false)
    }

    pub fn pause_collection(&self) {
        self.collector.pause();
    }

    pub fn resume_collection(&self) {
        self.collector.resume();
    }

    pub async fn collection_progress(&self) -> CollectionProgress {
        self.collector.refresh_progress().await
    }

    // ===== Directory & status =====

    pub fn directory(&self) -> &AreaDirectory {
        &self.directory
    }

    pub fn search(&self, text: &str) -> Vec<SearchResult> {
        self.directory.search(text)
    }

    /// Replace the built-in directory with the proxy's.
    pub async fn load_directory(&mut self, client: &ApiClient) -> Result<(), ApiError> {
        let directory = client.fetch_areas().await?;
        info!(areas = directory.areas().len(), "Area directory loaded");
        self.aggregator.set_categories(directory.category_map());
        self.directory = directory;
        self.dirty = true;
        Ok(())
    }

    pub async fn status(&self) -> StoreStatus {
        self.store.lock().await.status()
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Persist dashboard state and stop background work.
    pub async fn close(self) -> Result<()> {
        self.collector.shutdown();
        self.coordinator.shutdown().await;
        self.store
            .lock()
            .await
            .write_value(STATE_KEY, &self.state)
            .context("Failed to save dashboard state")?;
        debug!("Dashboard state saved");
        Ok(())
    }
}
