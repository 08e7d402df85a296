//! crowdcache core library.
//!
//! Client-side caching and aggregation for real-time city congestion data.
//! A thin proxy in front of the city's open-data API serves one record per
//! location; this crate decides when a locally cached snapshot can be trusted,
//! serializes every upstream request through a single priority queue,
//! pre-fetches high-traffic locations in the background, and ranks cached
//! locations against the user's preferences.
//!
//! - [`cache`]: snapshot store, storage backends and the expiry policy
//! - [`coordinator`]: one-at-a-time upstream request queue
//! - [`collector`]: background pre-fetch of important locations
//! - [`recommend`]: preference scoring and ranked recommendations
//! - [`dashboard`]: the state manager tying the pieces together

pub mod api;
pub mod cache;
pub mod collector;
pub mod config;
pub mod coordinator;
pub mod dashboard;
pub mod models;
pub mod recommend;
pub mod utils;

pub use api::{ApiClient, ApiError, RetryPolicy, SnapshotSource};
pub use cache::{CachePolicy, ImportantLocations, SharedStore, SnapshotStore};
pub use collector::{BackgroundCollector, CollectionProgress, CollectorSettings, CollectorState};
pub use config::Config;
pub use coordinator::{Priority, RequestCoordinator};
pub use dashboard::{Dashboard, LocationView, ViewSource};
pub use models::{AgeBracket, AreaDirectory, CongestionLevel, LocationSnapshot, UserPreferences};
pub use recommend::{Aggregator, RecommendationEntry};
