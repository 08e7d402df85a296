//! Local caching of location snapshots.
//!
//! `SnapshotStore` keeps at most one snapshot per location in a key-value
//! backend, under the same keys the web client used:
//! - `area_<location id>`: one `CacheEntry`
//! - `cached_areas`: JSON array of cached location ids
//! - `last_cache_update`: RFC 3339 time of the last write
//!
//! How long an entry stays fresh, and which entry goes when the store is
//! full, is decided by `CachePolicy`.

pub mod backend;
pub mod policy;
pub mod store;

pub use backend::{FileStorage, MemoryStorage, StorageBackend, StorageError};
pub use policy::{expiry_minutes, CachePolicy, ImportantLocations, CURATED_IMPORTANT_LOCATIONS};
pub use store::{CacheEntry, SharedStore, SnapshotStore, StoreStatus, DEFAULT_MAX_CACHED, SCHEMA_VERSION};
