use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::backend::StorageBackend;
use super::policy::CachePolicy;
use crate::models::LocationSnapshot;
use crate::utils::age_display;

/// Bumped whenever the persisted entry shape changes; older entries are discarded.
pub const SCHEMA_VERSION: u32 = 1;

/// Default cap on distinct cached locations.
pub const DEFAULT_MAX_CACHED: usize = 50;

const AREA_KEY_PREFIX: &str = "area_";
const REGISTRY_KEY: &str = "cached_areas";
const LAST_UPDATE_KEY: &str = "last_cache_update";

/// The store shared between the dashboard, the collector and queued fetch tasks.
pub type SharedStore = Arc<Mutex<SnapshotStore>>;

/// A persisted snapshot plus the metadata used to judge its freshness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub schema_version: u32,
    pub captured_at: DateTime<Utc>,
    pub snapshot: LocationSnapshot,
}

impl CacheEntry {
    pub fn new(snapshot: LocationSnapshot, now: DateTime<Utc>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            captured_at: now,
            snapshot,
        }
    }

    pub fn age_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.captured_at).num_minutes()
    }

    pub fn age_display(&self, now: DateTime<Utc>) -> String {
        age_display(self.age_minutes(now))
    }
}

/// Only the version is read first, so entries from another schema are
/// recognized even when the rest of their shape no longer parses.
#[derive(Deserialize)]
struct EntryHeader {
    #[serde(default)]
    schema_version: Option<u32>,
}

enum EntryRead {
    Missing,
    Valid(CacheEntry),
    Invalid(String),
}

/// Cheap introspection of the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStatus {
    pub count: usize,
    pub ids: Vec<String>,
    pub last_updated_at: Option<DateTime<Utc>>,
}

/// One snapshot per location, persisted through a `StorageBackend`.
///
/// Every read checks schema and age against the `CachePolicy`; anything
/// stale, corrupt or unreadable is deleted and reported as a miss. Storage
/// failures never reach callers.
pub struct SnapshotStore {
    backend: Box<dyn StorageBackend>,
    policy: CachePolicy,
    max_cached: usize,
    /// Incremented on every mutation so readers can tell when derived data is outdated.
    generation: u64,
}

impl SnapshotStore {
    pub fn new(backend: Box<dyn StorageBackend>, policy: CachePolicy, max_cached: usize) -> Self {
        Self {
            backend,
            policy,
            max_cached,
            generation: 0,
        }
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn entry_key(location_id: &str) -> String {
        format!("{}{}", AREA_KEY_PREFIX, location_id)
    }

    // ===== Registry =====

    fn registry(&self) -> Vec<String> {
        match self.backend.get(REGISTRY_KEY) {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(error = %e, "Corrupt cache registry, starting empty");
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "Failed to read cache registry");
                Vec::new()
            }
        }
    }

    /// Returns false when the registry could not be persisted.
    fn write_registry(&mut self, ids: &[String]) -> bool {
        let result = serde_json::to_string(ids)
            .map_err(anyhow::Error::from)
            .and_then(|json| self.backend.set(REGISTRY_KEY, &json).map_err(Into::into));
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to write cache registry");
                false
            }
        }
    }

    // ===== Entries =====

    fn read_entry(&self, location_id: &str) -> EntryRead {
        let raw = match self.backend.get(&Self::entry_key(location_id)) {
            Ok(Some(raw)) => raw,
            Ok(None) => return EntryRead::Missing,
            Err(e) => return EntryRead::Invalid(format!("storage error: {}", e)),
        };

        let header: EntryHeader = match serde_json::from_str(&raw) {
            Ok(h) => h,
            Err(e) => return EntryRead::Invalid(format!("unparsable entry: {}", e)),
        };
        if header.schema_version != Some(SCHEMA_VERSION) {
            return EntryRead::Invalid(format!("schema version {:?}", header.schema_version));
        }

        match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) => EntryRead::Valid(entry),
            Err(e) => EntryRead::Invalid(format!("corrupt entry: {}", e)),
        }
    }

    /// Delete an entry and drop it from the registry.
    fn discard(&mut self, location_id: &str, reason: &str) {
        debug!(location = %location_id, reason, "Discarding cache entry");
        if let Err(e) = self.backend.remove(&Self::entry_key(location_id)) {
            warn!(location = %location_id, error = %e, "Failed to remove cache entry");
        }
        let mut registry = self.registry();
        let before = registry.len();
        registry.retain(|id| id != location_id);
        if registry.len() != before {
            self.write_registry(&registry);
        }
        self.generation += 1;
    }

    /// Free one slot: unreadable entries go first, then the policy's choice.
    fn make_room(&mut self) {
        let mut candidates = Vec::new();
        for id in self.registry() {
            match self.read_entry(&id) {
                EntryRead::Valid(entry) => candidates.push((id, entry.captured_at)),
                EntryRead::Missing => self.discard(&id, "registered but missing"),
                EntryRead::Invalid(reason) => self.discard(&id, &reason),
            }
        }

        if self.registry().len() < self.max_cached {
            return;
        }

        let victim = self
            .policy
            .eviction_candidate(candidates.iter().map(|(id, at)| (id.as_str(), *at)))
            .map(str::to_string);
        match victim {
            Some(id) => {
                info!(location = %id, "Cache full, evicting oldest entry");
                self.discard(&id, "capacity");
            }
            None => debug!("Cache full of important locations, nothing to evict"),
        }
    }

    pub fn save(&mut self, location_id: &str, snapshot: LocationSnapshot) -> bool {
        self.save_at(location_id, snapshot, Utc::now())
    }

    /// Persist a snapshot as captured at `now`, replacing any previous one.
    /// Returns false when the write failed; the entry is then absent.
    pub fn save_at(&mut self, location_id: &str, snapshot: LocationSnapshot, now: DateTime<Utc>) -> bool {
        let is_new = !self.registry().iter().any(|id| id == location_id);
        if is_new && self.registry().len() >= self.max_cached && !self.policy.is_important(location_id) {
            self.make_room();
        }

        let entry = CacheEntry::new(snapshot, now);
        let json = match serde_json::to_string(&entry) {
            Ok(json) => json,
            Err(e) => {
                warn!(location = %location_id, error = %e, "Failed to serialize cache entry");
                return false;
            }
        };

        if let Err(e) = self.backend.set(&Self::entry_key(location_id), &json) {
            warn!(location = %location_id, error = %e, "Failed to write cache entry");
            self.discard(location_id, "write failed");
            return false;
        }

        if is_new {
            let mut registry = self.registry();
            registry.push(location_id.to_string());
            if !self.write_registry(&registry) {
                // An unregistered entry would escape load_all, status and eviction
                if let Err(e) = self.backend.remove(&Self::entry_key(location_id)) {
                    warn!(location = %location_id, error = %e, "Failed to remove unregistered entry");
                }
                self.generation += 1;
                return false;
            }
        }
        if let Err(e) = self.backend.set(LAST_UPDATE_KEY, &now.to_rfc3339()) {
            warn!(error = %e, "Failed to record last cache update");
        }

        self.generation += 1;
        debug!(location = %location_id, "Snapshot cached");
        true
    }

    pub fn load(&mut self, location_id: &str) -> Option<LocationSnapshot> {
        self.load_at(location_id, Utc::now())
    }

    /// The cached snapshot if present, schema-valid and fresh at `now`.
    /// Stale or unreadable entries are deleted.
    pub fn load_at(&mut self, location_id: &str, now: DateTime<Utc>) -> Option<LocationSnapshot> {
        match self.read_entry(location_id) {
            EntryRead::Missing => {
                if self.registry().iter().any(|id| id == location_id) {
                    self.discard(location_id, "registered but missing");
                }
                None
            }
            EntryRead::Invalid(reason) => {
                self.discard(location_id, &reason);
                None
            }
            EntryRead::Valid(entry) => {
                if self.policy.is_stale(location_id, entry.captured_at, now) {
                    self.discard(location_id, "expired");
                    None
                } else {
                    Some(entry.snapshot)
                }
            }
        }
    }

    /// The schema-valid entry regardless of age, without side effects.
    /// Used to serve a degraded answer when the network is unavailable.
    pub fn peek(&self, location_id: &str) -> Option<CacheEntry> {
        match self.read_entry(location_id) {
            EntryRead::Valid(entry) => Some(entry),
            _ => None,
        }
    }

    pub fn load_all(&mut self) -> Vec<LocationSnapshot> {
        self.load_all_at(Utc::now())
    }

    /// Every fresh snapshot, in registry order. Misses are skipped.
    pub fn load_all_at(&mut self, now: DateTime<Utc>) -> Vec<LocationSnapshot> {
        self.registry()
            .into_iter()
            .filter_map(|id| self.load_at(&id, now))
            .collect()
    }

    /// Ids of every location with a fresh snapshot at `now`.
    pub fn fresh_ids_at(&mut self, now: DateTime<Utc>) -> Vec<String> {
        self.load_all_at(now)
            .into_iter()
            .map(|s| s.location_id)
            .collect()
    }

    pub fn status(&self) -> StoreStatus {
        let ids = self.registry();
        let last_updated_at = self
            .backend
            .get(LAST_UPDATE_KEY)
            .ok()
            .flatten()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw.trim()).ok())
            .map(|dt| dt.with_timezone(&Utc));
        StoreStatus {
            count: ids.len(),
            ids,
            last_updated_at,
        }
    }

    /// Explicitly remove one location. Returns whether it was cached.
    pub fn evict(&mut self, location_id: &str) -> bool {
        let present = self.registry().iter().any(|id| id == location_id);
        self.discard(location_id, "explicit eviction");
        present
    }

    pub fn clear(&mut self) {
        for id in self.registry() {
            self.discard(&id, "clear");
        }
        if let Err(e) = self.backend.remove(LAST_UPDATE_KEY) {
            warn!(error = %e, "Failed to clear last cache update");
        }
    }

    // ===== Auxiliary state =====

    /// Read a non-snapshot value (e.g. persisted dashboard state).
    pub fn read_value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.backend.get(key)? {
            Some(raw) => Ok(Some(
                serde_json::from_str(&raw).with_context(|| format!("Failed to parse stored value: {}", key))?,
            )),
            None => Ok(None),
        }
    }

    pub fn write_value<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value)?;
        self.backend
            .set(key, &json)
            .with_context(|| format!("Failed to write stored value: {}", key))?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::{FileStorage, MemoryStorage};
    use crate::cache::policy::ImportantLocations;
    use crate::models::snapshot::fixtures::snapshot;
    use crate::models::{AgeBracket, CongestionLevel};
    use chrono::{Duration, FixedOffset, TimeZone};

    fn policy() -> CachePolicy {
        CachePolicy::new(
            ImportantLocations::new(["A", "B"]),
            FixedOffset::east_opt(9 * 3600).unwrap(),
        )
    }

    fn store() -> SnapshotStore {
        SnapshotStore::new(Box::new(MemoryStorage::new()), policy(), DEFAULT_MAX_CACHED)
    }

    fn snap(id: &str) -> LocationSnapshot {
        snapshot(id, CongestionLevel::Normal, AgeBracket::Twenties, 25.0)
    }

    /// 14:00 local (+09:00), off-peak.
    fn off_peak() -> DateTime<Utc> {
        FixedOffset::east_opt(9 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 5, 1, 14, 0, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_save_then_load_hits() {
        let mut store = store();
        let now = off_peak();
        assert!(store.save_at("X", snap("X"), now));
        assert_eq!(store.load_at("X", now).map(|s| s.location_id), Some("X".into()));
        assert_eq!(store.status().ids, vec!["X"]);
        assert_eq!(store.status().last_updated_at, Some(now));
    }

    #[test]
    fn test_non_important_off_peak_hit_after_20_minutes() {
        let mut store = store();
        let now = off_peak();
        store.save_at("X", snap("X"), now - Duration::minutes(20));
        assert!(store.load_at("X", now).is_some());
    }

    #[test]
    fn test_expired_entry_is_miss_and_deleted() {
        let mut store = store();
        let now = off_peak();
        // Important off-peak expiry is 60 minutes
        store.save_at("A", snap("A"), now - Duration::minutes(61));
        assert!(store.load_at("A", now).is_none());
        assert_eq!(store.status().count, 0);
        assert!(store.peek("A").is_none());
    }

    #[test]
    fn test_peek_ignores_age_without_side_effects() {
        let mut store = store();
        let now = off_peak();
        store.save_at("A", snap("A"), now - Duration::hours(5));
        assert!(store.peek("A").is_some());
        assert_eq!(store.status().count, 1);
        assert_eq!(store.peek("A").unwrap().age_display(now), "5h ago");
    }

    #[test]
    fn test_overwrite_keeps_one_entry_per_location() {
        let mut store = store();
        let now = off_peak();
        store.save_at("X", snap("X"), now - Duration::minutes(10));
        let mut newer = snap("X");
        newer.congestion_level = CongestionLevel::VeryBusy;
        store.save_at("X", newer, now);
        assert_eq!(store.status().count, 1);
        assert_eq!(store.load_at("X", now).unwrap().congestion_level, CongestionLevel::VeryBusy);
    }

    #[test]
    fn test_corrupt_entry_is_miss_and_removed() {
        let mut backend = MemoryStorage::new();
        backend.set("area_X", "{not json").unwrap();
        backend.set("cached_areas", r#"["X"]"#).unwrap();
        let mut store = SnapshotStore::new(Box::new(backend), policy(), DEFAULT_MAX_CACHED);

        assert!(store.load_at("X", off_peak()).is_none());
        assert_eq!(store.status().count, 0);
    }

    #[test]
    fn test_schema_mismatch_is_miss() {
        let mut store = store();
        let now = off_peak();
        let mut entry = serde_json::to_value(CacheEntry::new(snap("X"), now)).unwrap();
        entry["schema_version"] = serde_json::json!(SCHEMA_VERSION + 1);
        store.backend.set("area_X", &entry.to_string()).unwrap();
        store.backend.set("cached_areas", r#"["X"]"#).unwrap();

        assert!(store.load_at("X", now).is_none());
        assert!(store.backend.get("area_X").unwrap().is_none());
    }

    #[test]
    fn test_quota_failure_is_swallowed() {
        let mut store = SnapshotStore::new(Box::new(MemoryStorage::with_quota(64)), policy(), DEFAULT_MAX_CACHED);
        let now = off_peak();
        assert!(!store.save_at("X", snap("X"), now));
        assert!(store.load_at("X", now).is_none());
        assert_eq!(store.status().count, 0);
    }

    #[test]
    fn test_registry_write_failure_drops_entry() {
        let now = off_peak();
        let json = serde_json::to_string(&CacheEntry::new(snap("X"), now)).unwrap();
        // Room for the entry itself but not for the registry next to it
        let quota = "area_X".len() + json.len() + 5;
        let mut store = SnapshotStore::new(Box::new(MemoryStorage::with_quota(quota)), policy(), DEFAULT_MAX_CACHED);

        assert!(!store.save_at("X", snap("X"), now));
        assert!(store.backend.get("area_X").unwrap().is_none());
        assert!(store.load_at("X", now).is_none());
        assert!(store.load_all_at(now).is_empty());
        assert_eq!(store.status().count, 0);
    }

    #[test]
    fn test_capacity_bound_with_important_exempt() {
        let mut store = store();
        let base = off_peak() - Duration::minutes(100);

        store.save_at("A", snap("A"), base);
        store.save_at("B", snap("B"), base);
        for i in 0..60 {
            let id = format!("N{}", i);
            store.save_at(&id, snap(&id), base + Duration::seconds(i + 1));
        }

        let status = store.status();
        let non_important = status.ids.iter().filter(|id| id.starts_with('N')).count();
        assert!(non_important <= DEFAULT_MAX_CACHED);
        assert!(status.ids.contains(&"A".to_string()));
        assert!(status.ids.contains(&"B".to_string()));
        // Oldest non-important entries went first
        assert!(!status.ids.contains(&"N0".to_string()));
        assert!(status.ids.contains(&"N59".to_string()));
    }

    #[test]
    fn test_important_location_never_triggers_eviction() {
        let mut store = SnapshotStore::new(Box::new(MemoryStorage::new()), policy(), 2);
        let now = off_peak();
        store.save_at("X", snap("X"), now);
        store.save_at("Y", snap("Y"), now);
        store.save_at("A", snap("A"), now);
        assert_eq!(store.status().count, 3);

        store.save_at("Z", snap("Z"), now);
        let ids = store.status().ids;
        assert_eq!(ids.len(), 3);
        assert!(ids.contains(&"A".to_string()) && ids.contains(&"Z".to_string()));
    }

    #[test]
    fn test_load_all_skips_misses_and_bumps_generation() {
        let mut store = store();
        let now = off_peak();
        store.save_at("X", snap("X"), now);
        store.save_at("A", snap("A"), now - Duration::hours(2));
        let before = store.generation();

        let all = store.load_all_at(now);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].location_id, "X");
        assert!(store.generation() > before);
        assert_eq!(store.fresh_ids_at(now), vec!["X"]);
    }

    #[test]
    fn test_evict_and_clear() {
        let mut store = store();
        let now = off_peak();
        store.save_at("X", snap("X"), now);
        store.save_at("Y", snap("Y"), now);
        assert!(store.evict("X"));
        assert!(!store.evict("X"));
        store.clear();
        assert_eq!(store.status(), StoreStatus { count: 0, ids: vec![], last_updated_at: None });
    }

    #[test]
    fn test_file_backed_store_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let now = off_peak();
        {
            let backend = FileStorage::new(dir.path().to_path_buf()).unwrap();
            let mut store = SnapshotStore::new(Box::new(backend), policy(), DEFAULT_MAX_CACHED);
            store.save_at("광화문·덕수궁", snap("광화문·덕수궁"), now);
            store.write_value("dashboard_state", &vec![1, 2, 3]).unwrap();
        }
        let backend = FileStorage::new(dir.path().to_path_buf()).unwrap();
        let mut store = SnapshotStore::new(Box::new(backend), policy(), DEFAULT_MAX_CACHED);
        assert!(store.load_at("광화문·덕수궁", now).is_some());
        assert_eq!(store.read_value::<Vec<i32>>("dashboard_state").unwrap(), Some(vec![1, 2, 3]));
    }
}
