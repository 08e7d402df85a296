//! Freshness and eviction policy for cached snapshots.
//!
//! Important (high-traffic) locations churn faster and are refreshed more
//! aggressively during commute hours. Everything else tolerates staleness
//! longer, which bounds upstream request volume.

use std::collections::HashSet;

use chrono::{DateTime, Duration, FixedOffset, Timelike, Utc};

/// Expiry for an important location during peak hours.
const IMPORTANT_PEAK_MINUTES: i64 = 15;
/// Expiry for other locations during peak hours.
const REGULAR_PEAK_MINUTES: i64 = 30;
/// Expiry for an important location off-peak.
const IMPORTANT_OFF_PEAK_MINUTES: i64 = 60;
/// Expiry for other locations off-peak.
const REGULAR_OFF_PEAK_MINUTES: i64 = 180;

/// Morning and evening commute windows, inclusive local hours.
const PEAK_HOURS: [(u32, u32); 2] = [(7, 10), (17, 20)];

/// Curated high-traffic locations, in pre-fetch order.
pub const CURATED_IMPORTANT_LOCATIONS: [&str; 15] = [
    "강남 MICE 관광특구",
    "명동 관광특구",
    "홍대 관광특구",
    "동대문 관광특구",
    "이태원 관광특구",
    "잠실 관광특구",
    "광화문·덕수궁",
    "서울역",
    "강남역",
    "홍대입구역(2호선)",
    "여의도",
    "가로수길",
    "신촌·이대역",
    "건대입구역",
    "고속터미널역",
];

/// The fixed set of important locations. Built once and shared read-only.
#[derive(Debug, Clone)]
pub struct ImportantLocations {
    ordered: Vec<String>,
    lookup: HashSet<String>,
}

impl ImportantLocations {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ordered = Vec::new();
        let mut lookup = HashSet::new();
        for id in ids {
            let id = id.into();
            if lookup.insert(id.clone()) {
                ordered.push(id);
            }
        }
        Self { ordered, lookup }
    }

    pub fn curated() -> Self {
        Self::new(CURATED_IMPORTANT_LOCATIONS)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lookup.contains(id)
    }

    /// Members in curated order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ordered.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

impl Default for ImportantLocations {
    fn default() -> Self {
        Self::curated()
    }
}

/// Expiry table lookup.
pub fn expiry_minutes(is_important: bool, is_peak: bool) -> i64 {
    match (is_important, is_peak) {
        (true, true) => IMPORTANT_PEAK_MINUTES,
        (false, true) => REGULAR_PEAK_MINUTES,
        (true, false) => IMPORTANT_OFF_PEAK_MINUTES,
        (false, false) => REGULAR_OFF_PEAK_MINUTES,
    }
}

#[derive(Debug, Clone)]
pub struct CachePolicy {
    important: ImportantLocations,
    /// Offset used to compute the local hour for peak detection.
    local_offset: FixedOffset,
}

impl CachePolicy {
    pub fn new(important: ImportantLocations, local_offset: FixedOffset) -> Self {
        Self {
            important,
            local_offset,
        }
    }

    pub fn important(&self) -> &ImportantLocations {
        &self.important
    }

    pub fn is_important(&self, location_id: &str) -> bool {
        self.important.contains(location_id)
    }

    pub fn is_peak_hour(&self, now: DateTime<Utc>) -> bool {
        let hour = now.with_timezone(&self.local_offset).hour();
        PEAK_HOURS
            .iter()
            .any(|&(start, end)| (start..=end).contains(&hour))
    }

    /// How long a snapshot of `location_id` stays fresh at `now`.
    pub fn expiry(&self, location_id: &str, now: DateTime<Utc>) -> Duration {
        Duration::minutes(expiry_minutes(
            self.is_important(location_id),
            self.is_peak_hour(now),
        ))
    }

    /// Stale once the age strictly exceeds the expiry.
    pub fn is_stale(&self, location_id: &str, captured_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - captured_at > self.expiry(location_id, now)
    }

    /// Choose the entry to evict under size pressure: the oldest
    /// non-important one. Important locations are never chosen.
    pub fn eviction_candidate<'a, I>(&self, entries: I) -> Option<&'a str>
    where
        I: IntoIterator<Item = (&'a str, DateTime<Utc>)>,
    {
        entries
            .into_iter()
            .filter(|(id, _)| !self.is_important(id))
            .min_by_key(|&(id, captured_at)| (captured_at, id))
            .map(|(id, _)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn policy() -> CachePolicy {
        CachePolicy::new(
            ImportantLocations::new(["A", "B"]),
            FixedOffset::east_opt(9 * 3600).unwrap(),
        )
    }

    /// A UTC instant that is `hour`:30 in +09:00.
    fn at_local_hour(hour: u32) -> DateTime<Utc> {
        FixedOffset::east_opt(9 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 5, 1, hour, 30, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_peak_hour_windows() {
        let p = policy();
        for hour in [7, 8, 9, 10, 17, 18, 19, 20] {
            assert!(p.is_peak_hour(at_local_hour(hour)), "hour {} should be peak", hour);
        }
        for hour in [0, 6, 11, 12, 16, 21, 23] {
            assert!(!p.is_peak_hour(at_local_hour(hour)), "hour {} should be off-peak", hour);
        }
    }

    #[test]
    fn test_expiry_table() {
        let p = policy();
        let peak = at_local_hour(8);
        let off_peak = at_local_hour(14);
        assert_eq!(p.expiry("A", peak), Duration::minutes(15));
        assert_eq!(p.expiry("X", peak), Duration::minutes(30));
        assert_eq!(p.expiry("A", off_peak), Duration::minutes(60));
        assert_eq!(p.expiry("X", off_peak), Duration::minutes(180));
    }

    #[test]
    fn test_staleness_across_all_combinations() {
        let p = policy();
        for (id, important) in [("A", true), ("X", false)] {
            for (now, peak) in [(at_local_hour(18), true), (at_local_hour(2), false)] {
                let limit = expiry_minutes(important, peak);
                let at_limit = now - Duration::minutes(limit);
                let past_limit = now - Duration::minutes(limit) - Duration::seconds(1);
                assert!(!p.is_stale(id, at_limit, now), "{} peak={} at limit", id, peak);
                assert!(p.is_stale(id, past_limit, now), "{} peak={} past limit", id, peak);
            }
        }
    }

    #[test]
    fn test_eviction_skips_important_and_picks_oldest() {
        let p = policy();
        let now = at_local_hour(12);
        let entries = vec![
            ("A", now - Duration::hours(10)),
            ("X", now - Duration::hours(2)),
            ("Y", now - Duration::hours(5)),
            ("Z", now - Duration::hours(1)),
        ];
        assert_eq!(p.eviction_candidate(entries), Some("Y"));
        assert_eq!(p.eviction_candidate(vec![("A", now), ("B", now)]), None);
    }

    #[test]
    fn test_curated_set_is_deduplicated_and_ordered() {
        let important = ImportantLocations::curated();
        assert_eq!(important.len(), 15);
        assert_eq!(important.iter().next(), Some("강남 MICE 관광특구"));
        assert!(important.contains("서울역"));
        assert!(!important.contains("남산공원"));
    }
}
