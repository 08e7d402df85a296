use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::SharedStore;
use crate::models::{AgeBracket, CongestionLevel, LocationSnapshot, UserPreferences};

/// Entries returned per computation.
pub const MAX_RECOMMENDATIONS: usize = 5;

/// Every candidate starts here.
const BASE_SCORE: f64 = 50.0;
/// Awarded in full when the preferred bracket reaches `AGE_FULL_RATE` percent.
const AGE_POINTS: f64 = 30.0;
const AGE_FULL_RATE: f64 = 50.0;
/// Minimum bracket share worth mentioning as a reason.
const AGE_REASON_RATE: f64 = 15.0;
const CONGESTION_POINTS: f64 = 30.0;
/// Deducted when only the level next to the preferred side matches.
const ADJACENT_PENALTY: f64 = 10.0;
/// Bonus for the single least/most congested location when nothing else matches.
const EXTREME_POINTS: f64 = 10.0;
const CATEGORY_POINTS: f64 = 30.0;

/// Candidates scored between two cooperative yields.
const CHUNK_SIZE: usize = 30;

/// A run flagged as calculating for longer than this is considered stuck.
const WATCHDOG_SECS: u64 = 60;

const GENERIC_REASON: &str = "High overall score";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecommendationEntry {
    pub snapshot: LocationSnapshot,
    pub score: f64,
    pub match_reasons: Vec<String>,
}

/// How the congestion bonus is awarded in one computation.
#[derive(Debug, Clone, PartialEq)]
enum CongestionRule {
    /// Some candidate is on the preferred side; all such candidates get the full bonus.
    Exact,
    /// None is; candidates at this level get the bonus minus a penalty.
    Adjacent(CongestionLevel),
    /// Nothing adjacent either; only this location gets a small bonus.
    Extreme(String),
}

impl CongestionRule {
    fn choose(candidates: &[LocationSnapshot], prefer_quiet: bool) -> Option<Self> {
        if candidates.is_empty() {
            return None;
        }
        if candidates.iter().any(|s| s.congestion_level.is_quiet() == prefer_quiet) {
            return Some(CongestionRule::Exact);
        }

        let adjacent = if prefer_quiet {
            CongestionLevel::SlightlyBusy
        } else {
            CongestionLevel::Normal
        };
        if candidates.iter().any(|s| s.congestion_level == adjacent) {
            return Some(CongestionRule::Adjacent(adjacent));
        }

        let extreme = if prefer_quiet {
            candidates.iter().min_by(|a, b| {
                (a.congestion_level, a.population_max)
                    .cmp(&(b.congestion_level, b.population_max))
                    .then_with(|| a.location_id.cmp(&b.location_id))
            })
        } else {
            candidates.iter().min_by(|a, b| {
                (Reverse(a.congestion_level), Reverse(a.population_max))
                    .cmp(&(Reverse(b.congestion_level), Reverse(b.population_max)))
                    .then_with(|| a.location_id.cmp(&b.location_id))
            })
        };
        extreme.map(|s| CongestionRule::Extreme(s.location_id.clone()))
    }
}

#[derive(Default)]
struct Calculating {
    next_run: u64,
    current: Option<(u64, Instant)>,
}

/// Clears the calculating flag when the run ends, unless the watchdog
/// already handed it to a newer run.
struct CalculatingGuard<'a> {
    slot: &'a Mutex<Calculating>,
    run: u64,
}

impl Drop for CalculatingGuard<'_> {
    fn drop(&mut self) {
        let mut slot = lock(self.slot);
        if slot.current.is_some_and(|(run, _)| run == self.run) {
            slot.current = None;
        }
    }
}

fn lock(slot: &Mutex<Calculating>) -> MutexGuard<'_, Calculating> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Aggregator {
    /// Location id -> category id.
    categories: HashMap<String, String>,
    calculating: Mutex<Calculating>,
    watchdog: Duration,
}

impl Aggregator {
    pub fn new(categories: HashMap<String, String>) -> Self {
        Self {
            categories,
            calculating: Mutex::new(Calculating::default()),
            watchdog: Duration::from_secs(WATCHDOG_SECS),
        }
    }

    /// Replace the location -> category mapping, e.g. after the area directory loads.
    pub fn set_categories(&mut self, categories: HashMap<String, String>) {
        self.categories = categories;
    }

    pub fn is_calculating(&self) -> bool {
        lock(&self.calculating).current.is_some()
    }

    fn try_begin(&self) -> Option<CalculatingGuard<'_>> {
        let mut slot = lock(&self.calculating);
        if let Some((run, started)) = slot.current {
            if started.elapsed() < self.watchdog {
                return None;
            }
            warn!(run, elapsed_secs = started.elapsed().as_secs(), "Recommendation run appears stuck, clearing flag");
        }
        let run = slot.next_run;
        slot.next_run += 1;
        slot.current = Some((run, Instant::now()));
        Some(CalculatingGuard {
            slot: &self.calculating,
            run,
        })
    }

    /// Rank every fresh cached location against `prefs`.
    ///
    /// Returns `None` when another computation is still running. Otherwise at
    /// most `MAX_RECOMMENDATIONS` entries, best first, ties broken by location id.
    pub async fn compute_recommendations(
        &self,
        store: &SharedStore,
        prefs: &UserPreferences,
    ) -> Option<Vec<RecommendationEntry>> {
        let Some(_guard) = self.try_begin() else {
            debug!("Recommendations already being calculated, skipping");
            return None;
        };

        let snapshots = store.lock().await.load_all();
        let candidates = dedupe(snapshots);
        let Some(rule) = CongestionRule::choose(&candidates, prefs.prefer_quiet) else {
            debug!("No cached locations to recommend");
            return Some(Vec::new());
        };
        if rule != CongestionRule::Exact {
            info!(rule = ?rule, prefer_quiet = prefs.prefer_quiet, "No exact congestion match, relaxing");
        }

        let mut scored = Vec::with_capacity(candidates.len());
        for chunk in candidates.chunks(CHUNK_SIZE) {
            scored.extend(chunk.iter().map(|s| self.score(s, prefs, &rule)));
            tokio::task::yield_now().await;
        }

        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.snapshot.location_id.cmp(&b.snapshot.location_id))
        });
        scored.truncate(MAX_RECOMMENDATIONS);
        for entry in &mut scored {
            if entry.match_reasons.is_empty() {
                entry.match_reasons.push(GENERIC_REASON.to_string());
            }
        }

        debug!(candidates = candidates.len(), returned = scored.len(), "Recommendations computed");
        Some(scored)
    }

    fn score(&self, snapshot: &LocationSnapshot, prefs: &UserPreferences, rule: &CongestionRule) -> RecommendationEntry {
        let mut score = BASE_SCORE;
        let mut reasons = Vec::new();

        let bracket = prefs.preferred_age_bracket;
        let rate = snapshot.age_rate(bracket);
        score += AGE_POINTS * (rate / AGE_FULL_RATE).clamp(0.0, 1.0);
        if rate >= AGE_REASON_RATE {
            reasons.push(format!("{} visitors make up {:.0}% of the crowd", bracket.label(), rate));
        }

        let level = snapshot.congestion_level;
        match rule {
            CongestionRule::Exact if level.is_quiet() == prefs.prefer_quiet => {
                score += CONGESTION_POINTS;
                reasons.push(if prefs.prefer_quiet {
                    format!("Quiet right now ({})", level)
                } else {
                    format!("Lively right now ({})", level)
                });
            }
            CongestionRule::Adjacent(adjacent) if level == *adjacent => {
                score += CONGESTION_POINTS - ADJACENT_PENALTY;
                reasons.push(format!("Closest to your congestion preference ({})", level));
            }
            CongestionRule::Extreme(id) if snapshot.location_id == *id => {
                score += EXTREME_POINTS;
                reasons.push(if prefs.prefer_quiet {
                    format!("Least congested cached location ({})", level)
                } else {
                    format!("Busiest cached location ({})", level)
                });
            }
            _ => {}
        }

        if let Some(category) = self.categories.get(&snapshot.location_id) {
            if prefs.wants_category(category) {
                score += CATEGORY_POINTS;
                reasons.push(format!("In a preferred category ({})", category));
            }
        }

        RecommendationEntry {
            snapshot: snapshot.clone(),
            score,
            match_reasons: reasons,
        }
    }
}

/// One snapshot per location id, keeping the most recent capture.
fn dedupe(snapshots: Vec<LocationSnapshot>) -> Vec<LocationSnapshot> {
    let mut by_id: BTreeMap<String, LocationSnapshot> = BTreeMap::new();
    for snapshot in snapshots {
        match by_id.get(&snapshot.location_id) {
            Some(existing) if existing.captured_at >= snapshot.captured_at => {}
            _ => {
                by_id.insert(snapshot.location_id.clone(), snapshot);
            }
        }
    }
    by_id.into_values().collect()
}

/// Order snapshots by the share of the given age bracket, highest first.
pub fn rank_by_age_bracket(snapshots: Vec<LocationSnapshot>, bracket: AgeBracket) -> Vec<LocationSnapshot> {
    let mut ranked = dedupe(snapshots);
    ranked.sort_by(|a, b| {
        b.age_rate(bracket)
            .total_cmp(&a.age_rate(bracket))
            .then_with(|| a.location_id.cmp(&b.location_id))
    });
    ranked
}
