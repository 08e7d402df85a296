//! Preference-based ranking of cached locations.
//!
//! Recommendations are always derived: nothing here is persisted. The
//! `Aggregator` reads every fresh snapshot from the store, scores each one
//! against the user's preferences and returns the top five with the reasons
//! that contributed to each score.

pub mod aggregator;

pub use aggregator::{rank_by_age_bracket, Aggregator, RecommendationEntry, MAX_RECOMMENDATIONS};
