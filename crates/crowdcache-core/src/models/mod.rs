//! Data models for city congestion data.
//!
//! - `LocationSnapshot`, `ForecastPoint`: one capture of a location's crowd data
//! - `CongestionLevel`, `AgeBracket`, `GenderRatio`: the typed pieces of a snapshot
//! - `Area`, `Category`, `AreaDirectory`: the static list of known locations
//! - `UserPreferences`: what the user is looking for in a recommendation

pub mod area;
pub mod preferences;
pub mod snapshot;

pub use area::{fallback_names, resolve_alias, Area, AreaDirectory, Category, SearchResult};
pub use preferences::UserPreferences;
pub use snapshot::{AgeBracket, CongestionLevel, ForecastPoint, GenderRatio, LocationSnapshot};
