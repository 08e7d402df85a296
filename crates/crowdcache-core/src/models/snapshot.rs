//! Domain models for a single location capture.
//!
//! These types are the validated form of the proxy's place records; see
//! `api::wire` for the parsing step that produces them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Congestion Level
// ============================================================================

/// Crowd density at a location, ordered from least to most crowded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CongestionLevel {
    Calm = 0,
    Normal = 1,
    SlightlyBusy = 2,
    Busy = 3,
    VeryBusy = 4,
}

impl CongestionLevel {
    pub const ALL: [CongestionLevel; 5] = [
        CongestionLevel::Calm,
        CongestionLevel::Normal,
        CongestionLevel::SlightlyBusy,
        CongestionLevel::Busy,
        CongestionLevel::VeryBusy,
    ];

    /// Parse an upstream congestion string.
    /// The open-data API reports Korean labels; English labels are accepted too.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "여유" => Some(CongestionLevel::Calm),
            "보통" => Some(CongestionLevel::Normal),
            "약간 붐빔" => Some(CongestionLevel::SlightlyBusy),
            "붐빔" => Some(CongestionLevel::Busy),
            "매우 붐빔" => Some(CongestionLevel::VeryBusy),
            other => match other.to_lowercase().replace('_', " ").as_str() {
                "calm" => Some(CongestionLevel::Calm),
                "normal" => Some(CongestionLevel::Normal),
                "slightly busy" => Some(CongestionLevel::SlightlyBusy),
                "busy" => Some(CongestionLevel::Busy),
                "very busy" => Some(CongestionLevel::VeryBusy),
                _ => None,
            },
        }
    }

    /// Numeric order for sorting (0 = calm, 4 = very busy).
    pub fn order(&self) -> usize {
        *self as usize
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            CongestionLevel::Calm => "calm",
            CongestionLevel::Normal => "normal",
            CongestionLevel::SlightlyBusy => "slightly busy",
            CongestionLevel::Busy => "busy",
            CongestionLevel::VeryBusy => "very busy",
        }
    }

    /// Calm and normal count as quiet; everything from slightly busy up is busy.
    pub fn is_quiet(&self) -> bool {
        matches!(self, CongestionLevel::Calm | CongestionLevel::Normal)
    }

    /// Map marker color for this level.
    pub fn color(&self) -> &'static str {
        match self {
            CongestionLevel::Calm => "#34c759",
            CongestionLevel::Normal => "#ffcc00",
            CongestionLevel::SlightlyBusy => "#ff9500",
            CongestionLevel::Busy => "#ff3b30",
            CongestionLevel::VeryBusy => "#af2a2a",
        }
    }
}

impl std::fmt::Display for CongestionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

// ============================================================================
// Age Bracket
// ============================================================================

/// Age brackets reported by the upstream demographic breakdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AgeBracket {
    #[serde(rename = "0")]
    Under10,
    #[serde(rename = "10s")]
    Teens,
    #[serde(rename = "20s")]
    Twenties,
    #[serde(rename = "30s")]
    Thirties,
    #[serde(rename = "40s")]
    Forties,
    #[serde(rename = "50s")]
    Fifties,
    #[serde(rename = "60s")]
    Sixties,
    #[serde(rename = "70s")]
    SeventiesPlus,
}

impl AgeBracket {
    pub const ALL: [AgeBracket; 8] = [
        AgeBracket::Under10,
        AgeBracket::Teens,
        AgeBracket::Twenties,
        AgeBracket::Thirties,
        AgeBracket::Forties,
        AgeBracket::Fifties,
        AgeBracket::Sixties,
        AgeBracket::SeventiesPlus,
    ];

    /// The key used by the proxy's `ageGroups` object.
    pub fn key(&self) -> &'static str {
        match self {
            AgeBracket::Under10 => "0",
            AgeBracket::Teens => "10s",
            AgeBracket::Twenties => "20s",
            AgeBracket::Thirties => "30s",
            AgeBracket::Forties => "40s",
            AgeBracket::Fifties => "50s",
            AgeBracket::Sixties => "60s",
            AgeBracket::SeventiesPlus => "70s",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.key() == key.trim())
    }

    pub fn label(&self) -> &'static str {
        match self {
            AgeBracket::Under10 => "under-10",
            AgeBracket::SeventiesPlus => "70+",
            other => other.key(),
        }
    }
}

impl std::str::FromStr for AgeBracket {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_key(s).ok_or_else(|| {
            format!("unknown age bracket '{}' (expected one of 0, 10s, 20s, ... 70s)", s)
        })
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Male/female share of the current population, in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GenderRatio {
    pub male: f64,
    pub female: f64,
}

/// A predicted congestion level and population range at a future time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub at: DateTime<Utc>,
    pub congestion_level: CongestionLevel,
    pub population_min: u64,
    pub population_max: u64,
}

/// One point-in-time capture of a location's population data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSnapshot {
    pub location_id: String,
    pub display_name: String,
    /// Upstream area code (e.g. "POI014"), when reported.
    pub area_code: Option<String>,
    pub captured_at: DateTime<Utc>,
    pub congestion_level: CongestionLevel,
    pub congestion_message: Option<String>,
    pub population_min: u64,
    pub population_max: u64,
    /// Percentage per bracket. Brackets are independent and need not sum to 100.
    pub age_groups: BTreeMap<AgeBracket, f64>,
    pub gender: GenderRatio,
    /// Upstream's own "last updated" stamp, as reported.
    pub updated_at: Option<String>,
    pub forecast: Option<Vec<ForecastPoint>>,
}

impl LocationSnapshot {
    /// Percentage of the crowd in the given bracket, 0 when unreported.
    pub fn age_rate(&self, bracket: AgeBracket) -> f64 {
        self.age_groups.get(&bracket).copied().unwrap_or(0.0)
    }

    pub fn has_forecast(&self) -> bool {
        self.forecast.as_ref().is_some_and(|f| !f.is_empty())
    }

    /// The bracket with the largest share of the crowd.
    pub fn dominant_age_bracket(&self) -> Option<AgeBracket> {
        self.age_groups
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(bracket, _)| *bracket)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Snapshot with the given level and a single populated age bracket.
    pub fn snapshot(id: &str, level: CongestionLevel, bracket: AgeBracket, rate: f64) -> LocationSnapshot {
        let mut age_groups = BTreeMap::new();
        age_groups.insert(bracket, rate);
        LocationSnapshot {
            location_id: id.to_string(),
            display_name: id.to_string(),
            area_code: None,
            captured_at: Utc::now(),
            congestion_level: level,
            congestion_message: None,
            population_min: 1000,
            population_max: 2000,
            age_groups,
            gender: GenderRatio { male: 50.0, female: 50.0 },
            updated_at: None,
            forecast: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_congestion_parse_korean_and_english() {
        assert_eq!(CongestionLevel::parse("여유"), Some(CongestionLevel::Calm));
        assert_eq!(CongestionLevel::parse("약간 붐빔"), Some(CongestionLevel::SlightlyBusy));
        assert_eq!(CongestionLevel::parse("매우 붐빔"), Some(CongestionLevel::VeryBusy));
        assert_eq!(CongestionLevel::parse("Slightly Busy"), Some(CongestionLevel::SlightlyBusy));
        assert_eq!(CongestionLevel::parse("very_busy"), Some(CongestionLevel::VeryBusy));
        assert_eq!(CongestionLevel::parse("packed"), None);
    }

    #[test]
    fn test_congestion_ordering_and_quietness() {
        assert!(CongestionLevel::Calm < CongestionLevel::VeryBusy);
        assert!(CongestionLevel::Normal.is_quiet());
        assert!(!CongestionLevel::SlightlyBusy.is_quiet());
        assert_eq!(CongestionLevel::Busy.order(), 3);
    }

    #[test]
    fn test_age_bracket_keys() {
        assert_eq!(AgeBracket::from_key("20s"), Some(AgeBracket::Twenties));
        assert_eq!(AgeBracket::from_key("0"), Some(AgeBracket::Under10));
        assert_eq!("70s".parse::<AgeBracket>(), Ok(AgeBracket::SeventiesPlus));
        assert!("80s".parse::<AgeBracket>().is_err());
    }

    #[test]
    fn test_age_groups_serialize_with_upstream_keys() {
        let snap = fixtures::snapshot("A", CongestionLevel::Calm, AgeBracket::Twenties, 35.0);
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["age_groups"]["20s"], 35.0);
        assert_eq!(json["congestion_level"], "calm");
    }

    #[test]
    fn test_age_rate_and_dominant_bracket() {
        let mut snap = fixtures::snapshot("A", CongestionLevel::Calm, AgeBracket::Twenties, 35.0);
        snap.age_groups.insert(AgeBracket::Thirties, 22.5);
        assert_eq!(snap.age_rate(AgeBracket::Twenties), 35.0);
        assert_eq!(snap.age_rate(AgeBracket::Sixties), 0.0);
        assert_eq!(snap.dominant_age_bracket(), Some(AgeBracket::Twenties));
    }
}
