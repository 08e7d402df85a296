//! Wire shapes of the proxy's population endpoint and their validation.
//!
//! Nothing from the proxy is trusted field-by-field: a place record either
//! converts into a complete `LocationSnapshot` or the whole response is
//! rejected as `MalformedResponse`.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;

use super::ApiError;
use crate::models::{AgeBracket, CongestionLevel, ForecastPoint, GenderRatio, LocationSnapshot};

/// Time format used by the upstream API for local timestamps.
const UPSTREAM_TIME_FORMAT: &str = "%Y-%m-%d %H:%M";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PopulationResponse {
    pub timestamp: Option<String>,
    pub total_count: Option<u64>,
    #[serde(default)]
    pub places: Vec<RawPlace>,
}

#[derive(Debug, Deserialize)]
pub struct RawGender {
    pub male: Option<f64>,
    pub female: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawForecast {
    pub time: Option<String>,
    pub congestion_level: Option<String>,
    pub population_min: Option<f64>,
    pub population_max: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPlace {
    pub id: Option<String>,
    pub name: Option<String>,
    pub congestion_level: Option<String>,
    pub congestion_message: Option<String>,
    pub population_min: Option<f64>,
    pub population_max: Option<f64>,
    pub gender: Option<RawGender>,
    pub age_groups: Option<HashMap<String, f64>>,
    pub updated_at: Option<String>,
    #[serde(default)]
    pub has_forecast: bool,
    #[serde(default)]
    pub forecast: Vec<RawForecast>,
}

fn malformed(msg: impl Into<String>) -> ApiError {
    ApiError::MalformedResponse(msg.into())
}

fn percentage(field: &str, value: Option<f64>) -> Result<f64, ApiError> {
    match value {
        Some(v) if v.is_finite() && (0.0..=100.0).contains(&v) => Ok(v),
        Some(v) => Err(malformed(format!("{} out of range: {}", field, v))),
        None => Err(malformed(format!("missing {}", field))),
    }
}

fn population_range(min: Option<f64>, max: Option<f64>) -> Result<(u64, u64), ApiError> {
    let min = min.ok_or_else(|| malformed("missing populationMin"))?;
    let max = max.ok_or_else(|| malformed("missing populationMax"))?;
    if !min.is_finite() || !max.is_finite() || min < 0.0 || max < min {
        return Err(malformed(format!("invalid population range {}..{}", min, max)));
    }
    Ok((min.round() as u64, max.round() as u64))
}

/// Parse an upstream timestamp: RFC 3339, or the API's local "YYYY-MM-DD HH:MM".
pub fn parse_upstream_time(s: &str, offset: FixedOffset) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(s.trim(), UPSTREAM_TIME_FORMAT).ok()?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

impl RawForecast {
    fn into_point(self, offset: FixedOffset) -> Result<ForecastPoint, ApiError> {
        let time = self.time.ok_or_else(|| malformed("forecast point missing time"))?;
        let at = parse_upstream_time(&time, offset)
            .ok_or_else(|| malformed(format!("unparsable forecast time '{}'", time)))?;
        let level = self
            .congestion_level
            .as_deref()
            .and_then(CongestionLevel::parse)
            .ok_or_else(|| malformed("forecast point has unknown congestion level"))?;
        let (population_min, population_max) =
            population_range(self.population_min, self.population_max)?;
        Ok(ForecastPoint {
            at,
            congestion_level: level,
            population_min,
            population_max,
        })
    }
}

impl RawPlace {
    /// Validate this record into a typed snapshot stored under `location_id`.
    pub fn into_snapshot(
        self,
        location_id: &str,
        captured_at: DateTime<Utc>,
        offset: FixedOffset,
    ) -> Result<LocationSnapshot, ApiError> {
        let display_name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| malformed("place missing name"))?;

        let level_str = self
            .congestion_level
            .ok_or_else(|| malformed("place missing congestionLevel"))?;
        let congestion_level = CongestionLevel::parse(&level_str)
            .ok_or_else(|| malformed(format!("unknown congestion level '{}'", level_str)))?;

        let (population_min, population_max) =
            population_range(self.population_min, self.population_max)?;

        let raw_gender = self.gender.ok_or_else(|| malformed("place missing gender"))?;
        let gender = GenderRatio {
            male: percentage("gender.male", raw_gender.male)?,
            female: percentage("gender.female", raw_gender.female)?,
        };

        let raw_ages = self.age_groups.ok_or_else(|| malformed("place missing ageGroups"))?;
        let mut age_groups = BTreeMap::new();
        for bracket in AgeBracket::ALL {
            let rate = percentage(
                &format!("ageGroups.{}", bracket.key()),
                raw_ages.get(bracket.key()).copied(),
            )?;
            age_groups.insert(bracket, rate);
        }

        let forecast = if self.forecast.is_empty() {
            None
        } else {
            let mut points = self
                .forecast
                .into_iter()
                .map(|f| f.into_point(offset))
                .collect::<Result<Vec<_>, _>>()?;
            points.sort_by_key(|p| p.at);
            Some(points)
        };

        if self.has_forecast && forecast.is_none() {
            tracing::debug!(location = %location_id, "Upstream flagged a forecast but sent no points");
        }

        Ok(LocationSnapshot {
            location_id: location_id.to_string(),
            display_name,
            area_code: self.id,
            captured_at,
            congestion_level,
            congestion_message: self.congestion_message,
            population_min,
            population_max,
            age_groups,
            gender,
            updated_at: self.updated_at,
            forecast,
        })
    }
}

impl PopulationResponse {
    /// Pick the record for the requested name: exact name, then area code,
    /// then the first record. Zero records means upstream has no data.
    pub fn into_place(self, requested: &str) -> Result<RawPlace, ApiError> {
        let mut places = self.places;
        if places.is_empty() {
            return Err(ApiError::NotFound(requested.to_string()));
        }
        let idx = places
            .iter()
            .position(|p| p.name.as_deref() == Some(requested))
            .or_else(|| places.iter().position(|p| p.id.as_deref() == Some(requested)))
            .unwrap_or(0);
        Ok(places.swap_remove(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seoul() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    const SAMPLE: &str = r#"{
        "timestamp": "2024-05-01T05:30:00Z",
        "totalCount": 1,
        "places": [{
            "id": "POI014",
            "name": "서울역",
            "congestionLevel": "약간 붐빔",
            "congestionMessage": "사람이 몰려있을 수 있어요.",
            "populationMin": 32000,
            "populationMax": 34000,
            "gender": {"male": 51.2, "female": 48.8},
            "ageGroups": {"0": 1.2, "10s": 5.1, "20s": 22.4, "30s": 24.0,
                          "40s": 19.3, "50s": 15.2, "60s": 8.9, "70s": 3.6},
            "updatedAt": "2024-05-01 14:30",
            "hasForecast": true,
            "forecast": [
                {"time": "2024-05-01 16:00", "congestionLevel": "붐빔", "populationMin": 36000, "populationMax": 38000},
                {"time": "2024-05-01 15:00", "congestionLevel": "약간 붐빔", "populationMin": 33000, "populationMax": 35000}
            ]
        }]
    }"#;

    #[test]
    fn test_parse_valid_place() {
        let response: PopulationResponse = serde_json::from_str(SAMPLE).unwrap();
        let place = response.into_place("서울역").unwrap();
        let snap = place.into_snapshot("서울역", Utc::now(), seoul()).unwrap();

        assert_eq!(snap.area_code.as_deref(), Some("POI014"));
        assert_eq!(snap.congestion_level, CongestionLevel::SlightlyBusy);
        assert_eq!(snap.population_max, 34000);
        assert_eq!(snap.age_rate(AgeBracket::Twenties), 22.4);

        let forecast = snap.forecast.unwrap();
        assert_eq!(forecast.len(), 2);
        // Sorted by time, converted from +09:00
        assert_eq!(forecast[0].at.to_rfc3339(), "2024-05-01T06:00:00+00:00");
        assert_eq!(forecast[1].congestion_level, CongestionLevel::Busy);
    }

    #[test]
    fn test_empty_places_is_not_found() {
        let response: PopulationResponse = serde_json::from_str(r#"{"places": []}"#).unwrap();
        assert_eq!(
            response.into_place("어딘가").unwrap_err(),
            ApiError::NotFound("어딘가".into())
        );
    }

    #[test]
    fn test_unknown_congestion_level_is_malformed() {
        let json = SAMPLE.replacen(r#""congestionLevel": "약간 붐빔""#, r#""congestionLevel": "혼잡""#, 1);
        let response: PopulationResponse = serde_json::from_str(&json).unwrap();
        let err = response
            .into_place("서울역")
            .unwrap()
            .into_snapshot("서울역", Utc::now(), seoul())
            .unwrap_err();
        assert!(matches!(err, ApiError::MalformedResponse(_)));
    }

    #[test]
    fn test_missing_age_bracket_is_malformed() {
        let json = SAMPLE.replace("\"70s\": 3.6", "\"80s\": 3.6");
        let response: PopulationResponse = serde_json::from_str(&json).unwrap();
        let err = response
            .into_place("서울역")
            .unwrap()
            .into_snapshot("서울역", Utc::now(), seoul())
            .unwrap_err();
        assert_eq!(err, ApiError::MalformedResponse("missing ageGroups.70s".into()));
    }

    #[test]
    fn test_inverted_population_range_is_malformed() {
        assert!(population_range(Some(10.0), Some(5.0)).is_err());
        assert!(population_range(Some(-1.0), Some(5.0)).is_err());
        assert_eq!(population_range(Some(5.0), Some(5.0)).unwrap(), (5, 5));
    }

    #[test]
    fn test_parse_upstream_time_formats() {
        let local = parse_upstream_time("2024-05-01 09:00", seoul()).unwrap();
        assert_eq!(local.to_rfc3339(), "2024-05-01T00:00:00+00:00");
        assert!(parse_upstream_time("2024-05-01T00:00:00Z", seoul()).is_some());
        assert!(parse_upstream_time("yesterday", seoul()).is_none());
    }
}
