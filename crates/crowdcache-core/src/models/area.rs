//! The directory of known locations and how names are matched against it.
//!
//! The proxy's `/areas` endpoint returns a fixed list of locations and
//! categories. Search keywords are derived locally from each name and are
//! never persisted.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

/// Maximum number of search results returned.
const MAX_SEARCH_RESULTS: usize = 7;

/// Names the upstream API does not recognize, mapped to names it does.
const NAME_ALIASES: &[(&str, &str)] = &[
    ("동대문 시장", "동대문 관광특구"),
    ("남대문 시장", "남대문시장"),
    ("광장 시장", "광장(전통)시장"),
    ("홍대입구역", "홍대입구역(2호선)"),
    ("홍대입구", "홍대입구역(2호선)"),
    ("홍대역", "홍대입구역(2호선)"),
];

/// When a name fragment returns no data, retry with the tourist-zone name.
const NOT_FOUND_FALLBACKS: &[(&str, &str)] = &[
    ("동대문", "동대문 관광특구"),
    ("명동", "명동 관광특구"),
    ("강남", "강남 MICE 관광특구"),
];

const TOURIST_ZONE_SUFFIX: &str = "관광특구";

/// Extra keywords added when a location name contains the key.
const KEYWORD_ALIASES: &[(&str, &[&str])] = &[
    ("강남", &["강남역", "강남구", "강남구청", "강남 mice"]),
    ("홍대", &["홍대입구역", "홍대입구", "홍익대", "홍익대학교"]),
    ("명동", &["명동역", "명동입구"]),
    ("이태원", &["이태원역", "이태원입구"]),
    ("동대문", &["동대문역", "동대문역사문화공원", "동대문디자인플라자"]),
    ("잠실", &["잠실역", "잠실새내", "잠실롯데타워", "롯데월드타워"]),
    ("종로", &["종로구", "종각역", "종로1가", "종로2가", "종로3가", "종로5가"]),
    ("청계", &["청계천", "청계광장"]),
    ("광화문", &["광화문역", "광화문광장", "광화문사거리"]),
    ("서울역", &["서울스퀘어", "남대문"]),
];

/// Apply the known alias table to a user-supplied location name.
pub fn resolve_alias(name: &str) -> &str {
    let trimmed = name.trim();
    NAME_ALIASES
        .iter()
        .find(|(from, _)| *from == trimmed)
        .map(|(_, to)| *to)
        .unwrap_or(trimmed)
}

/// Alternative names to try after the upstream reported no data for `name`.
pub fn fallback_names(name: &str) -> Vec<String> {
    if name.contains(TOURIST_ZONE_SUFFIX) {
        return Vec::new();
    }
    NOT_FOUND_FALLBACKS
        .iter()
        .filter(|(fragment, _)| name.contains(fragment))
        .map(|(_, replacement)| replacement.to_string())
        .collect()
}

/// A location category (tourist zone, station, park, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
}

/// A known location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Area {
    pub id: String,
    pub name: String,
    pub category: Option<String>,
    /// Latitude, longitude.
    pub coordinates: Option<(f64, f64)>,
    #[serde(skip)]
    pub keywords: Vec<String>,
}

impl Area {
    pub fn new(id: &str, name: &str, category: &str, coordinates: (f64, f64)) -> Self {
        let mut area = Self {
            id: id.to_string(),
            name: name.to_string(),
            category: Some(category.to_string()),
            coordinates: Some(coordinates),
            keywords: Vec::new(),
        };
        area.keywords = derive_keywords(&area.name);
        area
    }
}

/// Build search keywords from a location name.
fn derive_keywords(name: &str) -> Vec<String> {
    let lower = name.to_lowercase();
    let mut keywords = BTreeSet::new();
    keywords.insert(lower.clone());

    for part in lower.split(|c: char| c.is_whitespace() || matches!(c, '·' | '(' | ')')) {
        if part.chars().count() > 1 {
            keywords.insert(part.to_string());
        }
    }

    for (key, values) in KEYWORD_ALIASES {
        if lower.contains(key) {
            keywords.extend(values.iter().map(|v| v.to_string()));
        }
    }

    keywords.into_iter().collect()
}

/// A scored search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub area: Area,
    pub score: u32,
}

/// Wire shape of the proxy's `/areas` response.
#[derive(Debug, Deserialize)]
pub(crate) struct AreasResponse {
    pub areas: Vec<RawArea>,
    #[serde(default)]
    pub categories: Vec<Category>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawArea {
    pub id: String,
    pub name: String,
    pub category: Option<String>,
    pub coordinates: Option<(f64, f64)>,
}

/// Static reference data: every known location and category.
#[derive(Debug, Clone, Default)]
pub struct AreaDirectory {
    areas: Vec<Area>,
    categories: Vec<Category>,
    by_id: HashMap<String, usize>,
}

impl AreaDirectory {
    pub fn new(areas: Vec<Area>, categories: Vec<Category>) -> Self {
        let by_id = areas
            .iter()
            .enumerate()
            .map(|(i, a)| (a.id.clone(), i))
            .collect();
        Self {
            areas,
            categories,
            by_id,
        }
    }

    pub(crate) fn from_response(response: AreasResponse) -> Self {
        let areas = response
            .areas
            .into_iter()
            .map(|raw| {
                let keywords = derive_keywords(&raw.name);
                Area {
                    id: raw.id,
                    name: raw.name,
                    category: raw.category,
                    coordinates: raw.coordinates,
                    keywords,
                }
            })
            .collect();
        Self::new(areas, response.categories)
    }

    /// The proxy's fixed location list, for use before (or without) a directory fetch.
    pub fn builtin() -> Self {
        let areas = vec![
            Area::new("강남 MICE 관광특구", "강남 MICE 관광특구", "tourist", (37.5065, 127.0617)),
            Area::new("동대문 관광특구", "동대문 관광특구", "tourist", (37.5655, 127.0077)),
            Area::new("명동 관광특구", "명동 관광특구", "tourist", (37.5634, 126.9830)),
            Area::new("이태원 관광특구", "이태원 관광특구", "tourist", (37.5347, 126.9941)),
            Area::new("잠실 관광특구", "잠실 관광특구", "tourist", (37.5132, 127.1001)),
            Area::new("홍대 관광특구", "홍대 관광특구", "tourist", (37.5552, 126.9206)),
            Area::new("경복궁", "경복궁", "heritage", (37.5769, 126.9769)),
            Area::new("광화문·덕수궁", "광화문·덕수궁", "heritage", (37.5725, 126.9769)),
            Area::new("창덕궁·종묘", "창덕궁·종묘", "heritage", (37.5792, 126.9911)),
            Area::new("강남역", "강남역", "station", (37.4982, 127.0279)),
            Area::new("건대입구역", "건대입구역", "station", (37.5407, 127.0694)),
            Area::new("고속터미널역", "고속터미널역", "station", (37.5046, 127.0047)),
            Area::new("사당역", "사당역", "station", (37.4766, 126.9816)),
            Area::new("서울역", "서울역", "station", (37.5561, 126.9715)),
            Area::new("신촌·이대역", "신촌·이대역", "station", (37.5568, 126.9421)),
            Area::new("잠실역", "잠실역", "station", (37.5132, 127.1001)),
            Area::new("홍대입구역(2호선)", "홍대입구역(2호선)", "station", (37.5574, 126.9245)),
            Area::new("가로수길", "가로수길", "shopping", (37.5218, 127.0232)),
            Area::new("여의도", "여의도", "shopping", (37.5219, 126.9245)),
            Area::new("남산공원", "남산공원", "park", (37.5512, 126.9882)),
            Area::new("여의도한강공원", "여의도한강공원", "park", (37.5284, 126.9327)),
            Area::new("올림픽공원", "올림픽공원", "park", (37.5221, 127.1214)),
        ];
        let categories = vec![
            Category { id: "tourist".into(), name: "관광특구".into() },
            Category { id: "heritage".into(), name: "고궁·문화유산".into() },
            Category { id: "station".into(), name: "주요역".into() },
            Category { id: "shopping".into(), name: "발달상권".into() },
            Category { id: "park".into(), name: "공원".into() },
        ];
        Self::new(areas, categories)
    }

    pub fn areas(&self) -> &[Area] {
        &self.areas
    }

    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    pub fn get(&self, id: &str) -> Option<&Area> {
        self.by_id.get(id).map(|&i| &self.areas[i])
    }

    pub fn category_of(&self, id: &str) -> Option<&str> {
        self.get(id).and_then(|a| a.category.as_deref())
    }

    /// Location id -> category id, for every area with a category.
    pub fn category_map(&self) -> HashMap<String, String> {
        self.areas
            .iter()
            .filter_map(|a| a.category.clone().map(|c| (a.id.clone(), c)))
            .collect()
    }

    /// Resolve free text to a directory id: alias table first, then exact
    /// name, then the best search hit.
    pub fn resolve(&self, text: &str) -> Option<&Area> {
        let name = resolve_alias(text);
        if let Some(area) = self.get(name) {
            return Some(area);
        }
        if let Some(area) = self.areas.iter().find(|a| a.name == name) {
            return Some(area);
        }
        self.search(name)
            .into_iter()
            .next()
            .and_then(|hit| self.get(&hit.area.id))
    }

    /// Score every area against the search text.
    ///
    /// Exact name match scores 100, name containment 70, exact keyword 50 and
    /// partial keyword overlap 30. Zero-score areas are dropped and at most
    /// seven results are returned, best first.
    pub fn search(&self, text: &str) -> Vec<SearchResult> {
        let query = text.trim().to_lowercase();
        if query.is_empty() {
            return Vec::new();
        }

        let mut results: Vec<SearchResult> = self
            .areas
            .iter()
            .filter_map(|area| {
                let name = area.name.to_lowercase();
                let score = if name == query {
                    100
                } else if name.contains(&query) {
                    70
                } else if area.keywords.iter().any(|k| *k == query) {
                    50
                } else if area
                    .keywords
                    .iter()
                    .any(|k| k.contains(&query) || query.contains(k.as_str()))
                {
                    30
                } else {
                    0
                };
                (score > 0).then(|| SearchResult {
                    area: area.clone(),
                    score,
                })
            })
            .collect();

        // Stable sort keeps directory order among equal scores
        results.sort_by(|a, b| b.score.cmp(&a.score));
        results.truncate(MAX_SEARCH_RESULTS);
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_alias() {
        assert_eq!(resolve_alias("홍대입구"), "홍대입구역(2호선)");
        assert_eq!(resolve_alias(" 동대문 시장 "), "동대문 관광특구");
        assert_eq!(resolve_alias("서울역"), "서울역");
    }

    #[test]
    fn test_fallback_names() {
        assert_eq!(fallback_names("동대문"), vec!["동대문 관광특구".to_string()]);
        assert_eq!(fallback_names("강남 일대"), vec!["강남 MICE 관광특구".to_string()]);
        assert!(fallback_names("명동 관광특구").is_empty());
        assert!(fallback_names("서울역").is_empty());
    }

    #[test]
    fn test_derive_keywords_splits_and_aliases() {
        let keywords = derive_keywords("광화문·덕수궁");
        assert!(keywords.contains(&"광화문·덕수궁".to_string()));
        assert!(keywords.contains(&"광화문".to_string()));
        assert!(keywords.contains(&"덕수궁".to_string()));
        assert!(keywords.contains(&"광화문광장".to_string()));
    }

    #[test]
    fn test_search_scoring_order() {
        let dir = AreaDirectory::builtin();

        let exact = dir.search("서울역");
        assert_eq!(exact[0].area.id, "서울역");
        assert_eq!(exact[0].score, 100);

        let contains = dir.search("홍대");
        assert_eq!(contains[0].score, 70);
        assert!(contains.iter().any(|r| r.area.id == "홍대입구역(2호선)"));

        let keyword = dir.search("롯데월드타워");
        assert!(keyword.iter().all(|r| r.score == 50));
        assert!(keyword.iter().any(|r| r.area.id == "잠실 관광특구"));

        assert!(dir.search("   ").is_empty());
        assert!(dir.search("zzz").is_empty());
    }

    #[test]
    fn test_search_caps_results() {
        let dir = AreaDirectory::builtin();
        assert!(dir.search("역").len() <= MAX_SEARCH_RESULTS);
    }

    #[test]
    fn test_resolve_prefers_alias_then_name() {
        let dir = AreaDirectory::builtin();
        assert_eq!(dir.resolve("홍대역").map(|a| a.id.as_str()), Some("홍대입구역(2호선)"));
        assert_eq!(dir.resolve("남산공원").map(|a| a.id.as_str()), Some("남산공원"));
        assert_eq!(dir.category_of("남산공원"), Some("park"));
        assert!(dir.resolve("nowhere").is_none());
    }

    #[test]
    fn test_from_response_derives_keywords() {
        let response: AreasResponse = serde_json::from_str(
            r#"{"areas":[{"id":"서울역","name":"서울역","category":"station","coordinates":[37.5,126.9]}],
                "categories":[{"id":"station","name":"주요역"}]}"#,
        )
        .unwrap();
        let dir = AreaDirectory::from_response(response);
        assert_eq!(dir.areas().len(), 1);
        assert!(dir.areas()[0].keywords.contains(&"서울스퀘어".to_string()));
        assert_eq!(dir.categories()[0].id, "station");
    }
}
