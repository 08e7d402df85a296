use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::AgeBracket;

/// What the user is looking for in a recommended place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPreferences {
    pub prefer_quiet: bool,
    pub preferred_age_bracket: AgeBracket,
    /// Category ids from the area directory. Empty means no category preference.
    #[serde(default)]
    pub preferred_categories: BTreeSet<String>,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            prefer_quiet: true,
            preferred_age_bracket: AgeBracket::Twenties,
            preferred_categories: BTreeSet::new(),
        }
    }
}

impl UserPreferences {
    pub fn wants_category(&self, category: &str) -> bool {
        self.preferred_categories.contains(category)
    }
}
