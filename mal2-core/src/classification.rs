//! Classification categories and per-category outcomes.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

/// Wire value reported for a category that has no classifier behind it.
///
/// Lies outside `[0, 1]` so it can never be mistaken for a genuine probability.
pub const NOT_COMPUTED_SENTINEL: f64 = -1.0;

/// Classification categories reported for every artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum Category {
    #[serde(rename = "contains_malware")]
    Malware,
    #[serde(rename = "contains_trackers")]
    Trackers,
    #[serde(rename = "contains_adware")]
    Adware,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Malware, Category::Trackers, Category::Adware];

    /// Name used as the key in the response `classification` map.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Malware => "contains_malware",
            Category::Trackers => "contains_trackers",
            Category::Adware => "contains_adware",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one category.
///
/// Serialized as a bare float: a probability, or [`NOT_COMPUTED_SENTINEL`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CategoryScore {
    Probability(f64),
    NotComputed,
}

impl CategoryScore {
    /// Build a probability score, rejecting anything outside `[0, 1]` (including NaN).
    pub fn probability(value: f64) -> Option<Self> {
        if (0.0..=1.0).contains(&value) {
            Some(CategoryScore::Probability(value))
        } else {
            None
        }
    }

    pub fn is_computed(&self) -> bool {
        matches!(self, CategoryScore::Probability(_))
    }

    pub fn as_probability(&self) -> Option<f64> {
        match self {
            CategoryScore::Probability(p) => Some(*p),
            CategoryScore::NotComputed => None,
        }
    }

    pub fn wire_value(&self) -> f64 {
        match self {
            CategoryScore::Probability(p) => *p,
            CategoryScore::NotComputed => NOT_COMPUTED_SENTINEL,
        }
    }

    /// Parse a wire value. Anything that is neither the sentinel nor in `[0, 1]` is rejected.
    pub fn from_wire(value: f64) -> Option<Self> {
        if value == NOT_COMPUTED_SENTINEL {
            Some(CategoryScore::NotComputed)
        } else {
            CategoryScore::probability(value)
        }
    }
}

impl Serialize for CategoryScore {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.wire_value())
    }
}

impl<'de> Deserialize<'de> for CategoryScore {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        CategoryScore::from_wire(value).ok_or_else(|| {
            de::Error::custom(format!(
                "category score {} is neither a probability nor the not-computed sentinel",
                value
            ))
        })
    }
}

/// Per-category outcomes for one artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Classification(BTreeMap<Category, CategoryScore>);

impl Classification {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, category: Category, score: CategoryScore) {
        self.0.insert(category, score);
    }

    pub fn with(mut self, category: Category, score: CategoryScore) -> Self {
        self.set(category, score);
        self
    }

    /// Score for `category`; a category that was never set reads as not computed.
    pub fn get(&self, category: Category) -> CategoryScore {
        self.0
            .get(&category)
            .copied()
            .unwrap_or(CategoryScore::NotComputed)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Category, CategoryScore)> + '_ {
        self.0.iter().map(|(c, s)| (*c, *s))
    }

    /// Response shape: category name to float.
    pub fn to_wire(&self) -> BTreeMap<String, f64> {
        Category::ALL
            .iter()
            .map(|c| (c.as_str().to_string(), self.get(*c).wire_value()))
            .collect()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probability_rejects_out_of_range() {
        assert!(CategoryScore::probability(0.0).is_some());
        assert!(CategoryScore::probability(1.0).is_some());
        assert!(CategoryScore::probability(-0.01).is_none());
        assert!(CategoryScore::probability(1.01).is_none());
        assert!(CategoryScore::probability(f64::NAN).is_none());
    }

    #[test]
    fn test_sentinel_outside_unit_interval() {
        assert!(!(0.0..=1.0).contains(&NOT_COMPUTED_SENTINEL));
        assert_eq!(CategoryScore::NotComputed.wire_value(), NOT_COMPUTED_SENTINEL);
        assert_eq!(
            CategoryScore::from_wire(NOT_COMPUTED_SENTINEL),
            Some(CategoryScore::NotComputed)
        );
    }

    #[test]
    fn test_unset_category_reads_not_computed() {
        let classification =
            Classification::new().with(Category::Malware, CategoryScore::Probability(0.2));
        assert_eq!(classification.get(Category::Adware), CategoryScore::NotComputed);
        let wire = classification.to_wire();
        assert_eq!(wire["contains_malware"], 0.2);
        assert_eq!(wire["contains_trackers"], NOT_COMPUTED_SENTINEL);
        assert_eq!(wire["contains_adware"], NOT_COMPUTED_SENTINEL);
    }

    #[test]
    fn test_json_shape() -> Result<(), serde_json::Error> {
        let classification = Classification::new()
            .with(Category::Malware, CategoryScore::Probability(0.75))
            .with(Category::Trackers, CategoryScore::NotComputed);
        let json = serde_json::to_value(&classification)?;
        assert_eq!(json["contains_malware"], 0.75);
        assert_eq!(json["contains_trackers"], -1.0);

        let parsed: Classification = serde_json::from_value(json)?;
        assert_eq!(parsed, classification);
        Ok(())
    }

    #[test]
    fn test_json_rejects_bogus_score() {
        let parsed: Result<Classification, _> =
            serde_json::from_str(r#"{"contains_malware": 3.5}"#);
        assert!(parsed.is_err());
    }
}
