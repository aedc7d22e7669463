use std::{
    collections::BTreeMap,
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::errors::{CohortNetError, ParameterError, VectorError};

/// Coarsest geo precision accepted for a contributor tag (about 5 km cells).
pub const MAX_GEO_PRECISION: usize = 5;

/// Closed set of symptom groups a contributor can flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SymptomCategory {
    Respiratory,
    Gastrointestinal,
    Neurological,
    Dermatological,
    Systemic,
}

impl SymptomCategory {
    /// Canonical order; score arrays, hashing and display all follow it.
    pub const ALL: [SymptomCategory; 5] = [
        SymptomCategory::Respiratory,
        SymptomCategory::Gastrointestinal,
        SymptomCategory::Neurological,
        SymptomCategory::Dermatological,
        SymptomCategory::Systemic,
    ];

    pub const COUNT: usize = Self::ALL.len();

    pub const fn index(self) -> usize {
        match self {
            SymptomCategory::Respiratory => 0,
            SymptomCategory::Gastrointestinal => 1,
            SymptomCategory::Neurological => 2,
            SymptomCategory::Dermatological => 3,
            SymptomCategory::Systemic => 4,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            SymptomCategory::Respiratory => "Respiratory",
            SymptomCategory::Gastrointestinal => "Gastrointestinal",
            SymptomCategory::Neurological => "Neurological",
            SymptomCategory::Dermatological => "Dermatological",
            SymptomCategory::Systemic => "Systemic",
        }
    }
}

impl fmt::Display for SymptomCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for SymptomCategory {
    type Err = CohortNetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        SymptomCategory::ALL
            .into_iter()
            .find(|category| category.as_str().eq_ignore_ascii_case(needle))
            .ok_or_else(|| CohortNetError::UnknownCategory(needle.to_string()))
    }
}

/// One score per category. Coverage is total by construction; the wire form
/// is a map keyed by category name and must list every category.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<SymptomCategory, f64>",
    into = "BTreeMap<SymptomCategory, f64>"
)]
pub struct CategoryScores([f64; SymptomCategory::COUNT]);

impl CategoryScores {
    pub const fn zeroed() -> Self {
        Self([0.0; SymptomCategory::COUNT])
    }

    pub fn from_fn(mut score: impl FnMut(SymptomCategory) -> f64) -> Self {
        let mut values = [0.0; SymptomCategory::COUNT];
        for category in SymptomCategory::ALL {
            values[category.index()] = score(category);
        }
        Self(values)
    }

    pub fn get(&self, category: SymptomCategory) -> f64 {
        self.0[category.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (SymptomCategory, f64)> + '_ {
        SymptomCategory::ALL
            .into_iter()
            .map(move |category| (category, self.get(category)))
    }

    /// Mean across categories; the observer timeline plots this as intensity.
    pub fn mean(&self) -> f64 {
        self.0.iter().sum::<f64>() / SymptomCategory::COUNT as f64
    }

    pub fn validate_unit_range(&self) -> Result<(), VectorError> {
        match self
            .iter()
            .find(|(_, score)| !(0.0..=1.0).contains(score))
        {
            Some((category, score)) => Err(VectorError { category, score }),
            None => Ok(()),
        }
    }
}

impl Default for CategoryScores {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl TryFrom<BTreeMap<SymptomCategory, f64>> for CategoryScores {
    type Error = String;

    fn try_from(map: BTreeMap<SymptomCategory, f64>) -> Result<Self, Self::Error> {
        let mut values = [0.0; SymptomCategory::COUNT];
        for category in SymptomCategory::ALL {
            values[category.index()] = *map
                .get(&category)
                .ok_or_else(|| format!("missing score for {category}"))?;
        }
        Ok(Self(values))
    }
}

impl From<CategoryScores> for BTreeMap<SymptomCategory, f64> {
    fn from(scores: CategoryScores) -> Self {
        scores.iter().collect()
    }
}

/// Lossy location token. Only a short geohash prefix ever leaves the device.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GeoTag(String);

impl GeoTag {
    pub fn coarsen(raw: &str, precision: usize) -> Result<Self, ParameterError> {
        if precision == 0 || precision > MAX_GEO_PRECISION {
            return Err(ParameterError::GeoPrecision {
                got: precision,
                max: MAX_GEO_PRECISION,
            });
        }
        let cell: String = raw
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .map(|c| c.to_ascii_lowercase())
            .take(precision)
            .collect();
        if cell.is_empty() {
            return Ok(Self::unspecified());
        }
        Ok(Self(cell))
    }

    /// Placeholder used when the contributor shares no location at all.
    pub fn unspecified() -> Self {
        Self("ge-7xx".into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for GeoTag {
    fn default() -> Self {
        Self::unspecified()
    }
}

impl fmt::Display for GeoTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single contributor's submission. Raw vectors live only until the cohort
/// they belong to is durably sealed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RiskVector {
    scores: CategoryScores,
    timestamp_ms: u64,
    geo_tag: GeoTag,
}

impl RiskVector {
    pub fn new(
        scores: CategoryScores,
        timestamp_ms: u64,
        geo_tag: GeoTag,
    ) -> Result<Self, VectorError> {
        scores.validate_unit_range()?;
        Ok(Self {
            scores,
            timestamp_ms,
            geo_tag,
        })
    }

    /// Scores drawn from a validated weight band are in range by construction.
    pub(crate) fn assemble(scores: CategoryScores, timestamp_ms: u64, geo_tag: GeoTag) -> Self {
        debug_assert!(scores.validate_unit_range().is_ok());
        Self {
            scores,
            timestamp_ms,
            geo_tag,
        }
    }

    /// Deserialized vectors bypass `new`, so admission re-checks them.
    pub fn validate(&self) -> Result<(), VectorError> {
        self.scores.validate_unit_range()
    }

    pub fn scores(&self) -> &CategoryScores {
        &self.scores
    }

    pub fn score(&self, category: SymptomCategory) -> f64 {
        self.scores.get(category)
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    pub fn geo_tag(&self) -> &GeoTag {
        &self.geo_tag
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
