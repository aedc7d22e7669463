use std::collections::BTreeSet;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

use crate::{
    errors::ParameterError,
    model::{CategoryScores, GeoTag, RiskVector, SymptomCategory},
};

/// Severity band assigned to a flagged category. A flag says "present, severity
/// unknown", so the weight is drawn from `[weight_floor, weight_ceiling)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VectorizerConfig {
    pub weight_floor: f64,
    pub weight_ceiling: f64,
}

impl Default for VectorizerConfig {
    fn default() -> Self {
        Self {
            weight_floor: 0.5,
            weight_ceiling: 1.0,
        }
    }
}

impl VectorizerConfig {
    pub fn validate(&self) -> Result<(), ParameterError> {
        let Self {
            weight_floor: floor,
            weight_ceiling: ceiling,
        } = *self;
        if floor >= 0.0 && floor < ceiling && ceiling <= 1.0 {
            Ok(())
        } else {
            Err(ParameterError::InvalidWeights { floor, ceiling })
        }
    }
}

/// Turns a symptom selection into a bounded score vector on the contributor
/// side. Holds no record of past selections.
pub struct RiskVectorizer {
    config: VectorizerConfig,
    rng: ChaCha20Rng,
}

impl RiskVectorizer {
    pub fn new(config: VectorizerConfig, seed: [u8; 32]) -> Result<Self, ParameterError> {
        config.validate()?;
        Ok(Self {
            config,
            rng: ChaCha20Rng::from_seed(seed),
        })
    }

    pub fn from_entropy(config: VectorizerConfig) -> Result<Self, ParameterError> {
        config.validate()?;
        Ok(Self {
            config,
            rng: ChaCha20Rng::from_entropy(),
        })
    }

    pub fn vectorize(
        &mut self,
        selected: &BTreeSet<SymptomCategory>,
        geo_tag: GeoTag,
        timestamp_ms: u64,
    ) -> RiskVector {
        let VectorizerConfig {
            weight_floor,
            weight_ceiling,
        } = self.config;
        let scores = CategoryScores::from_fn(|category| {
            if selected.contains(&category) {
                self.rng.gen_range(weight_floor..weight_ceiling)
            } else {
                0.0
            }
        });
        RiskVector::assemble(scores, timestamp_ms, geo_tag)
    }
}
