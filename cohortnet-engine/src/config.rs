use serde::{Deserialize, Serialize};

use crate::{
    dp::NoiseConfig,
    errors::ParameterError,
    model::MAX_GEO_PRECISION,
    vectorizer::VectorizerConfig,
};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EngineConfig {
    #[serde(default)]
    pub cohort: CohortConfig,
    #[serde(default)]
    pub noise: NoiseConfig,
    #[serde(default)]
    pub vectorizer: VectorizerConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ParameterError> {
        self.cohort.validate()?;
        self.noise.validate()?;
        self.vectorizer.validate()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CohortConfig {
    /// Minimum contributors before a cohort is sealed.
    #[serde(default = "default_cohort_threshold")]
    pub cohort_threshold: usize,
    /// Privacy budget spent on every sealed snapshot.
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    #[serde(default = "default_geo_precision")]
    pub geo_precision: usize,
    #[serde(default = "default_allow_empty")]
    pub allow_empty_contributions: bool,
}

const fn default_cohort_threshold() -> usize {
    5
}

const fn default_epsilon() -> f64 {
    0.8
}

const fn default_geo_precision() -> usize {
    3
}

const fn default_allow_empty() -> bool {
    true
}

impl Default for CohortConfig {
    fn default() -> Self {
        Self {
            cohort_threshold: default_cohort_threshold(),
            epsilon: default_epsilon(),
            geo_precision: default_geo_precision(),
            allow_empty_contributions: default_allow_empty(),
        }
    }
}

impl CohortConfig {
    pub fn validate(&self) -> Result<(), ParameterError> {
        if self.cohort_threshold == 0 {
            return Err(ParameterError::ZeroThreshold);
        }
        check_epsilon(self.epsilon)?;
        if self.geo_precision == 0 || self.geo_precision > MAX_GEO_PRECISION {
            return Err(ParameterError::GeoPrecision {
                got: self.geo_precision,
                max: MAX_GEO_PRECISION,
            });
        }
        Ok(())
    }
}

pub(crate) fn check_epsilon(epsilon: f64) -> Result<(), ParameterError> {
    if epsilon.is_finite() && epsilon > 0.0 {
        Ok(())
    } else {
        Err(ParameterError::NonPositiveEpsilon(epsilon))
    }
}
