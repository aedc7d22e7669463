use thiserror::Error;

use crate::{model::SymptomCategory, store::StoreError};

pub type CohortNetResult<T> = Result<T, CohortNetError>;

#[derive(Debug, Error)]
pub enum CohortNetError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(#[from] ParameterError),
    #[error("invalid vector: {0}")]
    InvalidVector(#[from] VectorError),
    #[error("empty symptom selection rejected by configuration")]
    EmptySelection,
    #[error("unknown symptom category: {0}")]
    UnknownCategory(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ParameterError {
    #[error("epsilon must be finite and > 0 (got {0})")]
    NonPositiveEpsilon(f64),
    #[error("noise scale is not finite for epsilon {0}")]
    ScaleOverflow(f64),
    #[error("sensitivity must be finite and > 0 (got {0})")]
    NonPositiveSensitivity(f64),
    #[error("delta must be within (0,1) (got {0})")]
    InvalidDelta(f64),
    #[error("value must be within [0,1] (got {0})")]
    ValueOutOfRange(f64),
    #[error("cannot seal an empty cohort")]
    EmptyCohort,
    #[error("cohort threshold must be at least 1")]
    ZeroThreshold,
    #[error("risk weights must satisfy 0 <= floor < ceiling <= 1 (got [{floor}, {ceiling}))")]
    InvalidWeights { floor: f64, ceiling: f64 },
    #[error("geo precision must be within 1..={max} (got {got})")]
    GeoPrecision { got: usize, max: usize },
}

#[derive(Clone, Debug, Error, PartialEq)]
#[error("score for {category} must be within [0,1] (got {score})")]
pub struct VectorError {
    pub category: SymptomCategory,
    pub score: f64,
}
