//! Differential-privacy noise for bounded aggregates.
//!
//! Every perturbed value is clamped back into `[0,1]`. Clamping is not
//! symmetric at the edges: a true mean of `1.0` can only move down and a true
//! mean of `0.0` can only move up, so released values near the boundaries are
//! biased toward the interior by roughly `scale / 2`. Observers should read
//! boundary aggregates with that in mind.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::{config::check_epsilon, errors::ParameterError};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum NoiseKind {
    /// Pure epsilon-DP, scale `sensitivity / epsilon`.
    #[default]
    Laplace,
    /// (epsilon, delta)-DP with the classic analytic sigma.
    Gaussian { delta: f64 },
}

impl NoiseKind {
    pub fn scale(&self, sensitivity: f64, epsilon: f64) -> Result<f64, ParameterError> {
        check_epsilon(epsilon)?;
        if !(sensitivity.is_finite() && sensitivity > 0.0) {
            return Err(ParameterError::NonPositiveSensitivity(sensitivity));
        }
        let scale = match *self {
            NoiseKind::Laplace => sensitivity / epsilon,
            NoiseKind::Gaussian { delta } => {
                check_delta(delta)?;
                sensitivity * (2.0 * (1.25 / delta).ln()).sqrt() / epsilon
            }
        };
        if !scale.is_finite() {
            return Err(ParameterError::ScaleOverflow(epsilon));
        }
        Ok(scale)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NoiseConfig {
    #[serde(default)]
    pub mechanism: NoiseKind,
}

impl NoiseConfig {
    pub fn validate(&self) -> Result<(), ParameterError> {
        match self.mechanism {
            NoiseKind::Laplace => Ok(()),
            NoiseKind::Gaussian { delta } => check_delta(delta),
        }
    }
}

/// Seeded perturbation source. Identical seeds give identical noise streams.
pub struct NoiseMechanism {
    kind: NoiseKind,
    rng: ChaCha20Rng,
}

impl NoiseMechanism {
    pub fn new(config: &NoiseConfig, seed: [u8; 32]) -> Self {
        Self {
            kind: config.mechanism.clone(),
            rng: ChaCha20Rng::from_seed(seed),
        }
    }

    pub fn from_entropy(config: &NoiseConfig) -> Self {
        Self {
            kind: config.mechanism.clone(),
            rng: ChaCha20Rng::from_entropy(),
        }
    }

    pub fn laplace(seed: [u8; 32]) -> Self {
        Self::new(&NoiseConfig::default(), seed)
    }

    pub fn kind(&self) -> &NoiseKind {
        &self.kind
    }

    /// Perturbs `value` assuming unit sensitivity.
    pub fn perturb(&mut self, value: f64, epsilon: f64) -> Result<f64, ParameterError> {
        self.perturb_with_sensitivity(value, 1.0, epsilon)
    }

    pub fn perturb_with_sensitivity(
        &mut self,
        value: f64,
        sensitivity: f64,
        epsilon: f64,
    ) -> Result<f64, ParameterError> {
        if !(0.0..=1.0).contains(&value) {
            return Err(ParameterError::ValueOutOfRange(value));
        }
        let scale = self.noise_scale(sensitivity, epsilon)?;
        let noise = match self.kind {
            NoiseKind::Laplace => self.sample_laplace(scale),
            NoiseKind::Gaussian { .. } => self.sample_gaussian(scale, epsilon)?,
        };
        Ok((value + noise).clamp(0.0, 1.0))
    }

    /// Laplace `b` or Gaussian `sigma` for the configured mechanism.
    pub fn noise_scale(&self, sensitivity: f64, epsilon: f64) -> Result<f64, ParameterError> {
        self.kind.scale(sensitivity, epsilon)
    }

    fn sample_laplace(&mut self, b: f64) -> f64 {
        let u: f64 = self.rng.gen::<f64>() - 0.5;
        let sign = if u >= 0.0 { 1.0 } else { -1.0 };
        let magnitude = (1.0 - 2.0 * u.abs()).max(1e-12);
        -b * sign * magnitude.ln()
    }

    fn sample_gaussian(&mut self, sigma: f64, epsilon: f64) -> Result<f64, ParameterError> {
        let normal = Normal::new(0.0, sigma).map_err(|_| ParameterError::ScaleOverflow(epsilon))?;
        Ok(normal.sample(&mut self.rng))
    }
}

fn check_delta(delta: f64) -> Result<(), ParameterError> {
    if delta > 0.0 && delta < 1.0 {
        Ok(())
    } else {
        Err(ParameterError::InvalidDelta(delta))
    }
}
