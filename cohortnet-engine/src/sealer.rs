use blake3::Hasher;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::debug;

use crate::{
    config::check_epsilon,
    dp::{NoiseConfig, NoiseMechanism},
    errors::ParameterError,
    model::{now_ms, CategoryScores, RiskVector, SymptomCategory},
    snapshot::{CohortId, CohortSnapshot},
};

/// Folds a complete cohort into a noised, sealed snapshot. Keeps no record of
/// the cohorts it has sealed; the only state is its random sources.
pub struct SnapshotSealer {
    noise: NoiseMechanism,
    ids: ChaCha20Rng,
}

impl SnapshotSealer {
    /// Noise and id nonces come from independent streams derived from `seed`.
    pub fn new(config: &NoiseConfig, seed: [u8; 32]) -> Self {
        Self {
            noise: NoiseMechanism::new(config, derive_seed(&seed, b"noise")),
            ids: ChaCha20Rng::from_seed(derive_seed(&seed, b"ids")),
        }
    }

    pub fn from_entropy(config: &NoiseConfig) -> Self {
        Self {
            noise: NoiseMechanism::from_entropy(config),
            ids: ChaCha20Rng::from_entropy(),
        }
    }

    pub fn noise(&self) -> &NoiseMechanism {
        &self.noise
    }

    pub fn seal(
        &mut self,
        vectors: &[RiskVector],
        epsilon: f64,
    ) -> Result<CohortSnapshot, ParameterError> {
        check_epsilon(epsilon)?;
        if vectors.is_empty() {
            return Err(ParameterError::EmptyCohort);
        }
        let size = vectors.len();
        // One contributor moves a mean of n unit-bounded scores by at most 1/n.
        let sensitivity = 1.0 / size as f64;

        let mut means = [0.0; SymptomCategory::COUNT];
        for category in SymptomCategory::ALL {
            let sum: f64 = vectors.iter().map(|v| v.score(category)).sum();
            means[category.index()] = (sum / size as f64).clamp(0.0, 1.0);
        }
        let mut noised = [0.0; SymptomCategory::COUNT];
        for category in SymptomCategory::ALL {
            let mean = means[category.index()];
            noised[category.index()] =
                self.noise
                    .perturb_with_sensitivity(mean, sensitivity, epsilon)?;
        }
        let aggregate = CategoryScores::from_fn(|category| noised[category.index()]);

        let sealed_at_ms = now_ms();
        let id = CohortId::new(sealed_at_ms, self.ids.next_u64());
        debug!(cohort = %id, size, epsilon, "sealing cohort");
        Ok(CohortSnapshot::seal(id, sealed_at_ms, size, aggregate, epsilon))
    }
}

pub(crate) fn derive_seed(seed: &[u8; 32], label: &[u8]) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(b"cohortnet/seed/");
    hasher.update(label);
    hasher.update(seed);
    let mut out = [0u8; 32];
    out.copy_from_slice(hasher.finalize().as_bytes());
    out
}
