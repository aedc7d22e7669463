use std::mem;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    config::{check_epsilon, CohortConfig},
    errors::{CohortNetResult, ParameterError},
    model::RiskVector,
    sealer::SnapshotSealer,
    snapshot::CohortSnapshot,
};

/// A sealed snapshot together with the raw vectors folded into it. The caller
/// holds the contributors only until the snapshot is durably stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SealedCohort {
    pub snapshot: CohortSnapshot,
    pub contributors: Vec<RiskVector>,
}

#[derive(Clone, Debug)]
pub enum AdmitResult {
    Buffered { pending: usize },
    Sealed(SealedCohort),
}

impl AdmitResult {
    pub fn sealed(&self) -> Option<&CohortSnapshot> {
        match self {
            AdmitResult::Sealed(cohort) => Some(&cohort.snapshot),
            AdmitResult::Buffered { .. } => None,
        }
    }
}

struct BufferState {
    pending: Vec<RiskVector>,
    sealer: SnapshotSealer,
}

/// Accumulates vectors for the open cohort. `admit` is the single
/// synchronization point: append, threshold check, drain and seal all happen
/// under one lock, so a contributor is sealed exactly once.
pub struct CohortBuffer {
    threshold: usize,
    epsilon: f64,
    state: Mutex<BufferState>,
}

impl CohortBuffer {
    pub fn new(config: &CohortConfig, sealer: SnapshotSealer) -> Result<Self, ParameterError> {
        Self::with_threshold(config.cohort_threshold, config.epsilon, sealer)
    }

    pub fn with_threshold(
        threshold: usize,
        epsilon: f64,
        sealer: SnapshotSealer,
    ) -> Result<Self, ParameterError> {
        if threshold == 0 {
            return Err(ParameterError::ZeroThreshold);
        }
        check_epsilon(epsilon)?;
        Ok(Self {
            threshold,
            epsilon,
            state: Mutex::new(BufferState {
                pending: Vec::with_capacity(threshold),
                sealer,
            }),
        })
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Copy of the open cohort in contribution order, for checkpointing.
    pub fn pending_snapshot(&self) -> Vec<RiskVector> {
        self.state.lock().pending.clone()
    }

    pub fn admit(&self, vector: RiskVector) -> CohortNetResult<AdmitResult> {
        if let Err(err) = vector.validate() {
            warn!(category = %err.category, score = err.score, "rejecting malformed risk vector");
            return Err(err.into());
        }
        let mut state = self.state.lock();
        state.pending.push(vector);
        if state.pending.len() < self.threshold {
            let pending = state.pending.len();
            debug!(pending, threshold = self.threshold, "vector buffered");
            return Ok(AdmitResult::Buffered { pending });
        }
        Ok(AdmitResult::Sealed(self.drain_and_seal(&mut state)?))
    }

    /// Rehydrates the open cohort from durable storage. A restored set that
    /// already meets the threshold is sealed right away.
    pub fn restore(&self, vectors: Vec<RiskVector>) -> CohortNetResult<Option<SealedCohort>> {
        for vector in &vectors {
            vector.validate()?;
        }
        let mut state = self.state.lock();
        state.pending.extend(vectors);
        info!(pending = state.pending.len(), "restored open cohort");
        if state.pending.len() < self.threshold {
            return Ok(None);
        }
        Ok(Some(self.drain_and_seal(&mut state)?))
    }

    fn drain_and_seal(&self, state: &mut BufferState) -> Result<SealedCohort, ParameterError> {
        let contributors = mem::take(&mut state.pending);
        match state.sealer.seal(&contributors, self.epsilon) {
            Ok(snapshot) => {
                info!(
                    cohort = %snapshot.id(),
                    size = snapshot.size(),
                    "cohort threshold reached, snapshot sealed"
                );
                Ok(SealedCohort {
                    snapshot,
                    contributors,
                })
            }
            Err(err) => {
                state.pending = contributors;
                Err(err)
            }
        }
    }
}
