use std::fmt;

use blake3::Hasher;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{CategoryScores, SymptomCategory};

const TOKEN_DOMAIN: &[u8] = b"cohortnet/snapshot/v1";
const TOKEN_PREFIX: &str = "blake3:";

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CohortId(String);

impl CohortId {
    /// `cohort-<sealed_at_ms>-<nonce>`; lexical order follows seal time.
    pub fn new(sealed_at_ms: u64, nonce: u64) -> Self {
        Self(format!("cohort-{sealed_at_ms:013}-{nonce:016x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CohortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content hash binding a snapshot to its fields. This is a tamper check for
/// observers, not a zero-knowledge proof.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IntegrityToken([u8; 32]);

impl IntegrityToken {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for IntegrityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{TOKEN_PREFIX}{}", hex::encode(self.0))
    }
}

impl From<IntegrityToken> for String {
    fn from(token: IntegrityToken) -> Self {
        token.to_string()
    }
}

impl TryFrom<String> for IntegrityToken {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let digest = value
            .strip_prefix(TOKEN_PREFIX)
            .ok_or_else(|| format!("integrity token must start with {TOKEN_PREFIX}"))?;
        let mut out = [0u8; 32];
        hex::decode_to_slice(digest, &mut out).map_err(|err| err.to_string())?;
        Ok(Self(out))
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("integrity token mismatch for {id}: stored {stored}, computed {computed}")]
pub struct IntegrityMismatch {
    pub id: CohortId,
    pub stored: IntegrityToken,
    pub computed: IntegrityToken,
}

/// A sealed cohort aggregate. There are no mutating methods; once built by the
/// sealer a snapshot only ever moves or gets cloned.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CohortSnapshot {
    id: CohortId,
    sealed_at_ms: u64,
    size: usize,
    aggregate_scores: CategoryScores,
    epsilon: f64,
    sealed: bool,
    integrity_token: IntegrityToken,
}

impl CohortSnapshot {
    pub(crate) fn seal(
        id: CohortId,
        sealed_at_ms: u64,
        size: usize,
        aggregate_scores: CategoryScores,
        epsilon: f64,
    ) -> Self {
        let integrity_token =
            compute_token(&id, sealed_at_ms, size, &aggregate_scores, epsilon, true);
        Self {
            id,
            sealed_at_ms,
            size,
            aggregate_scores,
            epsilon,
            sealed: true,
            integrity_token,
        }
    }

    pub fn id(&self) -> &CohortId {
        &self.id
    }

    pub fn sealed_at_ms(&self) -> u64 {
        self.sealed_at_ms
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn aggregate_scores(&self) -> &CategoryScores {
        &self.aggregate_scores
    }

    pub fn aggregate(&self, category: SymptomCategory) -> f64 {
        self.aggregate_scores.get(category)
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn integrity_token(&self) -> &IntegrityToken {
        &self.integrity_token
    }

    /// Recomputes the token from the current fields. Fails for snapshots that
    /// were edited after sealing, e.g. in a persisted file.
    pub fn verify_integrity(&self) -> Result<(), IntegrityMismatch> {
        let computed = compute_token(
            &self.id,
            self.sealed_at_ms,
            self.size,
            &self.aggregate_scores,
            self.epsilon,
            self.sealed,
        );
        if computed == self.integrity_token {
            Ok(())
        } else {
            Err(IntegrityMismatch {
                id: self.id.clone(),
                stored: self.integrity_token,
                computed,
            })
        }
    }
}

fn compute_token(
    id: &CohortId,
    sealed_at_ms: u64,
    size: usize,
    scores: &CategoryScores,
    epsilon: f64,
    sealed: bool,
) -> IntegrityToken {
    let mut hasher = Hasher::new();
    hasher.update(TOKEN_DOMAIN);
    hasher.update(&(id.as_str().len() as u64).to_le_bytes());
    hasher.update(id.as_str().as_bytes());
    hasher.update(&sealed_at_ms.to_le_bytes());
    hasher.update(&(size as u64).to_le_bytes());
    hasher.update(&epsilon.to_bits().to_le_bytes());
    for (_, score) in scores.iter() {
        hasher.update(&score.to_bits().to_le_bytes());
    }
    hasher.update(&[sealed as u8]);
    let mut out = [0u8; 32];
    out.copy_from_slice(hasher.finalize().as_bytes());
    IntegrityToken(out)
}
