//! Read model for observers of published cohorts: per-snapshot privacy
//! figures, the community intensity timeline and integrity checks.

use serde::Serialize;

use crate::{
    dp::NoiseKind,
    errors::ParameterError,
    snapshot::{CohortId, CohortSnapshot, IntegrityMismatch},
};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PrivacyMetrics {
    /// Noise scale applied to each category mean (Laplace `b` or Gaussian sigma).
    pub noise_scale: f64,
    /// Number of contributors a released aggregate hides each one among.
    pub anonymity_set: usize,
    pub epsilon: f64,
}

impl PrivacyMetrics {
    pub fn for_snapshot(
        snapshot: &CohortSnapshot,
        mechanism: &NoiseKind,
    ) -> Result<Self, ParameterError> {
        let sensitivity = 1.0 / snapshot.size().max(1) as f64;
        Ok(Self {
            noise_scale: mechanism.scale(sensitivity, snapshot.epsilon())?,
            anonymity_set: snapshot.size(),
            epsilon: snapshot.epsilon(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TimelinePoint {
    pub id: CohortId,
    pub sealed_at_ms: u64,
    pub intensity: f64,
}

/// One point per snapshot in seal order; intensity is the mean released score.
pub fn timeline(snapshots: &[CohortSnapshot]) -> Vec<TimelinePoint> {
    let mut points: Vec<_> = snapshots
        .iter()
        .map(|snapshot| TimelinePoint {
            id: snapshot.id().clone(),
            sealed_at_ms: snapshot.sealed_at_ms(),
            intensity: snapshot.aggregate_scores().mean(),
        })
        .collect();
    points.sort_by(|a, b| (a.sealed_at_ms, &a.id).cmp(&(b.sealed_at_ms, &b.id)));
    points
}

pub fn latest(snapshots: &[CohortSnapshot]) -> Option<&CohortSnapshot> {
    snapshots
        .iter()
        .max_by(|a, b| (a.sealed_at_ms(), a.id()).cmp(&(b.sealed_at_ms(), b.id())))
}

pub fn find<'a>(snapshots: &'a [CohortSnapshot], id: &str) -> Option<&'a CohortSnapshot> {
    snapshots.iter().find(|snapshot| snapshot.id().as_str() == id)
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct IntegrityReport {
    pub verified: usize,
    pub failures: Vec<IntegrityMismatch>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub fn verify_all(snapshots: &[CohortSnapshot]) -> IntegrityReport {
    let mut report = IntegrityReport::default();
    for snapshot in snapshots {
        match snapshot.verify_integrity() {
            Ok(()) => report.verified += 1,
            Err(mismatch) => report.failures.push(mismatch),
        }
    }
    report
}
