use std::{collections::BTreeSet, sync::Arc};

use chrono::{DateTime, Utc};
use cohortnet_engine::{
    observer, CohortEngine, CohortId, CohortNetError, IntegrityReport, JsonFileStore,
    PrivacyMetrics, StoreError, SubmitOutcome, SymptomCategory,
};
use cohortnet_telemetry::TelemetryHandle;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Config;

/// Coarse cells the simulator draws contributor locations from.
const SIMULATED_CELLS: [&str; 4] = ["u4pruyd", "9q8yyk8", "dr5regw", "gcpvj0d"];
/// Chance that a simulated contributor reports any given category.
const SIMULATED_SYMPTOM_RATE: f64 = 0.3;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Engine(#[from] CohortNetError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid node configuration: {0}")]
    Config(#[from] crate::config::ConfigError),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SimulationReport {
    pub submitted: usize,
    pub sealed: Vec<CohortId>,
    pub pending: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct TimelineRow {
    pub id: CohortId,
    pub sealed_at: String,
    pub intensity: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct LatestCohort {
    pub id: CohortId,
    pub size: usize,
    pub scores: Vec<(SymptomCategory, f64)>,
    pub integrity_token: String,
    pub metrics: PrivacyMetrics,
}

/// Everything the dashboard view shows: the newest cohort in detail plus the
/// intensity timeline.
#[derive(Clone, Debug, Serialize)]
pub struct ObserverView {
    pub cohorts: usize,
    pub pending: usize,
    pub latest: Option<LatestCohort>,
    pub timeline: Vec<TimelineRow>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ShutdownReport {
    /// Open cohort vectors written to the pending record.
    pub checkpointed: usize,
    /// Sealed snapshots still waiting for the store; the next `open` retries them.
    pub unstored: usize,
}

pub struct NodeService {
    engine: CohortEngine<Arc<JsonFileStore>>,
}

impl NodeService {
    /// Opens the data directory, restores the open cohort left by the previous
    /// run and retries any snapshot that run could not store. The data
    /// directory doubles as the engine's journal, so every later admission and
    /// seal is on disk before the call that caused it returns.
    pub fn open(config: &Config, telemetry: TelemetryHandle) -> Result<Self, ServiceError> {
        let store = Arc::new(JsonFileStore::open(&config.node.data_dir)?);
        let engine = match config.node.seed_bytes()? {
            Some(seed) => {
                let stored = store.read_unverified()?.len();
                CohortEngine::with_seed(
                    config.engine.clone(),
                    store.clone(),
                    telemetry,
                    run_seed(seed, stored),
                )?
            }
            None => CohortEngine::new(config.engine.clone(), store.clone(), telemetry)?,
        }
        .with_journal(store.clone());
        let pending = engine.recover(&*store)?;
        info!(
            data_dir = %store.root().display(),
            pending,
            unstored = engine.pending_writes(),
            "cohortnet node ready"
        );
        Ok(Self { engine })
    }

    pub fn engine(&self) -> &CohortEngine<Arc<JsonFileStore>> {
        &self.engine
    }

    pub fn submit(
        &self,
        symptoms: &[String],
        location: Option<&str>,
    ) -> Result<SubmitOutcome, ServiceError> {
        let selected = symptoms
            .iter()
            .map(|name| name.parse::<SymptomCategory>())
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(self.engine.submit_selection(&selected, location)?)
    }

    /// Feeds `count` synthetic contributors through the engine. When the
    /// engine rejects empty selections, empty draws are redrawn.
    pub fn simulate(&self, count: usize, seed: Option<u64>) -> Result<SimulationReport, ServiceError> {
        let mut rng = match seed {
            Some(seed) => ChaCha20Rng::seed_from_u64(seed),
            None => ChaCha20Rng::from_entropy(),
        };
        let allow_empty = self.engine.config().cohort.allow_empty_contributions;
        let mut sealed = Vec::new();
        for _ in 0..count {
            let selected = loop {
                let drawn: BTreeSet<_> = SymptomCategory::ALL
                    .into_iter()
                    .filter(|_| rng.gen_bool(SIMULATED_SYMPTOM_RATE))
                    .collect();
                if allow_empty || !drawn.is_empty() {
                    break drawn;
                }
            };
            let cell = SIMULATED_CELLS[rng.gen_range(0..SIMULATED_CELLS.len())];
            if let SubmitOutcome::Sealed(id) = self.engine.submit_selection(&selected, Some(cell))? {
                sealed.push(id);
            }
        }
        Ok(SimulationReport {
            submitted: count,
            sealed,
            pending: self.engine.buffer().pending_len(),
        })
    }

    pub fn observe(&self) -> Result<ObserverView, ServiceError> {
        let snapshots = self.engine.list_snapshots()?;
        let latest = match observer::latest(&snapshots) {
            Some(snapshot) => Some(LatestCohort {
                id: snapshot.id().clone(),
                size: snapshot.size(),
                scores: snapshot.aggregate_scores().iter().collect(),
                integrity_token: snapshot.integrity_token().to_string(),
                metrics: self
                    .engine
                    .privacy_metrics(snapshot)
                    .map_err(CohortNetError::from)?,
            }),
            None => None,
        };
        let timeline = observer::timeline(&snapshots)
            .into_iter()
            .map(|point| TimelineRow {
                sealed_at: format_ms(point.sealed_at_ms),
                id: point.id,
                intensity: point.intensity,
            })
            .collect();
        Ok(ObserverView {
            cohorts: snapshots.len(),
            pending: self.engine.buffer().pending_len(),
            latest,
            timeline,
        })
    }

    /// Checks every stored snapshot, reporting all failures instead of
    /// stopping at the first one.
    pub fn verify(&self) -> Result<IntegrityReport, ServiceError> {
        let snapshots = self.engine.store().read_unverified()?;
        let report = observer::verify_all(&snapshots);
        for failure in &report.failures {
            warn!(cohort = %failure.id, "snapshot failed integrity verification");
        }
        Ok(report)
    }

    pub fn flush(&self) -> usize {
        self.engine.flush_outbox()
    }

    /// Retries unstored snapshots one last time and writes the final pending
    /// record. Snapshots the store still refuses stay in that record, sealed,
    /// and go out on the next `open`.
    pub fn shutdown(self) -> Result<ShutdownReport, ServiceError> {
        self.engine.flush_outbox();
        let checkpointed = self.engine.checkpoint(self.engine.store())?;
        let unstored = self.engine.pending_writes();
        if unstored > 0 {
            warn!(unstored, "snapshots left unstored, the next start retries them");
        }
        Ok(ShutdownReport {
            checkpointed,
            unstored,
        })
    }
}

/// Folds the number of already stored snapshots into a configured seed, so a
/// seeded node that restarts does not replay the cohort ids of its last run.
fn run_seed(mut seed: [u8; 32], stored: usize) -> [u8; 32] {
    for (byte, offset) in seed.iter_mut().zip((stored as u64).to_le_bytes()) {
        *byte ^= offset;
    }
    seed
}

fn format_ms(ms: u64) -> String {
    i64::try_from(ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|at| at.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string())
        .unwrap_or_else(|| ms.to_string())
}
