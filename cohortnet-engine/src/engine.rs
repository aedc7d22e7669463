//! Inbound surface of the aggregation pipeline.
//!
//! `CohortEngine` wires the vectorizer, the cohort buffer and a snapshot store
//! together. Sealed snapshots pass through an outbox before they reach the
//! store: a failed append keeps the snapshot and its contributors queued for a
//! later retry instead of failing the submission that happened to seal it.
//!
//! With a journal attached, every change to the open cohort or the outbox is
//! written through as a [`PendingRecord`], so a process that dies at any point
//! restarts without losing a contributor or sealing one twice.

use std::{
    collections::{BTreeSet, VecDeque},
    sync::Arc,
    time::Instant,
};

use cohortnet_telemetry::TelemetryHandle;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    buffer::{AdmitResult, CohortBuffer, SealedCohort},
    config::EngineConfig,
    errors::{CohortNetError, CohortNetResult, ParameterError},
    model::{now_ms, GeoTag, RiskVector, SymptomCategory},
    observer::PrivacyMetrics,
    sealer::{derive_seed, SnapshotSealer},
    snapshot::{CohortId, CohortSnapshot},
    store::{PendingRecord, PendingStore, SnapshotStore, StoreError},
    vectorizer::RiskVectorizer,
};

/// Snapshot handed back to an operator who gives up on storing it.
pub type AbandonedCohort = SealedCohort;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Buffered { pending: usize, threshold: usize },
    Sealed(CohortId),
}

pub struct CohortEngine<S: SnapshotStore> {
    config: EngineConfig,
    vectorizer: Mutex<RiskVectorizer>,
    buffer: CohortBuffer,
    store: S,
    /// Held across admission too, so the buffer and the outbox change together.
    outbox: Mutex<VecDeque<SealedCohort>>,
    journal: Option<Arc<dyn PendingStore>>,
    telemetry: TelemetryHandle,
}

impl<S: SnapshotStore> CohortEngine<S> {
    pub fn new(config: EngineConfig, store: S, telemetry: TelemetryHandle) -> CohortNetResult<Self> {
        config.validate()?;
        let vectorizer = RiskVectorizer::from_entropy(config.vectorizer.clone())?;
        let sealer = SnapshotSealer::from_entropy(&config.noise);
        Self::assemble(config, vectorizer, sealer, store, telemetry)
    }

    /// Fully reproducible engine: vectorizer scores, noise and id nonces all
    /// derive from `seed`.
    pub fn with_seed(
        config: EngineConfig,
        store: S,
        telemetry: TelemetryHandle,
        seed: [u8; 32],
    ) -> CohortNetResult<Self> {
        config.validate()?;
        let vectorizer =
            RiskVectorizer::new(config.vectorizer.clone(), derive_seed(&seed, b"vectorizer"))?;
        let sealer = SnapshotSealer::new(&config.noise, derive_seed(&seed, b"sealer"));
        Self::assemble(config, vectorizer, sealer, store, telemetry)
    }

    fn assemble(
        config: EngineConfig,
        vectorizer: RiskVectorizer,
        sealer: SnapshotSealer,
        store: S,
        telemetry: TelemetryHandle,
    ) -> CohortNetResult<Self> {
        let buffer = CohortBuffer::new(&config.cohort, sealer)?;
        Ok(Self {
            config,
            vectorizer: Mutex::new(vectorizer),
            buffer,
            store,
            outbox: Mutex::new(VecDeque::new()),
            journal: None,
            telemetry,
        })
    }

    /// Writes the open cohort and the outbox through to `journal` after every
    /// admission, seal, stored append and abandon.
    pub fn with_journal(mut self, journal: Arc<dyn PendingStore>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn buffer(&self) -> &CohortBuffer {
        &self.buffer
    }

    pub fn telemetry(&self) -> &TelemetryHandle {
        &self.telemetry
    }

    /// Vectorizes a symptom selection and contributes it to the open cohort.
    /// `location` is coarsened to the configured geohash precision before it
    /// goes anywhere.
    pub fn submit_selection(
        &self,
        selected: &BTreeSet<SymptomCategory>,
        location: Option<&str>,
    ) -> CohortNetResult<SubmitOutcome> {
        if selected.is_empty() && !self.config.cohort.allow_empty_contributions {
            self.count("cohort.rejected", 1);
            return Err(CohortNetError::EmptySelection);
        }
        let geo_tag = match location {
            Some(raw) => GeoTag::coarsen(raw, self.config.cohort.geo_precision)?,
            None => GeoTag::unspecified(),
        };
        let vector = self.vectorizer.lock().vectorize(selected, geo_tag, now_ms());
        self.submit_vector(vector)
    }

    /// Contributes an already vectorized submission.
    pub fn submit_vector(&self, vector: RiskVector) -> CohortNetResult<SubmitOutcome> {
        let started = Instant::now();
        let mut outbox = self.outbox.lock();
        let admitted = match self.buffer.admit(vector) {
            Ok(admitted) => admitted,
            Err(err) => {
                self.count("cohort.rejected", 1);
                return Err(err);
            }
        };
        self.count("cohort.admitted", 1);
        match admitted {
            AdmitResult::Buffered { pending } => {
                self.telemetry.record_gauge("cohort.pending", pending as i64);
                self.write_journal(&outbox);
                Ok(SubmitOutcome::Buffered {
                    pending,
                    threshold: self.buffer.threshold(),
                })
            }
            AdmitResult::Sealed(cohort) => {
                self.telemetry
                    .record_latency_us("cohort.seal_us", started.elapsed().as_micros() as u64);
                let id = cohort.snapshot.id().clone();
                self.on_sealed(&mut outbox, cohort);
                self.write_journal(&outbox);
                if self.drain_outbox(&mut outbox) > 0 {
                    self.write_journal(&outbox);
                }
                Ok(SubmitOutcome::Sealed(id))
            }
        }
    }

    fn on_sealed(&self, outbox: &mut VecDeque<SealedCohort>, cohort: SealedCohort) {
        self.count("cohort.sealed", 1);
        self.telemetry
            .record_gauge("cohort.pending", self.buffer.pending_len() as i64);
        outbox.push_back(cohort);
    }

    /// Retries queued appends in seal order. Returns how many snapshots reached
    /// the store.
    pub fn flush_outbox(&self) -> usize {
        let mut outbox = self.outbox.lock();
        let stored = self.drain_outbox(&mut outbox);
        if stored > 0 {
            self.write_journal(&outbox);
        }
        stored
    }

    pub fn pending_writes(&self) -> usize {
        self.outbox.lock().len()
    }

    /// Gives up on every queued append and hands the snapshots, with their
    /// contributors, back to the caller.
    pub fn abandon_pending_writes(&self) -> Vec<AbandonedCohort> {
        let mut outbox = self.outbox.lock();
        let abandoned: Vec<_> = outbox.drain(..).collect();
        if !abandoned.is_empty() {
            warn!(count = abandoned.len(), "abandoning queued snapshot writes");
            self.write_journal(&outbox);
        }
        abandoned
    }

    fn drain_outbox(&self, outbox: &mut VecDeque<SealedCohort>) -> usize {
        let mut stored = 0;
        while let Some(next) = outbox.front() {
            match self.store.append(&next.snapshot) {
                Ok(()) => {
                    stored += 1;
                    self.count("store.appended", 1);
                }
                Err(StoreError::DuplicateSnapshot { id }) if self.already_stored(&next.snapshot) => {
                    debug!(cohort = %id, "snapshot already stored, dropping from outbox");
                    stored += 1;
                }
                Err(StoreError::DuplicateSnapshot { id }) => {
                    warn!(
                        cohort = %id,
                        queued = outbox.len(),
                        "a different snapshot is stored under this id, keeping it in the outbox"
                    );
                    self.count("store.id_conflict", 1);
                    break;
                }
                Err(err) => {
                    warn!(
                        cohort = %next.snapshot.id(),
                        queued = outbox.len(),
                        error = %err,
                        "snapshot append failed, keeping it in the outbox"
                    );
                    self.count("store.append_failed", 1);
                    break;
                }
            }
            outbox.pop_front();
        }
        stored
    }

    /// True when the store holds this exact snapshot, matched by id and
    /// integrity token.
    fn already_stored(&self, snapshot: &CohortSnapshot) -> bool {
        match self.store.list_all() {
            Ok(stored) => stored.iter().any(|candidate| {
                candidate.id() == snapshot.id()
                    && candidate.integrity_token() == snapshot.integrity_token()
            }),
            Err(err) => {
                warn!(cohort = %snapshot.id(), error = %err, "could not read back stored snapshots");
                false
            }
        }
    }

    fn pending_record(&self, outbox: &VecDeque<SealedCohort>) -> PendingRecord {
        PendingRecord {
            vectors: self.buffer.pending_snapshot(),
            unstored: outbox.iter().cloned().collect(),
        }
    }

    fn write_journal(&self, outbox: &VecDeque<SealedCohort>) {
        let Some(journal) = &self.journal else {
            return;
        };
        if let Err(err) = journal.save_pending(&self.pending_record(outbox)) {
            warn!(error = %err, "pending record not written");
            self.count("journal.write_failed", 1);
        }
    }

    /// Reloads the open cohort and the unstored snapshots saved by a previous
    /// process, then retries those snapshots. A restore that crosses the
    /// threshold seals once and is written back to `pending` before its
    /// snapshot is appended. Returns the number of vectors still pending.
    pub fn recover<P: PendingStore + ?Sized>(&self, pending: &P) -> CohortNetResult<usize> {
        let record = pending.load_pending()?;
        let restored = record.vectors.len();
        let unstored = record.unstored.len();
        let mut outbox = self.outbox.lock();
        let resealed = self.buffer.restore(record.vectors)?;
        outbox.extend(record.unstored);
        if let Some(cohort) = resealed {
            self.on_sealed(&mut outbox, cohort);
        }
        pending.save_pending(&self.pending_record(&outbox))?;
        if self.drain_outbox(&mut outbox) > 0 {
            pending.save_pending(&self.pending_record(&outbox))?;
        }
        let remaining = self.buffer.pending_len();
        info!(
            restored,
            unstored,
            remaining,
            queued = outbox.len(),
            "recovered open cohort"
        );
        self.telemetry.record_gauge("cohort.pending", remaining as i64);
        Ok(remaining)
    }

    /// Persists the open cohort and the outbox so a restart picks up where
    /// this process left off. Returns the number of open vectors written.
    pub fn checkpoint<P: PendingStore + ?Sized>(&self, pending: &P) -> CohortNetResult<usize> {
        let record = self.pending_record(&self.outbox.lock());
        pending.save_pending(&record)?;
        debug!(
            pending = record.vectors.len(),
            unstored = record.unstored.len(),
            "checkpointed open cohort"
        );
        Ok(record.vectors.len())
    }

    pub fn list_snapshots(&self) -> CohortNetResult<Vec<CohortSnapshot>> {
        Ok(self.store.list_all()?)
    }

    pub fn privacy_metrics(&self, snapshot: &CohortSnapshot) -> Result<PrivacyMetrics, ParameterError> {
        PrivacyMetrics::for_snapshot(snapshot, &self.config.noise.mechanism)
    }

    fn count(&self, name: &str, delta: u64) {
        if let Err(err) = self.telemetry.record_counter(name, delta) {
            warn!(counter = name, error = %err, "telemetry counter not recorded");
        }
    }
}

#[cfg(test)]
mod tests {
    use cohortnet_telemetry::TelemetryConfig;
    use pretty_assertions::assert_eq;

    use crate::{config::CohortConfig, store::MemoryStore};

    use super::*;

    fn engine(config: EngineConfig) -> CohortEngine<MemoryStore> {
        let telemetry = TelemetryHandle::from_config(TelemetryConfig::sample("engine-test"));
        CohortEngine::with_seed(config, MemoryStore::new(), telemetry, [5; 32]).unwrap()
    }

    fn selection(categories: &[SymptomCategory]) -> BTreeSet<SymptomCategory> {
        categories.iter().copied().collect()
    }

    #[test]
    fn buffers_until_threshold_then_stores() {
        let engine = engine(EngineConfig::default());
        let cough = selection(&[SymptomCategory::Respiratory]);
        for pending in 1..5 {
            assert_eq!(
                engine.submit_selection(&cough, Some("u4pruydqqvj")).unwrap(),
                SubmitOutcome::Buffered {
                    pending,
                    threshold: 5
                }
            );
        }
        let SubmitOutcome::Sealed(id) = engine.submit_selection(&cough, None).unwrap() else {
            panic!("fifth submission must seal");
        };
        let stored = engine.list_snapshots().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id(), &id);
        assert_eq!(engine.pending_writes(), 0);

        let counters = engine.telemetry().flush();
        assert_eq!(counters.counter("cohort.admitted"), 5);
        assert_eq!(counters.counter("cohort.sealed"), 1);
        assert_eq!(counters.counter("store.appended"), 1);
        assert_eq!(counters.gauges["cohort.pending"], 0);
    }

    #[test]
    fn empty_selection_follows_configuration() {
        let accepting = engine(EngineConfig::default());
        assert!(matches!(
            accepting.submit_selection(&BTreeSet::new(), None).unwrap(),
            SubmitOutcome::Buffered { pending: 1, .. }
        ));

        let rejecting = engine(EngineConfig {
            cohort: CohortConfig {
                allow_empty_contributions: false,
                ..CohortConfig::default()
            },
            ..EngineConfig::default()
        });
        assert!(matches!(
            rejecting.submit_selection(&BTreeSet::new(), None),
            Err(CohortNetError::EmptySelection)
        ));
        assert_eq!(rejecting.buffer().pending_len(), 0);
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let config = EngineConfig {
            cohort: CohortConfig {
                epsilon: -1.0,
                ..CohortConfig::default()
            },
            ..EngineConfig::default()
        };
        let telemetry = TelemetryHandle::from_config(TelemetryConfig::sample("engine-test"));
        assert!(matches!(
            CohortEngine::with_seed(config, MemoryStore::new(), telemetry, [0; 32]),
            Err(CohortNetError::InvalidParameter(ParameterError::NonPositiveEpsilon(_)))
        ));
    }

    #[test]
    fn checkpoint_and_recover_round_trip() {
        let first = engine(EngineConfig::default());
        let cough = selection(&[SymptomCategory::Respiratory]);
        for _ in 0..3 {
            first.submit_selection(&cough, None).unwrap();
        }
        let durable = MemoryStore::new();
        assert_eq!(first.checkpoint(&durable).unwrap(), 3);

        let second = engine(EngineConfig::default());
        assert_eq!(second.recover(&durable).unwrap(), 3);
        assert_eq!(second.buffer().pending_snapshot(), first.buffer().pending_snapshot());
    }

    #[test]
    fn journal_follows_every_admission_and_seal() {
        let journal = Arc::new(MemoryStore::new());
        let engine = engine(EngineConfig::default()).with_journal(journal.clone());
        let cough = selection(&[SymptomCategory::Respiratory]);
        for expected in 1..5 {
            engine.submit_selection(&cough, None).unwrap();
            assert_eq!(journal.load_pending().unwrap().vectors.len(), expected);
        }
        assert!(matches!(
            engine.submit_selection(&cough, None).unwrap(),
            SubmitOutcome::Sealed(_)
        ));
        assert_eq!(journal.load_pending().unwrap(), PendingRecord::default());
        assert_eq!(engine.store().len(), 1);
    }

    #[test]
    fn recover_drops_snapshots_the_store_already_holds() {
        let store = Arc::new(MemoryStore::new());
        let telemetry = TelemetryHandle::from_config(TelemetryConfig::sample("engine-test"));
        let first =
            CohortEngine::with_seed(EngineConfig::default(), store.clone(), telemetry.clone(), [6; 32])
                .unwrap();
        let cough = selection(&[SymptomCategory::Respiratory]);
        for _ in 0..5 {
            first.submit_selection(&cough, None).unwrap();
        }
        let stored = store.list_all().unwrap().remove(0);

        // The append landed but the record still lists the cohort as unstored.
        let durable = MemoryStore::new();
        durable
            .save_pending(&PendingRecord {
                vectors: Vec::new(),
                unstored: vec![SealedCohort {
                    snapshot: stored.clone(),
                    contributors: Vec::new(),
                }],
            })
            .unwrap();

        let second =
            CohortEngine::with_seed(EngineConfig::default(), store.clone(), telemetry, [7; 32]).unwrap();
        assert_eq!(second.recover(&durable).unwrap(), 0);
        assert_eq!(second.pending_writes(), 0);
        assert_eq!(store.list_all().unwrap(), vec![stored]);
        assert_eq!(durable.load_pending().unwrap(), PendingRecord::default());
    }

    /// Answers every append as a duplicate without holding the snapshot itself,
    /// as when another run already stored a different cohort under that id.
    struct SquattedStore;

    impl SnapshotStore for SquattedStore {
        fn append(&self, snapshot: &CohortSnapshot) -> Result<(), StoreError> {
            Err(StoreError::DuplicateSnapshot {
                id: snapshot.id().clone(),
            })
        }

        fn list_all(&self) -> Result<Vec<CohortSnapshot>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn id_collision_keeps_snapshot_queued() {
        let telemetry = TelemetryHandle::from_config(TelemetryConfig::sample("engine-test"));
        let engine =
            CohortEngine::with_seed(EngineConfig::default(), SquattedStore, telemetry, [5; 32]).unwrap();
        let cough = selection(&[SymptomCategory::Respiratory]);
        for _ in 0..5 {
            engine.submit_selection(&cough, None).unwrap();
        }
        assert_eq!(engine.pending_writes(), 1);
        assert_eq!(engine.flush_outbox(), 0);
        assert_eq!(engine.pending_writes(), 1);

        let counters = engine.telemetry().flush();
        assert_eq!(counters.counter("store.id_conflict"), 2);
        assert_eq!(counters.counter("store.appended"), 0);
        assert_eq!(engine.abandon_pending_writes()[0].contributors.len(), 5);
    }

    #[test]
    fn metrics_reflect_cohort_size() {
        let engine = engine(EngineConfig::default());
        let cough = selection(&[SymptomCategory::Respiratory]);
        for _ in 0..5 {
            engine.submit_selection(&cough, None).unwrap();
        }
        let snapshot = engine.list_snapshots().unwrap().remove(0);
        let metrics = engine.privacy_metrics(&snapshot).unwrap();
        assert_eq!(metrics.anonymity_set, 5);
        assert!((metrics.noise_scale - 0.2 / 0.8).abs() < 1e-12);
    }
}
