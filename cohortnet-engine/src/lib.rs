//! CohortNet engine: turns individual symptom selections into bounded risk
//! vectors, holds them until a minimum cohort has formed, and releases only a
//! differentially private aggregate sealed with a content-bound integrity
//! token. Raw vectors never outlive the durable storage of the snapshot they
//! were folded into.

pub mod buffer;
pub mod config;
pub mod dp;
pub mod engine;
pub mod errors;
pub mod model;
pub mod observer;
pub mod sealer;
pub mod snapshot;
pub mod store;
pub mod vectorizer;

pub use buffer::{AdmitResult, CohortBuffer, SealedCohort};
pub use config::{CohortConfig, EngineConfig};
pub use dp::{NoiseConfig, NoiseKind, NoiseMechanism};
pub use engine::{AbandonedCohort, CohortEngine, SubmitOutcome};
pub use errors::{CohortNetError, CohortNetResult, ParameterError, VectorError};
pub use model::{CategoryScores, GeoTag, RiskVector, SymptomCategory, MAX_GEO_PRECISION};
pub use observer::{IntegrityReport, PrivacyMetrics, TimelinePoint};
pub use sealer::SnapshotSealer;
pub use snapshot::{CohortId, CohortSnapshot, IntegrityMismatch, IntegrityToken};
pub use store::{
    JsonFileStore, MemoryStore, PendingRecord, PendingStore, SnapshotStore, StoreError,
    PENDING_FILE, SNAPSHOTS_FILE,
};
pub use vectorizer::{RiskVectorizer, VectorizerConfig};
