//! Durable homes for sealed snapshots and the open cohort.
//!
//! The engine only ever appends snapshots; nothing here edits or removes an
//! existing entry.

use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

use parking_lot::{Mutex, RwLock};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::{
    buffer::SealedCohort,
    model::RiskVector,
    snapshot::{CohortId, CohortSnapshot, IntegrityMismatch},
};

pub const SNAPSHOTS_FILE: &str = "cohort_snapshots.json";
pub const PENDING_FILE: &str = "pending_vectors.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode or decode {path}: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Integrity(#[from] IntegrityMismatch),
    #[error("snapshot {id} is already stored")]
    DuplicateSnapshot { id: CohortId },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Append-only collection of sealed snapshots.
pub trait SnapshotStore: Send + Sync {
    fn append(&self, snapshot: &CohortSnapshot) -> Result<(), StoreError>;

    /// Every stored snapshot in append order.
    fn list_all(&self) -> Result<Vec<CohortSnapshot>, StoreError>;
}

/// Everything a restart needs that no stored snapshot covers yet.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingRecord {
    /// The open cohort in contribution order.
    pub vectors: Vec<RiskVector>,
    /// Sealed cohorts whose append had not been confirmed when the record was
    /// written. They are retried as-is, never sealed a second time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unstored: Vec<SealedCohort>,
}

impl PendingRecord {
    /// Raw vectors held by the record, open or already sealed.
    pub fn contributors(&self) -> usize {
        self.vectors.len()
            + self
                .unstored
                .iter()
                .map(|cohort| cohort.contributors.len())
                .sum::<usize>()
    }
}

/// Durable copy of the open cohort and the unstored outbox so a restart
/// neither loses contributors nor seals them twice.
pub trait PendingStore: Send + Sync {
    fn save_pending(&self, record: &PendingRecord) -> Result<(), StoreError>;

    fn load_pending(&self) -> Result<PendingRecord, StoreError>;
}

impl<P: PendingStore + ?Sized> PendingStore for std::sync::Arc<P> {
    fn save_pending(&self, record: &PendingRecord) -> Result<(), StoreError> {
        (**self).save_pending(record)
    }

    fn load_pending(&self) -> Result<PendingRecord, StoreError> {
        (**self).load_pending()
    }
}

impl<S: SnapshotStore + ?Sized> SnapshotStore for std::sync::Arc<S> {
    fn append(&self, snapshot: &CohortSnapshot) -> Result<(), StoreError> {
        (**self).append(snapshot)
    }

    fn list_all(&self) -> Result<Vec<CohortSnapshot>, StoreError> {
        (**self).list_all()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    snapshots: RwLock<Vec<CohortSnapshot>>,
    pending: RwLock<PendingRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.read().is_empty()
    }
}

impl SnapshotStore for MemoryStore {
    fn append(&self, snapshot: &CohortSnapshot) -> Result<(), StoreError> {
        let mut snapshots = self.snapshots.write();
        if snapshots.iter().any(|s| s.id() == snapshot.id()) {
            return Err(StoreError::DuplicateSnapshot {
                id: snapshot.id().clone(),
            });
        }
        snapshots.push(snapshot.clone());
        Ok(())
    }

    fn list_all(&self) -> Result<Vec<CohortSnapshot>, StoreError> {
        Ok(self.snapshots.read().clone())
    }
}

impl PendingStore for MemoryStore {
    fn save_pending(&self, record: &PendingRecord) -> Result<(), StoreError> {
        *self.pending.write() = record.clone();
        Ok(())
    }

    fn load_pending(&self) -> Result<PendingRecord, StoreError> {
        Ok(self.pending.read().clone())
    }
}

/// Two JSON documents in one directory: the append-only snapshot list and the
/// open cohort. Writes replace the file atomically via a temp file + rename.
pub struct JsonFileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn snapshots_path(&self) -> PathBuf {
        self.root.join(SNAPSHOTS_FILE)
    }

    fn pending_path(&self) -> PathBuf {
        self.root.join(PENDING_FILE)
    }

    /// Raw read without integrity checks, for audits that want every entry
    /// rather than the first failure. `list_all` layers verification on top.
    pub fn read_unverified(&self) -> Result<Vec<CohortSnapshot>, StoreError> {
        read_json(&self.snapshots_path())
    }
}

impl SnapshotStore for JsonFileStore {
    fn append(&self, snapshot: &CohortSnapshot) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let mut snapshots = self.read_unverified()?;
        if snapshots.iter().any(|s| s.id() == snapshot.id()) {
            return Err(StoreError::DuplicateSnapshot {
                id: snapshot.id().clone(),
            });
        }
        snapshots.push(snapshot.clone());
        write_json(&self.snapshots_path(), &snapshots)
    }

    fn list_all(&self) -> Result<Vec<CohortSnapshot>, StoreError> {
        let snapshots = self.read_unverified()?;
        for snapshot in &snapshots {
            snapshot.verify_integrity()?;
        }
        Ok(snapshots)
    }
}

impl PendingStore for JsonFileStore {
    fn save_pending(&self, record: &PendingRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        write_json(&self.pending_path(), record)
    }

    fn load_pending(&self) -> Result<PendingRecord, StoreError> {
        read_json(&self.pending_path())
    }
}

fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StoreError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(T::default()),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&contents).map_err(|source| StoreError::Serialization {
        path: path.to_path_buf(),
        source,
    })
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serialization {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).map_err(|source| StoreError::Io {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}
