//! Persistence contract for clinic records.
//!
//! The services never hold authoritative copies of rows: every operation reads current state
//! through [`ClinicStore`], decides, and submits its writes as one [`ChangeSet`]. A change set
//! is applied atomically (all writes land or none do), which is what keeps an encounter and its
//! versions consistent across multi-row operations.
//!
//! The store is also where the relational constraints live:
//!
//! - primary keys are unique per table, version numbers are unique per encounter and an
//!   episode has at most one anesthesia assessment ([`StoreError::UniqueViolation`])
//! - episodes and encounters reference existing patients, versions reference existing
//!   encounters, encounters and assessments reference existing episodes and an encounter's
//!   current-version pointer names a version of that same encounter
//!   ([`StoreError::ForeignKeyViolation`])
//! - an encounter's episode belongs to the encounter's patient ([`StoreError::CheckViolation`])
//! - updates target existing rows ([`StoreError::RowNotFound`]) and never rewrite a finalized
//!   row ([`StoreError::ImmutableRow`])
//! - updates may carry the status the caller observed; a mismatch with the stored row means a
//!   concurrent writer won ([`StoreError::Conflict`]), as does finalizing a version whose stored
//!   content differs from the content being sealed
//!
//! Two implementations exist: [`MemoryStore`] and [`GitStore`].

mod git;
mod memory;
mod tables;
#[cfg(test)]
mod test_rows;

pub use git::GitStore;
pub use memory::MemoryStore;

use crate::assessments::AnesthesiaAssessment;
use crate::config::{CoreConfig, StoreBackend};
use crate::encounters::{Encounter, EncounterStatus, EncounterVersion};
use crate::episodes::Episode;
use crate::error::{ClinicError, ClinicResult};
use crate::ids::{ActorId, AssessmentId, EncounterId, EpisodeId, PatientId};
use crate::patients::Patient;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("duplicate {table} row: {key}")]
    UniqueViolation { table: Table, key: String },
    #[error("{table} row {key} references missing {references} row")]
    ForeignKeyViolation {
        table: Table,
        references: Table,
        key: String,
    },
    #[error("{table} row not found: {key}")]
    RowNotFound { table: Table, key: String },
    #[error("{table} row {key} is finalized and cannot be rewritten")]
    ImmutableRow { table: Table, key: String },
    #[error("{table} row {key} violates check: {rule}")]
    CheckViolation {
        table: Table,
        key: String,
        rule: &'static str,
    },
    #[error("{0}")]
    Conflict(String),
    #[error("change set is empty")]
    EmptyChangeSet,
    #[error("change set spans more than one record: {0}")]
    CrossRecordChangeSet(String),
    #[error("store lock poisoned")]
    LockPoisoned,

    #[error("failed to create storage directory: {0}")]
    DirCreation(std::io::Error),
    #[error("failed to write record file: {0}")]
    FileWrite(std::io::Error),
    #[error("failed to read record file: {0}")]
    FileRead(std::io::Error),
    #[error("failed to serialize row: {0}")]
    YamlSerialization(serde_yaml::Error),
    #[error("failed to deserialize row at {path}: {source}")]
    YamlDeserialization {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid record path: {0}")]
    InvalidPath(String),
    #[error("invalid commit message: {0}")]
    InvalidCommitMessage(String),
    #[error(
        "record creation failed and cleanup also failed (path: {path}): init={init_error}; cleanup={cleanup_error}",
        path = path.display()
    )]
    CleanupAfterInitialiseFailed {
        path: std::path::PathBuf,
        #[source]
        init_error: Box<StoreError>,
        cleanup_error: std::io::Error,
    },

    #[error("failed to initialise git repository: {0}")]
    GitInit(git2::Error),
    #[error("failed to open git repository: {0}")]
    GitOpen(git2::Error),
    #[error("failed to access git index: {0}")]
    GitIndex(git2::Error),
    #[error("failed to add file to git index: {0}")]
    GitAdd(git2::Error),
    #[error("failed to write git tree: {0}")]
    GitWriteTree(git2::Error),
    #[error("failed to find git tree: {0}")]
    GitFindTree(git2::Error),
    #[error("failed to create git signature: {0}")]
    GitSignature(git2::Error),
    #[error("failed to create git commit: {0}")]
    GitCommit(git2::Error),
    #[error("failed to get git head: {0}")]
    GitHead(git2::Error),
    #[error("failed to set git head: {0}")]
    GitSetHead(git2::Error),
    #[error("failed to peel git commit: {0}")]
    GitPeel(git2::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Logical tables, used in constraint errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Table {
    Patients,
    Episodes,
    Encounters,
    EncounterVersions,
    AnesthesiaAssessments,
}

impl Table {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Patients => "patients",
            Self::Episodes => "episodes",
            Self::Encounters => "encounters",
            Self::EncounterVersions => "encounter_versions",
            Self::AnesthesiaAssessments => "anesthesia_assessments",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of record a change set modifies. Rendered into git commit subjects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordDomain {
    Patient,
    Episode,
    Encounter,
    Assessment,
}

impl RecordDomain {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Patient => "patient",
            Self::Episode => "episode",
            Self::Encounter => "encounter",
            Self::Assessment => "assessment",
        }
    }
}

impl fmt::Display for RecordDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a change set does to its record.
///
/// Records are append-only: there is no delete action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeAction {
    Create,
    Update,
    Finalize,
}

impl ChangeAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Finalize => "finalize",
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit metadata attached to a change set.
///
/// The summary is a fixed label; it must not carry patient identifiers or clinical text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeMeta {
    pub actor: ActorId,
    pub domain: RecordDomain,
    pub action: ChangeAction,
    pub summary: &'static str,
}

/// One row write.
///
/// Update variants carry the status the caller read before deciding to write. The store
/// rejects the write if the stored row has moved on since.
#[derive(Clone, Debug)]
pub enum Write {
    InsertPatient(Patient),
    InsertEpisode(Episode),
    InsertEncounter(Encounter),
    UpdateEncounter {
        row: Encounter,
        expected: EncounterStatus,
    },
    InsertVersion(EncounterVersion),
    UpdateVersion {
        row: EncounterVersion,
        expected: EncounterStatus,
    },
    InsertAssessment(AnesthesiaAssessment),
    UpdateAssessment {
        row: AnesthesiaAssessment,
        expected_finalized: bool,
    },
}

impl Write {
    pub fn table(&self) -> Table {
        match self {
            Self::InsertPatient(_) => Table::Patients,
            Self::InsertEpisode(_) => Table::Episodes,
            Self::InsertEncounter(_) | Self::UpdateEncounter { .. } => Table::Encounters,
            Self::InsertVersion(_) | Self::UpdateVersion { .. } => Table::EncounterVersions,
            Self::InsertAssessment(_) | Self::UpdateAssessment { .. } => {
                Table::AnesthesiaAssessments
            }
        }
    }
}

/// An atomic group of writes plus its audit metadata.
#[derive(Clone, Debug)]
pub struct ChangeSet {
    meta: ChangeMeta,
    writes: Vec<Write>,
}

impl ChangeSet {
    pub fn new(meta: ChangeMeta) -> Self {
        Self {
            meta,
            writes: Vec::new(),
        }
    }

    /// Appends a write. Writes are applied in the order they were added.
    pub fn with(mut self, write: Write) -> Self {
        self.writes.push(write);
        self
    }

    pub fn meta(&self) -> &ChangeMeta {
        &self.meta
    }

    pub fn writes(&self) -> &[Write] {
        &self.writes
    }
}

/// Row filter for [`ClinicStore::encounters`]. Empty fields match everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncounterFilter {
    pub patient_id: Option<PatientId>,
    pub episode_id: Option<EpisodeId>,
    pub status: Option<EncounterStatus>,
}

impl EncounterFilter {
    pub fn matches(&self, encounter: &Encounter) -> bool {
        self.patient_id.map_or(true, |p| encounter.patient_id == p)
            && self
                .episode_id
                .map_or(true, |e| encounter.episode_id == Some(e))
            && self.status.map_or(true, |s| encounter.status == s)
    }
}

/// Durable, transactional row storage.
///
/// Reads return owned rows. `versions` returns rows ordered by version number ascending;
/// other list reads have no defined order.
pub trait ClinicStore: Send + Sync {
    fn patient(&self, id: PatientId) -> StoreResult<Option<Patient>>;

    fn patients(&self) -> StoreResult<Vec<Patient>>;

    fn episode(&self, id: EpisodeId) -> StoreResult<Option<Episode>>;

    /// Episodes of one patient, or of every patient when `patient_id` is `None`.
    fn episodes(&self, patient_id: Option<PatientId>) -> StoreResult<Vec<Episode>>;

    fn encounter(&self, id: EncounterId) -> StoreResult<Option<Encounter>>;

    fn encounters(&self, filter: &EncounterFilter) -> StoreResult<Vec<Encounter>>;

    fn versions(&self, encounter_id: EncounterId) -> StoreResult<Vec<EncounterVersion>>;

    fn assessment(&self, id: AssessmentId) -> StoreResult<Option<AnesthesiaAssessment>>;

    fn assessment_for_episode(
        &self,
        episode_id: EpisodeId,
    ) -> StoreResult<Option<AnesthesiaAssessment>>;

    /// Applies every write in `changes` or none of them.
    fn apply(&self, changes: ChangeSet) -> StoreResult<()>;
}

/// Opens the store selected by the configuration.
pub fn open(cfg: Arc<CoreConfig>) -> ClinicResult<Arc<dyn ClinicStore>> {
    match cfg.store_backend() {
        StoreBackend::Memory => {
            tracing::info!("using in-memory clinic store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Git => {
            tracing::info!("using git clinic store at {}", cfg.data_dir().display());
            let store = GitStore::open(cfg).map_err(|source| ClinicError::Persistence {
                context: "failed to open git store",
                source,
            })?;
            Ok(Arc::new(store))
        }
    }
}
