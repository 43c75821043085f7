use crate::ids::{AssessmentId, EncounterId, EpisodeId, PatientId};
use crate::store::{StoreError, StoreResult};

/// Coarse error categories exposed to API layers.
///
/// Each [`ClinicError`] variant folds into exactly one kind; REST and gRPC map kinds to status
/// codes rather than matching individual variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    NotAuthenticated,
    Forbidden,
    NotFound,
    InvalidState,
    InvalidInput,
    PersistenceFailure,
}

#[derive(Debug, thiserror::Error)]
pub enum ClinicError {
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("forbidden: requires role {required}")]
    Forbidden { required: String },

    #[error("patient not found: {0}")]
    PatientNotFound(PatientId),
    #[error("episode not found: {0}")]
    EpisodeNotFound(EpisodeId),
    #[error("encounter not found: {0}")]
    EncounterNotFound(EncounterId),
    #[error("anesthesia assessment not found: {0}")]
    AssessmentNotFound(AssessmentId),

    #[error("cannot edit finalized encounter; create a new version first")]
    EncounterFinalized,
    #[error("encounter is already finalized")]
    AlreadyFinalized,
    #[error("encounter has no current version")]
    NoCurrentVersion,
    #[error("current encounter version is not a draft")]
    VersionNotDraft,
    #[error("encounter already has a draft version")]
    DraftAlreadyExists,

    #[error("anesthesia assessment already exists for episode {0}")]
    AssessmentExists(EpisodeId),
    #[error("cannot update finalized assessment")]
    AssessmentFinalized,
    #[error("assessment is already finalized")]
    AssessmentAlreadyFinalized,

    #[error("record changed concurrently: {0}")]
    Conflict(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{context}: {source}")]
    Persistence {
        context: &'static str,
        #[source]
        source: StoreError,
    },
}

impl ClinicError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotAuthenticated => ErrorKind::NotAuthenticated,
            Self::Forbidden { .. } => ErrorKind::Forbidden,
            Self::PatientNotFound(_)
            | Self::EpisodeNotFound(_)
            | Self::EncounterNotFound(_)
            | Self::AssessmentNotFound(_) => ErrorKind::NotFound,
            Self::EncounterFinalized
            | Self::AlreadyFinalized
            | Self::NoCurrentVersion
            | Self::VersionNotDraft
            | Self::DraftAlreadyExists
            | Self::AssessmentExists(_)
            | Self::AssessmentFinalized
            | Self::AssessmentAlreadyFinalized
            | Self::Conflict(_) => ErrorKind::InvalidState,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Persistence { .. } => ErrorKind::PersistenceFailure,
        }
    }
}

pub type ClinicResult<T> = std::result::Result<T, ClinicError>;

/// Attaches operation context to store errors.
///
/// Guard failures and uniqueness races mean another writer got there first; they surface as
/// [`ClinicError::Conflict`] so callers can re-read and retry. Everything else is a
/// persistence failure.
pub(crate) trait StoreResultExt<T> {
    fn with_store_context(self, context: &'static str) -> ClinicResult<T>;
}

impl<T> StoreResultExt<T> for StoreResult<T> {
    fn with_store_context(self, context: &'static str) -> ClinicResult<T> {
        self.map_err(|source| match source {
            StoreError::Conflict(msg) => ClinicError::Conflict(msg),
            e @ StoreError::UniqueViolation { .. } => ClinicError::Conflict(e.to_string()),
            source => {
                tracing::error!("{}: {}", context, source);
                ClinicError::Persistence { context, source }
            }
        })
    }
}
