//! # Clinic Core
//!
//! Core business logic for the clinic records system.
//!
//! This crate contains the record workflows and their persistence:
//! - The versioned clinical document engine ([`encounters`]): draft and finalized versions of a
//!   clinical note, version numbering and the clinical-authority role gate
//! - The patient registry ([`patients`]) and surgical episodes ([`episodes`])
//! - Anesthesia assessments ([`assessments`]), a second role-gated draft/finalize record
//! - The [`store::ClinicStore`] contract with an in-memory store and a git-backed store in which
//!   every transaction is a single commit
//!
//! **No API concerns**: HTTP/gRPC servers, API keys and header parsing belong in `api-grpc`,
//! `api-rest` or `api-shared`. Identity reaches this crate as a [`RequestContext`].

pub mod actor;
pub mod assessments;
pub mod config;
pub mod constants;
pub mod encounters;
pub mod episodes;
pub mod error;
pub mod ids;
pub mod patients;
pub mod store;

mod versioned_files;

pub use actor::{Actor, RequestContext, Role};
pub use assessments::{AnesthesiaAssessment, AssessmentFields, AssessmentService};
pub use config::{CoreConfig, StoreBackend};
pub use encounters::{
    Encounter, EncounterDetail, EncounterService, EncounterStatus, EncounterVersion, NewEncounter,
    NoteType, SoapInput, SoapNote, VersionSummary,
};
pub use episodes::{Episode, EpisodeService, EpisodeStatus, NewEpisode};
pub use error::{ClinicError, ClinicResult, ErrorKind};
pub use ids::{ActorId, AppointmentId, AssessmentId, EncounterId, EpisodeId, PatientId, VersionId};
pub use patients::{Gender, NewPatient, Patient, PatientService};
pub use store::{ClinicStore, EncounterFilter};

pub use clinic_types::{ClinicalText, NonEmptyText, TextError};

use std::sync::Arc;

/// The record services sharing one store.
///
/// Cheap to clone; API layers keep one in their application state.
#[derive(Clone)]
pub struct ClinicServices {
    pub patients: PatientService,
    pub episodes: EpisodeService,
    pub encounters: EncounterService,
    pub assessments: AssessmentService,
}

impl ClinicServices {
    /// Builds the services over an already-opened store.
    pub fn new(store: Arc<dyn ClinicStore>) -> Self {
        Self {
            patients: PatientService::new(store.clone()),
            episodes: EpisodeService::new(store.clone()),
            encounters: EncounterService::new(store.clone()),
            assessments: AssessmentService::new(store),
        }
    }

    /// Opens the store selected by `cfg` and builds the services over it.
    pub fn open(cfg: Arc<CoreConfig>) -> ClinicResult<Self> {
        let store = store::open(cfg)?;
        Ok(Self::new(store))
    }
}
