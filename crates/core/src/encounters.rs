//! Versioned clinical documentation.
//!
//! An [`Encounter`] is one documentation lineage for a patient. Its content lives in numbered
//! [`EncounterVersion`]s; the encounter points at its current version and mirrors that
//! version's status.
//!
//! ```text
//! (no version) -> draft -> finalized -> draft (new version) -> finalized -> ...
//! ```
//!
//! Rules enforced here and in the store:
//!
//! - version numbers within an encounter run 1, 2, 3, ... and are never reused
//! - at most one draft version exists at a time
//! - a finalized version is never rewritten; further edits go into a new version whose content
//!   starts as a copy of the latest one
//! - finalizing needs the doctor or admin role
//!
//! Every operation re-reads current rows and submits its writes as a single
//! [`ChangeSet`], so an encounter and its versions never disagree after a failure.

use crate::actor::{RequestContext, CLINICAL_AUTHORITY_ROLES};
use crate::episodes::require_episode;
use crate::error::{ClinicError, ClinicResult, StoreResultExt};
use crate::ids::{ActorId, AppointmentId, EncounterId, EpisodeId, PatientId, VersionId};
use crate::store::{
    ChangeAction, ChangeMeta, ChangeSet, ClinicStore, EncounterFilter, RecordDomain, Write,
};
use chrono::{DateTime, Utc};
use clinic_types::{ClinicalText, TextError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Category of clinical note.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteType {
    #[default]
    Consultation,
    FollowUp,
    PreOp,
    PostOp,
    Other,
}

impl NoteType {
    pub const ALL: [NoteType; 5] = [
        NoteType::Consultation,
        NoteType::FollowUp,
        NoteType::PreOp,
        NoteType::PostOp,
        NoteType::Other,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Consultation => "consultation",
            Self::FollowUp => "follow_up",
            Self::PreOp => "pre_op",
            Self::PostOp => "post_op",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for NoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NoteType {
    type Err = ClinicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        NoteType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ClinicError::InvalidInput(format!("unknown note type '{}'", wanted)))
    }
}

/// Status shared by encounters and their versions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncounterStatus {
    Draft,
    Finalized,
}

impl EncounterStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Finalized => "finalized",
        }
    }
}

impl fmt::Display for EncounterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncounterStatus {
    type Err = ClinicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "draft" => Ok(Self::Draft),
            "finalized" => Ok(Self::Finalized),
            other => Err(ClinicError::InvalidInput(format!(
                "unknown encounter status '{}'",
                other
            ))),
        }
    }
}

/// Raw SOAP fields as submitted by a client. Missing fields are empty.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoapInput {
    pub chief_complaint: String,
    pub history: String,
    pub exam: String,
    pub assessment: String,
    pub plan: String,
}

/// Validated SOAP content of one version. Every field is trimmed and may be empty.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoapNote {
    pub chief_complaint: ClinicalText,
    pub history: ClinicalText,
    pub exam: ClinicalText,
    pub assessment: ClinicalText,
    pub plan: ClinicalText,
}

impl TryFrom<SoapInput> for SoapNote {
    type Error = ClinicError;

    fn try_from(input: SoapInput) -> Result<Self, Self::Error> {
        fn field(name: &str, value: &str) -> ClinicResult<ClinicalText> {
            ClinicalText::new(value).map_err(|e: TextError| {
                ClinicError::InvalidInput(format!("{}: {}", name, e))
            })
        }

        Ok(Self {
            chief_complaint: field("chief_complaint", &input.chief_complaint)?,
            history: field("history", &input.history)?,
            exam: field("exam", &input.exam)?,
            assessment: field("assessment", &input.assessment)?,
            plan: field("plan", &input.plan)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Encounter {
    pub id: EncounterId,
    pub patient_id: PatientId,
    #[serde(default)]
    pub episode_id: Option<EpisodeId>,
    #[serde(default)]
    pub appointment_id: Option<AppointmentId>,
    pub note_type: NoteType,
    pub status: EncounterStatus,
    #[serde(default)]
    pub current_version_id: Option<VersionId>,
    pub created_by: ActorId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncounterVersion {
    pub id: VersionId,
    pub encounter_id: EncounterId,
    pub version_no: u32,
    pub status: EncounterStatus,
    pub content: SoapNote,
    pub created_by: ActorId,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub finalized_by: Option<ActorId>,
    #[serde(default)]
    pub finalized_at: Option<DateTime<Utc>>,
}

/// A version without its content, for history listings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VersionSummary {
    pub id: VersionId,
    pub version_no: u32,
    pub status: EncounterStatus,
    pub created_by: ActorId,
    pub created_at: DateTime<Utc>,
    pub finalized_by: Option<ActorId>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl From<&EncounterVersion> for VersionSummary {
    fn from(v: &EncounterVersion) -> Self {
        Self {
            id: v.id,
            version_no: v.version_no,
            status: v.status,
            created_by: v.created_by,
            created_at: v.created_at,
            finalized_by: v.finalized_by,
            finalized_at: v.finalized_at,
        }
    }
}

/// An encounter with its current version and the summary of every version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EncounterDetail {
    pub encounter: Encounter,
    pub current_version: Option<EncounterVersion>,
    /// Ordered by version number, ascending.
    pub versions: Vec<VersionSummary>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct NewEncounter {
    pub patient_id: PatientId,
    #[serde(default)]
    pub episode_id: Option<EpisodeId>,
    #[serde(default)]
    pub appointment_id: Option<AppointmentId>,
    #[serde(default)]
    pub note_type: NoteType,
}

/// Next free version number: one past the highest existing number, or 1.
pub fn next_version_no(versions: &[EncounterVersion]) -> u32 {
    versions.iter().map(|v| v.version_no).max().unwrap_or(0) + 1
}

#[derive(Clone)]
pub struct EncounterService {
    store: Arc<dyn ClinicStore>,
}

impl EncounterService {
    pub fn new(store: Arc<dyn ClinicStore>) -> Self {
        Self { store }
    }

    fn load_encounter(&self, id: EncounterId) -> ClinicResult<Encounter> {
        self.store
            .encounter(id)
            .with_store_context("failed to read encounter")?
            .ok_or(ClinicError::EncounterNotFound(id))
    }

    fn load_versions(&self, id: EncounterId) -> ClinicResult<Vec<EncounterVersion>> {
        self.store
            .versions(id)
            .with_store_context("failed to read encounter versions")
    }

    /// Opens a new encounter with an empty draft as version 1.
    ///
    /// The encounter and its first version are written together.
    ///
    /// # Errors
    ///
    /// - [`ClinicError::NotAuthenticated`]
    /// - [`ClinicError::PatientNotFound`] if the patient does not exist
    /// - [`ClinicError::EpisodeNotFound`] if the episode does not exist
    /// - [`ClinicError::InvalidInput`] if the episode belongs to another patient
    /// - [`ClinicError::Persistence`] if the store write fails
    pub fn create_encounter(
        &self,
        ctx: &RequestContext,
        input: NewEncounter,
    ) -> ClinicResult<EncounterId> {
        let actor = ctx.require_actor()?;

        if self
            .store
            .patient(input.patient_id)
            .with_store_context("failed to read patient")?
            .is_none()
        {
            return Err(ClinicError::PatientNotFound(input.patient_id));
        }
        if let Some(episode_id) = input.episode_id {
            let episode = require_episode(self.store.as_ref(), episode_id)?;
            if episode.patient_id != input.patient_id {
                return Err(ClinicError::InvalidInput(format!(
                    "episode {} belongs to another patient",
                    episode_id
                )));
            }
        }

        let now = Utc::now();
        let encounter_id = EncounterId::new();
        let version = EncounterVersion {
            id: VersionId::new(),
            encounter_id,
            version_no: 1,
            status: EncounterStatus::Draft,
            content: SoapNote::default(),
            created_by: actor.id(),
            created_at: now,
            finalized_by: None,
            finalized_at: None,
        };
        let encounter = Encounter {
            id: encounter_id,
            patient_id: input.patient_id,
            episode_id: input.episode_id,
            appointment_id: input.appointment_id,
            note_type: input.note_type,
            status: EncounterStatus::Draft,
            current_version_id: Some(version.id),
            created_by: actor.id(),
            created_at: now,
            updated_at: now,
        };

        let changes = ChangeSet::new(ChangeMeta {
            actor: actor.id(),
            domain: RecordDomain::Encounter,
            action: ChangeAction::Create,
            summary: "Encounter opened",
        })
        .with(Write::InsertEncounter(encounter))
        .with(Write::InsertVersion(version));
        self.store
            .apply(changes)
            .with_store_context("failed to create encounter")?;

        tracing::info!(
            "encounter {} ({}) created by {}",
            encounter_id,
            input.note_type,
            actor.id()
        );
        Ok(encounter_id)
    }

    /// Saves draft content and returns the id of the version written.
    ///
    /// Overwrites the current version when it is a draft. Otherwise (no current version, a
    /// pointer to a missing version or to a finalized one) a new draft version is created
    /// with the next number and the encounter is repointed at it.
    ///
    /// # Errors
    ///
    /// - [`ClinicError::NotAuthenticated`]
    /// - [`ClinicError::InvalidInput`] if a field is too long
    /// - [`ClinicError::EncounterNotFound`]
    /// - [`ClinicError::EncounterFinalized`] if the encounter is finalized
    /// - [`ClinicError::Conflict`] if the version was finalized concurrently
    pub fn save_draft(
        &self,
        ctx: &RequestContext,
        id: EncounterId,
        input: SoapInput,
    ) -> ClinicResult<VersionId> {
        let actor = ctx.require_actor()?;
        let content = SoapNote::try_from(input)?;

        let encounter = self.load_encounter(id)?;
        if encounter.status == EncounterStatus::Finalized {
            tracing::warn!("rejected draft save on finalized encounter {}", id);
            return Err(ClinicError::EncounterFinalized);
        }

        let versions = self.load_versions(id)?;
        let current = encounter
            .current_version_id
            .and_then(|vid| versions.iter().find(|v| v.id == vid));

        let now = Utc::now();
        let mut updated = encounter.clone();
        updated.updated_at = now;

        let meta = ChangeMeta {
            actor: actor.id(),
            domain: RecordDomain::Encounter,
            action: ChangeAction::Update,
            summary: "Draft saved",
        };

        let (version_id, changes) = match current {
            Some(draft) if draft.status == EncounterStatus::Draft => {
                let mut row = draft.clone();
                row.content = content;
                let changes = ChangeSet::new(meta)
                    .with(Write::UpdateVersion {
                        row,
                        expected: EncounterStatus::Draft,
                    })
                    .with(Write::UpdateEncounter {
                        row: updated,
                        expected: encounter.status,
                    });
                (draft.id, changes)
            }
            _ => {
                let version = EncounterVersion {
                    id: VersionId::new(),
                    encounter_id: id,
                    version_no: next_version_no(&versions),
                    status: EncounterStatus::Draft,
                    content,
                    created_by: actor.id(),
                    created_at: now,
                    finalized_by: None,
                    finalized_at: None,
                };
                tracing::info!(
                    "encounter {} has no current draft; starting version {}",
                    id,
                    version.version_no
                );
                updated.current_version_id = Some(version.id);
                updated.status = EncounterStatus::Draft;
                let version_id = version.id;
                let changes = ChangeSet::new(meta)
                    .with(Write::InsertVersion(version))
                    .with(Write::UpdateEncounter {
                        row: updated,
                        expected: encounter.status,
                    });
                (version_id, changes)
            }
        };

        self.store
            .apply(changes)
            .with_store_context("failed to save draft")?;

        tracing::debug!("draft {} of encounter {} saved by {}", version_id, id, actor.id());
        Ok(version_id)
    }

    /// Finalizes the current draft version.
    ///
    /// Requires the doctor or admin role; the role is checked before anything is read.
    ///
    /// # Errors
    ///
    /// In order of checking: [`ClinicError::NotAuthenticated`], [`ClinicError::Forbidden`],
    /// [`ClinicError::EncounterNotFound`], [`ClinicError::AlreadyFinalized`],
    /// [`ClinicError::NoCurrentVersion`], [`ClinicError::VersionNotDraft`], then store errors.
    pub fn finalize_encounter(&self, ctx: &RequestContext, id: EncounterId) -> ClinicResult<()> {
        let actor = ctx.require_any_role(CLINICAL_AUTHORITY_ROLES)?;

        let encounter = self.load_encounter(id)?;
        if encounter.status == EncounterStatus::Finalized {
            tracing::warn!("encounter {} is already finalized", id);
            return Err(ClinicError::AlreadyFinalized);
        }

        let version_id = encounter
            .current_version_id
            .ok_or(ClinicError::NoCurrentVersion)?;
        let version = self
            .load_versions(id)?
            .into_iter()
            .find(|v| v.id == version_id)
            .ok_or(ClinicError::NoCurrentVersion)?;
        if version.status != EncounterStatus::Draft {
            tracing::warn!(
                "current version {} of encounter {} is not a draft",
                version_id,
                id
            );
            return Err(ClinicError::VersionNotDraft);
        }

        let now = Utc::now();
        let mut finalized_version = version;
        finalized_version.status = EncounterStatus::Finalized;
        finalized_version.finalized_by = Some(actor.id());
        finalized_version.finalized_at = Some(now);

        let mut finalized_encounter = encounter.clone();
        finalized_encounter.status = EncounterStatus::Finalized;
        finalized_encounter.updated_at = now;

        let changes = ChangeSet::new(ChangeMeta {
            actor: actor.id(),
            domain: RecordDomain::Encounter,
            action: ChangeAction::Finalize,
            summary: "Encounter finalized",
        })
        .with(Write::UpdateVersion {
            row: finalized_version,
            expected: EncounterStatus::Draft,
        })
        .with(Write::UpdateEncounter {
            row: finalized_encounter,
            expected: encounter.status,
        });
        self.store
            .apply(changes)
            .with_store_context("failed to finalize encounter")?;

        tracing::info!(
            "encounter {} version {} finalized by {}",
            id,
            version_id,
            actor.id()
        );
        Ok(())
    }

    /// Starts a new draft version copied from the latest version and returns its id.
    ///
    /// # Errors
    ///
    /// - [`ClinicError::NotAuthenticated`]
    /// - [`ClinicError::EncounterNotFound`]
    /// - [`ClinicError::DraftAlreadyExists`] if a draft version is already open
    pub fn create_new_version(
        &self,
        ctx: &RequestContext,
        id: EncounterId,
    ) -> ClinicResult<VersionId> {
        let actor = ctx.require_actor()?;

        let encounter = self.load_encounter(id)?;
        let versions = self.load_versions(id)?;
        if versions.iter().any(|v| v.status == EncounterStatus::Draft) {
            tracing::warn!("encounter {} already has a draft version", id);
            return Err(ClinicError::DraftAlreadyExists);
        }

        let content = versions
            .iter()
            .max_by_key(|v| v.version_no)
            .map(|latest| latest.content.clone())
            .unwrap_or_default();

        let now = Utc::now();
        let version = EncounterVersion {
            id: VersionId::new(),
            encounter_id: id,
            version_no: next_version_no(&versions),
            status: EncounterStatus::Draft,
            content,
            created_by: actor.id(),
            created_at: now,
            finalized_by: None,
            finalized_at: None,
        };
        let version_id = version.id;
        let version_no = version.version_no;

        let mut reopened = encounter.clone();
        reopened.current_version_id = Some(version_id);
        reopened.status = EncounterStatus::Draft;
        reopened.updated_at = now;

        let changes = ChangeSet::new(ChangeMeta {
            actor: actor.id(),
            domain: RecordDomain::Encounter,
            action: ChangeAction::Update,
            summary: "New version started",
        })
        .with(Write::InsertVersion(version))
        .with(Write::UpdateEncounter {
            row: reopened,
            expected: encounter.status,
        });
        self.store
            .apply(changes)
            .with_store_context("failed to create encounter version")?;

        tracing::info!(
            "encounter {} version {} started by {}",
            id,
            version_no,
            actor.id()
        );
        Ok(version_id)
    }

    pub fn get_encounter(
        &self,
        ctx: &RequestContext,
        id: EncounterId,
    ) -> ClinicResult<EncounterDetail> {
        ctx.require_actor()?;

        let encounter = self.load_encounter(id)?;
        let versions = self.load_versions(id)?;
        let current_version = encounter
            .current_version_id
            .and_then(|vid| versions.iter().find(|v| v.id == vid).cloned());

        Ok(EncounterDetail {
            encounter,
            current_version,
            versions: versions.iter().map(VersionSummary::from).collect(),
        })
    }

    /// Encounters matching `filter`, most recently updated first.
    pub fn list_encounters(
        &self,
        ctx: &RequestContext,
        filter: &EncounterFilter,
    ) -> ClinicResult<Vec<Encounter>> {
        ctx.require_actor()?;
        let mut encounters = self
            .store
            .encounters(filter)
            .with_store_context("failed to list encounters")?;
        encounters.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(encounters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{Actor, Role};
    use crate::config::{CoreConfig, StoreBackend};
    use crate::episodes::{Episode, EpisodeService, NewEpisode};
    use crate::patients::{NewPatient, PatientService};
    use crate::store::{GitStore, MemoryStore, StoreError, StoreResult};
    use crate::ErrorKind;
    use std::sync::{mpsc, Mutex};
    use std::thread;
    use tempfile::TempDir;

    fn ctx(roles: &[Role]) -> RequestContext {
        RequestContext::authenticated(Actor::new(ActorId::new(), roles.iter().copied()))
    }

    fn soap(chief_complaint: &str) -> SoapInput {
        SoapInput {
            chief_complaint: chief_complaint.into(),
            ..Default::default()
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        service: EncounterService,
        patient_id: PatientId,
        doctor: RequestContext,
        nurse: RequestContext,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let doctor = ctx(&[Role::Doctor]);
            let patient_id = PatientService::new(store.clone())
                .create_patient(
                    &doctor,
                    NewPatient {
                        full_name: "Ada Lovelace".into(),
                        phone: "+15551234567".into(),
                        ..Default::default()
                    },
                )
                .unwrap();
            Self {
                service: EncounterService::new(store.clone()),
                store,
                patient_id,
                doctor,
                nurse: ctx(&[Role::Nurse]),
            }
        }

        fn open(&self, note_type: NoteType) -> EncounterId {
            self.service
                .create_encounter(
                    &self.nurse,
                    NewEncounter {
                        patient_id: self.patient_id,
                        note_type,
                        ..Default::default()
                    },
                )
                .unwrap()
        }

        fn detail(&self, id: EncounterId) -> EncounterDetail {
            self.service.get_encounter(&self.nurse, id).unwrap()
        }

        fn change_count(&self) -> usize {
            self.store.applied_changes().unwrap().len()
        }

        fn version_numbers(&self, id: EncounterId) -> Vec<u32> {
            self.detail(id).versions.iter().map(|v| v.version_no).collect()
        }

        fn draft_count(&self, id: EncounterId) -> usize {
            self.detail(id)
                .versions
                .iter()
                .filter(|v| v.status == EncounterStatus::Draft)
                .count()
        }
    }

    #[test]
    fn new_encounter_starts_with_empty_draft() {
        let fx = Fixture::new();
        let id = fx.open(NoteType::Consultation);

        let detail = fx.detail(id);
        assert_eq!(detail.encounter.status, EncounterStatus::Draft);
        assert_eq!(detail.versions.len(), 1);
        let v1 = detail.current_version.unwrap();
        assert_eq!(v1.version_no, 1);
        assert_eq!(v1.status, EncounterStatus::Draft);
        assert_eq!(v1.content, SoapNote::default());
        assert_eq!(detail.encounter.current_version_id, Some(v1.id));
    }

    #[test]
    fn create_encounter_needs_patient_and_actor() {
        let fx = Fixture::new();
        let missing = PatientId::new();
        let err = fx
            .service
            .create_encounter(
                &fx.doctor,
                NewEncounter {
                    patient_id: missing,
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, ClinicError::PatientNotFound(p) if p == missing));
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = fx
            .service
            .create_encounter(
                &RequestContext::anonymous(),
                NewEncounter {
                    patient_id: fx.patient_id,
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, ClinicError::NotAuthenticated));
    }

    #[test]
    fn save_draft_trims_and_overwrites_in_place() {
        let fx = Fixture::new();
        let id = fx.open(NoteType::Consultation);

        let first = fx
            .service
            .save_draft(&fx.nurse, id, soap("  headache  "))
            .unwrap();
        let second = fx
            .service
            .save_draft(
                &fx.nurse,
                id,
                SoapInput {
                    chief_complaint: "headache".into(),
                    plan: " rest\n".into(),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(first, second);
        let current = fx.detail(id).current_version.unwrap();
        assert_eq!(current.content.chief_complaint.as_str(), "headache");
        assert_eq!(current.content.plan.as_str(), "rest");
        assert_eq!(fx.version_numbers(id), vec![1]);
    }

    #[test]
    fn save_draft_bumps_updated_at() {
        let fx = Fixture::new();
        let id = fx.open(NoteType::Consultation);
        let before = fx.detail(id).encounter.updated_at;

        fx.service.save_draft(&fx.nurse, id, soap("cough")).unwrap();

        assert!(fx.detail(id).encounter.updated_at >= before);
        assert_eq!(fx.change_count(), 3);
    }

    #[test]
    fn save_draft_rejects_oversized_fields() {
        let fx = Fixture::new();
        let id = fx.open(NoteType::Consultation);
        let long = "x".repeat(clinic_types::MAX_CLINICAL_TEXT_CHARS + 1);
        let err = fx.service.save_draft(&fx.nurse, id, soap(&long)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn save_draft_on_missing_encounter() {
        let fx = Fixture::new();
        let missing = EncounterId::new();
        let err = fx
            .service
            .save_draft(&fx.nurse, missing, soap("x"))
            .unwrap_err();
        assert!(matches!(err, ClinicError::EncounterNotFound(e) if e == missing));
    }

    #[test]
    fn finalized_encounter_rejects_edits_and_keeps_content() {
        let fx = Fixture::new();
        let id = fx.open(NoteType::Consultation);
        fx.service.save_draft(&fx.nurse, id, soap("fever")).unwrap();
        fx.service.finalize_encounter(&fx.doctor, id).unwrap();
        let changes = fx.change_count();

        let err = fx
            .service
            .save_draft(&fx.nurse, id, soap("edited"))
            .unwrap_err();

        assert!(matches!(err, ClinicError::EncounterFinalized));
        assert_eq!(
            err.to_string(),
            "cannot edit finalized encounter; create a new version first"
        );
        assert_eq!(fx.change_count(), changes);
        let current = fx.detail(id).current_version.unwrap();
        assert_eq!(current.content.chief_complaint.as_str(), "fever");
        assert_eq!(current.status, EncounterStatus::Finalized);
    }

    #[test]
    fn finalize_stamps_version_and_encounter() {
        let fx = Fixture::new();
        let id = fx.open(NoteType::Consultation);
        fx.service.finalize_encounter(&fx.doctor, id).unwrap();

        let detail = fx.detail(id);
        assert_eq!(detail.encounter.status, EncounterStatus::Finalized);
        let v1 = detail.current_version.unwrap();
        assert_eq!(v1.status, EncounterStatus::Finalized);
        assert_eq!(v1.finalized_by, Some(fx.doctor.actor().unwrap().id()));
        assert!(v1.finalized_at.is_some());
    }

    #[test]
    fn finalize_requires_clinical_authority_and_changes_nothing() {
        let fx = Fixture::new();
        let id = fx.open(NoteType::Consultation);
        let changes = fx.change_count();

        let refused: [&[Role]; 4] = [&[Role::Nurse], &[Role::Reception], &[Role::Anesthesia], &[]];
        for roles in refused {
            let err = fx
                .service
                .finalize_encounter(&ctx(roles), id)
                .unwrap_err();
            assert!(matches!(err, ClinicError::Forbidden { .. }));
        }

        let err = fx
            .service
            .finalize_encounter(&RequestContext::anonymous(), id)
            .unwrap_err();
        assert!(matches!(err, ClinicError::NotAuthenticated));

        assert_eq!(fx.change_count(), changes);
        assert_eq!(fx.detail(id).encounter.status, EncounterStatus::Draft);
    }

    #[test]
    fn forbidden_is_reported_before_not_found() {
        let fx = Fixture::new();
        let err = fx
            .service
            .finalize_encounter(&fx.nurse, EncounterId::new())
            .unwrap_err();
        assert!(matches!(err, ClinicError::Forbidden { .. }));
    }

    #[test]
    fn admin_may_finalize() {
        let fx = Fixture::new();
        let id = fx.open(NoteType::Consultation);
        fx.service
            .finalize_encounter(&ctx(&[Role::Admin]), id)
            .unwrap();
        assert_eq!(fx.detail(id).encounter.status, EncounterStatus::Finalized);
    }

    #[test]
    fn second_finalize_fails_and_first_persists() {
        let fx = Fixture::new();
        let id = fx.open(NoteType::Consultation);
        fx.service.finalize_encounter(&fx.doctor, id).unwrap();
        let first = fx.detail(id).current_version.unwrap();

        let err = fx
            .service
            .finalize_encounter(&fx.doctor, id)
            .unwrap_err();

        assert!(matches!(err, ClinicError::AlreadyFinalized));
        assert_eq!(fx.detail(id).current_version.unwrap(), first);
    }

    #[test]
    fn new_version_copies_latest_content() {
        let fx = Fixture::new();
        let id = fx.open(NoteType::Consultation);
        fx.service
            .save_draft(
                &fx.nurse,
                id,
                SoapInput {
                    chief_complaint: "rash".into(),
                    assessment: "contact dermatitis".into(),
                    ..Default::default()
                },
            )
            .unwrap();
        fx.service.finalize_encounter(&fx.doctor, id).unwrap();

        let v2 = fx.service.create_new_version(&fx.nurse, id).unwrap();

        let detail = fx.detail(id);
        assert_eq!(detail.encounter.status, EncounterStatus::Draft);
        assert_eq!(detail.encounter.current_version_id, Some(v2));
        let current = detail.current_version.unwrap();
        assert_eq!(current.version_no, 2);
        assert_eq!(current.status, EncounterStatus::Draft);
        assert_eq!(current.content.chief_complaint.as_str(), "rash");
        assert_eq!(current.content.assessment.as_str(), "contact dermatitis");
    }

    #[test]
    fn new_version_refuses_second_draft() {
        let fx = Fixture::new();
        let id = fx.open(NoteType::Consultation);

        let err = fx.service.create_new_version(&fx.nurse, id).unwrap_err();

        assert!(matches!(err, ClinicError::DraftAlreadyExists));
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(fx.draft_count(id), 1);
    }

    #[test]
    fn version_numbers_are_monotonic() {
        let fx = Fixture::new();
        let id = fx.open(NoteType::Consultation);

        for round in 0..3 {
            fx.service
                .save_draft(&fx.nurse, id, soap(&format!("round {round}")))
                .unwrap();
            fx.service.finalize_encounter(&fx.doctor, id).unwrap();
            fx.service.create_new_version(&fx.nurse, id).unwrap();
            assert!(fx.draft_count(id) <= 1);
        }

        assert_eq!(fx.version_numbers(id), vec![1, 2, 3, 4]);
        assert_eq!(fx.draft_count(id), 1);
    }

    #[test]
    fn follow_up_scenario() {
        let fx = Fixture::new();
        let id = fx.open(NoteType::FollowUp);
        assert_eq!(fx.detail(id).encounter.note_type, NoteType::FollowUp);

        fx.service
            .save_draft(&fx.nurse, id, soap("pain improving"))
            .unwrap();
        fx.service.finalize_encounter(&fx.doctor, id).unwrap();
        let v2 = fx.service.create_new_version(&fx.doctor, id).unwrap();

        let copied = fx.detail(id).current_version.unwrap();
        assert_eq!(copied.id, v2);
        assert_eq!(copied.content.chief_complaint.as_str(), "pain improving");

        let saved = fx
            .service
            .save_draft(&fx.nurse, id, soap("pain improving; discharged"))
            .unwrap();
        assert_eq!(saved, v2);

        let store_versions = fx.store.versions(id).unwrap();
        assert_eq!(store_versions.len(), 2);
        assert_eq!(
            store_versions[0].content.chief_complaint.as_str(),
            "pain improving"
        );
        assert_eq!(store_versions[0].status, EncounterStatus::Finalized);
        assert_eq!(
            store_versions[1].content.chief_complaint.as_str(),
            "pain improving; discharged"
        );
        assert_eq!(store_versions[1].status, EncounterStatus::Draft);
    }

    #[test]
    fn save_draft_heals_encounter_pointing_at_finalized_version() {
        let fx = Fixture::new();
        let id = fx.open(NoteType::Consultation);

        // Drift: version finalized while the encounter row still says draft.
        let mut version = fx.store.versions(id).unwrap().remove(0);
        version.status = EncounterStatus::Finalized;
        fx.store
            .apply(
                ChangeSet::new(ChangeMeta {
                    actor: ActorId::new(),
                    domain: RecordDomain::Encounter,
                    action: ChangeAction::Finalize,
                    summary: "Drift",
                })
                .with(Write::UpdateVersion {
                    row: version,
                    expected: EncounterStatus::Draft,
                }),
            )
            .unwrap();

        let new_id = fx.service.save_draft(&fx.nurse, id, soap("after drift")).unwrap();

        let detail = fx.detail(id);
        assert_eq!(detail.encounter.current_version_id, Some(new_id));
        assert_eq!(fx.version_numbers(id), vec![1, 2]);
        assert_eq!(
            detail.current_version.unwrap().content.chief_complaint.as_str(),
            "after drift"
        );
    }

    #[test]
    fn finalize_reports_version_not_draft_on_drift() {
        let fx = Fixture::new();
        let id = fx.open(NoteType::Consultation);
        let mut version = fx.store.versions(id).unwrap().remove(0);
        version.status = EncounterStatus::Finalized;
        fx.store
            .apply(
                ChangeSet::new(ChangeMeta {
                    actor: ActorId::new(),
                    domain: RecordDomain::Encounter,
                    action: ChangeAction::Finalize,
                    summary: "Drift",
                })
                .with(Write::UpdateVersion {
                    row: version,
                    expected: EncounterStatus::Draft,
                }),
            )
            .unwrap();

        let err = fx.service.finalize_encounter(&fx.doctor, id).unwrap_err();
        assert!(matches!(err, ClinicError::VersionNotDraft));
    }

    #[test]
    fn list_filters_and_orders_by_recent_update() {
        let fx = Fixture::new();
        let older = fx.open(NoteType::Consultation);
        let newer = fx.open(NoteType::PreOp);
        fx.service.save_draft(&fx.nurse, older, soap("bumped")).unwrap();
        fx.service.finalize_encounter(&fx.doctor, newer).unwrap();

        let all = fx
            .service
            .list_encounters(&fx.nurse, &EncounterFilter::default())
            .unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].updated_at >= all[1].updated_at);

        let finalized = fx
            .service
            .list_encounters(
                &fx.nurse,
                &EncounterFilter {
                    status: Some(EncounterStatus::Finalized),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(
            finalized.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![newer]
        );

        let other_patient = fx
            .service
            .list_encounters(
                &fx.nurse,
                &EncounterFilter {
                    patient_id: Some(PatientId::new()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(other_patient.is_empty());
    }

    /// Reads pass through; every write fails.
    struct ReadOnlyStore(MemoryStore);

    impl ClinicStore for ReadOnlyStore {
        fn patient(&self, id: PatientId) -> StoreResult<Option<crate::Patient>> {
            self.0.patient(id)
        }
        fn patients(&self) -> StoreResult<Vec<crate::Patient>> {
            self.0.patients()
        }
        fn episode(&self, id: EpisodeId) -> StoreResult<Option<Episode>> {
            self.0.episode(id)
        }
        fn episodes(&self, patient_id: Option<PatientId>) -> StoreResult<Vec<Episode>> {
            self.0.episodes(patient_id)
        }
        fn encounter(&self, id: EncounterId) -> StoreResult<Option<Encounter>> {
            self.0.encounter(id)
        }
        fn encounters(&self, filter: &EncounterFilter) -> StoreResult<Vec<Encounter>> {
            self.0.encounters(filter)
        }
        fn versions(&self, id: EncounterId) -> StoreResult<Vec<EncounterVersion>> {
            self.0.versions(id)
        }
        fn assessment(
            &self,
            id: crate::AssessmentId,
        ) -> StoreResult<Option<crate::AnesthesiaAssessment>> {
            self.0.assessment(id)
        }
        fn assessment_for_episode(
            &self,
            id: EpisodeId,
        ) -> StoreResult<Option<crate::AnesthesiaAssessment>> {
            self.0.assessment_for_episode(id)
        }
        fn apply(&self, _changes: ChangeSet) -> StoreResult<()> {
            Err(StoreError::FileWrite(std::io::Error::other("disk full")))
        }
    }

    #[test]
    fn store_failure_surfaces_as_persistence_error() {
        let fx = Fixture::new();
        let id = fx.open(NoteType::Consultation);

        let inner = MemoryStore::new();
        let patient = fx.store.patient(fx.patient_id).unwrap().unwrap();
        inner
            .apply(
                ChangeSet::new(ChangeMeta {
                    actor: ActorId::new(),
                    domain: RecordDomain::Patient,
                    action: ChangeAction::Create,
                    summary: "Copy",
                })
                .with(Write::InsertPatient(patient)),
            )
            .unwrap();
        let service = EncounterService::new(Arc::new(ReadOnlyStore(inner)));

        let err = service
            .create_encounter(
                &fx.doctor,
                NewEncounter {
                    patient_id: fx.patient_id,
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PersistenceFailure);
        assert!(err.to_string().starts_with("failed to create encounter"));

        assert_eq!(fx.detail(id).versions.len(), 1);
    }

    /// Delegates to `inner`, running a competing writer once just before the first change set
    /// reaches it.
    struct RacingStore {
        inner: Arc<dyn ClinicStore>,
        competitor: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl RacingStore {
        fn new(inner: Arc<dyn ClinicStore>, competitor: impl FnOnce() + Send + 'static) -> Self {
            Self {
                inner,
                competitor: Mutex::new(Some(Box::new(competitor))),
            }
        }
    }

    impl ClinicStore for RacingStore {
        fn patient(&self, id: PatientId) -> StoreResult<Option<crate::Patient>> {
            self.inner.patient(id)
        }
        fn patients(&self) -> StoreResult<Vec<crate::Patient>> {
            self.inner.patients()
        }
        fn episode(&self, id: EpisodeId) -> StoreResult<Option<Episode>> {
            self.inner.episode(id)
        }
        fn episodes(&self, patient_id: Option<PatientId>) -> StoreResult<Vec<Episode>> {
            self.inner.episodes(patient_id)
        }
        fn encounter(&self, id: EncounterId) -> StoreResult<Option<Encounter>> {
            self.inner.encounter(id)
        }
        fn encounters(&self, filter: &EncounterFilter) -> StoreResult<Vec<Encounter>> {
            self.inner.encounters(filter)
        }
        fn versions(&self, id: EncounterId) -> StoreResult<Vec<EncounterVersion>> {
            self.inner.versions(id)
        }
        fn assessment(
            &self,
            id: crate::AssessmentId,
        ) -> StoreResult<Option<crate::AnesthesiaAssessment>> {
            self.inner.assessment(id)
        }
        fn assessment_for_episode(
            &self,
            id: EpisodeId,
        ) -> StoreResult<Option<crate::AnesthesiaAssessment>> {
            self.inner.assessment_for_episode(id)
        }
        fn apply(&self, changes: ChangeSet) -> StoreResult<()> {
            let competitor = self.competitor.lock().unwrap().take();
            if let Some(competitor) = competitor {
                competitor();
            }
            self.inner.apply(changes)
        }
    }

    fn git_store(temp: &TempDir) -> Arc<dyn ClinicStore> {
        let cfg = CoreConfig::new(temp.path().to_path_buf(), "Riverside Clinic", StoreBackend::Git)
            .unwrap();
        Arc::new(GitStore::open(Arc::new(cfg)).unwrap())
    }

    /// Registers a patient and opens an encounter with some draft content.
    fn drafted(store: &Arc<dyn ClinicStore>, doctor: &RequestContext) -> EncounterId {
        let patient_id = PatientService::new(store.clone())
            .create_patient(
                doctor,
                NewPatient {
                    full_name: "Ada Lovelace".into(),
                    phone: "+15551234567".into(),
                    ..Default::default()
                },
            )
            .unwrap();
        let service = EncounterService::new(store.clone());
        let id = service
            .create_encounter(
                doctor,
                NewEncounter {
                    patient_id,
                    ..Default::default()
                },
            )
            .unwrap();
        service.save_draft(doctor, id, soap("chest pain")).unwrap();
        id
    }

    fn assert_save_after_concurrent_finalize_conflicts(store: Arc<dyn ClinicStore>) {
        let doctor = ctx(&[Role::Doctor]);
        let id = drafted(&store, &doctor);

        let finalizer = EncounterService::new(store.clone());
        let finalizing_doctor = doctor.clone();
        let racing = EncounterService::new(Arc::new(RacingStore::new(store.clone(), move || {
            finalizer.finalize_encounter(&finalizing_doctor, id).unwrap();
        })));

        let err = racing.save_draft(&doctor, id, soap("late edit")).unwrap_err();
        assert!(matches!(err, ClinicError::Conflict(_)), "{err:?}");
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        let versions = store.versions(id).unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].status, EncounterStatus::Finalized);
        assert_eq!(versions[0].content.chief_complaint.as_str(), "chest pain");
        assert_eq!(
            store.encounter(id).unwrap().unwrap().status,
            EncounterStatus::Finalized
        );
    }

    #[test]
    fn save_draft_after_concurrent_finalize_conflicts_in_memory() {
        assert_save_after_concurrent_finalize_conflicts(Arc::new(MemoryStore::new()));
    }

    #[test]
    fn save_draft_after_concurrent_finalize_conflicts_in_git() {
        let temp = TempDir::new().unwrap();
        assert_save_after_concurrent_finalize_conflicts(git_store(&temp));
    }

    #[test]
    fn finalize_after_concurrent_save_conflicts() {
        let store: Arc<dyn ClinicStore> = Arc::new(MemoryStore::new());
        let doctor = ctx(&[Role::Doctor]);
        let id = drafted(&store, &doctor);

        let editor = EncounterService::new(store.clone());
        let editing_doctor = doctor.clone();
        let racing = EncounterService::new(Arc::new(RacingStore::new(store.clone(), move || {
            editor.save_draft(&editing_doctor, id, soap("revised")).unwrap();
        })));

        let err = racing.finalize_encounter(&doctor, id).unwrap_err();
        assert!(matches!(err, ClinicError::Conflict(_)), "{err:?}");

        let version = store.versions(id).unwrap().remove(0);
        assert_eq!(version.status, EncounterStatus::Draft);
        assert_eq!(version.content.chief_complaint.as_str(), "revised");
    }

    #[test]
    fn concurrent_saves_and_finalize_on_git_store() {
        let temp = TempDir::new().unwrap();
        let store = git_store(&temp);
        let doctor = ctx(&[Role::Doctor]);
        let id = drafted(&store, &doctor);
        let service = EncounterService::new(store.clone());

        let (first_saved, wait_for_first) = mpsc::channel();
        let writer = {
            let service = service.clone();
            let doctor = doctor.clone();
            thread::spawn(move || {
                let mut outcomes = Vec::new();
                for i in 0..20 {
                    let text = format!("edit {}", i);
                    outcomes.push((text.clone(), service.save_draft(&doctor, id, soap(&text))));
                    if i == 0 {
                        first_saved.send(()).unwrap();
                    }
                }
                outcomes
            })
        };

        wait_for_first.recv().unwrap();
        loop {
            match service.finalize_encounter(&doctor, id) {
                Ok(()) => break,
                Err(ClinicError::Conflict(_)) => continue,
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        let outcomes = writer.join().unwrap();

        let saved: Vec<&str> = outcomes
            .iter()
            .take_while(|(_, r)| r.is_ok())
            .map(|(text, _)| text.as_str())
            .collect();
        for (_, rejected) in &outcomes[saved.len()..] {
            assert!(matches!(
                rejected,
                Err(ClinicError::EncounterFinalized | ClinicError::Conflict(_))
            ));
        }

        let versions = store.versions(id).unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].status, EncounterStatus::Finalized);
        assert_eq!(
            Some(versions[0].content.chief_complaint.as_str()),
            saved.last().copied()
        );
    }

    #[test]
    fn encounter_episode_must_exist_and_match_patient() {
        let fx = Fixture::new();
        let episodes = EpisodeService::new(fx.store.clone());
        let episode_id = episodes
            .create_episode(
                &fx.nurse,
                NewEpisode {
                    patient_id: fx.patient_id,
                    procedure_name: "Cataract surgery".into(),
                    ..Default::default()
                },
            )
            .unwrap();

        let id = fx
            .service
            .create_encounter(
                &fx.nurse,
                NewEncounter {
                    patient_id: fx.patient_id,
                    episode_id: Some(episode_id),
                    note_type: NoteType::PreOp,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(fx.detail(id).encounter.episode_id, Some(episode_id));

        let missing = EpisodeId::new();
        let err = fx
            .service
            .create_encounter(
                &fx.nurse,
                NewEncounter {
                    patient_id: fx.patient_id,
                    episode_id: Some(missing),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, ClinicError::EpisodeNotFound(e) if e == missing));

        let other_patient = PatientService::new(fx.store.clone())
            .create_patient(
                &fx.nurse,
                NewPatient {
                    full_name: "Grace Hopper".into(),
                    phone: "+15557654321".into(),
                    ..Default::default()
                },
            )
            .unwrap();
        let err = fx
            .service
            .create_encounter(
                &fx.nurse,
                NewEncounter {
                    patient_id: other_patient,
                    episode_id: Some(episode_id),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn git_backed_lifecycle() {
        let temp = TempDir::new().unwrap();
        let cfg = CoreConfig::new(temp.path().to_path_buf(), "Riverside Clinic", StoreBackend::Git)
            .unwrap();
        let store: Arc<dyn ClinicStore> = Arc::new(GitStore::open(Arc::new(cfg)).unwrap());
        let doctor = ctx(&[Role::Doctor]);

        let patient_id = PatientService::new(store.clone())
            .create_patient(
                &doctor,
                NewPatient {
                    full_name: "Ada Lovelace".into(),
                    phone: "+15551234567".into(),
                    ..Default::default()
                },
            )
            .unwrap();
        let service = EncounterService::new(store.clone());
        let id = service
            .create_encounter(
                &doctor,
                NewEncounter {
                    patient_id,
                    note_type: NoteType::PostOp,
                    ..Default::default()
                },
            )
            .unwrap();
        service.save_draft(&doctor, id, soap("wound clean")).unwrap();
        service.finalize_encounter(&doctor, id).unwrap();
        service.create_new_version(&doctor, id).unwrap();
        service.save_draft(&doctor, id, soap("sutures out")).unwrap();

        let detail = service.get_encounter(&doctor, id).unwrap();
        assert_eq!(
            detail
                .versions
                .iter()
                .map(|v| (v.version_no, v.status))
                .collect::<Vec<_>>(),
            vec![(1, EncounterStatus::Finalized), (2, EncounterStatus::Draft)]
        );
        assert_eq!(
            detail.current_version.unwrap().content.chief_complaint.as_str(),
            "sutures out"
        );
        let v1 = store.versions(id).unwrap().remove(0);
        assert_eq!(v1.content.chief_complaint.as_str(), "wound clean");
    }
}
