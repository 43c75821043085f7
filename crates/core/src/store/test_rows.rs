//! Row builders for store tests.

use super::{ChangeAction, ChangeMeta, RecordDomain};
use crate::encounters::{Encounter, EncounterStatus, EncounterVersion, NoteType, SoapNote};
use crate::episodes::{Episode, EpisodeStatus};
use crate::ids::{ActorId, EncounterId, EpisodeId, PatientId, VersionId};
use crate::patients::Patient;
use chrono::Utc;
use clinic_types::NonEmptyText;

pub(crate) fn meta(domain: RecordDomain, action: ChangeAction) -> ChangeMeta {
    ChangeMeta {
        actor: ActorId::new(),
        domain,
        action,
        summary: "Test change",
    }
}

pub(crate) fn patient() -> Patient {
    Patient {
        id: PatientId::new(),
        full_name: NonEmptyText::new("Ada Lovelace").unwrap(),
        phone_e164: "+15551234567".into(),
        gender: None,
        date_of_birth: None,
        created_by: ActorId::new(),
        created_at: Utc::now(),
    }
}

pub(crate) fn episode(patient_id: PatientId) -> Episode {
    Episode {
        id: EpisodeId::new(),
        patient_id,
        procedure_name: NonEmptyText::new("Knee arthroscopy").unwrap(),
        status: EpisodeStatus::Planned,
        scheduled_at: None,
        notes: None,
        created_by: ActorId::new(),
        created_at: Utc::now(),
    }
}

pub(crate) fn encounter(patient_id: PatientId, current: Option<VersionId>) -> Encounter {
    let now = Utc::now();
    Encounter {
        id: EncounterId::new(),
        patient_id,
        episode_id: None,
        appointment_id: None,
        note_type: NoteType::Consultation,
        status: EncounterStatus::Draft,
        current_version_id: current,
        created_by: ActorId::new(),
        created_at: now,
        updated_at: now,
    }
}

pub(crate) fn version(encounter_id: EncounterId, version_no: u32) -> EncounterVersion {
    EncounterVersion {
        id: VersionId::new(),
        encounter_id,
        version_no,
        status: EncounterStatus::Draft,
        content: SoapNote::default(),
        created_by: ActorId::new(),
        created_at: Utc::now(),
        finalized_by: None,
        finalized_at: None,
    }
}
