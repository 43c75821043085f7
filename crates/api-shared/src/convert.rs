//! Conversions between protobuf messages and core types.
//!
//! Protobuf strings stand in for optional values: an empty string means absent, in both
//! directions. Timestamps are rendered as RFC 3339.

use crate::pb;
use chrono::{DateTime, SecondsFormat, Utc};
use clinic_core::episodes::parse_scheduled_at;
use clinic_core::patients::parse_birth_date;
use clinic_core::{
    AnesthesiaAssessment, AssessmentFields, ClinicError, ClinicResult, Encounter, EncounterDetail,
    EncounterFilter, EncounterVersion, Episode, NewEncounter, NewEpisode, NewPatient, Patient,
    SoapInput, SoapNote, VersionSummary,
};
use std::fmt::Display;
use std::str::FromStr;

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn or_empty<T: Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Parses a required value, such as an id taken from a path or request field.
pub fn required<T>(field: &str, raw: &str) -> ClinicResult<T>
where
    T: FromStr<Err = ClinicError>,
{
    if raw.trim().is_empty() {
        return Err(ClinicError::InvalidInput(format!("{} is required", field)));
    }
    raw.parse()
}

/// Parses an optional value; empty input is `None`.
pub fn optional<T>(raw: &str) -> ClinicResult<Option<T>>
where
    T: FromStr<Err = ClinicError>,
{
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse().map(Some)
}

fn optional_text(raw: String) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

impl From<&Patient> for pb::Patient {
    fn from(p: &Patient) -> Self {
        Self {
            id: p.id.to_string(),
            full_name: p.full_name.to_string(),
            phone_e164: p.phone_e164.clone(),
            gender: or_empty(p.gender),
            date_of_birth: or_empty(p.date_of_birth.map(|d| d.format("%Y-%m-%d"))),
            created_by: p.created_by.to_string(),
            created_at: timestamp(&p.created_at),
        }
    }
}

impl From<&Episode> for pb::Episode {
    fn from(e: &Episode) -> Self {
        Self {
            id: e.id.to_string(),
            patient_id: e.patient_id.to_string(),
            procedure_name: e.procedure_name.to_string(),
            status: e.status.to_string(),
            scheduled_at: or_empty(e.scheduled_at.as_ref().map(timestamp)),
            notes: e.notes.clone().unwrap_or_default(),
            created_by: e.created_by.to_string(),
            created_at: timestamp(&e.created_at),
        }
    }
}

impl From<&SoapNote> for pb::SoapContent {
    fn from(note: &SoapNote) -> Self {
        Self {
            chief_complaint: note.chief_complaint.to_string(),
            history: note.history.to_string(),
            exam: note.exam.to_string(),
            assessment: note.assessment.to_string(),
            plan: note.plan.to_string(),
        }
    }
}

impl From<&Encounter> for pb::Encounter {
    fn from(e: &Encounter) -> Self {
        Self {
            id: e.id.to_string(),
            patient_id: e.patient_id.to_string(),
            episode_id: or_empty(e.episode_id),
            appointment_id: or_empty(e.appointment_id),
            note_type: e.note_type.to_string(),
            status: e.status.to_string(),
            current_version_id: or_empty(e.current_version_id),
            created_by: e.created_by.to_string(),
            created_at: timestamp(&e.created_at),
            updated_at: timestamp(&e.updated_at),
        }
    }
}

impl From<&EncounterVersion> for pb::EncounterVersion {
    fn from(v: &EncounterVersion) -> Self {
        Self {
            id: v.id.to_string(),
            version_no: v.version_no,
            status: v.status.to_string(),
            content: Some(pb::SoapContent::from(&v.content)),
            created_by: v.created_by.to_string(),
            created_at: timestamp(&v.created_at),
            finalized_by: or_empty(v.finalized_by),
            finalized_at: or_empty(v.finalized_at.as_ref().map(timestamp)),
        }
    }
}

impl From<&VersionSummary> for pb::VersionSummary {
    fn from(v: &VersionSummary) -> Self {
        Self {
            id: v.id.to_string(),
            version_no: v.version_no,
            status: v.status.to_string(),
            created_by: v.created_by.to_string(),
            created_at: timestamp(&v.created_at),
            finalized_by: or_empty(v.finalized_by),
            finalized_at: or_empty(v.finalized_at.as_ref().map(timestamp)),
        }
    }
}

impl From<&EncounterDetail> for pb::EncounterDetail {
    fn from(d: &EncounterDetail) -> Self {
        Self {
            encounter: Some(pb::Encounter::from(&d.encounter)),
            current_version: d.current_version.as_ref().map(pb::EncounterVersion::from),
            versions: d.versions.iter().map(pb::VersionSummary::from).collect(),
        }
    }
}

impl From<&AssessmentFields> for pb::AssessmentFields {
    fn from(f: &AssessmentFields) -> Self {
        Self {
            asa_class: or_empty(f.asa_class.as_ref()),
            mallampati: or_empty(f.mallampati.as_ref()),
            comorbidities: f
                .comorbidities
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            allergies: or_empty(f.allergies.as_ref()),
            current_meds: or_empty(f.current_meds.as_ref()),
            fasting_status: or_empty(f.fasting_status.as_ref()),
            planned_anesthesia: or_empty(f.planned_anesthesia.as_ref()),
            notes: or_empty(f.notes.as_ref()),
        }
    }
}

impl From<&AnesthesiaAssessment> for pb::Assessment {
    fn from(a: &AnesthesiaAssessment) -> Self {
        Self {
            id: a.id.to_string(),
            episode_id: a.episode_id.to_string(),
            fields: Some(pb::AssessmentFields::from(&a.fields)),
            is_finalized: a.is_finalized,
            finalized_by: or_empty(a.finalized_by),
            finalized_at: or_empty(a.finalized_at.as_ref().map(timestamp)),
            created_by: a.created_by.to_string(),
            created_at: timestamp(&a.created_at),
            updated_at: timestamp(&a.updated_at),
        }
    }
}

pub fn new_patient(req: pb::CreatePatientReq) -> ClinicResult<NewPatient> {
    let date_of_birth = match req.date_of_birth.trim() {
        "" => None,
        raw => Some(parse_birth_date(raw)?),
    };
    Ok(NewPatient {
        full_name: req.full_name,
        phone: req.phone,
        gender: optional(&req.gender)?,
        date_of_birth,
    })
}

pub fn new_episode(req: pb::CreateEpisodeReq) -> ClinicResult<NewEpisode> {
    let scheduled_at = match req.scheduled_at.trim() {
        "" => None,
        raw => Some(parse_scheduled_at(raw)?),
    };
    Ok(NewEpisode {
        patient_id: required("patient_id", &req.patient_id)?,
        procedure_name: req.procedure_name,
        status: optional(&req.status)?.unwrap_or_default(),
        scheduled_at,
        notes: optional_text(req.notes),
    })
}

pub fn new_encounter(req: pb::CreateEncounterReq) -> ClinicResult<NewEncounter> {
    Ok(NewEncounter {
        patient_id: required("patient_id", &req.patient_id)?,
        episode_id: optional(&req.episode_id)?,
        appointment_id: optional(&req.appointment_id)?,
        note_type: optional(&req.note_type)?.unwrap_or_default(),
    })
}

pub fn soap_input(content: Option<pb::SoapContent>) -> SoapInput {
    let content = content.unwrap_or_default();
    SoapInput {
        chief_complaint: content.chief_complaint,
        history: content.history,
        exam: content.exam,
        assessment: content.assessment,
        plan: content.plan,
    }
}

pub fn encounter_filter(req: &pb::ListEncountersReq) -> ClinicResult<EncounterFilter> {
    Ok(EncounterFilter {
        patient_id: optional(&req.patient_id)?,
        episode_id: optional(&req.episode_id)?,
        status: optional(&req.status)?,
    })
}

pub fn assessment_fields(fields: Option<pb::AssessmentFields>) -> AssessmentFields {
    let f = fields.unwrap_or_default();
    AssessmentFields {
        asa_class: optional_text(f.asa_class),
        mallampati: optional_text(f.mallampati),
        comorbidities: f.comorbidities.into_iter().collect(),
        allergies: optional_text(f.allergies),
        current_meds: optional_text(f.current_meds),
        fasting_status: optional_text(f.fasting_status),
        planned_anesthesia: optional_text(f.planned_anesthesia),
        notes: optional_text(f.notes),
    }
}
