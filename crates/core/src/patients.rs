//! Patient registry.
//!
//! Patients are created once and never edited or deleted here. Encounters reference them by
//! [`PatientId`].

use crate::actor::RequestContext;
use crate::error::{ClinicError, ClinicResult, StoreResultExt};
use crate::ids::{ActorId, PatientId};
use crate::store::{ChangeAction, ChangeMeta, ChangeSet, ClinicStore, RecordDomain, Write};
use chrono::{DateTime, NaiveDate, Utc};
use clinic_types::NonEmptyText;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Female,
    Male,
    Other,
    Unknown,
}

impl Gender {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Female => "female",
            Self::Male => "male",
            Self::Other => "other",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Gender {
    type Err = ClinicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "female" => Ok(Self::Female),
            "male" => Ok(Self::Male),
            "other" => Ok(Self::Other),
            "unknown" => Ok(Self::Unknown),
            other => Err(ClinicError::InvalidInput(format!(
                "unknown gender '{}'",
                other
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patient {
    pub id: PatientId,
    pub full_name: NonEmptyText,
    pub phone_e164: String,
    #[serde(default)]
    pub gender: Option<Gender>,
    #[serde(default)]
    pub date_of_birth: Option<NaiveDate>,
    pub created_by: ActorId,
    pub created_at: DateTime<Utc>,
}

/// Input for [`PatientService::create_patient`]. Strings are validated on creation.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct NewPatient {
    pub full_name: String,
    pub phone: String,
    #[serde(default)]
    pub gender: Option<Gender>,
    #[serde(default)]
    pub date_of_birth: Option<NaiveDate>,
}

/// Validates an E.164 phone number: `+`, then 8 to 15 digits, the first not zero.
///
/// Spaces, hyphens and parentheses are stripped first so `+1 (555) 123-4567` is accepted and
/// stored as `+15551234567`.
pub fn normalise_phone(input: &str) -> ClinicResult<String> {
    let compact: String = input
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
        .collect();

    let invalid =
        || ClinicError::InvalidInput("phone must be in E.164 format, e.g. +15551234567".into());

    let digits = compact.strip_prefix('+').ok_or_else(invalid)?;
    if !(8..=15).contains(&digits.len())
        || !digits.bytes().all(|b| b.is_ascii_digit())
        || digits.starts_with('0')
    {
        return Err(invalid());
    }
    Ok(compact)
}

/// Parses a `YYYY-MM-DD` date of birth.
pub fn parse_birth_date(input: &str) -> ClinicResult<NaiveDate> {
    NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d").map_err(|e| {
        ClinicError::InvalidInput(format!("date_of_birth must be YYYY-MM-DD: {}", e))
    })
}

#[derive(Clone)]
pub struct PatientService {
    store: Arc<dyn ClinicStore>,
}

impl PatientService {
    pub fn new(store: Arc<dyn ClinicStore>) -> Self {
        Self { store }
    }

    /// Registers a patient.
    ///
    /// # Errors
    ///
    /// - [`ClinicError::NotAuthenticated`] without an actor
    /// - [`ClinicError::InvalidInput`] for a blank name, a malformed phone or a birth date in
    ///   the future
    pub fn create_patient(
        &self,
        ctx: &RequestContext,
        input: NewPatient,
    ) -> ClinicResult<PatientId> {
        let actor = ctx.require_actor()?;

        let full_name = NonEmptyText::new(&input.full_name)
            .map_err(|_| ClinicError::InvalidInput("full_name is required".into()))?;
        if input.phone.trim().is_empty() {
            return Err(ClinicError::InvalidInput("phone is required".into()));
        }
        let phone_e164 = normalise_phone(&input.phone)?;

        let now = Utc::now();
        if let Some(dob) = input.date_of_birth {
            if dob > now.date_naive() {
                return Err(ClinicError::InvalidInput(
                    "date_of_birth cannot be in the future".into(),
                ));
            }
        }

        let patient = Patient {
            id: PatientId::new(),
            full_name,
            phone_e164,
            gender: input.gender,
            date_of_birth: input.date_of_birth,
            created_by: actor.id(),
            created_at: now,
        };
        let id = patient.id;

        let changes = ChangeSet::new(ChangeMeta {
            actor: actor.id(),
            domain: RecordDomain::Patient,
            action: ChangeAction::Create,
            summary: "Patient registered",
        })
        .with(Write::InsertPatient(patient));
        self.store
            .apply(changes)
            .with_store_context("failed to create patient")?;

        tracing::info!("patient {} created by {}", id, actor.id());
        Ok(id)
    }

    pub fn get_patient(&self, ctx: &RequestContext, id: PatientId) -> ClinicResult<Patient> {
        ctx.require_actor()?;
        self.store
            .patient(id)
            .with_store_context("failed to read patient")?
            .ok_or(ClinicError::PatientNotFound(id))
    }

    /// All patients, sorted by full name and then id.
    pub fn list_patients(&self, ctx: &RequestContext) -> ClinicResult<Vec<Patient>> {
        ctx.require_actor()?;
        let mut patients = self
            .store
            .patients()
            .with_store_context("failed to list patients")?;
        patients.sort_by(|a, b| {
            a.full_name
                .as_str()
                .cmp(b.full_name.as_str())
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(patients)
    }
}
