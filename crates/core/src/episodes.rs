//! Surgical episodes.
//!
//! An episode groups the care around one planned procedure for a patient. Encounters may be
//! filed under an episode and each episode has at most one anesthesia assessment.

use crate::actor::RequestContext;
use crate::error::{ClinicError, ClinicResult, StoreResultExt};
use crate::ids::{ActorId, EpisodeId, PatientId};
use crate::store::{ChangeAction, ChangeMeta, ChangeSet, ClinicStore, RecordDomain, Write};
use chrono::{DateTime, Utc};
use clinic_types::{NonEmptyText, MAX_CLINICAL_TEXT_CHARS};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeStatus {
    #[default]
    Planned,
    Scheduled,
    Done,
    Cancelled,
}

impl EpisodeStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Scheduled => "scheduled",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for EpisodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EpisodeStatus {
    type Err = ClinicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "planned" => Ok(Self::Planned),
            "scheduled" => Ok(Self::Scheduled),
            "done" => Ok(Self::Done),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ClinicError::InvalidInput(format!(
                "unknown episode status '{}'",
                other
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Episode {
    pub id: EpisodeId,
    pub patient_id: PatientId,
    pub procedure_name: NonEmptyText,
    pub status: EpisodeStatus,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
    pub created_by: ActorId,
    pub created_at: DateTime<Utc>,
}

/// Input for [`EpisodeService::create_episode`].
#[derive(Clone, Debug, Default, Deserialize)]
pub struct NewEpisode {
    pub patient_id: PatientId,
    pub procedure_name: String,
    #[serde(default)]
    pub status: EpisodeStatus,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Parses an RFC 3339 timestamp, such as `2026-11-02T08:30:00Z`, into UTC.
pub fn parse_scheduled_at(input: &str) -> ClinicResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(input.trim())
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| ClinicError::InvalidInput(format!("scheduled_at must be RFC 3339: {}", e)))
}

#[derive(Clone)]
pub struct EpisodeService {
    store: Arc<dyn ClinicStore>,
}

impl EpisodeService {
    pub fn new(store: Arc<dyn ClinicStore>) -> Self {
        Self { store }
    }

    /// Opens an episode for an existing patient.
    ///
    /// # Errors
    ///
    /// - [`ClinicError::NotAuthenticated`] without an actor
    /// - [`ClinicError::InvalidInput`] for a blank procedure name or oversized notes
    /// - [`ClinicError::PatientNotFound`] if the patient does not exist
    pub fn create_episode(
        &self,
        ctx: &RequestContext,
        input: NewEpisode,
    ) -> ClinicResult<EpisodeId> {
        let actor = ctx.require_actor()?;

        let procedure_name = NonEmptyText::new(&input.procedure_name)
            .map_err(|_| ClinicError::InvalidInput("procedure_name is required".into()))?;
        let notes = match input.notes.as_deref().map(str::trim) {
            Some(n) if n.chars().count() > MAX_CLINICAL_TEXT_CHARS => {
                return Err(ClinicError::InvalidInput(format!(
                    "notes exceeds {} characters",
                    MAX_CLINICAL_TEXT_CHARS
                )));
            }
            Some(n) if !n.is_empty() => Some(n.to_owned()),
            _ => None,
        };

        if self
            .store
            .patient(input.patient_id)
            .with_store_context("failed to read patient")?
            .is_none()
        {
            return Err(ClinicError::PatientNotFound(input.patient_id));
        }

        let episode = Episode {
            id: EpisodeId::new(),
            patient_id: input.patient_id,
            procedure_name,
            status: input.status,
            scheduled_at: input.scheduled_at,
            notes,
            created_by: actor.id(),
            created_at: Utc::now(),
        };
        let id = episode.id;

        let changes = ChangeSet::new(ChangeMeta {
            actor: actor.id(),
            domain: RecordDomain::Episode,
            action: ChangeAction::Create,
            summary: "Episode opened",
        })
        .with(Write::InsertEpisode(episode));
        self.store
            .apply(changes)
            .with_store_context("failed to create episode")?;

        tracing::info!("episode {} created by {}", id, actor.id());
        Ok(id)
    }

    pub fn get_episode(&self, ctx: &RequestContext, id: EpisodeId) -> ClinicResult<Episode> {
        ctx.require_actor()?;
        require_episode(self.store.as_ref(), id)
    }

    /// Episodes, optionally of one patient, newest first.
    pub fn list_episodes(
        &self,
        ctx: &RequestContext,
        patient_id: Option<PatientId>,
    ) -> ClinicResult<Vec<Episode>> {
        ctx.require_actor()?;
        let mut episodes = self
            .store
            .episodes(patient_id)
            .with_store_context("failed to list episodes")?;
        episodes.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(episodes)
    }
}

/// Loads an episode for a service that files rows under it.
pub(crate) fn require_episode(
    store: &dyn ClinicStore,
    id: EpisodeId,
) -> ClinicResult<Episode> {
    store
        .episode(id)
        .with_store_context("failed to read episode")?
        .ok_or(ClinicError::EpisodeNotFound(id))
}
