//! Pre-operative anesthesia assessments.
//!
//! An [episode](crate::episodes) has at most one assessment. It is edited freely
//! until finalized, after which it is read-only. Every mutation needs the anesthesia or admin
//! role.

use crate::actor::{RequestContext, ANESTHESIA_ROLES};
use crate::episodes::require_episode;
use crate::error::{ClinicError, ClinicResult, StoreResultExt};
use crate::ids::{ActorId, AssessmentId, EpisodeId};
use crate::store::{ChangeAction, ChangeMeta, ChangeSet, ClinicStore, RecordDomain, Write};
use chrono::{DateTime, Utc};
use clinic_types::MAX_CLINICAL_TEXT_CHARS;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// The editable content of an assessment. Every field is optional.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssessmentFields {
    pub asa_class: Option<String>,
    pub mallampati: Option<String>,
    pub comorbidities: BTreeMap<String, String>,
    pub allergies: Option<String>,
    pub current_meds: Option<String>,
    pub fasting_status: Option<String>,
    pub planned_anesthesia: Option<String>,
    pub notes: Option<String>,
}

impl AssessmentFields {
    /// Trims every value, turns blank values into `None` and drops blank comorbidity keys.
    ///
    /// # Errors
    ///
    /// [`ClinicError::InvalidInput`] if any value exceeds [`MAX_CLINICAL_TEXT_CHARS`].
    pub fn normalised(self) -> ClinicResult<Self> {
        fn text(name: &str, value: Option<String>) -> ClinicResult<Option<String>> {
            let Some(value) = value else {
                return Ok(None);
            };
            let trimmed = value.trim();
            if trimmed.chars().count() > MAX_CLINICAL_TEXT_CHARS {
                return Err(ClinicError::InvalidInput(format!(
                    "{} exceeds {} characters",
                    name, MAX_CLINICAL_TEXT_CHARS
                )));
            }
            Ok((!trimmed.is_empty()).then(|| trimmed.to_owned()))
        }

        let mut comorbidities = BTreeMap::new();
        for (key, value) in self.comorbidities {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            let value = text("comorbidities", Some(value))?.unwrap_or_default();
            comorbidities.insert(key.to_owned(), value);
        }

        Ok(Self {
            asa_class: text("asa_class", self.asa_class)?,
            mallampati: text("mallampati", self.mallampati)?,
            comorbidities,
            allergies: text("allergies", self.allergies)?,
            current_meds: text("current_meds", self.current_meds)?,
            fasting_status: text("fasting_status", self.fasting_status)?,
            planned_anesthesia: text("planned_anesthesia", self.planned_anesthesia)?,
            notes: text("notes", self.notes)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnesthesiaAssessment {
    pub id: AssessmentId,
    pub episode_id: EpisodeId,
    pub fields: AssessmentFields,
    pub is_finalized: bool,
    #[serde(default)]
    pub finalized_by: Option<ActorId>,
    #[serde(default)]
    pub finalized_at: Option<DateTime<Utc>>,
    pub created_by: ActorId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AssessmentService {
    store: Arc<dyn ClinicStore>,
}

impl AssessmentService {
    pub fn new(store: Arc<dyn ClinicStore>) -> Self {
        Self { store }
    }

    fn load(&self, id: AssessmentId) -> ClinicResult<AnesthesiaAssessment> {
        self.store
            .assessment(id)
            .with_store_context("failed to read anesthesia assessment")?
            .ok_or(ClinicError::AssessmentNotFound(id))
    }

    /// Creates the assessment for an episode.
    ///
    /// # Errors
    ///
    /// - [`ClinicError::NotAuthenticated`] / [`ClinicError::Forbidden`]
    /// - [`ClinicError::InvalidInput`] for oversized values
    /// - [`ClinicError::EpisodeNotFound`] if the episode does not exist
    /// - [`ClinicError::AssessmentExists`] if the episode already has one
    pub fn create_assessment(
        &self,
        ctx: &RequestContext,
        episode_id: EpisodeId,
        fields: AssessmentFields,
    ) -> ClinicResult<AssessmentId> {
        let actor = ctx.require_any_role(ANESTHESIA_ROLES)?;
        let fields = fields.normalised()?;
        require_episode(self.store.as_ref(), episode_id)?;

        if self
            .store
            .assessment_for_episode(episode_id)
            .with_store_context("failed to read anesthesia assessment")?
            .is_some()
        {
            tracing::warn!("episode {} already has an anesthesia assessment", episode_id);
            return Err(ClinicError::AssessmentExists(episode_id));
        }

        let now = Utc::now();
        let assessment = AnesthesiaAssessment {
            id: AssessmentId::new(),
            episode_id,
            fields,
            is_finalized: false,
            finalized_by: None,
            finalized_at: None,
            created_by: actor.id(),
            created_at: now,
            updated_at: now,
        };
        let id = assessment.id;

        let changes = ChangeSet::new(ChangeMeta {
            actor: actor.id(),
            domain: RecordDomain::Assessment,
            action: ChangeAction::Create,
            summary: "Anesthesia assessment created",
        })
        .with(Write::InsertAssessment(assessment));
        self.store
            .apply(changes)
            .with_store_context("failed to create anesthesia assessment")?;

        tracing::info!(
            "anesthesia assessment {} created for episode {} by {}",
            id,
            episode_id,
            actor.id()
        );
        Ok(id)
    }

    /// Replaces every field of an unfinalized assessment. Absent fields are cleared.
    ///
    /// # Errors
    ///
    /// - [`ClinicError::NotAuthenticated`] / [`ClinicError::Forbidden`]
    /// - [`ClinicError::AssessmentNotFound`]
    /// - [`ClinicError::AssessmentFinalized`]
    pub fn update_assessment(
        &self,
        ctx: &RequestContext,
        id: AssessmentId,
        fields: AssessmentFields,
    ) -> ClinicResult<()> {
        let actor = ctx.require_any_role(ANESTHESIA_ROLES)?;
        let fields = fields.normalised()?;

        let current = self.load(id)?;
        if current.is_finalized {
            tracing::warn!("rejected update of finalized anesthesia assessment {}", id);
            return Err(ClinicError::AssessmentFinalized);
        }

        let mut updated = current;
        updated.fields = fields;
        updated.updated_at = Utc::now();

        let changes = ChangeSet::new(ChangeMeta {
            actor: actor.id(),
            domain: RecordDomain::Assessment,
            action: ChangeAction::Update,
            summary: "Anesthesia assessment updated",
        })
        .with(Write::UpdateAssessment {
            row: updated,
            expected_finalized: false,
        });
        self.store
            .apply(changes)
            .with_store_context("failed to update anesthesia assessment")?;

        tracing::debug!("anesthesia assessment {} updated by {}", id, actor.id());
        Ok(())
    }

    /// Marks the assessment finalized.
    ///
    /// # Errors
    ///
    /// - [`ClinicError::NotAuthenticated`] / [`ClinicError::Forbidden`]
    /// - [`ClinicError::AssessmentNotFound`]
    /// - [`ClinicError::AssessmentAlreadyFinalized`]
    pub fn finalize_assessment(
        &self,
        ctx: &RequestContext,
        id: AssessmentId,
    ) -> ClinicResult<()> {
        let actor = ctx.require_any_role(ANESTHESIA_ROLES)?;

        let current = self.load(id)?;
        if current.is_finalized {
            tracing::warn!("anesthesia assessment {} is already finalized", id);
            return Err(ClinicError::AssessmentAlreadyFinalized);
        }

        let now = Utc::now();
        let mut finalized = current;
        finalized.is_finalized = true;
        finalized.finalized_by = Some(actor.id());
        finalized.finalized_at = Some(now);
        finalized.updated_at = now;

        let changes = ChangeSet::new(ChangeMeta {
            actor: actor.id(),
            domain: RecordDomain::Assessment,
            action: ChangeAction::Finalize,
            summary: "Anesthesia assessment finalized",
        })
        .with(Write::UpdateAssessment {
            row: finalized,
            expected_finalized: false,
        });
        self.store
            .apply(changes)
            .with_store_context("failed to finalize anesthesia assessment")?;

        tracing::info!("anesthesia assessment {} finalized by {}", id, actor.id());
        Ok(())
    }

    /// The assessment of an episode, if one exists.
    pub fn assessment_for_episode(
        &self,
        ctx: &RequestContext,
        episode_id: EpisodeId,
    ) -> ClinicResult<Option<AnesthesiaAssessment>> {
        ctx.require_actor()?;
        self.store
            .assessment_for_episode(episode_id)
            .with_store_context("failed to read anesthesia assessment")
    }
}
