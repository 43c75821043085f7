//! In-process store. Used by tests and by deployments that do not need durability.

use super::tables::Tables;
use super::{
    ChangeMeta, ChangeSet, ClinicStore, EncounterFilter, StoreError, StoreResult,
};
use crate::assessments::AnesthesiaAssessment;
use crate::encounters::{Encounter, EncounterVersion};
use crate::episodes::Episode;
use crate::ids::{AssessmentId, EncounterId, EpisodeId, PatientId};
use crate::patients::Patient;
use std::sync::{RwLock, RwLockReadGuard};

#[derive(Debug, Default)]
struct State {
    tables: Tables,
    applied: Vec<ChangeMeta>,
}

/// Keeps every row behind one lock.
///
/// A change set is applied to a copy of the tables which replaces the live tables only when
/// every write succeeds.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Audit metadata of every change set applied so far, oldest first.
    pub fn applied_changes(&self) -> StoreResult<Vec<ChangeMeta>> {
        Ok(self.read()?.applied.clone())
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, State>> {
        self.state.read().map_err(|_| StoreError::LockPoisoned)
    }
}

impl ClinicStore for MemoryStore {
    fn patient(&self, id: PatientId) -> StoreResult<Option<Patient>> {
        Ok(self.read()?.tables.patients.get(&id).cloned())
    }

    fn patients(&self) -> StoreResult<Vec<Patient>> {
        Ok(self.read()?.tables.patients.values().cloned().collect())
    }

    fn episode(&self, id: EpisodeId) -> StoreResult<Option<Episode>> {
        Ok(self.read()?.tables.episodes.get(&id).cloned())
    }

    fn episodes(&self, patient_id: Option<PatientId>) -> StoreResult<Vec<Episode>> {
        Ok(self
            .read()?
            .tables
            .episodes
            .values()
            .filter(|e| patient_id.map_or(true, |p| e.patient_id == p))
            .cloned()
            .collect())
    }

    fn encounter(&self, id: EncounterId) -> StoreResult<Option<Encounter>> {
        Ok(self.read()?.tables.encounters.get(&id).cloned())
    }

    fn encounters(&self, filter: &EncounterFilter) -> StoreResult<Vec<Encounter>> {
        Ok(self
            .read()?
            .tables
            .encounters
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect())
    }

    fn versions(&self, encounter_id: EncounterId) -> StoreResult<Vec<EncounterVersion>> {
        Ok(self.read()?.tables.versions_of(encounter_id))
    }

    fn assessment(&self, id: AssessmentId) -> StoreResult<Option<AnesthesiaAssessment>> {
        Ok(self.read()?.tables.assessments.get(&id).cloned())
    }

    fn assessment_for_episode(
        &self,
        episode_id: EpisodeId,
    ) -> StoreResult<Option<AnesthesiaAssessment>> {
        Ok(self
            .read()?
            .tables
            .assessments
            .values()
            .find(|a| a.episode_id == episode_id)
            .cloned())
    }

    fn apply(&self, changes: ChangeSet) -> StoreResult<()> {
        let mut state = self.state.write().map_err(|_| StoreError::LockPoisoned)?;

        let mut next = state.tables.clone();
        next.apply(changes.writes())?;

        state.tables = next;
        state.applied.push(changes.meta().clone());
        tracing::debug!(
            "applied {}:{} change set with {} writes",
            changes.meta().domain,
            changes.meta().action,
            changes.writes().len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encounters::EncounterStatus;
    use crate::ids::PatientId;
    use crate::store::test_rows::{encounter, episode, meta, patient, version};
    use crate::store::{ChangeAction, RecordDomain, Table, Write};

    fn seeded() -> (MemoryStore, Patient) {
        let store = MemoryStore::new();
        let p = patient();
        store
            .apply(
                ChangeSet::new(meta(RecordDomain::Patient, ChangeAction::Create))
                    .with(Write::InsertPatient(p.clone())),
            )
            .unwrap();
        (store, p)
    }

    #[test]
    fn encounter_and_first_version_commit_together() {
        let (store, p) = seeded();
        let mut enc = encounter(p.id, None);
        let v1 = version(enc.id, 1);
        enc.current_version_id = Some(v1.id);

        store
            .apply(
                ChangeSet::new(meta(RecordDomain::Encounter, ChangeAction::Create))
                    .with(Write::InsertEncounter(enc.clone()))
                    .with(Write::InsertVersion(v1.clone())),
            )
            .unwrap();

        assert_eq!(store.encounter(enc.id).unwrap().unwrap(), enc);
        assert_eq!(store.versions(enc.id).unwrap(), vec![v1]);
        assert_eq!(store.applied_changes().unwrap().len(), 2);
    }

    #[test]
    fn failed_change_set_leaves_no_rows() {
        let (store, p) = seeded();
        let enc = encounter(p.id, None);
        let v1 = version(enc.id, 1);
        let clash = version(enc.id, 1);

        let err = store
            .apply(
                ChangeSet::new(meta(RecordDomain::Encounter, ChangeAction::Create))
                    .with(Write::InsertEncounter(enc.clone()))
                    .with(Write::InsertVersion(v1))
                    .with(Write::InsertVersion(clash)),
            )
            .unwrap_err();

        assert!(matches!(
            err,
            StoreError::UniqueViolation {
                table: Table::EncounterVersions,
                ..
            }
        ));
        assert!(store.encounter(enc.id).unwrap().is_none());
        assert!(store.versions(enc.id).unwrap().is_empty());
        assert_eq!(store.applied_changes().unwrap().len(), 1);
    }

    #[test]
    fn encounter_requires_existing_patient() {
        let store = MemoryStore::new();
        let enc = encounter(PatientId::new(), None);
        let err = store
            .apply(
                ChangeSet::new(meta(RecordDomain::Encounter, ChangeAction::Create))
                    .with(Write::InsertEncounter(enc)),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::ForeignKeyViolation { .. }));
    }

    #[test]
    fn encounter_episode_must_exist_and_share_patient() {
        let (store, p) = seeded();
        let mut enc = encounter(p.id, None);
        enc.episode_id = Some(EpisodeId::new());
        let err = store
            .apply(
                ChangeSet::new(meta(RecordDomain::Encounter, ChangeAction::Create))
                    .with(Write::InsertEncounter(enc.clone())),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::ForeignKeyViolation {
                table: Table::Encounters,
                references: Table::Episodes,
                ..
            }
        ));

        let other = patient();
        let foreign = episode(other.id);
        store
            .apply(
                ChangeSet::new(meta(RecordDomain::Patient, ChangeAction::Create))
                    .with(Write::InsertPatient(other)),
            )
            .unwrap();
        store
            .apply(
                ChangeSet::new(meta(RecordDomain::Episode, ChangeAction::Create))
                    .with(Write::InsertEpisode(foreign.clone())),
            )
            .unwrap();
        enc.episode_id = Some(foreign.id);
        let err = store
            .apply(
                ChangeSet::new(meta(RecordDomain::Encounter, ChangeAction::Create))
                    .with(Write::InsertEncounter(enc)),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::CheckViolation { .. }));
        assert!(store.episodes(Some(p.id)).unwrap().is_empty());
    }

    #[test]
    fn episode_requires_existing_patient() {
        let store = MemoryStore::new();
        let err = store
            .apply(
                ChangeSet::new(meta(RecordDomain::Episode, ChangeAction::Create))
                    .with(Write::InsertEpisode(episode(PatientId::new()))),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::ForeignKeyViolation {
                table: Table::Episodes,
                references: Table::Patients,
                ..
            }
        ));
    }

    #[test]
    fn current_pointer_must_name_own_version() {
        let (store, p) = seeded();
        let other = encounter(p.id, None);
        let other_v1 = version(other.id, 1);
        store
            .apply(
                ChangeSet::new(meta(RecordDomain::Encounter, ChangeAction::Create))
                    .with(Write::InsertEncounter(other))
                    .with(Write::InsertVersion(other_v1.clone())),
            )
            .unwrap();

        let enc = encounter(p.id, Some(other_v1.id));
        let err = store
            .apply(
                ChangeSet::new(meta(RecordDomain::Encounter, ChangeAction::Create))
                    .with(Write::InsertEncounter(enc)),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::ForeignKeyViolation {
                table: Table::Encounters,
                references: Table::EncounterVersions,
                ..
            }
        ));
    }

    #[test]
    fn finalized_version_is_immutable() {
        let (store, p) = seeded();
        let mut enc = encounter(p.id, None);
        let mut v1 = version(enc.id, 1);
        enc.current_version_id = Some(v1.id);
        v1.status = EncounterStatus::Finalized;
        store
            .apply(
                ChangeSet::new(meta(RecordDomain::Encounter, ChangeAction::Create))
                    .with(Write::InsertEncounter(enc))
                    .with(Write::InsertVersion(v1.clone())),
            )
            .unwrap();

        let err = store
            .apply(
                ChangeSet::new(meta(RecordDomain::Encounter, ChangeAction::Update)).with(
                    Write::UpdateVersion {
                        row: v1.clone(),
                        expected: EncounterStatus::Finalized,
                    },
                ),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::ImmutableRow { .. }));

        let err = store
            .apply(
                ChangeSet::new(meta(RecordDomain::Encounter, ChangeAction::Update)).with(
                    Write::UpdateVersion {
                        row: v1,
                        expected: EncounterStatus::Draft,
                    },
                ),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn finalizing_stale_content_conflicts() {
        let (store, p) = seeded();
        let mut enc = encounter(p.id, None);
        let v1 = version(enc.id, 1);
        enc.current_version_id = Some(v1.id);
        store
            .apply(
                ChangeSet::new(meta(RecordDomain::Encounter, ChangeAction::Create))
                    .with(Write::InsertEncounter(enc))
                    .with(Write::InsertVersion(v1.clone())),
            )
            .unwrap();

        let mut edited = v1.clone();
        edited.content.plan = clinic_types::ClinicalText::new("discharge").unwrap();
        store
            .apply(
                ChangeSet::new(meta(RecordDomain::Encounter, ChangeAction::Update)).with(
                    Write::UpdateVersion {
                        row: edited.clone(),
                        expected: EncounterStatus::Draft,
                    },
                ),
            )
            .unwrap();

        let mut stale = v1;
        stale.status = EncounterStatus::Finalized;
        let err = store
            .apply(
                ChangeSet::new(meta(RecordDomain::Encounter, ChangeAction::Finalize)).with(
                    Write::UpdateVersion {
                        row: stale,
                        expected: EncounterStatus::Draft,
                    },
                ),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.versions(edited.encounter_id).unwrap(), vec![edited]);
    }

    #[test]
    fn empty_change_set_is_rejected() {
        let store = MemoryStore::new();
        let err = store
            .apply(ChangeSet::new(meta(
                RecordDomain::Patient,
                ChangeAction::Create,
            )))
            .unwrap_err();
        assert!(matches!(err, StoreError::EmptyChangeSet));
    }
}
