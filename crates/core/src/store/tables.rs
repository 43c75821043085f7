//! Row tables and the constraint rules shared by every store.
//!
//! [`MemoryStore`](super::MemoryStore) keeps all rows in one [`Tables`]; the git store loads
//! the rows a change set touches into a scratch [`Tables`], applies there, and only writes
//! files when that succeeds. Either way a change set is checked against the same rules.

use super::{StoreError, StoreResult, Table, Write};
use crate::assessments::AnesthesiaAssessment;
use crate::encounters::{Encounter, EncounterStatus, EncounterVersion};
use crate::episodes::Episode;
use crate::ids::{AssessmentId, EncounterId, EpisodeId, PatientId, VersionId};
use crate::patients::Patient;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, Default)]
pub(crate) struct Tables {
    pub(crate) patients: BTreeMap<PatientId, Patient>,
    pub(crate) episodes: BTreeMap<EpisodeId, Episode>,
    pub(crate) encounters: BTreeMap<EncounterId, Encounter>,
    pub(crate) versions: BTreeMap<VersionId, EncounterVersion>,
    pub(crate) assessments: BTreeMap<AssessmentId, AnesthesiaAssessment>,
}

impl Tables {
    /// Versions of one encounter, ordered by version number.
    pub(crate) fn versions_of(&self, encounter_id: EncounterId) -> Vec<EncounterVersion> {
        let mut versions: Vec<EncounterVersion> = self
            .versions
            .values()
            .filter(|v| v.encounter_id == encounter_id)
            .cloned()
            .collect();
        versions.sort_by_key(|v| v.version_no);
        versions
    }

    /// Applies `writes` in order, checking every constraint.
    ///
    /// On error the tables are left partially modified; callers apply to a copy and discard
    /// it on failure.
    pub(crate) fn apply(&mut self, writes: &[Write]) -> StoreResult<()> {
        if writes.is_empty() {
            return Err(StoreError::EmptyChangeSet);
        }

        // Current-version pointers are checked once all writes are in, since an encounter and
        // the version it points at are inserted by the same change set.
        let mut touched_encounters = BTreeSet::new();

        for write in writes {
            match write {
                Write::InsertPatient(row) => {
                    if self.patients.contains_key(&row.id) {
                        return Err(unique(Table::Patients, row.id));
                    }
                    self.patients.insert(row.id, row.clone());
                }
                Write::InsertEpisode(row) => {
                    if self.episodes.contains_key(&row.id) {
                        return Err(unique(Table::Episodes, row.id));
                    }
                    if !self.patients.contains_key(&row.patient_id) {
                        return Err(StoreError::ForeignKeyViolation {
                            table: Table::Episodes,
                            references: Table::Patients,
                            key: row.id.to_string(),
                        });
                    }
                    self.episodes.insert(row.id, row.clone());
                }
                Write::InsertEncounter(row) => {
                    if self.encounters.contains_key(&row.id) {
                        return Err(unique(Table::Encounters, row.id));
                    }
                    if !self.patients.contains_key(&row.patient_id) {
                        return Err(StoreError::ForeignKeyViolation {
                            table: Table::Encounters,
                            references: Table::Patients,
                            key: row.id.to_string(),
                        });
                    }
                    if let Some(episode_id) = row.episode_id {
                        let episode = self.episodes.get(&episode_id).ok_or_else(|| {
                            StoreError::ForeignKeyViolation {
                                table: Table::Encounters,
                                references: Table::Episodes,
                                key: row.id.to_string(),
                            }
                        })?;
                        if episode.patient_id != row.patient_id {
                            return Err(StoreError::CheckViolation {
                                table: Table::Encounters,
                                key: row.id.to_string(),
                                rule: "episode belongs to the encounter's patient",
                            });
                        }
                    }
                    touched_encounters.insert(row.id);
                    self.encounters.insert(row.id, row.clone());
                }
                Write::UpdateEncounter { row, expected } => {
                    let stored = self
                        .encounters
                        .get(&row.id)
                        .ok_or_else(|| not_found(Table::Encounters, row.id))?;
                    if stored.status != *expected {
                        return Err(StoreError::Conflict(format!(
                            "encounter {} is {}, expected {}",
                            row.id, stored.status, expected
                        )));
                    }
                    if stored.patient_id != row.patient_id || stored.episode_id != row.episode_id {
                        return Err(StoreError::CheckViolation {
                            table: Table::Encounters,
                            key: row.id.to_string(),
                            rule: "patient and episode references are fixed",
                        });
                    }
                    touched_encounters.insert(row.id);
                    self.encounters.insert(row.id, row.clone());
                }
                Write::InsertVersion(row) => {
                    if self.versions.contains_key(&row.id) {
                        return Err(unique(Table::EncounterVersions, row.id));
                    }
                    if !self.encounters.contains_key(&row.encounter_id) {
                        return Err(StoreError::ForeignKeyViolation {
                            table: Table::EncounterVersions,
                            references: Table::Encounters,
                            key: row.id.to_string(),
                        });
                    }
                    if row.version_no == 0 {
                        return Err(StoreError::CheckViolation {
                            table: Table::EncounterVersions,
                            key: row.id.to_string(),
                            rule: "version numbers start at 1",
                        });
                    }
                    let number_taken = self
                        .versions
                        .values()
                        .any(|v| v.encounter_id == row.encounter_id && v.version_no == row.version_no);
                    if number_taken {
                        return Err(StoreError::UniqueViolation {
                            table: Table::EncounterVersions,
                            key: format!("{}#{}", row.encounter_id, row.version_no),
                        });
                    }
                    self.versions.insert(row.id, row.clone());
                }
                Write::UpdateVersion { row, expected } => {
                    let stored = self
                        .versions
                        .get(&row.id)
                        .ok_or_else(|| not_found(Table::EncounterVersions, row.id))?;
                    if stored.status != *expected {
                        return Err(StoreError::Conflict(format!(
                            "encounter version {} is {}, expected {}",
                            row.id, stored.status, expected
                        )));
                    }
                    if stored.status == EncounterStatus::Finalized {
                        return Err(StoreError::ImmutableRow {
                            table: Table::EncounterVersions,
                            key: row.id.to_string(),
                        });
                    }
                    // Finalizing seals the stored content, not an older read of it.
                    if row.status == EncounterStatus::Finalized && stored.content != row.content {
                        return Err(StoreError::Conflict(format!(
                            "encounter version {} was edited before it could be finalized",
                            row.id
                        )));
                    }
                    if stored.encounter_id != row.encounter_id || stored.version_no != row.version_no
                    {
                        return Err(StoreError::CheckViolation {
                            table: Table::EncounterVersions,
                            key: row.id.to_string(),
                            rule: "encounter and version number are fixed",
                        });
                    }
                    self.versions.insert(row.id, row.clone());
                }
                Write::InsertAssessment(row) => {
                    if self.assessments.contains_key(&row.id) {
                        return Err(unique(Table::AnesthesiaAssessments, row.id));
                    }
                    if !self.episodes.contains_key(&row.episode_id) {
                        return Err(StoreError::ForeignKeyViolation {
                            table: Table::AnesthesiaAssessments,
                            references: Table::Episodes,
                            key: row.id.to_string(),
                        });
                    }
                    if self
                        .assessments
                        .values()
                        .any(|a| a.episode_id == row.episode_id)
                    {
                        return Err(StoreError::UniqueViolation {
                            table: Table::AnesthesiaAssessments,
                            key: format!("episode {}", row.episode_id),
                        });
                    }
                    self.assessments.insert(row.id, row.clone());
                }
                Write::UpdateAssessment {
                    row,
                    expected_finalized,
                } => {
                    let stored = self
                        .assessments
                        .get(&row.id)
                        .ok_or_else(|| not_found(Table::AnesthesiaAssessments, row.id))?;
                    if stored.is_finalized != *expected_finalized {
                        return Err(StoreError::Conflict(format!(
                            "anesthesia assessment {} finalized state changed",
                            row.id
                        )));
                    }
                    if stored.is_finalized {
                        return Err(StoreError::ImmutableRow {
                            table: Table::AnesthesiaAssessments,
                            key: row.id.to_string(),
                        });
                    }
                    if stored.episode_id != row.episode_id {
                        return Err(StoreError::CheckViolation {
                            table: Table::AnesthesiaAssessments,
                            key: row.id.to_string(),
                            rule: "episode reference is fixed",
                        });
                    }
                    self.assessments.insert(row.id, row.clone());
                }
            }
        }

        for encounter_id in touched_encounters {
            let Some(encounter) = self.encounters.get(&encounter_id) else {
                continue;
            };
            if let Some(version_id) = encounter.current_version_id {
                let points_home = self
                    .versions
                    .get(&version_id)
                    .is_some_and(|v| v.encounter_id == encounter_id);
                if !points_home {
                    return Err(StoreError::ForeignKeyViolation {
                        table: Table::Encounters,
                        references: Table::EncounterVersions,
                        key: encounter_id.to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

fn unique(table: Table, key: impl ToString) -> StoreError {
    StoreError::UniqueViolation {
        table,
        key: key.to_string(),
    }
}

fn not_found(table: Table, key: impl ToString) -> StoreError {
    StoreError::RowNotFound {
        table,
        key: key.to_string(),
    }
}
