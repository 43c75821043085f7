//! Git-backed store: one repository per record, one commit per change set.
//!
//! ## Layout
//!
//! ```text
//! <data_dir>/
//!   patients/<s1>/<s2>/<patient_id>/patient.yaml
//!   episodes/<s1>/<s2>/<episode_id>/episode.yaml
//!   encounters/<s1>/<s2>/<encounter_id>/encounter.yaml
//!   encounters/<s1>/<s2>/<encounter_id>/versions/0001.yaml
//!   assessments/<s1>/<s2>/<assessment_id>/assessment.yaml
//! ```
//!
//! `s1`/`s2` are the first two hex pairs of the record id. An encounter and all of its versions
//! share one repository, so the multi-row encounter operations commit atomically. For the same
//! reason a change set may only touch a single record.

use super::tables::Tables;
use super::{ChangeSet, ClinicStore, EncounterFilter, StoreError, StoreResult, Write};
use crate::assessments::AnesthesiaAssessment;
use crate::config::CoreConfig;
use crate::constants::{
    ASSESSMENT_FILENAME, ENCOUNTER_FILENAME, EPISODE_FILENAME, PATIENT_FILENAME,
    VERSIONS_DIR_NAME,
};
use crate::encounters::{Encounter, EncounterVersion};
use crate::episodes::Episode;
use crate::ids::{AssessmentId, EncounterId, EpisodeId, PatientId};
use crate::patients::Patient;
use crate::versioned_files::{ClinicCommitMessage, FileToWrite, VersionedFileService};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard};

/// The record a change set writes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RecordTarget {
    Patient(PatientId),
    Episode(EpisodeId),
    Encounter(EncounterId),
    Assessment(AssessmentId),
}

impl RecordTarget {
    fn of(write: &Write) -> Self {
        match write {
            Write::InsertPatient(row) => Self::Patient(row.id),
            Write::InsertEpisode(row) => Self::Episode(row.id),
            Write::InsertEncounter(row) | Write::UpdateEncounter { row, .. } => {
                Self::Encounter(row.id)
            }
            Write::InsertVersion(row) | Write::UpdateVersion { row, .. } => {
                Self::Encounter(row.encounter_id)
            }
            Write::InsertAssessment(row) | Write::UpdateAssessment { row, .. } => {
                Self::Assessment(row.id)
            }
        }
    }
}

/// Stores rows as YAML files in per-record git repositories under the configured data
/// directory.
///
/// One process-wide reader/writer lock guards the files. Writers hold it exclusively while
/// they read current rows, check constraints and commit; readers share it, so a read never
/// observes a change set half written.
pub struct GitStore {
    cfg: Arc<CoreConfig>,
    lock: RwLock<()>,
}

impl GitStore {
    /// Opens the store, creating the top-level record directories if needed.
    pub fn open(cfg: Arc<CoreConfig>) -> StoreResult<Self> {
        for dir in [
            cfg.patients_dir(),
            cfg.episodes_dir(),
            cfg.encounters_dir(),
            cfg.assessments_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(StoreError::DirCreation)?;
        }
        Ok(Self {
            cfg,
            lock: RwLock::new(()),
        })
    }

    fn read_guard(&self) -> StoreResult<RwLockReadGuard<'_, ()>> {
        self.lock.read().map_err(|_| StoreError::LockPoisoned)
    }

    fn patient_dir(&self, id: PatientId) -> PathBuf {
        id.record_uuid().sharded_dir(&self.cfg.patients_dir())
    }

    fn episode_dir(&self, id: EpisodeId) -> PathBuf {
        id.record_uuid().sharded_dir(&self.cfg.episodes_dir())
    }

    fn encounter_dir(&self, id: EncounterId) -> PathBuf {
        id.record_uuid().sharded_dir(&self.cfg.encounters_dir())
    }

    fn assessment_dir(&self, id: AssessmentId) -> PathBuf {
        id.record_uuid().sharded_dir(&self.cfg.assessments_dir())
    }

    fn target_dir(&self, target: RecordTarget) -> PathBuf {
        match target {
            RecordTarget::Patient(id) => self.patient_dir(id),
            RecordTarget::Episode(id) => self.episode_dir(id),
            RecordTarget::Encounter(id) => self.encounter_dir(id),
            RecordTarget::Assessment(id) => self.assessment_dir(id),
        }
    }

    // The `read_*`/`load_*`/`all_*` helpers take no lock; callers hold it.

    fn read_patient(&self, id: PatientId) -> StoreResult<Option<Patient>> {
        read_yaml(&self.patient_dir(id).join(PATIENT_FILENAME))
    }

    fn read_episode(&self, id: EpisodeId) -> StoreResult<Option<Episode>> {
        read_yaml(&self.episode_dir(id).join(EPISODE_FILENAME))
    }

    fn read_encounter(&self, id: EncounterId) -> StoreResult<Option<Encounter>> {
        read_yaml(&self.encounter_dir(id).join(ENCOUNTER_FILENAME))
    }

    fn read_assessment(&self, id: AssessmentId) -> StoreResult<Option<AnesthesiaAssessment>> {
        read_yaml(&self.assessment_dir(id).join(ASSESSMENT_FILENAME))
    }

    fn load_versions(&self, encounter_id: EncounterId) -> StoreResult<Vec<EncounterVersion>> {
        let dir = self.encounter_dir(encounter_id).join(VERSIONS_DIR_NAME);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut versions = Vec::new();
        for entry in fs::read_dir(&dir).map_err(StoreError::FileRead)? {
            let path = entry.map_err(StoreError::FileRead)?.path();
            if path.extension().is_some_and(|ext| ext == "yaml") {
                if let Some(version) = read_yaml::<EncounterVersion>(&path)? {
                    versions.push(version);
                }
            }
        }
        versions.sort_by_key(|v| v.version_no);
        Ok(versions)
    }

    fn all_rows<T: DeserializeOwned>(&self, base: &Path, filename: &str) -> StoreResult<Vec<T>> {
        let mut rows = Vec::new();
        for dir in record_dirs(base)? {
            if let Some(row) = read_yaml(&dir.join(filename))? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    fn find_assessment_for_episode(
        &self,
        episode_id: EpisodeId,
    ) -> StoreResult<Option<AnesthesiaAssessment>> {
        Ok(self
            .all_rows::<AnesthesiaAssessment>(&self.cfg.assessments_dir(), ASSESSMENT_FILENAME)?
            .into_iter()
            .find(|a| a.episode_id == episode_id))
    }

    /// Loads the rows a change set needs to see: the target record plus whatever its
    /// constraints reference.
    fn snapshot(&self, target: RecordTarget, writes: &[Write]) -> StoreResult<Tables> {
        let mut tables = Tables::default();

        match target {
            RecordTarget::Patient(id) => {
                if let Some(row) = self.read_patient(id)? {
                    tables.patients.insert(id, row);
                }
            }
            RecordTarget::Episode(id) => {
                if let Some(row) = self.read_episode(id)? {
                    tables.episodes.insert(id, row);
                }
                for write in writes {
                    if let Write::InsertEpisode(row) = write {
                        if let Some(patient) = self.read_patient(row.patient_id)? {
                            tables.patients.insert(patient.id, patient);
                        }
                    }
                }
            }
            RecordTarget::Encounter(id) => {
                if let Some(row) = self.read_encounter(id)? {
                    tables.encounters.insert(id, row);
                }
                for version in self.load_versions(id)? {
                    tables.versions.insert(version.id, version);
                }
                for write in writes {
                    if let Write::InsertEncounter(row) = write {
                        if let Some(patient) = self.read_patient(row.patient_id)? {
                            tables.patients.insert(patient.id, patient);
                        }
                        if let Some(episode_id) = row.episode_id {
                            if let Some(episode) = self.read_episode(episode_id)? {
                                tables.episodes.insert(episode_id, episode);
                            }
                        }
                    }
                }
            }
            RecordTarget::Assessment(id) => {
                if let Some(row) = self.read_assessment(id)? {
                    tables.assessments.insert(id, row);
                }
                for write in writes {
                    if let Write::InsertAssessment(row) = write {
                        if let Some(episode) = self.read_episode(row.episode_id)? {
                            tables.episodes.insert(episode.id, episode);
                        }
                        if let Some(existing) = self.find_assessment_for_episode(row.episode_id)? {
                            tables.assessments.insert(existing.id, existing);
                        }
                    }
                }
            }
        }

        Ok(tables)
    }

    /// Renders the rows of `target` as files relative to the record directory.
    fn render_record(
        &self,
        target: RecordTarget,
        tables: &Tables,
    ) -> StoreResult<Vec<(PathBuf, String)>> {
        let mut files = Vec::new();
        match target {
            RecordTarget::Patient(id) => {
                if let Some(row) = tables.patients.get(&id) {
                    files.push((PathBuf::from(PATIENT_FILENAME), to_yaml(row)?));
                }
            }
            RecordTarget::Episode(id) => {
                if let Some(row) = tables.episodes.get(&id) {
                    files.push((PathBuf::from(EPISODE_FILENAME), to_yaml(row)?));
                }
            }
            RecordTarget::Encounter(id) => {
                if let Some(row) = tables.encounters.get(&id) {
                    files.push((PathBuf::from(ENCOUNTER_FILENAME), to_yaml(row)?));
                }
                for version in tables.versions_of(id) {
                    files.push((version_file(version.version_no), to_yaml(&version)?));
                }
            }
            RecordTarget::Assessment(id) => {
                if let Some(row) = tables.assessments.get(&id) {
                    files.push((PathBuf::from(ASSESSMENT_FILENAME), to_yaml(row)?));
                }
            }
        }
        Ok(files)
    }
}

impl ClinicStore for GitStore {
    fn patient(&self, id: PatientId) -> StoreResult<Option<Patient>> {
        let _guard = self.read_guard()?;
        self.read_patient(id)
    }

    fn patients(&self) -> StoreResult<Vec<Patient>> {
        let _guard = self.read_guard()?;
        self.all_rows(&self.cfg.patients_dir(), PATIENT_FILENAME)
    }

    fn episode(&self, id: EpisodeId) -> StoreResult<Option<Episode>> {
        let _guard = self.read_guard()?;
        self.read_episode(id)
    }

    fn episodes(&self, patient_id: Option<PatientId>) -> StoreResult<Vec<Episode>> {
        let _guard = self.read_guard()?;
        let mut rows: Vec<Episode> = self.all_rows(&self.cfg.episodes_dir(), EPISODE_FILENAME)?;
        if let Some(patient_id) = patient_id {
            rows.retain(|e| e.patient_id == patient_id);
        }
        Ok(rows)
    }

    fn encounter(&self, id: EncounterId) -> StoreResult<Option<Encounter>> {
        let _guard = self.read_guard()?;
        self.read_encounter(id)
    }

    fn encounters(&self, filter: &EncounterFilter) -> StoreResult<Vec<Encounter>> {
        let _guard = self.read_guard()?;
        let mut rows: Vec<Encounter> =
            self.all_rows(&self.cfg.encounters_dir(), ENCOUNTER_FILENAME)?;
        rows.retain(|e| filter.matches(e));
        Ok(rows)
    }

    fn versions(&self, encounter_id: EncounterId) -> StoreResult<Vec<EncounterVersion>> {
        let _guard = self.read_guard()?;
        self.load_versions(encounter_id)
    }

    fn assessment(&self, id: AssessmentId) -> StoreResult<Option<AnesthesiaAssessment>> {
        let _guard = self.read_guard()?;
        self.read_assessment(id)
    }

    fn assessment_for_episode(
        &self,
        episode_id: EpisodeId,
    ) -> StoreResult<Option<AnesthesiaAssessment>> {
        let _guard = self.read_guard()?;
        self.find_assessment_for_episode(episode_id)
    }

    fn apply(&self, changes: ChangeSet) -> StoreResult<()> {
        let writes = changes.writes();
        let Some(first) = writes.first() else {
            return Err(StoreError::EmptyChangeSet);
        };
        let target = RecordTarget::of(first);
        if let Some(other) = writes.iter().map(RecordTarget::of).find(|t| *t != target) {
            return Err(StoreError::CrossRecordChangeSet(format!(
                "{:?} and {:?}",
                target, other
            )));
        }

        let message = ClinicCommitMessage::new(changes.meta(), self.cfg.care_location())?;

        let _guard = self.lock.write().map_err(|_| StoreError::LockPoisoned)?;

        let mut tables = self.snapshot(target, writes)?;
        tables.apply(writes)?;

        let record_dir = self.target_dir(target);
        let mut rendered = Vec::new();
        for (relative_path, content) in self.render_record(target, &tables)? {
            let full_path = record_dir.join(&relative_path);
            let old_content = if full_path.is_file() {
                Some(fs::read_to_string(&full_path).map_err(StoreError::FileRead)?)
            } else {
                None
            };
            if old_content.as_deref() != Some(content.as_str()) {
                rendered.push((relative_path, content, old_content));
            }
        }

        let files: Vec<FileToWrite> = rendered
            .iter()
            .map(|(relative_path, content, old_content)| FileToWrite {
                relative_path: relative_path.as_path(),
                content: content.as_str(),
                old_content: old_content.as_deref(),
            })
            .collect();

        if record_dir.join(".git").exists() {
            VersionedFileService::write_and_commit_files(&record_dir, &message, &files)?;
        } else {
            if let Some(parent) = record_dir.parent() {
                fs::create_dir_all(parent).map_err(StoreError::DirCreation)?;
            }
            VersionedFileService::init_and_commit(&record_dir, &message, &files)?;
        }

        tracing::debug!(
            "committed {}:{} to {}",
            changes.meta().domain,
            changes.meta().action,
            record_dir.display()
        );
        Ok(())
    }
}

fn version_file(version_no: u32) -> PathBuf {
    Path::new(VERSIONS_DIR_NAME).join(format!("{:04}.yaml", version_no))
}

fn to_yaml<T: Serialize>(row: &T) -> StoreResult<String> {
    serde_yaml::to_string(row).map_err(StoreError::YamlSerialization)
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    if !path.is_file() {
        return Ok(None);
    }
    let content = fs::read_to_string(path).map_err(StoreError::FileRead)?;
    serde_yaml::from_str(&content)
        .map(Some)
        .map_err(|source| StoreError::YamlDeserialization {
            path: path.display().to_string(),
            source,
        })
}

/// Record directories under a sharded base directory (`<base>/<s1>/<s2>/<id>`).
fn record_dirs(base: &Path) -> StoreResult<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for s1 in subdirs(base)? {
        for s2 in subdirs(&s1)? {
            dirs.extend(subdirs(&s2)?);
        }
    }
    Ok(dirs)
}

fn subdirs(dir: &Path) -> StoreResult<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).map_err(StoreError::FileRead)? {
        let entry = entry.map_err(StoreError::FileRead)?;
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if !hidden && entry.path().is_dir() {
            out.push(entry.path());
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreBackend;
    use crate::encounters::{EncounterStatus, SoapNote};
    use crate::store::test_rows::{encounter, episode, meta, patient, version};
    use crate::store::{ChangeAction, RecordDomain, Table};
    use crate::versioned_files::force_commit_failure_on_this_thread;
    use clinic_types::ClinicalText;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use tempfile::TempDir;

    fn store(temp: &TempDir) -> GitStore {
        let cfg = CoreConfig::new(temp.path().to_path_buf(), "Riverside Clinic", StoreBackend::Git)
            .unwrap();
        GitStore::open(Arc::new(cfg)).unwrap()
    }

    fn commits(dir: &Path) -> usize {
        VersionedFileService::open(dir)
            .unwrap()
            .commit_count()
            .unwrap()
    }

    fn seeded(store: &GitStore) -> Patient {
        let p = patient();
        store
            .apply(
                ChangeSet::new(meta(RecordDomain::Patient, ChangeAction::Create))
                    .with(Write::InsertPatient(p.clone())),
            )
            .unwrap();
        p
    }

    fn opened(store: &GitStore, p: &Patient) -> (Encounter, EncounterVersion) {
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
        (enc, v1)
    }

    fn with_complaint(mut row: EncounterVersion, text: &str) -> EncounterVersion {
        row.content = SoapNote {
            chief_complaint: ClinicalText::new(text).unwrap(),
            ..Default::default()
        };
        row
    }

    #[test]
    fn rows_survive_reopen() {
        let temp = TempDir::new().unwrap();
        let p = seeded(&store(&temp));

        let reopened = store(&temp);
        assert_eq!(reopened.patient(p.id).unwrap(), Some(p.clone()));
        assert_eq!(reopened.patients().unwrap(), vec![p]);
    }

    #[test]
    fn encounter_and_versions_share_one_repository() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let p = seeded(&store);

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

        let mut finalized = v1.clone();
        finalized.status = EncounterStatus::Finalized;
        let mut enc_final = enc.clone();
        enc_final.status = EncounterStatus::Finalized;
        store
            .apply(
                ChangeSet::new(meta(RecordDomain::Encounter, ChangeAction::Finalize))
                    .with(Write::UpdateVersion {
                        row: finalized.clone(),
                        expected: EncounterStatus::Draft,
                    })
                    .with(Write::UpdateEncounter {
                        row: enc_final.clone(),
                        expected: EncounterStatus::Draft,
                    }),
            )
            .unwrap();

        let dir = store.encounter_dir(enc.id);
        assert!(dir.join("versions/0001.yaml").is_file());
        assert_eq!(commits(&dir), 2);
        assert_eq!(store.encounter(enc.id).unwrap(), Some(enc_final));
        assert_eq!(store.versions(enc.id).unwrap(), vec![finalized]);

        let filter = EncounterFilter {
            status: Some(EncounterStatus::Finalized),
            ..Default::default()
        };
        assert_eq!(store.encounters(&filter).unwrap().len(), 1);
    }

    #[test]
    fn encounter_requires_stored_patient() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let enc = encounter(PatientId::new(), None);

        let err = store
            .apply(
                ChangeSet::new(meta(RecordDomain::Encounter, ChangeAction::Create))
                    .with(Write::InsertEncounter(enc.clone())),
            )
            .unwrap_err();

        assert!(matches!(err, StoreError::ForeignKeyViolation { .. }));
        assert!(!store.encounter_dir(enc.id).exists());
    }

    #[test]
    fn change_sets_spanning_records_are_rejected() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let err = store
            .apply(
                ChangeSet::new(meta(RecordDomain::Patient, ChangeAction::Create))
                    .with(Write::InsertPatient(patient()))
                    .with(Write::InsertPatient(patient())),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::CrossRecordChangeSet(_)));
        assert!(store.patients().unwrap().is_empty());
    }

    #[test]
    fn failed_commit_leaves_record_unchanged() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let p = seeded(&store);

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

        let v2 = version(enc.id, 2);
        let mut repointed = enc.clone();
        repointed.current_version_id = Some(v2.id);
        force_commit_failure_on_this_thread();
        let err = store
            .apply(
                ChangeSet::new(meta(RecordDomain::Encounter, ChangeAction::Update))
                    .with(Write::InsertVersion(v2))
                    .with(Write::UpdateEncounter {
                        row: repointed,
                        expected: EncounterStatus::Draft,
                    }),
            )
            .unwrap_err();

        assert!(matches!(err, StoreError::GitCommit(_)));
        assert_eq!(store.encounter(enc.id).unwrap(), Some(enc.clone()));
        assert_eq!(store.versions(enc.id).unwrap(), vec![v1]);
        assert_eq!(commits(&store.encounter_dir(enc.id)), 1);
    }

    #[test]
    fn commit_after_failed_commit_excludes_rolled_back_files() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let p = seeded(&store);
        let (enc, v1) = opened(&store, &p);

        let v2 = version(enc.id, 2);
        let mut repointed = enc.clone();
        repointed.current_version_id = Some(v2.id);
        force_commit_failure_on_this_thread();
        store
            .apply(
                ChangeSet::new(meta(RecordDomain::Encounter, ChangeAction::Update))
                    .with(Write::InsertVersion(v2))
                    .with(Write::UpdateEncounter {
                        row: repointed,
                        expected: EncounterStatus::Draft,
                    }),
            )
            .unwrap_err();

        let edited = with_complaint(v1, "headache");
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

        let dir = store.encounter_dir(enc.id);
        let repo = git2::Repository::open(&dir).unwrap();
        let tree = repo.head().unwrap().peel_to_tree().unwrap();
        assert!(tree.get_path(Path::new("versions/0001.yaml")).is_ok());
        assert!(tree.get_path(Path::new("versions/0002.yaml")).is_err());
        let index = repo.index().unwrap();
        assert!(index.get_path(Path::new("versions/0002.yaml"), 0).is_none());

        assert_eq!(commits(&dir), 2);
        assert_eq!(store.versions(enc.id).unwrap(), vec![edited]);
        assert_eq!(store.encounter(enc.id).unwrap(), Some(enc));
    }

    #[test]
    fn reads_during_commits_see_whole_rows() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(store(&temp));
        let p = seeded(&store);
        let (enc, v1) = opened(&store, &p);
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let store = Arc::clone(&store);
            let done = Arc::clone(&done);
            let v1 = v1.clone();
            thread::spawn(move || {
                for i in 0..30 {
                    let row = with_complaint(v1.clone(), &format!("revision {}", i).repeat(200));
                    store
                        .apply(
                            ChangeSet::new(meta(RecordDomain::Encounter, ChangeAction::Update))
                                .with(Write::UpdateVersion {
                                    row,
                                    expected: EncounterStatus::Draft,
                                }),
                        )
                        .unwrap();
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        loop {
            let finished = done.load(Ordering::SeqCst);
            let versions = store.versions(enc.id).unwrap();
            assert_eq!(versions.len(), 1);
            assert_eq!(versions[0].id, v1.id);
            assert!(store.encounter(enc.id).unwrap().is_some());
            if finished {
                break;
            }
        }
        writer.join().unwrap();

        assert_eq!(
            store.versions(enc.id).unwrap()[0].content.chief_complaint.as_str(),
            "revision 29".repeat(200)
        );
    }

    #[test]
    fn episode_rows_and_references() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let p = seeded(&store);
        let ep = episode(p.id);
        store
            .apply(
                ChangeSet::new(meta(RecordDomain::Episode, ChangeAction::Create))
                    .with(Write::InsertEpisode(ep.clone())),
            )
            .unwrap();

        assert!(store.episode_dir(ep.id).join(EPISODE_FILENAME).is_file());
        assert_eq!(store.episode(ep.id).unwrap(), Some(ep.clone()));
        assert_eq!(store.episodes(Some(p.id)).unwrap(), vec![ep.clone()]);
        assert!(store.episodes(Some(PatientId::new())).unwrap().is_empty());

        let orphan = episode(PatientId::new());
        let err = store
            .apply(
                ChangeSet::new(meta(RecordDomain::Episode, ChangeAction::Create))
                    .with(Write::InsertEpisode(orphan.clone())),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::ForeignKeyViolation { .. }));
        assert!(!store.episode_dir(orphan.id).exists());

        let mut enc = encounter(p.id, None);
        let v1 = version(enc.id, 1);
        enc.current_version_id = Some(v1.id);
        enc.episode_id = Some(ep.id);
        store
            .apply(
                ChangeSet::new(meta(RecordDomain::Encounter, ChangeAction::Create))
                    .with(Write::InsertEncounter(enc.clone()))
                    .with(Write::InsertVersion(v1)),
            )
            .unwrap();
        let filter = EncounterFilter {
            episode_id: Some(ep.id),
            ..Default::default()
        };
        assert_eq!(store.encounters(&filter).unwrap(), vec![enc]);
    }

    #[test]
    fn one_assessment_per_episode_across_records() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let p = seeded(&store);
        let ep = episode(p.id);
        store
            .apply(
                ChangeSet::new(meta(RecordDomain::Episode, ChangeAction::Create))
                    .with(Write::InsertEpisode(ep.clone())),
            )
            .unwrap();
        let now = chrono::Utc::now();
        let episode_id = ep.id;
        let row = |id| AnesthesiaAssessment {
            id,
            episode_id,
            fields: Default::default(),
            is_finalized: false,
            finalized_by: None,
            finalized_at: None,
            created_by: crate::ids::ActorId::new(),
            created_at: now,
            updated_at: now,
        };

        store
            .apply(
                ChangeSet::new(meta(RecordDomain::Assessment, ChangeAction::Create))
                    .with(Write::InsertAssessment(row(AssessmentId::new()))),
            )
            .unwrap();
        let err = store
            .apply(
                ChangeSet::new(meta(RecordDomain::Assessment, ChangeAction::Create))
                    .with(Write::InsertAssessment(row(AssessmentId::new()))),
            )
            .unwrap_err();

        assert!(matches!(err, StoreError::UniqueViolation { .. }));
        assert!(store.assessment_for_episode(episode_id).unwrap().is_some());

        let mut stray = row(AssessmentId::new());
        stray.episode_id = EpisodeId::new();
        let err = store
            .apply(
                ChangeSet::new(meta(RecordDomain::Assessment, ChangeAction::Create))
                    .with(Write::InsertAssessment(stray)),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::ForeignKeyViolation {
                references: Table::Episodes,
                ..
            }
        ));
    }
}
