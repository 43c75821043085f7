//! Constants used throughout the clinic core crate.
//!
//! Path and filename constants live here so the git-backed store layout is defined in one place.

/// Default directory for record storage when no explicit directory is configured.
pub const DEFAULT_DATA_DIR: &str = "clinic_data";

/// Directory name for patient records.
pub const PATIENTS_DIR_NAME: &str = "patients";

/// Directory name for episode records.
pub const EPISODES_DIR_NAME: &str = "episodes";

/// Directory name for encounter records.
pub const ENCOUNTERS_DIR_NAME: &str = "encounters";

/// Directory name for anesthesia assessment records.
pub const ASSESSMENTS_DIR_NAME: &str = "assessments";

/// Sub-directory of an encounter record holding one file per version.
pub const VERSIONS_DIR_NAME: &str = "versions";

/// Filename for a patient row.
pub const PATIENT_FILENAME: &str = "patient.yaml";

/// Filename for an episode row.
pub const EPISODE_FILENAME: &str = "episode.yaml";

/// Filename for an encounter row.
pub const ENCOUNTER_FILENAME: &str = "encounter.yaml";

/// Filename for an anesthesia assessment row.
pub const ASSESSMENT_FILENAME: &str = "assessment.yaml";

/// Mail domain used to build git committer addresses from actor ids.
pub const COMMIT_EMAIL_DOMAIN: &str = "users.clinic.invalid";
