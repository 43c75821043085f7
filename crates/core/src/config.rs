//! Core runtime configuration.
//!
//! Configuration is resolved once at process startup and then passed into core services. The
//! core never reads process-wide environment variables during request handling; binaries read
//! them and hand the raw values to [`CoreConfig::from_env_values`].

use crate::constants::{
    ASSESSMENTS_DIR_NAME, DEFAULT_DATA_DIR, ENCOUNTERS_DIR_NAME, EPISODES_DIR_NAME,
    PATIENTS_DIR_NAME,
};
use crate::error::{ClinicError, ClinicResult};
use clinic_types::{NonEmptyText, TextError};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Which [`crate::store::ClinicStore`] implementation backs the services.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StoreBackend {
    /// YAML rows in per-record git repositories under the data directory.
    #[default]
    Git,
    /// Process-local tables; contents are lost on exit.
    Memory,
}

impl FromStr for StoreBackend {
    type Err = ClinicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "git" => Ok(Self::Git),
            "memory" => Ok(Self::Memory),
            other => Err(ClinicError::InvalidInput(format!(
                "unknown store backend '{}' (expected 'git' or 'memory')",
                other
            ))),
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Git => "git",
            Self::Memory => "memory",
        })
    }
}

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    data_dir: PathBuf,
    care_location: NonEmptyText,
    store_backend: StoreBackend,
}

impl CoreConfig {
    /// Create a new `CoreConfig`.
    ///
    /// `care_location` names the clinic in every stored commit and must be a single
    /// non-empty line.
    pub fn new(
        data_dir: PathBuf,
        care_location: &str,
        store_backend: StoreBackend,
    ) -> ClinicResult<Self> {
        let care_location = NonEmptyText::single_line(care_location).map_err(|e| match e {
            TextError::MultiLine => {
                ClinicError::InvalidInput("care_location must be a single line".into())
            }
            _ => ClinicError::InvalidInput("care_location cannot be empty".into()),
        })?;

        Ok(Self {
            data_dir,
            care_location,
            store_backend,
        })
    }

    /// Build a configuration from optional raw environment values.
    ///
    /// - `data_dir`: defaults to [`DEFAULT_DATA_DIR`] when absent or blank
    /// - `care_location`: required
    /// - `store_backend`: defaults to [`StoreBackend::Git`] when absent or blank
    pub fn from_env_values(
        data_dir: Option<String>,
        care_location: Option<String>,
        store_backend: Option<String>,
    ) -> ClinicResult<Self> {
        let data_dir = non_blank(data_dir)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        let care_location = non_blank(care_location).ok_or_else(|| {
            ClinicError::InvalidInput("CLINIC_CARE_LOCATION must be set".into())
        })?;
        let store_backend = non_blank(store_backend)
            .map(|v| v.parse::<StoreBackend>())
            .transpose()?
            .unwrap_or_default();

        Self::new(data_dir, &care_location, store_backend)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn patients_dir(&self) -> PathBuf {
        self.data_dir.join(PATIENTS_DIR_NAME)
    }

    pub fn episodes_dir(&self) -> PathBuf {
        self.data_dir.join(EPISODES_DIR_NAME)
    }

    pub fn encounters_dir(&self) -> PathBuf {
        self.data_dir.join(ENCOUNTERS_DIR_NAME)
    }

    pub fn assessments_dir(&self) -> PathBuf {
        self.data_dir.join(ASSESSMENTS_DIR_NAME)
    }

    pub fn care_location(&self) -> &NonEmptyText {
        &self.care_location
    }

    pub fn store_backend(&self) -> StoreBackend {
        self.store_backend
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
