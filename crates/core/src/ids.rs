//! Typed record identifiers.
//!
//! Each table gets its own newtype over [`RecordUuid`] so an encounter id can never be passed
//! where a version id is expected. All of them render and parse in canonical 32-hex form.

use crate::error::{ClinicError, ClinicResult};
use clinic_uuid::RecordUuid;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(RecordUuid);

        impl $name {
            /// Allocates a fresh identifier.
            pub fn new() -> Self {
                Self(RecordUuid::new())
            }

            /// Parses a canonical identifier supplied from outside the core.
            pub fn parse(input: &str) -> ClinicResult<Self> {
                RecordUuid::parse(input.trim()).map(Self).map_err(|e| {
                    ClinicError::InvalidInput(format!("{}: {}", stringify!($name), e))
                })
            }

            pub fn record_uuid(&self) -> RecordUuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<RecordUuid> for $name {
            fn from(id: RecordUuid) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = ClinicError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

record_id!(
    /// Identifies a patient row.
    PatientId
);
record_id!(
    /// Identifies an encounter (one clinical documentation lineage).
    EncounterId
);
record_id!(
    /// Identifies one version of an encounter.
    VersionId
);
record_id!(
    /// Identifies an anesthesia assessment.
    AssessmentId
);
record_id!(
    /// Identifies a surgical episode.
    EpisodeId
);
record_id!(
    /// Identifies an appointment. Appointments are managed outside this crate.
    AppointmentId
);
record_id!(
    /// Identifies an authenticated user.
    ActorId
);
