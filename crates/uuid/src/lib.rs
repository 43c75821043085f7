//! Record identifiers and sharded-path utilities.
//!
//! Every stored row in the clinic (patients, encounters, encounter versions, anesthesia
//! assessments) is keyed by a UUID held in a *canonical* representation: **32 lowercase
//! hexadecimal characters**, no hyphens.
//!
//! This crate provides:
//! - [`RecordUuid`], a wrapper that guarantees the canonical format once constructed.
//! - The sharding rule used by the git-backed store to place a record's repository on disk.
//!
//! ## Canonical form
//! - Length: 32
//! - Characters: `0-9` and `a-f` only
//! - Example: `550e8400e29b41d4a716446655440000`
//!
//! Canonical form is required for identifiers arriving from outside the core (CLI arguments,
//! REST paths, gRPC fields). Hyphenated or uppercase input is rejected rather than normalised,
//! so the same record can never be addressed by two spellings.
//!
//! ## Sharded directory layout
//! For a canonical UUID `u`, a record lives under:
//! `parent_dir/<u[0..2]>/<u[2..4]>/<u>/`
//!
//! Example:
//! `clinic_data/encounters/55/0e/550e8400e29b41d4a716446655440000/`

mod service;

pub use service::{RecordUuid, Uuid};

/// Error type for record identifier parsing.
#[derive(Debug, thiserror::Error)]
pub enum UuidError {
    /// Input was not a canonical record UUID.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type for UUID operations.
pub type UuidResult<T> = Result<T, UuidError>;
