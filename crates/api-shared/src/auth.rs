//! API key checks and actor resolution from request headers.
//!
//! Identity is established upstream of this service. Callers forward the authenticated user as
//! two headers, which both APIs turn into a [`RequestContext`]:
//!
//! - `x-actor-id`: the user id, canonical 32-hex UUID
//! - `x-actor-roles`: comma-separated role names; unknown names are ignored
//!
//! A request without `x-actor-id` is anonymous. The core decides which operations that allows.

use clinic_core::{Actor, ActorId, ClinicError, ClinicResult, RequestContext};
use std::sync::Arc;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_ROLES_HEADER: &str = "x-actor-roles";

/// The API key gRPC callers must present, resolved once at startup.
#[derive(Clone)]
pub struct ApiKey(Arc<str>);

impl ApiKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    /// Reads `API_KEY` from the environment.
    pub fn from_env() -> Result<Self, std::env::VarError> {
        std::env::var("API_KEY").map(Self::new)
    }

    /// Validates the provided API key.
    #[allow(clippy::result_large_err)]
    pub fn validate(&self, provided_key: &str) -> Result<(), tonic::Status> {
        if provided_key == &*self.0 {
            Ok(())
        } else {
            Err(tonic::Status::unauthenticated("Invalid API key"))
        }
    }
}

/// Builds the request context from the raw actor header values.
///
/// # Errors
///
/// [`ClinicError::InvalidInput`] if `x-actor-id` is present but not a canonical UUID.
pub fn request_context(
    actor_id: Option<&str>,
    roles: Option<&str>,
) -> ClinicResult<RequestContext> {
    let Some(raw_id) = actor_id.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(RequestContext::anonymous());
    };
    let id = ActorId::parse(raw_id).map_err(|_| {
        ClinicError::InvalidInput(format!("{} must be a canonical UUID", ACTOR_ID_HEADER))
    })?;
    let names = roles.unwrap_or_default().split(',');
    Ok(RequestContext::authenticated(Actor::from_role_names(id, names)))
}
