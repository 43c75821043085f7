//! Actors, roles and the per-request context.
//!
//! Identity is supplied by an external provider; by the time a request reaches the core it has
//! been reduced to an [`Actor`] (id plus role set) carried in a [`RequestContext`]. The context is
//! built fresh for every request, so role selection is never process-wide state.

use crate::error::{ClinicError, ClinicResult};
use crate::ids::ActorId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Clinic roles, declared in primary-role priority order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Doctor,
    Reception,
    Nurse,
    Anesthesia,
}

impl Role {
    /// All roles, highest priority first.
    pub const ALL: [Role; 5] = [
        Role::Admin,
        Role::Doctor,
        Role::Reception,
        Role::Nurse,
        Role::Anesthesia,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Doctor => "doctor",
            Self::Reception => "reception",
            Self::Nurse => "nurse",
            Self::Anesthesia => "anesthesia",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ClinicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Role::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ClinicError::InvalidInput(format!("unknown role: '{}'", wanted)))
    }
}

/// Roles allowed to finalize clinical encounters.
pub const CLINICAL_AUTHORITY_ROLES: &[Role] = &[Role::Doctor, Role::Admin];

/// Roles allowed to author anesthesia assessments.
pub const ANESTHESIA_ROLES: &[Role] = &[Role::Anesthesia, Role::Admin];

/// An authenticated user and the roles they hold.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Actor {
    id: ActorId,
    roles: BTreeSet<Role>,
}

impl Actor {
    pub fn new(id: ActorId, roles: impl IntoIterator<Item = Role>) -> Self {
        Self {
            id,
            roles: roles.into_iter().collect(),
        }
    }

    /// Builds an actor from role names as stored by the identity provider.
    ///
    /// Unknown names are skipped, matching how a role table with extra entries would be read.
    pub fn from_role_names<I, S>(id: ActorId, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut roles = BTreeSet::new();
        for name in names {
            let name = name.as_ref().trim();
            if name.is_empty() {
                continue;
            }
            match name.parse::<Role>() {
                Ok(role) => {
                    roles.insert(role);
                }
                Err(_) => tracing::debug!("ignoring unknown role '{}' for actor {}", name, id),
            }
        }
        Self { id, roles }
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn roles(&self) -> &BTreeSet<Role> {
        &self.roles
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn has_any_role(&self, roles: &[Role]) -> bool {
        roles.iter().any(|r| self.roles.contains(r))
    }

    /// The single role used for display: admin, then doctor, reception, nurse, anesthesia.
    pub fn primary_role(&self) -> Option<Role> {
        Role::ALL.into_iter().find(|r| self.roles.contains(r))
    }
}

/// Per-request identity, resolved by the API layer before calling into the core.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    actor: Option<Actor>,
}

impl RequestContext {
    pub fn anonymous() -> Self {
        Self { actor: None }
    }

    pub fn authenticated(actor: Actor) -> Self {
        Self { actor: Some(actor) }
    }

    pub fn actor(&self) -> Option<&Actor> {
        self.actor.as_ref()
    }

    pub fn require_actor(&self) -> ClinicResult<&Actor> {
        self.actor.as_ref().ok_or(ClinicError::NotAuthenticated)
    }

    /// Requires an authenticated actor holding at least one of `roles`.
    pub fn require_any_role(&self, roles: &[Role]) -> ClinicResult<&Actor> {
        let actor = self.require_actor()?;
        if actor.has_any_role(roles) {
            return Ok(actor);
        }

        let required = roles
            .iter()
            .map(|r| r.as_str())
            .collect::<Vec<_>>()
            .join(" or ");
        tracing::warn!("actor {} lacks role {}", actor.id(), required);
        Err(ClinicError::Forbidden { required })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parsing_is_case_insensitive() {
        assert_eq!("Doctor".parse::<Role>().unwrap(), Role::Doctor);
        assert_eq!(" anesthesia ".parse::<Role>().unwrap(), Role::Anesthesia);
        assert!("surgeon".parse::<Role>().is_err());
    }

    #[test]
    fn from_role_names_skips_unknown_and_blank() {
        let actor = Actor::from_role_names(ActorId::new(), ["nurse", "", "janitor", "doctor"]);
        assert_eq!(
            actor.roles().iter().copied().collect::<Vec<_>>(),
            vec![Role::Doctor, Role::Nurse]
        );
    }

    #[test]
    fn primary_role_follows_priority() {
        let actor = Actor::new(ActorId::new(), [Role::Anesthesia, Role::Reception]);
        assert_eq!(actor.primary_role(), Some(Role::Reception));

        let actor = Actor::new(ActorId::new(), [Role::Nurse, Role::Admin]);
        assert_eq!(actor.primary_role(), Some(Role::Admin));

        let actor = Actor::new(ActorId::new(), []);
        assert_eq!(actor.primary_role(), None);
    }

    #[test]
    fn anonymous_context_is_not_authenticated() {
        let ctx = RequestContext::anonymous();
        assert!(matches!(
            ctx.require_actor(),
            Err(ClinicError::NotAuthenticated)
        ));
        assert!(matches!(
            ctx.require_any_role(CLINICAL_AUTHORITY_ROLES),
            Err(ClinicError::NotAuthenticated)
        ));
    }

    #[test]
    fn role_gate_rejects_missing_role() {
        let ctx = RequestContext::authenticated(Actor::new(ActorId::new(), [Role::Nurse]));
        let err = ctx.require_any_role(CLINICAL_AUTHORITY_ROLES).unwrap_err();
        assert!(matches!(err, ClinicError::Forbidden { ref required } if required == "doctor or admin"));
    }

    #[test]
    fn role_gate_accepts_any_listed_role() {
        let ctx = RequestContext::authenticated(Actor::new(ActorId::new(), [Role::Admin]));
        assert!(ctx.require_any_role(ANESTHESIA_ROLES).is_ok());
        assert!(ctx.require_any_role(CLINICAL_AUTHORITY_ROLES).is_ok());
    }
}
