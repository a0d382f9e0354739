//! Write authorization.
//!
//! The engine asks a [`AuthorizationGuard`] before every mutation and fails
//! with `Forbidden` on deny, before any lock, index, audit, or WAL work.
//! [`RolePolicy`] is the guard the server runs with: a static email → role
//! table loaded from configuration.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::model::{normalize_subject, Actor, AuditAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceClass {
    InterviewEvent,
}

impl ResourceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceClass::InterviewEvent => "interview_event",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Decision::Allow
    }
}

pub trait AuthorizationGuard: Send + Sync {
    fn authorize(&self, actor: &Actor, action: AuditAction, resource: ResourceClass) -> Decision;
}

/// Allows everything. For embedding and tests.
#[derive(Debug, Default)]
pub struct AllowAll;

impl AuthorizationGuard for AllowAll {
    fn authorize(&self, _actor: &Actor, _action: AuditAction, _resource: ResourceClass) -> Decision {
        Decision::Allow
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    Viewer,
    Coordinator,
    Admin,
}

impl Role {
    fn permits(self, action: AuditAction) -> bool {
        match action {
            AuditAction::Create | AuditAction::Update => self >= Role::Coordinator,
            AuditAction::Delete => self == Role::Admin,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Viewer => "viewer",
            Role::Coordinator => "coordinator",
            Role::Admin => "admin",
        })
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "viewer" => Ok(Role::Viewer),
            "coordinator" => Ok(Role::Coordinator),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
struct Grant {
    role: Role,
    display_name: Option<String>,
}

/// Static email → role table.
#[derive(Debug, Clone)]
pub struct RolePolicy {
    grants: HashMap<String, Grant>,
    default_role: Role,
}

impl RolePolicy {
    pub fn new(default_role: Role) -> Self {
        Self {
            grants: HashMap::new(),
            default_role,
        }
    }

    pub fn grant(mut self, email: &str, role: Role, display_name: Option<&str>) -> Self {
        self.grants.insert(
            normalize_subject(email),
            Grant {
                role,
                display_name: display_name.map(str::to_string),
            },
        );
        self
    }

    /// Parse `email=role[:Display Name]` entries separated by commas.
    pub fn parse(spec: &str, default_role: Role) -> Result<Self, String> {
        let mut policy = Self::new(default_role);
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (email, rest) = entry
                .split_once('=')
                .ok_or_else(|| format!("bad role entry (expected email=role): {entry}"))?;
            let (role, name) = match rest.split_once(':') {
                Some((role, name)) => (role, Some(name.trim()).filter(|n| !n.is_empty())),
                None => (rest, None),
            };
            let email = email.trim();
            if email.is_empty() {
                return Err(format!("bad role entry (empty email): {entry}"));
            }
            policy = policy.grant(email, role.parse()?, name);
        }
        Ok(policy)
    }

    pub fn role_of(&self, email: &str) -> Role {
        self.grants
            .get(&normalize_subject(email))
            .map_or(self.default_role, |g| g.role)
    }

    /// Build the actor for a login, using the configured display name when
    /// there is one and the email otherwise.
    pub fn actor_for(&self, email: &str) -> Actor {
        let key = normalize_subject(email);
        let name = self
            .grants
            .get(&key)
            .and_then(|g| g.display_name.clone())
            .unwrap_or_else(|| key.clone());
        Actor::new(key, name)
    }
}

impl AuthorizationGuard for RolePolicy {
    fn authorize(&self, actor: &Actor, action: AuditAction, _resource: ResourceClass) -> Decision {
        if self.role_of(&actor.email).permits(action) {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }
}
