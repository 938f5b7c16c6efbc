//! Capability checks
//!
//! Every property read, flag read and layer-data attach in the engine goes
//! through an [`ObjectProtection`] check against the [`AccessContext`] of the
//! running pass. A failed check surfaces as [`LayerError::AccessDenied`],
//! never as partial data.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{LayerError, LayerResult};

/// Identity that owns system-created objects and bypasses all checks.
pub const SYSTEM_IDENTITY: &str = "SYSTEM";

/// Role every context implicitly holds.
pub const PUBLIC_ROLE: &str = "PUBLIC";

/// Access levels, ordered from weakest to strongest.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccessType {
    /// Read properties and flags.
    View,
    /// Use the object as a dependency (e.g. place a volume in a pool).
    Use,
    /// Modify the object, including attaching layer data.
    Change,
    /// Change the protection itself.
    Control,
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AccessType::View => "VIEW",
            AccessType::Use => "USE",
            AccessType::Change => "CHANGE",
            AccessType::Control => "CONTROL",
        };
        f.write_str(name)
    }
}

/// Security context a reconciliation pass runs under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessContext {
    identity: String,
    role: String,
}

impl AccessContext {
    /// Creates a new access context.
    pub fn new(identity: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            role: role.into(),
        }
    }

    /// The privileged system context.
    pub fn system() -> Self {
        Self::new(SYSTEM_IDENTITY, SYSTEM_IDENTITY)
    }

    /// Returns the identity name.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Returns the role name.
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Checks if this is the system context.
    pub fn is_system(&self) -> bool {
        self.identity == SYSTEM_IDENTITY
    }
}

/// Protection record attached to every entity of the cluster model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectProtection {
    object: String,
    owner: String,
    acl: BTreeMap<String, AccessType>,
}

impl ObjectProtection {
    /// Protection owned by the system identity with an empty ACL.
    pub fn new(object: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            owner: SYSTEM_IDENTITY.to_string(),
            acl: BTreeMap::new(),
        }
    }

    /// Protection owned by `owner`.
    pub fn owned_by(object: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            owner: owner.into(),
            acl: BTreeMap::new(),
        }
    }

    /// Returns the description of the protected object.
    pub fn object(&self) -> &str {
        &self.object
    }

    /// Renames the protected object, keeping owner and ACL.
    pub fn set_object(&mut self, object: impl Into<String>) {
        self.object = object.into();
    }

    /// Returns the owner identity.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Grants `access` to `role`, replacing any previous entry.
    pub fn grant(&mut self, role: impl Into<String>, access: AccessType) {
        self.acl.insert(role.into(), access);
    }

    /// Removes the ACL entry of `role`.
    pub fn revoke(&mut self, role: &str) -> Option<AccessType> {
        self.acl.remove(role)
    }

    /// Returns the strongest access level `ctx` holds on this object.
    pub fn effective_access(&self, ctx: &AccessContext) -> Option<AccessType> {
        if ctx.is_system() || ctx.identity() == self.owner {
            return Some(AccessType::Control);
        }
        let by_role = self.acl.get(ctx.role()).copied();
        let by_public = self.acl.get(PUBLIC_ROLE).copied();
        by_role.max(by_public)
    }

    /// Fails with [`LayerError::AccessDenied`] unless `ctx` holds at least `required`.
    pub fn require_access(&self, ctx: &AccessContext, required: AccessType) -> LayerResult<()> {
        match self.effective_access(ctx) {
            Some(granted) if granted >= required => Ok(()),
            _ => Err(LayerError::AccessDenied {
                identity: ctx.identity().to_string(),
                object: self.object.clone(),
                required,
            }),
        }
    }
}
