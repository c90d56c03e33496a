//! Token validation boundary

use crate::error::AuthError;
use async_trait::async_trait;
use fleetstore_common::types::{Role, SystemId};
use serde::{Deserialize, Serialize};

/// Authenticated caller
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub account: String,
    pub system: SystemId,
    pub role: Role,
}

impl Principal {
    /// Administrative commands (nodes, tiers, repair)
    #[must_use]
    pub const fn can_administer(&self) -> bool {
        matches!(self.role, Role::Admin | Role::Operator)
    }

    /// Fail with `Forbidden` unless the principal may administer `system`
    pub fn require_admin(&self, system: SystemId) -> Result<(), AuthError> {
        if self.can_administer() && self.system == system {
            Ok(())
        } else {
            Err(AuthError::Forbidden)
        }
    }

    /// Fail with `Forbidden` unless the principal belongs to `system`
    pub fn require_system(&self, system: SystemId) -> Result<(), AuthError> {
        if self.system == system {
            Ok(())
        } else {
            Err(AuthError::Forbidden)
        }
    }
}

#[async_trait]
pub trait AccessGate: Send + Sync {
    async fn validate(&self, token: &str) -> Result<Principal, AuthError>;
}
