#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::string_id;
use crate::{ContractViolation, Validate};

string_id!(
    /// Owning organization; the row-isolation boundary.
    TenantId,
    "tenant_id",
    64
);

string_id!(ActorId, "actor_id", 96);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    TenantAdmin,
    Manager,
    Auditor,
    Subject,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::TenantAdmin => "tenant_admin",
            Role::Manager => "manager",
            Role::Auditor => "auditor",
            Role::Subject => "subject",
        }
    }
}

/// Resolved `{actor_id, role, tenant_id}` handed over by the access gateway.
///
/// This crate never decides whether the actor may act; the value only scopes
/// which rows are visible and who is recorded in the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecurityContext {
    pub actor_id: ActorId,
    pub role: Role,
    pub tenant_id: TenantId,
}

impl SecurityContext {
    pub fn v1(actor_id: ActorId, role: Role, tenant_id: TenantId) -> Result<Self, ContractViolation> {
        let c = Self {
            actor_id,
            role,
            tenant_id,
        };
        c.validate()?;
        Ok(c)
    }

    /// Context used by the automated emission path: same tenant, system actor.
    pub fn system_for(tenant_id: TenantId, system_actor: ActorId) -> Self {
        Self {
            actor_id: system_actor,
            role: Role::System,
            tenant_id,
        }
    }
}

impl Validate for SecurityContext {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.actor_id.validate()?;
        self.tenant_id.validate()?;
        Ok(())
    }
}
