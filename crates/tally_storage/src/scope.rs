#![forbid(unsafe_code)]

use tally_kernel_contracts::security::{SecurityContext, TenantId};
use tally_kernel_contracts::Validate;

use crate::store::StorageError;

/// Row visibility attached to a transaction at the moment it opens.
///
/// A missing or malformed context becomes `Denied`: every read sees zero rows
/// and every write is refused. There is no unscoped variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowScope {
    Tenant(SecurityContext),
    Denied,
}

impl RowScope {
    pub fn from_context(ctx: Option<&SecurityContext>) -> Self {
        match ctx {
            Some(c) if c.validate().is_ok() => RowScope::Tenant(c.clone()),
            _ => RowScope::Denied,
        }
    }

    pub fn permits(&self, tenant_id: &TenantId) -> bool {
        match self {
            RowScope::Tenant(ctx) => &ctx.tenant_id == tenant_id,
            RowScope::Denied => false,
        }
    }

    pub fn context(&self) -> Option<&SecurityContext> {
        match self {
            RowScope::Tenant(ctx) => Some(ctx),
            RowScope::Denied => None,
        }
    }

    pub(crate) fn require_write(
        &self,
        table: &'static str,
        tenant_id: &TenantId,
    ) -> Result<(), StorageError> {
        if self.permits(tenant_id) {
            Ok(())
        } else {
            Err(StorageError::ScopeDenied { table })
        }
    }
}
