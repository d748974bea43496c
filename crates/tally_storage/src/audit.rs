#![forbid(unsafe_code)]

use tally_kernel_contracts::audit::{AuditEventId, AuditEventInput};

use crate::repo::AuditLogRepo;
use crate::store::StorageError;
use crate::txn::ScopedTxn;

/// Append-only writer into the `audit_log` table.
///
/// Callers pass the open transaction so the audit row commits or rolls back together
/// with the state change it describes.
#[derive(Debug, Default)]
pub struct AuditLogWriter;

impl AuditLogWriter {
    pub fn emit(
        txn: &mut ScopedTxn<'_>,
        input: AuditEventInput,
    ) -> Result<AuditEventId, StorageError> {
        let action = input.action.as_str();
        let batch_id = input.batch_id.to_string();
        let event_id = txn.append_audit_row(input)?;
        tracing::debug!(event_id = event_id.0, action, batch_id = %batch_id, "audit row appended");
        Ok(event_id)
    }
}
