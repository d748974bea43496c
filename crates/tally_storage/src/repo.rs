#![forbid(unsafe_code)]

use tally_kernel_contracts::audit::{AuditEvent, AuditEventId, AuditEventInput};
use tally_kernel_contracts::batch::{BatchId, BatchRecord, BatchStatus, EvaluationCounts};
use tally_kernel_contracts::evaluation::{DomainScore, EvaluationId, EvaluationRecord};
use tally_kernel_contracts::report::{ReportId, ReportRecord, ReportRowInput, ReportVersion};
use tally_kernel_contracts::MonotonicTimeNs;

use crate::store::{EvaluationTransition, StorageError};
use crate::txn::ScopedTxn;

/// Typed repository interface for the `batches` table.
pub trait BatchTablesRepo {
    fn insert_batch_row(&mut self, record: BatchRecord) -> Result<(), StorageError>;
    fn batch_row(&self, batch_id: &BatchId) -> Option<&BatchRecord>;
    fn batch_rows(&self) -> Vec<&BatchRecord>;
    fn update_batch_status(
        &mut self,
        batch_id: &BatchId,
        to: BatchStatus,
        at: MonotonicTimeNs,
    ) -> Result<BatchRecord, StorageError>;
}

/// Typed repository interface for the `evaluations` table.
pub trait EvaluationTablesRepo {
    fn insert_evaluation_row(&mut self, record: EvaluationRecord) -> Result<(), StorageError>;
    fn evaluation_row(&self, evaluation_id: &EvaluationId) -> Option<&EvaluationRecord>;
    fn evaluation_rows_for_batch(&self, batch_id: &BatchId) -> Vec<&EvaluationRecord>;
    fn evaluation_counts(&self, batch_id: &BatchId) -> Result<EvaluationCounts, StorageError>;
    fn apply_evaluation_transition(
        &mut self,
        transition: EvaluationTransition,
    ) -> Result<EvaluationRecord, StorageError>;
}

/// Typed repository interface for the `reports` table (unique on issued `batch_id`).
pub trait ReportTablesRepo {
    fn next_report_version(
        &self,
        batch_id: &BatchId,
    ) -> Result<(ReportVersion, Option<ReportId>), StorageError>;
    fn insert_report_row(&mut self, input: ReportRowInput) -> Result<ReportId, StorageError>;
    fn report_row(&self, report_id: ReportId) -> Option<&ReportRecord>;
    fn issued_report_for_batch(&self, batch_id: &BatchId) -> Option<&ReportRecord>;
    fn report_rows_for_batch(&self, batch_id: &BatchId) -> Vec<&ReportRecord>;
    fn supersede_issued_report(
        &mut self,
        batch_id: &BatchId,
        at: MonotonicTimeNs,
    ) -> Result<Option<ReportId>, StorageError>;
    fn attempt_overwrite_report_row(&mut self, report_id: ReportId) -> Result<(), StorageError>;
}

/// Typed repository interface for append-only `audit_log` persistence.
pub trait AuditLogRepo {
    fn append_audit_row(&mut self, input: AuditEventInput) -> Result<AuditEventId, StorageError>;
    fn audit_rows(&self) -> Vec<&AuditEvent>;
    fn audit_rows_for_batch(&self, batch_id: &BatchId) -> Vec<&AuditEvent>;
    fn attempt_overwrite_audit_row(&mut self, event_id: AuditEventId) -> Result<(), StorageError>;
}

impl BatchTablesRepo for ScopedTxn<'_> {
    fn insert_batch_row(&mut self, record: BatchRecord) -> Result<(), StorageError> {
        self.store.insert_batch_row(&self.scope, record)
    }

    fn batch_row(&self, batch_id: &BatchId) -> Option<&BatchRecord> {
        self.store.batch_row(&self.scope, batch_id)
    }

    fn batch_rows(&self) -> Vec<&BatchRecord> {
        self.store.batch_rows(&self.scope)
    }

    fn update_batch_status(
        &mut self,
        batch_id: &BatchId,
        to: BatchStatus,
        at: MonotonicTimeNs,
    ) -> Result<BatchRecord, StorageError> {
        self.store.update_batch_status(&self.scope, batch_id, to, at)
    }
}

impl EvaluationTablesRepo for ScopedTxn<'_> {
    fn insert_evaluation_row(&mut self, record: EvaluationRecord) -> Result<(), StorageError> {
        self.store.insert_evaluation_row(&self.scope, record)
    }

    fn evaluation_row(&self, evaluation_id: &EvaluationId) -> Option<&EvaluationRecord> {
        self.store.evaluation_row(&self.scope, evaluation_id)
    }

    fn evaluation_rows_for_batch(&self, batch_id: &BatchId) -> Vec<&EvaluationRecord> {
        self.store.evaluation_rows_for_batch(&self.scope, batch_id)
    }

    fn evaluation_counts(&self, batch_id: &BatchId) -> Result<EvaluationCounts, StorageError> {
        self.store.evaluation_counts(&self.scope, batch_id)
    }

    fn apply_evaluation_transition(
        &mut self,
        transition: EvaluationTransition,
    ) -> Result<EvaluationRecord, StorageError> {
        self.store.apply_evaluation_transition(&self.scope, transition)
    }
}

impl ReportTablesRepo for ScopedTxn<'_> {
    fn next_report_version(
        &self,
        batch_id: &BatchId,
    ) -> Result<(ReportVersion, Option<ReportId>), StorageError> {
        self.store.next_report_version(&self.scope, batch_id)
    }

    fn insert_report_row(&mut self, input: ReportRowInput) -> Result<ReportId, StorageError> {
        self.store.insert_report_row(&self.scope, input)
    }

    fn report_row(&self, report_id: ReportId) -> Option<&ReportRecord> {
        self.store.report_row(&self.scope, report_id)
    }

    fn issued_report_for_batch(&self, batch_id: &BatchId) -> Option<&ReportRecord> {
        self.store.issued_report_for_batch(&self.scope, batch_id)
    }

    fn report_rows_for_batch(&self, batch_id: &BatchId) -> Vec<&ReportRecord> {
        self.store.report_rows_for_batch(&self.scope, batch_id)
    }

    fn supersede_issued_report(
        &mut self,
        batch_id: &BatchId,
        at: MonotonicTimeNs,
    ) -> Result<Option<ReportId>, StorageError> {
        self.store.supersede_issued_report(&self.scope, batch_id, at)
    }

    fn attempt_overwrite_report_row(&mut self, report_id: ReportId) -> Result<(), StorageError> {
        self.store.attempt_overwrite_report_row(report_id)
    }
}

impl AuditLogRepo for ScopedTxn<'_> {
    fn append_audit_row(&mut self, input: AuditEventInput) -> Result<AuditEventId, StorageError> {
        self.store.append_audit_event(&self.scope, input)
    }

    fn audit_rows(&self) -> Vec<&AuditEvent> {
        self.store.audit_events(&self.scope)
    }

    fn audit_rows_for_batch(&self, batch_id: &BatchId) -> Vec<&AuditEvent> {
        self.store.audit_events_for_batch(&self.scope, batch_id)
    }

    fn attempt_overwrite_audit_row(&mut self, event_id: AuditEventId) -> Result<(), StorageError> {
        self.store.attempt_overwrite_audit_event(event_id)
    }
}

impl ScopedTxn<'_> {
    /// The external release operation: one batch plus its started evaluations.
    pub fn release_batch(
        &mut self,
        batch: BatchRecord,
        evaluations: Vec<EvaluationRecord>,
    ) -> Result<(), StorageError> {
        let batch_id = batch.batch_id.clone();
        self.insert_batch_row(batch)?;
        for e in evaluations {
            if e.batch_id != batch_id {
                return Err(StorageError::ForeignKeyViolation {
                    table: "evaluations.batch_id",
                    key: e.batch_id.to_string(),
                });
            }
            self.insert_evaluation_row(e)?;
        }
        Ok(())
    }

    pub fn complete_evaluation(
        &mut self,
        evaluation_id: &EvaluationId,
        domain_scores: Vec<DomainScore>,
        at: MonotonicTimeNs,
    ) -> Result<EvaluationRecord, StorageError> {
        self.apply_evaluation_transition(EvaluationTransition::Complete {
            evaluation_id: evaluation_id.clone(),
            at,
            domain_scores,
        })
    }

    pub fn inactivate_evaluation(
        &mut self,
        evaluation_id: &EvaluationId,
        reason: impl Into<String>,
        at: MonotonicTimeNs,
    ) -> Result<EvaluationRecord, StorageError> {
        self.apply_evaluation_transition(EvaluationTransition::Inactivate {
            evaluation_id: evaluation_id.clone(),
            at,
            reason: reason.into(),
        })
    }

    pub fn reset_evaluation(
        &mut self,
        evaluation_id: &EvaluationId,
        at: MonotonicTimeNs,
    ) -> Result<EvaluationRecord, StorageError> {
        self.apply_evaluation_transition(EvaluationTransition::Reset {
            evaluation_id: evaluation_id.clone(),
            at,
        })
    }
}
