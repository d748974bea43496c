#![forbid(unsafe_code)]

use tally_engines::recalc::{decide_batch_status, StatusDecision};
use tally_kernel_contracts::audit::{
    AuditAction, AuditEventInput, AuditPayloadMin, AuditSeverity,
};
use tally_kernel_contracts::batch::{BatchId, BatchStatus};
use tally_kernel_contracts::evaluation::EvaluationId;
use tally_kernel_contracts::security::{Role, SecurityContext};
use tally_kernel_contracts::MonotonicTimeNs;
use tally_storage::audit::AuditLogWriter;
use tally_storage::repo::{BatchTablesRepo, EvaluationTablesRepo};
use tally_storage::StoreHandle;

use crate::emission::{EmitOutcome, ReportEmissionRuntime};
use crate::error::{EmissionError, ValidationError};

#[derive(Debug)]
pub struct RecomputeOutcome {
    pub batch_id: BatchId,
    pub decision: StatusDecision,
    /// Batch status as read after any emission attempt.
    pub status: BatchStatus,
    /// Present when the decision landed on `completed`. An `Err` here was
    /// caught and logged; the status write above still stands.
    pub emission: Option<Result<EmitOutcome, EmissionError>>,
}

/// Recomputes a batch's status from fresh counts after an evaluation mutation,
/// then attempts emission when the batch is completed.
#[derive(Debug, Clone)]
pub struct BatchRecomputeRuntime {
    store: StoreHandle,
    emission: ReportEmissionRuntime,
}

impl BatchRecomputeRuntime {
    pub fn new(emission: ReportEmissionRuntime) -> Self {
        Self {
            store: emission.store().clone(),
            emission,
        }
    }

    pub fn emission(&self) -> &ReportEmissionRuntime {
        &self.emission
    }

    pub fn recompute(
        &self,
        ctx: Option<&SecurityContext>,
        batch_id: &BatchId,
        now: MonotonicTimeNs,
    ) -> Result<RecomputeOutcome, EmissionError> {
        let system_actor = self.emission.issuer().clone();
        let decision = self
            .store
            .transaction(ctx, |txn| -> Result<StatusDecision, EmissionError> {
                let batch = txn
                    .batch_row(batch_id)
                    .cloned()
                    .ok_or_else(|| ValidationError::UnknownBatch {
                        batch_id: batch_id.to_string(),
                    })?;
                let counts = txn.evaluation_counts(batch_id)?;
                let decision = decide_batch_status(batch.status, &counts);
                for step in &decision.path {
                    txn.update_batch_status(batch_id, *step, now)?;
                }
                if decision.changed() {
                    let payload = AuditPayloadMin::from_pairs_v1([
                        ("from_status", decision.previous.as_str().to_string()),
                        ("to_status", decision.target.as_str().to_string()),
                        ("total", counts.total.to_string()),
                        ("completed", counts.completed.to_string()),
                        ("inactivated", counts.inactivated.to_string()),
                    ])?;
                    AuditLogWriter::emit(
                        txn,
                        AuditEventInput::v1(
                            now,
                            batch.tenant_id.clone(),
                            system_actor,
                            Role::System,
                            AuditAction::StatusRecomputed,
                            AuditSeverity::Info,
                            decision.reason_code,
                            batch_id.clone(),
                            None,
                            payload,
                        )?,
                    )?;
                }
                Ok(decision)
            })?;

        tracing::debug!(
            batch_id = %batch_id,
            from = decision.previous.as_str(),
            to = decision.target.as_str(),
            changed = decision.changed(),
            "batch status recomputed"
        );

        let emission = if decision.triggers_emission() {
            let out = self.emission.emit(ctx, batch_id, now);
            if let Err(e) = &out {
                tracing::warn!(
                    batch_id = %batch_id,
                    error = %e,
                    retryable = e.is_retryable(),
                    "best-effort emission failed; batch left completed"
                );
            }
            Some(out)
        } else {
            None
        };

        let status = self
            .store
            .read(ctx, |txn| txn.batch_row(batch_id).map(|b| b.status))
            .unwrap_or(decision.target);
        Ok(RecomputeOutcome {
            batch_id: batch_id.clone(),
            decision,
            status,
            emission,
        })
    }

    /// Same as [`Self::recompute`], with the batch resolved from one of its evaluations.
    pub fn recompute_for_evaluation(
        &self,
        ctx: Option<&SecurityContext>,
        evaluation_id: &EvaluationId,
        now: MonotonicTimeNs,
    ) -> Result<RecomputeOutcome, EmissionError> {
        let batch_id = self
            .store
            .read(ctx, |txn| {
                txn.evaluation_row(evaluation_id).map(|e| e.batch_id.clone())
            })
            .ok_or_else(|| ValidationError::UnknownEvaluation {
                evaluation_id: evaluation_id.to_string(),
            })?;
        self.recompute(ctx, &batch_id, now)
    }
}
