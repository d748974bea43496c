#![forbid(unsafe_code)]

use std::sync::Arc;

use tally_engines::aggregate::aggregate_domain_scores;
use tally_engines::digest::{content_hash, hashes_match, sha256_hex};
use tally_engines::render::{ArtifactRenderer, BatchMetadata};
use tally_kernel_contracts::audit::{
    AuditAction, AuditEventInput, AuditPayloadMin, AuditSeverity,
};
use tally_kernel_contracts::batch::{BatchId, BatchRecord, BatchStatus, EvaluationCounts};
use tally_kernel_contracts::evaluation::EvaluationRecord;
use tally_kernel_contracts::report::{
    ArtifactKey, ContentHash, ReportId, ReportRowInput, ReportVersion,
};
use tally_kernel_contracts::security::{ActorId, Role, SecurityContext};
use tally_kernel_contracts::{ContractViolation, MonotonicTimeNs, Validate};
use tally_storage::artifact::ArtifactStore;
use tally_storage::audit::AuditLogWriter;
use tally_storage::lock::BatchLockTable;
use tally_storage::repo::{BatchTablesRepo, EvaluationTablesRepo, ReportTablesRepo};
use tally_storage::store::REPORTS_BATCH_UNIQUE;
use tally_storage::{ScopedTxn, StorageError, StoreHandle};

use crate::config::EmissionConfig;
use crate::error::{EmissionError, ValidationError};

pub mod reason_codes {
    use tally_kernel_contracts::ReasonCodeId;

    // Report emission reason-code namespace.
    pub const EMIT_ISSUED: ReasonCodeId = ReasonCodeId(0xE300_0001);
    pub const EMIT_FAILED: ReasonCodeId = ReasonCodeId(0xE300_0002);
    pub const EMIT_INTEGRITY_MISMATCH: ReasonCodeId = ReasonCodeId(0xE300_0003);
    pub const EMIT_BATCH_RESET: ReasonCodeId = ReasonCodeId(0xE300_0004);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedReport {
    pub report_id: ReportId,
    pub batch_id: BatchId,
    pub version: ReportVersion,
    pub content_hash: ContentHash,
    pub artifact_key: ArtifactKey,
    pub byte_len: u64,
}

/// A losing emission attempt. Success-equivalent for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConcurrencyConflict {
    AlreadyEmitted { report_id: ReportId },
    InProgress { batch_id: BatchId },
    // The batch or its evaluations changed while the artifact was produced.
    SnapshotChanged { batch_id: BatchId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmitOutcome {
    Emitted(EmittedReport),
    Conflict(ConcurrencyConflict),
}

impl EmitOutcome {
    pub fn report_id(&self) -> Option<ReportId> {
        match self {
            EmitOutcome::Emitted(r) => Some(r.report_id),
            EmitOutcome::Conflict(ConcurrencyConflict::AlreadyEmitted { report_id }) => {
                Some(*report_id)
            }
            EmitOutcome::Conflict(
                ConcurrencyConflict::InProgress { .. }
                | ConcurrencyConflict::SnapshotChanged { .. },
            ) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetOutcome {
    pub batch_id: BatchId,
    pub superseded_report_id: Option<ReportId>,
}

#[derive(Debug, Clone)]
struct EmissionInputs {
    batch: BatchRecord,
    counts: EvaluationCounts,
    evaluations: Vec<EvaluationRecord>,
    version: ReportVersion,
    supersedes: Option<ReportId>,
}

#[derive(Debug)]
enum Precheck {
    Ready(Box<EmissionInputs>),
    AlreadyEmitted(ReportId),
}

/// The batch flips to `emitted` in the transaction that inserts the report row,
/// after the artifact write is confirmed.
#[derive(Clone)]
pub struct ReportEmissionRuntime {
    store: StoreHandle,
    artifacts: Arc<dyn ArtifactStore>,
    renderer: Arc<dyn ArtifactRenderer>,
    locks: BatchLockTable,
    config: EmissionConfig,
    issuer: ActorId,
}

impl std::fmt::Debug for ReportEmissionRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportEmissionRuntime")
            .field("renderer", &self.renderer.renderer_id())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ReportEmissionRuntime {
    pub fn new(
        store: StoreHandle,
        artifacts: Arc<dyn ArtifactStore>,
        renderer: Arc<dyn ArtifactRenderer>,
        config: EmissionConfig,
    ) -> Result<Self, ContractViolation> {
        config.validate()?;
        let issuer = config.issuer()?;
        Ok(Self {
            store,
            artifacts,
            renderer,
            locks: BatchLockTable::new(),
            config,
            issuer,
        })
    }

    pub fn with_lock_table(mut self, locks: BatchLockTable) -> Self {
        self.locks = locks;
        self
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn artifacts(&self) -> &Arc<dyn ArtifactStore> {
        &self.artifacts
    }

    pub fn lock_table(&self) -> &BatchLockTable {
        &self.locks
    }

    pub fn config(&self) -> &EmissionConfig {
        &self.config
    }

    pub fn issuer(&self) -> &ActorId {
        &self.issuer
    }

    fn system_context(&self, caller: &SecurityContext) -> SecurityContext {
        SecurityContext::system_for(caller.tenant_id.clone(), self.issuer.clone())
    }

    pub fn emit(
        &self,
        ctx: Option<&SecurityContext>,
        batch_id: &BatchId,
        now: MonotonicTimeNs,
    ) -> Result<EmitOutcome, EmissionError> {
        let Some(_guard) = self.locks.acquire(batch_id, self.config.lock_wait_timeout()) else {
            tracing::warn!(batch_id = %batch_id, "emission lock busy");
            return Ok(EmitOutcome::Conflict(ConcurrencyConflict::InProgress {
                batch_id: batch_id.clone(),
            }));
        };

        let system = ctx.map(|c| self.system_context(c));
        let inputs = match self
            .store
            .read(system.as_ref(), |txn| self.precheck(txn, batch_id))?
        {
            Precheck::AlreadyEmitted(report_id) => {
                tracing::info!(batch_id = %batch_id, report_id = report_id.0, "batch already emitted");
                return Ok(EmitOutcome::Conflict(ConcurrencyConflict::AlreadyEmitted {
                    report_id,
                }));
            }
            Precheck::Ready(inputs) => inputs,
        };

        match self.produce_and_commit(system.as_ref(), &inputs, now) {
            Err(e) => {
                self.record_failure(system.as_ref(), &inputs.batch, &e, now);
                Err(e)
            }
            ok => ok,
        }
    }

    fn precheck(&self, txn: &ScopedTxn<'_>, batch_id: &BatchId) -> Result<Precheck, EmissionError> {
        let batch = txn
            .batch_row(batch_id)
            .cloned()
            .ok_or_else(|| ValidationError::UnknownBatch {
                batch_id: batch_id.to_string(),
            })?;
        if let Some(existing) = txn.issued_report_for_batch(batch_id) {
            return Ok(Precheck::AlreadyEmitted(existing.report_id));
        }
        if batch.status != BatchStatus::Completed {
            return Err(ValidationError::WrongBatchState {
                batch_id: batch_id.to_string(),
                expected: BatchStatus::Completed.as_str(),
                actual: batch.status.as_str(),
            }
            .into());
        }
        let counts = txn.evaluation_counts(batch_id)?;
        if counts.total > self.config.max_evaluations_per_batch {
            return Err(ValidationError::BatchTooLarge {
                batch_id: batch_id.to_string(),
                total: counts.total,
                max: self.config.max_evaluations_per_batch,
            }
            .into());
        }
        let evaluations = txn
            .evaluation_rows_for_batch(batch_id)
            .into_iter()
            .cloned()
            .collect();
        let (version, supersedes) = txn.next_report_version(batch_id)?;
        Ok(Precheck::Ready(Box::new(EmissionInputs {
            batch,
            counts,
            evaluations,
            version,
            supersedes,
        })))
    }

    fn produce_and_commit(
        &self,
        system: Option<&SecurityContext>,
        inputs: &EmissionInputs,
        now: MonotonicTimeNs,
    ) -> Result<EmitOutcome, EmissionError> {
        let batch = &inputs.batch;
        let aggregate = aggregate_domain_scores(&inputs.evaluations)?;
        let metadata = BatchMetadata {
            batch_id: batch.batch_id.clone(),
            tenant_id: batch.tenant_id.clone(),
            created_at: batch.created_at,
            completed_at: batch.completed_at,
            counts: inputs.counts,
            report_version: inputs.version,
        };
        let bytes = self.renderer.render(&aggregate, &metadata)?;
        let hash = content_hash(&bytes)?;
        let key = ArtifactKey::versioned(
            &self.config.artifact_key_prefix,
            &batch.tenant_id,
            &batch.batch_id,
            inputs.version,
        )?;

        self.artifacts.put(&key, &bytes)?;
        if self.config.verify_after_write {
            let stored = self.artifacts.get(&key)?;
            let computed = sha256_hex(&stored);
            if !hashes_match(hash.as_str(), &computed) {
                tracing::error!(
                    alert = "integrity_mismatch",
                    batch_id = %batch.batch_id,
                    artifact_key = %key,
                    stored_hash = hash.as_str(),
                    computed_hash = computed.as_str(),
                    "artifact read-back does not match the rendered hash"
                );
                return Err(EmissionError::IntegrityMismatch {
                    stored_hash: hash.as_str().to_string(),
                    computed_hash: computed,
                });
            }
        }

        let byte_len = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
        let row = ReportRowInput::v1(
            batch.batch_id.clone(),
            batch.tenant_id.clone(),
            inputs.version,
            hash.clone(),
            key.clone(),
            byte_len,
            inputs.supersedes,
            now,
            self.issuer.clone(),
        )?;

        let committed = self
            .store
            .transaction(system, |txn| -> Result<Option<ReportId>, StorageError> {
            if txn.issued_report_for_batch(&batch.batch_id).is_none()
                && !snapshot_unchanged(txn, inputs)
            {
                return Ok(None);
            }
            let report_id = txn.insert_report_row(row)?;
            txn.update_batch_status(&batch.batch_id, BatchStatus::Emitted, now)?;
            let payload = AuditPayloadMin::from_pairs_v1([
                ("content_hash", hash.as_str().to_string()),
                ("report_version", inputs.version.0.to_string()),
                ("artifact_key", key.to_string()),
            ])?;
            AuditLogWriter::emit(
                txn,
                AuditEventInput::v1(
                    now,
                    batch.tenant_id.clone(),
                    self.issuer.clone(),
                    Role::System,
                    AuditAction::AutoEmit,
                    AuditSeverity::Info,
                    reason_codes::EMIT_ISSUED,
                    batch.batch_id.clone(),
                    Some(report_id),
                    payload,
                )?,
            )?;
            Ok(Some(report_id))
        });

        let report_id = match committed {
            Ok(Some(id)) => id,
            Ok(None) => {
                tracing::warn!(
                    batch_id = %batch.batch_id,
                    "batch changed during emission; report not committed"
                );
                return Ok(EmitOutcome::Conflict(ConcurrencyConflict::SnapshotChanged {
                    batch_id: batch.batch_id.clone(),
                }));
            }
            Err(StorageError::DuplicateKey { table, .. }) if table == REPORTS_BATCH_UNIQUE => {
                let existing = self
                    .store
                    .read(system, |txn| {
                        txn.issued_report_for_batch(&batch.batch_id)
                            .map(|r| r.report_id)
                    })
                    .ok_or_else(|| StorageError::NotFound {
                        table: "reports",
                        key: batch.batch_id.to_string(),
                    })?;
                tracing::warn!(
                    batch_id = %batch.batch_id,
                    report_id = existing.0,
                    "uniqueness constraint rejected a second report"
                );
                return Ok(EmitOutcome::Conflict(ConcurrencyConflict::AlreadyEmitted {
                    report_id: existing,
                }));
            }
            Err(StorageError::InvalidTransition {
                table: "batches",
                from,
                ..
            }) => {
                return Err(ValidationError::WrongBatchState {
                    batch_id: batch.batch_id.to_string(),
                    expected: BatchStatus::Completed.as_str(),
                    actual: from,
                }
                .into());
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            batch_id = %batch.batch_id,
            tenant_id = %batch.tenant_id,
            report_id = report_id.0,
            version = inputs.version.0,
            content_hash = hash.as_str(),
            renderer = self.renderer.renderer_id(),
            "report emitted"
        );
        Ok(EmitOutcome::Emitted(EmittedReport {
            report_id,
            batch_id: batch.batch_id.clone(),
            version: inputs.version,
            content_hash: hash,
            artifact_key: key,
            byte_len,
        }))
    }

    fn record_failure(
        &self,
        system: Option<&SecurityContext>,
        batch: &BatchRecord,
        err: &EmissionError,
        now: MonotonicTimeNs,
    ) {
        let (severity, reason_code) = if err.is_integrity_alert() {
            (AuditSeverity::Critical, reason_codes::EMIT_INTEGRITY_MISMATCH)
        } else {
            (AuditSeverity::Error, reason_codes::EMIT_FAILED)
        };
        let mut pairs = vec![
            ("failure", failure_kind(err).to_string()),
            ("retryable", err.is_retryable().to_string()),
        ];
        if let EmissionError::IntegrityMismatch {
            stored_hash,
            computed_hash,
        } = err
        {
            pairs.push(("stored_hash", stored_hash.clone()));
            pairs.push(("computed_hash", computed_hash.clone()));
        }

        let out = self.store.transaction(system, |txn| -> Result<_, StorageError> {
            let payload = AuditPayloadMin::from_pairs_v1(pairs)?;
            AuditLogWriter::emit(
                txn,
                AuditEventInput::v1(
                    now,
                    batch.tenant_id.clone(),
                    self.issuer.clone(),
                    Role::System,
                    AuditAction::EmitFailed,
                    severity,
                    reason_code,
                    batch.batch_id.clone(),
                    None,
                    payload,
                )?,
            )
        });
        tracing::warn!(batch_id = %batch.batch_id, error = %err, "emission failed; batch stays completed");
        if let Err(e) = out {
            tracing::warn!(batch_id = %batch.batch_id, error = %e, "emit_failed audit row not written");
        }
    }

    /// Controlled re-issuance: moves an emitted batch back to `active` and
    /// supersedes its report. The next emission writes version n+1.
    pub fn reset_batch(
        &self,
        ctx: Option<&SecurityContext>,
        batch_id: &BatchId,
        reason: &str,
        now: MonotonicTimeNs,
    ) -> Result<ResetOutcome, EmissionError> {
        let Some(_guard) = self.locks.acquire(batch_id, self.config.lock_wait_timeout()) else {
            return Err(EmissionError::LockTimeout {
                batch_id: batch_id.to_string(),
            });
        };

        let superseded = self.store.transaction(ctx, |txn| -> Result<_, EmissionError> {
            let Some(caller) = txn.scope().context().cloned() else {
                return Err(ValidationError::UnknownBatch {
                    batch_id: batch_id.to_string(),
                }
                .into());
            };
            let batch = txn
                .batch_row(batch_id)
                .cloned()
                .ok_or_else(|| ValidationError::UnknownBatch {
                    batch_id: batch_id.to_string(),
                })?;
            if batch.status != BatchStatus::Emitted {
                return Err(ValidationError::WrongBatchState {
                    batch_id: batch_id.to_string(),
                    expected: BatchStatus::Emitted.as_str(),
                    actual: batch.status.as_str(),
                }
                .into());
            }
            let superseded = txn.supersede_issued_report(batch_id, now)?;
            txn.update_batch_status(batch_id, BatchStatus::Active, now)?;

            let mut pairs = vec![("reason", reason.to_string())];
            if let Some(id) = superseded {
                pairs.push(("superseded_report_id", id.0.to_string()));
            }
            AuditLogWriter::emit(
                txn,
                AuditEventInput::v1(
                    now,
                    batch.tenant_id.clone(),
                    caller.actor_id.clone(),
                    caller.role,
                    AuditAction::BatchReset,
                    AuditSeverity::Warn,
                    reason_codes::EMIT_BATCH_RESET,
                    batch_id.clone(),
                    superseded,
                    AuditPayloadMin::from_pairs_v1(pairs)?,
                )?,
            )?;
            Ok(superseded)
        })?;

        tracing::info!(
            batch_id = %batch_id,
            superseded_report_id = superseded.map(|r| r.0),
            "batch reset for re-issuance"
        );
        Ok(ResetOutcome {
            batch_id: batch_id.clone(),
            superseded_report_id: superseded,
        })
    }
}

// Same completion stamp and same evaluation rows as the precheck read.
fn snapshot_unchanged(txn: &ScopedTxn<'_>, inputs: &EmissionInputs) -> bool {
    let batch_id = &inputs.batch.batch_id;
    let Some(current) = txn.batch_row(batch_id) else {
        return false;
    };
    current.status == BatchStatus::Completed
        && current.completed_at == inputs.batch.completed_at
        && txn
            .evaluation_rows_for_batch(batch_id)
            .into_iter()
            .eq(inputs.evaluations.iter())
}

fn failure_kind(err: &EmissionError) -> &'static str {
    match err {
        EmissionError::Validation(_) => "validation",
        EmissionError::StorageFailure(_) => "storage_failure",
        EmissionError::LockTimeout { .. } => "lock_timeout",
        EmissionError::IntegrityMismatch { .. } => "integrity_mismatch",
        EmissionError::Aggregate(_) => "aggregate",
        EmissionError::Render(_) => "render",
        EmissionError::Database(_) => "database",
        EmissionError::Contract(_) => "contract",
    }
}
