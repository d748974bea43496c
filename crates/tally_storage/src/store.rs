#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use tally_kernel_contracts::audit::{AuditEvent, AuditEventId, AuditEventInput};
use tally_kernel_contracts::batch::{
    is_allowed_batch_transition, BatchId, BatchRecord, BatchStatus, EvaluationCounts,
};
use tally_kernel_contracts::evaluation::{
    is_allowed_evaluation_transition, DomainScore, EvaluationId, EvaluationRecord,
    EvaluationStatus,
};
use tally_kernel_contracts::report::{
    ReportId, ReportRecord, ReportRowInput, ReportStatus, ReportVersion,
};
use tally_kernel_contracts::{ContractViolation, MonotonicTimeNs, Validate};

use crate::scope::RowScope;

pub const REPORTS_BATCH_UNIQUE: &str = "reports.batch_id";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StorageError {
    #[error("foreign key violation on {table}: {key}")]
    ForeignKeyViolation { table: &'static str, key: String },
    #[error("duplicate key on {table}: {key}")]
    DuplicateKey { table: &'static str, key: String },
    #[error("{table} is append-only")]
    AppendOnlyViolation { table: &'static str },
    #[error("{table} row not found: {key}")]
    NotFound { table: &'static str, key: String },
    #[error("transition {from} -> {to} not allowed on {table}")]
    InvalidTransition {
        table: &'static str,
        from: &'static str,
        to: &'static str,
    },
    #[error("batch {batch_id} is emitted; its evaluations are frozen")]
    ImmutableBatch { batch_id: String },
    #[error("write to {table} refused outside the caller's tenant scope")]
    ScopeDenied { table: &'static str },
    #[error(transparent)]
    ContractViolation(#[from] ContractViolation),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvaluationTransition {
    Resume {
        evaluation_id: EvaluationId,
        at: MonotonicTimeNs,
    },
    Complete {
        evaluation_id: EvaluationId,
        at: MonotonicTimeNs,
        domain_scores: Vec<DomainScore>,
    },
    Inactivate {
        evaluation_id: EvaluationId,
        at: MonotonicTimeNs,
        reason: String,
    },
    Reset {
        evaluation_id: EvaluationId,
        at: MonotonicTimeNs,
    },
}

impl EvaluationTransition {
    pub fn evaluation_id(&self) -> &EvaluationId {
        match self {
            EvaluationTransition::Resume { evaluation_id, .. }
            | EvaluationTransition::Complete { evaluation_id, .. }
            | EvaluationTransition::Inactivate { evaluation_id, .. }
            | EvaluationTransition::Reset { evaluation_id, .. } => evaluation_id,
        }
    }

    fn target(&self) -> EvaluationStatus {
        match self {
            EvaluationTransition::Resume { .. } | EvaluationTransition::Reset { .. } => {
                EvaluationStatus::InProgress
            }
            EvaluationTransition::Complete { .. } => EvaluationStatus::Completed,
            EvaluationTransition::Inactivate { .. } => EvaluationStatus::Inactivated,
        }
    }
}

// Inverse of one table write, replayed newest-first on rollback.
#[derive(Debug, Clone)]
enum Undo {
    Batch {
        batch_id: BatchId,
        prev: Option<BatchRecord>,
    },
    BatchIndex {
        batch_id: BatchId,
    },
    Evaluation {
        evaluation_id: EvaluationId,
        prev: Option<EvaluationRecord>,
    },
    EvaluationIndex {
        batch_id: BatchId,
        evaluation_id: EvaluationId,
    },
    Report {
        report_id: ReportId,
        prev: Option<ReportRecord>,
    },
    IssuedIndex {
        batch_id: BatchId,
        prev: Option<ReportId>,
    },
    ReportHistoryPush {
        batch_id: BatchId,
    },
    AuditAppend,
}

#[derive(Debug, Clone)]
struct Journal {
    undo: Vec<Undo>,
    next_report_id: u64,
    next_audit_event_id: u64,
}

/// Rows owned by another tenant are invisible and unwritable through every accessor.
#[derive(Debug, Clone)]
pub struct TallyStore {
    batches: BTreeMap<BatchId, BatchRecord>,

    evaluations: BTreeMap<EvaluationId, EvaluationRecord>,
    evaluations_by_batch: BTreeMap<BatchId, BTreeSet<EvaluationId>>,

    reports: BTreeMap<ReportId, ReportRecord>,
    // Uniqueness constraint: at most one issued report per batch.
    issued_report_by_batch: BTreeMap<BatchId, ReportId>,
    // Full issue history per batch, oldest first.
    reports_by_batch: BTreeMap<BatchId, Vec<ReportId>>,
    next_report_id: u64,

    audit_log: Vec<AuditEvent>,
    next_audit_event_id: u64,

    journal: Option<Journal>,
}

impl Default for TallyStore {
    fn default() -> Self {
        Self::new_in_memory()
    }
}

impl TallyStore {
    pub fn new_in_memory() -> Self {
        Self {
            batches: BTreeMap::new(),
            evaluations: BTreeMap::new(),
            evaluations_by_batch: BTreeMap::new(),
            reports: BTreeMap::new(),
            issued_report_by_batch: BTreeMap::new(),
            reports_by_batch: BTreeMap::new(),
            next_report_id: 1,
            audit_log: Vec::new(),
            next_audit_event_id: 1,
            journal: None,
        }
    }

    // ------------------------
    // transaction journal
    // ------------------------

    pub(crate) fn begin(&mut self) {
        self.journal = Some(Journal {
            undo: Vec::new(),
            next_report_id: self.next_report_id,
            next_audit_event_id: self.next_audit_event_id,
        });
    }

    pub(crate) fn commit(&mut self) {
        self.journal = None;
    }

    pub(crate) fn rollback(&mut self) {
        let Some(journal) = self.journal.take() else {
            return;
        };
        for undo in journal.undo.into_iter().rev() {
            match undo {
                Undo::Batch { batch_id, prev } => match prev {
                    Some(row) => {
                        self.batches.insert(batch_id, row);
                    }
                    None => {
                        self.batches.remove(&batch_id);
                    }
                },
                Undo::BatchIndex { batch_id } => {
                    self.evaluations_by_batch.remove(&batch_id);
                }
                Undo::Evaluation {
                    evaluation_id,
                    prev,
                } => match prev {
                    Some(row) => {
                        self.evaluations.insert(evaluation_id, row);
                    }
                    None => {
                        self.evaluations.remove(&evaluation_id);
                    }
                },
                Undo::EvaluationIndex {
                    batch_id,
                    evaluation_id,
                } => {
                    if let Some(ids) = self.evaluations_by_batch.get_mut(&batch_id) {
                        ids.remove(&evaluation_id);
                    }
                }
                Undo::Report { report_id, prev } => match prev {
                    Some(row) => {
                        self.reports.insert(report_id, row);
                    }
                    None => {
                        self.reports.remove(&report_id);
                    }
                },
                Undo::IssuedIndex { batch_id, prev } => match prev {
                    Some(id) => {
                        self.issued_report_by_batch.insert(batch_id, id);
                    }
                    None => {
                        self.issued_report_by_batch.remove(&batch_id);
                    }
                },
                Undo::ReportHistoryPush { batch_id } => {
                    let emptied = match self.reports_by_batch.get_mut(&batch_id) {
                        Some(history) => {
                            history.pop();
                            history.is_empty()
                        }
                        None => false,
                    };
                    if emptied {
                        self.reports_by_batch.remove(&batch_id);
                    }
                }
                Undo::AuditAppend => {
                    self.audit_log.pop();
                }
            }
        }
        self.next_report_id = journal.next_report_id;
        self.next_audit_event_id = journal.next_audit_event_id;
    }

    fn record(&mut self, undo: Undo) {
        if let Some(journal) = self.journal.as_mut() {
            journal.undo.push(undo);
        }
    }

    fn put_batch(&mut self, row: BatchRecord) {
        let batch_id = row.batch_id.clone();
        let prev = self.batches.insert(batch_id.clone(), row);
        self.record(Undo::Batch { batch_id, prev });
    }

    fn put_evaluation(&mut self, row: EvaluationRecord) {
        let evaluation_id = row.evaluation_id.clone();
        let prev = self.evaluations.insert(evaluation_id.clone(), row);
        self.record(Undo::Evaluation {
            evaluation_id,
            prev,
        });
    }

    fn put_report(&mut self, row: ReportRecord) {
        let report_id = row.report_id;
        let prev = self.reports.insert(report_id, row);
        self.record(Undo::Report { report_id, prev });
    }

    // ------------------------
    // batches
    // ------------------------

    pub fn insert_batch_row(
        &mut self,
        scope: &RowScope,
        record: BatchRecord,
    ) -> Result<(), StorageError> {
        record.validate()?;
        scope.require_write("batches", &record.tenant_id)?;
        if record.status != BatchStatus::Active {
            return Err(StorageError::InvalidTransition {
                table: "batches",
                from: "none",
                to: record.status.as_str(),
            });
        }
        if self.batches.contains_key(&record.batch_id) {
            return Err(StorageError::DuplicateKey {
                table: "batches.batch_id",
                key: record.batch_id.to_string(),
            });
        }
        if !self.evaluations_by_batch.contains_key(&record.batch_id) {
            self.evaluations_by_batch
                .insert(record.batch_id.clone(), BTreeSet::new());
            self.record(Undo::BatchIndex {
                batch_id: record.batch_id.clone(),
            });
        }
        self.put_batch(record);
        Ok(())
    }

    pub fn batch_row(&self, scope: &RowScope, batch_id: &BatchId) -> Option<&BatchRecord> {
        self.batches
            .get(batch_id)
            .filter(|b| scope.permits(&b.tenant_id))
    }

    pub fn batch_rows(&self, scope: &RowScope) -> Vec<&BatchRecord> {
        self.batches
            .values()
            .filter(|b| scope.permits(&b.tenant_id))
            .collect()
    }

    fn visible_batch(&self, scope: &RowScope, batch_id: &BatchId) -> Result<&BatchRecord, StorageError> {
        self.batch_row(scope, batch_id)
            .ok_or_else(|| StorageError::NotFound {
                table: "batches",
                key: batch_id.to_string(),
            })
    }

    pub fn update_batch_status(
        &mut self,
        scope: &RowScope,
        batch_id: &BatchId,
        to: BatchStatus,
        at: MonotonicTimeNs,
    ) -> Result<BatchRecord, StorageError> {
        let current = self.visible_batch(scope, batch_id)?.clone();
        scope.require_write("batches", &current.tenant_id)?;
        if !is_allowed_batch_transition(current.status, to) {
            return Err(StorageError::InvalidTransition {
                table: "batches",
                from: current.status.as_str(),
                to: to.as_str(),
            });
        }
        if current.status == to {
            return Ok(current);
        }

        let mut next = current;
        next.status = to;
        match to {
            BatchStatus::Active | BatchStatus::Cancelled => {
                next.completed_at = None;
                next.emitted_at = None;
            }
            BatchStatus::Completed => {
                next.completed_at = Some(at);
                next.emitted_at = None;
            }
            BatchStatus::Emitted => {
                next.emitted_at = Some(at);
            }
        }
        next.validate()?;
        self.put_batch(next.clone());
        Ok(next)
    }

    // ------------------------
    // evaluations
    // ------------------------

    pub fn insert_evaluation_row(
        &mut self,
        scope: &RowScope,
        record: EvaluationRecord,
    ) -> Result<(), StorageError> {
        record.validate()?;
        scope.require_write("evaluations", &record.tenant_id)?;
        let batch = self
            .batch_row(scope, &record.batch_id)
            .ok_or_else(|| StorageError::ForeignKeyViolation {
                table: "evaluations.batch_id",
                key: record.batch_id.to_string(),
            })?;
        if batch.tenant_id != record.tenant_id {
            return Err(StorageError::ForeignKeyViolation {
                table: "evaluations.tenant_id",
                key: record.tenant_id.to_string(),
            });
        }
        if batch.status == BatchStatus::Emitted {
            return Err(StorageError::ImmutableBatch {
                batch_id: batch.batch_id.to_string(),
            });
        }
        if self.evaluations.contains_key(&record.evaluation_id) {
            return Err(StorageError::DuplicateKey {
                table: "evaluations.evaluation_id",
                key: record.evaluation_id.to_string(),
            });
        }
        let indexed = self
            .evaluations_by_batch
            .entry(record.batch_id.clone())
            .or_default()
            .insert(record.evaluation_id.clone());
        if indexed {
            self.record(Undo::EvaluationIndex {
                batch_id: record.batch_id.clone(),
                evaluation_id: record.evaluation_id.clone(),
            });
        }
        self.put_evaluation(record);
        Ok(())
    }

    pub fn evaluation_row(
        &self,
        scope: &RowScope,
        evaluation_id: &EvaluationId,
    ) -> Option<&EvaluationRecord> {
        self.evaluations
            .get(evaluation_id)
            .filter(|e| scope.permits(&e.tenant_id))
    }

    pub fn evaluation_rows_for_batch(
        &self,
        scope: &RowScope,
        batch_id: &BatchId,
    ) -> Vec<&EvaluationRecord> {
        let Some(ids) = self.evaluations_by_batch.get(batch_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.evaluations.get(id))
            .filter(|e| scope.permits(&e.tenant_id))
            .collect()
    }

    // Fresh counts from current rows, never deltas.
    pub fn evaluation_counts(
        &self,
        scope: &RowScope,
        batch_id: &BatchId,
    ) -> Result<EvaluationCounts, StorageError> {
        self.visible_batch(scope, batch_id)?;
        let mut c = EvaluationCounts::default();
        for e in self.evaluation_rows_for_batch(scope, batch_id) {
            c.total = c.total.saturating_add(1);
            let slot = match e.status {
                EvaluationStatus::Started => &mut c.started,
                EvaluationStatus::InProgress => &mut c.in_progress,
                EvaluationStatus::Completed => &mut c.completed,
                EvaluationStatus::Inactivated => &mut c.inactivated,
            };
            *slot = slot.saturating_add(1);
        }
        Ok(c)
    }

    pub fn apply_evaluation_transition(
        &mut self,
        scope: &RowScope,
        transition: EvaluationTransition,
    ) -> Result<EvaluationRecord, StorageError> {
        let current = self
            .evaluation_row(scope, transition.evaluation_id())
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                table: "evaluations",
                key: transition.evaluation_id().to_string(),
            })?;
        scope.require_write("evaluations", &current.tenant_id)?;
        let batch = self.visible_batch(scope, &current.batch_id)?;
        if batch.status == BatchStatus::Emitted {
            return Err(StorageError::ImmutableBatch {
                batch_id: batch.batch_id.to_string(),
            });
        }
        let to = transition.target();
        if !is_allowed_evaluation_transition(current.status, to) {
            return Err(StorageError::InvalidTransition {
                table: "evaluations",
                from: current.status.as_str(),
                to: to.as_str(),
            });
        }

        let mut next = current;
        next.status = to;
        match transition {
            EvaluationTransition::Resume { .. } => {}
            EvaluationTransition::Complete {
                at, domain_scores, ..
            } => {
                next.completed_at = Some(at);
                next.domain_scores = domain_scores;
            }
            EvaluationTransition::Inactivate { at, reason, .. } => {
                next.completed_at = None;
                next.inactivated_at = Some(at);
                next.inactivation_reason = Some(reason);
            }
            EvaluationTransition::Reset { .. } => {
                next.completed_at = None;
                next.inactivated_at = None;
                next.inactivation_reason = None;
                next.domain_scores.clear();
            }
        }
        next.validate()?;
        self.put_evaluation(next.clone());
        Ok(next)
    }

    // ------------------------
    // reports
    // ------------------------

    pub fn next_report_version(
        &self,
        scope: &RowScope,
        batch_id: &BatchId,
    ) -> Result<(ReportVersion, Option<ReportId>), StorageError> {
        self.visible_batch(scope, batch_id)?;
        let history = self.reports_by_batch.get(batch_id);
        let issued = history.map(|h| h.len()).unwrap_or(0);
        let version = u32::try_from(issued)
            .ok()
            .and_then(|n| n.checked_add(1))
            .ok_or(StorageError::ContractViolation(ContractViolation::InvalidValue {
                field: "reports.version",
                reason: "version space exhausted",
            }))?;
        Ok((ReportVersion(version), history.and_then(|h| h.last().copied())))
    }

    pub fn insert_report_row(
        &mut self,
        scope: &RowScope,
        input: ReportRowInput,
    ) -> Result<ReportId, StorageError> {
        input.validate()?;
        scope.require_write("reports", &input.tenant_id)?;
        let batch = self
            .batch_row(scope, &input.batch_id)
            .ok_or_else(|| StorageError::ForeignKeyViolation {
                table: "reports.batch_id",
                key: input.batch_id.to_string(),
            })?;
        if batch.tenant_id != input.tenant_id {
            return Err(StorageError::ForeignKeyViolation {
                table: "reports.tenant_id",
                key: input.tenant_id.to_string(),
            });
        }
        if let Some(existing) = self.issued_report_by_batch.get(&input.batch_id) {
            return Err(StorageError::DuplicateKey {
                table: REPORTS_BATCH_UNIQUE,
                key: existing.0.to_string(),
            });
        }
        let (expected_version, expected_prev) = self.next_report_version(scope, &input.batch_id)?;
        if input.version != expected_version || input.supersedes != expected_prev {
            return Err(StorageError::ContractViolation(ContractViolation::InvalidValue {
                field: "reports.version",
                reason: "must follow the batch's issue history",
            }));
        }

        let report_id = ReportId(self.next_report_id);
        self.next_report_id = self.next_report_id.saturating_add(1);
        let row = ReportRecord::from_input_v1(report_id, input)?;
        let batch_id = row.batch_id.clone();
        let prev = self
            .issued_report_by_batch
            .insert(batch_id.clone(), report_id);
        self.record(Undo::IssuedIndex {
            batch_id: batch_id.clone(),
            prev,
        });
        self.reports_by_batch
            .entry(batch_id.clone())
            .or_default()
            .push(report_id);
        self.record(Undo::ReportHistoryPush { batch_id });
        self.put_report(row);
        Ok(report_id)
    }

    pub fn report_row(&self, scope: &RowScope, report_id: ReportId) -> Option<&ReportRecord> {
        self.reports
            .get(&report_id)
            .filter(|r| scope.permits(&r.tenant_id))
    }

    pub fn issued_report_for_batch(
        &self,
        scope: &RowScope,
        batch_id: &BatchId,
    ) -> Option<&ReportRecord> {
        let id = self.issued_report_by_batch.get(batch_id)?;
        self.report_row(scope, *id)
    }

    pub fn report_rows_for_batch(&self, scope: &RowScope, batch_id: &BatchId) -> Vec<&ReportRecord> {
        self.reports_by_batch
            .get(batch_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.report_row(scope, *id))
                    .collect()
            })
            .unwrap_or_default()
    }

    // Frees the uniqueness slot; the row stays as history.
    pub fn supersede_issued_report(
        &mut self,
        scope: &RowScope,
        batch_id: &BatchId,
        at: MonotonicTimeNs,
    ) -> Result<Option<ReportId>, StorageError> {
        let Some(report) = self.issued_report_for_batch(scope, batch_id).cloned() else {
            return Ok(None);
        };
        scope.require_write("reports", &report.tenant_id)?;
        let mut next = report;
        next.status = ReportStatus::Superseded;
        next.superseded_at = Some(at);
        next.validate()?;
        let prev = self.issued_report_by_batch.remove(batch_id);
        self.record(Undo::IssuedIndex {
            batch_id: batch_id.clone(),
            prev,
        });
        let id = next.report_id;
        self.put_report(next);
        Ok(Some(id))
    }

    pub fn attempt_overwrite_report_row(&mut self, _report_id: ReportId) -> Result<(), StorageError> {
        Err(StorageError::AppendOnlyViolation { table: "reports" })
    }

    // ------------------------
    // audit_log
    // ------------------------

    pub fn append_audit_event(
        &mut self,
        scope: &RowScope,
        input: AuditEventInput,
    ) -> Result<AuditEventId, StorageError> {
        input.validate()?;
        scope.require_write("audit_log", &input.tenant_id)?;
        let event_id = AuditEventId(self.next_audit_event_id);
        self.next_audit_event_id = self.next_audit_event_id.saturating_add(1);
        let ev = AuditEvent::from_input_v1(event_id, input)?;
        self.audit_log.push(ev);
        self.record(Undo::AuditAppend);
        Ok(event_id)
    }

    pub fn audit_events(&self, scope: &RowScope) -> Vec<&AuditEvent> {
        self.audit_log
            .iter()
            .filter(|e| scope.permits(&e.tenant_id))
            .collect()
    }

    pub fn audit_events_for_batch(&self, scope: &RowScope, batch_id: &BatchId) -> Vec<&AuditEvent> {
        self.audit_log
            .iter()
            .filter(|e| scope.permits(&e.tenant_id) && &e.batch_id == batch_id)
            .collect()
    }

    pub fn attempt_overwrite_audit_event(
        &mut self,
        _event_id: AuditEventId,
    ) -> Result<(), StorageError> {
        Err(StorageError::AppendOnlyViolation { table: "audit_log" })
    }
}
