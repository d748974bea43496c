#![forbid(unsafe_code)]

use serde::Serialize;

use tally_kernel_contracts::batch::{BatchId, BatchStatus};
use tally_kernel_contracts::report::{ContentHash, ReportId, ReportRecord, ReportVersion};
use tally_kernel_contracts::security::SecurityContext;
use tally_kernel_contracts::MonotonicTimeNs;
use tally_storage::repo::{BatchTablesRepo, ReportTablesRepo};
use tally_storage::StoreHandle;

use crate::error::EmissionError;
use crate::verify::{IntegrityVerdict, IntegrityVerifier};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReportStatus {
    pub batch_id: BatchId,
    pub status: BatchStatus,
    pub report_id: Option<ReportId>,
    pub report_version: Option<ReportVersion>,
    pub content_hash: Option<ContentHash>,
    pub issued_at: Option<MonotonicTimeNs>,
}

/// Read-only surface over batches and reports.
///
/// Batches outside the caller's tenant, or any batch when no context is given,
/// read as absent rather than as an error.
#[derive(Clone)]
pub struct ReportReadApi {
    store: StoreHandle,
    verifier: IntegrityVerifier,
}

impl ReportReadApi {
    pub fn new(store: StoreHandle, verifier: IntegrityVerifier) -> Self {
        Self { store, verifier }
    }

    pub fn get_batch_report_status(
        &self,
        ctx: Option<&SecurityContext>,
        batch_id: &BatchId,
    ) -> Option<BatchReportStatus> {
        self.store.read(ctx, |txn| {
            let batch = txn.batch_row(batch_id)?;
            let report = txn.issued_report_for_batch(batch_id);
            Some(BatchReportStatus {
                batch_id: batch.batch_id.clone(),
                status: batch.status,
                report_id: report.map(|r| r.report_id),
                report_version: report.map(|r| r.version),
                content_hash: report.map(|r| r.content_hash.clone()),
                issued_at: report.map(|r| r.issued_at),
            })
        })
    }

    pub fn verify_report(
        &self,
        ctx: Option<&SecurityContext>,
        report_id: ReportId,
    ) -> Result<IntegrityVerdict, EmissionError> {
        self.verifier.verify(ctx, report_id)
    }

    /// Issue history for a batch, oldest first, including superseded reports.
    pub fn list_reports_for_batch(
        &self,
        ctx: Option<&SecurityContext>,
        batch_id: &BatchId,
    ) -> Vec<ReportRecord> {
        self.store.read(ctx, |txn| {
            txn.report_rows_for_batch(batch_id)
                .into_iter()
                .cloned()
                .collect()
        })
    }
}
