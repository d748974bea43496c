#![forbid(unsafe_code)]

use std::sync::Arc;

use serde::Serialize;

use tally_engines::digest::{hashes_match, sha256_hex};
use tally_kernel_contracts::report::ReportId;
use tally_kernel_contracts::security::SecurityContext;
use tally_storage::artifact::{ArtifactStore, ArtifactStoreError};
use tally_storage::repo::ReportTablesRepo;
use tally_storage::StoreHandle;

use crate::error::{EmissionError, ValidationError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityVerdict {
    pub report_id: ReportId,
    pub valid: bool,
    pub stored_hash: String,
    /// Empty when `artifact_missing`.
    pub computed_hash: String,
    pub artifact_missing: bool,
}

/// Read-only. A mismatch or a missing artifact is logged as a critical alert and
/// returned as `valid = false`; nothing is repaired.
#[derive(Clone)]
pub struct IntegrityVerifier {
    store: StoreHandle,
    artifacts: Arc<dyn ArtifactStore>,
}

impl IntegrityVerifier {
    pub fn new(store: StoreHandle, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self { store, artifacts }
    }

    pub fn verify(
        &self,
        ctx: Option<&SecurityContext>,
        report_id: ReportId,
    ) -> Result<IntegrityVerdict, EmissionError> {
        let report = self
            .store
            .read(ctx, |txn| txn.report_row(report_id).cloned())
            .ok_or(ValidationError::UnknownReport {
                report_id: report_id.0,
            })?;

        let stored_hash = report.content_hash.as_str().to_string();
        let bytes = match self.artifacts.get(&report.artifact_key) {
            Ok(bytes) => bytes,
            Err(ArtifactStoreError::NotFound { .. }) => {
                tracing::error!(
                    alert = "integrity_mismatch",
                    report_id = report_id.0,
                    batch_id = %report.batch_id,
                    artifact_key = %report.artifact_key,
                    stored_hash = stored_hash.as_str(),
                    "artifact of an issued report is missing"
                );
                return Ok(IntegrityVerdict {
                    report_id,
                    valid: false,
                    stored_hash,
                    computed_hash: String::new(),
                    artifact_missing: true,
                });
            }
            Err(e) => return Err(e.into()),
        };
        let computed_hash = sha256_hex(&bytes);
        let valid = hashes_match(&stored_hash, &computed_hash);
        if valid {
            tracing::debug!(report_id = report_id.0, "report integrity verified");
        } else {
            tracing::error!(
                alert = "integrity_mismatch",
                report_id = report_id.0,
                batch_id = %report.batch_id,
                artifact_key = %report.artifact_key,
                stored_hash = stored_hash.as_str(),
                computed_hash = computed_hash.as_str(),
                "stored artifact does not match its recorded hash"
            );
        }
        Ok(IntegrityVerdict {
            report_id,
            valid,
            stored_hash,
            computed_hash,
            artifact_missing: false,
        })
    }
}
