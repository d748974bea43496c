#![forbid(unsafe_code)]

use thiserror::Error;

use tally_engines::aggregate::AggregateError;
use tally_engines::render::RenderError;
use tally_kernel_contracts::ContractViolation;
use tally_storage::artifact::ArtifactStoreError;
use tally_storage::StorageError;

/// Caller-side problems. Retrying without an underlying state change gives the same answer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown batch {batch_id}")]
    UnknownBatch { batch_id: String },
    #[error("unknown evaluation {evaluation_id}")]
    UnknownEvaluation { evaluation_id: String },
    #[error("unknown report {report_id}")]
    UnknownReport { report_id: u64 },
    #[error("batch {batch_id} is {actual}; expected {expected}")]
    WrongBatchState {
        batch_id: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("batch {batch_id} has {total} evaluations; limit is {max}")]
    BatchTooLarge { batch_id: String, total: u32, max: u32 },
}

#[derive(Debug, Error)]
pub enum EmissionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("artifact storage failed: {0}")]
    StorageFailure(#[from] ArtifactStoreError),
    #[error("batch {batch_id} is locked by another emission or reset")]
    LockTimeout { batch_id: String },
    #[error("integrity mismatch: stored {stored_hash}, computed {computed_hash}")]
    IntegrityMismatch {
        stored_hash: String,
        computed_hash: String,
    },
    #[error("aggregation failed: {0}")]
    Aggregate(#[from] AggregateError),
    #[error("render failed: {0}")]
    Render(#[from] RenderError),
    #[error("database error: {0}")]
    Database(#[from] StorageError),
    #[error(transparent)]
    Contract(#[from] ContractViolation),
}

impl EmissionError {
    /// Artifact-store failures and lock timeouts are retryable; batch status is
    /// untouched by them.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EmissionError::StorageFailure(_) | EmissionError::LockTimeout { .. }
        )
    }

    pub fn is_integrity_alert(&self) -> bool {
        matches!(self, EmissionError::IntegrityMismatch { .. })
    }
}
