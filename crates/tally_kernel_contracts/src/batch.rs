#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::string_id;
use crate::security::TenantId;
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const BATCH_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

string_id!(BatchId, "batch_id", 64);

/// Derived aggregate status. External callers never set it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Active,
    Completed,
    Cancelled,
    Emitted,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Active => "active",
            BatchStatus::Completed => "completed",
            BatchStatus::Cancelled => "cancelled",
            BatchStatus::Emitted => "emitted",
        }
    }
}

/// Allowed edges: `active -> {completed, cancelled}`, `completed -> emitted`,
/// and reset edges `{completed, cancelled, emitted} -> active`.
pub fn is_allowed_batch_transition(from: BatchStatus, to: BatchStatus) -> bool {
    if from == to {
        return true;
    }
    matches!(
        (from, to),
        (BatchStatus::Active, BatchStatus::Completed)
            | (BatchStatus::Active, BatchStatus::Cancelled)
            | (BatchStatus::Completed, BatchStatus::Emitted)
            | (BatchStatus::Completed, BatchStatus::Active)
            | (BatchStatus::Cancelled, BatchStatus::Active)
            | (BatchStatus::Emitted, BatchStatus::Active)
    )
}

/// Fresh per-status evaluation counts for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EvaluationCounts {
    pub total: u32,
    pub started: u32,
    pub in_progress: u32,
    pub completed: u32,
    pub inactivated: u32,
}

impl EvaluationCounts {
    pub fn resolved(&self) -> u32 {
        self.completed.saturating_add(self.inactivated)
    }

    pub fn pending(&self) -> u32 {
        self.started.saturating_add(self.in_progress)
    }
}

impl Validate for EvaluationCounts {
    fn validate(&self) -> Result<(), ContractViolation> {
        let sum = self
            .started
            .checked_add(self.in_progress)
            .and_then(|v| v.checked_add(self.completed))
            .and_then(|v| v.checked_add(self.inactivated));
        if sum != Some(self.total) {
            return Err(ContractViolation::InvalidValue {
                field: "evaluation_counts.total",
                reason: "must equal the sum of per-status counts",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub schema_version: SchemaVersion,
    pub batch_id: BatchId,
    pub tenant_id: TenantId,
    pub status: BatchStatus,
    pub created_at: MonotonicTimeNs,
    pub completed_at: Option<MonotonicTimeNs>,
    pub emitted_at: Option<MonotonicTimeNs>,
}

impl BatchRecord {
    /// A freshly released batch.
    pub fn released_v1(
        batch_id: BatchId,
        tenant_id: TenantId,
        created_at: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let b = Self {
            schema_version: BATCH_CONTRACT_VERSION,
            batch_id,
            tenant_id,
            status: BatchStatus::Active,
            created_at,
            completed_at: None,
            emitted_at: None,
        };
        b.validate()?;
        Ok(b)
    }
}

impl Validate for BatchRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != BATCH_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "batch_record.schema_version",
                reason: "must match BATCH_CONTRACT_VERSION",
            });
        }
        self.batch_id.validate()?;
        self.tenant_id.validate()?;
        if self.created_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "batch_record.created_at",
                reason: "must be > 0",
            });
        }
        if let Some(c) = self.completed_at {
            if c < self.created_at {
                return Err(ContractViolation::InvalidValue {
                    field: "batch_record.completed_at",
                    reason: "must be >= created_at",
                });
            }
        }
        match self.status {
            BatchStatus::Active | BatchStatus::Cancelled => {
                if self.emitted_at.is_some() {
                    return Err(ContractViolation::InvalidValue {
                        field: "batch_record.emitted_at",
                        reason: "must be empty unless status is emitted",
                    });
                }
            }
            BatchStatus::Completed => {
                if self.completed_at.is_none() {
                    return Err(ContractViolation::InvalidValue {
                        field: "batch_record.completed_at",
                        reason: "required when status is completed",
                    });
                }
                if self.emitted_at.is_some() {
                    return Err(ContractViolation::InvalidValue {
                        field: "batch_record.emitted_at",
                        reason: "must be empty unless status is emitted",
                    });
                }
            }
            BatchStatus::Emitted => {
                let (Some(completed_at), Some(emitted_at)) = (self.completed_at, self.emitted_at)
                else {
                    return Err(ContractViolation::InvalidValue {
                        field: "batch_record.emitted_at",
                        reason: "emitted batch requires completed_at and emitted_at",
                    });
                };
                if emitted_at < completed_at {
                    return Err(ContractViolation::InvalidValue {
                        field: "batch_record.emitted_at",
                        reason: "must be >= completed_at",
                    });
                }
            }
        }
        Ok(())
    }
}
