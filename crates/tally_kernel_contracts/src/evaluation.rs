#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::batch::BatchId;
use crate::common::{string_id, validate_opt_text};
use crate::security::TenantId;
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const EVALUATION_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);
pub const MAX_DOMAIN_SCORES: usize = 64;

string_id!(EvaluationId, "evaluation_id", 64);
string_id!(SubjectId, "subject_id", 96);
string_id!(
    /// Scoring domain, e.g. `psychosocial_demand`.
    DomainKey,
    "domain_key",
    64
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    Started,
    InProgress,
    Completed,
    Inactivated,
}

impl EvaluationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EvaluationStatus::Started => "started",
            EvaluationStatus::InProgress => "in_progress",
            EvaluationStatus::Completed => "completed",
            EvaluationStatus::Inactivated => "inactivated",
        }
    }
}

/// Moves made by the submission/inactivation services. A reset sends a
/// resolved evaluation back to `in_progress`.
pub fn is_allowed_evaluation_transition(from: EvaluationStatus, to: EvaluationStatus) -> bool {
    use EvaluationStatus::*;
    matches!(
        (from, to),
        (Started, InProgress)
            | (Started, Completed)
            | (InProgress, Completed)
            | (Started, Inactivated)
            | (InProgress, Inactivated)
            | (Completed, Inactivated)
            | (Completed, InProgress)
            | (Inactivated, InProgress)
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainScore {
    pub domain: DomainKey,
    /// 0..=100, exact decimal.
    pub score: Decimal,
}

impl DomainScore {
    pub fn v1(domain: DomainKey, score: Decimal) -> Result<Self, ContractViolation> {
        let s = Self { domain, score };
        s.validate()?;
        Ok(s)
    }
}

impl Validate for DomainScore {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.domain.validate()?;
        if self.score < Decimal::ZERO || self.score > Decimal::ONE_HUNDRED {
            return Err(ContractViolation::InvalidValue {
                field: "domain_score.score",
                reason: "must be within 0..=100",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationRecord {
    pub schema_version: SchemaVersion,
    pub evaluation_id: EvaluationId,
    pub batch_id: BatchId,
    pub tenant_id: TenantId,
    pub subject_id: SubjectId,
    pub status: EvaluationStatus,
    pub started_at: MonotonicTimeNs,
    pub completed_at: Option<MonotonicTimeNs>,
    pub inactivated_at: Option<MonotonicTimeNs>,
    pub inactivation_reason: Option<String>,
    pub domain_scores: Vec<DomainScore>,
}

impl EvaluationRecord {
    pub fn started_v1(
        evaluation_id: EvaluationId,
        batch_id: BatchId,
        tenant_id: TenantId,
        subject_id: SubjectId,
        started_at: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let e = Self {
            schema_version: EVALUATION_CONTRACT_VERSION,
            evaluation_id,
            batch_id,
            tenant_id,
            subject_id,
            status: EvaluationStatus::Started,
            started_at,
            completed_at: None,
            inactivated_at: None,
            inactivation_reason: None,
            domain_scores: Vec::new(),
        };
        e.validate()?;
        Ok(e)
    }
}

impl Validate for EvaluationRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != EVALUATION_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "evaluation_record.schema_version",
                reason: "must match EVALUATION_CONTRACT_VERSION",
            });
        }
        self.evaluation_id.validate()?;
        self.batch_id.validate()?;
        self.tenant_id.validate()?;
        self.subject_id.validate()?;
        if self.started_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "evaluation_record.started_at",
                reason: "must be > 0",
            });
        }
        validate_opt_text(
            "evaluation_record.inactivation_reason",
            &self.inactivation_reason,
            512,
        )?;
        match self.status {
            EvaluationStatus::Inactivated => {
                if self.inactivated_at.is_none() {
                    return Err(ContractViolation::InvalidValue {
                        field: "evaluation_record.inactivated_at",
                        reason: "required when status is inactivated",
                    });
                }
                if self.inactivation_reason.is_none() {
                    return Err(ContractViolation::InvalidValue {
                        field: "evaluation_record.inactivation_reason",
                        reason: "required when status is inactivated",
                    });
                }
            }
            other => {
                if self.inactivated_at.is_some() || self.inactivation_reason.is_some() {
                    return Err(ContractViolation::InvalidValue {
                        field: "evaluation_record.inactivation_reason",
                        reason: "only allowed when status is inactivated",
                    });
                }
                if other == EvaluationStatus::Completed && self.completed_at.is_none() {
                    return Err(ContractViolation::InvalidValue {
                        field: "evaluation_record.completed_at",
                        reason: "required when status is completed",
                    });
                }
            }
        }
        if let Some(c) = self.completed_at {
            if c < self.started_at {
                return Err(ContractViolation::InvalidValue {
                    field: "evaluation_record.completed_at",
                    reason: "must be >= started_at",
                });
            }
        }
        if self.domain_scores.len() > MAX_DOMAIN_SCORES {
            return Err(ContractViolation::InvalidValue {
                field: "evaluation_record.domain_scores",
                reason: "too many domain scores",
            });
        }
        let mut seen = BTreeSet::new();
        for s in &self.domain_scores {
            s.validate()?;
            if !seen.insert(&s.domain) {
                return Err(ContractViolation::InvalidValue {
                    field: "evaluation_record.domain_scores",
                    reason: "domains must be unique",
                });
            }
        }
        Ok(())
    }
}
