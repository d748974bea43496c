#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::batch::BatchId;
use crate::report::ReportId;
use crate::security::{ActorId, Role, TenantId};
use crate::{ContractViolation, MonotonicTimeNs, ReasonCodeId, SchemaVersion, Validate};

pub const AUDIT_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);
pub const MAX_AUDIT_PAYLOAD_ENTRIES: usize = 16;
pub const MAX_AUDIT_PAYLOAD_BYTES: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AuditEventId(pub u64);

impl Validate for AuditEventId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "audit_event_id",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    StatusRecomputed,
    AutoEmit,
    EmitFailed,
    BatchReset,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::StatusRecomputed => "status_recomputed",
            AuditAction::AutoEmit => "auto_emit",
            AuditAction::EmitFailed => "emit_failed",
            AuditAction::BatchReset => "batch_reset",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Info,
    Warn,
    Error,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PayloadKey(String);

fn is_ascii_lower_snake_key(s: &str) -> bool {
    let b = s.as_bytes();
    match b.first() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    b.iter()
        .skip(1)
        .all(|&c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == b'_')
}

impl PayloadKey {
    pub fn new(key: impl Into<String>) -> Result<Self, ContractViolation> {
        let k = Self(key.into());
        k.validate()?;
        Ok(k)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for PayloadKey {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0.len() > 64 {
            return Err(ContractViolation::InvalidValue {
                field: "payload_key",
                reason: "must be <= 64 chars",
            });
        }
        if !is_ascii_lower_snake_key(&self.0) {
            return Err(ContractViolation::InvalidValue {
                field: "payload_key",
                reason: "must be lower_snake_case (a-z0-9_)",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadValue(String);

impl PayloadValue {
    pub fn new(value: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(value.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for PayloadValue {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "payload_value",
                reason: "must not be empty",
            });
        }
        if self.0.len() > 256 {
            return Err(ContractViolation::InvalidValue {
                field: "payload_value",
                reason: "must be <= 256 chars",
            });
        }
        Ok(())
    }
}

/// Small bounded key/value detail attached to an audit row.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuditPayloadMin {
    pub entries: BTreeMap<PayloadKey, PayloadValue>,
}

impl AuditPayloadMin {
    pub fn empty_v1() -> Self {
        Self::default()
    }

    /// Builds from string pairs; rejects bad keys/values up front.
    pub fn from_pairs_v1<'a>(
        pairs: impl IntoIterator<Item = (&'a str, String)>,
    ) -> Result<Self, ContractViolation> {
        let mut entries = BTreeMap::new();
        for (k, v) in pairs {
            entries.insert(PayloadKey::new(k)?, PayloadValue::new(v)?);
        }
        let p = Self { entries };
        p.validate()?;
        Ok(p)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_str() == key)
            .map(|(_, v)| v.as_str())
    }
}

impl Validate for AuditPayloadMin {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.entries.len() > MAX_AUDIT_PAYLOAD_ENTRIES {
            return Err(ContractViolation::InvalidValue {
                field: "audit_payload_min.entries",
                reason: "must be <= 16 entries",
            });
        }
        let mut total_bytes: usize = 0;
        for (k, v) in &self.entries {
            k.validate()?;
            v.validate()?;
            total_bytes = total_bytes.saturating_add(k.as_str().len());
            total_bytes = total_bytes.saturating_add(v.as_str().len());
            if total_bytes > MAX_AUDIT_PAYLOAD_BYTES {
                return Err(ContractViolation::InvalidValue {
                    field: "audit_payload_min",
                    reason: "total payload size must be <= 2048 bytes",
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEventInput {
    pub schema_version: SchemaVersion,
    pub created_at: MonotonicTimeNs,
    pub tenant_id: TenantId,
    pub actor_id: ActorId,
    pub actor_role: Role,
    pub action: AuditAction,
    pub severity: AuditSeverity,
    pub reason_code: ReasonCodeId,
    pub batch_id: BatchId,
    pub report_id: Option<ReportId>,
    pub payload: AuditPayloadMin,
}

impl AuditEventInput {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        created_at: MonotonicTimeNs,
        tenant_id: TenantId,
        actor_id: ActorId,
        actor_role: Role,
        action: AuditAction,
        severity: AuditSeverity,
        reason_code: ReasonCodeId,
        batch_id: BatchId,
        report_id: Option<ReportId>,
        payload: AuditPayloadMin,
    ) -> Result<Self, ContractViolation> {
        let ev = Self {
            schema_version: AUDIT_CONTRACT_VERSION,
            created_at,
            tenant_id,
            actor_id,
            actor_role,
            action,
            severity,
            reason_code,
            batch_id,
            report_id,
            payload,
        };
        ev.validate()?;
        Ok(ev)
    }
}

impl Validate for AuditEventInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != AUDIT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "audit_event_input.schema_version",
                reason: "must match AUDIT_CONTRACT_VERSION",
            });
        }
        if self.created_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "audit_event_input.created_at",
                reason: "must be > 0",
            });
        }
        self.tenant_id.validate()?;
        self.actor_id.validate()?;
        self.batch_id.validate()?;
        if let Some(r) = self.report_id {
            r.validate()?;
        }
        if self.action == AuditAction::AutoEmit && self.report_id.is_none() {
            return Err(ContractViolation::InvalidValue {
                field: "audit_event_input.report_id",
                reason: "auto_emit must reference the issued report",
            });
        }
        self.payload.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub schema_version: SchemaVersion,
    pub event_id: AuditEventId,
    pub created_at: MonotonicTimeNs,
    pub tenant_id: TenantId,
    pub actor_id: ActorId,
    pub actor_role: Role,
    pub action: AuditAction,
    pub severity: AuditSeverity,
    pub reason_code: ReasonCodeId,
    pub batch_id: BatchId,
    pub report_id: Option<ReportId>,
    pub payload: AuditPayloadMin,
}

impl AuditEvent {
    pub fn from_input_v1(
        event_id: AuditEventId,
        input: AuditEventInput,
    ) -> Result<Self, ContractViolation> {
        event_id.validate()?;
        input.validate()?;
        Ok(Self {
            schema_version: AUDIT_CONTRACT_VERSION,
            event_id,
            created_at: input.created_at,
            tenant_id: input.tenant_id,
            actor_id: input.actor_id,
            actor_role: input.actor_role,
            action: input.action,
            severity: input.severity,
            reason_code: input.reason_code,
            batch_id: input.batch_id,
            report_id: input.report_id,
            payload: input.payload,
        })
    }
}
