#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::batch::BatchId;
use crate::common::validate_hex;
use crate::security::{ActorId, TenantId};
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const REPORT_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);
pub const SHA256_HEX_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReportId(pub u64);

impl Validate for ReportId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "report_id",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for ReportId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Issue number of a report within its batch; bumps on re-issuance after a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReportVersion(pub u32);

impl Validate for ReportVersion {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "report_version",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Issued,
    Superseded,
}

impl ReportStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportStatus::Issued => "issued",
            ReportStatus::Superseded => "superseded",
        }
    }
}

/// Hex-encoded SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn new(hex: impl Into<String>) -> Result<Self, ContractViolation> {
        let h = Self(hex.into());
        h.validate()?;
        Ok(h)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other)
    }
}

impl Validate for ContentHash {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_hex("content_hash", &self.0, SHA256_HEX_LEN)
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Object-storage key of a rendered artifact: `{prefix}/{tenant}/{batch}/v{n}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ArtifactKey(String);

impl ArtifactKey {
    pub fn versioned(
        prefix: &str,
        tenant_id: &TenantId,
        batch_id: &BatchId,
        version: ReportVersion,
    ) -> Result<Self, ContractViolation> {
        Self::new(format!(
            "{}/{}/{}/v{}",
            prefix.trim_matches('/'),
            tenant_id.as_str(),
            batch_id.as_str(),
            version.0
        ))
    }

    pub fn new(key: impl Into<String>) -> Result<Self, ContractViolation> {
        let k = Self(key.into());
        k.validate()?;
        Ok(k)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

impl Validate for ArtifactKey {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0.is_empty() || self.0.len() > 256 {
            return Err(ContractViolation::InvalidValue {
                field: "artifact_key",
                reason: "must be 1..=256 chars",
            });
        }
        let segment_ok = |s: &str| {
            !s.is_empty()
                && s != "."
                && s != ".."
                && s
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
        };
        if !self.0.split('/').all(segment_ok) {
            return Err(ContractViolation::InvalidValue {
                field: "artifact_key",
                reason: "segments must be non-empty [A-Za-z0-9_.-] and not relative",
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRowInput {
    pub schema_version: SchemaVersion,
    pub batch_id: BatchId,
    pub tenant_id: TenantId,
    pub version: ReportVersion,
    pub content_hash: ContentHash,
    pub artifact_key: ArtifactKey,
    pub byte_len: u64,
    pub supersedes: Option<ReportId>,
    pub issued_at: MonotonicTimeNs,
    pub issuer_id: ActorId,
}

impl ReportRowInput {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        batch_id: BatchId,
        tenant_id: TenantId,
        version: ReportVersion,
        content_hash: ContentHash,
        artifact_key: ArtifactKey,
        byte_len: u64,
        supersedes: Option<ReportId>,
        issued_at: MonotonicTimeNs,
        issuer_id: ActorId,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: REPORT_CONTRACT_VERSION,
            batch_id,
            tenant_id,
            version,
            content_hash,
            artifact_key,
            byte_len,
            supersedes,
            issued_at,
            issuer_id,
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for ReportRowInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != REPORT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "report_row_input.schema_version",
                reason: "must match REPORT_CONTRACT_VERSION",
            });
        }
        self.batch_id.validate()?;
        self.tenant_id.validate()?;
        self.version.validate()?;
        self.content_hash.validate()?;
        self.artifact_key.validate()?;
        self.issuer_id.validate()?;
        if let Some(prev) = self.supersedes {
            prev.validate()?;
        }
        if (self.version.0 > 1) != self.supersedes.is_some() {
            return Err(ContractViolation::InvalidValue {
                field: "report_row_input.supersedes",
                reason: "required exactly when version > 1",
            });
        }
        if self.byte_len == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "report_row_input.byte_len",
                reason: "must be > 0",
            });
        }
        if self.issued_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "report_row_input.issued_at",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRecord {
    pub schema_version: SchemaVersion,
    pub report_id: ReportId,
    pub batch_id: BatchId,
    pub tenant_id: TenantId,
    pub status: ReportStatus,
    pub version: ReportVersion,
    pub content_hash: ContentHash,
    pub artifact_key: ArtifactKey,
    pub byte_len: u64,
    pub supersedes: Option<ReportId>,
    pub issued_at: MonotonicTimeNs,
    pub issuer_id: ActorId,
    pub superseded_at: Option<MonotonicTimeNs>,
}

impl ReportRecord {
    pub fn from_input_v1(
        report_id: ReportId,
        input: ReportRowInput,
    ) -> Result<Self, ContractViolation> {
        input.validate()?;
        let r = Self {
            schema_version: REPORT_CONTRACT_VERSION,
            report_id,
            batch_id: input.batch_id,
            tenant_id: input.tenant_id,
            status: ReportStatus::Issued,
            version: input.version,
            content_hash: input.content_hash,
            artifact_key: input.artifact_key,
            byte_len: input.byte_len,
            supersedes: input.supersedes,
            issued_at: input.issued_at,
            issuer_id: input.issuer_id,
            superseded_at: None,
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for ReportRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.report_id.validate()?;
        if let Some(prev) = self.supersedes {
            if prev >= self.report_id {
                return Err(ContractViolation::InvalidValue {
                    field: "report_record.supersedes",
                    reason: "must reference an earlier report",
                });
            }
        }
        match (self.status, self.superseded_at) {
            (ReportStatus::Issued, None) => {}
            (ReportStatus::Superseded, Some(at)) if at >= self.issued_at => {}
            _ => {
                return Err(ContractViolation::InvalidValue {
                    field: "report_record.superseded_at",
                    reason: "set exactly when superseded, never before issued_at",
                })
            }
        }
        ReportRowInput {
            schema_version: self.schema_version,
            batch_id: self.batch_id.clone(),
            tenant_id: self.tenant_id.clone(),
            version: self.version,
            content_hash: self.content_hash.clone(),
            artifact_key: self.artifact_key.clone(),
            byte_len: self.byte_len,
            supersedes: self.supersedes,
            issued_at: self.issued_at,
            issuer_id: self.issuer_id.clone(),
        }
        .validate()
    }
}
