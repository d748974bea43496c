#![forbid(unsafe_code)]

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use tally_kernel_contracts::report::ArtifactKey;
use tally_kernel_contracts::security::ActorId;
use tally_kernel_contracts::{ContractViolation, Validate};

pub const DEFAULT_ISSUER_ID: &str = "system.auto_emit";
pub const DEFAULT_ARTIFACT_KEY_PREFIX: &str = "reports";
pub const MAX_LOCK_WAIT_TIMEOUT_MS: u64 = 60_000;
// Leaves room for `/{tenant}/{batch}/v{n}` inside the 256-char key limit.
pub const MAX_ARTIFACT_KEY_PREFIX_LEN: usize = 96;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("emission config is not valid json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Invalid(#[from] ContractViolation),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmissionConfig {
    pub lock_wait_timeout_ms: u64,
    pub verify_after_write: bool,
    pub issuer_id: String,
    pub artifact_key_prefix: String,
    pub max_evaluations_per_batch: u32,
}

impl EmissionConfig {
    pub fn mvp_v1() -> Self {
        Self {
            lock_wait_timeout_ms: 5_000,
            verify_after_write: true,
            issuer_id: DEFAULT_ISSUER_ID.to_string(),
            artifact_key_prefix: DEFAULT_ARTIFACT_KEY_PREFIX.to_string(),
            max_evaluations_per_batch: 10_000,
        }
    }

    /// Parses a partial JSON object over the defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }

    /// The system actor recorded as issuer on reports and on system audit rows.
    pub fn issuer(&self) -> Result<ActorId, ContractViolation> {
        ActorId::new(self.issuer_id.as_str())
    }
}

impl Default for EmissionConfig {
    fn default() -> Self {
        Self::mvp_v1()
    }
}

impl Validate for EmissionConfig {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.lock_wait_timeout_ms == 0 || self.lock_wait_timeout_ms > MAX_LOCK_WAIT_TIMEOUT_MS {
            return Err(ContractViolation::InvalidValue {
                field: "emission_config.lock_wait_timeout_ms",
                reason: "must be within 1..=60000",
            });
        }
        self.issuer()?;
        if self.artifact_key_prefix.len() > MAX_ARTIFACT_KEY_PREFIX_LEN {
            return Err(ContractViolation::InvalidValue {
                field: "emission_config.artifact_key_prefix",
                reason: "must be <= 96 chars",
            });
        }
        if ArtifactKey::new(self.artifact_key_prefix.trim_matches('/')).is_err() {
            return Err(ContractViolation::InvalidValue {
                field: "emission_config.artifact_key_prefix",
                reason: "must be a valid artifact key path",
            });
        }
        if self.max_evaluations_per_batch == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "emission_config.max_evaluations_per_batch",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}
