#![forbid(unsafe_code)]

pub mod audit;
pub mod batch;
pub mod common;
pub mod evaluation;
pub mod report;
pub mod security;

pub use common::{ContractViolation, MonotonicTimeNs, ReasonCodeId, SchemaVersion, Validate};
