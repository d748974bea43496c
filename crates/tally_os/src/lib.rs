#![forbid(unsafe_code)]

pub mod config;
pub mod emission;
pub mod error;
pub mod read_api;
pub mod recompute;
pub mod telemetry;
pub mod verify;

pub use config::EmissionConfig;
pub use emission::{ConcurrencyConflict, EmitOutcome, EmittedReport, ReportEmissionRuntime};
pub use error::{EmissionError, ValidationError};
pub use read_api::{BatchReportStatus, ReportReadApi};
pub use recompute::{BatchRecomputeRuntime, RecomputeOutcome};
pub use verify::{IntegrityVerdict, IntegrityVerifier};
