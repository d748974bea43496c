#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

use tally_kernel_contracts::batch::{BatchId, EvaluationCounts};
use tally_kernel_contracts::report::ReportVersion;
use tally_kernel_contracts::security::TenantId;
use tally_kernel_contracts::MonotonicTimeNs;

use crate::aggregate::BatchAggregate;

pub const CANONICAL_JSON_RENDERER_ID: &str = "tally.canonical_json.v1";

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("artifact serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("renderer produced an empty artifact")]
    Empty,
}

/// Batch facts rendered alongside the aggregate. Must not carry wall-clock
/// values taken at render time, or identical batches stop hashing equally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchMetadata {
    pub batch_id: BatchId,
    pub tenant_id: TenantId,
    pub created_at: MonotonicTimeNs,
    pub completed_at: Option<MonotonicTimeNs>,
    pub counts: EvaluationCounts,
    pub report_version: ReportVersion,
}

/// Deterministic `(aggregate, metadata) -> bytes`.
pub trait ArtifactRenderer: Send + Sync {
    fn renderer_id(&self) -> &str;

    fn render(
        &self,
        aggregate: &BatchAggregate,
        metadata: &BatchMetadata,
    ) -> Result<Vec<u8>, RenderError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CanonicalJsonRenderer;

#[derive(Serialize)]
struct RenderedDomain {
    count: u32,
    mean: String,
    min: String,
    max: String,
}

#[derive(Serialize)]
struct RenderedCounts {
    total: u32,
    completed: u32,
    inactivated: u32,
}

#[derive(Serialize)]
struct RenderedReport<'a> {
    renderer: &'a str,
    batch_id: &'a str,
    tenant_id: &'a str,
    report_version: u32,
    created_at_ns: u64,
    completed_at_ns: Option<u64>,
    counts: RenderedCounts,
    contributing_evaluations: u32,
    domains: BTreeMap<&'a str, RenderedDomain>,
}

impl ArtifactRenderer for CanonicalJsonRenderer {
    fn renderer_id(&self) -> &str {
        CANONICAL_JSON_RENDERER_ID
    }

    fn render(
        &self,
        aggregate: &BatchAggregate,
        metadata: &BatchMetadata,
    ) -> Result<Vec<u8>, RenderError> {
        let domains = aggregate
            .domains
            .iter()
            .map(|(k, d)| {
                (
                    k.as_str(),
                    RenderedDomain {
                        count: d.count,
                        mean: d.mean.to_string(),
                        min: d.min.normalize().to_string(),
                        max: d.max.normalize().to_string(),
                    },
                )
            })
            .collect();
        let doc = RenderedReport {
            renderer: CANONICAL_JSON_RENDERER_ID,
            batch_id: metadata.batch_id.as_str(),
            tenant_id: metadata.tenant_id.as_str(),
            report_version: metadata.report_version.0,
            created_at_ns: metadata.created_at.0,
            completed_at_ns: metadata.completed_at.map(|t| t.0),
            counts: RenderedCounts {
                total: metadata.counts.total,
                completed: metadata.counts.completed,
                inactivated: metadata.counts.inactivated,
            },
            contributing_evaluations: aggregate.contributing_evaluations,
            domains,
        };
        let bytes = serde_json::to_vec(&doc)?;
        if bytes.is_empty() {
            return Err(RenderError::Empty);
        }
        Ok(bytes)
    }
}
