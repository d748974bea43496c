#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use thiserror::Error;

use tally_kernel_contracts::evaluation::{DomainKey, EvaluationRecord, EvaluationStatus};

/// Decimal places kept on per-domain means.
pub const MEAN_SCALE: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregateError {
    #[error("score sum overflow in domain {domain}")]
    Overflow { domain: String },
    #[error("evaluation {evaluation_id} belongs to batch {found}, expected {expected}")]
    MixedBatch {
        evaluation_id: String,
        expected: String,
        found: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainAggregate {
    pub domain: DomainKey,
    pub count: u32,
    pub sum: Decimal,
    pub mean: Decimal,
    pub min: Decimal,
    pub max: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchAggregate {
    /// Completed evaluations that fed the aggregate.
    pub contributing_evaluations: u32,
    pub domains: BTreeMap<DomainKey, DomainAggregate>,
}

/// Per-domain aggregation over the completed evaluations of one batch.
/// Inactivated and pending evaluations are skipped.
pub fn aggregate_domain_scores(
    evaluations: &[EvaluationRecord],
) -> Result<BatchAggregate, AggregateError> {
    let mut out = BatchAggregate::default();
    let Some(first) = evaluations.first() else {
        return Ok(out);
    };

    for e in evaluations {
        if e.batch_id != first.batch_id {
            return Err(AggregateError::MixedBatch {
                evaluation_id: e.evaluation_id.to_string(),
                expected: first.batch_id.to_string(),
                found: e.batch_id.to_string(),
            });
        }
        if e.status != EvaluationStatus::Completed {
            continue;
        }
        out.contributing_evaluations = out.contributing_evaluations.saturating_add(1);
        for s in &e.domain_scores {
            let entry = out
                .domains
                .entry(s.domain.clone())
                .or_insert_with(|| DomainAggregate {
                    domain: s.domain.clone(),
                    count: 0,
                    sum: Decimal::ZERO,
                    mean: Decimal::ZERO,
                    min: s.score,
                    max: s.score,
                });
            entry.count = entry.count.saturating_add(1);
            entry.sum = entry
                .sum
                .checked_add(s.score)
                .ok_or_else(|| AggregateError::Overflow {
                    domain: s.domain.to_string(),
                })?;
            entry.min = entry.min.min(s.score);
            entry.max = entry.max.max(s.score);
        }
    }

    for agg in out.domains.values_mut() {
        agg.mean = agg
            .sum
            .checked_div(Decimal::from(agg.count))
            .map(|m| m.round_dp(MEAN_SCALE).normalize())
            .ok_or_else(|| AggregateError::Overflow {
                domain: agg.domain.to_string(),
            })?;
    }
    Ok(out)
}
