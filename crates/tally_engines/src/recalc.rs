#![forbid(unsafe_code)]

use tally_kernel_contracts::batch::{is_allowed_batch_transition, BatchStatus, EvaluationCounts};
use tally_kernel_contracts::ReasonCodeId;

pub mod reason_codes {
    use tally_kernel_contracts::ReasonCodeId;

    // Batch status reason-code namespace.
    pub const BATCH_UNCHANGED: ReasonCodeId = ReasonCodeId(0xBA00_0001);
    pub const BATCH_ALL_RESOLVED: ReasonCodeId = ReasonCodeId(0xBA00_0002);
    pub const BATCH_ALL_INACTIVATED: ReasonCodeId = ReasonCodeId(0xBA00_0003);
    pub const BATCH_PENDING: ReasonCodeId = ReasonCodeId(0xBA00_0004);
    pub const BATCH_EMITTED_FROZEN: ReasonCodeId = ReasonCodeId(0xBA00_0005);
}

/// Status implied by fresh counts alone.
pub fn status_from_counts(counts: &EvaluationCounts) -> BatchStatus {
    if counts.total > 0 && counts.inactivated == counts.total && counts.completed == 0 {
        BatchStatus::Cancelled
    } else if counts.completed > 0 && counts.resolved() == counts.total {
        BatchStatus::Completed
    } else {
        BatchStatus::Active
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusDecision {
    pub previous: BatchStatus,
    pub target: BatchStatus,
    /// Edges to apply in order. Empty when nothing changes; `[Active, target]`
    /// when a resolved batch flips to the other resolved state.
    pub path: Vec<BatchStatus>,
    pub reason_code: ReasonCodeId,
}

impl StatusDecision {
    pub fn changed(&self) -> bool {
        !self.path.is_empty()
    }

    pub fn triggers_emission(&self) -> bool {
        self.target == BatchStatus::Completed
    }
}

/// Decides the next batch status from the current one and fresh counts.
///
/// Emitted batches are frozen: the decision is always a no-op for them.
pub fn decide_batch_status(current: BatchStatus, counts: &EvaluationCounts) -> StatusDecision {
    if current == BatchStatus::Emitted {
        return StatusDecision {
            previous: current,
            target: current,
            path: Vec::new(),
            reason_code: reason_codes::BATCH_EMITTED_FROZEN,
        };
    }

    let target = status_from_counts(counts);
    let path = if target == current {
        Vec::new()
    } else if is_allowed_batch_transition(current, target) {
        vec![target]
    } else {
        vec![BatchStatus::Active, target]
    };
    let reason_code = if path.is_empty() {
        reason_codes::BATCH_UNCHANGED
    } else {
        match target {
            BatchStatus::Completed => reason_codes::BATCH_ALL_RESOLVED,
            BatchStatus::Cancelled => reason_codes::BATCH_ALL_INACTIVATED,
            _ => reason_codes::BATCH_PENDING,
        }
    };

    StatusDecision {
        previous: current,
        target,
        path,
        reason_code,
    }
}
