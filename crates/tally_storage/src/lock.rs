#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use tally_kernel_contracts::batch::BatchId;

#[derive(Debug, Default)]
struct LockState {
    held: Mutex<BTreeSet<BatchId>>,
    released: Condvar,
}

/// Exclusive per-batch locks for the emission path.
///
/// Holders of different batches never wait on each other. Clones share one table.
#[derive(Debug, Clone, Default)]
pub struct BatchLockTable {
    state: Arc<LockState>,
}

/// Held lock on one batch; dropping it releases the batch and wakes waiters.
#[derive(Debug)]
pub struct BatchLockGuard {
    state: Arc<LockState>,
    batch_id: BatchId,
}

impl BatchLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits up to `timeout` for the batch lock. `None` on timeout.
    pub fn acquire(&self, batch_id: &BatchId, timeout: Duration) -> Option<BatchLockGuard> {
        let deadline = Instant::now() + timeout;
        let mut held = self.state.held.lock();
        while held.contains(batch_id) {
            if self
                .state
                .released
                .wait_until(&mut held, deadline)
                .timed_out()
            {
                if held.contains(batch_id) {
                    return None;
                }
                break;
            }
        }
        held.insert(batch_id.clone());
        Some(BatchLockGuard {
            state: Arc::clone(&self.state),
            batch_id: batch_id.clone(),
        })
    }

    pub fn try_acquire(&self, batch_id: &BatchId) -> Option<BatchLockGuard> {
        let mut held = self.state.held.lock();
        if !held.insert(batch_id.clone()) {
            return None;
        }
        Some(BatchLockGuard {
            state: Arc::clone(&self.state),
            batch_id: batch_id.clone(),
        })
    }

    pub fn is_held(&self, batch_id: &BatchId) -> bool {
        self.state.held.lock().contains(batch_id)
    }
}

impl BatchLockGuard {
    pub fn batch_id(&self) -> &BatchId {
        &self.batch_id
    }
}

impl Drop for BatchLockGuard {
    fn drop(&mut self) {
        self.state.held.lock().remove(&self.batch_id);
        self.state.released.notify_all();
    }
}
