#![forbid(unsafe_code)]

use std::sync::Arc;

use parking_lot::Mutex;

use tally_kernel_contracts::security::SecurityContext;

use crate::scope::RowScope;
use crate::store::TallyStore;

/// Clones share one store, the way pooled connections share one database.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    inner: Arc<Mutex<TallyStore>>,
}

/// The scope is fixed when the transaction opens and dies with it.
#[derive(Debug)]
pub struct ScopedTxn<'a> {
    pub(crate) store: &'a mut TallyStore,
    pub(crate) scope: RowScope,
}

impl<'a> ScopedTxn<'a> {
    pub fn scope(&self) -> &RowScope {
        &self.scope
    }
}

impl StoreHandle {
    pub fn new_in_memory() -> Self {
        Self::from_store(TallyStore::new_in_memory())
    }

    pub fn from_store(store: TallyStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    /// Runs `f` atomically under `ctx`; an `Err` undoes every write it made.
    pub fn transaction<T, E, F>(&self, ctx: Option<&SecurityContext>, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut ScopedTxn<'_>) -> Result<T, E>,
    {
        let mut guard = self.inner.lock();
        guard.begin();
        let out = {
            let mut txn = ScopedTxn {
                store: &mut *guard,
                scope: RowScope::from_context(ctx),
            };
            f(&mut txn)
        };
        if out.is_err() {
            guard.rollback();
        } else {
            guard.commit();
        }
        out
    }

    pub fn read<T, F>(&self, ctx: Option<&SecurityContext>, f: F) -> T
    where
        F: FnOnce(&ScopedTxn<'_>) -> T,
    {
        let mut guard = self.inner.lock();
        let txn = ScopedTxn {
            store: &mut *guard,
            scope: RowScope::from_context(ctx),
        };
        f(&txn)
    }
}
