#![forbid(unsafe_code)]

pub mod artifact;
pub mod audit;
pub mod lock;
pub mod repo;
pub mod scope;
pub mod store;
pub mod txn;

pub use scope::RowScope;
pub use store::{EvaluationTransition, StorageError, TallyStore};
pub use txn::{ScopedTxn, StoreHandle};
