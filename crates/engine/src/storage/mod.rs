//! Persistence boundary.
//!
//! Durable storage is an external collaborator; the engine needs strict
//! consistency only on the per-entity mutation paths (task completion,
//! adjustment appends, attempt creation and completion). Those are expressed
//! as single atomic store operations (insert-if-absent, insert-if-predicate,
//! compare-and-set) so a backend can implement each as one transactional
//! statement.

pub mod in_memory;
pub mod query;
pub mod r#trait;

use thiserror::Error;

pub use in_memory::InMemoryStorage;
pub use query::{Page, Pagination};
pub use r#trait::{
    AdjustmentPredicate, AttemptClaim, AttemptTransition, ConnectionAttemptStore,
    ConnectorStore, HistoryGuard, PaymentInitiationStore, PsuStore, ReversalStore,
    ScheduleStore, Storage, TaskCompletion, TaskStore,
};

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("duplicate key value: {0}")]
    DuplicateKeyValue(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}
