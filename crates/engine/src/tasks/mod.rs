//! Task lifecycle.
//!
//! Every provider-bound operation is wrapped in a [`paybridge_core::Task`]:
//! created pending under a deterministic id, executed in the background, and
//! completed exactly once. Callers either wait (bounded) or poll.

pub mod manager;

pub use manager::{TaskJob, TaskManager};
