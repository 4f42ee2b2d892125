//! `paybridge-engine`: connector dispatch and asynchronous task orchestration.
//!
//! The [`Engine`] owns the connector registry, gates every provider-bound
//! operation on the connector's declared capabilities, wraps provider calls in
//! idempotent tasks, and drives the payment-initiation and PSU link-flow state
//! machines against the storage and workflow-runtime ports.

pub mod backend;
pub mod config;
pub mod connectors;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod link_flow;
pub mod payment_initiations;
pub mod plugin;
pub mod psu;
pub mod registry;
pub mod schedules;
pub mod storage;
pub mod tasks;
pub mod workflow;

#[cfg(test)]
mod testing;


pub use backend::Backend;
pub use config::EngineConfig;
pub use connectors::ConnectorInstallation;
pub use dispatcher::{Dispatcher, Operation, check_capability};
pub use engine::Engine;
pub use error::{EngineError, EngineResult, ErrorKind};
pub use link_flow::LinkCreated;
pub use plugin::{Plugin, PluginError, PluginFactory, PluginResult};
pub use registry::{ConnectorRegistry, LoadedConnector};
pub use storage::{InMemoryStorage, Page, Pagination, Storage, StorageError};
pub use workflow::{NoopWorkflowRuntime, WorkflowError, WorkflowRuntime, WorkflowTrigger};
