//! The engine facade.
//!
//! `Engine` wires storage, the connector registry, the dispatcher, the task
//! manager and the workflow runtime together. Its operations are split by
//! concern across `connectors`, `payment_initiations`, `link_flow`, `psu` and
//! `schedules`; this file holds construction and the shared plumbing.

use std::sync::Arc;

use tracing::{info, instrument};

use paybridge_core::{ConnectorId, Task, TaskId, TaskKind};
use paybridge_observability::Telemetry;

use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::error::EngineResult;
use crate::registry::ConnectorRegistry;
use crate::storage::{Page, Pagination, Storage};
use crate::tasks::{TaskJob, TaskManager};
use crate::workflow::{WorkflowRuntime, WorkflowTrigger};

pub(crate) struct Inner {
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) tasks: TaskManager,
    pub(crate) runtime: Arc<dyn WorkflowRuntime>,
    pub(crate) config: EngineConfig,
}

/// Connector dispatch and task orchestration engine.
///
/// Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<Inner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("stack", &self.inner.config.stack)
            .field("registry", self.inner.dispatcher.registry())
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: ConnectorRegistry,
        runtime: Arc<dyn WorkflowRuntime>,
        config: EngineConfig,
        telemetry: Telemetry,
    ) -> Self {
        let tasks = TaskManager::new(
            storage.clone(),
            telemetry,
            config.stack.clone(),
            config.wait_timeout,
        );
        Self {
            inner: Arc::new(Inner {
                storage,
                dispatcher: Dispatcher::new(Arc::new(registry)),
                tasks,
                runtime,
                config,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub(crate) fn storage(&self) -> &dyn Storage {
        self.inner.storage.as_ref()
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub(crate) fn registry(&self) -> &ConnectorRegistry {
        self.inner.dispatcher.registry()
    }

    pub(crate) fn tasks(&self) -> &TaskManager {
        &self.inner.tasks
    }

    /// Load every persisted connector into the registry. Call once at startup.
    #[instrument(skip_all, err)]
    pub async fn load_connectors(&self) -> EngineResult<usize> {
        let mut loaded = 0;
        let mut pagination = Pagination::new(Some(Pagination::MAX_LIMIT), None);
        loop {
            let page = self.storage().connectors_list(pagination).await?;
            for connector in page.items {
                self.registry().load(connector).await?;
                loaded += 1;
            }
            if !page.has_more {
                break;
            }
            pagination.offset += pagination.limit;
        }
        info!(loaded, "connectors loaded");
        Ok(loaded)
    }

    pub async fn tasks_get(&self, id: &TaskId) -> EngineResult<Task> {
        self.tasks().get(id).await
    }

    pub async fn tasks_list(
        &self,
        connector_id: Option<&ConnectorId>,
        pagination: Pagination,
    ) -> EngineResult<Page<Task>> {
        Ok(self.storage().tasks_list(connector_id, pagination).await?)
    }

    /// Create-or-return the task for `kind` on `parts` and schedule `job` with it.
    pub(crate) async fn submit_task(
        &self,
        kind: TaskKind,
        connector_id: Option<ConnectorId>,
        parts: &[&str],
        wait_result: bool,
        job: TaskJob,
    ) -> EngineResult<Task> {
        let id = self.tasks().task_id(kind, connector_id, parts);
        self.tasks().submit(id, kind, wait_result, job).await
    }

    pub(crate) async fn trigger(&self, trigger: WorkflowTrigger) -> EngineResult<()> {
        self.inner.runtime.trigger(trigger).await?;
        Ok(())
    }
}
