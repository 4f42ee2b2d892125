//! Connector lifecycle: install, uninstall, reset, configuration.

use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use paybridge_core::{Connector, ConnectorId, Schedule, ScheduleId, Task, TaskKind};

use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::plugin::{InstallRequest, UninstallRequest};
use crate::storage::{Page, Pagination};
use crate::workflow::WorkflowTrigger;

/// Result of `connectors_install`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectorInstallation {
    pub connector_id: ConnectorId,
    pub task: Task,
}

impl Engine {
    /// Install a new connector of `provider`.
    ///
    /// The configuration is validated by the provider's plugin factory before
    /// anything is stored. The connector accepts work as soon as this returns;
    /// the install task registers its schedules in the background.
    #[instrument(skip(self, config), err)]
    pub async fn connectors_install(
        &self,
        provider: &str,
        config: serde_json::Value,
        wait_result: bool,
    ) -> EngineResult<ConnectorInstallation> {
        let connector_id = ConnectorId::new(provider);
        let (capabilities, _) = self.registry().build(&connector_id, &config)?;

        let name = config
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or(provider)
            .to_string();
        let connector = Connector::new(connector_id.clone(), name, config, capabilities);

        self.storage().connectors_install(connector.clone()).await?;
        self.registry().load(connector).await?;
        info!(connector_id = %connector_id, "connector installed");

        let engine = self.clone();
        let id = connector_id.clone();
        let task = self
            .submit_task(
                TaskKind::InstallConnector,
                Some(connector_id.clone()),
                &[&connector_id.to_string()],
                wait_result,
                Box::pin(async move { engine.run_install(&id).await }),
            )
            .await?;

        Ok(ConnectorInstallation { connector_id, task })
    }

    /// Uninstall a connector.
    ///
    /// The connector stops accepting work immediately; the plugin teardown and
    /// the purge run in the task. Calling again while it runs returns the same task.
    #[instrument(skip_all, fields(connector_id = %connector_id), err)]
    pub async fn connectors_uninstall(&self, connector_id: &ConnectorId, wait_result: bool) -> EngineResult<Task> {
        if self.storage().connectors_get(connector_id).await?.is_none() {
            return Err(EngineError::ConnectorNotFound(connector_id.clone()));
        }

        self.storage().connectors_schedule_for_deletion(connector_id).await?;
        if let Err(err) = self.registry().mark_scheduled_for_deletion(connector_id).await {
            warn!(error = %err, "connector was not loaded");
        }

        let engine = self.clone();
        let id = connector_id.clone();
        self.submit_task(
            TaskKind::UninstallConnector,
            Some(connector_id.clone()),
            &[&connector_id.to_string()],
            wait_result,
            Box::pin(async move { engine.run_uninstall(&id).await }),
        )
        .await
    }

    /// Tear down and re-install a connector under the same id, with its stored
    /// configuration. Each call is a new task.
    #[instrument(skip_all, fields(connector_id = %connector_id), err)]
    pub async fn connectors_reset(&self, connector_id: &ConnectorId, wait_result: bool) -> EngineResult<Task> {
        self.registry().get(connector_id).await?;
        let nonce = Uuid::now_v7().simple().to_string();

        let engine = self.clone();
        let id = connector_id.clone();
        self.submit_task(
            TaskKind::ResetConnector,
            Some(connector_id.clone()),
            &[&connector_id.to_string(), &nonce],
            wait_result,
            Box::pin(async move { engine.run_reset(&id).await }),
        )
        .await
    }

    /// Replace a connector's configuration in place and reload its plugin.
    #[instrument(skip_all, fields(connector_id = %connector_id), err)]
    pub async fn connectors_config_update(
        &self,
        connector_id: &ConnectorId,
        config: serde_json::Value,
    ) -> EngineResult<Connector> {
        let mut connector = self.connectors_get(connector_id).await?;
        if connector.scheduled_for_deletion {
            return Err(EngineError::ConnectorNotFound(connector_id.clone()));
        }

        self.registry().build(connector_id, &config)?;
        if let Some(name) = config.get("name").and_then(|v| v.as_str()) {
            connector.name = name.to_string();
        }
        connector.config = config;

        self.storage().connectors_update(&connector).await?;
        self.registry().load(connector.clone()).await?;
        Ok(connector)
    }

    pub async fn connectors_get(&self, connector_id: &ConnectorId) -> EngineResult<Connector> {
        self.storage()
            .connectors_get(connector_id)
            .await?
            .ok_or_else(|| EngineError::ConnectorNotFound(connector_id.clone()))
    }

    pub async fn connectors_config(&self, connector_id: &ConnectorId) -> EngineResult<serde_json::Value> {
        Ok(self.connectors_get(connector_id).await?.config)
    }

    pub async fn connectors_list(&self, pagination: Pagination) -> EngineResult<Page<Connector>> {
        Ok(self.storage().connectors_list(pagination).await?)
    }

    async fn run_install(&self, connector_id: &ConnectorId) -> EngineResult<Option<String>> {
        let schedules = self.install_schedules(connector_id).await?;
        self.trigger(WorkflowTrigger::ConnectorInstalled {
            connector_id: connector_id.clone(),
            schedules,
        })
        .await?;
        Ok(Some(connector_id.to_string()))
    }

    async fn run_uninstall(&self, connector_id: &ConnectorId) -> EngineResult<Option<String>> {
        match self.registry().get_any(connector_id).await {
            Ok(loaded) => {
                loaded
                    .plugin
                    .uninstall(UninstallRequest {
                        connector_id: connector_id.clone(),
                    })
                    .await?
            }
            Err(_) => warn!(connector_id = %connector_id, "connector not loaded, skipping plugin uninstall"),
        }

        self.trigger(WorkflowTrigger::ConnectorUninstalled {
            connector_id: connector_id.clone(),
        })
        .await?;
        self.storage().schedules_delete_for_connector(connector_id).await?;
        self.storage().connectors_delete(connector_id).await?;
        self.registry().unload(connector_id).await;
        info!(connector_id = %connector_id, "connector uninstalled");
        Ok(Some(connector_id.to_string()))
    }

    async fn run_reset(&self, connector_id: &ConnectorId) -> EngineResult<Option<String>> {
        let loaded = self.registry().get_any(connector_id).await?;
        loaded
            .plugin
            .uninstall(UninstallRequest {
                connector_id: connector_id.clone(),
            })
            .await?;
        self.storage().schedules_delete_for_connector(connector_id).await?;

        let schedules = self.install_schedules(connector_id).await?;
        self.trigger(WorkflowTrigger::ConnectorReset {
            connector_id: connector_id.clone(),
            schedules,
        })
        .await?;
        Ok(Some(connector_id.to_string()))
    }

    /// Call the plugin's install and persist the schedules it asks for.
    async fn install_schedules(&self, connector_id: &ConnectorId) -> EngineResult<Vec<ScheduleId>> {
        let loaded = self.registry().get_any(connector_id).await?;
        let response = loaded
            .plugin
            .install(InstallRequest {
                connector_id: connector_id.clone(),
                webhook_base_url: self.config().webhook_base_url(connector_id),
            })
            .await?;

        let mut ids = Vec::with_capacity(response.schedules.len());
        for template in response.schedules {
            let schedule = Schedule::for_connector(connector_id.clone(), template.name, template.interval_secs);
            ids.push(schedule.id.clone());
            self.storage().schedules_upsert(schedule).await?;
        }
        Ok(ids)
    }
}
