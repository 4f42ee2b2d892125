//! Connector registry.
//!
//! Two layers: provider registrations (capability set + plugin factory, fixed
//! at startup) and installed connector instances (one plugin per connector,
//! loaded on install and dropped on uninstall).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use paybridge_core::{CapabilitySet, Connector, ConnectorId};

use crate::error::{EngineError, EngineResult};
use crate::plugin::{Plugin, PluginError, PluginFactory};

struct ProviderRegistration {
    capabilities: CapabilitySet,
    factory: PluginFactory,
}

/// An installed connector together with its plugin instance.
#[derive(Clone)]
pub struct LoadedConnector {
    pub connector: Connector,
    pub plugin: Arc<dyn Plugin>,
}

impl fmt::Debug for LoadedConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedConnector")
            .field("connector", &self.connector)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct ConnectorRegistry {
    providers: HashMap<String, ProviderRegistration>,
    installed: RwLock<HashMap<ConnectorId, LoadedConnector>>,
}

impl fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut providers: Vec<&String> = self.providers.keys().collect();
        providers.sort();
        f.debug_struct("ConnectorRegistry")
            .field("providers", &providers)
            .finish_non_exhaustive()
    }
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider implementation. Re-registering replaces the previous one.
    pub fn register_provider(
        &mut self,
        provider: impl Into<String>,
        capabilities: CapabilitySet,
        factory: PluginFactory,
    ) {
        self.providers.insert(
            provider.into(),
            ProviderRegistration {
                capabilities,
                factory,
            },
        );
    }

    pub fn with_provider(
        mut self,
        provider: impl Into<String>,
        capabilities: CapabilitySet,
        factory: PluginFactory,
    ) -> Self {
        self.register_provider(provider, capabilities, factory);
        self
    }

    /// Declared capabilities of a registered provider.
    pub fn capabilities(&self, provider: &str) -> Option<CapabilitySet> {
        self.providers.get(provider).map(|p| p.capabilities)
    }

    /// Build a plugin instance for `connector_id` from `config`.
    ///
    /// The factory is the provider's config validator: a rejected config
    /// surfaces as a validation error.
    pub fn build(
        &self,
        connector_id: &ConnectorId,
        config: &serde_json::Value,
    ) -> EngineResult<(CapabilitySet, Arc<dyn Plugin>)> {
        let registration = self.providers.get(&connector_id.provider).ok_or_else(|| {
            EngineError::validation(format!("unknown provider: {}", connector_id.provider))
        })?;

        let plugin = (registration.factory)(connector_id, config).map_err(|e| match e {
            PluginError::InvalidRequest(msg) => {
                EngineError::validation(format!("invalid connector config: {msg}"))
            }
            other => EngineError::Plugin(other),
        })?;

        Ok((registration.capabilities, plugin))
    }

    /// Load (or reload) an installed connector.
    pub async fn load(&self, connector: Connector) -> EngineResult<()> {
        let (_, plugin) = self.build(&connector.id, &connector.config)?;
        let id = connector.id.clone();
        self.installed
            .write()
            .await
            .insert(id.clone(), LoadedConnector { connector, plugin });
        info!(connector_id = %id, "connector loaded");
        Ok(())
    }

    /// Resolve a connector that accepts new work.
    ///
    /// Connectors scheduled for deletion resolve as not found.
    pub async fn get(&self, id: &ConnectorId) -> EngineResult<LoadedConnector> {
        match self.installed.read().await.get(id) {
            Some(loaded) if !loaded.connector.scheduled_for_deletion => Ok(loaded.clone()),
            _ => Err(EngineError::ConnectorNotFound(id.clone())),
        }
    }

    /// Resolve a connector including one being uninstalled.
    pub async fn get_any(&self, id: &ConnectorId) -> EngineResult<LoadedConnector> {
        self.installed
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::ConnectorNotFound(id.clone()))
    }

    pub async fn mark_scheduled_for_deletion(&self, id: &ConnectorId) -> EngineResult<()> {
        let mut installed = self.installed.write().await;
        let loaded = installed
            .get_mut(id)
            .ok_or_else(|| EngineError::ConnectorNotFound(id.clone()))?;
        loaded.connector.scheduled_for_deletion = true;
        debug!(connector_id = %id, "connector scheduled for deletion");
        Ok(())
    }

    pub async fn unload(&self, id: &ConnectorId) {
        if self.installed.write().await.remove(id).is_some() {
            info!(connector_id = %id, "connector unloaded");
        }
    }

    pub async fn is_loaded(&self, id: &ConnectorId) -> bool {
        self.installed.read().await.contains_key(id)
    }
}
