//! Engine configuration.

use std::time::Duration;

use anyhow::Context;

use paybridge_core::ConnectorId;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Stack name, part of every deterministic task reference.
    pub stack: String,
    /// Public base URL of this deployment (no trailing slash).
    pub stack_public_url: String,
    /// Bound on `wait_result = true` calls.
    pub wait_timeout: Duration,
    /// Lifetime of a connection attempt when the provider does not set one.
    pub link_attempt_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stack: "local".to_string(),
            stack_public_url: "http://localhost:8080".to_string(),
            wait_timeout: Duration::from_secs(10),
            link_attempt_ttl: Duration::from_secs(3600),
        }
    }
}

impl EngineConfig {
    /// Load from `PAYBRIDGE_*` environment variables, falling back to defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let stack = std::env::var("PAYBRIDGE_STACK").unwrap_or(defaults.stack);
        let stack_public_url = std::env::var("PAYBRIDGE_STACK_PUBLIC_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or(defaults.stack_public_url);

        let wait_timeout = match std::env::var("PAYBRIDGE_WAIT_TIMEOUT_MS") {
            Ok(raw) => Duration::from_millis(
                raw.parse()
                    .with_context(|| format!("PAYBRIDGE_WAIT_TIMEOUT_MS is not a number: {raw}"))?,
            ),
            Err(_) => defaults.wait_timeout,
        };

        let link_attempt_ttl = match std::env::var("PAYBRIDGE_LINK_ATTEMPT_TTL_SECS") {
            Ok(raw) => Duration::from_secs(raw.parse().with_context(|| {
                format!("PAYBRIDGE_LINK_ATTEMPT_TTL_SECS is not a number: {raw}")
            })?),
            Err(_) => defaults.link_attempt_ttl,
        };

        anyhow::ensure!(!stack.trim().is_empty(), "PAYBRIDGE_STACK must not be empty");

        Ok(Self {
            stack,
            stack_public_url,
            wait_timeout,
            link_attempt_ttl,
        })
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = stack.into();
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Where providers send the user's browser once consent finishes.
    pub fn link_redirect_url(&self, connector_id: &ConnectorId) -> String {
        format!(
            "{}/connectors/bank-bridges/{}/redirect",
            self.stack_public_url, connector_id
        )
    }

    pub fn webhook_base_url(&self, connector_id: &ConnectorId) -> String {
        format!("{}/connectors/webhooks/{}", self.stack_public_url, connector_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_built_from_public_url() {
        let config = EngineConfig::default();
        let connector = ConnectorId::new("bank-bridge");
        let url = config.link_redirect_url(&connector);
        assert!(url.starts_with("http://localhost:8080/connectors/bank-bridges/"));
        assert!(url.ends_with("/redirect"));
        assert!(config.webhook_base_url(&connector).contains(&connector.to_string()));
    }
}
