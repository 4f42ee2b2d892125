//! Capability dispatcher.
//!
//! Every provider-bound operation passes through here before anything else
//! happens:
//!
//! ```text
//! (connector id, operation)
//!   ↓
//! 1. Resolve the connector (installed, not scheduled for deletion)
//!   ↓
//! 2. Check the operation's required capability against the declared set
//!   ↓
//! 3. Hand the resolved connector to the caller's closure
//! ```
//!
//! Steps 1 and 2 have no side effects, so a rejected operation never leaves a
//! task, an adjustment or an attempt behind. The check is read-only against
//! the registry and takes no lock beyond the registry's own read guard.

use std::future::Future;
use std::sync::Arc;

use paybridge_core::{Capability, Connector, ConnectorId, PaymentInitiationType};

use crate::error::{EngineError, EngineResult};
use crate::registry::{ConnectorRegistry, LoadedConnector};

/// Provider-bound operation, tagged with the capability it requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateTransfer,
    CreatePayout,
    ReverseTransfer,
    ReversePayout,
    CreateBankAccount,
    CreateUser,
    CreateUserLink,
    UpdateUserLink,
    CompleteUserLink,
    DeleteUser,
    DeleteUserConnection,
}

impl Operation {
    pub fn required_capability(self) -> Capability {
        match self {
            Operation::CreateTransfer => Capability::CreateTransfer,
            Operation::CreatePayout => Capability::CreatePayout,
            Operation::ReverseTransfer => Capability::ReverseTransfer,
            Operation::ReversePayout => Capability::ReversePayout,
            Operation::CreateBankAccount => Capability::CreateBankAccount,
            Operation::CreateUser => Capability::CreateUser,
            Operation::CreateUserLink => Capability::CreateUserLink,
            Operation::UpdateUserLink => Capability::UpdateUserLink,
            Operation::CompleteUserLink => Capability::CompleteUserLink,
            Operation::DeleteUser => Capability::DeleteUser,
            Operation::DeleteUserConnection => Capability::DeleteUserConnection,
        }
    }

    pub fn create_payment(kind: PaymentInitiationType) -> Self {
        match kind {
            PaymentInitiationType::Transfer => Operation::CreateTransfer,
            PaymentInitiationType::Payout => Operation::CreatePayout,
        }
    }

    pub fn reverse_payment(kind: PaymentInitiationType) -> Self {
        match kind {
            PaymentInitiationType::Transfer => Operation::ReverseTransfer,
            PaymentInitiationType::Payout => Operation::ReversePayout,
        }
    }
}

/// Fail with `CapabilityNotSupported` unless `connector` declares what
/// `operation` needs.
pub fn check_capability(connector: &Connector, operation: Operation) -> EngineResult<()> {
    let capability = operation.required_capability();
    if connector.supports(capability) {
        Ok(())
    } else {
        Err(EngineError::CapabilityNotSupported {
            capability,
            provider: connector.provider().to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<ConnectorRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ConnectorRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ConnectorRegistry> {
        &self.registry
    }

    /// Resolve and capability-check a connector without invoking anything.
    pub async fn resolve(
        &self,
        connector_id: &ConnectorId,
        operation: Operation,
    ) -> EngineResult<LoadedConnector> {
        let loaded = self.registry.get(connector_id).await?;
        check_capability(&loaded.connector, operation)?;
        Ok(loaded)
    }

    /// Resolve, check, then run `op` with the resolved connector.
    pub async fn dispatch<F, Fut, T>(
        &self,
        connector_id: &ConnectorId,
        operation: Operation,
        op: F,
    ) -> EngineResult<T>
    where
        F: FnOnce(LoadedConnector) -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let loaded = self.resolve(connector_id, operation).await?;
        op(loaded).await
    }
}
