//! Connector plugin port.
//!
//! The engine talks to a provider only through this uniform interface. A
//! plugin overrides the calls matching its declared capabilities; every other
//! call answers [`PluginError::NotImplemented`]. The dispatcher guarantees an
//! undeclared call is never made, so the default is a backstop.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use paybridge_core::{
    AttemptId, BankAccount, Connection, ConnectionAttempt, ConnectionId, ConnectorId,
    ForwardedUser, PaymentInitiation, PaymentInitiationReversal, PaymentServiceUser,
    ProviderPaymentStatus,
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PluginError {
    #[error("operation not implemented by plugin")]
    NotImplemented,
    /// The provider refused the request as malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The provider failed or could not be reached.
    #[error("provider error: {0}")]
    Provider(String),
}

pub type PluginResult<T> = Result<T, PluginError>;

/// Builds a plugin instance for one connector from its configuration.
/// Returning `InvalidRequest` rejects the configuration.
pub type PluginFactory =
    Arc<dyn Fn(&ConnectorId, &serde_json::Value) -> PluginResult<Arc<dyn Plugin>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub connector_id: ConnectorId,
    pub webhook_base_url: String,
}

/// Recurring job a plugin asks the workflow runtime to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleTemplate {
    pub name: String,
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Default)]
pub struct InstallResponse {
    pub schedules: Vec<ScheduleTemplate>,
}

#[derive(Debug, Clone)]
pub struct UninstallRequest {
    pub connector_id: ConnectorId,
}

#[derive(Debug, Clone)]
pub struct PaymentInitiationRequest {
    pub payment_initiation: PaymentInitiation,
    /// Zero for the first submission, incremented by each retry.
    pub attempt: u32,
}

/// A payment as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderPayment {
    pub reference: String,
    pub status: ProviderPaymentStatus,
    pub amount: u64,
    pub asset: String,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ReversalRequest {
    pub reversal: PaymentInitiationReversal,
    pub payment_initiation: PaymentInitiation,
}

#[derive(Debug, Clone)]
pub struct BankAccountRequest {
    pub bank_account: BankAccount,
}

#[derive(Debug, Clone)]
pub struct BankAccountResponse {
    pub account_reference: String,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct CreateUserRequest {
    pub psu: PaymentServiceUser,
}

#[derive(Debug, Clone, Default)]
pub struct CreateUserResponse {
    pub psp_user_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CreateUserLinkRequest {
    pub attempt_id: AttemptId,
    pub psu: PaymentServiceUser,
    pub forwarded_user: ForwardedUser,
    pub application_name: String,
    pub client_redirect_url: Option<String>,
    /// Our own redirect endpoint the provider must send the browser back to.
    pub redirect_url: String,
    /// Encoded [`paybridge_core::CallbackState`], echoed back as `state`.
    pub callback_state: String,
    pub webhook_base_url: String,
}

#[derive(Debug, Clone)]
pub struct UpdateUserLinkRequest {
    pub link: CreateUserLinkRequest,
    pub connection: Connection,
}

#[derive(Debug, Clone)]
pub struct UserLinkResponse {
    pub link: String,
    pub temporary_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Raw content of the provider's redirect/callback request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpCallInformation {
    pub query_values: BTreeMap<String, Vec<String>>,
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: Vec<u8>,
}

impl HttpCallInformation {
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_values
            .entry(key.into())
            .or_default()
            .push(value.into());
        self
    }

    /// First value of a query parameter.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query_values
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct CompleteUserLinkRequest {
    pub http_call: HttpCallInformation,
    pub attempt: ConnectionAttempt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConnection {
    pub connection_id: ConnectionId,
    pub created_at: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompleteUserLinkResponse {
    Success { connections: Vec<ProviderConnection> },
    Error { error: String },
}

#[derive(Debug, Clone)]
pub struct DeleteUserRequest {
    pub psu: PaymentServiceUser,
    pub forwarded_user: ForwardedUser,
}

#[derive(Debug, Clone)]
pub struct DeleteUserConnectionRequest {
    pub psu: PaymentServiceUser,
    pub forwarded_user: ForwardedUser,
    pub connection: Connection,
}

/// Uniform call interface of a connector plugin.
#[async_trait]
pub trait Plugin: Send + Sync {
    async fn install(&self, _req: InstallRequest) -> PluginResult<InstallResponse> {
        Ok(InstallResponse::default())
    }

    async fn uninstall(&self, _req: UninstallRequest) -> PluginResult<()> {
        Ok(())
    }

    async fn create_transfer(&self, _req: PaymentInitiationRequest) -> PluginResult<ProviderPayment> {
        Err(PluginError::NotImplemented)
    }

    async fn create_payout(&self, _req: PaymentInitiationRequest) -> PluginResult<ProviderPayment> {
        Err(PluginError::NotImplemented)
    }

    async fn reverse_transfer(&self, _req: ReversalRequest) -> PluginResult<ProviderPayment> {
        Err(PluginError::NotImplemented)
    }

    async fn reverse_payout(&self, _req: ReversalRequest) -> PluginResult<ProviderPayment> {
        Err(PluginError::NotImplemented)
    }

    async fn create_bank_account(&self, _req: BankAccountRequest) -> PluginResult<BankAccountResponse> {
        Err(PluginError::NotImplemented)
    }

    async fn create_user(&self, _req: CreateUserRequest) -> PluginResult<CreateUserResponse> {
        Err(PluginError::NotImplemented)
    }

    async fn create_user_link(&self, _req: CreateUserLinkRequest) -> PluginResult<UserLinkResponse> {
        Err(PluginError::NotImplemented)
    }

    async fn update_user_link(&self, _req: UpdateUserLinkRequest) -> PluginResult<UserLinkResponse> {
        Err(PluginError::NotImplemented)
    }

    async fn complete_user_link(
        &self,
        _req: CompleteUserLinkRequest,
    ) -> PluginResult<CompleteUserLinkResponse> {
        Err(PluginError::NotImplemented)
    }

    async fn complete_update_user_link(
        &self,
        _req: CompleteUserLinkRequest,
    ) -> PluginResult<CompleteUserLinkResponse> {
        Err(PluginError::NotImplemented)
    }

    async fn delete_user(&self, _req: DeleteUserRequest) -> PluginResult<()> {
        Err(PluginError::NotImplemented)
    }

    async fn delete_user_connection(&self, _req: DeleteUserConnectionRequest) -> PluginResult<()> {
        Err(PluginError::NotImplemented)
    }
}
