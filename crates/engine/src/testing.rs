//! Test doubles: a scriptable connector plugin and a recording workflow runtime.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use paybridge_core::{CapabilitySet, ConnectionId, ConnectorId, ProviderPaymentStatus};
use paybridge_observability::Telemetry;

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::plugin::{
    BankAccountRequest, BankAccountResponse, CompleteUserLinkRequest, CompleteUserLinkResponse,
    CreateUserLinkRequest, CreateUserRequest, CreateUserResponse, DeleteUserConnectionRequest,
    DeleteUserRequest, InstallRequest, InstallResponse, PaymentInitiationRequest, Plugin,
    PluginError, PluginFactory, PluginResult, ProviderConnection, ProviderPayment, ReversalRequest,
    ScheduleTemplate, UninstallRequest, UpdateUserLinkRequest, UserLinkResponse,
};
use crate::registry::ConnectorRegistry;
use crate::storage::InMemoryStorage;
use crate::workflow::{WorkflowError, WorkflowRuntime, WorkflowTrigger};

pub(crate) const PROVIDER: &str = "fakepsp";

struct Script {
    payment_status: ProviderPaymentStatus,
    payment_error: Option<String>,
    link_error: Option<String>,
    link_expiry: Option<DateTime<Utc>>,
    link_completion: Option<CompleteUserLinkResponse>,
    delay: Option<Duration>,
    schedules: Vec<ScheduleTemplate>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            payment_status: ProviderPaymentStatus::Succeeded,
            payment_error: None,
            link_error: None,
            link_expiry: None,
            link_completion: None,
            delay: None,
            schedules: vec![
                ScheduleTemplate {
                    name: "fetch-accounts".into(),
                    interval_secs: 300,
                },
                ScheduleTemplate {
                    name: "fetch-payments".into(),
                    interval_secs: 60,
                },
            ],
        }
    }
}

/// Connector plugin whose answers are set by the test, counting every call.
#[derive(Default)]
pub(crate) struct FakePlugin {
    script: Mutex<Script>,
    calls: Mutex<HashMap<&'static str, usize>>,
    last_attempt: Mutex<Option<u32>>,
    last_link_request: Mutex<Option<CreateUserLinkRequest>>,
}

impl FakePlugin {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Factory handing out this very instance, so the test keeps a handle on it.
    /// A config of `{"invalid": true}` is rejected.
    pub(crate) fn factory(plugin: Arc<Self>) -> PluginFactory {
        Arc::new(move |_id: &ConnectorId, config: &serde_json::Value| {
            if config.get("invalid").and_then(|v| v.as_bool()) == Some(true) {
                return Err(PluginError::InvalidRequest("config marked invalid".into()));
            }
            let plugin: Arc<dyn Plugin> = plugin.clone();
            Ok(plugin)
        })
    }

    pub(crate) fn calls(&self, name: &str) -> usize {
        self.calls.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub(crate) fn last_attempt(&self) -> Option<u32> {
        *self.last_attempt.lock().unwrap()
    }

    pub(crate) fn last_link_request(&self) -> Option<CreateUserLinkRequest> {
        self.last_link_request.lock().unwrap().clone()
    }

    pub(crate) fn set_payment_status(&self, status: ProviderPaymentStatus) {
        self.script.lock().unwrap().payment_status = status;
    }

    pub(crate) fn fail_payments_with(&self, error: &str) {
        self.script.lock().unwrap().payment_error = Some(error.to_string());
    }

    pub(crate) fn succeed_payments(&self) {
        let mut script = self.script.lock().unwrap();
        script.payment_error = None;
        script.payment_status = ProviderPaymentStatus::Succeeded;
    }

    pub(crate) fn fail_links_with(&self, error: &str) {
        self.script.lock().unwrap().link_error = Some(error.to_string());
    }

    pub(crate) fn set_link_expiry(&self, expiry: Option<DateTime<Utc>>) {
        self.script.lock().unwrap().link_expiry = expiry;
    }

    pub(crate) fn set_link_completion(&self, response: CompleteUserLinkResponse) {
        self.script.lock().unwrap().link_completion = Some(response);
    }

    /// Make every provider call take at least `delay`.
    pub(crate) fn set_delay(&self, delay: Duration) {
        self.script.lock().unwrap().delay = Some(delay);
    }

    async fn record(&self, name: &'static str) {
        *self.calls.lock().unwrap().entry(name).or_default() += 1;
        let delay = self.script.lock().unwrap().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn payment(&self, reference: String, amount: u64, asset: String) -> PluginResult<ProviderPayment> {
        let script = self.script.lock().unwrap();
        if let Some(error) = &script.payment_error {
            return Err(PluginError::Provider(error.clone()));
        }
        Ok(ProviderPayment {
            raw: serde_json::json!({ "id": reference, "status": script.payment_status }),
            reference,
            status: script.payment_status,
            amount,
            asset,
        })
    }

    fn link(&self, request: &CreateUserLinkRequest) -> PluginResult<UserLinkResponse> {
        let script = self.script.lock().unwrap();
        if let Some(error) = &script.link_error {
            return Err(PluginError::Provider(error.clone()));
        }
        Ok(UserLinkResponse {
            link: format!(
                "https://psp.example/consent?attempt={}&state={}",
                request.attempt_id, request.callback_state
            ),
            temporary_token: Some(format!("tok-{}", request.attempt_id)),
            expires_at: script.link_expiry,
        })
    }

    fn completion(&self, request: &CompleteUserLinkRequest) -> CompleteUserLinkResponse {
        let script = self.script.lock().unwrap();
        script.link_completion.clone().unwrap_or_else(|| {
            let connection_id = request
                .attempt
                .connection_id
                .clone()
                .unwrap_or_else(|| ConnectionId::new("conn-1"));
            CompleteUserLinkResponse::Success {
                connections: vec![ProviderConnection {
                    connection_id,
                    created_at: Utc::now(),
                    metadata: BTreeMap::new(),
                }],
            }
        })
    }
}

#[async_trait]
impl Plugin for FakePlugin {
    async fn install(&self, _req: InstallRequest) -> PluginResult<InstallResponse> {
        self.record("install").await;
        Ok(InstallResponse {
            schedules: self.script.lock().unwrap().schedules.clone(),
        })
    }

    async fn uninstall(&self, _req: UninstallRequest) -> PluginResult<()> {
        self.record("uninstall").await;
        Ok(())
    }

    async fn create_transfer(&self, req: PaymentInitiationRequest) -> PluginResult<ProviderPayment> {
        self.record("create_transfer").await;
        *self.last_attempt.lock().unwrap() = Some(req.attempt);
        let pi = req.payment_initiation;
        self.payment(format!("psp-{}", pi.reference), pi.amount, pi.asset)
    }

    async fn create_payout(&self, req: PaymentInitiationRequest) -> PluginResult<ProviderPayment> {
        self.record("create_payout").await;
        *self.last_attempt.lock().unwrap() = Some(req.attempt);
        let pi = req.payment_initiation;
        self.payment(format!("psp-{}", pi.reference), pi.amount, pi.asset)
    }

    async fn reverse_transfer(&self, req: ReversalRequest) -> PluginResult<ProviderPayment> {
        self.record("reverse_transfer").await;
        let reversal = req.reversal;
        self.payment(format!("psp-rev-{}", reversal.reference), reversal.amount, reversal.asset)
    }

    async fn reverse_payout(&self, req: ReversalRequest) -> PluginResult<ProviderPayment> {
        self.record("reverse_payout").await;
        let reversal = req.reversal;
        self.payment(format!("psp-rev-{}", reversal.reference), reversal.amount, reversal.asset)
    }

    async fn create_bank_account(&self, req: BankAccountRequest) -> PluginResult<BankAccountResponse> {
        self.record("create_bank_account").await;
        let reference = format!("psp-acc-{}", req.bank_account.id);
        Ok(BankAccountResponse {
            raw: serde_json::json!({ "id": reference }),
            account_reference: reference,
        })
    }

    async fn create_user(&self, req: CreateUserRequest) -> PluginResult<CreateUserResponse> {
        self.record("create_user").await;
        Ok(CreateUserResponse {
            psp_user_id: Some(format!("psp-user-{}", req.psu.id)),
            metadata: BTreeMap::new(),
        })
    }

    async fn create_user_link(&self, req: CreateUserLinkRequest) -> PluginResult<UserLinkResponse> {
        self.record("create_user_link").await;
        *self.last_link_request.lock().unwrap() = Some(req.clone());
        self.link(&req)
    }

    async fn update_user_link(&self, req: UpdateUserLinkRequest) -> PluginResult<UserLinkResponse> {
        self.record("update_user_link").await;
        *self.last_link_request.lock().unwrap() = Some(req.link.clone());
        self.link(&req.link)
    }

    async fn complete_user_link(&self, req: CompleteUserLinkRequest) -> PluginResult<CompleteUserLinkResponse> {
        self.record("complete_user_link").await;
        Ok(self.completion(&req))
    }

    async fn complete_update_user_link(
        &self,
        req: CompleteUserLinkRequest,
    ) -> PluginResult<CompleteUserLinkResponse> {
        self.record("complete_update_user_link").await;
        Ok(self.completion(&req))
    }

    async fn delete_user(&self, _req: DeleteUserRequest) -> PluginResult<()> {
        self.record("delete_user").await;
        Ok(())
    }

    async fn delete_user_connection(&self, _req: DeleteUserConnectionRequest) -> PluginResult<()> {
        self.record("delete_user_connection").await;
        Ok(())
    }
}

/// Workflow runtime that only remembers what it was told.
#[derive(Debug, Default)]
pub(crate) struct RecordingRuntime {
    triggers: Mutex<Vec<WorkflowTrigger>>,
}

impl RecordingRuntime {
    pub(crate) fn triggers(&self) -> Vec<WorkflowTrigger> {
        self.triggers.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkflowRuntime for RecordingRuntime {
    async fn trigger(&self, trigger: WorkflowTrigger) -> Result<(), WorkflowError> {
        self.triggers.lock().unwrap().push(trigger);
        Ok(())
    }
}

pub(crate) struct Harness {
    pub(crate) engine: Engine,
    pub(crate) plugin: Arc<FakePlugin>,
    pub(crate) runtime: Arc<RecordingRuntime>,
    pub(crate) connector: ConnectorId,
}

pub(crate) fn config() -> EngineConfig {
    EngineConfig::default()
        .with_stack("test")
        .with_wait_timeout(Duration::from_secs(5))
}

/// Engine whose registry knows one fake `provider`; nothing is installed yet.
pub(crate) fn engine_with(
    provider: &str,
    capabilities: CapabilitySet,
    config: EngineConfig,
) -> (Engine, Arc<FakePlugin>, Arc<RecordingRuntime>) {
    let plugin = FakePlugin::new();
    let runtime = Arc::new(RecordingRuntime::default());
    let registry =
        ConnectorRegistry::new().with_provider(provider, capabilities, FakePlugin::factory(plugin.clone()));
    let engine = Engine::new(
        Arc::new(InMemoryStorage::new()),
        registry,
        runtime.clone(),
        config,
        Telemetry::new("paybridge-test", "test"),
    );
    (engine, plugin, runtime)
}

/// Engine with one installed fake connector declaring `capabilities`.
pub(crate) async fn harness(capabilities: CapabilitySet) -> Harness {
    let (engine, plugin, runtime) = engine_with(PROVIDER, capabilities, config());
    let installed = engine
        .connectors_install(PROVIDER, serde_json::json!({ "name": "fake" }), true)
        .await
        .unwrap();
    Harness {
        engine,
        plugin,
        runtime,
        connector: installed.connector_id,
    }
}

pub(crate) async fn engine_with_connector(
    capabilities: CapabilitySet,
) -> (Engine, Arc<FakePlugin>, ConnectorId) {
    let harness = harness(capabilities).await;
    (harness.engine, harness.plugin, harness.connector)
}
