//! The facade adapters (HTTP, gRPC, CLI) program against.
//!
//! Every operation of the engine is reachable through [`Backend`], so an
//! adapter can hold an `Arc<dyn Backend>` and be tested against a double.

use async_trait::async_trait;

use paybridge_core::{
    AttemptId, BankAccount, BankAccountId, Connection, ConnectionAttempt, ConnectionId, Connector,
    ConnectorId, IdempotencyKey, Instance, PaymentInitiation, PaymentInitiationAdjustment,
    PaymentInitiationId, PaymentInitiationReversal, PaymentInitiationReversalId,
    PaymentInitiationView, PaymentServiceUser, PsuId, RelatedPayment, ReversalAdjustment, Schedule,
    ScheduleId, Task, TaskId,
};

use crate::connectors::ConnectorInstallation;
use crate::engine::Engine;
use crate::error::EngineResult;
use crate::link_flow::LinkCreated;
use crate::plugin::{HttpCallInformation, ProviderPayment};
use crate::storage::{Page, Pagination};

#[async_trait]
pub trait Backend: Send + Sync {
    // Connectors
    async fn connectors_install(
        &self,
        provider: &str,
        config: serde_json::Value,
        wait_result: bool,
    ) -> EngineResult<ConnectorInstallation>;
    async fn connectors_uninstall(&self, connector_id: &ConnectorId, wait_result: bool) -> EngineResult<Task>;
    async fn connectors_reset(&self, connector_id: &ConnectorId, wait_result: bool) -> EngineResult<Task>;
    async fn connectors_config_update(&self, connector_id: &ConnectorId, config: serde_json::Value) -> EngineResult<Connector>;
    async fn connectors_get(&self, connector_id: &ConnectorId) -> EngineResult<Connector>;
    async fn connectors_config(&self, connector_id: &ConnectorId) -> EngineResult<serde_json::Value>;
    async fn connectors_list(&self, pagination: Pagination) -> EngineResult<Page<Connector>>;

    // Tasks
    async fn tasks_get(&self, id: &TaskId) -> EngineResult<Task>;
    async fn tasks_list(&self, connector_id: Option<&ConnectorId>, pagination: Pagination) -> EngineResult<Page<Task>>;

    // Payment initiations
    async fn payment_initiations_create(
        &self,
        initiation: PaymentInitiation,
        validated: bool,
        wait_result: bool,
    ) -> EngineResult<Option<Task>>;
    async fn payment_initiations_approve(&self, id: &PaymentInitiationId, wait_result: bool) -> EngineResult<Task>;
    async fn payment_initiations_reject(&self, id: &PaymentInitiationId) -> EngineResult<()>;
    async fn payment_initiations_retry(&self, id: &PaymentInitiationId, wait_result: bool) -> EngineResult<Task>;
    async fn payment_initiations_delete(&self, id: &PaymentInitiationId) -> EngineResult<()>;
    async fn payment_initiations_apply_provider_status(
        &self,
        id: &PaymentInitiationId,
        payment: ProviderPayment,
    ) -> EngineResult<PaymentInitiationView>;
    async fn payment_initiations_get(&self, id: &PaymentInitiationId) -> EngineResult<PaymentInitiationView>;
    async fn payment_initiations_list(
        &self,
        connector_id: Option<&ConnectorId>,
        pagination: Pagination,
    ) -> EngineResult<Page<PaymentInitiation>>;
    async fn payment_initiation_adjustments_list(
        &self,
        id: &PaymentInitiationId,
    ) -> EngineResult<Vec<PaymentInitiationAdjustment>>;
    async fn payment_initiation_related_payments_list(&self, id: &PaymentInitiationId) -> EngineResult<Vec<RelatedPayment>>;

    // Reversals
    async fn payment_initiation_reversals_create(
        &self,
        reversal: PaymentInitiationReversal,
        wait_result: bool,
    ) -> EngineResult<Task>;
    async fn payment_initiation_reversals_apply_provider_status(
        &self,
        id: &PaymentInitiationReversalId,
        payment: ProviderPayment,
    ) -> EngineResult<PaymentInitiationReversal>;
    async fn payment_initiation_reversals_get(&self, id: &PaymentInitiationReversalId) -> EngineResult<PaymentInitiationReversal>;
    async fn payment_initiation_reversals_list(&self, id: &PaymentInitiationId) -> EngineResult<Vec<PaymentInitiationReversal>>;
    async fn payment_initiation_reversal_adjustments_list(
        &self,
        id: &PaymentInitiationReversalId,
    ) -> EngineResult<Vec<ReversalAdjustment>>;

    // Payment service users
    async fn psus_create(&self, psu: PaymentServiceUser) -> EngineResult<()>;
    async fn psus_get(&self, id: PsuId) -> EngineResult<PaymentServiceUser>;
    async fn psus_list(&self, pagination: Pagination) -> EngineResult<Page<PaymentServiceUser>>;
    async fn psus_add_bank_account(&self, psu_id: PsuId, bank_account_id: BankAccountId) -> EngineResult<()>;
    async fn psus_forward(&self, psu_id: PsuId, connector_id: &ConnectorId, wait_result: bool) -> EngineResult<Task>;
    async fn psus_delete(&self, psu_id: PsuId, wait_result: bool) -> EngineResult<Task>;
    async fn psus_connector_delete(&self, psu_id: PsuId, connector_id: &ConnectorId, wait_result: bool) -> EngineResult<Task>;
    async fn psus_connections_delete(
        &self,
        psu_id: PsuId,
        connector_id: &ConnectorId,
        connection_id: &ConnectionId,
        wait_result: bool,
    ) -> EngineResult<Task>;
    async fn psus_connections_list(
        &self,
        psu_id: PsuId,
        connector_id: Option<&ConnectorId>,
        pagination: Pagination,
    ) -> EngineResult<Page<Connection>>;
    async fn bank_accounts_create(&self, account: BankAccount) -> EngineResult<()>;
    async fn bank_accounts_get(&self, id: BankAccountId) -> EngineResult<BankAccount>;
    async fn bank_accounts_forward(
        &self,
        bank_account_id: BankAccountId,
        connector_id: &ConnectorId,
        wait_result: bool,
    ) -> EngineResult<Task>;

    // Link flow
    async fn psu_create_link(
        &self,
        application_name: &str,
        psu_id: PsuId,
        connector_id: &ConnectorId,
        idempotency_key: Option<IdempotencyKey>,
        client_redirect_url: Option<String>,
    ) -> EngineResult<LinkCreated>;
    async fn psu_update_link(
        &self,
        application_name: &str,
        psu_id: PsuId,
        connector_id: &ConnectorId,
        connection_id: &ConnectionId,
        idempotency_key: Option<IdempotencyKey>,
        client_redirect_url: Option<String>,
    ) -> EngineResult<LinkCreated>;
    async fn complete_link_flow(
        &self,
        connector_id: &ConnectorId,
        http_call: HttpCallInformation,
    ) -> EngineResult<Option<String>>;
    async fn connection_attempts_get(&self, id: AttemptId) -> EngineResult<ConnectionAttempt>;
    async fn connection_attempts_list(
        &self,
        psu_id: PsuId,
        connector_id: &ConnectorId,
        pagination: Pagination,
    ) -> EngineResult<Page<ConnectionAttempt>>;

    // Schedules
    async fn schedules_get(&self, id: &ScheduleId) -> EngineResult<Schedule>;
    async fn schedules_list(&self, connector_id: Option<&ConnectorId>, pagination: Pagination) -> EngineResult<Page<Schedule>>;
    async fn schedules_trigger(&self, id: &ScheduleId) -> EngineResult<()>;
    async fn instances_list(&self, schedule_id: Option<&ScheduleId>, pagination: Pagination) -> EngineResult<Page<Instance>>;
    async fn instances_record(&self, instance: Instance) -> EngineResult<()>;
}

#[async_trait]
impl Backend for Engine {
    async fn connectors_install(
        &self,
        provider: &str,
        config: serde_json::Value,
        wait_result: bool,
    ) -> EngineResult<ConnectorInstallation> {
        Engine::connectors_install(self, provider, config, wait_result).await
    }

    async fn connectors_uninstall(&self, connector_id: &ConnectorId, wait_result: bool) -> EngineResult<Task> {
        Engine::connectors_uninstall(self, connector_id, wait_result).await
    }

    async fn connectors_reset(&self, connector_id: &ConnectorId, wait_result: bool) -> EngineResult<Task> {
        Engine::connectors_reset(self, connector_id, wait_result).await
    }

    async fn connectors_config_update(&self, connector_id: &ConnectorId, config: serde_json::Value) -> EngineResult<Connector> {
        Engine::connectors_config_update(self, connector_id, config).await
    }

    async fn connectors_get(&self, connector_id: &ConnectorId) -> EngineResult<Connector> {
        Engine::connectors_get(self, connector_id).await
    }

    async fn connectors_config(&self, connector_id: &ConnectorId) -> EngineResult<serde_json::Value> {
        Engine::connectors_config(self, connector_id).await
    }

    async fn connectors_list(&self, pagination: Pagination) -> EngineResult<Page<Connector>> {
        Engine::connectors_list(self, pagination).await
    }

    async fn tasks_get(&self, id: &TaskId) -> EngineResult<Task> {
        Engine::tasks_get(self, id).await
    }

    async fn tasks_list(&self, connector_id: Option<&ConnectorId>, pagination: Pagination) -> EngineResult<Page<Task>> {
        Engine::tasks_list(self, connector_id, pagination).await
    }

    async fn payment_initiations_create(
        &self,
        initiation: PaymentInitiation,
        validated: bool,
        wait_result: bool,
    ) -> EngineResult<Option<Task>> {
        Engine::payment_initiations_create(self, initiation, validated, wait_result).await
    }

    async fn payment_initiations_approve(&self, id: &PaymentInitiationId, wait_result: bool) -> EngineResult<Task> {
        Engine::payment_initiations_approve(self, id, wait_result).await
    }

    async fn payment_initiations_reject(&self, id: &PaymentInitiationId) -> EngineResult<()> {
        Engine::payment_initiations_reject(self, id).await
    }

    async fn payment_initiations_retry(&self, id: &PaymentInitiationId, wait_result: bool) -> EngineResult<Task> {
        Engine::payment_initiations_retry(self, id, wait_result).await
    }

    async fn payment_initiations_delete(&self, id: &PaymentInitiationId) -> EngineResult<()> {
        Engine::payment_initiations_delete(self, id).await
    }

    async fn payment_initiations_apply_provider_status(
        &self,
        id: &PaymentInitiationId,
        payment: ProviderPayment,
    ) -> EngineResult<PaymentInitiationView> {
        Engine::payment_initiations_apply_provider_status(self, id, payment).await
    }

    async fn payment_initiations_get(&self, id: &PaymentInitiationId) -> EngineResult<PaymentInitiationView> {
        Engine::payment_initiations_get(self, id).await
    }

    async fn payment_initiations_list(
        &self,
        connector_id: Option<&ConnectorId>,
        pagination: Pagination,
    ) -> EngineResult<Page<PaymentInitiation>> {
        Engine::payment_initiations_list(self, connector_id, pagination).await
    }

    async fn payment_initiation_adjustments_list(
        &self,
        id: &PaymentInitiationId,
    ) -> EngineResult<Vec<PaymentInitiationAdjustment>> {
        Engine::payment_initiation_adjustments_list(self, id).await
    }

    async fn payment_initiation_related_payments_list(&self, id: &PaymentInitiationId) -> EngineResult<Vec<RelatedPayment>> {
        Engine::payment_initiation_related_payments_list(self, id).await
    }

    async fn payment_initiation_reversals_create(
        &self,
        reversal: PaymentInitiationReversal,
        wait_result: bool,
    ) -> EngineResult<Task> {
        Engine::payment_initiation_reversals_create(self, reversal, wait_result).await
    }

    async fn payment_initiation_reversals_apply_provider_status(
        &self,
        id: &PaymentInitiationReversalId,
        payment: ProviderPayment,
    ) -> EngineResult<PaymentInitiationReversal> {
        Engine::payment_initiation_reversals_apply_provider_status(self, id, payment).await
    }

    async fn payment_initiation_reversals_get(&self, id: &PaymentInitiationReversalId) -> EngineResult<PaymentInitiationReversal> {
        Engine::payment_initiation_reversals_get(self, id).await
    }

    async fn payment_initiation_reversals_list(&self, id: &PaymentInitiationId) -> EngineResult<Vec<PaymentInitiationReversal>> {
        Engine::payment_initiation_reversals_list(self, id).await
    }

    async fn payment_initiation_reversal_adjustments_list(
        &self,
        id: &PaymentInitiationReversalId,
    ) -> EngineResult<Vec<ReversalAdjustment>> {
        Engine::payment_initiation_reversal_adjustments_list(self, id).await
    }

    async fn psus_create(&self, psu: PaymentServiceUser) -> EngineResult<()> {
        Engine::psus_create(self, psu).await
    }

    async fn psus_get(&self, id: PsuId) -> EngineResult<PaymentServiceUser> {
        Engine::psus_get(self, id).await
    }

    async fn psus_list(&self, pagination: Pagination) -> EngineResult<Page<PaymentServiceUser>> {
        Engine::psus_list(self, pagination).await
    }

    async fn psus_add_bank_account(&self, psu_id: PsuId, bank_account_id: BankAccountId) -> EngineResult<()> {
        Engine::psus_add_bank_account(self, psu_id, bank_account_id).await
    }

    async fn psus_forward(&self, psu_id: PsuId, connector_id: &ConnectorId, wait_result: bool) -> EngineResult<Task> {
        Engine::psus_forward(self, psu_id, connector_id, wait_result).await
    }

    async fn psus_delete(&self, psu_id: PsuId, wait_result: bool) -> EngineResult<Task> {
        Engine::psus_delete(self, psu_id, wait_result).await
    }

    async fn psus_connector_delete(&self, psu_id: PsuId, connector_id: &ConnectorId, wait_result: bool) -> EngineResult<Task> {
        Engine::psus_connector_delete(self, psu_id, connector_id, wait_result).await
    }

    async fn psus_connections_delete(
        &self,
        psu_id: PsuId,
        connector_id: &ConnectorId,
        connection_id: &ConnectionId,
        wait_result: bool,
    ) -> EngineResult<Task> {
        Engine::psus_connections_delete(self, psu_id, connector_id, connection_id, wait_result).await
    }

    async fn psus_connections_list(
        &self,
        psu_id: PsuId,
        connector_id: Option<&ConnectorId>,
        pagination: Pagination,
    ) -> EngineResult<Page<Connection>> {
        Engine::psus_connections_list(self, psu_id, connector_id, pagination).await
    }

    async fn bank_accounts_create(&self, account: BankAccount) -> EngineResult<()> {
        Engine::bank_accounts_create(self, account).await
    }

    async fn bank_accounts_get(&self, id: BankAccountId) -> EngineResult<BankAccount> {
        Engine::bank_accounts_get(self, id).await
    }

    async fn bank_accounts_forward(
        &self,
        bank_account_id: BankAccountId,
        connector_id: &ConnectorId,
        wait_result: bool,
    ) -> EngineResult<Task> {
        Engine::bank_accounts_forward(self, bank_account_id, connector_id, wait_result).await
    }

    async fn psu_create_link(
        &self,
        application_name: &str,
        psu_id: PsuId,
        connector_id: &ConnectorId,
        idempotency_key: Option<IdempotencyKey>,
        client_redirect_url: Option<String>,
    ) -> EngineResult<LinkCreated> {
        Engine::psu_create_link(self, application_name, psu_id, connector_id, idempotency_key, client_redirect_url).await
    }

    async fn psu_update_link(
        &self,
        application_name: &str,
        psu_id: PsuId,
        connector_id: &ConnectorId,
        connection_id: &ConnectionId,
        idempotency_key: Option<IdempotencyKey>,
        client_redirect_url: Option<String>,
    ) -> EngineResult<LinkCreated> {
        Engine::psu_update_link(
            self,
            application_name,
            psu_id,
            connector_id,
            connection_id,
            idempotency_key,
            client_redirect_url,
        )
        .await
    }

    async fn complete_link_flow(
        &self,
        connector_id: &ConnectorId,
        http_call: HttpCallInformation,
    ) -> EngineResult<Option<String>> {
        Engine::complete_link_flow(self, connector_id, http_call).await
    }

    async fn connection_attempts_get(&self, id: AttemptId) -> EngineResult<ConnectionAttempt> {
        Engine::connection_attempts_get(self, id).await
    }

    async fn connection_attempts_list(
        &self,
        psu_id: PsuId,
        connector_id: &ConnectorId,
        pagination: Pagination,
    ) -> EngineResult<Page<ConnectionAttempt>> {
        Engine::connection_attempts_list(self, psu_id, connector_id, pagination).await
    }

    async fn schedules_get(&self, id: &ScheduleId) -> EngineResult<Schedule> {
        Engine::schedules_get(self, id).await
    }

    async fn schedules_list(&self, connector_id: Option<&ConnectorId>, pagination: Pagination) -> EngineResult<Page<Schedule>> {
        Engine::schedules_list(self, connector_id, pagination).await
    }

    async fn schedules_trigger(&self, id: &ScheduleId) -> EngineResult<()> {
        Engine::schedules_trigger(self, id).await
    }

    async fn instances_list(&self, schedule_id: Option<&ScheduleId>, pagination: Pagination) -> EngineResult<Page<Instance>> {
        Engine::instances_list(self, schedule_id, pagination).await
    }

    async fn instances_record(&self, instance: Instance) -> EngineResult<()> {
        Engine::instances_record(self, instance).await
    }
}
