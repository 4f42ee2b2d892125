use async_trait::async_trait;
use chrono::{DateTime, Utc};

use paybridge_core::{
    AttemptId, BankAccount, BankAccountId, BankAccountRelatedAccount, Connection,
    ConnectionAttempt, ConnectionAttemptStatus, ConnectionKey, Connector, ConnectorId,
    ForwardedUser, IdempotencyKey, Instance, PaymentInitiation, PaymentInitiationAdjustment,
    PaymentInitiationId, PaymentInitiationReversal, PaymentInitiationReversalId,
    PaymentServiceUser, PsuId, RelatedPayment, ReversalAdjustment, Schedule, ScheduleId, Task,
    TaskId, TaskOutcome,
};

use super::query::{Page, Pagination};
use super::StorageResult;

/// Guard evaluated against the latest adjustment, under the same lock/transaction
/// as the insert it protects.
pub type AdjustmentPredicate<'a> =
    &'a (dyn Fn(Option<&PaymentInitiationAdjustment>) -> bool + Send + Sync);

/// Guard evaluated against a whole adjustment history, under the lock of the
/// write it protects.
pub type HistoryGuard<'a> = &'a (dyn Fn(&[PaymentInitiationAdjustment]) -> bool + Send + Sync);

/// Result of completing a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskCompletion {
    /// This call moved the task to its terminal state.
    Applied(Task),
    /// Another writer already completed it; the stored state is returned unchanged.
    AlreadyTerminal(Task),
}

impl TaskCompletion {
    pub fn into_task(self) -> Task {
        match self {
            TaskCompletion::Applied(task) | TaskCompletion::AlreadyTerminal(task) => task,
        }
    }
}

/// Result of claiming a connection attempt for completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptClaim {
    /// This call moved the attempt from `Pending` to `Completing`.
    Claimed(ConnectionAttempt),
    /// Another callback claimed or finished it first.
    Taken(ConnectionAttempt),
}

/// Result of finishing a connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptTransition {
    Applied(ConnectionAttempt),
    AlreadyTerminal(ConnectionAttempt),
}

#[async_trait]
pub trait ConnectorStore: Send + Sync {
    /// Fails with `DuplicateKeyValue` if the connector id exists.
    async fn connectors_install(&self, connector: Connector) -> StorageResult<()>;

    async fn connectors_get(&self, id: &ConnectorId) -> StorageResult<Option<Connector>>;

    async fn connectors_list(&self, pagination: Pagination) -> StorageResult<Page<Connector>>;

    async fn connectors_update(&self, connector: &Connector) -> StorageResult<()>;

    async fn connectors_schedule_for_deletion(&self, id: &ConnectorId) -> StorageResult<()>;

    async fn connectors_delete(&self, id: &ConnectorId) -> StorageResult<()>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert-if-absent keyed on the task id. Returns the stored task and
    /// whether this call created it.
    async fn tasks_create(&self, task: Task) -> StorageResult<(Task, bool)>;

    async fn tasks_get(&self, id: &TaskId) -> StorageResult<Option<Task>>;

    /// Write the terminal state once. Never moves a terminal task.
    async fn tasks_complete(&self, id: &TaskId, outcome: TaskOutcome) -> StorageResult<TaskCompletion>;

    async fn tasks_list(
        &self,
        connector_id: Option<&ConnectorId>,
        pagination: Pagination,
    ) -> StorageResult<Page<Task>>;
}

#[async_trait]
pub trait PaymentInitiationStore: Send + Sync {
    /// Persist an initiation together with its first adjustment.
    /// Fails with `DuplicateKeyValue` if the initiation exists.
    async fn payment_initiations_insert(
        &self,
        initiation: PaymentInitiation,
        first: PaymentInitiationAdjustment,
    ) -> StorageResult<()>;

    async fn payment_initiations_get(
        &self,
        id: &PaymentInitiationId,
    ) -> StorageResult<Option<PaymentInitiation>>;

    async fn payment_initiations_list(
        &self,
        connector_id: Option<&ConnectorId>,
        pagination: Pagination,
    ) -> StorageResult<Page<PaymentInitiation>>;

    /// Delete the initiation (and its log) if `guard` accepts its adjustment history.
    /// Returns whether it was deleted.
    async fn payment_initiations_delete_if(
        &self,
        id: &PaymentInitiationId,
        guard: HistoryGuard<'_>,
    ) -> StorageResult<bool>;

    /// Append an adjustment. Replaying an existing adjustment id is a no-op;
    /// returns whether a row was inserted.
    async fn adjustments_upsert(&self, adjustment: PaymentInitiationAdjustment) -> StorageResult<bool>;

    /// Append only if `predicate` accepts the current latest adjustment.
    async fn adjustments_insert_if(
        &self,
        adjustment: PaymentInitiationAdjustment,
        predicate: AdjustmentPredicate<'_>,
    ) -> StorageResult<bool>;

    /// Adjustments in append order.
    async fn adjustments_list(
        &self,
        id: &PaymentInitiationId,
    ) -> StorageResult<Vec<PaymentInitiationAdjustment>>;

    /// Materialized latest adjustment.
    async fn adjustments_last(
        &self,
        id: &PaymentInitiationId,
    ) -> StorageResult<Option<PaymentInitiationAdjustment>>;

    async fn related_payments_upsert(&self, related: RelatedPayment) -> StorageResult<()>;

    async fn related_payments_list(
        &self,
        id: &PaymentInitiationId,
    ) -> StorageResult<Vec<RelatedPayment>>;
}

#[async_trait]
pub trait ReversalStore: Send + Sync {
    /// Insert a reversal with the first entry of its log and append
    /// `reservation` to the parent's log, all or nothing.
    ///
    /// Writes nothing and returns false when `predicate` rejects the parent's
    /// latest adjustment. Fails with `DuplicateKeyValue` if the reversal exists.
    async fn reversals_insert_reserving(
        &self,
        reversal: PaymentInitiationReversal,
        first: ReversalAdjustment,
        reservation: PaymentInitiationAdjustment,
        predicate: AdjustmentPredicate<'_>,
    ) -> StorageResult<bool>;

    async fn reversals_get(
        &self,
        id: &PaymentInitiationReversalId,
    ) -> StorageResult<Option<PaymentInitiationReversal>>;

    async fn reversals_list_for(
        &self,
        payment_initiation_id: &PaymentInitiationId,
    ) -> StorageResult<Vec<PaymentInitiationReversal>>;

    async fn reversal_adjustments_upsert(&self, adjustment: ReversalAdjustment) -> StorageResult<bool>;

    async fn reversal_adjustments_list(
        &self,
        id: &PaymentInitiationReversalId,
    ) -> StorageResult<Vec<ReversalAdjustment>>;
}

#[async_trait]
pub trait PsuStore: Send + Sync {
    async fn psus_create(&self, psu: PaymentServiceUser) -> StorageResult<()>;

    async fn psus_get(&self, id: PsuId) -> StorageResult<Option<PaymentServiceUser>>;

    async fn psus_list(&self, pagination: Pagination) -> StorageResult<Page<PaymentServiceUser>>;

    async fn psus_update(&self, psu: &PaymentServiceUser) -> StorageResult<()>;

    async fn psus_delete(&self, id: PsuId) -> StorageResult<()>;

    async fn bank_accounts_create(&self, account: BankAccount) -> StorageResult<()>;

    async fn bank_accounts_get(&self, id: BankAccountId) -> StorageResult<Option<BankAccount>>;

    /// Record a connector-side account; one per connector.
    async fn bank_accounts_add_related_account(
        &self,
        id: BankAccountId,
        related: BankAccountRelatedAccount,
    ) -> StorageResult<()>;

    async fn forwarded_users_upsert(&self, user: ForwardedUser) -> StorageResult<()>;

    async fn forwarded_users_get(
        &self,
        psu_id: PsuId,
        connector_id: &ConnectorId,
    ) -> StorageResult<Option<ForwardedUser>>;

    async fn forwarded_users_list(&self, psu_id: PsuId) -> StorageResult<Vec<ForwardedUser>>;

    async fn forwarded_users_delete(&self, psu_id: PsuId, connector_id: &ConnectorId) -> StorageResult<()>;

    async fn connections_upsert(&self, connection: Connection) -> StorageResult<()>;

    async fn connections_get(&self, key: &ConnectionKey) -> StorageResult<Option<Connection>>;

    async fn connections_list(
        &self,
        psu_id: PsuId,
        connector_id: Option<&ConnectorId>,
        pagination: Pagination,
    ) -> StorageResult<Page<Connection>>;

    async fn connections_delete(&self, key: &ConnectionKey) -> StorageResult<()>;
}

#[async_trait]
pub trait ConnectionAttemptStore: Send + Sync {
    /// Insert unless an attempt with the same (psu, connector, idempotency key)
    /// exists, in which case that attempt is returned. The bool tells whether
    /// this call inserted.
    async fn attempts_insert_or_get(
        &self,
        attempt: ConnectionAttempt,
    ) -> StorageResult<(ConnectionAttempt, bool)>;

    async fn attempts_get(&self, id: AttemptId) -> StorageResult<Option<ConnectionAttempt>>;

    async fn attempts_find_by_key(
        &self,
        psu_id: PsuId,
        connector_id: &ConnectorId,
        key: IdempotencyKey,
    ) -> StorageResult<Option<ConnectionAttempt>>;

    /// Store the provider's link for a pending attempt. The first link stored
    /// wins; the stored attempt is returned either way.
    async fn attempts_set_link(
        &self,
        id: AttemptId,
        link: String,
        temporary_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> StorageResult<ConnectionAttempt>;

    /// Compare-and-set from `Pending` to `Completing`.
    async fn attempts_claim(&self, id: AttemptId) -> StorageResult<AttemptClaim>;

    /// Compare-and-set from a non-terminal status to a terminal one.
    async fn attempts_finish(
        &self,
        id: AttemptId,
        status: ConnectionAttemptStatus,
        error: Option<String>,
    ) -> StorageResult<AttemptTransition>;

    async fn attempts_list(
        &self,
        psu_id: PsuId,
        connector_id: &ConnectorId,
        pagination: Pagination,
    ) -> StorageResult<Page<ConnectionAttempt>>;
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn schedules_upsert(&self, schedule: Schedule) -> StorageResult<()>;

    async fn schedules_get(&self, id: &ScheduleId) -> StorageResult<Option<Schedule>>;

    async fn schedules_list(
        &self,
        connector_id: Option<&ConnectorId>,
        pagination: Pagination,
    ) -> StorageResult<Page<Schedule>>;

    /// Remove every schedule and instance of a connector.
    async fn schedules_delete_for_connector(&self, connector_id: &ConnectorId) -> StorageResult<()>;

    async fn instances_upsert(&self, instance: Instance) -> StorageResult<()>;

    async fn instances_list(
        &self,
        schedule_id: Option<&ScheduleId>,
        pagination: Pagination,
    ) -> StorageResult<Page<Instance>>;
}

/// Everything the engine persists.
pub trait Storage:
    ConnectorStore
    + TaskStore
    + PaymentInitiationStore
    + ReversalStore
    + PsuStore
    + ConnectionAttemptStore
    + ScheduleStore
{
}

impl<T> Storage for T where
    T: ConnectorStore
        + TaskStore
        + PaymentInitiationStore
        + ReversalStore
        + PsuStore
        + ConnectionAttemptStore
        + ScheduleStore
{
}
