//! In-memory storage for tests/dev.
//!
//! Each table sits behind its own `tokio::sync::RwLock`; every conditional
//! write (insert-if-absent, insert-if-predicate, compare-and-set) runs under a
//! single write guard, which is what makes it atomic.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use paybridge_core::{
    AttemptId, BankAccount, BankAccountId, BankAccountRelatedAccount, Connection,
    ConnectionAttempt, ConnectionAttemptStatus, ConnectionKey, Connector, ConnectorId, Entity,
    ForwardedUser, IdempotencyKey, Instance, PaymentInitiation, PaymentInitiationAdjustment,
    PaymentInitiationId, PaymentInitiationReversal, PaymentInitiationReversalId,
    PaymentServiceUser, PsuId, RelatedPayment, ReversalAdjustment, Schedule, ScheduleId, Task,
    TaskId, TaskOutcome,
};

use super::query::{Page, Pagination};
use super::r#trait::{
    AdjustmentPredicate, AttemptClaim, AttemptTransition, ConnectionAttemptStore,
    ConnectorStore, HistoryGuard, PaymentInitiationStore, PsuStore, ReversalStore,
    ScheduleStore, TaskCompletion, TaskStore,
};
use super::{StorageError, StorageResult};

/// Rows keyed by entity id, iterated in insertion order.
#[derive(Debug)]
struct Table<E: Entity> {
    rows: HashMap<E::Id, E>,
    order: Vec<E::Id>,
}

impl<E: Entity + Clone> Table<E> {
    fn new() -> Self {
        Self {
            rows: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn get(&self, id: &E::Id) -> Option<&E> {
        self.rows.get(id)
    }

    fn get_mut(&mut self, id: &E::Id) -> Option<&mut E> {
        self.rows.get_mut(id)
    }

    /// Returns false (and leaves the table untouched) if the id exists.
    fn insert_new(&mut self, row: E) -> bool {
        if self.rows.contains_key(row.id()) {
            return false;
        }
        self.order.push(row.id().clone());
        self.rows.insert(row.id().clone(), row);
        true
    }

    fn upsert(&mut self, row: E) {
        if !self.rows.contains_key(row.id()) {
            self.order.push(row.id().clone());
        }
        self.rows.insert(row.id().clone(), row);
    }

    fn remove(&mut self, id: &E::Id) -> Option<E> {
        let removed = self.rows.remove(id);
        if removed.is_some() {
            self.order.retain(|k| k != id);
        }
        removed
    }

    fn retain(&mut self, keep: impl Fn(&E) -> bool) {
        let rows = &mut self.rows;
        self.order.retain(|id| match rows.get(id) {
            Some(row) if keep(row) => true,
            _ => {
                rows.remove(id);
                false
            }
        });
    }

    fn iter(&self) -> impl Iterator<Item = &E> {
        self.order.iter().filter_map(|id| self.rows.get(id))
    }
}

/// Adjustment log plus the materialized index of its latest entry.
#[derive(Debug, Default)]
struct AdjustmentLog {
    entries: Vec<PaymentInitiationAdjustment>,
    latest: Option<usize>,
}

impl AdjustmentLog {
    fn contains(&self, adjustment: &PaymentInitiationAdjustment) -> bool {
        self.entries.iter().any(|a| a.id == adjustment.id)
    }

    fn latest(&self) -> Option<&PaymentInitiationAdjustment> {
        self.latest.and_then(|i| self.entries.get(i))
    }

    fn push(&mut self, adjustment: PaymentInitiationAdjustment) {
        let is_newest = self
            .latest()
            .is_none_or(|current| adjustment.created_at >= current.created_at);
        self.entries.push(adjustment);
        if is_newest {
            self.latest = Some(self.entries.len() - 1);
        }
    }
}

#[derive(Debug)]
struct PaymentInitiationTables {
    initiations: Table<PaymentInitiation>,
    logs: HashMap<PaymentInitiationId, AdjustmentLog>,
    related: HashMap<PaymentInitiationId, Vec<RelatedPayment>>,
}

#[derive(Debug)]
struct ReversalTables {
    reversals: Table<PaymentInitiationReversal>,
    logs: HashMap<PaymentInitiationReversalId, Vec<ReversalAdjustment>>,
}

#[derive(Debug)]
struct ScheduleTables {
    schedules: Table<Schedule>,
    instances: Table<Instance>,
}

/// In-memory implementation of every storage port.
#[derive(Debug)]
pub struct InMemoryStorage {
    connectors: RwLock<Table<Connector>>,
    tasks: RwLock<Table<Task>>,
    payment_initiations: RwLock<PaymentInitiationTables>,
    reversals: RwLock<ReversalTables>,
    psus: RwLock<Table<PaymentServiceUser>>,
    bank_accounts: RwLock<Table<BankAccount>>,
    forwarded_users: RwLock<HashMap<(PsuId, ConnectorId), ForwardedUser>>,
    connections: RwLock<Table<Connection>>,
    attempts: RwLock<Table<ConnectionAttempt>>,
    schedules: RwLock<ScheduleTables>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            connectors: RwLock::new(Table::new()),
            tasks: RwLock::new(Table::new()),
            payment_initiations: RwLock::new(PaymentInitiationTables {
                initiations: Table::new(),
                logs: HashMap::new(),
                related: HashMap::new(),
            }),
            reversals: RwLock::new(ReversalTables {
                reversals: Table::new(),
                logs: HashMap::new(),
            }),
            psus: RwLock::new(Table::new()),
            bank_accounts: RwLock::new(Table::new()),
            forwarded_users: RwLock::new(HashMap::new()),
            connections: RwLock::new(Table::new()),
            attempts: RwLock::new(Table::new()),
            schedules: RwLock::new(ScheduleTables {
                schedules: Table::new(),
                instances: Table::new(),
            }),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectorStore for InMemoryStorage {
    async fn connectors_install(&self, connector: Connector) -> StorageResult<()> {
        let id = connector.id.clone();
        if !self.connectors.write().await.insert_new(connector) {
            return Err(StorageError::DuplicateKeyValue(format!("connector {id}")));
        }
        Ok(())
    }

    async fn connectors_get(&self, id: &ConnectorId) -> StorageResult<Option<Connector>> {
        Ok(self.connectors.read().await.get(id).cloned())
    }

    async fn connectors_list(&self, pagination: Pagination) -> StorageResult<Page<Connector>> {
        let connectors = self.connectors.read().await;
        Ok(Page::paginate(connectors.iter().cloned(), pagination))
    }

    async fn connectors_update(&self, connector: &Connector) -> StorageResult<()> {
        let mut connectors = self.connectors.write().await;
        let stored = connectors
            .get_mut(&connector.id)
            .ok_or_else(|| StorageError::NotFound(format!("connector {}", connector.id)))?;
        *stored = connector.clone();
        Ok(())
    }

    async fn connectors_schedule_for_deletion(&self, id: &ConnectorId) -> StorageResult<()> {
        let mut connectors = self.connectors.write().await;
        let stored = connectors
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("connector {id}")))?;
        stored.scheduled_for_deletion = true;
        Ok(())
    }

    async fn connectors_delete(&self, id: &ConnectorId) -> StorageResult<()> {
        self.connectors.write().await.remove(id);
        Ok(())
    }
}

#[async_trait]
impl TaskStore for InMemoryStorage {
    async fn tasks_create(&self, task: Task) -> StorageResult<(Task, bool)> {
        let mut tasks = self.tasks.write().await;
        if let Some(existing) = tasks.get(&task.id) {
            return Ok((existing.clone(), false));
        }
        tasks.insert_new(task.clone());
        Ok((task, true))
    }

    async fn tasks_get(&self, id: &TaskId) -> StorageResult<Option<Task>> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn tasks_complete(&self, id: &TaskId, outcome: TaskOutcome) -> StorageResult<TaskCompletion> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("task {}", id.reference)))?;

        if task.is_terminal() {
            return Ok(TaskCompletion::AlreadyTerminal(task.clone()));
        }
        task.complete(outcome)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(TaskCompletion::Applied(task.clone()))
    }

    async fn tasks_list(
        &self,
        connector_id: Option<&ConnectorId>,
        pagination: Pagination,
    ) -> StorageResult<Page<Task>> {
        let tasks = self.tasks.read().await;
        let matching = tasks
            .iter()
            .filter(|t| connector_id.is_none_or(|c| t.connector_id.as_ref() == Some(c)))
            .cloned();
        Ok(Page::paginate(matching, pagination))
    }
}

#[async_trait]
impl PaymentInitiationStore for InMemoryStorage {
    async fn payment_initiations_insert(
        &self,
        initiation: PaymentInitiation,
        first: PaymentInitiationAdjustment,
    ) -> StorageResult<()> {
        let mut tables = self.payment_initiations.write().await;
        let id = initiation.id.clone();
        if !tables.initiations.insert_new(initiation) {
            return Err(StorageError::DuplicateKeyValue(format!(
                "payment initiation {}",
                id.reference
            )));
        }
        tables.logs.entry(id).or_default().push(first);
        Ok(())
    }

    async fn payment_initiations_get(
        &self,
        id: &PaymentInitiationId,
    ) -> StorageResult<Option<PaymentInitiation>> {
        Ok(self.payment_initiations.read().await.initiations.get(id).cloned())
    }

    async fn payment_initiations_list(
        &self,
        connector_id: Option<&ConnectorId>,
        pagination: Pagination,
    ) -> StorageResult<Page<PaymentInitiation>> {
        let tables = self.payment_initiations.read().await;
        let matching = tables
            .initiations
            .iter()
            .filter(|pi| connector_id.is_none_or(|c| &pi.connector_id == c))
            .cloned();
        Ok(Page::paginate(matching, pagination))
    }

    async fn payment_initiations_delete_if(
        &self,
        id: &PaymentInitiationId,
        guard: HistoryGuard<'_>,
    ) -> StorageResult<bool> {
        let mut tables = self.payment_initiations.write().await;
        if tables.initiations.get(id).is_none() {
            return Err(StorageError::NotFound(format!(
                "payment initiation {}",
                id.reference
            )));
        }
        let allowed = tables
            .logs
            .get(id)
            .is_none_or(|log| guard(&log.entries));
        if !allowed {
            return Ok(false);
        }
        tables.initiations.remove(id);
        tables.logs.remove(id);
        tables.related.remove(id);
        Ok(true)
    }

    async fn adjustments_upsert(&self, adjustment: PaymentInitiationAdjustment) -> StorageResult<bool> {
        self.adjustments_insert_if(adjustment, &|_| true).await
    }

    async fn adjustments_insert_if(
        &self,
        adjustment: PaymentInitiationAdjustment,
        predicate: AdjustmentPredicate<'_>,
    ) -> StorageResult<bool> {
        let mut tables = self.payment_initiations.write().await;
        let id = adjustment.payment_initiation_id().clone();
        if tables.initiations.get(&id).is_none() {
            return Err(StorageError::NotFound(format!(
                "payment initiation {}",
                id.reference
            )));
        }

        let log = tables.logs.entry(id).or_default();
        if log.contains(&adjustment) || !predicate(log.latest()) {
            return Ok(false);
        }
        log.push(adjustment);
        Ok(true)
    }

    async fn adjustments_list(
        &self,
        id: &PaymentInitiationId,
    ) -> StorageResult<Vec<PaymentInitiationAdjustment>> {
        let tables = self.payment_initiations.read().await;
        Ok(tables
            .logs
            .get(id)
            .map(|log| log.entries.clone())
            .unwrap_or_default())
    }

    async fn adjustments_last(
        &self,
        id: &PaymentInitiationId,
    ) -> StorageResult<Option<PaymentInitiationAdjustment>> {
        let tables = self.payment_initiations.read().await;
        Ok(tables.logs.get(id).and_then(|log| log.latest().cloned()))
    }

    async fn related_payments_upsert(&self, related: RelatedPayment) -> StorageResult<()> {
        let mut tables = self.payment_initiations.write().await;
        let entries = tables
            .related
            .entry(related.payment_initiation_id.clone())
            .or_default();
        if !entries
            .iter()
            .any(|r| r.payment_reference == related.payment_reference)
        {
            entries.push(related);
        }
        Ok(())
    }

    async fn related_payments_list(
        &self,
        id: &PaymentInitiationId,
    ) -> StorageResult<Vec<RelatedPayment>> {
        let tables = self.payment_initiations.read().await;
        Ok(tables.related.get(id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl ReversalStore for InMemoryStorage {
    async fn reversals_insert_reserving(
        &self,
        reversal: PaymentInitiationReversal,
        first: ReversalAdjustment,
        reservation: PaymentInitiationAdjustment,
        predicate: AdjustmentPredicate<'_>,
    ) -> StorageResult<bool> {
        // Lock order: payment initiations, then reversals.
        let mut initiations = self.payment_initiations.write().await;
        let mut tables = self.reversals.write().await;

        let id = reversal.id.clone();
        if tables.reversals.get(&id).is_some() {
            return Err(StorageError::DuplicateKeyValue(format!(
                "reversal {}",
                id.reference
            )));
        }
        let parent_id = reservation.payment_initiation_id().clone();
        if initiations.initiations.get(&parent_id).is_none() {
            return Err(StorageError::NotFound(format!(
                "payment initiation {}",
                parent_id.reference
            )));
        }

        let log = initiations.logs.entry(parent_id).or_default();
        if log.contains(&reservation) || !predicate(log.latest()) {
            return Ok(false);
        }
        log.push(reservation);
        tables.reversals.insert_new(reversal);
        tables.logs.entry(id).or_default().push(first);
        Ok(true)
    }

    async fn reversals_get(
        &self,
        id: &PaymentInitiationReversalId,
    ) -> StorageResult<Option<PaymentInitiationReversal>> {
        Ok(self.reversals.read().await.reversals.get(id).cloned())
    }

    async fn reversals_list_for(
        &self,
        payment_initiation_id: &PaymentInitiationId,
    ) -> StorageResult<Vec<PaymentInitiationReversal>> {
        let tables = self.reversals.read().await;
        Ok(tables
            .reversals
            .iter()
            .filter(|r| &r.payment_initiation_id == payment_initiation_id)
            .cloned()
            .collect())
    }

    async fn reversal_adjustments_upsert(&self, adjustment: ReversalAdjustment) -> StorageResult<bool> {
        let mut tables = self.reversals.write().await;
        let id = adjustment.id.reversal_id.clone();
        if tables.reversals.get(&id).is_none() {
            return Err(StorageError::NotFound(format!("reversal {}", id.reference)));
        }
        let log = tables.logs.entry(id).or_default();
        if log.iter().any(|a| a.id == adjustment.id) {
            return Ok(false);
        }
        log.push(adjustment);
        Ok(true)
    }

    async fn reversal_adjustments_list(
        &self,
        id: &PaymentInitiationReversalId,
    ) -> StorageResult<Vec<ReversalAdjustment>> {
        let tables = self.reversals.read().await;
        Ok(tables.logs.get(id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl PsuStore for InMemoryStorage {
    async fn psus_create(&self, psu: PaymentServiceUser) -> StorageResult<()> {
        let id = psu.id;
        if !self.psus.write().await.insert_new(psu) {
            return Err(StorageError::DuplicateKeyValue(format!("psu {id}")));
        }
        Ok(())
    }

    async fn psus_get(&self, id: PsuId) -> StorageResult<Option<PaymentServiceUser>> {
        Ok(self.psus.read().await.get(&id).cloned())
    }

    async fn psus_list(&self, pagination: Pagination) -> StorageResult<Page<PaymentServiceUser>> {
        let psus = self.psus.read().await;
        Ok(Page::paginate(psus.iter().cloned(), pagination))
    }

    async fn psus_update(&self, psu: &PaymentServiceUser) -> StorageResult<()> {
        let mut psus = self.psus.write().await;
        let stored = psus
            .get_mut(&psu.id)
            .ok_or_else(|| StorageError::NotFound(format!("psu {}", psu.id)))?;
        *stored = psu.clone();
        Ok(())
    }

    async fn psus_delete(&self, id: PsuId) -> StorageResult<()> {
        self.psus.write().await.remove(&id);
        Ok(())
    }

    async fn bank_accounts_create(&self, account: BankAccount) -> StorageResult<()> {
        let id = account.id;
        if !self.bank_accounts.write().await.insert_new(account) {
            return Err(StorageError::DuplicateKeyValue(format!("bank account {id}")));
        }
        Ok(())
    }

    async fn bank_accounts_get(&self, id: BankAccountId) -> StorageResult<Option<BankAccount>> {
        Ok(self.bank_accounts.read().await.get(&id).cloned())
    }

    async fn bank_accounts_add_related_account(
        &self,
        id: BankAccountId,
        related: BankAccountRelatedAccount,
    ) -> StorageResult<()> {
        let mut accounts = self.bank_accounts.write().await;
        let account = accounts
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("bank account {id}")))?;
        if account.related_account(&related.connector_id).is_none() {
            account.related_accounts.push(related);
        }
        Ok(())
    }

    async fn forwarded_users_upsert(&self, user: ForwardedUser) -> StorageResult<()> {
        self.forwarded_users
            .write()
            .await
            .insert((user.psu_id, user.connector_id.clone()), user);
        Ok(())
    }

    async fn forwarded_users_get(
        &self,
        psu_id: PsuId,
        connector_id: &ConnectorId,
    ) -> StorageResult<Option<ForwardedUser>> {
        let users = self.forwarded_users.read().await;
        Ok(users.get(&(psu_id, connector_id.clone())).cloned())
    }

    async fn forwarded_users_list(&self, psu_id: PsuId) -> StorageResult<Vec<ForwardedUser>> {
        let users = self.forwarded_users.read().await;
        let mut matching: Vec<ForwardedUser> = users
            .values()
            .filter(|u| u.psu_id == psu_id)
            .cloned()
            .collect();
        matching.sort_by_key(|u| u.created_at);
        Ok(matching)
    }

    async fn forwarded_users_delete(&self, psu_id: PsuId, connector_id: &ConnectorId) -> StorageResult<()> {
        self.forwarded_users
            .write()
            .await
            .remove(&(psu_id, connector_id.clone()));
        Ok(())
    }

    async fn connections_upsert(&self, connection: Connection) -> StorageResult<()> {
        self.connections.write().await.upsert(connection);
        Ok(())
    }

    async fn connections_get(&self, key: &ConnectionKey) -> StorageResult<Option<Connection>> {
        Ok(self.connections.read().await.get(key).cloned())
    }

    async fn connections_list(
        &self,
        psu_id: PsuId,
        connector_id: Option<&ConnectorId>,
        pagination: Pagination,
    ) -> StorageResult<Page<Connection>> {
        let connections = self.connections.read().await;
        let matching = connections
            .iter()
            .filter(|c| {
                c.key.psu_id == psu_id && connector_id.is_none_or(|id| &c.key.connector_id == id)
            })
            .cloned();
        Ok(Page::paginate(matching, pagination))
    }

    async fn connections_delete(&self, key: &ConnectionKey) -> StorageResult<()> {
        self.connections.write().await.remove(key);
        Ok(())
    }
}

#[async_trait]
impl ConnectionAttemptStore for InMemoryStorage {
    async fn attempts_insert_or_get(
        &self,
        attempt: ConnectionAttempt,
    ) -> StorageResult<(ConnectionAttempt, bool)> {
        let mut attempts = self.attempts.write().await;

        if let Some(key) = attempt.idempotency_key {
            if let Some(existing) = attempts
                .iter()
                .find(|a| a.matches_key(attempt.psu_id, &attempt.connector_id, key))
            {
                return Ok((existing.clone(), false));
            }
        }

        if !attempts.insert_new(attempt.clone()) {
            return Err(StorageError::DuplicateKeyValue(format!(
                "connection attempt {}",
                attempt.id
            )));
        }
        Ok((attempt, true))
    }

    async fn attempts_get(&self, id: AttemptId) -> StorageResult<Option<ConnectionAttempt>> {
        Ok(self.attempts.read().await.get(&id).cloned())
    }

    async fn attempts_find_by_key(
        &self,
        psu_id: PsuId,
        connector_id: &ConnectorId,
        key: IdempotencyKey,
    ) -> StorageResult<Option<ConnectionAttempt>> {
        let attempts = self.attempts.read().await;
        Ok(attempts
            .iter()
            .find(|a| a.matches_key(psu_id, connector_id, key))
            .cloned())
    }

    async fn attempts_set_link(
        &self,
        id: AttemptId,
        link: String,
        temporary_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> StorageResult<ConnectionAttempt> {
        let mut attempts = self.attempts.write().await;
        let attempt = attempts
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("connection attempt {id}")))?;
        if !attempt.is_terminal() && attempt.link.is_none() {
            attempt.link = Some(link);
            attempt.temporary_token = temporary_token;
            attempt.expires_at = expires_at;
        }
        Ok(attempt.clone())
    }

    async fn attempts_claim(&self, id: AttemptId) -> StorageResult<AttemptClaim> {
        let mut attempts = self.attempts.write().await;
        let attempt = attempts
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("connection attempt {id}")))?;
        if attempt.claim() {
            Ok(AttemptClaim::Claimed(attempt.clone()))
        } else {
            Ok(AttemptClaim::Taken(attempt.clone()))
        }
    }

    async fn attempts_finish(
        &self,
        id: AttemptId,
        status: ConnectionAttemptStatus,
        error: Option<String>,
    ) -> StorageResult<AttemptTransition> {
        let mut attempts = self.attempts.write().await;
        let attempt = attempts
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("connection attempt {id}")))?;

        if attempt.is_terminal() {
            return Ok(AttemptTransition::AlreadyTerminal(attempt.clone()));
        }
        attempt
            .finish(status, error)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(AttemptTransition::Applied(attempt.clone()))
    }

    async fn attempts_list(
        &self,
        psu_id: PsuId,
        connector_id: &ConnectorId,
        pagination: Pagination,
    ) -> StorageResult<Page<ConnectionAttempt>> {
        let attempts = self.attempts.read().await;
        let matching = attempts
            .iter()
            .filter(|a| a.psu_id == psu_id && &a.connector_id == connector_id)
            .cloned();
        Ok(Page::paginate(matching, pagination))
    }
}

#[async_trait]
impl ScheduleStore for InMemoryStorage {
    async fn schedules_upsert(&self, schedule: Schedule) -> StorageResult<()> {
        self.schedules.write().await.schedules.upsert(schedule);
        Ok(())
    }

    async fn schedules_get(&self, id: &ScheduleId) -> StorageResult<Option<Schedule>> {
        Ok(self.schedules.read().await.schedules.get(id).cloned())
    }

    async fn schedules_list(
        &self,
        connector_id: Option<&ConnectorId>,
        pagination: Pagination,
    ) -> StorageResult<Page<Schedule>> {
        let tables = self.schedules.read().await;
        let matching = tables
            .schedules
            .iter()
            .filter(|s| connector_id.is_none_or(|c| &s.connector_id == c))
            .cloned();
        Ok(Page::paginate(matching, pagination))
    }

    async fn schedules_delete_for_connector(&self, connector_id: &ConnectorId) -> StorageResult<()> {
        let mut tables = self.schedules.write().await;
        tables.schedules.retain(|s| &s.connector_id != connector_id);
        tables.instances.retain(|i| &i.connector_id != connector_id);
        Ok(())
    }

    async fn instances_upsert(&self, instance: Instance) -> StorageResult<()> {
        let mut tables = self.schedules.write().await;
        if tables.schedules.get(&instance.schedule_id).is_none() {
            return Err(StorageError::NotFound(format!(
                "schedule {}",
                instance.schedule_id
            )));
        }
        tables.instances.upsert(instance);
        Ok(())
    }

    async fn instances_list(
        &self,
        schedule_id: Option<&ScheduleId>,
        pagination: Pagination,
    ) -> StorageResult<Page<Instance>> {
        let tables = self.schedules.read().await;
        let matching = tables
            .instances
            .iter()
            .filter(|i| schedule_id.is_none_or(|s| &i.schedule_id == s))
            .cloned();
        Ok(Page::paginate(matching, pagination))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use paybridge_core::{
        AdjustmentStatus, InstanceId, PaymentInitiationType, ReversalStatus, TaskKind, TaskStatus,
    };

    fn test_connector() -> ConnectorId {
        ConnectorId::new("psp-1")
    }

    fn test_initiation(connector: &ConnectorId) -> PaymentInitiation {
        PaymentInitiation::new(
            "r1",
            connector.clone(),
            PaymentInitiationType::Transfer,
            100,
            "EUR/2",
        )
    }

    async fn seeded(store: &InMemoryStorage) -> PaymentInitiation {
        let pi = test_initiation(&test_connector());
        let first = PaymentInitiationAdjustment::new(
            pi.id.clone(),
            AdjustmentStatus::WaitingForValidation,
            pi.created_at,
        );
        store
            .payment_initiations_insert(pi.clone(), first)
            .await
            .unwrap();
        pi
    }

    #[tokio::test]
    async fn duplicate_initiation_is_rejected() {
        let store = InMemoryStorage::new();
        let pi = seeded(&store).await;
        let first = PaymentInitiationAdjustment::new(
            pi.id.clone(),
            AdjustmentStatus::WaitingForValidation,
            pi.created_at,
        );
        let err = store
            .payment_initiations_insert(pi.clone(), first)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::DuplicateKeyValue(_)));
        assert_eq!(store.adjustments_list(&pi.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn replaying_an_adjustment_is_a_no_op() {
        let store = InMemoryStorage::new();
        let pi = seeded(&store).await;
        let at = Utc::now() + chrono::Duration::seconds(1);
        let adjustment = PaymentInitiationAdjustment::new(pi.id.clone(), AdjustmentStatus::Processed, at);

        assert!(store.adjustments_upsert(adjustment.clone()).await.unwrap());
        assert!(!store.adjustments_upsert(adjustment).await.unwrap());

        let log = store.adjustments_list(&pi.id).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(
            store.adjustments_last(&pi.id).await.unwrap().unwrap().status,
            AdjustmentStatus::Processed
        );
    }

    #[tokio::test]
    async fn concurrent_guarded_inserts_have_one_winner() {
        let store = Arc::new(InMemoryStorage::new());
        let pi = seeded(&store).await;

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let id = pi.id.clone();
            handles.push(tokio::spawn(async move {
                let at = Utc::now() + chrono::Duration::milliseconds(i);
                let adjustment =
                    PaymentInitiationAdjustment::new(id, AdjustmentStatus::ScheduledForProcessing, at);
                store
                    .adjustments_insert_if(adjustment, &|last| {
                        last.is_some_and(|a| a.status.awaits_validation())
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.adjustments_list(&pi.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn adjustment_for_unknown_initiation_is_not_found() {
        let store = InMemoryStorage::new();
        let pi = test_initiation(&test_connector());
        let adjustment =
            PaymentInitiationAdjustment::new(pi.id.clone(), AdjustmentStatus::Processed, Utc::now());
        assert!(matches!(
            store.adjustments_upsert(adjustment).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn guarded_delete_respects_history() {
        let store = InMemoryStorage::new();
        let pi = seeded(&store).await;

        let deleted = store
            .payment_initiations_delete_if(&pi.id, &|log| log.iter().all(|a| !a.status.is_submitted()))
            .await
            .unwrap();
        assert!(deleted);
        assert!(store.payment_initiations_get(&pi.id).await.unwrap().is_none());
        assert!(store.adjustments_list(&pi.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn guarded_delete_keeps_submitted_history() {
        let store = InMemoryStorage::new();
        let pi = seeded(&store).await;
        let at = Utc::now() + chrono::Duration::seconds(1);
        store
            .adjustments_upsert(PaymentInitiationAdjustment::new(pi.id.clone(), AdjustmentStatus::Processing, at))
            .await
            .unwrap();

        let deleted = store
            .payment_initiations_delete_if(&pi.id, &|log| log.iter().all(|a| !a.status.is_submitted()))
            .await
            .unwrap();
        assert!(!deleted);
        assert!(store.payment_initiations_get(&pi.id).await.unwrap().is_some());
        assert_eq!(store.adjustments_list(&pi.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn reversal_reservation_is_all_or_nothing() {
        let store = InMemoryStorage::new();
        let pi = seeded(&store).await;
        let reversal = PaymentInitiationReversal::new("rev-1", pi.id.clone(), 10, "EUR/2");
        let first = ReversalAdjustment::new(reversal.id.clone(), ReversalStatus::Processing, reversal.created_at);
        let at = Utc::now() + chrono::Duration::seconds(1);
        let reservation = PaymentInitiationAdjustment::new(pi.id.clone(), AdjustmentStatus::ReverseProcessing, at);

        let inserted = store
            .reversals_insert_reserving(reversal.clone(), first.clone(), reservation.clone(), &|last| {
                last.is_some_and(|a| a.status.is_reversible())
            })
            .await
            .unwrap();
        assert!(!inserted);
        assert!(store.reversals_get(&reversal.id).await.unwrap().is_none());
        assert_eq!(store.adjustments_list(&pi.id).await.unwrap().len(), 1);

        let inserted = store
            .reversals_insert_reserving(reversal.clone(), first.clone(), reservation.clone(), &|_| true)
            .await
            .unwrap();
        assert!(inserted);
        assert_eq!(
            store.adjustments_last(&pi.id).await.unwrap().unwrap().status,
            AdjustmentStatus::ReverseProcessing
        );
        assert_eq!(store.reversal_adjustments_list(&reversal.id).await.unwrap().len(), 1);

        let err = store
            .reversals_insert_reserving(reversal, first, reservation, &|_| true)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::DuplicateKeyValue(_)));
        assert_eq!(store.adjustments_list(&pi.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn task_creation_is_insert_if_absent() {
        let store = InMemoryStorage::new();
        let id = TaskId::new("install-local-x", Some(test_connector()));
        let (first, created) = store
            .tasks_create(Task::new(id.clone(), TaskKind::InstallConnector))
            .await
            .unwrap();
        assert!(created);

        let (second, created) = store
            .tasks_create(Task::new(id.clone(), TaskKind::InstallConnector))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(second.created_at, first.created_at);
    }

    #[tokio::test]
    async fn concurrent_task_completion_is_written_once() {
        let store = Arc::new(InMemoryStorage::new());
        let id = TaskId::new("create-transfer-local-0-x", Some(test_connector()));
        store
            .tasks_create(Task::new(id.clone(), TaskKind::CreateTransfer))
            .await
            .unwrap();

        let a = {
            let store = store.clone();
            let id = id.clone();
            tokio::spawn(async move {
                store.tasks_complete(&id, TaskOutcome::succeeded(None)).await.unwrap()
            })
        };
        let b = {
            let store = store.clone();
            let id = id.clone();
            tokio::spawn(async move {
                store.tasks_complete(&id, TaskOutcome::failed("dup webhook")).await.unwrap()
            })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let applied = results
            .iter()
            .filter(|r| matches!(r, TaskCompletion::Applied(_)))
            .count();
        assert_eq!(applied, 1);

        let stored = store.tasks_get(&id).await.unwrap().unwrap();
        let winner = results
            .iter()
            .find_map(|r| match r {
                TaskCompletion::Applied(task) => Some(task.status),
                TaskCompletion::AlreadyTerminal(_) => None,
            })
            .unwrap();
        assert_eq!(stored.status, winner);
        assert_ne!(stored.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn attempts_dedup_on_psu_connector_and_key() {
        let store = Arc::new(InMemoryStorage::new());
        let psu = PsuId::new();
        let connector = ConnectorId::new("bank-bridge");
        let key = IdempotencyKey::new();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            let connector = connector.clone();
            handles.push(tokio::spawn(async move {
                let attempt = ConnectionAttempt::new(psu, connector, Some(key), None);
                store.attempts_insert_or_get(attempt).await.unwrap()
            }));
        }

        let mut ids = Vec::new();
        let mut inserted = 0;
        for handle in handles {
            let (attempt, created) = handle.await.unwrap();
            ids.push(attempt.id);
            if created {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
        assert!(ids.windows(2).all(|w| w[0] == w[1]));

        let page = store
            .attempts_list(psu, &connector, Pagination::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn attempt_finish_is_compare_and_set() {
        let store = InMemoryStorage::new();
        let attempt = ConnectionAttempt::new(PsuId::new(), ConnectorId::new("bb"), None, None);
        let id = attempt.id;
        store.attempts_insert_or_get(attempt).await.unwrap();

        let first = store
            .attempts_finish(id, ConnectionAttemptStatus::Completed, None)
            .await
            .unwrap();
        assert!(matches!(first, AttemptTransition::Applied(_)));

        let second = store
            .attempts_finish(id, ConnectionAttemptStatus::Failed, Some("late".into()))
            .await
            .unwrap();
        match second {
            AttemptTransition::AlreadyTerminal(stored) => {
                assert_eq!(stored.status, ConnectionAttemptStatus::Completed)
            }
            other => panic!("unexpected transition: {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let store = Arc::new(InMemoryStorage::new());
        let attempt = ConnectionAttempt::new(PsuId::new(), ConnectorId::new("bb"), None, None);
        let id = attempt.id;
        store.attempts_insert_or_get(attempt).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.attempts_claim(id).await.unwrap() }));
        }
        let mut claimed = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), AttemptClaim::Claimed(_)) {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);

        let finished = store
            .attempts_finish(id, ConnectionAttemptStatus::Completed, None)
            .await
            .unwrap();
        assert!(matches!(finished, AttemptTransition::Applied(_)));
        assert!(matches!(
            store.attempts_claim(id).await.unwrap(),
            AttemptClaim::Taken(a) if a.status == ConnectionAttemptStatus::Completed
        ));
    }

    #[tokio::test]
    async fn deleting_schedules_for_a_connector_drops_its_instances() {
        let store = InMemoryStorage::new();
        let connector = test_connector();
        let other = ConnectorId::new("psp-2");
        let schedule = Schedule::for_connector(connector.clone(), "fetch-accounts", 60);
        let kept = Schedule::for_connector(other.clone(), "fetch-accounts", 60);
        store.schedules_upsert(schedule.clone()).await.unwrap();
        store.schedules_upsert(kept.clone()).await.unwrap();
        store
            .instances_upsert(Instance::started(InstanceId::new("run-1"), &schedule))
            .await
            .unwrap();

        store.schedules_delete_for_connector(&connector).await.unwrap();

        let schedules = store.schedules_list(None, Pagination::default()).await.unwrap();
        assert_eq!(schedules.items, vec![kept]);
        let instances = store.instances_list(None, Pagination::default()).await.unwrap();
        assert!(instances.items.is_empty());
    }
}
