//! Payment service users, their bank accounts and connector-side footprint.

use chrono::Utc;
use tracing::{info, instrument, warn};

use paybridge_core::{
    BankAccount, BankAccountId, BankAccountRelatedAccount, Connection, ConnectionId, ConnectionKey,
    ConnectorId, ForwardedUser, PaymentServiceUser, PsuId, Task, TaskKind,
};

use crate::dispatcher::{Operation, check_capability};
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::plugin::{BankAccountRequest, CreateUserRequest, DeleteUserConnectionRequest, DeleteUserRequest};
use crate::storage::{Page, Pagination};

impl Engine {
    #[instrument(skip_all, fields(psu_id = %psu.id), err)]
    pub async fn psus_create(&self, psu: PaymentServiceUser) -> EngineResult<()> {
        psu.validate()?;
        self.storage().psus_create(psu).await?;
        Ok(())
    }

    pub async fn psus_get(&self, id: PsuId) -> EngineResult<PaymentServiceUser> {
        self.storage()
            .psus_get(id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("psu {id}")))
    }

    pub async fn psus_list(&self, pagination: Pagination) -> EngineResult<Page<PaymentServiceUser>> {
        Ok(self.storage().psus_list(pagination).await?)
    }

    #[instrument(skip_all, fields(bank_account_id = %account.id), err)]
    pub async fn bank_accounts_create(&self, account: BankAccount) -> EngineResult<()> {
        account.validate()?;
        self.storage().bank_accounts_create(account).await?;
        Ok(())
    }

    pub async fn bank_accounts_get(&self, id: BankAccountId) -> EngineResult<BankAccount> {
        self.storage()
            .bank_accounts_get(id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("bank account {id}")))
    }

    #[instrument(skip_all, fields(psu_id = %psu_id, bank_account_id = %bank_account_id), err)]
    pub async fn psus_add_bank_account(&self, psu_id: PsuId, bank_account_id: BankAccountId) -> EngineResult<()> {
        let mut psu = self.psus_get(psu_id).await?;
        self.bank_accounts_get(bank_account_id).await?;
        psu.add_bank_account(bank_account_id);
        self.storage().psus_update(&psu).await?;
        Ok(())
    }

    /// Register the PSU as a user on an open-banking connector.
    #[instrument(skip_all, fields(psu_id = %psu_id, connector_id = %connector_id), err)]
    pub async fn psus_forward(&self, psu_id: PsuId, connector_id: &ConnectorId, wait_result: bool) -> EngineResult<Task> {
        self.psus_get(psu_id).await?;
        self.dispatcher().resolve(connector_id, Operation::CreateUser).await?;

        let engine = self.clone();
        let id = connector_id.clone();
        self.submit_task(
            TaskKind::ForwardUser,
            Some(connector_id.clone()),
            &[&psu_id.to_string()],
            wait_result,
            Box::pin(async move { engine.run_forward_user(psu_id, &id).await }),
        )
        .await
    }

    /// Create the bank account on the connector's side.
    #[instrument(skip_all, fields(bank_account_id = %bank_account_id, connector_id = %connector_id), err)]
    pub async fn bank_accounts_forward(
        &self,
        bank_account_id: BankAccountId,
        connector_id: &ConnectorId,
        wait_result: bool,
    ) -> EngineResult<Task> {
        let account = self.bank_accounts_get(bank_account_id).await?;
        if account.related_account(connector_id).is_some() {
            return Err(EngineError::validation(format!(
                "bank account {bank_account_id} was already forwarded to this connector"
            )));
        }
        self.dispatcher()
            .resolve(connector_id, Operation::CreateBankAccount)
            .await?;

        let engine = self.clone();
        let id = connector_id.clone();
        self.submit_task(
            TaskKind::CreateBankAccount,
            Some(connector_id.clone()),
            &[&bank_account_id.to_string()],
            wait_result,
            Box::pin(async move { engine.run_forward_bank_account(bank_account_id, &id).await }),
        )
        .await
    }

    /// Delete the PSU everywhere.
    ///
    /// Connectors that cannot delete users only lose their local records.
    #[instrument(skip_all, fields(psu_id = %psu_id), err)]
    pub async fn psus_delete(&self, psu_id: PsuId, wait_result: bool) -> EngineResult<Task> {
        self.psus_get(psu_id).await?;

        let engine = self.clone();
        self.submit_task(
            TaskKind::DeleteUser,
            None,
            &[&psu_id.to_string()],
            wait_result,
            Box::pin(async move { engine.run_delete_psu(psu_id).await }),
        )
        .await
    }

    /// Remove the PSU from one connector.
    #[instrument(skip_all, fields(psu_id = %psu_id, connector_id = %connector_id), err)]
    pub async fn psus_connector_delete(
        &self,
        psu_id: PsuId,
        connector_id: &ConnectorId,
        wait_result: bool,
    ) -> EngineResult<Task> {
        self.psus_get(psu_id).await?;
        self.forwarded_user(psu_id, connector_id).await?;
        self.dispatcher().resolve(connector_id, Operation::DeleteUser).await?;

        let engine = self.clone();
        let id = connector_id.clone();
        self.submit_task(
            TaskKind::DeleteUserConnector,
            Some(connector_id.clone()),
            &[&psu_id.to_string()],
            wait_result,
            Box::pin(async move { engine.run_delete_psu_connector(psu_id, &id).await }),
        )
        .await
    }

    /// Revoke one bank-bridge connection.
    #[instrument(skip_all, fields(psu_id = %psu_id, connector_id = %connector_id, connection_id = %connection_id), err)]
    pub async fn psus_connections_delete(
        &self,
        psu_id: PsuId,
        connector_id: &ConnectorId,
        connection_id: &ConnectionId,
        wait_result: bool,
    ) -> EngineResult<Task> {
        self.psus_get(psu_id).await?;
        self.forwarded_user(psu_id, connector_id).await?;
        let key = ConnectionKey {
            psu_id,
            connector_id: connector_id.clone(),
            connection_id: connection_id.clone(),
        };
        self.connection(&key).await?;
        self.dispatcher()
            .resolve(connector_id, Operation::DeleteUserConnection)
            .await?;

        let engine = self.clone();
        self.submit_task(
            TaskKind::DeleteUserConnection,
            Some(connector_id.clone()),
            &[&psu_id.to_string(), connection_id.as_str()],
            wait_result,
            Box::pin(async move { engine.run_delete_connection(key).await }),
        )
        .await
    }

    pub async fn psus_connections_list(
        &self,
        psu_id: PsuId,
        connector_id: Option<&ConnectorId>,
        pagination: Pagination,
    ) -> EngineResult<Page<Connection>> {
        Ok(self
            .storage()
            .connections_list(psu_id, connector_id, pagination)
            .await?)
    }

    pub(crate) async fn forwarded_user(&self, psu_id: PsuId, connector_id: &ConnectorId) -> EngineResult<ForwardedUser> {
        self.storage()
            .forwarded_users_get(psu_id, connector_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("psu {psu_id} was not forwarded to connector {connector_id}")))
    }

    async fn connection(&self, key: &ConnectionKey) -> EngineResult<Connection> {
        self.storage()
            .connections_get(key)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("connection {}", key.connection_id)))
    }

    async fn run_forward_user(&self, psu_id: PsuId, connector_id: &ConnectorId) -> EngineResult<Option<String>> {
        let psu = self.psus_get(psu_id).await?;
        let loaded = self.dispatcher().resolve(connector_id, Operation::CreateUser).await?;

        let response = loaded.plugin.create_user(CreateUserRequest { psu }).await?;
        self.storage()
            .forwarded_users_upsert(ForwardedUser {
                psu_id,
                connector_id: connector_id.clone(),
                psp_user_id: response.psp_user_id.clone(),
                created_at: Utc::now(),
                metadata: response.metadata,
            })
            .await?;
        info!(%psu_id, %connector_id, "psu forwarded");
        Ok(response.psp_user_id)
    }

    async fn run_forward_bank_account(
        &self,
        bank_account_id: BankAccountId,
        connector_id: &ConnectorId,
    ) -> EngineResult<Option<String>> {
        let bank_account = self.bank_accounts_get(bank_account_id).await?;
        let loaded = self
            .dispatcher()
            .resolve(connector_id, Operation::CreateBankAccount)
            .await?;

        let response = loaded
            .plugin
            .create_bank_account(BankAccountRequest { bank_account })
            .await?;
        self.storage()
            .bank_accounts_add_related_account(
                bank_account_id,
                BankAccountRelatedAccount {
                    connector_id: connector_id.clone(),
                    account_reference: response.account_reference.clone(),
                    created_at: Utc::now(),
                },
            )
            .await?;
        Ok(Some(response.account_reference))
    }

    async fn run_delete_psu(&self, psu_id: PsuId) -> EngineResult<Option<String>> {
        let psu = self.psus_get(psu_id).await?;
        for forwarded_user in self.storage().forwarded_users_list(psu_id).await? {
            let supported = match self.registry().get(&forwarded_user.connector_id).await {
                Ok(loaded) => check_capability(&loaded.connector, Operation::DeleteUser).is_ok(),
                Err(_) => false,
            };
            if supported {
                self.delete_psu_on_connector(&psu, forwarded_user).await?;
            } else {
                info!(connector_id = %forwarded_user.connector_id, "connector cannot delete users, removing local records only");
                self.forget_psu_on_connector(psu_id, &forwarded_user.connector_id).await?;
            }
        }

        self.storage().psus_delete(psu_id).await?;
        info!(%psu_id, "psu deleted");
        Ok(None)
    }

    async fn run_delete_psu_connector(&self, psu_id: PsuId, connector_id: &ConnectorId) -> EngineResult<Option<String>> {
        let psu = self.psus_get(psu_id).await?;
        let forwarded_user = self.forwarded_user(psu_id, connector_id).await?;
        self.delete_psu_on_connector(&psu, forwarded_user).await?;
        Ok(None)
    }

    async fn delete_psu_on_connector(&self, psu: &PaymentServiceUser, forwarded_user: ForwardedUser) -> EngineResult<()> {
        let connector_id = forwarded_user.connector_id.clone();
        let loaded = self.dispatcher().resolve(&connector_id, Operation::DeleteUser).await?;
        loaded
            .plugin
            .delete_user(DeleteUserRequest {
                psu: psu.clone(),
                forwarded_user,
            })
            .await?;
        self.forget_psu_on_connector(psu.id, &connector_id).await
    }

    /// Drop every local record tying the PSU to a connector.
    async fn forget_psu_on_connector(&self, psu_id: PsuId, connector_id: &ConnectorId) -> EngineResult<()> {
        let mut keys = Vec::new();
        let mut pagination = Pagination::new(Some(Pagination::MAX_LIMIT), None);
        loop {
            let page = self
                .storage()
                .connections_list(psu_id, Some(connector_id), pagination)
                .await?;
            keys.extend(page.items.into_iter().map(|c| c.key));
            if !page.has_more {
                break;
            }
            pagination.offset += pagination.limit;
        }

        for key in &keys {
            self.storage().connections_delete(key).await?;
        }
        self.storage().forwarded_users_delete(psu_id, connector_id).await?;
        info!(%psu_id, %connector_id, connections = keys.len(), "psu removed from connector");
        Ok(())
    }

    async fn run_delete_connection(&self, key: ConnectionKey) -> EngineResult<Option<String>> {
        let psu = self.psus_get(key.psu_id).await?;
        let forwarded_user = self.forwarded_user(key.psu_id, &key.connector_id).await?;
        let connection = match self.storage().connections_get(&key).await? {
            Some(connection) => connection,
            None => {
                warn!(connection_id = %key.connection_id, "connection already deleted");
                return Ok(None);
            }
        };

        let loaded = self
            .dispatcher()
            .resolve(&key.connector_id, Operation::DeleteUserConnection)
            .await?;
        loaded
            .plugin
            .delete_user_connection(DeleteUserConnectionRequest {
                psu,
                forwarded_user,
                connection,
            })
            .await?;
        self.storage().connections_delete(&key).await?;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use paybridge_core::{Capability, CapabilitySet, TaskStatus};

    fn user_caps() -> CapabilitySet {
        CapabilitySet::empty()
            .with(Capability::CreateUser)
            .with(Capability::CreateBankAccount)
            .with(Capability::DeleteUser)
            .with(Capability::DeleteUserConnection)
    }

    async fn seed_connection(engine: &Engine, psu_id: PsuId, connector_id: &ConnectorId, id: &str) -> ConnectionKey {
        let key = ConnectionKey {
            psu_id,
            connector_id: connector_id.clone(),
            connection_id: ConnectionId::new(id),
        };
        engine
            .storage()
            .connections_upsert(Connection {
                key: key.clone(),
                created_at: Utc::now(),
                data_updated_at: Utc::now(),
                status: paybridge_core::ConnectionStatus::Active,
                error: None,
                metadata: Default::default(),
            })
            .await
            .unwrap();
        key
    }

    #[tokio::test]
    async fn psu_must_be_valid_and_unique() {
        let (engine, _plugin, _connector) = testing::engine_with_connector(user_caps()).await;
        assert!(matches!(
            engine.psus_create(PaymentServiceUser::new(" ")).await,
            Err(EngineError::Validation(_))
        ));

        let psu = PaymentServiceUser::new("alice");
        engine.psus_create(psu.clone()).await.unwrap();
        assert!(matches!(
            engine.psus_create(psu.clone()).await,
            Err(EngineError::DuplicateKeyValue(_))
        ));
        assert_eq!(engine.psus_list(Pagination::default()).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn bank_account_is_attached_once() {
        let (engine, _plugin, _connector) = testing::engine_with_connector(user_caps()).await;
        let psu = PaymentServiceUser::new("alice");
        let account = BankAccount::new("main").with_iban("FR7630006000011234567890189");
        engine.psus_create(psu.clone()).await.unwrap();
        engine.bank_accounts_create(account.clone()).await.unwrap();

        engine.psus_add_bank_account(psu.id, account.id).await.unwrap();
        engine.psus_add_bank_account(psu.id, account.id).await.unwrap();
        assert_eq!(engine.psus_get(psu.id).await.unwrap().bank_account_ids, vec![account.id]);

        let err = engine
            .psus_add_bank_account(psu.id, BankAccountId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn forwarding_records_the_provider_user() {
        let (engine, plugin, connector) = testing::engine_with_connector(user_caps()).await;
        let psu = PaymentServiceUser::new("alice");
        engine.psus_create(psu.clone()).await.unwrap();

        let task = engine.psus_forward(psu.id, &connector, true).await.unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        let forwarded = engine.forwarded_user(psu.id, &connector).await.unwrap();
        assert_eq!(forwarded.psp_user_id, task.created_object_id);

        // Same PSU, same connector: same task, no second provider call.
        let again = engine.psus_forward(psu.id, &connector, true).await.unwrap();
        assert_eq!(again.id, task.id);
        assert_eq!(plugin.calls("create_user"), 1);
    }

    #[tokio::test]
    async fn bank_account_forwarding_stores_the_related_account() {
        let (engine, plugin, connector) = testing::engine_with_connector(user_caps()).await;
        let account = BankAccount::new("main").with_account_number("0001");
        engine.bank_accounts_create(account.clone()).await.unwrap();

        let task = engine.bank_accounts_forward(account.id, &connector, true).await.unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        let stored = engine.bank_accounts_get(account.id).await.unwrap();
        let related = stored.related_account(&connector).unwrap();
        assert_eq!(Some(related.account_reference.clone()), task.created_object_id);

        let err = engine
            .bank_accounts_forward(account.id, &connector, true)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(plugin.calls("create_bank_account"), 1);
    }

    #[tokio::test]
    async fn deleting_a_connection_calls_the_provider() {
        let (engine, plugin, connector) = testing::engine_with_connector(user_caps()).await;
        let psu = PaymentServiceUser::new("alice");
        engine.psus_create(psu.clone()).await.unwrap();
        engine.psus_forward(psu.id, &connector, true).await.unwrap();
        let key = seed_connection(&engine, psu.id, &connector, "conn-1").await;

        let task = engine
            .psus_connections_delete(psu.id, &connector, &key.connection_id, true)
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(plugin.calls("delete_user_connection"), 1);
        assert!(engine.storage().connections_get(&key).await.unwrap().is_none());

        let err = engine
            .psus_connections_delete(psu.id, &connector, &key.connection_id, true)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn psu_delete_cleans_every_connector() {
        let (engine, plugin, connector) = testing::engine_with_connector(user_caps()).await;
        let psu = PaymentServiceUser::new("alice");
        engine.psus_create(psu.clone()).await.unwrap();
        engine.psus_forward(psu.id, &connector, true).await.unwrap();
        seed_connection(&engine, psu.id, &connector, "conn-1").await;
        seed_connection(&engine, psu.id, &connector, "conn-2").await;

        let task = engine.psus_delete(psu.id, true).await.unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert!(task.id.connector_id.is_none());
        assert_eq!(plugin.calls("delete_user"), 1);
        assert!(matches!(engine.psus_get(psu.id).await, Err(EngineError::NotFound(_))));
        assert_eq!(
            engine
                .psus_connections_list(psu.id, None, Pagination::default())
                .await
                .unwrap()
                .total,
            0
        );
    }

    #[tokio::test]
    async fn psu_delete_skips_connectors_without_user_deletion() {
        let caps = CapabilitySet::empty().with(Capability::CreateUser);
        let (engine, plugin, connector) = testing::engine_with_connector(caps).await;
        let psu = PaymentServiceUser::new("alice");
        engine.psus_create(psu.clone()).await.unwrap();
        engine.psus_forward(psu.id, &connector, true).await.unwrap();

        let err = engine
            .psus_connector_delete(psu.id, &connector, true)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CapabilityNotSupported { .. }));

        let task = engine.psus_delete(psu.id, true).await.unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(plugin.calls("delete_user"), 0);
        assert!(matches!(
            engine.forwarded_user(psu.id, &connector).await,
            Err(EngineError::NotFound(_))
        ));
    }
}
