//! PSU bank-bridge link flow.
//!
//! `CreateLink`/`UpdateLink` open a connection attempt and return the
//! provider's consent URL. The provider later sends the user's browser to our
//! public redirect route, which lands in [`Engine::complete_link_flow`] with
//! whatever query/body the provider chose; the attempt is found again through
//! the encoded `state` parameter, never through a path segment.
//!
//! A callback claims its attempt (`Pending` to `Completing`) before calling the
//! provider, so the consent is exchanged at most once. Replayed or concurrent
//! callbacks that lose the claim only return the attempt's redirect URL.

use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument, warn};

use paybridge_core::{
    AttemptId, CallbackState, Connection, ConnectionAttempt, ConnectionAttemptStatus, ConnectionId,
    ConnectionKey, ConnectionStatus, ConnectorId, ForwardedUser, IdempotencyKey,
    PaymentServiceUser, PsuId,
};

use crate::dispatcher::Operation;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::plugin::{
    CompleteUserLinkRequest, CompleteUserLinkResponse, CreateUserLinkRequest, HttpCallInformation,
    ProviderConnection, UpdateUserLinkRequest, UserLinkResponse,
};
use crate::storage::{AttemptClaim, AttemptTransition, Page, Pagination};

/// Result of `CreateLink` / `UpdateLink`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkCreated {
    pub attempt_id: AttemptId,
    pub link: String,
}

/// What an idempotent attempt lookup resolved to.
enum Reuse {
    Link(LinkCreated),
    CallProvider(ConnectionAttempt),
}

impl Engine {
    /// Open a link flow for a PSU already forwarded to `connector_id`.
    ///
    /// With an idempotency key, a retry while the first attempt is pending
    /// returns the same attempt and link. Reusing a key whose attempt already
    /// finished is a `DuplicateKeyValue` error: the caller must start over with
    /// a fresh key.
    #[instrument(skip_all, fields(psu_id = %psu_id, connector_id = %connector_id), err)]
    pub async fn psu_create_link(
        &self,
        application_name: &str,
        psu_id: PsuId,
        connector_id: &ConnectorId,
        idempotency_key: Option<IdempotencyKey>,
        client_redirect_url: Option<String>,
    ) -> EngineResult<LinkCreated> {
        let psu = self.psus_get(psu_id).await?;
        let loaded = self
            .dispatcher()
            .resolve(connector_id, Operation::CreateUserLink)
            .await?;
        let forwarded_user = self.forwarded_user(psu_id, connector_id).await?;

        let attempt = ConnectionAttempt::new(psu_id, connector_id.clone(), idempotency_key, client_redirect_url);
        let attempt = match self.open_attempt(attempt).await? {
            Reuse::Link(link) => return Ok(link),
            Reuse::CallProvider(attempt) => attempt,
        };

        let request = self.link_request(application_name, &attempt, psu, forwarded_user)?;
        let response = match loaded.plugin.create_user_link(request).await {
            Ok(response) => response,
            Err(err) => {
                self.finish_attempt(attempt.id, ConnectionAttemptStatus::Failed, Some(err.to_string()))
                    .await?;
                return Err(err.into());
            }
        };
        self.store_link(&attempt, response).await
    }

    /// Open a link flow that refreshes an existing connection.
    #[instrument(skip_all, fields(psu_id = %psu_id, connector_id = %connector_id, connection_id = %connection_id), err)]
    pub async fn psu_update_link(
        &self,
        application_name: &str,
        psu_id: PsuId,
        connector_id: &ConnectorId,
        connection_id: &ConnectionId,
        idempotency_key: Option<IdempotencyKey>,
        client_redirect_url: Option<String>,
    ) -> EngineResult<LinkCreated> {
        let psu = self.psus_get(psu_id).await?;
        let loaded = self
            .dispatcher()
            .resolve(connector_id, Operation::UpdateUserLink)
            .await?;
        let forwarded_user = self.forwarded_user(psu_id, connector_id).await?;
        let connection = self
            .storage()
            .connections_get(&ConnectionKey {
                psu_id,
                connector_id: connector_id.clone(),
                connection_id: connection_id.clone(),
            })
            .await?
            .ok_or_else(|| EngineError::not_found(format!("connection {connection_id}")))?;

        let attempt = ConnectionAttempt::new(psu_id, connector_id.clone(), idempotency_key, client_redirect_url)
            .for_connection(connection_id.clone());
        let attempt = match self.open_attempt(attempt).await? {
            Reuse::Link(link) => return Ok(link),
            Reuse::CallProvider(attempt) => attempt,
        };

        let request = UpdateUserLinkRequest {
            link: self.link_request(application_name, &attempt, psu, forwarded_user)?,
            connection,
        };
        let response = match loaded.plugin.update_user_link(request).await {
            Ok(response) => response,
            Err(err) => {
                self.finish_attempt(attempt.id, ConnectionAttemptStatus::Failed, Some(err.to_string()))
                    .await?;
                return Err(err.into());
            }
        };
        self.store_link(&attempt, response).await
    }

    /// Handle the provider's redirect for `connector_id`.
    ///
    /// Returns the client redirect URL stored on the attempt, on success and
    /// on provider-reported failure alike, so the browser always goes back to
    /// the initiating application. Safe to call again for the same callback.
    #[instrument(skip_all, fields(connector_id = %connector_id), err)]
    pub async fn complete_link_flow(
        &self,
        connector_id: &ConnectorId,
        http_call: HttpCallInformation,
    ) -> EngineResult<Option<String>> {
        let raw_state = http_call
            .query_value("state")
            .ok_or_else(|| EngineError::validation("missing state query parameter"))?;
        let state = CallbackState::decode(raw_state)?;

        let attempt = self.connection_attempts_get(state.attempt_id).await?;
        if &attempt.connector_id != connector_id || attempt.state.randomized != state.randomized {
            return Err(EngineError::validation(
                "callback state does not match the connection attempt",
            ));
        }

        if attempt.is_terminal() {
            info!(attempt_id = %attempt.id, status = ?attempt.status, "link callback replayed");
            return Ok(attempt.client_redirect_url);
        }

        if attempt.is_expired(Utc::now()) {
            self.finish_attempt(
                attempt.id,
                ConnectionAttemptStatus::Failed,
                Some("connection attempt expired".to_string()),
            )
            .await?;
            return Ok(attempt.client_redirect_url);
        }

        let loaded = self
            .dispatcher()
            .resolve(connector_id, Operation::CompleteUserLink)
            .await?;
        let attempt = match self.storage().attempts_claim(attempt.id).await? {
            AttemptClaim::Claimed(attempt) => attempt,
            AttemptClaim::Taken(attempt) => {
                info!(attempt_id = %attempt.id, status = ?attempt.status, "link callback already being handled");
                return Ok(attempt.client_redirect_url);
            }
        };

        let request = CompleteUserLinkRequest {
            http_call,
            attempt: attempt.clone(),
        };
        let result = if attempt.connection_id.is_some() {
            loaded.plugin.complete_update_user_link(request).await
        } else {
            loaded.plugin.complete_user_link(request).await
        };

        match result {
            Ok(CompleteUserLinkResponse::Success { connections }) => {
                if let Err(err) = self.store_connections(&attempt, connections).await {
                    self.finish_attempt(attempt.id, ConnectionAttemptStatus::Failed, Some(err.to_string()))
                        .await?;
                    return Err(err);
                }
                self.finish_attempt(attempt.id, ConnectionAttemptStatus::Completed, None)
                    .await?;
            }
            Ok(CompleteUserLinkResponse::Error { error }) => {
                self.finish_attempt(attempt.id, ConnectionAttemptStatus::Failed, Some(error))
                    .await?;
            }
            Err(err) => {
                warn!(attempt_id = %attempt.id, error = %err, "link completion failed");
                self.finish_attempt(attempt.id, ConnectionAttemptStatus::Failed, Some(err.to_string()))
                    .await?;
            }
        }
        Ok(attempt.client_redirect_url)
    }

    pub async fn connection_attempts_get(&self, id: AttemptId) -> EngineResult<ConnectionAttempt> {
        self.storage()
            .attempts_get(id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("connection attempt {id}")))
    }

    pub async fn connection_attempts_list(
        &self,
        psu_id: PsuId,
        connector_id: &ConnectorId,
        pagination: Pagination,
    ) -> EngineResult<Page<ConnectionAttempt>> {
        Ok(self
            .storage()
            .attempts_list(psu_id, connector_id, pagination)
            .await?)
    }

    /// Insert the attempt, or resolve it to the one already holding its key.
    async fn open_attempt(&self, attempt: ConnectionAttempt) -> EngineResult<Reuse> {
        let (attempt, created) = self.storage().attempts_insert_or_get(attempt).await?;
        if created {
            return Ok(Reuse::CallProvider(attempt));
        }

        if attempt.status != ConnectionAttemptStatus::Pending {
            return Err(EngineError::DuplicateKeyValue(format!(
                "idempotency key already used by connection attempt {} ({:?})",
                attempt.id, attempt.status
            )));
        }
        match attempt.link {
            Some(link) => {
                info!(attempt_id = %attempt.id, "reusing pending connection attempt");
                Ok(Reuse::Link(LinkCreated {
                    attempt_id: attempt.id,
                    link,
                }))
            }
            // The first caller is still waiting on the provider; whichever
            // link is stored first is the one everybody gets.
            None => Ok(Reuse::CallProvider(attempt)),
        }
    }

    fn link_request(
        &self,
        application_name: &str,
        attempt: &ConnectionAttempt,
        psu: PaymentServiceUser,
        forwarded_user: ForwardedUser,
    ) -> EngineResult<CreateUserLinkRequest> {
        Ok(CreateUserLinkRequest {
            attempt_id: attempt.id,
            psu,
            forwarded_user,
            application_name: application_name.to_string(),
            client_redirect_url: attempt.client_redirect_url.clone(),
            redirect_url: self.config().link_redirect_url(&attempt.connector_id),
            callback_state: attempt.state.encode()?,
            webhook_base_url: self.config().webhook_base_url(&attempt.connector_id),
        })
    }

    async fn store_link(&self, attempt: &ConnectionAttempt, response: UserLinkResponse) -> EngineResult<LinkCreated> {
        let expires_at = match response.expires_at {
            Some(at) => at,
            None => {
                let ttl = chrono::Duration::from_std(self.config().link_attempt_ttl)
                    .map_err(|e| EngineError::internal(format!("link attempt ttl: {e}")))?;
                Utc::now() + ttl
            }
        };

        let stored = self
            .storage()
            .attempts_set_link(attempt.id, response.link, response.temporary_token, Some(expires_at))
            .await?;
        let link = stored.link.ok_or_else(|| {
            EngineError::validation(format!("connection attempt {} finished before its link was stored", stored.id))
        })?;
        info!(attempt_id = %stored.id, "link created");
        Ok(LinkCreated {
            attempt_id: stored.id,
            link,
        })
    }

    async fn store_connections(
        &self,
        attempt: &ConnectionAttempt,
        connections: Vec<ProviderConnection>,
    ) -> EngineResult<()> {
        for connection in connections {
            self.store_connection(attempt, connection).await?;
        }
        Ok(())
    }

    async fn store_connection(&self, attempt: &ConnectionAttempt, provided: ProviderConnection) -> EngineResult<()> {
        let key = ConnectionKey {
            psu_id: attempt.psu_id,
            connector_id: attempt.connector_id.clone(),
            connection_id: provided.connection_id,
        };
        let created_at = self
            .storage()
            .connections_get(&key)
            .await?
            .map_or(provided.created_at, |existing| existing.created_at);

        self.storage()
            .connections_upsert(Connection {
                key,
                created_at,
                data_updated_at: Utc::now(),
                status: ConnectionStatus::Active,
                error: None,
                metadata: provided.metadata,
            })
            .await?;
        Ok(())
    }

    async fn finish_attempt(
        &self,
        id: AttemptId,
        status: ConnectionAttemptStatus,
        error: Option<String>,
    ) -> EngineResult<()> {
        match self.storage().attempts_finish(id, status, error).await? {
            AttemptTransition::Applied(attempt) => {
                info!(attempt_id = %attempt.id, status = ?attempt.status, "connection attempt finished");
            }
            AttemptTransition::AlreadyTerminal(attempt) => {
                info!(attempt_id = %attempt.id, status = ?attempt.status, "connection attempt already finished");
            }
        }
        Ok(())
    }
}
