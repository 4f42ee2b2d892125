//! Payment service users, their bank accounts, and open-banking connections.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::Entity;
use crate::error::{DomainError, DomainResult};
use crate::id::{AttemptId, BankAccountId, ConnectionId, ConnectorId, IdempotencyKey, PsuId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactDetails {
    pub email: Option<String>,
    pub phone_number: Option<String>,
}

/// The end customer whose bank accounts and connections are being linked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentServiceUser {
    pub id: PsuId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub contact_details: Option<ContactDetails>,
    pub bank_account_ids: Vec<BankAccountId>,
    pub metadata: BTreeMap<String, String>,
}

impl PaymentServiceUser {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: PsuId::new(),
            name: name.into(),
            created_at: Utc::now(),
            contact_details: None,
            bank_account_ids: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_contact_details(mut self, contact: ContactDetails) -> Self {
        self.contact_details = Some(contact);
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("psu name is required"));
        }
        Ok(())
    }

    /// Attach a bank account; attaching twice is a no-op.
    pub fn add_bank_account(&mut self, bank_account_id: BankAccountId) {
        if !self.bank_account_ids.contains(&bank_account_id) {
            self.bank_account_ids.push(bank_account_id);
        }
    }
}

impl Entity for PaymentServiceUser {
    type Id = PsuId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// A connector-side account created from a bank account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankAccountRelatedAccount {
    pub connector_id: ConnectorId,
    pub account_reference: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankAccount {
    pub id: BankAccountId,
    pub created_at: DateTime<Utc>,
    pub name: String,
    pub account_number: Option<String>,
    pub iban: Option<String>,
    pub swift_bic_code: Option<String>,
    pub country: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub related_accounts: Vec<BankAccountRelatedAccount>,
}

impl BankAccount {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: BankAccountId::new(),
            created_at: Utc::now(),
            name: name.into(),
            account_number: None,
            iban: None,
            swift_bic_code: None,
            country: None,
            metadata: BTreeMap::new(),
            related_accounts: Vec::new(),
        }
    }

    pub fn with_iban(mut self, iban: impl Into<String>) -> Self {
        self.iban = Some(iban.into());
        self
    }

    pub fn with_account_number(mut self, number: impl Into<String>) -> Self {
        self.account_number = Some(number.into());
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("bank account name is required"));
        }
        if self.iban.is_none() && self.account_number.is_none() {
            return Err(DomainError::validation(
                "either an iban or an account number is required",
            ));
        }
        Ok(())
    }

    pub fn related_account(&self, connector_id: &ConnectorId) -> Option<&BankAccountRelatedAccount> {
        self.related_accounts
            .iter()
            .find(|r| &r.connector_id == connector_id)
    }
}

impl Entity for BankAccount {
    type Id = BankAccountId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// A PSU registered on an open-banking connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedUser {
    pub psu_id: PsuId,
    pub connector_id: ConnectorId,
    /// The provider's own identifier for this user, when it has one.
    pub psp_user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Active,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionKey {
    pub psu_id: PsuId,
    pub connector_id: ConnectorId,
    pub connection_id: ConnectionId,
}

/// Durable result of a successful link flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub key: ConnectionKey,
    pub created_at: DateTime<Utc>,
    pub data_updated_at: DateTime<Utc>,
    pub status: ConnectionStatus,
    pub error: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl Connection {
    pub fn connection_id(&self) -> &ConnectionId {
        &self.key.connection_id
    }
}

impl Entity for Connection {
    type Id = ConnectionKey;

    fn id(&self) -> &Self::Id {
        &self.key
    }
}

/// State round-tripped through the provider's consent flow.
///
/// Encoded as URL-safe unpadded base64 of `{"attemptID":..,"randomized":..}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackState {
    #[serde(rename = "attemptID")]
    pub attempt_id: AttemptId,
    pub randomized: String,
}

impl CallbackState {
    pub fn new(attempt_id: AttemptId) -> Self {
        Self {
            attempt_id,
            randomized: Uuid::now_v7().simple().to_string(),
        }
    }

    pub fn encode(&self) -> DomainResult<String> {
        let raw = serde_json::to_vec(self)
            .map_err(|e| DomainError::invariant(format!("encoding callback state: {e}")))?;
        Ok(URL_SAFE_NO_PAD.encode(raw))
    }

    pub fn decode(value: &str) -> DomainResult<Self> {
        let raw = URL_SAFE_NO_PAD
            .decode(value)
            .map_err(|e| DomainError::validation(format!("invalid callback state: {e}")))?;
        serde_json::from_slice(&raw)
            .map_err(|e| DomainError::validation(format!("invalid callback state: {e}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionAttemptStatus {
    Pending,
    /// A callback claimed the attempt and is exchanging it with the provider.
    Completing,
    Completed,
    Failed,
}

impl ConnectionAttemptStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionAttemptStatus::Completed | ConnectionAttemptStatus::Failed
        )
    }
}

/// In-flight record of one open-banking consent/link flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionAttempt {
    pub id: AttemptId,
    pub psu_id: PsuId,
    pub connector_id: ConnectorId,
    pub created_at: DateTime<Utc>,
    pub status: ConnectionAttemptStatus,
    pub state: CallbackState,
    pub idempotency_key: Option<IdempotencyKey>,
    pub client_redirect_url: Option<String>,
    /// Set for attempts that refresh an existing connection.
    pub connection_id: Option<ConnectionId>,
    /// Provider-hosted consent URL handed back to the caller.
    pub link: Option<String>,
    pub temporary_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl ConnectionAttempt {
    pub fn new(
        psu_id: PsuId,
        connector_id: ConnectorId,
        idempotency_key: Option<IdempotencyKey>,
        client_redirect_url: Option<String>,
    ) -> Self {
        let id = AttemptId::new();
        Self {
            id,
            psu_id,
            connector_id,
            created_at: Utc::now(),
            status: ConnectionAttemptStatus::Pending,
            state: CallbackState::new(id),
            idempotency_key,
            client_redirect_url,
            connection_id: None,
            link: None,
            temporary_token: None,
            expires_at: None,
            error: None,
        }
    }

    pub fn for_connection(mut self, connection_id: ConnectionId) -> Self {
        self.connection_id = Some(connection_id);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Whether a request with `key` for this PSU and connector refers to this attempt.
    pub fn matches_key(&self, psu_id: PsuId, connector_id: &ConnectorId, key: IdempotencyKey) -> bool {
        self.idempotency_key == Some(key) && self.psu_id == psu_id && &self.connector_id == connector_id
    }

    /// Take over completion of a pending attempt. Returns false if another
    /// callback already did, or the attempt is finished.
    pub fn claim(&mut self) -> bool {
        if self.status != ConnectionAttemptStatus::Pending {
            return false;
        }
        self.status = ConnectionAttemptStatus::Completing;
        true
    }

    /// Move the attempt to a terminal state. One-way: a terminal attempt is never mutated.
    pub fn finish(&mut self, status: ConnectionAttemptStatus, error: Option<String>) -> DomainResult<()> {
        if self.is_terminal() {
            return Err(DomainError::conflict(format!(
                "connection attempt {} is already {:?}",
                self.id, self.status
            )));
        }
        if !status.is_terminal() {
            return Err(DomainError::invariant("an attempt can only finish in a terminal state"));
        }
        self.status = status;
        self.error = error;
        Ok(())
    }
}

impl Entity for ConnectionAttempt {
    type Id = AttemptId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_attempt() -> ConnectionAttempt {
        ConnectionAttempt::new(
            PsuId::new(),
            ConnectorId::new("bank-bridge"),
            Some(IdempotencyKey::new()),
            Some("https://app.example/back".into()),
        )
    }

    #[test]
    fn callback_state_round_trips_through_its_wire_form() {
        let state = CallbackState::new(AttemptId::new());
        let encoded = state.encode().unwrap();
        assert!(!encoded.contains('='));

        let raw = URL_SAFE_NO_PAD.decode(&encoded).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(json["attemptID"], serde_json::json!(state.attempt_id.to_string()));

        assert_eq!(CallbackState::decode(&encoded).unwrap(), state);
    }

    #[test]
    fn malformed_callback_state_is_a_validation_error() {
        assert!(matches!(
            CallbackState::decode("%%%"),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn attempt_state_carries_its_id() {
        let attempt = test_attempt();
        assert_eq!(attempt.state.attempt_id, attempt.id);
        assert_eq!(attempt.status, ConnectionAttemptStatus::Pending);
    }

    #[test]
    fn attempt_finishes_once() {
        let mut attempt = test_attempt();
        attempt.finish(ConnectionAttemptStatus::Completed, None).unwrap();
        assert!(attempt.is_terminal());

        let err = attempt
            .finish(ConnectionAttemptStatus::Failed, Some("late".into()))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
        assert_eq!(attempt.status, ConnectionAttemptStatus::Completed);
        assert!(attempt.error.is_none());
    }

    #[test]
    fn attempt_cannot_finish_pending() {
        let mut attempt = test_attempt();
        assert!(attempt.finish(ConnectionAttemptStatus::Pending, None).is_err());
    }

    #[test]
    fn only_one_claim_per_attempt() {
        let mut attempt = test_attempt();
        assert!(attempt.claim());
        assert_eq!(attempt.status, ConnectionAttemptStatus::Completing);
        assert!(!attempt.is_terminal());
        assert!(!attempt.claim());

        attempt.finish(ConnectionAttemptStatus::Completed, None).unwrap();
        assert!(!attempt.claim());
        assert_eq!(attempt.status, ConnectionAttemptStatus::Completed);
    }

    #[test]
    fn bank_account_requires_an_account_identifier() {
        assert!(BankAccount::new("main").validate().is_err());
        assert!(BankAccount::new("main").with_iban("FR76...").validate().is_ok());
    }

    #[test]
    fn adding_a_bank_account_twice_is_a_no_op() {
        let mut psu = PaymentServiceUser::new("alice");
        let account = BankAccountId::new();
        psu.add_bank_account(account);
        psu.add_bank_account(account);
        assert_eq!(psu.bank_account_ids, vec![account]);
    }
}
