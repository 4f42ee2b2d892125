//! Strongly-typed identifiers used across the domain.
//!
//! Three families:
//! - UUIDv7 newtypes for entities the engine mints itself (PSUs, attempts, bank accounts).
//! - Opaque string newtypes for identifiers handed to us by providers or the scheduler.
//! - Composite identifiers (connector, payment initiation, reversal, task). Their string
//!   form is URL-safe unpadded base64 of their JSON encoding, so they can travel in paths
//!   and query strings while staying deterministic for a given set of fields.

use core::fmt;
use core::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of a payment service user.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PsuId(Uuid);

/// Identifier of a PSU bank account.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BankAccountId(Uuid);

/// Identifier of an open-banking connection attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptId(Uuid);

/// Caller-supplied token deduplicating retried link-flow requests.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
            /// for determinism.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_uuid_newtype!(PsuId, "PsuId");
impl_uuid_newtype!(BankAccountId, "BankAccountId");
impl_uuid_newtype!(AttemptId, "AttemptId");
impl_uuid_newtype!(IdempotencyKey, "IdempotencyKey");

/// Provider-assigned identifier of a PSU bank-bridge connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

/// Identifier of a recurring workflow schedule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleId(String);

/// Identifier of one execution of a schedule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

macro_rules! impl_string_newtype {
    ($t:ty) => {
        impl $t {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $t {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $t {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

impl_string_newtype!(ConnectionId);
impl_string_newtype!(ScheduleId);
impl_string_newtype!(InstanceId);

/// Identity of an installed connector: the provider it talks to plus the
/// installation reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectorId {
    pub reference: Uuid,
    pub provider: String,
}

impl ConnectorId {
    /// Mint a new installation of `provider`.
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            reference: Uuid::now_v7(),
            provider: provider.into(),
        }
    }

    pub fn from_parts(reference: Uuid, provider: impl Into<String>) -> Self {
        Self {
            reference,
            provider: provider.into(),
        }
    }
}

/// Identity of a payment initiation: the caller's reference, scoped to a connector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PaymentInitiationId {
    pub reference: String,
    pub connector_id: ConnectorId,
}

impl PaymentInitiationId {
    pub fn new(reference: impl Into<String>, connector_id: ConnectorId) -> Self {
        Self {
            reference: reference.into(),
            connector_id,
        }
    }
}

/// Identity of a reversal. Lives in its own namespace so it can never collide
/// with the payment initiation it reverses, even when references match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PaymentInitiationReversalId {
    pub reference: String,
    pub connector_id: ConnectorId,
}

impl PaymentInitiationReversalId {
    pub fn new(reference: impl Into<String>, connector_id: ConnectorId) -> Self {
        Self {
            reference: reference.into(),
            connector_id,
        }
    }
}

/// Identity of a task: a deterministic reference, optionally scoped to the
/// connector that executes it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    pub reference: String,
    pub connector_id: Option<ConnectorId>,
}

impl TaskId {
    pub fn new(reference: impl Into<String>, connector_id: Option<ConnectorId>) -> Self {
        Self {
            reference: reference.into(),
            connector_id,
        }
    }
}

fn encode_id<T: Serialize>(value: &T, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let raw = serde_json::to_vec(value).map_err(|_| fmt::Error)?;
    f.write_str(&URL_SAFE_NO_PAD.encode(raw))
}

fn decode_id<T: for<'de> Deserialize<'de>>(s: &str, name: &str) -> Result<T, DomainError> {
    let raw = URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|e| DomainError::invalid_id(format!("{name}: {e}")))?;
    serde_json::from_slice(&raw).map_err(|e| DomainError::invalid_id(format!("{name}: {e}")))
}

macro_rules! impl_encoded_id {
    ($t:ty, $name:literal) => {
        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                encode_id(self, f)
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                decode_id(s, $name)
            }
        }
    };
}

impl_encoded_id!(ConnectorId, "ConnectorId");
impl_encoded_id!(PaymentInitiationId, "PaymentInitiationId");
impl_encoded_id!(PaymentInitiationReversalId, "PaymentInitiationReversalId");
impl_encoded_id!(TaskId, "TaskId");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_id_string_form_parses_back() {
        let id = ConnectorId::new("psp-1");
        let parsed: ConnectorId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!(!id.to_string().contains('='));
    }

    #[test]
    fn composite_ids_are_deterministic() {
        let connector = ConnectorId::from_parts(Uuid::nil(), "psp-1");
        let a = PaymentInitiationId::new("r1", connector.clone());
        let b = PaymentInitiationId::new("r1", connector.clone());
        assert_eq!(a.to_string(), b.to_string());

        let other = PaymentInitiationId::new("r2", connector);
        assert_ne!(a.to_string(), other.to_string());
    }

    #[test]
    fn task_id_without_connector_parses_back() {
        let id = TaskId::new("delete-user-local-abc", None);
        let parsed: TaskId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn garbage_is_an_invalid_id() {
        let err = "not base64!".parse::<ConnectorId>().unwrap_err();
        assert!(matches!(err, DomainError::InvalidId(msg) if msg.starts_with("ConnectorId")));

        let err = "bm90IGpzb24".parse::<TaskId>().unwrap_err();
        assert!(matches!(err, DomainError::InvalidId(_)));
    }

    #[test]
    fn uuid_newtypes_parse() {
        let psu = PsuId::new();
        assert_eq!(psu.to_string().parse::<PsuId>().unwrap(), psu);
        assert!("nope".parse::<AttemptId>().is_err());
    }
}
