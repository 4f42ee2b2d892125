//! Engine error taxonomy.
//!
//! The dispatcher and state machines return [`EngineError`]. Adapters map
//! errors to stable external codes through [`EngineError::kind`] and never
//! surface raw provider text for internal failures.

use thiserror::Error;

use paybridge_core::{Capability, ConnectorId, DomainError};

use crate::plugin::PluginError;
use crate::storage::StorageError;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// An entity is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// The connector is not installed, or is scheduled for deletion.
    #[error("connector not found: {0}")]
    ConnectorNotFound(ConnectorId),

    /// Malformed input or a business-rule violation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Idempotent-create collision.
    #[error("duplicate key value: {0}")]
    DuplicateKeyValue(String),

    /// The connector cannot perform the requested operation.
    #[error("connector capability not supported: {capability} for provider {provider}")]
    CapabilityNotSupported {
        capability: Capability,
        provider: String,
    },

    /// A provider call failed.
    #[error("plugin error: {0}")]
    Plugin(#[from] PluginError),

    /// Anything unexpected.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Stable error classes exposed at the engine boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Validation,
    DuplicateKeyValue,
    CapabilityNotSupported,
    Internal,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::DuplicateKeyValue => "CONFLICT",
            ErrorKind::CapabilityNotSupported => "CONNECTOR_CAPABILITY_NOT_SUPPORTED",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

impl EngineError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound(_) | EngineError::ConnectorNotFound(_) => ErrorKind::NotFound,
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::DuplicateKeyValue(_) => ErrorKind::DuplicateKeyValue,
            EngineError::CapabilityNotSupported { .. } => ErrorKind::CapabilityNotSupported,
            EngineError::Plugin(PluginError::InvalidRequest(_)) => ErrorKind::Validation,
            EngineError::Plugin(_) | EngineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Message safe to return to callers. Internal failures stay in logs.
    pub fn public_message(&self) -> String {
        match self.kind() {
            ErrorKind::Internal => "internal error".to_string(),
            _ => self.to_string(),
        }
    }
}

impl From<DomainError> for EngineError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => EngineError::Validation(msg),
            DomainError::InvalidId(msg) => EngineError::Validation(msg),
            DomainError::NotFound(what) => EngineError::NotFound(what),
            DomainError::Conflict(msg) => EngineError::DuplicateKeyValue(msg),
            DomainError::InvariantViolation(msg) => EngineError::Internal(msg),
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(what) => EngineError::NotFound(what),
            StorageError::DuplicateKeyValue(what) => EngineError::DuplicateKeyValue(what),
            StorageError::Backend(msg) => EngineError::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_codes() {
        let err = EngineError::CapabilityNotSupported {
            capability: Capability::CreatePayout,
            provider: "psp-1".into(),
        };
        assert_eq!(err.kind().code(), "CONNECTOR_CAPABILITY_NOT_SUPPORTED");
        assert_eq!(
            err.to_string(),
            "connector capability not supported: CREATE_PAYOUT for provider psp-1"
        );

        let err = EngineError::ConnectorNotFound(ConnectorId::new("psp-1"));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn provider_text_is_not_leaked_for_internal_errors() {
        let err = EngineError::from(PluginError::Provider("upstream 500: secret".into()));
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.public_message(), "internal error");

        let err = EngineError::from(PluginError::InvalidRequest("bad iban".into()));
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.public_message().contains("bad iban"));
    }

    #[test]
    fn domain_errors_map_to_boundary_classes() {
        assert_eq!(
            EngineError::from(DomainError::conflict("x")).kind(),
            ErrorKind::DuplicateKeyValue
        );
        assert_eq!(
            EngineError::from(DomainError::invalid_id("x")).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            EngineError::from(StorageError::Backend("db".into())).kind(),
            ErrorKind::Internal
        );
    }
}
