//! Reversals of processed payment initiations.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::{DomainError, DomainResult};
use crate::id::{ConnectorId, PaymentInitiationId, PaymentInitiationReversalId};
use crate::payment_initiation::{AdjustmentStatus, PaymentInitiationView};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentInitiationReversal {
    pub id: PaymentInitiationReversalId,
    pub connector_id: ConnectorId,
    pub payment_initiation_id: PaymentInitiationId,
    pub reference: String,
    pub created_at: DateTime<Utc>,
    pub description: String,
    pub amount: u64,
    pub asset: String,
    pub metadata: BTreeMap<String, String>,
}

impl PaymentInitiationReversal {
    pub fn new(
        reference: impl Into<String>,
        payment_initiation_id: PaymentInitiationId,
        amount: u64,
        asset: impl Into<String>,
    ) -> Self {
        let reference = reference.into();
        let connector_id = payment_initiation_id.connector_id.clone();
        Self {
            id: PaymentInitiationReversalId::new(reference.clone(), connector_id.clone()),
            connector_id,
            payment_initiation_id,
            reference,
            created_at: Utc::now(),
            description: String::new(),
            amount,
            asset: asset.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Check the reversal against the current state of its parent.
    ///
    /// Only processed (or already partially reversed) initiations can be
    /// reversed, for at most the amount still in force, in the same asset.
    pub fn validate_against(&self, parent: &PaymentInitiationView) -> DomainResult<()> {
        if self.reference.trim().is_empty() {
            return Err(DomainError::validation("reversal reference is required"));
        }
        if self.amount == 0 {
            return Err(DomainError::validation("reversal amount must be positive"));
        }
        if !parent.status.is_reversible() {
            return Err(DomainError::validation(format!(
                "payment initiation {} cannot be reversed while {:?}",
                parent.initiation.reference, parent.status
            )));
        }
        if self.asset != parent.initiation.asset {
            return Err(DomainError::validation(format!(
                "reversal asset {} does not match {}",
                self.asset, parent.initiation.asset
            )));
        }
        if self.amount > parent.amount {
            return Err(DomainError::validation(format!(
                "reversal amount {} exceeds remaining amount {}",
                self.amount, parent.amount
            )));
        }
        Ok(())
    }

    /// Whether `other` asks for the same reversal, ignoring when each was built.
    pub fn same_request(&self, other: &PaymentInitiationReversal) -> bool {
        self.id == other.id
            && self.payment_initiation_id == other.payment_initiation_id
            && self.amount == other.amount
            && self.asset == other.asset
    }

    /// Status the parent ends in once this reversal succeeded.
    pub fn parent_status_on_success(&self, remaining_before: u64) -> (AdjustmentStatus, u64) {
        let remaining = remaining_before.saturating_sub(self.amount);
        if remaining == 0 {
            (AdjustmentStatus::Reversed, 0)
        } else {
            (AdjustmentStatus::AmountAdjusted, remaining)
        }
    }
}

impl Entity for PaymentInitiationReversal {
    type Id = PaymentInitiationReversalId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReversalStatus {
    Processing,
    Processed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReversalAdjustmentId {
    pub reversal_id: PaymentInitiationReversalId,
    pub created_at: DateTime<Utc>,
    pub status: ReversalStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReversalAdjustment {
    pub id: ReversalAdjustmentId,
    pub created_at: DateTime<Utc>,
    pub status: ReversalStatus,
    pub error: Option<String>,
    pub raw: Option<serde_json::Value>,
}

impl ReversalAdjustment {
    pub fn new(
        reversal_id: PaymentInitiationReversalId,
        status: ReversalStatus,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ReversalAdjustmentId {
                reversal_id,
                created_at,
                status,
            },
            created_at,
            status,
            error: None,
            raw: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = Some(raw);
        self
    }
}

impl Entity for ReversalAdjustment {
    type Id = ReversalAdjustmentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
