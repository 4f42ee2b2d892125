//! Payment initiations and their append-only adjustment log.
//!
//! A payment initiation never carries a mutable status. Its business state is
//! always "the status of the most recent adjustment", see [`latest_adjustment`].

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::{DomainError, DomainResult};
use crate::id::{ConnectorId, PaymentInitiationId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentInitiationType {
    Transfer,
    Payout,
}

/// A request to move money.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentInitiation {
    pub id: PaymentInitiationId,
    pub connector_id: ConnectorId,
    pub reference: String,
    pub created_at: DateTime<Utc>,
    /// When the provider call may happen. Defaults to creation time.
    pub scheduled_at: DateTime<Utc>,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: PaymentInitiationType,
    pub source_account_id: Option<String>,
    pub destination_account_id: Option<String>,
    /// Amount in minor units of `asset` as requested at creation.
    pub amount: u64,
    pub asset: String,
    pub metadata: BTreeMap<String, String>,
}

impl PaymentInitiation {
    pub fn new(
        reference: impl Into<String>,
        connector_id: ConnectorId,
        kind: PaymentInitiationType,
        amount: u64,
        asset: impl Into<String>,
    ) -> Self {
        let reference = reference.into();
        let now = Utc::now();
        Self {
            id: PaymentInitiationId::new(reference.clone(), connector_id.clone()),
            connector_id,
            reference,
            created_at: now,
            scheduled_at: now,
            description: String::new(),
            kind,
            source_account_id: None,
            destination_account_id: None,
            amount,
            asset: asset.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_source_account(mut self, account: impl Into<String>) -> Self {
        self.source_account_id = Some(account.into());
        self
    }

    pub fn with_destination_account(mut self, account: impl Into<String>) -> Self {
        self.destination_account_id = Some(account.into());
        self
    }

    pub fn with_scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = at;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Shape checks done before anything is persisted.
    pub fn validate(&self) -> DomainResult<()> {
        if self.reference.trim().is_empty() {
            return Err(DomainError::validation("reference is required"));
        }
        if self.amount == 0 {
            return Err(DomainError::validation("amount must be positive"));
        }
        if self.asset.trim().is_empty() {
            return Err(DomainError::validation("asset is required"));
        }
        if self.destination_account_id.is_none() {
            return Err(DomainError::validation("destination account is required"));
        }
        if self.kind == PaymentInitiationType::Transfer && self.source_account_id.is_none() {
            return Err(DomainError::validation(
                "source account is required for a transfer",
            ));
        }
        if self.id != PaymentInitiationId::new(self.reference.clone(), self.connector_id.clone()) {
            return Err(DomainError::invalid_id(
                "payment initiation id does not match reference and connector",
            ));
        }
        Ok(())
    }

    pub fn is_scheduled_after(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at > now
    }

    /// Whether `other` asks for the same payment, ignoring when each was built.
    /// A resubmitted create is a replay only if this holds.
    pub fn same_request(&self, other: &PaymentInitiation) -> bool {
        self.id == other.id
            && self.kind == other.kind
            && self.amount == other.amount
            && self.asset == other.asset
            && self.source_account_id == other.source_account_id
            && self.destination_account_id == other.destination_account_id
            && self.description == other.description
            && self.metadata == other.metadata
    }
}

impl Entity for PaymentInitiation {
    type Id = PaymentInitiationId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Status carried by one adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdjustmentStatus {
    /// Created without validation, waiting for a manual approve/reject.
    WaitingForValidation,
    /// Validated and queued for the provider (possibly at a future time).
    ScheduledForProcessing,
    /// Submitted; the provider has not settled it yet.
    Processing,
    Processed,
    Failed,
    Rejected,
    ReverseProcessing,
    ReverseFailed,
    Reversed,
    /// Partially reversed; the adjustment carries the remaining amount.
    AmountAdjusted,
}

impl AdjustmentStatus {
    /// Whether the initiation has reached the provider (or is about to).
    /// Such initiations can no longer be deleted.
    pub fn is_submitted(self) -> bool {
        matches!(
            self,
            AdjustmentStatus::ScheduledForProcessing
                | AdjustmentStatus::Processing
                | AdjustmentStatus::Processed
                | AdjustmentStatus::ReverseProcessing
                | AdjustmentStatus::ReverseFailed
                | AdjustmentStatus::Reversed
                | AdjustmentStatus::AmountAdjusted
        )
    }

    pub fn is_reversible(self) -> bool {
        matches!(
            self,
            AdjustmentStatus::Processed | AdjustmentStatus::AmountAdjusted
        )
    }

    pub fn awaits_validation(self) -> bool {
        self == AdjustmentStatus::WaitingForValidation
    }

    pub fn is_retriable(self) -> bool {
        self == AdjustmentStatus::Failed
    }
}

/// Status reported by a provider for the payment it created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderPaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Cancelled,
    Expired,
}

impl ProviderPaymentStatus {
    pub fn adjustment_status(self) -> AdjustmentStatus {
        match self {
            ProviderPaymentStatus::Pending => AdjustmentStatus::Processing,
            ProviderPaymentStatus::Succeeded => AdjustmentStatus::Processed,
            ProviderPaymentStatus::Failed
            | ProviderPaymentStatus::Cancelled
            | ProviderPaymentStatus::Expired => AdjustmentStatus::Failed,
        }
    }
}

/// Identity of an adjustment. Replaying the same tuple is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaymentInitiationAdjustmentId {
    pub payment_initiation_id: PaymentInitiationId,
    pub created_at: DateTime<Utc>,
    pub status: AdjustmentStatus,
}

/// Immutable, timestamped status record attached to a payment initiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentInitiationAdjustment {
    pub id: PaymentInitiationAdjustmentId,
    pub created_at: DateTime<Utc>,
    pub status: AdjustmentStatus,
    /// Amount in force after this adjustment, when it changes or restates it.
    pub amount: Option<u64>,
    pub asset: Option<String>,
    pub error: Option<String>,
    /// Raw provider payload, kept verbatim.
    pub raw: Option<serde_json::Value>,
    pub metadata: BTreeMap<String, String>,
}

impl PaymentInitiationAdjustment {
    pub fn new(
        payment_initiation_id: PaymentInitiationId,
        status: AdjustmentStatus,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PaymentInitiationAdjustmentId {
                payment_initiation_id,
                created_at,
                status,
            },
            created_at,
            status,
            amount: None,
            asset: None,
            error: None,
            raw: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_amount(mut self, amount: u64, asset: impl Into<String>) -> Self {
        self.amount = Some(amount);
        self.asset = Some(asset.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = Some(raw);
        self
    }

    pub fn payment_initiation_id(&self) -> &PaymentInitiationId {
        &self.id.payment_initiation_id
    }
}

impl Entity for PaymentInitiationAdjustment {
    type Id = PaymentInitiationAdjustmentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// The most recent adjustment of a log kept in append order.
///
/// Ordered by `created_at`; among equal timestamps the later-appended one wins.
pub fn latest_adjustment(
    adjustments: &[PaymentInitiationAdjustment],
) -> Option<&PaymentInitiationAdjustment> {
    adjustments.iter().max_by_key(|a| a.created_at)
}

/// Timestamp for the next entry of a log whose latest entry is `previous`.
///
/// Strictly after `previous` so the log order never depends on clock resolution.
pub fn next_log_timestamp(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(prev) if prev >= now => prev + Duration::microseconds(1),
        _ => now,
    }
}

/// Link between a payment initiation and a payment the provider created for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedPayment {
    pub payment_initiation_id: PaymentInitiationId,
    pub payment_reference: String,
    pub created_at: DateTime<Utc>,
}

/// Read model: a payment initiation with its derived current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentInitiationView {
    pub initiation: PaymentInitiation,
    pub status: AdjustmentStatus,
    /// Amount currently in force (reduced by partial reversals).
    pub amount: u64,
    pub error: Option<String>,
}

impl PaymentInitiationView {
    /// Derive the view from the initiation and its adjustment log.
    pub fn derive(
        initiation: PaymentInitiation,
        adjustments: &[PaymentInitiationAdjustment],
    ) -> DomainResult<Self> {
        let last = latest_adjustment(adjustments).ok_or_else(|| {
            DomainError::invariant(format!(
                "payment initiation {} has no adjustment",
                initiation.reference
            ))
        })?;

        let amount = adjustments
            .iter()
            .filter(|a| a.amount.is_some())
            .max_by_key(|a| a.created_at)
            .and_then(|a| a.amount)
            .unwrap_or(initiation.amount);

        Ok(Self {
            status: last.status,
            error: last.error.clone(),
            amount,
            initiation,
        })
    }
}
