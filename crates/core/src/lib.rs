//! `paybridge-core`: payments orchestration domain model.
//!
//! This crate contains **pure domain** types and state rules (no I/O). The
//! engine crate drives them against connectors and storage.

pub mod connector;
pub mod entity;
pub mod error;
pub mod id;
pub mod payment_initiation;
pub mod psu;
pub mod reversal;
pub mod schedule;
pub mod task;

pub use connector::{Capability, CapabilitySet, Connector};
pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{
    AttemptId, BankAccountId, ConnectionId, ConnectorId, IdempotencyKey, InstanceId,
    PaymentInitiationId, PaymentInitiationReversalId, PsuId, ScheduleId, TaskId,
};
pub use payment_initiation::{
    AdjustmentStatus, PaymentInitiation, PaymentInitiationAdjustment,
    PaymentInitiationAdjustmentId, PaymentInitiationType, PaymentInitiationView,
    ProviderPaymentStatus, RelatedPayment,
};
pub use psu::{
    BankAccount, BankAccountRelatedAccount, CallbackState, Connection, ConnectionAttempt,
    ConnectionAttemptStatus, ConnectionKey, ConnectionStatus, ContactDetails, ForwardedUser,
    PaymentServiceUser,
};
pub use reversal::{PaymentInitiationReversal, ReversalAdjustment, ReversalAdjustmentId, ReversalStatus};
pub use schedule::{Instance, Schedule};
pub use task::{Task, TaskKind, TaskOutcome, TaskStatus};
