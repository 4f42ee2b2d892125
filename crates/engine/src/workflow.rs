//! Bridge to the external workflow/scheduling runtime.
//!
//! The runtime owns the clock: it executes schedules, records instances and
//! polls providers. The engine only tells it what changed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use paybridge_core::{ConnectorId, PaymentInitiationId, PaymentInitiationReversalId, ScheduleId};

/// Something the runtime should react to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum WorkflowTrigger {
    /// Start the connector's schedules.
    ConnectorInstalled {
        connector_id: ConnectorId,
        schedules: Vec<ScheduleId>,
    },
    /// Stop everything running for the connector.
    ConnectorUninstalled { connector_id: ConnectorId },
    /// Restart the connector's schedules from scratch.
    ConnectorReset {
        connector_id: ConnectorId,
        schedules: Vec<ScheduleId>,
    },
    /// Run a schedule now, out of its normal cadence.
    RunSchedule { schedule_id: ScheduleId },
    /// The provider accepted the payment but has not settled it; poll it and
    /// report back through `apply_provider_status`.
    PollPaymentInitiation {
        payment_initiation_id: PaymentInitiationId,
        payment_reference: String,
    },
    /// Same as above for a reversal.
    PollReversal {
        reversal_id: PaymentInitiationReversalId,
        payment_reference: String,
    },
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("workflow runtime error: {0}")]
pub struct WorkflowError(pub String);

#[async_trait]
pub trait WorkflowRuntime: Send + Sync {
    async fn trigger(&self, trigger: WorkflowTrigger) -> Result<(), WorkflowError>;
}

/// Runtime for embedding the engine without a scheduler.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopWorkflowRuntime;

#[async_trait]
impl WorkflowRuntime for NoopWorkflowRuntime {
    async fn trigger(&self, trigger: WorkflowTrigger) -> Result<(), WorkflowError> {
        debug!(?trigger, "no workflow runtime configured, trigger dropped");
        Ok(())
    }
}

impl From<WorkflowError> for crate::error::EngineError {
    fn from(value: WorkflowError) -> Self {
        crate::error::EngineError::Internal(value.to_string())
    }
}
