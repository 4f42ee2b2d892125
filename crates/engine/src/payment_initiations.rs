//! Payment initiation state machine.
//!
//! The business state of an initiation is the status of its latest
//! adjustment; nothing here updates a status in place. Every transition is an
//! append to the adjustment log, and the transitions that must not race
//! (approve, reject, retry) are guarded appends evaluated atomically against
//! the latest adjustment.
//!
//! ```text
//! WaitingForValidation ──approve──▶ ScheduledForProcessing ──▶ Processing ──▶ Processed
//!        │                                   ▲                    │    │          │
//!      reject                              retry                  │    └─▶ Failed │
//!        ▼                                   └────────────────────┘               ▼
//!     Rejected                                            ReverseProcessing ─▶ Reversed
//!                                                                │          ─▶ AmountAdjusted
//!                                                                └─────────▶ ReverseFailed
//! ```

use chrono::Utc;
use tracing::{info, instrument, warn};

use paybridge_core::{
    AdjustmentStatus, ConnectorId, PaymentInitiation, PaymentInitiationAdjustment,
    PaymentInitiationId, PaymentInitiationReversal, PaymentInitiationReversalId,
    PaymentInitiationType, PaymentInitiationView, ProviderPaymentStatus, RelatedPayment,
    ReversalAdjustment, ReversalStatus, Task, TaskKind,
};
use paybridge_core::payment_initiation::{latest_adjustment, next_log_timestamp};

use crate::dispatcher::Operation;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::plugin::{PaymentInitiationRequest, PluginError, ProviderPayment, ReversalRequest};
use crate::storage::{Page, Pagination, StorageError};
use crate::workflow::WorkflowTrigger;

fn create_task_kind(kind: PaymentInitiationType) -> TaskKind {
    match kind {
        PaymentInitiationType::Transfer => TaskKind::CreateTransfer,
        PaymentInitiationType::Payout => TaskKind::CreatePayout,
    }
}

fn reverse_task_kind(kind: PaymentInitiationType) -> TaskKind {
    match kind {
        PaymentInitiationType::Transfer => TaskKind::ReverseTransfer,
        PaymentInitiationType::Payout => TaskKind::ReversePayout,
    }
}

fn provider_failure(reference: &str, status: ProviderPaymentStatus) -> EngineError {
    EngineError::Plugin(PluginError::Provider(format!(
        "payment {reference} reported {status:?} by provider"
    )))
}

impl Engine {
    /// Persist a new payment initiation.
    ///
    /// With `validated`, the initiation is scheduled for processing and sent to
    /// the connector in a task, which is returned. Without it, the initiation
    /// waits for [`Engine::payment_initiations_approve`] and no task exists.
    ///
    /// The capability check runs first either way, so an initiation the
    /// connector could never execute is not persisted.
    ///
    /// Creating the same initiation again (same reference and request) is a
    /// replay: it resolves to the task of the latest submission, creating and
    /// scheduling that task if an earlier call stopped before it did. The same
    /// reference with a different request is `DuplicateKeyValue`.
    #[instrument(skip_all, fields(reference = %initiation.reference, connector_id = %initiation.connector_id), err)]
    pub async fn payment_initiations_create(
        &self,
        initiation: PaymentInitiation,
        validated: bool,
        wait_result: bool,
    ) -> EngineResult<Option<Task>> {
        initiation.validate()?;
        self.dispatcher()
            .resolve(&initiation.connector_id, Operation::create_payment(initiation.kind))
            .await?;

        let status = if validated {
            AdjustmentStatus::ScheduledForProcessing
        } else {
            AdjustmentStatus::WaitingForValidation
        };
        let first = PaymentInitiationAdjustment::new(initiation.id.clone(), status, initiation.created_at);
        match self
            .storage()
            .payment_initiations_insert(initiation.clone(), first)
            .await
        {
            Ok(()) => {}
            Err(StorageError::DuplicateKeyValue(_)) => {
                return self.resume_payment_initiation(&initiation, wait_result).await;
            }
            Err(err) => return Err(err.into()),
        }
        info!(?status, "payment initiation created");

        if !validated {
            return Ok(None);
        }
        self.submit_payment(initiation, 0, wait_result).await.map(Some)
    }

    /// Approve an initiation waiting for validation and send it to the connector.
    #[instrument(skip_all, fields(payment_initiation = %id.reference), err)]
    pub async fn payment_initiations_approve(&self, id: &PaymentInitiationId, wait_result: bool) -> EngineResult<Task> {
        let initiation = self.payment_initiation(id).await?;
        self.dispatcher()
            .resolve(&initiation.connector_id, Operation::create_payment(initiation.kind))
            .await?;

        let approved = self
            .append_adjustment_if(id, AdjustmentStatus::ScheduledForProcessing, |status| {
                status.awaits_validation()
            })
            .await?;
        if !approved {
            return Err(EngineError::validation(format!(
                "payment initiation {} is not waiting for validation",
                id.reference
            )));
        }

        self.submit_payment(initiation, 0, wait_result).await
    }

    /// Reject an initiation waiting for validation. Never calls the connector.
    #[instrument(skip_all, fields(payment_initiation = %id.reference), err)]
    pub async fn payment_initiations_reject(&self, id: &PaymentInitiationId) -> EngineResult<()> {
        self.payment_initiation(id).await?;

        let rejected = self
            .append_adjustment_if(id, AdjustmentStatus::Rejected, |status| status.awaits_validation())
            .await?;
        if !rejected {
            return Err(EngineError::validation(format!(
                "payment initiation {} is not waiting for validation",
                id.reference
            )));
        }
        info!("payment initiation rejected");
        Ok(())
    }

    /// Send a failed initiation to the connector again.
    ///
    /// Each retry is a new submission with its own attempt number and task;
    /// the log keeps every previous attempt. Only one of several concurrent
    /// retries of the same failure wins, the others fail validation.
    #[instrument(skip_all, fields(payment_initiation = %id.reference), err)]
    pub async fn payment_initiations_retry(&self, id: &PaymentInitiationId, wait_result: bool) -> EngineResult<Task> {
        let initiation = self.payment_initiation(id).await?;
        self.dispatcher()
            .resolve(&initiation.connector_id, Operation::create_payment(initiation.kind))
            .await?;

        let attempt = self
            .storage()
            .adjustments_list(id)
            .await?
            .iter()
            .filter(|a| a.status == AdjustmentStatus::ScheduledForProcessing)
            .count() as u32;

        let scheduled = self
            .append_adjustment_if(id, AdjustmentStatus::ScheduledForProcessing, |status| {
                status.is_retriable()
            })
            .await?;
        if !scheduled {
            return Err(EngineError::validation(format!(
                "payment initiation {} is not in a retriable state",
                id.reference
            )));
        }

        self.submit_payment(initiation, attempt, wait_result).await
    }

    /// Delete an initiation that never reached the provider.
    #[instrument(skip_all, fields(payment_initiation = %id.reference), err)]
    pub async fn payment_initiations_delete(&self, id: &PaymentInitiationId) -> EngineResult<()> {
        let deleted = self
            .storage()
            .payment_initiations_delete_if(id, &|log| !log.iter().any(|a| a.status.is_submitted()))
            .await?;
        if !deleted {
            return Err(EngineError::validation(format!(
                "payment initiation {} was already submitted to the provider",
                id.reference
            )));
        }
        Ok(())
    }

    /// Record a provider status reported after submission (poller or webhook).
    #[instrument(skip_all, fields(payment_initiation = %id.reference), err)]
    pub async fn payment_initiations_apply_provider_status(
        &self,
        id: &PaymentInitiationId,
        payment: ProviderPayment,
    ) -> EngineResult<PaymentInitiationView> {
        self.payment_initiation(id).await?;
        self.record_provider_payment(id, &payment).await?;
        self.payment_initiations_get(id).await
    }

    /// The initiation with its derived status and amount.
    pub async fn payment_initiations_get(&self, id: &PaymentInitiationId) -> EngineResult<PaymentInitiationView> {
        let initiation = self.payment_initiation(id).await?;
        let adjustments = self.storage().adjustments_list(id).await?;
        Ok(PaymentInitiationView::derive(initiation, &adjustments)?)
    }

    pub async fn payment_initiations_list(
        &self,
        connector_id: Option<&ConnectorId>,
        pagination: Pagination,
    ) -> EngineResult<Page<PaymentInitiation>> {
        Ok(self
            .storage()
            .payment_initiations_list(connector_id, pagination)
            .await?)
    }

    pub async fn payment_initiation_adjustments_list(
        &self,
        id: &PaymentInitiationId,
    ) -> EngineResult<Vec<PaymentInitiationAdjustment>> {
        self.payment_initiation(id).await?;
        Ok(self.storage().adjustments_list(id).await?)
    }

    pub async fn payment_initiation_related_payments_list(
        &self,
        id: &PaymentInitiationId,
    ) -> EngineResult<Vec<RelatedPayment>> {
        self.payment_initiation(id).await?;
        Ok(self.storage().related_payments_list(id).await?)
    }

    /// Reverse (fully or partially) a processed initiation.
    ///
    /// The reversal is its own entity with its own log and task. It is stored
    /// together with a `ReverseProcessing` adjustment on the parent, atomically
    /// and only if the parent did not move since it was validated, so at most
    /// one reversal is in flight per initiation and none can exceed the amount
    /// still in force. Creating the same reversal again resolves to its task.
    #[instrument(skip_all, fields(reversal = %reversal.reference, payment_initiation = %reversal.payment_initiation_id.reference), err)]
    pub async fn payment_initiation_reversals_create(
        &self,
        reversal: PaymentInitiationReversal,
        wait_result: bool,
    ) -> EngineResult<Task> {
        if let Some(existing) = self.storage().reversals_get(&reversal.id).await? {
            return self.resume_reversal(existing, &reversal, wait_result).await;
        }

        let initiation = self.payment_initiation(&reversal.payment_initiation_id).await?;
        self.dispatcher()
            .resolve(&reversal.connector_id, Operation::reverse_payment(initiation.kind))
            .await?;

        loop {
            let log = self.storage().adjustments_list(&initiation.id).await?;
            let parent = PaymentInitiationView::derive(initiation.clone(), &log)?;
            reversal.validate_against(&parent)?;

            let seen = latest_adjustment(&log).map(|a| a.id.clone());
            let at = next_log_timestamp(latest_adjustment(&log).map(|a| a.created_at));
            let reservation =
                PaymentInitiationAdjustment::new(initiation.id.clone(), AdjustmentStatus::ReverseProcessing, at);
            let first = ReversalAdjustment::new(reversal.id.clone(), ReversalStatus::Processing, reversal.created_at);

            let reserved = self
                .storage()
                .reversals_insert_reserving(reversal.clone(), first, reservation, &|latest| {
                    latest.map(|a| &a.id) == seen.as_ref()
                })
                .await;
            match reserved {
                Ok(true) => break,
                Ok(false) => {
                    info!("payment initiation changed while reserving the reversal, revalidating");
                }
                Err(StorageError::DuplicateKeyValue(_)) => {
                    let existing = self.payment_initiation_reversals_get(&reversal.id).await?;
                    return self.resume_reversal(existing, &reversal, wait_result).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
        info!("reversal reserved");

        self.submit_reversal(reversal, initiation, wait_result).await
    }

    /// Record a provider status for a reversal reported after submission.
    #[instrument(skip_all, fields(reversal = %id.reference), err)]
    pub async fn payment_initiation_reversals_apply_provider_status(
        &self,
        id: &PaymentInitiationReversalId,
        payment: ProviderPayment,
    ) -> EngineResult<PaymentInitiationReversal> {
        let reversal = self.payment_initiation_reversals_get(id).await?;
        self.record_reversal_payment(&reversal, &payment).await?;
        Ok(reversal)
    }

    pub async fn payment_initiation_reversals_get(
        &self,
        id: &PaymentInitiationReversalId,
    ) -> EngineResult<PaymentInitiationReversal> {
        self.storage()
            .reversals_get(id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("reversal {}", id.reference)))
    }

    pub async fn payment_initiation_reversals_list(
        &self,
        id: &PaymentInitiationId,
    ) -> EngineResult<Vec<PaymentInitiationReversal>> {
        self.payment_initiation(id).await?;
        Ok(self.storage().reversals_list_for(id).await?)
    }

    pub async fn payment_initiation_reversal_adjustments_list(
        &self,
        id: &PaymentInitiationReversalId,
    ) -> EngineResult<Vec<ReversalAdjustment>> {
        self.payment_initiation_reversals_get(id).await?;
        Ok(self.storage().reversal_adjustments_list(id).await?)
    }

    async fn payment_initiation(&self, id: &PaymentInitiationId) -> EngineResult<PaymentInitiation> {
        self.storage()
            .payment_initiations_get(id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("payment initiation {}", id.reference)))
    }

    /// Resolve a repeated create to the submission already recorded for it.
    async fn resume_payment_initiation(
        &self,
        requested: &PaymentInitiation,
        wait_result: bool,
    ) -> EngineResult<Option<Task>> {
        let existing = self.payment_initiation(&requested.id).await?;
        if !existing.same_request(requested) {
            return Err(EngineError::DuplicateKeyValue(format!(
                "payment initiation {} already exists with a different request",
                requested.reference
            )));
        }

        let submissions = self
            .storage()
            .adjustments_list(&existing.id)
            .await?
            .iter()
            .filter(|a| a.status == AdjustmentStatus::ScheduledForProcessing)
            .count() as u32;
        if submissions == 0 {
            info!("payment initiation already created, not submitted");
            return Ok(None);
        }

        info!(attempt = submissions - 1, "payment initiation already created, resuming its task");
        self.submit_payment(existing, submissions - 1, wait_result)
            .await
            .map(Some)
    }

    /// Resolve a repeated reversal create to the reversal's task.
    async fn resume_reversal(
        &self,
        existing: PaymentInitiationReversal,
        requested: &PaymentInitiationReversal,
        wait_result: bool,
    ) -> EngineResult<Task> {
        if !existing.same_request(requested) {
            return Err(EngineError::DuplicateKeyValue(format!(
                "reversal {} already exists with a different request",
                requested.reference
            )));
        }
        let initiation = self.payment_initiation(&existing.payment_initiation_id).await?;
        info!(reversal = %existing.reference, "reversal already created, resuming its task");
        self.submit_reversal(existing, initiation, wait_result).await
    }

    async fn submit_reversal(
        &self,
        reversal: PaymentInitiationReversal,
        initiation: PaymentInitiation,
        wait_result: bool,
    ) -> EngineResult<Task> {
        let kind = reverse_task_kind(initiation.kind);
        let connector_id = reversal.connector_id.clone();
        let reversal_ref = reversal.id.to_string();

        let engine = self.clone();
        self.submit_task(
            kind,
            Some(connector_id),
            &[&reversal_ref],
            wait_result,
            Box::pin(async move { engine.run_reversal(reversal, initiation).await }),
        )
        .await
    }

    async fn submit_payment(
        &self,
        initiation: PaymentInitiation,
        attempt: u32,
        wait_result: bool,
    ) -> EngineResult<Task> {
        // A scheduled payment cannot be waited on.
        let wait_result = wait_result && !initiation.is_scheduled_after(Utc::now());
        let kind = create_task_kind(initiation.kind);
        let connector_id = initiation.connector_id.clone();
        let initiation_ref = initiation.id.to_string();

        let engine = self.clone();
        self.submit_task(
            kind,
            Some(connector_id),
            &[&attempt.to_string(), &initiation_ref],
            wait_result,
            Box::pin(async move { engine.run_payment(initiation, attempt).await }),
        )
        .await
    }

    async fn run_payment(&self, initiation: PaymentInitiation, attempt: u32) -> EngineResult<Option<String>> {
        let delay = initiation.scheduled_at - Utc::now();
        if let Ok(delay) = delay.to_std() {
            info!(?delay, "payment initiation scheduled, sleeping");
            tokio::time::sleep(delay).await;
        }

        let id = initiation.id.clone();
        match self.send_payment(initiation, attempt).await {
            Ok(payment) => {
                let status = self.record_provider_payment(&id, &payment).await?;
                if status == AdjustmentStatus::Failed {
                    return Err(provider_failure(&payment.reference, payment.status));
                }
                Ok(Some(payment.reference))
            }
            Err(err) => {
                warn!(payment_initiation = %id.reference, error = %err, "payment submission failed");
                let error = err.to_string();
                self.append_adjustment(&id, |at| {
                    PaymentInitiationAdjustment::new(id.clone(), AdjustmentStatus::Failed, at).with_error(error)
                })
                .await?;
                Err(err)
            }
        }
    }

    async fn send_payment(&self, initiation: PaymentInitiation, attempt: u32) -> EngineResult<ProviderPayment> {
        let loaded = self
            .dispatcher()
            .resolve(&initiation.connector_id, Operation::create_payment(initiation.kind))
            .await?;

        let id = initiation.id.clone();
        self.append_adjustment(&id, |at| {
            PaymentInitiationAdjustment::new(id.clone(), AdjustmentStatus::Processing, at)
        })
        .await?;

        let kind = initiation.kind;
        let request = PaymentInitiationRequest {
            payment_initiation: initiation,
            attempt,
        };
        let payment = match kind {
            PaymentInitiationType::Transfer => loaded.plugin.create_transfer(request).await?,
            PaymentInitiationType::Payout => loaded.plugin.create_payout(request).await?,
        };
        Ok(payment)
    }

    /// Append the adjustment matching a provider payment and link the payment.
    async fn record_provider_payment(
        &self,
        id: &PaymentInitiationId,
        payment: &ProviderPayment,
    ) -> EngineResult<AdjustmentStatus> {
        self.storage()
            .related_payments_upsert(RelatedPayment {
                payment_initiation_id: id.clone(),
                payment_reference: payment.reference.clone(),
                created_at: Utc::now(),
            })
            .await?;

        let status = payment.status.adjustment_status();
        self.append_adjustment(id, |at| {
            let adjustment = PaymentInitiationAdjustment::new(id.clone(), status, at)
                .with_amount(payment.amount, payment.asset.clone())
                .with_raw(payment.raw.clone());
            if status == AdjustmentStatus::Failed {
                adjustment.with_error(format!("provider reported {:?}", payment.status))
            } else {
                adjustment
            }
        })
        .await?;

        if status == AdjustmentStatus::Processing {
            self.trigger(WorkflowTrigger::PollPaymentInitiation {
                payment_initiation_id: id.clone(),
                payment_reference: payment.reference.clone(),
            })
            .await?;
        }
        info!(payment_initiation = %id.reference, ?status, "provider status recorded");
        Ok(status)
    }

    async fn run_reversal(
        &self,
        reversal: PaymentInitiationReversal,
        initiation: PaymentInitiation,
    ) -> EngineResult<Option<String>> {
        // The parent was moved to ReverseProcessing when the reversal was stored.
        let log = self.storage().reversal_adjustments_list(&reversal.id).await?;
        if let Some(settled) = log.iter().map(|a| a.status).find(|s| *s != ReversalStatus::Processing) {
            info!(reversal = %reversal.reference, ?settled, "reversal already settled, not sent");
            return Ok(None);
        }

        match self.send_reversal(&reversal, initiation).await {
            Ok(payment) => {
                let status = self.record_reversal_payment(&reversal, &payment).await?;
                if status == Some(ReversalStatus::Failed) {
                    return Err(provider_failure(&payment.reference, payment.status));
                }
                Ok(Some(payment.reference))
            }
            Err(err) => {
                warn!(reversal = %reversal.reference, error = %err, "reversal submission failed");
                self.fail_reversal(&reversal, err.to_string(), None).await?;
                Err(err)
            }
        }
    }

    async fn send_reversal(
        &self,
        reversal: &PaymentInitiationReversal,
        initiation: PaymentInitiation,
    ) -> EngineResult<ProviderPayment> {
        let kind = initiation.kind;
        let loaded = self
            .dispatcher()
            .resolve(&reversal.connector_id, Operation::reverse_payment(kind))
            .await?;

        let request = ReversalRequest {
            reversal: reversal.clone(),
            payment_initiation: initiation,
        };
        let payment = match kind {
            PaymentInitiationType::Transfer => loaded.plugin.reverse_transfer(request).await?,
            PaymentInitiationType::Payout => loaded.plugin.reverse_payout(request).await?,
        };
        Ok(payment)
    }

    /// Apply a provider result to a reversal and its parent. Returns the
    /// reversal status it settled on, or `None` while the provider is pending.
    async fn record_reversal_payment(
        &self,
        reversal: &PaymentInitiationReversal,
        payment: &ProviderPayment,
    ) -> EngineResult<Option<ReversalStatus>> {
        let log = self.storage().reversal_adjustments_list(&reversal.id).await?;
        if let Some(settled) = log.iter().map(|a| a.status).find(|s| *s != ReversalStatus::Processing) {
            info!(reversal = %reversal.reference, ?settled, "reversal already settled");
            return Ok(Some(settled));
        }

        match payment.status {
            ProviderPaymentStatus::Pending => {
                self.trigger(WorkflowTrigger::PollReversal {
                    reversal_id: reversal.id.clone(),
                    payment_reference: payment.reference.clone(),
                })
                .await?;
                Ok(None)
            }
            ProviderPaymentStatus::Succeeded => {
                let parent = self.payment_initiations_get(&reversal.payment_initiation_id).await?;
                let (parent_status, remaining) = reversal.parent_status_on_success(parent.amount);

                self.append_reversal_adjustment(reversal, |at| {
                    ReversalAdjustment::new(reversal.id.clone(), ReversalStatus::Processed, at)
                        .with_raw(payment.raw.clone())
                })
                .await?;

                let parent_id = &reversal.payment_initiation_id;
                self.append_adjustment(parent_id, |at| {
                    PaymentInitiationAdjustment::new(parent_id.clone(), parent_status, at)
                        .with_amount(remaining, parent.initiation.asset.clone())
                        .with_raw(payment.raw.clone())
                })
                .await?;
                info!(reversal = %reversal.reference, ?parent_status, remaining, "reversal processed");
                Ok(Some(ReversalStatus::Processed))
            }
            status => {
                self.fail_reversal(
                    reversal,
                    format!("provider reported {status:?}"),
                    Some(payment.raw.clone()),
                )
                .await?;
                Ok(Some(ReversalStatus::Failed))
            }
        }
    }

    async fn fail_reversal(
        &self,
        reversal: &PaymentInitiationReversal,
        error: String,
        raw: Option<serde_json::Value>,
    ) -> EngineResult<()> {
        self.append_reversal_adjustment(reversal, |at| {
            let adjustment =
                ReversalAdjustment::new(reversal.id.clone(), ReversalStatus::Failed, at).with_error(error.clone());
            match raw {
                Some(raw) => adjustment.with_raw(raw),
                None => adjustment,
            }
        })
        .await?;

        let parent_id = &reversal.payment_initiation_id;
        self.append_adjustment(parent_id, |at| {
            PaymentInitiationAdjustment::new(parent_id.clone(), AdjustmentStatus::ReverseFailed, at)
                .with_error(error)
        })
        .await?;
        Ok(())
    }

    /// Append after the current latest adjustment. Replays are no-ops.
    async fn append_adjustment(
        &self,
        id: &PaymentInitiationId,
        build: impl FnOnce(chrono::DateTime<Utc>) -> PaymentInitiationAdjustment,
    ) -> EngineResult<()> {
        let last = self.storage().adjustments_last(id).await?;
        let at = next_log_timestamp(last.map(|a| a.created_at));
        if !self.storage().adjustments_upsert(build(at)).await? {
            info!(payment_initiation = %id.reference, "adjustment already recorded");
        }
        Ok(())
    }

    /// Append `status` only if `guard` accepts the latest status, atomically.
    async fn append_adjustment_if(
        &self,
        id: &PaymentInitiationId,
        status: AdjustmentStatus,
        guard: impl Fn(AdjustmentStatus) -> bool + Send + Sync,
    ) -> EngineResult<bool> {
        let last = self.storage().adjustments_last(id).await?;
        let at = next_log_timestamp(last.map(|a| a.created_at));
        let adjustment = PaymentInitiationAdjustment::new(id.clone(), status, at);
        Ok(self
            .storage()
            .adjustments_insert_if(adjustment, &|latest| latest.is_some_and(|a| guard(a.status)))
            .await?)
    }

    async fn append_reversal_adjustment(
        &self,
        reversal: &PaymentInitiationReversal,
        build: impl FnOnce(chrono::DateTime<Utc>) -> ReversalAdjustment,
    ) -> EngineResult<()> {
        let log = self.storage().reversal_adjustments_list(&reversal.id).await?;
        let at = next_log_timestamp(log.iter().map(|a| a.created_at).max());
        self.storage().reversal_adjustments_upsert(build(at)).await?;
        Ok(())
    }
}
