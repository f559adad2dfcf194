//! The run orchestrator: single writer for every flow run.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use flowbridge_core::{
    flow_key_from_path, resolve_deadline, FlowRun, FlowRunStatus, Network, RunId,
};
use flowbridge_payments::{ConfirmationOutcome, ConfirmationReceiver, PaymentService};
use flowbridge_storage::RunStore;
use flowbridge_upstream::{RunPhase, StatusDocument};

use crate::error::EngineError;
use crate::platform::FlowPlatform;

/// Fallback deadline when the payment reports none.
const DEFAULT_DEADLINE_HOURS: i64 = 24;

/// Drives a run from creation through payment, launch, polling and
/// settlement. Per-run mutation goes exclusively through this type.
pub struct RunOrchestrator {
    store: Arc<dyn RunStore>,
    platform: Arc<dyn FlowPlatform>,
    payments: Arc<dyn PaymentService>,
    network: Network,
}

impl RunOrchestrator {
    pub fn new(
        store: Arc<dyn RunStore>,
        platform: Arc<dyn FlowPlatform>,
        payments: Arc<dyn PaymentService>,
        network: Network,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            platform,
            payments,
            network,
        })
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Create a run: validate the flow, persist, request payment, derive the
    /// deadline and subscribe to the confirmation.
    ///
    /// On any failure past persistence the run is marked `Error` before the
    /// error surfaces: a run is never left pending payment without an active
    /// payment request behind it.
    pub async fn create_run(
        self: &Arc<Self>,
        flow_key: &str,
        inputs: Value,
        purchaser_identifier: &str,
    ) -> Result<FlowRun, EngineError> {
        let flow = self.platform.resolve_flow(flow_key).await?;

        let mut run = FlowRun::new(&flow.path, &flow.name, inputs);
        self.store.create(&run).await?;
        info!(run_id = %run.id, flow_key, "created flow run");

        let snapshot = match self
            .payments
            .create_payment_request(purchaser_identifier, &run.inputs, run.id)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.abort_creation(&mut run, format!("payment request failed: {}", e))
                    .await;
                return Err(e.into());
            }
        };

        let deadline = match snapshot.submit_result_by {
            Some(raw) => resolve_deadline(raw, Utc::now(), self.network),
            None => Utc::now() + ChronoDuration::hours(DEFAULT_DEADLINE_HOURS),
        };
        run.attach_payment(snapshot);
        run.extend_deadline(deadline);
        self.store.update(&run).await?;

        let payment_id = run
            .payment_id
            .clone()
            .unwrap_or_default();
        match self
            .payments
            .subscribe_confirmation(run.id, &payment_id)
            .await
        {
            Ok(receiver) => self.spawn_confirmation_waiter(run.id, receiver),
            Err(e) => {
                self.abort_creation(&mut run, format!("confirmation subscription failed: {}", e))
                    .await;
                return Err(e.into());
            }
        }

        debug!(run_id = %run.id, timeout_at = ?run.timeout_at, "run awaiting payment");
        Ok(run)
    }

    /// Transition a confirmed run and launch it upstream.
    ///
    /// Invoked by the confirmation waiter; tolerant of duplicate deliveries:
    /// anything past `PendingPayment` is left alone.
    pub async fn handle_payment_confirmed(&self, run_id: RunId) -> Result<(), EngineError> {
        let Some(mut run) = self.store.get(run_id).await? else {
            warn!(%run_id, "payment confirmed for unknown run");
            return Ok(());
        };

        if run.status != FlowRunStatus::PendingPayment {
            debug!(%run_id, status = %run.status, "ignoring duplicate payment confirmation");
            return Ok(());
        }

        run.mark_payment_confirmed()?;
        self.store.update(&run).await?;
        info!(%run_id, "payment confirmed");

        self.launch(&mut run).await
    }

    /// Start the flow upstream and record the platform's run id.
    async fn launch(&self, run: &mut FlowRun) -> Result<(), EngineError> {
        match self.platform.launch_flow(&run.flow_path, &run.inputs).await {
            Ok(outcome) => {
                run.mark_starting(outcome.run_id)?;
                self.store.update(run).await?;
                info!(
                    run_id = %run.id,
                    upstream_run_id = ?run.upstream_run_id,
                    "launched upstream"
                );
                Ok(())
            }
            Err(e) => {
                let message = format!("launch failed: {}", e);
                error!(run_id = %run.id, error = %e, "upstream launch failed");
                self.record_failure(run, message).await;
                Err(e.into())
            }
        }
    }

    /// One reconciliation tick for a run. Never propagates a panic-shaped
    /// failure to the caller's siblings: a failed tick records the error on
    /// the run itself and returns `Err` purely for the cycle accounting.
    pub async fn refresh(&self, run: &mut FlowRun) -> Result<(), EngineError> {
        if run.status.is_terminal() {
            return Ok(());
        }

        // Deadline first: a timed-out run is never queried again.
        if run.is_past_deadline(Utc::now()) {
            warn!(
                run_id = %run.id,
                timeout_at = ?run.timeout_at,
                "run exceeded its deadline"
            );
            run.mark_timed_out()?;
            self.store.update(run).await?;
            self.payments.unsubscribe(run.id);
            return Ok(());
        }

        // Not launched yet (awaiting payment): nothing to reconcile.
        if run.upstream_run_id.is_none() {
            return Ok(());
        }

        match self.reconcile(run).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let message = format!("refresh failed: {}", e);
                self.record_failure(run, message).await;
                Err(e)
            }
        }
    }

    async fn reconcile(&self, run: &mut FlowRun) -> Result<(), EngineError> {
        let Some(upstream_id) = run.upstream_run_id.clone() else {
            return Ok(());
        };
        let doc = self.platform.run_status(&run.flow_path, &upstream_id).await?;

        match doc.interpret() {
            RunPhase::Starting => Ok(()),
            RunPhase::Running => {
                if run.status == FlowRunStatus::Starting {
                    run.mark_running()?;
                    self.store.update(run).await?;
                    debug!(run_id = %run.id, "run is now running upstream");
                }
                Ok(())
            }
            RunPhase::Finished => self.finish(run, &upstream_id, &doc).await,
            RunPhase::Failed => self.fail_from_events(run, &upstream_id, &doc).await,
        }
    }

    async fn finish(
        &self,
        run: &mut FlowRun,
        upstream_id: &str,
        doc: &StatusDocument,
    ) -> Result<(), EngineError> {
        // Pull the event log alongside the result; losing the log is not
        // worth failing a finished run over.
        let mut result = doc.final_output();
        match self.platform.run_events(&run.flow_path, upstream_id).await {
            Ok(events_doc) => {
                run.append_events(events_doc.events());
                if result.is_none() {
                    result = events_doc.final_output();
                }
            }
            Err(e) => debug!(run_id = %run.id, error = %e, "event log fetch failed"),
        }

        let output = result.unwrap_or(Value::Null);
        run.mark_finished(output.clone())?;
        self.store.update(run).await?;
        info!(run_id = %run.id, "run finished");
        self.payments.unsubscribe(run.id);

        // Settlement is best-effort: the run succeeded either way, and a
        // failed completion can be retried operationally.
        match &run.payment {
            Some(snapshot) => {
                if let Err(e) = self
                    .payments
                    .complete_payment(
                        run.id,
                        &snapshot.payment_id,
                        &snapshot.purchaser_identifier,
                        &output,
                    )
                    .await
                {
                    error!(run_id = %run.id, error = %e, "payment completion failed");
                } else {
                    info!(run_id = %run.id, payment_id = %snapshot.payment_id, "payment settled");
                }
            }
            None => warn!(run_id = %run.id, "finished run has no payment snapshot to settle"),
        }

        Ok(())
    }

    async fn fail_from_events(
        &self,
        run: &mut FlowRun,
        upstream_id: &str,
        doc: &StatusDocument,
    ) -> Result<(), EngineError> {
        run.append_events(doc.events());
        if let Ok(events_doc) = self.platform.run_events(&run.flow_path, upstream_id).await {
            run.append_events(events_doc.events());
        }

        let message = run
            .last_error_event()
            .map(|e| match &e.body {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| "upstream reported failure".to_string());

        self.record_failure(run, message).await;
        Ok(())
    }

    /// Re-attach confirmation subscriptions after a restart.
    ///
    /// Runs whose flow no longer resolves, or that lost their payment
    /// snapshot, are marked `Error` rather than left silently unmonitored.
    pub async fn resume_monitoring(self: &Arc<Self>) -> Result<usize, EngineError> {
        let pending = self.store.list_pending_payment().await?;
        let mut resumed = 0usize;

        for mut run in pending {
            let flow_key = flow_key_from_path(&run.flow_path);
            if let Err(e) = self.platform.resolve_flow(&flow_key).await {
                warn!(run_id = %run.id, flow_key = %flow_key, error = %e, "flow no longer resolvable");
                self.record_failure(&mut run, format!("flow no longer available: {}", flow_key))
                    .await;
                continue;
            }

            let Some(payment_id) = run.payment_id.clone() else {
                self.record_failure(&mut run, "no payment request attached".to_string())
                    .await;
                continue;
            };

            match self.payments.subscribe_confirmation(run.id, &payment_id).await {
                Ok(receiver) => {
                    self.spawn_confirmation_waiter(run.id, receiver);
                    resumed += 1;
                }
                Err(e) => {
                    warn!(run_id = %run.id, error = %e, "failed to resume payment monitoring");
                }
            }
        }

        info!(resumed, "payment monitoring recovery completed");
        Ok(resumed)
    }

    fn spawn_confirmation_waiter(self: &Arc<Self>, run_id: RunId, receiver: ConfirmationReceiver) {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            match receiver.await {
                Ok(ConfirmationOutcome::Confirmed) => {
                    if let Err(e) = orchestrator.handle_payment_confirmed(run_id).await {
                        error!(%run_id, error = %e, "confirmed run failed to launch");
                    }
                }
                Ok(ConfirmationOutcome::Failed(reason)) => {
                    warn!(%run_id, reason = %reason, "payment did not confirm");
                    if let Ok(Some(mut run)) = orchestrator.store.get(run_id).await {
                        if !run.status.is_terminal() {
                            orchestrator
                                .record_failure(&mut run, format!("payment failed: {}", reason))
                                .await;
                        }
                    }
                }
                Err(_) => debug!(%run_id, "confirmation channel closed without an outcome"),
            }
        });
    }

    /// Mark a freshly created run failed when its payment setup fell apart.
    async fn abort_creation(&self, run: &mut FlowRun, message: String) {
        error!(run_id = %run.id, message = %message, "aborting run creation");
        self.record_failure(run, message).await;
    }

    /// Best-effort terminal failure: transition when legal, then persist.
    async fn record_failure(&self, run: &mut FlowRun, message: String) {
        if let Err(e) = run.mark_failed(message) {
            debug!(run_id = %run.id, error = %e, "run already terminal, not overwriting");
            return;
        }
        if let Err(e) = self.store.update(run).await {
            error!(run_id = %run.id, error = %e, "failed to persist run failure");
        }
        self.payments.unsubscribe(run.id);
    }
}
