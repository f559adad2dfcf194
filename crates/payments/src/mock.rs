//! Deterministic in-process payment service for tests and test mode.
//!
//! Mirrors the gateway's shapes: a synthesized snapshot with 12h/24h/48h
//! deadlines and an auto-confirmation after a configurable delay.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::info;

use flowbridge_core::{PaymentAmount, PaymentSnapshot, RunId};

use crate::service::{
    ConfirmationOutcome, ConfirmationReceiver, PaymentError, PaymentService, PaymentStatus,
};

/// A settlement call the mock observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPayment {
    pub run_id: RunId,
    pub payment_id: String,
    pub purchaser_identifier: String,
    pub output: String,
}

/// In-process [`PaymentService`]: payments auto-confirm after `confirm_delay`.
pub struct MockPaymentService {
    confirm_delay: Duration,
    statuses: Mutex<HashMap<String, PaymentStatus>>,
    completions: Mutex<Vec<CompletedPayment>>,
    /// When set, newly created payments fail instead of confirming.
    fail_confirmations: Mutex<bool>,
    /// When set, payment request creation itself fails.
    fail_creations: Mutex<bool>,
}

impl Default for MockPaymentService {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl MockPaymentService {
    pub fn new(confirm_delay: Duration) -> Self {
        info!("payment service running in test mode, payments will be simulated");
        Self {
            confirm_delay,
            statuses: Mutex::new(HashMap::new()),
            completions: Mutex::new(Vec::new()),
            fail_confirmations: Mutex::new(false),
            fail_creations: Mutex::new(false),
        }
    }

    /// Make subsequent confirmations fail (test hook).
    pub fn fail_confirmations(&self) {
        *self.fail_confirmations.lock().unwrap() = true;
    }

    /// Make payment request creation fail (test hook).
    pub fn fail_creations(&self) {
        *self.fail_creations.lock().unwrap() = true;
    }

    /// Settlement calls observed so far.
    pub fn completions(&self) -> Vec<CompletedPayment> {
        self.completions.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentService for MockPaymentService {
    async fn create_payment_request(
        &self,
        purchaser_identifier: &str,
        _inputs: &Value,
        run_id: RunId,
    ) -> Result<PaymentSnapshot, PaymentError> {
        if *self.fail_creations.lock().unwrap() {
            return Err(PaymentError::UnexpectedResponse(
                "simulated payment request failure".to_string(),
            ));
        }

        let now = Utc::now().timestamp();
        let payment_id = format!("test_block_{}", run_id.as_uuid().simple());

        self.statuses
            .lock()
            .unwrap()
            .insert(payment_id.clone(), PaymentStatus::Pending);

        Ok(PaymentSnapshot {
            payment_id,
            purchaser_identifier: purchaser_identifier.to_string(),
            input_hash: None,
            amounts: vec![PaymentAmount {
                amount: 3_000_000,
                unit: "lovelace".to_string(),
            }],
            pay_by: Some(now + 12 * 3600),
            submit_result_by: Some(now + 24 * 3600),
            unlock_at: Some(now + 48 * 3600),
        })
    }

    async fn subscribe_confirmation(
        &self,
        _run_id: RunId,
        payment_id: &str,
    ) -> Result<ConfirmationReceiver, PaymentError> {
        let (tx, rx) = oneshot::channel();
        let delay = self.confirm_delay;
        let fail = *self.fail_confirmations.lock().unwrap();
        let payment_id = payment_id.to_string();

        if !self.statuses.lock().unwrap().contains_key(&payment_id) {
            // Recovery path: a payment from a previous process life.
            self.statuses
                .lock()
                .unwrap()
                .insert(payment_id.clone(), PaymentStatus::Pending);
        }

        let outcome = if fail {
            ConfirmationOutcome::Failed("simulated payment failure".to_string())
        } else {
            ConfirmationOutcome::Confirmed
        };

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(outcome);
        });

        if !fail {
            self.statuses
                .lock()
                .unwrap()
                .insert(payment_id, PaymentStatus::Confirmed);
        }

        Ok(rx)
    }

    async fn check_status(&self, payment_id: &str) -> Result<PaymentStatus, PaymentError> {
        self.statuses
            .lock()
            .unwrap()
            .get(payment_id)
            .copied()
            .ok_or_else(|| PaymentError::UnknownPayment(payment_id.to_string()))
    }

    async fn complete_payment(
        &self,
        run_id: RunId,
        payment_id: &str,
        purchaser_identifier: &str,
        output: &Value,
    ) -> Result<(), PaymentError> {
        self.completions.lock().unwrap().push(CompletedPayment {
            run_id,
            payment_id: payment_id.to_string(),
            purchaser_identifier: purchaser_identifier.to_string(),
            output: output.to_string(),
        });
        Ok(())
    }

    fn unsubscribe(&self, _run_id: RunId) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn payments_auto_confirm_after_the_delay() {
        let service = MockPaymentService::new(Duration::from_secs(5));
        let run_id = RunId::new();

        let snapshot = service
            .create_payment_request("buyer-1", &json!({"q": "hi"}), run_id)
            .await
            .unwrap();
        assert!(snapshot.payment_id.starts_with("test_block_"));
        assert!(snapshot.submit_result_by.is_some());

        let rx = service
            .subscribe_confirmation(run_id, &snapshot.payment_id)
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap(), ConfirmationOutcome::Confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_mode_reports_failure() {
        let service = MockPaymentService::new(Duration::from_millis(10));
        service.fail_confirmations();
        let run_id = RunId::new();

        let snapshot = service
            .create_payment_request("buyer-1", &json!({}), run_id)
            .await
            .unwrap();
        let rx = service
            .subscribe_confirmation(run_id, &snapshot.payment_id)
            .await
            .unwrap();
        assert!(matches!(rx.await.unwrap(), ConfirmationOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn completions_are_recorded() {
        let service = MockPaymentService::new(Duration::ZERO);
        let run_id = RunId::new();
        service
            .complete_payment(run_id, "block_1", "buyer-1", &json!({"output": "42"}))
            .await
            .unwrap();

        let completions = service.completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].payment_id, "block_1");
    }
}
