//! The payment service seam.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

use flowbridge_core::{PaymentSnapshot, RunId};
use flowbridge_upstream::UpstreamError;

/// Payment-side failure.
#[derive(Debug, Error)]
pub enum PaymentError {
    /// The gateway call itself failed (transport, HTTP status, retries spent).
    #[error("gateway request failed: {0}")]
    Request(#[from] UpstreamError),

    /// The gateway answered with a shape we cannot use.
    #[error("unexpected gateway response: {0}")]
    UnexpectedResponse(String),

    /// No payment is known under the given identifier.
    #[error("unknown payment: {0}")]
    UnknownPayment(String),
}

/// Status of a payment as reported by the gateway.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PaymentStatus {
    Pending,
    Confirmed,
    Failed,
    Expired,
}

impl PaymentStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "confirmed" | "fundslocked" | "funds_locked" => PaymentStatus::Confirmed,
            "failed" | "refused" | "error" => PaymentStatus::Failed,
            "expired" | "timedout" | "timed_out" => PaymentStatus::Expired,
            _ => PaymentStatus::Pending,
        }
    }
}

/// How a watched payment resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    Confirmed,
    Failed(String),
}

/// Receiver half of a payment's confirmation channel. Dropped senders (e.g.
/// on unsubscribe) surface as a receive error, not as a confirmation.
pub type ConfirmationReceiver = oneshot::Receiver<ConfirmationOutcome>;

/// Narrow interface to the payment gateway.
#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Create a payment request scoped to one run's inputs and purchaser.
    async fn create_payment_request(
        &self,
        purchaser_identifier: &str,
        inputs: &Value,
        run_id: RunId,
    ) -> Result<PaymentSnapshot, PaymentError>;

    /// Subscribe to the confirmation of a previously created payment.
    ///
    /// The returned channel resolves exactly once. Idempotent per run: a
    /// second subscription replaces the first.
    async fn subscribe_confirmation(
        &self,
        run_id: RunId,
        payment_id: &str,
    ) -> Result<ConfirmationReceiver, PaymentError>;

    /// Current gateway-side status of a payment.
    async fn check_status(&self, payment_id: &str) -> Result<PaymentStatus, PaymentError>;

    /// Settle the payment with the run's output. Called once per finished run.
    async fn complete_payment(
        &self,
        run_id: RunId,
        payment_id: &str,
        purchaser_identifier: &str,
        output: &Value,
    ) -> Result<(), PaymentError>;

    /// Stop watching a payment (terminal run or shutdown).
    fn unsubscribe(&self, run_id: RunId);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parsing_is_tolerant() {
        assert_eq!(PaymentStatus::parse("Confirmed"), PaymentStatus::Confirmed);
        assert_eq!(PaymentStatus::parse("FundsLocked"), PaymentStatus::Confirmed);
        assert_eq!(PaymentStatus::parse("failed"), PaymentStatus::Failed);
        assert_eq!(PaymentStatus::parse("expired"), PaymentStatus::Expired);
        assert_eq!(PaymentStatus::parse("anything"), PaymentStatus::Pending);
    }
}
