//! `flowbridge-payments` — the narrow interface to the payment gateway.
//!
//! The engine only sees the [`PaymentService`] trait: create a payment
//! request, subscribe to its confirmation, complete it after the run
//! finishes, check its status. Confirmation is an explicit per-run
//! notification channel rather than a bare callback, so startup recovery can
//! re-subscribe from persisted rows alone.

pub mod gateway;
pub mod mock;
pub mod service;

pub use gateway::{PaymentGatewayClient, PaymentGatewayConfig};
pub use mock::MockPaymentService;
pub use service::{
    ConfirmationOutcome, ConfirmationReceiver, PaymentError, PaymentService, PaymentStatus,
};
