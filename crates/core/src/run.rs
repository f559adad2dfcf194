//! The flow run entity and its lifecycle.
//!
//! A `FlowRun` is one requested execution of an upstream flow, gated by a
//! payment. It is mutated by a single writer (the orchestrator); every
//! state change goes through the checked `mark_*` methods so the lifecycle
//! invariants hold at the type level:
//!
//! - at most one of `result` / `error_message` is set, ever;
//! - `timeout_at`, once set, never moves earlier;
//! - `upstream_run_id` is present exactly from `Starting` onwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DomainError, DomainResult};
use crate::id::RunId;

/// Lifecycle state of a flow run.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowRunStatus {
    /// Created; waiting for the payment to be confirmed on-chain.
    PendingPayment,
    /// Payment confirmed; launch on the upstream platform is imminent.
    PaymentConfirmed,
    /// Launched upstream; the platform has not reported progress yet.
    Starting,
    /// The upstream platform reports the run as executing.
    Running,
    /// Terminal: finished with a result.
    Finished,
    /// Terminal: failed, locally or upstream.
    Error,
    /// Terminal: cancelled before completion.
    Cancelled,
    /// Terminal: the submit-result deadline passed before completion.
    TimedOut,
}

impl FlowRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowRunStatus::Finished
                | FlowRunStatus::Error
                | FlowRunStatus::Cancelled
                | FlowRunStatus::TimedOut
        )
    }

    /// Statuses the polling scheduler drives. `PaymentConfirmed` is absent:
    /// it is a momentary state handled inline by the confirmation path.
    pub fn is_pollable(&self) -> bool {
        matches!(
            self,
            FlowRunStatus::PendingPayment | FlowRunStatus::Starting | FlowRunStatus::Running
        )
    }

    fn can_transition_to(&self, to: FlowRunStatus) -> bool {
        use FlowRunStatus::*;
        match (self, to) {
            (PendingPayment, PaymentConfirmed) => true,
            (PaymentConfirmed, Starting) => true,
            (Starting, Running) => true,
            (Starting | Running, Finished) => true,
            // Any non-terminal state may fail, time out, or be cancelled.
            (from, Error | TimedOut | Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl core::fmt::Display for FlowRunStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            FlowRunStatus::PendingPayment => "pending_payment",
            FlowRunStatus::PaymentConfirmed => "payment_confirmed",
            FlowRunStatus::Starting => "starting",
            FlowRunStatus::Running => "running",
            FlowRunStatus::Finished => "finished",
            FlowRunStatus::Error => "error",
            FlowRunStatus::Cancelled => "cancelled",
            FlowRunStatus::TimedOut => "timed_out",
        };
        write!(f, "{}", s)
    }
}

/// One amount the purchaser locked for this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentAmount {
    pub amount: u64,
    pub unit: String,
}

/// Snapshot of the payment request, kept verbatim so settlement never has to
/// re-derive anything from the gateway.
///
/// The deadline fields are stored raw; their unit is resolved separately
/// (see [`crate::deadline`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSnapshot {
    /// The gateway's blockchain identifier for this payment.
    pub payment_id: String,
    /// Identifier the purchaser supplied when requesting the run.
    pub purchaser_identifier: String,
    /// Hash of the inputs as computed by the gateway.
    #[serde(default)]
    pub input_hash: Option<String>,
    pub amounts: Vec<PaymentAmount>,
    /// Raw "pay by" deadline as reported by the gateway.
    #[serde(default)]
    pub pay_by: Option<i64>,
    /// Raw "submit result by" deadline; the run's `timeout_at` derives from it.
    #[serde(default)]
    pub submit_result_by: Option<i64>,
    /// Raw fund-unlock deadline.
    #[serde(default)]
    pub unlock_at: Option<i64>,
}

/// An upstream-reported status fragment, kept for diagnostics.
///
/// The log is append-once: fragments already recorded are never rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEvent {
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Upstream event kind, e.g. `"status"`, `"result"`, `"error"`.
    pub kind: String,
    pub body: Value,
}

impl RunEvent {
    pub fn is_error(&self) -> bool {
        self.kind.to_ascii_lowercase().contains("error")
    }
}

/// One requested execution of a flow, with its own payment and lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRun {
    pub id: RunId,
    /// Upstream path of the flow this run executes.
    pub flow_path: String,
    /// Human-readable flow name at creation time.
    pub flow_name: String,
    /// Caller-supplied inputs; immutable after creation.
    pub inputs: Value,
    pub status: FlowRunStatus,
    /// Identifier the upstream platform assigned at launch.
    pub upstream_run_id: Option<String>,
    /// The payment's blockchain identifier (mirror of the snapshot's).
    pub payment_id: Option<String>,
    pub payment: Option<PaymentSnapshot>,
    /// Output payload; set only on `Finished`.
    pub result: Option<Value>,
    pub events: Vec<RunEvent>,
    /// Set on `Error` and `TimedOut`.
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Past this instant the result can no longer be settled.
    pub timeout_at: Option<DateTime<Utc>>,
}

impl FlowRun {
    /// Create a run in `PendingPayment`.
    pub fn new(flow_path: impl Into<String>, flow_name: impl Into<String>, inputs: Value) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new(),
            flow_path: flow_path.into(),
            flow_name: flow_name.into(),
            inputs,
            status: FlowRunStatus::PendingPayment,
            upstream_run_id: None,
            payment_id: None,
            payment: None,
            result: None,
            events: Vec::new(),
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            timeout_at: None,
        }
    }

    /// Attach the payment snapshot created for this run.
    pub fn attach_payment(&mut self, snapshot: PaymentSnapshot) {
        self.payment_id = Some(snapshot.payment_id.clone());
        self.payment = Some(snapshot);
        self.touch();
    }

    /// Set or extend the submit-result deadline.
    ///
    /// A deadline never moves earlier: later updates only take effect when
    /// they push the deadline out.
    pub fn extend_deadline(&mut self, deadline: DateTime<Utc>) {
        match self.timeout_at {
            Some(current) if deadline <= current => {}
            _ => {
                self.timeout_at = Some(deadline);
                self.touch();
            }
        }
    }

    pub fn mark_payment_confirmed(&mut self) -> DomainResult<()> {
        self.transition(FlowRunStatus::PaymentConfirmed)
    }

    /// Record a successful upstream launch.
    pub fn mark_starting(&mut self, upstream_run_id: impl Into<String>) -> DomainResult<()> {
        self.transition(FlowRunStatus::Starting)?;
        self.upstream_run_id = Some(upstream_run_id.into());
        self.started_at = Some(self.updated_at);
        Ok(())
    }

    pub fn mark_running(&mut self) -> DomainResult<()> {
        self.transition(FlowRunStatus::Running)
    }

    pub fn mark_finished(&mut self, result: Value) -> DomainResult<()> {
        if self.error_message.is_some() {
            return Err(DomainError::invariant(
                "a run with an error message cannot finish",
            ));
        }
        self.transition(FlowRunStatus::Finished)?;
        self.result = Some(result);
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) -> DomainResult<()> {
        if self.result.is_some() {
            return Err(DomainError::invariant("a run with a result cannot fail"));
        }
        self.transition(FlowRunStatus::Error)?;
        self.error_message = Some(message.into());
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    pub fn mark_timed_out(&mut self) -> DomainResult<()> {
        if self.result.is_some() {
            return Err(DomainError::invariant("a run with a result cannot time out"));
        }
        self.transition(FlowRunStatus::TimedOut)?;
        self.error_message = Some("submit-result deadline exceeded".to_string());
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    pub fn mark_cancelled(&mut self) -> DomainResult<()> {
        self.transition(FlowRunStatus::Cancelled)
    }

    /// Append upstream fragments past the ones already recorded.
    ///
    /// The upstream platform returns the full log each time; only the tail
    /// beyond what this run has seen is appended, so recorded fragments are
    /// never rewritten.
    pub fn append_events(&mut self, full_log: Vec<RunEvent>) {
        if full_log.len() > self.events.len() {
            self.events.extend(full_log.into_iter().skip(self.events.len()));
            self.touch();
        }
    }

    /// Reverse-scan the event log for an error-kind fragment.
    pub fn last_error_event(&self) -> Option<&RunEvent> {
        self.events.iter().rev().find(|e| e.is_error())
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.timeout_at.is_some_and(|t| now > t)
    }

    fn transition(&mut self, to: FlowRunStatus) -> DomainResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(DomainError::illegal_transition(self.status, to));
        }
        self.status = to;
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
