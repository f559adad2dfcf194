//! `flowbridge-core` — domain foundation for payment-gated flow runs.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! run identity and lifecycle, flow descriptors, payment snapshots, and the
//! deadline-unit resolution used to derive run timeouts.

pub mod deadline;
pub mod error;
pub mod flow;
pub mod id;
pub mod run;
pub mod session;

pub use deadline::{resolve_deadline, Network};
pub use error::{DomainError, DomainResult};
pub use flow::{flow_key_from_path, FlowDescriptor};
pub use id::RunId;
pub use run::{FlowRun, FlowRunStatus, PaymentAmount, PaymentSnapshot, RunEvent};
pub use session::{Credential, StoredSession};
