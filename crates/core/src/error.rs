//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// invariants, illegal transitions). Infrastructure concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested flow is not known to the catalog.
    #[error("unknown flow: {0}")]
    UnknownFlow(String),

    /// A status transition that the run lifecycle does not allow.
    #[error("illegal transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    /// A requested resource was not found (domain-level).
    #[error("not found")]
    NotFound,
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn unknown_flow(key: impl Into<String>) -> Self {
        Self::UnknownFlow(key.into())
    }

    pub fn illegal_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::IllegalTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}
