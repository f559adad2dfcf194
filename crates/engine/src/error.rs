//! Engine error model.

use thiserror::Error;

use flowbridge_core::DomainError;
use flowbridge_payments::PaymentError;
use flowbridge_storage::StoreError;
use flowbridge_upstream::{CatalogError, UpstreamError};

/// Failure inside the orchestration core.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Payment(#[from] PaymentError),
}

impl From<CatalogError> for EngineError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::Upstream(e) => EngineError::Upstream(e),
            CatalogError::Domain(e) => EngineError::Domain(e),
        }
    }
}
