//! Upstream client error model.

use thiserror::Error;

/// Failure talking to the upstream platform.
#[derive(Debug, Error, Clone)]
pub enum UpstreamError {
    /// Login failed or the platform rejected our credential.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The platform answered with a non-success status.
    #[error("upstream returned {status}: {body}")]
    Status {
        status: u16,
        body: String,
        /// Server-provided `Retry-After` seconds, when present on a 429.
        retry_after: Option<u64>,
    },

    /// The request never produced a response (timeout, connect failure).
    #[error("transport error: {0}")]
    Transport(String),

    /// Flow launch was rejected by upstream validation.
    #[error("launch rejected: {0}")]
    LaunchRejected(String),

    /// The response parsed but did not have the expected shape.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Session persistence failed.
    #[error("session store: {0}")]
    Store(String),
}

impl UpstreamError {
    /// Errors the request executor should retry with backoff.
    pub fn is_retriable(&self) -> bool {
        match self {
            UpstreamError::Transport(_) => true,
            UpstreamError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Failures that in practice indicate a dead or invalidated session:
    /// explicit auth rejections, transport-level failures, and persistent
    /// server errors. These get one fresh-login retry at the session layer.
    pub fn is_session_suspect(&self) -> bool {
        match self {
            UpstreamError::Auth(_) => true,
            UpstreamError::Transport(_) => true,
            UpstreamError::Status { status, .. } => {
                matches!(status, 401 | 403) || *status >= 500
            }
            _ => false,
        }
    }

    /// Seconds the server asked us to wait, when it did.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            UpstreamError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<flowbridge_storage::StoreError> for UpstreamError {
    fn from(e: flowbridge_storage::StoreError) -> Self {
        UpstreamError::Store(e.to_string())
    }
}
