//! Error taxonomy shared by every kdash crate.

use serde::{Deserialize, Serialize};

/// Errors suitable for transport over the wire and for matching by callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum KdashError {
    #[error("not_found: {0}")]
    NotFound(String),
    /// Watcher has not completed its initial sync yet. Retry after a backoff.
    #[error("not_ready: {0}")]
    NotReady(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    #[error("authentication_failed: {0}")]
    AuthenticationFailed(String),
    #[error("transport_unavailable: {0}")]
    TransportUnavailable(String),
    #[error("store_conflict: {0}")]
    StoreConflict(String),
    #[error("store_io: {0}")]
    StoreIo(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type KdashResult<T> = Result<T, KdashError>;

impl KdashError {
    /// Errors a caller may retry after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KdashError::NotReady(_) | KdashError::TransportUnavailable(_))
    }

    /// Authentication-class failure: the one class that triggers reauthentication.
    pub fn is_auth(&self) -> bool {
        matches!(self, KdashError::AuthenticationFailed(_))
    }

    /// Classify an untyped error coming from an external collaborator.
    ///
    /// Typed sources (kube errors, credential providers) are classified where they
    /// originate; this message heuristic is only the last resort for opaque errors.
    pub fn from_external(err: anyhow::Error) -> Self {
        let msg = format!("{:#}", err);
        if looks_like_auth_failure(&msg) {
            KdashError::AuthenticationFailed(msg)
        } else {
            KdashError::Internal(msg)
        }
    }
}

/// Substring heuristic for opaque upstream errors ("Unauthorized", "token expired").
pub fn looks_like_auth_failure(msg: &str) -> bool {
    msg.contains("Unauthorized") || msg.contains("unauthorized") || msg.contains("expired")
}

impl From<serde_json::Error> for KdashError {
    fn from(e: serde_json::Error) -> Self {
        KdashError::Validation(format!("json: {}", e))
    }
}
