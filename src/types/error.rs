use anyhow::Error;
use thiserror::Error;

/// Closed error taxonomy shared by the providers, the sync engine, the
/// migrator, and the shunt. Providers map wire-level failures into these
/// kinds; the engines only dispatch on the kind.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpanError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("remote server error: status {0}")]
    Remote5xx(u16),
    #[error("remote client error: status {0}")]
    Remote4xxClient(u16),
    #[error("not found")]
    NotFound,
    #[error("remote holds a newer timestamp")]
    ConflictNewer,
    #[error("integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
    #[error("large object policy: {0}")]
    LargeObjectPolicy(String),
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("corrupt status entry: {0}")]
    StatusCorrupt(String),
    #[error("cancelled")]
    Cancelled,
}

impl SpanError {
    /// Short kind label used in `errors{kind}` counters.
    pub fn kind(&self) -> &'static str {
        match self {
            SpanError::TransientNetwork(_) => "transient_network",
            SpanError::Auth(_) => "auth",
            SpanError::Remote5xx(_) => "remote_5xx",
            SpanError::Remote4xxClient(_) => "remote_4xx_client",
            SpanError::NotFound => "not_found",
            SpanError::ConflictNewer => "conflict_newer",
            SpanError::IntegrityMismatch { .. } => "integrity",
            SpanError::LargeObjectPolicy(_) => "large_object_policy",
            SpanError::ConfigInvalid(_) => "config_invalid",
            SpanError::StatusCorrupt(_) => "status_corrupt",
            SpanError::Cancelled => "cancelled",
        }
    }

    /// Whether the row should be retried with backoff before giving up.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SpanError::TransientNetwork(_) | SpanError::Remote5xx(_)
        )
    }

    /// Map an HTTP status into the taxonomy.
    pub fn from_status(status: u16) -> Self {
        match status {
            404 => SpanError::NotFound,
            401 | 403 => SpanError::Auth(format!("status {status}")),
            409 => SpanError::ConflictNewer,
            400..=499 => SpanError::Remote4xxClient(status),
            _ => SpanError::Remote5xx(status),
        }
    }
}

pub fn classify(e: &Error) -> Option<&SpanError> {
    e.downcast_ref::<SpanError>()
}

pub fn is_cancelled_error(e: &Error) -> bool {
    matches!(classify(e), Some(SpanError::Cancelled))
}

pub fn is_not_found(e: &Error) -> bool {
    matches!(classify(e), Some(SpanError::NotFound))
}

/// On the delete path 404 and newer-timestamp conflicts count as success.
pub fn is_success_on_delete(e: &Error) -> bool {
    matches!(
        classify(e),
        Some(SpanError::NotFound) | Some(SpanError::ConflictNewer)
    )
}
