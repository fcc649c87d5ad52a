//! Error types for RIPPLE operations

use crate::CacheKey;
use thiserror::Error;

/// Failures reported by the remote service.
///
/// Every variant names the remote operation (or resource) and may carry the
/// backend's machine-readable error code.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Network or 5xx-equivalent failure. Eligible for retry with backoff.
    #[error("Transient failure in {operation}: {reason}")]
    Transient {
        operation: String,
        reason: String,
        code: Option<String>,
    },

    /// Remote-confirmed 4xx-equivalent rejection. Never retried.
    #[error("Validation failed in {operation}: {reason}")]
    Validation {
        operation: String,
        reason: String,
        code: Option<String>,
    },

    /// Write rejected by current server state. Triggers rollback, never retried.
    #[error("Conflict in {operation}: {reason}")]
    Conflict {
        operation: String,
        reason: String,
        code: Option<String>,
    },

    #[error("Not found: {resource}")]
    NotFound {
        resource: String,
        code: Option<String>,
    },
}

impl RemoteError {
    pub fn transient(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.into(),
            reason: reason.into(),
            code: None,
        }
    }

    pub fn validation(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            operation: operation.into(),
            reason: reason.into(),
            code: None,
        }
    }

    pub fn conflict(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Conflict {
            operation: operation.into(),
            reason: reason.into(),
            code: None,
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            code: None,
        }
    }

    /// Attach the backend error code.
    pub fn with_code(mut self, new_code: impl Into<String>) -> Self {
        match &mut self {
            Self::Transient { code, .. }
            | Self::Validation { code, .. }
            | Self::Conflict { code, .. }
            | Self::NotFound { code, .. } => *code = Some(new_code.into()),
        }
        self
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Transient { code, .. }
            | Self::Validation { code, .. }
            | Self::Conflict { code, .. }
            | Self::NotFound { code, .. } => code.as_deref(),
        }
    }

    /// Only transient failures are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Text suitable for a failure notice shown to the user.
    pub fn user_message(&self) -> &'static str {
        match self.code() {
            Some("validation_failed") => "The submitted values are not valid.",
            Some("email_exists") | Some("user_already_exists") => {
                "This email address is already in use."
            }
            Some("invalid_credentials") => "The email or password is incorrect.",
            Some("session_expired") | Some("bad_jwt") => {
                "Your session has expired. Please sign in again."
            }
            Some("weak_password") => "The password is too weak.",
            Some("same_password") => "The new password must differ from the old one.",
            Some("over_request_rate_limit") => "Too many requests. Please try again shortly.",
            Some("request_timeout") => "The request timed out.",
            Some("conflict") => "The data changed on the server. Please retry.",
            _ => match self {
                Self::Transient { .. } => "A network error occurred. Please try again shortly.",
                Self::Validation { .. } => "The request was rejected.",
                Self::Conflict { .. } => "The data changed on the server. Please retry.",
                Self::NotFound { .. } => "The requested item could not be found.",
            },
        }
    }
}

/// Query registry errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("Fetch for {key} was cancelled")]
    Cancelled { key: CacheKey },

    #[error("Fetch for {key} was superseded by generation {generation}")]
    Superseded { key: CacheKey, generation: u64 },

    #[error("Query {key} is disabled and has no cached value")]
    Disabled { key: CacheKey },

    #[error("Value cached under {key} is not a {expected}")]
    TypeMismatch {
        key: CacheKey,
        expected: &'static str,
    },

    #[error("Fetch task for {key} stopped before completing")]
    Aborted { key: CacheKey },
}

/// Entity store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Cannot evict {key}: {count} subscriber(s) attached")]
    HasSubscribers { key: CacheKey, count: usize },

    #[error("Entity store has been disposed")]
    Disposed,
}

/// Mutation pipeline errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MutationError {
    /// The remote call failed and every snapshotted record was restored.
    #[error("Mutation rolled back ({restored} record(s) restored): {source}")]
    RolledBack { source: RemoteError, restored: usize },
}

/// A compensation that failed while unwinding a saga.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("Compensation for step {step} failed: {error}")]
pub struct CompensationFailure {
    pub step: String,
    pub error: SyncError,
}

/// A saga step failed. Carries the triggering error and every compensation
/// error so a partially-compensated resource can be identified.
#[derive(Debug, Clone, Error, PartialEq)]
#[error(
    "Saga {saga} failed at step {failed_step} (#{step_index}): {source} ({} compensation failure(s))",
    .compensation_errors.len()
)]
pub struct SagaFailure {
    pub saga: String,
    pub failed_step: String,
    pub step_index: usize,
    pub source: Box<SyncError>,
    pub compensation_errors: Vec<CompensationFailure>,
}

impl SagaFailure {
    /// True if at least one compensation failed, leaving remote state
    /// partially unwound.
    pub fn is_partially_compensated(&self) -> bool {
        !self.compensation_errors.is_empty()
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Master error type for all RIPPLE errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Mutation error: {0}")]
    Mutation(#[from] MutationError),

    #[error("Saga error: {0}")]
    Saga(#[from] SagaFailure),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl SyncError {
    /// The remote failure at the root of this error, if any.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(e) => Some(e),
            Self::Mutation(MutationError::RolledBack { source, .. }) => Some(source),
            Self::Saga(failure) => failure.source.remote(),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Remote(e) if e.is_retryable())
    }
}

/// Result type alias for remote calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Result type alias for RIPPLE operations.
pub type SyncResult<T> = Result<T, SyncError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_key;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(RemoteError::transient("fetch_todo", "503").is_retryable());
        assert!(!RemoteError::validation("fetch_todo", "bad id").is_retryable());
        assert!(!RemoteError::conflict("update_todo", "version").is_retryable());
        assert!(!RemoteError::not_found("todo 7").is_retryable());
    }

    #[test]
    fn test_with_code_and_user_message() {
        let err = RemoteError::validation("sign_up", "exists").with_code("email_exists");
        assert_eq!(err.code(), Some("email_exists"));
        assert_eq!(err.user_message(), "This email address is already in use.");

        let uncoded = RemoteError::transient("fetch_posts", "timeout");
        assert!(uncoded.user_message().contains("network"));
    }

    #[test]
    fn test_query_error_display() {
        let err = QueryError::Cancelled {
            key: cache_key!["posts", "list"],
        };
        assert_eq!(err.to_string(), "Fetch for posts/list was cancelled");
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::HasSubscribers {
            key: cache_key!["todos", "list"],
            count: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("todos/list"));
        assert!(msg.contains("2 subscriber"));
    }

    #[test]
    fn test_remote_digs_through_mutation_and_saga() {
        let remote = RemoteError::conflict("update_post", "stale");
        let mutation: SyncError = MutationError::RolledBack {
            source: remote.clone(),
            restored: 1,
        }
        .into();
        assert_eq!(mutation.remote(), Some(&remote));

        let saga: SyncError = SagaFailure {
            saga: "create_post_with_media".to_string(),
            failed_step: "patch_post".to_string(),
            step_index: 2,
            source: Box::new(mutation),
            compensation_errors: vec![],
        }
        .into();
        assert_eq!(saga.remote(), Some(&remote));
    }

    #[test]
    fn test_saga_failure_reports_compensation_errors() {
        let failure = SagaFailure {
            saga: "demo".to_string(),
            failed_step: "third".to_string(),
            step_index: 2,
            source: Box::new(RemoteError::transient("third", "boom").into()),
            compensation_errors: vec![CompensationFailure {
                step: "first".to_string(),
                error: RemoteError::transient("first", "still down").into(),
            }],
        };
        assert!(failure.is_partially_compensated());
        let msg = failure.to_string();
        assert!(msg.contains("third"));
        assert!(msg.contains("1 compensation failure"));
    }

    #[test]
    fn test_error_conversion() {
        let err: SyncError = StoreError::Disposed.into();
        assert!(matches!(err, SyncError::Store(StoreError::Disposed)));
        assert!(!err.is_retryable());
    }
}
