//! Error types for IAM policy operations.

use thiserror::Error;

/// Errors that can occur while reading, mutating or writing an IAM policy.
///
/// The type is `Clone` because a single batched outcome is delivered to
/// every caller attached to the same [`PolicyFuture`](crate::future::PolicyFuture).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IamError {
    /// A setter, remover or policy document was malformed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Reading the current policy failed.
    #[error("Failed to retrieve IAM policy: {0}")]
    Fetch(String),

    /// Resolving principal member types failed.
    #[error("Failed to resolve principal types: {0}")]
    Resolution(String),

    /// The remote rejected a write because the policy ETag was stale.
    #[error("IAM policy conflict: {0}")]
    Conflict(String),

    /// Writing the policy failed for a reason other than a conflict.
    #[error("Failed to set IAM policy: {0}")]
    Write(String),

    /// The resource that owns the policy was not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Permission denied (authentication/authorization failure).
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Provider configuration was invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A policy document or resource state could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The remote rejected the request as malformed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl IamError {
    /// Get the error message as a string.
    pub fn message(&self) -> &str {
        match self {
            Self::Validation(msg) => msg,
            Self::Fetch(msg) => msg,
            Self::Resolution(msg) => msg,
            Self::Conflict(msg) => msg,
            Self::Write(msg) => msg,
            Self::NotFound(msg) => msg,
            Self::PermissionDenied(msg) => msg,
            Self::Configuration(msg) => msg,
            Self::Serialization(msg) => msg,
            Self::InvalidRequest(msg) => msg,
        }
    }

    /// Whether a failed write should be retried after backing off.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Whether the remote reported the resource as missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Re-tag an error coming back from a policy read.
    ///
    /// Errors that already carry a precise kind are kept as is; generic write
    /// failures are reported as fetch failures.
    pub(crate) fn into_fetch(self) -> Self {
        match self {
            Self::Write(msg) => Self::Fetch(msg),
            other => other,
        }
    }
}

impl From<serde_json::Error> for IamError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// The HCP resource manager API surfaces an ETag mismatch as `ABORTED`
/// (HTTP 409 through the gateway).
impl From<tonic::Status> for IamError {
    fn from(status: tonic::Status) -> Self {
        let msg = status.message().to_string();
        match status.code() {
            tonic::Code::Aborted => Self::Conflict(msg),
            tonic::Code::NotFound => Self::NotFound(msg),
            tonic::Code::PermissionDenied | tonic::Code::Unauthenticated => {
                Self::PermissionDenied(msg)
            },
            tonic::Code::InvalidArgument => Self::InvalidRequest(msg),
            _ => Self::Write(msg),
        }
    }
}

impl From<IamError> for tonic::Status {
    fn from(err: IamError) -> Self {
        match err {
            IamError::Validation(msg) => tonic::Status::invalid_argument(msg),
            IamError::Fetch(msg) => tonic::Status::unavailable(msg),
            IamError::Resolution(msg) => tonic::Status::failed_precondition(msg),
            IamError::Conflict(msg) => tonic::Status::aborted(msg),
            IamError::Write(msg) => tonic::Status::internal(msg),
            IamError::NotFound(msg) => tonic::Status::not_found(msg),
            IamError::PermissionDenied(msg) => tonic::Status::permission_denied(msg),
            IamError::Configuration(msg) => tonic::Status::failed_precondition(msg),
            IamError::Serialization(msg) => tonic::Status::invalid_argument(msg),
            IamError::InvalidRequest(msg) => tonic::Status::invalid_argument(msg),
        }
    }
}
