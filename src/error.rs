//! Error kinds returned by lifecycle operations
use sled::transaction::TransactionError;

#[derive(thiserror::Error, Debug)]
pub enum LifecycleError {
    /// Unknown id, or an id the caller has no visibility of.
    #[error("{0} not found")]
    NotFound(String),
    /// The access token was valid once but has been reissued.
    #[error("Signing link has expired, a newer link has been issued")]
    LinkExpired,
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
    #[error("Recipient has already {0}")]
    AlreadyActioned(String),
    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },
    #[error("External dependency failed: {0}")]
    External(#[from] ExternalError),
    #[error("Storage failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("Record encoding failed: {0}")]
    Codec(String),
}

/// Failure reported by a mailer, notifier or anchoring service.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ExternalError {
    #[error("{service} did not answer within {timeout_secs}s")]
    Timeout {
        service: &'static str,
        timeout_secs: u64,
    },
    #[error("{service} rejected the request: {message}")]
    Rejected {
        service: &'static str,
        message: String,
    },
}

/// Coarse classification used by transport layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    LinkExpired,
    Unauthorized,
    InvalidTransition,
    Validation,
    ExternalDependency,
    Internal,
}

impl LifecycleError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidTransition(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LifecycleError::NotFound(_) => ErrorKind::NotFound,
            LifecycleError::LinkExpired => ErrorKind::LinkExpired,
            LifecycleError::Unauthorized(_) => ErrorKind::Unauthorized,
            LifecycleError::InvalidTransition(_) | LifecycleError::AlreadyActioned(_) => {
                ErrorKind::InvalidTransition
            }
            LifecycleError::Validation { .. } => ErrorKind::Validation,
            LifecycleError::External(_) => ErrorKind::ExternalDependency,
            LifecycleError::Storage(_) | LifecycleError::Codec(_) => ErrorKind::Internal,
        }
    }
}

impl ErrorKind {
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            // 410 lets the signing portal tell a stale link apart from a bad one
            ErrorKind::LinkExpired => 410,
            ErrorKind::Unauthorized => 401,
            ErrorKind::InvalidTransition | ErrorKind::Validation => 400,
            ErrorKind::ExternalDependency => 502,
            ErrorKind::Internal => 500,
        }
    }
}

impl From<TransactionError<LifecycleError>> for LifecycleError {
    fn from(value: TransactionError<LifecycleError>) -> Self {
        match value {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => LifecycleError::Storage(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_links_are_distinct_from_unknown_ones() {
        assert_eq!(LifecycleError::LinkExpired.kind().http_status(), 410);
        assert_eq!(
            LifecycleError::not_found("token").kind().http_status(),
            404
        );
    }

    #[test]
    fn already_actioned_is_an_invalid_transition() {
        let err = LifecycleError::AlreadyActioned("signed".into());
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
        assert_eq!(err.to_string(), "Recipient has already signed");
    }
}
