//! Service layer error types.

use thiserror::Error;

use crate::error::{ErrorCategory, ErrorClassification};
use crate::storage::RepositoryError;
use crate::transport::TransportError;

/// Service layer error types
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ServiceError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No index topic could be subscribed")]
    NoSubscriptions,
}

impl ErrorClassification for ServiceError {
    fn category(&self) -> ErrorCategory {
        match self {
            ServiceError::Transport(e) => e.category(),
            ServiceError::Repository(e) => e.category(),
            ServiceError::Configuration(_) => ErrorCategory::Configuration,
            ServiceError::NoSubscriptions => ErrorCategory::Transient,
        }
    }

    fn suggested_retry_delay(&self) -> Option<std::time::Duration> {
        match self {
            ServiceError::Transport(e) => e.suggested_retry_delay(),
            ServiceError::Repository(e) => e.suggested_retry_delay(),
            _ => None,
        }
    }
}

/// Result type for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;
