use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use availability_cell::AvailabilityError;
use negotiation_cell::{NegotiationError, SessionStoreError};
use shared_models::AppError;
use shared_utils::RetryableError;

/// Failures reported by the calendar and messaging providers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CapabilityError {
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Calendar conflict: {0}")]
    Conflict(String),

    #[error("Messaging channel window closed: {0}")]
    ChannelWindowClosed(String),

    #[error("Recipient unreachable: {0}")]
    Unreachable(String),

    #[error("Provider call timed out after {0:?}")]
    Timeout(Duration),
}

impl RetryableError for CapabilityError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            CapabilityError::Unavailable(_) | CapabilityError::Unreachable(_) | CapabilityError::Timeout(_)
        )
    }

    fn timed_out(timeout: Duration) -> Self {
        CapabilityError::Timeout(timeout)
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Escalation ledger backend error: {0}")]
    Backend(String),

    #[error("Escalation record not found: {0}")]
    NotFound(Uuid),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl RetryableError for LedgerError {
    fn is_retryable(&self) -> bool {
        !matches!(self, LedgerError::Serialization(_) | LedgerError::NotFound(_))
    }

    fn timed_out(timeout: Duration) -> Self {
        LedgerError::Backend(format!("ledger write timed out after {:?}", timeout))
    }
}

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error(transparent)]
    Store(#[from] SessionStoreError),

    #[error(transparent)]
    Negotiation(NegotiationError),
}

impl From<NegotiationError> for CoordinatorError {
    fn from(e: NegotiationError) -> Self {
        match e {
            NegotiationError::ValidationError(message) => CoordinatorError::ValidationError(message),
            other => CoordinatorError::Negotiation(other),
        }
    }
}

impl From<AvailabilityError> for CoordinatorError {
    fn from(e: AvailabilityError) -> Self {
        CoordinatorError::ValidationError(e.to_string())
    }
}

impl From<CoordinatorError> for AppError {
    fn from(e: CoordinatorError) -> Self {
        match e {
            CoordinatorError::ValidationError(message) => AppError::ValidationError(message),
            CoordinatorError::Store(SessionStoreError::NotFound(key)) => {
                AppError::NotFound(format!("No session for {}", key))
            }
            CoordinatorError::Store(SessionStoreError::Conflict { session_key, .. }) => {
                AppError::Conflict(format!("Session {} changed concurrently", session_key))
            }
            CoordinatorError::Store(other) => AppError::Store(other.to_string()),
            CoordinatorError::Negotiation(other) => AppError::Internal(other.to_string()),
        }
    }
}
