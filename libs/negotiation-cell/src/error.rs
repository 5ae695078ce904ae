use thiserror::Error;

use crate::models::NegotiationPhase;

#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid negotiation transition from {from} to {to}")]
    InvalidTransition {
        from: NegotiationPhase,
        to: NegotiationPhase,
    },
}

#[derive(Error, Debug)]
pub enum SessionStoreError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("A live session already exists for {0}")]
    AlreadyExists(String),

    #[error("Session {session_key} changed concurrently (expected {expected_phase} at revision {expected_revision})")]
    Conflict {
        session_key: String,
        expected_phase: NegotiationPhase,
        expected_revision: u64,
    },

    #[error("Session store backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}
