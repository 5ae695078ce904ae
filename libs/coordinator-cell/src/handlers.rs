// libs/coordinator-cell/src/handlers.rs
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, error};

use negotiation_cell::{FollowUpRequest, SessionStoreError};
use shared_models::error::AppError;

use crate::error::CoordinatorError;
use crate::models::InboundMessage;
use crate::services::coordinator::BookingCoordinator;

fn log_and_convert(context: &str, e: CoordinatorError) -> AppError {
    match &e {
        CoordinatorError::ValidationError(message) => debug!("{} rejected: {}", context, message),
        _ => error!("{} failed: {}", context, e),
    }
    e.into()
}

/// Classified visit note from the upstream pipeline.
pub async fn receive_follow_up(
    State(coordinator): State<Arc<BookingCoordinator>>,
    Json(request): Json<FollowUpRequest>,
) -> Result<Json<Value>, AppError> {
    let outcome = coordinator
        .on_initiation(request)
        .await
        .map_err(|e| log_and_convert("Follow-up initiation", e))?;

    Ok(Json(json!({
        "success": true,
        "result": outcome,
    })))
}

/// Patient message forwarded by the messaging webhook.
pub async fn receive_inbound_message(
    State(coordinator): State<Arc<BookingCoordinator>>,
    Json(message): Json<InboundMessage>,
) -> Result<Json<Value>, AppError> {
    let received_at = message.received_at.unwrap_or_else(Utc::now);

    let outcome = coordinator
        .on_reply(&message.from, &message.body, received_at)
        .await
        .map_err(|e| log_and_convert("Inbound message", e))?;

    Ok(Json(json!({
        "success": true,
        "result": outcome,
    })))
}

pub async fn get_session(
    State(coordinator): State<Arc<BookingCoordinator>>,
    Path(identity): Path<String>,
) -> Result<Json<Value>, AppError> {
    let session = coordinator
        .session(&identity)
        .await
        .map_err(|e| match e {
            missing @ CoordinatorError::Store(SessionStoreError::NotFound(_)) => missing.into(),
            other => log_and_convert("Session lookup", other),
        })?;

    Ok(Json(json!({
        "session": session,
    })))
}

pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "follow-up-scheduler",
        "timestamp": Utc::now(),
    }))
}
