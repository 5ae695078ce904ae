// libs/coordinator-cell/src/router.rs
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::handlers;
use crate::services::coordinator::BookingCoordinator;

pub fn create_scheduling_router(coordinator: Arc<BookingCoordinator>) -> Router {
    Router::new()
        // Inbound event feeds
        .route("/follow-ups", post(handlers::receive_follow_up))
        .route("/messages/inbound", post(handlers::receive_inbound_message))
        // Inspection
        .route("/sessions/{identity}", get(handlers::get_session))
        .route("/health", get(handlers::health_check))
        .with_state(coordinator)
}
