use std::sync::Arc;

use axum::{
    Router,
    routing::get,
};

use coordinator_cell::{create_scheduling_router, BookingCoordinator};

pub fn create_router(coordinator: Arc<BookingCoordinator>) -> Router {
    Router::new()
        .route("/", get(|| async { "Follow-up scheduler is running!" }))
        .merge(create_scheduling_router(coordinator))
}
