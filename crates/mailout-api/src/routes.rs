//! API routes

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::handlers::{health, unsubscribe};
use crate::state::AppState;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let state = Arc::new(state);

    let health_routes = Router::new()
        .route("/", get(health::health))
        .route("/live", get(health::liveness))
        .route("/ready", get(health::readiness))
        .route("/detailed", get(health::health_detailed))
        .with_state(state.clone());

    let unsubscribe_routes = Router::new()
        .route(
            "/:token",
            get(unsubscribe::unsubscribe).post(unsubscribe::unsubscribe),
        )
        .with_state(state);

    Router::new()
        .nest("/health", health_routes)
        .nest("/unsubscribe", unsubscribe_routes)
        .layer(TraceLayer::new_for_http())
}
