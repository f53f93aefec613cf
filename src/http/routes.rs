use super::handlers;
use super::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Session queries
        .route("/status", get(handlers::get_status))
        .route("/transcript", get(handlers::get_transcript))
        // Interaction control
        .route("/interaction/start", post(handlers::start_interaction))
        .route("/interaction/stop", post(handlers::stop_interaction))
        .route("/interrupt", post(handlers::interrupt))
        .route("/reconnect", post(handlers::reconnect))
        .route("/text", post(handlers::send_text))
        // Add tracing middleware for request logging
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
