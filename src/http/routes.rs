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
        // Session lifecycle
        .route("/sessions", post(handlers::create_session))
        .route("/sessions/:session_id", get(handlers::get_session))
        .route("/sessions/:session_id/end", post(handlers::end_session))
        // Conversation input
        .route("/sessions/:session_id/text", post(handlers::send_text))
        .route(
            "/sessions/:session_id/capture/start",
            post(handlers::start_capture),
        )
        .route(
            "/sessions/:session_id/capture/stop",
            post(handlers::stop_capture),
        )
        .route(
            "/sessions/:session_id/audio/enable",
            post(handlers::enable_audio),
        )
        // Session queries
        .route(
            "/sessions/:session_id/stats",
            get(handlers::get_session_stats),
        )
        .route(
            "/sessions/:session_id/transcript",
            get(handlers::get_session_transcript),
        )
        .layer(CorsLayer::permissive())
        // Add tracing middleware for request logging
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
