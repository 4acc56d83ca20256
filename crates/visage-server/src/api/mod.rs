//! API routes and handlers

mod download;
mod health;
mod ws;

use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the main API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Generation protocol
        .route("/ws", get(ws::ws_upgrade))
        // Introspection
        .route("/health", get(health::health_check))
        .route("/stats", get(health::stats))
        // Reference-mode result retrieval
        .route("/download/{reference_id}", get(download::download))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
