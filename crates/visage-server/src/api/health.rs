//! Health and introspection endpoints.

use axum::{extract::State, Json};

use visage_core::{HealthSnapshot, MetricsSnapshot};

use crate::state::AppState;

/// Current load: running jobs, queued jobs, and the concurrency budget.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthSnapshot> {
    Json(state.orchestrator.health())
}

/// Lifetime counters and timing stats.
pub async fn stats(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.orchestrator.stats())
}
