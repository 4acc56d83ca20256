//! Shared application state.

use std::sync::Arc;

use visage_core::Orchestrator;

/// Shared state handed to every connection and endpoint.
#[derive(Clone)]
pub struct AppState {
    /// The single orchestration engine shared by all sessions
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
        }
    }
}
