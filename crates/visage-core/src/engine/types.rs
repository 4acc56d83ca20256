//! Core types shared across the orchestration engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::job::JobState;
use crate::error::Error;

/// Unique identifier for a request (and its job; the mapping is 1:1).
pub type RequestId = String;

/// How the finished video is delivered to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    /// Encoded bytes inside the terminal success message.
    #[default]
    Inline,
    /// A reference id retrievable after the connection is gone.
    Reference,
}

/// A finished job's deliverable.
#[derive(Debug, Clone)]
pub enum JobResult {
    Inline(Vec<u8>),
    Reference { reference_id: String },
}

/// Progress and terminal events emitted over a job's event channel.
///
/// Exactly one terminal event (`Succeeded`, `Failed` or `Cancelled`) is
/// emitted per job; everything before it is best-effort progress.
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// Waiting for a slot; re-emitted when the position changes.
    Queued { position: usize },
    /// The job entered a new pipeline state.
    Stage { state: JobState },
    Succeeded { result: JobResult, elapsed: Duration },
    Failed { error: Error },
    Cancelled,
}

/// Point-in-time view of orchestrator load.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub active_jobs: usize,
    pub queued_jobs: usize,
    pub capacity: usize,
}
