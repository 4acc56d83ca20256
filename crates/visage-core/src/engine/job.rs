//! Job lifecycle and the per-request state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

use super::request::GenerationRequest;
use crate::error::Error;

/// State of a job in the pipeline.
///
/// States advance strictly in pipeline order; `Enhancing` is the only
/// skippable state. `Succeeded`, `Failed` and `Cancelled` are terminal and
/// reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Validating,
    Admitted,
    Preprocessing,
    AudioToMotion,
    Rendering,
    Enhancing,
    Finalizing,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Validating => "validating",
            JobState::Admitted => "admitted",
            JobState::Preprocessing => "preprocessing",
            JobState::AudioToMotion => "audio_to_motion",
            JobState::Rendering => "rendering",
            JobState::Enhancing => "enhancing",
            JobState::Finalizing => "finalizing",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The orchestrator's unit of execution wrapping one request.
///
/// Exclusively owned and mutated by its executor; artifacts are released
/// when it reaches any terminal state, whether or not the client is still
/// attached.
#[derive(Debug)]
pub struct Job {
    pub request: GenerationRequest,
    pub state: JobState,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
    pub error: Option<Error>,
}

impl Job {
    pub fn new(request: GenerationRequest) -> Self {
        Self {
            request,
            state: JobState::Validating,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    /// Move to the next state, recording terminal timing.
    pub(crate) fn transition(&mut self, next: JobState) {
        debug_assert!(!self.state.is_terminal(), "transition out of terminal state");
        self.state = next;
        if next.is_terminal() {
            self.finished_at = Some(Instant::now());
        }
    }
}
