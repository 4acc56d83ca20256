//! Error types for the orchestration engine.

use std::time::Duration;

use thiserror::Error;

use crate::stages::StageKind;

/// Errors produced by the orchestration engine.
///
/// Every variant maps to a stable machine-checkable kind string carried in
/// terminal protocol messages; see [`Error::kind`]. Validation and capacity
/// errors are resolved at the session boundary and never create a job.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Malformed request or out-of-range options.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The waiting queue is full; the client should retry later.
    #[error("server at capacity: {0}")]
    Capacity(String),

    /// Preprocessing could not produce a usable face crop.
    #[error("preprocess failed: {0}")]
    Preprocess(String),

    /// A compute stage failed; carries the stage name.
    #[error("{stage} stage failed: {message}")]
    Stage { stage: StageKind, message: String },

    /// The job exceeded its wall-clock budget.
    #[error("job exceeded its {}s time budget", .0.as_secs())]
    Timeout(Duration),

    /// The job was cancelled by the client or by detachment.
    #[error("job cancelled")]
    Cancelled,

    /// Artifact storage failure.
    #[error("artifact store: {0}")]
    Artifact(String),

    /// The pipeline worker could not be reached or misbehaved.
    #[error("pipeline worker: {0}")]
    Worker(String),

    /// Defensive catch-all; always logged, never silently swallowed.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable error kind for the wire protocol.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation_error",
            Error::Capacity(_) => "capacity_error",
            Error::Preprocess(_) => "preprocess_error",
            Error::Stage { .. } => "stage_error",
            Error::Timeout(_) => "timeout_error",
            Error::Cancelled => "cancelled",
            Error::Artifact(_) => "artifact_error",
            Error::Worker(_) => "worker_error",
            Error::Internal(_) => "internal_error",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Artifact(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_stable() {
        assert_eq!(Error::Validation("x".into()).kind(), "validation_error");
        assert_eq!(Error::Capacity("x".into()).kind(), "capacity_error");
        assert_eq!(
            Error::Stage {
                stage: StageKind::Render,
                message: "x".into()
            }
            .kind(),
            "stage_error"
        );
        assert_eq!(Error::Timeout(Duration::from_secs(300)).kind(), "timeout_error");
        assert_eq!(Error::Cancelled.kind(), "cancelled");
    }

    #[test]
    fn test_stage_error_names_the_stage() {
        let err = Error::Stage {
            stage: StageKind::AudioToMotion,
            message: "coefficient model crashed".into(),
        };
        assert!(err.to_string().contains("audio_to_motion"));
    }
}
