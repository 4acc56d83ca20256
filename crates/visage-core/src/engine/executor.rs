//! Job execution: one admitted request's run through the pipeline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::admission::AdmissionController;
use super::job::{Job, JobState};
use super::metrics::MetricsCollector;
use super::types::{JobEvent, JobResult, ResponseMode};
use crate::artifacts::{ArtifactStore, StagedInputs};
use crate::error::{Error, Result};
use crate::stages::{PipelineBackend, StageKind};

/// Drives one admitted job to a terminal state.
///
/// The executor owns the job: it emits a stage event per transition,
/// exactly one terminal event, and releases artifacts plus the admission
/// slot on every exit path.
pub(crate) struct JobExecutor {
    pub(crate) job: Job,
    pub(crate) inputs: StagedInputs,
    pub(crate) backend: Arc<dyn PipelineBackend>,
    pub(crate) store: Arc<ArtifactStore>,
    pub(crate) admission: Arc<AdmissionController>,
    pub(crate) metrics: Arc<MetricsCollector>,
    pub(crate) events: mpsc::UnboundedSender<JobEvent>,
    pub(crate) cancel: CancellationToken,
    pub(crate) budget: Duration,
    pub(crate) deadline: Instant,
}

impl JobExecutor {
    pub(crate) async fn run(mut self) {
        // the wall-clock budget starts when the job actually gets its slot,
        // not while it sits in the queue
        self.deadline = Instant::now() + self.budget;
        self.job.started_at = Some(Instant::now());

        let id = self.job.request.request_id.clone();
        let outcome = self.execute().await;
        let elapsed = self.job.request.received_at.elapsed();

        match outcome {
            Ok(result) => {
                self.job.transition(JobState::Succeeded);
                info!(
                    request_id = %id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "job succeeded"
                );
                self.metrics.record_succeeded(elapsed);
                let _ = self.events.send(JobEvent::Succeeded { result, elapsed });
            }
            Err(Error::Cancelled) => {
                self.job.transition(JobState::Cancelled);
                info!(request_id = %id, "job cancelled");
                self.metrics.record_cancelled();
                let _ = self.events.send(JobEvent::Cancelled);
            }
            Err(error) => {
                warn!(request_id = %id, kind = error.kind(), %error, "job failed");
                self.job.error = Some(error.clone());
                self.job.transition(JobState::Failed);
                self.metrics.record_failed();
                let _ = self.events.send(JobEvent::Failed { error });
            }
        }

        self.store.release(&id).await;
        self.admission.release(&id);
    }

    async fn execute(&mut self) -> Result<JobResult> {
        let id = self.job.request.request_id.clone();
        let workspace = self.inputs.dir.clone();
        let options = self.job.request.options.clone();

        self.enter(JobState::Admitted)?;

        self.enter(JobState::Preprocessing)?;
        let face = self
            .backend
            .preprocess(&self.inputs.image, &options, &workspace)
            .await
            .map_err(|err| stage_error(StageKind::Preprocess, err))?;

        self.enter(JobState::AudioToMotion)?;
        let motion = self
            .backend
            .audio_to_motion(&self.inputs.audio, &face, &options, &workspace)
            .await
            .map_err(|err| stage_error(StageKind::AudioToMotion, err))?;

        self.enter(JobState::Rendering)?;
        let mut frames = self
            .backend
            .render(&motion, &face, &options, &workspace)
            .await
            .map_err(|err| stage_error(StageKind::Render, err))?;

        if options.wants_enhancement() {
            self.enter(JobState::Enhancing)?;
            frames = self
                .backend
                .enhance(&frames, &options, &workspace)
                .await
                .map_err(|err| stage_error(StageKind::Enhance, err))?;
        }

        self.enter(JobState::Finalizing)?;
        let video = self
            .backend
            .finalize(&frames, &self.inputs.audio, &workspace)
            .await
            .map_err(|err| stage_error(StageKind::Finalize, err))?;

        // a cancellation or timeout that landed during the last stage still
        // wins over the result
        self.checkpoint()?;

        match self.job.request.response_mode {
            ResponseMode::Inline => {
                let bytes = tokio::fs::read(&video).await?;
                Ok(JobResult::Inline(bytes))
            }
            ResponseMode::Reference => {
                let reference_id = self.store.publish(&id, &video).await?;
                Ok(JobResult::Reference { reference_id })
            }
        }
    }

    /// Stage boundaries are the only cancellation and timeout points; an
    /// in-flight stage call runs to completion and its result is discarded.
    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Err(Error::Timeout(self.budget));
        }
        Ok(())
    }

    fn enter(&mut self, state: JobState) -> Result<()> {
        self.checkpoint()?;
        self.job.transition(state);
        debug!(
            request_id = %self.job.request.request_id,
            stage = state.as_str(),
            "stage transition"
        );
        let _ = self.events.send(JobEvent::Stage { state });
        Ok(())
    }
}

/// Attribute transport-level failures to the stage that was running.
fn stage_error(stage: StageKind, err: Error) -> Error {
    match err {
        Error::Worker(message) | Error::Artifact(message) | Error::Internal(message) => {
            if stage == StageKind::Preprocess {
                Error::Preprocess(message)
            } else {
                Error::Stage { stage, message }
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_error_attribution() {
        let err = stage_error(StageKind::Render, Error::Worker("socket closed".into()));
        assert!(matches!(
            err,
            Error::Stage {
                stage: StageKind::Render,
                ..
            }
        ));

        let err = stage_error(StageKind::Preprocess, Error::Worker("no face".into()));
        assert!(matches!(err, Error::Preprocess(_)));

        // already-typed errors pass through untouched
        let err = stage_error(StageKind::Render, Error::Cancelled);
        assert!(matches!(err, Error::Cancelled));
    }
}
