//! The request orchestration engine.
//!
//! Every client request flows through one shared [`Orchestrator`]:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        Orchestrator                            │
//! │  ┌────────────┐   ┌─────────────────────┐   ┌───────────────┐  │
//! │  │  Request   │   │     Admission       │   │ JobExecutor   │  │
//! │  │ validation │──▶│  Controller (N)     │──▶│ (one task per │  │
//! │  │            │   │  FCFS queue         │   │  job)         │  │
//! │  └────────────┘   └─────────────────────┘   └──────┬────────┘  │
//! │                                                    │           │
//! │  ┌────────────────┐                     ┌──────────▼────────┐  │
//! │  │ ArtifactStore  │◀────────────────────│ PipelineBackend   │  │
//! │  │ (+ watchdog)   │                     │ (worker daemon)   │  │
//! │  └────────────────┘                     └───────────────────┘  │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Admission is the single concurrency gate: at most `N` jobs run their
//! pipelines at once, everyone else waits in FCFS order or is rejected
//! when the queue is full. Each submitted job reports progress over its
//! own event channel and always ends with exactly one terminal event.

mod admission;
mod executor;
mod job;
pub mod metrics;
mod request;
mod types;

pub use admission::{Admission, AdmissionController};
pub use job::{Job, JobState};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use request::{GenerationRequest, PreprocessMode, RenderOptions};
pub use types::{HealthSnapshot, JobEvent, JobResult, RequestId, ResponseMode};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifacts::ArtifactStore;
use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::stages::PipelineBackend;
use executor::JobExecutor;

/// A submitted job as seen by its session: the event stream plus a
/// cancellation handle. Dropping the handle detaches from the job without
/// cancelling it.
#[derive(Debug)]
pub struct JobHandle {
    pub request_id: RequestId,
    pub response_mode: ResponseMode,
    events: mpsc::UnboundedReceiver<JobEvent>,
    cancel: CancellationToken,
}

impl JobHandle {
    /// Next progress or terminal event; `None` once the job is gone.
    pub async fn next_event(&mut self) -> Option<JobEvent> {
        self.events.recv().await
    }

    /// Request cancellation at the next stage boundary (or dequeue, if the
    /// job is still waiting for a slot).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// The shared orchestration engine: admission, execution, artifacts.
pub struct Orchestrator {
    config: OrchestratorConfig,
    admission: Arc<AdmissionController>,
    store: Arc<ArtifactStore>,
    backend: Arc<dyn PipelineBackend>,
    metrics: Arc<MetricsCollector>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, backend: Arc<dyn PipelineBackend>) -> Result<Self> {
        info!(
            capacity = config.max_concurrent_jobs,
            queue_depth = config.max_queue_depth,
            "initializing orchestrator"
        );

        let store = Arc::new(ArtifactStore::new(&config)?);
        let admission = Arc::new(AdmissionController::new(
            config.max_concurrent_jobs,
            config.max_queue_depth,
        ));

        Ok(Self {
            config,
            admission,
            store,
            backend,
            metrics: Arc::new(MetricsCollector::new()),
        })
    }

    /// Spawn the background watchdog that reclaims orphaned artifacts.
    pub fn start(&self) {
        let store = self.store.clone();
        let interval = self.config.sweep_interval();
        let workspace_ttl = self.config.artifact_ttl();
        let results_ttl = self.config.results_ttl();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                store.sweep(workspace_ttl, results_ttl).await;
            }
        });
    }

    /// Validate and submit one request.
    ///
    /// Validation and capacity failures return an error without creating a
    /// job. On success the job runs (or waits for its slot) independently
    /// of the returned handle.
    pub async fn submit(&self, request: GenerationRequest) -> Result<JobHandle> {
        request.validate()?;
        let id = request.request_id.clone();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let admission = match self.admission.try_admit(&id, events_tx.clone()) {
            Ok(admission) => admission,
            Err(err) => {
                self.metrics.record_rejected();
                return Err(err);
            }
        };
        self.metrics.record_submitted();

        let inputs = match self
            .store
            .stage_inputs(&id, &request.image, &request.audio)
            .await
        {
            Ok(inputs) => inputs,
            Err(err) => {
                // nothing has run; undo the admission bookkeeping
                if !self.admission.remove_queued(&id) {
                    self.admission.release(&id);
                }
                return Err(err);
            }
        };

        let cancel = CancellationToken::new();
        let handle = JobHandle {
            request_id: id.clone(),
            response_mode: request.response_mode,
            events: events_rx,
            cancel: cancel.clone(),
        };

        let executor = JobExecutor {
            job: Job::new(request),
            inputs,
            backend: self.backend.clone(),
            store: self.store.clone(),
            admission: self.admission.clone(),
            metrics: self.metrics.clone(),
            events: events_tx.clone(),
            cancel: cancel.clone(),
            budget: self.config.job_timeout(),
            deadline: Instant::now() + self.config.job_timeout(),
        };

        match admission {
            Admission::Admitted => {
                tokio::spawn(executor.run());
            }
            Admission::Queued { position, ticket } => {
                let _ = events_tx.send(JobEvent::Queued { position });

                let admission_ctl = self.admission.clone();
                let store = self.store.clone();
                let metrics = self.metrics.clone();
                let events = events_tx.clone();
                let queued_id = id.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        granted = ticket => match granted {
                            Ok(()) => executor.run().await,
                            Err(_) => {
                                warn!(request_id = %queued_id, "queue entry dropped before admission");
                                store.release(&queued_id).await;
                                metrics.record_failed();
                                let _ = events.send(JobEvent::Failed {
                                    error: Error::Internal(
                                        "queue entry dropped before admission".into(),
                                    ),
                                });
                            }
                        },
                        _ = cancel.cancelled() => {
                            if admission_ctl.remove_queued(&queued_id) {
                                debug!(request_id = %queued_id, "cancelled while queued");
                                store.release(&queued_id).await;
                                metrics.record_cancelled();
                                let _ = events.send(JobEvent::Cancelled);
                            } else {
                                // the slot was granted concurrently; run
                                // through the normal path so slot and
                                // artifacts are torn down in one place
                                executor.run().await;
                            }
                        }
                    }
                });
            }
        }

        Ok(handle)
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            active_jobs: self.admission.active_count(),
            queued_jobs: self.admission.queued_count(),
            capacity: self.admission.capacity(),
        }
    }

    pub fn stats(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Look up a published reference-mode result.
    pub fn resolve_artifact(&self, reference_id: &str) -> Option<PathBuf> {
        self.store.resolve(reference_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::{FaceCrop, FrameSet, MotionTrack, StageKind};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Deterministic stand-in for the compute pipeline.
    #[derive(Default)]
    struct StubBackend {
        delay: Duration,
        fail_at: Option<StageKind>,
        running: AtomicUsize,
        max_running: AtomicUsize,
        started: Mutex<Vec<String>>,
    }

    impl StubBackend {
        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }

        fn failing(stage: StageKind) -> Self {
            Self {
                fail_at: Some(stage),
                ..Default::default()
            }
        }

        async fn step(&self, stage: StageKind) -> crate::error::Result<()> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if self.fail_at == Some(stage) {
                return Err(Error::Worker(format!("{stage} stub failure")));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl PipelineBackend for StubBackend {
        async fn preprocess(
            &self,
            _image: &Path,
            _options: &RenderOptions,
            workspace: &Path,
        ) -> crate::error::Result<FaceCrop> {
            let job = workspace
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.started.lock().unwrap().push(job);

            self.step(StageKind::Preprocess).await?;
            let framed_image = workspace.join("framed.png");
            let face_metadata = workspace.join("face.json");
            tokio::fs::write(&framed_image, b"framed").await?;
            tokio::fs::write(&face_metadata, b"{}").await?;
            Ok(FaceCrop {
                framed_image,
                face_metadata,
            })
        }

        async fn audio_to_motion(
            &self,
            _audio: &Path,
            _face: &FaceCrop,
            _options: &RenderOptions,
            workspace: &Path,
        ) -> crate::error::Result<MotionTrack> {
            self.step(StageKind::AudioToMotion).await?;
            let coefficients = workspace.join("motion.bin");
            tokio::fs::write(&coefficients, b"coeffs").await?;
            Ok(MotionTrack { coefficients })
        }

        async fn render(
            &self,
            _motion: &MotionTrack,
            _face: &FaceCrop,
            _options: &RenderOptions,
            workspace: &Path,
        ) -> crate::error::Result<FrameSet> {
            self.step(StageKind::Render).await?;
            let frames = workspace.join("frames");
            tokio::fs::create_dir_all(&frames).await?;
            Ok(FrameSet { frames })
        }

        async fn enhance(
            &self,
            frames: &FrameSet,
            _options: &RenderOptions,
            _workspace: &Path,
        ) -> crate::error::Result<FrameSet> {
            self.step(StageKind::Enhance).await?;
            Ok(FrameSet {
                frames: frames.frames.clone(),
            })
        }

        async fn finalize(
            &self,
            _frames: &FrameSet,
            _audio: &Path,
            workspace: &Path,
        ) -> crate::error::Result<PathBuf> {
            self.step(StageKind::Finalize).await?;
            let video = workspace.join("video.mp4");
            tokio::fs::write(&video, b"mp4").await?;
            Ok(video)
        }
    }

    fn test_config(tmp: &TempDir) -> OrchestratorConfig {
        OrchestratorConfig {
            workspace_dir: tmp.path().join("work"),
            results_dir: tmp.path().join("results"),
            max_concurrent_jobs: 1,
            max_queue_depth: 8,
            job_timeout_secs: 10,
            ..Default::default()
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new(vec![1u8; 16], vec![2u8; 16])
    }

    async fn drain(mut handle: JobHandle) -> Vec<JobEvent> {
        let mut events = Vec::new();
        while let Some(event) = handle.next_event().await {
            events.push(event);
        }
        events
    }

    fn stages_of(events: &[JobEvent]) -> Vec<JobState> {
        events
            .iter()
            .filter_map(|event| match event {
                JobEvent::Stage { state } => Some(*state),
                _ => None,
            })
            .collect()
    }

    fn terminal_count(events: &[JobEvent]) -> usize {
        events
            .iter()
            .filter(|event| {
                matches!(
                    event,
                    JobEvent::Succeeded { .. } | JobEvent::Failed { .. } | JobEvent::Cancelled
                )
            })
            .count()
    }

    #[tokio::test]
    async fn test_end_to_end_success_inline() {
        let tmp = TempDir::new().unwrap();
        let orchestrator =
            Orchestrator::new(test_config(&tmp), Arc::new(StubBackend::default())).unwrap();

        let handle = orchestrator.submit(request()).await.unwrap();
        let events = drain(handle).await;

        assert_eq!(
            stages_of(&events),
            vec![
                JobState::Admitted,
                JobState::Preprocessing,
                JobState::AudioToMotion,
                JobState::Rendering,
                JobState::Finalizing,
            ]
        );
        assert_eq!(terminal_count(&events), 1);
        let Some(JobEvent::Succeeded {
            result: JobResult::Inline(bytes),
            ..
        }) = events.last()
        else {
            panic!("expected inline success, got {:?}", events.last());
        };
        assert_eq!(bytes, b"mp4");
        assert_eq!(orchestrator.health().active_jobs, 0);
    }

    #[tokio::test]
    async fn test_enhancing_stage_runs_when_requested() {
        let tmp = TempDir::new().unwrap();
        let orchestrator =
            Orchestrator::new(test_config(&tmp), Arc::new(StubBackend::default())).unwrap();

        let mut options = RenderOptions::default();
        options.use_enhancer = true;
        let handle = orchestrator
            .submit(request().with_options(options))
            .await
            .unwrap();
        let events = drain(handle).await;

        assert!(stages_of(&events).contains(&JobState::Enhancing));
    }

    #[tokio::test]
    async fn test_validation_never_consumes_a_slot() {
        let tmp = TempDir::new().unwrap();
        let orchestrator =
            Orchestrator::new(test_config(&tmp), Arc::new(StubBackend::default())).unwrap();

        let mut options = RenderOptions::default();
        options.expression_scale = 5.0;
        let err = orchestrator
            .submit(request().with_options(options))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "validation_error");
        let health = orchestrator.health();
        assert_eq!(health.active_jobs, 0);
        assert_eq!(health.queued_jobs, 0);
    }

    #[tokio::test]
    async fn test_capacity_backpressure_with_empty_queue() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(&tmp);
        config.max_queue_depth = 0;
        let orchestrator = Orchestrator::new(
            config,
            Arc::new(StubBackend::slow(Duration::from_millis(200))),
        )
        .unwrap();

        let first = orchestrator.submit(request()).await.unwrap();
        let err = orchestrator.submit(request()).await.unwrap_err();
        assert_eq!(err.kind(), "capacity_error");

        let events = drain(first).await;
        assert_eq!(terminal_count(&events), 1);
    }

    #[tokio::test]
    async fn test_admission_bound_and_fifo_order() {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(StubBackend::slow(Duration::from_millis(30)));
        let orchestrator = Orchestrator::new(test_config(&tmp), backend.clone()).unwrap();

        let first = orchestrator.submit(request()).await.unwrap();
        let second = orchestrator.submit(request()).await.unwrap();
        let third = orchestrator.submit(request()).await.unwrap();
        let ids = vec![
            first.request_id.clone(),
            second.request_id.clone(),
            third.request_id.clone(),
        ];

        assert!(orchestrator.health().queued_jobs > 0);

        for handle in [first, second, third] {
            let events = drain(handle).await;
            assert_eq!(terminal_count(&events), 1);
            assert!(matches!(events.last(), Some(JobEvent::Succeeded { .. })));
        }

        // never more than one pipeline on the accelerator
        assert_eq!(backend.max_running.load(Ordering::SeqCst), 1);
        // started strictly in submission order
        assert_eq!(*backend.started.lock().unwrap(), ids);
    }

    #[tokio::test]
    async fn test_cancel_between_stages() {
        let tmp = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(
            test_config(&tmp),
            Arc::new(StubBackend::slow(Duration::from_millis(100))),
        )
        .unwrap();

        let mut handle = orchestrator.submit(request()).await.unwrap();
        // let it reach the first stage, then cancel mid-pipeline
        let first = handle.next_event().await;
        assert!(matches!(first, Some(JobEvent::Stage { .. })));
        handle.cancel();

        let events = drain(handle).await;
        assert!(matches!(events.last(), Some(JobEvent::Cancelled)));
        assert_eq!(orchestrator.health().active_jobs, 0);
    }

    #[tokio::test]
    async fn test_cancel_while_queued_dequeues() {
        let tmp = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(
            test_config(&tmp),
            Arc::new(StubBackend::slow(Duration::from_millis(100))),
        )
        .unwrap();

        let first = orchestrator.submit(request()).await.unwrap();
        let second = orchestrator.submit(request()).await.unwrap();

        second.cancel();
        let events = drain(second).await;
        assert!(matches!(events.first(), Some(JobEvent::Queued { position: 1 })));
        assert!(matches!(events.last(), Some(JobEvent::Cancelled)));

        // the running job is unaffected
        let events = drain(first).await;
        assert!(matches!(events.last(), Some(JobEvent::Succeeded { .. })));
    }

    #[tokio::test]
    async fn test_timeout_checked_at_stage_boundary() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(&tmp);
        config.job_timeout_secs = 0;
        let orchestrator =
            Orchestrator::new(config, Arc::new(StubBackend::default())).unwrap();

        let handle = orchestrator.submit(request()).await.unwrap();
        let events = drain(handle).await;

        let Some(JobEvent::Failed { error }) = events.last() else {
            panic!("expected failure, got {:?}", events.last());
        };
        assert_eq!(error.kind(), "timeout_error");
        assert_eq!(orchestrator.health().active_jobs, 0);
    }

    #[tokio::test]
    async fn test_failed_stage_releases_artifacts() {
        let tmp = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(
            test_config(&tmp),
            Arc::new(StubBackend::failing(StageKind::Render)),
        )
        .unwrap();

        let handle = orchestrator.submit(request()).await.unwrap();
        let events = drain(handle).await;

        let Some(JobEvent::Failed { error }) = events.last() else {
            panic!("expected failure, got {:?}", events.last());
        };
        assert_eq!(error.kind(), "stage_error");
        assert!(error.to_string().contains("render"));

        // a queued follow-up gets the freed slot
        let handle = orchestrator.submit(request()).await.unwrap();
        let events = drain(handle).await;
        assert_eq!(terminal_count(&events), 1);
    }

    #[tokio::test]
    async fn test_reference_mode_survives_detach() {
        let tmp = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(
            test_config(&tmp),
            Arc::new(StubBackend::slow(Duration::from_millis(50))),
        )
        .unwrap();

        let handle = orchestrator
            .submit(request().with_response_mode(ResponseMode::Reference))
            .await
            .unwrap();
        // client disconnects mid-job; dropping the handle must not cancel
        drop(handle);

        for _ in 0..100 {
            if orchestrator.health().active_jobs == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(orchestrator.health().active_jobs, 0);

        let mut published = std::fs::read_dir(tmp.path().join("results")).unwrap();
        let entry = published.next().expect("published result").unwrap();
        assert_eq!(std::fs::read(entry.path()).unwrap(), b"mp4");
    }
}
