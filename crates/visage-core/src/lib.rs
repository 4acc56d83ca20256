//! Visage Core - orchestration engine for talking-head video generation
//!
//! This crate is the concurrent request-orchestration layer in front of a
//! GPU-bound, multi-stage animation pipeline: it validates and stages
//! inputs, admits work under a bounded concurrency budget, drives each job
//! through the ordered compute stages, streams progress events, and
//! guarantees cleanup of transient artifacts on every exit path.
//!
//! The neural stages themselves (face preprocessing, audio-to-motion,
//! rendering, enhancement, muxing) are external collaborators behind the
//! [`stages::PipelineBackend`] trait; the production implementation
//! bridges to a persistent Python worker daemon.
//!
//! # Example
//!
//! ```ignore
//! use visage_core::{GenerationRequest, Orchestrator, OrchestratorConfig, WorkerBackend};
//!
//! let config = OrchestratorConfig::from_env();
//! let backend = std::sync::Arc::new(WorkerBackend::new(&config));
//! let orchestrator = Orchestrator::new(config, backend)?;
//!
//! let request = GenerationRequest::new(image_bytes, audio_bytes);
//! let mut handle = orchestrator.submit(request).await?;
//! while let Some(event) = handle.next_event().await {
//!     // relay progress and the terminal result
//! }
//! ```

pub mod artifacts;
pub mod config;
pub mod engine;
pub mod error;
pub mod stages;

pub use artifacts::ArtifactStore;
pub use config::OrchestratorConfig;
pub use engine::{
    AdmissionController, GenerationRequest, HealthSnapshot, Job, JobEvent, JobHandle, JobResult,
    JobState, MetricsSnapshot, Orchestrator, PreprocessMode, RenderOptions, RequestId,
    ResponseMode,
};
pub use error::{Error, Result};
pub use stages::{FaceCrop, FrameSet, MotionTrack, PipelineBackend, StageKind, WorkerBackend};
