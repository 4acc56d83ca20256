//! Pipeline stage abstraction.
//!
//! The neural compute stages are external collaborators: opaque,
//! long-running, accelerator-bound calls with a fixed signature. The
//! orchestrator invokes them uniformly through [`PipelineBackend`] and
//! never looks inside. A call in flight cannot be interrupted; cancellation
//! and timeouts are observed at stage boundaries only, and a stale result
//! is discarded by the executor.
//!
//! All stage inputs and outputs are files inside the owning job's
//! workspace, so artifact cleanup stays a single directory removal.

mod worker;

pub use worker::WorkerBackend;

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::engine::RenderOptions;
use crate::error::Result;

/// One ordered phase of the compute pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Preprocess,
    AudioToMotion,
    Render,
    Enhance,
    Finalize,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Preprocess => "preprocess",
            StageKind::AudioToMotion => "audio_to_motion",
            StageKind::Render => "render",
            StageKind::Enhance => "enhance",
            StageKind::Finalize => "finalize",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Framed source image plus detected face metadata, produced by preprocess.
#[derive(Debug, Clone)]
pub struct FaceCrop {
    pub framed_image: PathBuf,
    pub face_metadata: PathBuf,
}

/// Motion coefficient track derived from the driving audio.
#[derive(Debug, Clone)]
pub struct MotionTrack {
    pub coefficients: PathBuf,
}

/// A rendered (or enhanced) frame sequence.
#[derive(Debug, Clone)]
pub struct FrameSet {
    pub frames: PathBuf,
}

/// The staged compute pipeline, invoked one blocking call at a time.
///
/// Implementations own retries, batching and model specifics. Outputs are
/// written under `workspace` and returned as typed path handles.
#[async_trait]
pub trait PipelineBackend: Send + Sync {
    /// Frame the source image and detect the face to animate.
    async fn preprocess(
        &self,
        image: &Path,
        options: &RenderOptions,
        workspace: &Path,
    ) -> Result<FaceCrop>;

    /// Turn the driving audio into motion coefficients for the detected face.
    async fn audio_to_motion(
        &self,
        audio: &Path,
        face: &FaceCrop,
        options: &RenderOptions,
        workspace: &Path,
    ) -> Result<MotionTrack>;

    /// Render the coefficient track into raw video frames.
    async fn render(
        &self,
        motion: &MotionTrack,
        face: &FaceCrop,
        options: &RenderOptions,
        workspace: &Path,
    ) -> Result<FrameSet>;

    /// Enhance face and/or background in the rendered frames.
    async fn enhance(
        &self,
        frames: &FrameSet,
        options: &RenderOptions,
        workspace: &Path,
    ) -> Result<FrameSet>;

    /// Mux frames and audio into the final video; returns its path.
    async fn finalize(
        &self,
        frames: &FrameSet,
        audio: &Path,
        workspace: &Path,
    ) -> Result<PathBuf>;
}
