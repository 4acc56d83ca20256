//! Bridge to the pipeline worker daemon.
//!
//! The neural stages run in a persistent Python worker process; this
//! backend talks to it over a Unix socket with length-prefixed JSON frames.
//! The worker holds the model weights across requests, so the spawn cost is
//! paid once per server lifetime, not per job.

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{FaceCrop, FrameSet, MotionTrack, PipelineBackend, StageKind};
use crate::config::OrchestratorConfig;
use crate::engine::RenderOptions;
use crate::error::{Error, Result};

/// Request frame sent to the worker.
#[derive(Debug, Serialize)]
struct WorkerRequest {
    command: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    framed_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    face_metadata: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    coefficients: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frames: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<RenderOptions>,
}

impl Default for WorkerRequest {
    fn default() -> Self {
        Self {
            command: "",
            image_path: None,
            audio_path: None,
            framed_image: None,
            face_metadata: None,
            coefficients: None,
            frames: None,
            output_dir: None,
            options: None,
        }
    }
}

/// Response frame from the worker.
#[derive(Debug, Deserialize)]
struct WorkerResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    framed_image: Option<String>,
    #[serde(default)]
    face_metadata: Option<String>,
    #[serde(default)]
    coefficients: Option<String>,
    #[serde(default)]
    frames: Option<String>,
    #[serde(default)]
    video: Option<String>,
}

/// Production [`PipelineBackend`] over the worker daemon.
#[derive(Clone)]
pub struct WorkerBackend {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    socket_path: PathBuf,
    script_path: PathBuf,
    python_cmd: String,
    stage_timeout: Duration,
    worker_process: Mutex<Option<Child>>,
}

impl WorkerBackend {
    /// Create a new worker backend from the orchestrator configuration.
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                socket_path: config.worker_socket.clone(),
                script_path: config.worker_script.clone(),
                python_cmd: config.python_cmd.clone(),
                // a single stage never legitimately outlives the job budget
                stage_timeout: config.job_timeout(),
                worker_process: Mutex::new(None),
            }),
        }
    }

    /// Stop the worker daemon if this backend started it.
    pub fn stop_worker(&self) {
        self.inner.stop();
    }

    async fn call(&self, stage: StageKind, request: WorkerRequest) -> Result<WorkerResponse> {
        let inner = self.inner.clone();
        let response = tokio::task::spawn_blocking(move || inner.roundtrip(&request))
            .await
            .map_err(|err| Error::Worker(format!("worker call aborted: {err}")))??;

        if let Some(message) = response.error {
            return Err(match stage {
                StageKind::Preprocess => Error::Preprocess(message),
                _ => Error::Stage { stage, message },
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl PipelineBackend for WorkerBackend {
    async fn preprocess(
        &self,
        image: &Path,
        options: &RenderOptions,
        workspace: &Path,
    ) -> Result<FaceCrop> {
        let response = self
            .call(
                StageKind::Preprocess,
                WorkerRequest {
                    command: "preprocess",
                    image_path: Some(path_string(image)),
                    output_dir: Some(path_string(workspace)),
                    options: Some(options.clone()),
                    ..Default::default()
                },
            )
            .await?;

        Ok(FaceCrop {
            framed_image: require_path(response.framed_image, "framed_image")?,
            face_metadata: require_path(response.face_metadata, "face_metadata")?,
        })
    }

    async fn audio_to_motion(
        &self,
        audio: &Path,
        face: &FaceCrop,
        options: &RenderOptions,
        workspace: &Path,
    ) -> Result<MotionTrack> {
        let response = self
            .call(
                StageKind::AudioToMotion,
                WorkerRequest {
                    command: "audio_to_motion",
                    audio_path: Some(path_string(audio)),
                    framed_image: Some(path_string(&face.framed_image)),
                    face_metadata: Some(path_string(&face.face_metadata)),
                    output_dir: Some(path_string(workspace)),
                    options: Some(options.clone()),
                    ..Default::default()
                },
            )
            .await?;

        Ok(MotionTrack {
            coefficients: require_path(response.coefficients, "coefficients")?,
        })
    }

    async fn render(
        &self,
        motion: &MotionTrack,
        face: &FaceCrop,
        options: &RenderOptions,
        workspace: &Path,
    ) -> Result<FrameSet> {
        let response = self
            .call(
                StageKind::Render,
                WorkerRequest {
                    command: "render",
                    coefficients: Some(path_string(&motion.coefficients)),
                    framed_image: Some(path_string(&face.framed_image)),
                    face_metadata: Some(path_string(&face.face_metadata)),
                    output_dir: Some(path_string(workspace)),
                    options: Some(options.clone()),
                    ..Default::default()
                },
            )
            .await?;

        Ok(FrameSet {
            frames: require_path(response.frames, "frames")?,
        })
    }

    async fn enhance(
        &self,
        frames: &FrameSet,
        options: &RenderOptions,
        workspace: &Path,
    ) -> Result<FrameSet> {
        let response = self
            .call(
                StageKind::Enhance,
                WorkerRequest {
                    command: "enhance",
                    frames: Some(path_string(&frames.frames)),
                    output_dir: Some(path_string(workspace)),
                    options: Some(options.clone()),
                    ..Default::default()
                },
            )
            .await?;

        Ok(FrameSet {
            frames: require_path(response.frames, "frames")?,
        })
    }

    async fn finalize(
        &self,
        frames: &FrameSet,
        audio: &Path,
        workspace: &Path,
    ) -> Result<PathBuf> {
        let response = self
            .call(
                StageKind::Finalize,
                WorkerRequest {
                    command: "finalize",
                    frames: Some(path_string(&frames.frames)),
                    audio_path: Some(path_string(audio)),
                    output_dir: Some(path_string(workspace)),
                    ..Default::default()
                },
            )
            .await?;

        require_path(response.video, "video")
    }
}

impl WorkerInner {
    fn roundtrip(&self, request: &WorkerRequest) -> Result<WorkerResponse> {
        self.ensure_running()?;
        let mut stream = self.connect()?;
        self.send_request(&mut stream, request)
    }

    fn is_running(&self) -> bool {
        self.socket_path.exists() && self.connect().is_ok()
    }

    /// Start the worker daemon if it is not already listening.
    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        info!("Starting pipeline worker...");

        let child = Command::new(&self.python_cmd)
            .arg(&self.script_path)
            .arg("--socket")
            .arg(&self.socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| Error::Worker(format!("failed to start worker: {err}")))?;

        {
            let mut guard = self.worker_process.lock().unwrap();
            *guard = Some(child);
        }

        // Wait for the worker to come up (up to 30 seconds; model loading
        // dominates startup)
        for i in 0..300 {
            std::thread::sleep(Duration::from_millis(100));
            if self.socket_path.exists() {
                if let Ok(mut stream) = self.connect() {
                    let request = WorkerRequest {
                        command: "check",
                        ..Default::default()
                    };
                    if let Ok(response) = self.send_request(&mut stream, &request) {
                        debug!(status = ?response.status, "pipeline worker ready");
                        return Ok(());
                    }
                }
            }
            if i % 50 == 0 {
                debug!("Waiting for pipeline worker to start... ({}s)", i / 10);
            }
        }

        Err(Error::Worker(
            "worker failed to start within 30 seconds".to_string(),
        ))
    }

    fn stop(&self) {
        if self.is_running() {
            info!("Stopping pipeline worker...");
            if let Ok(mut stream) = self.connect() {
                let request = WorkerRequest {
                    command: "shutdown",
                    ..Default::default()
                };
                let _ = self.send_request(&mut stream, &request);
            }
        }

        {
            let mut guard = self.worker_process.lock().unwrap();
            if let Some(mut child) = guard.take() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }

        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }

    fn connect(&self) -> Result<UnixStream> {
        let stream = UnixStream::connect(&self.socket_path)
            .map_err(|err| Error::Worker(format!("failed to connect to worker: {err}")))?;

        stream.set_read_timeout(Some(self.stage_timeout)).ok();
        stream.set_write_timeout(Some(Duration::from_secs(30))).ok();

        Ok(stream)
    }

    /// Send one length-prefixed request and read the length-prefixed reply.
    fn send_request(
        &self,
        stream: &mut UnixStream,
        request: &WorkerRequest,
    ) -> Result<WorkerResponse> {
        let request_json = serde_json::to_string(request)
            .map_err(|err| Error::Worker(format!("failed to serialize request: {err}")))?;

        let data = request_json.as_bytes();
        let length = (data.len() as u32).to_be_bytes();

        stream
            .write_all(&length)
            .map_err(|err| Error::Worker(format!("failed to write length: {err}")))?;
        stream
            .write_all(data)
            .map_err(|err| Error::Worker(format!("failed to write request: {err}")))?;
        stream
            .flush()
            .map_err(|err| Error::Worker(format!("failed to flush: {err}")))?;

        let mut length_buf = [0u8; 4];
        stream
            .read_exact(&mut length_buf)
            .map_err(|err| Error::Worker(format!("failed to read response length: {err}")))?;
        let response_len = u32::from_be_bytes(length_buf) as usize;

        let mut response_buf = vec![0u8; response_len];
        stream
            .read_exact(&mut response_buf)
            .map_err(|err| Error::Worker(format!("failed to read response body: {err}")))?;

        serde_json::from_slice(&response_buf).map_err(|err| {
            Error::Worker(format!(
                "failed to parse response: {} - {}",
                err,
                String::from_utf8_lossy(&response_buf)
            ))
        })
    }
}

impl Drop for WorkerInner {
    fn drop(&mut self) {
        let mut guard = self.worker_process.lock().unwrap();
        if let Some(mut child) = guard.take() {
            warn!("killing pipeline worker on shutdown");
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn require_path(field: Option<String>, name: &str) -> Result<PathBuf> {
    field
        .map(PathBuf::from)
        .ok_or_else(|| Error::Worker(format!("worker response missing {name}")))
}
