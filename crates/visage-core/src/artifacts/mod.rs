//! Per-job transient artifact management.
//!
//! Every job owns one workspace directory holding everything it stages or
//! produces: the decoded inputs, intermediate stage outputs, and the final
//! video before delivery. Release removes the whole directory and is
//! idempotent, so the terminal-transition handler and the watchdog sweep
//! can both call it without coordination.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::engine::RequestId;
use crate::error::Result;

/// Input payloads staged into a job workspace.
#[derive(Debug, Clone)]
pub struct StagedInputs {
    pub dir: PathBuf,
    pub image: PathBuf,
    pub audio: PathBuf,
}

struct JobEntry {
    dir: PathBuf,
    created_at: Instant,
}

/// Allocates, tracks and guarantees release of per-job transient storage.
pub struct ArtifactStore {
    workspace_root: PathBuf,
    results_dir: PathBuf,
    jobs: Mutex<HashMap<RequestId, JobEntry>>,
}

impl ArtifactStore {
    pub fn new(config: &OrchestratorConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.workspace_dir)?;
        std::fs::create_dir_all(&config.results_dir)?;

        Ok(Self {
            workspace_root: config.workspace_dir.clone(),
            results_dir: config.results_dir.clone(),
            jobs: Mutex::new(HashMap::new()),
        })
    }

    /// Create the job's workspace and write the request payloads into it.
    pub async fn stage_inputs(
        &self,
        id: &RequestId,
        image: &[u8],
        audio: &[u8],
    ) -> Result<StagedInputs> {
        let dir = self.workspace_root.join(id);
        fs::create_dir_all(&dir).await?;

        {
            let mut jobs = self.jobs.lock().unwrap();
            jobs.insert(
                id.clone(),
                JobEntry {
                    dir: dir.clone(),
                    created_at: Instant::now(),
                },
            );
        }

        let image_path = dir.join("source.png");
        let audio_path = dir.join("audio.wav");
        fs::write(&image_path, image).await?;
        fs::write(&audio_path, audio).await?;

        debug!(request_id = %id, dir = %dir.display(), "staged job inputs");

        Ok(StagedInputs {
            dir,
            image: image_path,
            audio: audio_path,
        })
    }

    /// Release every artifact owned by `id`. Idempotent.
    pub async fn release(&self, id: &RequestId) {
        let entry = { self.jobs.lock().unwrap().remove(id) };
        let Some(entry) = entry else {
            return;
        };

        if let Err(err) = fs::remove_dir_all(&entry.dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(request_id = %id, error = %err, "failed to remove job workspace");
            }
        }
        debug!(request_id = %id, "released job artifacts");
    }

    /// Move a finished video into the results directory so it outlives the
    /// job workspace; returns the reference id clients retrieve it by.
    pub async fn publish(&self, id: &RequestId, video: &Path) -> Result<String> {
        let reference_id = Uuid::new_v4().to_string();
        let target = self.results_dir.join(format!("{reference_id}.mp4"));

        if fs::rename(video, &target).await.is_err() {
            // rename fails across filesystems
            fs::copy(video, &target).await?;
        }

        debug!(request_id = %id, reference_id = %reference_id, "published result");
        Ok(reference_id)
    }

    /// Resolve a published reference id to its backing file.
    pub fn resolve(&self, reference_id: &str) -> Option<PathBuf> {
        // reference ids are server-generated UUIDs; anything else is not a
        // lookup key
        if Uuid::parse_str(reference_id).is_err() {
            return None;
        }
        let path = self.results_dir.join(format!("{reference_id}.mp4"));
        path.exists().then_some(path)
    }

    /// Reclaim workspaces for jobs that never reached a terminal transition
    /// and prune published results past their TTL.
    pub async fn sweep(&self, workspace_ttl: Duration, results_ttl: Duration) {
        let stale: Vec<RequestId> = {
            let jobs = self.jobs.lock().unwrap();
            jobs.iter()
                .filter(|(_, entry)| entry.created_at.elapsed() > workspace_ttl)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for id in stale {
            warn!(request_id = %id, "watchdog reclaiming orphaned artifacts");
            self.release(&id).await;
        }

        let Ok(mut entries) = fs::read_dir(&self.results_dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let expired = entry
                .metadata()
                .await
                .ok()
                .and_then(|meta| meta.modified().ok())
                .and_then(|modified| modified.elapsed().ok())
                .is_some_and(|age| age > results_ttl);
            if expired {
                debug!(path = %entry.path().display(), "pruning expired result");
                let _ = fs::remove_file(entry.path()).await;
            }
        }
    }

    /// Number of jobs with live workspaces.
    pub fn tracked_jobs(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> ArtifactStore {
        let config = OrchestratorConfig {
            workspace_dir: tmp.path().join("work"),
            results_dir: tmp.path().join("results"),
            ..Default::default()
        };
        ArtifactStore::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_stage_and_release() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let id = "job-1".to_string();

        let inputs = store.stage_inputs(&id, b"png", b"wav").await.unwrap();
        assert!(inputs.image.exists());
        assert!(inputs.audio.exists());
        assert_eq!(store.tracked_jobs(), 1);

        store.release(&id).await;
        assert!(!inputs.dir.exists());
        assert_eq!(store.tracked_jobs(), 0);

        // defensive double release is a no-op
        store.release(&id).await;
    }

    #[tokio::test]
    async fn test_publish_and_resolve() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let id = "job-2".to_string();

        let inputs = store.stage_inputs(&id, b"png", b"wav").await.unwrap();
        let video = inputs.dir.join("video.mp4");
        fs::write(&video, b"mp4").await.unwrap();

        let reference_id = store.publish(&id, &video).await.unwrap();
        store.release(&id).await;

        let resolved = store.resolve(&reference_id).unwrap();
        assert_eq!(fs::read(&resolved).await.unwrap(), b"mp4");
    }

    #[tokio::test]
    async fn test_resolve_rejects_non_uuid_keys() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        assert!(store.resolve("../../etc/passwd").is_none());
        assert!(store.resolve("").is_none());
    }

    #[tokio::test]
    async fn test_sweep_reclaims_orphans() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let id = "job-3".to_string();

        let inputs = store.stage_inputs(&id, b"png", b"wav").await.unwrap();
        store.sweep(Duration::ZERO, Duration::from_secs(3600)).await;

        assert!(!inputs.dir.exists());
        assert_eq!(store.tracked_jobs(), 0);
    }
}
