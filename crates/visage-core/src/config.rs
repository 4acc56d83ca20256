//! Configuration for the orchestration engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Hard ceiling on concurrently running pipelines (accelerator budget)
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Maximum number of admitted-but-waiting jobs before backpressure
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,

    /// Per-job wall-clock budget, checked at stage boundaries (seconds)
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// Age at which an orphaned job workspace is reclaimed (seconds)
    #[serde(default = "default_artifact_ttl_secs")]
    pub artifact_ttl_secs: u64,

    /// Age at which a published result is pruned (seconds)
    #[serde(default = "default_results_ttl_secs")]
    pub results_ttl_secs: u64,

    /// Interval between watchdog sweeps (seconds)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Directory for per-job transient workspaces
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,

    /// Directory for published reference-mode results
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,

    /// Unix socket the pipeline worker listens on
    #[serde(default = "default_worker_socket")]
    pub worker_socket: PathBuf,

    /// Pipeline worker entry point
    #[serde(default = "default_worker_script")]
    pub worker_script: PathBuf,

    /// Python interpreter used to spawn the worker
    #[serde(default = "default_python_cmd")]
    pub python_cmd: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            max_queue_depth: default_max_queue_depth(),
            job_timeout_secs: default_job_timeout_secs(),
            artifact_ttl_secs: default_artifact_ttl_secs(),
            results_ttl_secs: default_results_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            workspace_dir: default_workspace_dir(),
            results_dir: default_results_dir(),
            worker_socket: default_worker_socket(),
            worker_script: default_worker_script(),
            python_cmd: default_python_cmd(),
        }
    }
}

impl OrchestratorConfig {
    /// Build a configuration from defaults plus `VISAGE_*` environment
    /// overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(n) = env_parse::<usize>("VISAGE_MAX_JOBS") {
            config.max_concurrent_jobs = n.max(1);
        }
        if let Some(n) = env_parse::<usize>("VISAGE_MAX_QUEUE") {
            config.max_queue_depth = n;
        }
        if let Some(n) = env_parse::<u64>("VISAGE_JOB_TIMEOUT_SECS") {
            config.job_timeout_secs = n;
        }
        if let Some(n) = env_parse::<u64>("VISAGE_ARTIFACT_TTL_SECS") {
            config.artifact_ttl_secs = n;
        }
        if let Some(n) = env_parse::<u64>("VISAGE_RESULTS_TTL_SECS") {
            config.results_ttl_secs = n;
        }
        if let Some(n) = env_parse::<u64>("VISAGE_SWEEP_INTERVAL_SECS") {
            config.sweep_interval_secs = n;
        }
        if let Some(dir) = env_path("VISAGE_WORK_DIR") {
            config.workspace_dir = dir;
        }
        if let Some(dir) = env_path("VISAGE_RESULTS_DIR") {
            config.results_dir = dir;
        }
        if let Some(path) = env_path("VISAGE_WORKER_SOCKET") {
            config.worker_socket = path;
        }
        if let Some(path) = env_path("VISAGE_WORKER_SCRIPT") {
            config.worker_script = path;
        }
        if let Ok(cmd) = std::env::var("VISAGE_PYTHON") {
            if !cmd.trim().is_empty() {
                config.python_cmd = cmd;
            }
        }

        config
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn artifact_ttl(&self) -> Duration {
        Duration::from_secs(self.artifact_ttl_secs)
    }

    pub fn results_ttl(&self) -> Duration {
        Duration::from_secs(self.results_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|raw| raw.parse().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    let raw = std::env::var(key).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(PathBuf::from(trimmed))
    }
}

fn default_max_concurrent_jobs() -> usize {
    1
}

fn default_max_queue_depth() -> usize {
    8
}

fn default_job_timeout_secs() -> u64 {
    300
}

fn default_artifact_ttl_secs() -> u64 {
    3600
}

fn default_results_ttl_secs() -> u64 {
    86400
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("visage")
}

fn default_workspace_dir() -> PathBuf {
    data_dir().join("work")
}

fn default_results_dir() -> PathBuf {
    data_dir().join("results")
}

fn default_worker_socket() -> PathBuf {
    PathBuf::from("/tmp/visage_worker.sock")
}

fn default_worker_script() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("scripts/pipeline_worker.py")
}

fn default_python_cmd() -> String {
    "python3".to_string()
}
