//! Control plane: the operations a UI or CLI drives the backend with.
//!
//! # Architecture
//!
//! [`ControlPlane`] owns one [`ProcessSupervisor`] (the primary inference
//! slot) and one [`DownloadRegistry`] (keyed background jobs).  Both draw
//! job ids from the same counter and publish to the same subscriber list,
//! so a single [`subscribe`](ControlPlane::subscribe) receiver sees every
//! event.
//!
//! | Operation | Result |
//! |-----------|--------|
//! | `launch_stage(stage, args)` | `JobResult` once the worker exits |
//! | `cancel_primary()` | always `true` |
//! | `start_named_job(key, spec)` | `JobHandle` |
//! | `cancel_named_job(key)` | `CancelOutcome { success, reason }` |
//! | `subscribe()` | `JobEvent` stream |

use std::ffi::OsString;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::{AppConfig, AppPaths};
use crate::download::{CancelOutcome, DownloadLog, DownloadOutcome, DownloadRegistry, DownloadSpec};
use crate::models::{check_models, ModelStatus};
use crate::pipeline::{PipelineOrchestrator, Stage, StageCommands};
use crate::process::{
    locate_worker, JobEvent, JobHandle, JobIds, JobResult, LocateError, OutputSink,
    ProcessSupervisor, Subscribers, SuperviseError, WorkerLocation,
};

pub struct ControlPlane {
    config: AppConfig,
    paths: AppPaths,
    worker: WorkerLocation,
    supervisor: ProcessSupervisor,
    downloads: DownloadRegistry,
    subscribers: Subscribers,
}

impl ControlPlane {
    pub fn new(config: AppConfig, paths: AppPaths, worker: WorkerLocation) -> Self {
        let ids = JobIds::default();
        let subscribers = Subscribers::default();
        Self {
            supervisor: ProcessSupervisor::with_shared(ids.clone(), subscribers.clone()),
            downloads: DownloadRegistry::with_shared(ids, subscribers.clone()),
            subscribers,
            config,
            paths,
            worker,
        }
    }

    /// Resolve paths and locate the worker for `config`.
    pub fn from_config(config: AppConfig) -> Result<Self, LocateError> {
        let paths = AppPaths::resolve(&config);
        let worker = locate_worker(&config.worker, &paths)?;
        log::info!(
            "locate: python {} / worker {} / models {}",
            worker.python.display(),
            worker.script.display(),
            worker.models_dir.display()
        );
        Ok(Self::new(config, paths, worker))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn worker(&self) -> &WorkerLocation {
        &self.worker
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn downloads(&self) -> &DownloadRegistry {
        &self.downloads
    }

    // -----------------------------------------------------------------------
    // Primary slot
    // -----------------------------------------------------------------------

    /// Run `stage` in the primary slot with caller-supplied flags and wait
    /// for the result.  Rejected if a primary job is already running.
    pub async fn launch_stage<I, S>(&self, stage: Stage, args: I) -> Result<JobResult, SuperviseError>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let command = StageCommands::new(&self.worker, &self.config).custom(stage.action(), args);
        let handle = self.supervisor.launch_primary(command)?;
        Ok(handle.wait().await)
    }

    pub fn cancel_primary(&self) -> bool {
        self.supervisor.kill_primary()
    }

    /// A pipeline orchestrator that runs its stages in this control plane's
    /// primary slot.
    pub fn orchestrator(&self) -> PipelineOrchestrator {
        PipelineOrchestrator::new(
            Arc::new(self.supervisor.clone()),
            self.worker.clone(),
            self.config.clone(),
            self.paths.clone(),
        )
    }

    // -----------------------------------------------------------------------
    // Named jobs
    // -----------------------------------------------------------------------

    /// Start a download under `key` ([`DownloadSpec::default_key`] when `None`).
    ///
    /// The target directory is created first.  Output goes to the download
    /// log when logging is enabled.
    pub fn start_named_job(&self, key: Option<&str>, spec: &DownloadSpec) -> std::io::Result<JobHandle> {
        let key = key.map_or_else(|| spec.default_key(), str::to_owned);
        let models_root = &self.worker.models_dir;
        let target = spec.prepare(models_root)?;
        log::info!("downloads: {key} → {}", target.display());

        let sink: Option<Box<dyn OutputSink>> = if self.config.download.write_log {
            Some(Box::new(DownloadLog::open(
                &self.paths.log_file,
                spec.log_label(),
                &spec.describe(models_root),
            )))
        } else {
            None
        };

        let command = spec.command(&self.worker.python, models_root);
        Ok(self.downloads.start_with_sink(&key, command, sink))
    }

    pub fn cancel_named_job(&self, key: &str) -> CancelOutcome {
        self.downloads.cancel(key)
    }

    /// Start a download and wait for it, reporting `{success, error}`.
    pub async fn download(&self, key: Option<&str>, spec: &DownloadSpec) -> DownloadOutcome {
        match self.start_named_job(key, spec) {
            Ok(handle) => DownloadOutcome::from_result(&handle.wait().await),
            Err(e) => DownloadOutcome::failed(format!("failed to prepare download: {e}")),
        }
    }

    // -----------------------------------------------------------------------
    // Events and status
    // -----------------------------------------------------------------------

    /// Events of every job started after this call, primary and named.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<JobEvent> {
        self.subscribers.subscribe()
    }

    pub fn model_status(&self) -> Vec<ModelStatus> {
        check_models(&self.worker.models_dir)
    }

    /// Kill every running job.  Used on shutdown.
    pub fn shutdown(&self) {
        self.supervisor.kill_primary();
        let cancelled = self.downloads.cancel_all();
        if cancelled > 0 {
            log::info!("downloads: cancelled {cancelled} running job(s) on shutdown");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn control_plane(dir: &Path, python: &str) -> ControlPlane {
        let paths = AppPaths {
            config_dir: dir.to_path_buf(),
            settings_file: dir.join("settings.toml"),
            models_dir: dir.join("models"),
            output_dir: dir.join("out"),
            cache_dir: dir.join("cache"),
            log_file: dir.join("logs").join("backend_debug.log"),
        };
        let worker = WorkerLocation {
            python: python.into(),
            script: dir.join("backend").join("main.py"),
            models_dir: dir.join("models"),
        };
        ControlPlane::new(AppConfig::default(), paths, worker)
    }

    #[test]
    fn cancel_primary_with_nothing_running() {
        let dir = tempfile::tempdir().unwrap();
        let cp = control_plane(dir.path(), "python3");
        assert!(cp.cancel_primary());
    }

    #[test]
    fn cancel_unknown_named_job_is_soft_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cp = control_plane(dir.path(), "python3");
        let outcome = cp.cancel_named_job("whisperx");
        assert!(!outcome.success);
        assert_eq!(outcome.reason.as_deref(), Some("not found"));
    }

    #[tokio::test]
    async fn launch_stage_reports_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cp = control_plane(dir.path(), "/nonexistent/python");

        let result = cp.launch_stage(Stage::Recognize, ["--input", "a.mp4"]).await.unwrap();

        assert!(result.is_spawn_failure());
        assert!(!cp.supervisor().is_busy());
    }

    #[tokio::test]
    async fn failed_download_prepares_dir_and_writes_log() {
        let dir = tempfile::tempdir().unwrap();
        let cp = control_plane(dir.path(), "/nonexistent/python");
        let spec = DownloadSpec::Model {
            model_id: "org/model".into(),
            local_dir: "models/whisperx".into(),
        };

        let outcome = cp.download(None, &spec).await;

        assert!(!outcome.success);
        assert!(outcome.error.unwrap().starts_with("Process failed (Code -2)."));
        assert!(dir.path().join("models").join("whisperx").is_dir());

        let log = std::fs::read_to_string(&cp.paths().log_file).unwrap();
        assert!(log.contains("[DownloadModel] Starting download: org/model"));
        assert!(log.contains("[DownloadModel] Finished with code -2"));
        assert!(cp.downloads().is_empty());
    }

    #[test]
    fn model_status_lists_the_catalogue() {
        let dir = tempfile::tempdir().unwrap();
        let cp = control_plane(dir.path(), "python3");
        std::fs::create_dir_all(dir.path().join("models").join("rife")).unwrap();

        let status = cp.model_status();
        assert!(status.iter().any(|s| s.key == "rife" && s.installed));
        assert!(status.iter().any(|s| s.key == "whisperx" && !s.installed));
    }
}
