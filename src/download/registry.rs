//! Keyed registry of concurrently running, independently cancellable jobs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde::Serialize;

use crate::process::worker::{spawn_worker, ActiveJob};
use crate::process::{
    JobHandle, JobIds, JobInfo, JobKind, JobResult, OutputSink, Subscribers, WorkerCommand,
};

/// Reply to [`DownloadRegistry::cancel`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CancelOutcome {
    fn cancelled() -> Self {
        Self {
            success: true,
            reason: None,
        }
    }

    fn not_found() -> Self {
        Self {
            success: false,
            reason: Some("not found".into()),
        }
    }
}

/// Running downloads indexed by an opaque key.
///
/// Cheap to clone; clones share the map.  Entries are removed on natural
/// exit only if they still belong to the job that exited.
#[derive(Debug, Clone, Default)]
pub struct DownloadRegistry {
    jobs: Arc<Mutex<HashMap<String, ActiveJob>>>,
    ids: JobIds,
    subscribers: Subscribers,
}

impl DownloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shared(ids: JobIds, subscribers: Subscribers) -> Self {
        Self {
            jobs: Arc::default(),
            ids,
            subscribers,
        }
    }

    /// Spawn `command` under `key`.
    ///
    /// Starting a key that is already tracked spawns a second process and
    /// replaces the entry; the earlier process keeps running untracked.
    pub fn start(&self, key: &str, command: WorkerCommand) -> JobHandle {
        self.start_with_sink(key, command, None)
    }

    /// Like [`start`](Self::start), copying all output into `sink`.
    pub fn start_with_sink(
        &self,
        key: &str,
        command: WorkerCommand,
        sink: Option<Box<dyn OutputSink>>,
    ) -> JobHandle {
        let mut jobs = self.lock();

        let info = JobInfo {
            id: self.ids.next(),
            key: Some(key.to_string()),
            pid: None,
            started_at: Utc::now(),
            kind: JobKind::NamedDownload,
            program: command.program.display().to_string(),
        };

        let map = Arc::clone(&self.jobs);
        let owned_key = key.to_string();
        let on_exit = move |id| {
            let mut jobs = map.lock().unwrap_or_else(|p| p.into_inner());
            if jobs.get(&owned_key).is_some_and(|a| a.info.id == id) {
                jobs.remove(&owned_key);
                log::debug!("downloads: {owned_key} finished and was removed");
            }
        };

        match spawn_worker(info.clone(), &command, sink, self.subscribers.clone(), on_exit) {
            Ok((handle, active)) => {
                if let Some(previous) = jobs.insert(key.to_string(), active) {
                    log::warn!(
                        "downloads: {key} restarted while job {} was still running; the old process is no longer tracked",
                        previous.info.id
                    );
                }
                log::info!("downloads: started {key} as job {}", handle.id());
                handle
            }
            Err(e) => JobHandle::resolved(
                info,
                JobResult::spawn_failure(&command.program.display().to_string(), &e),
            ),
        }
    }

    /// Kill the process tree tracked under `key` and forget it.
    pub fn cancel(&self, key: &str) -> CancelOutcome {
        let active = self.lock().remove(key);
        match active {
            Some(active) => {
                log::info!("downloads: cancelling {key} (job {})", active.info.id);
                active.terminate();
                CancelOutcome::cancelled()
            }
            None => {
                log::debug!("downloads: cancel for unknown key {key}");
                CancelOutcome::not_found()
            }
        }
    }

    /// Cancel everything; returns how many jobs were killed.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<ActiveJob> = self.lock().drain().map(|(_, a)| a).collect();
        let count = drained.len();
        for active in drained {
            active.terminate();
        }
        count
    }

    /// Tracked keys, sorted.
    pub fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn job(&self, key: &str) -> Option<JobInfo> {
        self.lock().get(key).map(|a| a.info.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ActiveJob>> {
        self.jobs.lock().unwrap_or_else(|p| p.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_unknown_key_reports_not_found() {
        let registry = DownloadRegistry::new();
        let outcome = registry.cancel("nope");
        assert!(!outcome.success);
        assert_eq!(outcome.reason.as_deref(), Some("not found"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn spawn_failure_is_not_tracked() {
        let registry = DownloadRegistry::new();
        let handle = registry.start("x", WorkerCommand::new("/nonexistent/downloader"));
        assert!(!registry.contains("x"));
        assert!(handle.wait().await.is_spawn_failure());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_kills_and_forgets() {
        let registry = DownloadRegistry::new();
        let handle = registry.start("qwen", WorkerCommand::new("sh").args(["-c", "sleep 30"]));
        assert_eq!(registry.active_keys(), vec!["qwen".to_string()]);

        let outcome = registry.cancel("qwen");
        assert_eq!(outcome, CancelOutcome { success: true, reason: None });
        assert!(!registry.contains("qwen"));
        assert!(!handle.wait().await.is_success());

        assert!(!registry.cancel("qwen").success);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn natural_exit_removes_entry() {
        let registry = DownloadRegistry::new();
        let handle = registry.start("quick", WorkerCommand::new("sh").args(["-c", "echo SUCCESS"]));
        handle.wait().await;
        assert!(!registry.contains("quick"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn restarted_key_is_not_removed_by_old_exit() {
        let registry = DownloadRegistry::new();
        let old = registry.start("k", WorkerCommand::new("sh").args(["-c", "sleep 0.1"]));
        let new = registry.start("k", WorkerCommand::new("sh").args(["-c", "sleep 30"]));
        let new_id = new.id();

        old.wait().await;
        assert_eq!(registry.job("k").map(|j| j.id), Some(new_id));

        assert!(registry.cancel("k").success);
        new.wait().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn independent_keys_run_concurrently() {
        let registry = DownloadRegistry::new();
        let a = registry.start("a", WorkerCommand::new("sh").args(["-c", "sleep 30"]));
        let b = registry.start("b", WorkerCommand::new("sh").args(["-c", "sleep 30"]));
        assert_eq!(registry.len(), 2);

        assert!(registry.cancel("a").success);
        assert_eq!(registry.active_keys(), vec!["b".to_string()]);

        assert_eq!(registry.cancel_all(), 1);
        a.wait().await;
        b.wait().await;
        assert!(registry.is_empty());
    }
}
