//! The primary-job slot and the [`StageRunner`] seam used by the pipeline.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::ProtocolEvent;

use super::command::WorkerCommand;
use super::job::{JobHandle, JobId, JobIds, JobInfo, JobKind, JobResult};
use super::worker::{spawn_worker, ActiveJob, JobEvent, Subscribers};

// ---------------------------------------------------------------------------
// SuperviseError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SuperviseError {
    /// A primary job is already tracked; kill it before launching another.
    #[error("a worker is already running (job {id})")]
    AlreadyRunning { id: JobId },
}

// ---------------------------------------------------------------------------
// StageRunner trait
// ---------------------------------------------------------------------------

/// Runs one pipeline stage to completion in the primary slot.
///
/// Implemented by [`ProcessSupervisor`]; the orchestrator only talks to this
/// trait so it can be exercised against a scripted runner in tests.
#[async_trait]
pub trait StageRunner: Send + Sync {
    /// Launch `command`, feed every event to `on_event` in stream order, and
    /// return the final result.
    async fn run_stage(
        &self,
        command: WorkerCommand,
        on_event: &mut (dyn FnMut(ProtocolEvent) + Send),
    ) -> Result<JobResult, SuperviseError>;

    /// Kill the running stage, if any.  Always returns `true`.
    fn kill(&self) -> bool;
}

// Compile-time assertion: Arc<dyn StageRunner> must be constructible.
const _: fn() = || {
    fn _assert_object_safe(_: Arc<dyn StageRunner>) {}
};

// ---------------------------------------------------------------------------
// ProcessSupervisor
// ---------------------------------------------------------------------------

/// Owns the single primary-job slot.
///
/// Cheap to clone; clones share the slot.  The slot mutex is never held
/// across an `.await`.
#[derive(Debug, Clone, Default)]
pub struct ProcessSupervisor {
    primary: Arc<Mutex<Option<ActiveJob>>>,
    ids: JobIds,
    subscribers: Subscribers,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share an id counter and subscriber list with a download registry.
    pub fn with_shared(ids: JobIds, subscribers: Subscribers) -> Self {
        Self {
            primary: Arc::default(),
            ids,
            subscribers,
        }
    }

    /// Receive every event of every primary job, tagged with its id.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<JobEvent> {
        self.subscribers.subscribe()
    }

    /// Spawn `command` into the primary slot.
    ///
    /// A spawn failure is not an error here: the returned handle resolves
    /// immediately to a `Failure` with the spawn sentinel exit code and the
    /// slot stays empty.
    pub fn launch_primary(&self, command: WorkerCommand) -> Result<JobHandle, SuperviseError> {
        let mut slot = self.lock();
        if let Some(active) = slot.as_ref() {
            log::warn!(
                "supervisor: rejected launch of {:?}, job {} still running",
                command.action(),
                active.info.id
            );
            return Err(SuperviseError::AlreadyRunning { id: active.info.id });
        }

        let info = JobInfo {
            id: self.ids.next(),
            key: None,
            pid: None,
            started_at: Utc::now(),
            kind: JobKind::Primary,
            program: command.program.display().to_string(),
        };

        let primary = Arc::clone(&self.primary);
        let on_exit = move |id: JobId| {
            let mut slot = primary.lock().unwrap_or_else(|p| p.into_inner());
            if slot.as_ref().is_some_and(|a| a.info.id == id) {
                *slot = None;
            }
        };

        match spawn_worker(info.clone(), &command, None, self.subscribers.clone(), on_exit) {
            Ok((handle, active)) => {
                *slot = Some(active);
                Ok(handle)
            }
            Err(e) => Ok(JobHandle::resolved(
                info,
                JobResult::spawn_failure(&command.program.display().to_string(), &e),
            )),
        }
    }

    /// Kill the primary job's process tree and clear the slot.
    ///
    /// Returns `true` whether or not anything was running and regardless of
    /// kill errors.
    pub fn kill_primary(&self) -> bool {
        let active = self.lock().take();
        match active {
            Some(active) => {
                log::info!("supervisor: killing primary job {}", active.info.id);
                active.terminate();
            }
            None => log::debug!("supervisor: kill requested with no primary job"),
        }
        true
    }

    pub fn primary_job(&self) -> Option<JobInfo> {
        self.lock().as_ref().map(|a| a.info.clone())
    }

    pub fn is_busy(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActiveJob>> {
        self.primary.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl StageRunner for ProcessSupervisor {
    async fn run_stage(
        &self,
        command: WorkerCommand,
        on_event: &mut (dyn FnMut(ProtocolEvent) + Send),
    ) -> Result<JobResult, SuperviseError> {
        let handle = self.launch_primary(command)?;
        Ok(handle.wait_with(|event| on_event(event)).await)
    }

    fn kill(&self) -> bool {
        self.kill_primary()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
