//! Job identity, results, and the handle returned to callers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{extract_envelope, Envelope, ProtocolEvent};

/// Exit code reported when the worker could not be started at all.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = -2;

/// Exit code reported when the worker died without one (killed by a signal).
pub const SIGNALLED_EXIT_CODE: i32 = -1;

// ---------------------------------------------------------------------------
// JobId
// ---------------------------------------------------------------------------

/// Unique identifier of a spawned worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Shared id counter so the primary slot and the download registry never
/// hand out the same [`JobId`].
#[derive(Debug, Clone, Default)]
pub struct JobIds(Arc<AtomicU64>);

impl JobIds {
    pub fn next(&self) -> JobId {
        JobId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

// ---------------------------------------------------------------------------
// JobInfo
// ---------------------------------------------------------------------------

/// Which slot a job occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// The single inference-stage slot.
    Primary,
    /// An independently cancellable download tracked by key.
    NamedDownload,
}

/// Bookkeeping for a tracked job.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub id: JobId,
    /// Registry key; `None` for the primary job.
    pub key: Option<String>,
    /// OS process id, when the spawn succeeded.
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub kind: JobKind,
    /// Program that was launched, for log messages.
    pub program: String,
}

// ---------------------------------------------------------------------------
// JobResult
// ---------------------------------------------------------------------------

/// Terminal outcome of one worker process.  Produced exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    /// Exit code 0.  `payload` is the envelope JSON, or a
    /// `{"rawOutput", "rawError"}` object when the envelope was missing.
    Success { payload: Value },

    /// Non-zero exit, spawn failure, or an unparseable envelope.
    Failure {
        exit_code: i32,
        stderr: String,
        parse_error: Option<String>,
    },
}

impl JobResult {
    /// Build the result for a worker that exited with `exit_code`.
    pub fn from_exit(exit_code: Option<i32>, stdout: &str, stderr: &str) -> Self {
        let exit_code = exit_code.unwrap_or(SIGNALLED_EXIT_CODE);
        if exit_code != 0 {
            return JobResult::Failure {
                exit_code,
                stderr: stderr.to_string(),
                parse_error: None,
            };
        }

        match extract_envelope(stdout) {
            Envelope::Payload(payload) => JobResult::Success { payload },
            Envelope::Missing => {
                log::warn!("worker exited cleanly without a JSON envelope; returning raw output");
                JobResult::Success {
                    payload: json!({ "rawOutput": stdout, "rawError": stderr }),
                }
            }
            Envelope::Malformed { error } => JobResult::Failure {
                exit_code,
                stderr: stderr.to_string(),
                parse_error: Some(format!(
                    "failed to parse worker output: {error}\n--- raw output ---\n{stdout}"
                )),
            },
        }
    }

    /// Result for a worker whose executable could not be started.
    pub fn spawn_failure(program: &str, err: &std::io::Error) -> Self {
        JobResult::Failure {
            exit_code: SPAWN_FAILURE_EXIT_CODE,
            stderr: format!("failed to start {program}: {err}"),
            parse_error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobResult::Success { .. })
    }

    pub fn is_spawn_failure(&self) -> bool {
        matches!(
            self,
            JobResult::Failure {
                exit_code: SPAWN_FAILURE_EXIT_CODE,
                ..
            }
        )
    }

    /// `true` for a clean exit that printed no envelope.
    pub fn is_raw_output(&self) -> bool {
        self.payload()
            .and_then(Value::as_object)
            .is_some_and(|o| o.contains_key("rawOutput"))
    }

    pub fn payload(&self) -> Option<&Value> {
        match self {
            JobResult::Success { payload } => Some(payload),
            JobResult::Failure { .. } => None,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            JobResult::Success { .. } => 0,
            JobResult::Failure { exit_code, .. } => *exit_code,
        }
    }

    /// Human-readable failure text: the parse error if there is one,
    /// otherwise stderr.  Empty for successes.
    pub fn failure_message(&self) -> String {
        match self {
            JobResult::Success { .. } => String::new(),
            JobResult::Failure {
                parse_error: Some(e),
                ..
            } => e.clone(),
            JobResult::Failure { stderr, .. } => stderr.trim().to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// JobHandle
// ---------------------------------------------------------------------------

/// Caller's end of a running job: its event stream plus its final result.
///
/// Events are delivered in the order the worker printed them and all of
/// them arrive before the result resolves.
pub struct JobHandle {
    info: JobInfo,
    events: mpsc::UnboundedReceiver<ProtocolEvent>,
    result: oneshot::Receiver<JobResult>,
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl JobHandle {
    pub(crate) fn new(
        info: JobInfo,
        events: mpsc::UnboundedReceiver<ProtocolEvent>,
        result: oneshot::Receiver<JobResult>,
    ) -> Self {
        Self {
            info,
            events,
            result,
        }
    }

    /// A handle that is already complete, with no events.
    pub fn resolved(info: JobInfo, result: JobResult) -> Self {
        let (_, events) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = oneshot::channel();
        let _ = result_tx.send(result);
        Self::new(info, events, result_rx)
    }

    pub fn id(&self) -> JobId {
        self.info.id
    }

    pub fn info(&self) -> &JobInfo {
        &self.info
    }

    /// Next protocol event, or `None` once the worker's stdout is exhausted.
    pub async fn next_event(&mut self) -> Option<ProtocolEvent> {
        self.events.recv().await
    }

    /// Drain remaining events into `on_event`, then return the final result.
    pub async fn wait_with<F>(mut self, mut on_event: F) -> JobResult
    where
        F: FnMut(ProtocolEvent),
    {
        while let Some(event) = self.events.recv().await {
            on_event(event);
        }
        self.result.await.unwrap_or_else(|_| JobResult::Failure {
            exit_code: SIGNALLED_EXIT_CODE,
            stderr: "worker task ended without reporting a result".into(),
            parse_error: None,
        })
    }

    /// Discard events and return the final result.
    pub async fn wait(self) -> JobResult {
        self.wait_with(|_| {}).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> JobInfo {
        JobInfo {
            id: JobId(7),
            key: None,
            pid: None,
            started_at: Utc::now(),
            kind: JobKind::Primary,
            program: "python".into(),
        }
    }

    #[test]
    fn clean_exit_with_envelope_is_success() {
        let r = JobResult::from_exit(Some(0), "__JSON_START__{\"a\":1}__JSON_END__", "");
        assert_eq!(r, JobResult::Success { payload: json!({"a": 1}) });
        assert!(!r.is_raw_output());
    }

    #[test]
    fn clean_exit_without_envelope_is_soft_success() {
        let r = JobResult::from_exit(Some(0), "just logs\n", "warn\n");
        assert!(r.is_success());
        assert!(r.is_raw_output());
        assert_eq!(r.payload().unwrap()["rawOutput"], "just logs\n");
        assert_eq!(r.payload().unwrap()["rawError"], "warn\n");
    }

    #[test]
    fn non_zero_exit_is_failure_with_stderr() {
        let r = JobResult::from_exit(Some(3), "__JSON_START__{}__JSON_END__", "boom");
        assert_eq!(
            r,
            JobResult::Failure {
                exit_code: 3,
                stderr: "boom".into(),
                parse_error: None
            }
        );
        assert_eq!(r.failure_message(), "boom");
    }

    #[test]
    fn missing_exit_code_maps_to_signalled() {
        assert_eq!(JobResult::from_exit(None, "", "").exit_code(), SIGNALLED_EXIT_CODE);
    }

    #[test]
    fn malformed_envelope_keeps_raw_output() {
        let r = JobResult::from_exit(Some(0), "__JSON_START__{bad__JSON_END__", "");
        match r {
            JobResult::Failure {
                exit_code: 0,
                parse_error: Some(e),
                ..
            } => assert!(e.contains("{bad"), "raw text missing from {e}"),
            other => panic!("expected parse failure, got {other:?}"),
        }
    }

    #[test]
    fn spawn_failure_uses_sentinel_code() {
        let err = std::io::Error::from(std::io::ErrorKind::NotFound);
        let r = JobResult::spawn_failure("python", &err);
        assert!(r.is_spawn_failure());
        assert_eq!(r.exit_code(), SPAWN_FAILURE_EXIT_CODE);
        assert!(r.failure_message().contains("python"));
    }

    #[test]
    fn job_ids_are_unique_across_clones() {
        let ids = JobIds::default();
        let other = ids.clone();
        let a = ids.next();
        let b = other.next();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn resolved_handle_returns_result_without_events() {
        let mut handle = JobHandle::resolved(info(), JobResult::Success { payload: json!(1) });
        assert!(handle.next_event().await.is_none());
        assert_eq!(handle.wait().await, JobResult::Success { payload: json!(1) });
    }

    #[tokio::test]
    async fn wait_with_delivers_events_before_result() {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = oneshot::channel();
        event_tx.send(ProtocolEvent::Progress { percent: 5 }).unwrap();
        event_tx.send(ProtocolEvent::DepsDone).unwrap();
        drop(event_tx);
        result_tx.send(JobResult::Success { payload: json!(null) }).unwrap();

        let handle = JobHandle::new(info(), event_rx, result_rx);
        let mut seen = Vec::new();
        let result = handle.wait_with(|e| seen.push(e)).await;

        assert_eq!(
            seen,
            vec![ProtocolEvent::Progress { percent: 5 }, ProtocolEvent::DepsDone]
        );
        assert!(result.is_success());
    }
}
