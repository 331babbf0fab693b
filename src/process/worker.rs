//! Spawning a worker and driving it to completion.
//!
//! ```text
//!  spawn_worker()
//!      │  tokio::process::Child (own process group on Unix)
//!      ▼
//!  driver task ── select! ──┬─ stdout chunk ─▶ StreamProtocolParser ─▶ JobHandle events
//!                           │                                       └▶ Subscribers
//!                           ├─ stderr chunk ─▶ accumulated, mirrored to log
//!                           └─ kill signal  ─▶ start_kill, stop reading
//!      │
//!      ▼  child.wait()
//!  JobResult::from_exit ─▶ on_exit(id) ─▶ JobHandle result
//! ```
//!
//! The driver is the only owner of the parser, so events reach the handle in
//! stream order and all of them are sent before the result.

use std::io;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{ProtocolEvent, StreamProtocolParser};

use super::command::WorkerCommand;
use super::job::{JobHandle, JobId, JobInfo, JobResult, SPAWN_FAILURE_EXIT_CODE};
use super::kill::kill_tree;

const READ_CHUNK: usize = 8 * 1024;

// ---------------------------------------------------------------------------
// Event fan-out
// ---------------------------------------------------------------------------

/// A protocol event tagged with the job that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEvent {
    pub job: JobId,
    /// Registry key for named downloads, `None` for the primary job.
    pub key: Option<String>,
    pub event: ProtocolEvent,
}

/// Fan-out list of event subscribers shared by the supervisor and the
/// download registry.  Closed receivers are pruned on the next publish.
#[derive(Debug, Clone, Default)]
pub struct Subscribers(Arc<Mutex<Vec<mpsc::UnboundedSender<JobEvent>>>>);

impl Subscribers {
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<JobEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn publish(&self, event: &JobEvent) {
        self.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<JobEvent>>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ---------------------------------------------------------------------------
// OutputSink
// ---------------------------------------------------------------------------

/// Receives a copy of everything a worker writes, e.g. a download log file.
///
/// Implementations must not fail the job: I/O problems are theirs to log.
pub trait OutputSink: Send {
    fn stdout(&mut self, chunk: &[u8]);
    fn stderr(&mut self, chunk: &[u8]);
    fn finish(&mut self, exit_code: i32);
}

// ---------------------------------------------------------------------------
// ActiveJob
// ---------------------------------------------------------------------------

/// The supervisor's record of a running worker.
#[derive(Debug)]
pub(crate) struct ActiveJob {
    pub info: JobInfo,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ActiveJob {
    /// Kill the worker's process tree and tell the driver to stop reading.
    ///
    /// Kill errors are logged; the record is consumed regardless.
    pub fn terminate(mut self) {
        if let Some(pid) = self.info.pid {
            if let Err(e) = kill_tree(pid) {
                log::warn!("supervisor: failed to kill job {} (pid {pid}): {e}", self.info.id);
            }
        }
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }
}

// ---------------------------------------------------------------------------
// spawn_worker
// ---------------------------------------------------------------------------

/// Spawn `command` and start its driver task.
///
/// `on_exit` runs on the driver task after the process has exited and
/// before the result is delivered; callers use it to clear their slot.
/// On spawn failure nothing is started and `on_exit` is never called.
pub(crate) fn spawn_worker<F>(
    mut info: JobInfo,
    command: &WorkerCommand,
    mut sink: Option<Box<dyn OutputSink>>,
    subscribers: Subscribers,
    on_exit: F,
) -> io::Result<(JobHandle, ActiveJob)>
where
    F: FnOnce(JobId) + Send + 'static,
{
    let mut child = match command.to_tokio_command().spawn() {
        Ok(child) => child,
        Err(e) => {
            log::error!(
                "supervisor: failed to spawn job {} ({}): {e}",
                info.id,
                command.display()
            );
            if let Some(sink) = sink.as_mut() {
                sink.stderr(format!("failed to start {}: {e}\n", command.display()).as_bytes());
                sink.finish(SPAWN_FAILURE_EXIT_CODE);
            }
            return Err(e);
        }
    };

    info.pid = child.id();
    log::info!(
        "supervisor: started job {} (pid {:?}): {}",
        info.id,
        info.pid,
        command.display()
    );

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (result_tx, result_rx) = oneshot::channel();
    let (kill_tx, kill_rx) = oneshot::channel();

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let driver = Driver {
        id: info.id,
        key: info.key.clone(),
        events: event_tx,
        subscribers,
        sink,
    };

    tokio::spawn(async move {
        let id = driver.id;
        let result = driver.run(child, stdout, stderr, kill_rx).await;
        on_exit(id);
        let _ = result_tx.send(result);
    });

    let handle = JobHandle::new(info.clone(), event_rx, result_rx);
    let active = ActiveJob {
        info,
        kill_tx: Some(kill_tx),
    };
    Ok((handle, active))
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

struct Driver {
    id: JobId,
    key: Option<String>,
    events: mpsc::UnboundedSender<ProtocolEvent>,
    subscribers: Subscribers,
    sink: Option<Box<dyn OutputSink>>,
}

impl Driver {
    async fn run<O, E>(
        mut self,
        mut child: Child,
        mut stdout: Option<O>,
        mut stderr: Option<E>,
        mut kill_rx: oneshot::Receiver<()>,
    ) -> JobResult
    where
        O: AsyncRead + Unpin,
        E: AsyncRead + Unpin,
    {
        let mut parser = StreamProtocolParser::new();
        let mut out_buf = vec![0u8; READ_CHUNK];
        let mut err_buf = vec![0u8; READ_CHUNK];
        // A dropped sender means the record was discarded without a kill.
        let mut kill_armed = true;
        let mut killed = false;

        while stdout.is_some() || stderr.is_some() {
            tokio::select! {
                read = read_some(&mut stdout, &mut out_buf) => match read {
                    Ok(0) => stdout = None,
                    Ok(n) => {
                        let chunk = &out_buf[..n];
                        if let Some(sink) = self.sink.as_mut() {
                            sink.stdout(chunk);
                        }
                        for event in parser.push_stdout(chunk) {
                            self.emit(event);
                        }
                    }
                    Err(e) => {
                        log::warn!("supervisor: job {} stdout read failed: {e}", self.id);
                        stdout = None;
                    }
                },
                read = read_some(&mut stderr, &mut err_buf) => match read {
                    Ok(0) => stderr = None,
                    Ok(n) => {
                        let chunk = &err_buf[..n];
                        if let Some(sink) = self.sink.as_mut() {
                            sink.stderr(chunk);
                        }
                        let text = String::from_utf8_lossy(chunk);
                        let text = text.trim_end();
                        if !text.is_empty() {
                            log::warn!("worker {} stderr: {text}", self.id);
                        }
                        parser.push_stderr(chunk);
                    }
                    Err(e) => {
                        log::warn!("supervisor: job {} stderr read failed: {e}", self.id);
                        stderr = None;
                    }
                },
                signal = &mut kill_rx, if kill_armed => {
                    kill_armed = false;
                    if signal.is_ok() {
                        killed = true;
                        break;
                    }
                }
            }
        }

        for event in parser.finish() {
            self.emit(event);
        }

        let status = loop {
            if killed {
                let _ = child.start_kill();
                break child.wait().await;
            }
            tokio::select! {
                status = child.wait() => break status,
                signal = &mut kill_rx, if kill_armed => {
                    kill_armed = false;
                    killed = signal.is_ok();
                }
            }
        };

        let result = match status {
            Ok(status) => {
                JobResult::from_exit(status.code(), &parser.stdout_text(), &parser.stderr_text())
            }
            Err(e) => {
                log::error!("supervisor: waiting on job {} failed: {e}", self.id);
                JobResult::from_exit(None, &parser.stdout_text(), &parser.stderr_text())
            }
        };

        if let Some(sink) = self.sink.as_mut() {
            sink.finish(result.exit_code());
        }

        if killed {
            log::info!("supervisor: job {} killed", self.id);
        } else {
            log::info!("supervisor: job {} exited with code {}", self.id, result.exit_code());
        }
        result
    }

    fn emit(&self, event: ProtocolEvent) {
        match &event {
            ProtocolEvent::Raw { text } => log::debug!("worker {} stdout: {text}", self.id),
            other => log::debug!("worker {}: {other:?}", self.id),
        }
        self.subscribers.publish(&JobEvent {
            job: self.id,
            key: self.key.clone(),
            event: event.clone(),
        });
        // The handle may have been dropped; the job still runs to completion.
        let _ = self.events.send(event);
    }
}

async fn read_some<R>(reader: &mut Option<R>, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match reader {
        Some(r) => r.read(buf).await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::job::{JobIds, JobKind};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn info(ids: &JobIds) -> JobInfo {
        JobInfo {
            id: ids.next(),
            key: None,
            pid: None,
            started_at: chrono::Utc::now(),
            kind: JobKind::Primary,
            program: "sh".into(),
        }
    }

    fn sh(script: &str) -> WorkerCommand {
        WorkerCommand::new("sh").arg("-c").arg(script)
    }

    #[derive(Default, Clone)]
    struct Recorded(Arc<Mutex<(Vec<u8>, Vec<u8>, Option<i32>)>>);

    impl OutputSink for Recorded {
        fn stdout(&mut self, chunk: &[u8]) {
            self.0.lock().unwrap().0.extend_from_slice(chunk);
        }
        fn stderr(&mut self, chunk: &[u8]) {
            self.0.lock().unwrap().1.extend_from_slice(chunk);
        }
        fn finish(&mut self, exit_code: i32) {
            self.0.lock().unwrap().2 = Some(exit_code);
        }
    }

    #[tokio::test]
    async fn events_and_envelope_from_a_real_process() {
        let ids = JobIds::default();
        let (handle, _active) = spawn_worker(
            info(&ids),
            &sh(r#"echo '[PROGRESS] 10'; echo hello; echo '__JSON_START__{"ok":true}__JSON_END__'"#),
            None,
            Subscribers::default(),
            |_| {},
        )
        .expect("spawn");

        let mut events = Vec::new();
        let result = handle.wait_with(|e| events.push(e)).await;

        assert_eq!(events[0], ProtocolEvent::Progress { percent: 10 });
        assert_eq!(events[1], ProtocolEvent::Raw { text: "hello".into() });
        assert_eq!(result, JobResult::Success { payload: serde_json::json!({"ok": true}) });
    }

    #[tokio::test]
    async fn sink_sees_both_streams_and_exit_code() {
        let ids = JobIds::default();
        let sink = Recorded::default();
        let (handle, _active) = spawn_worker(
            info(&ids),
            &sh("echo out; echo err 1>&2; exit 4"),
            Some(Box::new(sink.clone())),
            Subscribers::default(),
            |_| {},
        )
        .expect("spawn");

        let result = handle.wait().await;
        assert_eq!(result.exit_code(), 4);

        let (out, err, code) = sink.0.lock().unwrap().clone();
        assert_eq!(out, b"out\n");
        assert_eq!(err, b"err\n");
        assert_eq!(code, Some(4));
    }

    #[tokio::test]
    async fn subscribers_receive_tagged_events() {
        let ids = JobIds::default();
        let subscribers = Subscribers::default();
        let mut rx = subscribers.subscribe();
        let mut job = info(&ids);
        job.key = Some("whisperx".into());
        let id = job.id;

        let (handle, _active) =
            spawn_worker(job, &sh("echo '[DEPS_DONE]'"), None, subscribers, |_| {}).expect("spawn");
        handle.wait().await;

        let event = rx.recv().await.expect("event");
        assert_eq!(event.job, id);
        assert_eq!(event.key.as_deref(), Some("whisperx"));
        assert_eq!(event.event, ProtocolEvent::DepsDone);
    }

    #[tokio::test]
    async fn terminate_ends_a_long_running_worker() {
        let ids = JobIds::default();
        let exited = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&exited);
        let (handle, active) = spawn_worker(
            info(&ids),
            &sh("echo started; sleep 30"),
            None,
            Subscribers::default(),
            move |_| flag.store(true, Ordering::SeqCst),
        )
        .expect("spawn");

        active.terminate();

        let result = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("worker should stop after terminate");
        assert!(!result.is_success());
        assert!(exited.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn dropping_the_record_does_not_kill() {
        let ids = JobIds::default();
        let (handle, active) = spawn_worker(
            info(&ids),
            &sh("sleep 0.2; echo '__JSON_START__1__JSON_END__'"),
            None,
            Subscribers::default(),
            |_| {},
        )
        .expect("spawn");

        drop(active);
        assert!(handle.wait().await.is_success());
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let ids = JobIds::default();
        let sink = Recorded::default();
        let err = spawn_worker(
            info(&ids),
            &WorkerCommand::new("/nonexistent/definitely-not-here"),
            Some(Box::new(sink.clone())),
            Subscribers::default(),
            |_| panic!("on_exit must not run"),
        )
        .expect_err("spawn should fail");

        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert_eq!(sink.0.lock().unwrap().2, Some(SPAWN_FAILURE_EXIT_CODE));
    }
}
