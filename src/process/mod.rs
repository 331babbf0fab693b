//! Worker process supervision.
//!
//! A worker is any executable that speaks the stdout protocol in
//! [`crate::protocol`].  This module spawns workers, pumps their output
//! through the parser, tracks the single primary job, and kills process
//! trees on request.
//!
//! ```text
//! WorkerCommand ──▶ ProcessSupervisor::launch_primary ──▶ JobHandle
//!                          │                                 ├─ next_event()
//!                          │ primary slot                    └─ wait() → JobResult
//!                          ▼
//!                   kill_primary() ──▶ kill_tree(pid)
//! ```
//!
//! [`locate`] resolves the interpreter and worker script on disk.

pub mod command;
pub mod job;
pub mod kill;
pub mod locate;
pub mod supervisor;
pub mod worker;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use command::WorkerCommand;
pub use job::{
    JobHandle, JobId, JobIds, JobInfo, JobKind, JobResult, SIGNALLED_EXIT_CODE,
    SPAWN_FAILURE_EXIT_CODE,
};
pub use kill::kill_tree;
pub use locate::{locate_worker, Candidate, LocateError, Locator, WorkerLocation};
pub use supervisor::{ProcessSupervisor, StageRunner, SuperviseError};
pub use worker::{JobEvent, OutputSink, Subscribers};
