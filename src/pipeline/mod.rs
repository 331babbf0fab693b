//! Dubbing pipeline: sequences the worker stages and owns the segments.
//!
//! # Architecture
//!
//! ```text
//! PipelineOrchestrator ── StageCommands ──▶ WorkerCommand
//!        │
//!        ├─ StageRunner::run_stage (ProcessSupervisor primary slot)
//!        │      └─ ProtocolEvent ─▶ fold into translated segments
//!        │
//!        ├─ SessionPaths  → .srt / audio_segments.json / batch_tasks.json
//!        │
//!        └─ PipelineEvent (mpsc) + SharedStatus ─▶ CLI / UI
//! ```
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use dubbing_pipeline::config::{AppConfig, AppPaths};
//! use dubbing_pipeline::pipeline::PipelineOrchestrator;
//! use dubbing_pipeline::process::{locate_worker, ProcessSupervisor};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load()?;
//!     let paths = AppPaths::resolve(&config);
//!     let worker = locate_worker(&config.worker, &paths)?;
//!
//!     let mut orchestrator = PipelineOrchestrator::new(
//!         Arc::new(ProcessSupervisor::new()),
//!         worker,
//!         config,
//!         paths,
//!     );
//!     let outcome = orchestrator.one_click_run(Path::new("talk.mp4")).await;
//!     println!("{outcome}");
//!     Ok(())
//! }
//! ```

pub mod artifacts;
pub mod runner;
pub mod segment;
pub mod stage;
pub mod state;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use artifacts::{format_srt_time, parse_srt, read_srt, to_srt, SessionPaths};
pub use runner::{AbortHandle, PipelineError, PipelineOrchestrator, TRANSLATION_PLACEHOLDER};
pub use segment::{apply_partial, placeholders, sort_by_start, AudioStatus, Segment};
pub use stage::{Stage, StageCommands};
pub use state::{
    new_shared_status, PipelineEvent, PipelineState, PipelineStatus, RunOutcome, SharedStatus,
};
