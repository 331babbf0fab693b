//! Pipeline state machine, events and the shared status snapshot.
//!
//! [`PipelineState`] drives the orchestrator's state machine.  Observers
//! either read it from [`SharedStatus`] or receive [`PipelineEvent`]s over
//! the orchestrator's event channel.

use std::sync::{Arc, Mutex};

use super::segment::Segment;

// ---------------------------------------------------------------------------
// PipelineState
// ---------------------------------------------------------------------------

/// States of the dubbing pipeline.
///
/// ```text
/// Idle ─▶ Recognizing ─▶ Translating ─▶ Synthesizing ─▶ Merging ─▶ Idle
///              │               │               │            │
///              └───────────────┴───── abort ───┴────────────┴─▶ Aborted ─▶ Idle
///              └───────────────┴── failure ────┴────────────┴─▶ Failed  ─▶ Idle
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PipelineState {
    /// Nothing running.
    #[default]
    Idle,

    /// Speech recognition worker running.
    Recognizing,

    /// Translation worker running.
    Translating,

    /// Speech synthesis worker running.
    Synthesizing,

    /// Audio/video merge worker running.
    Merging,

    /// The last run was stopped by the user.
    Aborted,

    /// The last run halted on a stage failure.
    Failed,
}

impl PipelineState {
    /// Returns `true` while a stage worker is running.
    ///
    /// ```
    /// use dubbing_pipeline::pipeline::PipelineState;
    ///
    /// assert!(!PipelineState::Idle.is_busy());
    /// assert!(PipelineState::Recognizing.is_busy());
    /// assert!(PipelineState::Merging.is_busy());
    /// assert!(!PipelineState::Aborted.is_busy());
    /// assert!(!PipelineState::Failed.is_busy());
    /// ```
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            PipelineState::Recognizing
                | PipelineState::Translating
                | PipelineState::Synthesizing
                | PipelineState::Merging
        )
    }

    /// A short human-readable label for status lines.
    pub fn label(&self) -> &'static str {
        match self {
            PipelineState::Idle => "Idle",
            PipelineState::Recognizing => "Recognizing speech",
            PipelineState::Translating => "Translating",
            PipelineState::Synthesizing => "Synthesizing speech",
            PipelineState::Merging => "Merging video",
            PipelineState::Aborted => "Stopped",
            PipelineState::Failed => "Failed",
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineEvent
// ---------------------------------------------------------------------------

/// Notifications emitted by the orchestrator while it works.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    StateChanged(PipelineState),
    Progress(u8),
    /// A segment of the translated collection changed.
    SegmentUpdated { index: usize, segment: Segment },
    /// Recognition replaced the source collection.
    SourceReplaced(Vec<Segment>),
    /// The translated collection was replaced wholesale.
    TranslatedReplaced(Vec<Segment>),
    DepsInstalling(String),
    DepsDone,
    /// A worker log line.
    Log(String),
}

// ---------------------------------------------------------------------------
// RunOutcome
// ---------------------------------------------------------------------------

/// How a top-level run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// All stages finished; carries the merged video path when one was made.
    Completed { output: Option<String> },
    /// The user stopped the run.
    Stopped,
    /// A stage failed; carries the rendered error.
    Failed { message: String },
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed { .. })
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Completed { output: Some(path) } => write!(f, "completed: {path}"),
            RunOutcome::Completed { output: None } => write!(f, "completed"),
            RunOutcome::Stopped => write!(f, "stopped by user"),
            RunOutcome::Failed { message } => write!(f, "failed: {message}"),
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineStatus / SharedStatus
// ---------------------------------------------------------------------------

/// Snapshot of what the pipeline is doing, for pollers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineStatus {
    pub state: PipelineState,
    /// Last reported progress of the running stage.
    pub progress: Option<u8>,
    /// Package being installed by the worker, if any.
    pub installing: Option<String>,
    /// Message of the last failure.
    pub error_message: Option<String>,
    /// Path of the last merged video.
    pub merged_output: Option<String>,
}

/// Thread-safe handle to [`PipelineStatus`].
///
/// Cheap to clone.  Do **not** hold the lock across `.await` points.
pub type SharedStatus = Arc<Mutex<PipelineStatus>>;

pub fn new_shared_status() -> SharedStatus {
    Arc::new(Mutex::new(PipelineStatus::default()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
