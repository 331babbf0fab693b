//! Pipeline orchestrator: recognize → translate → synthesize → merge.
//!
//! [`PipelineOrchestrator`] owns the segment collections and drives one
//! stage at a time through a [`StageRunner`] (the process supervisor in
//! production).
//!
//! # Stage flow
//!
//! ```text
//! one_click_run(video)
//!   └─▶ recognize      test_asr            → source (sorted by start)
//!         └─▶ translate      translate_text      → translated ("..." until done)
//!               └─▶ synthesize_all generate_batch_tts  → audio per segment
//!                     └─▶ merge          merge_video         → dubbed video
//! ```
//!
//! The abort flag is checked before each worker launches and again once it
//! resolves; a set flag halts the run without committing the stage's output.
//! Worker events are folded into the translated collection on the task that
//! awaits the stage, so nothing else mutates the segments.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::{AppConfig, AppPaths};
use crate::process::{JobResult, StageRunner, SuperviseError, WorkerCommand, WorkerLocation};
use crate::protocol::ProtocolEvent;

use super::artifacts::SessionPaths;
use super::segment::{apply_partial, placeholders, sort_by_start, AudioStatus, Segment};
use super::stage::{Stage, StageCommands};
use super::state::{
    new_shared_status, PipelineEvent, PipelineState, PipelineStatus, RunOutcome, SharedStatus,
};

/// Text shown in translated segments while translation streams in.
pub const TRANSLATION_PLACEHOLDER: &str = "...";

// ---------------------------------------------------------------------------
// PipelineError
// ---------------------------------------------------------------------------

/// Errors that halt a stage or a run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no input video selected")]
    NoInput,

    #[error("nothing to {stage}: no segments")]
    EmptyInput { stage: Stage },

    #[error("{stage} returned no segments")]
    EmptyResult { stage: Stage },

    /// The worker failed.  `exit_code` mirrors the process exit code, or the
    /// spawn/signal sentinels.
    #[error("{stage} failed (code {exit_code}): {message}")]
    Worker {
        stage: Stage,
        exit_code: i32,
        message: String,
    },

    #[error("{stage} returned an unexpected payload: {reason}")]
    InvalidPayload { stage: Stage, reason: String },

    #[error(transparent)]
    Supervise(#[from] SuperviseError),

    #[error("no segment has audio to merge")]
    NothingToMerge,

    #[error("segment {index} out of range ({len} segments)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("failed to write pipeline files: {0}")]
    Artifact(#[from] std::io::Error),

    /// The abort flag was set.  Not a failure.
    #[error("stopped by user")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// AbortHandle
// ---------------------------------------------------------------------------

/// Stops the orchestrator from another task (a Ctrl-C handler, a UI button).
#[derive(Clone)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
    runner: Arc<dyn StageRunner>,
}

impl AbortHandle {
    /// Set the abort flag and kill the running stage worker.
    pub fn kill_backend(&self) -> bool {
        log::info!("pipeline: stop requested");
        self.flag.store(true, Ordering::SeqCst);
        self.runner.kill()
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// PipelineOrchestrator
// ---------------------------------------------------------------------------

pub struct PipelineOrchestrator {
    runner: Arc<dyn StageRunner>,
    worker: WorkerLocation,
    config: AppConfig,
    paths: AppPaths,
    abort: Arc<AtomicBool>,
    status: SharedStatus,
    events: Option<mpsc::UnboundedSender<PipelineEvent>>,
    video: Option<PathBuf>,
    source: Vec<Segment>,
    translated: Vec<Segment>,
    merged_output: Option<String>,
}

impl PipelineOrchestrator {
    pub fn new(
        runner: Arc<dyn StageRunner>,
        worker: WorkerLocation,
        config: AppConfig,
        paths: AppPaths,
    ) -> Self {
        Self {
            runner,
            worker,
            config,
            paths,
            abort: Arc::new(AtomicBool::new(false)),
            status: new_shared_status(),
            events: None,
            video: None,
            source: Vec::new(),
            translated: Vec::new(),
            merged_output: None,
        }
    }

    /// Receive [`PipelineEvent`]s from now on.  Replaces any earlier
    /// subscription.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<PipelineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            flag: Arc::clone(&self.abort),
            runner: Arc::clone(&self.runner),
        }
    }

    /// Set the abort flag and kill the running stage.  The flag stays set
    /// until the next top-level run.
    pub fn kill_backend(&self) -> bool {
        self.abort_handle().kill_backend()
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SharedStatus {
        Arc::clone(&self.status)
    }

    pub fn state(&self) -> PipelineState {
        self.lock_status().state
    }

    pub fn source(&self) -> &[Segment] {
        &self.source
    }

    pub fn translated(&self) -> &[Segment] {
        &self.translated
    }

    pub fn video(&self) -> Option<&Path> {
        self.video.as_deref()
    }

    pub fn set_video(&mut self, video: impl Into<PathBuf>) {
        self.video = Some(video.into());
    }

    /// Replace the source segments (e.g. loaded from an edited subtitle
    /// file).  Sorted by start like recognition output.
    pub fn set_source(&mut self, mut segments: Vec<Segment>) {
        sort_by_start(&mut segments);
        self.source = segments;
        self.emit(PipelineEvent::SourceReplaced(self.source.clone()));
    }

    /// Replace the translated segments (e.g. loaded from a target-language
    /// subtitle file).  Any earlier audio is dropped so the segments are
    /// synthesized afresh.
    pub fn set_translated(&mut self, mut segments: Vec<Segment>) {
        for seg in &mut segments {
            seg.audio_path = None;
            seg.audio_status = AudioStatus::None;
        }
        self.translated = segments;
        self.merged_output = None;
        self.emit(PipelineEvent::TranslatedReplaced(self.translated.clone()));
    }

    pub fn merged_output(&self) -> Option<&str> {
        self.merged_output.as_deref()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Top-level runs
    // -----------------------------------------------------------------------

    /// Recognize, translate, synthesize and merge `video`.
    pub async fn one_click_run(&mut self, video: &Path) -> RunOutcome {
        self.begin_run();
        let result = self.one_click_inner(video).await;
        self.finish_run(result.map(Some))
    }

    async fn one_click_inner(&mut self, video: &Path) -> Result<String, PipelineError> {
        self.recognize(video).await?;
        self.dub_source_inner().await
    }

    /// Translate, synthesize and merge the current source segments (e.g.
    /// loaded with [`set_source`](Self::set_source)).
    pub async fn dub_source(&mut self) -> RunOutcome {
        self.begin_run();
        let result = self.dub_source_inner().await;
        self.finish_run(result.map(Some))
    }

    async fn dub_source_inner(&mut self) -> Result<String, PipelineError> {
        self.translate().await?;
        self.dub_translated_inner().await
    }

    /// Translate the current source segments and synthesize them.
    pub async fn translate_and_dub(&mut self) -> RunOutcome {
        self.begin_run();
        let result = self.translate_and_dub_inner().await;
        self.finish_run(result.map(|_| None))
    }

    async fn translate_and_dub_inner(&mut self) -> Result<usize, PipelineError> {
        self.translate().await?;
        self.synthesize_all().await
    }

    /// Synthesize and merge the current translated segments, skipping
    /// recognition and translation.
    pub async fn dub_translated(&mut self) -> RunOutcome {
        self.begin_run();
        let result = self.dub_translated_inner().await;
        self.finish_run(result.map(Some))
    }

    async fn dub_translated_inner(&mut self) -> Result<String, PipelineError> {
        self.synthesize_all().await?;
        self.merge().await
    }

    fn begin_run(&mut self) {
        self.abort.store(false, Ordering::SeqCst);
        let mut st = self.lock_status();
        st.error_message = None;
        st.progress = None;
    }

    fn finish_run(&mut self, result: Result<Option<String>, PipelineError>) -> RunOutcome {
        self.lock_status().installing = None;
        match result {
            Ok(output) => {
                log::info!("pipeline: run completed");
                self.set_state(PipelineState::Idle);
                RunOutcome::Completed { output }
            }
            Err(PipelineError::Cancelled) => {
                log::info!("pipeline: run stopped by user");
                self.set_state(PipelineState::Aborted);
                RunOutcome::Stopped
            }
            Err(e) => {
                let message = e.to_string();
                log::error!("pipeline error: {message}");
                self.lock_status().error_message = Some(message.clone());
                self.set_state(PipelineState::Failed);
                RunOutcome::Failed { message }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    /// Run speech recognition on `video`, replacing the source segments.
    /// Returns the number of segments recognised.
    pub async fn recognize(&mut self, video: &Path) -> Result<usize, PipelineError> {
        if video.as_os_str().is_empty() {
            return Err(PipelineError::NoInput);
        }
        let session = self.session_for(video);
        let command = self.commands().recognize(video, &session.cache_dir);
        let payload = self.run_stage(Stage::Recognize, command, true).await?;

        let mut segments = segments_from(Stage::Recognize, payload)?;
        if segments.is_empty() {
            return Err(PipelineError::EmptyResult {
                stage: Stage::Recognize,
            });
        }
        sort_by_start(&mut segments);
        session.write_recognition(&segments)?;

        log::info!("pipeline: recognised {} segments", segments.len());
        self.video = Some(video.to_path_buf());
        self.source = segments;
        self.translated.clear();
        self.merged_output = None;
        self.emit(PipelineEvent::SourceReplaced(self.source.clone()));
        self.emit(PipelineEvent::TranslatedReplaced(Vec::new()));
        Ok(self.source.len())
    }

    /// Translate every source segment into the target language.
    pub async fn translate(&mut self) -> Result<usize, PipelineError> {
        if self.source.is_empty() {
            return Err(PipelineError::EmptyInput {
                stage: Stage::Translate,
            });
        }
        self.check_abort()?;

        let input = serde_json::to_string(&self.source).map_err(|e| {
            PipelineError::InvalidPayload {
                stage: Stage::Translate,
                reason: e.to_string(),
            }
        })?;
        let command = self.commands().translate(&input);

        let previous = std::mem::replace(
            &mut self.translated,
            placeholders(&self.source, TRANSLATION_PLACEHOLDER),
        );
        self.emit(PipelineEvent::TranslatedReplaced(self.translated.clone()));

        let result = self.run_stage(Stage::Translate, command, true).await;
        let segments = match result.and_then(|p| segments_from(Stage::Translate, p)) {
            Ok(segments) if !segments.is_empty() => segments,
            Ok(_) => {
                self.restore_translated(previous);
                return Err(PipelineError::EmptyResult {
                    stage: Stage::Translate,
                });
            }
            Err(e) => {
                self.restore_translated(previous);
                return Err(e);
            }
        };

        log::info!("pipeline: translated {} segments", segments.len());
        self.translated = segments;
        self.emit(PipelineEvent::TranslatedReplaced(self.translated.clone()));
        Ok(self.translated.len())
    }

    /// Re-translate one segment from its source text.
    pub async fn retranslate_one(&mut self, index: usize) -> Result<String, PipelineError> {
        let len = self.translated.len().min(self.source.len());
        if index >= len {
            return Err(PipelineError::IndexOutOfRange { index, len });
        }
        self.abort.store(false, Ordering::SeqCst);
        let command = self.commands().translate(&self.source[index].text);
        let payload = self.run_stage(Stage::Translate, command, false).await;
        self.settle_single(&payload);
        let payload = payload?;

        let text = payload
            .get("text")
            .or_else(|| payload.get("segments").and_then(|s| s.get(0)?.get("text")))
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| PipelineError::InvalidPayload {
                stage: Stage::Translate,
                reason: "missing `text`".into(),
            })?;

        self.translated[index].text = text.clone();
        self.emit_segment(index);
        Ok(text)
    }

    /// Synthesize audio for every translated segment in one batch.
    /// Returns the number of segments that now have audio.
    pub async fn synthesize_all(&mut self) -> Result<usize, PipelineError> {
        let video = self.video.clone().ok_or(PipelineError::NoInput)?;
        if self.translated.is_empty() {
            return Err(PipelineError::EmptyInput {
                stage: Stage::Synthesize,
            });
        }
        self.check_abort()?;

        let session = self.session_for(&video);
        let tasks = session.write_batch_tasks(&self.translated)?;
        let command = self.commands().synthesize_batch(&video, &tasks);

        for seg in &mut self.translated {
            seg.audio_status = AudioStatus::Generating;
        }
        self.emit(PipelineEvent::TranslatedReplaced(self.translated.clone()));

        let payload = match self.run_stage(Stage::Synthesize, command, true).await {
            Ok(payload) => payload,
            Err(e) => {
                let fallback = match e {
                    PipelineError::Cancelled => AudioStatus::None,
                    _ => AudioStatus::Error,
                };
                self.settle_generating(fallback);
                return Err(e);
            }
        };

        let Some(results) = payload.get("results").and_then(Value::as_array) else {
            self.settle_generating(AudioStatus::Error);
            return Err(PipelineError::InvalidPayload {
                stage: Stage::Synthesize,
                reason: "missing `results` array".into(),
            });
        };

        for result in results {
            let (Some(index), Some(fields)) = (
                result.get("index").and_then(Value::as_u64),
                result.as_object(),
            ) else {
                log::warn!("pipeline: synthesis result without index: {result}");
                continue;
            };
            if let Some(error) = result.get("error").and_then(Value::as_str) {
                log::warn!("pipeline: segment {index} synthesis failed: {error}");
            }
            apply_partial(&mut self.translated, index as usize, fields);
        }
        self.settle_generating(AudioStatus::Error);
        self.emit(PipelineEvent::TranslatedReplaced(self.translated.clone()));

        let ready = self.translated.iter().filter(|s| s.has_audio()).count();
        log::info!(
            "pipeline: synthesized {ready}/{} segments",
            self.translated.len()
        );
        Ok(ready)
    }

    /// Synthesize (or re-synthesize) one translated segment.
    pub async fn synthesize_one(&mut self, index: usize) -> Result<String, PipelineError> {
        let video = self.video.clone().ok_or(PipelineError::NoInput)?;
        let len = self.translated.len();
        if index >= len {
            return Err(PipelineError::IndexOutOfRange { index, len });
        }

        self.abort.store(false, Ordering::SeqCst);
        let session = self.session_for(&video);
        std::fs::create_dir_all(&session.segments_dir)?;
        let output = session.segment_audio(index);
        let command = self
            .commands()
            .synthesize_one(&video, &output, &self.translated[index]);

        let previous = self.translated[index].audio_status;
        self.translated[index].audio_status = AudioStatus::Generating;
        self.emit_segment(index);

        let result = self.run_stage(Stage::SynthesizeOne, command, false).await;
        self.settle_single(&result);
        let path = result.and_then(|payload| {
            payload
                .get("audio_path")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .ok_or_else(|| PipelineError::InvalidPayload {
                    stage: Stage::SynthesizeOne,
                    reason: "missing `audio_path`".into(),
                })
        });

        match path {
            Ok(path) => {
                self.translated[index].set_audio(Some(path.clone()), true);
                self.emit_segment(index);
                Ok(path)
            }
            Err(e) => {
                self.translated[index].audio_status = match e {
                    PipelineError::Cancelled => previous,
                    _ => AudioStatus::Error,
                };
                self.emit_segment(index);
                Err(e)
            }
        }
    }

    /// Merge the synthesized audio back into the video.  Returns the path of
    /// the dubbed video.
    pub async fn merge(&mut self) -> Result<String, PipelineError> {
        let video = self.video.clone().ok_or(PipelineError::NoInput)?;
        if !self.translated.iter().any(Segment::has_audio) {
            return Err(PipelineError::NothingToMerge);
        }
        self.check_abort()?;

        let session = self.session_for(&video);
        let (manifest, count) = session.write_merge_manifest(&self.translated)?;
        let output = session.merged_output(&self.config.pipeline.target_lang);
        log::info!("pipeline: merging {count} audio segments into {}", output.display());

        let command = self.commands().merge(&video, &manifest, &output);
        let payload = self.run_stage(Stage::Merge, command, true).await?;
        let merged = payload
            .get("output")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| PipelineError::InvalidPayload {
                stage: Stage::Merge,
                reason: "missing `output`".into(),
            })?;

        self.merged_output = Some(merged.clone());
        self.lock_status().merged_output = Some(merged.clone());
        Ok(merged)
    }

    // -----------------------------------------------------------------------
    // Stage plumbing
    // -----------------------------------------------------------------------

    /// Launch one stage and return its envelope payload.
    ///
    /// The abort flag is consulted once the worker resolves, so a stop
    /// reports [`PipelineError::Cancelled`] instead of the killed worker's
    /// exit code.  A `batch` stage also checks it before launch and folds
    /// partial results into the translated collection.
    async fn run_stage(
        &mut self,
        stage: Stage,
        command: WorkerCommand,
        batch: bool,
    ) -> Result<Value, PipelineError> {
        if batch {
            self.check_abort()?;
        }
        self.set_state(stage.state());
        log::info!("pipeline: {stage} → {}", command.display());

        let runner = Arc::clone(&self.runner);
        let events = self.events.clone();
        let status = Arc::clone(&self.status);
        let mut segments = match stage {
            Stage::Translate | Stage::Synthesize if batch => Some(&mut self.translated),
            _ => None,
        };

        let mut on_event = |event: ProtocolEvent| {
            fold_event(&events, &status, segments.as_deref_mut(), event);
        };
        let result = runner.run_stage(command, &mut on_event).await?;
        self.check_abort()?;

        match result {
            JobResult::Success { payload } => {
                if payload.get("success") == Some(&Value::Bool(false)) {
                    let message = payload
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("Unknown")
                        .to_string();
                    return Err(PipelineError::Worker {
                        stage,
                        exit_code: 0,
                        message,
                    });
                }
                Ok(payload)
            }
            failure @ JobResult::Failure { .. } => Err(PipelineError::Worker {
                stage,
                exit_code: failure.exit_code(),
                message: failure.failure_message(),
            }),
        }
    }

    /// Resting state after a single-segment stage.
    fn settle_single<T>(&self, result: &Result<T, PipelineError>) {
        let state = match result {
            Err(PipelineError::Cancelled) => PipelineState::Aborted,
            _ => PipelineState::Idle,
        };
        self.lock_status().installing = None;
        self.set_state(state);
    }

    fn check_abort(&self) -> Result<(), PipelineError> {
        if self.is_aborted() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn commands(&self) -> StageCommands<'_> {
        StageCommands::new(&self.worker, &self.config)
    }

    fn session_for(&self, video: &Path) -> SessionPaths {
        SessionPaths::new(video, &self.paths.cache_dir, &self.paths.output_dir)
    }

    fn restore_translated(&mut self, previous: Vec<Segment>) {
        self.translated = previous;
        self.emit(PipelineEvent::TranslatedReplaced(self.translated.clone()));
    }

    /// Segments still marked generating after a batch get `status`.
    fn settle_generating(&mut self, status: AudioStatus) {
        for seg in &mut self.translated {
            if seg.audio_status == AudioStatus::Generating {
                seg.audio_status = status;
            }
        }
    }

    fn set_state(&self, state: PipelineState) {
        {
            let mut st = self.lock_status();
            if st.state == state {
                return;
            }
            st.state = state;
            st.progress = None;
            st.installing = None;
        }
        log::debug!("pipeline: state → {state:?}");
        self.emit(PipelineEvent::StateChanged(state));
    }

    fn emit_segment(&self, index: usize) {
        if let Some(segment) = self.translated.get(index) {
            self.emit(PipelineEvent::SegmentUpdated {
                index,
                segment: segment.clone(),
            });
        }
    }

    fn emit(&self, event: PipelineEvent) {
        send_event(&self.events, event);
    }

    fn lock_status(&self) -> MutexGuard<'_, PipelineStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn send_event(events: &Option<mpsc::UnboundedSender<PipelineEvent>>, event: PipelineEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

/// Apply one worker event to the status snapshot and, for partial results,
/// to `segments`.
fn fold_event(
    events: &Option<mpsc::UnboundedSender<PipelineEvent>>,
    status: &SharedStatus,
    segments: Option<&mut Vec<Segment>>,
    event: ProtocolEvent,
) {
    let mut st = status.lock().unwrap_or_else(PoisonError::into_inner);
    match event {
        ProtocolEvent::Progress { percent } => {
            st.progress = Some(percent);
            send_event(events, PipelineEvent::Progress(percent));
        }
        ProtocolEvent::PartialResult { index, fields } => {
            let Some(segments) = segments else {
                log::debug!("pipeline: partial result for index {index} ignored");
                return;
            };
            if apply_partial(segments, index, &fields) {
                send_event(
                    events,
                    PipelineEvent::SegmentUpdated {
                        index,
                        segment: segments[index].clone(),
                    },
                );
            }
        }
        ProtocolEvent::DepsInstalling { package } => {
            log::info!("pipeline: worker installing {package}");
            st.installing = Some(package.clone());
            send_event(events, PipelineEvent::DepsInstalling(package));
        }
        ProtocolEvent::DepsDone => {
            st.installing = None;
            send_event(events, PipelineEvent::DepsDone);
        }
        ProtocolEvent::Raw { text } => send_event(events, PipelineEvent::Log(text)),
    }
}

/// Segments from a payload that is either an array or `{segments: [...]}`.
fn segments_from(stage: Stage, payload: Value) -> Result<Vec<Segment>, PipelineError> {
    let list = match payload {
        Value::Array(_) => payload,
        Value::Object(mut map) => map.remove("segments").ok_or_else(|| {
            PipelineError::InvalidPayload {
                stage,
                reason: "missing `segments`".into(),
            }
        })?,
        other => {
            return Err(PipelineError::InvalidPayload {
                stage,
                reason: format!("expected segments, got {other}"),
            })
        }
    };
    serde_json::from_value(list).map_err(|e| PipelineError::InvalidPayload {
        stage,
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
