//! Timed text segments and the rules for folding worker updates into them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Synthesis state of one segment's dubbed audio.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioStatus {
    #[default]
    None,
    Generating,
    Ready,
    Error,
}

/// One recognised (or translated) utterance.
///
/// Serialised with the worker's field names (`audioPath`, `audioStatus`);
/// snake_case spellings are accepted on input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    /// Start time in seconds.
    pub start: f64,
    /// End time in seconds.
    pub end: f64,
    #[serde(default)]
    pub text: String,
    #[serde(default, alias = "audio_path", skip_serializing_if = "Option::is_none")]
    pub audio_path: Option<String>,
    #[serde(default, alias = "audio_status")]
    pub audio_status: AudioStatus,
}

impl Segment {
    pub fn new(start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
            audio_path: None,
            audio_status: AudioStatus::None,
        }
    }

    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    /// `true` when the segment has usable dubbed audio.
    pub fn has_audio(&self) -> bool {
        self.audio_path.as_deref().is_some_and(|p| !p.is_empty())
            && self.audio_status != AudioStatus::Error
    }

    /// Record a synthesis outcome for this segment.
    pub fn set_audio(&mut self, path: Option<String>, success: bool) {
        self.audio_path = path;
        self.audio_status = if success {
            AudioStatus::Ready
        } else {
            AudioStatus::Error
        };
    }
}

/// Sort by start time, keeping the worker's order for equal starts.
pub fn sort_by_start(segments: &mut [Segment]) {
    segments.sort_by(|a, b| a.start.total_cmp(&b.start));
}

/// Fold a `[PARTIAL]` update into `segments[index]`.
///
/// - `audio_path` present: path replaced, status `Ready` if `success` is
///   literally `true`, else `Error`.
/// - `text` present: text replaced.
///
/// Out-of-range indices are ignored.  Returns whether anything changed.
pub fn apply_partial(segments: &mut [Segment], index: usize, fields: &Map<String, Value>) -> bool {
    let len = segments.len();
    let Some(segment) = segments.get_mut(index) else {
        log::debug!("pipeline: partial result for index {index} ignored ({len} segments)");
        return false;
    };

    let mut changed = false;
    if let Some(path) = fields.get("audio_path") {
        let success = fields.get("success") == Some(&Value::Bool(true));
        segment.set_audio(path.as_str().map(str::to_owned), success);
        changed = true;
    }
    if let Some(text) = fields.get("text").and_then(Value::as_str) {
        segment.text = text.to_string();
        changed = true;
    }
    changed
}

/// Timing-only copies of `segments` with a placeholder text and no audio,
/// shown while a translation streams in.
pub fn placeholders(segments: &[Segment], placeholder: &str) -> Vec<Segment> {
    segments
        .iter()
        .map(|s| Segment::new(s.start, s.end, placeholder))
        .collect()
}
