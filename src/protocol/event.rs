//! Events decoded from a worker's stdout.

use serde_json::{Map, Value};

/// One decoded protocol line.
///
/// Events are transient: they are handed to a subscriber as soon as the line
/// that produced them is complete and are never stored by the parser.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// `[PROGRESS] <int>`: coarse completion percentage, clamped to 100.
    Progress { percent: u8 },

    /// `[PARTIAL] <json>`: an incremental update for the segment at `index`.
    ///
    /// `fields` is the full JSON object as printed, `index` included.
    PartialResult {
        index: usize,
        fields: Map<String, Value>,
    },

    /// `[DEPS_INSTALLING] <text>`: the worker is installing a dependency.
    DepsInstalling { package: String },

    /// `[DEPS_DONE]`: dependency installation finished.
    DepsDone,

    /// Any other non-empty line of worker output.
    Raw { text: String },
}

impl ProtocolEvent {
    /// `true` for the advisory marker events (everything except [`Raw`]).
    ///
    /// [`Raw`]: ProtocolEvent::Raw
    pub fn is_marker(&self) -> bool {
        !matches!(self, ProtocolEvent::Raw { .. })
    }
}
