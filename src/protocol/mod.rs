//! Worker stdout protocol.
//!
//! Workers print free-form log text interleaved with a handful of
//! line-oriented markers, and finish with a sentinel-delimited JSON envelope:
//!
//! ```text
//! loading model...
//! [DEPS_INSTALLING] torchaudio
//! [DEPS_DONE]
//! [PROGRESS] 40
//! [PARTIAL] {"index": 3, "audio_path": "seg_3.wav", "success": true}
//! [PROGRESS] 100
//! __JSON_START__{"success": true, "results": [...]}__JSON_END__
//! ```
//!
//! [`StreamProtocolParser`] turns raw pipe chunks into [`ProtocolEvent`]s and
//! keeps the full output around; [`extract_envelope`] pulls the final payload
//! out of the accumulated stdout once the worker has exited.

pub mod envelope;
pub mod event;
pub mod parser;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use envelope::{extract_envelope, Envelope, JSON_END, JSON_START};
pub use event::ProtocolEvent;
pub use parser::StreamProtocolParser;
