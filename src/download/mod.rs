//! Model and asset downloads.
//!
//! Downloads are ordinary workers (`python -c <script>`) tracked by key in a
//! [`DownloadRegistry`] so several can run at once and each can be cancelled
//! on its own.  Output is optionally mirrored into a [`DownloadLog`].

pub mod logfile;
pub mod registry;
pub mod source;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use logfile::DownloadLog;
pub use registry::{CancelOutcome, DownloadRegistry};
pub use source::{strip_models_prefix, DownloadOutcome, DownloadSpec, SUCCESS_TOKEN};
