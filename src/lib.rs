//! Worker supervision, model downloads and the dubbing pipeline.
//!
//! ```text
//! protocol  ── stdout line protocol parser and JSON envelope
//! process   ── worker spawning, primary slot, tree kill, install lookup
//! download  ── keyed download registry and log file
//! pipeline  ── recognize → translate → synthesize → merge orchestrator
//! app       ── ControlPlane tying the above together for the CLI
//! ```

pub mod app;
pub mod config;
pub mod download;
pub mod models;
pub mod pipeline;
pub mod process;
pub mod protocol;
