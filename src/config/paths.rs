//! Cross-platform application paths using the `dirs` crate.
//!
//! Layout when no project root is configured:
//!
//! Config dir (settings):
//!   Windows: %APPDATA%\dubbing-pipeline\
//!   macOS:   ~/Library/Application Support/dubbing-pipeline/
//!   Linux:   ~/.config/dubbing-pipeline/
//!
//! Data dir (models, output, logs):
//!   Windows: %LOCALAPPDATA%\dubbing-pipeline\
//!   macOS:   ~/Library/Application Support/dubbing-pipeline/
//!   Linux:   ~/.local/share/dubbing-pipeline/
//!
//! Cache dir (subtitles, manifests):
//!   Linux:   ~/.cache/dubbing-pipeline/
//!
//! With a project root (a portable install) everything except the settings
//! file lives under it: `models/`, `output/`, `.cache/`, `logs/`.

use std::path::{Path, PathBuf};

use super::AppConfig;

/// Holds all resolved application directory/file paths.
#[derive(Debug, Clone, PartialEq)]
pub struct AppPaths {
    /// Directory for `settings.toml`.
    pub config_dir: PathBuf,
    /// Full path to `settings.toml`.
    pub settings_file: PathBuf,
    /// Root of the model tree.
    pub models_dir: PathBuf,
    /// Dubbed videos and generated segment audio.
    pub output_dir: PathBuf,
    /// Intermediate subtitles and manifests.
    pub cache_dir: PathBuf,
    /// Append-only worker/download debug log.
    pub log_file: PathBuf,
}

impl AppPaths {
    const APP_NAME: &'static str = "dubbing-pipeline";

    /// Resolves all paths using the `dirs` crate.
    ///
    /// Falls back to the current directory if the platform cannot provide a
    /// standard path.
    pub fn new() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(Self::APP_NAME);

        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(Self::APP_NAME);

        let cache_dir = dirs::cache_dir()
            .map(|d| d.join(Self::APP_NAME))
            .unwrap_or_else(|| data_dir.join(".cache"));

        Self {
            settings_file: config_dir.join("settings.toml"),
            config_dir,
            models_dir: data_dir.join("models"),
            output_dir: data_dir.join("output"),
            cache_dir,
            log_file: data_dir.join("logs").join("backend_debug.log"),
        }
    }

    /// Portable layout rooted at `root`; the settings file stays in the
    /// platform config dir.
    pub fn for_project(root: &Path) -> Self {
        let platform = Self::new();
        Self {
            config_dir: platform.config_dir,
            settings_file: platform.settings_file,
            models_dir: root.join("models"),
            output_dir: root.join("output"),
            cache_dir: root.join(".cache"),
            log_file: root.join("logs").join("backend_debug.log"),
        }
    }

    /// Paths for `config`: project layout if a root is set, then any
    /// explicit per-directory overrides.
    pub fn resolve(config: &AppConfig) -> Self {
        let mut paths = match &config.worker.project_root {
            Some(root) => Self::for_project(root),
            None => Self::new(),
        };
        if let Some(dir) = &config.worker.models_dir {
            paths.models_dir = dir.clone();
        }
        if let Some(dir) = &config.pipeline.output_dir {
            paths.output_dir = dir.clone();
        }
        if let Some(dir) = &config.pipeline.cache_dir {
            paths.cache_dir = dir.clone();
        }
        if let Some(file) = &config.download.log_file {
            paths.log_file = file.clone();
        }
        paths
    }
}

impl Default for AppPaths {
    fn default() -> Self {
        Self::new()
    }
}
