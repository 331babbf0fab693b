//! Application settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files.  Every section is
//! `#[serde(default)]`, so a settings file only needs the keys it changes.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::AppPaths;

// ---------------------------------------------------------------------------
// WorkerConfig
// ---------------------------------------------------------------------------

/// Where to find the worker interpreter, script and models.
///
/// Every field is optional; unset fields fall back through the candidate
/// chain in [`crate::process::locate`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Interpreter path, or a bare name looked up on `PATH`.
    pub python: Option<PathBuf>,
    /// Worker entry script (`backend/main.py`).
    pub script: Option<PathBuf>,
    /// Install root holding `python/`, `backend/`, `models/`, `output/`.
    pub project_root: Option<PathBuf>,
    /// Override for the models root.
    pub models_dir: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// AsrConfig
// ---------------------------------------------------------------------------

/// Speech recognition settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AsrConfig {
    /// Recognition backend: `whisperx`, `jianying` or `bcut`.
    pub service: String,
    /// VAD onset threshold (0.0 – 1.0).
    pub vad_onset: f32,
    /// VAD offset threshold (0.0 – 1.0).
    pub vad_offset: f32,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            service: "whisperx".into(),
            vad_onset: 0.7,
            vad_offset: 0.7,
        }
    }
}

// ---------------------------------------------------------------------------
// TTS enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TtsService {
    #[default]
    #[serde(rename = "indextts")]
    IndexTts,
    #[serde(rename = "qwen")]
    Qwen,
}

impl TtsService {
    pub fn as_str(self) -> &'static str {
        match self {
            TtsService::IndexTts => "indextts",
            TtsService::Qwen => "qwen",
        }
    }
}

/// How the merged video absorbs dubbed audio that runs longer than the
/// original segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    #[default]
    AutoSpeedup,
    FreezeFrame,
    FrameBlend,
}

impl SyncStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStrategy::AutoSpeedup => "auto_speedup",
            SyncStrategy::FreezeFrame => "freeze_frame",
            SyncStrategy::FrameBlend => "frame_blend",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QwenMode {
    #[default]
    Clone,
    Design,
    Preset,
}

impl QwenMode {
    pub fn as_str(self) -> &'static str {
        match self {
            QwenMode::Clone => "clone",
            QwenMode::Design => "design",
            QwenMode::Preset => "preset",
        }
    }
}

// ---------------------------------------------------------------------------
// QwenConfig
// ---------------------------------------------------------------------------

/// Settings specific to the Qwen3 TTS backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QwenConfig {
    pub mode: QwenMode,
    /// `1.7B` or `0.6B`.
    pub model_size: String,
    /// Voice description used in design mode.
    pub voice_instruction: String,
    /// Synthesis language override; `None` or `"Auto"` means use the
    /// pipeline target language.
    pub language: Option<String>,
    /// Reference audio for clone mode.
    pub ref_audio: Option<PathBuf>,
    /// Audio produced by an earlier design run.  When set in design mode
    /// the voice is cloned from it instead of designed again.
    pub design_ref_audio: Option<PathBuf>,
    /// Transcript of `design_ref_audio`.
    pub design_ref_text: Option<String>,
    /// Voice name for preset mode.
    pub preset_voice: String,
}

impl Default for QwenConfig {
    fn default() -> Self {
        Self {
            mode: QwenMode::default(),
            model_size: "1.7B".into(),
            voice_instruction: String::new(),
            language: None,
            ref_audio: None,
            design_ref_audio: None,
            design_ref_text: None,
            preset_voice: "Vivian".into(),
        }
    }
}

/// The Qwen voice settings actually sent to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct QwenVoice {
    pub mode: QwenMode,
    pub ref_audio: Option<PathBuf>,
    pub ref_text: Option<String>,
}

impl QwenConfig {
    /// Resolve design-then-clone: a design-mode config that already has a
    /// designed reference clip is run as a clone of that clip.
    pub fn effective_voice(&self) -> QwenVoice {
        match (&self.mode, &self.design_ref_audio) {
            (QwenMode::Design, Some(designed)) => QwenVoice {
                mode: QwenMode::Clone,
                ref_audio: Some(designed.clone()),
                ref_text: self.design_ref_text.clone().filter(|t| !t.is_empty()),
            },
            _ => QwenVoice {
                mode: self.mode,
                ref_audio: self.ref_audio.clone(),
                ref_text: None,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// TtsConfig
// ---------------------------------------------------------------------------

/// Speech synthesis settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    pub service: TtsService,
    pub temperature: f32,
    pub top_p: f32,
    pub repetition_penalty: f32,
    pub cfg_scale: f32,
    /// Explicit reference voice for Index-TTS.
    pub ref_audio: Option<PathBuf>,
    pub strategy: SyncStrategy,
    pub batch_size: u32,
    pub qwen: QwenConfig,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            service: TtsService::default(),
            temperature: 0.8,
            top_p: 0.8,
            repetition_penalty: 10.0,
            cfg_scale: 0.7,
            ref_audio: None,
            strategy: SyncStrategy::default(),
            batch_size: 1,
            qwen: QwenConfig::default(),
        }
    }
}

impl TtsConfig {
    /// Language passed to synthesis: the Qwen override when set (and not
    /// `"Auto"`), otherwise `target`.
    pub fn effective_language(&self, target: &str) -> String {
        match (&self.service, self.qwen.language.as_deref()) {
            (TtsService::Qwen, Some(lang)) if !lang.is_empty() && lang != "Auto" => lang.to_string(),
            _ => target.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Language the video is dubbed into.
    pub target_lang: String,
    /// Override for where dubbed videos and segment audio are written.
    pub output_dir: Option<PathBuf>,
    /// Override for intermediate subtitles and manifests.
    pub cache_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_lang: "English".into(),
            output_dir: None,
            cache_dir: None,
        }
    }
}

// ---------------------------------------------------------------------------
// DownloadConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Mirror download output into the debug log file.
    pub write_log: bool,
    /// Override for the debug log location.
    pub log_file: Option<PathBuf>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            write_log: true,
            log_file: None,
        }
    }
}

// ---------------------------------------------------------------------------
// AppConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level application configuration, serialised as `settings.toml`.
///
/// # Persistence
///
/// ```rust,no_run
/// use dubbing_pipeline::config::AppConfig;
///
/// // Load (returns Default when file is missing)
/// let mut config = AppConfig::load().unwrap();
///
/// config.pipeline.target_lang = "Japanese".into();
/// // config.save().unwrap();
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub worker: WorkerConfig,
    pub asr: AsrConfig,
    pub tts: TtsConfig,
    pub pipeline: PipelineConfig,
    pub download: DownloadConfig,
}

impl AppConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(AppConfig::default())` when the file does not exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("config: {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// A non-default config survives a save/load cycle unchanged.
    #[test]
    fn round_trip_toml() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("settings.toml");

        let mut original = AppConfig::default();
        original.worker.python = Some(PathBuf::from("/opt/py/bin/python3"));
        original.asr.vad_onset = 0.5;
        original.tts.service = TtsService::Qwen;
        original.tts.strategy = SyncStrategy::FrameBlend;
        original.tts.qwen.mode = QwenMode::Design;
        original.tts.qwen.language = Some("Japanese".into());
        original.pipeline.target_lang = "German".into();
        original.download.write_log = false;
        original.save_to(&path).expect("save");

        let loaded = AppConfig::load_from(&path).expect("load");
        assert_eq!(original, loaded);
    }

    /// `load_from` on a non-existent path must return `Default` without error.
    #[test]
    fn load_missing_returns_default() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("nonexistent.toml");

        let config = AppConfig::load_from(&path).expect("should not error");
        assert_eq!(config, AppConfig::default());
    }

    /// Partial files fill every missing key from the defaults.
    #[test]
    fn partial_file_loads() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("settings.toml");
        std::fs::write(
            &path,
            "[tts]\nservice = \"qwen\"\nstrategy = \"freeze_frame\"\n\n[pipeline]\ntarget_lang = \"French\"\n",
        )
        .unwrap();

        let config = AppConfig::load_from(&path).expect("load");
        assert_eq!(config.tts.service, TtsService::Qwen);
        assert_eq!(config.tts.strategy, SyncStrategy::FreezeFrame);
        assert_eq!(config.tts.batch_size, 1);
        assert_eq!(config.tts.qwen.model_size, "1.7B");
        assert_eq!(config.pipeline.target_lang, "French");
        assert_eq!(config.asr.service, "whisperx");
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "[tts\nservice = ").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }

    #[test]
    fn defaults_match_worker_defaults() {
        let tts = TtsConfig::default();
        assert_eq!(tts.temperature, 0.8);
        assert_eq!(tts.top_p, 0.8);
        assert_eq!(tts.repetition_penalty, 10.0);
        assert_eq!(tts.cfg_scale, 0.7);
        assert_eq!(tts.strategy.as_str(), "auto_speedup");
        assert_eq!(tts.service.as_str(), "indextts");
    }

    // ---- Qwen voice resolution ---

    #[test]
    fn design_with_designed_clip_becomes_clone() {
        let qwen = QwenConfig {
            mode: QwenMode::Design,
            ref_audio: Some("explicit.wav".into()),
            design_ref_audio: Some("designed.wav".into()),
            design_ref_text: Some("hello there".into()),
            ..QwenConfig::default()
        };
        let voice = qwen.effective_voice();
        assert_eq!(voice.mode, QwenMode::Clone);
        assert_eq!(voice.ref_audio, Some(PathBuf::from("designed.wav")));
        assert_eq!(voice.ref_text.as_deref(), Some("hello there"));
    }

    #[test]
    fn design_without_clip_stays_design() {
        let qwen = QwenConfig {
            mode: QwenMode::Design,
            ..QwenConfig::default()
        };
        let voice = qwen.effective_voice();
        assert_eq!(voice.mode, QwenMode::Design);
        assert!(voice.ref_text.is_none());
    }

    #[test]
    fn qwen_language_overrides_target_unless_auto() {
        let mut tts = TtsConfig {
            service: TtsService::Qwen,
            ..TtsConfig::default()
        };
        assert_eq!(tts.effective_language("English"), "English");

        tts.qwen.language = Some("Auto".into());
        assert_eq!(tts.effective_language("English"), "English");

        tts.qwen.language = Some("Korean".into());
        assert_eq!(tts.effective_language("English"), "Korean");

        tts.service = TtsService::IndexTts;
        assert_eq!(tts.effective_language("English"), "English");
    }
}
