//! Model catalogue and on-disk status.
//!
//! [`MODELS`] lists every asset the workers can use.  Each entry knows how
//! to download itself ([`ModelInfo::download_spec`]) and which directories
//! under the models root count as "installed" ([`check_models`]).

use std::path::Path;

use serde::Serialize;

use crate::download::DownloadSpec;

// ---------------------------------------------------------------------------
// ModelSource
// ---------------------------------------------------------------------------

/// Where a model is fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSource {
    /// A model-hub repository snapshot.
    Hub { model_id: &'static str },
    /// A zip archive extracted in place.
    Archive { url: &'static str },
}

// ---------------------------------------------------------------------------
// ModelInfo
// ---------------------------------------------------------------------------

/// Static metadata for one downloadable model.
#[derive(Debug)]
pub struct ModelInfo {
    /// Stable key, also used as the download registry key.
    pub key: &'static str,
    pub display_name: &'static str,
    pub description: &'static str,
    pub source: ModelSource,
    /// Download destination relative to the project (may carry `models/`).
    pub local_dir: &'static str,
    /// Directories under the models root whose presence means installed.
    pub status_dirs: &'static [&'static str],
}

impl ModelInfo {
    pub fn download_spec(&self) -> DownloadSpec {
        match self.source {
            ModelSource::Hub { model_id } => DownloadSpec::Model {
                model_id: model_id.to_string(),
                local_dir: self.local_dir.to_string(),
            },
            ModelSource::Archive { url } => DownloadSpec::File {
                url: url.to_string(),
                target_dir: self.local_dir.to_string(),
                name: Some(self.key.to_string()),
            },
        }
    }

    pub fn is_installed(&self, models_root: &Path) -> bool {
        self.status_dirs.iter().any(|d| models_root.join(d).exists())
    }
}

/// Every model the workers know about.
pub const MODELS: &[ModelInfo] = &[
    ModelInfo {
        key: "whisperx",
        display_name: "WhisperX",
        description: "Speech recognition (faster-whisper large-v3 turbo)",
        source: ModelSource::Hub {
            model_id: "Tiandong/faster-whisper-large-v3-turbo-ct2",
        },
        local_dir: "models/faster-whisper-large-v3-turbo-ct2",
        status_dirs: &[
            "faster-whisper-large-v3-turbo-ct2",
            "whisperx/faster-whisper-large-v3-turbo-ct2",
        ],
    },
    ModelInfo {
        key: "alignment",
        display_name: "Forced Alignment",
        description: "Wav2Vec2 forced alignment",
        source: ModelSource::Hub {
            model_id: "Tiandong/alignment",
        },
        local_dir: "models/alignment",
        status_dirs: &["alignment"],
    },
    ModelInfo {
        key: "index_tts",
        display_name: "Index-TTS",
        description: "Voice cloning TTS",
        source: ModelSource::Hub {
            model_id: "Tiandong/Index-TTS",
        },
        local_dir: "models/index-tts",
        status_dirs: &["index-tts", "index-tts/hub"],
    },
    ModelInfo {
        key: "qwen",
        display_name: "Qwen2.5 7B Instruct",
        description: "Translation LLM",
        source: ModelSource::Hub {
            model_id: "Qwen/Qwen2.5-7B-Instruct",
        },
        local_dir: "models/Qwen2.5-7B-Instruct",
        status_dirs: &["Qwen2.5-7B-Instruct", "qwen/Qwen2.5-7B-Instruct"],
    },
    ModelInfo {
        key: "qwen_tokenizer",
        display_name: "Qwen3 Tokenizer",
        description: "Qwen3 TTS tokenizer (12Hz)",
        source: ModelSource::Hub {
            model_id: "Qwen/Qwen3-TTS-Tokenizer-12Hz",
        },
        local_dir: "models/Qwen3-TTS-Tokenizer-12Hz",
        status_dirs: &["Qwen3-TTS-Tokenizer-12Hz", "Qwen/Qwen3-TTS-Tokenizer-12Hz"],
    },
    ModelInfo {
        key: "qwen_17b_base",
        display_name: "Qwen3 1.7B Base",
        description: "Qwen3 voice cloning, 1.7B",
        source: ModelSource::Hub {
            model_id: "Qwen/Qwen3-TTS-12Hz-1.7B-Base",
        },
        local_dir: "models/Qwen3-TTS-12Hz-1.7B-Base",
        status_dirs: &["Qwen3-TTS-12Hz-1.7B-Base", "Qwen/Qwen3-TTS-12Hz-1.7B-Base"],
    },
    ModelInfo {
        key: "qwen_17b_design",
        display_name: "Qwen3 1.7B Design",
        description: "Qwen3 voice design",
        source: ModelSource::Hub {
            model_id: "Qwen/Qwen3-TTS-12Hz-1.7B-VoiceDesign",
        },
        local_dir: "models/Qwen3-TTS-12Hz-1.7B-VoiceDesign",
        status_dirs: &[
            "Qwen3-TTS-12Hz-1.7B-VoiceDesign",
            "Qwen/Qwen3-TTS-12Hz-1.7B-VoiceDesign",
        ],
    },
    ModelInfo {
        key: "qwen_17b_custom",
        display_name: "Qwen3 1.7B Preset",
        description: "Qwen3 preset voices, 1.7B",
        source: ModelSource::Hub {
            model_id: "Qwen/Qwen3-TTS-12Hz-1.7B-CustomVoice",
        },
        local_dir: "models/Qwen3-TTS-12Hz-1.7B-CustomVoice",
        status_dirs: &[
            "Qwen3-TTS-12Hz-1.7B-CustomVoice",
            "Qwen/Qwen3-TTS-12Hz-1.7B-CustomVoice",
        ],
    },
    ModelInfo {
        key: "qwen_06b_base",
        display_name: "Qwen3 0.6B Base",
        description: "Qwen3 voice cloning, 0.6B",
        source: ModelSource::Hub {
            model_id: "Qwen/Qwen3-TTS-12Hz-0.6B-Base",
        },
        local_dir: "models/Qwen3-TTS-12Hz-0.6B-Base",
        status_dirs: &["Qwen3-TTS-12Hz-0.6B-Base", "Qwen/Qwen3-TTS-12Hz-0.6B-Base"],
    },
    ModelInfo {
        key: "qwen_06b_custom",
        display_name: "Qwen3 0.6B Preset",
        description: "Qwen3 preset voices, 0.6B",
        source: ModelSource::Hub {
            model_id: "Qwen/Qwen3-TTS-12Hz-0.6B-CustomVoice",
        },
        local_dir: "models/Qwen3-TTS-12Hz-0.6B-CustomVoice",
        status_dirs: &[
            "Qwen3-TTS-12Hz-0.6B-CustomVoice",
            "Qwen/Qwen3-TTS-12Hz-0.6B-CustomVoice",
        ],
    },
    ModelInfo {
        key: "rife",
        display_name: "RIFE",
        description: "Optical-flow frame interpolation",
        source: ModelSource::Archive {
            url: "https://github.com/nihui/rife-ncnn-vulkan/releases/download/20221029/rife-ncnn-vulkan-20221029-windows.zip",
        },
        local_dir: "rife",
        status_dirs: &["rife", "rife-ncnn-vulkan"],
    },
];

/// Look up a catalogue entry by key.
pub fn find_model(key: &str) -> Option<&'static ModelInfo> {
    MODELS.iter().find(|m| m.key == key)
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelStatus {
    pub key: &'static str,
    pub display_name: &'static str,
    pub installed: bool,
}

/// Installed/missing status of every catalogue entry under `models_root`.
pub fn check_models(models_root: &Path) -> Vec<ModelStatus> {
    MODELS
        .iter()
        .map(|m| ModelStatus {
            key: m.key,
            display_name: m.display_name,
            installed: m.is_installed(models_root),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
