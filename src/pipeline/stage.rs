//! Stage names and worker command lines.
//!
//! Every invocation starts with
//! `<python> <script> --json --model_dir <models>/index-tts/hub --action <stage>`
//! and adds stage-specific flags built from [`AppConfig`].

use std::ffi::OsString;
use std::path::Path;

use crate::config::{AppConfig, QwenMode, TtsService};
use crate::process::{WorkerCommand, WorkerLocation};

use super::segment::Segment;
use super::state::PipelineState;

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Recognize,
    Translate,
    Synthesize,
    SynthesizeOne,
    Merge,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Recognize,
        Stage::Translate,
        Stage::Synthesize,
        Stage::SynthesizeOne,
        Stage::Merge,
    ];

    /// Value passed to the worker's `--action`.
    pub fn action(self) -> &'static str {
        match self {
            Stage::Recognize => "test_asr",
            Stage::Translate => "translate_text",
            Stage::Synthesize => "generate_batch_tts",
            Stage::SynthesizeOne => "generate_single_tts",
            Stage::Merge => "merge_video",
        }
    }

    pub fn from_action(action: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.action() == action)
    }

    /// State the pipeline is in while this stage runs.
    pub fn state(self) -> PipelineState {
        match self {
            Stage::Recognize => PipelineState::Recognizing,
            Stage::Translate => PipelineState::Translating,
            Stage::Synthesize | Stage::SynthesizeOne => PipelineState::Synthesizing,
            Stage::Merge => PipelineState::Merging,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.action())
    }
}

// ---------------------------------------------------------------------------
// StageCommands
// ---------------------------------------------------------------------------

/// Builds worker command lines from the worker location and settings.
#[derive(Debug, Clone, Copy)]
pub struct StageCommands<'a> {
    worker: &'a WorkerLocation,
    config: &'a AppConfig,
}

impl<'a> StageCommands<'a> {
    pub fn new(worker: &'a WorkerLocation, config: &'a AppConfig) -> Self {
        Self { worker, config }
    }

    /// Base invocation for an arbitrary `action`, plus caller-supplied args.
    pub fn custom<I, S>(&self, action: &str, extra: I) -> WorkerCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        WorkerCommand::new(&self.worker.python)
            .arg(&self.worker.script)
            .arg("--json")
            .flag("model_dir", self.worker.model_hub_dir())
            .flag("action", action)
            .args(extra)
            .utf8_env()
    }

    fn base(&self, stage: Stage) -> WorkerCommand {
        self.custom(stage.action(), std::iter::empty::<OsString>())
    }

    pub fn recognize(&self, video: &Path, cache_dir: &Path) -> WorkerCommand {
        let asr = &self.config.asr;
        self.base(Stage::Recognize)
            .flag("input", video)
            .flag("asr", &asr.service)
            .flag("output_dir", cache_dir)
            .flag("vad_onset", format!("{:.3}", asr.vad_onset))
            .flag("vad_offset", format!("{:.3}", asr.vad_offset))
    }

    /// `input` is either a JSON array of segments or a single line of text.
    pub fn translate(&self, input: &str) -> WorkerCommand {
        self.base(Stage::Translate)
            .flag("input", input)
            .flag("lang", &self.config.pipeline.target_lang)
    }

    pub fn synthesize_batch(&self, video: &Path, tasks_json: &Path) -> WorkerCommand {
        let tts = &self.config.tts;
        let cmd = self
            .base(Stage::Synthesize)
            .flag("input", video)
            .flag("ref", tasks_json)
            .flag("lang", tts.effective_language(&self.config.pipeline.target_lang));
        self.voice_flags(self.sampling_flags(cmd))
            .flag("batch_size", tts.batch_size.to_string())
    }

    pub fn synthesize_one(&self, video: &Path, output: &Path, segment: &Segment) -> WorkerCommand {
        let tts = &self.config.tts;
        let cmd = self
            .base(Stage::SynthesizeOne)
            .flag("input", video)
            .flag("output", output)
            .flag("text", &segment.text)
            .flag("start", segment.start.to_string())
            .flag("duration", segment.duration().to_string())
            .flag("lang", tts.effective_language(&self.config.pipeline.target_lang));
        self.voice_flags(self.sampling_flags(cmd))
    }

    pub fn merge(&self, video: &Path, manifest: &Path, output: &Path) -> WorkerCommand {
        let tts = &self.config.tts;
        let mut cmd = self
            .base(Stage::Merge)
            .flag("input", video)
            .flag("ref", manifest)
            .flag("output", output)
            .flag("strategy", tts.strategy.as_str())
            .flag("tts_service", tts.service.as_str());

        // Merge uses the configured voice as-is, without design-then-clone.
        match tts.service {
            TtsService::Qwen => {
                let qwen = &tts.qwen;
                if let Some(ref_audio) = &qwen.ref_audio {
                    cmd = cmd.flag("ref_audio", ref_audio);
                }
                cmd = cmd.flag("qwen_mode", qwen.mode.as_str());
                if qwen.mode == QwenMode::Design && !qwen.voice_instruction.is_empty() {
                    cmd = cmd.flag("voice_instruct", &qwen.voice_instruction);
                }
            }
            TtsService::IndexTts => {
                if let Some(ref_audio) = &tts.ref_audio {
                    cmd = cmd.flag("ref_audio", ref_audio);
                }
            }
        }
        cmd
    }

    fn sampling_flags(&self, cmd: WorkerCommand) -> WorkerCommand {
        let tts = &self.config.tts;
        cmd.flag("temperature", tts.temperature.to_string())
            .flag("top_p", tts.top_p.to_string())
            .flag("repetition_penalty", tts.repetition_penalty.to_string())
            .flag("cfg_scale", tts.cfg_scale.to_string())
            .flag("strategy", tts.strategy.as_str())
            .flag("tts_service", tts.service.as_str())
    }

    fn voice_flags(&self, mut cmd: WorkerCommand) -> WorkerCommand {
        let tts = &self.config.tts;
        match tts.service {
            TtsService::Qwen => {
                let qwen = &tts.qwen;
                let voice = qwen.effective_voice();
                if let Some(ref_audio) = &voice.ref_audio {
                    cmd = cmd.flag("ref_audio", ref_audio);
                }
                if let Some(ref_text) = &voice.ref_text {
                    cmd = cmd.flag("qwen_ref_text", ref_text);
                }
                cmd = cmd
                    .flag("qwen_mode", voice.mode.as_str())
                    .flag("qwen_model_size", &qwen.model_size);
                match voice.mode {
                    QwenMode::Design if !qwen.voice_instruction.is_empty() => {
                        cmd = cmd.flag("voice_instruct", &qwen.voice_instruction);
                    }
                    QwenMode::Preset => cmd = cmd.flag("preset_voice", &qwen.preset_voice),
                    _ => {}
                }
            }
            TtsService::IndexTts => {
                if let Some(ref_audio) = &tts.ref_audio {
                    cmd = cmd.flag("ref_audio", ref_audio);
                }
            }
        }
        cmd
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn worker() -> WorkerLocation {
        WorkerLocation {
            python: PathBuf::from("/py/python3"),
            script: PathBuf::from("/app/backend/main.py"),
            models_dir: PathBuf::from("/app/models"),
        }
    }

    #[test]
    fn actions_round_trip() {
        for stage in Stage::ALL {
            assert_eq!(Stage::from_action(stage.action()), Some(stage));
        }
        assert_eq!(Stage::from_action("asr"), None);
    }

    #[test]
    fn base_invocation_prefix() {
        let w = worker();
        let config = AppConfig::default();
        let cmd = StageCommands::new(&w, &config).translate("hello");

        assert_eq!(cmd.program, PathBuf::from("/py/python3"));
        assert_eq!(cmd.args[0], "/app/backend/main.py");
        assert_eq!(cmd.args[1], "--json");
        assert_eq!(
            cmd.flag_value("model_dir").map(PathBuf::from),
            Some(PathBuf::from("/app/models").join("index-tts").join("hub"))
        );
        assert_eq!(cmd.action().as_deref(), Some("translate_text"));
        assert_eq!(cmd.flag_value("lang").as_deref(), Some("English"));
        assert!(cmd.env.contains(&("PYTHONIOENCODING".into(), "utf-8".into())));
    }

    #[test]
    fn recognize_flags() {
        let w = worker();
        let config = AppConfig::default();
        let cmd = StageCommands::new(&w, &config).recognize(Path::new("clip.mp4"), Path::new("/c/clip"));

        assert_eq!(cmd.action().as_deref(), Some("test_asr"));
        assert_eq!(cmd.flag_value("input").as_deref(), Some("clip.mp4"));
        assert_eq!(cmd.flag_value("asr").as_deref(), Some("whisperx"));
        assert_eq!(cmd.flag_value("output_dir").as_deref(), Some("/c/clip"));
        assert_eq!(cmd.flag_value("vad_onset").as_deref(), Some("0.700"));
    }

    #[test]
    fn index_tts_batch_flags() {
        let w = worker();
        let mut config = AppConfig::default();
        config.tts.ref_audio = Some("voice.wav".into());
        config.tts.batch_size = 4;
        let cmd = StageCommands::new(&w, &config)
            .synthesize_batch(Path::new("clip.mp4"), Path::new("tasks.json"));

        assert_eq!(cmd.action().as_deref(), Some("generate_batch_tts"));
        assert_eq!(cmd.flag_value("ref").as_deref(), Some("tasks.json"));
        assert_eq!(cmd.flag_value("tts_service").as_deref(), Some("indextts"));
        assert_eq!(cmd.flag_value("strategy").as_deref(), Some("auto_speedup"));
        assert_eq!(cmd.flag_value("ref_audio").as_deref(), Some("voice.wav"));
        assert_eq!(cmd.flag_value("batch_size").as_deref(), Some("4"));
        assert!(!cmd.has_flag("qwen_mode"));
    }

    #[test]
    fn qwen_design_with_clip_is_sent_as_clone() {
        let w = worker();
        let mut config = AppConfig::default();
        config.tts.service = TtsService::Qwen;
        config.tts.qwen.mode = QwenMode::Design;
        config.tts.qwen.voice_instruction = "warm narrator".into();
        config.tts.qwen.design_ref_audio = Some("designed.wav".into());
        config.tts.qwen.design_ref_text = Some("sample line".into());
        config.tts.qwen.language = Some("Japanese".into());

        let seg = Segment::new(1.0, 3.5, "hello");
        let cmd = StageCommands::new(&w, &config).synthesize_one(
            Path::new("clip.mp4"),
            Path::new("out/segment_0.wav"),
            &seg,
        );

        assert_eq!(cmd.flag_value("qwen_mode").as_deref(), Some("clone"));
        assert_eq!(cmd.flag_value("ref_audio").as_deref(), Some("designed.wav"));
        assert_eq!(cmd.flag_value("qwen_ref_text").as_deref(), Some("sample line"));
        assert_eq!(cmd.flag_value("lang").as_deref(), Some("Japanese"));
        assert_eq!(cmd.flag_value("duration").as_deref(), Some("2.5"));
        assert!(!cmd.has_flag("voice_instruct"));
    }

    #[test]
    fn qwen_design_without_clip_sends_instruction() {
        let w = worker();
        let mut config = AppConfig::default();
        config.tts.service = TtsService::Qwen;
        config.tts.qwen.mode = QwenMode::Design;
        config.tts.qwen.voice_instruction = "warm narrator".into();

        let cmd = StageCommands::new(&w, &config)
            .synthesize_batch(Path::new("clip.mp4"), Path::new("tasks.json"));
        assert_eq!(cmd.flag_value("qwen_mode").as_deref(), Some("design"));
        assert_eq!(cmd.flag_value("voice_instruct").as_deref(), Some("warm narrator"));
        assert_eq!(cmd.flag_value("qwen_model_size").as_deref(), Some("1.7B"));
    }

    #[test]
    fn merge_flags() {
        let w = worker();
        let config = AppConfig::default();
        let cmd = StageCommands::new(&w, &config).merge(
            Path::new("clip.mp4"),
            Path::new("manifest.json"),
            Path::new("out.mp4"),
        );
        assert_eq!(cmd.action().as_deref(), Some("merge_video"));
        assert_eq!(cmd.flag_value("ref").as_deref(), Some("manifest.json"));
        assert_eq!(cmd.flag_value("output").as_deref(), Some("out.mp4"));
        assert!(!cmd.has_flag("lang"));
    }

    #[test]
    fn custom_appends_raw_args() {
        let w = worker();
        let config = AppConfig::default();
        let cmd = StageCommands::new(&w, &config).custom("check_env", ["--verbose"]);
        assert_eq!(cmd.action().as_deref(), Some("check_env"));
        assert!(cmd.has_flag("verbose"));
    }
}
