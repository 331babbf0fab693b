//! Command-line entry point for the dubbing pipeline.
//!
//! # Startup sequence
//!
//! 1. Initialise logging.
//! 2. Parse arguments.
//! 3. Load [`AppConfig`] (defaults when the file is missing or unreadable).
//! 4. Locate the python interpreter and worker script.
//! 5. Run the requested command; Ctrl-C stops the running worker.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use dubbing_pipeline::{
    app::ControlPlane,
    config::AppConfig,
    download::DownloadSpec,
    models::{find_model, MODELS},
    pipeline::{read_srt, PipelineEvent, PipelineOrchestrator, RunOutcome, Segment, Stage},
    process::JobEvent,
    protocol::ProtocolEvent,
};
use tokio::sync::mpsc;

/// Exit code reported when the user stops a run.
const STOPPED_EXIT_CODE: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "dubbing-pipeline", version, about = "Video dubbing pipeline driver")]
struct Cli {
    /// Settings file to use instead of the platform default.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Recognize, translate, synthesize and merge a video.
    Run {
        video: PathBuf,
        /// Target language (overrides the settings file).
        #[arg(long)]
        lang: Option<String>,
    },
    /// Dub a video from a subtitle file instead of recognising it.
    Dub {
        video: PathBuf,
        subtitles: PathBuf,
        /// The subtitles are already in the target language: synthesize and
        /// merge them directly.
        #[arg(long)]
        translated: bool,
        #[arg(long)]
        lang: Option<String>,
    },
    /// Run a single worker stage with raw extra arguments.
    Stage {
        /// test_asr, translate_text, generate_batch_tts, generate_single_tts or merge_video.
        name: String,
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Download a model repository snapshot.
    DownloadModel {
        model_id: String,
        local_dir: String,
        #[arg(long)]
        key: Option<String>,
    },
    /// Download and extract a zip archive.
    DownloadFile {
        url: String,
        target_dir: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        key: Option<String>,
    },
    /// Download a model from the built-in catalogue by key.
    Install { key: String },
    /// Show which catalogue models are installed.
    Models,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref());

    match cli.command {
        Command::Run { video, lang } => {
            let mut config = config;
            if let Some(lang) = lang {
                config.pipeline.target_lang = lang;
            }
            let control = ControlPlane::from_config(config)?;
            run_pipeline(&control, video).await
        }
        Command::Dub {
            video,
            subtitles,
            translated,
            lang,
        } => {
            let mut config = config;
            if let Some(lang) = lang {
                config.pipeline.target_lang = lang;
            }
            let segments = read_srt(&subtitles)
                .with_context(|| format!("failed to read {}", subtitles.display()))?;
            if segments.is_empty() {
                bail!("no subtitle cues found in {}", subtitles.display());
            }
            log::info!("pipeline: loaded {} cues from {}", segments.len(), subtitles.display());
            let control = ControlPlane::from_config(config)?;
            dub_from_subtitles(&control, video, segments, translated).await
        }
        Command::Stage { name, args } => {
            let Some(stage) = Stage::from_action(&name) else {
                let known: Vec<_> = Stage::ALL.iter().map(|s| s.action()).collect();
                bail!("unknown stage {name:?}; expected one of {}", known.join(", "));
            };
            let control = ControlPlane::from_config(config)?;
            run_stage(&control, stage, args).await
        }
        Command::DownloadModel {
            model_id,
            local_dir,
            key,
        } => {
            let control = ControlPlane::from_config(config)?;
            let spec = DownloadSpec::Model { model_id, local_dir };
            run_download(&control, key.as_deref(), &spec).await
        }
        Command::DownloadFile {
            url,
            target_dir,
            name,
            key,
        } => {
            let control = ControlPlane::from_config(config)?;
            let spec = DownloadSpec::File {
                url,
                target_dir,
                name,
            };
            run_download(&control, key.as_deref(), &spec).await
        }
        Command::Install { key } => {
            let model = find_model(&key).with_context(|| {
                let keys: Vec<_> = MODELS.iter().map(|m| m.key).collect();
                format!("unknown model {key:?}; known models: {}", keys.join(", "))
            })?;
            let control = ControlPlane::from_config(config)?;
            run_download(&control, Some(model.key), &model.download_spec()).await
        }
        Command::Models => {
            let control = ControlPlane::from_config(config)?;
            for status in control.model_status() {
                let mark = if status.installed { "installed" } else { "missing" };
                println!("{:<18} {:<28} {mark}", status.key, status.display_name);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> AppConfig {
    let loaded = match path {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    };
    loaded.unwrap_or_else(|e| {
        log::warn!("Failed to load config ({e}); using defaults");
        AppConfig::default()
    })
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn run_pipeline(control: &ControlPlane, video: PathBuf) -> anyhow::Result<ExitCode> {
    let mut orchestrator = control.orchestrator();
    let events = orchestrator.subscribe();
    tokio::spawn(print_pipeline_events(events));

    stop_on_ctrl_c(&orchestrator);

    let outcome = orchestrator.one_click_run(&video).await;
    control.shutdown();
    Ok(report_outcome(outcome))
}

async fn dub_from_subtitles(
    control: &ControlPlane,
    video: PathBuf,
    segments: Vec<Segment>,
    translated: bool,
) -> anyhow::Result<ExitCode> {
    let mut orchestrator = control.orchestrator();
    let events = orchestrator.subscribe();
    tokio::spawn(print_pipeline_events(events));
    stop_on_ctrl_c(&orchestrator);

    orchestrator.set_video(video);
    let outcome = if translated {
        orchestrator.set_translated(segments);
        orchestrator.dub_translated().await
    } else {
        orchestrator.set_source(segments);
        orchestrator.dub_source().await
    };
    control.shutdown();
    Ok(report_outcome(outcome))
}

fn stop_on_ctrl_c(orchestrator: &PipelineOrchestrator) {
    let abort = orchestrator.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            abort.kill_backend();
        }
    });
}

fn report_outcome(outcome: RunOutcome) -> ExitCode {
    println!("{outcome}");
    match outcome {
        RunOutcome::Completed { .. } => ExitCode::SUCCESS,
        RunOutcome::Stopped => ExitCode::from(STOPPED_EXIT_CODE),
        RunOutcome::Failed { .. } => ExitCode::FAILURE,
    }
}

async fn run_stage(control: &ControlPlane, stage: Stage, args: Vec<String>) -> anyhow::Result<ExitCode> {
    tokio::spawn(print_job_events(control.subscribe()));

    let supervisor = control.supervisor().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            supervisor.kill_primary();
        }
    });

    let result = control.launch_stage(stage, args).await?;
    match result.payload() {
        Some(payload) => {
            println!("{}", serde_json::to_string_pretty(payload)?);
            Ok(ExitCode::SUCCESS)
        }
        None => {
            eprintln!("{stage} failed (code {}): {}", result.exit_code(), result.failure_message());
            Ok(exit_code_for(result.exit_code()))
        }
    }
}

async fn run_download(
    control: &ControlPlane,
    key: Option<&str>,
    spec: &DownloadSpec,
) -> anyhow::Result<ExitCode> {
    tokio::spawn(print_job_events(control.subscribe()));

    let key = key.map_or_else(|| spec.default_key(), str::to_owned);
    let downloads = control.downloads().clone();
    let cancel_key = key.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            downloads.cancel(&cancel_key);
        }
    });

    let outcome = control.download(Some(&key), spec).await;
    println!("{}", serde_json::to_string(&outcome)?);
    Ok(if outcome.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Worker exit codes outside `1..=255` (sentinels, signals) map to 1.
fn exit_code_for(code: i32) -> ExitCode {
    match u8::try_from(code) {
        Ok(code) if code != 0 => ExitCode::from(code),
        _ => ExitCode::FAILURE,
    }
}

// ---------------------------------------------------------------------------
// Event printers
// ---------------------------------------------------------------------------

async fn print_pipeline_events(mut rx: mpsc::UnboundedReceiver<PipelineEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            PipelineEvent::StateChanged(state) => log::info!("{}", state.label()),
            PipelineEvent::Progress(percent) => log::info!("progress {percent}%"),
            PipelineEvent::SegmentUpdated { index, segment } => log::info!(
                "segment {index} [{:.2}-{:.2}] {:?} {}",
                segment.start,
                segment.end,
                segment.audio_status,
                segment.text
            ),
            PipelineEvent::SourceReplaced(segments) => {
                log::info!("recognised {} segments", segments.len())
            }
            PipelineEvent::TranslatedReplaced(segments) => {
                log::debug!("translated collection now {} segments", segments.len())
            }
            PipelineEvent::DepsInstalling(package) => log::info!("installing {package}"),
            PipelineEvent::DepsDone => log::info!("dependencies installed"),
            PipelineEvent::Log(line) => log::debug!("worker: {line}"),
        }
    }
}

async fn print_job_events(mut rx: mpsc::UnboundedReceiver<JobEvent>) {
    while let Some(JobEvent { job, key, event }) = rx.recv().await {
        let name = key.unwrap_or_else(|| job.to_string());
        match event {
            ProtocolEvent::Progress { percent } => log::info!("{name}: {percent}%"),
            ProtocolEvent::PartialResult { index, .. } => log::info!("{name}: segment {index} ready"),
            ProtocolEvent::DepsInstalling { package } => log::info!("{name}: installing {package}"),
            ProtocolEvent::DepsDone => log::info!("{name}: dependencies installed"),
            ProtocolEvent::Raw { text } => log::debug!("{name}: {text}"),
        }
    }
}
