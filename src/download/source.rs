//! What to download and how to turn that into a worker command.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::process::{JobResult, WorkerCommand};

/// Token a download script prints on its last line when it succeeded.
pub const SUCCESS_TOKEN: &str = "SUCCESS";

const MODEL_SCRIPT: &str = r#"
import sys
try:
    from modelscope.hub.snapshot_download import snapshot_download
    model_id, target_dir = sys.argv[1], sys.argv[2]
    print(f"Downloading {model_id} to {target_dir}...", flush=True)
    print("[PROGRESS] 0", flush=True)
    snapshot_download(model_id, local_dir=target_dir)
    print("[PROGRESS] 100", flush=True)
    print("SUCCESS", flush=True)
except Exception as e:
    print(f"ERROR: {e}", flush=True)
"#;

const FILE_SCRIPT: &str = r#"
import os
import sys
import urllib.request
import zipfile

url, out_dir = sys.argv[1], sys.argv[2]
zip_path = os.path.join(out_dir, "temp_download.zip")
last = [-1]

def progress(count, block_size, total_size):
    if total_size <= 0:
        return
    percent = min(100, int(count * block_size * 100 / total_size))
    if percent != last[0]:
        last[0] = percent
        print(f"[PROGRESS] {percent}", flush=True)

try:
    print(f"Downloading {url}...", flush=True)
    urllib.request.urlretrieve(url, zip_path, reporthook=progress)
    print("Download complete. Extracting...", flush=True)
    with zipfile.ZipFile(zip_path, "r") as zip_ref:
        zip_ref.extractall(out_dir)
    os.remove(zip_path)
    print("Extraction complete.", flush=True)
    print("SUCCESS", flush=True)
except Exception as e:
    print(f"ERROR: {e}", flush=True)
"#;

// ---------------------------------------------------------------------------
// DownloadSpec
// ---------------------------------------------------------------------------

/// One download request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DownloadSpec {
    /// Snapshot a model repository from the model hub.
    Model { model_id: String, local_dir: String },
    /// Fetch a zip archive and extract it.
    File {
        url: String,
        target_dir: String,
        name: Option<String>,
    },
}

impl DownloadSpec {
    /// Registry key used when the caller does not supply one.
    pub fn default_key(&self) -> String {
        match self {
            DownloadSpec::Model { model_id, .. } => model_id.clone(),
            DownloadSpec::File { name: Some(name), .. } => name.clone(),
            DownloadSpec::File { url, .. } => url.clone(),
        }
    }

    /// Directory the download lands in, always inside `models_root`.
    pub fn target_dir(&self, models_root: &Path) -> PathBuf {
        let relative = match self {
            DownloadSpec::Model { local_dir, .. } => local_dir,
            DownloadSpec::File { target_dir, .. } => target_dir,
        };
        join_within(models_root, strip_models_prefix(relative))
    }

    /// Create the target directory.
    pub fn prepare(&self, models_root: &Path) -> std::io::Result<PathBuf> {
        let dir = self.target_dir(models_root);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Tag written into the download log banners.
    pub fn log_label(&self) -> &'static str {
        match self {
            DownloadSpec::Model { .. } => "DownloadModel",
            DownloadSpec::File { .. } => "DownloadFile",
        }
    }

    pub fn describe(&self, models_root: &Path) -> String {
        let source = match self {
            DownloadSpec::Model { model_id, .. } => model_id,
            DownloadSpec::File { url, .. } => url,
        };
        format!("{source} -> {}", self.target_dir(models_root).display())
    }

    /// `python -c <script> <source> <target dir>` with UTF-8 forced.
    pub fn command(&self, python: &Path, models_root: &Path) -> WorkerCommand {
        let (script, source) = match self {
            DownloadSpec::Model { model_id, .. } => (MODEL_SCRIPT, model_id),
            DownloadSpec::File { url, .. } => (FILE_SCRIPT, url),
        };
        WorkerCommand::new(python)
            .arg("-c")
            .arg(script)
            .arg(source)
            .arg(self.target_dir(models_root))
            .utf8_env()
    }
}

/// Drop a leading `models/` (or `models\`) from a catalogue path; download
/// paths are relative to the models root itself.
pub fn strip_models_prefix(path: &str) -> &str {
    path.strip_prefix("models/")
        .or_else(|| path.strip_prefix("models\\"))
        .unwrap_or(path)
}

/// Join `relative` onto `root` lexically.  Roots and drive prefixes are
/// dropped and `..` never climbs above `root`.
fn join_within(root: &Path, relative: &str) -> PathBuf {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::ParentDir => {
                parts.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    parts.into_iter().fold(root.to_path_buf(), |dir, part| dir.join(part))
}

// ---------------------------------------------------------------------------
// DownloadOutcome
// ---------------------------------------------------------------------------

/// What a finished download reports to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DownloadOutcome {
    /// A download succeeded when it exited 0 and printed [`SUCCESS_TOKEN`].
    pub fn from_result(result: &JobResult) -> Self {
        match result {
            JobResult::Success { payload } => {
                let stdout = payload
                    .get("rawOutput")
                    .and_then(|v| v.as_str())
                    .map(str::to_owned)
                    .unwrap_or_else(|| payload.to_string());
                if stdout.contains(SUCCESS_TOKEN) {
                    Self {
                        success: true,
                        error: None,
                    }
                } else {
                    let stderr = payload
                        .get("rawError")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default();
                    Self::failed(format!("Process failed (Code 0).\n{stderr}\n{stdout}"))
                }
            }
            JobResult::Failure {
                exit_code, stderr, ..
            } => Self::failed(format!("Process failed (Code {exit_code}).\n{stderr}")),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}
