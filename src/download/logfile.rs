//! Append-only download log (`logs/backend_debug.log`).
//!
//! Each download writes a start banner, its stdout verbatim, its stderr
//! with a `[STDERR] ` prefix, and a finish banner carrying the exit code.
//! Failing to open or write the file never affects the download itself.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};

use crate::process::OutputSink;

pub struct DownloadLog {
    path: PathBuf,
    label: String,
    file: Option<File>,
}

impl DownloadLog {
    /// Open `path` for appending (creating parent directories) and write the
    /// start banner.
    pub fn open(path: &Path, label: &str, description: &str) -> Self {
        let file = Self::open_file(path);
        let mut log = Self {
            path: path.to_path_buf(),
            label: label.to_string(),
            file,
        };
        log.write(format!("\n[{}] [{label}] Starting download: {description}\n", timestamp()).as_bytes());
        log
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_file(path: &Path) -> Option<File> {
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                log::error!("downloads: failed to create log dir {}: {e}", parent.display());
            }
        }
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(file),
            Err(e) => {
                log::error!("downloads: failed to open log {}: {e}", path.display());
                None
            }
        }
    }

    fn write(&mut self, bytes: &[u8]) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if let Err(e) = file.write_all(bytes) {
            log::warn!("downloads: writing {} failed, closing log: {e}", self.path.display());
            self.file = None;
        }
    }
}

impl OutputSink for DownloadLog {
    fn stdout(&mut self, chunk: &[u8]) {
        self.write(chunk);
    }

    fn stderr(&mut self, chunk: &[u8]) {
        let mut line = b"[STDERR] ".to_vec();
        line.extend_from_slice(chunk);
        self.write(&line);
    }

    fn finish(&mut self, exit_code: i32) {
        let banner = format!(
            "\n[{}] [{}] Finished with code {exit_code}\n",
            timestamp(),
            self.label
        );
        self.write(banner.as_bytes());
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_banners_and_prefixed_stderr() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join("backend_debug.log");

        let mut log = DownloadLog::open(&path, "DownloadModel", "Qwen/x -> models/qwen");
        log.stdout(b"Downloading...\n");
        log.stderr(b"warning: slow\n");
        log.finish(0);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("[DownloadModel] Starting download: Qwen/x -> models/qwen"));
        assert!(text.contains("Downloading...\n"));
        assert!(text.contains("[STDERR] warning: slow\n"));
        assert!(text.contains("[DownloadModel] Finished with code 0"));
    }

    #[test]
    fn appends_across_downloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("debug.log");

        DownloadLog::open(&path, "A", "first").finish(0);
        DownloadLog::open(&path, "B", "second").finish(1);

        let text = std::fs::read_to_string(&path).unwrap();
        let first = text.find("[A] Starting").unwrap();
        let second = text.find("[B] Starting").unwrap();
        assert!(first < second);
        assert!(text.contains("[B] Finished with code 1"));
    }

    #[test]
    fn unwritable_path_is_ignored() {
        let dir = tempdir().unwrap();
        // A directory cannot be opened as an append-only file.
        let mut log = DownloadLog::open(dir.path(), "X", "nowhere");
        log.stdout(b"data");
        log.finish(0);
        assert_eq!(log.path(), dir.path());
    }
}
