//! Resolving the worker interpreter, script and models directory.
//!
//! Each lookup is an ordered list of [`Candidate`]s; the first one that
//! exists wins.  When none do, [`LocateError::NotFound`] lists every
//! candidate that was tried so the user can see where we looked.
//!
//! Interpreter order: configured path, the bundled runtime under
//! `<root>/python`, the same next to the executable, then `python3` / `python` on
//! `PATH`.  Script order: configured path, `<root>/backend/main.py`, next to
//! the executable, then the current directory.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::{AppPaths, WorkerConfig};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocateError {
    #[error("{what} not found; tried: {}", .tried.join(", "))]
    NotFound { what: String, tried: Vec<String> },
}

// ---------------------------------------------------------------------------
// Candidate / Locator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    /// A concrete filesystem path.
    Path(PathBuf),
    /// A bare program name searched for in `PATH`.
    OnPath(String),
}

impl std::fmt::Display for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Candidate::Path(p) => write!(f, "{}", p.display()),
            Candidate::OnPath(name) => write!(f, "{name} (on PATH)"),
        }
    }
}

/// Ordered candidate list for one thing we need to find.
#[derive(Debug, Clone)]
pub struct Locator {
    what: String,
    candidates: Vec<Candidate>,
}

impl Locator {
    pub fn new(what: impl Into<String>) -> Self {
        Self {
            what: what.into(),
            candidates: Vec::new(),
        }
    }

    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.candidates.push(Candidate::Path(path.into()));
        self
    }

    pub fn maybe_path(self, path: Option<impl Into<PathBuf>>) -> Self {
        match path {
            Some(p) => self.path(p),
            None => self,
        }
    }

    pub fn on_path(mut self, name: impl Into<String>) -> Self {
        self.candidates.push(Candidate::OnPath(name.into()));
        self
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    /// First existing candidate, searching the process `PATH`.
    pub fn resolve(&self) -> Result<PathBuf, LocateError> {
        self.resolve_in(std::env::var_os("PATH").as_deref())
    }

    /// First existing candidate, searching `path_var` for bare names.
    pub fn resolve_in(&self, path_var: Option<&OsStr>) -> Result<PathBuf, LocateError> {
        for candidate in &self.candidates {
            let found = match candidate {
                Candidate::Path(p) => p.is_file().then(|| p.clone()),
                Candidate::OnPath(name) => search_path(name, path_var),
            };
            if let Some(found) = found {
                log::debug!("locate: {} -> {}", self.what, found.display());
                return Ok(found);
            }
        }
        Err(LocateError::NotFound {
            what: self.what.clone(),
            tried: self.candidates.iter().map(ToString::to_string).collect(),
        })
    }
}

fn search_path(name: &str, path_var: Option<&OsStr>) -> Option<PathBuf> {
    let path_var = path_var?;
    std::env::split_paths(path_var).find_map(|dir| {
        executable_names(name)
            .into_iter()
            .map(|n| dir.join(n))
            .find(|p| p.is_file())
    })
}

fn executable_names(name: &str) -> Vec<String> {
    if cfg!(windows) && Path::new(name).extension().is_none() {
        vec![format!("{name}.exe"), name.to_string()]
    } else {
        vec![name.to_string()]
    }
}

fn python_exe(dir: &Path) -> PathBuf {
    if cfg!(windows) {
        dir.join("python").join("python.exe")
    } else {
        dir.join("python").join("bin").join("python3")
    }
}

// ---------------------------------------------------------------------------
// WorkerLocation
// ---------------------------------------------------------------------------

/// Everything needed to build a worker command line.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerLocation {
    pub python: PathBuf,
    pub script: PathBuf,
    /// Root of the model tree (`<models>/index-tts/hub` is passed to workers).
    pub models_dir: PathBuf,
}

impl WorkerLocation {
    /// Value passed as `--model_dir` to every worker.
    pub fn model_hub_dir(&self) -> PathBuf {
        self.models_dir.join("index-tts").join("hub")
    }
}

/// Resolve the interpreter and script for `config`, falling back through
/// the bundled and system locations.
pub fn locate_worker(config: &WorkerConfig, paths: &AppPaths) -> Result<WorkerLocation, LocateError> {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf));
    let cwd = std::env::current_dir().ok();
    let root = config.project_root.clone().or_else(|| cwd.clone());

    let python = python_locator(config, root.as_deref(), exe_dir.as_deref()).resolve()?;
    let script = script_locator(config, root.as_deref(), exe_dir.as_deref(), cwd.as_deref()).resolve()?;

    Ok(WorkerLocation {
        python,
        script,
        models_dir: models_dir(config, root.as_deref(), paths),
    })
}

pub fn python_locator(config: &WorkerConfig, root: Option<&Path>, exe_dir: Option<&Path>) -> Locator {
    let mut locator = Locator::new("python interpreter");
    if let Some(configured) = &config.python {
        // A bare name like "python3.11" means "look it up".
        locator = if configured.components().count() == 1 && !configured.is_absolute() {
            locator.on_path(configured.to_string_lossy())
        } else {
            locator.path(configured)
        };
    }
    locator
        .maybe_path(root.map(python_exe))
        .maybe_path(exe_dir.map(python_exe))
        .on_path("python3")
        .on_path("python")
}

pub fn script_locator(
    config: &WorkerConfig,
    root: Option<&Path>,
    exe_dir: Option<&Path>,
    cwd: Option<&Path>,
) -> Locator {
    let main_py = |dir: &Path| dir.join("backend").join("main.py");
    Locator::new("worker script")
        .maybe_path(config.script.clone())
        .maybe_path(root.map(main_py))
        .maybe_path(exe_dir.map(main_py))
        .maybe_path(cwd.map(main_py))
}

/// Configured models dir, else `<root>/models` when present, else the
/// platform data dir.
pub fn models_dir(config: &WorkerConfig, root: Option<&Path>, paths: &AppPaths) -> PathBuf {
    if let Some(dir) = &config.models_dir {
        return dir.clone();
    }
    if let Some(local) = root.map(|r| r.join("models")).filter(|p| p.is_dir()) {
        return local;
    }
    paths.models_dir.clone()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"").unwrap();
    }

    #[test]
    fn first_existing_candidate_wins() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let c = dir.path().join("c");
        touch(&b);
        touch(&c);

        let found = Locator::new("thing").path(&a).path(&b).path(&c).resolve_in(None).unwrap();
        assert_eq!(found, b);
    }

    #[test]
    fn not_found_lists_every_candidate_in_order() {
        let dir = tempdir().unwrap();
        let locator = Locator::new("python interpreter")
            .path(dir.path().join("one"))
            .on_path("no-such-python");

        let err = locator.resolve_in(Some(dir.path().as_os_str())).unwrap_err();
        let LocateError::NotFound { what, tried } = &err;
        assert_eq!(what, "python interpreter");
        assert_eq!(tried.len(), 2);
        assert!(tried[0].ends_with("one"));
        assert_eq!(tried[1], "no-such-python (on PATH)");
        assert!(err.to_string().contains("no-such-python"));
    }

    #[test]
    fn bare_names_are_searched_in_path() {
        let dir = tempdir().unwrap();
        let bin = dir.path().join("bin");
        let name = if cfg!(windows) { "worker-py.exe" } else { "worker-py" };
        touch(&bin.join(name));

        let path_var = std::env::join_paths([dir.path().join("empty"), bin.clone()]).unwrap();
        let found = Locator::new("python").on_path("worker-py").resolve_in(Some(path_var.as_os_str())).unwrap();
        assert_eq!(found, bin.join(name));
    }

    #[test]
    fn configured_python_is_tried_before_bundled() {
        let root = tempdir().unwrap();
        let configured = root.path().join("custom").join("py");
        let config = WorkerConfig {
            python: Some(configured.clone()),
            ..WorkerConfig::default()
        };

        let locator = python_locator(&config, Some(root.path()), None);
        assert_eq!(locator.candidates()[0], Candidate::Path(configured));
        assert_eq!(locator.candidates()[1], Candidate::Path(python_exe(root.path())));
        assert_eq!(
            locator.candidates().last(),
            Some(&Candidate::OnPath("python".into()))
        );
    }

    #[test]
    fn script_under_project_root_is_found() {
        let root = tempdir().unwrap();
        let script = root.path().join("backend").join("main.py");
        touch(&script);

        let found = script_locator(&WorkerConfig::default(), Some(root.path()), None, None)
            .resolve_in(None)
            .unwrap();
        assert_eq!(found, script);
    }

    #[test]
    fn models_dir_prefers_config_then_project_then_platform() {
        let root = tempdir().unwrap();
        let paths = AppPaths::new();

        assert_eq!(
            models_dir(&WorkerConfig::default(), Some(root.path()), &paths),
            paths.models_dir
        );

        std::fs::create_dir_all(root.path().join("models")).unwrap();
        assert_eq!(
            models_dir(&WorkerConfig::default(), Some(root.path()), &paths),
            root.path().join("models")
        );

        let config = WorkerConfig {
            models_dir: Some(PathBuf::from("/opt/models")),
            ..WorkerConfig::default()
        };
        assert_eq!(models_dir(&config, Some(root.path()), &paths), PathBuf::from("/opt/models"));
    }

    #[test]
    fn model_hub_dir_is_under_index_tts() {
        let loc = WorkerLocation {
            python: "python".into(),
            script: "main.py".into(),
            models_dir: PathBuf::from("models"),
        };
        assert_eq!(loc.model_hub_dir(), Path::new("models").join("index-tts").join("hub"));
    }
}
