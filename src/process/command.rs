//! Worker command lines.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

/// A worker invocation: program, argv, extra environment and working dir.
///
/// Built once per launch and turned into a `tokio::process::Command` by the
/// supervisor.  Kept as plain data so it can be inspected in tests and logs.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append `--<name> <value>`.
    pub fn flag(self, name: &str, value: impl Into<OsString>) -> Self {
        self.arg(format!("--{name}")).arg(value)
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Force the Python worker to read and write UTF-8 regardless of the
    /// host locale.
    pub fn utf8_env(self) -> Self {
        self.env("PYTHONUTF8", "1").env("PYTHONIOENCODING", "utf-8")
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Value of `--action`, if present.
    pub fn action(&self) -> Option<String> {
        self.flag_value("action")
    }

    /// Value following `--<name>` in argv, if present.
    pub fn flag_value(&self, name: &str) -> Option<String> {
        let needle = format!("--{name}");
        self.args
            .iter()
            .position(|a| a.to_str() == Some(needle.as_str()))
            .and_then(|i| self.args.get(i + 1))
            .map(|v| v.to_string_lossy().into_owned())
    }

    pub fn has_flag(&self, name: &str) -> bool {
        let needle = format!("--{name}");
        self.args.iter().any(|a| a.to_str() == Some(needle.as_str()))
    }

    /// Short human-readable label for log lines.
    pub fn display(&self) -> String {
        let mut out = self.program.display().to_string();
        for arg in &self.args {
            out.push(' ');
            out.push_str(&arg.to_string_lossy());
        }
        out
    }

    /// Build the tokio command with piped stdout/stderr and a null stdin.
    ///
    /// On Unix the child becomes the leader of a new process group so that
    /// killing the group also takes any grandchildren it spawned.
    pub(crate) fn to_tokio_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);
        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }
        cmd
    }
}
