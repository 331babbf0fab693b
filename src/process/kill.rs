//! Process-tree termination.
//!
//! Workers routinely spawn their own children (ffmpeg, pip, model loaders),
//! so killing only the direct child leaves orphans holding GPU memory and
//! file locks.
//!
//! - Unix: workers are spawned as process-group leaders; the whole group is
//!   sent `SIGKILL`.  If the group is already gone the direct pid is tried.
//! - Windows: `taskkill /pid <pid> /T /F`.

use std::io;

/// Forcefully terminate `pid` and every process it started.
///
/// Returns once the signal has been issued; it does not wait for exit.
#[cfg(unix)]
pub fn kill_tree(pid: u32) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("pid {pid} out of range")))?;
    let pid = Pid::from_raw(raw);

    match killpg(pid, Signal::SIGKILL) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => match kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(io::Error::from(e)),
        },
        Err(e) => Err(io::Error::from(e)),
    }
}

#[cfg(windows)]
pub fn kill_tree(pid: u32) -> io::Result<()> {
    use std::os::windows::process::CommandExt;
    use std::process::{Command, Stdio};

    const CREATE_NO_WINDOW: u32 = 0x0800_0000;

    let status = Command::new("taskkill")
        .args(["/pid", &pid.to_string(), "/T", "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .creation_flags(CREATE_NO_WINDOW)
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::Other,
            format!("taskkill exited with {status}"),
        ))
    }
}
