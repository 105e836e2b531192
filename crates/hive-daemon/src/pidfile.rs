//! PID marker for the running daemon.

use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, info};

use crate::error::Result;

/// Write the current process id to `path`.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be written.
pub fn write(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let pid = std::process::id();
    fs::write(path, format!("{pid}\n"))?;
    info!("Wrote PID file {} (pid={})", path.display(), pid);
    Ok(())
}

/// Pid recorded in `path`, if the file exists and parses.
#[must_use]
pub fn read(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

pub fn remove(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed PID file {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => debug!("Failed to remove PID file {}: {}", path.display(), e),
    }
}

/// Whether a process with this pid exists.
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only checks that the process exists.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Ask the process to shut down with SIGTERM.
///
/// # Errors
///
/// Returns the OS error reported by `kill`.
pub fn terminate(pid: u32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill has no memory-safety preconditions.
    if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
