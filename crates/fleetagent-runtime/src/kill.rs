use std::io;

use crate::{procfs, SupervisorError};

const PROTECTED_PIDS: [i32; 2] = [0, 1];

fn signal(pid: i32, sig: libc::c_int) -> io::Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, sig) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// SIGKILL every member of process group `pgid`.
pub(crate) fn kill_group(pgid: i32) {
    if pgid <= 1 {
        return;
    }
    // SAFETY: killpg(2) has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(pgid, error = %err, "killpg failed");
        }
    }
}

/// Kill `pid` after best-effort killing its direct children.
///
/// Fails with [`SupervisorError::ProcessNotFound`] when `pid` is not running.
pub fn kill(pid: i32) -> Result<(), SupervisorError> {
    if pid < 0 || PROTECTED_PIDS.contains(&pid) {
        return Err(SupervisorError::Protected(pid));
    }
    if !procfs::is_alive(pid) {
        return Err(SupervisorError::ProcessNotFound(pid));
    }

    for child in procfs::children_of(pid) {
        match signal(child, libc::SIGKILL) {
            Ok(()) => tracing::debug!(pid, child, "killed child process"),
            Err(e) => tracing::debug!(pid, child, error = %e, "could not kill child process"),
        }
    }

    match signal(pid, libc::SIGKILL) {
        Ok(()) => {
            tracing::info!(pid, "killed process");
            Ok(())
        }
        Err(e) if e.raw_os_error() == Some(libc::ESRCH) => Err(SupervisorError::ProcessNotFound(pid)),
        Err(source) => Err(SupervisorError::Kill { pid, source }),
    }
}
