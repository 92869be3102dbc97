//! Resetting inherited process state

use super::namespace::restore_mount_namespace;
use crate::errors::{ProcessError, Result};
use nix::errno::Errno;

/// Unblock every signal and put SIGPIPE back to its default action.
///
/// Safe to call between fork and exec: only raw libc calls, no allocation.
pub(crate) fn reset_signal_state() -> std::result::Result<(), Errno> {
    unsafe {
        let mut empty: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut empty);
        Errno::result(libc::sigprocmask(
            libc::SIG_SETMASK,
            &empty,
            std::ptr::null_mut(),
        ))?;
        if libc::signal(libc::SIGPIPE, libc::SIG_DFL) == libc::SIG_ERR {
            return Err(Errno::last());
        }
    }
    Ok(())
}

/// Undo what a parent set up for itself: signal mask, SIGPIPE disposition
/// and, if asked, the mount namespace.
pub fn restore_process_context(restore_mounts: bool) -> Result<()> {
    reset_signal_state().map_err(|e| ProcessError::syscall("resetting signal state", e))?;
    if restore_mounts {
        restore_mount_namespace()?;
    }
    Ok(())
}
