//! Owned child process ids

use crate::errors::{ProcessError, Result};
use crate::interrupt::InterruptContext;
use crate::resources::fd::ScopedFd;
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::os::unix::io::RawFd;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

/// Owner of at most one live child process.
///
/// Dropping a handle that still owns a pid sends the kill signal and reaps
/// the child. A pid is only forgotten after it has been reaped, so the
/// number can never refer to an unrelated process while the handle holds it.
#[derive(Debug)]
pub struct ChildProcess {
    pid: Option<Pid>,
    separate_pg: bool,
    kill_signal: Signal,
}

impl ChildProcess {
    /// Take ownership of a child pid
    pub fn new(pid: Pid) -> Self {
        Self {
            pid: Some(pid),
            separate_pg: false,
            kill_signal: Signal::SIGKILL,
        }
    }

    /// A handle that owns nothing
    pub fn empty() -> Self {
        Self {
            pid: None,
            separate_pg: false,
            kill_signal: Signal::SIGKILL,
        }
    }

    /// The owned pid, if any
    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// Whether a live (unreaped) child is owned
    pub fn is_owned(&self) -> bool {
        self.pid.is_some()
    }

    /// Replace the owned pid, killing the previous child first
    pub fn reset(&mut self, pid: Pid) {
        self.kill_quietly();
        self.pid = Some(pid);
    }

    /// Signal the whole process group instead of just the child
    pub fn set_separate_pg(&mut self, separate_pg: bool) {
        self.separate_pg = separate_pg;
    }

    /// Signal used by `kill` and on drop
    pub fn set_kill_signal(&mut self, signal: Signal) {
        self.kill_signal = signal;
    }

    pub fn kill_signal(&self) -> Signal {
        self.kill_signal
    }

    /// Give up ownership without signaling
    pub fn release(&mut self) -> Option<Pid> {
        self.pid.take()
    }

    /// Send the kill signal and reap the child
    pub fn kill(&mut self) -> Result<ExitStatus> {
        let pid = self
            .pid
            .ok_or_else(|| ProcessError::Syscall("no child process to kill".to_string()))?;

        debug!("killing process {}", pid);

        let target = if self.separate_pg {
            Pid::from_raw(-pid.as_raw())
        } else {
            pid
        };

        if let Err(e) = kill(target, self.kill_signal) {
            // An exited but unreaped child still accepts signals; ESRCH here
            // means the group is already empty, which is fine.
            if e != Errno::ESRCH {
                warn!("killing process {}: {}", pid, e);
            }
        }

        self.wait()
    }

    /// Wait for the child to exit, retrying interrupted waits
    pub fn wait(&mut self) -> Result<ExitStatus> {
        self.wait_with(None)
    }

    /// Wait for the child, failing with `Interrupted` once the context is set
    pub fn wait_interruptible(&mut self, interrupts: &InterruptContext) -> Result<ExitStatus> {
        self.wait_with(Some(interrupts))
    }

    fn wait_with(&mut self, interrupts: Option<&InterruptContext>) -> Result<ExitStatus> {
        let pid = self
            .pid
            .ok_or_else(|| ProcessError::Syscall("no child process to wait for".to_string()))?;

        loop {
            if let Some(ctx) = interrupts {
                ctx.check()?;
            }
            let mut status: libc::c_int = 0;
            let res = unsafe { libc::waitpid(pid.as_raw(), &mut status, 0) };
            match Errno::result(res) {
                Ok(_) => {
                    self.pid = None;
                    return Ok(ExitStatus::from_raw(status));
                }
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    return Err(ProcessError::syscall(
                        &format!("cannot get exit status of PID {}", pid),
                        e,
                    ))
                }
            }
        }
    }

    /// Reap the child if it has already exited
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        let pid = match self.pid {
            Some(pid) => pid,
            None => return Ok(None),
        };
        let mut status: libc::c_int = 0;
        let res = unsafe { libc::waitpid(pid.as_raw(), &mut status, libc::WNOHANG) };
        match Errno::result(res) {
            Ok(0) => Ok(None),
            Ok(_) => {
                self.pid = None;
                Ok(Some(ExitStatus::from_raw(status)))
            }
            Err(e) => Err(ProcessError::syscall("waitpid", e)),
        }
    }

    /// Open a pidfd for the owned child (Linux 5.3+)
    pub fn open_pidfd(&self) -> Result<ScopedFd> {
        let pid = self
            .pid
            .ok_or_else(|| ProcessError::Syscall("no child process to open".to_string()))?;
        let res = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0 as libc::c_uint) };
        // pidfd_open always sets close-on-exec.
        let fd = Errno::result(res).map_err(|e| ProcessError::syscall("pidfd_open", e))?;
        Ok(ScopedFd::from_raw(fd as RawFd))
    }

    fn kill_quietly(&mut self) {
        if self.pid.is_some() {
            if let Err(e) = self.kill() {
                warn!("{}", e);
            }
            // Never retry on a pid we could not reap.
            self.pid = None;
        }
    }
}

impl Default for ChildProcess {
    fn default() -> Self {
        Self::empty()
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        self.kill_quietly();
    }
}

/// Signal the process behind a pidfd. Once that process has been reaped
/// this fails with ESRCH instead of hitting whoever reused the pid.
pub fn send_pidfd_signal(pidfd: &ScopedFd, signal: Signal) -> Result<()> {
    let res = unsafe {
        libc::syscall(
            libc::SYS_pidfd_send_signal,
            pidfd.get(),
            signal as libc::c_int,
            std::ptr::null::<libc::siginfo_t>(),
            0 as libc::c_uint,
        )
    };
    Errno::result(res)
        .map(|_| ())
        .map_err(|e| ProcessError::syscall("pidfd_send_signal", e))
}

/// Kill every process running under `uid`.
///
/// A helper child switches to `uid` and signals everything it is allowed to,
/// so processes of other users are never touched.
pub fn kill_user(uid: u32) -> Result<()> {
    if uid == 0 {
        return Err(ProcessError::InvalidConfig(
            "refusing to kill all processes of root".to_string(),
        ));
    }

    debug!("killing all processes running under uid {}", uid);

    let options = crate::execution::spawn::ProcessOptions {
        error_prefix: "kill_user".to_string(),
        die_with_parent: false,
        ..Default::default()
    };

    // SAFETY: the helper does not allocate and ends with _exit.
    let mut child = unsafe {
        crate::execution::spawn::spawn(
            move || {
                if libc::setuid(uid) == -1 {
                    libc::_exit(2);
                }
                loop {
                    if libc::kill(-1, libc::SIGKILL) == 0 {
                        libc::_exit(0);
                    }
                    match Errno::last() {
                        Errno::ESRCH | Errno::EPERM => libc::_exit(0),
                        Errno::EINTR => continue,
                        _ => libc::_exit(1),
                    }
                }
            },
            &options,
        )?
    };

    let status = child.wait()?;
    if status.code() != Some(0) {
        return Err(ProcessError::Exec {
            program: format!("kill_user({})", uid),
            status,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serial_guard;
    use nix::unistd::{fork, ForkResult};

    fn fork_child(body: fn() -> !) -> Pid {
        match unsafe { fork() } {
            Ok(ForkResult::Child) => body(),
            Ok(ForkResult::Parent { child }) => child,
            Err(e) => panic!("fork failed: {}", e),
        }
    }

    fn exit_seven() -> ! {
        unsafe { libc::_exit(7) }
    }

    fn sleep_forever() -> ! {
        loop {
            unsafe { libc::pause() };
        }
    }

    fn own_group_then_sleep() -> ! {
        unsafe { libc::setpgid(0, 0) };
        sleep_forever()
    }

    #[test]
    fn test_wait_returns_exit_status() {
        let _guard = serial_guard();
        let mut child = ChildProcess::new(fork_child(exit_seven));
        let status = child.wait().unwrap();
        assert_eq!(status.code(), Some(7));
        assert!(!child.is_owned());
    }

    #[test]
    fn test_kill_reaps_running_child() {
        let _guard = serial_guard();
        let mut child = ChildProcess::new(fork_child(sleep_forever));
        let status = child.kill().unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
        assert!(child.pid().is_none());
    }

    #[test]
    fn test_custom_kill_signal() {
        let _guard = serial_guard();
        let mut child = ChildProcess::new(fork_child(sleep_forever));
        child.set_kill_signal(Signal::SIGTERM);
        let status = child.kill().unwrap();
        assert_eq!(status.signal(), Some(libc::SIGTERM));
    }

    #[test]
    fn test_drop_of_exited_child_is_harmless() {
        let _guard = serial_guard();
        let pid = fork_child(exit_seven);
        std::thread::sleep(std::time::Duration::from_millis(50));
        drop(ChildProcess::new(pid));

        // Reaped by the drop: the pid no longer belongs to us.
        assert_eq!(
            nix::sys::wait::waitpid(pid, None).unwrap_err(),
            Errno::ECHILD
        );
    }

    #[test]
    fn test_release_does_not_signal() {
        let _guard = serial_guard();
        let mut child = ChildProcess::new(fork_child(exit_seven));
        let pid = child.release().unwrap();
        drop(child);

        let status = nix::sys::wait::waitpid(pid, None).unwrap();
        assert_eq!(status, nix::sys::wait::WaitStatus::Exited(pid, 7));
    }

    #[test]
    fn test_separate_pg_kills_group() {
        let _guard = serial_guard();
        let pid = fork_child(own_group_then_sleep);
        let _ = nix::unistd::setpgid(pid, pid);

        let mut child = ChildProcess::new(pid);
        child.set_separate_pg(true);
        let status = child.kill().unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }

    #[test]
    fn test_wait_without_pid_fails() {
        let mut child = ChildProcess::empty();
        assert!(child.wait().is_err());
        assert!(child.kill().is_err());
        assert!(child.try_wait().unwrap().is_none());
    }

    #[test]
    fn test_wait_interruptible_stops_when_triggered() {
        let _guard = serial_guard();
        let ctx = InterruptContext::new();
        ctx.trigger();

        let mut child = ChildProcess::new(fork_child(sleep_forever));
        let err = child.wait_interruptible(&ctx).unwrap_err();
        assert!(err.is_interrupted());
        assert!(child.is_owned());
        drop(child);
    }

    #[test]
    fn test_pidfd_signal_kills_child() {
        let _guard = serial_guard();
        let mut child = ChildProcess::new(fork_child(sleep_forever));
        let pidfd = child.open_pidfd().unwrap();
        send_pidfd_signal(&pidfd, Signal::SIGKILL).unwrap();
        assert_eq!(child.wait().unwrap().signal(), Some(libc::SIGKILL));

        // Reaped: the pidfd no longer reaches anything.
        assert!(send_pidfd_signal(&pidfd, Signal::SIGKILL).is_err());
    }

    #[test]
    fn test_kill_user_refuses_root() {
        assert!(matches!(
            kill_user(0),
            Err(ProcessError::InvalidConfig(_))
        ));
    }
}
