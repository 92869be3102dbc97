//! Child process creation
//!
//! Everything that runs in the child between fork and exec sits in this file
//! and sticks to raw libc calls: no allocation, no locks, no logging. A
//! multithreaded parent may have held any lock at the moment of the fork.

use crate::errors::{ProcessError, Result};
use crate::isolation::context::reset_signal_state;
use crate::isolation::namespace::global_snapshot;
use crate::resources::fd::max_fd;
use crate::resources::pid::ChildProcess;
use log::debug;
use nix::errno::Errno;
use nix::sched::{clone, CloneFlags};
use nix::sys::signal::Signal;
use nix::unistd::{fork, getpid, setpgid, ForkResult, Pid};
use std::collections::BTreeSet;
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Exit status of a child that failed before it could run its work
pub const CHILD_SETUP_FAILED: i32 = 125;

/// Stack for the address-space-sharing clone
const CHILD_STACK_SIZE: usize = 131072;

/// How a child process is created
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// Prefix for diagnostics the child writes to stderr
    pub error_prefix: String,
    /// Kill the child when the parent dies
    pub die_with_parent: bool,
    /// Leave through `exit` instead of `_exit`; refused together with `allow_vfork`
    pub run_exit_handlers: bool,
    /// Share the address space until exec (`CLONE_VM | CLONE_VFORK`)
    pub allow_vfork: bool,
    /// Put the child in a process group of its own
    pub separate_process_group: bool,
    /// Close every inherited descriptor above 2 except `keep_fds`
    pub close_fds: bool,
    /// Descriptors passed through to the child
    pub keep_fds: BTreeSet<RawFd>,
    /// Re-enter the saved mount namespace before running work, when the
    /// spawning thread has left it
    pub restore_mount_namespace: bool,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            error_prefix: String::new(),
            die_with_parent: true,
            run_exit_handlers: false,
            allow_vfork: false,
            separate_process_group: false,
            close_fds: true,
            keep_fds: BTreeSet::new(),
            restore_mount_namespace: false,
        }
    }
}

impl ProcessOptions {
    pub fn keep_fd(mut self, fd: RawFd) -> Self {
        self.keep_fds.insert(fd);
        self
    }
}

/// Start a child that runs `work` and exits with the status it returns.
///
/// Errors creating the child are returned before any child exists. Anything
/// that fails later is only visible through the child's exit status
/// ([`CHILD_SETUP_FAILED`] for the prelude, or a panic inside `work`).
///
/// # Safety
///
/// `work` runs in a freshly forked copy of a possibly multithreaded process.
/// It must restrict itself to async-signal-safe operations: no allocation,
/// no locks, no logging. With `allow_vfork` the parent is suspended and its
/// memory is shared until `work` execs or exits, so `work` must also leave
/// every piece of parent state untouched.
pub unsafe fn spawn<F>(work: F, options: &ProcessOptions) -> Result<ChildProcess>
where
    F: FnOnce() -> i32,
{
    if options.run_exit_handlers && options.allow_vfork {
        return Err(ProcessError::InvalidConfig(
            "exit handlers cannot run in a child that shares the parent's memory".to_string(),
        ));
    }

    let parent = getpid();
    let mount_ns = if options.restore_mount_namespace {
        global_snapshot().fd_for_child()
    } else {
        None
    };

    let pid = if options.allow_vfork {
        let mut stack = vec![0u8; CHILD_STACK_SIZE];
        let mut work = Some(work);
        let callback = Box::new(move || -> isize {
            match work.take() {
                Some(work) => child_main(work, options, parent, mount_ns),
                None => unsafe { libc::_exit(CHILD_SETUP_FAILED) },
            }
        });
        clone(
            callback,
            &mut stack,
            CloneFlags::CLONE_VM | CloneFlags::CLONE_VFORK,
            Some(Signal::SIGCHLD as i32),
        )
        .map_err(|e| ProcessError::creation("unable to clone", e))?
    } else {
        match fork().map_err(|e| ProcessError::creation("unable to fork", e))? {
            ForkResult::Child => child_main(work, options, parent, mount_ns),
            ForkResult::Parent { child } => child,
        }
    };

    debug!("started child process {}", pid);

    let mut child = ChildProcess::new(pid);
    if options.separate_process_group {
        // Also done by the child; whichever runs first wins the race.
        let _ = setpgid(pid, pid);
        child.set_separate_pg(true);
    }
    Ok(child)
}

fn child_main<F>(work: F, options: &ProcessOptions, parent: Pid, mount_ns: Option<RawFd>) -> !
where
    F: FnOnce() -> i32,
{
    let prefix = options.error_prefix.as_bytes();

    if options.die_with_parent {
        if let Err(e) = arm_parent_death_signal(parent) {
            child_abort(prefix, b"setting parent death signal", e);
        }
    }

    if options.separate_process_group && unsafe { libc::setpgid(0, 0) } == -1 {
        child_abort(prefix, b"setpgid", Errno::last());
    }

    if let Err(e) = reset_signal_state() {
        child_abort(prefix, b"resetting signal state", e);
    }

    if let Some(fd) = mount_ns {
        if unsafe { libc::setns(fd, libc::CLONE_NEWNS) } == -1 {
            child_abort(prefix, b"restoring mount namespace", Errno::last());
        }
    }

    if options.close_fds {
        close_fds_except(&options.keep_fds);
    }

    let status = catch_unwind(AssertUnwindSafe(work)).unwrap_or(CHILD_SETUP_FAILED);

    if options.run_exit_handlers {
        unsafe { libc::exit(status) }
    } else {
        unsafe { libc::_exit(status) }
    }
}

/// Ask for SIGKILL when the parent dies, then make sure it has not died
/// already. The setting is cleared by credential changes, so callers that
/// switch uid or gid arm it again afterwards.
pub(crate) fn arm_parent_death_signal(parent: Pid) -> std::result::Result<(), Errno> {
    Errno::result(unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) })?;
    if unsafe { libc::getppid() } != parent.as_raw() {
        unsafe { libc::_exit(CHILD_SETUP_FAILED) };
    }
    Ok(())
}

/// Close every descriptor above 2 not in `keep`, without allocating
pub(crate) fn close_fds_except(keep: &BTreeSet<RawFd>) {
    let mut low: RawFd = 3;
    for &fd in keep.range(3..) {
        if fd > low {
            close_range(low, fd - 1);
        }
        low = fd.saturating_add(1);
    }
    close_range(low, RawFd::MAX);
}

fn close_range(low: RawFd, high: RawFd) {
    let res = unsafe {
        libc::syscall(
            libc::SYS_close_range,
            low as libc::c_uint,
            high as libc::c_uint,
            0 as libc::c_uint,
        )
    };
    if res == 0 {
        return;
    }

    // Kernels before 5.9.
    let high = high.min(max_fd());
    let mut fd = low;
    while fd <= high {
        unsafe { libc::close(fd) };
        fd += 1;
    }
}

/// Write `<prefix>: <step> failed (errno N)` to stderr and exit
pub(crate) fn child_abort(prefix: &[u8], step: &[u8], errno: Errno) -> ! {
    let mut digits = [0u8; 12];
    let number = format_decimal(errno as i32, &mut digits);

    if !prefix.is_empty() {
        write_stderr(prefix);
        write_stderr(b": ");
    }
    write_stderr(step);
    write_stderr(b" failed (errno ");
    write_stderr(number);
    write_stderr(b")\n");
    unsafe { libc::_exit(CHILD_SETUP_FAILED) }
}

fn write_stderr(bytes: &[u8]) {
    unsafe { libc::write(2, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
}

fn format_decimal(value: i32, buf: &mut [u8; 12]) -> &[u8] {
    let negative = value < 0;
    let mut n = (value as i64).unsigned_abs();
    let mut pos = buf.len();
    loop {
        pos -= 1;
        buf[pos] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    if negative {
        pos -= 1;
        buf[pos] = b'-';
    }
    &buf[pos..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serial_guard;
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn test_format_decimal() {
        let mut buf = [0u8; 12];
        assert_eq!(format_decimal(0, &mut buf), b"0");
        assert_eq!(format_decimal(13, &mut buf), b"13");
        assert_eq!(format_decimal(-22, &mut buf), b"-22");
        assert_eq!(format_decimal(i32::MIN, &mut buf), b"-2147483648");
    }

    #[test]
    fn test_default_options() {
        let options = ProcessOptions::default();
        assert!(options.die_with_parent);
        assert!(!options.run_exit_handlers);
        assert!(!options.allow_vfork);
        assert!(options.close_fds);
        assert!(options.keep_fds.is_empty());
    }

    #[test]
    fn test_spawn_reports_work_status() {
        let _guard = serial_guard();
        let mut child = unsafe { spawn(|| 42, &ProcessOptions::default()) }.unwrap();
        let status = child.wait().unwrap();
        assert_eq!(status.code(), Some(42));
    }

    #[test]
    fn test_spawn_with_vfork() {
        let _guard = serial_guard();
        let options = ProcessOptions {
            allow_vfork: true,
            ..Default::default()
        };
        let mut child = unsafe { spawn(|| 3, &options) }.unwrap();
        assert_eq!(child.wait().unwrap().code(), Some(3));
    }

    #[test]
    fn test_spawn_separate_process_group() {
        let _guard = serial_guard();
        let options = ProcessOptions {
            separate_process_group: true,
            ..Default::default()
        };
        let mut child = unsafe {
            spawn(
                || {
                    if libc::getpgid(0) == libc::getpid() {
                        0
                    } else {
                        1
                    }
                },
                &options,
            )
        }
        .unwrap();
        assert_eq!(child.wait().unwrap().code(), Some(0));
    }

    #[test]
    fn test_spawn_closes_inherited_descriptors() {
        let _guard = serial_guard();
        let (kept, _kept_w) = nix::unistd::pipe().unwrap();
        let (dropped, _dropped_w) = nix::unistd::pipe().unwrap();
        let kept_fd = std::os::fd::AsRawFd::as_raw_fd(&kept);
        let dropped_fd = std::os::fd::AsRawFd::as_raw_fd(&dropped);

        let options = ProcessOptions::default().keep_fd(kept_fd);
        let mut child = unsafe {
            spawn(
                move || {
                    let kept_open = libc::fcntl(kept_fd, libc::F_GETFD) != -1;
                    let dropped_open = libc::fcntl(dropped_fd, libc::F_GETFD) != -1;
                    if kept_open && !dropped_open {
                        0
                    } else {
                        1
                    }
                },
                &options,
            )
        }
        .unwrap();
        assert_eq!(child.wait().unwrap().code(), Some(0));
    }

    #[test]
    fn test_spawn_resets_signal_mask() {
        let _guard = serial_guard();
        let mut set = nix::sys::signal::SigSet::empty();
        set.add(Signal::SIGUSR2);
        let mut old = nix::sys::signal::SigSet::empty();
        nix::sys::signal::pthread_sigmask(
            nix::sys::signal::SigmaskHow::SIG_BLOCK,
            Some(&set),
            Some(&mut old),
        )
        .unwrap();

        let mut child = unsafe {
            spawn(
                || {
                    let mut current: libc::sigset_t = std::mem::zeroed();
                    libc::sigprocmask(libc::SIG_SETMASK, std::ptr::null(), &mut current);
                    if libc::sigismember(&current, libc::SIGUSR2) == 0 {
                        0
                    } else {
                        1
                    }
                },
                &ProcessOptions::default(),
            )
        }
        .unwrap();
        let status = child.wait().unwrap();

        nix::sys::signal::pthread_sigmask(
            nix::sys::signal::SigmaskHow::SIG_SETMASK,
            Some(&old),
            None,
        )
        .unwrap();
        assert_eq!(status.code(), Some(0));
    }

    #[test]
    fn test_exit_handlers_refused_with_vfork() {
        let options = ProcessOptions {
            run_exit_handlers: true,
            allow_vfork: true,
            ..Default::default()
        };
        let err = unsafe { spawn(|| 0, &options) }.unwrap_err();
        assert!(matches!(err, ProcessError::InvalidConfig(_)));
    }

    #[test]
    fn test_spawn_with_exit_handlers() {
        let _guard = serial_guard();
        let options = ProcessOptions {
            run_exit_handlers: true,
            ..Default::default()
        };
        let mut child = unsafe { spawn(|| 9, &options) }.unwrap();
        assert_eq!(child.wait().unwrap().code(), Some(9));
    }

    #[test]
    fn test_panicking_work_exits_with_setup_status() {
        let _guard = serial_guard();
        let mut child =
            unsafe { spawn(|| panic!("child work failed"), &ProcessOptions::default()) }.unwrap();
        let status = child.wait().unwrap();
        assert_eq!(status.code(), Some(CHILD_SETUP_FAILED));
        assert!(status.signal().is_none());
    }
}
