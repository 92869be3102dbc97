//! Running external programs
//!
//! Everything the child needs between fork and exec is prepared in the
//! parent as an [`ExecPlan`]: C strings, pointer arrays and raw descriptor
//! numbers. The child only walks that plan with raw syscalls. If a step
//! fails it writes the step index and errno to a close-on-exec status pipe,
//! so the parent can tell a setup failure from the program's own exit code.

use crate::errors::{ProcessError, Result};
use crate::execution::spawn::{arm_parent_death_signal, spawn, ProcessOptions};
use crate::execution::stream::{pump, ChildPipes, StdinSource};
use crate::interrupt::{InterruptCallback, InterruptContext};
use crate::resources::fd::{read_full, Pipe, ScopedFd};
use crate::resources::pid::{send_pidfd_signal, ChildProcess};
use crate::utils::{describe_status, search_path, status_ok};
use log::debug;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::{access, getpid, AccessFlags, Pid};
use std::collections::BTreeMap;
use std::ffi::CString;
use std::io::{Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

/// Exit status of a child whose setup failed before exec
pub const EXEC_FAILED: i32 = 127;

const EXEC_STEPS: [&str; 9] = [
    "redirecting stdin",
    "redirecting stdout",
    "redirecting stderr",
    "setgid",
    "setgroups",
    "setuid",
    "re-arming parent death signal",
    "chdir",
    "exec",
];

const STEP_STDIN: u32 = 0;
const STEP_STDOUT: u32 = 1;
const STEP_STDERR: u32 = 2;
const STEP_SETGID: u32 = 3;
const STEP_SETGROUPS: u32 = 4;
const STEP_SETUID: u32 = 5;
const STEP_PDEATHSIG: u32 = 6;
const STEP_CHDIR: u32 = 7;
const STEP_EXEC: u32 = 8;

/// What to run and how
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub program: String,
    /// Look the program up in `PATH` when it has no slash
    pub search_path: bool,
    pub args: Vec<String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub chdir: Option<PathBuf>,
    /// Replaces the environment entirely when set
    pub environment: Option<BTreeMap<String, String>>,
    /// Bytes written to the child's stdin; stdin is inherited when unset
    pub input: Option<Vec<u8>>,
    pub merge_stderr_to_stdout: bool,
    /// Capture stderr into [`RunResult::stderr`] instead of inheriting it
    pub capture_stderr: bool,
    /// Fail with `Exec` on a non-zero or abnormal exit
    pub check_status: bool,
    pub separate_process_group: bool,
    pub die_with_parent: bool,
    /// Use the address-space-sharing clone to start the child
    pub allow_vfork: bool,
    /// Start the program in the saved mount namespace
    pub restore_mount_namespace: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            program: String::new(),
            search_path: true,
            args: Vec::new(),
            uid: None,
            gid: None,
            chdir: None,
            environment: None,
            input: None,
            merge_stderr_to_stdout: false,
            capture_stderr: false,
            check_status: true,
            separate_process_group: false,
            die_with_parent: true,
            allow_vfork: true,
            restore_mount_namespace: true,
        }
    }
}

impl RunOptions {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn search_path(mut self, search_path: bool) -> Self {
        self.search_path = search_path;
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }

    pub fn gid(mut self, gid: u32) -> Self {
        self.gid = Some(gid);
        self
    }

    pub fn chdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.chdir = Some(dir.into());
        self
    }

    /// Replace the environment; starts from an empty one on first use
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn environment(mut self, environment: BTreeMap<String, String>) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn input(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn merge_stderr_to_stdout(mut self, merge: bool) -> Self {
        self.merge_stderr_to_stdout = merge;
        self
    }

    pub fn capture_stderr(mut self, capture: bool) -> Self {
        self.capture_stderr = capture;
        self
    }

    pub fn check_status(mut self, check: bool) -> Self {
        self.check_status = check;
        self
    }

    pub fn separate_process_group(mut self, separate: bool) -> Self {
        self.separate_process_group = separate;
        self
    }

    pub fn allow_vfork(mut self, allow: bool) -> Self {
        self.allow_vfork = allow;
        self
    }

    pub fn restore_mount_namespace(mut self, restore: bool) -> Self {
        self.restore_mount_namespace = restore;
        self
    }
}

/// Outcome of a finished program
#[derive(Debug, Clone)]
pub struct RunResult {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Option<Vec<u8>>,
}

impl RunResult {
    /// Exit code, or `None` if the child was killed by a signal
    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }

    pub fn success(&self) -> bool {
        status_ok(&self.status)
    }

    /// Stdout as text, with invalid UTF-8 replaced by U+FFFD
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Resolve a program name against a `PATH`-style search list
pub fn resolve_program(program: &str, path_value: &str) -> Option<PathBuf> {
    if program.contains('/') {
        return Some(PathBuf::from(program));
    }

    for entry in path_value.split(':') {
        let dir = if entry.is_empty() { "." } else { entry };
        let candidate = Path::new(dir).join(program);
        if candidate.is_file() && access(&candidate, AccessFlags::X_OK).is_ok() {
            return Some(candidate);
        }
    }
    None
}

/// Everything the child touches, built before the fork
struct ExecPlan {
    program: CString,
    _argv: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    _envp: Vec<CString>,
    envp_ptrs: Option<Vec<*const libc::c_char>>,
    chdir: Option<CString>,
    uid: Option<libc::uid_t>,
    gid: Option<libc::gid_t>,
    stdin: Option<RawFd>,
    stdout: Option<RawFd>,
    stderr: Option<RawFd>,
    merge_stderr: bool,
    status_fd: RawFd,
    die_with_parent: bool,
    parent: Pid,
}

fn c_string(what: &str, s: &[u8]) -> Result<CString> {
    CString::new(s).map_err(|_| ProcessError::InvalidConfig(format!("{} contains a NUL byte", what)))
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

impl ExecPlan {
    fn new(options: &RunOptions, program: &Path, status_fd: RawFd) -> Result<Self> {
        let program = c_string("program", program.as_os_str().as_bytes())?;

        // argv[0] is the name as given.
        let argv = std::iter::once(options.program.as_str())
            .chain(options.args.iter().map(String::as_str))
            .map(|arg| c_string("argument", arg.as_bytes()))
            .collect::<Result<Vec<_>>>()?;
        let argv_ptrs = null_terminated(&argv);

        let envp = match &options.environment {
            Some(env) => env
                .iter()
                .map(|(k, v)| c_string("environment", format!("{}={}", k, v).as_bytes()))
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };
        let envp_ptrs = options.environment.as_ref().map(|_| null_terminated(&envp));

        let chdir = match &options.chdir {
            Some(dir) => Some(c_string("working directory", dir.as_os_str().as_bytes())?),
            None => None,
        };

        Ok(Self {
            program,
            _argv: argv,
            argv_ptrs,
            _envp: envp,
            envp_ptrs,
            chdir,
            uid: options.uid,
            gid: options.gid,
            stdin: None,
            stdout: None,
            stderr: None,
            merge_stderr: options.merge_stderr_to_stdout,
            status_fd,
            die_with_parent: options.die_with_parent,
            parent: getpid(),
        })
    }

    /// Runs in the child: raw syscalls only
    fn exec(&self) -> i32 {
        if let Some(fd) = self.stdin {
            if let Err(e) = redirect(fd, 0) {
                self.fail(STEP_STDIN, e);
            }
        }
        if let Some(fd) = self.stdout {
            if let Err(e) = redirect(fd, 1) {
                self.fail(STEP_STDOUT, e);
            }
        }
        if self.merge_stderr {
            if let Err(e) = redirect(1, 2) {
                self.fail(STEP_STDERR, e);
            }
        } else if let Some(fd) = self.stderr {
            if let Err(e) = redirect(fd, 2) {
                self.fail(STEP_STDERR, e);
            }
        }

        // Group first: without root privileges setgid would be refused.
        // Raw syscalls, since the libc wrappers try to sync every thread of
        // the parent, whose memory a vfork child shares.
        if let Some(gid) = self.gid {
            if unsafe { libc::syscall(libc::SYS_setgid, gid) } == -1 {
                self.fail(STEP_SETGID, Errno::last());
            }
            let no_groups: *const libc::gid_t = std::ptr::null();
            if unsafe { libc::syscall(libc::SYS_setgroups, 0 as libc::size_t, no_groups) } == -1 {
                self.fail(STEP_SETGROUPS, Errno::last());
            }
        }
        if let Some(uid) = self.uid {
            if unsafe { libc::syscall(libc::SYS_setuid, uid) } == -1 {
                self.fail(STEP_SETUID, Errno::last());
            }
        }
        if self.die_with_parent && (self.uid.is_some() || self.gid.is_some()) {
            if let Err(e) = arm_parent_death_signal(self.parent) {
                self.fail(STEP_PDEATHSIG, e);
            }
        }

        if let Some(dir) = &self.chdir {
            if unsafe { libc::chdir(dir.as_ptr()) } == -1 {
                self.fail(STEP_CHDIR, Errno::last());
            }
        }

        unsafe {
            match &self.envp_ptrs {
                Some(envp) => libc::execve(self.program.as_ptr(), self.argv_ptrs.as_ptr(), envp.as_ptr()),
                None => libc::execv(self.program.as_ptr(), self.argv_ptrs.as_ptr()),
            };
        }
        self.fail(STEP_EXEC, Errno::last())
    }

    fn fail(&self, step: u32, errno: Errno) -> ! {
        let mut report = [0u8; 8];
        report[..4].copy_from_slice(&step.to_le_bytes());
        report[4..].copy_from_slice(&(errno as i32).to_le_bytes());
        unsafe {
            libc::write(self.status_fd, report.as_ptr() as *const libc::c_void, report.len());
            libc::_exit(EXEC_FAILED)
        }
    }
}

/// Move `fd` onto `target`, keeping it open across exec
fn redirect(fd: RawFd, target: RawFd) -> std::result::Result<(), Errno> {
    if fd == target {
        let flags = Errno::result(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
        Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) })?;
        return Ok(());
    }
    Errno::result(unsafe { libc::dup2(fd, target) })?;
    Ok(())
}

/// Read the child's setup report; `None` means it reached exec
fn read_exec_report(fd: RawFd) -> Result<Option<(&'static str, Errno)>> {
    let mut report = [0u8; 8];
    match read_full(fd, &mut report, None) {
        Ok(()) => {}
        Err(ProcessError::EndOfFile(_)) => return Ok(None),
        Err(e) => return Err(e),
    }
    let mut step = [0u8; 4];
    let mut errno = [0u8; 4];
    step.copy_from_slice(&report[..4]);
    errno.copy_from_slice(&report[4..]);
    let step = EXEC_STEPS
        .get(u32::from_le_bytes(step) as usize)
        .copied()
        .unwrap_or("setup");
    Ok(Some((step, Errno::from_raw(i32::from_le_bytes(errno)))))
}

/// Runs programs on behalf of one interrupt context
#[derive(Debug, Clone)]
pub struct ProgramRunner {
    interrupts: InterruptContext,
}

impl ProgramRunner {
    pub fn new(interrupts: InterruptContext) -> Self {
        Self { interrupts }
    }

    pub fn interrupts(&self) -> &InterruptContext {
        &self.interrupts
    }

    /// Run a program and return its stdout; a non-zero exit is an error, and
    /// so is output that is not UTF-8
    pub fn run_output(
        &self,
        program: &str,
        search_path: bool,
        args: &[&str],
        input: Option<&[u8]>,
    ) -> Result<String> {
        let mut options = RunOptions::new(program)
            .search_path(search_path)
            .args(args.iter().copied())
            .check_status(true);
        options.input = input.map(<[u8]>::to_vec);
        let result = self.run(&options)?;
        String::from_utf8(result.stdout).map_err(|e| {
            ProcessError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("output of '{}' is not UTF-8: {}", program, e),
            ))
        })
    }

    /// Run a program, capturing stdout (and stderr if asked)
    pub fn run(&self, options: &RunOptions) -> Result<RunResult> {
        let mut stdout = Vec::new();
        let (status, stderr) = self.run_with_sink(options, None, &mut stdout)?;
        Ok(RunResult {
            status,
            stdout,
            stderr,
        })
    }

    /// Run a program, streaming stdout into `sink` and feeding stdin from
    /// `source` (or `options.input`). Fails on a non-zero exit.
    pub fn run_streaming(
        &self,
        options: &RunOptions,
        source: Option<&mut (dyn Read + Send)>,
        sink: &mut dyn Write,
    ) -> Result<ExitStatus> {
        let checked;
        let options = if options.check_status {
            options
        } else {
            checked = options.clone().check_status(true);
            &checked
        };
        self.run_with_sink(options, source, sink).map(|(status, _)| status)
    }

    /// Run a program with stdout going to `sink` and stdin fed from
    /// `source` (or `options.input`); returns the status and, if asked for,
    /// the captured stderr
    pub fn run_with_sink(
        &self,
        options: &RunOptions,
        source: Option<&mut (dyn Read + Send)>,
        sink: &mut dyn Write,
    ) -> Result<(ExitStatus, Option<Vec<u8>>)> {
        self.interrupts.check()?;

        let program = self.resolve(options)?;
        debug!("running '{}' {:?}", program.display(), options.args);

        let mut status_pipe = Pipe::create()?;
        let mut plan = ExecPlan::new(options, &program, status_pipe.write_side.get())?;

        let feeds_stdin = source.is_some() || options.input.is_some();
        let mut stdin_pipe = if feeds_stdin { Some(Pipe::create()?) } else { None };
        let mut stdout_pipe = Pipe::create()?;
        let mut stderr_pipe = if options.capture_stderr && !options.merge_stderr_to_stdout {
            Some(Pipe::create()?)
        } else {
            None
        };

        let mut spawn_options = ProcessOptions {
            error_prefix: options.program.clone(),
            die_with_parent: options.die_with_parent,
            allow_vfork: options.allow_vfork,
            separate_process_group: options.separate_process_group,
            restore_mount_namespace: options.restore_mount_namespace,
            ..Default::default()
        }
        .keep_fd(status_pipe.write_side.get());

        plan.stdout = Some(stdout_pipe.write_side.get());
        spawn_options.keep_fds.insert(stdout_pipe.write_side.get());
        if let Some(pipe) = &stdin_pipe {
            plan.stdin = Some(pipe.read_side.get());
            spawn_options.keep_fds.insert(pipe.read_side.get());
        }
        if let Some(pipe) = &stderr_pipe {
            plan.stderr = Some(pipe.write_side.get());
            spawn_options.keep_fds.insert(pipe.write_side.get());
        }

        // SAFETY: `ExecPlan::exec` only issues raw syscalls on prepared data.
        let mut child = unsafe { spawn(|| plan.exec(), &spawn_options)? };
        let _kill_on_interrupt = self.kill_on_interrupt(&child);

        // Only the child keeps these ends open now.
        status_pipe.write_side.close()?;
        stdout_pipe.write_side.close()?;
        if let Some(pipe) = stdin_pipe.as_mut() {
            pipe.read_side.close()?;
        }
        if let Some(pipe) = stderr_pipe.as_mut() {
            pipe.write_side.close()?;
        }

        if let Some((step, errno)) = read_exec_report(status_pipe.read_side.get())? {
            let _ = child.wait();
            return Err(ProcessError::ExecSetup {
                program: options.program.clone(),
                step,
                errno,
            });
        }

        let input = match source {
            Some(reader) => Some(StdinSource::Reader(reader)),
            None => options.input.as_deref().map(StdinSource::Bytes),
        };
        let pipes = ChildPipes {
            stdin: stdin_pipe.map(|pipe| take_fd(pipe, false)),
            stdout: Some(take_fd(stdout_pipe, true)),
            stderr: stderr_pipe.map(|pipe| take_fd(pipe, true)),
        };

        // A trigger that came before the callback existed.
        self.interrupts.check()?;

        let captured = pump(pipes, input, sink, &mut child, &self.interrupts)?;

        let status = child.wait_interruptible(&self.interrupts)?;
        debug!("'{}' {}", options.program, describe_status(&status));

        if options.check_status && !status_ok(&status) {
            return Err(ProcessError::Exec {
                program: options.program.clone(),
                status,
            });
        }
        Ok((status, captured))
    }

    /// Kill the child as soon as an interrupt is triggered, so whatever
    /// waits on its output or exit returns. Signals go through a pidfd,
    /// which can never reach a recycled pid once the child is reaped.
    fn kill_on_interrupt(&self, child: &ChildProcess) -> Option<InterruptCallback> {
        let pidfd = match child.open_pidfd() {
            Ok(fd) => fd,
            Err(e) => {
                debug!("no pidfd, interrupts rely on thread wake-ups: {}", e);
                return None;
            }
        };
        Some(self.interrupts.register(move || {
            let _ = send_pidfd_signal(&pidfd, Signal::SIGKILL);
        }))
    }

    fn resolve(&self, options: &RunOptions) -> Result<PathBuf> {
        if !options.search_path {
            return Ok(PathBuf::from(&options.program));
        }
        let path_value = options
            .environment
            .as_ref()
            .and_then(|env| env.get("PATH").cloned())
            .unwrap_or_else(search_path);
        resolve_program(&options.program, &path_value).ok_or_else(|| ProcessError::ExecSetup {
            program: options.program.clone(),
            step: "resolving program",
            errno: Errno::ENOENT,
        })
    }
}

fn take_fd(mut pipe: Pipe, read_side: bool) -> ScopedFd {
    if read_side {
        std::mem::take(&mut pipe.read_side)
    } else {
        std::mem::take(&mut pipe.write_side)
    }
}
