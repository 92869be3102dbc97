//! Error types for process execution

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use thiserror::Error;

use crate::utils::describe_status;

/// Result type for process operations
pub type Result<T> = std::result::Result<T, ProcessError>;

/// Errors that can occur while spawning, running or supervising processes
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Syscall error: {0}")]
    Syscall(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("program '{program}' {}", describe_status(.status))]
    Exec { program: String, status: ExitStatus },

    #[error("executing '{program}' failed at {step}: {errno}")]
    ExecSetup {
        program: String,
        step: &'static str,
        errno: nix::errno::Errno,
    },

    #[error("unexpected end-of-file: {0}")]
    EndOfFile(String),

    #[error("interrupted by the user")]
    Interrupted,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Namespace error: {0}")]
    Namespace(String),
}

impl ProcessError {
    /// Build a syscall error from a context string and errno
    pub fn syscall(context: &str, errno: nix::errno::Errno) -> Self {
        ProcessError::Syscall(format!("{}: {}", context, errno))
    }

    /// Map pipe/fork/descriptor creation failures; EAGAIN, ENOMEM and the
    /// descriptor limits are reported as exhaustion.
    pub fn creation(context: &str, errno: nix::errno::Errno) -> Self {
        use nix::errno::Errno;
        match errno {
            Errno::EAGAIN | Errno::ENOMEM | Errno::EMFILE | Errno::ENFILE => {
                ProcessError::ResourceExhausted(format!("{}: {}", context, errno))
            }
            _ => Self::syscall(context, errno),
        }
    }

    /// Whether this error is the interrupt failure
    pub fn is_interrupted(&self) -> bool {
        matches!(self, ProcessError::Interrupted)
    }

    /// Exit code a top-level command should terminate with
    pub fn exit_code(&self) -> i32 {
        match self {
            ProcessError::Exec { status, .. } => match status.code() {
                Some(code) if code != 0 => code,
                _ => status.signal().map(|s| 128 + s).unwrap_or(1),
            },
            ProcessError::Interrupted => 130,
            _ => 1,
        }
    }
}
