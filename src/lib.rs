//! procwarden: process supervision primitives for Linux
//!
//! Scoped ownership of descriptors, directories, child processes and
//! temporary paths, a fork/exec layer that is safe in multithreaded
//! programs, an external program runner, cooperative interrupts driven by a
//! signal listener thread, and mount namespace snapshots.
//!
//! # Modules
//!
//! - **resources**: Descriptor, directory and child process handles
//! - **storage**: Temporary paths, recursive deletion, symlinks
//! - **execution**: Spawning children and running programs
//! - **interrupt**: Process-wide cancellation and signal handling
//! - **isolation**: Mount namespace snapshots and inherited process state
//! - **config**: JSON run descriptions
//!
//! # Example
//!
//! ```ignore
//! use procwarden::{InterruptContext, ProgramRunner, RunOptions};
//!
//! let interrupts = InterruptContext::new();
//! interrupts.start_signal_listener()?;
//!
//! let runner = ProgramRunner::new(interrupts);
//! let result = runner.run(&RunOptions::new("uname").arg("-r"))?;
//! println!("{}", result.stdout_lossy());
//! ```

// Core modules
pub mod errors;
pub mod utils;

// Layered modules
pub mod execution;
pub mod interrupt;
pub mod isolation;
pub mod resources;
pub mod storage;

pub mod config;

// Public API
pub use config::RunConfig;
pub use errors::{ProcessError, Result};
pub use execution::{spawn, ProcessOptions, ProgramRunner, RunOptions, RunResult};
pub use interrupt::{InterruptCallback, InterruptContext, ReceiveInterrupts};
pub use isolation::{restore_mount_namespace, restore_process_context, save_mount_namespace};
pub use resources::{kill_user, ChildProcess, Pipe, ScopedDir, ScopedFd};
pub use storage::{create_temp_dir, delete_path, AutoDelete, TempDirOptions};
