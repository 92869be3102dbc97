//! Execution layer: child processes and external programs
//!
//! This module starts child processes and runs external programs with
//! their standard streams wired to pipes.
//!
//! # Features
//!
//! - **Spawning**: fork or an address-space-sharing clone, with a fixed child prelude
//! - **Parent death**: children are killed when the parent goes away
//! - **Program runner**: PATH lookup, stdin feeding, stdout/stderr capture
//! - **Credential switching**: gid before uid, only inside the child
//!
//! # Examples
//!
//! ```ignore
//! use procwarden::execution::{ProgramRunner, RunOptions};
//! use procwarden::interrupt::InterruptContext;
//!
//! let runner = ProgramRunner::new(InterruptContext::new());
//! let result = runner.run(&RunOptions::new("echo").arg("hello"))?;
//! assert_eq!(result.stdout, b"hello\n");
//! ```

pub mod process;
pub mod spawn;
pub mod stream;

pub use process::{resolve_program, ProgramRunner, RunOptions, RunResult, EXEC_FAILED};
pub use spawn::{spawn, ProcessOptions, CHILD_SETUP_FAILED};
pub use stream::StdinSource;
