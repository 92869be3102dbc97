//! Resource handles: exclusive owners of descriptors, directory streams and child pids
//!
//! Every handle releases its resource exactly once when dropped, on every exit
//! path. Cleanup failures are logged, never raised.

pub mod dir;
pub mod fd;
pub mod pid;

pub use dir::{read_directory, DirEntry, ScopedDir};
pub use fd::{
    close_most_fds, close_on_exec, drain_fd, drain_fd_into, read_full, read_line, write_full,
    write_line, Pipe, ScopedFd,
};
pub use pid::{kill_user, ChildProcess};
