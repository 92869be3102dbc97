//! Pumping a child's standard streams
//!
//! Output is drained on the calling thread while stdin is fed and stderr is
//! collected from scoped helper threads, so neither side can fill a pipe
//! buffer and stall the other.

use crate::errors::{ProcessError, Result};
use crate::interrupt::{InterruptContext, ReceiveInterrupts};
use crate::resources::fd::{drain_fd_into, write_full, ScopedFd};
use crate::resources::pid::ChildProcess;
use log::{debug, warn};
use std::io::{Read, Write};
use std::thread;

/// What is written to the child's stdin
pub enum StdinSource<'a> {
    Bytes(&'a [u8]),
    Reader(&'a mut (dyn Read + Send)),
}

/// Parent ends of the pipes connected to a child
#[derive(Debug, Default)]
pub struct ChildPipes {
    pub stdin: Option<ScopedFd>,
    pub stdout: Option<ScopedFd>,
    pub stderr: Option<ScopedFd>,
}

/// Feed stdin, drain stdout into `sink` and collect stderr until every pipe
/// reaches end of file.
///
/// On failure the child is killed before the helper threads are joined, so
/// they see their pipes close instead of blocking forever.
pub fn pump(
    pipes: ChildPipes,
    input: Option<StdinSource<'_>>,
    sink: &mut dyn Write,
    child: &mut ChildProcess,
    interrupts: &InterruptContext,
) -> Result<Option<Vec<u8>>> {
    let ChildPipes {
        stdin,
        stdout,
        stderr,
    } = pipes;

    thread::scope(|scope| {
        let writer = match (stdin, input) {
            (Some(fd), Some(source)) => {
                Some(scope.spawn(move || feed_stdin(fd, source, interrupts)))
            }
            // Dropping the pipe gives the child an immediate end of file.
            _ => None,
        };

        let collector = stderr.map(|fd| {
            scope.spawn(move || -> Result<Vec<u8>> {
                let _wake = ReceiveInterrupts::new(interrupts)?;
                let mut buf = Vec::new();
                drain_fd_into(fd.get(), &mut buf, true, Some(interrupts))?;
                Ok(buf)
            })
        });

        let drained = match stdout {
            Some(fd) => ReceiveInterrupts::new(interrupts)
                .and_then(|_wake| drain_fd_into(fd.get(), sink, true, Some(interrupts))),
            None => Ok(()),
        };

        if drained.is_err() && child.is_owned() {
            debug!("output pump failed, killing child");
            if let Err(e) = child.kill() {
                warn!("{}", e);
            }
        }

        let fed = match writer {
            Some(handle) => join(handle, "stdin writer"),
            None => Ok(()),
        };
        let captured = match collector {
            Some(handle) => join(handle, "stderr reader").map(Some),
            None => Ok(None),
        };

        drained?;
        fed?;
        captured
    })
}

fn feed_stdin(
    mut fd: ScopedFd,
    source: StdinSource<'_>,
    interrupts: &InterruptContext,
) -> Result<()> {
    let _wake = ReceiveInterrupts::new(interrupts)?;
    let result = match source {
        StdinSource::Bytes(bytes) => write_full(fd.get(), bytes, Some(interrupts)),
        StdinSource::Reader(reader) => copy_reader(fd.get(), reader, interrupts),
    };

    match result {
        // The child stopped reading; what it consumed is all it gets.
        Err(ProcessError::Io(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
            debug!("child closed its stdin early");
        }
        other => other?,
    }
    fd.close()
}

fn copy_reader(
    fd: std::os::unix::io::RawFd,
    reader: &mut (dyn Read + Send),
    interrupts: &InterruptContext,
) -> Result<()> {
    let mut buf = [0u8; 65536];
    loop {
        interrupts.check()?;
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        write_full(fd, &buf[..n], Some(interrupts))?;
    }
}

fn join<T>(handle: thread::ScopedJoinHandle<'_, Result<T>>, what: &str) -> Result<T> {
    handle
        .join()
        .map_err(|_| ProcessError::Syscall(format!("{} thread panicked", what)))?
}
