//! Owned file descriptors, pipes and descriptor I/O helpers

use crate::errors::{ProcessError, Result};
use crate::interrupt::InterruptContext;
use log::warn;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::sys::stat::Mode;
use std::collections::BTreeSet;
use std::io::Write;
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

/// Exclusive owner of one file descriptor; `-1` means nothing is held.
///
/// Dropping the handle closes the descriptor exactly once. `release` hands the
/// descriptor to the caller and disarms the close.
#[derive(Debug)]
pub struct ScopedFd {
    fd: RawFd,
}

impl ScopedFd {
    /// Create an empty handle
    pub const fn none() -> Self {
        Self { fd: -1 }
    }

    /// Take ownership of a raw descriptor
    pub fn from_raw(fd: RawFd) -> Self {
        Self { fd }
    }

    /// Open a path with close-on-exec always added to `flags`
    pub fn open(path: &Path, flags: OFlag, mode: Mode) -> Result<Self> {
        let fd = nix::fcntl::open(path, flags | OFlag::O_CLOEXEC, mode).map_err(|e| {
            ProcessError::creation(&format!("opening '{}'", path.display()), e)
        })?;
        Ok(Self { fd })
    }

    /// Raw value without transferring ownership
    pub fn get(&self) -> RawFd {
        self.fd
    }

    /// Whether a descriptor is held
    pub fn is_valid(&self) -> bool {
        self.fd >= 0
    }

    /// Give up ownership; the caller becomes responsible for closing
    pub fn release(&mut self) -> RawFd {
        std::mem::replace(&mut self.fd, -1)
    }

    /// Replace the held descriptor, closing the previous one first
    pub fn reset(&mut self, fd: RawFd) {
        if self.fd != fd {
            self.close_quietly();
        }
        self.fd = fd;
    }

    /// Close now, reporting the close error to the caller
    pub fn close(&mut self) -> Result<()> {
        let fd = self.release();
        if fd < 0 {
            return Ok(());
        }
        // Linux releases the descriptor even when close reports EINTR.
        match Errno::result(unsafe { libc::close(fd) }) {
            Ok(_) | Err(Errno::EINTR) => Ok(()),
            Err(e) => Err(ProcessError::syscall(&format!("closing fd {}", fd), e)),
        }
    }

    fn close_quietly(&mut self) {
        if let Err(e) = self.close() {
            warn!("{}", e);
        }
    }

    /// Convert into a standard owned descriptor, if one is held
    pub fn into_owned(mut self) -> Option<OwnedFd> {
        let fd = self.release();
        // SAFETY: we held exclusive ownership of `fd` until release.
        (fd >= 0).then(|| unsafe { OwnedFd::from_raw_fd(fd) })
    }
}

impl Default for ScopedFd {
    fn default() -> Self {
        Self::none()
    }
}

impl Drop for ScopedFd {
    fn drop(&mut self) {
        self.close_quietly();
    }
}

impl AsRawFd for ScopedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl From<OwnedFd> for ScopedFd {
    fn from(fd: OwnedFd) -> Self {
        Self::from_raw(fd.into_raw_fd())
    }
}

/// A read end and a write end created together
#[derive(Debug, Default)]
pub struct Pipe {
    pub read_side: ScopedFd,
    pub write_side: ScopedFd,
}

impl Pipe {
    /// Create a pipe with both ends marked close-on-exec
    pub fn create() -> Result<Self> {
        let (read, write) =
            nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| ProcessError::creation("pipe", e))?;
        Ok(Self {
            read_side: read.into(),
            write_side: write.into(),
        })
    }

    /// Close both ends
    pub fn close(&mut self) -> Result<()> {
        let read = self.read_side.close();
        let write = self.write_side.close();
        read.and(write)
    }
}

/// Set the close-on-exec flag on a descriptor
pub fn close_on_exec(fd: RawFd) -> Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFD).map_err(|e| ProcessError::syscall("F_GETFD", e))?;
    let flags = FdFlag::from_bits_truncate(flags) | FdFlag::FD_CLOEXEC;
    fcntl(fd, FcntlArg::F_SETFD(flags)).map_err(|e| ProcessError::syscall("F_SETFD", e))?;
    Ok(())
}

/// Close every descriptor above stderr that is not listed in `exceptions`
pub fn close_most_fds(exceptions: &BTreeSet<RawFd>) -> Result<()> {
    let open: Vec<RawFd> = match std::fs::read_dir("/proc/self/fd") {
        Ok(entries) => entries
            .flatten()
            .filter_map(|e| e.file_name().into_string().ok())
            .filter_map(|name| name.parse().ok())
            .collect(),
        Err(_) => (3..max_fd()).collect(),
    };

    for fd in open.into_iter().filter(|fd| *fd > 2 && !exceptions.contains(fd)) {
        // The directory iterator's own descriptor is already gone; EBADF is expected.
        let _ = unsafe { libc::close(fd) };
    }
    Ok(())
}

pub(crate) fn max_fd() -> RawFd {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } == 0
        && limit.rlim_cur != libc::RLIM_INFINITY
    {
        limit.rlim_cur.min(i32::MAX as libc::rlim_t) as RawFd
    } else {
        65536
    }
}

/// Longest a blocked call goes without looking at the interrupt flag
const INTERRUPT_TICK_MS: libc::c_int = 100;

fn retry_or_check(interrupts: Option<&InterruptContext>) -> Result<()> {
    match interrupts {
        Some(ctx) => ctx.check(),
        None => Ok(()),
    }
}

/// Wait for `fd` to become ready while watching the interrupt flag.
///
/// The wake-up signal can land between a check and the blocking call that
/// follows it. Polling in ticks bounds how long such a lost wake-up delays
/// the interrupt.
fn wait_ready(fd: RawFd, events: libc::c_short, interrupts: Option<&InterruptContext>) -> Result<()> {
    let ctx = match interrupts {
        Some(ctx) => ctx,
        None => return Ok(()),
    };
    loop {
        ctx.check()?;
        let mut pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        match Errno::result(unsafe { libc::poll(&mut pfd, 1, INTERRUPT_TICK_MS) }) {
            Ok(0) | Err(Errno::EINTR) => continue,
            Ok(_) => return Ok(()),
            Err(e) => return Err(ProcessError::syscall("poll", e)),
        }
    }
}

/// Read exactly `buf.len()` bytes
pub fn read_full(fd: RawFd, buf: &mut [u8], interrupts: Option<&InterruptContext>) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        wait_ready(fd, libc::POLLIN, interrupts)?;
        match nix::unistd::read(fd, &mut buf[filled..]) {
            Ok(0) => {
                return Err(ProcessError::EndOfFile(format!(
                    "fd {} ended after {} of {} bytes",
                    fd,
                    filled,
                    buf.len()
                )))
            }
            Ok(n) => filled += n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(ProcessError::syscall("reading from file", e)),
        }
    }
    Ok(())
}

/// Write all of `data`
pub fn write_full(fd: RawFd, data: &[u8], interrupts: Option<&InterruptContext>) -> Result<()> {
    let mut written = 0;
    while written < data.len() {
        wait_ready(fd, libc::POLLOUT, interrupts)?;
        let res = unsafe {
            libc::write(
                fd,
                data[written..].as_ptr() as *const libc::c_void,
                data.len() - written,
            )
        };
        match Errno::result(res) {
            Ok(n) => written += n as usize,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                return Err(ProcessError::Io(std::io::Error::new(
                    std::io::Error::from(e).kind(),
                    format!("writing to file: {}", e),
                )))
            }
        }
    }
    Ok(())
}

/// Read until end-of-file and return the bytes
pub fn drain_fd(fd: RawFd, block: bool, interrupts: Option<&InterruptContext>) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    drain_fd_into(fd, &mut out, block, interrupts)?;
    Ok(out)
}

/// Read until end-of-file into a sink. With `block == false` the drain
/// also stops when no more data is immediately available.
pub fn drain_fd_into(
    fd: RawFd,
    sink: &mut dyn Write,
    block: bool,
    interrupts: Option<&InterruptContext>,
) -> Result<()> {
    let saved = if block {
        None
    } else {
        let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(|e| ProcessError::syscall("F_GETFL", e))?;
        let flags = OFlag::from_bits_truncate(flags);
        fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))
            .map_err(|e| ProcessError::syscall("F_SETFL", e))?;
        Some(flags)
    };

    let result = drain_loop(fd, sink, block, interrupts);

    if let Some(flags) = saved {
        if let Err(e) = fcntl(fd, FcntlArg::F_SETFL(flags)) {
            warn!("restoring flags on fd {}: {}", fd, e);
        }
    }
    result
}

fn drain_loop(
    fd: RawFd,
    sink: &mut dyn Write,
    block: bool,
    interrupts: Option<&InterruptContext>,
) -> Result<()> {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        if block {
            wait_ready(fd, libc::POLLIN, interrupts)?;
        } else {
            retry_or_check(interrupts)?;
        }
        match nix::unistd::read(fd, &mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => sink.write_all(&buf[..n])?,
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => return Ok(()),
            Err(e) => return Err(ProcessError::syscall("reading from file", e)),
        }
    }
}

/// Read one newline-terminated line, without the newline
pub fn read_line(fd: RawFd, interrupts: Option<&InterruptContext>) -> Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        wait_ready(fd, libc::POLLIN, interrupts)?;
        match nix::unistd::read(fd, &mut byte) {
            Ok(0) => {
                return Err(ProcessError::EndOfFile(
                    "unexpected EOF reading a line".to_string(),
                ))
            }
            Ok(_) if byte[0] == b'\n' => break,
            Ok(_) => line.push(byte[0]),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(ProcessError::syscall("reading a line", e)),
        }
    }
    String::from_utf8(line)
        .map_err(|e| ProcessError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

/// Write `s` followed by a newline
pub fn write_line(fd: RawFd, s: &str, interrupts: Option<&InterruptContext>) -> Result<()> {
    let mut data = Vec::with_capacity(s.len() + 1);
    data.extend_from_slice(s.as_bytes());
    data.push(b'\n');
    write_full(fd, &data, interrupts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_nonblocking(fd: RawFd) {
        let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL).unwrap());
        fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).unwrap();
    }

    #[test]
    fn test_none_is_invalid() {
        let fd = ScopedFd::none();
        assert!(!fd.is_valid());
        assert_eq!(fd.get(), -1);
        assert!(ScopedFd::default().into_owned().is_none());
    }

    #[test]
    fn test_drop_closes_write_side() {
        let mut pipe = Pipe::create().unwrap();
        drop(std::mem::take(&mut pipe.write_side));

        // Every writer is gone, so the reader sees end-of-file.
        let mut buf = [0u8; 1];
        assert_eq!(nix::unistd::read(pipe.read_side.get(), &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_release_keeps_descriptor_open() {
        let mut pipe = Pipe::create().unwrap();
        let raw = pipe.write_side.release();
        assert!(!pipe.write_side.is_valid());
        drop(pipe.write_side);

        set_nonblocking(pipe.read_side.get());
        let mut buf = [0u8; 1];
        assert_eq!(
            nix::unistd::read(pipe.read_side.get(), &mut buf),
            Err(Errno::EAGAIN)
        );

        let mut owner = ScopedFd::from_raw(raw);
        owner.close().unwrap();
        assert_eq!(nix::unistd::read(pipe.read_side.get(), &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_reset_closes_previous_descriptor() {
        let first = Pipe::create().unwrap();
        let second = Pipe::create().unwrap();
        let Pipe {
            read_side: first_read,
            write_side: mut holder,
        } = first;
        let Pipe {
            read_side: _second_read,
            write_side: mut second_write,
        } = second;

        holder.reset(second_write.release());

        let mut buf = [0u8; 1];
        assert_eq!(nix::unistd::read(first_read.get(), &mut buf).unwrap(), 0);
        drop(holder);
    }

    #[test]
    fn test_explicit_close_is_idempotent() {
        let mut pipe = Pipe::create().unwrap();
        pipe.close().unwrap();
        pipe.close().unwrap();
        assert!(!pipe.read_side.is_valid());
    }

    #[test]
    fn test_pipe_ends_are_close_on_exec() {
        let pipe = Pipe::create().unwrap();
        for fd in [pipe.read_side.get(), pipe.write_side.get()] {
            let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD).unwrap());
            assert!(flags.contains(FdFlag::FD_CLOEXEC));
        }
    }

    #[test]
    fn test_close_on_exec_sets_flag() {
        let (read, _write) = nix::unistd::pipe().unwrap();
        close_on_exec(read.as_raw_fd()).unwrap();
        let flags = FdFlag::from_bits_truncate(fcntl(read.as_raw_fd(), FcntlArg::F_GETFD).unwrap());
        assert!(flags.contains(FdFlag::FD_CLOEXEC));
    }

    #[test]
    fn test_read_full_and_write_full() {
        let pipe = Pipe::create().unwrap();
        write_full(pipe.write_side.get(), b"hello world", None).unwrap();

        let mut buf = [0u8; 5];
        read_full(pipe.read_side.get(), &mut buf, None).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_read_full_reports_end_of_file() {
        let mut pipe = Pipe::create().unwrap();
        write_full(pipe.write_side.get(), b"abc", None).unwrap();
        pipe.write_side.close().unwrap();

        let mut buf = [0u8; 8];
        let err = read_full(pipe.read_side.get(), &mut buf, None).unwrap_err();
        assert!(matches!(err, ProcessError::EndOfFile(_)));
    }

    #[test]
    fn test_drain_fd_reads_until_eof() {
        let mut pipe = Pipe::create().unwrap();
        write_full(pipe.write_side.get(), b"drained", None).unwrap();
        pipe.write_side.close().unwrap();

        let data = drain_fd(pipe.read_side.get(), true, None).unwrap();
        assert_eq!(data, b"drained");
    }

    #[test]
    fn test_drain_fd_nonblocking_stops_without_eof() {
        let pipe = Pipe::create().unwrap();
        write_full(pipe.write_side.get(), b"partial", None).unwrap();

        let data = drain_fd(pipe.read_side.get(), false, None).unwrap();
        assert_eq!(data, b"partial");

        let flags = OFlag::from_bits_truncate(fcntl(pipe.read_side.get(), FcntlArg::F_GETFL).unwrap());
        assert!(!flags.contains(OFlag::O_NONBLOCK));
    }

    #[test]
    fn test_read_line_and_write_line() {
        let mut pipe = Pipe::create().unwrap();
        write_line(pipe.write_side.get(), "first", None).unwrap();
        write_full(pipe.write_side.get(), b"tail", None).unwrap();
        pipe.write_side.close().unwrap();

        assert_eq!(read_line(pipe.read_side.get(), None).unwrap(), "first");
        assert!(matches!(
            read_line(pipe.read_side.get(), None),
            Err(ProcessError::EndOfFile(_))
        ));
    }

    #[test]
    fn test_blocked_read_notices_trigger_without_wakeup() {
        let ctx = InterruptContext::new();
        let pipe = Pipe::create().unwrap();
        let trigger = ctx.clone();

        // No ReceiveInterrupts: only the flag tells the reader to stop.
        let setter = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            trigger.trigger();
        });
        let mut buf = [0u8; 1];
        let err = read_full(pipe.read_side.get(), &mut buf, Some(&ctx)).unwrap_err();
        assert!(err.is_interrupted());
        setter.join().unwrap();
    }

    #[test]
    fn test_interrupted_context_stops_io() {
        let ctx = InterruptContext::new();
        ctx.trigger();
        let pipe = Pipe::create().unwrap();
        let err = write_full(pipe.write_side.get(), b"x", Some(&ctx)).unwrap_err();
        assert!(err.is_interrupted());
    }
}
