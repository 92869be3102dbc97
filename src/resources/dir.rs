//! Owned directory streams

use crate::errors::{ProcessError, Result};
use nix::dir::{Dir, Type};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use std::ffi::OsString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub ino: u64,
    pub file_type: Option<Type>,
}

/// An open directory stream, closed when dropped
#[derive(Debug)]
pub struct ScopedDir {
    dir: Dir,
    path: PathBuf,
}

impl ScopedDir {
    /// Open a directory for reading
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let dir = Dir::open(
            path,
            OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(|e| {
            if e == nix::errno::Errno::ENOENT {
                ProcessError::Io(std::io::Error::from(e))
            } else {
                ProcessError::creation(&format!("opening directory '{}'", path.display()), e)
            }
        })?;
        Ok(Self {
            dir,
            path: path.to_path_buf(),
        })
    }

    /// Path the stream was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every entry except `.` and `..`
    pub fn entries(&mut self) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in self.dir.iter() {
            let entry = entry.map_err(|e| {
                ProcessError::syscall(&format!("reading directory '{}'", self.path.display()), e)
            })?;
            let name = entry.file_name().to_bytes();
            if name == b"." || name == b".." {
                continue;
            }
            entries.push(DirEntry {
                name: std::ffi::OsStr::from_bytes(name).to_os_string(),
                ino: entry.ino(),
                file_type: entry.file_type(),
            });
        }
        Ok(entries)
    }
}

impl AsRawFd for ScopedDir {
    fn as_raw_fd(&self) -> RawFd {
        self.dir.as_raw_fd()
    }
}

/// List a directory
pub fn read_directory(path: impl AsRef<Path>) -> Result<Vec<DirEntry>> {
    ScopedDir::open(path)?.entries()
}
