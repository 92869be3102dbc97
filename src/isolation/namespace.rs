//! Namespace identification and mount namespace save/restore

use crate::errors::{ProcessError, Result};
use log::{debug, warn};
use nix::fcntl::OFlag;
use nix::sched::{setns, CloneFlags};
use nix::sys::stat::Mode;
use nix::unistd::Pid;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::MetadataExt;
use std::sync::{Mutex, MutexGuard};

/// Inode of the calling thread's mount namespace.
///
/// Read from `/proc/thread-self`, since `/proc/self` names the main thread
/// and a worker may have moved into a namespace of its own.
pub fn mount_namespace_inode() -> Result<u64> {
    namespace_inode("/proc/thread-self/ns/mnt")
}

/// Inode of another process's mount namespace
pub fn mount_namespace_inode_of(pid: Pid) -> Result<u64> {
    namespace_inode(&format!("/proc/{}/ns/mnt", pid))
}

fn namespace_inode(path: &str) -> Result<u64> {
    let stat = std::fs::metadata(path).map_err(|e| {
        ProcessError::Namespace(format!("failed to get namespace info from {}: {}", path, e))
    })?;
    Ok(stat.ino())
}

struct Saved {
    fd: OwnedFd,
    inode: u64,
}

/// A mount namespace recorded once and re-entered on demand
pub struct MountNamespaceSnapshot {
    saved: Mutex<Option<Saved>>,
}

static GLOBAL_SNAPSHOT: MountNamespaceSnapshot = MountNamespaceSnapshot::new();

/// The process-wide snapshot used by [`save_mount_namespace`] and spawned children
pub fn global_snapshot() -> &'static MountNamespaceSnapshot {
    &GLOBAL_SNAPSHOT
}

impl Default for MountNamespaceSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl MountNamespaceSnapshot {
    pub const fn new() -> Self {
        Self {
            saved: Mutex::new(None),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Saved>> {
        self.saved.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Record the current mount namespace; later calls keep the first one
    pub fn save(&self) -> Result<()> {
        let mut slot = self.slot();
        if slot.is_some() {
            return Ok(());
        }

        let raw = nix::fcntl::open(
            "/proc/thread-self/ns/mnt",
            OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(|e| ProcessError::Namespace(format!("saving parent mount namespace: {}", e)))?;
        // SAFETY: `open` just returned this descriptor and nothing else owns it.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let inode = mount_namespace_inode()?;

        debug!("saved mount namespace {}", inode);
        *slot = Some(Saved { fd, inode });
        Ok(())
    }

    pub fn is_saved(&self) -> bool {
        self.slot().is_some()
    }

    /// Inode of the saved namespace
    pub fn inode(&self) -> Option<u64> {
        self.slot().as_ref().map(|saved| saved.inode)
    }

    /// Raw descriptor of the saved namespace, for use in a forked child.
    /// It stays open for the life of the snapshot.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.slot().as_ref().map(|saved| saved.fd.as_raw_fd())
    }

    /// Descriptor a child created by the calling thread has to `setns` into,
    /// or `None` when there is no snapshot or the thread is already inside it.
    pub fn fd_for_child(&self) -> Option<RawFd> {
        let slot = self.slot();
        let saved = slot.as_ref()?;
        match mount_namespace_inode() {
            Ok(current) if current == saved.inode => None,
            Ok(_) => Some(saved.fd.as_raw_fd()),
            Err(e) => {
                warn!("{}", e);
                Some(saved.fd.as_raw_fd())
            }
        }
    }

    /// Re-enter the saved namespace. Without a snapshot, or when already
    /// inside it, this does nothing.
    pub fn restore(&self) -> Result<()> {
        let slot = self.slot();
        let saved = match slot.as_ref() {
            Some(saved) => saved,
            None => return Ok(()),
        };

        match mount_namespace_inode() {
            Ok(current) if current == saved.inode => return Ok(()),
            Ok(_) => {}
            Err(e) => warn!("{}", e),
        }

        // Joining a mount namespace resets the working directory.
        let cwd = std::env::current_dir().ok();

        setns(&saved.fd, CloneFlags::CLONE_NEWNS).map_err(|e| {
            ProcessError::Namespace(format!("restoring parent mount namespace: {}", e))
        })?;
        debug!("restored mount namespace {}", saved.inode);

        if let Some(cwd) = cwd {
            std::env::set_current_dir(&cwd).map_err(|e| {
                ProcessError::Namespace(format!("restoring cwd '{}': {}", cwd.display(), e))
            })?;
        }
        Ok(())
    }
}

/// Save the process-wide mount namespace snapshot
pub fn save_mount_namespace() -> Result<()> {
    global_snapshot().save()
}

/// Restore the process-wide mount namespace snapshot
pub fn restore_mount_namespace() -> Result<()> {
    global_snapshot().restore()
}
