//! Temporary directories and files, and paths deleted on drop

use crate::errors::{ProcessError, Result};
use crate::resources::dir::read_directory;
use crate::resources::fd::{close_on_exec, ScopedFd};
use crate::utils::temp_root;
use log::{debug, warn};
use std::fs;
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static GLOBAL_TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// How a temporary directory is named and created
#[derive(Debug, Clone)]
pub struct TempDirOptions {
    /// Parent directory; `$TMPDIR` or `/tmp` when unset
    pub root: Option<PathBuf>,
    /// Leading name component
    pub prefix: String,
    /// Put the process id in the name
    pub include_pid: bool,
    /// Share the counter with every other caller in the process
    pub use_global_counter: bool,
    /// Permission bits of the new directory
    pub mode: u32,
}

impl Default for TempDirOptions {
    fn default() -> Self {
        Self {
            root: None,
            prefix: "procwarden".to_string(),
            include_pid: true,
            use_global_counter: true,
            mode: 0o755,
        }
    }
}

impl TempDirOptions {
    pub fn in_root(root: impl AsRef<Path>, prefix: &str) -> Self {
        Self {
            root: Some(root.as_ref().to_path_buf()),
            prefix: prefix.to_string(),
            ..Default::default()
        }
    }
}

fn temp_name(root: &Path, options: &TempDirOptions, counter: &AtomicU64) -> PathBuf {
    let n = counter.fetch_add(1, Ordering::SeqCst);
    if options.include_pid {
        root.join(format!("{}-{}-{}", options.prefix, std::process::id(), n))
    } else {
        root.join(format!("{}-{}", options.prefix, n))
    }
}

/// Create a uniquely named directory.
///
/// Names come from an atomic counter and `mkdir` is the arbiter, so callers
/// racing in the same parent never receive the same directory.
pub fn create_temp_dir(options: &TempDirOptions) -> Result<PathBuf> {
    let root = options.root.clone().unwrap_or_else(temp_root);
    let local_counter = AtomicU64::new(0);
    let counter = if options.use_global_counter {
        &GLOBAL_TEMP_COUNTER
    } else {
        &local_counter
    };

    loop {
        let candidate = temp_name(&root, options, counter);
        match fs::DirBuilder::new().mode(options.mode).create(&candidate) {
            Ok(()) => {
                debug!("created temporary directory {}", candidate.display());
                return Ok(candidate);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(ProcessError::Io(io::Error::new(
                    e.kind(),
                    format!("creating directory '{}': {}", candidate.display(), e),
                )))
            }
        }
    }
}

/// Create a temporary file, returning an open descriptor and its path
pub fn create_temp_file(prefix: &str) -> Result<(ScopedFd, PathBuf)> {
    let template = temp_root().join(format!("{}.XXXXXX", prefix));
    let (fd, path) = nix::unistd::mkstemp(&template)
        .map_err(|e| ProcessError::creation(&format!("creating temporary file '{}'", template.display()), e))?;
    let fd = ScopedFd::from_raw(fd);
    close_on_exec(fd.get())?;
    Ok((fd, path))
}

/// Space released by a deletion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteStats {
    pub bytes_freed: u64,
    pub blocks_freed: u64,
}

/// Delete a path recursively; a missing path is not an error
pub fn delete_path(path: impl AsRef<Path>) -> Result<()> {
    delete_path_counting(path).map(|_| ())
}

/// Delete a path recursively and report the space freed
pub fn delete_path_counting(path: impl AsRef<Path>) -> Result<DeleteStats> {
    let mut stats = DeleteStats::default();
    delete_inner(path.as_ref(), &mut stats)?;
    Ok(stats)
}

fn delete_inner(path: &Path, stats: &mut DeleteStats) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    if !meta.is_dir() && meta.nlink() == 1 {
        stats.bytes_freed += meta.size();
        stats.blocks_freed += meta.blocks();
    }

    let result = if meta.is_dir() {
        // Entries of a read-only directory cannot be unlinked.
        if meta.mode() & 0o700 != 0o700 {
            let mut perms = meta.permissions();
            perms.set_mode(meta.mode() | 0o700);
            fs::set_permissions(path, perms)?;
        }
        for entry in read_directory(path)? {
            delete_inner(&path.join(&entry.name), stats)?;
        }
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ProcessError::Io(io::Error::new(
            e.kind(),
            format!("cannot unlink '{}': {}", path.display(), e),
        ))),
    }
}

/// A path deleted when the owner goes out of scope, unless cancelled
#[derive(Debug, Default)]
pub struct AutoDelete {
    path: PathBuf,
    armed: bool,
    recursive: bool,
}

impl AutoDelete {
    pub fn new(path: impl Into<PathBuf>, recursive: bool) -> Self {
        Self {
            path: path.into(),
            armed: true,
            recursive,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the path on drop
    pub fn cancel(&mut self) {
        self.armed = false;
    }

    /// Point at a new path; the old one is deleted first unless cancelled
    pub fn reset(&mut self, path: impl Into<PathBuf>, recursive: bool) {
        self.delete_quietly();
        self.path = path.into();
        self.recursive = recursive;
        self.armed = true;
    }

    /// Delete now and report the space freed
    pub fn delete(mut self) -> Result<DeleteStats> {
        self.armed = false;
        if self.recursive {
            delete_path_counting(&self.path)
        } else {
            let meta = match fs::symlink_metadata(&self.path) {
                Ok(meta) => meta,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(DeleteStats::default()),
                Err(e) => return Err(e.into()),
            };
            if meta.is_dir() {
                fs::remove_dir(&self.path)?;
                Ok(DeleteStats::default())
            } else {
                fs::remove_file(&self.path)?;
                Ok(DeleteStats {
                    bytes_freed: meta.size(),
                    blocks_freed: meta.blocks(),
                })
            }
        }
    }

    fn delete_quietly(&mut self) {
        if !self.armed {
            return;
        }
        let target = AutoDelete {
            path: std::mem::take(&mut self.path),
            armed: true,
            recursive: self.recursive,
        };
        self.armed = false;
        let shown = target.path.display().to_string();
        if let Err(e) = target.delete() {
            warn!("deleting '{}': {}", shown, e);
        }
    }
}

impl Drop for AutoDelete {
    fn drop(&mut self) {
        self.delete_quietly();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_temp_dir_names_are_unique() {
        let tmp = tempdir().unwrap();
        let options = TempDirOptions::in_root(tmp.path(), "build");

        let a = create_temp_dir(&options).unwrap();
        let b = create_temp_dir(&options).unwrap();
        assert_ne!(a, b);
        assert!(a.is_dir() && b.is_dir());

        let name = a.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(&format!("build-{}-", std::process::id())));
    }

    #[test]
    fn test_create_temp_dir_skips_existing_names() {
        let tmp = tempdir().unwrap();
        let options = TempDirOptions {
            root: Some(tmp.path().to_path_buf()),
            prefix: "x".to_string(),
            include_pid: false,
            use_global_counter: false,
            mode: 0o700,
        };
        fs::create_dir(tmp.path().join("x-0")).unwrap();
        fs::create_dir(tmp.path().join("x-1")).unwrap();

        let created = create_temp_dir(&options).unwrap();
        assert_eq!(created, tmp.path().join("x-2"));
        let mode = fs::metadata(&created).unwrap().mode() & 0o777;
        assert_eq!(mode, 0o700);
    }

    #[test]
    fn test_create_temp_dir_missing_root_fails() {
        let options = TempDirOptions::in_root("/nonexistent/root/for/tests", "p");
        assert!(create_temp_dir(&options).is_err());
    }

    #[test]
    fn test_create_temp_file() {
        let (fd, path) = create_temp_file("procwarden-test").unwrap();
        assert!(fd.is_valid());
        assert!(path.exists());
        let _cleanup = AutoDelete::new(&path, false);
    }

    #[test]
    fn test_delete_path_counts_regular_files() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("tree");
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("a/b/file"), vec![0u8; 4096]).unwrap();
        fs::write(root.join("top"), b"12345").unwrap();
        std::os::unix::fs::symlink("top", root.join("link")).unwrap();

        let stats = delete_path_counting(&root).unwrap();
        assert!(!root.exists());
        assert!(stats.bytes_freed >= 4096 + 5);
    }

    #[test]
    fn test_delete_path_missing_is_ok() {
        delete_path("/nonexistent/path/that/should/not/exist").unwrap();
    }

    #[test]
    fn test_delete_path_read_only_directory() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("ro");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("f"), b"x").unwrap();
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o500)).unwrap();

        delete_path(&dir).unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn test_auto_delete_removes_on_drop() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("scratch");
        fs::create_dir_all(dir.join("nested")).unwrap();
        {
            let _guard = AutoDelete::new(&dir, true);
        }
        assert!(!dir.exists());
    }

    #[test]
    fn test_auto_delete_cancel_keeps_path() {
        let tmp = tempdir().unwrap();
        let file = tmp.path().join("keep");
        fs::write(&file, b"x").unwrap();
        {
            let mut guard = AutoDelete::new(&file, false);
            guard.cancel();
        }
        assert!(file.exists());
    }

    #[test]
    fn test_auto_delete_reset_releases_old_path() {
        let tmp = tempdir().unwrap();
        let first = tmp.path().join("first");
        let second = tmp.path().join("second");
        fs::write(&first, b"1").unwrap();
        fs::write(&second, b"2").unwrap();

        let mut guard = AutoDelete::new(&first, false);
        guard.reset(&second, false);
        assert!(!first.exists());
        assert_eq!(guard.path(), second.as_path());

        guard.cancel();
        guard.reset(&first, false);
        assert!(second.exists());
    }

    #[test]
    fn test_auto_delete_reports_freed_bytes() {
        let tmp = tempdir().unwrap();
        let file = tmp.path().join("data");
        fs::write(&file, vec![1u8; 1000]).unwrap();

        let stats = AutoDelete::new(&file, false).delete().unwrap();
        assert_eq!(stats.bytes_freed, 1000);
        assert!(!file.exists());
    }
}
