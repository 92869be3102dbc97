//! Symlink and directory creation helpers

use crate::errors::{ProcessError, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Create a symlink at `link` pointing to `target`
pub fn create_symlink(target: impl AsRef<Path>, link: impl AsRef<Path>) -> Result<()> {
    let (target, link) = (target.as_ref(), link.as_ref());
    std::os::unix::fs::symlink(target, link).map_err(|e| {
        ProcessError::Io(io::Error::new(
            e.kind(),
            format!(
                "creating symlink from '{}' to '{}': {}",
                link.display(),
                target.display(),
                e
            ),
        ))
    })
}

/// Atomically create or replace a symlink.
///
/// The new link is created under a temporary name in the same directory and
/// renamed over `link`, so readers observe either the old or the new target.
pub fn replace_symlink(target: impl AsRef<Path>, link: impl AsRef<Path>) -> Result<()> {
    let (target, link) = (target.as_ref(), link.as_ref());
    let dir = link.parent().unwrap_or_else(|| Path::new("."));
    let base = link
        .file_name()
        .ok_or_else(|| {
            ProcessError::InvalidConfig(format!("'{}' has no file name", link.display()))
        })?
        .to_string_lossy()
        .into_owned();

    let mut n = 0u64;
    loop {
        let tmp = dir.join(format!(".{}_{}", n, base));
        n += 1;
        match std::os::unix::fs::symlink(target, &tmp) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = fs::rename(&tmp, link) {
            let _ = fs::remove_file(&tmp);
            return Err(ProcessError::Io(io::Error::new(
                e.kind(),
                format!("renaming '{}' to '{}': {}", tmp.display(), link.display(), e),
            )));
        }
        return Ok(());
    }
}

/// Create a directory and any missing parents; returns the directories
/// created, parents first
pub fn create_dirs(path: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let path = path.as_ref();
    let mut created = Vec::new();
    if path.as_os_str().is_empty() || path == Path::new("/") {
        return Ok(created);
    }

    match fs::symlink_metadata(path) {
        Ok(meta) => {
            // Follow a symlink to see whether it names a directory.
            let is_dir = if meta.file_type().is_symlink() {
                fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false)
            } else {
                meta.is_dir()
            };
            if !is_dir {
                return Err(ProcessError::Io(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("'{}' is not a directory", path.display()),
                )));
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                created.extend(create_dirs(parent)?);
            }
            match fs::create_dir(path) {
                Ok(()) => created.push(path.to_path_buf()),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => {
                    return Err(ProcessError::Io(io::Error::new(
                        e.kind(),
                        format!("creating directory '{}': {}", path.display(), e),
                    )))
                }
            }
        }
        Err(e) => return Err(e.into()),
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_symlink() {
        let tmp = tempdir().unwrap();
        let link = tmp.path().join("link");
        create_symlink("/bin", &link).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("/bin"));

        assert!(create_symlink("/usr", &link).is_err());
    }

    #[test]
    fn test_replace_symlink_swaps_target() {
        let tmp = tempdir().unwrap();
        let link = tmp.path().join("current");
        create_symlink("gen-1", &link).unwrap();

        replace_symlink("gen-2", &link).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("gen-2"));

        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_replace_symlink_creates_when_missing() {
        let tmp = tempdir().unwrap();
        let link = tmp.path().join("fresh");
        replace_symlink("target", &link).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("target"));
    }

    #[test]
    fn test_create_dirs_reports_created_in_order() {
        let tmp = tempdir().unwrap();
        let deep = tmp.path().join("a/b/c");

        let created = create_dirs(&deep).unwrap();
        assert_eq!(
            created,
            vec![
                tmp.path().join("a"),
                tmp.path().join("a/b"),
                tmp.path().join("a/b/c")
            ]
        );
        assert!(create_dirs(&deep).unwrap().is_empty());
    }

    #[test]
    fn test_create_dirs_rejects_file() {
        let tmp = tempdir().unwrap();
        let file = tmp.path().join("file");
        fs::write(&file, b"x").unwrap();
        assert!(create_dirs(&file).is_err());
    }
}
