//! Utility functions: sizes, exit statuses and per-user directories

use crate::errors::{ProcessError, Result};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;

/// Default search path when `PATH` is unset
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Get current effective UID
pub fn get_uid() -> u32 {
    nix::unistd::geteuid().as_raw()
}

/// Get current effective GID
pub fn get_gid() -> u32 {
    nix::unistd::getegid().as_raw()
}

/// Check if running as root
pub fn is_root() -> bool {
    get_uid() == 0
}

/// Parse a size with an optional binary unit suffix (e.g., "100M", "1g", "512KB")
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim().to_uppercase();
    let digits = s.strip_suffix('B').unwrap_or(&s);

    let (num_str, multiplier) = match digits.chars().last() {
        Some('K') => (&digits[..digits.len() - 1], 1u64 << 10),
        Some('M') => (&digits[..digits.len() - 1], 1u64 << 20),
        Some('G') => (&digits[..digits.len() - 1], 1u64 << 30),
        Some('T') => (&digits[..digits.len() - 1], 1u64 << 40),
        _ => (digits, 1u64),
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| ProcessError::InvalidConfig(format!("Invalid size: {}", s)))?;

    num.checked_mul(multiplier)
        .ok_or_else(|| ProcessError::InvalidConfig(format!("Size overflow: {}", s)))
}

/// Render a byte count in MiB with two decimals
pub fn show_bytes(bytes: u64) -> String {
    format!("{:.2} MiB", bytes as f64 / (1024.0 * 1024.0))
}

/// Describe a wait status the way error messages report it
pub fn describe_status(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        format!("exited with status {}", code)
    } else if let Some(signal) = status.signal() {
        let name = nix::sys::signal::Signal::try_from(signal)
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        format!("killed by signal {} ({})", signal, name)
    } else {
        "died abnormally".to_string()
    }
}

/// Whether a wait status denotes a clean exit
pub fn status_ok(status: &ExitStatus) -> bool {
    status.code() == Some(0)
}

/// Return `$HOME`, falling back to the passwd entry of the effective user
pub fn home_dir() -> Result<PathBuf> {
    if let Some(home) = std::env::var_os("HOME").filter(|h| !h.is_empty()) {
        return Ok(PathBuf::from(home));
    }

    let uid = nix::unistd::geteuid();
    match nix::unistd::User::from_uid(uid) {
        Ok(Some(user)) => Ok(user.dir),
        Ok(None) => Err(ProcessError::InvalidConfig(format!(
            "no passwd entry for uid {}",
            uid
        ))),
        Err(e) => Err(ProcessError::syscall("getpwuid", e)),
    }
}

fn xdg_dir(var: &str, home_suffix: &str) -> Result<PathBuf> {
    match std::env::var_os(var).filter(|v| !v.is_empty()) {
        Some(dir) => Ok(PathBuf::from(dir)),
        None => Ok(home_dir()?.join(home_suffix)),
    }
}

/// Return `$XDG_CACHE_HOME` or `$HOME/.cache`
pub fn cache_dir() -> Result<PathBuf> {
    xdg_dir("XDG_CACHE_HOME", ".cache")
}

/// Return `$XDG_CONFIG_HOME` or `$HOME/.config`
pub fn config_dir() -> Result<PathBuf> {
    xdg_dir("XDG_CONFIG_HOME", ".config")
}

/// Return `$XDG_DATA_HOME` or `$HOME/.local/share`
pub fn data_dir() -> Result<PathBuf> {
    xdg_dir("XDG_DATA_HOME", ".local/share")
}

/// Directories searched for user configuration, most specific first
pub fn config_dirs() -> Result<Vec<PathBuf>> {
    let mut dirs = vec![config_dir()?];
    let system = std::env::var("XDG_CONFIG_DIRS").unwrap_or_else(|_| "/etc/xdg".to_string());
    dirs.extend(
        system
            .split(':')
            .filter(|entry| !entry.is_empty())
            .map(PathBuf::from),
    );
    Ok(dirs)
}

/// Return the executable search path (`$PATH` or the default)
pub fn search_path() -> String {
    std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string())
}

/// Return `$TMPDIR` or `/tmp`
pub fn temp_root() -> PathBuf {
    std::env::var_os("TMPDIR")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}
