//! Integration tests for procwarden
//!
//! These tests exercise the public API end to end: handles, temporary
//! paths, the program runner and interrupts working together.

use procwarden::errors::ProcessError;
use procwarden::execution::{spawn, ProcessOptions, ProgramRunner, RunOptions};
use procwarden::interrupt::InterruptContext;
use procwarden::isolation::{restore_mount_namespace, save_mount_namespace};
use procwarden::resources::{ChildProcess, Pipe, ScopedFd};
use procwarden::storage::{
    create_temp_dir, delete_path_counting, replace_symlink, AutoDelete, TempDirOptions,
};
use procwarden::RunConfig;
use std::sync::Mutex;
use std::time::Duration;

// Tests that fork share this lock.
static INTEGRATION_TEST_LOCK: Mutex<()> = Mutex::new(());

fn runner() -> ProgramRunner {
    ProgramRunner::new(InterruptContext::new())
}

#[test]
fn test_scoped_fd_closes_exactly_once() {
    let _lock = INTEGRATION_TEST_LOCK.lock();
    let mut pipe = Pipe::create().unwrap();
    let raw = pipe.read_side.release();
    assert!(!pipe.read_side.is_valid());

    // After release the handle no longer closes the descriptor.
    drop(pipe);
    assert!(nix::fcntl::fcntl(raw, nix::fcntl::FcntlArg::F_GETFD).is_ok());

    let mut owner = ScopedFd::from_raw(raw);
    owner.close().unwrap();
    assert!(!owner.is_valid());
    // A second close on the emptied handle is a no-op.
    owner.close().unwrap();
}

#[test]
fn test_run_echo() {
    let _lock = INTEGRATION_TEST_LOCK.lock();
    let result = runner()
        .run(&RunOptions::new("echo").args(["hello", "procwarden"]))
        .unwrap();
    assert_eq!(result.stdout, b"hello procwarden\n");
    assert_eq!(result.code(), Some(0));
}

#[test]
fn test_exit_codes() {
    let _lock = INTEGRATION_TEST_LOCK.lock();
    for code in [0, 1, 2, 42, 255] {
        let options = RunOptions::new("sh")
            .args(["-c", &format!("exit {}", code)])
            .check_status(false);
        let result = runner().run(&options).unwrap();
        assert_eq!(result.code(), Some(code));
    }
}

#[test]
fn test_run_from_json_description() {
    let _lock = INTEGRATION_TEST_LOCK.lock();
    let config = RunConfig::from_json(
        r#"{"program": "sh", "args": ["-c", "cat; echo \" $MODE\""], "input": "abc", "env": {"MODE": "json"}}"#,
    )
    .unwrap();
    let result = runner().run(&config.to_run_options().unwrap()).unwrap();
    assert_eq!(result.stdout_lossy(), "abc json\n");
}

#[test]
fn test_run_writes_into_temp_dir() {
    let _lock = INTEGRATION_TEST_LOCK.lock();
    let root = tempfile::tempdir().unwrap();
    let dir = create_temp_dir(&TempDirOptions::in_root(root.path(), "work")).unwrap();
    let guard = AutoDelete::new(&dir, true);

    runner()
        .run(&RunOptions::new("sh").args(["-c", "printf 12345 > out"]).chdir(&dir))
        .unwrap();
    assert_eq!(std::fs::read(dir.join("out")).unwrap(), b"12345");

    let stats = guard.delete().unwrap();
    assert_eq!(stats.bytes_freed, 5);
    assert!(!dir.exists());
}

#[test]
fn test_replace_symlink_while_reading() {
    let root = tempfile::tempdir().unwrap();
    let link = root.path().join("current");
    std::fs::write(root.path().join("a"), b"a").unwrap();
    std::fs::write(root.path().join("b"), b"b").unwrap();

    for i in 0..20 {
        let target = if i % 2 == 0 { "a" } else { "b" };
        replace_symlink(target, &link).unwrap();
        assert_eq!(std::fs::read(&link).unwrap(), target.as_bytes());
    }
}

#[test]
fn test_delete_path_counting_missing_path() {
    let stats = delete_path_counting("/nonexistent/procwarden/path").unwrap();
    assert_eq!(stats.bytes_freed, 0);
}

#[test]
fn test_spawned_child_killed_on_drop() {
    let _lock = INTEGRATION_TEST_LOCK.lock();
    let child = unsafe {
        spawn(
            || loop {
                libc::pause();
            },
            &ProcessOptions::default(),
        )
    }
    .unwrap();
    let pid = child.pid().unwrap();
    drop(child);

    // Reaped by the drop, so the pid is no longer our child.
    assert_eq!(
        nix::sys::wait::waitpid(pid, None).unwrap_err(),
        nix::errno::Errno::ECHILD
    );
}

#[test]
fn test_child_kill_reports_signal() {
    let _lock = INTEGRATION_TEST_LOCK.lock();
    let mut child: ChildProcess = unsafe {
        spawn(
            || loop {
                libc::pause();
            },
            &ProcessOptions::default(),
        )
    }
    .unwrap();
    let status = child.kill().unwrap();
    use std::os::unix::process::ExitStatusExt;
    assert_eq!(status.signal(), Some(libc::SIGKILL));
    assert!(!child.is_owned());
}

#[test]
fn test_interrupt_stops_long_running_program() {
    let _lock = INTEGRATION_TEST_LOCK.lock();
    let ctx = InterruptContext::new();
    let trigger = ctx.clone();
    let interrupter = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        trigger.trigger();
    });

    let err = ProgramRunner::new(ctx.clone())
        .run(&RunOptions::new("sh").args(["-c", "while :; do sleep 1; done"]))
        .unwrap_err();
    interrupter.join().unwrap();
    assert!(matches!(err, ProcessError::Interrupted));
    assert_eq!(err.exit_code(), 130);
    assert!(ctx.is_interrupted());
}

#[test]
fn test_mount_namespace_restore_is_repeatable() {
    restore_mount_namespace().unwrap();
    save_mount_namespace().unwrap();
    for _ in 0..3 {
        restore_mount_namespace().unwrap();
    }
}
