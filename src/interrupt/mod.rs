//! Interrupt layer: one-shot cancellation shared by every worker thread
//!
//! An [`InterruptContext`] is created once per process and handed to every
//! component that blocks. It holds a flag that is set once and never
//! cleared, and an ordered registry of callbacks run whenever an interrupt
//! is triggered.
//!
//! # Features
//!
//! - **Signal listener**: one thread receives SIGINT/SIGTERM/SIGHUP via `sigwait`
//! - **Callbacks**: run outside signal context, in registration order
//! - **Thread wake-up**: [`ReceiveInterrupts`] makes a thread's blocking syscalls return EINTR
//! - **Checkpoints**: [`InterruptContext::check`] raises `Interrupted`
//!
//! # Examples
//!
//! ```ignore
//! use procwarden::interrupt::{InterruptContext, ReceiveInterrupts};
//!
//! let interrupts = InterruptContext::new();
//! interrupts.start_signal_listener()?;
//! let _wake = ReceiveInterrupts::new(&interrupts)?;
//! interrupts.check()?;
//! ```

pub mod listener;
pub mod receive;

pub use receive::ReceiveInterrupts;

use crate::errors::{ProcessError, Result};
use log::{debug, warn};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

type Callback = Arc<dyn Fn() + Send + Sync>;

struct Registry {
    next_token: u64,
    callbacks: BTreeMap<u64, Callback>,
}

struct Shared {
    interrupted: AtomicBool,
    registry: Mutex<Registry>,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

thread_local! {
    static THREAD_CHECK: RefCell<Option<Box<dyn Fn() -> bool>>> = const { RefCell::new(None) };
}

/// Process-wide cancellation state, cheap to clone and share between threads
#[derive(Clone)]
pub struct InterruptContext {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for InterruptContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptContext")
            .field("interrupted", &self.shared.interrupted.load(Ordering::SeqCst))
            .finish()
    }
}

impl Default for InterruptContext {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptContext {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                interrupted: AtomicBool::new(false),
                registry: Mutex::new(Registry {
                    next_token: 0,
                    callbacks: BTreeMap::new(),
                }),
            }),
        }
    }

    /// Whether the process flag is set or this thread's check asks to stop
    pub fn is_interrupted(&self) -> bool {
        if self.shared.interrupted.load(Ordering::SeqCst) {
            return true;
        }
        THREAD_CHECK.with(|check| check.borrow().as_ref().is_some_and(|f| f()))
    }

    /// Checkpoint: fail with `Interrupted` once an interrupt was requested
    pub fn check(&self) -> Result<()> {
        if self.is_interrupted() {
            Err(ProcessError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Request an interrupt.
    ///
    /// The flag is set once and stays set. Callbacks run on every trigger so
    /// threads that started blocking after an earlier trigger are woken too.
    pub fn trigger(&self) {
        if !self.shared.interrupted.swap(true, Ordering::SeqCst) {
            debug!("interrupt requested");
        }

        let registry = self.shared.registry();
        for callback in registry.callbacks.values() {
            if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                warn!("interrupt callback panicked");
            }
        }
    }

    /// Register a callback run on every trigger.
    ///
    /// Callbacks run with the registry locked: they must be quick, must not
    /// block, and must not register or drop registrations themselves.
    pub fn register<F>(&self, callback: F) -> InterruptCallback
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut registry = self.shared.registry();
        let token = registry.next_token;
        registry.next_token += 1;
        registry.callbacks.insert(token, Arc::new(callback));
        InterruptCallback {
            shared: Arc::clone(&self.shared),
            token,
        }
    }

    /// Number of live registrations
    pub fn registered(&self) -> usize {
        self.shared.registry().callbacks.len()
    }

    /// Install a per-thread predicate consulted by `check` in addition to
    /// the process flag. The previous predicate returns when the guard drops.
    pub fn set_thread_check(check: Option<Box<dyn Fn() -> bool>>) -> ThreadCheckGuard {
        let previous = THREAD_CHECK.with(|slot| slot.replace(check));
        ThreadCheckGuard {
            previous: Some(previous),
        }
    }

    /// Start the signal listener thread; see [`listener::start`]
    pub fn start_signal_listener(&self) -> Result<()> {
        listener::start(self)
    }

    pub(crate) fn same_as(&self, other: &InterruptContext) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

/// A registered interrupt callback; dropping it unregisters.
///
/// Dropping waits for an in-progress trigger pass to finish, so the callback
/// never runs after the drop returns.
pub struct InterruptCallback {
    shared: Arc<Shared>,
    token: u64,
}

impl Drop for InterruptCallback {
    fn drop(&mut self) {
        self.shared.registry().callbacks.remove(&self.token);
    }
}

/// Restores the previous thread check when dropped
pub struct ThreadCheckGuard {
    previous: Option<Option<Box<dyn Fn() -> bool>>>,
}

impl Drop for ThreadCheckGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            THREAD_CHECK.with(|slot| *slot.borrow_mut() = previous);
        }
    }
}
