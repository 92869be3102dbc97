//! Signal listener thread and the secondary wake-up signal
//!
//! Termination signals are blocked on the thread that starts the listener
//! and therefore on every thread it spawns afterwards. The listener receives
//! them synchronously with `sigwait`, so no work ever runs in signal context.

use super::InterruptContext;
use crate::errors::{ProcessError, Result};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{
    pthread_sigmask, sigaction, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};
use std::sync::{Mutex, OnceLock};

/// Signals that request an interrupt
pub const TERMINATION_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP];

/// Signal used to kick individual threads out of blocking syscalls
pub const WAKEUP_SIGNAL: Signal = Signal::SIGUSR1;

static LISTENER_OWNER: Mutex<Option<InterruptContext>> = Mutex::new(None);
static WAKEUP_HANDLER: OnceLock<std::result::Result<(), Errno>> = OnceLock::new();

extern "C" fn wakeup_handler(_: libc::c_int) {}

/// Install a no-op handler for [`WAKEUP_SIGNAL`] without `SA_RESTART`, so a
/// thread receiving it sees EINTR from its blocking syscall.
pub(crate) fn ensure_wakeup_handler() -> Result<()> {
    let installed = WAKEUP_HANDLER.get_or_init(|| {
        let action = SigAction::new(
            SigHandler::Handler(wakeup_handler),
            SaFlags::empty(),
            SigSet::empty(),
        );
        // SAFETY: the handler is async-signal-safe (it does nothing).
        unsafe { sigaction(WAKEUP_SIGNAL, &action) }.map(|_| ())
    });
    installed.map_err(|e| ProcessError::syscall("installing wake-up signal handler", e))
}

fn termination_set() -> SigSet {
    let mut set = SigSet::empty();
    for signal in TERMINATION_SIGNALS {
        set.add(signal);
    }
    set
}

/// Start the signal listener for `ctx`.
///
/// Must be called before the process starts other threads, since only the
/// calling thread (and threads it creates later) get the signals blocked.
/// Calling it again with the same context is a no-op. Only one context per
/// process may own the listener.
pub fn start(ctx: &InterruptContext) -> Result<()> {
    let mut owner = LISTENER_OWNER
        .lock()
        .unwrap_or_else(|poison| poison.into_inner());

    if let Some(current) = owner.as_ref() {
        return if current.same_as(ctx) {
            Ok(())
        } else {
            Err(ProcessError::InvalidConfig(
                "a signal listener is already running for another interrupt context".to_string(),
            ))
        };
    }

    ensure_wakeup_handler()?;

    // waitpid needs default SIGCHLD disposition, whatever we inherited.
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    // SAFETY: restoring the default disposition installs no handler.
    unsafe { sigaction(Signal::SIGCHLD, &default) }
        .map_err(|e| ProcessError::syscall("resetting SIGCHLD", e))?;

    let set = termination_set();
    pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), None)
        .map_err(|e| ProcessError::syscall("blocking termination signals", e))?;

    let listener_ctx = ctx.clone();
    std::thread::Builder::new()
        .name("signal-listener".to_string())
        .spawn(move || listen(set, listener_ctx))
        .map_err(|e| {
            ProcessError::Io(std::io::Error::new(
                e.kind(),
                format!("starting signal listener: {}", e),
            ))
        })?;

    debug!("signal listener started");
    *owner = Some(ctx.clone());
    Ok(())
}

fn listen(set: SigSet, ctx: InterruptContext) {
    loop {
        match set.wait() {
            Ok(signal) => {
                info!("received {}, interrupting", signal);
                ctx.trigger();
            }
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!("signal listener stopped: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_termination_set_contents() {
        let set = termination_set();
        for signal in TERMINATION_SIGNALS {
            assert!(set.contains(signal));
        }
        assert!(!set.contains(WAKEUP_SIGNAL));
    }

    #[test]
    fn test_wakeup_handler_is_idempotent() {
        ensure_wakeup_handler().unwrap();
        ensure_wakeup_handler().unwrap();

        // Delivering the signal to ourselves must not terminate the process.
        let me = nix::sys::pthread::pthread_self();
        nix::sys::pthread::pthread_kill(me, WAKEUP_SIGNAL).unwrap();
    }
}
