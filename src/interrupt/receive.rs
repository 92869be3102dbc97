//! Per-thread interrupt delivery

use super::listener::{ensure_wakeup_handler, WAKEUP_SIGNAL};
use super::{InterruptCallback, InterruptContext};
use crate::errors::Result;
use nix::sys::pthread::{pthread_kill, pthread_self};
use std::marker::PhantomData;

/// While alive, an interrupt sends the wake-up signal to the thread that
/// created this guard so its blocking syscalls return EINTR.
///
/// The guard is tied to its thread and cannot be sent elsewhere.
pub struct ReceiveInterrupts {
    _callback: InterruptCallback,
    _thread_bound: PhantomData<*const ()>,
}

impl ReceiveInterrupts {
    pub fn new(interrupts: &InterruptContext) -> Result<Self> {
        ensure_wakeup_handler()?;
        let target = pthread_self();
        let callback = interrupts.register(move || {
            // The thread is alive: it deregisters before it can exit.
            let _ = pthread_kill(target, WAKEUP_SIGNAL);
        });
        Ok(Self {
            _callback: callback,
            _thread_bound: PhantomData,
        })
    }
}
