//! Platform readiness adapter contract
//!
//! The scheduler core never talks to the operating system directly. It
//! calls through [`PollAdapter`], which wraps the platform readiness
//! primitive (epoll/kqueue via mio on unix), the cross-thread wakeup and
//! the process-signal trampoline. A synthetic adapter can be swapped in
//! for tests through [`Scheduler::with_adapter`](crate::scheduler::Scheduler::with_adapter).

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::scheduler::Scheduler;
use crate::task::{EventMask, TaskCallback, TaskContext};

#[cfg(unix)]
mod platform;
#[cfg(unix)]
mod signals;

#[cfg(unix)]
pub use platform::MioPoller;

/// Outcome of one blocking poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollWait {
    /// `n` file handles were reported ready
    Ready(usize),
    /// The wait bound elapsed without readiness
    TimedOut,
    /// The wait was interrupted; the loop continues without error
    Interrupted,
    /// The poller has shut down; the loop exits
    Stopped,
}

/// A single readiness report from the poller
#[derive(Debug, Clone, Copy)]
pub struct PollEvent {
    /// File-handle key the report is for
    pub fd: u32,
    /// Delivered readiness bits
    pub revents: EventMask,
}

/// The contract the scheduler core requires from a platform adapter.
///
/// `arm`, `disarm` and `wake` must be callable from any thread, including
/// while the dispatch thread is blocked inside [`PollAdapter::poll`].
/// `poll` itself is only ever entered by the dispatch thread.
pub trait PollAdapter: Send + Sync {
    /// Register or re-register interest for a file handle. An empty mask
    /// disables delivery without forgetting the handle.
    fn arm(&self, fd: u32, mask: EventMask) -> Result<()>;

    /// Drop the handle from the readiness set entirely
    fn disarm(&self, fd: u32) -> Result<()>;

    /// Block up to `timeout` (`None` blocks until readiness or wakeup) and
    /// append one [`PollEvent`] per ready handle to `ready`.
    fn poll(&self, timeout: Option<Duration>, ready: &mut Vec<PollEvent>) -> Result<PollWait>;

    /// Force a concurrent `poll` to return promptly
    fn wake(&self) -> Result<()>;

    /// Install a process-signal callback. The handler itself only marks the
    /// signal pending and wakes the poller; the callback runs later on the
    /// dispatch thread.
    fn signal_register(
        &self,
        signo: i32,
        callback: TaskCallback,
        context: TaskContext,
    ) -> Result<()> {
        let _ = (signo, callback, context);
        Err(crate::error::Error::InvalidArgument)
    }

    /// Remove a process-signal callback
    fn signal_unregister(&self, signo: i32) -> Result<()> {
        let _ = signo;
        Err(crate::error::Error::NotFound)
    }

    /// True if at least one registered signal fired since the last drain.
    /// Reading the flag clears it.
    fn signals_pending(&self) -> bool {
        false
    }

    /// Run the callbacks of all pending signals on the calling thread
    fn deliver_signals(&self, scheduler: &Arc<Scheduler>) {
        let _ = scheduler;
    }
}
