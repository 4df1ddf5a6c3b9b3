//! Process-signal trampoline
//!
//! Signal handlers may only do two things here: set an atomic pending flag
//! and write one byte into the poller's signal pipe so a blocked poll
//! returns. Both are installed through signal-hook, which keeps the handler
//! body async-signal-safe. The actual user callbacks run later on the
//! dispatch thread when the loop drains pending signals.

use std::collections::HashMap;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use signal_hook::low_level::pipe;
use signal_hook::{flag, SigId};

use crate::error::{Error, Result};
use crate::scheduler::Scheduler;
use crate::task::{EventMask, TaskCallback, TaskContext};

struct SignalEntry {
    callback: TaskCallback,
    context: TaskContext,
    pending: Arc<AtomicBool>,
    /// signal-hook registrations to undo on unregister
    ids: Vec<SigId>,
}

/// The set of registered process-signal callbacks for one poller
pub(crate) struct SignalSet {
    /// Set by any handler; cleared when the loop drains
    pending_any: Arc<AtomicBool>,
    entries: Mutex<HashMap<i32, SignalEntry>>,
    /// Write end of the poller's signal pipe, cloned per registration
    pipe_tx: UnixStream,
}

impl SignalSet {
    pub(crate) fn new(pipe_tx: UnixStream) -> SignalSet {
        SignalSet {
            pending_any: Arc::new(AtomicBool::new(false)),
            entries: Mutex::new(HashMap::new()),
            pipe_tx,
        }
    }

    pub(crate) fn register(
        &self,
        signo: i32,
        callback: TaskCallback,
        context: TaskContext,
    ) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&signo) {
            return Err(Error::AlreadyExists);
        }

        let pending = Arc::new(AtomicBool::new(false));
        let mut ids = Vec::with_capacity(3);
        ids.push(flag::register(signo, pending.clone())?);
        ids.push(flag::register(signo, self.pending_any.clone())?);
        ids.push(pipe::register(signo, self.pipe_tx.try_clone()?)?);

        log::debug!("registered signal {} callback", signo);
        entries.insert(
            signo,
            SignalEntry {
                callback,
                context,
                pending,
                ids,
            },
        );
        Ok(())
    }

    pub(crate) fn unregister(&self, signo: i32) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries.remove(&signo).ok_or(Error::NotFound)?;
        for id in entry.ids {
            signal_hook::low_level::unregister(id);
        }
        log::debug!("unregistered signal {} callback", signo);
        Ok(())
    }

    /// Check-and-clear the "anything pending" flag
    pub(crate) fn take_pending(&self) -> bool {
        self.pending_any.swap(false, Ordering::AcqRel)
    }

    /// Invoke callbacks for every signal that fired since the last drain.
    /// Runs on the dispatch thread with no scheduler lock held.
    pub(crate) fn deliver(&self, scheduler: &Arc<Scheduler>) {
        // Snapshot under the lock, call outside it
        let fired: Vec<(i32, TaskCallback, TaskContext)> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .filter(|(_, e)| e.pending.swap(false, Ordering::AcqRel))
                .map(|(signo, e)| (*signo, e.callback, e.context.clone()))
                .collect()
        };
        for (signo, callback, context) in fired {
            log::debug!("delivering signal {}", signo);
            callback(scheduler, EventMask::INTERRUPT, signo as u32, &context);
        }
    }
}
