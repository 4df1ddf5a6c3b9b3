//! mio-backed readiness adapter for unix targets
//!
//! One `mio::Poll` serves as the readiness primitive. Raw file-handle keys
//! are registered through `SourceFd`, the handle key doubling as the mio
//! token. A `mio::Waker` provides the cross-thread wakeup and a
//! non-blocking socket pair carries signal arrivals out of the handler
//! context (see [`signals`](super::signals)).

use std::collections::HashSet;
use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;

use super::signals::SignalSet;
use super::{PollAdapter, PollEvent, PollWait};
use crate::error::{Error, Result};
use crate::scheduler::Scheduler;
use crate::task::{EventMask, TaskCallback, TaskContext};

/// Token reserved for the cross-thread waker
const WAKER: Token = Token(usize::MAX - 1);
/// Token reserved for the signal pipe read end
const SIGNAL_PIPE: Token = Token(usize::MAX - 2);

const EVENT_CAPACITY: usize = 256;

struct PollState {
    poll: Poll,
    events: Events,
    /// Read end of the signal pipe; kept open for the lifetime of the poller
    signal_rx: UnixStream,
}

/// Readiness adapter built on `mio::Poll`
pub struct MioPoller {
    /// Poll plus its event buffer; entered only by the dispatch thread
    state: Mutex<PollState>,
    /// Thread-safe registration handle cloned off the poll
    registry: mio::Registry,
    waker: Waker,
    /// Keys currently known to the kernel, so arm can pick
    /// register vs. reregister
    armed: Mutex<HashSet<u32>>,
    signals: SignalSet,
}

impl MioPoller {
    /// Create a poller with its waker and signal pipe installed
    pub fn new() -> Result<MioPoller> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER)?;

        let (signal_rx, signal_tx) = UnixStream::pair()?;
        signal_rx.set_nonblocking(true)?;
        signal_tx.set_nonblocking(true)?;
        registry.register(
            &mut SourceFd(&signal_rx.as_raw_fd()),
            SIGNAL_PIPE,
            Interest::READABLE,
        )?;

        Ok(MioPoller {
            state: Mutex::new(PollState {
                poll,
                events: Events::with_capacity(EVENT_CAPACITY),
                signal_rx,
            }),
            registry,
            waker,
            armed: Mutex::new(HashSet::new()),
            signals: SignalSet::new(signal_tx),
        })
    }

    fn interests(mask: EventMask) -> Option<Interest> {
        let mut interest = None;
        if mask.contains(EventMask::READ) {
            interest = Some(Interest::READABLE);
        }
        if mask.contains(EventMask::WRITE) {
            interest = Some(match interest {
                Some(i) => i | Interest::WRITABLE,
                None => Interest::WRITABLE,
            });
        }
        interest
    }
}

impl PollAdapter for MioPoller {
    fn arm(&self, fd: u32, mask: EventMask) -> Result<()> {
        let mut armed = self.armed.lock();
        let raw = fd as i32;
        match Self::interests(mask) {
            None => {
                // Empty mask: drop kernel interest but keep the task
                if armed.remove(&fd) {
                    self.registry.deregister(&mut SourceFd(&raw))?;
                }
                Ok(())
            }
            Some(interest) => {
                if armed.contains(&fd) {
                    self.registry
                        .reregister(&mut SourceFd(&raw), Token(fd as usize), interest)?;
                } else {
                    self.registry
                        .register(&mut SourceFd(&raw), Token(fd as usize), interest)?;
                    armed.insert(fd);
                }
                Ok(())
            }
        }
    }

    fn disarm(&self, fd: u32) -> Result<()> {
        let mut armed = self.armed.lock();
        if armed.remove(&fd) {
            let raw = fd as i32;
            self.registry.deregister(&mut SourceFd(&raw))?;
        }
        Ok(())
    }

    fn poll(&self, timeout: Option<Duration>, ready: &mut Vec<PollEvent>) -> Result<PollWait> {
        let mut state = self.state.lock();
        let state = &mut *state;
        if let Err(err) = state.poll.poll(&mut state.events, timeout) {
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(PollWait::Interrupted);
            }
            return Err(Error::Io(err));
        }

        let mut woken = false;
        for event in state.events.iter() {
            match event.token() {
                WAKER => woken = true,
                SIGNAL_PIPE => {
                    // Drain the pipe; the pending flags carry the payload
                    let mut buf = [0u8; 64];
                    while matches!(state.signal_rx.read(&mut buf), Ok(n) if n > 0) {}
                    woken = true;
                }
                Token(key) => {
                    let mut revents = EventMask::NONE;
                    if event.is_readable() || event.is_read_closed() {
                        revents |= EventMask::READ;
                    }
                    if event.is_writable() || event.is_write_closed() {
                        revents |= EventMask::WRITE;
                    }
                    if !revents.is_empty() {
                        ready.push(PollEvent {
                            fd: key as u32,
                            revents,
                        });
                    }
                }
            }
        }

        if !ready.is_empty() {
            Ok(PollWait::Ready(ready.len()))
        } else if woken {
            Ok(PollWait::Interrupted)
        } else {
            Ok(PollWait::TimedOut)
        }
    }

    fn wake(&self) -> Result<()> {
        self.waker.wake()?;
        Ok(())
    }

    fn signal_register(
        &self,
        signo: i32,
        callback: TaskCallback,
        context: TaskContext,
    ) -> Result<()> {
        self.signals.register(signo, callback, context)
    }

    fn signal_unregister(&self, signo: i32) -> Result<()> {
        self.signals.unregister(signo)
    }

    fn signals_pending(&self) -> bool {
        self.signals.take_pending()
    }

    fn deliver_signals(&self, scheduler: &Arc<Scheduler>) {
        self.signals.deliver(scheduler);
    }
}
