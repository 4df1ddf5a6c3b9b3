//! Common test harness for taskmux integration tests
//!
//! Provides a synthetic poller that the tests drive by hand: readiness is
//! injected with [`ManualPoller::push_ready`], signals with
//! [`ManualPoller::raise_signal`], and the blocking wait honors real wake
//! calls so the cross-thread scenarios behave like the platform poller.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use taskmux::poller::{PollAdapter, PollEvent, PollWait};
use taskmux::prelude::*;

#[derive(Default)]
struct PollerState {
    ready: Vec<PollEvent>,
    woken: bool,
    /// Last mask handed to `arm` per fd, removed on disarm
    armed: HashMap<u32, EventMask>,
    signals: HashMap<i32, (TaskCallback, TaskContext)>,
    pending_signals: Vec<i32>,
}

/// Hand-driven poller for tests
#[derive(Default)]
pub struct ManualPoller {
    state: Mutex<PollerState>,
    cond: Condvar,
}

/// Adapter handed to the scheduler; shares state with the test's handle
struct SharedPoller(Arc<ManualPoller>);

impl ManualPoller {
    /// A shared poller plus the boxed adapter to hand to the scheduler
    pub fn create() -> (Arc<ManualPoller>, Box<dyn PollAdapter>) {
        let poller = Arc::new(ManualPoller::default());
        (poller.clone(), Box::new(SharedPoller(poller)))
    }

    /// Inject a readiness report; a blocked poll returns with it
    pub fn push_ready(&self, fd: u32, revents: EventMask) {
        let mut state = self.state.lock();
        state.ready.push(PollEvent { fd, revents });
        self.cond.notify_all();
    }

    /// Pretend the process received `signo`
    pub fn raise_signal(&self, signo: i32) {
        let mut state = self.state.lock();
        if state.signals.contains_key(&signo) {
            state.pending_signals.push(signo);
        }
        self.cond.notify_all();
    }

    /// The mask most recently armed for `fd`
    pub fn armed_mask(&self, fd: u32) -> Option<EventMask> {
        self.state.lock().armed.get(&fd).copied()
    }
}

impl PollAdapter for ManualPoller {
    fn arm(&self, fd: u32, mask: EventMask) -> Result<()> {
        self.state.lock().armed.insert(fd, mask);
        Ok(())
    }

    fn disarm(&self, fd: u32) -> Result<()> {
        self.state.lock().armed.remove(&fd);
        Ok(())
    }

    fn poll(&self, timeout: Option<Duration>, ready: &mut Vec<PollEvent>) -> Result<PollWait> {
        let deadline = timeout.map(|bound| Instant::now() + bound);
        let mut state = self.state.lock();
        loop {
            if !state.ready.is_empty() {
                state.woken = false;
                ready.append(&mut state.ready);
                return Ok(PollWait::Ready(ready.len()));
            }
            if state.woken || !state.pending_signals.is_empty() {
                state.woken = false;
                return Ok(PollWait::Interrupted);
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Ok(PollWait::TimedOut);
                    }
                    self.cond.wait_until(&mut state, deadline);
                }
                None => self.cond.wait(&mut state),
            }
        }
    }

    fn wake(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.woken = true;
        self.cond.notify_all();
        Ok(())
    }

    fn signal_register(
        &self,
        signo: i32,
        callback: TaskCallback,
        context: TaskContext,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.signals.contains_key(&signo) {
            return Err(Error::AlreadyExists);
        }
        state.signals.insert(signo, (callback, context));
        Ok(())
    }

    fn signal_unregister(&self, signo: i32) -> Result<()> {
        let mut state = self.state.lock();
        state
            .signals
            .remove(&signo)
            .map(|_| ())
            .ok_or(Error::NotFound)
    }

    fn signals_pending(&self) -> bool {
        !self.state.lock().pending_signals.is_empty()
    }

    fn deliver_signals(&self, scheduler: &Arc<Scheduler>) {
        let fired: Vec<(i32, TaskCallback, TaskContext)> = {
            let mut state = self.state.lock();
            let pending = std::mem::take(&mut state.pending_signals);
            pending
                .into_iter()
                .filter_map(|signo| {
                    state
                        .signals
                        .get(&signo)
                        .map(|(cb, ctx)| (signo, *cb, ctx.clone()))
                })
                .collect()
        };
        for (signo, callback, context) in fired {
            callback(scheduler, EventMask::INTERRUPT, signo as u32, &context);
        }
    }
}

impl PollAdapter for SharedPoller {
    fn arm(&self, fd: u32, mask: EventMask) -> Result<()> {
        self.0.arm(fd, mask)
    }

    fn disarm(&self, fd: u32) -> Result<()> {
        self.0.disarm(fd)
    }

    fn poll(&self, timeout: Option<Duration>, ready: &mut Vec<PollEvent>) -> Result<PollWait> {
        self.0.poll(timeout, ready)
    }

    fn wake(&self) -> Result<()> {
        self.0.wake()
    }

    fn signal_register(
        &self,
        signo: i32,
        callback: TaskCallback,
        context: TaskContext,
    ) -> Result<()> {
        self.0.signal_register(signo, callback, context)
    }

    fn signal_unregister(&self, signo: i32) -> Result<()> {
        self.0.signal_unregister(signo)
    }

    fn signals_pending(&self) -> bool {
        self.0.signals_pending()
    }

    fn deliver_signals(&self, scheduler: &Arc<Scheduler>) {
        self.0.deliver_signals(scheduler)
    }
}

/// Callback journal shared through task contexts
#[derive(Default)]
pub struct Recorder {
    hits: Mutex<Vec<(EventMask, u32)>>,
}

impl Recorder {
    pub fn context() -> TaskContext {
        TaskContext::new(Recorder::default())
    }

    pub fn push(&self, event: EventMask, fd: u32) {
        self.hits.lock().push((event, fd));
    }

    pub fn hits(context: &TaskContext) -> Vec<(EventMask, u32)> {
        context
            .downcast_ref::<Recorder>()
            .expect("recorder context")
            .hits
            .lock()
            .clone()
    }
}

/// Standard recording task callback
pub fn record_cb(_scheduler: &Arc<Scheduler>, event: EventMask, fd: u32, context: &TaskContext) {
    context
        .downcast_ref::<Recorder>()
        .expect("recorder context")
        .push(event, fd);
}

/// Scheduler on a manual poller, with the freelist GC timer disabled so
/// the timeout queue starts empty
pub fn manual_scheduler() -> (Arc<Scheduler>, Arc<ManualPoller>) {
    let (poller, adapter) = ManualPoller::create();
    let config = SchedulerConfig {
        freelist_gc_period: None,
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::with_adapter(config, TaskContext::none(), None, adapter)
        .expect("scheduler construction");
    (scheduler, poller)
}
