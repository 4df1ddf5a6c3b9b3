//! The dispatch loop
//!
//! One iteration: drain pending signals, compute how long the poller may
//! sleep from the timeout queue, poll, dispatch ready fd tasks, dispatch
//! expired timers. The registry lock is held for every container touch and
//! released around every user callback.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::core::{RunStatus, Scheduler, Wait};
use crate::poller::{PollEvent, PollWait};
use crate::task::EventMask;

/// Ceiling on timer callbacks per dispatch pass, so a burst of
/// near-simultaneous deadlines cannot starve fd work
const TIMEOUT_DISPATCH_BUDGET: usize = 40;

enum HeadState {
    Empty,
    Expired,
    Pending(Duration),
}

impl Scheduler {
    /// Run the dispatch loop on the calling thread until the scheduler is
    /// stopped
    pub fn run(self: &Arc<Self>) {
        log::debug!("running scheduler");
        while self.iterate(Wait::Auto) == RunStatus::Ran {}
    }

    /// Perform exactly one loop iteration.
    ///
    /// `timeout` bounds the poller sleep: [`Wait::Auto`] derives the bound
    /// from the earliest queued deadline, [`Wait::NoWait`] services ready
    /// work and returns without blocking.
    pub fn run_once(self: &Arc<Self>, timeout: Wait) -> RunStatus {
        self.iterate(timeout)
    }

    fn iterate(self: &Arc<Self>, timeout: Wait) -> RunStatus {
        log::debug!("in scheduler loop");
        *self.dispatch_thread.lock() = Some(std::thread::current().id());

        // Deliver signals if any have been marked pending
        if self.adapter.signals_pending() {
            self.adapter.deliver_signals(self);
        }

        if !self.is_valid() {
            log::debug!("scheduler no longer valid, exiting");
            return RunStatus::Stopped;
        }

        // Earliest deadline decides the sleep; already-expired timers are
        // dispatched right here
        let computed = self.next_wait();
        if !self.is_valid() {
            return RunStatus::Stopped;
        }

        let wait = match timeout {
            Wait::Auto => computed,
            Wait::NoWait => Some(Duration::ZERO),
            Wait::AtMost(bound) => Some(bound),
        };

        let mut ready: Vec<PollEvent> = Vec::new();
        match self.adapter.poll(wait, &mut ready) {
            Ok(PollWait::Ready(_)) => {
                self.queue_ready(&ready);
                self.dispatch_fds();

                // A very short sleep means a timer is imminent; give the
                // timer queue a pass so busy fds cannot starve it
                if let Some(bound) = wait {
                    if bound < self.config.opportunistic_timeout {
                        self.dispatch_timeouts(false);
                    }
                }
            }
            Ok(PollWait::TimedOut) => {
                self.dispatch_timeouts(false);
            }
            Ok(PollWait::Interrupted) => {}
            Ok(PollWait::Stopped) => return RunStatus::Stopped,
            Err(err) => {
                log::error!("error in poller: {}", err);
            }
        }

        RunStatus::Ran
    }

    /// Walk the queue head, evicting invalid entries and dispatching
    /// already-expired timers once, and return the time until the earliest
    /// pending deadline. `None` means the poller may block indefinitely.
    fn next_wait(self: &Arc<Self>) -> Option<Duration> {
        let mut dispatched = false;
        loop {
            let state = {
                let mut reg = self.registry.lock();
                let now = Instant::now();
                loop {
                    let head = match reg.timeouts.head() {
                        Some(head) => (head.is_valid(), head.deadline),
                        None => break HeadState::Empty,
                    };
                    match head {
                        (false, _) => {
                            let stale = reg.timeouts.pop_head().expect("head was just observed");
                            reg.timeouts.release(stale);
                        }
                        (true, deadline) if deadline <= now && !dispatched => {
                            break HeadState::Expired;
                        }
                        (true, deadline) => {
                            break HeadState::Pending(deadline.saturating_duration_since(now));
                        }
                    }
                }
            };

            match state {
                HeadState::Empty => return None,
                HeadState::Pending(wait) => {
                    log::debug!("next timeout in {:?}", wait);
                    return Some(wait);
                }
                HeadState::Expired => {
                    self.dispatch_timeouts(false);
                    if !self.is_valid() {
                        return None;
                    }
                    dispatched = true;
                }
            }
        }
    }

    /// Translate raw poller reports into the dispatch list. Tasks observed
    /// invalid here are reaped before any callback of this iteration runs.
    fn queue_ready(self: &Arc<Self>, ready: &[PollEvent]) {
        let mut reg = self.registry.lock();
        for event in ready {
            let task = match reg.fd_tasks.get(&event.fd) {
                Some(task) => task.clone(),
                None => continue,
            };
            if !task.is_valid() {
                reg.fd_tasks.remove(&event.fd);
                let _ = self.adapter.disarm(event.fd);
                continue;
            }
            let fired = event.revents & task.requested();
            if fired.is_empty() {
                continue;
            }
            task.revents.store(fired.bits(), Ordering::Release);
            reg.dispatch.push(task);
        }
    }

    /// Run the callbacks of every task on the dispatch list, read before
    /// write, then sweep the list for tasks invalidated along the way.
    pub(crate) fn dispatch_fds(self: &Arc<Self>) {
        let list = {
            let mut reg = self.registry.lock();
            std::mem::take(&mut reg.dispatch)
        };
        if list.is_empty() {
            return;
        }
        log::debug!("running {} fd tasks", list.len());

        for task in &list {
            let revents = task.returned();
            if revents.contains(EventMask::READ) && task.is_valid() {
                (task.callback)(self, EventMask::READ, task.fd, &task.context);
            }
            // A read callback that invalidated its own task suppresses the
            // write half
            if revents.contains(EventMask::WRITE) && task.is_valid() {
                (task.callback)(self, EventMask::WRITE, task.fd, &task.context);
            }
        }

        let mut reg = self.registry.lock();
        for task in list {
            if task.is_valid() {
                task.revents.store(0, Ordering::Release);
                continue;
            }
            let still_registered = reg
                .fd_tasks
                .get(&task.fd)
                .is_some_and(|current| Arc::ptr_eq(current, &task));
            if still_registered {
                reg.fd_tasks.remove(&task.fd);
                let _ = self.adapter.disarm(task.fd);
            }
        }
    }

    /// Fire expired timers, oldest deadline first.
    ///
    /// Each task is marked invalid before its callback runs, so a
    /// re-entrant add cannot be confused with it, and is retired to the
    /// freelist afterwards. With `all` set every remaining timer fires
    /// regardless of deadline; that mode is reserved for teardown.
    pub(crate) fn dispatch_timeouts(self: &Arc<Self>, all: bool) {
        log::debug!("running timeout tasks");
        let mut count = 0usize;

        loop {
            let task = {
                let mut reg = self.registry.lock();
                let now = Instant::now();
                loop {
                    let head = match reg.timeouts.head() {
                        Some(head) => (head.is_valid(), head.deadline, head.clone()),
                        None => return,
                    };
                    match head {
                        (false, _, _) => {
                            let stale = reg.timeouts.pop_head().expect("head was just observed");
                            reg.timeouts.release(stale);
                        }
                        (true, deadline, _) if deadline > now && !all => return,
                        (true, _, task) => {
                            // Claim before the callback so nothing else can
                            // dispatch or confuse this task
                            task.invalidate();
                            break task;
                        }
                    }
                }
            };

            (task.callback)(self, EventMask::EXPIRE, 0, &task.context);

            {
                let mut reg = self.registry.lock();
                reg.timeouts.remove(&task);
            }

            // Balance against fd work when many deadlines land together
            count += 1;
            if count >= TIMEOUT_DISPATCH_BUDGET {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::poller::PollAdapter;
    use crate::scheduler::SchedulerConfig;
    use crate::task::TaskContext;
    use parking_lot::Mutex;

    /// Inert adapter: never ready, never blocks
    struct NullPoller;

    impl PollAdapter for NullPoller {
        fn arm(&self, _fd: u32, _mask: EventMask) -> Result<()> {
            Ok(())
        }

        fn disarm(&self, _fd: u32) -> Result<()> {
            Ok(())
        }

        fn poll(&self, _timeout: Option<Duration>, _ready: &mut Vec<PollEvent>) -> Result<PollWait> {
            Ok(PollWait::TimedOut)
        }

        fn wake(&self) -> Result<()> {
            Ok(())
        }
    }

    fn quiet_config() -> SchedulerConfig {
        SchedulerConfig {
            freelist_gc_period: None,
            ..SchedulerConfig::default()
        }
    }

    fn scheduler() -> Arc<Scheduler> {
        Scheduler::with_adapter(
            quiet_config(),
            TaskContext::none(),
            None,
            Box::new(NullPoller),
        )
        .expect("scheduler construction")
    }

    fn counting_cb(
        _scheduler: &Arc<Scheduler>,
        _event: EventMask,
        _fd: u32,
        context: &TaskContext,
    ) {
        let counter = context
            .downcast_ref::<Mutex<usize>>()
            .expect("counter context");
        *counter.lock() += 1;
    }

    #[test]
    fn test_dispatch_budget_is_forty() {
        let scheduler = scheduler();
        let counter = TaskContext::new(Mutex::new(0usize));
        for _ in 0..50 {
            scheduler
                .add_timeout(counting_cb, counter.clone(), Duration::ZERO)
                .unwrap();
        }

        scheduler.dispatch_timeouts(false);
        assert_eq!(*counter.downcast_ref::<Mutex<usize>>().unwrap().lock(), 40);

        // The remainder waits for the next pass
        scheduler.dispatch_timeouts(false);
        assert_eq!(*counter.downcast_ref::<Mutex<usize>>().unwrap().lock(), 50);
    }

    #[test]
    fn test_dispatch_all_ignores_deadlines() {
        let scheduler = scheduler();
        let counter = TaskContext::new(Mutex::new(0usize));
        scheduler
            .add_timeout(counting_cb, counter.clone(), Duration::from_secs(3600))
            .unwrap();

        scheduler.dispatch_timeouts(false);
        assert_eq!(*counter.downcast_ref::<Mutex<usize>>().unwrap().lock(), 0);

        scheduler.dispatch_timeouts(true);
        assert_eq!(*counter.downcast_ref::<Mutex<usize>>().unwrap().lock(), 1);
    }

    #[test]
    fn test_invalid_heads_are_evicted_to_freelist() {
        let scheduler = scheduler();
        let counter = TaskContext::new(Mutex::new(0usize));
        let handle = scheduler
            .add_timeout(counting_cb, counter.clone(), Duration::ZERO)
            .unwrap();
        scheduler.invalidate(&handle).unwrap();

        scheduler.dispatch_timeouts(false);
        assert_eq!(*counter.downcast_ref::<Mutex<usize>>().unwrap().lock(), 0);
        let stats = scheduler.stats();
        assert_eq!(stats.timeout_tasks, 0);
        assert!(stats.freelist_tasks >= 1);
    }
}
