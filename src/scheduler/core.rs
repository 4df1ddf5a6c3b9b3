//! Scheduler state, lifecycle and task registry
//!
//! A scheduler is a value with identity: a root may have any number of
//! children, each running its own dispatch loop on its own thread, all
//! sharing the root's event bus. One lock per scheduler protects its
//! registry; the lock is never held while a user callback runs.
//!
//! Registration and cancellation are safe from any thread. Cancellation is
//! a flag flip: the task stops being dispatchable immediately and its node
//! is reaped later on the dispatch thread, so no thread ever frees memory
//! another thread may still be reading.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::queue::TimeoutQueue;
use crate::error::{Error, Result};
use crate::event::EventTask;
use crate::poller::PollAdapter;
use crate::task::{EventMask, FdTask, HandleRef, TaskCallback, TaskContext, TaskHandle};

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of fd tasks (0 = unlimited)
    pub max_tasks: usize,
    /// Freelist trim floor: the GC never shrinks the cache below this
    pub freelist_floor: usize,
    /// Period of the freelist GC timer; `None` disables the GC task
    pub freelist_gc_period: Option<Duration>,
    /// Iteration timeouts below this bound trigger an extra timer pass
    /// after fd work, so short timers are not starved by a busy fd
    pub opportunistic_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_tasks: 0,
            freelist_floor: 10,
            freelist_gc_period: Some(Duration::from_secs(3600)),
            opportunistic_timeout: Duration::from_millis(50),
        }
    }
}

/// Point-in-time registry counts, mostly useful for diagnostics and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleStats {
    /// Registered fd tasks
    pub fd_tasks: usize,
    /// Queued timeout tasks
    pub timeout_tasks: usize,
    /// Recycled nodes waiting on the freelist
    pub freelist_tasks: usize,
}

/// Upper bound on how long a single iteration may block in the poller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Derive the bound from the earliest queued deadline
    Auto,
    /// Service ready work without blocking
    NoWait,
    /// Block at most this long
    AtMost(Duration),
}

/// What a single loop iteration observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// The iteration completed normally
    Ran,
    /// The scheduler was stopped; the loop should not continue
    Stopped,
}

/// Registration change reported to the notify observer
pub struct TaskNotice<'a> {
    /// Scheduler the change happened on
    pub scheduler: &'a Arc<Scheduler>,
    /// True for an add, false for an invalidation
    pub added: bool,
    /// Handle of the affected task
    pub task: TaskHandle,
    /// True when the task is an fd task
    pub is_fd: bool,
    /// File handle, or 0 when not an fd task
    pub fd: u32,
    /// Interest mask for fd adds and re-arms
    pub mask: EventMask,
    /// Delay for timeout adds
    pub delay: Option<Duration>,
}

/// Observer invoked under the scheduler lock on every registration change.
///
/// The observer must not call back into the scheduler; the lock is held.
pub type NotifyCallback = fn(&TaskNotice<'_>, &TaskContext);

/// Containers protected by the scheduler lock
pub(crate) struct Registry {
    pub(crate) fd_tasks: HashMap<u32, Arc<FdTask>>,
    pub(crate) timeouts: TimeoutQueue,
    /// Named event slots; populated on the root scheduler only
    pub(crate) events: HashMap<String, Arc<EventTask>>,
    /// Fd tasks marked ready by the poller for the current iteration
    pub(crate) dispatch: Vec<Arc<FdTask>>,
}

/// A main-loop scheduler multiplexing fd readiness, timeouts and named
/// events onto one dispatch thread
pub struct Scheduler {
    pub(crate) registry: Mutex<Registry>,
    valid: AtomicBool,
    /// Root of the hierarchy; `None` when this scheduler is the root
    parent: Option<Arc<Scheduler>>,
    pub(crate) adapter: Box<dyn PollAdapter>,
    app_context: TaskContext,
    notify: Mutex<Option<(NotifyCallback, TaskContext)>>,
    /// Thread currently running the dispatch loop, so registrations made
    /// from that same thread skip the self-wakeup
    pub(crate) dispatch_thread: Mutex<Option<std::thread::ThreadId>>,
    pub(crate) config: SchedulerConfig,
}

thread_local! {
    static GLOBAL: RefCell<Option<Arc<Scheduler>>> = const { RefCell::new(None) };
}

/// Set (or clear) the calling thread's global scheduler.
///
/// The slot is per thread, not per process; each dispatch thread usually
/// installs its own scheduler here once at startup.
pub fn set_global(scheduler: Option<Arc<Scheduler>>) {
    GLOBAL.with(|slot| *slot.borrow_mut() = scheduler);
}

/// Return the calling thread's global scheduler, if one was set
pub fn get_global() -> Option<Arc<Scheduler>> {
    GLOBAL.with(|slot| slot.borrow().clone())
}

impl Scheduler {
    /// Create a scheduler with the platform poller.
    ///
    /// `parent` links the new scheduler into an existing hierarchy; event
    /// operations will resolve to that hierarchy's root.
    #[cfg(unix)]
    pub fn new(
        config: SchedulerConfig,
        app_context: TaskContext,
        parent: Option<Arc<Scheduler>>,
    ) -> Result<Arc<Scheduler>> {
        let adapter = Box::new(crate::poller::MioPoller::new()?);
        Scheduler::with_adapter(config, app_context, parent, adapter)
    }

    /// Create a scheduler with a caller-supplied poller adapter
    pub fn with_adapter(
        config: SchedulerConfig,
        app_context: TaskContext,
        parent: Option<Arc<Scheduler>>,
        adapter: Box<dyn PollAdapter>,
    ) -> Result<Arc<Scheduler>> {
        // Flatten the chain: a child of a child still answers to the root
        let parent = parent.map(|p| match &p.parent {
            Some(root) => root.clone(),
            None => p,
        });

        let scheduler = Arc::new(Scheduler {
            registry: Mutex::new(Registry {
                fd_tasks: HashMap::new(),
                timeouts: TimeoutQueue::new(config.freelist_floor),
                events: HashMap::new(),
                dispatch: Vec::new(),
            }),
            valid: AtomicBool::new(true),
            parent,
            adapter,
            app_context,
            notify: Mutex::new(None),
            dispatch_thread: Mutex::new(None),
            config,
        });
        log::debug!("initialized scheduler");

        if let Some(period) = scheduler.config.freelist_gc_period {
            scheduler.add_timeout(freelist_gc, TaskContext::none(), period)?;
        }
        Ok(scheduler)
    }

    /// True until [`Scheduler::stop`] is called
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// The parent scheduler, if this is a child
    pub fn parent(&self) -> Option<&Arc<Scheduler>> {
        self.parent.as_ref()
    }

    /// The root of the hierarchy (self, for a root scheduler)
    pub fn root(self: &Arc<Self>) -> Arc<Scheduler> {
        match &self.parent {
            Some(root) => root.clone(),
            None => self.clone(),
        }
    }

    /// The application context supplied at construction
    pub fn app_context(&self) -> &TaskContext {
        &self.app_context
    }

    /// Install or clear the registration-change observer
    pub fn set_notify(&self, hook: Option<(NotifyCallback, TaskContext)>) {
        *self.notify.lock() = hook;
    }

    /// Mark the scheduler stopped. The loop exits at the next iteration
    /// boundary; work already dispatching finishes first.
    pub fn stop(&self) {
        log::debug!("stopping scheduler");
        self.valid.store(false, Ordering::Release);
        if let Err(err) = self.adapter.wake() {
            log::debug!("wakeup after stop failed: {}", err);
        }
    }

    /// Force a blocked dispatch thread out of the poller promptly
    pub fn wake(&self) -> Result<()> {
        self.adapter.wake()
    }

    /// Wake the dispatch thread after a registration change, unless the
    /// change was made from the dispatch thread itself (which will observe
    /// it on its own before blocking again)
    pub(crate) fn wake_other(&self) {
        let dispatcher = *self.dispatch_thread.lock();
        match dispatcher {
            Some(id) if id != std::thread::current().id() => {
                if let Err(err) = self.adapter.wake() {
                    log::debug!("wakeup failed: {}", err);
                }
            }
            _ => {}
        }
    }

    /// Snapshot the registry counts
    pub fn stats(&self) -> ScheduleStats {
        let reg = self.registry.lock();
        ScheduleStats {
            fd_tasks: reg.fd_tasks.len(),
            timeout_tasks: reg.timeouts.len(),
            freelist_tasks: reg.timeouts.free_len(),
        }
    }

    /// Tear the scheduler down after it has been stopped.
    ///
    /// Returns false while the scheduler is still valid: call
    /// [`Scheduler::stop`] first and let the loop return. On success all
    /// remaining timers fire one final time (cleanup timers included),
    /// pending signals are delivered, and every task is invalidated and
    /// reaped.
    pub fn uninit(self: &Arc<Self>) -> bool {
        if self.is_valid() {
            return false;
        }
        log::debug!("uninitializing scheduler");

        // Cleanup timers get one last chance to run
        self.dispatch_timeouts(true);

        if self.adapter.signals_pending() {
            self.adapter.deliver_signals(self);
        }

        self.invalidate_all();

        let mut reg = self.registry.lock();
        let fds: Vec<u32> = reg.fd_tasks.keys().copied().collect();
        for fd in fds {
            reg.fd_tasks.remove(&fd);
            let _ = self.adapter.disarm(fd);
        }
        reg.dispatch.clear();
        reg.timeouts.clear();
        if self.parent.is_none() {
            for (_, event) in reg.events.drain() {
                event.connections.lock().clear();
            }
        }
        true
    }

    /// Run the notify observer for one registration change.
    /// Caller holds the registry lock.
    pub(crate) fn notify_task(
        self: &Arc<Self>,
        added: bool,
        task: TaskHandle,
        is_fd: bool,
        fd: u32,
        mask: EventMask,
        delay: Option<Duration>,
    ) {
        let hook = self.notify.lock().clone();
        if let Some((callback, context)) = hook {
            let notice = TaskNotice {
                scheduler: self,
                added,
                task,
                is_fd,
                fd,
                mask,
                delay,
            };
            callback(&notice, &context);
        }
    }

    /// Register a readiness task for a file handle, initially armed for
    /// `READ`.
    ///
    /// Re-adding a key whose task is still valid returns the existing
    /// handle. A key left behind by an invalidated task is evicted first.
    pub fn add_fd(
        self: &Arc<Self>,
        fd: u32,
        callback: TaskCallback,
        context: TaskContext,
    ) -> Result<TaskHandle> {
        if !self.is_valid() {
            return Err(Error::NotValid);
        }

        let handle = {
            let mut reg = self.registry.lock();

            if let Some(existing) = reg.fd_tasks.get(&fd) {
                if existing.is_valid() {
                    return Ok(TaskHandle::from_fd(existing));
                }
                // The key must stay unique; drop the stale entry
                reg.fd_tasks.remove(&fd);
            }

            if self.config.max_tasks > 0 && reg.fd_tasks.len() >= self.config.max_tasks {
                log::warn!("scheduler task limit reached: cannot add fd {}", fd);
                return Err(Error::Limit);
            }

            let task = Arc::new(FdTask::new(fd, callback, context));
            log::debug!("new fd task fd={}", fd);
            reg.fd_tasks.insert(fd, task.clone());
            if let Err(err) = self.adapter.arm(fd, EventMask::READ) {
                // Roll the insert back so a failed arm leaves no trace
                reg.fd_tasks.remove(&fd);
                return Err(err);
            }

            let handle = TaskHandle::from_fd(&task);
            self.notify_task(true, handle.clone(), true, fd, EventMask::READ, None);
            handle
        };

        self.wake_other();
        Ok(handle)
    }

    /// Register a one-shot timeout firing `delay` from now.
    ///
    /// A zero delay is legal and fires on the very next iteration.
    pub fn add_timeout(
        self: &Arc<Self>,
        callback: TaskCallback,
        context: TaskContext,
        delay: Duration,
    ) -> Result<TaskHandle> {
        if !self.is_valid() {
            return Err(Error::NotValid);
        }

        let deadline = Instant::now() + delay;
        let handle = {
            let mut reg = self.registry.lock();
            let task = reg.timeouts.acquire(deadline, callback, context);
            log::debug!("new timeout task, delay {:?}", delay);
            reg.timeouts.insert(task.clone());

            let handle = TaskHandle::from_timeout(&task);
            self.notify_task(true, handle.clone(), false, 0, EventMask::NONE, Some(delay));
            handle
        };

        self.wake_other();
        Ok(handle)
    }

    /// Register a process-signal callback, delivered on the dispatch thread
    /// with `INTERRUPT` and the signal number in the fd argument
    pub fn add_signal(
        &self,
        signo: i32,
        callback: TaskCallback,
        context: TaskContext,
    ) -> Result<()> {
        if !self.is_valid() {
            return Err(Error::NotValid);
        }
        self.adapter.signal_register(signo, callback, context)
    }

    /// Change the interest mask of an fd task.
    ///
    /// With `send_events` set and a non-empty mask the task is dispatched
    /// synchronously before this call returns, as if the poller had
    /// reported `mask`.
    pub fn set_listen_mask(
        self: &Arc<Self>,
        fd: u32,
        mask: EventMask,
        send_events: bool,
    ) -> Result<()> {
        if !self.is_valid() {
            return Err(Error::NotValid);
        }

        let mut do_dispatch = false;
        {
            let mut reg = self.registry.lock();
            let task = match reg.fd_tasks.get(&fd) {
                Some(task) => task.clone(),
                None => return Err(Error::NotFound),
            };

            self.adapter.arm(fd, mask)?;
            task.events.store(mask.bits(), Ordering::Release);

            if send_events && !mask.is_empty() {
                task.revents.store(mask.bits(), Ordering::Release);
                reg.dispatch.push(task.clone());
                do_dispatch = true;
            }

            let handle = TaskHandle::from_fd(&task);
            self.notify_task(true, handle, true, fd, mask, None);
        }

        if do_dispatch {
            self.dispatch_fds();
        }
        self.wake_other();
        Ok(())
    }

    /// The currently requested interest mask of an fd task, or `NONE` when
    /// the key is not registered
    pub fn get_listen_mask(&self, fd: u32) -> EventMask {
        let reg = self.registry.lock();
        reg.fd_tasks
            .get(&fd)
            .map(|task| task.requested())
            .unwrap_or(EventMask::NONE)
    }

    /// Stop delivery for an fd task without removing it
    pub fn unset_listen(self: &Arc<Self>, fd: u32) -> Result<()> {
        self.set_listen_mask(fd, EventMask::NONE, false)
    }

    /// Cancel a task.
    ///
    /// Never blocks and never runs the callback. The task stops being
    /// dispatchable immediately; its node is reaped by the dispatch thread
    /// on a later sweep. For event tasks the removal is deferred to a
    /// zero-delay timer on the root so in-flight signal fan-out can finish.
    pub fn invalidate(self: &Arc<Self>, task: &TaskHandle) -> Result<()> {
        match &task.0 {
            HandleRef::Fd(weak) => {
                let fd_task = weak.upgrade().ok_or(Error::NotValid)?;
                {
                    let _reg = self.registry.lock();
                    fd_task.invalidate();
                    self.notify_task(false, task.clone(), true, fd_task.fd, EventMask::NONE, None);
                }
                self.wake_other();
                Ok(())
            }
            HandleRef::Timeout(weak) => {
                let timeout = weak.upgrade().ok_or(Error::NotValid)?;
                {
                    let _reg = self.registry.lock();
                    timeout.invalidate();
                    self.notify_task(false, task.clone(), false, 0, EventMask::NONE, None);
                }
                self.wake_other();
                Ok(())
            }
            HandleRef::Event(weak) => {
                let event = weak.upgrade().ok_or(Error::NotValid)?;
                let root = self.root();
                {
                    let _reg = root.registry.lock();
                    event.invalidate();
                    self.notify_task(false, task.clone(), false, 0, EventMask::NONE, None);
                }
                // Deferred removal lets an in-flight signal finish safely
                root.add_timeout(
                    crate::event::event_del_timeout,
                    TaskContext::new(task.clone()),
                    Duration::ZERO,
                )?;
                Ok(())
            }
        }
    }

    /// Invalidate every task: fd, timeout and (on the hierarchy's root)
    /// event tasks. Used during teardown.
    pub fn invalidate_all(self: &Arc<Self>) {
        log::debug!("invalidating all tasks");
        {
            let reg = self.registry.lock();
            for task in reg.fd_tasks.values() {
                task.invalidate();
                self.notify_task(
                    false,
                    TaskHandle::from_fd(task),
                    true,
                    task.fd,
                    EventMask::NONE,
                    None,
                );
            }
            for task in reg.timeouts.iter() {
                task.invalidate();
                self.notify_task(
                    false,
                    TaskHandle::from_timeout(task),
                    false,
                    0,
                    EventMask::NONE,
                    None,
                );
            }
        }

        let root = self.root();
        let reg = root.registry.lock();
        for event in reg.events.values() {
            event.invalidate();
            self.notify_task(
                false,
                TaskHandle::from_event(event),
                false,
                0,
                EventMask::NONE,
                None,
            );
        }
    }

    /// Cancel the task registered for a file handle. Falls back to signal
    /// unregistration when the key is not an fd task.
    pub fn invalidate_by_fd(self: &Arc<Self>, fd: u32) -> Result<()> {
        log::debug!("invalidate task by fd {}", fd);
        let found = {
            let reg = self.registry.lock();
            match reg.fd_tasks.get(&fd) {
                Some(task) => {
                    task.invalidate();
                    self.notify_task(
                        false,
                        TaskHandle::from_fd(task),
                        true,
                        fd,
                        EventMask::NONE,
                        None,
                    );
                    true
                }
                None => false,
            }
        };

        if found {
            self.wake_other();
            return Ok(());
        }
        // The key may name a registered signal instead
        self.adapter
            .signal_unregister(fd as i32)
            .map_err(|_| Error::NotFound)
    }

    /// Cancel every fd and timeout task using `callback`
    pub fn invalidate_by_callback(self: &Arc<Self>, callback: TaskCallback) -> Result<()> {
        log::debug!("invalidate tasks by callback");
        let mut found = false;
        {
            let reg = self.registry.lock();
            for task in reg.fd_tasks.values() {
                if task.callback == callback && task.is_valid() {
                    task.invalidate();
                    self.notify_task(
                        false,
                        TaskHandle::from_fd(task),
                        true,
                        task.fd,
                        EventMask::NONE,
                        None,
                    );
                    found = true;
                }
            }
            for task in reg.timeouts.iter() {
                if task.callback == callback && task.is_valid() {
                    task.invalidate();
                    self.notify_task(
                        false,
                        TaskHandle::from_timeout(task),
                        false,
                        0,
                        EventMask::NONE,
                        None,
                    );
                    found = true;
                }
            }
        }

        if !found {
            return Err(Error::NotFound);
        }
        self.wake_other();
        Ok(())
    }

    /// Cancel every fd and timeout task whose context is `context`
    pub fn invalidate_by_context(self: &Arc<Self>, context: &TaskContext) -> Result<()> {
        log::debug!("invalidate tasks by context");
        let mut found = false;
        {
            let reg = self.registry.lock();
            for task in reg.fd_tasks.values() {
                if task.context.same(context) && task.is_valid() {
                    task.invalidate();
                    self.notify_task(
                        false,
                        TaskHandle::from_fd(task),
                        true,
                        task.fd,
                        EventMask::NONE,
                        None,
                    );
                    found = true;
                }
            }
            for task in reg.timeouts.iter() {
                if task.context.same(context) && task.is_valid() {
                    task.invalidate();
                    self.notify_task(
                        false,
                        TaskHandle::from_timeout(task),
                        false,
                        0,
                        EventMask::NONE,
                        None,
                    );
                    found = true;
                }
            }
        }

        if !found {
            return Err(Error::NotFound);
        }
        self.wake_other();
        Ok(())
    }

    /// Cancel by the full registration identity. A non-zero `fd` keys fd
    /// tasks (callback and context are irrelevant, the key is unique);
    /// otherwise timeout tasks matching both callback and context are
    /// cancelled.
    pub fn invalidate_by_all(
        self: &Arc<Self>,
        fd: u32,
        callback: TaskCallback,
        context: &TaskContext,
    ) -> Result<()> {
        if fd != 0 {
            return self.invalidate_by_fd(fd);
        }

        let mut found = false;
        {
            let reg = self.registry.lock();
            for task in reg.timeouts.iter() {
                if task.callback == callback && task.context.same(context) && task.is_valid() {
                    task.invalidate();
                    self.notify_task(
                        false,
                        TaskHandle::from_timeout(task),
                        false,
                        0,
                        EventMask::NONE,
                        None,
                    );
                    found = true;
                }
            }
        }

        if !found {
            return Err(Error::NotFound);
        }
        self.wake_other();
        Ok(())
    }
}

/// Self-rescheduling freelist trim; runs at `freelist_gc_period`
pub(crate) fn freelist_gc(
    scheduler: &Arc<Scheduler>,
    _event: EventMask,
    _fd: u32,
    _context: &TaskContext,
) {
    if !scheduler.is_valid() {
        return;
    }
    log::debug!("timeout freelist garbage collection");

    {
        let mut reg = scheduler.registry.lock();
        reg.timeouts.trim();
    }

    if let Some(period) = scheduler.config.freelist_gc_period {
        let _ = scheduler.add_timeout(freelist_gc, TaskContext::none(), period);
    }
}
