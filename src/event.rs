//! Named asynchronous events
//!
//! An event is a named publish/subscribe slot stored on the root scheduler;
//! child schedulers forward every event operation to their root, so one
//! hierarchy shares one bus. Signalling fans out synchronously on the
//! signalling thread, in subscription order, until a subscriber vetoes or
//! the event is deleted mid-flight.
//!
//! Deleting an event only invalidates it. The actual teardown runs from a
//! zero-delay timer on the root's dispatch thread, which lets a signal
//! already in progress on another thread finish against intact state.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::scheduler::{Registry, Scheduler};
use crate::task::{EventMask, HandleRef, TaskContext, TaskHandle};

/// Callback invoked per subscriber when an event is signalled.
///
/// Arguments: the scheduler the subscription was made from, the event's
/// task handle, the subscription context and the signal arguments.
/// Returning `false` vetoes delivery to the remaining subscribers.
pub type EventCallback = fn(&Arc<Scheduler>, &TaskHandle, &TaskContext, &EventArgs) -> bool;

/// Arguments carried by one signal.
///
/// Values are boxed dynamic payloads read back with [`EventArgs::get`].
/// Every subscriber receives the same shared view, so consuming the
/// arguments in one callback cannot corrupt the next.
#[derive(Default)]
pub struct EventArgs {
    values: Vec<Arc<dyn Any + Send + Sync>>,
}

impl EventArgs {
    /// No arguments
    pub fn new() -> EventArgs {
        EventArgs::default()
    }

    /// Append an argument
    pub fn push<T: Any + Send + Sync>(&mut self, value: T) {
        self.values.push(Arc::new(value));
    }

    /// Builder-style [`EventArgs::push`]
    pub fn with<T: Any + Send + Sync>(mut self, value: T) -> EventArgs {
        self.push(value);
        self
    }

    /// Borrow argument `index` as a concrete type
    pub fn get<T: Any>(&self, index: usize) -> Option<&T> {
        self.values.get(index).and_then(|any| any.downcast_ref())
    }

    /// Number of arguments
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when no arguments were attached
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for EventArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventArgs(len={})", self.values.len())
    }
}

/// Either side of the event addressing scheme: by name or by handle
#[derive(Clone, Copy)]
pub enum EventRef<'a> {
    /// Address the event by its declared name
    Name(&'a str),
    /// Address the event by the handle returned from `add_event`
    Task(&'a TaskHandle),
}

impl<'a> From<&'a str> for EventRef<'a> {
    fn from(name: &'a str) -> EventRef<'a> {
        EventRef::Name(name)
    }
}

impl<'a> From<&'a TaskHandle> for EventRef<'a> {
    fn from(task: &'a TaskHandle) -> EventRef<'a> {
        EventRef::Task(task)
    }
}

/// One subscriber attached to an event
pub(crate) struct Subscription {
    /// Scheduler the connect call was made through; handed back to the
    /// callback on delivery
    origin: Weak<Scheduler>,
    callback: EventCallback,
    context: TaskContext,
}

/// A named event slot; lives in the root scheduler's registry
pub(crate) struct EventTask {
    valid: AtomicBool,
    pub(crate) name: String,
    /// Guarded by the root scheduler lock by convention; the inner mutex
    /// only provides interior mutability
    pub(crate) connections: Mutex<Vec<Subscription>>,
}

impl EventTask {
    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }
}

fn resolve(reg: &Registry, event: EventRef<'_>) -> Result<Arc<EventTask>> {
    match event {
        EventRef::Name(name) => reg.events.get(name).cloned().ok_or(Error::NotFound),
        EventRef::Task(handle) => match &handle.0 {
            HandleRef::Event(weak) => weak.upgrade().ok_or(Error::NotValid),
            _ => Err(Error::InvalidArgument),
        },
    }
}

impl Scheduler {
    /// Declare a named event on the hierarchy's root.
    ///
    /// Declaring a name that already exists fails with `AlreadyExists`,
    /// including while a deleted event of that name awaits its deferred
    /// cleanup.
    pub fn add_event(self: &Arc<Self>, name: &str) -> Result<TaskHandle> {
        if name.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let root = self.root();
        log::debug!("adding event '{}'", name);

        let mut reg = root.registry.lock();
        if reg.events.contains_key(name) {
            return Err(Error::AlreadyExists);
        }

        let task = Arc::new(EventTask {
            valid: AtomicBool::new(true),
            name: name.to_owned(),
            connections: Mutex::new(Vec::new()),
        });
        reg.events.insert(name.to_owned(), task.clone());
        Ok(TaskHandle::from_event(&task))
    }

    /// Subscribe `callback`/`context` to an event.
    ///
    /// The pair must be unique per event; resubscribing the same pair
    /// fails with `AlreadyExists`.
    pub fn event_connect<'a>(
        self: &Arc<Self>,
        event: impl Into<EventRef<'a>>,
        callback: EventCallback,
        context: TaskContext,
    ) -> Result<()> {
        let root = self.root();
        let reg = root.registry.lock();
        let task = resolve(&reg, event.into())?;
        if !task.is_valid() {
            return Err(Error::NotValid);
        }

        let mut connections = task.connections.lock();
        if connections
            .iter()
            .any(|sub| sub.callback == callback && sub.context.same(&context))
        {
            return Err(Error::AlreadyExists);
        }

        log::debug!("connect to event '{}'", task.name);
        connections.push(Subscription {
            origin: Arc::downgrade(self),
            callback,
            context,
        });
        Ok(())
    }

    /// Remove the subscription matching `callback`/`context`
    pub fn event_disconnect<'a>(
        self: &Arc<Self>,
        event: impl Into<EventRef<'a>>,
        callback: EventCallback,
        context: &TaskContext,
    ) -> Result<()> {
        let root = self.root();
        let reg = root.registry.lock();
        let task = resolve(&reg, event.into())?;
        if !task.is_valid() {
            return Err(Error::NotValid);
        }

        let mut connections = task.connections.lock();
        let at = connections
            .iter()
            .position(|sub| sub.callback == callback && sub.context.same(context))
            .ok_or(Error::NotFound)?;
        log::debug!("disconnect from event '{}'", task.name);
        connections.remove(at);
        Ok(())
    }

    /// Signal an event: fan `args` out to every subscriber in insertion
    /// order, on the calling thread.
    ///
    /// Delivery stops early when a subscriber returns `false` or when the
    /// event is deleted mid-flight. Subscribers removed between their
    /// snapshot and their turn are skipped.
    pub fn event_signal<'a>(
        self: &Arc<Self>,
        event: impl Into<EventRef<'a>>,
        args: &EventArgs,
    ) -> Result<()> {
        let root = self.root();

        let (task, handle, snapshot) = {
            let reg = root.registry.lock();
            let task = resolve(&reg, event.into())?;
            if !task.is_valid() {
                return Err(Error::NotValid);
            }
            let connections = task.connections.lock();
            let snapshot: Vec<(Weak<Scheduler>, EventCallback, TaskContext)> = connections
                .iter()
                .map(|sub| (sub.origin.clone(), sub.callback, sub.context.clone()))
                .collect();
            let handle = TaskHandle::from_event(&task);
            (task.clone(), handle, snapshot)
        };
        log::debug!("signal event '{}'", task.name);

        for (origin, callback, context) in snapshot {
            // Re-check under the root lock: the event may have been deleted
            // and this very subscription disconnected since the snapshot
            let deliverable = {
                let _reg = root.registry.lock();
                if !task.is_valid() {
                    break;
                }
                task.connections
                    .lock()
                    .iter()
                    .any(|sub| sub.callback == callback && sub.context.same(&context))
            };
            if !deliverable {
                continue;
            }
            let Some(origin) = origin.upgrade() else {
                continue;
            };

            let keep_going = callback(&origin, &handle, &context, args);
            if !keep_going || !task.is_valid() {
                break;
            }
        }
        Ok(())
    }

    /// Delete an event: invalidate it now, free it from the root's
    /// dispatch thread via a zero-delay timer.
    ///
    /// Deleting an already-deleted event succeeds quietly.
    pub fn event_delete<'a>(self: &Arc<Self>, event: impl Into<EventRef<'a>>) -> Result<()> {
        let root = self.root();
        let handle = {
            let reg = root.registry.lock();
            let task = resolve(&reg, event.into())?;
            if !task.is_valid() {
                return Ok(());
            }
            log::debug!("delete event '{}'", task.name);
            TaskHandle::from_event(&task)
        };
        root.invalidate(&handle)
    }
}

/// Deferred removal of a deleted event task; runs as a zero-delay timer on
/// the root scheduler
pub(crate) fn event_del_timeout(
    scheduler: &Arc<Scheduler>,
    _event: EventMask,
    _fd: u32,
    context: &TaskContext,
) {
    let Some(handle) = context.downcast_ref::<TaskHandle>() else {
        return;
    };
    let HandleRef::Event(weak) = &handle.0 else {
        return;
    };
    let Some(task) = weak.upgrade() else {
        return;
    };

    let mut reg = scheduler.registry.lock();
    reg.events.remove(&task.name);
    task.connections.lock().clear();
}
