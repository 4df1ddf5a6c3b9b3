//! Task primitives shared by the scheduler and the event bus
//!
//! A task is a registration owned by the scheduler registry: a file-handle
//! watch, a one-shot timeout, or a named event slot. User code never owns a
//! task; it holds an opaque [`TaskHandle`] that goes inert once the registry
//! reaps the task.

use std::any::Any;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use crate::event::EventTask;
use crate::scheduler::Scheduler;

/// Interest and delivery bits for task callbacks.
///
/// `READ` and `WRITE` may be requested for fd tasks; `EXPIRE` is delivered
/// to timeout callbacks and `INTERRUPT` to signal callbacks.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventMask(u16);

impl EventMask {
    /// Empty mask
    pub const NONE: EventMask = EventMask(0);
    /// The file handle is readable
    pub const READ: EventMask = EventMask(0x0001);
    /// The file handle is writable
    pub const WRITE: EventMask = EventMask(0x0002);
    /// A timeout expired
    pub const EXPIRE: EventMask = EventMask(0x0004);
    /// A process signal was delivered
    pub const INTERRUPT: EventMask = EventMask(0x0008);

    /// Reconstruct a mask from its raw bits
    pub const fn from_bits(bits: u16) -> EventMask {
        EventMask(bits)
    }

    /// Raw bit representation
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// True if every bit of `other` is set in `self`
    pub const fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if `self` and `other` share at least one bit
    pub const fn intersects(self, other: EventMask) -> bool {
        self.0 & other.0 != 0
    }

    /// True if no bit is set
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: EventMask) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for EventMask {
    type Output = EventMask;

    fn bitand(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 & rhs.0)
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "NONE");
        }
        let mut first = true;
        for (bit, name) in [
            (EventMask::READ, "READ"),
            (EventMask::WRITE, "WRITE"),
            (EventMask::EXPIRE, "EXPIRE"),
            (EventMask::INTERRUPT, "INTERRUPT"),
        ] {
            if self.contains(bit) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// The three task classes managed by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// File-handle readiness task
    Fd,
    /// One-shot timeout task
    Timeout,
    /// Named event slot on the root scheduler
    Event,
}

/// Opaque user payload attached to a task registration.
///
/// The payload is shared, immutable and cheap to clone. Two contexts compare
/// equal under [`TaskContext::same`] when they point at the same allocation,
/// which is the identity `invalidate_by_context` and event subscription
/// dedup work with.
#[derive(Clone, Default)]
pub struct TaskContext(Option<Arc<dyn Any + Send + Sync>>);

impl TaskContext {
    /// Wrap a value as an opaque context
    pub fn new<T: Any + Send + Sync>(value: T) -> TaskContext {
        TaskContext(Some(Arc::new(value)))
    }

    /// The empty context
    pub fn none() -> TaskContext {
        TaskContext(None)
    }

    /// True if no payload is attached
    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }

    /// Borrow the payload as a concrete type
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_deref().and_then(|any| any.downcast_ref())
    }

    /// Identity comparison: same allocation, or both empty
    pub fn same(&self, other: &TaskContext) -> bool {
        match (&self.0, &other.0) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(any) => write!(f, "TaskContext({:p})", Arc::as_ptr(any)),
            None => write!(f, "TaskContext(none)"),
        }
    }
}

/// Callback invoked when a task fires.
///
/// Arguments are the scheduler that dispatched the task, the delivered
/// event bits, the file handle (or signal number, or `0` for timeouts) and
/// the context given at registration. Plain function pointers keep
/// callbacks comparable, which `invalidate_by_callback` relies on.
pub type TaskCallback = fn(&Arc<Scheduler>, EventMask, u32, &TaskContext);

/// Internal record of an fd readiness registration
pub(crate) struct FdTask {
    pub(crate) valid: AtomicBool,
    pub(crate) fd: u32,
    /// Requested interest bits
    pub(crate) events: AtomicU16,
    /// Bits reported by the poller for the current iteration
    pub(crate) revents: AtomicU16,
    pub(crate) callback: TaskCallback,
    pub(crate) context: TaskContext,
}

impl FdTask {
    pub(crate) fn new(fd: u32, callback: TaskCallback, context: TaskContext) -> FdTask {
        FdTask {
            valid: AtomicBool::new(true),
            fd,
            events: AtomicU16::new(EventMask::READ.bits()),
            revents: AtomicU16::new(0),
            callback,
            context,
        }
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub(crate) fn requested(&self) -> EventMask {
        EventMask::from_bits(self.events.load(Ordering::Acquire))
    }

    pub(crate) fn returned(&self) -> EventMask {
        EventMask::from_bits(self.revents.load(Ordering::Acquire))
    }
}

/// Internal record of a timeout registration.
///
/// The deadline is an absolute instant on the monotonic clock, so
/// wall-clock jumps never move it. Retired records are recycled through the
/// freelist; a record is only rewritten once no handle can still reach it.
pub(crate) struct TimeoutTask {
    pub(crate) valid: AtomicBool,
    pub(crate) deadline: Instant,
    pub(crate) callback: TaskCallback,
    pub(crate) context: TaskContext,
}

impl TimeoutTask {
    pub(crate) fn new(deadline: Instant, callback: TaskCallback, context: TaskContext) -> TimeoutTask {
        TimeoutTask {
            valid: AtomicBool::new(true),
            deadline,
            callback,
            context,
        }
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub(crate) enum HandleRef {
    Fd(Weak<FdTask>),
    Timeout(Weak<TimeoutTask>),
    Event(Weak<EventTask>),
}

/// Opaque token for a registered task.
///
/// The registry is the sole owner of the task itself; a handle is a
/// non-owning view. Handles stay safe to use after invalidation and after
/// the task has been reaped — operations on a reaped handle report
/// [`Error::NotValid`](crate::error::Error::NotValid).
#[derive(Clone)]
pub struct TaskHandle(pub(crate) HandleRef);

impl TaskHandle {
    /// The class of task this handle refers to
    pub fn kind(&self) -> TaskKind {
        match self.0 {
            HandleRef::Fd(_) => TaskKind::Fd,
            HandleRef::Timeout(_) => TaskKind::Timeout,
            HandleRef::Event(_) => TaskKind::Event,
        }
    }

    /// True while the task is registered and has not been invalidated
    pub fn is_valid(&self) -> bool {
        match &self.0 {
            HandleRef::Fd(w) => w.upgrade().map(|t| t.is_valid()).unwrap_or(false),
            HandleRef::Timeout(w) => w.upgrade().map(|t| t.is_valid()).unwrap_or(false),
            HandleRef::Event(w) => w.upgrade().map(|t| t.is_valid()).unwrap_or(false),
        }
    }

    pub(crate) fn from_fd(task: &Arc<FdTask>) -> TaskHandle {
        TaskHandle(HandleRef::Fd(Arc::downgrade(task)))
    }

    pub(crate) fn from_timeout(task: &Arc<TimeoutTask>) -> TaskHandle {
        TaskHandle(HandleRef::Timeout(Arc::downgrade(task)))
    }

    pub(crate) fn from_event(task: &Arc<EventTask>) -> TaskHandle {
        TaskHandle(HandleRef::Event(Arc::downgrade(task)))
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("kind", &self.kind())
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_bit_ops() {
        let rw = EventMask::READ | EventMask::WRITE;
        assert!(rw.contains(EventMask::READ));
        assert!(rw.contains(EventMask::WRITE));
        assert!(!rw.contains(EventMask::EXPIRE));
        assert!(rw.intersects(EventMask::READ));
        assert_eq!(rw & EventMask::READ, EventMask::READ);
        assert!((rw & EventMask::EXPIRE).is_empty());
    }

    #[test]
    fn test_mask_debug_names() {
        let rw = EventMask::READ | EventMask::WRITE;
        assert_eq!(format!("{:?}", rw), "READ|WRITE");
        assert_eq!(format!("{:?}", EventMask::NONE), "NONE");
    }

    #[test]
    fn test_context_identity() {
        let a = TaskContext::new(42u32);
        let b = a.clone();
        let c = TaskContext::new(42u32);
        assert!(a.same(&b));
        assert!(!a.same(&c));
        assert!(TaskContext::none().same(&TaskContext::none()));
        assert!(!a.same(&TaskContext::none()));
        assert_eq!(a.downcast_ref::<u32>(), Some(&42));
        assert_eq!(a.downcast_ref::<u64>(), None);
    }

    #[test]
    fn test_handle_outlives_task() {
        let task = Arc::new(TimeoutTask::new(
            Instant::now(),
            |_, _, _, _| {},
            TaskContext::none(),
        ));
        let handle = TaskHandle::from_timeout(&task);
        assert_eq!(handle.kind(), TaskKind::Timeout);
        assert!(handle.is_valid());
        task.invalidate();
        assert!(!handle.is_valid());
        drop(task);
        assert!(!handle.is_valid());
    }
}
