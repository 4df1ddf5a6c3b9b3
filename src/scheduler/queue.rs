//! Deadline-ordered timeout queue with an allocation freelist
//!
//! The queue is kept sorted by absolute deadline; insertion scans from the
//! head and stops at the first strictly later deadline, so tasks with equal
//! deadlines keep FIFO order. The head is therefore always the earliest
//! pending expiration and decides how long the poller may sleep.
//!
//! Retired nodes go onto a freelist instead of back to the allocator, which
//! pays off for bursty timer workloads. A node is recycled only once no
//! task handle can still reach it; the periodic trim releases excess nodes
//! after quiescent stretches.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use crate::task::{TaskCallback, TaskContext, TimeoutTask};

/// Ordered timeout queue plus recycled-node cache
pub(crate) struct TimeoutQueue {
    queue: VecDeque<Arc<TimeoutTask>>,
    free: Vec<Arc<TimeoutTask>>,
    /// Trim never shrinks the freelist below this many nodes
    floor: usize,
}

impl TimeoutQueue {
    pub(crate) fn new(floor: usize) -> TimeoutQueue {
        TimeoutQueue {
            queue: VecDeque::new(),
            free: Vec::new(),
            floor,
        }
    }

    /// Take a node from the freelist or allocate a fresh one.
    /// Does not insert it into the queue.
    pub(crate) fn acquire(
        &mut self,
        deadline: Instant,
        callback: TaskCallback,
        context: TaskContext,
    ) -> Arc<TimeoutTask> {
        let mut i = self.free.len();
        while i > 0 {
            i -= 1;
            // A node still referenced by a handle must not be rewritten
            if Arc::get_mut(&mut self.free[i]).is_some() {
                let mut node = self.free.swap_remove(i);
                let task = Arc::get_mut(&mut node).expect("freelist node became shared");
                *task = TimeoutTask::new(deadline, callback, context);
                return node;
            }
        }
        Arc::new(TimeoutTask::new(deadline, callback, context))
    }

    /// Insert in deadline order, after any equal-deadline peers
    pub(crate) fn insert(&mut self, task: Arc<TimeoutTask>) {
        let at = self
            .queue
            .iter()
            .position(|queued| queued.deadline > task.deadline)
            .unwrap_or(self.queue.len());
        self.queue.insert(at, task);
    }

    pub(crate) fn head(&self) -> Option<&Arc<TimeoutTask>> {
        self.queue.front()
    }

    pub(crate) fn pop_head(&mut self) -> Option<Arc<TimeoutTask>> {
        self.queue.pop_front()
    }

    /// Unlink a task by identity and retire its node to the freelist
    pub(crate) fn remove(&mut self, task: &Arc<TimeoutTask>) {
        if let Some(at) = self
            .queue
            .iter()
            .position(|queued| Arc::ptr_eq(queued, task))
        {
            let node = self.queue.remove(at).expect("position was just found");
            self.release(node);
        }
    }

    /// Retire a node already unlinked from the queue
    pub(crate) fn release(&mut self, task: Arc<TimeoutTask>) {
        self.free.push(task);
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<TimeoutTask>> {
        self.queue.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Drop every queued task and every cached node
    pub(crate) fn clear(&mut self) {
        self.queue.clear();
        self.free.clear();
    }

    /// Freelist garbage collection: when the cache outgrows both the floor
    /// and the live queue, free half the excess without going below the
    /// floor. Returns how many nodes were released.
    pub(crate) fn trim(&mut self) -> usize {
        let free = self.free.len();
        let live = self.queue.len();
        if free <= self.floor || live > free {
            return 0;
        }

        let mut count = free / 2;
        if count > live {
            count = free - live;
        }
        if free - count < self.floor {
            count -= self.floor - (free - count);
        }
        if count == 0 {
            return 0;
        }

        log::debug!(
            "freeing {} recycled timeout nodes, leaving {}",
            count,
            free - count
        );
        self.free.truncate(free - count);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn noop(
        _: &std::sync::Arc<crate::scheduler::Scheduler>,
        _: crate::task::EventMask,
        _: u32,
        _: &TaskContext,
    ) {
    }

    fn queue_with(deadlines: &[Duration]) -> (TimeoutQueue, Instant) {
        let base = Instant::now();
        let mut queue = TimeoutQueue::new(10);
        for delay in deadlines {
            let task = queue.acquire(base + *delay, noop, TaskContext::none());
            queue.insert(task);
        }
        (queue, base)
    }

    #[test]
    fn test_sorted_insertion() {
        let (queue, base) = queue_with(&[
            Duration::from_millis(30),
            Duration::from_millis(10),
            Duration::from_millis(20),
        ]);
        let order: Vec<Instant> = queue.iter().map(|t| t.deadline).collect();
        assert_eq!(
            order,
            vec![
                base + Duration::from_millis(10),
                base + Duration::from_millis(20),
                base + Duration::from_millis(30),
            ]
        );
    }

    #[test]
    fn test_equal_deadlines_keep_fifo_order() {
        let base = Instant::now();
        let mut queue = TimeoutQueue::new(10);
        let deadline = base + Duration::from_millis(5);
        let first = queue.acquire(deadline, noop, TaskContext::new(1u32));
        queue.insert(first.clone());
        let second = queue.acquire(deadline, noop, TaskContext::new(2u32));
        queue.insert(second.clone());
        assert!(Arc::ptr_eq(queue.head().unwrap(), &first));
        queue.remove(&first);
        assert!(Arc::ptr_eq(queue.head().unwrap(), &second));
    }

    #[test]
    fn test_freelist_recycles_unreferenced_nodes() {
        let mut queue = TimeoutQueue::new(10);
        let task = queue.acquire(Instant::now(), noop, TaskContext::none());
        queue.insert(task.clone());
        queue.remove(&task);
        drop(task);
        assert_eq!(queue.free_len(), 1);
        let _again = queue.acquire(Instant::now(), noop, TaskContext::none());
        assert_eq!(queue.free_len(), 0);
    }

    #[test]
    fn test_freelist_skips_nodes_with_live_handles() {
        let mut queue = TimeoutQueue::new(10);
        let task = queue.acquire(Instant::now(), noop, TaskContext::none());
        queue.insert(task.clone());
        queue.remove(&task);
        // `task` still holds a strong reference; the node must not be reused
        let fresh = queue.acquire(Instant::now(), noop, TaskContext::none());
        assert!(!Arc::ptr_eq(&fresh, &task));
        assert_eq!(queue.free_len(), 1);
    }

    #[test]
    fn test_trim_respects_floor_and_live_queue() {
        let mut queue = TimeoutQueue::new(10);

        // Below the floor: nothing happens
        for _ in 0..10 {
            let t = queue.acquire(Instant::now(), noop, TaskContext::none());
            queue.release(t);
        }
        assert_eq!(queue.trim(), 0);
        assert_eq!(queue.free_len(), 10);

        // Grow the freelist well past the floor with an empty live queue
        for _ in 0..20 {
            let t = queue.acquire(Instant::now(), noop, TaskContext::none());
            queue.insert(t.clone());
            queue.remove(&t);
        }
        assert_eq!(queue.free_len(), 30);
        let trimmed = queue.trim();
        assert!(trimmed > 0);
        assert!(queue.free_len() >= 10);
        assert_eq!(queue.free_len(), 30 - trimmed);
    }

    #[test]
    fn test_trim_skipped_when_queue_outnumbers_freelist() {
        let base = Instant::now();
        let mut queue = TimeoutQueue::new(2);
        for i in 0..8 {
            let t = queue.acquire(base + Duration::from_secs(i), noop, TaskContext::none());
            queue.insert(t);
        }
        for _ in 0..4 {
            let t = queue.acquire(base, noop, TaskContext::none());
            queue.release(t);
        }
        // 8 live vs 4 cached: the cache is earning its keep
        assert_eq!(queue.trim(), 0);
    }
}
