//! Task handoff queues consumed by the reactor thread.
//!
//! Immediate tasks flow through a lock-free multi-producer queue; any thread
//! may enqueue, only the reactor thread pops. Ordering across producers is
//! best-effort FIFO. Scheduled tasks live in a deadline-ordered heap that is
//! touched exclusively by the reactor thread; foreign threads reach it by
//! enqueueing an immediate task that performs the insertion.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;

use crate::reactor::Reactor;

/// A unit of work executed on the reactor thread.
pub type ReactorTask = Box<dyn FnOnce(&mut Reactor) + Send + 'static>;

/// Lock-free FIFO of immediate tasks.
pub(crate) struct TaskQueue {
    queue: SegQueue<ReactorTask>,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: SegQueue::new(),
        }
    }

    pub(crate) fn push(&self, task: ReactorTask) {
        self.queue.push(task);
    }

    pub(crate) fn pop(&self) -> Option<ReactorTask> {
        self.queue.pop()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

struct Scheduled {
    deadline: Instant,
    seq: u64,
    task: ReactorTask,
}

// Order by deadline ascending, ties broken by submission sequence. The heap
// is a max-heap, so comparisons are reversed.
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

/// Deadline-ordered queue of delayed tasks, owned by the reactor thread.
pub(crate) struct ScheduledQueue {
    heap: BinaryHeap<Scheduled>,
    next_seq: u64,
}

impl ScheduledQueue {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub(crate) fn schedule(&mut self, deadline: Instant, task: ReactorTask) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Scheduled {
            deadline,
            seq,
            task,
        });
    }

    /// Pops the nearest task if its deadline has been reached.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<ReactorTask> {
        if self.heap.peek()?.deadline > now {
            return None;
        }
        self.heap.pop().map(|scheduled| scheduled.task)
    }

    /// True if at least one task is due at `now`.
    pub(crate) fn has_due(&self, now: Instant) -> bool {
        self.heap
            .peek()
            .is_some_and(|scheduled| scheduled.deadline <= now)
    }

    /// Time until the nearest deadline, zero if already due.
    pub(crate) fn next_delay(&self, now: Instant) -> Option<Duration> {
        self.heap
            .peek()
            .map(|scheduled| scheduled.deadline.saturating_duration_since(now))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
