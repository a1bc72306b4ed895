//! Idle-connection timers ordered by deadline, soonest first.
//!
//! Timers live in a slab-backed doubly linked list so a [`TimerHandle`] can
//! unlink its timer in O(1). Each insert stamps the node with a fresh
//! generation; a handle whose generation no longer matches (the timer was
//! removed, popped, or its slot reused) is stale and removing it is a no-op.
//!
//! Insertion scans from the front, O(n) in the number of live timers. That is
//! fine at one insert per accepted connection; a heap keyed by
//! `(deadline, generation)` would make it O(log n) behind the same API.

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::Mutex;
use std::time::Instant;

use slab::Slab;

use crate::sync::lock_or_recover;

pub type ExpiryCallback = Box<dyn FnOnce(&Timer) + Send + 'static>;

/// One connection's idle deadline.
pub struct Timer {
    fd: RawFd,
    deadline: Instant,
    on_expire: Option<ExpiryCallback>,
}

impl Timer {
    pub fn new<F>(fd: RawFd, deadline: Instant, on_expire: F) -> Self
    where
        F: FnOnce(&Timer) + Send + 'static,
    {
        Self {
            fd,
            deadline,
            on_expire: Some(Box::new(on_expire)),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Run the expiry callback. The timer must already be out of its queue.
    pub fn expire(mut self) {
        if let Some(cb) = self.on_expire.take() {
            cb(&self);
        }
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("fd", &self.fd)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// Position of an inserted timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    key: usize,
    generation: u64,
}

/// What `peek_min` reports about the earliest timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerInfo {
    pub handle: TimerHandle,
    pub fd: RawFd,
    pub deadline: Instant,
}

struct Node {
    timer: Timer,
    generation: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Default)]
struct TimerList {
    nodes: Slab<Node>,
    head: Option<usize>,
    tail: Option<usize>,
    next_generation: u64,
}

impl TimerList {
    fn insert(&mut self, timer: Timer) -> TimerHandle {
        // First node with a strictly later deadline; equal deadlines keep
        // insertion order.
        let mut cursor = self.head;
        while let Some(key) = cursor {
            if timer.deadline < self.nodes[key].timer.deadline {
                break;
            }
            cursor = self.nodes[key].next;
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let (prev, next) = match cursor {
            Some(at) => (self.nodes[at].prev, Some(at)),
            None => (self.tail, None),
        };
        let key = self.nodes.insert(Node {
            timer,
            generation,
            prev,
            next,
        });
        match prev {
            Some(p) => self.nodes[p].next = Some(key),
            None => self.head = Some(key),
        }
        match next {
            Some(n) => self.nodes[n].prev = Some(key),
            None => self.tail = Some(key),
        }
        TimerHandle { key, generation }
    }

    fn unlink(&mut self, key: usize) -> Timer {
        let node = self.nodes.remove(key);
        match node.prev {
            Some(p) => self.nodes[p].next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(n) => self.nodes[n].prev = node.prev,
            None => self.tail = node.prev,
        }
        node.timer
    }

    fn remove(&mut self, handle: TimerHandle) -> Option<Timer> {
        match self.nodes.get(handle.key) {
            Some(node) if node.generation == handle.generation => Some(self.unlink(handle.key)),
            _ => None,
        }
    }

    fn peek(&self) -> Option<TimerInfo> {
        let key = self.head?;
        let node = &self.nodes[key];
        Some(TimerInfo {
            handle: TimerHandle {
                key,
                generation: node.generation,
            },
            fd: node.timer.fd,
            deadline: node.timer.deadline,
        })
    }
}

/// Deadline-ordered timer collection shared by the reactor (insert, sweep)
/// and the workers (remove on close). Every operation takes the one lock.
pub struct TimerQueue {
    list: Mutex<TimerList>,
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue")
            .field("len", &self.len())
            .finish()
    }
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            list: Mutex::new(TimerList::default()),
        }
    }

    pub fn insert(&self, timer: Timer) -> TimerHandle {
        lock_or_recover(&self.list).insert(timer)
    }

    /// Take the timer out of the queue. `None` if the handle is stale.
    pub fn remove(&self, handle: TimerHandle) -> Option<Timer> {
        lock_or_recover(&self.list).remove(handle)
    }

    pub fn peek_min(&self) -> Option<TimerInfo> {
        lock_or_recover(&self.list).peek()
    }

    /// Remove and return the earliest timer.
    pub fn pop(&self) -> Option<Timer> {
        let mut list = lock_or_recover(&self.list);
        let key = list.head?;
        Some(list.unlink(key))
    }

    /// Remove and return the earliest timer if its deadline is at or before
    /// `now`. Peek and removal happen under one lock acquisition.
    pub fn pop_expired(&self, now: Instant) -> Option<Timer> {
        let mut list = lock_or_recover(&self.list);
        let key = list.head?;
        if list.nodes[key].timer.deadline > now {
            return None;
        }
        Some(list.unlink(key))
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.list).nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        lock_or_recover(&self.list).head.is_none()
    }
}
