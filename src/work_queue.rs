//! Mutex-guarded FIFO used both as the pool-wide submission queue and as each
//! worker's private queue.

use std::collections::VecDeque;
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::Mutex;

use crate::sync::lock_or_recover;

/// A deferred unit of execution, consumed exactly once.
///
/// Work created for a connection carries its fd so logs can name it.
pub struct Work {
    fd: Option<RawFd>,
    func: Box<dyn FnOnce() + Send + 'static>,
}

impl Work {
    pub fn new<F>(func: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            fd: None,
            func: Box::new(func),
        }
    }

    pub fn for_fd<F>(fd: RawFd, func: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            fd: Some(fd),
            func: Box::new(func),
        }
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.fd
    }

    pub fn execute(self) {
        (self.func)()
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Work").field("fd", &self.fd).finish_non_exhaustive()
    }
}

/// Thread-safe FIFO. The length lives with the items under the same lock, so
/// `len` never disagrees with what `pop` would return.
#[derive(Debug)]
pub struct WorkQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, item: T) {
        lock_or_recover(&self.items).push_back(item);
    }

    /// Remove the oldest item, or `None` if the queue is empty.
    pub fn pop(&self) -> Option<T> {
        lock_or_recover(&self.items).pop_front()
    }

    pub fn is_empty(&self) -> bool {
        lock_or_recover(&self.items).is_empty()
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.items).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn pops_in_push_order() {
        let q = WorkQueue::new();
        q.push('A');
        q.push('B');
        q.push('C');
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop(), Some('A'));
        assert_eq!(q.pop(), Some('B'));
        assert_eq!(q.pop(), Some('C'));
        assert_eq!(q.pop(), None);
        assert!(q.is_empty());
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn work_runs_its_closure_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let q = WorkQueue::new();
        let h = hits.clone();
        q.push(Work::for_fd(9, move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        let work = q.pop().expect("work queued");
        assert_eq!(work.fd(), Some(9));
        work.execute();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(q.pop().is_none());
    }

    #[test]
    fn concurrent_pushes_are_all_delivered_once() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 1000;
        let q = Arc::new(WorkQueue::new());
        let producers: Vec<_> = (0..THREADS)
            .map(|t| {
                let q = q.clone();
                thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        q.push(t * PER_THREAD + i);
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().expect("producer panicked");
        }
        assert_eq!(q.len(), THREADS * PER_THREAD);

        let mut seen = vec![false; THREADS * PER_THREAD];
        let mut last_per_thread = [None; THREADS];
        while let Some(v) = q.pop() {
            assert!(!seen[v], "duplicate delivery of {v}");
            seen[v] = true;
            // Per-producer order is preserved.
            let t = v / PER_THREAD;
            if let Some(prev) = last_per_thread[t] {
                assert!(v > prev);
            }
            last_per_thread[t] = Some(v);
        }
        assert!(seen.iter().all(|s| *s));
    }
}
