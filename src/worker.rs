//! A pool worker: one OS thread draining its private queue.
//!
//! The worker never consults its queue while holding the state lock. How
//! much work is waiting is tracked by `pending`, next to the state, so the
//! park decision needs only that one lock.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::config::SHUTDOWN_POLL_DELAY;
use crate::metrics;
use crate::sync::lock_or_recover;
use crate::thread_pool::Startup;
use crate::work_queue::{Work, WorkQueue};

/// Worker lifecycle: `Booting → Ready → Idle ⇄ Busy → Quit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Thread spawned, not yet synchronized with the pool.
    Booting,
    /// Reported running to the pool.
    Ready,
    /// Queue empty, parked on the wake condition.
    Idle,
    /// Draining its queue.
    Busy,
    Quit,
}

#[derive(Debug)]
struct Parking {
    state: WorkerState,
    /// Items assigned and not yet claimed by the run loop.
    pending: usize,
}

#[derive(Debug)]
pub struct Worker {
    id: usize,
    state: Mutex<Parking>,
    wake: Condvar,
    queue: WorkQueue<Work>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            state: Mutex::new(Parking {
                state: WorkerState::Booting,
                pending: 0,
            }),
            wake: Condvar::new(),
            queue: WorkQueue::new(),
            thread: Mutex::new(None),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        lock_or_recover(&self.state).state
    }

    /// Items waiting in this worker's private queue.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        lock_or_recover(&self.state).state = state;
    }

    pub(crate) fn attach(&self, handle: JoinHandle<()>) {
        *lock_or_recover(&self.thread) = Some(handle);
    }

    /// Queue `work` and wake the worker if it is parked.
    /// Returns true if the worker had to be woken.
    pub(crate) fn assign(&self, work: Work) -> bool {
        self.queue.push(work);
        let mut parking = lock_or_recover(&self.state);
        parking.pending += 1;
        if parking.state == WorkerState::Idle {
            parking.state = WorkerState::Busy;
            self.wake.notify_one();
            return true;
        }
        false
    }

    /// Poke the wake condition without handing over work. Used at shutdown.
    fn poke(&self) {
        let _state = lock_or_recover(&self.state);
        self.wake.notify_all();
    }

    /// Keep signalling until the thread has exited, then reap it.
    /// The pool's active flag must already be cleared.
    pub(crate) fn shutdown(&self) {
        let Some(handle) = lock_or_recover(&self.thread).take() else {
            return;
        };
        while !handle.is_finished() {
            self.poke();
            thread::sleep(SHUTDOWN_POLL_DELAY);
        }
        if handle.join().is_err() {
            tracing::warn!(worker = self.id, "worker thread panicked");
        }
    }

    pub(crate) fn run(&self, active: &AtomicBool, startup: &Startup) {
        startup.report_booted();
        if !startup.rendezvous().wait() {
            self.set_state(WorkerState::Quit);
            return;
        }
        tracing::info!(worker = self.id, thread = ?thread::current().id(), "worker started");

        loop {
            let claimed = {
                let mut parking = lock_or_recover(&self.state);
                if parking.pending == 0 {
                    parking.state = WorkerState::Idle;
                    parking = self
                        .wake
                        .wait_while(parking, |p| {
                            p.state == WorkerState::Idle && active.load(Ordering::Acquire)
                        })
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                if !active.load(Ordering::Acquire) {
                    parking.state = WorkerState::Quit;
                    break;
                }
                parking.state = WorkerState::Busy;
                std::mem::take(&mut parking.pending)
            };

            // Every claimed item was pushed before it was counted.
            for _ in 0..claimed {
                let Some(work) = self.queue.pop() else {
                    break;
                };
                self.execute(work);
                if !active.load(Ordering::Acquire) {
                    break;
                }
            }
        }

        let dropped = self.queue.len();
        tracing::info!(worker = self.id, dropped, "worker exits");
    }

    fn execute(&self, work: Work) {
        let fd = work.fd();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| work.execute())) {
            let msg = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("non-string panic payload");
            tracing::warn!(worker = self.id, ?fd, panic = msg, "work item panicked");
            metrics::inc_work_panicked();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_worker_is_booting_with_empty_queue() {
        let w = Worker::new(3);
        assert_eq!(w.id(), 3);
        assert_eq!(w.state(), WorkerState::Booting);
        assert_eq!(w.queued(), 0);
    }

    #[test]
    fn assign_wakes_only_idle_worker() {
        let w = Worker::new(0);
        w.set_state(WorkerState::Busy);
        assert!(!w.assign(Work::new(|| {})));
        assert_eq!(w.state(), WorkerState::Busy);

        w.set_state(WorkerState::Idle);
        assert!(w.assign(Work::new(|| {})));
        assert_eq!(w.state(), WorkerState::Busy);
        assert_eq!(w.queued(), 2);
    }

    #[test]
    fn assign_counts_pending_items() {
        let w = Worker::new(0);
        w.set_state(WorkerState::Busy);
        w.assign(Work::new(|| {}));
        w.assign(Work::new(|| {}));
        assert_eq!(lock_or_recover(&w.state).pending, 2);
        assert_eq!(w.queued(), 2);
    }

    #[test]
    fn items_assigned_while_busy_are_run_before_parking() {
        use std::sync::Arc;
        use std::sync::atomic::AtomicUsize;

        use crate::thread_pool::Startup;

        let worker = Arc::new(Worker::new(0));
        let active = Arc::new(AtomicBool::new(true));
        let startup = Arc::new(Startup::new(2));
        let ran = Arc::new(AtomicUsize::new(0));

        // Queued before the thread exists; the worker must not park on them.
        for _ in 0..3 {
            let ran = ran.clone();
            worker.assign(Work::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let handle = {
            let (worker, active, startup) = (worker.clone(), active.clone(), startup.clone());
            thread::spawn(move || worker.run(&active, &startup))
        };
        assert!(startup.rendezvous().wait());

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while ran.load(Ordering::SeqCst) < 3 && std::time::Instant::now() < deadline {
            thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(ran.load(Ordering::SeqCst), 3);

        active.store(false, Ordering::Release);
        worker.attach(handle);
        worker.shutdown();
        assert_eq!(worker.state(), WorkerState::Quit);
    }

    #[test]
    fn panicking_item_is_contained() {
        let w = Worker::new(0);
        w.execute(Work::new(|| panic!("boom")));
        w.execute(Work::new(|| {}));
    }

    #[test]
    fn shutdown_without_thread_is_noop() {
        let w = Worker::new(0);
        w.shutdown();
    }
}
