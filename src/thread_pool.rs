//! Fixed-size thread pool: one distributor thread moves submitted work from
//! the global queue to the workers' private queues in round-robin order.
//!
//! Startup runs in a fixed order so nothing is distributed before every worker
//! reached its main loop:
//! 1. the pending-work semaphore starts at zero (at construction),
//! 2. a rendezvous sized `workers + 1` is created,
//! 3. each worker is spawned `Booting`; `start` blocks until it reports
//!    running and then marks it `Ready`,
//! 4. the pool is marked active,
//! 5. the distributor is spawned,
//! 6. `start` joins the rendezvous.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::config::{PoolConfig, SHUTDOWN_POLL_DELAY};
use crate::error::{PoolError, SubmitError};
use crate::metrics;
use crate::sync::{Rendezvous, Semaphore, lock_or_recover};
use crate::work_queue::{Work, WorkQueue};
use crate::worker::{Worker, WorkerState};

/// Boot handshake between `start` and freshly spawned workers.
#[derive(Debug)]
pub(crate) struct Startup {
    booted: Mutex<usize>,
    cond: Condvar,
    rendezvous: Rendezvous,
}

impl Startup {
    pub(crate) fn new(parties: usize) -> Self {
        Self {
            booted: Mutex::new(0),
            cond: Condvar::new(),
            rendezvous: Rendezvous::new(parties),
        }
    }

    pub(crate) fn report_booted(&self) {
        let mut booted = lock_or_recover(&self.booted);
        *booted += 1;
        self.cond.notify_all();
    }

    fn wait_booted(&self, count: usize) {
        let booted = lock_or_recover(&self.booted);
        let _booted = self
            .cond
            .wait_while(booted, |b| *b < count)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
    }

    pub(crate) fn rendezvous(&self) -> &Rendezvous {
        &self.rendezvous
    }
}

/// Wrapping cursor over `len` workers.
#[derive(Debug, Clone)]
pub struct RoundRobin {
    next: usize,
    len: usize,
}

impl RoundRobin {
    pub fn new(len: usize) -> Self {
        assert!(len > 0, "round robin over zero workers");
        Self { next: 0, len }
    }

    pub fn next_index(&mut self) -> usize {
        let idx = self.next;
        self.next += 1;
        if self.next >= self.len {
            self.next = 0;
        }
        idx
    }
}

#[derive(Debug)]
struct Shared {
    queue: WorkQueue<Work>,
    /// Mirrors `queue` depth; the distributor blocks on it.
    pending: Semaphore,
    active: AtomicBool,
    closed: AtomicBool,
    max_queued: usize,
}

#[derive(Debug)]
pub struct ThreadPool {
    config: PoolConfig,
    shared: Arc<Shared>,
    workers: Vec<Arc<Worker>>,
    distributor: Mutex<Option<JoinHandle<()>>>,
    started: bool,
}

impl ThreadPool {
    /// Create a stopped pool. Work submitted before [`start`](Self::start)
    /// waits in the submission queue.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                queue: WorkQueue::new(),
                pending: Semaphore::new(0),
                active: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                max_queued: config.max_queued,
            }),
            workers: Vec::with_capacity(config.workers),
            distributor: Mutex::new(None),
            started: false,
        }
    }

    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }
        if self.started {
            return Err(PoolError::AlreadyStarted);
        }
        let count = self.config.workers;
        if count == 0 {
            return Err(PoolError::NoWorkers);
        }
        self.started = true;

        let startup = Arc::new(Startup::new(count + 1));

        for id in 0..count {
            let worker = Arc::new(Worker::new(id));
            let name = format!("worker-{id}");
            let spawned = thread::Builder::new().name(name.clone()).spawn({
                let worker = worker.clone();
                let shared = self.shared.clone();
                let startup = startup.clone();
                move || worker.run(&shared.active, &startup)
            });
            let handle = match spawned {
                Ok(handle) => handle,
                Err(source) => {
                    self.abort_startup(&startup);
                    return Err(PoolError::Spawn { name, source });
                }
            };
            worker.attach(handle);
            startup.wait_booted(id + 1);
            worker.set_state(WorkerState::Ready);
            self.workers.push(worker);
        }

        self.shared.active.store(true, Ordering::Release);

        let spawned = thread::Builder::new()
            .name("distributor".into())
            .spawn({
                let shared = self.shared.clone();
                let workers = self.workers.clone();
                move || distribute(&shared, &workers)
            });
        match spawned {
            Ok(handle) => *lock_or_recover(&self.distributor) = Some(handle),
            Err(source) => {
                self.abort_startup(&startup);
                return Err(PoolError::Spawn {
                    name: "distributor".into(),
                    source,
                });
            }
        }

        startup.rendezvous().wait();
        tracing::info!(workers = count, max_queued = self.config.max_queued, "thread pool is ready");
        Ok(())
    }

    fn abort_startup(&self, startup: &Startup) {
        self.shared.active.store(false, Ordering::Release);
        self.shared.closed.store(true, Ordering::Release);
        startup.rendezvous().abandon();
        for worker in &self.workers {
            worker.shutdown();
        }
    }

    /// Hand `work` to the pool. Rejects instead of blocking when the
    /// submission queue already holds more than the configured maximum.
    pub fn submit(&self, work: Work) -> Result<(), SubmitError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(SubmitError::Closed);
        }
        let queued = self.shared.queue.len();
        if queued > self.shared.max_queued {
            tracing::warn!(queued, max = self.shared.max_queued, "thread pool is busy");
            metrics::inc_rejected_busy();
            return Err(SubmitError::Busy {
                queued,
                max: self.shared.max_queued,
            });
        }
        self.shared.queue.push(work);
        self.shared.pending.post();
        metrics::update_queued(queued + 1);
        Ok(())
    }

    /// Stop the distributor and every worker and wait for their threads to
    /// exit. Work still queued is dropped. Terminal and idempotent; callers
    /// must stop submitting first.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.active.store(false, Ordering::Release);
        self.shared.pending.post();

        if let Some(handle) = lock_or_recover(&self.distributor).take() {
            while !handle.is_finished() {
                thread::sleep(SHUTDOWN_POLL_DELAY);
            }
            if handle.join().is_err() {
                tracing::warn!("distributor thread panicked");
            }
        }

        for worker in &self.workers {
            worker.shutdown();
        }
        tracing::info!(
            dropped = self.shared.queue.len(),
            "thread pool is closed"
        );
    }

    pub fn worker_count(&self) -> usize {
        self.config.workers
    }

    /// Depth of the submission queue (not counting worker queues).
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.workers.iter().map(|w| w.state()).collect()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.close();
    }
}

fn distribute(shared: &Shared, workers: &[Arc<Worker>]) {
    tracing::info!(thread = ?thread::current().id(), "distributor started");
    let mut cursor = RoundRobin::new(workers.len());

    loop {
        shared.pending.wait();
        if !shared.active.load(Ordering::Acquire) {
            break;
        }
        let Some(work) = shared.queue.pop() else {
            tracing::warn!("pending count out of step with submission queue");
            continue;
        };
        let worker = &workers[cursor.next_index()];
        if worker.assign(work) {
            tracing::trace!(worker = worker.id(), "woke idle worker");
        }
    }
    tracing::info!("distributor exits");
}
