//! Blocking primitives the pool is built from: a counting semaphore for the
//! submission queue depth and a startup rendezvous that can be abandoned.

use std::sync::{Condvar, Mutex, MutexGuard};

/// Acquire a mutex, recovering the guard if a thread panicked while holding it.
#[inline]
pub fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Counting semaphore.
#[derive(Debug, Default)]
pub struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    /// Add one permit, waking a single waiter.
    pub fn post(&self) {
        let mut permits = lock_or_recover(&self.permits);
        *permits += 1;
        self.cond.notify_one();
    }

    /// Block until a permit is available, then take it.
    pub fn wait(&self) {
        let guard = lock_or_recover(&self.permits);
        let mut permits = self
            .cond
            .wait_while(guard, |p| *p == 0)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *permits -= 1;
    }

    #[cfg(test)]
    pub fn try_wait(&self) -> bool {
        let mut permits = lock_or_recover(&self.permits);
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    #[cfg(test)]
    pub fn permits(&self) -> usize {
        *lock_or_recover(&self.permits)
    }
}

#[derive(Debug)]
struct RendezvousState {
    arrived: usize,
    abandoned: bool,
}

/// One-shot barrier for `parties` threads.
///
/// Unlike `std::sync::Barrier` it can be abandoned, which releases every
/// waiter with `false`. The pool uses this when a worker fails to spawn after
/// earlier workers are already parked at the rendezvous.
#[derive(Debug)]
pub struct Rendezvous {
    parties: usize,
    state: Mutex<RendezvousState>,
    cond: Condvar,
}

impl Rendezvous {
    pub fn new(parties: usize) -> Self {
        Self {
            parties,
            state: Mutex::new(RendezvousState {
                arrived: 0,
                abandoned: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Wait until all parties arrived (`true`) or the rendezvous was
    /// abandoned (`false`).
    pub fn wait(&self) -> bool {
        let mut state = lock_or_recover(&self.state);
        state.arrived += 1;
        if state.arrived >= self.parties {
            self.cond.notify_all();
            return !state.abandoned;
        }
        let state = self
            .cond
            .wait_while(state, |s| s.arrived < self.parties && !s.abandoned)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        !state.abandoned
    }

    pub fn abandon(&self) {
        let mut state = lock_or_recover(&self.state);
        state.abandoned = true;
        self.cond.notify_all();
    }
}
