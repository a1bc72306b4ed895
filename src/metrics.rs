#[cfg(feature = "metrics")]
mod imp {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    // Connection lifecycle (cumulative counts)
    static ACCEPTED: AtomicU64 = AtomicU64::new(0);
    static DISPATCHED: AtomicU64 = AtomicU64::new(0);
    static TIMED_OUT: AtomicU64 = AtomicU64::new(0);
    static CLOSED: AtomicU64 = AtomicU64::new(0);
    // Backpressure
    static REJECTED_BUSY: AtomicU64 = AtomicU64::new(0);
    static ACCEPT_ERRORS: AtomicU64 = AtomicU64::new(0);
    // Handler outcomes
    static RESPONSES_SENT: AtomicU64 = AtomicU64::new(0);
    static WORK_PANICKED: AtomicU64 = AtomicU64::new(0);
    // Gauges
    static QUEUED_MAX: AtomicUsize = AtomicUsize::new(0);

    #[derive(Debug, Clone, Copy)]
    pub struct MetricsSnapshot {
        pub accepted: u64,
        pub dispatched: u64,
        pub timed_out: u64,
        pub closed: u64,
        pub rejected_busy: u64,
        pub accept_errors: u64,
        pub responses_sent: u64,
        pub work_panicked: u64,
        pub queued_max: usize,
    }

    pub fn inc_accepted() {
        ACCEPTED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dispatched() {
        DISPATCHED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_timed_out() {
        TIMED_OUT.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_closed() {
        CLOSED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rejected_busy() {
        REJECTED_BUSY.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_accept_errors() {
        ACCEPT_ERRORS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_responses_sent() {
        RESPONSES_SENT.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_work_panicked() {
        WORK_PANICKED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_queued(value: usize) {
        let mut prev = QUEUED_MAX.load(Ordering::Relaxed);
        while value > prev {
            match QUEUED_MAX.compare_exchange_weak(prev, value, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(next) => prev = next,
            }
        }
    }

    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            accepted: ACCEPTED.load(Ordering::Relaxed),
            dispatched: DISPATCHED.load(Ordering::Relaxed),
            timed_out: TIMED_OUT.load(Ordering::Relaxed),
            closed: CLOSED.load(Ordering::Relaxed),
            rejected_busy: REJECTED_BUSY.load(Ordering::Relaxed),
            accept_errors: ACCEPT_ERRORS.load(Ordering::Relaxed),
            responses_sent: RESPONSES_SENT.load(Ordering::Relaxed),
            work_panicked: WORK_PANICKED.load(Ordering::Relaxed),
            queued_max: QUEUED_MAX.load(Ordering::Relaxed),
        }
    }

    pub fn spawn_reporter() {
        const INTERVAL_SECS: u64 = 10;
        let spawned = std::thread::Builder::new()
            .name("metrics".into())
            .spawn(|| {
                let mut last = snapshot();
                loop {
                    std::thread::sleep(Duration::from_secs(INTERVAL_SECS));
                    let snap = snapshot();
                    tracing::info!(
                        interval_secs = INTERVAL_SECS,
                        accepted = snap.accepted.saturating_sub(last.accepted),
                        dispatched = snap.dispatched.saturating_sub(last.dispatched),
                        sent = snap.responses_sent.saturating_sub(last.responses_sent),
                        timed_out = snap.timed_out.saturating_sub(last.timed_out),
                        closed = snap.closed.saturating_sub(last.closed),
                        busy = snap.rejected_busy.saturating_sub(last.rejected_busy),
                        accept_errors = snap.accept_errors.saturating_sub(last.accept_errors),
                        panics = snap.work_panicked.saturating_sub(last.work_panicked),
                        queued_max = snap.queued_max,
                        "metrics delta"
                    );
                    last = snap;
                }
            });
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "failed to spawn metrics reporter");
        }
    }
}

#[cfg(not(feature = "metrics"))]
#[allow(dead_code)]
mod imp {
    #[derive(Debug, Clone, Copy)]
    pub struct MetricsSnapshot {
        pub accepted: u64,
        pub dispatched: u64,
        pub timed_out: u64,
        pub closed: u64,
        pub rejected_busy: u64,
        pub accept_errors: u64,
        pub responses_sent: u64,
        pub work_panicked: u64,
        pub queued_max: usize,
    }

    pub fn inc_accepted() {}
    pub fn inc_dispatched() {}
    pub fn inc_timed_out() {}
    pub fn inc_closed() {}
    pub fn inc_rejected_busy() {}
    pub fn inc_accept_errors() {}
    pub fn inc_responses_sent() {}
    pub fn inc_work_panicked() {}
    pub fn update_queued(_: usize) {}
    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            accepted: 0,
            dispatched: 0,
            timed_out: 0,
            closed: 0,
            rejected_busy: 0,
            accept_errors: 0,
            responses_sent: 0,
            work_panicked: 0,
            queued_max: 0,
        }
    }
    pub fn spawn_reporter() {}
}

pub use imp::*;
