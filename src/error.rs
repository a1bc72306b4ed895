use std::io;
use std::path::PathBuf;
use std::os::unix::io::RawFd;

/// Rejection from [`ThreadPool::submit`](crate::thread_pool::ThreadPool::submit).
/// Neither variant blocks the caller.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// Backpressure: the submission queue already holds more than `max` items.
    #[error("thread pool is busy ({queued} queued, max {max})")]
    Busy { queued: usize, max: usize },
    #[error("thread pool is closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("thread pool needs at least one worker")]
    NoWorkers,
    #[error("thread pool already started")]
    AlreadyStarted,
    #[error("thread pool is closed and cannot be restarted")]
    Closed,
    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to set up listener on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("failed to load document root {}: {source}", path.display())]
    DocumentRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to create epoll instance: {0}")]
    Poller(#[source] io::Error),
    #[error("failed to create wake eventfd: {0}")]
    EventFd(#[source] io::Error),
    #[error("failed to create tick timerfd: {0}")]
    TimerFd(#[source] io::Error),
    #[error("client fd {fd} exceeds the connection table size {max}")]
    FdOutOfRange { fd: RawFd, max: usize },
    #[error("epoll wait failed: {0}")]
    Wait(#[source] io::Error),
    #[error(transparent)]
    Pool(#[from] PoolError),
}
