//! Server sizing and operational configuration.
//!
//! Fixed limits are compile-time constants; the values an operator may change
//! live in [`ServerConfig`] and are read once at startup.

use std::path::PathBuf;
use std::time::Duration;

/// Max events returned by one `epoll_wait`.
pub const MAX_EVENTS: usize = 255;

/// Size of the fd→timer table. A client fd at or above this value is a fatal
/// configuration violation.
pub const MAX_CLIENTS: usize = 10000;

/// Pending connections the kernel may queue on the listener.
pub const LISTEN_BACKLOG: i32 = 10000;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_WORKERS: usize = 4;

/// Submission queue depth above which `submit` reports the pool busy.
pub const DEFAULT_MAX_QUEUED: usize = 10000;

/// How long an accepted connection may wait for its first request.
pub const CLIENT_LIFETIME: Duration = Duration::from_secs(5);

/// Period of the timer sweep.
pub const TICK_INTERVAL: Duration = Duration::from_secs(2);

/// Sleep between liveness probes while the pool waits for its threads to exit.
pub const SHUTDOWN_POLL_DELAY: Duration = Duration::from_micros(2);

pub const DEFAULT_DOCUMENT_ROOT: &str = "doc";
pub const DEFAULT_FILE: &str = "index.html";

const _: () = assert!(MAX_CLIENTS <= i32::MAX as usize, "fds are i32");
const _: () = assert!(MAX_EVENTS <= i32::MAX as usize, "epoll_wait takes an i32 count");

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub workers: usize,
    pub max_queued: usize,
    pub client_lifetime: Duration,
    pub tick_interval: Duration,
    pub max_clients: usize,
    pub document_root: PathBuf,
    pub default_file: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            workers: DEFAULT_WORKERS,
            max_queued: DEFAULT_MAX_QUEUED,
            client_lifetime: CLIENT_LIFETIME,
            tick_interval: TICK_INTERVAL,
            max_clients: MAX_CLIENTS,
            document_root: PathBuf::from(DEFAULT_DOCUMENT_ROOT),
            default_file: DEFAULT_FILE.to_string(),
        }
    }
}

impl ServerConfig {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.workers,
            max_queued: self.max_queued,
        }
    }
}

/// Thread pool sizing. The worker count is fixed for the pool's lifetime.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub workers: usize,
    pub max_queued: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            max_queued: DEFAULT_MAX_QUEUED,
        }
    }
}
