//! Library crate for pollpool: an epoll reactor that accepts connections and
//! hands readable ones to a fixed-size thread pool, plus the static-file HTTP
//! handler the binary serves with.
//!
//! The **binary** (`main.rs`) owns process concerns: CLI parsing, logging
//! setup, and the signal handler that wakes the reactor. Everything here is
//! free of process-wide state, so the pool and reactor can be driven from
//! tests over loopback sockets.

pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod reactor;
pub mod sync;
pub mod sys;
pub mod thread_pool;
pub mod timer_queue;
pub mod work_queue;
pub mod worker;

pub use client::{Client, ClientId, ClientTable};
pub use config::{PoolConfig, ServerConfig};
pub use error::{PoolError, ServerError, SubmitError};
pub use reactor::{Reactor, RequestHandler, ShutdownHandle};
pub use thread_pool::ThreadPool;
pub use work_queue::{Work, WorkQueue};
pub use worker::WorkerState;
