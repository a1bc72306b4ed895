use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use pollpool::config::{self, ServerConfig};
use pollpool::http::StaticFileHandler;
use pollpool::reactor::{Reactor, ShutdownHandle};
use pollpool::thread_pool::ThreadPool;
use pollpool::{ServerError, metrics, sys};

#[derive(Parser)]
#[command(about = "Static-file HTTP server on an epoll reactor and a fixed thread pool")]
struct Args {
    /// Port to listen on (0 picks a free port)
    #[arg(short, long, default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// Worker threads in the pool
    #[arg(short, long, default_value_t = config::DEFAULT_WORKERS)]
    workers: usize,

    /// Submission queue depth above which new requests are dropped
    #[arg(long, default_value_t = config::DEFAULT_MAX_QUEUED)]
    max_queued: usize,

    /// Seconds an idle connection may wait for its first request
    #[arg(long, default_value_t = config::CLIENT_LIFETIME.as_secs())]
    lifetime: u64,

    /// Seconds between idle-connection sweeps
    #[arg(long, default_value_t = config::TICK_INTERVAL.as_secs())]
    tick: u64,

    /// Directory served as the document root
    #[arg(short, long, default_value = config::DEFAULT_DOCUMENT_ROOT)]
    root: PathBuf,

    /// File served for `/` and directory URLs
    #[arg(long, default_value = config::DEFAULT_FILE)]
    default_file: String,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        ServerConfig {
            port: args.port,
            workers: args.workers,
            max_queued: args.max_queued,
            client_lifetime: Duration::from_secs(args.lifetime),
            tick_interval: Duration::from_secs(args.tick),
            document_root: args.root,
            default_file: args.default_file,
            ..ServerConfig::default()
        }
    }
}

/// Wake eventfd of the running reactor, -1 before it exists.
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handle_signal(_sig: libc::c_int) {
    let fd = WAKE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let _ = sys::signal_raw(fd);
    }
}

fn install_signal_handlers(shutdown: &ShutdownHandle) {
    WAKE_FD.store(shutdown.raw_fd(), Ordering::Relaxed);
    let handler = handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn run(config: ServerConfig) -> Result<(), ServerError> {
    let handler = StaticFileHandler::load(&config.document_root, &config.default_file)
        .map_err(|source| ServerError::DocumentRoot {
            path: config.document_root.clone(),
            source,
        })?;

    let listener = Reactor::bind(config.port)?;

    let mut pool = ThreadPool::new(config.pool_config());
    pool.start()?;
    let pool = Arc::new(pool);

    let reactor = Reactor::new(listener, &config, pool.clone(), Arc::new(handler))?;
    let shutdown = reactor.shutdown_handle();
    install_signal_handlers(&shutdown);

    tracing::info!(
        addr = ?reactor.local_addr().ok(),
        workers = config.workers,
        lifetime = ?config.client_lifetime,
        "pollpool: ready"
    );
    let result = reactor.run();

    pool.close();
    WAKE_FD.store(-1, Ordering::Relaxed);
    drop(shutdown);
    result
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_names(true)
        .init();

    let config = ServerConfig::from(Args::parse());
    metrics::spawn_reporter();

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "pollpool: fatal");
            ExitCode::FAILURE
        }
    }
}
