#![allow(dead_code)]

use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use pollpool::client::ClientTable;
use pollpool::config::{PoolConfig, ServerConfig};
use pollpool::error::ServerError;
use pollpool::reactor::{Reactor, RequestHandler, ShutdownHandle};
use pollpool::thread_pool::ThreadPool;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn started_pool(workers: usize, max_queued: usize) -> ThreadPool {
    let mut pool = ThreadPool::new(PoolConfig {
        workers,
        max_queued,
    });
    pool.start().expect("pool start");
    pool
}

/// Poll `cond` every millisecond until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

pub fn test_config() -> ServerConfig {
    ServerConfig {
        port: 0,
        workers: 2,
        max_queued: 64,
        client_lifetime: Duration::from_secs(30),
        tick_interval: Duration::from_millis(50),
        max_clients: 4096,
        ..ServerConfig::default()
    }
}

/// A reactor on an ephemeral loopback port, running on its own thread.
pub struct TestServer {
    pub addr: SocketAddr,
    pub clients: Arc<ClientTable>,
    pub pool: Arc<ThreadPool>,
    shutdown: ShutdownHandle,
    thread: Option<JoinHandle<Result<(), ServerError>>>,
}

impl TestServer {
    pub fn start(config: ServerConfig, handler: Arc<dyn RequestHandler>) -> Self {
        let mut pool = ThreadPool::new(config.pool_config());
        pool.start().expect("pool start");
        Self::with_pool(config, Arc::new(pool), handler)
    }

    /// Run over a caller-built pool, started or not.
    pub fn with_pool(
        config: ServerConfig,
        pool: Arc<ThreadPool>,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        init_tracing();
        let listener = Reactor::bind(config.port).expect("bind");
        let reactor = Reactor::new(listener, &config, pool.clone(), handler).expect("reactor");
        let port = reactor.local_addr().expect("local addr").port();
        let shutdown = reactor.shutdown_handle();
        let clients = reactor.clients();
        let thread = std::thread::Builder::new()
            .name("reactor".into())
            .spawn(move || reactor.run())
            .expect("spawn reactor");

        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            clients,
            pool,
            shutdown,
            thread: Some(thread),
        }
    }

    pub fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        stream
    }

    /// Wait for the reactor thread to exit on its own.
    pub fn join(mut self) -> Result<(), ServerError> {
        let thread = self.thread.take().expect("reactor thread");
        let result = thread.join().expect("reactor panicked");
        self.pool.close();
        result
    }

    pub fn stop(self) -> Result<(), ServerError> {
        self.shutdown.shutdown().expect("signal shutdown");
        self.join()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.shutdown.shutdown();
            let _ = thread.join();
            self.pool.close();
        }
    }
}

/// Read until the server closes the connection.
pub fn read_all(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).expect("read to end");
    buf
}
