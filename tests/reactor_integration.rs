//! Reactor over loopback: dispatch, idle eviction, shutdown, and the
//! timeout/dispatch race.

mod common;

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use pollpool::client::Client;
use pollpool::config::{PoolConfig, ServerConfig};
use pollpool::error::ServerError;
use pollpool::reactor::RequestHandler;
use pollpool::thread_pool::ThreadPool;

use common::TestServer;

/// Reads one byte of request, then answers with `reply`.
fn replying(reply: &'static [u8]) -> Arc<dyn RequestHandler> {
    Arc::new(move |mut client: Client| {
        client.set_blocking(true).expect("blocking");
        let mut byte = [0u8; 1];
        client.read_exact(&mut byte).expect("read request");
        client.write_all(reply).expect("write reply");
    })
}

#[test]
fn readable_client_is_handed_to_handler() {
    let server = TestServer::start(common::test_config(), replying(b"hello"));

    let mut stream = server.connect();
    stream.write_all(b"x").expect("send");
    assert_eq!(common::read_all(&mut stream), b"hello");

    assert!(common::wait_until(Duration::from_secs(5), || server.clients.is_empty()));
    assert!(server.clients.timers().is_empty());
    server.stop().expect("clean shutdown");
}

#[test]
fn each_accepted_client_gets_one_timer() {
    let server = TestServer::start(common::test_config(), Arc::new(|_client: Client| {}));

    let streams: Vec<_> = (0..5).map(|_| server.connect()).collect();
    assert!(common::wait_until(Duration::from_secs(5), || server.clients.len() == 5));
    assert_eq!(server.clients.timers().len(), 5);

    drop(streams);
    assert!(common::wait_until(Duration::from_secs(5), || server.clients.is_empty()));
    assert!(server.clients.timers().is_empty());
    server.stop().expect("clean shutdown");
}

#[test]
fn idle_client_is_evicted_after_lifetime() {
    let config = ServerConfig {
        client_lifetime: Duration::from_millis(100),
        tick_interval: Duration::from_millis(50),
        ..common::test_config()
    };
    let server = TestServer::start(config, replying(b"never"));

    let mut stream = server.connect();
    assert!(common::wait_until(Duration::from_secs(5), || server.clients.len() == 1));

    // Closed by the sweep without a response.
    assert!(common::read_all(&mut stream).is_empty());
    assert!(server.clients.is_empty());
    assert!(server.clients.timers().is_empty());
    server.stop().expect("clean shutdown");
}

#[test]
fn in_flight_client_survives_the_sweep() {
    let config = ServerConfig {
        client_lifetime: Duration::from_millis(50),
        tick_interval: Duration::from_millis(20),
        ..common::test_config()
    };
    let handler: Arc<dyn RequestHandler> = Arc::new(|mut client: Client| {
        client.set_blocking(true).expect("blocking");
        let mut byte = [0u8; 1];
        client.read_exact(&mut byte).expect("read request");
        // Several lifetimes and ticks pass while the request is served.
        std::thread::sleep(Duration::from_millis(300));
        client.write_all(b"late").expect("write reply");
    });
    let server = TestServer::start(config, handler);

    let mut stream = server.connect();
    stream.write_all(b"x").expect("send");
    assert_eq!(common::read_all(&mut stream), b"late");
    server.stop().expect("clean shutdown");
}

#[test]
fn handler_sees_peer_hangup() {
    let (tx, rx) = mpsc::channel();
    let tx = std::sync::Mutex::new(tx);
    let handler: Arc<dyn RequestHandler> = Arc::new(move |client: Client| {
        let closed = client.peer_closed().expect("peek");
        let _ = tx.lock().unwrap().send(closed);
    });
    let server = TestServer::start(common::test_config(), handler);

    let stream = server.connect();
    assert!(common::wait_until(Duration::from_secs(5), || server.clients.len() == 1));
    drop(stream);

    let closed = rx.recv_timeout(Duration::from_secs(5)).expect("handler ran");
    assert!(closed);
    assert!(common::wait_until(Duration::from_secs(5), || server.clients.is_empty()));
    server.stop().expect("clean shutdown");
}

#[test]
fn shutdown_closes_idle_clients() {
    let server = TestServer::start(common::test_config(), replying(b"never"));

    let mut stream = server.connect();
    assert!(common::wait_until(Duration::from_secs(5), || server.clients.len() == 1));

    let clients = server.clients.clone();
    server.stop().expect("clean shutdown");
    assert!(common::read_all(&mut stream).is_empty());
    assert!(clients.is_empty());
    assert!(clients.timers().is_empty());
}

#[test]
fn busy_pool_drops_the_client_without_blocking() {
    // Never started, so nothing drains the queue.
    let pool = Arc::new(ThreadPool::new(PoolConfig {
        workers: 1,
        max_queued: 0,
    }));
    let server = TestServer::with_pool(
        common::test_config(),
        pool.clone(),
        Arc::new(|_client: Client| {}),
    );

    let mut first = server.connect();
    first.write_all(b"x").expect("send");
    assert!(common::wait_until(Duration::from_secs(5), || pool.queued() == 1));

    let mut second = server.connect();
    second.write_all(b"x").expect("send");
    let mut buf = Vec::new();
    match second.read_to_end(&mut buf) {
        Ok(_) => assert!(buf.is_empty()),
        Err(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
    }

    assert_eq!(pool.queued(), 1);
    assert!(common::wait_until(Duration::from_secs(5), || server.clients.len() == 1));
    server.stop().expect("clean shutdown");
    drop(first);
}

#[test]
fn client_fd_beyond_table_stops_the_reactor() {
    let config = ServerConfig {
        max_clients: 1,
        ..common::test_config()
    };
    let server = TestServer::start(config, Arc::new(|_client: Client| {}));

    let mut stream = server.connect();
    let result = server.join();
    assert!(matches!(result, Err(ServerError::FdOutOfRange { max: 1, .. })));
    assert!(common::read_all(&mut stream).is_empty());
}

#[test]
fn double_close_from_handler_is_harmless() {
    let (tx, rx) = mpsc::channel();
    let tx = std::sync::Mutex::new(tx);
    let handler: Arc<dyn RequestHandler> = Arc::new(move |client: Client| {
        let id = client.id();
        let first = client.close();
        // Mirrors a late timeout for the same connection.
        let _ = tx.lock().unwrap().send((id, first));
    });
    let server = TestServer::start(common::test_config(), handler);

    let mut stream = server.connect();
    stream.write_all(b"x").expect("send");
    let (id, first) = rx.recv_timeout(Duration::from_secs(5)).expect("handler ran");
    assert!(first);
    assert!(!server.clients.close(id));
    assert!(!server.clients.disarm(id));
    assert!(server.clients.timers().is_empty());
    server.stop().expect("clean shutdown");
}
