//! The poll loop: accepts connections, arms their idle timers, and hands each
//! readable connection to the thread pool.
//!
//! Per iteration the reactor waits on one epoll instance holding the
//! listener, the wake eventfd, the periodic tick timerfd, and every idle
//! client. A client is removed from the poll set and its timer disarmed
//! before its work is submitted, so each connection has at most one handler
//! in flight and the tick sweep only ever evicts idle connections.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};

use crate::client::{Client, ClientTable};
use crate::config::{LISTEN_BACKLOG, MAX_EVENTS, ServerConfig};
use crate::error::{ServerError, SubmitError};
use crate::metrics;
use crate::sys::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLRDHUP, Epoll, EventFd, Events, TimerFd};
use crate::thread_pool::ThreadPool;
use crate::work_queue::Work;

/// Serves one dispatched connection on a worker thread. The handler owns the
/// connection from here on; dropping the [`Client`] closes it.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, client: Client);
}

impl<F> RequestHandler for F
where
    F: Fn(Client) + Send + Sync + 'static,
{
    fn handle(&self, client: Client) {
        self(client)
    }
}

/// Asks a running reactor to stop after its current iteration.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    wake: Arc<EventFd>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) -> io::Result<()> {
        self.wake.signal()
    }

    /// The wake eventfd, for signal handlers that may only call `write(2)`.
    /// Stays open as long as this handle is alive.
    pub fn raw_fd(&self) -> RawFd {
        self.wake.as_raw_fd()
    }
}

pub struct Reactor {
    poller: Epoll,
    listener: Socket,
    wake: Arc<EventFd>,
    tick: TimerFd,
    clients: Arc<ClientTable>,
    pool: Arc<ThreadPool>,
    handler: Arc<dyn RequestHandler>,
    client_lifetime: Duration,
}

impl Reactor {
    /// Non-blocking listener on `0.0.0.0:port`. Port 0 picks a free port.
    pub fn bind(port: u16) -> Result<Socket, ServerError> {
        let bind_err = |source| ServerError::Bind { port, source };
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;
        socket.set_reuse_address(true).map_err(bind_err)?;
        socket.set_nonblocking(true).map_err(bind_err)?;
        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        socket.bind(&addr.into()).map_err(bind_err)?;
        socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;
        Ok(socket)
    }

    /// `listener` must already be listening and non-blocking, as returned by
    /// [`bind`](Self::bind).
    pub fn new(
        listener: Socket,
        config: &ServerConfig,
        pool: Arc<ThreadPool>,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Self, ServerError> {
        let poller = Epoll::new().map_err(ServerError::Poller)?;
        let wake = Arc::new(EventFd::new().map_err(ServerError::EventFd)?);
        let tick = TimerFd::periodic(config.tick_interval).map_err(ServerError::TimerFd)?;

        for fd in [listener.as_raw_fd(), wake.as_raw_fd(), tick.as_raw_fd()] {
            poller.add(fd, EPOLLIN).map_err(ServerError::Poller)?;
        }

        Ok(Self {
            poller,
            listener,
            wake,
            tick,
            clients: Arc::new(ClientTable::new(config.max_clients)),
            pool,
            handler,
            client_lifetime: config.client_lifetime,
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            wake: self.wake.clone(),
        }
    }

    pub fn clients(&self) -> Arc<ClientTable> {
        self.clients.clone()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::other("listener is not an inet socket"))
    }

    /// Drive the loop until a shutdown is requested or a fatal error occurs.
    /// Either way the listener is closed and idle clients are evicted on the
    /// way out; connections already dispatched stay with their handlers.
    pub fn run(self) -> Result<(), ServerError> {
        tracing::info!(
            addr = ?self.local_addr().ok(),
            max_clients = self.clients.capacity(),
            "reactor running"
        );
        let result = self.poll_loop();
        if let Err(e) = &result {
            tracing::error!(error = %e, "reactor loop failed");
        }

        let evicted = self.clients.close_all();
        tracing::info!(evicted, "reactor stopped");
        result
    }

    fn poll_loop(&self) -> Result<(), ServerError> {
        let mut events = Events::with_capacity(MAX_EVENTS);
        let listen_fd = self.listener.as_raw_fd();
        let wake_fd = self.wake.as_raw_fd();
        let tick_fd = self.tick.as_raw_fd();

        loop {
            self.poller.wait(&mut events, None).map_err(ServerError::Wait)?;

            let mut ticked = false;
            let mut stop = false;
            for (fd, flags) in events.iter() {
                if fd == listen_fd {
                    self.accept_one()?;
                } else if fd == tick_fd {
                    if let Err(e) = self.tick.drain() {
                        tracing::warn!(error = %e, "failed to drain tick timer");
                    }
                    ticked = true;
                } else if fd == wake_fd {
                    let count = self.wake.drain().unwrap_or(0);
                    tracing::info!(count, "shutdown requested");
                    stop = true;
                } else if flags & EPOLLIN != 0 {
                    self.dispatch(fd);
                } else if flags & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) != 0 {
                    self.hang_up(fd);
                } else {
                    tracing::warn!(fd, flags, "unexpected epoll event");
                }
            }

            if ticked {
                let evicted = self.clients.sweep(Instant::now());
                tracing::debug!(evicted, idle = self.clients.timers().len(), "tick");
            }
            if stop {
                return Ok(());
            }
        }
    }

    /// Accept a single pending connection. Accept failures are skipped; only a
    /// client fd beyond the table is fatal.
    fn accept_one(&self) -> Result<(), ServerError> {
        let (socket, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                metrics::inc_accept_errors();
                return Ok(());
            }
        };
        if let Err(e) = socket.set_nonblocking(true) {
            tracing::warn!(error = %e, "failed to make client non-blocking");
            return Ok(());
        }

        // Out-of-range fds are closed when `socket` drops.
        let fd = socket.as_raw_fd();
        let deadline = Instant::now() + self.client_lifetime;
        let id = self.clients.admit(fd, deadline)?;
        let _ = socket.into_raw_fd();
        if let Err(e) = self.poller.add(fd, EPOLLIN | EPOLLRDHUP) {
            tracing::warn!(fd, error = %e, "failed to register client");
            self.clients.close(id);
            return Ok(());
        }
        metrics::inc_accepted();
        tracing::debug!(fd, serial = id.serial(), peer = ?peer.as_socket(), "client accepted");
        Ok(())
    }

    fn dispatch(&self, fd: RawFd) {
        if let Err(e) = self.poller.delete(fd) {
            tracing::warn!(fd, error = %e, "failed to deregister client");
        }
        let Some(id) = self.clients.lookup(fd) else {
            tracing::warn!(fd, "readiness for unknown client");
            return;
        };
        self.clients.disarm(id);

        let client = self.clients.client(id);
        let handler = self.handler.clone();
        match self.pool.submit(Work::for_fd(fd, move || handler.handle(client))) {
            Ok(()) => {
                metrics::inc_dispatched();
                tracing::debug!(fd, serial = id.serial(), "client dispatched");
            }
            // The rejected work item owned the client; dropping it closed the
            // connection.
            Err(SubmitError::Busy { queued, .. }) => {
                tracing::warn!(fd, queued, "dropping client, thread pool is busy");
            }
            Err(SubmitError::Closed) => {
                tracing::warn!(fd, "dropping client, thread pool is closed");
            }
        }
    }

    fn hang_up(&self, fd: RawFd) {
        if let Err(e) = self.poller.delete(fd) {
            tracing::warn!(fd, error = %e, "failed to deregister client");
        }
        if let Some(id) = self.clients.lookup(fd) {
            self.clients.close(id);
            tracing::debug!(fd, "peer hung up");
        }
    }
}
