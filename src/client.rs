//! Accepted connections: the fd-indexed table that ties each client to its
//! idle timer, and the [`Client`] handle a request handler receives.
//!
//! Every close goes through [`ClientTable::close`]. A close only acts if the
//! slot still holds the same [`ClientId`] serial, so closing twice, or closing
//! a stale id after the fd number was reused, is a no-op.

use std::fmt;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use socket2::SockRef;

use crate::error::ServerError;
use crate::metrics;
use crate::sync::lock_or_recover;
use crate::timer_queue::{Timer, TimerHandle, TimerQueue};

/// One accepted connection: its fd plus a serial unique per accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId {
    fd: RawFd,
    serial: u64,
}

impl ClientId {
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }
}

#[derive(Debug)]
struct Slot {
    serial: u64,
    /// `None` once disarmed for dispatch or popped by the sweep.
    timer: Option<TimerHandle>,
}

pub struct ClientTable {
    slots: Box<[Mutex<Option<Slot>>]>,
    timers: TimerQueue,
    next_serial: AtomicU64,
    live: AtomicUsize,
}

impl fmt::Debug for ClientTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTable")
            .field("capacity", &self.slots.len())
            .field("live", &self.len())
            .field("timers", &self.timers)
            .finish()
    }
}

impl ClientTable {
    /// Table for fds `0..max_clients`.
    pub fn new(max_clients: usize) -> Self {
        Self {
            slots: (0..max_clients).map(|_| Mutex::new(None)).collect(),
            timers: TimerQueue::new(),
            next_serial: AtomicU64::new(0),
            live: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Connections admitted and not yet closed.
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn timers(&self) -> &TimerQueue {
        &self.timers
    }

    fn slot(&self, fd: RawFd) -> Option<&Mutex<Option<Slot>>> {
        usize::try_from(fd).ok().and_then(|i| self.slots.get(i))
    }

    /// Record a freshly accepted fd and arm its idle timer for `deadline`.
    /// On success the table owns the fd; on error the caller still does.
    pub fn admit(self: &Arc<Self>, fd: RawFd, deadline: Instant) -> Result<ClientId, ServerError> {
        let slot = self.slot(fd).ok_or(ServerError::FdOutOfRange {
            fd,
            max: self.capacity(),
        })?;
        let id = ClientId {
            fd,
            serial: self.next_serial.fetch_add(1, Ordering::Relaxed),
        };

        let table = Arc::downgrade(self);
        let handle = self.timers.insert(Timer::new(fd, deadline, move |timer| {
            let Some(table) = table.upgrade() else {
                return;
            };
            if table.close(id) {
                tracing::debug!(fd = timer.fd(), "idle client timed out");
                metrics::inc_timed_out();
            }
        }));

        let previous = lock_or_recover(slot).replace(Slot {
            serial: id.serial,
            timer: Some(handle),
        });
        match previous {
            // The fd was closed behind the table's back; the number now
            // belongs to this connection, so only drop the old timer.
            Some(stale) => {
                tracing::warn!(fd, "replacing stale client entry");
                if let Some(h) = stale.timer {
                    self.timers.remove(h);
                }
            }
            None => {
                self.live.fetch_add(1, Ordering::AcqRel);
            }
        }
        Ok(id)
    }

    /// Current id for `fd`, if a connection is open on it.
    pub fn lookup(&self, fd: RawFd) -> Option<ClientId> {
        let slot = self.slot(fd)?;
        lock_or_recover(slot)
            .as_ref()
            .map(|s| ClientId { fd, serial: s.serial })
    }

    /// Remove the client's idle timer so the sweep can no longer evict it.
    /// Returns true if a timer was removed.
    pub fn disarm(&self, id: ClientId) -> bool {
        let Some(slot) = self.slot(id.fd) else {
            return false;
        };
        let handle = match lock_or_recover(slot).as_mut() {
            Some(s) if s.serial == id.serial => s.timer.take(),
            _ => None,
        };
        handle.is_some_and(|h| self.timers.remove(h).is_some())
    }

    /// Release the connection: drop its timer (if still queued) and close the
    /// fd. Returns false if `id` was already closed.
    pub fn close(&self, id: ClientId) -> bool {
        let Some(slot) = self.slot(id.fd) else {
            return false;
        };
        let entry = {
            let mut slot = lock_or_recover(slot);
            match slot.as_ref() {
                Some(s) if s.serial == id.serial => slot.take(),
                _ => None,
            }
        };
        let Some(entry) = entry else {
            return false;
        };
        if let Some(h) = entry.timer {
            self.timers.remove(h);
        }
        self.live.fetch_sub(1, Ordering::AcqRel);
        unsafe {
            libc::close(id.fd);
        }
        metrics::inc_closed();
        tracing::debug!(fd = id.fd, serial = id.serial, "client closed");
        true
    }

    /// Fire every timer whose deadline is at or before `now`. Stops at the
    /// first timer still in the future. Returns the number fired.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut fired = 0;
        while let Some(timer) = self.timers.pop_expired(now) {
            timer.expire();
            fired += 1;
        }
        fired
    }

    /// Close every client still waiting on its idle timer.
    pub fn close_all(&self) -> usize {
        let mut evicted = 0;
        while let Some(timer) = self.timers.pop() {
            timer.expire();
            evicted += 1;
        }
        evicted
    }

    /// Handle for a worker to serve `id`. Dropping it closes the connection.
    pub fn client(self: &Arc<Self>, id: ClientId) -> Client {
        Client {
            id,
            table: self.clone(),
            closed: false,
        }
    }
}

/// An accepted connection handed to a request handler.
///
/// The handler owns the connection's lifetime: it is closed by
/// [`close`](Client::close) or when the handle is dropped.
#[derive(Debug)]
pub struct Client {
    id: ClientId,
    table: Arc<ClientTable>,
    closed: bool,
}

impl Client {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn fd(&self) -> RawFd {
        self.id.fd
    }

    /// True if the peer shut down its side and no data is pending.
    pub fn peer_closed(&self) -> io::Result<bool> {
        let mut byte = 0u8;
        let n = unsafe {
            libc::recv(
                self.id.fd,
                &mut byte as *mut u8 as *mut libc::c_void,
                1,
                libc::MSG_PEEK | libc::MSG_DONTWAIT,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(false);
            }
            return Err(err);
        }
        Ok(n == 0)
    }

    pub fn set_blocking(&self, blocking: bool) -> io::Result<()> {
        SockRef::from(self).set_nonblocking(!blocking)
    }

    /// Read/write timeouts for blocking mode.
    pub fn set_timeouts(&self, timeout: Option<Duration>) -> io::Result<()> {
        let sock = SockRef::from(self);
        sock.set_read_timeout(timeout)?;
        sock.set_write_timeout(timeout)
    }

    pub fn close(mut self) -> bool {
        self.closed = true;
        self.table.close(self.id)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if !self.closed {
            self.table.close(self.id);
        }
    }
}

impl AsFd for Client {
    fn as_fd(&self) -> BorrowedFd<'_> {
        // The table keeps the fd open for as long as this handle is live.
        unsafe { BorrowedFd::borrow_raw(self.id.fd) }
    }
}

impl AsRawFd for Client {
    fn as_raw_fd(&self) -> RawFd {
        self.id.fd
    }
}

impl Read for Client {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::recv(
                self.id.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl Write for Client {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::send(
                self.id.fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
