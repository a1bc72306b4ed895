//! Owned wrappers over the Linux readiness primitives the reactor registers:
//! epoll itself, an eventfd used as a cross-thread wake, and a periodic
//! timerfd.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

pub const EPOLLIN: u32 = libc::EPOLLIN as u32;
pub const EPOLLRDHUP: u32 = libc::EPOLLRDHUP as u32;
pub const EPOLLHUP: u32 = libc::EPOLLHUP as u32;
pub const EPOLLERR: u32 = libc::EPOLLERR as u32;

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Ready events filled in by [`Epoll::wait`].
pub struct Events {
    buf: Vec<libc::epoll_event>,
    len: usize,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![libc::epoll_event { events: 0, u64: 0 }; capacity],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// `(fd, event flags)` for each ready descriptor.
    pub fn iter(&self) -> impl Iterator<Item = (RawFd, u32)> + '_ {
        self.buf[..self.len].iter().map(|ev| {
            // epoll_event is packed on x86_64; copy fields out by value.
            let data = ev.u64;
            let flags = ev.events;
            (data as RawFd, flags)
        })
    }
}

pub struct Epoll {
    fd: OwnedFd,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        let fd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Register `fd` for `events`. The fd itself is stored as the event data.
    pub fn add(&self, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        cvt(unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut ev) })?;
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        cvt(unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, &mut ev) })?;
        Ok(())
    }

    /// Wait for readiness. `timeout` of `None` blocks until an event arrives.
    /// An interrupted wait reports zero events.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = match timeout {
            Some(d) => d.as_millis().min(i32::MAX as u128) as libc::c_int,
            None => -1,
        };
        let ret = unsafe {
            libc::epoll_wait(
                self.fd.as_raw_fd(),
                events.buf.as_mut_ptr(),
                events.buf.len() as libc::c_int,
                timeout_ms,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            events.len = 0;
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        events.len = ret as usize;
        Ok(events.len)
    }
}

/// Non-blocking eventfd counter.
#[derive(Debug)]
pub struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    pub fn new() -> io::Result<Self> {
        let fd = cvt(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) })?;
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Add one to the counter, making the fd readable.
    pub fn signal(&self) -> io::Result<()> {
        signal_raw(self.fd.as_raw_fd())
    }

    /// Read and reset the counter. Zero if it was not set.
    pub fn drain(&self) -> io::Result<u64> {
        read_counter(self.fd.as_raw_fd())
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Write `1` to an eventfd by raw descriptor. Only calls `write(2)`, so it is
/// usable from a signal handler.
pub fn signal_raw(fd: RawFd) -> io::Result<()> {
    let val: u64 = 1;
    let n = unsafe { libc::write(fd, &val as *const u64 as *const libc::c_void, 8) };
    if n != 8 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn read_counter(fd: RawFd) -> io::Result<u64> {
    let mut val: u64 = 0;
    let n = unsafe { libc::read(fd, &mut val as *mut u64 as *mut libc::c_void, 8) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(0);
        }
        return Err(err);
    }
    Ok(val)
}

/// Periodic monotonic timerfd.
#[derive(Debug)]
pub struct TimerFd {
    fd: OwnedFd,
}

const MIN_TICK: Duration = Duration::from_millis(1);

impl TimerFd {
    /// Arm a timer firing every `interval`, first after one interval.
    pub fn periodic(interval: Duration) -> io::Result<Self> {
        let fd = cvt(unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        })?;
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        // A zero interval would disarm the timer.
        let interval = interval.max(MIN_TICK);
        let spec = libc::timespec {
            tv_sec: interval.as_secs() as libc::time_t,
            tv_nsec: interval.subsec_nanos() as libc::c_long,
        };
        let value = libc::itimerspec {
            it_interval: spec,
            it_value: spec,
        };
        cvt(unsafe { libc::timerfd_settime(fd.as_raw_fd(), 0, &value, std::ptr::null_mut()) })?;
        Ok(Self { fd })
    }

    /// Number of expirations since the last read.
    pub fn drain(&self) -> io::Result<u64> {
        read_counter(self.fd.as_raw_fd())
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eventfd_signal_then_drain() {
        let efd = EventFd::new().expect("eventfd");
        assert_eq!(efd.drain().expect("drain"), 0);
        efd.signal().expect("signal");
        efd.signal().expect("signal");
        assert_eq!(efd.drain().expect("drain"), 2);
        assert_eq!(efd.drain().expect("drain"), 0);
    }

    #[test]
    fn epoll_reports_signalled_eventfd() {
        let ep = Epoll::new().expect("epoll");
        let efd = EventFd::new().expect("eventfd");
        ep.add(efd.as_raw_fd(), EPOLLIN).expect("add");

        let mut events = Events::with_capacity(8);
        let n = ep
            .wait(&mut events, Some(Duration::from_millis(0)))
            .expect("wait");
        assert_eq!(n, 0);

        efd.signal().expect("signal");
        let n = ep
            .wait(&mut events, Some(Duration::from_secs(1)))
            .expect("wait");
        assert_eq!(n, 1);
        let (fd, flags) = events.iter().next().expect("one event");
        assert_eq!(fd, efd.as_raw_fd());
        assert!(flags & EPOLLIN != 0);

        ep.delete(efd.as_raw_fd()).expect("delete");
        let n = ep
            .wait(&mut events, Some(Duration::from_millis(0)))
            .expect("wait");
        assert_eq!(n, 0);
    }

    #[test]
    fn undrained_fd_is_reported_again() {
        let ep = Epoll::new().expect("epoll");
        let efd = EventFd::new().expect("eventfd");
        ep.add(efd.as_raw_fd(), EPOLLIN).expect("add");
        efd.signal().expect("signal");

        // Level-triggered: readiness persists until the counter is read.
        let mut events = Events::with_capacity(8);
        for _ in 0..2 {
            let n = ep
                .wait(&mut events, Some(Duration::from_secs(1)))
                .expect("wait");
            assert_eq!(n, 1);
        }

        assert_eq!(efd.drain().expect("drain"), 1);
        let n = ep
            .wait(&mut events, Some(Duration::from_millis(0)))
            .expect("wait");
        assert_eq!(n, 0);
    }

    #[test]
    fn timerfd_ticks() {
        let ep = Epoll::new().expect("epoll");
        let tfd = TimerFd::periodic(Duration::from_millis(10)).expect("timerfd");
        ep.add(tfd.as_raw_fd(), EPOLLIN).expect("add");
        let mut events = Events::with_capacity(4);
        let n = ep
            .wait(&mut events, Some(Duration::from_secs(2)))
            .expect("wait");
        assert_eq!(n, 1);
        assert!(tfd.drain().expect("drain") >= 1);
    }
}
