//! OS readiness multiplexing behind a backend trait.
//!
//! Two backends with the same semantics: a portable `select` backend that
//! rebuilds its fd sets from the registry snapshot on every wait, and a
//! Linux `epoll` backend with a kernel-maintained interest set. The event
//! loop is constructed over either one.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
#[cfg(target_os = "linux")]
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::time::Duration;

/// Events an fd is registered for, and events reported back by a wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FdEvents(u8);

impl FdEvents {
    pub const NONE: FdEvents = FdEvents(0);
    pub const READ: FdEvents = FdEvents(1);
    pub const WRITE: FdEvents = FdEvents(2);
    pub const ERR: FdEvents = FdEvents(4);

    pub fn contains(self, other: FdEvents) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for FdEvents {
    type Output = FdEvents;
    fn bitor(self, rhs: FdEvents) -> FdEvents {
        FdEvents(self.0 | rhs.0)
    }
}

/// One entry of the registry snapshot handed to a wait
#[derive(Debug, Clone, Copy)]
pub struct FdInterest {
    pub fd: RawFd,
    pub events: FdEvents,
}

/// A readiness backend. All methods take `&self`: the kernel structures
/// behind them are safe to drive from the registration paths while another
/// thread sits in `wait`.
pub trait Poller: Send + Sync {
    fn register(&self, fd: RawFd, events: FdEvents) -> io::Result<()>;
    fn modify(&self, fd: RawFd, events: FdEvents) -> io::Result<()>;
    fn deregister(&self, fd: RawFd) -> io::Result<()>;

    /// Waits up to `timeout` and appends `(fd, events)` pairs to `ready`.
    /// `interests` is the current registry snapshot; the select backend
    /// works from it, epoll ignores it. At most one entry per fd.
    fn wait(
        &self,
        interests: &[FdInterest],
        timeout: Duration,
        ready: &mut Vec<(RawFd, FdEvents)>,
    ) -> io::Result<()>;
}

/// Returns the default backend of the platform
pub fn default_poller() -> Box<dyn Poller> {
    #[cfg(target_os = "linux")]
    {
        match EpollPoller::new() {
            Ok(poller) => return Box::new(poller),
            Err(e) => log::warn!("could not create an epoll instance ({}), falling back to select", e),
        }
    }
    Box::new(SelectPoller)
}

/// Portable backend over select(2). Builds the fd sets from the interest
/// snapshot on every call, which is why select is slow for many sockets.
pub struct SelectPoller;

impl Poller for SelectPoller {
    fn register(&self, _fd: RawFd, _events: FdEvents) -> io::Result<()> {
        Ok(())
    }

    fn modify(&self, _fd: RawFd, _events: FdEvents) -> io::Result<()> {
        Ok(())
    }

    fn deregister(&self, _fd: RawFd) -> io::Result<()> {
        Ok(())
    }

    fn wait(
        &self,
        interests: &[FdInterest],
        timeout: Duration,
        ready: &mut Vec<(RawFd, FdEvents)>,
    ) -> io::Result<()> {
        // Nothing to select on. Sleep out the timeout so a loop without
        // sockets does not busy-spin between timer deadlines.
        if interests.is_empty() {
            std::thread::sleep(timeout);
            return Ok(());
        }

        let mut readset: libc::fd_set = unsafe { mem::zeroed() };
        let mut writeset: libc::fd_set = unsafe { mem::zeroed() };
        let mut errset: libc::fd_set = unsafe { mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut readset);
            libc::FD_ZERO(&mut writeset);
            libc::FD_ZERO(&mut errset);
        }

        let mut highest: RawFd = -1;
        for interest in interests {
            if interest.fd < 0 || interest.fd >= libc::FD_SETSIZE as RawFd {
                log::warn!("fd {} is out of range for select", interest.fd);
                continue;
            }
            unsafe {
                if interest.events.contains(FdEvents::READ) {
                    libc::FD_SET(interest.fd, &mut readset);
                }
                if interest.events.contains(FdEvents::WRITE) {
                    libc::FD_SET(interest.fd, &mut writeset);
                }
                // Errors are always reported
                libc::FD_SET(interest.fd, &mut errset);
            }
            if interest.fd > highest {
                highest = interest.fd;
            }
        }

        if highest < 0 {
            std::thread::sleep(timeout);
            return Ok(());
        }

        let mut tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };

        let n = unsafe {
            libc::select(highest + 1, &mut readset, &mut writeset, &mut errset, &mut tv)
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        for interest in interests {
            if interest.fd < 0 || interest.fd >= libc::FD_SETSIZE as RawFd {
                continue;
            }
            let mut events = FdEvents::NONE;
            unsafe {
                if libc::FD_ISSET(interest.fd, &errset) {
                    events = events | FdEvents::ERR;
                }
                if libc::FD_ISSET(interest.fd, &readset) {
                    events = events | FdEvents::READ;
                }
                if libc::FD_ISSET(interest.fd, &writeset) {
                    events = events | FdEvents::WRITE;
                }
            }
            if !events.is_empty() {
                ready.push((interest.fd, events));
            }
        }

        Ok(())
    }
}

/// Linux backend over epoll(7)
#[cfg(target_os = "linux")]
pub struct EpollPoller {
    epoll: std::os::unix::io::OwnedFd,
}

#[cfg(target_os = "linux")]
impl EpollPoller {
    pub fn new() -> io::Result<EpollPoller> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let epoll = unsafe { std::os::unix::io::OwnedFd::from_raw_fd(fd) };
        Ok(EpollPoller { epoll })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: FdEvents) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: epoll_mask(events),
            u64: fd as u64,
        };
        let ptr = if op == libc::EPOLL_CTL_DEL { std::ptr::null_mut() } else { &mut event };
        let res = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, ptr) };
        if res != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn epoll_mask(events: FdEvents) -> u32 {
    let mut mask = 0;
    if events.contains(FdEvents::READ) {
        mask |= libc::EPOLLIN as u32;
    }
    if events.contains(FdEvents::WRITE) {
        mask |= libc::EPOLLOUT as u32;
    }
    mask
}

#[cfg(target_os = "linux")]
impl Poller for EpollPoller {
    fn register(&self, fd: RawFd, events: FdEvents) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    fn modify(&self, fd: RawFd, events: FdEvents) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, FdEvents::NONE)
    }

    fn wait(
        &self,
        _interests: &[FdInterest],
        timeout: Duration,
        ready: &mut Vec<(RawFd, FdEvents)>,
    ) -> io::Result<()> {
        // epoll_wait has millisecond granularity. A positive sub-millisecond
        // timeout must wait at least one tick or the loop busy-spins.
        let mut timeout_ms = timeout.as_millis() as libc::c_int;
        if timeout_ms == 0 && !timeout.is_zero() {
            timeout_ms = 1;
        }

        let mut events: [libc::epoll_event; 64] = unsafe { mem::zeroed() };
        let n = unsafe {
            libc::epoll_wait(self.epoll.as_raw_fd(), events.as_mut_ptr(), 64, timeout_ms)
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        for event in events.iter().take(n as usize) {
            let fd = event.u64 as RawFd;
            let mut revents = FdEvents::NONE;
            if event.events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                revents = revents | FdEvents::ERR;
            }
            if event.events & libc::EPOLLIN as u32 != 0 {
                revents = revents | FdEvents::READ;
            }
            if event.events & libc::EPOLLOUT as u32 != 0 {
                revents = revents | FdEvents::WRITE;
            }
            if !revents.is_empty() {
                ready.push((fd, revents));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn events_combine_and_test_correctly() {
        let events = FdEvents::READ | FdEvents::ERR;
        assert!(events.contains(FdEvents::READ));
        assert!(events.contains(FdEvents::ERR));
        assert!(!events.contains(FdEvents::WRITE));
        assert!(!FdEvents::NONE.contains(FdEvents::READ));
        assert!(FdEvents::NONE.is_empty());
    }
}
