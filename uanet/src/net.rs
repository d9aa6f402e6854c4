//! Thin safe wrappers over the libc socket calls shared by the TCP and UDP
//! connection managers. Fds are returned as `OwnedFd` so an early error
//! path can never leak a socket.

use std::ffi::{CStr, CString};
use std::io;
use std::mem;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};

use libc::{c_int, c_void, sockaddr, sockaddr_storage, socklen_t};

#[cfg(target_os = "linux")]
pub(crate) const SEND_FLAGS: c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
pub(crate) const SEND_FLAGS: c_int = 0;

/// One result of a name resolution
pub(crate) struct ResolvedAddr {
    pub family: c_int,
    pub socktype: c_int,
    pub protocol: c_int,
    pub addr: sockaddr_storage,
    pub addrlen: socklen_t,
}

/// getaddrinfo for `host:port`. `host = None` resolves the wildcard
/// addresses (requires `AI_PASSIVE` in the flags).
pub(crate) fn resolve(
    host: Option<&str>,
    port: u16,
    socktype: c_int,
    flags: c_int,
) -> io::Result<Vec<ResolvedAddr>> {
    let host = match host {
        Some(h) => Some(
            CString::new(h).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "hostname contains NUL"))?,
        ),
        None => None,
    };
    let service = CString::new(port.to_string())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid port"))?;

    let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
    hints.ai_family = libc::AF_UNSPEC;
    hints.ai_socktype = socktype;
    hints.ai_flags = flags;

    let mut res: *mut libc::addrinfo = std::ptr::null_mut();
    let host_ptr = host.as_ref().map_or(std::ptr::null(), |h| h.as_ptr());
    let ret = unsafe { libc::getaddrinfo(host_ptr, service.as_ptr(), &hints, &mut res) };
    if ret != 0 {
        let msg = unsafe { CStr::from_ptr(libc::gai_strerror(ret)) };
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("name lookup failed: {}", msg.to_string_lossy()),
        ));
    }

    let mut addrs = Vec::new();
    let mut ai = res;
    while !ai.is_null() {
        let info = unsafe { &*ai };
        if !info.ai_addr.is_null() && info.ai_addrlen as usize <= mem::size_of::<sockaddr_storage>() {
            let mut addr: sockaddr_storage = unsafe { mem::zeroed() };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    info.ai_addr as *const u8,
                    &mut addr as *mut sockaddr_storage as *mut u8,
                    info.ai_addrlen as usize,
                );
            }
            addrs.push(ResolvedAddr {
                family: info.ai_family,
                socktype: info.ai_socktype,
                protocol: info.ai_protocol,
                addr,
                addrlen: info.ai_addrlen,
            });
        }
        ai = info.ai_next;
    }
    unsafe { libc::freeaddrinfo(res) };

    if addrs.is_empty() {
        return Err(io::Error::new(io::ErrorKind::Other, "name lookup returned no addresses"));
    }
    Ok(addrs)
}

pub(crate) fn socket(family: c_int, socktype: c_int, protocol: c_int) -> io::Result<OwnedFd> {
    let fd = unsafe { libc::socket(family, socktype, protocol) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Sets O_NONBLOCK. Accepted sockets get this explicitly as well; the
/// inheritance from the listen socket is platform-dependent.
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let opts = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if opts < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, opts | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn setsockopt(fd: RawFd, level: c_int, option: c_int, value: c_int) -> io::Result<()> {
    let res = unsafe {
        libc::setsockopt(
            fd,
            level,
            option,
            &value as *const c_int as *const c_void,
            mem::size_of::<c_int>() as socklen_t,
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Suppresses SIGPIPE on the socket where the platform supports it. On
/// Linux the equivalent is the MSG_NOSIGNAL send flag.
pub(crate) fn set_nosigpipe(fd: RawFd) -> io::Result<()> {
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "netbsd"))]
    {
        return setsockopt(fd, libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1);
    }
    #[allow(unreachable_code)]
    {
        let _ = fd;
        Ok(())
    }
}

/// Disables Nagle's algorithm so packets are not merged on the socket
pub(crate) fn set_nodelay(fd: RawFd) -> io::Result<()> {
    setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)
}

/// Allows rebinding to the address, e.g. to restart a server
pub(crate) fn set_reuseaddr(fd: RawFd) -> io::Result<()> {
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
}

/// Forces an AF_INET6 socket to IPv6. Without this, sockets double-bind to
/// IPv4 and IPv6 on distributions that leave net.ipv6.bindv6only off.
pub(crate) fn set_ipv6_only(fd: RawFd) -> io::Result<()> {
    setsockopt(fd, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, 1)
}

pub(crate) fn bind(fd: RawFd, addr: &sockaddr_storage, addrlen: socklen_t) -> io::Result<()> {
    let res = unsafe { libc::bind(fd, addr as *const sockaddr_storage as *const sockaddr, addrlen) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn listen(fd: RawFd, backlog: c_int) -> io::Result<()> {
    if unsafe { libc::listen(fd, backlog) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Non-blocking connect. `EINPROGRESS`/`EWOULDBLOCK` count as success; the
/// completion arrives as a WRITE event.
pub(crate) fn connect(fd: RawFd, addr: &sockaddr_storage, addrlen: socklen_t) -> io::Result<()> {
    let res = unsafe { libc::connect(fd, addr as *const sockaddr_storage as *const sockaddr, addrlen) };
    if res == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINPROGRESS) | Some(libc::EWOULDBLOCK) => Ok(()),
        _ => Err(err),
    }
}

pub(crate) fn accept(fd: RawFd) -> io::Result<(OwnedFd, sockaddr_storage, socklen_t)> {
    let mut addr: sockaddr_storage = unsafe { mem::zeroed() };
    let mut addrlen = mem::size_of::<sockaddr_storage>() as socklen_t;
    let new_fd = unsafe {
        libc::accept(fd, &mut addr as *mut sockaddr_storage as *mut sockaddr, &mut addrlen)
    };
    if new_fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((unsafe { OwnedFd::from_raw_fd(new_fd) }, addr, addrlen))
}

/// Single non-blocking receive into `buf`. `Ok(0)` is an orderly shutdown.
pub(crate) fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), libc::MSG_DONTWAIT) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// The pending error on the socket, surfaced by connects that fail as a
/// WRITE event
pub(crate) fn socket_error(fd: RawFd) -> c_int {
    let mut error: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;
    let res = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut error as *mut c_int as *mut c_void,
            &mut len,
        )
    };
    if res != 0 {
        return res;
    }
    error
}

/// Numeric host string of a socket address
pub(crate) fn numeric_host(addr: &sockaddr_storage, addrlen: socklen_t) -> Option<String> {
    let mut buf = [0 as libc::c_char; 256];
    let res = unsafe {
        libc::getnameinfo(
            addr as *const sockaddr_storage as *const sockaddr,
            addrlen,
            buf.as_mut_ptr(),
            buf.len() as socklen_t,
            std::ptr::null_mut(),
            0,
            libc::NI_NUMERICHOST,
        )
    };
    if res != 0 {
        return None;
    }
    let host = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Some(host.to_string_lossy().into_owned())
}

/// The locally bound port of a socket. Lets a listen socket opened on port
/// 0 report the port the OS picked.
pub(crate) fn local_port(fd: RawFd) -> io::Result<u16> {
    let mut addr: sockaddr_storage = unsafe { mem::zeroed() };
    let mut addrlen = mem::size_of::<sockaddr_storage>() as socklen_t;
    let res = unsafe {
        libc::getsockname(fd, &mut addr as *mut sockaddr_storage as *mut sockaddr, &mut addrlen)
    };
    if res != 0 {
        return Err(io::Error::last_os_error());
    }
    match addr.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(&addr as *const sockaddr_storage as *const libc::sockaddr_in) };
            Ok(u16::from_be(sin.sin_port))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(&addr as *const sockaddr_storage as *const libc::sockaddr_in6) };
            Ok(u16::from_be(sin6.sin6_port))
        }
        _ => Err(io::Error::new(io::ErrorKind::Other, "unknown address family")),
    }
}

/// Sends the full buffer. Transient errors wait on a bounded 100 ms poll
/// for the socket to drain and retry; everything else is fatal for the
/// connection.
pub(crate) fn send_all(fd: RawFd, buf: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < buf.len() {
        let n = unsafe {
            libc::send(
                fd,
                buf[written..].as_ptr() as *const c_void,
                buf.len() - written,
                SEND_FLAGS,
            )
        };
        if n >= 0 {
            written += n as usize;
            continue;
        }

        let err = io::Error::last_os_error();
        if is_transient(&err) {
            wait_writable(fd)?;
        } else {
            return Err(err);
        }
    }
    Ok(())
}

fn wait_writable(fd: RawFd) -> io::Result<()> {
    loop {
        let mut pfd = libc::pollfd { fd, events: libc::POLLOUT, revents: 0 };
        let res = unsafe { libc::poll(&mut pfd, 1, 100) };
        if res > 0 {
            return Ok(());
        }
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }
        // Timed out: poll again until the socket drains
    }
}

/// Errors a non-blocking socket recovers from by itself
pub(crate) fn is_transient(err: &io::Error) -> bool {
    match err.raw_os_error() {
        Some(code) => code == libc::EINTR || code == libc::EAGAIN || code == libc::EWOULDBLOCK,
        None => false,
    }
}
