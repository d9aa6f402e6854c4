//! The TCP connection manager.
//!
//! Active connections resolve a hostname, issue a non-blocking connect and
//! wait for the WRITE event that marks completion. Passive connections bind
//! one listen socket per resolved address; every accept produces a fresh
//! connection that shares the listen socket's callback. All sockets route
//! their events through the event loop of the manager.

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::BytesMut;
use log::{debug, info, warn};

use crate::error::Error;
use crate::eventloop::EventLoop;
use crate::net;
use crate::params::{Params, Value};
use crate::poll::FdEvents;
use crate::source::{
    ConnectionCallback, ConnectionId, ConnectionManager, ConnectionState, EventSource,
    EventSourceState, SourceId,
};

const MAX_BACKLOG: libc::c_int = 100;
const DEFAULT_RX_BUFSIZE: usize = 1 << 16;

enum SocketKind {
    Listen,
    Stream,
}

struct TcpConnection {
    fd: OwnedFd,
    kind: SocketKind,
    /// Guards against a second delayed close for the same connection
    closing: bool,
    callback: Arc<Mutex<ConnectionCallback>>,
}

struct TcpInner {
    state: EventSourceState,
    el: Weak<EventLoop>,
    source_id: SourceId,
    /// One receive buffer for the whole manager, reused across connections.
    /// Sized via the recv-bufsize config parameter at start.
    rx_buffer: Vec<u8>,
    conns: HashMap<RawFd, TcpConnection>,
}

pub struct TcpConnectionManager {
    name: String,
    config: Params,
    weak_self: Weak<TcpConnectionManager>,
    inner: Mutex<TcpInner>,
}

impl TcpConnectionManager {
    pub fn new(name: &str) -> Arc<TcpConnectionManager> {
        TcpConnectionManager::with_config(name, Params::new())
    }

    /// Config parameters: `recv-bufsize: u32` (default 64 KiB)
    pub fn with_config(name: &str, config: Params) -> Arc<TcpConnectionManager> {
        Arc::new_cyclic(|weak_self| TcpConnectionManager {
            name: name.to_owned(),
            config,
            weak_self: weak_self.clone(),
            inner: Mutex::new(TcpInner {
                state: EventSourceState::Fresh,
                el: Weak::new(),
                source_id: 0,
                rx_buffer: Vec::new(),
                conns: HashMap::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, TcpInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn eventloop(&self) -> Result<Arc<EventLoop>, Error> {
        self.lock().el.upgrade().ok_or(Error::BadState("not registered in an event loop"))
    }

    /// Registers a socket both in the manager and the event loop
    fn register_socket(
        &self,
        fd: OwnedFd,
        kind: SocketKind,
        events: FdEvents,
        callback: Arc<Mutex<ConnectionCallback>>,
    ) -> Result<RawFd, Error> {
        let raw = fd.as_raw_fd();
        let (el, source_id) = {
            let mut inner = self.lock();
            let el = inner.el.upgrade().ok_or(Error::BadState("not registered in an event loop"))?;
            inner.conns.insert(raw, TcpConnection { fd, kind, closing: false, callback });
            (el, inner.source_id)
        };

        let weak = self.weak_self.clone();
        let fd_callback = Box::new(move |fd, event| {
            if let Some(cm) = weak.upgrade() {
                cm.socket_event(fd, event);
            }
        });

        if let Err(e) = el.register_fd(raw, events, source_id, fd_callback) {
            warn!("TCP {} | could not register the socket: {}", raw, e);
            self.lock().conns.remove(&raw);
            return Err(e);
        }
        Ok(raw)
    }

    fn socket_event(&self, fd: RawFd, event: FdEvents) {
        let (kind_is_listen, callback) = {
            let inner = self.lock();
            match inner.conns.get(&fd) {
                Some(conn) => (
                    matches!(conn.kind, SocketKind::Listen),
                    conn.callback.clone(),
                ),
                None => return,
            }
        };

        if kind_is_listen {
            self.listen_socket_event(fd, event, callback);
        } else {
            self.connection_socket_event(fd, event, callback);
        }
    }

    /// Gets called when a connection socket opens, receives data or closes
    fn connection_socket_event(&self, fd: RawFd, event: FdEvents, callback: Arc<Mutex<ConnectionCallback>>) {
        debug!("TCP {} | activity on the socket", fd);

        // The connection has closed
        if event == FdEvents::ERR {
            info!("TCP {} | the connection closes with error {}", fd, net::socket_error(fd));
            self.shutdown_fd(fd);
            return;
        }

        // A WRITE event means the non-blocking connect has finished. Some
        // errors arrive as a WRITE event too, so the socket error has to be
        // checked by hand.
        if event == FdEvents::WRITE {
            let error = net::socket_error(fd);
            if error != 0 {
                info!("TCP {} | the connection closes with error {}", fd, error);
                self.shutdown_fd(fd);
                return;
            }

            debug!("TCP {} | opening a new connection", fd);
            if let Ok(el) = self.eventloop() {
                if let Err(e) = el.modify_fd(fd, FdEvents::READ) {
                    warn!("TCP {} | could not switch to read events: {}", fd, e);
                }
            }

            let mut cb = callback.lock().unwrap_or_else(PoisonError::into_inner);
            (cb)(self, fd as ConnectionId, ConnectionState::Established, &Params::new(), &[]);
            return;
        }

        // Take the shared receive buffer out while receiving; dispatch is
        // single-threaded so nobody else needs it concurrently.
        let mut buffer = std::mem::take(&mut self.lock().rx_buffer);
        if buffer.is_empty() {
            return;
        }

        match net::recv(fd, &mut buffer) {
            Ok(0) => {
                debug!("TCP {} | recv signaled the socket was shutdown", fd);
                self.lock().rx_buffer = buffer;
                self.shutdown_fd(fd);
            }
            Ok(n) => {
                debug!("TCP {} | received message of size {}", fd, n);
                {
                    let mut cb = callback.lock().unwrap_or_else(PoisonError::into_inner);
                    (cb)(self, fd as ConnectionId, ConnectionState::Established, &Params::new(), &buffer[..n]);
                }
                self.lock().rx_buffer = buffer;
            }
            Err(e) => {
                self.lock().rx_buffer = buffer;
                if net::is_transient(&e) {
                    return;
                }
                debug!("TCP {} | recv failed ({})", fd, e);
                self.shutdown_fd(fd);
            }
        }
    }

    /// Gets called when a new connection opens on the listen socket
    fn listen_socket_event(&self, fd: RawFd, _event: FdEvents, callback: Arc<Mutex<ConnectionCallback>>) {
        debug!("TCP {} | callback on the server socket", fd);

        let (new_fd, remote, remote_len) = match net::accept(fd) {
            Ok(accepted) => accepted,
            Err(e) => {
                if net::is_transient(&e) {
                    return;
                }
                // A failing listen socket is shut down
                if self.state() != EventSourceState::Stopping {
                    warn!("TCP {} | error {}, closing the server socket", fd, e);
                }
                self.shutdown_fd(fd);
                return;
            }
        };

        let remote_hostname = match net::numeric_host(&remote, remote_len) {
            Some(host) => host,
            None => {
                warn!("TCP {} | could not resolve the remote hostname", fd);
                String::new()
            }
        };
        info!(
            "TCP {} | connection opened from \"{}\" via the server socket {}",
            new_fd.as_raw_fd(),
            remote_hostname,
            fd
        );

        // Configure the new socket
        let raw = new_fd.as_raw_fd();
        let configured = net::set_nonblocking(raw)
            .and_then(|_| net::set_nosigpipe(raw))
            .and_then(|_| net::set_nodelay(raw));
        if let Err(e) = configured {
            warn!("TCP {} | error setting the TCP options ({})", raw, e);
            return; // Drops and thereby closes the new socket
        }

        let id = match self.register_socket(new_fd, SocketKind::Stream, FdEvents::READ, callback.clone()) {
            Ok(raw) => raw as ConnectionId,
            Err(_) => return,
        };

        let params = Params::new().with("remote-hostname", Value::String(remote_hostname));
        let mut cb = callback.lock().unwrap_or_else(PoisonError::into_inner);
        (cb)(self, id, ConnectionState::Established, &params, &[]);
    }

    /// Creates one listen socket for a resolved address
    fn register_listen_socket(
        &self,
        ai: &net::ResolvedAddr,
        port: u16,
        callback: &Arc<Mutex<ConnectionCallback>>,
    ) -> Result<(), Error> {
        let hostname = net::numeric_host(&ai.addr, ai.addrlen).unwrap_or_default();

        let socket = net::socket(ai.family, ai.socktype, ai.protocol)
            .map_err(Error::from_os("could not create the listen socket"))?;
        let raw = socket.as_raw_fd();
        info!("TCP {} | creating server socket for \"{}\" on port {}", raw, hostname, port);

        if ai.family == libc::AF_INET6 {
            net::set_ipv6_only(raw)
                .map_err(Error::from_os("could not set the socket to IPv6 only"))?;
        }
        net::set_reuseaddr(raw).map_err(Error::from_os("could not make the socket reusable"))?;
        net::set_nonblocking(raw)
            .map_err(Error::from_os("could not set the socket non-blocking"))?;
        net::set_nosigpipe(raw).map_err(Error::from_os("could not disable SIGPIPE"))?;
        net::bind(raw, &ai.addr, ai.addrlen)
            .map_err(Error::from_os("error binding the socket to the address"))?;
        net::listen(raw, MAX_BACKLOG).map_err(Error::from_os("error listening on the socket"))?;

        // Port 0 lets the OS pick; read back what it chose so the listen
        // notification is usable for loopback connects.
        let actual_port = net::local_port(raw).unwrap_or(port);

        let raw = self.register_socket(socket, SocketKind::Listen, FdEvents::READ, callback.clone())?;

        let mut params = Params::new().with("listen-port", Value::U16(actual_port));
        if !hostname.is_empty() {
            params.insert("listen-hostname", Value::String(hostname));
        }
        let mut cb = callback.lock().unwrap_or_else(PoisonError::into_inner);
        (cb)(self, raw as ConnectionId, ConnectionState::Established, &params, &[]);
        Ok(())
    }

    /// Creates listen sockets for all interface/family combinations of one
    /// hostname. Succeeds if at least one socket came up.
    fn register_listen_sockets(
        &self,
        hostname: Option<&str>,
        port: u16,
        callback: &Arc<Mutex<ConnectionCallback>>,
    ) -> Result<(), Error> {
        let flags = libc::AI_PASSIVE | libc::AI_ADDRCONFIG;
        let addrs = match net::resolve(hostname, port, libc::SOCK_STREAM, flags) {
            Ok(addrs) => addrs,
            Err(e) => {
                warn!("TCP | lookup for \"{}\" on port {} failed ({})", hostname.unwrap_or("*"), port, e);
                return Err(Error::ConnectionRejected("the listen hostname does not resolve"));
            }
        };

        let mut opened = 0;
        for ai in &addrs {
            match self.register_listen_socket(ai, port, callback) {
                Ok(()) => opened += 1,
                Err(e) => warn!("TCP | could not open a listen socket ({})", e),
            }
        }

        if opened == 0 {
            return Err(Error::ConnectionRejected("no listen socket could be opened"));
        }
        Ok(())
    }

    /// Creates listen sockets that wait for incoming connections
    fn open_passive_connection(&self, params: &Params, callback: ConnectionCallback) -> Result<(), Error> {
        let port = match params.get_u16("listen-port") {
            Some(port) => port,
            None => {
                warn!("TCP | the listen-port was not correctly configured");
                return Err(Error::ConnectionRejected("listen-port required"));
            }
        };

        if params.get_bool("validate").unwrap_or(false) {
            return Ok(());
        }

        let callback = Arc::new(Mutex::new(callback));

        // No hostnames or an empty array means all interfaces
        let hostnames = params.get_str_array("listen-hostnames").unwrap_or(&[]);
        if hostnames.is_empty() {
            info!("TCP | listening on all interfaces");
            return self.register_listen_sockets(None, port, &callback);
        }

        let mut result = Err(Error::ConnectionRejected("no listen socket could be opened"));
        for hostname in hostnames {
            if self.register_listen_sockets(Some(hostname), port, &callback).is_ok() {
                result = Ok(());
            }
        }
        result
    }

    /// Opens an active connection to a remote host
    fn open_active_connection(&self, params: &Params, callback: ConnectionCallback) -> Result<(), Error> {
        let port = match params.get_u16("port") {
            Some(port) => port,
            None => {
                warn!("TCP | open connection: no port defined, aborting");
                return Err(Error::ConnectionRejected("port required"));
            }
        };
        let hostname = match params.get_str("hostname") {
            Some(hostname) => hostname,
            None => {
                warn!("TCP | open connection: no hostname defined, aborting");
                return Err(Error::ConnectionRejected("hostname required"));
            }
        };

        debug!("TCP | open a connection to \"{}\" on port {}", hostname, port);

        let addrs = match net::resolve(Some(hostname), port, libc::SOCK_STREAM, 0) {
            Ok(addrs) => addrs,
            Err(e) => {
                warn!("TCP | lookup of {} failed ({})", hostname, e);
                return Err(Error::ConnectionRejected("the hostname does not resolve"));
            }
        };
        let ai = &addrs[0];

        // Only validate the parameters; don't actually open a socket
        if params.get_bool("validate").unwrap_or(false) {
            return Ok(());
        }

        let socket = net::socket(ai.family, ai.socktype, ai.protocol)
            .map_err(Error::from_os("could not create the socket"))?;
        let raw = socket.as_raw_fd();

        net::set_nonblocking(raw)
            .and_then(|_| net::set_nosigpipe(raw))
            .and_then(|_| net::set_nodelay(raw))
            .map_err(Error::from_os("could not set the socket options"))?;

        if let Err(e) = net::connect(raw, &ai.addr, ai.addrlen) {
            warn!("TCP | connecting the socket to {} failed ({})", hostname, e);
            return Err(Error::ConnectionRejected("connect failed"));
        }

        // Trigger on WRITE when the connect completes
        let callback = Arc::new(Mutex::new(callback));
        let id = self.register_socket(socket, SocketKind::Stream, FdEvents::WRITE, callback.clone())?;

        info!("TCP {} | new connection to \"{}\" on port {}", id, hostname, port);

        // Signal the new connection as asynchronously opening
        let mut cb = callback.lock().unwrap_or_else(PoisonError::into_inner);
        (cb)(self, id as ConnectionId, ConnectionState::Opening, &Params::new(), &[]);
        Ok(())
    }

    /// Closes a connection via the delayed queue. The fd might still sit in
    /// the ready list of the current iteration, so the actual close must
    /// wait until the iteration is past the fd events.
    fn shutdown_fd(&self, fd: RawFd) {
        let el = {
            let mut inner = self.lock();
            let conn = match inner.conns.get_mut(&fd) {
                Some(conn) => conn,
                None => return,
            };
            if conn.closing {
                info!("TCP {} | cannot close - already closing", fd);
                return;
            }
            conn.closing = true;
            inner.el.upgrade()
        };

        debug!("TCP {} | shutdown called", fd);
        match el {
            Some(el) => {
                el.flag_fd_closing(fd);
                let weak = self.weak_self.clone();
                el.add_delayed_callback(move || {
                    if let Some(cm) = weak.upgrade() {
                        debug!("TCP {} | delayed closing of the connection", fd);
                        cm.close_fd(fd);
                    }
                });
            }
            // Without a loop there is nothing to defer for
            None => self.close_fd(fd),
        }
    }

    /// The deferred half of a close: deregister, signal Closing, close the
    /// socket, and check whether the manager has fully stopped.
    fn close_fd(&self, fd: RawFd) {
        let (conn, el) = {
            let mut inner = self.lock();
            let conn = match inner.conns.remove(&fd) {
                Some(conn) => conn,
                None => return,
            };
            (conn, inner.el.upgrade())
        };

        debug!("TCP {} | closing connection", fd);
        if let Some(el) = el {
            let _ = el.deregister_fd(fd);
        }

        {
            let mut cb = conn.callback.lock().unwrap_or_else(PoisonError::into_inner);
            (cb)(self, fd as ConnectionId, ConnectionState::Closing, &Params::new(), &[]);
        }

        drop(conn.fd);
        info!("TCP {} | socket closed", fd);

        self.check_stopped();
    }

    /// The manager is stopped once the last socket has closed
    fn check_stopped(&self) {
        let mut inner = self.lock();
        if inner.conns.is_empty() && inner.state == EventSourceState::Stopping {
            debug!("TCP | all sockets closed, the connection manager has stopped");
            inner.rx_buffer = Vec::new();
            inner.state = EventSourceState::Stopped;
        }
    }
}

impl EventSource for TcpConnectionManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> EventSourceState {
        self.lock().state
    }

    fn attach(&self, el: Weak<EventLoop>, id: SourceId) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.state != EventSourceState::Fresh {
            return Err(Error::BadState("the connection manager is already registered"));
        }
        inner.el = el;
        inner.source_id = id;
        inner.state = EventSourceState::Stopped;
        Ok(())
    }

    fn detach(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.state != EventSourceState::Stopped {
            return Err(Error::BadState("the connection manager has to be stopped first"));
        }
        inner.el = Weak::new();
        inner.state = EventSourceState::Fresh;
        Ok(())
    }

    fn start(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.state != EventSourceState::Stopped {
            return Err(Error::BadState(
                "to start, the connection manager has to be registered in an event loop and not started yet",
            ));
        }

        let rx_bufsize = self.config.get_u32("recv-bufsize").map(|v| v as usize).unwrap_or(DEFAULT_RX_BUFSIZE);
        inner.rx_buffer = vec![0; rx_bufsize];
        inner.state = EventSourceState::Started;
        Ok(())
    }

    fn stop(&self) {
        let (el, source_id) = {
            let mut inner = self.lock();
            if inner.state != EventSourceState::Started {
                return;
            }
            info!("TCP | shutting down the connection manager");
            inner.state = EventSourceState::Stopping;
            (inner.el.upgrade(), inner.source_id)
        };

        // The manager reaches Stopped when the last socket has closed and
        // deregistered from inside the delayed callbacks.
        if let Some(el) = el {
            for fd in el.source_fds(source_id) {
                self.shutdown_fd(fd);
            }
        }
        self.check_stopped();
    }

    fn as_connection_manager(self: Arc<Self>) -> Option<Arc<dyn ConnectionManager>> {
        Some(self)
    }
}

impl ConnectionManager for TcpConnectionManager {
    fn protocol(&self) -> &str {
        "tcp"
    }

    /// A `port` parameter selects an active connection, otherwise a listen
    /// socket is opened.
    fn open_connection(&self, params: &Params, callback: ConnectionCallback) -> Result<(), Error> {
        if self.state() != EventSourceState::Started {
            warn!("TCP | cannot open a connection for a connection manager that is not started");
            return Err(Error::BadState("the connection manager is not started"));
        }

        if params.contains("port") {
            self.open_active_connection(params, callback)
        } else {
            self.open_passive_connection(params, callback)
        }
    }

    fn send_with_connection(&self, id: ConnectionId, buf: BytesMut) -> Result<(), Error> {
        let fd = id as RawFd;
        {
            let inner = self.lock();
            match inner.conns.get(&fd) {
                Some(conn) if !conn.closing => {}
                _ => {
                    warn!("TCP | cannot send via connection {} - not found", id);
                    return Err(Error::NotFound);
                }
            }
        }

        debug!("TCP {} | attempting to send {} bytes", fd, buf.len());
        match net::send_all(fd, &buf) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("TCP {} | send failed with error {}", fd, e);
                self.shutdown_fd(fd);
                Err(Error::ConnectionClosed)
            }
        }
        // buf is dropped here in every branch
    }

    fn close_connection(&self, id: ConnectionId) -> Result<(), Error> {
        let fd = id as RawFd;
        if !self.lock().conns.contains_key(&fd) {
            warn!("TCP | cannot close connection {} - not found", id);
            return Err(Error::NotFound);
        }
        self.shutdown_fd(fd);
        Ok(())
    }

    fn alloc_network_buffer(&self, _id: ConnectionId, size: usize) -> Result<BytesMut, Error> {
        Ok(BytesMut::with_capacity(size))
    }

    fn free_network_buffer(&self, _id: ConnectionId, buf: BytesMut) {
        drop(buf);
    }
}
