//! The UDP connection manager.
//!
//! Datagram sockets carry the same connection contract as TCP without the
//! handshake. A "connection" is either a bound receive socket or a
//! connect(2)-ed send socket. Send sockets defer their `Established`
//! notification to the first WRITE readiness so the application sees the
//! open only from inside the loop. Receive errors close the socket
//! immediately; there is no half-open state to drain.

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

const DEFAULT_RX_BUFSIZE: usize = 1 << 16;

struct UdpConnection {
    fd: OwnedFd,
    closing: bool,
    callback: Arc<Mutex<ConnectionCallback>>,
}

struct UdpInner {
    state: EventSourceState,
    el: Weak<EventLoop>,
    source_id: SourceId,
    rx_buffer: Vec<u8>,
    conns: HashMap<RawFd, UdpConnection>,
}

pub struct UdpConnectionManager {
    name: String,
    config: Params,
    weak_self: Weak<UdpConnectionManager>,
    inner: Mutex<UdpInner>,
}

impl UdpConnectionManager {
    pub fn new(name: &str) -> Arc<UdpConnectionManager> {
        UdpConnectionManager::with_config(name, Params::new())
    }

    /// Config parameters: `recv-bufsize: u32` (default 64 KiB)
    pub fn with_config(name: &str, config: Params) -> Arc<UdpConnectionManager> {
        Arc::new_cyclic(|weak_self| UdpConnectionManager {
            name: name.to_owned(),
            config,
            weak_self: weak_self.clone(),
            inner: Mutex::new(UdpInner {
                state: EventSourceState::Fresh,
                el: Weak::new(),
                source_id: 0,
                rx_buffer: Vec::new(),
                conns: HashMap::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, UdpInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register_socket(
        &self,
        fd: OwnedFd,
        events: FdEvents,
        callback: Arc<Mutex<ConnectionCallback>>,
    ) -> Result<RawFd, Error> {
        let raw = fd.as_raw_fd();
        let (el, source_id) = {
            let mut inner = self.lock();
            let el = inner.el.upgrade().ok_or(Error::BadState("not registered in an event loop"))?;
            inner.conns.insert(raw, UdpConnection { fd, closing: false, callback });
            (el, inner.source_id)
        };

        let weak = self.weak_self.clone();
        let fd_callback = Box::new(move |fd, event| {
            if let Some(cm) = weak.upgrade() {
                cm.socket_event(fd, event);
            }
        });

        if let Err(e) = el.register_fd(raw, events, source_id, fd_callback) {
            warn!("UDP {} | could not register the socket: {}", raw, e);
            self.lock().conns.remove(&raw);
            return Err(e);
        }
        Ok(raw)
    }

    /// Gets called when a socket becomes writable, receives data or closes
    fn socket_event(&self, fd: RawFd, event: FdEvents) {
        let callback = {
            let inner = self.lock();
            match inner.conns.get(&fd) {
                Some(conn) => conn.callback.clone(),
                None => return,
            }
        };

        debug!("UDP {} | activity on the socket", fd);

        // First WRITE readiness of a send socket: the deferred open
        // notification. Flip to READ afterwards.
        if event == FdEvents::WRITE {
            debug!("UDP {} | opening a new connection", fd);
            if let Some(el) = self.lock().el.upgrade() {
                if let Err(e) = el.modify_fd(fd, FdEvents::READ) {
                    warn!("UDP {} | could not switch to read events: {}", fd, e);
                }
            }
            let mut cb = callback.lock().unwrap_or_else(PoisonError::into_inner);
            (cb)(self, fd as ConnectionId, ConnectionState::Established, &Params::new(), &[]);
            return;
        }

        if event == FdEvents::ERR {
            info!("UDP {} | the connection closes with error {}", fd, net::socket_error(fd));
            self.close_fd(fd);
            return;
        }

        let mut buffer = std::mem::take(&mut self.lock().rx_buffer);
        if buffer.is_empty() {
            return;
        }

        match net::recv(fd, &mut buffer) {
            Ok(n) if n > 0 => {
                debug!("UDP {} | received message of size {}", fd, n);
                {
                    let mut cb = callback.lock().unwrap_or_else(PoisonError::into_inner);
                    (cb)(self, fd as ConnectionId, ConnectionState::Established, &Params::new(), &buffer[..n]);
                }
                self.lock().rx_buffer = buffer;
            }
            Ok(_) => {
                // A zero-sized datagram is valid; deliver it as empty payload
                {
                    let mut cb = callback.lock().unwrap_or_else(PoisonError::into_inner);
                    (cb)(self, fd as ConnectionId, ConnectionState::Established, &Params::new(), &[]);
                }
                self.lock().rx_buffer = buffer;
            }
            Err(e) => {
                self.lock().rx_buffer = buffer;
                if e.raw_os_error() == Some(libc::EINTR) {
                    return;
                }
                // Orderly close right away. Nothing below us in the call
                // stack still uses the socket in this iteration.
                debug!("UDP {} | recv signaled the socket was shutdown ({})", fd, e);
                self.close_fd(fd);
            }
        }
    }

    fn register_listen_socket(
        &self,
        ai: &net::ResolvedAddr,
        port: u16,
        callback: &Arc<Mutex<ConnectionCallback>>,
    ) -> Result<(), Error> {
        let hostname = net::numeric_host(&ai.addr, ai.addrlen).unwrap_or_default();

        let socket = net::socket(ai.family, ai.socktype, ai.protocol)
            .map_err(Error::from_os("could not create the receive socket"))?;
        let raw = socket.as_raw_fd();
        info!("UDP {} | new server socket for \"{}\" on port {}", raw, hostname, port);

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

        let actual_port = net::local_port(raw).unwrap_or(port);

        let raw = self.register_socket(socket, FdEvents::READ, callback.clone())?;

        let mut params = Params::new().with("listen-port", Value::U16(actual_port));
        if !hostname.is_empty() {
            params.insert("listen-hostname", Value::String(hostname));
        }
        let mut cb = callback.lock().unwrap_or_else(PoisonError::into_inner);
        (cb)(self, raw as ConnectionId, ConnectionState::Established, &params, &[]);
        Ok(())
    }

    fn register_listen_sockets(
        &self,
        hostname: Option<&str>,
        port: u16,
        callback: &Arc<Mutex<ConnectionCallback>>,
    ) -> Result<(), Error> {
        let flags = libc::AI_PASSIVE | libc::AI_NUMERICHOST | libc::AI_ADDRCONFIG;
        let addrs = match net::resolve(hostname, port, libc::SOCK_DGRAM, flags) {
            Ok(addrs) => addrs,
            Err(e) => {
                warn!("UDP | lookup for \"{}\" on port {} failed ({})", hostname.unwrap_or("*"), port, e);
                return Err(Error::ConnectionRejected("the listen hostname does not resolve"));
            }
        };

        let mut opened = 0;
        for ai in &addrs {
            match self.register_listen_socket(ai, port, callback) {
                Ok(()) => opened += 1,
                Err(e) => warn!("UDP | could not open a receive socket ({})", e),
            }
        }

        if opened == 0 {
            return Err(Error::ConnectionRejected("no receive socket could be opened"));
        }
        Ok(())
    }

    /// Opens a bound receive socket per interface
    fn open_receive_connection(&self, params: &Params, callback: ConnectionCallback) -> Result<(), Error> {
        let port = match params.get_u16("listen-port") {
            Some(port) => port,
            None => {
                warn!("UDP | port information required for listening");
                return Err(Error::ConnectionRejected("listen-port required"));
            }
        };

        if params.get_bool("validate").unwrap_or(false) {
            return Ok(());
        }

        let callback = Arc::new(Mutex::new(callback));
        let hostnames = params.get_str_array("listen-hostnames").unwrap_or(&[]);
        if hostnames.is_empty() {
            info!("UDP | listening on all interfaces");
            return self.register_listen_sockets(None, port, &callback);
        }

        let mut result = Err(Error::ConnectionRejected("no receive socket could be opened"));
        for hostname in hostnames {
            if self.register_listen_sockets(Some(hostname), port, &callback).is_ok() {
                result = Ok(());
            }
        }
        result
    }

    /// Opens a connect(2)-ed send socket
    fn open_send_connection(&self, params: &Params, callback: ConnectionCallback) -> Result<(), Error> {
        let port = match params.get_u16("port") {
            Some(port) => port,
            None => return Err(Error::ConnectionRejected("port required")),
        };
        let hostname = match params.get_str("hostname") {
            Some(hostname) => hostname,
            None => return Err(Error::ConnectionRejected("hostname required")),
        };

        debug!("UDP | open a connection to \"{}\" on port {}", hostname, port);

        let addrs = match net::resolve(Some(hostname), port, libc::SOCK_DGRAM, 0) {
            Ok(addrs) => addrs,
            Err(e) => {
                warn!("UDP | lookup of {} failed ({})", hostname, e);
                return Err(Error::ConnectionRejected("the hostname does not resolve"));
            }
        };
        let ai = &addrs[0];

        if params.get_bool("validate").unwrap_or(false) {
            return Ok(());
        }

        let socket = net::socket(ai.family, ai.socktype, ai.protocol)
            .map_err(Error::from_os("could not create the socket"))?;
        let raw = socket.as_raw_fd();

        net::set_nonblocking(raw)
            .and_then(|_| net::set_nosigpipe(raw))
            .map_err(Error::from_os("could not set the socket options"))?;

        if let Err(e) = net::connect(raw, &ai.addr, ai.addrlen) {
            warn!("UDP | connecting the socket to {} failed ({})", hostname, e);
            return Err(Error::ConnectionRejected("connect failed"));
        }

        let callback = Arc::new(Mutex::new(callback));
        let id = self.register_socket(socket, FdEvents::WRITE, callback)?;

        info!("UDP {} | new connection to \"{}\" on port {}", id, hostname, port);

        // The open notification is deferred to the first WRITE event in the
        // next loop iteration, after the application installed its state.
        Ok(())
    }

    /// Schedules a delayed close for a socket
    fn shutdown_fd(&self, fd: RawFd) {
        let el = {
            let mut inner = self.lock();
            let conn = match inner.conns.get_mut(&fd) {
                Some(conn) => conn,
                None => return,
            };
            if conn.closing {
                info!("UDP {} | cannot close - already closing", fd);
                return;
            }
            conn.closing = true;
            inner.el.upgrade()
        };

        debug!("UDP {} | shutdown called", fd);
        match el {
            Some(el) => {
                el.flag_fd_closing(fd);
                let weak = self.weak_self.clone();
                el.add_delayed_callback(move || {
                    if let Some(cm) = weak.upgrade() {
                        debug!("UDP {} | delayed closing of the connection", fd);
                        cm.close_fd(fd);
                    }
                });
            }
            None => self.close_fd(fd),
        }
    }

    /// Deregisters, notifies `Closing` and closes the socket. Called from
    /// the delayed queue, or directly for receive errors.
    fn close_fd(&self, fd: RawFd) {
        let (conn, el) = {
            let mut inner = self.lock();
            let conn = match inner.conns.remove(&fd) {
                Some(conn) => conn,
                None => return,
            };
            (conn, inner.el.upgrade())
        };

        debug!("UDP {} | closing connection", fd);
        if let Some(el) = el {
            let _ = el.deregister_fd(fd);
        }

        {
            let mut cb = conn.callback.lock().unwrap_or_else(PoisonError::into_inner);
            (cb)(self, fd as ConnectionId, ConnectionState::Closing, &Params::new(), &[]);
        }

        drop(conn.fd);
        info!("UDP {} | socket closed", fd);

        self.check_stopped();
    }

    fn check_stopped(&self) {
        let mut inner = self.lock();
        if inner.conns.is_empty() && inner.state == EventSourceState::Stopping {
            debug!("UDP | all sockets closed, the connection manager has stopped");
            inner.rx_buffer = Vec::new();
            inner.state = EventSourceState::Stopped;
        }
    }
}

impl EventSource for UdpConnectionManager {
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
            info!("UDP | shutting down the connection manager");
            inner.state = EventSourceState::Stopping;
            (inner.el.upgrade(), inner.source_id)
        };

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

impl ConnectionManager for UdpConnectionManager {
    fn protocol(&self) -> &str {
        "udp"
    }

    /// A `port` parameter selects a send connection, otherwise a bound
    /// receive socket is opened.
    fn open_connection(&self, params: &Params, callback: ConnectionCallback) -> Result<(), Error> {
        if self.state() != EventSourceState::Started {
            warn!("UDP | cannot open a connection for a connection manager that is not started");
            return Err(Error::BadState("the connection manager is not started"));
        }

        if params.contains("port") {
            self.open_send_connection(params, callback)
        } else {
            self.open_receive_connection(params, callback)
        }
    }

    fn send_with_connection(&self, id: ConnectionId, buf: BytesMut) -> Result<(), Error> {
        let fd = id as RawFd;
        {
            let inner = self.lock();
            match inner.conns.get(&fd) {
                Some(conn) if !conn.closing => {}
                _ => {
                    warn!("UDP | cannot send via connection {} - not found", id);
                    return Err(Error::NotFound);
                }
            }
        }

        debug!("UDP {} | attempting to send {} bytes", fd, buf.len());
        match net::send_all(fd, &buf) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("UDP {} | send failed with error {}", fd, e);
                self.shutdown_fd(fd);
                Err(Error::ConnectionClosed)
            }
        }
    }

    fn close_connection(&self, id: ConnectionId) -> Result<(), Error> {
        let fd = id as RawFd;
        if !self.lock().conns.contains_key(&fd) {
            warn!("UDP | cannot close connection {} - not found", id);
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
