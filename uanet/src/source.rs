//! Event sources and the connection manager interface.
//!
//! An event source is an entity with a lifecycle owned by one event loop:
//! it is registered, started together with (or after) the loop, asked to
//! stop, and deregistered once it reports `Stopped`. The closed set of
//! sources in this crate is the TCP/UDP/MQTT connection managers and the
//! interrupt manager.

use std::sync::{Arc, Weak};

use bytes::BytesMut;

use crate::error::Error;
use crate::eventloop::EventLoop;
use crate::params::Params;

/// Lifecycle states of an event source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSourceState {
    /// Not registered in an event loop
    Fresh,
    /// Registered but not running
    Stopped,
    Starting,
    Started,
    /// Stop requested, waiting for open resources to drain
    Stopping,
}

/// Connection states delivered to the application callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Opening,
    Established,
    Closing,
}

/// Opaque connection identifier handed out by a connection manager
pub type ConnectionId = u64;

/// Identifier of a registered event source within its loop
pub type SourceId = u64;

/// Callback from a connection manager into the application.
///
/// Delivered for state changes and received payloads. The attribute map
/// carries per-notification details (`remote-hostname`, `listen-port`,
/// `topic`, ...). The payload slice is only valid for the duration of the
/// call; the receive buffer behind it is reused.
pub type ConnectionCallback =
    Box<dyn FnMut(&dyn ConnectionManager, ConnectionId, ConnectionState, &Params, &[u8]) + Send>;

pub trait EventSource: Send + Sync {
    fn name(&self) -> &str;

    fn state(&self) -> EventSourceState;

    /// Binds the source to an event loop. Called by
    /// `EventLoop::register_event_source`; moves `Fresh` to `Stopped`.
    fn attach(&self, el: Weak<EventLoop>, id: SourceId) -> Result<(), Error>;

    /// Unbinds a stopped source, back to `Fresh`.
    fn detach(&self) -> Result<(), Error>;

    fn start(&self) -> Result<(), Error>;

    /// Requests a stop. Sources with open resources move to `Stopping` and
    /// report `Stopped` once everything has drained.
    fn stop(&self);

    /// Capability cast for sources that manage connections
    fn as_connection_manager(self: Arc<Self>) -> Option<Arc<dyn ConnectionManager>> {
        None
    }
}

/// A stream- or datagram-connection provider registered as an event source
pub trait ConnectionManager: EventSource {
    /// Protocol tag: "tcp", "udp" or "mqtt"
    fn protocol(&self) -> &str;

    /// Opens a connection described by `params`. Passive or active mode is
    /// selected from the parameters. Connection ids and all subsequent
    /// state changes arrive through the callback.
    fn open_connection(&self, params: &Params, callback: ConnectionCallback) -> Result<(), Error>;

    /// Sends a buffer over an open connection. The buffer is consumed in
    /// every branch, also on failure.
    fn send_with_connection(&self, id: ConnectionId, buf: BytesMut) -> Result<(), Error>;

    /// Asks for a connection to close. The close is always delayed to a
    /// later loop iteration; the application sees `Closing` from its
    /// callback.
    fn close_connection(&self, id: ConnectionId) -> Result<(), Error>;

    /// Allocates a send buffer for the connection. A hook so that stacked
    /// connection managers can reuse the allocation strategy of their
    /// transport.
    fn alloc_network_buffer(&self, id: ConnectionId, size: usize) -> Result<BytesMut, Error>;

    /// Releases a buffer that was never handed to `send_with_connection`
    fn free_network_buffer(&self, id: ConnectionId, buf: BytesMut);
}
