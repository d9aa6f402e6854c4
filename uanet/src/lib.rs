//! Event-driven networking core for OPC UA stacks.
//!
//! The center is the [`EventLoop`]: a single-threaded cooperative scheduler
//! over cyclic timers, registered file descriptors, OS signals and a
//! delayed-callback queue. Connection managers for TCP, UDP and MQTT plug
//! into the loop as [`EventSource`]s and expose one uniform
//! open/send/close contract; the interrupt manager turns POSIX signals
//! into loop callbacks.
//!
//! ```no_run
//! use std::time::Duration;
//! use uanet::{EventLoop, EventLoopState, TcpConnectionManager};
//!
//! let el = EventLoop::new();
//! let tcp = TcpConnectionManager::new("tcp");
//! el.register_event_source(tcp.clone()).unwrap();
//! el.start().unwrap();
//! while el.state() != EventLoopState::Stopped {
//!     el.run(Duration::from_millis(100)).unwrap();
//! }
//! ```

mod error;
mod eventloop;
mod interrupt;
mod mqtt;
mod net;
mod params;
mod poll;
mod source;
mod tcp;
mod timer;
mod udp;

pub use error::Error;
pub use eventloop::{EventLoop, EventLoopState};
pub use interrupt::{InterruptCallback, InterruptManager};
pub use mqtt::MqttConnectionManager;
pub use params::{Params, Value};
pub use poll::{FdEvents, FdInterest, Poller, SelectPoller};
#[cfg(target_os = "linux")]
pub use poll::EpollPoller;
pub use source::{
    ConnectionCallback, ConnectionId, ConnectionManager, ConnectionState, EventSource,
    EventSourceState, SourceId,
};
pub use tcp::TcpConnectionManager;
pub use timer::{now_monotonic, TimerId, TimerPolicy};
pub use udp::UdpConnectionManager;
