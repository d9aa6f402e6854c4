use std::io;
use thiserror::Error;

/// Errors surfaced by the event loop and the connection managers.
///
/// API calls either succeed without side effects visible to the caller or
/// return one of these kinds. The only exception is
/// `send_with_connection`, which consumes its buffer in every branch.
/// Errno-level socket failures are logged with their OS detail and
/// collapse to `Internal`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Internal error: {0}")]
    Internal(&'static str),
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Not found")]
    NotFound,
    #[error("Bad state: {0}")]
    BadState(&'static str),
    #[error("Connection rejected: {0}")]
    ConnectionRejected(&'static str),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Timeout")]
    Timeout,
}

impl Error {
    /// Logs an errno-level failure and collapses it to an internal error
    pub(crate) fn from_os(msg: &'static str) -> impl FnOnce(io::Error) -> Error {
        move |e| {
            log::warn!("{} ({})", msg, e);
            Error::Internal(msg)
        }
    }
}
