//! Error types for the connection engine.

use std::io;
use thiserror::Error;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Which side of a connection an I/O error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
    Accept,
    Connect,
    Bind,
}

impl std::fmt::Display for IoOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IoOp::Read => "read",
            IoOp::Write => "write",
            IoOp::Accept => "accept",
            IoOp::Connect => "connect",
            IoOp::Bind => "bind",
        };
        f.write_str(name)
    }
}

/// Engine errors.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O failure on a transport.
    #[error("{op} failed: {source}")]
    Transport {
        op: IoOp,
        #[source]
        source: io::Error,
    },

    /// Malformed framing or payload.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A typed read needed more bytes than the reader holds.
    #[error("reader underflow: needed {needed} bytes, {available} available")]
    Underflow { needed: usize, available: usize },

    /// Handler storage and heap fallback both failed.
    #[error("allocation of {size} bytes failed")]
    AllocationFailure { size: usize },

    /// `start` was called on a connection that still owns a live transport.
    #[error("connection already started")]
    AlreadyStarted,
}

impl Error {
    pub fn transport(op: IoOp, source: io::Error) -> Self {
        Error::Transport { op, source }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Platform error code, when the error carries one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Transport { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    /// I/O error kind for transport errors.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Error::Transport { source, .. } => Some(source.kind()),
            _ => None,
        }
    }
}
