//! packet-link: an asynchronous, packet-framed connection engine.
//!
//! Features:
//! - One connection type over TCP, Unix domain sockets, named pipes or any
//!   custom byte stream
//! - `[code][varlen][payload]` framing with streaming decode and optional
//!   zlib payloads
//! - Pooled, reference-counted buffers and scatter-gather writes
//! - A shutdown protocol that lets in-flight reads, writes and posted sends
//!   complete on any thread and finishes each connection exactly once

pub mod error;
pub mod packet;
pub mod runtime;

pub use error::{Error, IoOp, Result};
pub use packet::{Packet, PacketReader};
pub use runtime::{
    Acceptor, Connection, ConnectionOptions, ConnectionOwner, Endpoint, PooledBuffer, StopReason,
    Transport,
};
