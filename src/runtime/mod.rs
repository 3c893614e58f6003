//! Connection runtime.
//!
//! Building blocks, leaf first:
//! - `buffer`: size-classed, reference-counted pooled buffers
//! - `queue`: outbound buffer queue and small-send staging
//! - `tracker`: in-flight operation accounting and the completion guard
//! - `handler`: reusable per-operation storage
//! - `transport`: TCP, local socket, named pipe and custom byte streams
//! - `connection`: the read and write loops over one transport
//! - `acceptor`: inbound transports for a listening endpoint

pub mod acceptor;
pub mod buffer;
pub mod connection;
pub mod handler;
pub mod queue;
pub mod tracker;
pub mod transport;

pub use acceptor::{Acceptor, AcceptorState};
pub use buffer::{BufferPool, PooledBuffer};
pub use connection::{
    active_connections, allocated_connections, Connection, ConnectionId, ConnectionOptions,
    ConnectionOwner, StopReason,
};
pub use handler::{HandlerAllocator, HandlerBlock};
pub use queue::{BufferQueue, BufferView, LazyBuffer};
pub use tracker::{AsyncContext, AsyncOperationGuard, AsyncOperationTracker};
pub use transport::{connect, Endpoint, Listener, Transport};
