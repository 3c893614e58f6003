//! A single packet-framed connection.
//!
//! A connection owns one transport, split into a read half and a write half.
//! At most one read and one write are in flight at any time. Each one runs
//! as a task on the connection's runtime and holds its own
//! `Arc<Connection>`. Every operation is counted by the connection's
//! [`AsyncOperationTracker`]. When the count drains after shutdown began,
//! the connection releases its buffers and transport and tells the owner it
//! finished, exactly once.
//!
//! The read buffer never sits behind the lock: the in-flight read task owns
//! it and hands it straight to the next read. Queue bookkeeping happens
//! under a short `parking_lot` lock that is never held across an await or
//! while calling into the owner.

use super::buffer::PooledBuffer;
use super::handler::{HandlerAllocator, DEFAULT_SLOT_SIZE};
use super::queue::{BufferQueue, BufferView, LazyBuffer};
use super::tracker::{AsyncContext, AsyncOperationGuard, AsyncOperationTracker};
use super::transport::Transport;
use crate::error::{Error, IoOp, Result};
use crate::packet::{self, PacketReader};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);
static ACTIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);
static ALLOCATED_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Connections started and not yet finished, process-wide.
pub fn active_connections() -> usize {
    ACTIVE_CONNECTIONS.load(Ordering::Relaxed)
}

/// Connection objects alive, process-wide.
pub fn allocated_connections() -> usize {
    ALLOCATED_CONNECTIONS.load(Ordering::Relaxed)
}

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why a connection stopped. Only the first reason is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    None,
    /// The read side failed or reached end of stream.
    Read,
    /// The write side failed, or everything was flushed after reading stopped.
    Write,
    /// The owner rejected inbound data.
    Protocol,
    /// Stopped on request.
    Local,
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Start active. A deferred connection is brought up by `start`.
    pub active: bool,
    /// Initial read buffer size.
    pub read_buffer_size: usize,
    /// The read buffer doubles while free space times this ratio is below
    /// its size. Zero keeps the buffer fixed; one is treated as two.
    pub threshold: usize,
    /// Capacity for coalescing small sends. Zero disables it.
    pub lazy_buffer_size: usize,
    /// Reusable slots for cross-thread posts.
    pub post_slots: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            active: true,
            read_buffer_size: 0x1000,
            threshold: 4,
            lazy_buffer_size: 0x400,
            post_slots: 4,
        }
    }
}

/// The application side of a connection.
pub trait ConnectionOwner: Send + Sync + 'static {
    /// Consume inbound packets. Bytes the reader has not consumed are kept
    /// for the next read. An error stops the connection.
    fn process_packets(&self, conn: &Arc<Connection>, reader: &mut PacketReader<'_>) -> Result<()>;

    /// The connection drained and released its transport.
    fn finish(&self, conn: &Arc<Connection>);

    /// Shutdown began. In-flight operations are still completing.
    fn shutdown(&self, _conn: &Arc<Connection>) {}
}

struct ReadState {
    reader: ReadHalf<Transport>,
    buffer: Vec<u8>,
    filled: usize,
}

struct State {
    queue: BufferQueue,
    lazy: LazyBuffer,
    writer: Option<WriteHalf<Transport>>,
    /// The read half while no read is in flight.
    read_slot: Option<ReadState>,
    attached: bool,
    stop_reason: StopReason,
    error: Option<Arc<Error>>,
    failed_operation: Option<IoOp>,
}

impl State {
    fn commit_lazy(&mut self) {
        if !self.lazy.is_empty() {
            let staged = self.lazy.commit();
            self.queue.push_back(staged);
        }
    }
}

pub struct Connection {
    id: ConnectionId,
    options: ConnectionOptions,
    owner: Arc<dyn ConnectionOwner>,
    tracker: AsyncOperationTracker,
    state: Mutex<State>,
    reading: AtomicBool,
    handle: Handle,
    aborted: watch::Sender<bool>,
    post_storage: Arc<HandlerAllocator>,
    reads: AtomicU32,
    writes: AtomicU32,
    read_position: AtomicUsize,
    last_read: AtomicI64,
    last_write: AtomicI64,
    last_locker: AtomicU64,
}

impl AsyncContext for Arc<Connection> {
    fn async_operations(&self) -> &AsyncOperationTracker {
        &self.tracker
    }

    fn finish(&self) {
        self.do_finish();
    }

    fn shutdown(&self) {
        self.do_shutdown();
    }
}

impl Connection {
    /// Create a connection on the current tokio runtime.
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime.
    pub fn new(owner: Arc<dyn ConnectionOwner>, options: ConnectionOptions) -> Arc<Self> {
        Self::with_handle(owner, options, Handle::current())
    }

    /// Create a connection whose operations run on `handle`.
    pub fn with_handle(
        owner: Arc<dyn ConnectionOwner>,
        mut options: ConnectionOptions,
        handle: Handle,
    ) -> Arc<Self> {
        options.read_buffer_size = options.read_buffer_size.max(1);
        // A ratio of one would double forever once any byte is buffered
        if options.threshold == 1 {
            options.threshold = 2;
        }
        ALLOCATED_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
        let now = now_millis();
        Arc::new(Self {
            id: ConnectionId::next(),
            tracker: AsyncOperationTracker::new(options.active),
            state: Mutex::new(State {
                queue: BufferQueue::new(),
                lazy: LazyBuffer::new(options.lazy_buffer_size),
                writer: None,
                read_slot: None,
                attached: false,
                stop_reason: StopReason::None,
                error: None,
                failed_operation: None,
            }),
            reading: AtomicBool::new(false),
            aborted: watch::channel(false).0,
            post_storage: HandlerAllocator::new(options.post_slots, DEFAULT_SLOT_SIZE),
            reads: AtomicU32::new(0),
            writes: AtomicU32::new(0),
            read_position: AtomicUsize::new(0),
            last_read: AtomicI64::new(now),
            last_write: AtomicI64::new(now),
            last_locker: AtomicU64::new(0),
            owner,
            options,
            handle,
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        let guard = self.state.lock();
        self.last_locker.store(current_thread_id(), Ordering::Relaxed);
        guard
    }

    /// Attach `transport` and arm the first read.
    ///
    /// A deferred or finished connection is activated first. A connection
    /// that still owns a live transport returns `AlreadyStarted`.
    pub fn start(self: &Arc<Self>, transport: Transport) -> Result<()> {
        let peer = transport.peer();
        let read = {
            let mut state = self.lock();
            if state.attached && !self.tracker.is_finished() {
                return Err(Error::AlreadyStarted);
            }
            if !self.tracker.is_active() {
                self.tracker.activate();
            }

            let (reader, writer) = tokio::io::split(transport);
            state.writer = Some(writer);
            state.attached = true;
            state.stop_reason = StopReason::None;
            state.error = None;
            state.failed_operation = None;
            self.reading.store(true, Ordering::Release);
            self.aborted.send_replace(false);
            self.read_position.store(0, Ordering::Relaxed);

            // Data queued by an active connection before it had a transport
            if !state.queue.is_empty() {
                self.async_write(&mut state);
            }

            ReadState {
                reader,
                buffer: vec![0u8; self.options.read_buffer_size],
                filled: 0,
            }
        };

        ACTIVE_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
        info!(conn = %self.id, %peer, "connection started");
        self.async_read(read);
        Ok(())
    }

    /// Queue `buffer` for sending.
    pub fn send(self: &Arc<Self>, buffer: PooledBuffer) {
        self.enqueue(|conn, state| {
            let was_empty = state.queue.is_empty();
            state.commit_lazy();
            state.queue.push_back(buffer);
            was_empty && conn.async_write(state)
        });
    }

    /// Queue several buffers, keeping their order.
    pub fn send_all<I>(self: &Arc<Self>, buffers: I)
    where
        I: IntoIterator<Item = PooledBuffer>,
    {
        self.enqueue(|conn, state| {
            let was_empty = state.queue.is_empty();
            state.commit_lazy();
            state.queue.add(buffers);
            was_empty && conn.async_write(state)
        });
    }

    /// Queue a copy of `data`, coalescing it with other small sends while a
    /// write is already queued.
    pub fn send_bytes(self: &Arc<Self>, data: &[u8]) {
        self.enqueue(|conn, state| {
            if state.queue.is_empty() {
                state.queue.push_back(PooledBuffer::copy_from(data));
                return conn.async_write(state);
            }
            if !state.lazy.feed(data) {
                state.commit_lazy();
                if !state.lazy.feed(data) {
                    state.queue.push_back(PooledBuffer::copy_from(data));
                }
            }
            false
        });
    }

    /// Run `push` under the lock unless shutdown began. `push` returns true
    /// when the connection went idle and should stop.
    fn enqueue<F>(self: &Arc<Self>, push: F)
    where
        F: FnOnce(&Arc<Self>, &mut State) -> bool,
    {
        if !self.tracker.is_active() {
            return;
        }
        let idle = {
            let mut state = self.lock();
            // Finish clears the queue under this lock; nothing may land after it
            if !self.tracker.is_active() {
                return;
            }
            push(self, &mut *state)
        };
        if idle {
            self.stop(StopReason::Write, None);
        }
    }

    /// Send a copy of `data` from a task on the connection's runtime.
    ///
    /// Safe to call from any thread. Does nothing once shutdown began.
    /// Before a transport is attached the data is queued directly.
    pub fn post(self: &Arc<Self>, data: &[u8]) {
        if !self.is_attached() {
            self.send_bytes(data);
            return;
        }
        if !self.tracker.prepare() {
            return;
        }
        let mut block = match self.post_storage.alloc(data.len()) {
            Ok(block) => block,
            Err(err) => {
                warn!(conn = %self.id, error = %err, "post dropped");
                drop(AsyncOperationGuard::new(self));
                return;
            }
        };
        block.copy_from_slice(data);

        let conn = self.clone();
        self.handle.spawn(async move {
            let _guard = AsyncOperationGuard::new(&conn);
            conn.send_bytes(&block);
        });
    }

    /// Send `buffer` from a task on the connection's runtime.
    pub fn post_buffer(self: &Arc<Self>, buffer: PooledBuffer) {
        if !self.is_attached() {
            self.send(buffer);
            return;
        }
        if !self.tracker.prepare() {
            return;
        }
        let conn = self.clone();
        self.handle.spawn(async move {
            let _guard = AsyncOperationGuard::new(&conn);
            conn.send(buffer);
        });
    }

    /// A posted operation completing with nothing else in flight finishes
    /// the connection, so posts wait for a transport.
    fn is_attached(&self) -> bool {
        self.lock().attached
    }

    /// Unsent bytes, queued or staged.
    pub fn send_queue_size(&self) -> usize {
        let state = self.lock();
        state.queue.total() + state.lazy.len()
    }

    /// Do not re-arm the read loop. The first reason and error are kept.
    pub fn stop_reading(&self, reason: StopReason, error: Option<Error>) {
        self.reading.store(false, Ordering::Release);
        self.record_stop(reason, error, None);
    }

    /// Begin shutting down. Returns true for the call that started it.
    ///
    /// In-flight operations complete with `ConnectionAborted`; the owner's
    /// `finish` runs once they all have.
    pub fn stop(self: &Arc<Self>, reason: StopReason, error: Option<Error>) -> bool {
        self.record_stop(reason, error, None);
        if self.tracker.shutdown() {
            self.do_shutdown();
            true
        } else {
            false
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.tracker.is_active()
    }

    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Acquire)
    }

    /// Outstanding tracked operations.
    pub fn operations(&self) -> u32 {
        self.tracker.count()
    }

    /// Reads in flight.
    pub fn reads(&self) -> u32 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Writes in flight.
    pub fn writes(&self) -> u32 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Bytes buffered but not yet consumed by the owner.
    pub fn read_position(&self) -> usize {
        self.read_position.load(Ordering::Relaxed)
    }

    /// Id of the thread that last took the connection lock.
    pub fn last_locker(&self) -> u64 {
        self.last_locker.load(Ordering::Relaxed)
    }

    /// Wall-clock milliseconds of the last completed read.
    pub fn last_read(&self) -> i64 {
        self.last_read.load(Ordering::Relaxed)
    }

    /// Wall-clock milliseconds of the last completed write.
    pub fn last_write(&self) -> i64 {
        self.last_write.load(Ordering::Relaxed)
    }

    pub fn stop_reason(&self) -> StopReason {
        self.lock().stop_reason
    }

    pub fn failed_operation(&self) -> Option<IoOp> {
        self.lock().failed_operation
    }

    pub fn error(&self) -> Option<Arc<Error>> {
        self.lock().error.clone()
    }

    /// Platform error code of the first error, if it carried one.
    pub fn error_code(&self) -> Option<i32> {
        self.lock().error.as_ref().and_then(|err| err.raw_os_error())
    }

    fn record_stop(&self, reason: StopReason, error: Option<Error>, op: Option<IoOp>) {
        let mut state = self.lock();
        if state.stop_reason == StopReason::None {
            state.stop_reason = reason;
            state.error = error.map(Arc::new);
            state.failed_operation = op;
        }
    }

    fn do_shutdown(self: &Arc<Self>) {
        debug!(conn = %self.id, "connection shutting down");
        self.aborted.send_replace(true);
        self.owner.shutdown(self);
    }

    fn do_finish(self: &Arc<Self>) {
        let (writer, read, attached) = {
            let mut state = self.lock();
            state.queue.clear();
            state.lazy.clear();
            (state.writer.take(), state.read_slot.take(), state.attached)
        };
        drop(writer);
        drop(read);
        self.reading.store(false, Ordering::Release);
        self.read_position.store(0, Ordering::Relaxed);
        self.aborted.send_replace(true);
        if attached {
            ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
        }

        let state = self.lock();
        info!(
            conn = %self.id,
            reason = ?state.stop_reason,
            error = ?state.error,
            "connection finished"
        );
        drop(state);
        self.owner.finish(self);
    }

    /// Arm one read unless reading stopped or shutdown began. The read
    /// state is parked when nothing is armed.
    fn async_read(self: &Arc<Self>, mut read: ReadState) {
        if !self.is_reading() || !self.tracker.prepare() {
            self.lock().read_slot = Some(read);
            return;
        }

        let threshold = self.options.threshold;
        let mut size = read.buffer.len();
        if threshold > 0 {
            while (size - read.filled).saturating_mul(threshold) < size {
                size *= 2;
            }
            if size != read.buffer.len() {
                trace!(conn = %self.id, from = read.buffer.len(), to = size, "read buffer grows");
                read.buffer.resize(size, 0);
            }
        }

        if read.filled == read.buffer.len() {
            let mut guard = AsyncOperationGuard::new(self);
            guard.failed();
            warn!(conn = %self.id, size, "packet exceeds read buffer");
            self.record_stop(
                StopReason::Protocol,
                Some(Error::protocol("packet exceeds read buffer")),
                None,
            );
            self.lock().read_slot = Some(read);
            return;
        }

        self.reads.fetch_add(1, Ordering::Relaxed);
        let conn = self.clone();
        let aborted = self.aborted.subscribe();
        self.handle.spawn(async move { conn.read_task(read, aborted).await });
    }

    async fn read_task(self: Arc<Self>, mut read: ReadState, mut aborted: watch::Receiver<bool>) {
        let result = {
            let ReadState {
                reader,
                buffer,
                filled,
            } = &mut read;
            tokio::select! {
                biased;
                _ = aborted.wait_for(|aborted| *aborted) => Err(io::ErrorKind::ConnectionAborted.into()),
                result = reader.read(&mut buffer[*filled..]) => result,
            }
        };
        self.reads.fetch_sub(1, Ordering::Relaxed);

        let mut guard = AsyncOperationGuard::new(&self);
        match result {
            Ok(0) => {
                debug!(conn = %self.id, "end of stream");
                guard.failed();
                self.fail(StopReason::Read, IoOp::Read, io::ErrorKind::UnexpectedEof.into());
                self.lock().read_slot = Some(read);
            }
            Ok(len) => {
                trace!(conn = %self.id, bytes = len, "read");
                read.filled += len;
                self.last_read.store(now_millis(), Ordering::Relaxed);
                self.read_position.store(read.filled, Ordering::Relaxed);

                let processed = {
                    let mut reader = PacketReader::new(&read.buffer[..read.filled]);
                    self.owner
                        .process_packets(&self, &mut reader)
                        .map(|()| reader.position())
                };
                match processed {
                    Ok(consumed) => {
                        read.filled = packet::compact(&mut read.buffer, consumed, read.filled);
                        self.read_position.store(read.filled, Ordering::Relaxed);
                        self.async_read(read);
                    }
                    Err(err) => {
                        warn!(conn = %self.id, error = %err, "inbound data rejected");
                        guard.failed();
                        self.record_stop(StopReason::Protocol, Some(err), None);
                        self.lock().read_slot = Some(read);
                    }
                }
            }
            Err(err) => {
                debug!(conn = %self.id, error = %err, "read failed");
                guard.failed();
                self.fail(StopReason::Read, IoOp::Read, err);
                self.lock().read_slot = Some(read);
            }
        }
    }

    /// Issue a write for the queue front, unless one is already out.
    ///
    /// Called under the lock. Returns true when the queue is empty and
    /// reading has stopped, meaning the connection should stop.
    fn async_write(self: &Arc<Self>, state: &mut State) -> bool {
        if state.queue.is_empty() {
            return !self.is_reading() && state.attached;
        }
        if state.writer.is_none() {
            return false;
        }
        if !self.tracker.prepare() {
            state.queue.clear();
            return false;
        }
        let Some(writer) = state.writer.take() else {
            return false;
        };

        self.writes.fetch_add(1, Ordering::Relaxed);
        let view = state.queue.view();
        let conn = self.clone();
        let aborted = self.aborted.subscribe();
        self.handle
            .spawn(async move { conn.write_task(writer, view, aborted).await });
        false
    }

    async fn write_task(
        self: Arc<Self>,
        mut writer: WriteHalf<Transport>,
        view: BufferView,
        mut aborted: watch::Receiver<bool>,
    ) {
        let result = {
            let slices = view.io_slices();
            let count = view.len();
            tokio::select! {
                biased;
                _ = aborted.wait_for(|aborted| *aborted) => Err(io::ErrorKind::ConnectionAborted.into()),
                result = writer.write_vectored(&slices[..count]) => result,
            }
        };
        self.writes.fetch_sub(1, Ordering::Relaxed);

        let mut guard = AsyncOperationGuard::new(&self);
        match result {
            Ok(0) => {
                guard.failed();
                self.fail(StopReason::Write, IoOp::Write, io::ErrorKind::WriteZero.into());
                self.lock().writer = Some(writer);
            }
            Ok(len) => {
                trace!(conn = %self.id, bytes = len, "wrote");
                self.last_write.store(now_millis(), Ordering::Relaxed);
                let idle = {
                    let mut state = self.lock();
                    state.queue.erase(len);
                    if state.queue.may_add() {
                        state.commit_lazy();
                    }
                    state.writer = Some(writer);
                    self.async_write(&mut state)
                };
                if idle {
                    self.stop(StopReason::Write, None);
                }
            }
            Err(err) => {
                debug!(conn = %self.id, error = %err, "write failed");
                guard.failed();
                self.fail(StopReason::Write, IoOp::Write, err);
                self.lock().writer = Some(writer);
            }
        }
    }

    fn fail(&self, reason: StopReason, op: IoOp, err: io::Error) {
        self.record_stop(reason, Some(Error::transport(op, err)), Some(op));
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .field("operations", &self.operations())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        ALLOCATED_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{pack_raw, Packet};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    #[derive(Debug, PartialEq)]
    enum Event {
        Packet(u8, Vec<u8>),
        Shutdown,
        Finish,
    }

    /// Records events and optionally echoes every packet.
    struct Recorder {
        events: mpsc::UnboundedSender<Event>,
        echo: bool,
        reject_code: Option<u8>,
    }

    impl ConnectionOwner for Recorder {
        fn process_packets(&self, conn: &Arc<Connection>, reader: &mut PacketReader<'_>) -> Result<()> {
            while let Some(Packet { code, payload }) = reader.next_packet()? {
                if Some(code) == self.reject_code {
                    return Err(Error::protocol(format!("code {code} rejected")));
                }
                let _ = self.events.send(Event::Packet(code, payload.to_vec()));
                if self.echo {
                    conn.send(pack_raw(code, payload));
                }
            }
            Ok(())
        }

        fn finish(&self, _conn: &Arc<Connection>) {
            let _ = self.events.send(Event::Finish);
        }

        fn shutdown(&self, _conn: &Arc<Connection>) {
            let _ = self.events.send(Event::Shutdown);
        }
    }

    fn recorder(echo: bool) -> (Arc<Recorder>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Recorder {
                events: tx,
                echo,
                reject_code: None,
            }),
            rx,
        )
    }

    fn started(owner: Arc<Recorder>, options: ConnectionOptions) -> (Arc<Connection>, DuplexStream) {
        let (local, remote) = duplex(64 * 1024);
        let conn = Connection::new(owner, options);
        conn.start(Transport::custom(local)).unwrap();
        (conn, remote)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("owner dropped")
    }

    async fn wait_finish(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
        let mut seen = Vec::new();
        loop {
            let event = next_event(rx).await;
            let done = event == Event::Finish;
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    async fn read_packet(remote: &mut DuplexStream) -> (u8, Vec<u8>) {
        let mut buffer = Vec::new();
        loop {
            let mut chunk = [0u8; 512];
            let n = timeout(Duration::from_secs(5), remote.read(&mut chunk))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0, "peer closed");
            buffer.extend_from_slice(&chunk[..n]);
            let mut reader = PacketReader::new(&buffer);
            if let Some(packet) = reader.next_packet().unwrap() {
                return (packet.code, packet.payload.to_vec());
            }
        }
    }

    #[tokio::test]
    async fn test_echo_roundtrip() {
        let (owner, mut events) = recorder(true);
        let (conn, mut remote) = started(owner, ConnectionOptions::default());
        assert!(conn.is_active());
        assert!(conn.is_reading());

        remote.write_all(&pack_raw(7, b"hi")).await.unwrap();
        assert_eq!(next_event(&mut events).await, Event::Packet(7, b"hi".to_vec()));
        assert_eq!(read_packet(&mut remote).await, (7, b"hi".to_vec()));
        assert_ne!(conn.last_locker(), 0);
    }

    #[tokio::test]
    async fn test_split_packet_across_reads() {
        let (owner, mut events) = recorder(false);
        let (conn, mut remote) = started(owner, ConnectionOptions::default());

        let packet = pack_raw(3, b"split payload");
        remote.write_all(&packet[..2]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(conn.read_position(), 2);

        remote.write_all(&packet[2..]).await.unwrap();
        assert_eq!(
            next_event(&mut events).await,
            Event::Packet(3, b"split payload".to_vec())
        );
    }

    #[tokio::test]
    async fn test_peer_close_finishes_once() {
        let (owner, mut events) = recorder(false);
        let (conn, remote) = started(owner, ConnectionOptions::default());

        drop(remote);
        let seen = wait_finish(&mut events).await;

        // The failed read was the only operation, so it finishes directly
        assert_eq!(seen, vec![Event::Finish]);
        assert_eq!(conn.stop_reason(), StopReason::Read);
        assert_eq!(conn.failed_operation(), Some(IoOp::Read));
        assert_eq!(
            conn.error().and_then(|err| err.io_kind()),
            Some(io::ErrorKind::UnexpectedEof)
        );
        assert!(!conn.is_active());
        assert_eq!(conn.operations(), 0);

        // Nothing is queued after finish
        conn.send_bytes(b"late");
        assert_eq!(conn.send_queue_size(), 0);
    }

    #[tokio::test]
    async fn test_protocol_error_stops() {
        let (tx, mut events) = mpsc::unbounded_channel();
        let owner = Arc::new(Recorder {
            events: tx,
            echo: false,
            reject_code: Some(9),
        });
        let (conn, mut remote) = started(owner, ConnectionOptions::default());

        remote.write_all(&pack_raw(9, b"bad")).await.unwrap();
        wait_finish(&mut events).await;
        assert_eq!(conn.stop_reason(), StopReason::Protocol);
        assert!(matches!(conn.error().as_deref(), Some(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_local_stop_aborts_pending_read() {
        let (owner, mut events) = recorder(false);
        let (conn, _remote) = started(owner, ConnectionOptions::default());

        assert!(conn.stop(StopReason::Local, None));
        assert!(!conn.stop(StopReason::Local, None));

        let seen = wait_finish(&mut events).await;
        assert_eq!(seen, vec![Event::Shutdown, Event::Finish]);
        assert_eq!(conn.stop_reason(), StopReason::Local);
        assert!(conn.error().is_none());
    }

    #[tokio::test]
    async fn test_many_buffers_arrive_in_order() {
        let (owner, _events) = recorder(false);
        let (conn, mut remote) = started(owner, ConnectionOptions::default());

        let mut expected = Vec::new();
        let buffers: Vec<_> = (0..10u8)
            .map(|i| {
                let chunk = vec![i; 100 + i as usize];
                expected.extend_from_slice(&chunk);
                PooledBuffer::copy_from(&chunk)
            })
            .collect();
        conn.send_all(buffers);

        let mut received = vec![0u8; expected.len()];
        timeout(Duration::from_secs(5), remote.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_small_sends_coalesce() {
        let (owner, _events) = recorder(false);
        let (local, mut remote) = duplex(16);
        let conn = Connection::new(owner, ConnectionOptions::default());
        conn.start(Transport::custom(local)).unwrap();

        let mut expected = Vec::new();
        for i in 0..200u32 {
            let bytes = i.to_le_bytes();
            expected.extend_from_slice(&bytes);
            conn.send_bytes(&bytes);
        }

        let mut received = vec![0u8; expected.len()];
        timeout(Duration::from_secs(5), remote.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, expected);
        assert_eq!(conn.send_queue_size(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_post_from_other_threads() {
        let (owner, _events) = recorder(false);
        let (conn, mut remote) = started(owner, ConnectionOptions::default());

        let threads: Vec<_> = (0..4u8)
            .map(|i| {
                let conn = conn.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        conn.post(&[i]);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let mut received = vec![0u8; 100];
        timeout(Duration::from_secs(5), remote.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        for i in 0..4u8 {
            assert_eq!(received.iter().filter(|b| **b == i).count(), 25);
        }
    }

    #[tokio::test]
    async fn test_read_buffer_grows() {
        let (owner, mut events) = recorder(false);
        let options = ConnectionOptions {
            read_buffer_size: 16,
            threshold: 2,
            ..ConnectionOptions::default()
        };
        let (_conn, mut remote) = started(owner, options);

        let payload = vec![0xAB; 1000];
        remote.write_all(&pack_raw(1, &payload)).await.unwrap();
        assert_eq!(next_event(&mut events).await, Event::Packet(1, payload));
    }

    #[tokio::test]
    async fn test_fixed_buffer_overflow_is_protocol_error() {
        let (owner, mut events) = recorder(false);
        let options = ConnectionOptions {
            read_buffer_size: 8,
            threshold: 0,
            ..ConnectionOptions::default()
        };
        let (conn, mut remote) = started(owner, options);

        remote.write_all(&pack_raw(1, &[0u8; 32])).await.unwrap();
        wait_finish(&mut events).await;
        assert_eq!(conn.stop_reason(), StopReason::Protocol);
    }

    #[tokio::test]
    async fn test_start_twice_and_restart() {
        let (owner, mut events) = recorder(true);
        let (conn, remote) = started(owner, ConnectionOptions::default());

        let (spare, _other) = duplex(64);
        assert!(matches!(
            conn.start(Transport::custom(spare)),
            Err(Error::AlreadyStarted)
        ));

        drop(remote);
        wait_finish(&mut events).await;

        // A finished connection can run again over a fresh transport
        let (local, mut remote) = duplex(1024);
        conn.start(Transport::custom(local)).unwrap();
        assert!(conn.is_active());
        assert_eq!(conn.stop_reason(), StopReason::None);

        remote.write_all(&pack_raw(2, b"again")).await.unwrap();
        assert_eq!(read_packet(&mut remote).await, (2, b"again".to_vec()));
    }

    #[tokio::test]
    async fn test_deferred_connection() {
        let (owner, _events) = recorder(false);
        let conn = Connection::new(
            owner,
            ConnectionOptions {
                active: false,
                ..ConnectionOptions::default()
            },
        );
        assert!(!conn.is_active());

        conn.send_bytes(b"dropped");
        conn.post(b"dropped");
        assert_eq!(conn.send_queue_size(), 0);

        let (local, mut remote) = duplex(1024);
        conn.start(Transport::custom(local)).unwrap();
        conn.send_bytes(b"live");
        let mut buffer = [0u8; 4];
        remote.read_exact(&mut buffer).await.unwrap();
        assert_eq!(&buffer, b"live");
    }

    #[tokio::test]
    async fn test_flush_then_stop_after_reading_stops() {
        let (owner, mut events) = recorder(false);
        let (conn, mut remote) = started(owner, ConnectionOptions::default());

        conn.stop_reading(StopReason::Local, None);
        conn.send_bytes(b"bye");

        let mut buffer = [0u8; 3];
        remote.read_exact(&mut buffer).await.unwrap();
        assert_eq!(&buffer, b"bye");

        // The queue drained with reading stopped, so the connection winds down
        let seen = wait_finish(&mut events).await;
        assert!(seen.contains(&Event::Shutdown));
        assert_eq!(conn.stop_reason(), StopReason::Local);
    }

    #[tokio::test]
    async fn test_scripted_transport() {
        let (owner, mut events) = recorder(true);
        let request = pack_raw(5, b"abc");
        let mock = tokio_test::io::Builder::new()
            .read(&request)
            .write(&request)
            .build();

        let conn = Connection::new(owner, ConnectionOptions::default());
        conn.start(Transport::custom(mock)).unwrap();

        let seen = wait_finish(&mut events).await;
        assert_eq!(seen[0], Event::Packet(5, b"abc".to_vec()));
        assert_eq!(conn.stop_reason(), StopReason::Read);
    }

    #[tokio::test]
    async fn test_post_before_start_is_queued() {
        let (owner, mut events) = recorder(false);
        let conn = Connection::new(owner, ConnectionOptions::default());

        conn.post(b"hello");
        conn.post_buffer(PooledBuffer::copy_from(b"!"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(conn.is_active());
        assert_eq!(conn.send_queue_size(), 6);
        assert!(events.try_recv().is_err());

        let (local, mut remote) = duplex(1024);
        conn.start(Transport::custom(local)).unwrap();
        let mut buffer = [0u8; 6];
        remote.read_exact(&mut buffer).await.unwrap();
        assert_eq!(&buffer, b"hello!");
    }

    #[tokio::test]
    async fn test_huge_threshold_grows_only_when_full() {
        let (owner, mut events) = recorder(false);
        let options = ConnectionOptions {
            read_buffer_size: 8,
            threshold: usize::MAX,
            ..ConnectionOptions::default()
        };
        let (conn, mut remote) = started(owner, options);

        let payload = vec![0x5A; 40];
        remote.write_all(&pack_raw(3, &payload)).await.unwrap();
        assert_eq!(next_event(&mut events).await, Event::Packet(3, payload));
        assert!(conn.is_active());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sends_racing_finish_leave_nothing_queued() {
        let (owner, mut events) = recorder(false);
        let (conn, remote) = started(owner, ConnectionOptions::default());

        let done = Arc::new(AtomicBool::new(false));
        let senders: Vec<_> = (0..3)
            .map(|_| {
                let conn = conn.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    while !done.load(Ordering::Relaxed) {
                        conn.send_bytes(b"late");
                    }
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.stop(StopReason::Local, None);
        wait_finish(&mut events).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        done.store(true, Ordering::Relaxed);
        for sender in senders {
            sender.join().unwrap();
        }

        assert_eq!(conn.send_queue_size(), 0);
        conn.send_bytes(b"after");
        assert_eq!(conn.send_queue_size(), 0);
        drop(remote);
    }

    #[tokio::test]
    async fn test_connection_ids_are_unique() {
        let (owner, _events) = recorder(false);
        let a = Connection::new(owner.clone(), ConnectionOptions::default());
        let b = Connection::new(owner, ConnectionOptions::default());
        assert_ne!(a.id(), b.id());
        assert!(allocated_connections() >= 2);
        assert!(a.id().to_string().starts_with('#'));
    }
}
