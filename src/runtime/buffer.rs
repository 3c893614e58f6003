//! Process-wide pool of size-classed byte blocks.
//!
//! Outbound data travels as `PooledBuffer`s: cheap-to-clone, reference
//! counted handles onto a block drawn from a `BufferPool`. When the last
//! handle drops, the block goes back to the free list of its size class
//! instead of back to the allocator.
//!
//! ## Size Classes
//!
//! Requests are rounded up inside geometric granularity bands:
//!
//! | request       | granularity |
//! |---------------|-------------|
//! | ..=256 B      | 16 B        |
//! | ..=4 KiB      | 256 B       |
//! | ..=64 KiB     | 4 KiB       |
//! | ..=1 MiB      | 64 KiB      |
//! | ..=16 MiB     | 1 MiB       |
//! | ..=256 MiB    | 16 MiB      |
//!
//! Every distinct rounded size gets its own free list. Anything larger than
//! the last band is allocated directly and never pooled.
//!
//! ## Deferred Release
//!
//! Returning a block does not take the pool lock every time. Released blocks
//! collect in a per-thread pending list that is flushed under the lock once
//! it holds `PENDING_RELEASE_LIMIT` bytes, when the thread exits, or when
//! `BufferPool::flush_pending` is called.

use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// (granularity, upper limit) for each size band.
const SIZE_BANDS: [(usize, usize); 6] = [
    (16, 256),
    (256, 4 << 10),
    (4 << 10, 64 << 10),
    (64 << 10, 1 << 20),
    (1 << 20, 16 << 20),
    (16 << 20, 256 << 20),
];

/// Bytes a thread may hold in its pending-release list before flushing.
const PENDING_RELEASE_LIMIT: usize = 4 << 20;

/// Round a request up to its pooled block size.
///
/// Returns `None` for requests the pool does not serve (zero or oversized).
pub fn class_size(size: usize) -> Option<usize> {
    if size == 0 {
        return None;
    }
    SIZE_BANDS
        .iter()
        .find(|(_, limit)| size <= *limit)
        .map(|(granularity, _)| size.div_ceil(*granularity) * granularity)
}

/// Free list and counters for one block size.
#[derive(Default)]
struct SizeClass {
    /// Stack of available blocks (LIFO for cache locality).
    free_list: Vec<Box<[u8]>>,
    /// Blocks currently handed out.
    used: usize,
    /// Total blocks ever handed out.
    allocations: u64,
}

struct PoolInner {
    classes: Mutex<HashMap<usize, SizeClass>>,
    /// Bytes currently handed out from pooled classes.
    allocated: AtomicUsize,
    /// Blocks served directly from the allocator (oversized requests).
    direct: AtomicU64,
    lazy_release: AtomicBool,
}

impl PoolInner {
    fn release_now(&self, class: usize, block: Box<[u8]>) {
        let mut classes = self.classes.lock();
        self.return_block(&mut classes, class, block);
    }

    fn return_block(&self, classes: &mut HashMap<usize, SizeClass>, class: usize, block: Box<[u8]>) {
        let entry = classes.entry(class).or_default();
        entry.used = entry.used.saturating_sub(1);
        entry.free_list.push(block);
        self.allocated.fetch_sub(class, Ordering::Relaxed);
    }
}

/// Status line for one size class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassStatus {
    pub size: usize,
    pub used: usize,
    pub available: usize,
    pub allocations: u64,
}

/// Pool of reusable byte blocks.
///
/// Cloning is cheap; all clones share the same free lists. Most code uses
/// the process-wide instance through `PooledBuffer::take`.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    /// Create an empty pool with deferred release enabled.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PoolInner {
                classes: Mutex::new(HashMap::new()),
                allocated: AtomicUsize::new(0),
                direct: AtomicU64::new(0),
                lazy_release: AtomicBool::new(true),
            }),
        }
    }

    /// The process-wide pool.
    pub fn global() -> &'static BufferPool {
        static GLOBAL: OnceLock<BufferPool> = OnceLock::new();
        GLOBAL.get_or_init(BufferPool::new)
    }

    /// Take a buffer with logical length `size`.
    ///
    /// The contents are unspecified until written.
    pub fn take(&self, size: usize) -> PooledBuffer {
        let Some(class) = class_size(size) else {
            if size == 0 {
                return PooledBuffer::blank();
            }
            self.inner.direct.fetch_add(1, Ordering::Relaxed);
            return PooledBuffer::from_block(Block {
                data: vec![0u8; size].into_boxed_slice(),
                len: size,
                origin: None,
            });
        };

        let data = {
            let mut classes = self.inner.classes.lock();
            let entry = classes.entry(class).or_default();
            entry.used += 1;
            entry.allocations += 1;
            entry.free_list.pop()
        };
        let data = data.unwrap_or_else(|| vec![0u8; class].into_boxed_slice());
        self.inner.allocated.fetch_add(class, Ordering::Relaxed);

        PooledBuffer::from_block(Block {
            data,
            len: size,
            origin: Some((Arc::downgrade(&self.inner), class)),
        })
    }

    /// Take a buffer holding a copy of `data`.
    pub fn copy_from(&self, data: &[u8]) -> PooledBuffer {
        let mut buffer = self.take(data.len());
        if let Some(out) = buffer.data_mut() {
            out.copy_from_slice(data);
        }
        buffer
    }

    /// Toggle deferred release. When disabled, blocks return to their free
    /// list as soon as the last handle drops.
    pub fn set_lazy_release(&self, value: bool) {
        self.inner.lazy_release.store(value, Ordering::Relaxed);
    }

    /// Flush this thread's pending-release list into the free lists.
    pub fn flush_pending() {
        PENDING.with(|pending| pending.borrow_mut().flush());
    }

    /// Bytes currently handed out from pooled classes.
    pub fn allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::Relaxed)
    }

    /// Number of size classes created so far.
    pub fn pools(&self) -> usize {
        self.inner.classes.lock().len()
    }

    /// Number of oversized requests served directly.
    pub fn direct_allocations(&self) -> u64 {
        self.inner.direct.load(Ordering::Relaxed)
    }

    /// Free blocks available in the class serving `size`.
    pub fn available(&self, size: usize) -> usize {
        class_size(size)
            .and_then(|class| {
                self.inner
                    .classes
                    .lock()
                    .get(&class)
                    .map(|c| c.free_list.len())
            })
            .unwrap_or(0)
    }

    /// Per-class usage, ordered by block size.
    pub fn status(&self) -> Vec<ClassStatus> {
        let classes = self.inner.classes.lock();
        let mut status: Vec<ClassStatus> = classes
            .iter()
            .map(|(size, class)| ClassStatus {
                size: *size,
                used: class.used,
                available: class.free_list.len(),
                allocations: class.allocations,
            })
            .collect();
        status.sort_by_key(|s| s.size);
        status
    }
}

/// Blocks released on this thread but not yet returned to their pool.
struct PendingRelease {
    blocks: Vec<(Weak<PoolInner>, usize, Box<[u8]>)>,
    total: usize,
}

impl PendingRelease {
    fn add(&mut self, pool: Weak<PoolInner>, class: usize, block: Box<[u8]>) {
        self.total += class;
        self.blocks.push((pool, class, block));
        if self.total >= PENDING_RELEASE_LIMIT {
            self.flush();
        }
    }

    fn flush(&mut self) {
        self.total = 0;
        let mut blocks = std::mem::take(&mut self.blocks);
        // Blocks usually come from a single pool; take its lock once per run.
        while let Some((pool, class, block)) = blocks.pop() {
            let Some(inner) = pool.upgrade() else {
                continue;
            };
            let mut classes = inner.classes.lock();
            inner.return_block(&mut classes, class, block);
            while let Some((next, _, _)) = blocks.last() {
                if !Weak::ptr_eq(next, &pool) {
                    break;
                }
                if let Some((_, class, block)) = blocks.pop() {
                    inner.return_block(&mut classes, class, block);
                }
            }
        }
    }
}

impl Drop for PendingRelease {
    fn drop(&mut self) {
        self.flush();
    }
}

thread_local! {
    static PENDING: RefCell<PendingRelease> = const {
        RefCell::new(PendingRelease {
            blocks: Vec::new(),
            total: 0,
        })
    };
}

struct Block {
    data: Box<[u8]>,
    len: usize,
    /// Owning pool and block size; `None` for blank and oversized blocks.
    origin: Option<(Weak<PoolInner>, usize)>,
}

impl Drop for Block {
    fn drop(&mut self) {
        let Some((pool, class)) = self.origin.take() else {
            return;
        };
        let data = std::mem::take(&mut self.data);
        let Some(inner) = pool.upgrade() else {
            return;
        };
        if !inner.lazy_release.load(Ordering::Relaxed) {
            inner.release_now(class, data);
            return;
        }
        let mut data = Some(data);
        // During thread teardown the pending list may already be gone.
        let _ = PENDING.try_with(|pending| {
            if let Ok(mut pending) = pending.try_borrow_mut() {
                if let Some(data) = data.take() {
                    pending.add(pool, class, data);
                }
            }
        });
        if let Some(data) = data {
            inner.release_now(class, data);
        }
    }
}

/// A shared, reference-counted view of a pooled block.
///
/// Cloning bumps the reference count; the block returns to its pool when the
/// last clone drops. A buffer is writable through `data_mut` only while it
/// is the sole handle.
#[derive(Clone)]
pub struct PooledBuffer {
    block: Arc<Block>,
}

impl PooledBuffer {
    fn from_block(block: Block) -> Self {
        Self {
            block: Arc::new(block),
        }
    }

    /// Take a buffer of `size` bytes from the process-wide pool.
    pub fn take(size: usize) -> Self {
        BufferPool::global().take(size)
    }

    /// Copy `data` into a buffer from the process-wide pool.
    pub fn copy_from(data: &[u8]) -> Self {
        BufferPool::global().copy_from(data)
    }

    /// The empty buffer.
    pub fn blank() -> Self {
        Self::from_block(Block {
            data: Box::default(),
            len: 0,
            origin: None,
        })
    }

    /// Logical length in bytes.
    pub fn len(&self) -> usize {
        self.block.len
    }

    pub fn is_empty(&self) -> bool {
        self.block.len == 0
    }

    /// Size of the underlying block.
    pub fn capacity(&self) -> usize {
        self.block.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.block.data[..self.block.len]
    }

    /// Mutable access to the logical bytes, if this is the only handle.
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        Arc::get_mut(&mut self.block).map(|block| &mut block.data[..block.len])
    }

    /// Change the logical length.
    ///
    /// # Panics
    /// Panics if `len` exceeds the capacity or the buffer is shared.
    pub fn resize(&mut self, len: usize) {
        let block = Arc::get_mut(&mut self.block).expect("resize of a shared buffer");
        assert!(len <= block.data.len(), "resize beyond capacity");
        block.len = len;
    }

    /// Number of live handles onto this block.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.block)
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("refs", &self.ref_count())
            .finish()
    }
}
