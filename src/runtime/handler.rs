//! Reusable storage for per-operation state.
//!
//! Each connection keeps a small allocator for the payloads it stages when
//! work is posted across threads. Steady-state posting reuses the same slots
//! instead of hitting the heap for every operation.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Default slot storage size.
pub const DEFAULT_SLOT_SIZE: usize = 0x200;

struct Slot {
    in_use: AtomicBool,
    storage: Mutex<Vec<u8>>,
}

/// Fixed set of reusable blocks with a heap fallback.
pub struct HandlerAllocator {
    slots: Box<[Slot]>,
    heap_fallbacks: AtomicU64,
}

impl HandlerAllocator {
    pub fn new(slots: usize, slot_size: usize) -> Arc<Self> {
        let slots = (0..slots)
            .map(|_| Slot {
                in_use: AtomicBool::new(false),
                storage: Mutex::new(Vec::with_capacity(slot_size)),
            })
            .collect();
        Arc::new(Self {
            slots,
            heap_fallbacks: AtomicU64::new(0),
        })
    }

    /// Claim a zeroed block of `size` bytes.
    ///
    /// Uses the first free slot, growing it when undersized. When every slot
    /// is busy the block comes from the heap instead.
    pub fn alloc(self: &Arc<Self>, size: usize) -> Result<HandlerBlock> {
        for (index, slot) in self.slots.iter().enumerate() {
            if slot
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            let mut data = std::mem::take(&mut *slot.storage.lock());
            data.clear();
            if let Err(err) = data.try_reserve(size) {
                *slot.storage.lock() = data;
                slot.in_use.store(false, Ordering::Release);
                warn!(size, %err, "handler slot growth failed");
                return Err(Error::AllocationFailure { size });
            }
            data.resize(size, 0);
            return Ok(HandlerBlock {
                data,
                origin: Some((self.clone(), index)),
            });
        }

        self.heap_fallbacks.fetch_add(1, Ordering::Relaxed);
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| Error::AllocationFailure { size })?;
        data.resize(size, 0);
        Ok(HandlerBlock { data, origin: None })
    }

    pub fn slots(&self) -> usize {
        self.slots.len()
    }

    /// Slots currently handed out.
    pub fn in_use(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.in_use.load(Ordering::Acquire))
            .count()
    }

    /// Allocations that found every slot busy.
    pub fn heap_fallbacks(&self) -> u64 {
        self.heap_fallbacks.load(Ordering::Relaxed)
    }

    fn release(&self, index: usize, data: Vec<u8>) {
        let slot = &self.slots[index];
        *slot.storage.lock() = data;
        slot.in_use.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for HandlerAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerAllocator")
            .field("slots", &self.slots())
            .field("in_use", &self.in_use())
            .field("heap_fallbacks", &self.heap_fallbacks())
            .finish()
    }
}

/// A block handed out by [`HandlerAllocator::alloc`]. Dropping it frees the
/// slot.
pub struct HandlerBlock {
    data: Vec<u8>,
    origin: Option<(Arc<HandlerAllocator>, usize)>,
}

impl HandlerBlock {
    /// Whether the block came from a slot rather than the heap.
    pub fn is_pooled(&self) -> bool {
        self.origin.is_some()
    }
}

impl Deref for HandlerBlock {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for HandlerBlock {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for HandlerBlock {
    fn drop(&mut self) {
        if let Some((allocator, index)) = self.origin.take() {
            allocator.release(index, std::mem::take(&mut self.data));
        }
    }
}
