//! Per-direction buffer pools for codec sessions.
//!
//! Buffers live in a versioned arena: every slot carries a generation that is
//! bumped when the slot's memory is disposed. A [`BufferId`] therefore stays
//! valid only as long as the allocation it named, and anything handed back
//! after a clear is recognized as stale instead of being silently reused.

use std::collections::VecDeque;

use tracing::{debug, trace};
use wavry_common::{BufferId, Direction, Error, PoolConfig, Result};

use crate::memory::SharedMemory;

/// Whether a pool backs samples with memory at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    /// Samples carry payload bytes in pooled shared memory.
    Backed,
    /// Render-to-surface output: only sample metadata flows, nothing is allocated.
    MetadataOnly,
}

/// Statistics about buffer pool usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    pub allocations: u64,
    pub reuses: u64,
    pub disposals: u64,
    pub in_use_count: usize,
    pub available_count: usize,
    pub total_bytes: usize,
}

impl BufferPoolStats {
    /// Buffers the pool currently owns, free or handed out.
    pub fn owned(&self) -> usize {
        self.in_use_count + self.available_count
    }
}

/// A pooled buffer bound to at most one sample at a time.
///
/// Deliberately not `Clone`: moving the value is moving ownership of the
/// identity, so two live samples can never share one.
#[derive(Debug)]
pub struct Buffer {
    id: BufferId,
    memory: SharedMemory,
}

impl Buffer {
    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.memory.capacity()
    }

    pub fn memory(&self) -> &SharedMemory {
        &self.memory
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    memory: Option<SharedMemory>,
    in_use: bool,
}

/// Allocator that hands out, recycles and right-sizes buffers for one session direction.
#[derive(Debug)]
pub struct BufferPool {
    direction: Direction,
    mode: PoolMode,
    config: PoolConfig,
    default_size: usize,
    slots: Vec<Slot>,
    free: VecDeque<u32>,
    vacant: Vec<u32>,
    total_bytes: usize,
    allocations: u64,
    reuses: u64,
    disposals: u64,
}

impl BufferPool {
    pub fn new(direction: Direction, config: PoolConfig) -> Self {
        Self::with_mode(direction, PoolMode::Backed, config)
    }

    /// Pool for render-to-surface output; never allocates.
    pub fn metadata_only(direction: Direction) -> Self {
        Self::with_mode(direction, PoolMode::MetadataOnly, PoolConfig::default())
    }

    fn with_mode(direction: Direction, mode: PoolMode, config: PoolConfig) -> Self {
        Self {
            direction,
            mode,
            config,
            default_size: config.default_size,
            slots: Vec::new(),
            free: VecDeque::new(),
            vacant: Vec::new(),
            total_bytes: 0,
            allocations: 0,
            reuses: 0,
            disposals: 0,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn mode(&self) -> PoolMode {
        self.mode
    }

    pub fn default_size(&self) -> usize {
        self.default_size
    }

    /// Hand out a free buffer of at least `min_size` bytes, allocating one if none fits.
    ///
    /// New buffers are sized `max(min_size, default_size)`.
    pub fn obtain(&mut self, min_size: usize) -> Result<Buffer> {
        if self.mode == PoolMode::MetadataOnly {
            return Err(Error::invalid_state(format!(
                "{:?} pool renders to a surface and has no buffers",
                self.direction
            )));
        }

        if let Some(pos) = self
            .free
            .iter()
            .position(|&index| self.slot_capacity(index) >= min_size)
        {
            if let Some(index) = self.free.remove(pos) {
                let slot = &mut self.slots[index as usize];
                if let Some(memory) = slot.memory.clone() {
                    slot.in_use = true;
                    self.reuses += 1;
                    let id = BufferId {
                        index,
                        generation: slot.generation,
                    };
                    trace!(direction = ?self.direction, buffer = %id, "reusing pooled buffer");
                    return Ok(Buffer { id, memory });
                }
            }
        }

        self.allocate(min_size.max(self.default_size).max(1))
    }

    /// Give a buffer back. Returns `true` when it was kept for reuse.
    ///
    /// Buffers smaller than the current default size are disposed rather than
    /// pooled, so the pool converges on the working-set size.
    pub fn recycle(&mut self, buffer: Buffer) -> bool {
        if !self.owns(buffer.id) {
            debug!(direction = ?self.direction, buffer = %buffer.id, "dropping stale buffer");
            return false;
        }

        if buffer.capacity() >= self.default_size {
            self.slots[buffer.id.index as usize].in_use = false;
            self.free.push_back(buffer.id.index);
            true
        } else {
            trace!(
                direction = ?self.direction,
                buffer = %buffer.id,
                capacity = buffer.capacity(),
                default_size = self.default_size,
                "disposing undersized buffer"
            );
            self.dispose_slot(buffer.id.index);
            false
        }
    }

    /// Dispose a handed-out buffer immediately instead of pooling it.
    pub fn dispose(&mut self, buffer: Buffer) {
        if self.owns(buffer.id) {
            self.dispose_slot(buffer.id.index);
        }
    }

    /// Record the platform's real buffer capacity; free buffers below it are disposed.
    pub fn set_default_size(&mut self, size: usize) {
        if size == self.default_size {
            return;
        }
        debug!(direction = ?self.direction, from = self.default_size, to = size, "pool default size changed");
        self.default_size = size;

        let undersized: Vec<u32> = self
            .free
            .iter()
            .copied()
            .filter(|&index| self.slot_capacity(index) < size)
            .collect();
        if undersized.is_empty() {
            return;
        }
        self.free.retain(|index| !undersized.contains(index));
        for index in undersized {
            self.dispose_slot(index);
        }
    }

    /// Dispose every buffer the pool owns, free or handed out.
    ///
    /// Buffers still held by samples become stale; recycling them later is a no-op.
    pub fn clear(&mut self) {
        self.free.clear();
        for index in 0..self.slots.len() {
            if self.slots[index].memory.is_some() {
                self.dispose_slot(index as u32);
            }
        }
    }

    /// Resolve an id to its backing memory, if the id is still current.
    pub fn lookup(&self, id: BufferId) -> Option<SharedMemory> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.memory.clone())
    }

    /// Whether `id` names a buffer currently handed out by this pool.
    pub fn owns(&self, id: BufferId) -> bool {
        self.slots
            .get(id.index as usize)
            .map(|slot| slot.generation == id.generation && slot.in_use && slot.memory.is_some())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            allocations: self.allocations,
            reuses: self.reuses,
            disposals: self.disposals,
            in_use_count: self.in_use_count(),
            available_count: self.available_count(),
            total_bytes: self.total_bytes,
        }
    }

    pub fn available_count(&self) -> usize {
        self.free.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.in_use).count()
    }

    pub fn memory_usage_bytes(&self) -> usize {
        self.total_bytes
    }

    fn owned_count(&self) -> usize {
        self.slots.len() - self.vacant.len()
    }

    fn slot_capacity(&self, index: u32) -> usize {
        self.slots[index as usize]
            .memory
            .as_ref()
            .map(SharedMemory::capacity)
            .unwrap_or(0)
    }

    fn exceeds_byte_limit(&self, size: usize) -> bool {
        self.total_bytes
            .checked_add(size)
            .map_or(true, |total| total > self.config.max_total_bytes)
    }

    fn allocate(&mut self, size: usize) -> Result<Buffer> {
        // Free buffers that did not fit are the cheapest thing to give up for room.
        while (self.owned_count() >= self.config.max_buffers
            || self.exceeds_byte_limit(size))
            && !self.free.is_empty()
        {
            if let Some(index) = self.free.pop_front() {
                self.dispose_slot(index);
            }
        }

        if self.owned_count() >= self.config.max_buffers {
            return Err(Error::allocation(format!(
                "{:?} pool already owns {} buffers",
                self.direction, self.config.max_buffers
            )));
        }
        if self.exceeds_byte_limit(size) {
            return Err(Error::allocation(format!(
                "{:?} pool cannot grow by {size} bytes past its {} byte limit",
                self.direction, self.config.max_total_bytes
            )));
        }

        let memory = SharedMemory::allocate(size)?;
        let index = match self.vacant.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    memory: None,
                    in_use: false,
                });
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.memory = Some(memory.clone());
        slot.in_use = true;
        self.total_bytes += size;
        self.allocations += 1;

        let id = BufferId {
            index,
            generation: slot.generation,
        };
        debug!(direction = ?self.direction, buffer = %id, size, "allocated buffer");
        Ok(Buffer { id, memory })
    }

    fn dispose_slot(&mut self, index: u32) {
        let slot = &mut self.slots[index as usize];
        if let Some(memory) = slot.memory.take() {
            self.total_bytes -= memory.capacity();
            slot.generation = slot.generation.wrapping_add(1);
            slot.in_use = false;
            self.vacant.push(index);
            self.disposals += 1;
        }
    }
}
