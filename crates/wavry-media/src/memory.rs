//! Shared memory regions backing pooled sample buffers.
//!
//! A region is created once by the session host and mapped by the client on
//! first use. Both sides hold a [`SharedMemory`] handle to the same bytes, so a
//! payload is written once by the producer and read in place by the consumer.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use wavry_common::{Error, Result};

struct Region {
    capacity: usize,
    bytes: Mutex<Box<[u8]>>,
}

/// Handle to one fixed-capacity memory region.
#[derive(Clone)]
pub struct SharedMemory {
    region: Arc<Region>,
}

impl SharedMemory {
    /// Allocate a zeroed region. Fails instead of aborting when memory is exhausted.
    pub fn allocate(capacity: usize) -> Result<Self> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(capacity).map_err(|e| {
            Error::allocation(format!("cannot reserve {capacity} bytes of shared memory: {e}"))
        })?;
        bytes.resize(capacity, 0);

        Ok(Self {
            region: Arc::new(Region {
                capacity,
                bytes: Mutex::new(bytes.into_boxed_slice()),
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.region.capacity
    }

    /// Copy `data` into the region starting at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        let end = self.checked_end(offset, data.len())?;
        self.region.bytes.lock()[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Copy `len` bytes starting at `offset` out of the region.
    pub fn read(&self, offset: usize, len: usize) -> Result<Bytes> {
        let end = self.checked_end(offset, len)?;
        Ok(Bytes::copy_from_slice(&self.region.bytes.lock()[offset..end]))
    }

    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.region.bytes.lock())
    }

    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.region.bytes.lock())
    }

    /// Whether both handles refer to the same region.
    pub fn same_region(&self, other: &SharedMemory) -> bool {
        Arc::ptr_eq(&self.region, &other.region)
    }

    /// Number of live handles (owner plus every mapping).
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.region)
    }

    fn checked_end(&self, offset: usize, len: usize) -> Result<usize> {
        match offset.checked_add(len) {
            Some(end) if end <= self.region.capacity => Ok(end),
            _ => Err(Error::invalid_argument(format!(
                "range {offset}+{len} exceeds region of {} bytes",
                self.region.capacity
            ))),
        }
    }
}

impl fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemory")
            .field("capacity", &self.region.capacity)
            .field("handles", &self.handle_count())
            .finish()
    }
}
