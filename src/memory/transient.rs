//! Transient Buffer Pool
//!
//! One host-visible GPU buffer backed by a [`RingWithTabs`]. This is the
//! path for per-draw uniform data and per-frame dynamic vertex/index data:
//! bytes are written straight into the mapped buffer and referenced by
//! offset, never staged through a copy.
//!
//! An allocation is a view into the pool's buffer. It stays valid until the
//! tab that produced it is recycled, i.e. for `back_buffer_count` frame
//! boundaries. Callers must not hold on to it longer.

use std::sync::Arc;

use crate::backend::{BufferDesc, BufferHandle, BufferUsage, GpuDevice, MemoryLocation};
use crate::errors::{GpuError, Result};
use crate::memory::ring::RingWithTabs;

/// Alignment the backing buffer size is rounded up to.
pub const TRANSIENT_BUFFER_ALIGNMENT: u64 = 256;

/// A sub-range of the transient buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransientAllocation {
    pub buffer: BufferHandle,
    pub offset: u64,
    /// Aligned size of the reservation.
    pub size: u64,
}

#[inline]
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

pub struct TransientBufferPool {
    device: Arc<dyn GpuDevice>,
    buffer: BufferHandle,
    ring: RingWithTabs,
    alignment: u64,
}

impl TransientBufferPool {
    /// Creates the backing buffer (`total_size` rounded up to 256 bytes) and
    /// a ring with `back_buffer_count` tabs over it.
    pub fn new(
        device: Arc<dyn GpuDevice>,
        usage: BufferUsage,
        back_buffer_count: usize,
        total_size: u64,
        alignment: u64,
    ) -> Result<Self> {
        let size = align_up(total_size, TRANSIENT_BUFFER_ALIGNMENT);
        let buffer = device.create_buffer(&BufferDesc {
            label: "Transient Buffer Pool",
            size,
            usage,
            location: MemoryLocation::HostVisible,
        })?;
        log::info!("Transient buffer pool: {size} bytes, {back_buffer_count} frame tabs");

        Ok(Self {
            device,
            buffer,
            ring: RingWithTabs::new(back_buffer_count, size),
            alignment: alignment.max(1),
        })
    }

    /// Reserves `size` bytes (rounded up to the pool alignment).
    ///
    /// Running out of room is a configuration error: the ring is too small
    /// for the frame's workload.
    pub fn allocate(&mut self, size: u64) -> Result<TransientAllocation> {
        let size = align_up(size.max(1), self.alignment);
        match self.ring.alloc(size) {
            Some(offset) => Ok(TransientAllocation {
                buffer: self.buffer,
                offset,
                size,
            }),
            None => {
                let err = GpuError::TransientPoolExhausted {
                    requested: size,
                    allocated: self.ring.allocated_size(),
                    capacity: self.ring.total_size(),
                };
                log::error!("{err}");
                Err(err)
            }
        }
    }

    /// Reserves room for `data` and writes it.
    pub fn allocate_bytes(&mut self, data: &[u8]) -> Result<TransientAllocation> {
        let allocation = self.allocate(data.len() as u64)?;
        self.write(&allocation, data)?;
        Ok(allocation)
    }

    /// Reserves room for one `T` and writes it.
    pub fn allocate_value<T: bytemuck::Pod>(&mut self, value: &T) -> Result<TransientAllocation> {
        self.allocate_bytes(bytemuck::bytes_of(value))
    }

    /// Writes into a live allocation. `data` must fit its size.
    pub fn write(&self, allocation: &TransientAllocation, data: &[u8]) -> Result<()> {
        if data.len() as u64 > allocation.size {
            return Err(GpuError::DeviceCall {
                call: "write_buffer",
                reason: format!(
                    "{} bytes written into a {}-byte transient allocation",
                    data.len(),
                    allocation.size
                ),
            });
        }
        self.device.write_buffer(allocation.buffer, allocation.offset, data)
    }

    /// Frame boundary: reclaims the oldest tab.
    pub fn on_frame_advance(&mut self) {
        let freed = self.ring.on_begin_frame();
        if freed > 0 {
            log::debug!("Transient pool reclaimed {freed} bytes");
        }
    }

    #[must_use]
    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    #[must_use]
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Bytes held by all live frames.
    #[must_use]
    pub fn allocated_size(&self) -> u64 {
        self.ring.allocated_size()
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.ring.total_size()
    }
}

impl Drop for TransientBufferPool {
    fn drop(&mut self) {
        self.device.destroy_buffer(self.buffer);
    }
}

impl std::fmt::Debug for TransientBufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransientBufferPool")
            .field("buffer", &self.buffer)
            .field("ring", &self.ring)
            .field("alignment", &self.alignment)
            .finish_non_exhaustive()
    }
}
