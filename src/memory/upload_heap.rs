//! Upload Heap
//!
//! One large host-visible buffer sub-allocated linearly. Unlike the
//! [`StagingPool`](super::StagingPool) it also batches the GPU side of an
//! upload: buffer and image copies plus the barriers around them are queued
//! and submitted together by [`UploadHeap::flush_and_finish`], which waits for
//! the copy queue and then rewinds the cursor to zero.
//!
//! ```text
//!  begin_batch()
//!    upload_image(a) ─┐
//!    upload_image(b) ─┼─ reserve + write + queue copies/barriers
//!    upload_buffer(c) ┘
//!  end_batch() ───────── one submission, one wait
//! ```
//!
//! # Flush vs. suballocate
//!
//! Two [`SyncCounter`]s keep a flush from racing with writers:
//! `allocating` counts live [`UploadReservation`]s, `flushing` counts flushes
//! in progress. A flush raises `flushing` (blocking new reservations) and
//! then waits for `allocating` to drain, so no reservation is ever rewound
//! while its bytes or copies are still being written.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use crate::backend::{
    Barrier, BufferDesc, BufferHandle, BufferImageCopy, BufferUsage, Command, CommandBufferLevel,
    GpuDevice, ImageDesc, ImageHandle, ImageLayout, MemoryLocation, ResourceAccess,
};
use crate::command::CommandQueue;
use crate::errors::{GpuError, Result};
use crate::memory::transient::align_up;

/// Alignment of buffer uploads.
const BUFFER_UPLOAD_ALIGNMENT: u64 = 4;
/// Alignment of image uploads (largest texel size).
const IMAGE_UPLOAD_ALIGNMENT: u64 = 16;

// ─── SyncCounter ─────────────────────────────────────────────────────────────

/// A counter threads can wait on until it drops back to zero.
#[derive(Debug, Default)]
pub struct SyncCounter {
    count: Mutex<u32>,
    zero: Condvar,
}

impl SyncCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        *self.count.lock() += 1;
    }

    pub fn dec(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.zero.notify_all();
        }
    }

    #[must_use]
    pub fn count(&self) -> u32 {
        *self.count.lock()
    }

    /// Blocks until the counter is zero.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.zero.wait(&mut count);
        }
    }
}

/// Decrements a counter when dropped.
struct CounterGuard<'a>(&'a SyncCounter);

impl Drop for CounterGuard<'_> {
    fn drop(&mut self) {
        self.0.dec();
    }
}

// ─── Reservation ─────────────────────────────────────────────────────────────

/// A live sub-range of the heap. The heap will not flush until every
/// reservation is dropped, so copies referencing it must be queued first.
pub struct UploadReservation<'a> {
    heap: &'a UploadHeap,
    offset: u64,
    size: u64,
}

impl UploadReservation<'_> {
    #[inline]
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn buffer(&self) -> BufferHandle {
        self.heap.buffer
    }

    /// Writes `data` at `offset` bytes into the reservation.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        if offset + data.len() as u64 > self.size {
            return Err(GpuError::DeviceCall {
                call: "write_buffer",
                reason: format!(
                    "{} bytes at {offset} overflow a {}-byte upload reservation",
                    data.len(),
                    self.size
                ),
            });
        }
        self.heap.device.write_buffer(self.heap.buffer, self.offset + offset, data)
    }

    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.write_at(0, data)
    }
}

impl Drop for UploadReservation<'_> {
    fn drop(&mut self) {
        self.heap.allocating.dec();
    }
}

// ─── Heap ────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct PendingWork {
    cursor: u64,
    copies: Vec<Command>,
    pre_barriers: SmallVec<[Barrier; 4]>,
    post_barriers: SmallVec<[Barrier; 4]>,
    batch_depth: u32,
}

pub struct UploadHeap {
    device: Arc<dyn GpuDevice>,
    queue: Arc<CommandQueue>,
    buffer: BufferHandle,
    size: u64,
    state: Mutex<PendingWork>,
    flush_lock: Mutex<()>,
    allocating: SyncCounter,
    flushing: SyncCounter,
}

impl UploadHeap {
    /// `queue` should be the copy queue; flushes submit to it.
    pub fn new(device: Arc<dyn GpuDevice>, queue: Arc<CommandQueue>, size: u64) -> Result<Self> {
        let buffer = device.create_buffer(&BufferDesc {
            label: "Upload Heap",
            size,
            usage: BufferUsage::TRANSFER_SRC,
            location: MemoryLocation::HostVisible,
        })?;
        log::info!("Upload heap: {size} bytes");
        Ok(Self {
            device,
            queue,
            buffer,
            size,
            state: Mutex::new(PendingWork::default()),
            flush_lock: Mutex::new(()),
            allocating: SyncCounter::new(),
            flushing: SyncCounter::new(),
        })
    }

    #[must_use]
    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes handed out since the last flush.
    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.state.lock().cursor
    }

    /// Copies waiting for the next flush.
    #[must_use]
    pub fn pending_copies(&self) -> usize {
        self.state.lock().copies.len()
    }

    /// Linear sub-allocation. Waits out an in-progress flush; returns `None`
    /// when the heap is full. A successful call registers a live allocation
    /// that the caller must balance with exactly one `allocating` decrement
    /// (done by [`UploadReservation`]'s drop).
    fn suballocate(&self, size: u64, alignment: u64) -> Option<u64> {
        loop {
            self.flushing.wait();
            let mut state = self.state.lock();
            if self.flushing.count() > 0 {
                continue;
            }
            let offset = align_up(state.cursor, alignment);
            if offset + size > self.size {
                return None;
            }
            state.cursor = offset + size;
            self.allocating.inc();
            return Some(offset);
        }
    }

    /// Reserves `size` bytes, flushing and retrying when the heap is full.
    ///
    /// A request larger than the whole heap is a configuration error.
    pub fn begin_suballocate(&self, size: u64, alignment: u64) -> Result<UploadReservation<'_>> {
        if size > self.size {
            let err = GpuError::UploadHeapTooSmall {
                requested: size,
                capacity: self.size,
            };
            log::error!("{err}");
            return Err(err);
        }
        loop {
            if let Some(offset) = self.suballocate(size, alignment) {
                return Ok(UploadReservation {
                    heap: self,
                    offset,
                    size,
                });
            }
            log::warn!("Upload heap full ({size} bytes requested); flushing under pressure");
            self.flush_and_finish()?;
        }
    }

    pub fn add_buffer_copy(&self, src_offset: u64, dst: BufferHandle, dst_offset: u64, size: u64) {
        self.state.lock().copies.push(Command::CopyBuffer {
            src: self.buffer,
            src_offset,
            dst,
            dst_offset,
            size,
        });
    }

    /// `region.buffer_offset` is an offset into the heap.
    pub fn add_image_copy(&self, dst: ImageHandle, region: BufferImageCopy) {
        self.state.lock().copies.push(Command::CopyBufferToImage {
            src: self.buffer,
            dst,
            region,
        });
    }

    /// Barrier recorded before every copy of the next flush.
    pub fn add_pre_barrier(&self, barrier: Barrier) {
        self.state.lock().pre_barriers.push(barrier);
    }

    /// Barrier recorded after every copy of the next flush.
    pub fn add_post_barrier(&self, barrier: Barrier) {
        self.state.lock().post_barriers.push(barrier);
    }

    /// Defers flushing across many uploads until the matching
    /// [`end_batch`](Self::end_batch). Batches nest.
    pub fn begin_batch(&self) {
        self.state.lock().batch_depth += 1;
    }

    /// Closes a batch; closing the outermost one flushes.
    pub fn end_batch(&self) -> Result<()> {
        let flush = {
            let mut state = self.state.lock();
            state.batch_depth = state.batch_depth.saturating_sub(1);
            state.batch_depth == 0
        };
        if flush { self.flush_and_finish() } else { Ok(()) }
    }

    #[must_use]
    pub fn in_batch(&self) -> bool {
        self.state.lock().batch_depth > 0
    }

    fn flush_unless_batched(&self) -> Result<()> {
        if self.in_batch() { Ok(()) } else { self.flush_and_finish() }
    }

    /// Submits every queued barrier and copy to the copy queue, blocks until
    /// it retires, then rewinds the heap.
    pub fn flush_and_finish(&self) -> Result<()> {
        let _serial = self.flush_lock.lock();

        {
            let _state = self.state.lock();
            self.flushing.inc();
        }
        let _flushing = CounterGuard(&self.flushing);
        self.allocating.wait();

        let pending = {
            let state = self.state.lock();
            !(state.pre_barriers.is_empty() && state.copies.is_empty() && state.post_barriers.is_empty())
        };

        if pending {
            let list = self.queue.get_command_list(CommandBufferLevel::Primary, None)?;
            let (pre, copies, post) = {
                let mut state = self.state.lock();
                (
                    std::mem::take(&mut state.pre_barriers),
                    std::mem::take(&mut state.copies),
                    std::mem::take(&mut state.post_barriers),
                )
            };

            let cb = list.buffer();
            if !pre.is_empty() {
                self.device.record(cb, Command::PipelineBarrier(pre.clone()));
            }
            for copy in &copies {
                self.device.record(cb, copy.clone());
            }
            if !post.is_empty() {
                self.device.record(cb, Command::PipelineBarrier(post.clone()));
            }

            let copy_count = copies.len();
            let value = match self.queue.submit(vec![list]) {
                Ok(value) => value,
                Err(err) => {
                    log::error!("Upload heap flush of {copy_count} copies failed, keeping them queued: {err}");
                    self.requeue(pre, copies, post);
                    return Err(err);
                }
            };
            self.queue.wait(value)?;
            log::debug!("Upload heap flushed {copy_count} copies");
        }

        self.state.lock().cursor = 0;
        Ok(())
    }

    /// Puts work from a failed flush back ahead of anything queued since.
    fn requeue(
        &self,
        mut pre: SmallVec<[Barrier; 4]>,
        mut copies: Vec<Command>,
        mut post: SmallVec<[Barrier; 4]>,
    ) {
        let mut state = self.state.lock();
        pre.extend(state.pre_barriers.drain(..));
        copies.append(&mut state.copies);
        post.extend(state.post_barriers.drain(..));
        state.pre_barriers = pre;
        state.copies = copies;
        state.post_barriers = post;
    }

    /// Uploads `data` into `dst` at `dst_offset` and makes it visible to
    /// shaders. Flushes right away unless a batch is open.
    pub fn upload_buffer(&self, dst: BufferHandle, dst_offset: u64, data: &[u8]) -> Result<()> {
        let size = data.len() as u64;
        {
            let reservation = self.begin_suballocate(size, BUFFER_UPLOAD_ALIGNMENT)?;
            reservation.write(data)?;
            self.add_buffer_copy(reservation.offset(), dst, dst_offset, size);
            self.add_post_barrier(Barrier::Buffer {
                buffer: dst,
                before: ResourceAccess::TransferWrite,
                after: ResourceAccess::ShaderRead,
            });
        }
        self.flush_unless_batched()
    }

    /// Uploads every mip of every layer of `image`. `data` holds the
    /// subresources tightly packed, layer by layer, mips in order within a
    /// layer. Transitions the image to `ShaderReadOnly`.
    pub fn upload_image(&self, image: ImageHandle, desc: &ImageDesc, data: &[u8]) -> Result<()> {
        let expected: u64 = (0..desc.mip_levels).map(|m| desc.mip_byte_size(m)).sum::<u64>()
            * u64::from(desc.array_layers);
        if data.len() as u64 != expected {
            return Err(GpuError::DeviceCall {
                call: "upload_image",
                reason: format!(
                    "'{}' expects {expected} bytes of pixel data, got {}",
                    desc.label,
                    data.len()
                ),
            });
        }

        {
            let reservation = self.begin_suballocate(expected, IMAGE_UPLOAD_ALIGNMENT)?;
            reservation.write(data)?;

            self.add_pre_barrier(Barrier::Image {
                image,
                old_layout: ImageLayout::Undefined,
                new_layout: ImageLayout::TransferDst,
                base_mip: 0,
                mip_count: desc.mip_levels,
            });
            let mut offset = reservation.offset();
            for layer in 0..desc.array_layers {
                for mip in 0..desc.mip_levels {
                    self.add_image_copy(
                        image,
                        BufferImageCopy {
                            buffer_offset: offset,
                            mip_level: mip,
                            array_layer: layer,
                            width: (desc.width >> mip).max(1),
                            height: (desc.height >> mip).max(1),
                        },
                    );
                    offset += desc.mip_byte_size(mip);
                }
            }
            self.add_post_barrier(Barrier::Image {
                image,
                old_layout: ImageLayout::TransferDst,
                new_layout: ImageLayout::ShaderReadOnly,
                base_mip: 0,
                mip_count: desc.mip_levels,
            });
        }
        self.flush_unless_batched()
    }
}

impl Drop for UploadHeap {
    fn drop(&mut self) {
        if let Err(err) = self.flush_and_finish() {
            log::error!("Upload heap dropped with unflushed work: {err}");
        }
        self.device.destroy_buffer(self.buffer);
    }
}

impl std::fmt::Debug for UploadHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadHeap")
            .field("buffer", &self.buffer)
            .field("size", &self.size)
            .field("cursor", &self.cursor())
            .field("allocating", &self.allocating.count())
            .finish_non_exhaustive()
    }
}
