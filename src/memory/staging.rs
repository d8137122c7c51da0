//! Staging Pool
//!
//! Host-visible scratch buffers used as the intermediate hop for CPU to GPU
//! transfers that are not batched through the [`UploadHeap`].
//!
//! Free blocks are kept in a map ordered by capacity so a request picks the
//! smallest block that fits. A block handed out moves to the used set and
//! returns to the free set only after it has sat for `reuse_age` frames,
//! which is how the pool knows the GPU has finished reading it. The pool
//! never keeps a block mapped: every acquire is one map/copy/flush/unmap.
//!
//! [`UploadHeap`]: crate::memory::UploadHeap

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::backend::{BufferDesc, BufferHandle, BufferUsage, GpuDevice, MemoryLocation};
use crate::errors::{GpuError, Result};

/// A staging block held by a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageRef {
    pub id: u64,
    pub buffer: BufferHandle,
    /// Size of the block, at least `size`.
    pub capacity: u64,
    /// Bytes of payload written at offset 0.
    pub size: u64,
}

#[derive(Debug, Clone, Copy)]
struct Block {
    id: u64,
    buffer: BufferHandle,
    capacity: u64,
    last_used_frame: u64,
}

#[derive(Default)]
struct State {
    next_id: u64,
    frame: u64,
    free: BTreeMap<u64, Vec<Block>>,
    used: FxHashMap<u64, Block>,
}

impl State {
    fn take_free(&mut self, size: u64) -> Option<Block> {
        let capacity = *self.free.range(size..).next()?.0;
        let bucket = self.free.get_mut(&capacity)?;
        let block = bucket.pop();
        if bucket.is_empty() {
            self.free.remove(&capacity);
        }
        block
    }

    fn free_count(&self) -> usize {
        self.free.values().map(Vec::len).sum()
    }
}

pub struct StagingPool {
    device: Arc<dyn GpuDevice>,
    reuse_age: u64,
    state: Mutex<State>,
}

impl StagingPool {
    #[must_use]
    pub fn new(device: Arc<dyn GpuDevice>, reuse_age: u64) -> Self {
        Self {
            device,
            reuse_age,
            state: Mutex::new(State::default()),
        }
    }

    /// Copies `data` into the smallest free block that holds it, creating an
    /// exactly-sized block on a miss.
    pub fn acquire_stage(&self, data: &[u8]) -> Result<StageRef> {
        let size = data.len() as u64;
        let mut state = self.state.lock();

        let mut block = match state.take_free(size) {
            Some(block) => block,
            None => {
                let buffer = self.device.create_buffer(&BufferDesc {
                    label: "Staging Block",
                    size: size.max(1),
                    usage: BufferUsage::TRANSFER_SRC,
                    location: MemoryLocation::HostVisible,
                })?;
                state.next_id += 1;
                log::debug!("Staging pool: new {size}-byte block");
                Block {
                    id: state.next_id,
                    buffer,
                    capacity: size.max(1),
                    last_used_frame: 0,
                }
            }
        };

        if let Err(err) = self.device.write_buffer(block.buffer, 0, data) {
            state.free.entry(block.capacity).or_default().push(block);
            return Err(err);
        }
        block.last_used_frame = state.frame;
        state.used.insert(block.id, block);

        Ok(StageRef {
            id: block.id,
            buffer: block.buffer,
            capacity: block.capacity,
            size,
        })
    }

    /// Once per frame: returns blocks unused for `reuse_age` frames to the
    /// free set. Returns how many were recycled.
    pub fn gc(&self) -> usize {
        let mut state = self.state.lock();
        state.frame += 1;
        let frame = state.frame;
        let reuse_age = self.reuse_age;

        let expired: Vec<u64> = state
            .used
            .values()
            .filter(|b| frame - b.last_used_frame >= reuse_age)
            .map(|b| b.id)
            .collect();
        for id in &expired {
            if let Some(block) = state.used.remove(id) {
                state.free.entry(block.capacity).or_default().push(block);
            }
        }
        if !expired.is_empty() {
            log::debug!("Staging pool recycled {} block(s)", expired.len());
        }
        expired.len()
    }

    /// Destroys every block. Blocks still in the used set are a leak and
    /// fail the call; nothing is destroyed in that case.
    pub fn terminate(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.used.is_empty() {
            let err = GpuError::StagingLeak { count: state.used.len() };
            log::error!("{err}");
            return Err(err);
        }
        for (_, bucket) in std::mem::take(&mut state.free) {
            for block in bucket {
                self.device.destroy_buffer(block.buffer);
            }
        }
        Ok(())
    }

    /// Returns every used block to the free set regardless of age. Only
    /// valid once the device is idle. Returns how many were retired.
    pub fn retire_all(&self) -> usize {
        let mut state = self.state.lock();
        let used: Vec<Block> = state.used.drain().map(|(_, b)| b).collect();
        let count = used.len();
        for block in used {
            state.free.entry(block.capacity).or_default().push(block);
        }
        count
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.state.lock().free_count()
    }

    #[must_use]
    pub fn used_count(&self) -> usize {
        self.state.lock().used.len()
    }

    #[must_use]
    pub fn reuse_age(&self) -> u64 {
        self.reuse_age
    }
}

impl std::fmt::Debug for StagingPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("StagingPool")
            .field("reuse_age", &self.reuse_age)
            .field("frame", &state.frame)
            .field("free", &state.free_count())
            .field("used", &state.used.len())
            .finish_non_exhaustive()
    }
}
