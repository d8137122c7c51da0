//! Headless Device
//!
//! An in-memory [`GpuDevice`]. Buffers and images are byte vectors, command
//! buffers are lists of recorded [`Command`]s, and a submission "executes" by
//! applying its copies to the destination memory and appending every command
//! (with secondary buffers expanded in place) to a submission log.
//!
//! Used for tests, tooling and CI machines without a GPU.
//!
//! # Completion modes
//!
//! | Mode                     | Submission retires                          |
//! |--------------------------|---------------------------------------------|
//! | [`HeadlessDevice::new`]  | immediately, inside `submit`                |
//! | [`with_manual_completion`](HeadlessDevice::with_manual_completion) | on [`complete_pending`](HeadlessDevice::complete_pending) |
//!
//! Manual mode makes blocking waits observable: a thread parked in
//! `wait_timeline` wakes once another thread calls `complete_pending`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::{FxHashMap, FxHashSet};

use super::{
    BufferDesc, BufferHandle, Command, CommandBufferHandle, CommandBufferLevel, CommandPoolHandle,
    DescriptorPoolDesc, DescriptorPoolHandle, DescriptorSetHandle, DescriptorSetLayoutDesc,
    DescriptorSetLayoutHandle, DescriptorWrite, GpuDevice, ImageDesc, ImageHandle, MemoryLocation,
    QueueKind, RenderingInheritance, TimelineHandle, TimelineSignal,
};
use crate::descriptor::DescriptorPayload;
use crate::errors::{GpuError, Result};

struct HeadlessBuffer {
    desc: BufferDesc,
    data: Vec<u8>,
}

struct HeadlessImage {
    desc: ImageDesc,
    /// Keyed by `(mip, layer)`.
    subresources: FxHashMap<(u32, u32), Vec<u8>>,
}

struct HeadlessPool {
    desc: DescriptorPoolDesc,
    live_sets: FxHashSet<u64>,
}

struct HeadlessSet {
    pool: u64,
    writes: FxHashMap<(u32, u32), DescriptorPayload>,
}

struct HeadlessCommandBuffer {
    pool: u64,
    level: CommandBufferLevel,
    recording: bool,
    inheritance: Option<RenderingInheritance>,
    commands: Vec<Command>,
}

struct PendingSubmit {
    command_buffers: Vec<u64>,
    signal: TimelineSignal,
}

#[derive(Default)]
struct State {
    next_id: u64,
    buffers: FxHashMap<u64, HeadlessBuffer>,
    images: FxHashMap<u64, HeadlessImage>,
    layouts: FxHashMap<u64, DescriptorSetLayoutDesc>,
    pools: FxHashMap<u64, HeadlessPool>,
    sets: FxHashMap<u64, HeadlessSet>,
    command_pools: FxHashMap<u64, (QueueKind, Vec<u64>)>,
    command_buffers: FxHashMap<u64, HeadlessCommandBuffer>,
    timelines: FxHashMap<u64, u64>,
    pending: VecDeque<PendingSubmit>,
    submitted: Vec<Command>,
    submissions: usize,
    buffers_created: usize,
    pools_created: usize,
    /// Sets whose descriptor writes are rejected.
    failing_sets: FxHashSet<u64>,
    /// Queues whose submissions are rejected.
    failing_queues: FxHashSet<QueueKind>,
}

impl State {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn execute(&mut self, command_buffers: &[u64]) -> Result<()> {
        for &cb in command_buffers {
            let commands = self
                .command_buffers
                .get(&cb)
                .map(|c| c.commands.clone())
                .ok_or(GpuError::InvalidHandle { kind: "command buffer", id: cb })?;
            for command in commands {
                self.apply(command)?;
            }
        }
        Ok(())
    }

    fn apply(&mut self, command: Command) -> Result<()> {
        match &command {
            Command::CopyBuffer { src, src_offset, dst, dst_offset, size } => {
                let bytes = self.read(*src, *src_offset, *size)?;
                let dst_buf = self
                    .buffers
                    .get_mut(&dst.raw())
                    .ok_or(GpuError::InvalidHandle { kind: "buffer", id: dst.raw() })?;
                let start = *dst_offset as usize;
                let end = start + bytes.len();
                if end > dst_buf.data.len() {
                    return Err(GpuError::DeviceCall {
                        call: "copy_buffer",
                        reason: format!("range {start}..{end} outside buffer of {} bytes", dst_buf.data.len()),
                    });
                }
                dst_buf.data[start..end].copy_from_slice(&bytes);
            }
            Command::CopyBufferToImage { src, dst, region } => {
                let image = self
                    .images
                    .get(&dst.raw())
                    .ok_or(GpuError::InvalidHandle { kind: "image", id: dst.raw() })?;
                let len = u64::from(region.width)
                    * u64::from(region.height)
                    * u64::from(image.desc.format.bytes_per_texel());
                let bytes = self.read(*src, region.buffer_offset, len)?;
                if let Some(image) = self.images.get_mut(&dst.raw()) {
                    image
                        .subresources
                        .insert((region.mip_level, region.array_layer), bytes);
                }
            }
            Command::ExecuteSecondary(list) => {
                let handles: Vec<u64> = list.iter().map(|cb| cb.raw()).collect();
                return self.execute(&handles);
            }
            _ => {}
        }
        self.submitted.push(command);
        Ok(())
    }

    fn read(&self, buffer: BufferHandle, offset: u64, size: u64) -> Result<Vec<u8>> {
        let buf = self
            .buffers
            .get(&buffer.raw())
            .ok_or(GpuError::InvalidHandle { kind: "buffer", id: buffer.raw() })?;
        let start = offset as usize;
        let end = start + size as usize;
        if end > buf.data.len() {
            return Err(GpuError::DeviceCall {
                call: "copy",
                reason: format!("range {start}..{end} outside buffer of {} bytes", buf.data.len()),
            });
        }
        Ok(buf.data[start..end].to_vec())
    }

    fn retire(&mut self, submit: &PendingSubmit) -> Result<()> {
        self.execute(&submit.command_buffers)?;
        let value = self.timelines.entry(submit.signal.timeline.raw()).or_insert(0);
        *value = (*value).max(submit.signal.value);
        self.submissions += 1;
        Ok(())
    }
}

/// In-memory implementation of [`GpuDevice`].
pub struct HeadlessDevice {
    state: Mutex<State>,
    signaled: Condvar,
    manual_completion: bool,
}

impl HeadlessDevice {
    /// Device whose submissions retire immediately.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            signaled: Condvar::new(),
            manual_completion: false,
        }
    }

    /// Device whose submissions retire only on [`complete_pending`](Self::complete_pending).
    #[must_use]
    pub fn with_manual_completion() -> Self {
        Self {
            manual_completion: true,
            ..Self::new()
        }
    }

    /// Retires every queued submission in order. Returns how many retired.
    pub fn complete_pending(&self) -> Result<usize> {
        let mut state = self.state.lock();
        let mut retired = 0;
        while let Some(submit) = state.pending.pop_front() {
            state.retire(&submit)?;
            retired += 1;
        }
        drop(state);
        self.signaled.notify_all();
        Ok(retired)
    }

    // ── Inspection ─────────────────────────────────────────────────────────

    #[must_use]
    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&buffer.raw()).map(|b| b.data.clone())
    }

    #[must_use]
    pub fn image_contents(&self, image: ImageHandle, mip: u32, layer: u32) -> Option<Vec<u8>> {
        self.state
            .lock()
            .images
            .get(&image.raw())
            .and_then(|i| i.subresources.get(&(mip, layer)).cloned())
    }

    /// The payload last written to `(binding, array_index)` of `set`.
    #[must_use]
    pub fn descriptor(
        &self,
        set: DescriptorSetHandle,
        binding: u32,
        array_index: u32,
    ) -> Option<DescriptorPayload> {
        self.state
            .lock()
            .sets
            .get(&set.raw())
            .and_then(|s| s.writes.get(&(binding, array_index)).copied())
    }

    /// While `failing`, every `write_descriptors` call on `set` fails as it
    /// would on a lost native set. Contents written so far stay readable.
    pub fn set_descriptor_writes_failing(&self, set: DescriptorSetHandle, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing_sets.insert(set.raw());
        } else {
            state.failing_sets.remove(&set.raw());
        }
    }

    /// While `failing`, every submission to `queue` is rejected before
    /// anything executes.
    pub fn set_submits_failing(&self, queue: QueueKind, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing_queues.insert(queue);
        } else {
            state.failing_queues.remove(&queue);
        }
    }

    #[must_use]
    pub fn live_buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Buffers ever created, including destroyed ones.
    #[must_use]
    pub fn buffers_created(&self) -> usize {
        self.state.lock().buffers_created
    }

    #[must_use]
    pub fn live_image_count(&self) -> usize {
        self.state.lock().images.len()
    }

    #[must_use]
    pub fn descriptor_pool_count(&self) -> usize {
        self.state.lock().pools.len()
    }

    /// Descriptor pools ever created, including destroyed ones.
    #[must_use]
    pub fn descriptor_pools_created(&self) -> usize {
        self.state.lock().pools_created
    }

    #[must_use]
    pub fn descriptor_pool_desc(&self, pool: DescriptorPoolHandle) -> Option<DescriptorPoolDesc> {
        self.state.lock().pools.get(&pool.raw()).map(|p| p.desc.clone())
    }

    #[must_use]
    pub fn submission_count(&self) -> usize {
        self.state.lock().submissions
    }

    /// Every retired command in execution order, secondaries expanded.
    #[must_use]
    pub fn submitted_commands(&self) -> Vec<Command> {
        self.state.lock().submitted.clone()
    }

    pub fn clear_submitted_commands(&self) {
        self.state.lock().submitted.clear();
    }

    #[must_use]
    pub fn recorded_commands(&self, command_buffer: CommandBufferHandle) -> Vec<Command> {
        self.state
            .lock()
            .command_buffers
            .get(&command_buffer.raw())
            .map(|c| c.commands.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn inheritance(&self, command_buffer: CommandBufferHandle) -> Option<RenderingInheritance> {
        self.state
            .lock()
            .command_buffers
            .get(&command_buffer.raw())
            .and_then(|c| c.inheritance.clone())
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for HeadlessDevice {
    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle> {
        if desc.size == 0 {
            return Err(GpuError::DeviceCall {
                call: "create_buffer",
                reason: format!("zero-sized buffer '{}'", desc.label),
            });
        }
        let mut state = self.state.lock();
        let id = state.next();
        state.buffers.insert(
            id,
            HeadlessBuffer {
                desc: desc.clone(),
                data: vec![0; desc.size as usize],
            },
        );
        state.buffers_created += 1;
        Ok(BufferHandle::from_raw(id))
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        self.state.lock().buffers.remove(&buffer.raw());
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let buf = state
            .buffers
            .get_mut(&buffer.raw())
            .ok_or(GpuError::InvalidHandle { kind: "buffer", id: buffer.raw() })?;
        if buf.desc.location != MemoryLocation::HostVisible {
            return Err(GpuError::DeviceCall {
                call: "write_buffer",
                reason: format!("buffer '{}' is not host visible", buf.desc.label),
            });
        }
        let start = offset as usize;
        let end = start + data.len();
        if end > buf.data.len() {
            return Err(GpuError::DeviceCall {
                call: "write_buffer",
                reason: format!("range {start}..{end} outside buffer of {} bytes", buf.data.len()),
            });
        }
        buf.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<ImageHandle> {
        if desc.width == 0 || desc.height == 0 {
            return Err(GpuError::DeviceCall {
                call: "create_image",
                reason: format!("zero-sized image '{}'", desc.label),
            });
        }
        let mut state = self.state.lock();
        let id = state.next();
        state.images.insert(
            id,
            HeadlessImage {
                desc: desc.clone(),
                subresources: FxHashMap::default(),
            },
        );
        Ok(ImageHandle::from_raw(id))
    }

    fn destroy_image(&self, image: ImageHandle) {
        self.state.lock().images.remove(&image.raw());
    }

    fn create_descriptor_set_layout(
        &self,
        desc: &DescriptorSetLayoutDesc,
    ) -> Result<DescriptorSetLayoutHandle> {
        let mut state = self.state.lock();
        let id = state.next();
        state.layouts.insert(id, desc.clone());
        Ok(DescriptorSetLayoutHandle::from_raw(id))
    }

    fn destroy_descriptor_set_layout(&self, layout: DescriptorSetLayoutHandle) {
        self.state.lock().layouts.remove(&layout.raw());
    }

    fn create_descriptor_pool(&self, desc: &DescriptorPoolDesc) -> Result<DescriptorPoolHandle> {
        let mut state = self.state.lock();
        let id = state.next();
        state.pools.insert(
            id,
            HeadlessPool {
                desc: desc.clone(),
                live_sets: FxHashSet::default(),
            },
        );
        state.pools_created += 1;
        Ok(DescriptorPoolHandle::from_raw(id))
    }

    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle) {
        let mut state = self.state.lock();
        if let Some(p) = state.pools.remove(&pool.raw()) {
            for set in p.live_sets {
                state.sets.remove(&set);
            }
        }
    }

    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
    ) -> Result<DescriptorSetHandle> {
        let mut state = self.state.lock();
        if !state.layouts.contains_key(&layout.raw()) {
            return Err(GpuError::InvalidHandle { kind: "descriptor set layout", id: layout.raw() });
        }
        let id = state.next();
        let p = state
            .pools
            .get_mut(&pool.raw())
            .ok_or(GpuError::InvalidHandle { kind: "descriptor pool", id: pool.raw() })?;
        if p.live_sets.len() as u32 >= p.desc.max_sets {
            return Err(GpuError::DescriptorPoolExhausted(format!(
                "pool {} already holds {} sets",
                pool.raw(),
                p.desc.max_sets
            )));
        }
        p.live_sets.insert(id);
        state.sets.insert(
            id,
            HeadlessSet {
                pool: pool.raw(),
                writes: FxHashMap::default(),
            },
        );
        Ok(DescriptorSetHandle::from_raw(id))
    }

    fn free_descriptor_set(&self, pool: DescriptorPoolHandle, set: DescriptorSetHandle) {
        let mut state = self.state.lock();
        if state.sets.get(&set.raw()).is_some_and(|s| s.pool == pool.raw()) {
            state.sets.remove(&set.raw());
            if let Some(p) = state.pools.get_mut(&pool.raw()) {
                p.live_sets.remove(&set.raw());
            }
        } else {
            log::warn!("Descriptor set {} freed to pool {} it was not allocated from", set.raw(), pool.raw());
        }
    }

    fn write_descriptors(&self, set: DescriptorSetHandle, writes: &[DescriptorWrite]) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing_sets.contains(&set.raw()) {
            return Err(GpuError::DeviceCall {
                call: "write_descriptors",
                reason: format!("descriptor set {} is unusable", set.raw()),
            });
        }
        let s = state
            .sets
            .get_mut(&set.raw())
            .ok_or(GpuError::InvalidHandle { kind: "descriptor set", id: set.raw() })?;
        for w in writes {
            s.writes.insert((w.binding, w.array_index), w.payload);
        }
        Ok(())
    }

    fn create_command_pool(&self, queue: QueueKind) -> Result<CommandPoolHandle> {
        let mut state = self.state.lock();
        let id = state.next();
        state.command_pools.insert(id, (queue, Vec::new()));
        Ok(CommandPoolHandle::from_raw(id))
    }

    fn reset_command_pool(&self, pool: CommandPoolHandle) -> Result<()> {
        let mut state = self.state.lock();
        let buffers = state
            .command_pools
            .get(&pool.raw())
            .map(|(_, b)| b.clone())
            .ok_or(GpuError::InvalidHandle { kind: "command pool", id: pool.raw() })?;
        for cb in buffers {
            if let Some(c) = state.command_buffers.get_mut(&cb) {
                c.commands.clear();
                c.recording = false;
                c.inheritance = None;
            }
        }
        Ok(())
    }

    fn destroy_command_pool(&self, pool: CommandPoolHandle) {
        let mut state = self.state.lock();
        if let Some((_, buffers)) = state.command_pools.remove(&pool.raw()) {
            for cb in buffers {
                state.command_buffers.remove(&cb);
            }
        }
    }

    fn allocate_command_buffer(
        &self,
        pool: CommandPoolHandle,
        level: CommandBufferLevel,
    ) -> Result<CommandBufferHandle> {
        let mut state = self.state.lock();
        let id = state.next();
        state
            .command_pools
            .get_mut(&pool.raw())
            .ok_or(GpuError::InvalidHandle { kind: "command pool", id: pool.raw() })?
            .1
            .push(id);
        state.command_buffers.insert(
            id,
            HeadlessCommandBuffer {
                pool: pool.raw(),
                level,
                recording: false,
                inheritance: None,
                commands: Vec::new(),
            },
        );
        Ok(CommandBufferHandle::from_raw(id))
    }

    fn begin_command_buffer(
        &self,
        command_buffer: CommandBufferHandle,
        inheritance: Option<&RenderingInheritance>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let cb = state
            .command_buffers
            .get_mut(&command_buffer.raw())
            .ok_or(GpuError::InvalidHandle { kind: "command buffer", id: command_buffer.raw() })?;
        cb.commands.clear();
        cb.recording = true;
        cb.inheritance = match cb.level {
            CommandBufferLevel::Secondary => inheritance.cloned(),
            CommandBufferLevel::Primary => None,
        };
        Ok(())
    }

    fn record(&self, command_buffer: CommandBufferHandle, command: Command) {
        let mut state = self.state.lock();
        match state.command_buffers.get_mut(&command_buffer.raw()) {
            Some(cb) if cb.recording => cb.commands.push(command),
            Some(_) => log::warn!("Recording into command buffer {} outside begin/end", command_buffer.raw()),
            None => log::error!("Recording into unknown command buffer {}", command_buffer.raw()),
        }
    }

    fn end_command_buffer(&self, command_buffer: CommandBufferHandle) -> Result<()> {
        let mut state = self.state.lock();
        let cb = state
            .command_buffers
            .get_mut(&command_buffer.raw())
            .ok_or(GpuError::InvalidHandle { kind: "command buffer", id: command_buffer.raw() })?;
        cb.recording = false;
        Ok(())
    }

    fn create_timeline(&self, initial_value: u64) -> Result<TimelineHandle> {
        let mut state = self.state.lock();
        let id = state.next();
        state.timelines.insert(id, initial_value);
        Ok(TimelineHandle::from_raw(id))
    }

    fn destroy_timeline(&self, timeline: TimelineHandle) {
        self.state.lock().timelines.remove(&timeline.raw());
    }

    fn timeline_value(&self, timeline: TimelineHandle) -> Result<u64> {
        self.state
            .lock()
            .timelines
            .get(&timeline.raw())
            .copied()
            .ok_or(GpuError::InvalidHandle { kind: "timeline", id: timeline.raw() })
    }

    fn wait_timeline(&self, timeline: TimelineHandle, value: u64, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            let reached = state
                .timelines
                .get(&timeline.raw())
                .copied()
                .ok_or(GpuError::InvalidHandle { kind: "timeline", id: timeline.raw() })?;
            if reached >= value {
                return Ok(());
            }
            if self.signaled.wait_until(&mut state, deadline).timed_out() {
                let reached = state.timelines.get(&timeline.raw()).copied().unwrap_or(0);
                if reached >= value {
                    return Ok(());
                }
                return Err(GpuError::Timeout { value, reached });
            }
        }
    }

    fn submit(
        &self,
        queue: QueueKind,
        command_buffers: &[CommandBufferHandle],
        signal: TimelineSignal,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing_queues.contains(&queue) {
            return Err(GpuError::DeviceCall {
                call: "submit",
                reason: format!("{queue:?} queue rejected the submission"),
            });
        }
        for cb in command_buffers {
            let c = state
                .command_buffers
                .get(&cb.raw())
                .ok_or(GpuError::InvalidHandle { kind: "command buffer", id: cb.raw() })?;
            if c.recording || c.level != CommandBufferLevel::Primary {
                return Err(GpuError::DeviceCall {
                    call: "submit",
                    reason: format!("command buffer {} is not an ended primary", cb.raw()),
                });
            }
            let pool_queue = state.command_pools.get(&c.pool).map(|(q, _)| *q);
            if pool_queue != Some(queue) {
                return Err(GpuError::DeviceCall {
                    call: "submit",
                    reason: format!("command buffer {} submitted to {queue:?}", cb.raw()),
                });
            }
        }
        let submit = PendingSubmit {
            command_buffers: command_buffers.iter().map(|cb| cb.raw()).collect(),
            signal,
        };
        if self.manual_completion {
            state.pending.push_back(submit);
            return Ok(());
        }
        state.retire(&submit)?;
        drop(state);
        self.signaled.notify_all();
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        if self.manual_completion {
            self.complete_pending()?;
        }
        Ok(())
    }
}
