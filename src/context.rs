//! Render Context
//!
//! [`RenderContext`] owns every pool, queue and table of the core and is the
//! surface the application layer talks to. There is no global state: frame
//! listeners, descriptor pools and the bindless registry all hang off this
//! object and are handed to subsystems at construction.
//!
//! # Frame loop
//!
//! ```rust,ignore
//! let mut ctx = RenderContext::new(device, GpuSettings::default())?;
//! loop {
//!     ctx.begin_frame()?;
//!     let mut primary = ctx.command_list()?;
//!     ctx.record_draws(&mut primary, &pass, &draws, |rec, draw| { /* ... */ })?;
//!     ctx.submit_frame(vec![primary])?;
//!     ctx.end_frame();
//! }
//! ctx.shutdown()?;
//! ```
//!
//! `end_frame` advances the scheduler. Subscribed listeners (the transient
//! ring, the staging pool's aging, the frame statistics) run from there,
//! followed by one pass of deferred destruction.

use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::smallvec;

use crate::backend::{
    Barrier, BufferDesc, BufferHandle, BufferUsage, Command, CommandBufferLevel,
    DescriptorSetHandle, Format, GpuDevice, ImageDesc, ImageHandle, ImageLayout, MemoryLocation,
    QueueKind, RenderingInfo, ResourceAccess,
};
use crate::command::{BatchMode, CommandList, CommandQueue, CommandRecorder, ParallelRecorder};
use crate::descriptor::table::TableVariant;
use crate::descriptor::{
    BindlessRegistry, DescriptorBinding, DescriptorKind, DescriptorPayload, DescriptorPoolManager,
    DescriptorSetLayoutInfo, ResourceSet, ShaderStages,
};
use crate::errors::{GpuError, Result};
use crate::frame::{FrameGates, FrameInfo, FrameScheduler, FrameStats, ListenerId};
use crate::lifetime::{GpuResource, ResourceArena, ResourceKey};
use crate::memory::{StagingPool, TransientAllocation, TransientBufferPool, UploadHeap};
use crate::settings::GpuSettings;

/// Descriptor set index the bindless tables are bound at.
pub const BINDLESS_SET_INDEX: u32 = 3;
/// Binding of the bindless image array inside [`BINDLESS_SET_INDEX`].
pub const BINDLESS_IMAGE_BINDING: u32 = 0;
/// Binding of the bindless storage buffer array inside [`BINDLESS_SET_INDEX`].
pub const BINDLESS_BUFFER_BINDING: u32 = 1;

const PLACEHOLDER_BUFFER_SIZE: u64 = 256;

/// A texture created through [`RenderContext::create_texture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Texture {
    pub key: ResourceKey,
    pub image: ImageHandle,
    /// Index into the bindless image table, valid in every stage variant.
    pub bindless_index: u32,
}

/// A device-local buffer created through [`RenderContext::create_buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Buffer {
    pub key: ResourceKey,
    pub buffer: BufferHandle,
    pub size: u64,
}

pub struct RenderContext {
    device: Arc<dyn GpuDevice>,
    settings: GpuSettings,

    scheduler: FrameScheduler,
    stats: Arc<FrameStats>,
    frame_fences: Vec<u64>,

    transient: Arc<Mutex<TransientBufferPool>>,
    staging: Arc<StagingPool>,
    upload_heap: UploadHeap,

    graphics: Arc<CommandQueue>,
    compute: Arc<CommandQueue>,
    copy: Arc<CommandQueue>,
    recorder: ParallelRecorder,

    descriptor_pools: Arc<DescriptorPoolManager>,
    bindless: BindlessRegistry,
    placeholder_image: ImageHandle,
    placeholder_buffer: BufferHandle,

    arena: ResourceArena,
    shut_down: bool,
}

impl RenderContext {
    pub fn new(device: Arc<dyn GpuDevice>, settings: GpuSettings) -> Result<Self> {
        let frames = settings.frames_in_flight.max(1);
        let mut scheduler = FrameScheduler::new(frames, settings.threaded_frames);

        let graphics = Arc::new(CommandQueue::new(
            Arc::clone(&device),
            QueueKind::Graphics,
            settings.wait_timeout,
        )?);
        let compute = Arc::new(CommandQueue::new(
            Arc::clone(&device),
            QueueKind::Compute,
            settings.wait_timeout,
        )?);
        let copy = Arc::new(CommandQueue::new(
            Arc::clone(&device),
            QueueKind::Copy,
            settings.wait_timeout,
        )?);

        let transient = Arc::new(Mutex::new(TransientBufferPool::new(
            Arc::clone(&device),
            BufferUsage::UNIFORM | BufferUsage::VERTEX | BufferUsage::INDEX | BufferUsage::STORAGE,
            frames,
            settings.transient_buffer_size,
            settings.transient_alignment,
        )?));
        let staging = Arc::new(StagingPool::new(Arc::clone(&device), settings.staging_reuse_age));
        let upload_heap = UploadHeap::new(Arc::clone(&device), Arc::clone(&copy), settings.upload_heap_size)?;

        // Placeholders every freed bindless slot is rebound to.
        let placeholder_desc = ImageDesc::texture_2d("Bindless Placeholder", 1, 1, Format::Rgba8Unorm);
        let placeholder_image = device.create_image(&placeholder_desc)?;
        upload_heap.upload_image(placeholder_image, &placeholder_desc, &[255, 0, 255, 255])?;
        let placeholder_buffer = device.create_buffer(&BufferDesc {
            label: "Bindless Placeholder",
            size: PLACEHOLDER_BUFFER_SIZE,
            usage: BufferUsage::STORAGE | BufferUsage::TRANSFER_DST,
            location: MemoryLocation::DeviceLocal,
        })?;

        let descriptor_pools = Arc::new(DescriptorPoolManager::new(
            Arc::clone(&device),
            settings.descriptor_set_budget,
        ));
        let image_placeholder = DescriptorPayload::SampledImage {
            image: placeholder_image,
            layout: ImageLayout::ShaderReadOnly,
        };
        let buffer_placeholder = DescriptorPayload::StorageBuffer {
            buffer: placeholder_buffer,
            offset: 0,
            range: PLACEHOLDER_BUFFER_SIZE,
        };
        let mut variants = Vec::new();
        for stages in [ShaderStages::FRAGMENT, ShaderStages::ALL_GRAPHICS, ShaderStages::COMPUTE] {
            variants.push(TableVariant {
                kind: DescriptorKind::SampledImage,
                stages,
                binding: BINDLESS_IMAGE_BINDING,
                placeholder: image_placeholder,
            });
        }
        for stages in [ShaderStages::ALL_GRAPHICS, ShaderStages::COMPUTE] {
            variants.push(TableVariant {
                kind: DescriptorKind::StorageBuffer,
                stages,
                binding: BINDLESS_BUFFER_BINDING,
                placeholder: buffer_placeholder,
            });
        }
        let bindless = BindlessRegistry::new(
            Arc::clone(&device),
            Arc::clone(&descriptor_pools),
            BINDLESS_SET_INDEX,
            settings.bindless_capacity,
            &variants,
        )?;

        // Frame-scoped pools reset themselves through the scheduler.
        let stats = Arc::new(FrameStats::new());
        {
            let transient = Arc::clone(&transient);
            scheduler.subscribe(move |_| transient.lock().on_frame_advance());
        }
        {
            let staging = Arc::clone(&staging);
            scheduler.subscribe(move |_| {
                staging.gc();
            });
        }
        {
            let stats = Arc::clone(&stats);
            scheduler.subscribe(move |_| {
                stats.end_frame();
            });
        }

        let recorder = ParallelRecorder::new(settings.parallel_record_threshold, settings.resolved_worker_threads());
        log::info!(
            "Render context ready: {frames} frames in flight, {} recording workers",
            recorder.workers()
        );

        Ok(Self {
            arena: ResourceArena::new(settings.deferred_delete_ttl),
            frame_fences: vec![0; frames],
            device,
            settings,
            scheduler,
            stats,
            transient,
            staging,
            upload_heap,
            graphics,
            compute,
            copy,
            recorder,
            descriptor_pools,
            bindless,
            placeholder_image,
            placeholder_buffer,
            shut_down: false,
        })
    }

    // ── Accessors ──────────────────────────────────────────────────────────

    #[must_use]
    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    #[must_use]
    pub fn settings(&self) -> &GpuSettings {
        &self.settings
    }

    #[must_use]
    pub fn scheduler(&self) -> &FrameScheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn frame_info(&self) -> FrameInfo {
        self.scheduler.info()
    }

    /// Turn gates for a separate submission thread.
    #[must_use]
    pub fn gates(&self) -> FrameGates {
        self.scheduler.gates()
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<FrameStats> {
        &self.stats
    }

    #[must_use]
    pub fn graphics_queue(&self) -> &Arc<CommandQueue> {
        &self.graphics
    }

    #[must_use]
    pub fn compute_queue(&self) -> &Arc<CommandQueue> {
        &self.compute
    }

    #[must_use]
    pub fn copy_queue(&self) -> &Arc<CommandQueue> {
        &self.copy
    }

    #[must_use]
    pub fn staging(&self) -> &StagingPool {
        &self.staging
    }

    #[must_use]
    pub fn upload_heap(&self) -> &UploadHeap {
        &self.upload_heap
    }

    #[must_use]
    pub fn descriptor_pools(&self) -> &Arc<DescriptorPoolManager> {
        &self.descriptor_pools
    }

    #[must_use]
    pub fn bindless(&self) -> &BindlessRegistry {
        &self.bindless
    }

    #[must_use]
    pub fn placeholder_image(&self) -> ImageHandle {
        self.placeholder_image
    }

    #[must_use]
    pub fn arena(&self) -> &ResourceArena {
        &self.arena
    }

    #[must_use]
    pub fn transient_buffer(&self) -> BufferHandle {
        self.transient.lock().buffer()
    }

    /// Bytes of transient memory held by frames in flight.
    #[must_use]
    pub fn transient_in_use(&self) -> u64 {
        self.transient.lock().allocated_size()
    }

    // ── Frames ─────────────────────────────────────────────────────────────

    /// Registers a frame-advance listener, run after the built-in ones.
    pub fn subscribe(&mut self, listener: impl FnMut(&FrameInfo) + Send + 'static) -> ListenerId {
        self.scheduler.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.scheduler.unsubscribe(id)
    }

    /// Takes the main turn and waits until the GPU is done with the work
    /// slot's previous submission.
    pub fn begin_frame(&mut self) -> Result<FrameInfo> {
        self.scheduler.gates().begin_main_turn();
        let fence = self.frame_fences[self.scheduler.work_frame()];
        if fence > 0 {
            self.graphics.wait(fence)?;
        }
        Ok(self.scheduler.info())
    }

    /// Submits the frame's primary lists on the graphics queue.
    pub fn submit_frame(&mut self, lists: Vec<CommandList>) -> Result<u64> {
        let value = self.graphics.submit(lists)?;
        self.frame_fences[self.scheduler.work_frame()] = value;
        Ok(value)
    }

    /// Hands the frame to the submitter, advances the scheduler and runs one
    /// pass of deferred destruction.
    pub fn end_frame(&mut self) -> FrameInfo {
        self.scheduler.gates().end_main_turn();
        let info = self.scheduler.advance();

        let device = &self.device;
        let bindless = &self.bindless;
        self.arena.gc(|resource| destroy_resource(device.as_ref(), bindless, resource));
        info
    }

    // ── Transient data ─────────────────────────────────────────────────────

    /// Per-draw uniform data for this frame.
    pub fn allocate<T: bytemuck::Pod>(&self, value: &T) -> Result<TransientAllocation> {
        let allocation = self.transient.lock().allocate_value(value)?;
        self.stats.record_transient(allocation.size);
        Ok(allocation)
    }

    /// Per-frame dynamic vertex or index data.
    pub fn allocate_bytes(&self, data: &[u8]) -> Result<TransientAllocation> {
        let allocation = self.transient.lock().allocate_bytes(data)?;
        self.stats.record_transient(allocation.size);
        Ok(allocation)
    }

    /// Writes `value` to the transient ring and binds `set` at `index` with
    /// the allocation's offset as its dynamic offset.
    pub fn bind_uniforms<T: bytemuck::Pod>(
        &self,
        recorder: &mut dyn CommandRecorder,
        index: u32,
        set: DescriptorSetHandle,
        value: &T,
    ) -> Result<TransientAllocation> {
        let allocation = self.allocate(value)?;
        let offset = u32::try_from(allocation.offset).map_err(|_| GpuError::DeviceCall {
            call: "bind_descriptor_set",
            reason: format!("dynamic offset {} exceeds u32", allocation.offset),
        })?;
        recorder.bind_descriptor_set(index, set, &[offset]);
        Ok(allocation)
    }

    // ── Resources ──────────────────────────────────────────────────────────

    /// Creates a device-local buffer filled with `data` through a staging
    /// block and an asynchronous copy-queue submission.
    pub fn create_buffer(&mut self, label: &'static str, usage: BufferUsage, data: &[u8]) -> Result<Buffer> {
        let size = data.len() as u64;
        let buffer = self.device.create_buffer(&BufferDesc {
            label,
            size,
            usage: usage | BufferUsage::TRANSFER_DST,
            location: MemoryLocation::DeviceLocal,
        })?;

        if let Err(err) = self.stage_buffer_upload(buffer, data) {
            self.device.destroy_buffer(buffer);
            return Err(err);
        }
        self.stats.record_upload(size);

        let key = self.arena.insert(GpuResource::Buffer(buffer));
        Ok(Buffer { key, buffer, size })
    }

    fn stage_buffer_upload(&self, buffer: BufferHandle, data: &[u8]) -> Result<()> {
        let stage = self.staging.acquire_stage(data)?;
        let list = self.copy.get_command_list(CommandBufferLevel::Primary, None)?;
        self.device.record(
            list.buffer(),
            Command::CopyBuffer {
                src: stage.buffer,
                src_offset: 0,
                dst: buffer,
                dst_offset: 0,
                size: stage.size,
            },
        );
        self.device.record(
            list.buffer(),
            Command::PipelineBarrier(smallvec![Barrier::Buffer {
                buffer,
                before: ResourceAccess::TransferWrite,
                after: ResourceAccess::ShaderRead,
            }]),
        );
        self.copy.submit(vec![list])?;
        Ok(())
    }

    /// Rewrites part of a buffer through the upload heap.
    pub fn update_buffer(&self, buffer: &Buffer, offset: u64, data: &[u8]) -> Result<()> {
        self.upload_heap.upload_buffer(buffer.buffer, offset, data)?;
        self.stats.record_upload(data.len() as u64);
        Ok(())
    }

    /// Creates an image, uploads `data` through the upload heap and registers
    /// it in every variant of the bindless image table.
    pub fn create_texture(&mut self, desc: &ImageDesc, data: &[u8]) -> Result<Texture> {
        let image = self.device.create_image(desc)?;
        if let Err(err) = self.upload_heap.upload_image(image, desc, data) {
            self.device.destroy_image(image);
            return Err(err);
        }
        self.stats.record_upload(data.len() as u64);

        let payload = DescriptorPayload::SampledImage {
            image,
            layout: ImageLayout::ShaderReadOnly,
        };
        let bindless_index = match self.bindless.add(DescriptorKind::SampledImage, payload) {
            Ok(index) => index,
            Err(err) => {
                self.device.destroy_image(image);
                return Err(err);
            }
        };

        let key = self.arena.insert(GpuResource::Texture {
            image,
            kind: DescriptorKind::SampledImage,
            bindless_index,
        });
        Ok(Texture {
            key,
            image,
            bindless_index,
        })
    }

    /// Defers flushing across many uploads (e.g. a level load).
    pub fn begin_upload_batch(&self) {
        self.upload_heap.begin_batch();
    }

    pub fn end_upload_batch(&self) -> Result<()> {
        self.upload_heap.end_batch()
    }

    pub fn retain(&mut self, key: ResourceKey) -> Result<u32> {
        self.arena.retain(key)
    }

    /// Drops a reference; the last one schedules deferred destruction.
    pub fn release(&mut self, key: ResourceKey) -> Result<u32> {
        self.arena.release(key)
    }

    // ── Descriptors ────────────────────────────────────────────────────────

    /// Builds a set layout from reflected bindings.
    pub fn create_layout(&self, bindings: Vec<DescriptorBinding>) -> Result<Arc<DescriptorSetLayoutInfo>> {
        let bindless = bindings.iter().any(|b| b.set == BINDLESS_SET_INDEX);
        Ok(Arc::new(DescriptorSetLayoutInfo::new(
            Arc::clone(&self.device),
            bindings,
            bindless,
        )?))
    }

    #[must_use]
    pub fn create_resource_set(&self) -> ResourceSet {
        ResourceSet::new(Arc::clone(&self.device), Arc::clone(&self.descriptor_pools))
    }

    // ── Recording ──────────────────────────────────────────────────────────

    /// A primary graphics list, ready for recording.
    pub fn command_list(&self) -> Result<CommandList> {
        self.graphics.get_command_list(CommandBufferLevel::Primary, None)
    }

    /// Records one pass over `items`, in parallel above the configured
    /// threshold.
    pub fn record_draws<T, F>(
        &self,
        primary: &mut CommandList,
        pass: &RenderingInfo,
        items: &[T],
        record: F,
    ) -> Result<BatchMode>
    where
        T: Sync,
        F: Fn(&mut dyn CommandRecorder, &T) + Sync,
    {
        self.recorder
            .record_batch(&self.graphics, primary, pass, items, Some(&self.stats), record)
    }

    // ── Shutdown ───────────────────────────────────────────────────────────

    /// Waits for the device, destroys everything still alive and checks the
    /// staging pool for leaks.
    pub fn shutdown(mut self) -> Result<()> {
        self.shutdown_inner()
    }

    fn shutdown_inner(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        self.upload_heap.flush_and_finish()?;
        for queue in [&self.graphics, &self.compute, &self.copy] {
            queue.wait_idle()?;
        }
        self.device.wait_idle()?;

        let device = &self.device;
        let bindless = &self.bindless;
        let destroyed = self
            .arena
            .force_gc(|resource| destroy_resource(device.as_ref(), bindless, resource));
        log::info!("Render context shutdown: {destroyed} resource(s) destroyed");

        self.staging.retire_all();
        self.staging.terminate()?;
        Ok(())
    }
}

fn destroy_resource(device: &dyn GpuDevice, bindless: &BindlessRegistry, resource: GpuResource) {
    match resource {
        GpuResource::Buffer(buffer) => device.destroy_buffer(buffer),
        GpuResource::Image(image) => device.destroy_image(image),
        GpuResource::Texture {
            image,
            kind,
            bindless_index,
        } => {
            // A slot that could not be rebound may still be sampled, so the
            // image outlives it.
            match bindless.free(kind, bindless_index) {
                Ok(()) => device.destroy_image(image),
                Err(err) => {
                    log::error!("Failed to free bindless index {bindless_index}, keeping image {}: {err}", image.raw());
                }
            }
        }
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown_inner() {
            log::error!("Render context dropped with errors: {err}");
        }
        self.device.destroy_image(self.placeholder_image);
        self.device.destroy_buffer(self.placeholder_buffer);
    }
}

impl std::fmt::Debug for RenderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderContext")
            .field("settings", &self.settings)
            .field("scheduler", &self.scheduler)
            .field("resources", &self.arena.len())
            .finish_non_exhaustive()
    }
}
