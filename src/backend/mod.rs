//! Native API Seam
//!
//! The core is written against an explicit, Vulkan-like device: command
//! buffers are recorded by hand, descriptor sets are carved from pools,
//! submissions signal timeline values and nothing is synchronized implicitly.
//! [`GpuDevice`] is that contract, expressed as an object-safe trait so the
//! pools can hold an `Arc<dyn GpuDevice>` without knowing which driver sits
//! underneath.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ RenderContext / pools / queues / tables       │
//! └───────────────┬───────────────────────────────┘
//!                 │  Arc<dyn GpuDevice>
//! ┌───────────────┴───────────────┐
//! │ HeadlessDevice │ native driver │
//! └───────────────────────────────┘
//! ```
//!
//! Handles are opaque `u64` newtypes. A backend is free to pack whatever it
//! likes into them; the core only compares and hashes them.

pub mod headless;
mod types;

use std::time::Duration;

pub use headless::HeadlessDevice;
pub use types::*;

use crate::errors::Result;

macro_rules! define_handles {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(u64);

            impl $name {
                /// Wraps a backend-defined raw value.
                #[inline]
                #[must_use]
                pub const fn from_raw(raw: u64) -> Self {
                    Self(raw)
                }

                #[inline]
                #[must_use]
                pub const fn raw(self) -> u64 {
                    self.0
                }
            }
        )*
    };
}

define_handles! {
    /// A native buffer object.
    BufferHandle,
    /// A native image object (with its default view).
    ImageHandle,
    SamplerHandle,
    /// A linked shader program plus its fixed pipeline layout.
    PipelineHandle,
    DescriptorPoolHandle,
    DescriptorSetLayoutHandle,
    DescriptorSetHandle,
    CommandPoolHandle,
    CommandBufferHandle,
    /// A monotonically increasing GPU completion counter.
    TimelineHandle,
}

/// The explicit GPU device the core is built against.
///
/// Every call that can fail returns a [`Result`]; command recording
/// ([`record`](Self::record)) cannot, matching native `cmd*` entry points.
///
/// # Threading
///
/// Implementations must be `Send + Sync`. Recording into *different* command
/// buffers from different threads must be safe; recording into the same
/// command buffer from two threads is a caller bug.
pub trait GpuDevice: Send + Sync {
    // ── Memory ─────────────────────────────────────────────────────────────

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferHandle>;
    fn destroy_buffer(&self, buffer: BufferHandle);

    /// Map, copy, flush and unmap in one step. Only valid on
    /// [`MemoryLocation::HostVisible`] buffers.
    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<()>;

    fn create_image(&self, desc: &ImageDesc) -> Result<ImageHandle>;
    fn destroy_image(&self, image: ImageHandle);

    // ── Descriptors ────────────────────────────────────────────────────────

    fn create_descriptor_set_layout(
        &self,
        desc: &DescriptorSetLayoutDesc,
    ) -> Result<DescriptorSetLayoutHandle>;
    fn destroy_descriptor_set_layout(&self, layout: DescriptorSetLayoutHandle);

    fn create_descriptor_pool(&self, desc: &DescriptorPoolDesc) -> Result<DescriptorPoolHandle>;
    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle);

    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
    ) -> Result<DescriptorSetHandle>;
    fn free_descriptor_set(&self, pool: DescriptorPoolHandle, set: DescriptorSetHandle);

    fn write_descriptors(&self, set: DescriptorSetHandle, writes: &[DescriptorWrite]) -> Result<()>;

    // ── Commands ───────────────────────────────────────────────────────────

    fn create_command_pool(&self, queue: QueueKind) -> Result<CommandPoolHandle>;
    /// Resets every command buffer allocated from `pool`.
    fn reset_command_pool(&self, pool: CommandPoolHandle) -> Result<()>;
    fn destroy_command_pool(&self, pool: CommandPoolHandle);

    fn allocate_command_buffer(
        &self,
        pool: CommandPoolHandle,
        level: CommandBufferLevel,
    ) -> Result<CommandBufferHandle>;

    /// `inheritance` is required for secondary buffers recorded inside a
    /// rendering scope and ignored for primaries.
    fn begin_command_buffer(
        &self,
        command_buffer: CommandBufferHandle,
        inheritance: Option<&RenderingInheritance>,
    ) -> Result<()>;
    fn record(&self, command_buffer: CommandBufferHandle, command: Command);
    fn end_command_buffer(&self, command_buffer: CommandBufferHandle) -> Result<()>;

    // ── Synchronization ────────────────────────────────────────────────────

    fn create_timeline(&self, initial_value: u64) -> Result<TimelineHandle>;
    fn destroy_timeline(&self, timeline: TimelineHandle);
    fn timeline_value(&self, timeline: TimelineHandle) -> Result<u64>;
    /// Blocks until `timeline` reaches `value` or `timeout` elapses.
    fn wait_timeline(&self, timeline: TimelineHandle, value: u64, timeout: Duration)
    -> Result<()>;

    /// Submits primary command buffers in order and signals `signal` once
    /// all of them have retired.
    fn submit(
        &self,
        queue: QueueKind,
        command_buffers: &[CommandBufferHandle],
        signal: TimelineSignal,
    ) -> Result<()>;

    fn wait_idle(&self) -> Result<()>;
}
