//! Value types crossing the native API seam.
//!
//! Descriptors, barriers, copy regions and the [`Command`] enum that a
//! command buffer records. None of these own anything; they are plain data
//! handed to a [`GpuDevice`](super::GpuDevice).

use std::ops::Range;

use bitflags::bitflags;
use smallvec::SmallVec;

use super::{BufferHandle, CommandBufferHandle, ImageHandle, PipelineHandle, DescriptorSetHandle};
use crate::descriptor::{DescriptorBinding, ResourceCountHistogram, ShaderStages};

// ─── Queues ──────────────────────────────────────────────────────────────────

/// Hardware queue families the core submits to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Compute,
    Copy,
}

/// Primary buffers are submitted; secondary buffers are executed from a
/// primary inside a rendering scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandBufferLevel {
    Primary,
    Secondary,
}

/// Timeline value signaled when a submission retires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineSignal {
    pub timeline: super::TimelineHandle,
    pub value: u64,
}

// ─── Buffers ─────────────────────────────────────────────────────────────────

bitflags! {
    /// How a buffer may be used by the GPU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const UNIFORM      = 1 << 0;
        const VERTEX       = 1 << 1;
        const INDEX        = 1 << 2;
        const STORAGE      = 1 << 3;
        const INDIRECT     = 1 << 4;
        const TRANSFER_SRC = 1 << 5;
        const TRANSFER_DST = 1 << 6;
    }
}

/// Where a buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// GPU-only memory; filled through copies.
    DeviceLocal,
    /// Host-visible, coherent memory; written directly by the CPU.
    HostVisible,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    pub label: &'static str,
    pub size: u64,
    pub usage: BufferUsage,
    pub location: MemoryLocation,
}

// ─── Images ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    R16Float,
    Rgba16Float,
    R32Float,
    Rgba32Float,
    Depth32Float,
    Depth24Stencil8,
}

impl Format {
    /// Size of one texel in bytes.
    #[must_use]
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            Self::R8Unorm => 1,
            Self::Rg8Unorm | Self::R16Float => 2,
            Self::Rgba8Unorm
            | Self::Rgba8Srgb
            | Self::Bgra8Unorm
            | Self::R32Float
            | Self::Depth32Float
            | Self::Depth24Stencil8 => 4,
            Self::Rgba16Float => 8,
            Self::Rgba32Float => 16,
        }
    }

    #[must_use]
    pub fn is_depth(self) -> bool {
        matches!(self, Self::Depth32Float | Self::Depth24Stencil8)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const SAMPLED          = 1 << 0;
        const STORAGE          = 1 << 1;
        const COLOR_ATTACHMENT = 1 << 2;
        const DEPTH_ATTACHMENT = 1 << 3;
        const TRANSFER_DST     = 1 << 4;
        const TRANSFER_SRC     = 1 << 5;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDesc {
    pub label: &'static str,
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: Format,
    pub usage: ImageUsage,
}

impl ImageDesc {
    /// Single-mip, single-layer sampled 2D image that can be uploaded to.
    #[must_use]
    pub fn texture_2d(label: &'static str, width: u32, height: u32, format: Format) -> Self {
        Self {
            label,
            width,
            height,
            mip_levels: 1,
            array_layers: 1,
            format,
            usage: ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST,
        }
    }

    /// Byte size of one mip level of one layer.
    #[must_use]
    pub fn mip_byte_size(&self, mip: u32) -> u64 {
        let w = u64::from((self.width >> mip).max(1));
        let h = u64::from((self.height >> mip).max(1));
        w * h * u64::from(self.format.bytes_per_texel())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    Undefined,
    TransferDst,
    ShaderReadOnly,
    ColorAttachment,
    DepthAttachment,
    General,
}

// ─── Copies & Barriers ───────────────────────────────────────────────────────

/// Region of a buffer-to-image copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferImageCopy {
    pub buffer_offset: u64,
    pub mip_level: u32,
    pub array_layer: u32,
    pub width: u32,
    pub height: u32,
}

/// Coarse access classes used by buffer barriers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceAccess {
    None,
    TransferWrite,
    VertexRead,
    IndexRead,
    UniformRead,
    ShaderRead,
    ShaderWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Barrier {
    Buffer {
        buffer: BufferHandle,
        before: ResourceAccess,
        after: ResourceAccess,
    },
    Image {
        image: ImageHandle,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
        base_mip: u32,
        mip_count: u32,
    },
}

// ─── Descriptors ─────────────────────────────────────────────────────────────

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DescriptorPoolFlags: u32 {
        /// Sets may be returned to the pool individually.
        const FREE_DESCRIPTOR_SET = 1 << 0;
        /// Descriptors may be rewritten after the set is bound.
        const UPDATE_AFTER_BIND   = 1 << 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorPoolDesc {
    /// Descriptors of each kind for the whole pool.
    pub counts: ResourceCountHistogram,
    pub max_sets: u32,
    pub flags: DescriptorPoolFlags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorSetLayoutDesc {
    pub bindings: Vec<DescriptorBinding>,
    /// Bindless layouts are partially bound and updatable after bind.
    pub bindless: bool,
}

/// One descriptor array element to (re)write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub array_index: u32,
    pub payload: crate::descriptor::DescriptorPayload,
}

// ─── Pipeline value states ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RasterState {
    pub cull_mode: CullMode,
    pub front_ccw: bool,
    pub wireframe: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendMode {
    #[default]
    Opaque,
    Alpha,
    Additive,
    Premultiplied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlendState {
    pub mode: BlendMode,
    pub write_mask: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    #[default]
    LessEqual,
    Greater,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DepthState {
    pub test: bool,
    pub write: bool,
    pub compare: CompareOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U16,
    U32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    #[must_use]
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Scissor {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

// ─── Rendering scopes ────────────────────────────────────────────────────────

/// State a secondary command buffer inherits from the primary pass it will be
/// executed in.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderingInheritance {
    pub color_formats: SmallVec<[Format; 4]>,
    pub depth_format: Option<Format>,
    pub viewport: Viewport,
    pub scissor: Scissor,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderingInfo {
    pub color_targets: SmallVec<[ImageHandle; 4]>,
    pub color_formats: SmallVec<[Format; 4]>,
    pub depth_target: Option<ImageHandle>,
    pub depth_format: Option<Format>,
    pub viewport: Viewport,
    pub scissor: Scissor,
    /// Contents are provided by secondary command buffers.
    pub secondary_contents: bool,
}

impl RenderingInfo {
    /// What a secondary buffer recorded for this pass must inherit.
    #[must_use]
    pub fn inheritance(&self) -> RenderingInheritance {
        RenderingInheritance {
            color_formats: self.color_formats.clone(),
            depth_format: self.depth_format,
            viewport: self.viewport,
            scissor: self.scissor,
        }
    }
}

// ─── Commands ────────────────────────────────────────────────────────────────

/// One recorded native command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    BeginRendering(RenderingInfo),
    EndRendering,
    BindPipeline(PipelineHandle),
    SetRasterState(RasterState),
    SetBlendState(BlendState),
    SetDepthState(DepthState),
    BindDescriptorSet {
        index: u32,
        set: DescriptorSetHandle,
        dynamic_offsets: SmallVec<[u32; 4]>,
    },
    BindVertexBuffer {
        slot: u32,
        buffer: BufferHandle,
        offset: u64,
    },
    BindIndexBuffer {
        buffer: BufferHandle,
        offset: u64,
        format: IndexFormat,
    },
    SetViewport(Viewport),
    SetScissor(Scissor),
    PushConstants {
        stages: ShaderStages,
        offset: u32,
        data: SmallVec<[u8; 128]>,
    },
    Draw {
        vertices: Range<u32>,
        instances: Range<u32>,
    },
    DrawIndexed {
        indices: Range<u32>,
        base_vertex: i32,
        instances: Range<u32>,
    },
    CopyBuffer {
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    },
    CopyBufferToImage {
        src: BufferHandle,
        dst: ImageHandle,
        region: BufferImageCopy,
    },
    PipelineBarrier(SmallVec<[Barrier; 4]>),
    ExecuteSecondary(SmallVec<[CommandBufferHandle; 8]>),
}
