//! Tracked Command Recording
//!
//! [`TrackedCommandList`] wraps a recording command buffer and remembers the
//! last bound program, fixed-function state, descriptor sets and geometry
//! buffers, so a bind that would not change anything never reaches the
//! native API. Sorted draw lists bind the same state over and over; skipping
//! those calls is a real CPU-side win.
//!
//! The cache is per command buffer. A secondary buffer starts with an empty
//! cache even if the primary already bound the same state.

use std::ops::Range;

use smallvec::SmallVec;

use crate::backend::{
    BlendState, BufferHandle, Command, CommandBufferHandle, DepthState, DescriptorSetHandle,
    GpuDevice, IndexFormat, PipelineHandle, RasterState, Scissor, Viewport,
};
use crate::descriptor::ShaderStages;
use crate::frame::FrameStats;

const MAX_DESCRIPTOR_SETS: usize = 4;
const MAX_VERTEX_BUFFERS: usize = 8;

/// Full pipeline state of one draw: the linked program plus the value states
/// set dynamically on top of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineState {
    pub program: PipelineHandle,
    pub raster: RasterState,
    pub blend: BlendState,
    pub depth: DepthState,
}

impl PipelineState {
    #[must_use]
    pub fn new(program: PipelineHandle) -> Self {
        Self {
            program,
            raster: RasterState::default(),
            blend: BlendState::default(),
            depth: DepthState::default(),
        }
    }
}

/// The recording interface draw code is written against.
pub trait CommandRecorder {
    fn bind_pipeline_state(&mut self, state: &PipelineState);
    fn bind_descriptor_set(&mut self, index: u32, set: DescriptorSetHandle, dynamic_offsets: &[u32]);
    fn bind_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, offset: u64);
    fn bind_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat);
    fn set_viewport(&mut self, viewport: Viewport);
    fn set_scissor(&mut self, scissor: Scissor);
    fn push_constants(&mut self, stages: ShaderStages, offset: u32, data: &[u8]);
    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>);
    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>);
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DescriptorSetState {
    set: DescriptorSetHandle,
    offsets: SmallVec<[u32; 4]>,
}

/// A [`CommandRecorder`] that skips redundant state binds.
pub struct TrackedCommandList<'a> {
    device: &'a dyn GpuDevice,
    buffer: CommandBufferHandle,
    stats: Option<&'a FrameStats>,

    current_program: Option<PipelineHandle>,
    current_raster: Option<RasterState>,
    current_blend: Option<BlendState>,
    current_depth: Option<DepthState>,
    current_sets: [Option<DescriptorSetState>; MAX_DESCRIPTOR_SETS],
    current_vertex_buffers: [Option<(BufferHandle, u64)>; MAX_VERTEX_BUFFERS],
    current_index_buffer: Option<(BufferHandle, u64, IndexFormat)>,

    skipped: u64,
    draws: u64,
}

impl<'a> TrackedCommandList<'a> {
    #[must_use]
    pub fn new(device: &'a dyn GpuDevice, buffer: CommandBufferHandle) -> Self {
        Self {
            device,
            buffer,
            stats: None,
            current_program: None,
            current_raster: None,
            current_blend: None,
            current_depth: None,
            current_sets: Default::default(),
            current_vertex_buffers: [None; MAX_VERTEX_BUFFERS],
            current_index_buffer: None,
            skipped: 0,
            draws: 0,
        }
    }

    /// Reports draws and skipped binds into `stats` as well.
    #[must_use]
    pub fn with_stats(mut self, stats: &'a FrameStats) -> Self {
        self.stats = Some(stats);
        self
    }

    #[must_use]
    pub fn command_buffer(&self) -> CommandBufferHandle {
        self.buffer
    }

    /// Binds elided so far.
    #[must_use]
    pub fn skipped_binds(&self) -> u64 {
        self.skipped
    }

    #[must_use]
    pub fn draw_count(&self) -> u64 {
        self.draws
    }

    /// Forgets every cached binding. Needed after anything recorded outside
    /// this wrapper (e.g. executing secondaries) may have changed state.
    pub fn invalidate(&mut self) {
        self.current_program = None;
        self.current_raster = None;
        self.current_blend = None;
        self.current_depth = None;
        self.current_sets = Default::default();
        self.current_vertex_buffers = [None; MAX_VERTEX_BUFFERS];
        self.current_index_buffer = None;
    }

    /// Records `command` without touching the cache.
    pub fn record_raw(&mut self, command: Command) {
        self.device.record(self.buffer, command);
    }

    fn skip(&mut self) {
        self.skipped += 1;
        if let Some(stats) = self.stats {
            stats.record_skipped_bind();
        }
    }

    fn count_draw(&mut self) {
        self.draws += 1;
        if let Some(stats) = self.stats {
            stats.record_draw();
        }
    }
}

impl CommandRecorder for TrackedCommandList<'_> {
    fn bind_pipeline_state(&mut self, state: &PipelineState) {
        if self.current_program == Some(state.program) {
            self.skip();
        } else {
            self.device.record(self.buffer, Command::BindPipeline(state.program));
            self.current_program = Some(state.program);
        }

        if self.current_raster == Some(state.raster) {
            self.skip();
        } else {
            self.device.record(self.buffer, Command::SetRasterState(state.raster));
            self.current_raster = Some(state.raster);
        }

        if self.current_blend == Some(state.blend) {
            self.skip();
        } else {
            self.device.record(self.buffer, Command::SetBlendState(state.blend));
            self.current_blend = Some(state.blend);
        }

        if self.current_depth == Some(state.depth) {
            self.skip();
        } else {
            self.device.record(self.buffer, Command::SetDepthState(state.depth));
            self.current_depth = Some(state.depth);
        }
    }

    fn bind_descriptor_set(&mut self, index: u32, set: DescriptorSetHandle, dynamic_offsets: &[u32]) {
        let slot = index as usize;
        let needs_update = match self.current_sets.get(slot) {
            Some(Some(state)) => state.set != set || state.offsets.as_slice() != dynamic_offsets,
            _ => true,
        };

        if !needs_update {
            self.skip();
            return;
        }

        let offsets = SmallVec::from_slice(dynamic_offsets);
        self.device.record(
            self.buffer,
            Command::BindDescriptorSet {
                index,
                set,
                dynamic_offsets: offsets.clone(),
            },
        );
        if let Some(cached) = self.current_sets.get_mut(slot) {
            *cached = Some(DescriptorSetState { set, offsets });
        }
    }

    fn bind_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, offset: u64) {
        let index = slot as usize;
        if self.current_vertex_buffers.get(index) == Some(&Some((buffer, offset))) {
            self.skip();
            return;
        }
        self.device.record(self.buffer, Command::BindVertexBuffer { slot, buffer, offset });
        if let Some(cached) = self.current_vertex_buffers.get_mut(index) {
            *cached = Some((buffer, offset));
        }
    }

    fn bind_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat) {
        if self.current_index_buffer == Some((buffer, offset, format)) {
            self.skip();
            return;
        }
        self.device.record(self.buffer, Command::BindIndexBuffer { buffer, offset, format });
        self.current_index_buffer = Some((buffer, offset, format));
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.device.record(self.buffer, Command::SetViewport(viewport));
    }

    fn set_scissor(&mut self, scissor: Scissor) {
        self.device.record(self.buffer, Command::SetScissor(scissor));
    }

    fn push_constants(&mut self, stages: ShaderStages, offset: u32, data: &[u8]) {
        self.device.record(
            self.buffer,
            Command::PushConstants {
                stages,
                offset,
                data: SmallVec::from_slice(data),
            },
        );
    }

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        self.device.record(self.buffer, Command::Draw { vertices, instances });
        self.count_draw();
    }

    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>) {
        self.device.record(
            self.buffer,
            Command::DrawIndexed {
                indices,
                base_vertex,
                instances,
            },
        );
        self.count_draw();
    }
}

impl std::fmt::Debug for TrackedCommandList<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedCommandList")
            .field("buffer", &self.buffer)
            .field("skipped", &self.skipped)
            .field("draws", &self.draws)
            .finish_non_exhaustive()
    }
}
