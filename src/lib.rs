#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_arguments)]

//! # Myth GPU
//!
//! The resource and command core of the Myth renderer: the layer between
//! draw requests and an explicit, Vulkan-like GPU API.
//!
//! - [`memory`]: frame-tabbed transient ring, staging pool, upload heap
//! - [`descriptor`]: descriptor pool manager, resource sets, bindless tables
//! - [`command`]: pooled command lists, redundant-bind elimination,
//!   fork-join secondary recording
//! - [`frame`]: work/render frame scheduler, turn gates, frame statistics
//! - [`lifetime`]: ref-counted resource arena with deferred destruction
//! - [`context`]: [`RenderContext`], which owns all of the above
//!
//! The native API is reached through the [`GpuDevice`] trait;
//! [`HeadlessDevice`] implements it in memory.

pub mod backend;
pub mod command;
pub mod context;
pub mod descriptor;
pub mod errors;
pub mod frame;
pub mod lifetime;
pub mod memory;
pub mod settings;

pub use backend::{GpuDevice, HeadlessDevice};
pub use command::{CommandList, CommandQueue, CommandRecorder, ParallelRecorder, PipelineState, TrackedCommandList};
pub use context::{Buffer, RenderContext, Texture};
pub use descriptor::{
    BindlessRegistry, DescriptorBinding, DescriptorKind, DescriptorPayload, DescriptorPoolManager,
    DescriptorTable, ResourceCountHistogram, ResourceSet, ShaderStages,
};
pub use errors::{GpuError, Result};
pub use frame::{FrameInfo, FrameScheduler, FrameStats};
pub use lifetime::{DeferredDeleter, GpuResource, ResourceArena, ResourceKey};
pub use memory::{Ring, RingWithTabs, StagingPool, TransientBufferPool, UploadHeap};
pub use settings::GpuSettings;
