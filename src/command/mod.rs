//! Command Recording & Submission
//!
//! - [`CommandQueue`]: pooled command lists and a timeline counter per queue
//! - [`TrackedCommandList`]: redundant-bind elimination over a command buffer
//! - [`ParallelRecorder`]: fork-join recording of large draw batches

pub mod parallel;
pub mod queue;
pub mod tracked;

pub use parallel::{BatchMode, ParallelRecorder};
pub use crate::backend::QueueKind;
pub use queue::{CommandList, CommandQueue};
pub use tracked::{CommandRecorder, PipelineState, TrackedCommandList};
