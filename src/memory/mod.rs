//! GPU Memory
//!
//! | Allocator               | Lifetime of an allocation            | Reclaimed by           |
//! |-------------------------|--------------------------------------|------------------------|
//! | [`TransientBufferPool`] | `frames_in_flight` frame boundaries  | frame advance          |
//! | [`StagingPool`]         | until aged `reuse_age` frames        | `gc()` once per frame  |
//! | [`UploadHeap`]          | until the next flush                 | `flush_and_finish()`   |
//!
//! All three are built on explicit offset arithmetic over one or more
//! host-visible native buffers; [`Ring`] and [`RingWithTabs`] are the
//! underlying FIFO allocators for the transient path.

pub mod ring;
pub mod staging;
pub mod transient;
pub mod upload_heap;

pub use ring::{Ring, RingWithTabs};
pub use staging::{StageRef, StagingPool};
pub use transient::{TransientAllocation, TransientBufferPool};
pub use upload_heap::{SyncCounter, UploadHeap, UploadReservation};
