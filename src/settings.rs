//! GPU Core Settings
//!
//! Every pool in this crate is sized once at startup and never grows on the
//! hot path. [`GpuSettings`] gathers those sizes in one place so a workload
//! can be tuned without touching the subsystems themselves.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use myth_gpu::GpuSettings;
//!
//! // Defaults: triple buffering, 16 MiB transient ring, 64 MiB upload heap
//! let settings = GpuSettings::default();
//!
//! // A small tool that renders a handful of quads
//! let settings = GpuSettings {
//!     frames_in_flight: 2,
//!     transient_buffer_size: 1 << 20,
//!     ..Default::default()
//! };
//! ```

use std::time::Duration;

/// Tunables for the GPU core.
///
/// # Sizing
///
/// | Field                       | Exhaustion behavior                              |
/// |-----------------------------|--------------------------------------------------|
/// | `transient_buffer_size`     | `GpuError::TransientPoolExhausted`               |
/// | `upload_heap_size`          | emergency flush, then `UploadHeapTooSmall`       |
/// | `bindless_capacity`         | `GpuError::DescriptorTableFull`                  |
/// | `descriptor_set_budget`     | a new native pool is created                     |
///
/// The first three are configuration errors: the fix is a bigger number here,
/// not a retry.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuSettings {
    /// Maximum number of frames the CPU may run ahead of the GPU.
    ///
    /// This is a static upper bound on GPU latency; ring tabs are reclaimed
    /// after exactly this many frame boundaries.
    pub frames_in_flight: usize,

    /// Size in bytes of the per-frame transient ring (uniforms, dynamic vertex
    /// and index data).
    pub transient_buffer_size: u64,

    /// Alignment of every transient sub-allocation.
    pub transient_alignment: u64,

    /// Size in bytes of the linear upload heap.
    pub upload_heap_size: u64,

    /// Number of frames a staging block must sit unused before it can be
    /// handed out again.
    pub staging_reuse_age: u64,

    /// Number of frame boundaries a released resource survives before it is
    /// destroyed.
    pub deferred_delete_ttl: u32,

    /// Descriptor sets carved from each native descriptor pool.
    pub descriptor_set_budget: u32,

    /// Slot capacity of each bindless descriptor table.
    pub bindless_capacity: u32,

    /// Draw batches at or above this many items are recorded in parallel.
    pub parallel_record_threshold: usize,

    /// Worker threads for parallel recording. `None` uses the available
    /// hardware parallelism.
    pub worker_threads: Option<usize>,

    /// When `false`, the main/render turn gates are bypassed.
    pub threaded_frames: bool,

    /// Upper bound for any blocking wait on a timeline value.
    pub wait_timeout: Duration,
}

impl Default for GpuSettings {
    fn default() -> Self {
        Self {
            frames_in_flight: 3,
            transient_buffer_size: 16 * 1024 * 1024,
            transient_alignment: 256,
            upload_heap_size: 64 * 1024 * 1024,
            staging_reuse_age: 10,
            deferred_delete_ttl: 4,
            descriptor_set_budget: 64,
            bindless_capacity: 4096,
            parallel_record_threshold: 200,
            worker_threads: None,
            threaded_frames: false,
            wait_timeout: Duration::from_secs(5),
        }
    }
}

impl GpuSettings {
    /// Resolves [`worker_threads`](Self::worker_threads) to a concrete count.
    #[must_use]
    pub fn resolved_worker_threads(&self) -> usize {
        self.worker_threads
            .unwrap_or_else(|| {
                std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
            })
            .max(1)
    }
}
