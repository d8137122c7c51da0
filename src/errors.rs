//! Error Types
//!
//! This module defines the error types used throughout the GPU core.
//!
//! # Overview
//!
//! The main error type [`GpuError`] covers three families of failure:
//! - Native API failures (a device call returned a non-success code)
//! - Configuration errors (a pool, ring or heap is too small for the workload)
//! - Protocol violations that can be detected cheaply (leaked staging blocks,
//!   unknown pool handles)
//!
//! Hot-path allocators (`Ring`, `RingWithTabs`, `UploadHeap::suballocate`)
//! do not produce errors; they return `Option`/`bool` and the immediate caller
//! decides whether to flush and retry or to surface one of these errors.
//!
//! # Usage
//!
//! ```rust,ignore
//! use myth_gpu::errors::{GpuError, Result};
//!
//! fn upload() -> Result<()> {
//!     // Operations that may fail return Result
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// The main error type for the GPU core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    // ========================================================================
    // Native API Errors
    // ========================================================================
    /// A native device call failed.
    #[error("Device call `{call}` failed: {reason}")]
    DeviceCall {
        /// Name of the failing call
        call: &'static str,
        /// Backend supplied reason
        reason: String,
    },

    /// A handle was passed to the device that it does not know about.
    #[error("Invalid {kind} handle: {id}")]
    InvalidHandle {
        /// Handle category ("buffer", "image", ...)
        kind: &'static str,
        /// Raw handle value
        id: u64,
    },

    /// Waiting for a timeline value did not finish in time.
    #[error("Timed out waiting for timeline value {value} (reached {reached})")]
    Timeout {
        /// The awaited value
        value: u64,
        /// The value the timeline had reached when the wait gave up
        reached: u64,
    },

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// The transient ring has no room left for this frame.
    #[error(
        "Transient buffer pool exhausted: requested {requested} bytes, {allocated}/{capacity} in use"
    )]
    TransientPoolExhausted {
        /// Aligned request size
        requested: u64,
        /// Bytes currently held by in-flight frames
        allocated: u64,
        /// Total ring size
        capacity: u64,
    },

    /// A single upload is larger than the whole upload heap.
    #[error("Upload of {requested} bytes does not fit an upload heap of {capacity} bytes")]
    UploadHeapTooSmall {
        /// Aligned request size
        requested: u64,
        /// Heap size
        capacity: u64,
    },

    /// A bindless table ran out of slots.
    #[error("Descriptor table full: capacity {capacity}")]
    DescriptorTableFull {
        /// Fixed slot capacity of the table
        capacity: u32,
    },

    /// A bindless index was outside the table.
    #[error("Descriptor index {index} out of range (table length {len})")]
    DescriptorIndexOutOfRange {
        /// Requested index
        index: u32,
        /// Current table length
        len: u32,
    },

    /// A descriptor pool refused an allocation even though its budget allowed it.
    #[error("Descriptor pool exhausted: {0}")]
    DescriptorPoolExhausted(String),

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Staging blocks were still in use at shutdown.
    #[error("Staging pool terminated with {count} block(s) still in use")]
    StagingLeak {
        /// Number of blocks in the used set
        count: usize,
    },

    /// Variants of one bindless kind handed out different indices.
    #[error("Bindless variants out of step: expected index {expected}, got {found}")]
    BindlessIndexMismatch {
        /// Index issued by the first variant
        expected: u32,
        /// Index issued by the variant that diverged
        found: u32,
    },

    /// A descriptor pool handle was returned that the manager never issued.
    #[error("Unknown descriptor pool: {0}")]
    UnknownDescriptorPool(u64),

    /// A resource key did not resolve to a live arena entry.
    #[error("Stale resource key")]
    StaleResource,
}

/// Alias for `Result<T, GpuError>`.
pub type Result<T> = std::result::Result<T, GpuError>;
