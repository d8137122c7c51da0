//! Resource Lifetime
//!
//! [`ResourceArena`] hands out ref-counted keys; releasing the last
//! reference hands the native object to a [`DeferredDeleter`], which
//! destroys it a fixed number of frames later.

pub mod arena;
pub mod deferred;

pub use arena::{ResourceArena, ResourceKey};
pub use deferred::{DeferredDeleter, GpuResource};
