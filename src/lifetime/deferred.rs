//! Deferred Destruction
//!
//! Destroying a GPU object while a command list still references it is
//! undefined behavior. Objects are therefore never destroyed when their last
//! reference goes away; they are scheduled for the generation
//! `current + ttl` and destroyed once [`DeferredDeleter::gc`] (run once per
//! frame) reaches that generation.
//!
//! Entries are kept in non-decreasing order of their target generation, so
//! `gc` only ever looks at the front of the queue and stops at the first
//! entry that is not due.

use std::collections::VecDeque;

use crate::backend::{BufferHandle, ImageHandle};
use crate::descriptor::DescriptorKind;

/// Anything the core can destroy later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuResource {
    Buffer(BufferHandle),
    Image(ImageHandle),
    /// An image plus the bindless slot that points at it. The slot is
    /// rebound to the placeholder before the image goes away.
    Texture {
        image: ImageHandle,
        kind: DescriptorKind,
        bindless_index: u32,
    },
}

#[derive(Debug)]
struct Pending {
    resource: GpuResource,
    reclaim_at: u64,
}

#[derive(Debug)]
pub struct DeferredDeleter {
    generation: u64,
    ttl: u64,
    queue: VecDeque<Pending>,
}

impl DeferredDeleter {
    /// `ttl`: number of `gc` passes an object survives.
    #[must_use]
    pub fn new(ttl: u32) -> Self {
        Self {
            generation: 0,
            ttl: u64::from(ttl),
            queue: VecDeque::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn ttl(&self) -> u64 {
        self.ttl
    }

    /// Schedules `resource` with the default ttl.
    pub fn schedule(&mut self, resource: GpuResource) -> u64 {
        self.schedule_with_ttl(resource, self.ttl)
    }

    /// Schedules `resource` for generation `current + ttl`. The target is
    /// raised to the latest already queued so the queue stays ordered; an
    /// object is destroyed late, never early. Returns the target generation.
    pub fn schedule_with_ttl(&mut self, resource: GpuResource, ttl: u64) -> u64 {
        let mut reclaim_at = self.generation + ttl;
        if let Some(last) = self.queue.back() {
            reclaim_at = reclaim_at.max(last.reclaim_at);
        }
        self.queue.push_back(Pending { resource, reclaim_at });
        reclaim_at
    }

    /// Advances one generation and destroys every entry now due. Returns how
    /// many were destroyed.
    pub fn gc(&mut self, mut destroy: impl FnMut(GpuResource)) -> usize {
        self.generation += 1;
        let mut destroyed = 0;
        while self
            .queue
            .front()
            .is_some_and(|p| p.reclaim_at <= self.generation)
        {
            if let Some(p) = self.queue.pop_front() {
                destroy(p.resource);
                destroyed += 1;
            }
        }
        if destroyed > 0 {
            log::debug!("Deferred deleter: {destroyed} object(s) destroyed at generation {}", self.generation);
        }
        destroyed
    }

    /// Destroys everything regardless of ttl. Only valid once the device is
    /// idle.
    pub fn force_gc(&mut self, mut destroy: impl FnMut(GpuResource)) -> usize {
        let count = self.queue.len();
        for p in self.queue.drain(..) {
            destroy(p.resource);
        }
        if count > 0 {
            log::info!("Deferred deleter: force-destroyed {count} object(s)");
        }
        count
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}
