//! Reference-counted GPU objects.
//!
//! Objects live in a [`SlotMap`] keyed by [`ResourceKey`]. A key stays valid
//! until the count drops to zero; from then on lookups fail (the slot
//! generation changed) while the native object waits in the deferred queue.

use slotmap::{SlotMap, new_key_type};

use super::deferred::{DeferredDeleter, GpuResource};
use crate::errors::{GpuError, Result};

new_key_type! {
    pub struct ResourceKey;
}

#[derive(Debug)]
struct Entry {
    resource: GpuResource,
    refs: u32,
}

#[derive(Debug)]
pub struct ResourceArena {
    entries: SlotMap<ResourceKey, Entry>,
    deleter: DeferredDeleter,
}

impl ResourceArena {
    #[must_use]
    pub fn new(ttl: u32) -> Self {
        Self {
            entries: SlotMap::with_key(),
            deleter: DeferredDeleter::new(ttl),
        }
    }

    /// Registers `resource` with one reference.
    pub fn insert(&mut self, resource: GpuResource) -> ResourceKey {
        self.entries.insert(Entry { resource, refs: 1 })
    }

    #[must_use]
    pub fn get(&self, key: ResourceKey) -> Option<GpuResource> {
        self.entries.get(key).map(|e| e.resource)
    }

    #[must_use]
    pub fn ref_count(&self, key: ResourceKey) -> Option<u32> {
        self.entries.get(key).map(|e| e.refs)
    }

    /// Adds a reference. Returns the new count.
    pub fn retain(&mut self, key: ResourceKey) -> Result<u32> {
        let entry = self.entries.get_mut(key).ok_or(GpuError::StaleResource)?;
        entry.refs += 1;
        Ok(entry.refs)
    }

    /// Drops a reference. At zero the key dies and the object is scheduled
    /// for destruction. Returns the remaining count.
    pub fn release(&mut self, key: ResourceKey) -> Result<u32> {
        let entry = self.entries.get_mut(key).ok_or(GpuError::StaleResource)?;
        entry.refs -= 1;
        let refs = entry.refs;
        if refs == 0 {
            if let Some(entry) = self.entries.remove(key) {
                let at = self.deleter.schedule(entry.resource);
                log::trace!("{:?} scheduled for destruction at generation {at}", entry.resource);
            }
        }
        Ok(refs)
    }

    /// One frame of deferred destruction.
    pub fn gc(&mut self, destroy: impl FnMut(GpuResource)) -> usize {
        self.deleter.gc(destroy)
    }

    /// Destroys every scheduled object and every object still referenced.
    /// Only valid once the device is idle.
    pub fn force_gc(&mut self, mut destroy: impl FnMut(GpuResource)) -> usize {
        let live = self.entries.len();
        for (_, entry) in self.entries.drain() {
            destroy(entry.resource);
        }
        live + self.deleter.force_gc(destroy)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Objects waiting in the deferred queue.
    #[must_use]
    pub fn pending_destruction(&self) -> usize {
        self.deleter.pending()
    }

    #[must_use]
    pub fn deleter(&self) -> &DeferredDeleter {
        &self.deleter
    }
}
