//! Resource Sets
//!
//! A [`ResourceSet`] is a small, fixed group of descriptor slots shared by
//! many draws (the per-frame uniform buffer, a material's textures, ...).
//! Programs reflecting different layouts can all bind it: one native set is
//! created lazily per distinct layout hash and memoized.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use super::pool::DescriptorPoolManager;
use super::{DescriptorBinding, DescriptorPayload, ResourceCountHistogram, layout_hash};
use crate::backend::{
    DescriptorPoolHandle, DescriptorSetHandle, DescriptorSetLayoutDesc, DescriptorSetLayoutHandle,
    DescriptorWrite, GpuDevice,
};
use crate::errors::Result;

/// A native set layout together with the reflection data it was built from.
pub struct DescriptorSetLayoutInfo {
    device: Arc<dyn GpuDevice>,
    handle: DescriptorSetLayoutHandle,
    bindings: Vec<DescriptorBinding>,
    histogram: ResourceCountHistogram,
    hash: u64,
}

impl DescriptorSetLayoutInfo {
    pub fn new(device: Arc<dyn GpuDevice>, bindings: Vec<DescriptorBinding>, bindless: bool) -> Result<Self> {
        let handle = device.create_descriptor_set_layout(&DescriptorSetLayoutDesc {
            bindings: bindings.clone(),
            bindless,
        })?;
        Ok(Self {
            histogram: ResourceCountHistogram::from_bindings(&bindings),
            hash: layout_hash(&bindings),
            device,
            handle,
            bindings,
        })
    }

    #[inline]
    #[must_use]
    pub fn handle(&self) -> DescriptorSetLayoutHandle {
        self.handle
    }

    #[must_use]
    pub fn bindings(&self) -> &[DescriptorBinding] {
        &self.bindings
    }

    #[must_use]
    pub fn histogram(&self) -> &ResourceCountHistogram {
        &self.histogram
    }

    #[inline]
    #[must_use]
    pub fn hash(&self) -> u64 {
        self.hash
    }

    fn binding(&self, binding: u32) -> Option<&DescriptorBinding> {
        self.bindings.iter().find(|b| b.binding == binding)
    }
}

impl Drop for DescriptorSetLayoutInfo {
    fn drop(&mut self) {
        self.device.destroy_descriptor_set_layout(self.handle);
    }
}

impl std::fmt::Debug for DescriptorSetLayoutInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorSetLayoutInfo")
            .field("handle", &self.handle)
            .field("bindings", &self.bindings)
            .field("hash", &format_args!("{:#018x}", self.hash))
            .finish_non_exhaustive()
    }
}

struct MaterializedSet {
    set: DescriptorSetHandle,
    pool: DescriptorPoolHandle,
    histogram: ResourceCountHistogram,
    layout: Arc<DescriptorSetLayoutInfo>,
}

#[derive(Default)]
struct Inner {
    slots: SmallVec<[(u32, DescriptorPayload); 8]>,
    sets: FxHashMap<u64, MaterializedSet>,
}

pub struct ResourceSet {
    device: Arc<dyn GpuDevice>,
    pools: Arc<DescriptorPoolManager>,
    inner: Mutex<Inner>,
}

impl ResourceSet {
    #[must_use]
    pub fn new(device: Arc<dyn GpuDevice>, pools: Arc<DescriptorPoolManager>) -> Self {
        Self {
            device,
            pools,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Points `binding` at `payload` and rewrites it in every native set
    /// already created whose layout has that binding.
    pub fn set_resource(&self, binding: u32, payload: DescriptorPayload) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.slots.iter_mut().find(|(b, _)| *b == binding) {
            Some((_, current)) if *current == payload => return Ok(()),
            Some((_, current)) => *current = payload,
            None => inner.slots.push((binding, payload)),
        }

        for materialized in inner.sets.values() {
            if materialized
                .layout
                .binding(binding)
                .is_some_and(|b| payload.fits(b.kind))
            {
                self.device.write_descriptors(
                    materialized.set,
                    &[DescriptorWrite {
                        binding,
                        array_index: 0,
                        payload,
                    }],
                )?;
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn resource(&self, binding: u32) -> Option<DescriptorPayload> {
        self.inner
            .lock()
            .slots
            .iter()
            .find(|(b, _)| *b == binding)
            .map(|(_, p)| *p)
    }

    /// The native set for `layout`, created and filled on first use.
    pub fn descriptor_set(&self, layout: &Arc<DescriptorSetLayoutInfo>) -> Result<DescriptorSetHandle> {
        let mut inner = self.inner.lock();
        if let Some(materialized) = inner.sets.get(&layout.hash()) {
            return Ok(materialized.set);
        }

        let histogram = *layout.histogram();
        let (pool, set) = self.pools.allocate_set(layout.handle(), &histogram)?;

        let writes: SmallVec<[DescriptorWrite; 8]> = inner
            .slots
            .iter()
            .filter(|(binding, payload)| layout.binding(*binding).is_some_and(|b| payload.fits(b.kind)))
            .map(|&(binding, payload)| DescriptorWrite {
                binding,
                array_index: 0,
                payload,
            })
            .collect();
        if let Err(err) = self.device.write_descriptors(set, &writes) {
            self.pools.free_set(pool, set, &histogram)?;
            return Err(err);
        }

        log::debug!("Resource set materialized for layout {:#018x}", layout.hash());
        inner.sets.insert(
            layout.hash(),
            MaterializedSet {
                set,
                pool,
                histogram,
                layout: Arc::clone(layout),
            },
        );
        Ok(set)
    }

    /// Number of native sets created so far (one per distinct layout).
    #[must_use]
    pub fn materialized_count(&self) -> usize {
        self.inner.lock().sets.len()
    }
}

impl Drop for ResourceSet {
    fn drop(&mut self) {
        for (_, m) in self.inner.get_mut().sets.drain() {
            if let Err(err) = self.pools.free_set(m.pool, m.set, &m.histogram) {
                log::error!("Failed to release resource set: {err}");
            }
        }
    }
}

impl std::fmt::Debug for ResourceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ResourceSet")
            .field("slots", &inner.slots)
            .field("materialized", &inner.sets.len())
            .finish_non_exhaustive()
    }
}
