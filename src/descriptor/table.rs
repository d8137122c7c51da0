//! Bindless Descriptor Tables
//!
//! A [`DescriptorTable`] is one large descriptor array referenced by integer
//! index from shader code. Indices are stable: once issued, an index names
//! one live resource until it is freed. Freed indices are reused (most
//! recently freed first) before the table grows.
//!
//! A freed slot is immediately rebound to the table's placeholder resource.
//! A draw still in flight that reads a stale index therefore samples the
//! placeholder instead of a destroyed object.
//!
//! The shader-stage mask of a descriptor is fixed when its layout is
//! created, so a table exists once per visibility. [`BindlessRegistry`]
//! keeps the variants of one kind in lockstep, which makes an index valid
//! in every variant, and picks the variant a program's reflection asks for.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use super::pool::DescriptorPoolManager;
use super::resource_set::DescriptorSetLayoutInfo;
use super::{DescriptorBinding, DescriptorKind, DescriptorPayload, ShaderStages};
use crate::backend::{DescriptorPoolHandle, DescriptorSetHandle, DescriptorWrite, GpuDevice};
use crate::errors::{GpuError, Result};

#[derive(Default)]
struct TableState {
    slots: Vec<DescriptorPayload>,
    live: Vec<bool>,
    free: Vec<u32>,
    sets: SmallVec<[DescriptorSetHandle; 2]>,
}

pub struct DescriptorTable {
    device: Arc<dyn GpuDevice>,
    kind: DescriptorKind,
    stages: ShaderStages,
    binding: u32,
    capacity: u32,
    placeholder: DescriptorPayload,
    state: Mutex<TableState>,
}

impl DescriptorTable {
    #[must_use]
    pub fn new(
        device: Arc<dyn GpuDevice>,
        kind: DescriptorKind,
        stages: ShaderStages,
        binding: u32,
        capacity: u32,
        placeholder: DescriptorPayload,
    ) -> Self {
        debug_assert!(placeholder.fits(kind), "placeholder does not fit a {kind:?} table");
        Self {
            device,
            kind,
            stages,
            binding,
            capacity,
            placeholder,
            state: Mutex::new(TableState::default()),
        }
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> DescriptorKind {
        self.kind
    }

    #[inline]
    #[must_use]
    pub fn stages(&self) -> ShaderStages {
        self.stages
    }

    #[inline]
    #[must_use]
    pub fn binding(&self) -> u32 {
        self.binding
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[must_use]
    pub fn placeholder(&self) -> DescriptorPayload {
        self.placeholder
    }

    /// The reflected binding a layout for this table is built from.
    #[must_use]
    pub fn layout_binding(&self, set: u32) -> DescriptorBinding {
        DescriptorBinding::new(
            set,
            self.binding,
            self.kind,
            self.capacity,
            self.stages,
            format!("bindless_{:?}", self.kind),
        )
    }

    /// Writes `payload` at `index` into every set. If one write fails, the
    /// sets already written get `previous` back, so no set is left holding
    /// a payload the table does not record.
    fn write_all(
        &self,
        sets: &[DescriptorSetHandle],
        index: u32,
        payload: DescriptorPayload,
        previous: DescriptorPayload,
    ) -> Result<()> {
        let write = |payload| {
            [DescriptorWrite {
                binding: self.binding,
                array_index: index,
                payload,
            }]
        };
        for (written, &set) in sets.iter().enumerate() {
            if let Err(err) = self.device.write_descriptors(set, &write(payload)) {
                log::error!("{:?} table: write of index {index} to set {} failed: {err}", self.kind, set.raw());
                for &done in &sets[..written] {
                    if let Err(restore) = self.device.write_descriptors(done, &write(previous)) {
                        log::error!("{:?} table: could not restore index {index} in set {}: {restore}", self.kind, done.raw());
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Stores `payload` and returns its index, reusing a freed index when one
    /// is available.
    pub fn add(&self, payload: DescriptorPayload) -> Result<u32> {
        let mut state = self.state.lock();
        let index = match state.free.pop() {
            Some(index) => index,
            None => {
                let len = state.slots.len() as u32;
                if len >= self.capacity {
                    let err = GpuError::DescriptorTableFull { capacity: self.capacity };
                    log::error!("{:?} table ({:?}): {err}", self.kind, self.stages);
                    return Err(err);
                }
                state.slots.push(self.placeholder);
                state.live.push(false);
                len
            }
        };

        if let Err(err) = self.write_all(&state.sets, index, payload, self.placeholder) {
            state.free.push(index);
            return Err(err);
        }
        state.slots[index as usize] = payload;
        state.live[index as usize] = true;
        Ok(index)
    }

    /// Rewrites a live slot. Returns `false` without touching the native sets
    /// when the payload is unchanged.
    pub fn update(&self, index: u32, payload: DescriptorPayload) -> Result<bool> {
        let mut state = self.state.lock();
        let len = state.slots.len() as u32;
        if index >= len || !state.live[index as usize] {
            return Err(GpuError::DescriptorIndexOutOfRange { index, len });
        }
        if state.slots[index as usize] == payload {
            return Ok(false);
        }
        let previous = state.slots[index as usize];
        self.write_all(&state.sets, index, payload, previous)?;
        state.slots[index as usize] = payload;
        Ok(true)
    }

    /// Rebinds `index` to the placeholder and returns it to the free list.
    /// Returns `false` if the index was not live.
    ///
    /// On error the slot stays live with its payload in every set, so the
    /// resource behind it must not be destroyed.
    pub fn free(&self, index: u32) -> Result<bool> {
        let mut state = self.state.lock();
        let len = state.slots.len() as u32;
        if index >= len {
            return Err(GpuError::DescriptorIndexOutOfRange { index, len });
        }
        if !state.live[index as usize] {
            log::warn!("{:?} table: index {index} freed twice", self.kind);
            return Ok(false);
        }
        let previous = state.slots[index as usize];
        self.write_all(&state.sets, index, self.placeholder, previous)?;
        state.slots[index as usize] = self.placeholder;
        state.live[index as usize] = false;
        state.free.push(index);
        Ok(true)
    }

    /// Shares the table with another native set, writing every current slot
    /// into it.
    pub fn attach_set(&self, set: DescriptorSetHandle) -> Result<()> {
        let mut state = self.state.lock();
        let writes: Vec<DescriptorWrite> = state
            .slots
            .iter()
            .enumerate()
            .map(|(i, &payload)| DescriptorWrite {
                binding: self.binding,
                array_index: i as u32,
                payload,
            })
            .collect();
        self.device.write_descriptors(set, &writes)?;
        state.sets.push(set);
        Ok(())
    }

    #[must_use]
    pub fn sets(&self) -> SmallVec<[DescriptorSetHandle; 2]> {
        self.state.lock().sets.clone()
    }

    /// Current payload at `index` (the placeholder for freed slots).
    #[must_use]
    pub fn payload(&self, index: u32) -> Option<DescriptorPayload> {
        self.state.lock().slots.get(index as usize).copied()
    }

    /// Slots ever handed out, live or free.
    #[must_use]
    pub fn len(&self) -> u32 {
        self.state.lock().slots.len() as u32
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.state.lock().live.iter().filter(|l| **l).count()
    }
}

impl std::fmt::Debug for DescriptorTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DescriptorTable")
            .field("kind", &self.kind)
            .field("stages", &self.stages)
            .field("binding", &self.binding)
            .field("len", &state.slots.len())
            .field("free", &state.free.len())
            .finish_non_exhaustive()
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// One table variant requested from [`BindlessRegistry::new`].
#[derive(Debug, Clone, Copy)]
pub struct TableVariant {
    pub kind: DescriptorKind,
    pub stages: ShaderStages,
    pub binding: u32,
    pub placeholder: DescriptorPayload,
}

struct VariantSet {
    table: Arc<DescriptorTable>,
    layout: Arc<DescriptorSetLayoutInfo>,
    pool: DescriptorPoolHandle,
    set: DescriptorSetHandle,
}

/// All bindless tables, grouped by descriptor kind.
pub struct BindlessRegistry {
    pools: Arc<DescriptorPoolManager>,
    variants: FxHashMap<DescriptorKind, Vec<VariantSet>>,
    /// Serializes operations so variants of a kind see the same sequence.
    lockstep: Mutex<()>,
}

impl BindlessRegistry {
    /// Creates one table, layout and native set per variant. Bindless sets
    /// live in descriptor set `set_index`.
    pub fn new(
        device: Arc<dyn GpuDevice>,
        pools: Arc<DescriptorPoolManager>,
        set_index: u32,
        capacity: u32,
        variants: &[TableVariant],
    ) -> Result<Self> {
        let mut registry = Self {
            pools: Arc::clone(&pools),
            variants: FxHashMap::default(),
            lockstep: Mutex::new(()),
        };

        for v in variants {
            let table = Arc::new(DescriptorTable::new(
                Arc::clone(&device),
                v.kind,
                v.stages,
                v.binding,
                capacity,
                v.placeholder,
            ));
            let layout = Arc::new(DescriptorSetLayoutInfo::new(
                Arc::clone(&device),
                vec![table.layout_binding(set_index)],
                true,
            )?);
            let (pool, set) = pools.allocate_set(layout.handle(), layout.histogram())?;
            table.attach_set(set)?;
            registry.variants.entry(v.kind).or_default().push(VariantSet {
                table,
                layout,
                pool,
                set,
            });
        }
        log::info!("Bindless registry: {} table variants of {capacity} slots", variants.len());
        Ok(registry)
    }

    fn tables_of(&self, kind: DescriptorKind) -> Result<&[VariantSet]> {
        self.variants
            .get(&kind)
            .map(Vec::as_slice)
            .ok_or(GpuError::InvalidHandle {
                kind: "bindless table",
                id: kind.index() as u64,
            })
    }

    /// Adds `payload` to every variant of `kind`; the index is the same in all.
    ///
    /// If a variant fails, or issues a different index, the variants already
    /// updated free the index again and the error is returned.
    pub fn add(&self, kind: DescriptorKind, payload: DescriptorPayload) -> Result<u32> {
        let _lockstep = self.lockstep.lock();
        let variants = self.tables_of(kind)?;
        let mut index = None;
        for (done, v) in variants.iter().enumerate() {
            let result = v.table.add(payload).and_then(|i| match index {
                Some(expected) if expected != i => {
                    Self::undo_add(std::slice::from_ref(v), kind, i);
                    Err(GpuError::BindlessIndexMismatch { expected, found: i })
                }
                _ => Ok(i),
            });
            match result {
                Ok(i) => {
                    index.get_or_insert(i);
                }
                Err(err) => {
                    log::error!("Bindless add to {kind:?} ({:?}) failed: {err}", v.table.stages());
                    if let Some(i) = index {
                        Self::undo_add(&variants[..done], kind, i);
                    }
                    return Err(err);
                }
            }
        }
        index.ok_or(GpuError::InvalidHandle {
            kind: "bindless table",
            id: kind.index() as u64,
        })
    }

    fn undo_add(variants: &[VariantSet], kind: DescriptorKind, index: u32) {
        for v in variants {
            if let Err(err) = v.table.free(index) {
                log::error!("Could not release {kind:?} index {index} in {:?}: {err}", v.table.stages());
            }
        }
    }

    /// Returns whether any variant changed. On error every variant keeps the
    /// payload it had before the call.
    pub fn update(&self, kind: DescriptorKind, index: u32, payload: DescriptorPayload) -> Result<bool> {
        let _lockstep = self.lockstep.lock();
        let variants = self.tables_of(kind)?;
        let mut previous: SmallVec<[Option<DescriptorPayload>; 4]> = SmallVec::new();
        let mut changed = false;
        for v in variants {
            let before = v.table.payload(index);
            match v.table.update(index, payload) {
                Ok(c) => {
                    changed |= c;
                    previous.push(before);
                }
                Err(err) => {
                    for (v, before) in variants.iter().zip(previous) {
                        if let Some(before) = before
                            && let Err(restore) = v.table.update(index, before)
                        {
                            log::error!("Could not restore {kind:?} index {index} in {:?}: {restore}", v.table.stages());
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(changed)
    }

    /// Frees `index` in every variant. On error the variants already freed
    /// take their payload back, so the index stays live everywhere.
    pub fn free(&self, kind: DescriptorKind, index: u32) -> Result<()> {
        let _lockstep = self.lockstep.lock();
        let variants = self.tables_of(kind)?;
        let mut freed: SmallVec<[(usize, DescriptorPayload); 4]> = SmallVec::new();
        for (i, v) in variants.iter().enumerate() {
            let before = v.table.payload(index);
            match v.table.free(index) {
                Ok(true) => {
                    if let Some(before) = before {
                        freed.push((i, before));
                    }
                }
                Ok(false) => {}
                Err(err) => {
                    // LIFO reuse hands the same index straight back
                    for (i, before) in freed {
                        let table = &variants[i].table;
                        match table.add(before) {
                            Ok(back) if back == index => {}
                            Ok(back) => {
                                log::error!("{kind:?} index {index} restored as {back} in {:?}", table.stages());
                            }
                            Err(restore) => {
                                log::error!("Could not restore {kind:?} index {index} in {:?}: {restore}", table.stages());
                            }
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// The variant of `kind` with exactly `stages` visibility.
    #[must_use]
    pub fn table(&self, kind: DescriptorKind, stages: ShaderStages) -> Option<Arc<DescriptorTable>> {
        self.variants
            .get(&kind)?
            .iter()
            .find(|v| v.table.stages() == stages)
            .map(|v| Arc::clone(&v.table))
    }

    /// Native set of the variant of `kind` with exactly `stages` visibility.
    #[must_use]
    pub fn descriptor_set(&self, kind: DescriptorKind, stages: ShaderStages) -> Option<DescriptorSetHandle> {
        self.variants
            .get(&kind)?
            .iter()
            .find(|v| v.table.stages() == stages)
            .map(|v| v.set)
    }

    /// For each reflected binding that addresses a bindless table, the
    /// variant whose visibility matches: an exact stage match if one exists,
    /// otherwise the narrowest variant covering the requested stages.
    #[must_use]
    pub fn select_for_bindings(&self, bindings: &[DescriptorBinding]) -> SmallVec<[Arc<DescriptorTable>; 4]> {
        let mut selected = SmallVec::new();
        for b in bindings {
            let Some(variants) = self.variants.get(&b.kind) else {
                continue;
            };
            let candidates = variants
                .iter()
                .filter(|v| v.table.binding() == b.binding && v.table.stages().contains(b.stages));
            let best = candidates.min_by_key(|v| {
                let exact = v.table.stages() == b.stages;
                (!exact, v.table.stages().bits().count_ones())
            });
            if let Some(v) = best {
                selected.push(Arc::clone(&v.table));
            }
        }
        selected
    }

    /// Layout of the variant of `kind` with exactly `stages` visibility.
    #[must_use]
    pub fn layout(&self, kind: DescriptorKind, stages: ShaderStages) -> Option<Arc<DescriptorSetLayoutInfo>> {
        self.variants
            .get(&kind)?
            .iter()
            .find(|v| v.table.stages() == stages)
            .map(|v| Arc::clone(&v.layout))
    }

    #[must_use]
    pub fn variant_count(&self) -> usize {
        self.variants.values().map(Vec::len).sum()
    }
}

impl Drop for BindlessRegistry {
    fn drop(&mut self) {
        for (_, variants) in self.variants.drain() {
            for v in variants {
                if let Err(err) = self.pools.free_set(v.pool, v.set, v.layout.histogram()) {
                    log::error!("Failed to release bindless set: {err}");
                }
            }
        }
    }
}

impl std::fmt::Debug for BindlessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindlessRegistry")
            .field("variants", &self.variant_count())
            .finish_non_exhaustive()
    }
}
