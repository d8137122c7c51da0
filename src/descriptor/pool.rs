//! Descriptor Pool Manager
//!
//! Native descriptor pools are expensive to create and cheap to allocate
//! from. The manager keeps one record per native pool:
//!
//! ```text
//! PoolRecord { pool, histogram, remaining }
//! ```
//!
//! A request is served by the first record with an identical resource-count
//! histogram and budget left; on a miss a pool sized for exactly
//! `histogram × budget` is created. Distinct histograms are few and stable
//! over a program's life, so the lookup is a linear scan.

use std::sync::Arc;

use parking_lot::Mutex;

use super::ResourceCountHistogram;
use crate::backend::{
    DescriptorPoolDesc, DescriptorPoolFlags, DescriptorPoolHandle, DescriptorSetHandle,
    DescriptorSetLayoutHandle, GpuDevice,
};
use crate::errors::{GpuError, Result};

/// Sets carved from one native pool unless the caller asks otherwise.
pub const DEFAULT_SET_BUDGET: u32 = 64;

#[derive(Debug)]
struct PoolRecord {
    pool: DescriptorPoolHandle,
    histogram: ResourceCountHistogram,
    /// Native `max_sets`; `remaining` never exceeds it.
    budget: u32,
    remaining: u32,
}

pub struct DescriptorPoolManager {
    device: Arc<dyn GpuDevice>,
    default_budget: u32,
    records: Mutex<Vec<PoolRecord>>,
}

impl DescriptorPoolManager {
    #[must_use]
    pub fn new(device: Arc<dyn GpuDevice>, default_budget: u32) -> Self {
        Self {
            device,
            default_budget: default_budget.max(1),
            records: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn default_budget(&self) -> u32 {
        self.default_budget
    }

    /// Takes one set's worth of budget from a pool matching `histogram`,
    /// creating a pool of `budget` sets on a miss.
    pub fn get_pool(&self, histogram: &ResourceCountHistogram, budget: u32) -> Result<DescriptorPoolHandle> {
        let mut records = self.records.lock();

        if let Some(record) = records
            .iter_mut()
            .find(|r| r.histogram == *histogram && r.remaining > 0)
        {
            record.remaining -= 1;
            return Ok(record.pool);
        }

        let budget = budget.max(1);
        let pool = self.device.create_descriptor_pool(&DescriptorPoolDesc {
            counts: histogram.scaled(budget),
            max_sets: budget,
            flags: DescriptorPoolFlags::FREE_DESCRIPTOR_SET | DescriptorPoolFlags::UPDATE_AFTER_BIND,
        })?;
        log::info!(
            "Descriptor pool created: {budget} sets, {} descriptors per set ({} pools total)",
            histogram.total(),
            records.len() + 1
        );
        records.push(PoolRecord {
            pool,
            histogram: *histogram,
            budget,
            remaining: budget - 1,
        });
        Ok(pool)
    }

    /// Returns one set's worth of budget to `pool`. Budget beyond the
    /// pool's native capacity is ignored with a warning.
    pub fn free(&self, pool: DescriptorPoolHandle, histogram: &ResourceCountHistogram) -> Result<()> {
        let mut records = self.records.lock();
        let record = records
            .iter_mut()
            .find(|r| r.pool == pool && r.histogram == *histogram)
            .ok_or(GpuError::UnknownDescriptorPool(pool.raw()))?;
        if record.remaining >= record.budget {
            log::warn!(
                "Descriptor pool {} freed more sets than it holds ({} of {})",
                pool.raw(),
                record.remaining,
                record.budget
            );
            return Ok(());
        }
        record.remaining += 1;
        Ok(())
    }

    /// Allocates a native set for `layout` from a pool matching `histogram`.
    pub fn allocate_set(
        &self,
        layout: DescriptorSetLayoutHandle,
        histogram: &ResourceCountHistogram,
    ) -> Result<(DescriptorPoolHandle, DescriptorSetHandle)> {
        let pool = self.get_pool(histogram, self.default_budget)?;
        match self.device.allocate_descriptor_set(pool, layout) {
            Ok(set) => Ok((pool, set)),
            Err(err) => {
                log::error!("Descriptor set allocation failed: {err}");
                self.free(pool, histogram)?;
                Err(err)
            }
        }
    }

    /// Frees a set obtained from [`allocate_set`](Self::allocate_set).
    pub fn free_set(
        &self,
        pool: DescriptorPoolHandle,
        set: DescriptorSetHandle,
        histogram: &ResourceCountHistogram,
    ) -> Result<()> {
        self.free(pool, histogram)?;
        self.device.free_descriptor_set(pool, set);
        Ok(())
    }

    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.records.lock().len()
    }

    /// Budget left in `pool`, if the manager knows it.
    #[must_use]
    pub fn remaining_budget(&self, pool: DescriptorPoolHandle) -> Option<u32> {
        self.records
            .lock()
            .iter()
            .find(|r| r.pool == pool)
            .map(|r| r.remaining)
    }
}

impl Drop for DescriptorPoolManager {
    fn drop(&mut self) {
        for record in self.records.get_mut().drain(..) {
            self.device.destroy_descriptor_pool(record.pool);
        }
    }
}

impl std::fmt::Debug for DescriptorPoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorPoolManager")
            .field("default_budget", &self.default_budget)
            .field("pools", &self.pool_count())
            .finish_non_exhaustive()
    }
}
