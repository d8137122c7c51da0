//! Descriptor Tests
//!
//! Tests for:
//! - Pool reuse keyed by resource-count histogram, budget exhaustion
//! - Resource sets: lazy per-layout materialization and rewrites
//! - Bindless tables: stable indices, LIFO reuse, placeholder rebinding
//! - Bindless registry: lockstep variants and visibility selection
//! - Failed descriptor writes roll back so sets never run ahead of tables

use std::sync::Arc;

use myth_gpu::backend::{
    BufferHandle, DescriptorPoolFlags, DescriptorPoolHandle, DescriptorSetHandle, GpuDevice,
    HeadlessDevice, ImageHandle, ImageLayout,
};
use myth_gpu::descriptor::{
    BindlessRegistry, DescriptorBinding, DescriptorKind, DescriptorPayload, DescriptorPoolManager,
    DescriptorSetLayoutInfo, DescriptorTable, ResourceCountHistogram, ResourceSet, ShaderStages,
    TableVariant,
};
use myth_gpu::errors::GpuError;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn devices() -> (Arc<HeadlessDevice>, Arc<dyn GpuDevice>) {
    let device = Arc::new(HeadlessDevice::new());
    let dyn_device: Arc<dyn GpuDevice> = device.clone();
    (device, dyn_device)
}

fn image(raw: u64) -> DescriptorPayload {
    DescriptorPayload::SampledImage {
        image: ImageHandle::from_raw(raw),
        layout: ImageLayout::ShaderReadOnly,
    }
}

fn uniform(raw: u64) -> DescriptorPayload {
    DescriptorPayload::UniformBuffer {
        buffer: BufferHandle::from_raw(raw),
        offset: 0,
        range: 256,
    }
}

fn storage(raw: u64) -> DescriptorPayload {
    DescriptorPayload::StorageBuffer {
        buffer: BufferHandle::from_raw(raw),
        offset: 0,
        range: 1024,
    }
}

fn material_bindings() -> Vec<DescriptorBinding> {
    vec![
        DescriptorBinding::new(1, 0, DescriptorKind::UniformBuffer, 1, ShaderStages::ALL_GRAPHICS, "material"),
        DescriptorBinding::new(1, 1, DescriptorKind::SampledImage, 1, ShaderStages::FRAGMENT, "albedo"),
    ]
}

const PLACEHOLDER: u64 = 0xDEAD;

// ============================================================================
// Pool Manager
// ============================================================================

#[test]
fn histogram_counts_every_binding() {
    let histogram = ResourceCountHistogram::from_bindings(&material_bindings());
    assert_eq!(histogram.get(DescriptorKind::UniformBuffer), 1);
    assert_eq!(histogram.get(DescriptorKind::SampledImage), 1);
    assert_eq!(histogram.total(), 2);
    assert_eq!(histogram.scaled(64).get(DescriptorKind::SampledImage), 64);
}

#[test]
fn matching_histograms_share_a_pool_until_budget_runs_out() {
    init();
    let (device, dyn_device) = devices();
    let pools = DescriptorPoolManager::new(dyn_device, 64);
    let histogram = ResourceCountHistogram::new().with(DescriptorKind::UniformBuffer, 2);

    let a = pools.get_pool(&histogram, 2).unwrap();
    let b = pools.get_pool(&histogram, 2).unwrap();
    assert_eq!(a, b);
    assert_eq!(pools.remaining_budget(a), Some(0));

    let c = pools.get_pool(&histogram, 2).unwrap();
    assert_ne!(a, c, "an exhausted pool must not be handed out");
    assert_eq!(pools.pool_count(), 2);
    assert_eq!(device.descriptor_pools_created(), 2);

    pools.free(a, &histogram).unwrap();
    assert_eq!(pools.get_pool(&histogram, 2).unwrap(), a);
}

#[test]
fn different_histograms_get_different_pools() {
    init();
    let (_device, dyn_device) = devices();
    let pools = DescriptorPoolManager::new(dyn_device, 64);
    let uniforms = ResourceCountHistogram::new().with(DescriptorKind::UniformBuffer, 1);
    let images = ResourceCountHistogram::new().with(DescriptorKind::SampledImage, 1);

    let a = pools.get_pool(&uniforms, 8).unwrap();
    let b = pools.get_pool(&images, 8).unwrap();
    assert_ne!(a, b);
}

#[test]
fn pools_are_sized_for_budget_sets() {
    init();
    let (device, dyn_device) = devices();
    let pools = DescriptorPoolManager::new(dyn_device, 64);
    let histogram = ResourceCountHistogram::from_bindings(&material_bindings());

    let pool = pools.get_pool(&histogram, 16).unwrap();
    let desc = device.descriptor_pool_desc(pool).unwrap();
    assert_eq!(desc.max_sets, 16);
    assert_eq!(desc.counts, histogram.scaled(16));
    assert!(desc.flags.contains(DescriptorPoolFlags::FREE_DESCRIPTOR_SET));
    assert!(desc.flags.contains(DescriptorPoolFlags::UPDATE_AFTER_BIND));
}

#[test]
fn freeing_to_an_unknown_pool_is_an_error() {
    init();
    let (_device, dyn_device) = devices();
    let pools = DescriptorPoolManager::new(dyn_device, 64);
    let histogram = ResourceCountHistogram::new().with(DescriptorKind::Sampler, 1);

    let err = pools.free(DescriptorPoolHandle::from_raw(4242), &histogram).unwrap_err();
    assert_eq!(err, GpuError::UnknownDescriptorPool(4242));
}

#[test]
fn allocate_set_rolls_over_to_a_new_pool() {
    init();
    let (device, dyn_device) = devices();
    let pools = DescriptorPoolManager::new(dyn_device.clone(), 2);
    let layout = DescriptorSetLayoutInfo::new(dyn_device, material_bindings(), false).unwrap();

    let sets: Vec<_> = (0..3)
        .map(|_| pools.allocate_set(layout.handle(), layout.histogram()).unwrap())
        .collect();
    assert_eq!(sets[0].0, sets[1].0);
    assert_ne!(sets[1].0, sets[2].0);
    assert_eq!(device.descriptor_pool_count(), 2);

    let (pool, set) = sets[0];
    pools.free_set(pool, set, layout.histogram()).unwrap();
    assert_eq!(pools.remaining_budget(pool), Some(1));
}

#[test]
fn over_free_never_raises_budget_past_the_pool_size() {
    init();
    let (device, dyn_device) = devices();
    let pools = DescriptorPoolManager::new(dyn_device.clone(), 2);
    let layout = DescriptorSetLayoutInfo::new(dyn_device, material_bindings(), false).unwrap();

    let (pool, set) = pools.allocate_set(layout.handle(), layout.histogram()).unwrap();
    pools.free_set(pool, set, layout.histogram()).unwrap();
    pools.free(pool, layout.histogram()).unwrap();
    assert_eq!(pools.remaining_budget(pool), Some(2));

    // Two sets fill the native pool; the third must move on to a new one
    let sets: Vec<_> = (0..3)
        .map(|_| pools.allocate_set(layout.handle(), layout.histogram()).unwrap())
        .collect();
    assert_eq!(sets[0].0, pool);
    assert_eq!(sets[1].0, pool);
    assert_ne!(sets[2].0, pool);
    assert_eq!(device.descriptor_pool_count(), 2);
}

#[test]
fn dropping_manager_destroys_pools() {
    init();
    let (device, dyn_device) = devices();
    let pools = DescriptorPoolManager::new(dyn_device, 4);
    pools
        .get_pool(&ResourceCountHistogram::new().with(DescriptorKind::StorageBuffer, 1), 4)
        .unwrap();
    assert_eq!(device.descriptor_pool_count(), 1);
    drop(pools);
    assert_eq!(device.descriptor_pool_count(), 0);
}

// ============================================================================
// Resource Sets
// ============================================================================

#[test]
fn resource_set_materializes_once_per_layout() {
    init();
    let (device, dyn_device) = devices();
    let pools = Arc::new(DescriptorPoolManager::new(dyn_device.clone(), 64));
    let full = Arc::new(DescriptorSetLayoutInfo::new(dyn_device.clone(), material_bindings(), false).unwrap());
    let uniforms_only = Arc::new(
        DescriptorSetLayoutInfo::new(dyn_device.clone(), material_bindings()[..1].to_vec(), false).unwrap(),
    );

    let set = ResourceSet::new(dyn_device, Arc::clone(&pools));
    set.set_resource(0, uniform(1)).unwrap();
    set.set_resource(1, image(2)).unwrap();
    assert_eq!(set.materialized_count(), 0, "nothing is created before first use");

    let a = set.descriptor_set(&full).unwrap();
    assert_eq!(set.descriptor_set(&full).unwrap(), a);
    assert_eq!(set.materialized_count(), 1);
    assert_eq!(device.descriptor(a, 0, 0), Some(uniform(1)));
    assert_eq!(device.descriptor(a, 1, 0), Some(image(2)));

    let b = set.descriptor_set(&uniforms_only).unwrap();
    assert_ne!(a, b);
    assert_eq!(set.materialized_count(), 2);
    assert_eq!(device.descriptor(b, 0, 0), Some(uniform(1)));
    assert_eq!(device.descriptor(b, 1, 0), None, "layout has no binding 1");
}

#[test]
fn set_resource_rewrites_materialized_sets() {
    init();
    let (device, dyn_device) = devices();
    let pools = Arc::new(DescriptorPoolManager::new(dyn_device.clone(), 64));
    let layout = Arc::new(DescriptorSetLayoutInfo::new(dyn_device.clone(), material_bindings(), false).unwrap());

    let set = ResourceSet::new(dyn_device, pools);
    set.set_resource(0, uniform(1)).unwrap();
    let native = set.descriptor_set(&layout).unwrap();

    set.set_resource(0, uniform(7)).unwrap();
    assert_eq!(device.descriptor(native, 0, 0), Some(uniform(7)));
    assert_eq!(set.resource(0), Some(uniform(7)));

    // A payload of the wrong kind is kept but never written
    set.set_resource(1, uniform(9)).unwrap();
    assert_eq!(device.descriptor(native, 1, 0), None);
}

#[test]
fn dropping_resource_set_returns_budget() {
    init();
    let (_device, dyn_device) = devices();
    let pools = Arc::new(DescriptorPoolManager::new(dyn_device.clone(), 8));
    let layout = Arc::new(DescriptorSetLayoutInfo::new(dyn_device.clone(), material_bindings(), false).unwrap());

    let set = ResourceSet::new(dyn_device, Arc::clone(&pools));
    set.descriptor_set(&layout).unwrap();
    let pool = pools.get_pool(layout.histogram(), 8).unwrap();
    assert_eq!(pools.remaining_budget(pool), Some(6));
    drop(set);
    assert_eq!(pools.remaining_budget(pool), Some(7));
}

// ============================================================================
// Bindless Tables
// ============================================================================

struct TableFixture {
    device: Arc<HeadlessDevice>,
    table: DescriptorTable,
    set: DescriptorSetHandle,
    _pools: DescriptorPoolManager,
    _layout: DescriptorSetLayoutInfo,
}

fn table_with_set(capacity: u32) -> TableFixture {
    let (device, dyn_device) = devices();
    let table = DescriptorTable::new(
        dyn_device.clone(),
        DescriptorKind::SampledImage,
        ShaderStages::FRAGMENT,
        0,
        capacity,
        image(PLACEHOLDER),
    );
    let pools = DescriptorPoolManager::new(dyn_device.clone(), 4);
    let layout = DescriptorSetLayoutInfo::new(dyn_device, vec![table.layout_binding(3)], true).unwrap();
    let (_, set) = pools.allocate_set(layout.handle(), layout.histogram()).unwrap();
    table.attach_set(set).unwrap();
    TableFixture {
        device,
        table,
        set,
        _pools: pools,
        _layout: layout,
    }
}

#[test]
fn add_free_add_reuses_the_index() {
    init();
    let TableFixture { device, table, set, _pools, _layout, .. } = table_with_set(16);

    let a = table.add(image(1)).unwrap();
    let b = table.add(image(2)).unwrap();
    assert_eq!((a, b), (0, 1));
    assert_eq!(device.descriptor(set, 0, b), Some(image(2)));

    assert!(table.free(b).unwrap());
    assert_eq!(table.payload(b), Some(image(PLACEHOLDER)));
    assert_eq!(device.descriptor(set, 0, b), Some(image(PLACEHOLDER)));

    let c = table.add(image(3)).unwrap();
    assert_eq!(c, b);
    assert_eq!(device.descriptor(set, 0, c), Some(image(3)));
    assert_eq!(table.len(), 2);
    assert_eq!(table.live_count(), 2);
}

#[test]
fn freed_indices_are_reused_most_recent_first() {
    init();
    let TableFixture { table, _pools, _layout, .. } = table_with_set(16);
    for i in 0..4 {
        table.add(image(i + 10)).unwrap();
    }
    table.free(1).unwrap();
    table.free(3).unwrap();
    assert_eq!(table.add(image(50)).unwrap(), 3);
    assert_eq!(table.add(image(51)).unwrap(), 1);
    assert_eq!(table.add(image(52)).unwrap(), 4);
}

#[test]
fn double_free_is_reported_not_applied() {
    init();
    let TableFixture { table, _pools, _layout, .. } = table_with_set(4);
    let index = table.add(image(1)).unwrap();
    assert!(table.free(index).unwrap());
    assert!(!table.free(index).unwrap());
    assert_eq!(table.add(image(2)).unwrap(), index);
    assert_eq!(table.add(image(3)).unwrap(), 1, "the index was only queued once");
}

#[test]
fn update_skips_unchanged_payloads() {
    init();
    let TableFixture { device, table, set, _pools, _layout, .. } = table_with_set(4);
    let index = table.add(image(1)).unwrap();
    assert!(!table.update(index, image(1)).unwrap());
    assert!(table.update(index, image(2)).unwrap());
    assert_eq!(device.descriptor(set, 0, index), Some(image(2)));

    let err = table.update(3, image(4)).unwrap_err();
    assert_eq!(err, GpuError::DescriptorIndexOutOfRange { index: 3, len: 1 });
}

#[test]
fn full_table_is_an_error() {
    init();
    let TableFixture { table, _pools, _layout, .. } = table_with_set(2);
    table.add(image(1)).unwrap();
    table.add(image(2)).unwrap();
    assert_eq!(table.add(image(3)).unwrap_err(), GpuError::DescriptorTableFull { capacity: 2 });
}

#[test]
fn attach_set_copies_existing_slots() {
    init();
    let TableFixture { device, table, _pools, _layout, .. } = table_with_set(8);
    table.add(image(1)).unwrap();
    table.add(image(2)).unwrap();
    table.free(0).unwrap();

    let dyn_device: Arc<dyn GpuDevice> = device.clone();
    let pools = DescriptorPoolManager::new(dyn_device.clone(), 4);
    let layout = DescriptorSetLayoutInfo::new(dyn_device, vec![table.layout_binding(3)], true).unwrap();
    let (_, second) = pools.allocate_set(layout.handle(), layout.histogram()).unwrap();
    table.attach_set(second).unwrap();

    assert_eq!(device.descriptor(second, 0, 0), Some(image(PLACEHOLDER)));
    assert_eq!(device.descriptor(second, 0, 1), Some(image(2)));
    assert_eq!(table.sets().len(), 2);
}

#[test]
fn failed_write_leaves_no_set_ahead_of_the_table() {
    init();
    let TableFixture { device, table, set, _pools, _layout, .. } = table_with_set(8);
    let dyn_device: Arc<dyn GpuDevice> = device.clone();
    let pools = DescriptorPoolManager::new(dyn_device.clone(), 4);
    let layout = DescriptorSetLayoutInfo::new(dyn_device, vec![table.layout_binding(3)], true).unwrap();
    let (_, second) = pools.allocate_set(layout.handle(), layout.histogram()).unwrap();
    table.attach_set(second).unwrap();
    let kept = table.add(image(1)).unwrap();

    device.set_descriptor_writes_failing(second, true);

    // The first set was written before the second failed; it is rolled back
    let err = table.add(image(77)).unwrap_err();
    assert!(matches!(err, GpuError::DeviceCall { call: "write_descriptors", .. }));
    assert_eq!(table.payload(1), Some(image(PLACEHOLDER)));
    assert_eq!(device.descriptor(set, 0, 1), Some(image(PLACEHOLDER)));
    assert_eq!(table.live_count(), 1);

    assert!(table.update(kept, image(2)).is_err());
    assert_eq!(table.payload(kept), Some(image(1)));
    assert_eq!(device.descriptor(set, 0, kept), Some(image(1)));

    // A failed free keeps the slot live everywhere
    assert!(table.free(kept).is_err());
    assert_eq!(table.payload(kept), Some(image(1)));
    assert_eq!(device.descriptor(set, 0, kept), Some(image(1)));
    assert_eq!(table.live_count(), 1);

    device.set_descriptor_writes_failing(second, false);
    assert_eq!(table.add(image(3)).unwrap(), 1, "the index was returned to the free list");
    assert_eq!(device.descriptor(second, 0, 1), Some(image(3)));
}

// ============================================================================
// Bindless Registry
// ============================================================================

fn registry(device: Arc<dyn GpuDevice>) -> BindlessRegistry {
    let pools = Arc::new(DescriptorPoolManager::new(device.clone(), 8));
    let variant = |kind, stages, binding, placeholder| TableVariant {
        kind,
        stages,
        binding,
        placeholder,
    };
    BindlessRegistry::new(
        device,
        pools,
        3,
        64,
        &[
            variant(DescriptorKind::SampledImage, ShaderStages::FRAGMENT, 0, image(PLACEHOLDER)),
            variant(DescriptorKind::SampledImage, ShaderStages::ALL_GRAPHICS, 0, image(PLACEHOLDER)),
            variant(DescriptorKind::SampledImage, ShaderStages::COMPUTE, 0, image(PLACEHOLDER)),
            variant(DescriptorKind::StorageBuffer, ShaderStages::ALL, 1, storage(PLACEHOLDER)),
        ],
    )
    .unwrap()
}

#[test]
fn registry_keeps_variants_in_lockstep() {
    init();
    let (device, dyn_device) = devices();
    let registry = registry(dyn_device);
    assert_eq!(registry.variant_count(), 4);

    let a = registry.add(DescriptorKind::SampledImage, image(1)).unwrap();
    let b = registry.add(DescriptorKind::SampledImage, image(2)).unwrap();
    assert_eq!((a, b), (0, 1));

    for stages in [ShaderStages::FRAGMENT, ShaderStages::ALL_GRAPHICS, ShaderStages::COMPUTE] {
        let set = registry.descriptor_set(DescriptorKind::SampledImage, stages).unwrap();
        assert_eq!(device.descriptor(set, 0, b), Some(image(2)), "{stages:?} variant out of step");
    }

    registry.free(DescriptorKind::SampledImage, a).unwrap();
    for stages in [ShaderStages::FRAGMENT, ShaderStages::ALL_GRAPHICS, ShaderStages::COMPUTE] {
        let table = registry.table(DescriptorKind::SampledImage, stages).unwrap();
        assert_eq!(table.payload(a), Some(image(PLACEHOLDER)));
    }
    assert_eq!(registry.add(DescriptorKind::SampledImage, image(3)).unwrap(), a);

    assert!(registry.update(DescriptorKind::SampledImage, a, image(4)).unwrap());
    assert!(!registry.update(DescriptorKind::SampledImage, a, image(4)).unwrap());
}

#[test]
fn registry_kinds_have_independent_indices() {
    init();
    let (_device, dyn_device) = devices();
    let registry = registry(dyn_device);
    registry.add(DescriptorKind::SampledImage, image(1)).unwrap();
    registry.add(DescriptorKind::SampledImage, image(2)).unwrap();
    assert_eq!(registry.add(DescriptorKind::StorageBuffer, storage(1)).unwrap(), 0);
}

#[test]
fn registry_rejects_unknown_kind() {
    init();
    let (_device, dyn_device) = devices();
    let registry = registry(dyn_device);
    let err = registry
        .add(DescriptorKind::StorageImage, DescriptorPayload::StorageImage { image: ImageHandle::from_raw(1) })
        .unwrap_err();
    assert!(matches!(err, GpuError::InvalidHandle { kind: "bindless table", .. }));
}

#[test]
fn select_prefers_exact_then_narrowest_visibility() {
    init();
    let (_device, dyn_device) = devices();
    let registry = registry(dyn_device);
    let binding = |kind, binding, stages| DescriptorBinding::new(3, binding, kind, 64, stages, "textures");

    let exact = registry.select_for_bindings(&[binding(DescriptorKind::SampledImage, 0, ShaderStages::FRAGMENT)]);
    assert_eq!(exact.len(), 1);
    assert_eq!(exact[0].stages(), ShaderStages::FRAGMENT);

    let vertex = registry.select_for_bindings(&[binding(DescriptorKind::SampledImage, 0, ShaderStages::VERTEX)]);
    assert_eq!(vertex.len(), 1);
    assert_eq!(vertex[0].stages(), ShaderStages::ALL_GRAPHICS);

    let compute = registry.select_for_bindings(&[binding(DescriptorKind::StorageBuffer, 1, ShaderStages::COMPUTE)]);
    assert_eq!(compute[0].stages(), ShaderStages::ALL);

    let uncovered = registry.select_for_bindings(&[
        binding(DescriptorKind::SampledImage, 0, ShaderStages::VERTEX | ShaderStages::COMPUTE),
        binding(DescriptorKind::SampledImage, 5, ShaderStages::FRAGMENT),
    ]);
    assert!(uncovered.is_empty());
}

const IMAGE_VARIANTS: [ShaderStages; 3] = [ShaderStages::FRAGMENT, ShaderStages::ALL_GRAPHICS, ShaderStages::COMPUTE];

#[test]
fn failed_registry_add_releases_the_index_in_every_variant() {
    init();
    let (device, dyn_device) = devices();
    let registry = registry(dyn_device);
    assert_eq!(registry.add(DescriptorKind::SampledImage, image(1)).unwrap(), 0);

    let broken = registry
        .descriptor_set(DescriptorKind::SampledImage, ShaderStages::ALL_GRAPHICS)
        .unwrap();
    device.set_descriptor_writes_failing(broken, true);
    assert!(registry.add(DescriptorKind::SampledImage, image(2)).is_err());

    for stages in IMAGE_VARIANTS {
        let table = registry.table(DescriptorKind::SampledImage, stages).unwrap();
        let set = registry.descriptor_set(DescriptorKind::SampledImage, stages).unwrap();
        assert_eq!(table.live_count(), 1, "{stages:?} kept an orphaned index");
        assert_ne!(table.payload(1), Some(image(2)));
        assert_ne!(device.descriptor(set, 0, 1), Some(image(2)));
    }

    // Once the set works again every variant issues the same index
    device.set_descriptor_writes_failing(broken, false);
    assert_eq!(registry.add(DescriptorKind::SampledImage, image(3)).unwrap(), 1);
    for stages in IMAGE_VARIANTS {
        let set = registry.descriptor_set(DescriptorKind::SampledImage, stages).unwrap();
        assert_eq!(device.descriptor(set, 0, 1), Some(image(3)), "{stages:?} variant out of step");
    }
}

#[test]
fn failed_registry_free_keeps_the_index_live_everywhere() {
    init();
    let (device, dyn_device) = devices();
    let registry = registry(dyn_device);
    let index = registry.add(DescriptorKind::SampledImage, image(1)).unwrap();

    let broken = registry
        .descriptor_set(DescriptorKind::SampledImage, ShaderStages::ALL_GRAPHICS)
        .unwrap();
    device.set_descriptor_writes_failing(broken, true);
    assert!(registry.free(DescriptorKind::SampledImage, index).is_err());

    for stages in IMAGE_VARIANTS {
        let table = registry.table(DescriptorKind::SampledImage, stages).unwrap();
        let set = registry.descriptor_set(DescriptorKind::SampledImage, stages).unwrap();
        assert_eq!(table.payload(index), Some(image(1)), "{stages:?}");
        assert_eq!(table.live_count(), 1, "{stages:?}");
        assert_eq!(device.descriptor(set, 0, index), Some(image(1)), "{stages:?}");
    }

    device.set_descriptor_writes_failing(broken, false);
    registry.free(DescriptorKind::SampledImage, index).unwrap();
    assert_eq!(registry.add(DescriptorKind::SampledImage, image(2)).unwrap(), index);
    assert_eq!(registry.add(DescriptorKind::SampledImage, image(3)).unwrap(), 1);
}
