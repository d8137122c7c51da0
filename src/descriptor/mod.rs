//! Descriptor Management
//!
//! Three layers sit on top of native descriptor sets:
//!
//! - [`DescriptorPoolManager`]: pools native allocation blocks keyed by the
//!   resource-count histogram of the sets carved from them.
//! - [`ResourceSet`]: a small fixed group of slots shared by many draws,
//!   materialized lazily once per distinct layout.
//! - [`DescriptorTable`] / [`BindlessRegistry`]: large growable bindless
//!   arrays with stable indices and placeholder rebinding on free.
//!
//! The types in this file are the shared vocabulary: what kinds of
//! descriptors exist, which shader stages see them, and what the shader
//! reflection collaborator hands us for each binding.

pub mod pool;
pub mod resource_set;
pub mod table;

use std::hash::{Hash, Hasher};

use bitflags::bitflags;
use xxhash_rust::xxh3::Xxh3;

use crate::backend::{BufferHandle, ImageHandle, ImageLayout, SamplerHandle};

pub use pool::DescriptorPoolManager;
pub use resource_set::{DescriptorSetLayoutInfo, ResourceSet};
pub use table::{BindlessRegistry, DescriptorTable, TableVariant};

// ─── Kinds & Visibility ──────────────────────────────────────────────────────

/// Every descriptor type the core allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescriptorKind {
    Sampler,
    CombinedImageSampler,
    SampledImage,
    StorageImage,
    UniformBuffer,
    StorageBuffer,
    UniformBufferDynamic,
    StorageBufferDynamic,
    InputAttachment,
}

impl DescriptorKind {
    /// Number of kinds; the length of a [`ResourceCountHistogram`].
    pub const COUNT: usize = 9;

    pub const ALL: [Self; Self::COUNT] = [
        Self::Sampler,
        Self::CombinedImageSampler,
        Self::SampledImage,
        Self::StorageImage,
        Self::UniformBuffer,
        Self::StorageBuffer,
        Self::UniformBufferDynamic,
        Self::StorageBufferDynamic,
        Self::InputAttachment,
    ];

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub const fn is_dynamic(self) -> bool {
        matches!(self, Self::UniformBufferDynamic | Self::StorageBufferDynamic)
    }
}

bitflags! {
    /// Shader stages a descriptor is visible to. Fixed when a layout is
    /// created, which is why bindless tables come in one variant per mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct ShaderStages: u32 {
        const VERTEX   = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE  = 1 << 2;
        const ALL_GRAPHICS = Self::VERTEX.bits() | Self::FRAGMENT.bits();
        const ALL = Self::ALL_GRAPHICS.bits() | Self::COMPUTE.bits();
    }
}

// ─── Reflection input ────────────────────────────────────────────────────────

/// One resolved binding, as produced by shader reflection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorBinding {
    pub set: u32,
    pub binding: u32,
    pub kind: DescriptorKind,
    /// Array length (1 for scalars, the table capacity for bindless arrays).
    pub count: u32,
    pub stages: ShaderStages,
    pub name: String,
}

impl DescriptorBinding {
    pub fn new(
        set: u32,
        binding: u32,
        kind: DescriptorKind,
        count: u32,
        stages: ShaderStages,
        name: impl Into<String>,
    ) -> Self {
        Self {
            set,
            binding,
            kind,
            count,
            stages,
            name: name.into(),
        }
    }
}

/// Stable hash of a binding list, used to memoize per-layout state.
#[must_use]
pub fn layout_hash(bindings: &[DescriptorBinding]) -> u64 {
    let mut hasher = Xxh3::new();
    for b in bindings {
        b.set.hash(&mut hasher);
        b.binding.hash(&mut hasher);
        b.kind.hash(&mut hasher);
        b.count.hash(&mut hasher);
        b.stages.bits().hash(&mut hasher);
    }
    hasher.finish()
}

// ─── Resource-count histogram ────────────────────────────────────────────────

/// One counter per [`DescriptorKind`]; the equality key for pool reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ResourceCountHistogram([u32; DescriptorKind::COUNT]);

impl ResourceCountHistogram {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts every descriptor a set with these bindings needs.
    #[must_use]
    pub fn from_bindings(bindings: &[DescriptorBinding]) -> Self {
        let mut histogram = Self::new();
        for b in bindings {
            histogram.add(b.kind, b.count);
        }
        histogram
    }

    pub fn add(&mut self, kind: DescriptorKind, count: u32) -> &mut Self {
        self.0[kind.index()] += count;
        self
    }

    #[must_use]
    pub fn with(mut self, kind: DescriptorKind, count: u32) -> Self {
        self.add(kind, count);
        self
    }

    #[must_use]
    pub fn get(&self, kind: DescriptorKind) -> u32 {
        self.0[kind.index()]
    }

    /// Counts for `sets` sets of this shape.
    #[must_use]
    pub fn scaled(&self, sets: u32) -> Self {
        let mut out = *self;
        for c in &mut out.0 {
            *c = c.saturating_mul(sets);
        }
        out
    }

    #[must_use]
    pub fn total(&self) -> u32 {
        self.0.iter().sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Non-zero `(kind, count)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (DescriptorKind, u32)> + '_ {
        DescriptorKind::ALL
            .iter()
            .map(|&k| (k, self.0[k.index()]))
            .filter(|&(_, c)| c > 0)
    }
}

// ─── Payloads ────────────────────────────────────────────────────────────────

/// What a descriptor slot points at.
///
/// Compared by value: two payloads are equal exactly when a native write of
/// either would produce the same descriptor bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorPayload {
    Sampler(SamplerHandle),
    SampledImage {
        image: ImageHandle,
        layout: ImageLayout,
    },
    StorageImage {
        image: ImageHandle,
    },
    CombinedImageSampler {
        image: ImageHandle,
        sampler: SamplerHandle,
    },
    UniformBuffer {
        buffer: BufferHandle,
        offset: u64,
        range: u64,
    },
    StorageBuffer {
        buffer: BufferHandle,
        offset: u64,
        range: u64,
    },
}

impl DescriptorPayload {
    /// Whether this payload may be written into a slot of `kind`.
    #[must_use]
    pub fn fits(&self, kind: DescriptorKind) -> bool {
        matches!(
            (self, kind),
            (Self::Sampler(_), DescriptorKind::Sampler)
                | (Self::SampledImage { .. }, DescriptorKind::SampledImage | DescriptorKind::InputAttachment)
                | (Self::StorageImage { .. }, DescriptorKind::StorageImage)
                | (Self::CombinedImageSampler { .. }, DescriptorKind::CombinedImageSampler)
                | (
                    Self::UniformBuffer { .. },
                    DescriptorKind::UniformBuffer | DescriptorKind::UniformBufferDynamic
                )
                | (
                    Self::StorageBuffer { .. },
                    DescriptorKind::StorageBuffer | DescriptorKind::StorageBufferDynamic
                )
        )
    }
}
