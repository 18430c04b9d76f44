//! Descriptor set management.

use crate::device::GpuDevice;
use crate::error::{GpuError, Result};
use ash::vk;
use std::collections::VecDeque;

/// Descriptor sets per binding pool.
pub const BINDING_POOL_CAPACITY: u32 = 10;

/// Descriptor set layout builder.
pub struct DescriptorSetLayoutBuilder<'a> {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'a>>,
    flags: Vec<vk::DescriptorBindingFlags>,
}

impl<'a> DescriptorSetLayoutBuilder<'a> {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
            flags: Vec::new(),
        }
    }

    /// Add a binding.
    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(count)
                .stage_flags(stage_flags),
        );
        self.flags.push(vk::DescriptorBindingFlags::empty());
        self
    }

    /// Add a uniform buffer binding.
    pub fn uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stage_flags)
    }

    /// Add a storage buffer binding.
    pub fn storage_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_BUFFER, 1, stage_flags)
    }

    /// Add a sampled image binding.
    pub fn sampled_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            1,
            stage_flags,
        )
    }

    /// Allow the last added binding to stay unwritten.
    pub fn partially_bound(mut self) -> Self {
        if let Some(flags) = self.flags.last_mut() {
            *flags |= vk::DescriptorBindingFlags::PARTIALLY_BOUND;
        }
        self
    }

    /// Descriptor counts of one set, merged by type.
    pub fn pool_sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for binding in &self.bindings {
            match sizes.iter_mut().find(|s| s.ty == binding.descriptor_type) {
                Some(size) => size.descriptor_count += binding.descriptor_count,
                None => sizes.push(
                    vk::DescriptorPoolSize::default()
                        .ty(binding.descriptor_type)
                        .descriptor_count(binding.descriptor_count),
                ),
            }
        }
        sizes
    }

    /// Build the descriptor set layout.
    pub fn build(&self, device: &dyn GpuDevice) -> Result<vk::DescriptorSetLayout> {
        let flags: &[vk::DescriptorBindingFlags] = if self.flags.iter().all(|f| f.is_empty()) {
            &[]
        } else {
            &self.flags
        };
        device.create_descriptor_set_layout(&self.bindings, flags)
    }
}

impl Default for DescriptorSetLayoutBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// A set handed out by [`ResourceBindingPoolAllocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindingSetAllocation {
    pub set: vk::DescriptorSet,
    /// Number of sets allocated before this one, across all pools.
    pub index: u32,
    /// Pool the set came from, in creation order.
    pub pool: usize,
}

/// Grow-only allocator of same-layout descriptor sets.
///
/// Pools hold a fixed number of sets. When the newest pool is exhausted a new
/// one is created and all of its sets are allocated at once. Sets are never
/// freed individually; pools live until [`destroy`](Self::destroy).
pub struct ResourceBindingPoolAllocator {
    layout: vk::DescriptorSetLayout,
    set_sizes: Vec<vk::DescriptorPoolSize>,
    pool_capacity: u32,
    pools: Vec<vk::DescriptorPool>,
    available: VecDeque<vk::DescriptorSet>,
    allocated: u32,
}

impl ResourceBindingPoolAllocator {
    /// Allocator for `layout`, whose sets each need `set_sizes` descriptors.
    pub fn new(layout: vk::DescriptorSetLayout, set_sizes: Vec<vk::DescriptorPoolSize>) -> Self {
        Self::with_pool_capacity(layout, set_sizes, BINDING_POOL_CAPACITY)
    }

    pub fn with_pool_capacity(
        layout: vk::DescriptorSetLayout,
        set_sizes: Vec<vk::DescriptorPoolSize>,
        pool_capacity: u32,
    ) -> Self {
        Self {
            layout,
            set_sizes,
            pool_capacity: pool_capacity.max(1),
            pools: Vec::new(),
            available: VecDeque::new(),
            allocated: 0,
        }
    }

    pub const fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Sets handed out so far.
    pub const fn allocated(&self) -> u32 {
        self.allocated
    }

    /// Sets left in the newest pool.
    pub fn remaining(&self) -> usize {
        self.available.len()
    }

    /// Hand out the next set, creating a pool when the newest one is empty.
    pub fn allocate(&mut self, device: &dyn GpuDevice) -> Result<BindingSetAllocation> {
        if self.available.is_empty() {
            self.grow(device)?;
        }

        let set = self
            .available
            .pop_front()
            .ok_or_else(|| GpuError::ResourceExhausted("Binding pool yielded no sets".to_string()))?;
        let allocation = BindingSetAllocation {
            set,
            index: self.allocated,
            pool: self.pools.len() - 1,
        };
        self.allocated += 1;
        Ok(allocation)
    }

    fn grow(&mut self, device: &dyn GpuDevice) -> Result<()> {
        let pool_sizes: Vec<vk::DescriptorPoolSize> = self
            .set_sizes
            .iter()
            .map(|size| {
                vk::DescriptorPoolSize::default()
                    .ty(size.ty)
                    .descriptor_count(size.descriptor_count * self.pool_capacity)
            })
            .collect();

        let pool = device.create_descriptor_pool(self.pool_capacity, &pool_sizes)?;
        let layouts = vec![self.layout; self.pool_capacity as usize];
        let sets = match device.allocate_descriptor_sets(pool, &layouts) {
            Ok(sets) => sets,
            Err(e) => {
                device.destroy_descriptor_pool(pool);
                return Err(e);
            }
        };

        self.pools.push(pool);
        self.available.extend(sets);
        tracing::debug!(
            "Created binding pool {} ({} sets)",
            self.pools.len(),
            self.pool_capacity
        );
        Ok(())
    }

    /// Destroy every pool, invalidating all sets handed out.
    pub fn destroy(&mut self, device: &dyn GpuDevice) {
        for pool in self.pools.drain(..) {
            device.destroy_descriptor_pool(pool);
        }
        self.available.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{DeviceCall, RecordingDevice};

    fn uniform_layout(device: &RecordingDevice) -> (vk::DescriptorSetLayout, Vec<vk::DescriptorPoolSize>) {
        let builder =
            DescriptorSetLayoutBuilder::new().uniform_buffer(0, vk::ShaderStageFlags::VERTEX);
        (builder.build(device).unwrap(), builder.pool_sizes())
    }

    #[test]
    fn nth_allocation_served_by_pool_ceil_n_over_c() {
        let device = RecordingDevice::new();
        let (layout, sizes) = uniform_layout(&device);
        let capacity = 4;
        let mut allocator = ResourceBindingPoolAllocator::with_pool_capacity(layout, sizes, capacity);

        for n in 1..=13_u32 {
            let allocation = allocator.allocate(&device).unwrap();
            assert_eq!(allocation.index, n - 1);
            assert_eq!(allocation.pool + 1, n.div_ceil(capacity) as usize);
        }
        assert_eq!(allocator.pool_count(), 4);
    }

    #[test]
    fn capacity_plus_one_makes_two_pools() {
        let device = RecordingDevice::new();
        let (layout, sizes) = uniform_layout(&device);
        let mut allocator = ResourceBindingPoolAllocator::new(layout, sizes);

        let mut sets = Vec::new();
        for _ in 0..=BINDING_POOL_CAPACITY {
            sets.push(allocator.allocate(&device).unwrap().set);
        }

        assert_eq!(allocator.pool_count(), 2);
        assert_eq!(allocator.allocated(), BINDING_POOL_CAPACITY + 1);
        assert_eq!(allocator.remaining(), BINDING_POOL_CAPACITY as usize - 1);
        sets.sort_by_key(|s| ash::vk::Handle::as_raw(*s));
        sets.dedup();
        assert_eq!(sets.len(), BINDING_POOL_CAPACITY as usize + 1);
    }

    #[test]
    fn pools_are_bulk_allocated() {
        let device = RecordingDevice::new();
        let (layout, sizes) = uniform_layout(&device);
        let mut allocator = ResourceBindingPoolAllocator::with_pool_capacity(layout, sizes, 3);
        device.clear_calls();

        allocator.allocate(&device).unwrap();
        allocator.allocate(&device).unwrap();

        let allocations: Vec<usize> = device
            .calls()
            .iter()
            .filter_map(|c| match c {
                DeviceCall::AllocateDescriptorSets { sets, .. } => Some(sets.len()),
                _ => None,
            })
            .collect();
        assert_eq!(allocations, vec![3]);
    }

    #[test]
    fn destroy_releases_pools() {
        let device = RecordingDevice::new();
        let (layout, sizes) = uniform_layout(&device);
        let mut allocator = ResourceBindingPoolAllocator::with_pool_capacity(layout, sizes, 2);
        for _ in 0..5 {
            allocator.allocate(&device).unwrap();
        }
        assert_eq!(device.live_descriptor_pools(), 3);

        allocator.destroy(&device);
        assert_eq!(device.live_descriptor_pools(), 0);
    }

    #[test]
    fn pool_sizes_merge_by_type() {
        let builder = DescriptorSetLayoutBuilder::new()
            .sampled_image(0, vk::ShaderStageFlags::FRAGMENT)
            .partially_bound()
            .sampled_image(1, vk::ShaderStageFlags::FRAGMENT)
            .uniform_buffer(2, vk::ShaderStageFlags::FRAGMENT);

        let sizes = builder.pool_sizes();
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].ty, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(sizes[0].descriptor_count, 2);
        assert_eq!(sizes[1].descriptor_count, 1);
    }
}
