//! Mesh instances grouped into geometry batches.

use ash::vk;
use cadence_core::Mesh;
use cadence_gpu::{
    ActiveFrame, DescriptorSetLayoutBuilder, FrameContext, GpuDevice, ResourceBindingPoolAllocator,
    Result,
};
use glam::Vec3;

use crate::geometry_batch::{BatchLimits, GeometryBatch};
use crate::instance::Instance;
use crate::light::{LightHandle, PointLight, PointLights};
use crate::material::MaterialRegistry;

/// Locates an instance inside a [`Scene`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InstanceHandle {
    pub batch: usize,
    pub instance: usize,
}

/// Every mesh instance and point light of a renderer.
pub struct Scene {
    limits: BatchLimits,
    transform_layout: vk::DescriptorSetLayout,
    transform_sets: ResourceBindingPoolAllocator,
    batches: Vec<GeometryBatch>,
    lights: PointLights,
}

impl Scene {
    pub fn new(
        device: &dyn GpuDevice,
        frames_in_flight: usize,
        limits: BatchLimits,
        max_point_lights: usize,
    ) -> Result<Self> {
        let lights = PointLights::new(device, frames_in_flight, max_point_lights)?;
        let builder =
            DescriptorSetLayoutBuilder::new().storage_buffer(0, vk::ShaderStageFlags::VERTEX);
        let transform_layout = match builder.build(device) {
            Ok(layout) => layout,
            Err(e) => {
                let mut lights = lights;
                lights.destroy(device)?;
                return Err(e);
            }
        };

        Ok(Self {
            limits,
            transform_layout,
            transform_sets: ResourceBindingPoolAllocator::new(transform_layout, builder.pool_sizes()),
            batches: Vec::new(),
            lights,
        })
    }

    /// Layout of the per-slot transform sets, bound at
    /// [`TRANSFORM_SET_INDEX`](crate::TRANSFORM_SET_INDEX).
    pub const fn transform_layout(&self) -> vk::DescriptorSetLayout {
        self.transform_layout
    }

    /// Layout of the per-slot point light sets, bound at
    /// [`LIGHT_SET_INDEX`](crate::LIGHT_SET_INDEX).
    pub const fn light_layout(&self) -> vk::DescriptorSetLayout {
        self.lights.layout()
    }

    pub const fn limits(&self) -> &BatchLimits {
        &self.limits
    }

    pub fn batches(&self) -> &[GeometryBatch] {
        &self.batches
    }

    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    pub fn instance_count(&self) -> usize {
        self.batches.iter().map(GeometryBatch::len).sum()
    }

    /// Place `mesh` in the first batch with room for it, or in a new batch.
    pub fn add_mesh(
        &mut self,
        device: &dyn GpuDevice,
        frames: &mut FrameContext,
        mesh: &Mesh,
    ) -> Result<InstanceHandle> {
        for (batch_index, batch) in self.batches.iter_mut().enumerate() {
            if let Some(instance) = batch.try_add_mesh(device, frames, mesh)? {
                return Ok(InstanceHandle {
                    batch: batch_index,
                    instance,
                });
            }
        }

        let batch = GeometryBatch::new(
            device,
            frames,
            &mut self.transform_sets,
            &self.limits,
            mesh,
        )?;
        self.batches.push(batch);
        tracing::debug!("Scene now has {} geometry batches", self.batches.len());

        Ok(InstanceHandle {
            batch: self.batches.len() - 1,
            instance: 0,
        })
    }

    pub fn instance(&self, handle: InstanceHandle) -> Option<&Instance> {
        self.batches.get(handle.batch)?.instance(handle.instance)
    }

    /// Mutable access for moving, scaling or rotating an instance.
    pub fn instance_mut(&mut self, handle: InstanceHandle) -> Option<&mut Instance> {
        self.batches.get_mut(handle.batch)?.instance_mut(handle.instance)
    }

    pub const fn point_lights(&self) -> &PointLights {
        &self.lights
    }

    pub fn point_lights_mut(&mut self) -> &mut PointLights {
        &mut self.lights
    }

    /// Add a point light with the default radius.
    pub fn add_point_light(
        &mut self,
        name: impl Into<String>,
        position: Vec3,
        color: Vec3,
    ) -> Result<LightHandle> {
        self.lights.add(PointLight::new(name, position, color))
    }

    /// Refresh the frame slot's light buffer, bind the slot's light set and
    /// record draws for every batch into the frame's command buffer.
    pub fn draw(
        &mut self,
        device: &dyn GpuDevice,
        frame: &ActiveFrame,
        layout: vk::PipelineLayout,
        materials: &MaterialRegistry,
    ) -> Result<()> {
        self.lights.update(device, frame)?;
        self.lights.bind(device, frame, layout)?;
        for batch in &mut self.batches {
            batch.draw(device, frame, layout, materials)?;
        }
        Ok(())
    }

    /// Free every batch, the light buffers, the binding pools and layouts.
    ///
    /// The GPU must no longer use them.
    pub fn destroy(&mut self, device: &dyn GpuDevice) -> Result<()> {
        for batch in &mut self.batches {
            batch.destroy(device)?;
        }
        self.batches.clear();
        self.lights.destroy(device)?;
        self.transform_sets.destroy(device);
        device.destroy_descriptor_set_layout(self.transform_layout);
        self.transform_layout = vk::DescriptorSetLayout::null();
        Ok(())
    }
}
