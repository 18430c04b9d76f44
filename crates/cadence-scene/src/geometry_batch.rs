//! Shared vertex/index storage for many meshes.
//!
//! A [`GeometryBatch`] packs meshes into one vertex buffer and one index
//! buffer, with one transform buffer per frame slot. Space is handed out by a
//! [`BatchBudget`]: strictly increasing offsets, never reclaimed. Once a mesh
//! does not fit, the caller moves on to another batch.

use ash::vk;
use cadence_core::{MaterialId, Mesh, MeshFootprint, Vertex};
use cadence_gpu::{
    ActiveFrame, FrameContext, GpuBuffer, GpuDevice, GpuError, IndexedDraw,
    ResourceBindingPoolAllocator, Result,
};
use glam::Mat4;
use gpu_allocator::MemoryLocation;

use crate::instance::Instance;
use crate::material::MaterialRegistry;

/// Descriptor set index of the per-slot transform storage.
pub const TRANSFORM_SET_INDEX: u32 = 1;
/// Descriptor set index of the material bindings.
pub const MATERIAL_SET_INDEX: u32 = 2;

/// Bytes of one instance transform.
pub const TRANSFORM_SIZE: u64 = std::mem::size_of::<Mat4>() as u64;

const INDEX_SIZE: u64 = std::mem::size_of::<u32>() as u64;

/// Default sizes of a new batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchLimits {
    /// Vertex buffer bytes, unless the first mesh needs more
    pub vertex_bytes: u64,
    /// Index buffer bytes, unless the first mesh needs more
    pub index_bytes: u64,
    /// Instances per batch
    pub max_instances: u32,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            vertex_bytes: 10_000 * Vertex::SIZE,
            index_bytes: 50_000 * INDEX_SIZE,
            max_instances: 256,
        }
    }
}

impl BatchLimits {
    pub const fn new(vertex_bytes: u64, index_bytes: u64, max_instances: u32) -> Self {
        Self {
            vertex_bytes,
            index_bytes,
            max_instances,
        }
    }
}

/// Which budget turned a mesh away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rejection {
    VertexBytes,
    IndexBytes,
    InstanceSlots,
}

/// Space reserved for one mesh.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchReservation {
    pub vertex_offset: u64,
    pub index_offset: u64,
    pub instance_slot: u32,
}

/// Capacity accounting of a batch.
///
/// Remaining budgets only shrink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchBudget {
    vertex_capacity: u64,
    index_capacity: u64,
    instance_capacity: u32,
    vertex_used: u64,
    index_used: u64,
    instances_used: u32,
}

impl BatchBudget {
    pub const fn new(vertex_capacity: u64, index_capacity: u64, instance_capacity: u32) -> Self {
        Self {
            vertex_capacity,
            index_capacity,
            instance_capacity,
            vertex_used: 0,
            index_used: 0,
            instances_used: 0,
        }
    }

    /// Budget of a batch created for `first`: each buffer is as large as the
    /// limit or the first mesh, whichever is bigger.
    pub fn for_first_mesh(limits: &BatchLimits, first: MeshFootprint) -> Self {
        Self::new(
            limits.vertex_bytes.max(first.vertex_bytes),
            limits.index_bytes.max(first.index_bytes),
            limits.max_instances.max(1),
        )
    }

    pub const fn vertex_capacity(&self) -> u64 {
        self.vertex_capacity
    }

    pub const fn index_capacity(&self) -> u64 {
        self.index_capacity
    }

    pub const fn instance_capacity(&self) -> u32 {
        self.instance_capacity
    }

    pub const fn remaining_vertex_bytes(&self) -> u64 {
        self.vertex_capacity - self.vertex_used
    }

    pub const fn remaining_index_bytes(&self) -> u64 {
        self.index_capacity - self.index_used
    }

    pub const fn remaining_instances(&self) -> u32 {
        self.instance_capacity - self.instances_used
    }

    /// Where `footprint` would go, without reserving it.
    pub const fn check(
        &self,
        footprint: MeshFootprint,
    ) -> std::result::Result<BatchReservation, Rejection> {
        if footprint.vertex_bytes > self.remaining_vertex_bytes() {
            return Err(Rejection::VertexBytes);
        }
        if footprint.index_bytes > self.remaining_index_bytes() {
            return Err(Rejection::IndexBytes);
        }
        if self.remaining_instances() < 1 {
            return Err(Rejection::InstanceSlots);
        }
        Ok(BatchReservation {
            vertex_offset: self.vertex_used,
            index_offset: self.index_used,
            instance_slot: self.instances_used,
        })
    }

    /// Reserve space for `footprint`. A rejection leaves the budget untouched.
    pub fn try_reserve(
        &mut self,
        footprint: MeshFootprint,
    ) -> std::result::Result<BatchReservation, Rejection> {
        let reservation = self.check(footprint)?;
        self.vertex_used += footprint.vertex_bytes;
        self.index_used += footprint.index_bytes;
        self.instances_used += 1;
        Ok(reservation)
    }
}

/// Many meshes in shared buffers, drawn with one instance each.
pub struct GeometryBatch {
    budget: BatchBudget,
    vertex_buffer: GpuBuffer,
    index_buffer: GpuBuffer,
    transform_buffers: Vec<GpuBuffer>,
    transform_sets: Vec<vk::DescriptorSet>,
    instances: Vec<Instance>,
    /// Instance indices sorted by material, insertion order within a material.
    draw_order: Vec<usize>,
}

impl GeometryBatch {
    /// Create a batch sized for `first` and append it as instance 0.
    pub fn new(
        device: &dyn GpuDevice,
        frames: &mut FrameContext,
        transform_sets: &mut ResourceBindingPoolAllocator,
        limits: &BatchLimits,
        first: &Mesh,
    ) -> Result<Self> {
        let budget = BatchBudget::for_first_mesh(limits, first.footprint());
        let mut batch = Self::allocate(device, frames, transform_sets, budget)?;

        match batch.try_add_mesh(device, frames, first) {
            Ok(Some(_)) => Ok(batch),
            Ok(None) => {
                batch.destroy(device)?;
                Err(GpuError::InvalidState(
                    "First mesh does not fit a batch sized for it".to_string(),
                ))
            }
            Err(e) => {
                batch.destroy(device)?;
                Err(e)
            }
        }
    }

    fn allocate(
        device: &dyn GpuDevice,
        frames: &FrameContext,
        transform_sets: &mut ResourceBindingPoolAllocator,
        budget: BatchBudget,
    ) -> Result<Self> {
        let mut batch = Self {
            budget,
            vertex_buffer: GpuBuffer::null(),
            index_buffer: GpuBuffer::null(),
            transform_buffers: Vec::with_capacity(frames.frames_in_flight()),
            transform_sets: Vec::with_capacity(frames.frames_in_flight()),
            instances: Vec::new(),
            draw_order: Vec::new(),
        };

        if let Err(e) = batch.allocate_buffers(device, frames, transform_sets) {
            batch.destroy(device)?;
            return Err(e);
        }

        tracing::debug!(
            "Created geometry batch: {} vertex bytes, {} index bytes, {} instances",
            budget.vertex_capacity(),
            budget.index_capacity(),
            budget.instance_capacity()
        );
        Ok(batch)
    }

    fn allocate_buffers(
        &mut self,
        device: &dyn GpuDevice,
        frames: &FrameContext,
        transform_sets: &mut ResourceBindingPoolAllocator,
    ) -> Result<()> {
        self.vertex_buffer = device.create_buffer(
            self.budget.vertex_capacity(),
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            "batch_vertices",
        )?;
        self.index_buffer = device.create_buffer(
            self.budget.index_capacity(),
            vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            "batch_indices",
        )?;

        let transform_bytes = u64::from(self.budget.instance_capacity()) * TRANSFORM_SIZE;
        for _ in 0..frames.frames_in_flight() {
            let buffer = device.create_buffer(
                transform_bytes,
                vk::BufferUsageFlags::STORAGE_BUFFER,
                MemoryLocation::CpuToGpu,
                "batch_transforms",
            )?;
            let set = transform_sets.allocate(device)?.set;
            device.write_buffer_descriptor(
                set,
                0,
                vk::DescriptorType::STORAGE_BUFFER,
                buffer.buffer,
                0,
                transform_bytes,
            );
            self.transform_buffers.push(buffer);
            self.transform_sets.push(set);
        }
        Ok(())
    }

    pub const fn budget(&self) -> &BatchBudget {
        &self.budget
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn instance(&self, index: usize) -> Option<&Instance> {
        self.instances.get(index)
    }

    pub fn instance_mut(&mut self, index: usize) -> Option<&mut Instance> {
        self.instances.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Instance indices in the order they are drawn.
    pub fn draw_order(&self) -> &[usize] {
        &self.draw_order
    }

    pub const fn vertex_buffer(&self) -> &GpuBuffer {
        &self.vertex_buffer
    }

    pub const fn index_buffer(&self) -> &GpuBuffer {
        &self.index_buffer
    }

    /// Transform storage of `slot`.
    pub fn transform_buffer(&self, slot: usize) -> Option<&GpuBuffer> {
        self.transform_buffers.get(slot)
    }

    /// Append `mesh` if every budget allows it.
    ///
    /// Returns the new instance index, or `None` without side effects when
    /// the mesh does not fit. Vertex and index data are staged and copied
    /// before this returns.
    pub fn try_add_mesh(
        &mut self,
        device: &dyn GpuDevice,
        frames: &mut FrameContext,
        mesh: &Mesh,
    ) -> Result<Option<usize>> {
        let footprint = mesh.footprint();
        let reservation = match self.budget.check(footprint) {
            Ok(reservation) => reservation,
            Err(reason) => {
                tracing::trace!("Mesh rejected by batch: {reason:?}");
                return Ok(None);
            }
        };

        frames.upload_to_buffer(
            device,
            mesh.vertex_bytes(),
            &self.vertex_buffer,
            reservation.vertex_offset,
        )?;
        frames.upload_to_buffer(
            device,
            mesh.index_bytes(),
            &self.index_buffer,
            reservation.index_offset,
        )?;

        let instance = Instance::new(mesh, reservation, self.transform_buffers.len());
        // The slot is new, so no in-flight frame reads it yet.
        let transform_offset = u64::from(reservation.instance_slot) * TRANSFORM_SIZE;
        for buffer in &self.transform_buffers {
            device.write_buffer(
                buffer,
                transform_offset,
                bytemuck::bytes_of(&instance.transform()),
            )?;
        }

        let committed = self.budget.try_reserve(footprint);
        debug_assert_eq!(committed, Ok(reservation));

        let index = self.instances.len();
        let material = instance.material();
        let position = self
            .draw_order
            .partition_point(|&i| self.instances[i].material() <= material);
        self.draw_order.insert(position, index);
        self.instances.push(instance);

        Ok(Some(index))
    }

    /// Record draws for every instance into the frame's command buffer.
    ///
    /// A graphics pipeline using `layout` must already be bound. Transforms
    /// changed since this slot was last drawn are written first.
    pub fn draw(
        &mut self,
        device: &dyn GpuDevice,
        frame: &ActiveFrame,
        layout: vk::PipelineLayout,
        materials: &MaterialRegistry,
    ) -> Result<()> {
        if self.instances.is_empty() {
            return Ok(());
        }

        let slot = frame.slot();
        let cmd = frame.command_buffer();
        let (Some(transforms), Some(&transform_set)) =
            (self.transform_buffers.get(slot), self.transform_sets.get(slot))
        else {
            return Err(GpuError::InvalidState(format!(
                "Batch has no transform storage for slot {slot}"
            )));
        };

        device.cmd_bind_vertex_buffer(cmd, self.vertex_buffer.buffer, 0);
        device.cmd_bind_index_buffer(cmd, self.index_buffer.buffer, 0, vk::IndexType::UINT32);
        device.cmd_bind_descriptor_set(cmd, layout, TRANSFORM_SET_INDEX, transform_set);

        let mut bound_material: Option<MaterialId> = None;
        for &index in &self.draw_order {
            let instance = &mut self.instances[index];
            let reservation = instance.reservation();

            if let Some(transform) = instance.take_pending_copy(slot) {
                device.write_buffer(
                    transforms,
                    u64::from(reservation.instance_slot) * TRANSFORM_SIZE,
                    bytemuck::bytes_of(&transform),
                )?;
            }

            if bound_material != Some(instance.material()) {
                let set = materials.binding_set(instance.material())?;
                device.cmd_bind_descriptor_set(cmd, layout, MATERIAL_SET_INDEX, set);
                bound_material = Some(instance.material());
            }

            device.cmd_draw_indexed(
                cmd,
                &IndexedDraw {
                    index_count: instance.index_count(),
                    instance_count: 1,
                    first_index: (reservation.index_offset / INDEX_SIZE) as u32,
                    vertex_offset: (reservation.vertex_offset / Vertex::SIZE) as i32,
                    first_instance: reservation.instance_slot,
                },
            );
        }
        Ok(())
    }

    /// Free the batch's buffers. Its transform sets return with their pools.
    pub fn destroy(&mut self, device: &dyn GpuDevice) -> Result<()> {
        device.free_buffer(&mut self.vertex_buffer)?;
        device.free_buffer(&mut self.index_buffer)?;
        for buffer in &mut self.transform_buffers {
            device.free_buffer(buffer)?;
        }
        self.transform_buffers.clear();
        self.transform_sets.clear();
        Ok(())
    }
}
