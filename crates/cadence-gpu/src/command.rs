//! Command buffer management.
//!
//! [`CommandDispatcher`] owns one persistent command buffer per frame slot and
//! hands out transient one-shot buffers for uploads. Both come from the same
//! resettable pool. The free functions at the bottom record copies and
//! barriers into a caller-supplied command buffer.

use crate::device::{GpuDevice, QueueSubmit};
use crate::error::{GpuError, Result};
use crate::memory::{GpuBuffer, GpuImage};
use ash::vk;
use std::collections::VecDeque;

/// A transient command buffer submitted but not yet known to be complete.
struct InFlightTransient {
    cmd: vk::CommandBuffer,
    serial: u64,
}

/// Frame-owned and transient command buffers over one pool.
pub struct CommandDispatcher {
    pool: vk::CommandPool,
    frame_buffers: Vec<vk::CommandBuffer>,
    /// Serial of the last submission containing each slot's buffer.
    frame_serials: Vec<u64>,
    in_flight: VecDeque<InFlightTransient>,
    next_serial: u64,
}

impl CommandDispatcher {
    /// Create the pool and one persistent buffer per frame slot.
    pub fn new(device: &dyn GpuDevice, frames_in_flight: usize) -> Result<Self> {
        let pool = device.create_command_pool(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)?;
        let frame_buffers = match device.allocate_command_buffers(pool, frames_in_flight as u32) {
            Ok(buffers) => buffers,
            Err(e) => {
                device.destroy_command_pool(pool);
                return Err(e);
            }
        };

        tracing::debug!("Allocated {frames_in_flight} frame command buffers");

        Ok(Self {
            pool,
            frame_buffers,
            frame_serials: vec![0; frames_in_flight],
            in_flight: VecDeque::new(),
            next_serial: 1,
        })
    }

    /// Persistent command buffer owned by `slot`.
    pub fn frame_buffer(&self, slot: usize) -> Result<vk::CommandBuffer> {
        self.slot_buffer(slot)
    }

    /// Number of transient buffers awaiting retirement.
    pub fn in_flight_transients(&self) -> usize {
        self.in_flight.len()
    }

    /// Reset and begin recording the buffer owned by `slot`.
    ///
    /// The caller must have waited on the slot's completion signal.
    pub fn begin_frame(&self, device: &dyn GpuDevice, slot: usize) -> Result<vk::CommandBuffer> {
        let cmd = self.slot_buffer(slot)?;
        device.reset_command_buffer(cmd)?;
        device.begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        Ok(cmd)
    }

    /// End recording the buffer owned by `slot` and return it for submission.
    pub fn end_frame(&self, device: &dyn GpuDevice, slot: usize) -> Result<vk::CommandBuffer> {
        let cmd = self.slot_buffer(slot)?;
        device.end_command_buffer(cmd)?;
        Ok(cmd)
    }

    /// Submit command buffers to the graphics queue.
    ///
    /// Returns the serial assigned to the submission.
    pub fn submit(
        &mut self,
        device: &dyn GpuDevice,
        command_buffers: &[vk::CommandBuffer],
        wait_semaphores: &[vk::Semaphore],
        wait_stages: &[vk::PipelineStageFlags],
        signal_semaphores: &[vk::Semaphore],
        completion: Option<vk::Fence>,
    ) -> Result<u64> {
        device.queue_submit(&QueueSubmit {
            command_buffers,
            wait_semaphores,
            wait_stages,
            signal_semaphores,
            fence: completion,
        })?;

        let serial = self.next_serial;
        self.next_serial += 1;

        for (slot, frame_cmd) in self.frame_buffers.iter().enumerate() {
            if command_buffers.contains(frame_cmd) {
                self.frame_serials[slot] = serial;
            }
        }

        Ok(serial)
    }

    /// Allocate and begin a one-shot command buffer with no slot affinity.
    pub fn begin_transient(&mut self, device: &dyn GpuDevice) -> Result<vk::CommandBuffer> {
        let cmd = device
            .allocate_command_buffers(self.pool, 1)?
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::InvalidState("No command buffer allocated".to_string()))?;

        if let Err(e) = device.begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
        {
            device.free_command_buffers(self.pool, &[cmd]);
            return Err(e);
        }
        Ok(cmd)
    }

    /// End and submit a transient buffer.
    ///
    /// The work is not complete on return. The buffer is freed once a later
    /// frame completion proves it executed, or by [`Self::run_transient`].
    pub fn end_transient(
        &mut self,
        device: &dyn GpuDevice,
        cmd: vk::CommandBuffer,
        wait_semaphores: &[vk::Semaphore],
        wait_stages: &[vk::PipelineStageFlags],
        signal_semaphores: &[vk::Semaphore],
        completion: Option<vk::Fence>,
    ) -> Result<u64> {
        let submitted = device.end_command_buffer(cmd).and_then(|()| {
            self.submit(
                device,
                &[cmd],
                wait_semaphores,
                wait_stages,
                signal_semaphores,
                completion,
            )
        });

        match submitted {
            Ok(serial) => {
                self.in_flight.push_back(InFlightTransient { cmd, serial });
                Ok(serial)
            }
            Err(e) => {
                device.free_command_buffers(self.pool, &[cmd]);
                Err(e)
            }
        }
    }

    /// Record, submit and wait for a transient buffer.
    ///
    /// Every buffer submitted before it is retired as well.
    pub fn run_transient<F>(&mut self, device: &dyn GpuDevice, record: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer) -> Result<()>,
    {
        let cmd = self.begin_transient(device)?;
        if let Err(e) = record(cmd) {
            device.free_command_buffers(self.pool, &[cmd]);
            return Err(e);
        }

        let fence = match device.create_fence(false) {
            Ok(fence) => fence,
            Err(e) => {
                device.free_command_buffers(self.pool, &[cmd]);
                return Err(e);
            }
        };

        let result = self
            .end_transient(device, cmd, &[], &[], &[], Some(fence))
            .and_then(|serial| {
                device.wait_for_fence(fence, u64::MAX)?;
                Ok(serial)
            });
        device.destroy_fence(fence);

        self.retire_through(device, result?);
        Ok(())
    }

    /// Free transient buffers submitted before the last submission of `slot`.
    ///
    /// Call after waiting on the slot's completion signal.
    pub fn retire_transients(&mut self, device: &dyn GpuDevice, slot: usize) {
        let completed = self.frame_serials[slot];
        if completed > 0 {
            self.retire_through(device, completed - 1);
        }
    }

    /// Free every transient with a serial up to and including `serial`.
    fn retire_through(&mut self, device: &dyn GpuDevice, serial: u64) {
        let mut retired = Vec::new();
        // Serials are pushed in increasing order.
        while matches!(self.in_flight.front(), Some(t) if t.serial <= serial) {
            if let Some(transient) = self.in_flight.pop_front() {
                retired.push(transient.cmd);
            }
        }

        if !retired.is_empty() {
            tracing::trace!("Retired {} transient command buffers", retired.len());
            device.free_command_buffers(self.pool, &retired);
        }
    }

    fn slot_buffer(&self, slot: usize) -> Result<vk::CommandBuffer> {
        self.frame_buffers.get(slot).copied().ok_or_else(|| {
            GpuError::InvalidState(format!(
                "Frame slot {slot} out of range (0..{})",
                self.frame_buffers.len()
            ))
        })
    }

    /// Free every command buffer and destroy the pool.
    ///
    /// The GPU must no longer use any of them.
    pub fn destroy(&mut self, device: &dyn GpuDevice) {
        let transients: Vec<vk::CommandBuffer> = self.in_flight.drain(..).map(|t| t.cmd).collect();
        if !transients.is_empty() {
            device.free_command_buffers(self.pool, &transients);
        }
        if !self.frame_buffers.is_empty() {
            device.free_command_buffers(self.pool, &self.frame_buffers);
            self.frame_buffers.clear();
        }
        device.destroy_command_pool(self.pool);
        self.pool = vk::CommandPool::null();
    }
}

/// Record a buffer-to-buffer copy.
pub fn copy_buffer(
    device: &dyn GpuDevice,
    cmd: vk::CommandBuffer,
    src: &GpuBuffer,
    dst: &GpuBuffer,
    src_offset: u64,
    dst_offset: u64,
    size: u64,
) {
    let region = vk::BufferCopy::default()
        .src_offset(src_offset)
        .dst_offset(dst_offset)
        .size(size);
    device.cmd_copy_buffer(cmd, src.buffer, dst.buffer, &[region]);
}

/// Record a copy of tightly packed texels into the whole extent of `dst`.
///
/// `src` must hold every texel of the copied layers.
pub fn copy_buffer_to_image(
    device: &dyn GpuDevice,
    cmd: vk::CommandBuffer,
    src: &GpuBuffer,
    dst: &GpuImage,
    dst_layout: vk::ImageLayout,
    subresource: vk::ImageSubresourceLayers,
) -> Result<()> {
    dst.check_copy_source(src.size, subresource.layer_count)?;
    let region = vk::BufferImageCopy::default()
        .buffer_offset(0)
        .buffer_row_length(dst.extent.width)
        .buffer_image_height(dst.extent.height)
        .image_subresource(subresource)
        .image_offset(vk::Offset3D::default())
        .image_extent(dst.extent);
    device.cmd_copy_buffer_to_image(cmd, src.buffer, dst.image, dst_layout, &[region]);
    Ok(())
}

/// An image layout transition.
#[derive(Clone, Copy, Debug)]
pub struct LayoutTransition {
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub subresource_range: vk::ImageSubresourceRange,
}

impl LayoutTransition {
    /// Undefined to transfer destination, ahead of a staged copy.
    pub fn to_transfer_dst(subresource_range: vk::ImageSubresourceRange) -> Self {
        Self {
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            subresource_range,
        }
    }

    /// Transfer destination to `layout`, readable by fragment shaders.
    pub fn from_transfer_dst(
        layout: vk::ImageLayout,
        subresource_range: vk::ImageSubresourceRange,
    ) -> Self {
        Self {
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ,
            old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            new_layout: layout,
            subresource_range,
        }
    }
}

/// Record an image layout transition.
pub fn transition_image_layout(
    device: &dyn GpuDevice,
    cmd: vk::CommandBuffer,
    image: &GpuImage,
    transition: &LayoutTransition,
) {
    let barrier = vk::ImageMemoryBarrier::default()
        .src_access_mask(transition.src_access)
        .dst_access_mask(transition.dst_access)
        .old_layout(transition.old_layout)
        .new_layout(transition.new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image.image)
        .subresource_range(transition.subresource_range);

    device.cmd_pipeline_barrier(
        cmd,
        transition.src_stage,
        transition.dst_stage,
        &[],
        &[barrier],
    );
}

/// Record a global memory dependency between two pipeline stages.
pub fn memory_barrier(
    device: &dyn GpuDevice,
    cmd: vk::CommandBuffer,
    src_stage: vk::PipelineStageFlags,
    dst_stage: vk::PipelineStageFlags,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
) {
    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access);
    device.cmd_pipeline_barrier(cmd, src_stage, dst_stage, &[barrier], &[]);
}
