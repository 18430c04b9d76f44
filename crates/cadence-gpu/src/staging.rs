//! Host-visible staging for CPU to GPU transfers.

use crate::command;
use crate::device::GpuDevice;
use crate::error::{GpuError, Result};
use crate::memory::{check_range, GpuBuffer, GpuImage};
use ash::vk;
use gpu_allocator::MemoryLocation;

/// Staging capacity allocated up front.
pub const DEFAULT_STAGING_CAPACITY: u64 = 4 * 1024 * 1024;

/// A single grow-only host-visible buffer.
///
/// There is exactly one staging buffer: a new [`upload`](Self::upload) may
/// only be issued once the command buffer reading the previous upload has
/// completed. [`FrameContext`](crate::FrameContext) enforces this by waiting
/// on every staged copy.
pub struct StagingTransferBuffer {
    buffer: Option<GpuBuffer>,
    capacity: u64,
    len: u64,
}

impl StagingTransferBuffer {
    /// Create the buffer with `initial_capacity` bytes.
    ///
    /// A zero capacity defers allocation to the first upload.
    pub fn new(device: &dyn GpuDevice, initial_capacity: u64) -> Result<Self> {
        let buffer = if initial_capacity > 0 {
            Some(Self::allocate(device, initial_capacity)?)
        } else {
            None
        };

        Ok(Self {
            buffer,
            capacity: initial_capacity,
            len: 0,
        })
    }

    fn allocate(device: &dyn GpuDevice, size: u64) -> Result<GpuBuffer> {
        device.create_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            "staging_transfer_buffer",
        )
    }

    /// Current capacity in bytes. Never decreases.
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Size of the last upload.
    pub const fn len(&self) -> u64 {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `data` into the staging memory, reallocating at exactly
    /// `data.len()` bytes when it does not fit.
    pub fn upload(&mut self, device: &dyn GpuDevice, data: &[u8]) -> Result<()> {
        let size = data.len() as u64;
        if size == 0 {
            self.len = 0;
            return Ok(());
        }

        if size > self.capacity || self.buffer.is_none() {
            if let Some(mut old) = self.buffer.take() {
                device.free_buffer(&mut old)?;
            }
            let new_capacity = size.max(self.capacity);
            self.buffer = Some(Self::allocate(device, new_capacity)?);
            tracing::debug!(
                "Staging buffer reallocated: {} -> {new_capacity} bytes",
                self.capacity
            );
            self.capacity = new_capacity;
        }

        let buffer = self.buffer()?;
        device.write_buffer(buffer, 0, data)?;
        self.len = size;
        Ok(())
    }

    /// Record a copy of the last upload into `dst` at `dst_offset`.
    pub fn copy_to(
        &self,
        device: &dyn GpuDevice,
        cmd: vk::CommandBuffer,
        dst: &GpuBuffer,
        dst_offset: u64,
    ) -> Result<()> {
        if self.len == 0 {
            return Ok(());
        }
        check_range(dst.size, dst_offset, self.len)?;
        command::copy_buffer(device, cmd, self.buffer()?, dst, 0, dst_offset, self.len);
        Ok(())
    }

    /// Record a copy of the last upload into `dst`, which must be in
    /// `layout`. The upload must cover every texel of the copied layers.
    pub fn copy_to_image(
        &self,
        device: &dyn GpuDevice,
        cmd: vk::CommandBuffer,
        dst: &GpuImage,
        layout: vk::ImageLayout,
        subresource: vk::ImageSubresourceLayers,
    ) -> Result<()> {
        if self.len == 0 {
            return Ok(());
        }
        dst.check_copy_source(self.len, subresource.layer_count)?;
        command::copy_buffer_to_image(device, cmd, self.buffer()?, dst, layout, subresource)
    }

    fn buffer(&self) -> Result<&GpuBuffer> {
        self.buffer
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("Staging buffer not allocated".to_string()))
    }

    /// Free the staging memory.
    pub fn destroy(&mut self, device: &dyn GpuDevice) -> Result<()> {
        if let Some(mut buffer) = self.buffer.take() {
            device.free_buffer(&mut buffer)?;
        }
        self.len = 0;
        Ok(())
    }
}
