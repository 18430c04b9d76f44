//! GPU memory management.

use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

/// GPU memory allocator wrapper.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device,
        })
    }

    /// Allocate a buffer and bind its memory.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer> {
        if size == 0 {
            return Err(GpuError::InvalidState(format!(
                "Buffer '{name}' requested with zero size"
            )));
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        // SAFETY: the device outlives the allocator and the create info is valid
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        // SAFETY: buffer was just created on this device
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocator = match self.allocator.as_mut() {
            Some(allocator) => allocator,
            None => {
                // SAFETY: buffer has no memory bound and is not in use
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(GpuError::InvalidState(
                    "Allocator already shut down".to_string(),
                ));
            }
        };

        let allocation = match allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                // SAFETY: buffer has no memory bound and is not in use
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(GpuError::AllocationFailed(e.to_string()));
            }
        };

        // SAFETY: allocation satisfies the buffer's memory requirements
        unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())?;
        }

        tracing::trace!("Allocated buffer '{name}' ({size} bytes, {location:?})");

        Ok(GpuBuffer {
            buffer,
            allocation: Some(allocation),
            size,
            location,
        })
    }

    /// Free a buffer and its allocation.
    pub fn free_buffer(&mut self, buffer: &mut GpuBuffer) -> Result<()> {
        if let Some(allocation) = buffer.allocation.take() {
            self.allocator
                .as_mut()
                .ok_or_else(|| GpuError::InvalidState("Allocator already shut down".to_string()))?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
        }

        if buffer.buffer != vk::Buffer::null() {
            // SAFETY: caller guarantees the GPU no longer uses the buffer
            unsafe {
                self.device.destroy_buffer(buffer.buffer, None);
            }
        }
        buffer.buffer = vk::Buffer::null();

        Ok(())
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// This must be called before the Vulkan device is destroyed.
    /// Any remaining allocations will be freed (and logged as leaks).
    pub fn shutdown(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
        }
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A GPU buffer with its allocation.
///
/// `allocation` is `None` once the buffer was freed, and for buffers created
/// by devices that do not back memory with `gpu-allocator`.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
    pub location: MemoryLocation,
}

impl GpuBuffer {
    /// A buffer with no GPU object behind it. Freeing it does nothing.
    pub fn null() -> Self {
        Self {
            buffer: vk::Buffer::null(),
            allocation: None,
            size: 0,
            location: MemoryLocation::Unknown,
        }
    }

    /// Whether the CPU can write this buffer directly.
    pub fn is_host_visible(&self) -> bool {
        matches!(
            self.location,
            MemoryLocation::CpuToGpu | MemoryLocation::GpuToCpu
        )
    }

    /// Pointer to the persistently mapped memory, if any.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(Allocation::mapped_ptr)
            .map(|p| p.as_ptr().cast::<u8>())
    }

    /// Write raw bytes to the buffer at the given offset (must be host-visible).
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        check_range(self.size, offset, data.len() as u64)?;

        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))?;

        // SAFETY: the range was checked against the buffer size and the mapping
        // covers the whole allocation
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }

        Ok(())
    }
}

/// Check that `offset..offset + len` lies within a buffer of `size` bytes.
pub(crate) fn check_range(size: u64, offset: u64, len: u64) -> Result<()> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
    if end > size {
        return Err(GpuError::InvalidState(format!(
            "Range {offset}..{end} exceeds buffer size {size}"
        )));
    }
    Ok(())
}

/// An image that can receive staged copies.
///
/// Images are created and owned by the texture loader; this only carries
/// what copies need to know about them.
#[derive(Clone, Copy, Debug)]
pub struct GpuImage {
    pub image: vk::Image,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
}

impl GpuImage {
    /// Bytes of tightly packed texels covering the whole extent of
    /// `layers` array layers.
    pub fn copy_size(&self, layers: u32) -> Result<u64> {
        let texel = texel_size(self.format).ok_or_else(|| {
            GpuError::InvalidState(format!("No texel size known for {:?}", self.format))
        })?;
        let vk::Extent3D {
            width,
            height,
            depth,
        } = self.extent;
        [u64::from(height), u64::from(depth), u64::from(layers.max(1)), texel]
            .into_iter()
            .try_fold(u64::from(width), u64::checked_mul)
            .ok_or_else(|| GpuError::InvalidState("Image copy size overflow".to_string()))
    }

    /// Check that `len` source bytes cover a whole-extent copy of `layers`
    /// array layers.
    pub fn check_copy_source(&self, len: u64, layers: u32) -> Result<()> {
        let needed = self.copy_size(layers)?;
        if len < needed {
            let vk::Extent3D {
                width,
                height,
                depth,
            } = self.extent;
            return Err(GpuError::InvalidState(format!(
                "Copy into {width}x{height}x{depth} {:?} image needs {needed} bytes, got {len}",
                self.format
            )));
        }
        Ok(())
    }
}

/// Bytes per texel of the uncompressed formats images are uploaded in.
pub fn texel_size(format: vk::Format) -> Option<u64> {
    let size = match format {
        vk::Format::R8_UNORM | vk::Format::R8_SRGB => 1,
        vk::Format::R8G8_UNORM | vk::Format::R16_SFLOAT | vk::Format::R16_UNORM => 2,
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::R32_SFLOAT
        | vk::Format::D32_SFLOAT => 4,
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT => 8,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        _ => return None,
    };
    Some(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_check_accepts_exact_fit() {
        assert!(check_range(64, 0, 64).is_ok());
        assert!(check_range(64, 32, 32).is_ok());
        assert!(check_range(64, 64, 0).is_ok());
    }

    #[test]
    fn range_check_rejects_overrun_and_overflow() {
        assert!(check_range(64, 33, 32).is_err());
        assert!(check_range(64, u64::MAX, 2).is_err());
    }

    fn image(format: vk::Format, width: u32, height: u32) -> GpuImage {
        GpuImage {
            image: vk::Image::null(),
            format,
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
        }
    }

    #[test]
    fn copy_size_counts_every_texel() {
        assert_eq!(image(vk::Format::R8G8B8A8_SRGB, 4, 2).copy_size(1).unwrap(), 32);
        assert_eq!(image(vk::Format::R8_UNORM, 3, 3).copy_size(0).unwrap(), 9);
        assert_eq!(
            image(vk::Format::R32G32B32A32_SFLOAT, 2, 2).copy_size(6).unwrap(),
            384
        );
        assert!(image(vk::Format::BC7_UNORM_BLOCK, 4, 4).copy_size(1).is_err());
        assert!(image(vk::Format::R32G32B32A32_SFLOAT, u32::MAX, u32::MAX)
            .copy_size(u32::MAX)
            .is_err());
    }

    #[test]
    fn copy_source_must_cover_extent() {
        let img = image(vk::Format::R8G8B8A8_UNORM, 2, 2);
        assert!(img.check_copy_source(16, 1).is_ok());
        assert!(img.check_copy_source(64, 1).is_ok());
        assert!(matches!(
            img.check_copy_source(15, 1),
            Err(GpuError::InvalidState(_))
        ));
        assert!(img.check_copy_source(16, 2).is_err());
    }
}
