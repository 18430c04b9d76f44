//! Per-frame camera uniforms.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use cadence_gpu::{
    ActiveFrame, DescriptorSetLayoutBuilder, GpuBuffer, GpuDevice, GpuError,
    ResourceBindingPoolAllocator, Result,
};
use glam::Mat4;
use gpu_allocator::MemoryLocation;

/// Descriptor set index of the per-frame camera uniforms.
pub const GLOBAL_SET_INDEX: u32 = 0;

/// Camera matrices shared by every draw of a frame.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct GlobalUniforms {
    pub view: Mat4,
    pub projection: Mat4,
}

impl Default for GlobalUniforms {
    fn default() -> Self {
        Self {
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
        }
    }
}

impl GlobalUniforms {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    /// Right-handed perspective camera with Vulkan's downward Y.
    pub fn perspective(view: Mat4, fov_y_radians: f32, aspect: f32, near: f32, far: f32) -> Self {
        let mut projection = Mat4::perspective_rh(fov_y_radians, aspect, near, far);
        projection.y_axis.y *= -1.0;
        Self { view, projection }
    }
}

/// One host-visible uniform buffer and binding set per frame slot.
///
/// Only the active frame's slot is written, after its completion signal
/// was observed.
pub struct FrameGlobals {
    layout: vk::DescriptorSetLayout,
    sets: ResourceBindingPoolAllocator,
    buffers: Vec<GpuBuffer>,
    slot_sets: Vec<vk::DescriptorSet>,
    uniforms: GlobalUniforms,
}

impl FrameGlobals {
    pub fn new(device: &dyn GpuDevice, frames_in_flight: usize) -> Result<Self> {
        let builder = DescriptorSetLayoutBuilder::new().uniform_buffer(
            0,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
        );
        let layout = builder.build(device)?;

        let mut globals = Self {
            layout,
            sets: ResourceBindingPoolAllocator::new(layout, builder.pool_sizes()),
            buffers: Vec::with_capacity(frames_in_flight),
            slot_sets: Vec::with_capacity(frames_in_flight),
            uniforms: GlobalUniforms::default(),
        };
        if let Err(e) = globals.allocate_slots(device, frames_in_flight) {
            globals.destroy(device)?;
            return Err(e);
        }

        tracing::debug!("Created global uniforms for {frames_in_flight} frame slots");
        Ok(globals)
    }

    fn allocate_slots(&mut self, device: &dyn GpuDevice, frames_in_flight: usize) -> Result<()> {
        for _ in 0..frames_in_flight {
            let buffer = device.create_buffer(
                GlobalUniforms::SIZE,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                MemoryLocation::CpuToGpu,
                "frame_globals",
            )?;
            // No frame has been submitted yet, so every slot can be filled now.
            device.write_buffer(&buffer, 0, bytemuck::bytes_of(&self.uniforms))?;
            self.buffers.push(buffer);

            let set = self.sets.allocate(device)?.set;
            device.write_buffer_descriptor(
                set,
                0,
                vk::DescriptorType::UNIFORM_BUFFER,
                self.buffers[self.buffers.len() - 1].buffer,
                0,
                GlobalUniforms::SIZE,
            );
            self.slot_sets.push(set);
        }
        Ok(())
    }

    pub const fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Values the next frames will see.
    pub const fn uniforms(&self) -> &GlobalUniforms {
        &self.uniforms
    }

    /// Replace the camera matrices. Takes effect from the next
    /// [`write`](Self::write).
    pub fn set(&mut self, uniforms: GlobalUniforms) {
        self.uniforms = uniforms;
    }

    pub fn buffer(&self, slot: usize) -> Option<&GpuBuffer> {
        self.buffers.get(slot)
    }

    pub fn binding_set(&self, slot: usize) -> Result<vk::DescriptorSet> {
        self.slot_sets.get(slot).copied().ok_or_else(|| {
            GpuError::InvalidState(format!("No global uniforms for frame slot {slot}"))
        })
    }

    /// Copy the current values into the frame's slot.
    pub fn write(&self, device: &dyn GpuDevice, frame: &ActiveFrame) -> Result<()> {
        let buffer = self.buffers.get(frame.slot()).ok_or_else(|| {
            GpuError::InvalidState(format!("No global uniforms for frame slot {}", frame.slot()))
        })?;
        device.write_buffer(buffer, 0, bytemuck::bytes_of(&self.uniforms))
    }

    /// Bind the frame slot's set at [`GLOBAL_SET_INDEX`].
    pub fn bind(
        &self,
        device: &dyn GpuDevice,
        frame: &ActiveFrame,
        layout: vk::PipelineLayout,
    ) -> Result<()> {
        let set = self.binding_set(frame.slot())?;
        device.cmd_bind_descriptor_set(frame.command_buffer(), layout, GLOBAL_SET_INDEX, set);
        Ok(())
    }

    /// Free the buffers, pools and layout. The GPU must no longer use them.
    pub fn destroy(&mut self, device: &dyn GpuDevice) -> Result<()> {
        for buffer in &mut self.buffers {
            device.free_buffer(buffer)?;
        }
        self.buffers.clear();
        self.slot_sets.clear();
        self.sets.destroy(device);
        device.destroy_descriptor_set_layout(self.layout);
        self.layout = vk::DescriptorSetLayout::null();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_gpu::testing::{DeviceCall, RecordingDevice};
    use cadence_gpu::FrameContext;
    use glam::Vec3;

    fn written_buffers(calls: &[DeviceCall]) -> Vec<vk::Buffer> {
        calls
            .iter()
            .filter_map(|c| match c {
                DeviceCall::WriteBuffer { buffer, len, .. } if *len == GlobalUniforms::SIZE => {
                    Some(*buffer)
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn each_frame_writes_only_its_slot() {
        let device = RecordingDevice::new();
        let mut frames = FrameContext::new(&device, 2, 0).unwrap();
        let mut globals = FrameGlobals::new(&device, 2).unwrap();
        let slot_buffers: Vec<vk::Buffer> =
            (0..2).map(|slot| globals.buffer(slot).unwrap().buffer).collect();

        let view = Mat4::from_translation(Vec3::new(0.0, 0.0, -5.0));
        globals.set(GlobalUniforms::perspective(view, 1.5, 1.0, 0.1, 100.0));

        let mut written = Vec::new();
        for _ in 0..4 {
            let frame = frames.begin_frame(&device).unwrap();
            device.clear_calls();
            globals.write(&device, &frame).unwrap();
            written.extend(written_buffers(&device.calls()));
            frames.end_frame(&device, &frame).unwrap();
            frames.submit_frame(&device, &frame).unwrap();
            frames.advance();
        }

        assert_eq!(
            written,
            vec![slot_buffers[0], slot_buffers[1], slot_buffers[0], slot_buffers[1]]
        );
        let bytes = device.buffer_contents(slot_buffers[1]).unwrap();
        let stored: GlobalUniforms = bytemuck::pod_read_unaligned(&bytes);
        assert_eq!(stored.view, view);
    }

    #[test]
    fn slots_start_with_identity() {
        let device = RecordingDevice::new();
        let globals = FrameGlobals::new(&device, 3).unwrap();
        for slot in 0..3 {
            let bytes = device.buffer_contents(globals.buffer(slot).unwrap().buffer).unwrap();
            let stored: GlobalUniforms = bytemuck::pod_read_unaligned(&bytes);
            assert_eq!(stored, GlobalUniforms::default());
        }
        assert!(globals.binding_set(3).is_err());
    }

    #[test]
    fn projection_flips_y() {
        let uniforms = GlobalUniforms::perspective(Mat4::IDENTITY, 1.0, 1.0, 0.1, 10.0);
        let reference = Mat4::perspective_rh(1.0, 1.0, 0.1, 10.0);
        assert_eq!(uniforms.projection.y_axis.y, -reference.y_axis.y);
        assert_eq!(uniforms.projection.x_axis, reference.x_axis);
    }

    #[test]
    fn bind_uses_frame_slot_set() {
        let device = RecordingDevice::new();
        let mut frames = FrameContext::new(&device, 2, 0).unwrap();
        let globals = FrameGlobals::new(&device, 2).unwrap();

        let frame = frames.begin_frame(&device).unwrap();
        device.clear_calls();
        globals
            .bind(&device, &frame, vk::PipelineLayout::null())
            .unwrap();
        assert_eq!(
            device.calls(),
            vec![DeviceCall::BindDescriptorSet {
                cmd: frame.command_buffer(),
                set_index: GLOBAL_SET_INDEX,
                set: globals.binding_set(0).unwrap(),
            }]
        );
    }

    #[test]
    fn destroy_frees_slots() {
        let device = RecordingDevice::new();
        let mut globals = FrameGlobals::new(&device, 2).unwrap();
        globals.destroy(&device).unwrap();
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_descriptor_pools(), 0);
    }
}
