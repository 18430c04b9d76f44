//! Point lights and their per-slot storage buffers.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use cadence_gpu::{
    ActiveFrame, DescriptorSetLayoutBuilder, GpuBuffer, GpuDevice, GpuError,
    ResourceBindingPoolAllocator, Result,
};
use glam::Vec3;
use gpu_allocator::MemoryLocation;

/// Descriptor set index of the point light storage buffer.
pub const LIGHT_SET_INDEX: u32 = 3;

/// Lights a scene holds unless configured otherwise.
pub const DEFAULT_MAX_POINT_LIGHTS: usize = 16;

/// Radius given to lights created with [`PointLights::add`].
pub const DEFAULT_LIGHT_RADIUS: f32 = 0.1;

/// Bytes ahead of the light array: the light count, padded to 16.
const HEADER_SIZE: u64 = 16;

/// Index of a light inside [`PointLights`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LightHandle(pub usize);

/// A named point light.
#[derive(Clone, Debug, PartialEq)]
pub struct PointLight {
    pub name: String,
    pub position: Vec3,
    pub color: Vec3,
    pub radius: f32,
}

impl PointLight {
    pub fn new(name: impl Into<String>, position: Vec3, color: Vec3) -> Self {
        Self {
            name: name.into(),
            position,
            color,
            radius: DEFAULT_LIGHT_RADIUS,
        }
    }

    pub fn data(&self) -> PointLightData {
        PointLightData {
            position: self.position.to_array(),
            radius: self.radius,
            color: self.color.to_array(),
            _pad: 0.0,
        }
    }
}

/// Shader-side layout of one light.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct PointLightData {
    pub position: [f32; 3],
    pub radius: f32,
    pub color: [f32; 3],
    _pad: f32,
}

impl PointLightData {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct LightHeader {
    count: u32,
    _pad: [u32; 3],
}

/// Point lights with one storage buffer and binding set per frame slot.
///
/// Any change marks every slot stale. A slot is rewritten only while its
/// own frame is active, so buffers read by frames in flight stay intact.
pub struct PointLights {
    max_lights: usize,
    lights: Vec<PointLight>,
    layout: vk::DescriptorSetLayout,
    sets: ResourceBindingPoolAllocator,
    buffers: Vec<GpuBuffer>,
    slot_sets: Vec<vk::DescriptorSet>,
    stale: Vec<bool>,
}

impl PointLights {
    pub fn new(device: &dyn GpuDevice, frames_in_flight: usize, max_lights: usize) -> Result<Self> {
        let builder = DescriptorSetLayoutBuilder::new().storage_buffer(
            0,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
        );
        let layout = builder.build(device)?;

        let mut lights = Self {
            max_lights,
            lights: Vec::new(),
            layout,
            sets: ResourceBindingPoolAllocator::new(layout, builder.pool_sizes()),
            buffers: Vec::with_capacity(frames_in_flight),
            slot_sets: Vec::with_capacity(frames_in_flight),
            stale: vec![false; frames_in_flight],
        };
        if let Err(e) = lights.allocate_slots(device, frames_in_flight) {
            lights.destroy(device)?;
            return Err(e);
        }

        tracing::debug!(
            "Created point light storage for {max_lights} lights in {frames_in_flight} frame slots"
        );
        Ok(lights)
    }

    const fn buffer_size(&self) -> u64 {
        HEADER_SIZE + PointLightData::SIZE * self.max_lights as u64
    }

    fn allocate_slots(&mut self, device: &dyn GpuDevice, frames_in_flight: usize) -> Result<()> {
        let size = self.buffer_size();
        for _ in 0..frames_in_flight {
            let buffer = device.create_buffer(
                size,
                vk::BufferUsageFlags::STORAGE_BUFFER,
                MemoryLocation::CpuToGpu,
                "point_lights",
            )?;
            // Nothing is in flight yet: every slot starts with zero lights.
            device.write_buffer(&buffer, 0, bytemuck::bytes_of(&LightHeader::zeroed()))?;
            self.buffers.push(buffer);

            let set = self.sets.allocate(device)?.set;
            device.write_buffer_descriptor(
                set,
                0,
                vk::DescriptorType::STORAGE_BUFFER,
                self.buffers[self.buffers.len() - 1].buffer,
                0,
                size,
            );
            self.slot_sets.push(set);
        }
        Ok(())
    }

    pub const fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    pub const fn max_lights(&self) -> usize {
        self.max_lights
    }

    pub fn len(&self) -> usize {
        self.lights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lights.is_empty()
    }

    pub fn lights(&self) -> &[PointLight] {
        &self.lights
    }

    pub fn get(&self, handle: LightHandle) -> Option<&PointLight> {
        self.lights.get(handle.0)
    }

    pub fn find(&self, name: &str) -> Option<LightHandle> {
        self.lights.iter().position(|l| l.name == name).map(LightHandle)
    }

    pub fn buffer(&self, slot: usize) -> Option<&GpuBuffer> {
        self.buffers.get(slot)
    }

    pub fn binding_set(&self, slot: usize) -> Result<vk::DescriptorSet> {
        self.slot_sets.get(slot).copied().ok_or_else(|| {
            GpuError::InvalidState(format!("No point light set for frame slot {slot}"))
        })
    }

    /// Whether `slot` still holds an older light list.
    pub fn is_stale(&self, slot: usize) -> bool {
        self.stale.get(slot).copied().unwrap_or(false)
    }

    /// Add a light. Every slot picks it up on its next frame.
    pub fn add(&mut self, light: PointLight) -> Result<LightHandle> {
        if self.lights.len() >= self.max_lights {
            return Err(GpuError::ResourceExhausted(format!(
                "Point light limit of {} reached",
                self.max_lights
            )));
        }
        tracing::debug!("Added point light '{}'", light.name);
        self.lights.push(light);
        self.mark_stale();
        Ok(LightHandle(self.lights.len() - 1))
    }

    pub fn set_position(&mut self, handle: LightHandle, position: Vec3) -> Result<()> {
        self.light_mut(handle)?.position = position;
        self.mark_stale();
        Ok(())
    }

    pub fn set_color(&mut self, handle: LightHandle, color: Vec3) -> Result<()> {
        self.light_mut(handle)?.color = color;
        self.mark_stale();
        Ok(())
    }

    fn light_mut(&mut self, handle: LightHandle) -> Result<&mut PointLight> {
        self.lights
            .get_mut(handle.0)
            .ok_or_else(|| GpuError::InvalidState(format!("Unknown point light {}", handle.0)))
    }

    fn mark_stale(&mut self) {
        self.stale.fill(true);
    }

    /// Rewrite the frame slot's buffer if the light list changed since
    /// that slot was last written.
    pub fn update(&mut self, device: &dyn GpuDevice, frame: &ActiveFrame) -> Result<()> {
        let slot = frame.slot();
        let buffer = self.buffers.get(slot).ok_or_else(|| {
            GpuError::InvalidState(format!("No point light buffer for frame slot {slot}"))
        })?;
        if !self.stale[slot] {
            return Ok(());
        }

        let header = LightHeader {
            count: self.lights.len() as u32,
            _pad: [0; 3],
        };
        let data: Vec<PointLightData> = self.lights.iter().map(PointLight::data).collect();
        device.write_buffer(buffer, 0, bytemuck::bytes_of(&header))?;
        if !data.is_empty() {
            device.write_buffer(buffer, HEADER_SIZE, bytemuck::cast_slice(&data))?;
        }
        self.stale[slot] = false;
        Ok(())
    }

    /// Bind the frame slot's set at [`LIGHT_SET_INDEX`].
    pub fn bind(
        &self,
        device: &dyn GpuDevice,
        frame: &ActiveFrame,
        layout: vk::PipelineLayout,
    ) -> Result<()> {
        let set = self.binding_set(frame.slot())?;
        device.cmd_bind_descriptor_set(frame.command_buffer(), layout, LIGHT_SET_INDEX, set);
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

    fn header_writes(calls: &[DeviceCall]) -> Vec<vk::Buffer> {
        calls
            .iter()
            .filter_map(|c| match c {
                DeviceCall::WriteBuffer { buffer, offset: 0, len } if *len == HEADER_SIZE => {
                    Some(*buffer)
                }
                _ => None,
            })
            .collect()
    }

    fn stored_count(device: &RecordingDevice, buffer: vk::Buffer) -> u32 {
        let bytes = device.buffer_contents(buffer).unwrap();
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    #[test]
    fn each_slot_writes_only_its_own_buffer() {
        let device = RecordingDevice::new();
        let mut frames = FrameContext::new(&device, 2, 0).unwrap();
        let mut lights = PointLights::new(&device, 2, 4).unwrap();
        let slot_buffers: Vec<vk::Buffer> =
            (0..2).map(|slot| lights.buffer(slot).unwrap().buffer).collect();

        lights
            .add(PointLight::new("key", Vec3::new(1.0, 2.0, 3.0), Vec3::ONE))
            .unwrap();
        assert!(lights.is_stale(0) && lights.is_stale(1));

        let mut written = Vec::new();
        for _ in 0..4 {
            let frame = frames.begin_frame(&device).unwrap();
            device.clear_calls();
            lights.update(&device, &frame).unwrap();
            written.extend(header_writes(&device.calls()));
            assert!(!lights.is_stale(frame.slot()));
            frames.end_frame(&device, &frame).unwrap();
            frames.submit_frame(&device, &frame).unwrap();
            frames.advance();
        }

        // Each slot is refreshed once, by its own frame.
        assert_eq!(written, slot_buffers);
        for buffer in slot_buffers {
            assert_eq!(stored_count(&device, buffer), 1);
        }
    }

    #[test]
    fn moving_a_light_reaches_every_slot() {
        let device = RecordingDevice::new();
        let mut frames = FrameContext::new(&device, 2, 0).unwrap();
        let mut lights = PointLights::new(&device, 2, 4).unwrap();
        let handle = lights
            .add(PointLight::new("fill", Vec3::ZERO, Vec3::X))
            .unwrap();

        for _ in 0..2 {
            let frame = frames.begin_frame(&device).unwrap();
            lights.update(&device, &frame).unwrap();
            frames.end_frame(&device, &frame).unwrap();
            frames.submit_frame(&device, &frame).unwrap();
            frames.advance();
        }
        lights.set_position(handle, Vec3::new(0.0, 5.0, 0.0)).unwrap();
        assert!(lights.is_stale(0) && lights.is_stale(1));

        let frame = frames.begin_frame(&device).unwrap();
        lights.update(&device, &frame).unwrap();
        let bytes = device.buffer_contents(lights.buffer(0).unwrap().buffer).unwrap();
        let start = HEADER_SIZE as usize;
        let stored: PointLightData =
            bytemuck::pod_read_unaligned(&bytes[start..start + PointLightData::SIZE as usize]);
        assert_eq!(stored.position, [0.0, 5.0, 0.0]);
        assert_eq!(stored.color, [1.0, 0.0, 0.0]);
        assert!(lights.is_stale(1));
    }

    #[test]
    fn slots_start_empty() {
        let device = RecordingDevice::new();
        let lights = PointLights::new(&device, 3, 2).unwrap();
        for slot in 0..3 {
            assert_eq!(stored_count(&device, lights.buffer(slot).unwrap().buffer), 0);
            assert!(!lights.is_stale(slot));
        }
        assert_eq!(
            lights.buffer(0).unwrap().size,
            HEADER_SIZE + 2 * PointLightData::SIZE
        );
    }

    #[test]
    fn limit_is_enforced() {
        let device = RecordingDevice::new();
        let mut lights = PointLights::new(&device, 1, 1).unwrap();
        lights.add(PointLight::new("a", Vec3::ZERO, Vec3::ONE)).unwrap();
        assert!(matches!(
            lights.add(PointLight::new("b", Vec3::ZERO, Vec3::ONE)),
            Err(GpuError::ResourceExhausted(_))
        ));
        assert_eq!(lights.find("a"), Some(LightHandle(0)));
        assert!(lights.set_color(LightHandle(3), Vec3::ONE).is_err());
    }

    #[test]
    fn destroy_frees_slots() {
        let device = RecordingDevice::new();
        let mut lights = PointLights::new(&device, 2, 4).unwrap();
        lights.destroy(&device).unwrap();
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_descriptor_pools(), 0);
    }
}
