//! Materials and their resource bindings.
//!
//! Every material owns one descriptor set (four textures plus a slice of a
//! shared uniform buffer) drawn from a grow-only binding pool allocator.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use cadence_core::{math::align_up, Error, MaterialId};
use cadence_gpu::{
    DescriptorSetLayoutBuilder, FrameContext, GpuBuffer, GpuDevice, GpuError,
    ResourceBindingPoolAllocator, Result,
};
use glam::Vec3;
use gpu_allocator::MemoryLocation;
use hashbrown::HashMap;

/// Name of the material every registry starts with.
pub const DEFAULT_MATERIAL_NAME: &str = "Default material";

/// Default number of materials a registry can hold.
pub const DEFAULT_MAX_MATERIALS: u32 = 64;

/// Texture bindings, in binding order.
const ALBEDO_BINDING: u32 = 0;
const METALLIC_BINDING: u32 = 1;
const ROUGHNESS_BINDING: u32 = 2;
const NORMAL_BINDING: u32 = 3;
const UNIFORM_BINDING: u32 = 4;

/// Uniform value telling the shader to sample the texture instead.
const SAMPLE_TEXTURE: f32 = -1.0;

/// Constant surface parameters of a material.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MaterialParams {
    pub albedo: Vec3,
    pub metallic: f32,
    pub roughness: f32,
}

impl Default for MaterialParams {
    fn default() -> Self {
        Self {
            albedo: Vec3::ONE,
            metallic: 0.5,
            roughness: 0.5,
        }
    }
}

impl MaterialParams {
    pub const fn new(albedo: Vec3, metallic: f32, roughness: f32) -> Self {
        Self {
            albedo,
            metallic,
            roughness,
        }
    }
}

/// Textures bound to a material. Missing textures fall back to the
/// constant parameters.
#[derive(Clone, Copy, Debug, Default)]
pub struct MaterialTextures {
    pub albedo: Option<vk::DescriptorImageInfo>,
    pub metallic: Option<vk::DescriptorImageInfo>,
    pub roughness: Option<vk::DescriptorImageInfo>,
    pub normal: Option<vk::DescriptorImageInfo>,
}

/// Uniform block layout shared with the shaders.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct MaterialUniforms {
    pub albedo: [f32; 3],
    pub metallic: f32,
    pub roughness: f32,
    pub has_normal: u32,
    _pad: [u32; 2],
}

impl MaterialUniforms {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    fn new(params: &MaterialParams, textured: &TextureMask) -> Self {
        Self {
            albedo: if textured.albedo {
                [SAMPLE_TEXTURE; 3]
            } else {
                params.albedo.to_array()
            },
            metallic: if textured.metallic {
                SAMPLE_TEXTURE
            } else {
                params.metallic
            },
            roughness: if textured.roughness {
                SAMPLE_TEXTURE
            } else {
                params.roughness
            },
            has_normal: u32::from(textured.normal),
            _pad: [0; 2],
        }
    }
}

/// Which textures a material samples.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct TextureMask {
    pub albedo: bool,
    pub metallic: bool,
    pub roughness: bool,
    pub normal: bool,
}

/// A registered material.
#[derive(Clone, Debug)]
pub struct Material {
    name: String,
    params: MaterialParams,
    textured: TextureMask,
    set: vk::DescriptorSet,
}

impl Material {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn params(&self) -> &MaterialParams {
        &self.params
    }

    pub const fn textured(&self) -> &TextureMask {
        &self.textured
    }

    pub const fn binding_set(&self) -> vk::DescriptorSet {
        self.set
    }

    fn uniforms(&self) -> MaterialUniforms {
        MaterialUniforms::new(&self.params, &self.textured)
    }
}

/// All materials of a renderer.
pub struct MaterialRegistry {
    layout: vk::DescriptorSetLayout,
    sets: ResourceBindingPoolAllocator,
    uniforms: GpuBuffer,
    stride: u64,
    max_materials: u32,
    materials: Vec<Material>,
    by_name: HashMap<String, MaterialId>,
}

impl MaterialRegistry {
    /// Create the registry with room for `max_materials` and register the
    /// default material as [`MaterialId::DEFAULT`].
    pub fn new(device: &dyn GpuDevice, frames: &mut FrameContext, max_materials: u32) -> Result<Self> {
        let max_materials = max_materials.max(1);
        let stage = vk::ShaderStageFlags::FRAGMENT;
        let builder = DescriptorSetLayoutBuilder::new()
            .sampled_image(ALBEDO_BINDING, stage)
            .partially_bound()
            .sampled_image(METALLIC_BINDING, stage)
            .partially_bound()
            .sampled_image(ROUGHNESS_BINDING, stage)
            .partially_bound()
            .sampled_image(NORMAL_BINDING, stage)
            .partially_bound()
            .uniform_buffer(UNIFORM_BINDING, stage);
        let layout = builder.build(device)?;

        let stride = align_up(MaterialUniforms::SIZE, device.min_uniform_buffer_offset_alignment());
        let uniforms = match device.create_buffer(
            stride * u64::from(max_materials),
            vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            "material_uniforms",
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                device.destroy_descriptor_set_layout(layout);
                return Err(e);
            }
        };

        let mut registry = Self {
            layout,
            sets: ResourceBindingPoolAllocator::new(layout, builder.pool_sizes()),
            uniforms,
            stride,
            max_materials,
            materials: Vec::new(),
            by_name: HashMap::new(),
        };

        if let Err(e) = registry.create_material(
            device,
            frames,
            DEFAULT_MATERIAL_NAME,
            MaterialParams::default(),
        ) {
            registry.destroy(device)?;
            return Err(e);
        }

        tracing::info!("Material registry created (capacity {max_materials})");
        Ok(registry)
    }

    /// Layout of every material's descriptor set.
    pub const fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    pub fn len(&self) -> usize {
        self.materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }

    /// Bytes between two materials' uniform blocks.
    pub const fn uniform_stride(&self) -> u64 {
        self.stride
    }

    pub const fn uniform_buffer(&self) -> &GpuBuffer {
        &self.uniforms
    }

    /// Register a material with constant parameters.
    pub fn create_material(
        &mut self,
        device: &dyn GpuDevice,
        frames: &mut FrameContext,
        name: &str,
        params: MaterialParams,
    ) -> Result<MaterialId> {
        if self.by_name.contains_key(name) {
            return Err(Error::InvalidData(format!("Material '{name}' already exists")).into());
        }
        if self.materials.len() >= self.max_materials as usize {
            return Err(GpuError::ResourceExhausted(format!(
                "Material capacity {} reached",
                self.max_materials
            )));
        }

        let id = MaterialId(self.materials.len() as u32);
        let set = self.sets.allocate(device)?.set;
        device.write_buffer_descriptor(
            set,
            UNIFORM_BINDING,
            vk::DescriptorType::UNIFORM_BUFFER,
            self.uniforms.buffer,
            self.uniform_offset(id),
            MaterialUniforms::SIZE,
        );

        let material = Material {
            name: name.to_string(),
            params,
            textured: TextureMask::default(),
            set,
        };
        self.upload(device, frames, id, &material.uniforms())?;

        tracing::debug!("Created material '{name}' ({id:?})");
        self.materials.push(material);
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    /// Replace a material's constant parameters.
    ///
    /// Frames in flight read the shared uniform buffer, so this waits for
    /// all of them first. Frames recorded after this call see the new
    /// values. Must not be called while a frame is being recorded.
    pub fn set_params(
        &mut self,
        device: &dyn GpuDevice,
        frames: &mut FrameContext,
        id: MaterialId,
        params: MaterialParams,
    ) -> Result<()> {
        let material = self.material_mut(id)?;
        if material.params == params {
            return Ok(());
        }
        material.params = params;
        let uniforms = material.uniforms();
        frames.wait_idle(device)?;
        self.upload(device, frames, id, &uniforms)
    }

    /// Bind textures to a material. Channels given a texture sample it from
    /// then on.
    ///
    /// Waits for every frame in flight before rewriting the material's set.
    /// Must not be called while a frame is being recorded.
    pub fn bind_textures(
        &mut self,
        device: &dyn GpuDevice,
        frames: &mut FrameContext,
        id: MaterialId,
        textures: &MaterialTextures,
    ) -> Result<()> {
        self.material_mut(id)?;
        frames.wait_idle(device)?;
        let material = self.material_mut(id)?;
        let set = material.set;

        let bindings = [
            (ALBEDO_BINDING, textures.albedo, &mut material.textured.albedo),
            (METALLIC_BINDING, textures.metallic, &mut material.textured.metallic),
            (ROUGHNESS_BINDING, textures.roughness, &mut material.textured.roughness),
            (NORMAL_BINDING, textures.normal, &mut material.textured.normal),
        ];
        for (binding, info, textured) in bindings {
            if let Some(info) = info {
                device.write_image_descriptor(set, binding, info);
                *textured = true;
            }
        }

        let uniforms = material.uniforms();
        self.upload(device, frames, id, &uniforms)
    }

    pub fn get(&self, id: MaterialId) -> Option<&Material> {
        self.materials.get(id.index())
    }

    /// Look a material up by name.
    pub fn find(&self, name: &str) -> Option<MaterialId> {
        self.by_name.get(name).copied()
    }

    /// Descriptor set to bind when drawing with `id`.
    pub fn binding_set(&self, id: MaterialId) -> Result<vk::DescriptorSet> {
        self.get(id)
            .map(Material::binding_set)
            .ok_or_else(|| Error::NotFound(format!("Material {}", id.0)).into())
    }

    /// Free the uniform buffer, the binding pools and the layout.
    pub fn destroy(&mut self, device: &dyn GpuDevice) -> Result<()> {
        self.sets.destroy(device);
        device.free_buffer(&mut self.uniforms)?;
        device.destroy_descriptor_set_layout(self.layout);
        self.layout = vk::DescriptorSetLayout::null();
        self.materials.clear();
        self.by_name.clear();
        Ok(())
    }

    fn material_mut(&mut self, id: MaterialId) -> Result<&mut Material> {
        self.materials
            .get_mut(id.index())
            .ok_or_else(|| Error::NotFound(format!("Material {}", id.0)).into())
    }

    const fn uniform_offset(&self, id: MaterialId) -> u64 {
        self.stride * id.0 as u64
    }

    fn upload(
        &self,
        device: &dyn GpuDevice,
        frames: &mut FrameContext,
        id: MaterialId,
        uniforms: &MaterialUniforms,
    ) -> Result<()> {
        frames.upload_to_buffer(
            device,
            bytemuck::bytes_of(uniforms),
            &self.uniforms,
            self.uniform_offset(id),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_gpu::testing::{DeviceCall, RecordingDevice};

    fn setup() -> (RecordingDevice, FrameContext) {
        let device = RecordingDevice::with_uniform_alignment(64);
        let frames = FrameContext::new(&device, 2, 0).unwrap();
        (device, frames)
    }

    fn uniforms_at(device: &RecordingDevice, registry: &MaterialRegistry, id: MaterialId) -> MaterialUniforms {
        let bytes = device.buffer_contents(registry.uniform_buffer().buffer).unwrap();
        let start = (registry.uniform_stride() * u64::from(id.0)) as usize;
        bytemuck::pod_read_unaligned(&bytes[start..start + MaterialUniforms::SIZE as usize])
    }

    #[test]
    fn default_material_is_registered() {
        let (device, mut frames) = setup();
        let registry = MaterialRegistry::new(&device, &mut frames, 4).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find(DEFAULT_MATERIAL_NAME), Some(MaterialId::DEFAULT));
        let uniforms = uniforms_at(&device, &registry, MaterialId::DEFAULT);
        assert_eq!(uniforms.albedo, [1.0; 3]);
        assert_eq!(uniforms.metallic, 0.5);
        assert_eq!(uniforms.roughness, 0.5);
    }

    #[test]
    fn uniform_stride_respects_alignment() {
        let (device, mut frames) = setup();
        let registry = MaterialRegistry::new(&device, &mut frames, 4).unwrap();
        assert_eq!(registry.uniform_stride(), 64);
        assert_eq!(registry.uniform_buffer().size, 256);
    }

    #[test]
    fn materials_get_sequential_ids_and_own_sets() {
        let (device, mut frames) = setup();
        let mut registry = MaterialRegistry::new(&device, &mut frames, 16).unwrap();

        let red = registry
            .create_material(&device, &mut frames, "red", MaterialParams::new(Vec3::X, 0.0, 1.0))
            .unwrap();
        let blue = registry
            .create_material(&device, &mut frames, "blue", MaterialParams::new(Vec3::Z, 1.0, 0.2))
            .unwrap();

        assert_eq!(red, MaterialId(1));
        assert_eq!(blue, MaterialId(2));
        assert_ne!(
            registry.binding_set(red).unwrap(),
            registry.binding_set(blue).unwrap()
        );
        assert_eq!(uniforms_at(&device, &registry, blue).albedo, [0.0, 0.0, 1.0]);
    }

    #[test]
    fn duplicate_names_and_overflow_rejected() {
        let (device, mut frames) = setup();
        let mut registry = MaterialRegistry::new(&device, &mut frames, 2).unwrap();

        assert!(registry
            .create_material(&device, &mut frames, DEFAULT_MATERIAL_NAME, MaterialParams::default())
            .is_err());
        registry
            .create_material(&device, &mut frames, "second", MaterialParams::default())
            .unwrap();
        assert!(matches!(
            registry.create_material(&device, &mut frames, "third", MaterialParams::default()),
            Err(GpuError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn eleventh_material_opens_second_pool() {
        let (device, mut frames) = setup();
        let mut registry = MaterialRegistry::new(&device, &mut frames, 32).unwrap();
        for i in 0..10 {
            registry
                .create_material(&device, &mut frames, &format!("m{i}"), MaterialParams::default())
                .unwrap();
        }
        assert_eq!(registry.len(), 11);
        assert_eq!(device.live_descriptor_pools(), 2);
    }

    #[test]
    fn set_params_uploads_only_on_change() {
        let (device, mut frames) = setup();
        let mut registry = MaterialRegistry::new(&device, &mut frames, 4).unwrap();
        device.clear_calls();

        registry
            .set_params(&device, &mut frames, MaterialId::DEFAULT, MaterialParams::default())
            .unwrap();
        assert!(device.calls().is_empty());

        let params = MaterialParams::new(Vec3::splat(0.25), 0.1, 0.9);
        registry
            .set_params(&device, &mut frames, MaterialId::DEFAULT, params)
            .unwrap();
        assert_eq!(uniforms_at(&device, &registry, MaterialId::DEFAULT).roughness, 0.9);
    }

    #[test]
    fn textures_switch_channels_to_sampling() {
        let (device, mut frames) = setup();
        let mut registry = MaterialRegistry::new(&device, &mut frames, 4).unwrap();
        device.clear_calls();

        let textures = MaterialTextures {
            albedo: Some(vk::DescriptorImageInfo::default()),
            normal: Some(vk::DescriptorImageInfo::default()),
            ..MaterialTextures::default()
        };
        registry
            .bind_textures(&device, &mut frames, MaterialId::DEFAULT, &textures)
            .unwrap();

        let written: Vec<u32> = device
            .calls()
            .iter()
            .filter_map(|c| match c {
                DeviceCall::WriteImageDescriptor { binding, .. } => Some(*binding),
                _ => None,
            })
            .collect();
        assert_eq!(written, vec![ALBEDO_BINDING, NORMAL_BINDING]);

        let uniforms = uniforms_at(&device, &registry, MaterialId::DEFAULT);
        assert_eq!(uniforms.albedo, [SAMPLE_TEXTURE; 3]);
        assert_eq!(uniforms.metallic, 0.5);
        assert_eq!(uniforms.has_normal, 1);
    }

    #[test]
    fn updates_wait_for_frames_in_flight() {
        let (device, mut frames) = setup();
        let mut registry = MaterialRegistry::new(&device, &mut frames, 4).unwrap();
        let fences: Vec<vk::Fence> = (0..2)
            .map(|slot| frames.sync_table().slot(slot).unwrap().in_flight)
            .collect();
        let frame = frames.begin_frame(&device).unwrap();
        frames.end_frame(&device, &frame).unwrap();
        frames.submit_frame(&device, &frame).unwrap();
        frames.advance();

        let waits_before = |calls: &[DeviceCall], first_write: usize| {
            fences.iter().all(|fence| {
                calls[..first_write]
                    .iter()
                    .any(|c| matches!(c, DeviceCall::WaitForFence(f) if f == fence))
            })
        };

        device.clear_calls();
        registry
            .set_params(
                &device,
                &mut frames,
                MaterialId::DEFAULT,
                MaterialParams::new(Vec3::X, 0.0, 1.0),
            )
            .unwrap();
        let calls = device.calls();
        let upload = calls
            .iter()
            .position(|c| matches!(c, DeviceCall::WriteBuffer { .. }))
            .unwrap();
        assert!(waits_before(&calls, upload));

        device.clear_calls();
        let textures = MaterialTextures {
            roughness: Some(vk::DescriptorImageInfo::default()),
            ..MaterialTextures::default()
        };
        registry
            .bind_textures(&device, &mut frames, MaterialId::DEFAULT, &textures)
            .unwrap();
        let calls = device.calls();
        let write = calls
            .iter()
            .position(|c| matches!(c, DeviceCall::WriteImageDescriptor { .. }))
            .unwrap();
        assert!(waits_before(&calls, write));
    }

    #[test]
    fn unknown_material_is_not_found() {
        let (device, mut frames) = setup();
        let registry = MaterialRegistry::new(&device, &mut frames, 4).unwrap();
        assert!(matches!(
            registry.binding_set(MaterialId(7)),
            Err(GpuError::Core(Error::NotFound(_)))
        ));
    }

    #[test]
    fn destroy_releases_resources() {
        let (device, mut frames) = setup();
        let mut registry = MaterialRegistry::new(&device, &mut frames, 4).unwrap();
        let buffers_before = device.live_buffers();

        registry.destroy(&device).unwrap();
        assert_eq!(device.live_descriptor_pools(), 0);
        assert_eq!(device.live_buffers(), buffers_before - 1);
    }
}
