//! Frame loop orchestration.

use anyhow::Context;
use cadence_core::{MaterialId, Mesh};
use cadence_gpu::{ActiveFrame, FrameContext, GpuDevice};
use cadence_scene::{
    FrameGlobals, GlobalUniforms, InstanceHandle, LightHandle, MaterialParams, MaterialRegistry,
    Scene,
};
use glam::Vec3;
use tracing::{debug, error, info};

use crate::config::RendererConfig;
use crate::pass::{PassContext, RenderPass};
use crate::presenter::Presenter;

/// What happened to a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame was submitted and queued for presentation.
    Presented { slot: usize, image_index: u32 },
    /// The presenter was out of date. Nothing was submitted and the slot
    /// is reused by the next frame.
    Skipped,
}

/// Owns the frame resources, the camera uniforms, the scene and the
/// materials, and drives frames through a [`Presenter`].
///
/// Errors are logged and returned. A frame that fails after its image was
/// acquired gives the acquire signal back before returning, so the next
/// frame can run. Device loss and presenter failures are fatal and the
/// renderer should be shut down.
pub struct Renderer<P: Presenter> {
    presenter: P,
    frames: FrameContext,
    globals: FrameGlobals,
    scene: Scene,
    materials: MaterialRegistry,
    passes: Vec<Box<dyn RenderPass>>,
}

impl<P: Presenter> Renderer<P> {
    pub fn new(device: &dyn GpuDevice, presenter: P, config: &RendererConfig) -> anyhow::Result<Self> {
        let frames_in_flight = config.resolve_frames_in_flight(presenter.image_count());
        let mut frames = FrameContext::new(device, frames_in_flight, config.staging_capacity)
            .context("Failed to create frame context")?;

        let mut globals = match FrameGlobals::new(device, frames_in_flight) {
            Ok(globals) => globals,
            Err(e) => {
                frames.destroy(device)?;
                return Err(e).context("Failed to create global uniforms");
            }
        };
        let materials = match MaterialRegistry::new(device, &mut frames, config.max_materials) {
            Ok(materials) => materials,
            Err(e) => {
                globals.destroy(device)?;
                frames.destroy(device)?;
                return Err(e).context("Failed to create material registry");
            }
        };
        let scene = match Scene::new(
            device,
            frames_in_flight,
            config.batch_limits,
            config.max_point_lights,
        ) {
            Ok(scene) => scene,
            Err(e) => {
                let mut materials = materials;
                materials.destroy(device)?;
                globals.destroy(device)?;
                frames.destroy(device)?;
                return Err(e).context("Failed to create scene");
            }
        };

        info!(
            "Renderer initialized: {frames_in_flight} frames in flight, {} presenter images",
            presenter.image_count()
        );

        Ok(Self {
            presenter,
            frames,
            globals,
            scene,
            materials,
            passes: Vec::new(),
        })
    }

    pub const fn presenter(&self) -> &P {
        &self.presenter
    }

    pub fn presenter_mut(&mut self) -> &mut P {
        &mut self.presenter
    }

    pub const fn frames(&self) -> &FrameContext {
        &self.frames
    }

    pub const fn globals(&self) -> &FrameGlobals {
        &self.globals
    }

    /// Camera matrices for the following frames. Each frame copies them
    /// into its own slot after acquiring an image.
    pub fn set_globals(&mut self, uniforms: GlobalUniforms) {
        self.globals.set(uniforms);
    }

    pub const fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn scene_mut(&mut self) -> &mut Scene {
        &mut self.scene
    }

    pub const fn materials(&self) -> &MaterialRegistry {
        &self.materials
    }

    /// Append a pass. Passes record in the order they were added.
    pub fn add_pass(&mut self, pass: Box<dyn RenderPass>) {
        debug!("Added render pass '{}'", pass.name());
        self.passes.push(pass);
    }

    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|pass| pass.name()).collect()
    }

    /// Upload `mesh` and place it in the scene.
    pub fn add_mesh(&mut self, device: &dyn GpuDevice, mesh: &Mesh) -> anyhow::Result<InstanceHandle> {
        Ok(self.scene.add_mesh(device, &mut self.frames, mesh)?)
    }

    pub fn add_point_light(
        &mut self,
        name: &str,
        position: Vec3,
        color: Vec3,
    ) -> anyhow::Result<LightHandle> {
        Ok(self.scene.add_point_light(name, position, color)?)
    }

    pub fn create_material(
        &mut self,
        device: &dyn GpuDevice,
        name: &str,
        params: MaterialParams,
    ) -> anyhow::Result<MaterialId> {
        Ok(self
            .materials
            .create_material(device, &mut self.frames, name, params)?)
    }

    pub fn set_material_params(
        &mut self,
        device: &dyn GpuDevice,
        id: MaterialId,
        params: MaterialParams,
    ) -> anyhow::Result<()> {
        Ok(self
            .materials
            .set_params(device, &mut self.frames, id, params)?)
    }

    /// Render one frame.
    ///
    /// Waits for the current slot, acquires an image, writes the slot's
    /// camera uniforms, records every pass, submits and presents, then
    /// moves to the next slot.
    pub fn draw_frame(&mut self, device: &dyn GpuDevice) -> anyhow::Result<FrameOutcome> {
        self.try_draw_frame(device).inspect_err(|e| {
            error!("Render error: {e:#}");
        })
    }

    fn try_draw_frame(&mut self, device: &dyn GpuDevice) -> anyhow::Result<FrameOutcome> {
        let frame = self.frames.begin_frame(device)?;

        let Some(image_index) = self
            .presenter
            .acquire_next_image(frame.sync().acquire_signal)
            .context("Failed to acquire presenter image")?
        else {
            debug!("Presenter out of date, skipping frame");
            self.frames.abandon_frame(device, frame)?;
            return Ok(FrameOutcome::Skipped);
        };

        if let Err(e) = self.record_and_submit(device, &frame, image_index) {
            if let Err(release) = self.frames.release_frame(device, frame) {
                error!("Failed to release frame after error: {release}");
            }
            return Err(e);
        }

        // The slot was submitted: advance even if presenting fails.
        let presented = self
            .presenter
            .present(image_index, frame.sync().present_wait());
        self.frames.advance();
        presented.context("Failed to present frame")?;

        Ok(FrameOutcome::Presented {
            slot: frame.slot(),
            image_index,
        })
    }

    fn record_and_submit(
        &mut self,
        device: &dyn GpuDevice,
        frame: &ActiveFrame,
        image_index: u32,
    ) -> anyhow::Result<()> {
        self.globals
            .write(device, frame)
            .context("Failed to write global uniforms")?;
        self.record_passes(device, frame, image_index)?;
        self.frames.end_frame(device, frame)?;
        self.frames.submit_frame(device, frame)?;
        Ok(())
    }

    fn record_passes(
        &mut self,
        device: &dyn GpuDevice,
        frame: &ActiveFrame,
        image_index: u32,
    ) -> anyhow::Result<()> {
        let mut ctx = PassContext {
            device,
            frame,
            image_index,
            globals: &self.globals,
            scene: &mut self.scene,
            materials: &self.materials,
        };
        for pass in &mut self.passes {
            pass.record(&mut ctx)
                .with_context(|| format!("Render pass '{}' failed", pass.name()))?;
        }
        Ok(())
    }

    /// Wait for the GPU, then free everything the renderer owns.
    ///
    /// Returns the presenter so its owner can tear it down.
    pub fn shutdown(mut self, device: &dyn GpuDevice) -> anyhow::Result<P> {
        self.frames.wait_idle(device)?;
        self.passes.clear();
        self.scene.destroy(device)?;
        self.materials.destroy(device)?;
        self.globals.destroy(device)?;
        self.frames.destroy(device)?;
        info!("Renderer shut down after {} frames", self.frames.frame_number());
        Ok(self.presenter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pass::ScenePass;
    use ash::vk;
    use ash::vk::Handle;
    use cadence_core::Vertex;
    use cadence_gpu::testing::{DeviceCall, RecordingDevice};
    use cadence_scene::{GLOBAL_SET_INDEX, LIGHT_SET_INDEX};
    use glam::Mat4;

    #[derive(Default)]
    struct FakePresenter {
        images: u32,
        next: u32,
        out_of_date: bool,
        acquire_signals: Vec<vk::Semaphore>,
        presented: Vec<(u32, Vec<vk::Semaphore>)>,
    }

    impl FakePresenter {
        fn new(images: u32) -> Self {
            Self {
                images,
                ..Self::default()
            }
        }
    }

    impl Presenter for FakePresenter {
        fn image_count(&self) -> usize {
            self.images as usize
        }

        fn acquire_next_image(&mut self, signal: vk::Semaphore) -> anyhow::Result<Option<u32>> {
            if self.out_of_date {
                return Ok(None);
            }
            self.acquire_signals.push(signal);
            let index = self.next;
            self.next = (self.next + 1) % self.images;
            Ok(Some(index))
        }

        fn present(&mut self, image_index: u32, wait: &[vk::Semaphore]) -> anyhow::Result<()> {
            self.presented.push((image_index, wait.to_vec()));
            Ok(())
        }
    }

    struct FailingPass;

    impl RenderPass for FailingPass {
        fn name(&self) -> &str {
            "failing"
        }

        fn record(&mut self, _ctx: &mut PassContext<'_>) -> anyhow::Result<()> {
            anyhow::bail!("shader missing")
        }
    }

    fn triangle() -> Mesh {
        Mesh::new(
            vec![
                Vertex::new([0.0; 3], [1.0; 3], [0.0, 0.0, 1.0]),
                Vertex::new([1.0, 0.0, 0.0], [1.0; 3], [0.0, 0.0, 1.0]),
                Vertex::new([0.0, 1.0, 0.0], [1.0; 3], [0.0, 0.0, 1.0]),
            ],
            vec![0, 1, 2],
        )
        .unwrap()
    }

    fn renderer(device: &RecordingDevice, images: u32) -> Renderer<FakePresenter> {
        Renderer::new(device, FakePresenter::new(images), &RendererConfig::default()).unwrap()
    }

    fn submitted_fences(calls: &[DeviceCall]) -> Vec<vk::Fence> {
        calls
            .iter()
            .filter_map(|call| match call {
                DeviceCall::Submit {
                    signal_semaphores,
                    fence: Some(fence),
                    ..
                } if !signal_semaphores.is_empty() => Some(*fence),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn slots_cycle_and_each_reset_follows_a_wait() {
        let device = RecordingDevice::new();
        let mut renderer = renderer(&device, 3);
        let fences: Vec<vk::Fence> = (0..3)
            .map(|slot| renderer.frames().sync_table().slot(slot).unwrap().in_flight)
            .collect();
        device.clear_calls();

        let mut slots = Vec::new();
        for _ in 0..9 {
            match renderer.draw_frame(&device).unwrap() {
                FrameOutcome::Presented { slot, .. } => slots.push(slot),
                FrameOutcome::Skipped => panic!("frame skipped"),
            }
        }
        assert_eq!(slots, vec![0, 1, 2, 0, 1, 2, 0, 1, 2]);

        let calls = device.calls();
        let expected: Vec<vk::Fence> = slots.iter().map(|&slot| fences[slot]).collect();
        assert_eq!(submitted_fences(&calls), expected);

        for (i, call) in calls.iter().enumerate() {
            if let DeviceCall::ResetFence(fence) = call {
                let waited = calls[..i]
                    .iter()
                    .rev()
                    .take_while(|c| !matches!(c, DeviceCall::Submit { fence: Some(f), .. } if f == fence))
                    .any(|c| matches!(c, DeviceCall::WaitForFence(f) if f == fence));
                assert!(waited, "fence reset without a wait since its last submit");
            }
        }
    }

    #[test]
    fn present_waits_on_render_finished_of_the_slot() {
        let device = RecordingDevice::new();
        let mut renderer = renderer(&device, 2);

        renderer.draw_frame(&device).unwrap();
        renderer.draw_frame(&device).unwrap();

        let table = renderer.frames().sync_table();
        let presented = &renderer.presenter().presented;
        assert_eq!(presented.len(), 2);
        for (slot, (image, wait)) in presented.iter().enumerate() {
            assert_eq!(*image, slot as u32);
            assert_eq!(wait, &vec![table.slot(slot).unwrap().render_finished]);
        }
        assert_eq!(
            renderer.presenter().acquire_signals,
            vec![
                table.slot(0).unwrap().image_available,
                table.slot(1).unwrap().image_available
            ]
        );
    }

    #[test]
    fn out_of_date_presenter_skips_without_submitting() {
        let device = RecordingDevice::new();
        let mut renderer = renderer(&device, 3);
        renderer.presenter_mut().out_of_date = true;
        device.clear_calls();

        assert_eq!(renderer.draw_frame(&device).unwrap(), FrameOutcome::Skipped);
        assert_eq!(renderer.draw_frame(&device).unwrap(), FrameOutcome::Skipped);
        assert!(submitted_fences(&device.calls()).is_empty());
        assert_eq!(renderer.frames().frame_number(), 0);

        renderer.presenter_mut().out_of_date = false;
        assert_eq!(
            renderer.draw_frame(&device).unwrap(),
            FrameOutcome::Presented {
                slot: 0,
                image_index: 0
            }
        );
    }

    #[test]
    fn scene_pass_draws_instances() {
        let device = RecordingDevice::new();
        let mut renderer = renderer(&device, 2);
        renderer.add_mesh(&device, &triangle()).unwrap();
        renderer.add_mesh(&device, &triangle().with_position(Vec3::X)).unwrap();

        let pipeline = vk::Pipeline::from_raw(0xbeef);
        let layout = vk::PipelineLayout::from_raw(0xcafe);
        renderer.add_pass(Box::new(ScenePass::new(pipeline, layout)));
        assert_eq!(renderer.pass_names(), vec!["scene"]);
        device.clear_calls();

        renderer.draw_frame(&device).unwrap();
        let cmd = renderer.frames().commands().frame_buffer(0).unwrap();
        let calls = device.calls();

        let bind = calls
            .iter()
            .position(|c| matches!(c, DeviceCall::BindPipeline { cmd: c2, pipeline: p } if *c2 == cmd && *p == pipeline))
            .unwrap();
        let draws = calls
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c, DeviceCall::DrawIndexed { cmd: c2, .. } if *c2 == cmd))
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        assert_eq!(draws.len(), 2);
        assert!(draws.iter().all(|&i| i > bind));

        let bound_sets: Vec<(u32, vk::DescriptorSet)> = calls[bind..draws[0]]
            .iter()
            .filter_map(|c| match c {
                DeviceCall::BindDescriptorSet { set_index, set, .. } => Some((*set_index, *set)),
                _ => None,
            })
            .collect();
        assert!(bound_sets.contains(&(
            GLOBAL_SET_INDEX,
            renderer.globals().binding_set(0).unwrap()
        )));
        assert!(bound_sets.contains(&(
            LIGHT_SET_INDEX,
            renderer.scene().point_lights().binding_set(0).unwrap()
        )));
    }

    #[test]
    fn camera_written_only_to_the_frame_slot() {
        let device = RecordingDevice::new();
        let mut renderer = renderer(&device, 2);
        let slot_buffers: Vec<vk::Buffer> = (0..2)
            .map(|slot| renderer.globals().buffer(slot).unwrap().buffer)
            .collect();
        let view = Mat4::look_at_rh(Vec3::new(0.0, 2.0, 5.0), Vec3::ZERO, Vec3::Y);
        renderer.set_globals(GlobalUniforms::perspective(view, 1.2, 16.0 / 9.0, 0.01, 1000.0));

        for expected_slot in [0, 1, 0, 1] {
            device.clear_calls();
            let outcome = renderer.draw_frame(&device).unwrap();
            let FrameOutcome::Presented { slot, .. } = outcome else {
                panic!("frame skipped");
            };
            assert_eq!(slot, expected_slot);

            let written: Vec<vk::Buffer> = device
                .calls()
                .iter()
                .filter_map(|c| match c {
                    DeviceCall::WriteBuffer { buffer, .. } if slot_buffers.contains(buffer) => {
                        Some(*buffer)
                    }
                    _ => None,
                })
                .collect();
            assert_eq!(written, vec![slot_buffers[slot]]);
        }

        let bytes = device.buffer_contents(slot_buffers[1]).unwrap();
        let stored: GlobalUniforms = bytemuck::pod_read_unaligned(&bytes);
        assert_eq!(stored.view, view);
    }

    #[test]
    fn pass_failure_is_returned() {
        let device = RecordingDevice::new();
        let mut renderer = renderer(&device, 2);
        renderer.add_pass(Box::new(FailingPass));

        let err = renderer.draw_frame(&device).unwrap_err();
        assert!(format!("{err:#}").contains("shader missing"));
    }

    #[test]
    fn pass_failure_gives_back_the_acquired_image() {
        let device = RecordingDevice::new();
        let mut renderer = renderer(&device, 2);
        renderer.add_pass(Box::new(FailingPass));
        let sync = *renderer.frames().sync_table().slot(0).unwrap();
        device.clear_calls();

        assert!(renderer.draw_frame(&device).is_err());
        let submits: Vec<DeviceCall> = device
            .calls()
            .into_iter()
            .filter(|c| matches!(c, DeviceCall::Submit { .. }))
            .collect();
        assert_eq!(
            submits,
            vec![DeviceCall::Submit {
                command_buffers: vec![],
                wait_semaphores: vec![sync.image_available],
                wait_stages: vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
                signal_semaphores: vec![],
                fence: Some(sync.in_flight),
            }]
        );
        assert!(renderer.presenter().presented.is_empty());

        renderer.passes.clear();
        assert_eq!(
            renderer.draw_frame(&device).unwrap(),
            FrameOutcome::Presented {
                slot: 0,
                image_index: 1
            }
        );
        renderer.shutdown(&device).unwrap();
    }

    #[test]
    fn submit_failure_is_returned() {
        let device = RecordingDevice::new();
        let mut renderer = renderer(&device, 2);
        device.fail_submits(true);

        assert!(renderer.draw_frame(&device).is_err());
        assert_eq!(renderer.frames().frame_number(), 0);
    }

    #[test]
    fn renderer_recovers_after_failed_submit() {
        let device = RecordingDevice::new();
        let mut renderer = renderer(&device, 2);
        renderer.add_mesh(&device, &triangle()).unwrap();
        device.fail_submits(true);
        assert!(renderer.draw_frame(&device).is_err());
        device.fail_submits(false);

        for expected_slot in [0, 1, 0] {
            match renderer.draw_frame(&device).unwrap() {
                FrameOutcome::Presented { slot, .. } => assert_eq!(slot, expected_slot),
                FrameOutcome::Skipped => panic!("frame skipped"),
            }
        }

        renderer.shutdown(&device).unwrap();
        assert_eq!(device.live_fences(), 0);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn shutdown_releases_everything() {
        let device = RecordingDevice::new();
        let mut renderer = renderer(&device, 3);
        renderer
            .create_material(&device, "red", MaterialParams::new(Vec3::X, 0.0, 1.0))
            .unwrap();
        renderer.add_mesh(&device, &triangle()).unwrap();
        renderer
            .add_point_light("lamp", Vec3::Y, Vec3::ONE)
            .unwrap();
        renderer.draw_frame(&device).unwrap();

        let presenter = renderer.shutdown(&device).unwrap();
        assert_eq!(presenter.presented.len(), 1);
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_fences(), 0);
        assert_eq!(device.live_semaphores(), 0);
        assert_eq!(device.live_command_buffers(), 0);
        assert_eq!(device.live_descriptor_pools(), 0);
    }
}
