//! Render passes run in registration order each frame.

use ash::vk;
use cadence_gpu::{ActiveFrame, GpuDevice};
use cadence_scene::{FrameGlobals, MaterialRegistry, Scene};

/// Everything a pass may touch while recording.
pub struct PassContext<'a> {
    pub device: &'a dyn GpuDevice,
    pub frame: &'a ActiveFrame,
    /// Presenter image the frame renders into.
    pub image_index: u32,
    /// Camera uniforms, already written for this frame's slot.
    pub globals: &'a FrameGlobals,
    pub scene: &'a mut Scene,
    pub materials: &'a MaterialRegistry,
}

/// One step of frame recording.
pub trait RenderPass {
    fn name(&self) -> &str;

    /// Record commands into `ctx.frame`'s command buffer.
    fn record(&mut self, ctx: &mut PassContext<'_>) -> anyhow::Result<()>;
}

/// Draws every scene instance with one graphics pipeline.
///
/// The pipeline and its layout are owned by the caller. The layout must
/// place the camera set at [`GLOBAL_SET_INDEX`](cadence_scene::GLOBAL_SET_INDEX),
/// the transform set at [`TRANSFORM_SET_INDEX`](cadence_scene::TRANSFORM_SET_INDEX),
/// the material set at [`MATERIAL_SET_INDEX`](cadence_scene::MATERIAL_SET_INDEX)
/// and the point light set at [`LIGHT_SET_INDEX`](cadence_scene::LIGHT_SET_INDEX).
pub struct ScenePass {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

impl ScenePass {
    pub const fn new(pipeline: vk::Pipeline, layout: vk::PipelineLayout) -> Self {
        Self { pipeline, layout }
    }
}

impl RenderPass for ScenePass {
    fn name(&self) -> &str {
        "scene"
    }

    fn record(&mut self, ctx: &mut PassContext<'_>) -> anyhow::Result<()> {
        ctx.device.cmd_bind_pipeline(
            ctx.frame.command_buffer(),
            vk::PipelineBindPoint::GRAPHICS,
            self.pipeline,
        );
        ctx.globals.bind(ctx.device, ctx.frame, self.layout)?;
        ctx.scene.draw(ctx.device, ctx.frame, self.layout, ctx.materials)?;
        Ok(())
    }
}
