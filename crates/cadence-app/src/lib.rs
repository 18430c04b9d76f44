//! Frame loop orchestration for the Cadence engine.
//!
//! This crate ties the GPU frame resources, the scene and the materials
//! together behind a [`Renderer`]:
//! - Per-frame wait, acquire, record, submit and present
//! - Per-slot camera uniforms written after each acquire
//! - Render passes recorded in registration order
//! - Configuration and log setup
//!
//! # Example
//!
//! ```no_run
//! use ash::vk;
//! use cadence_app::{
//!     init_logging, FrameOutcome, GlobalUniforms, GpuDevice, Presenter, Renderer,
//!     RendererConfig, ScenePass,
//! };
//! use glam::{Mat4, Vec3};
//!
//! fn run<P: Presenter>(
//!     device: &dyn GpuDevice,
//!     presenter: P,
//!     pipeline: vk::Pipeline,
//!     layout: vk::PipelineLayout,
//! ) -> anyhow::Result<P> {
//!     let config = RendererConfig::default().with_frames_in_flight(2);
//!     init_logging(&config.log_filter);
//!
//!     let mut renderer = Renderer::new(device, presenter, &config)?;
//!     renderer.set_globals(GlobalUniforms::perspective(
//!         Mat4::look_at_rh(Vec3::new(0.0, 1.0, 4.0), Vec3::ZERO, Vec3::Y),
//!         std::f32::consts::FRAC_PI_2,
//!         16.0 / 9.0,
//!         0.01,
//!         1000.0,
//!     ));
//!     renderer.add_point_light("key", Vec3::new(2.0, 4.0, 2.0), Vec3::ONE)?;
//!     renderer.add_pass(Box::new(ScenePass::new(pipeline, layout)));
//!     for _ in 0..100 {
//!         if renderer.draw_frame(device)? == FrameOutcome::Skipped {
//!             // Recreate the swapchain here.
//!         }
//!     }
//!     renderer.shutdown(device)
//! }
//! ```

mod config;
mod logging;
mod pass;
mod presenter;
mod renderer;

pub use config::RendererConfig;
pub use logging::init_logging;
pub use pass::{PassContext, RenderPass, ScenePass};
pub use presenter::Presenter;
pub use renderer::{FrameOutcome, Renderer};

// Re-export commonly used types for convenience
pub use cadence_gpu::{ActiveFrame, GpuContext, GpuDevice};
pub use cadence_scene::{GlobalUniforms, InstanceHandle, LightHandle, MaterialParams, Scene};
