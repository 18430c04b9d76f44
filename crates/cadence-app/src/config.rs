//! Renderer configuration.

use cadence_gpu::DEFAULT_STAGING_CAPACITY;
use cadence_scene::{BatchLimits, DEFAULT_MAX_MATERIALS, DEFAULT_MAX_POINT_LIGHTS};

/// Renderer configuration.
#[derive(Clone, Debug)]
pub struct RendererConfig {
    /// Frames recorded ahead of the GPU. `None` uses the presenter's image count.
    pub frames_in_flight: Option<usize>,
    /// Initial staging buffer size in bytes. Zero defers allocation to the first upload.
    pub staging_capacity: u64,
    /// Default sizes of new geometry batches.
    pub batch_limits: BatchLimits,
    /// Maximum number of materials, including the default one.
    pub max_materials: u32,
    /// Capacity of each frame slot's point light buffer.
    pub max_point_lights: usize,
    /// Log filter used when `RUST_LOG` is not set.
    pub log_filter: String,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: None,
            staging_capacity: DEFAULT_STAGING_CAPACITY,
            batch_limits: BatchLimits::default(),
            max_materials: DEFAULT_MAX_MATERIALS,
            max_point_lights: DEFAULT_MAX_POINT_LIGHTS,
            log_filter: "info".to_string(),
        }
    }
}

impl RendererConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = Some(frames);
        self
    }

    #[must_use]
    pub const fn with_staging_capacity(mut self, bytes: u64) -> Self {
        self.staging_capacity = bytes;
        self
    }

    #[must_use]
    pub const fn with_batch_limits(mut self, limits: BatchLimits) -> Self {
        self.batch_limits = limits;
        self
    }

    #[must_use]
    pub const fn with_max_materials(mut self, max: u32) -> Self {
        self.max_materials = max;
        self
    }

    #[must_use]
    pub const fn with_max_point_lights(mut self, max: usize) -> Self {
        self.max_point_lights = max;
        self
    }

    #[must_use]
    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    /// Frames in flight for a presenter with `image_count` images.
    pub fn resolve_frames_in_flight(&self, image_count: usize) -> usize {
        self.frames_in_flight.unwrap_or(image_count).max(1)
    }
}
