//! Scene storage for the Cadence engine.
//!
//! This crate provides:
//! - Geometry batches packing many meshes into shared GPU buffers
//! - Instances with per-frame-slot transform tracking
//! - The material registry and its resource bindings
//! - Per-frame camera uniforms and point light storage

pub mod geometry_batch;
pub mod globals;
pub mod instance;
pub mod light;
pub mod material;
pub mod scene;

pub use geometry_batch::{
    BatchBudget, BatchLimits, BatchReservation, GeometryBatch, Rejection, MATERIAL_SET_INDEX,
    TRANSFORM_SET_INDEX,
};
pub use globals::{FrameGlobals, GlobalUniforms, GLOBAL_SET_INDEX};
pub use instance::Instance;
pub use light::{
    LightHandle, PointLight, PointLightData, PointLights, DEFAULT_LIGHT_RADIUS,
    DEFAULT_MAX_POINT_LIGHTS, LIGHT_SET_INDEX,
};
pub use material::{
    Material, MaterialParams, MaterialRegistry, MaterialTextures, MaterialUniforms, TextureMask,
    DEFAULT_MATERIAL_NAME, DEFAULT_MAX_MATERIALS,
};
pub use scene::{InstanceHandle, Scene};
