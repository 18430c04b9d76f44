//! Core types, math, and error types for the Cadence engine.
//!
//! This crate holds the CPU-side data that the GPU layers consume:
//! - Vertex layout and mesh data
//! - Instance transform composition
//! - Common error types

pub mod error;
pub mod math;
pub mod types;

pub use error::{Error, Result};
pub use math::compose_transform;
pub use types::{MaterialId, Mesh, MeshFootprint, Vertex};
