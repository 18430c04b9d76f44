//! Frame-in-flight GPU resource layer for the Cadence engine.
//!
//! This crate provides:
//! - The [`GpuDevice`] seam and its `ash` implementation, [`GpuContext`]
//! - Memory allocation via gpu-allocator
//! - Frame slots, per-slot command buffers and synchronization
//! - A grow-only staging buffer for uploads
//! - Grow-only descriptor set pools

pub mod command;
pub mod context;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod frame;
pub mod frame_context;
pub mod memory;
pub mod staging;
pub mod sync;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use command::{CommandDispatcher, LayoutTransition};
pub use context::GpuContext;
pub use descriptors::{
    BindingSetAllocation, DescriptorSetLayoutBuilder, ResourceBindingPoolAllocator,
    BINDING_POOL_CAPACITY,
};
pub use device::{GpuDevice, IndexedDraw, QueueSubmit};
pub use error::{GpuError, Result};
pub use frame::FrameClock;
pub use frame_context::{ActiveFrame, FrameContext};
pub use memory::{GpuAllocator, GpuBuffer, GpuImage};
pub use staging::{StagingTransferBuffer, DEFAULT_STAGING_CAPACITY};
pub use sync::{CurrentFrameSync, FrameSync, FrameSyncTable};
