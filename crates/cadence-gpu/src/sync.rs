//! Per-slot synchronization primitives.

use crate::device::GpuDevice;
use crate::error::{GpuError, Result};
use crate::frame::FrameClock;
use ash::vk;

/// Synchronization objects owned by one frame slot.
#[derive(Clone, Copy, Debug)]
pub struct FrameSync {
    /// Semaphore signaled when the swapchain image is available
    pub image_available: vk::Semaphore,
    /// Semaphore signaled when rendering is complete
    pub render_finished: vk::Semaphore,
    /// Fence signaled when the slot's last submission completed
    pub in_flight: vk::Fence,
}

impl FrameSync {
    /// Create the slot's objects. The fence starts signaled so the first
    /// frame does not block.
    pub fn new(device: &dyn GpuDevice) -> Result<Self> {
        let image_available = device.create_semaphore()?;
        let render_finished = device.create_semaphore()?;
        let in_flight = device.create_fence(true)?;
        Ok(Self {
            image_available,
            render_finished,
            in_flight,
        })
    }

    /// Destroy synchronization resources.
    ///
    /// The objects must not be in use by the GPU.
    pub fn destroy(&self, device: &dyn GpuDevice) {
        device.destroy_semaphore(self.image_available);
        device.destroy_semaphore(self.render_finished);
        device.destroy_fence(self.in_flight);
    }
}

/// What the frame loop needs to synchronize the current slot.
///
/// The wait and signal lists are laid out for direct use in queue submission
/// and presentation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CurrentFrameSync {
    pub slot: usize,
    pub completion_signal: vk::Fence,
    pub acquire_signal: vk::Semaphore,
    pub wait_signals: [vk::Semaphore; 1],
    pub wait_stages: [vk::PipelineStageFlags; 1],
    pub signal_signals: [vk::Semaphore; 1],
}

impl CurrentFrameSync {
    /// Semaphores presentation waits on.
    pub fn present_wait(&self) -> &[vk::Semaphore] {
        &self.signal_signals
    }
}

/// Synchronization objects for every frame slot.
pub struct FrameSyncTable {
    frame_syncs: Vec<FrameSync>,
}

impl FrameSyncTable {
    /// Create the objects for `frames_in_flight` slots.
    pub fn new(device: &dyn GpuDevice, frames_in_flight: usize) -> Result<Self> {
        let mut table = Self {
            frame_syncs: Vec::with_capacity(frames_in_flight),
        };
        for _ in 0..frames_in_flight {
            match FrameSync::new(device) {
                Ok(sync) => table.frame_syncs.push(sync),
                Err(e) => {
                    table.destroy(device);
                    return Err(e);
                }
            }
        }

        tracing::debug!("Created sync objects for {frames_in_flight} frames in flight");
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.frame_syncs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame_syncs.is_empty()
    }

    /// Objects owned by `slot`.
    pub fn slot(&self, slot: usize) -> Result<&FrameSync> {
        self.frame_syncs.get(slot).ok_or_else(|| self.out_of_range(slot))
    }

    fn out_of_range(&self, slot: usize) -> GpuError {
        GpuError::InvalidState(format!(
            "Frame slot {slot} out of range (0..{})",
            self.frame_syncs.len()
        ))
    }

    /// Bundle for the clock's current slot: wait on image acquisition before
    /// color output, signal render completion for presentation.
    pub fn current_frame_sync(&self, clock: &FrameClock) -> Result<CurrentFrameSync> {
        let slot = clock.current_slot();
        let sync = self.slot(slot)?;
        Ok(CurrentFrameSync {
            slot,
            completion_signal: sync.in_flight,
            acquire_signal: sync.image_available,
            wait_signals: [sync.image_available],
            wait_stages: [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
            signal_signals: [sync.render_finished],
        })
    }

    /// Block until the slot's previous submission completed.
    pub fn wait(&self, device: &dyn GpuDevice, slot: usize) -> Result<()> {
        device.wait_for_fence(self.slot(slot)?.in_flight, u64::MAX)
    }

    /// Reset the slot's fence ahead of its next submission.
    pub fn reset(&self, device: &dyn GpuDevice, slot: usize) -> Result<()> {
        device.reset_fence(self.slot(slot)?.in_flight)
    }

    /// Replace the slot's fence with a new, signaled one.
    ///
    /// For a fence that was reset but whose submission failed: no pending
    /// work will ever signal it.
    pub fn restore_fence(&mut self, device: &dyn GpuDevice, slot: usize) -> Result<()> {
        if slot >= self.frame_syncs.len() {
            return Err(self.out_of_range(slot));
        }
        let fence = device.create_fence(true)?;
        let old = std::mem::replace(&mut self.frame_syncs[slot].in_flight, fence);
        device.destroy_fence(old);
        tracing::debug!("Replaced fence of frame slot {slot}");
        Ok(())
    }

    /// Block until every slot's last submission completed.
    pub fn wait_all(&self, device: &dyn GpuDevice) -> Result<()> {
        for sync in &self.frame_syncs {
            device.wait_for_fence(sync.in_flight, u64::MAX)?;
        }
        Ok(())
    }

    /// Destroy all resources.
    ///
    /// None of them may be in use by the GPU.
    pub fn destroy(&mut self, device: &dyn GpuDevice) {
        for sync in self.frame_syncs.drain(..) {
            sync.destroy(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingDevice;

    #[test]
    fn fences_start_signaled() {
        let device = RecordingDevice::new();
        let table = FrameSyncTable::new(&device, 3).unwrap();
        for slot in 0..3 {
            let fence = table.slot(slot).unwrap().in_flight;
            assert_eq!(device.is_fence_signaled(fence), Some(true));
            table.wait(&device, slot).unwrap();
        }
    }

    #[test]
    fn bundle_follows_clock() {
        let device = RecordingDevice::new();
        let table = FrameSyncTable::new(&device, 2).unwrap();
        let mut clock = FrameClock::new(2);

        let first = table.current_frame_sync(&clock).unwrap();
        clock.advance();
        let second = table.current_frame_sync(&clock).unwrap();

        assert_eq!(first.slot, 0);
        assert_eq!(second.slot, 1);
        assert_ne!(first.completion_signal, second.completion_signal);
        assert_eq!(first.wait_signals, [first.acquire_signal]);
        assert_eq!(
            first.wait_stages,
            [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT]
        );
        assert_eq!(first.present_wait(), &[table.slot(0).unwrap().render_finished]);
    }

    #[test]
    fn reset_fence_blocks_until_signaled() {
        let device = RecordingDevice::new();
        let table = FrameSyncTable::new(&device, 1).unwrap();
        table.reset(&device, 0).unwrap();
        assert!(table.wait(&device, 0).is_err());
    }

    #[test]
    fn restored_fence_no_longer_blocks() {
        let device = RecordingDevice::new();
        let mut table = FrameSyncTable::new(&device, 2).unwrap();
        let old = table.slot(1).unwrap().in_flight;
        table.reset(&device, 1).unwrap();
        assert!(table.wait_all(&device).is_err());

        table.restore_fence(&device, 1).unwrap();
        let new = table.slot(1).unwrap().in_flight;
        assert_ne!(old, new);
        assert_eq!(device.is_fence_signaled(old), None);
        assert!(table.wait_all(&device).is_ok());
        assert_eq!(device.live_fences(), 2);
        assert!(table.restore_fence(&device, 2).is_err());
        assert_eq!(device.live_fences(), 2);
    }

    #[test]
    fn destroy_releases_everything() {
        let device = RecordingDevice::new();
        let mut table = FrameSyncTable::new(&device, 3).unwrap();
        assert_eq!(device.live_fences(), 3);
        assert_eq!(device.live_semaphores(), 6);

        table.destroy(&device);
        assert_eq!(device.live_fences(), 0);
        assert_eq!(device.live_semaphores(), 0);
        assert!(table.is_empty());
    }
}
