//! Frame-in-flight orchestration state.
//!
//! [`FrameContext`] owns the frame clock, the command dispatcher, the sync
//! table and the staging buffer. Components that record GPU work receive it
//! (or an [`ActiveFrame`]) by reference.

use crate::command::{self, CommandDispatcher, LayoutTransition};
use crate::device::GpuDevice;
use crate::error::Result;
use crate::frame::FrameClock;
use crate::memory::{check_range, GpuBuffer, GpuImage};
use crate::staging::StagingTransferBuffer;
use crate::sync::{CurrentFrameSync, FrameSyncTable};
use ash::vk;

/// A frame being recorded.
///
/// Only [`FrameContext::begin_frame`] creates one, after the slot's
/// completion signal was observed. Holding it means the slot's resources
/// may be written.
#[derive(Debug)]
pub struct ActiveFrame {
    slot: usize,
    frames_in_flight: usize,
    command_buffer: vk::CommandBuffer,
    sync: CurrentFrameSync,
}

impl ActiveFrame {
    pub const fn slot(&self) -> usize {
        self.slot
    }

    pub const fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    /// The slot's persistent command buffer, in the recording state.
    pub const fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    pub const fn sync(&self) -> &CurrentFrameSync {
        &self.sync
    }
}

/// Owner of all per-slot frame resources.
pub struct FrameContext {
    clock: FrameClock,
    commands: CommandDispatcher,
    sync: FrameSyncTable,
    staging: StagingTransferBuffer,
}

impl FrameContext {
    pub fn new(
        device: &dyn GpuDevice,
        frames_in_flight: usize,
        staging_capacity: u64,
    ) -> Result<Self> {
        let clock = FrameClock::new(frames_in_flight);
        let frames_in_flight = clock.frames_in_flight();

        let mut commands = CommandDispatcher::new(device, frames_in_flight)?;
        let mut sync = match FrameSyncTable::new(device, frames_in_flight) {
            Ok(sync) => sync,
            Err(e) => {
                commands.destroy(device);
                return Err(e);
            }
        };
        let staging = match StagingTransferBuffer::new(device, staging_capacity) {
            Ok(staging) => staging,
            Err(e) => {
                sync.destroy(device);
                commands.destroy(device);
                return Err(e);
            }
        };

        tracing::info!("Frame context created ({frames_in_flight} frames in flight)");

        Ok(Self {
            clock,
            commands,
            sync,
            staging,
        })
    }

    pub const fn clock(&self) -> &FrameClock {
        &self.clock
    }

    pub const fn frames_in_flight(&self) -> usize {
        self.clock.frames_in_flight()
    }

    pub const fn current_slot(&self) -> usize {
        self.clock.current_slot()
    }

    pub const fn frame_number(&self) -> u64 {
        self.clock.frame_number()
    }

    pub const fn commands(&self) -> &CommandDispatcher {
        &self.commands
    }

    pub const fn sync_table(&self) -> &FrameSyncTable {
        &self.sync
    }

    pub const fn staging(&self) -> &StagingTransferBuffer {
        &self.staging
    }

    /// Wait for the current slot to be free, then start recording into it.
    pub fn begin_frame(&mut self, device: &dyn GpuDevice) -> Result<ActiveFrame> {
        let sync = self.sync.current_frame_sync(&self.clock)?;
        let slot = sync.slot;

        self.sync.wait(device, slot)?;
        self.commands.retire_transients(device, slot);
        let command_buffer = self.commands.begin_frame(device, slot)?;

        Ok(ActiveFrame {
            slot,
            frames_in_flight: self.clock.frames_in_flight(),
            command_buffer,
            sync,
        })
    }

    /// Finish recording the frame's command buffer.
    pub fn end_frame(&mut self, device: &dyn GpuDevice, frame: &ActiveFrame) -> Result<()> {
        self.commands.end_frame(device, frame.slot)?;
        Ok(())
    }

    /// Submit the frame: wait on image acquisition, signal render completion
    /// and the slot's fence.
    ///
    /// If the submission fails the slot gets a new signaled fence, so later
    /// frames and [`wait_idle`](Self::wait_idle) do not block on it. The
    /// acquire signal is still pending; see [`release_frame`](Self::release_frame).
    pub fn submit_frame(&mut self, device: &dyn GpuDevice, frame: &ActiveFrame) -> Result<()> {
        let sync = &frame.sync;
        self.sync.reset(device, frame.slot)?;
        let submitted = self.commands.submit(
            device,
            &[frame.command_buffer],
            &sync.wait_signals,
            &sync.wait_stages,
            &sync.signal_signals,
            Some(sync.completion_signal),
        );
        if let Err(e) = submitted {
            tracing::warn!("Frame submit on slot {} failed: {e}", frame.slot);
            self.restore_fence(device, frame.slot);
            return Err(e);
        }
        Ok(())
    }

    fn restore_fence(&mut self, device: &dyn GpuDevice, slot: usize) {
        if let Err(e) = self.sync.restore_fence(device, slot) {
            tracing::error!("Failed to restore fence of slot {slot}: {e}");
        }
    }

    /// Drop a frame without submitting it.
    ///
    /// The slot's fence stays signaled, so the next `begin_frame` on the
    /// slot does not block.
    pub fn abandon_frame(&mut self, device: &dyn GpuDevice, frame: ActiveFrame) -> Result<()> {
        tracing::debug!("Frame on slot {} abandoned", frame.slot);
        self.commands.end_frame(device, frame.slot)?;
        Ok(())
    }

    /// Drop a frame whose image was acquired but which will not be
    /// submitted.
    ///
    /// Submits an empty batch that waits on the slot's acquire signal and
    /// signals the slot's fence, leaving the semaphore unsignaled for the
    /// next acquire. If that submission fails as well, the fence is
    /// restored but the semaphore stays signaled; the device should be
    /// considered lost.
    pub fn release_frame(&mut self, device: &dyn GpuDevice, frame: ActiveFrame) -> Result<()> {
        let slot = frame.slot;
        // A failed submit may have replaced the fence the frame carries.
        let sync = *self.sync.slot(slot)?;
        tracing::debug!("Releasing acquired image of slot {slot}");

        self.sync.reset(device, slot)?;
        let released = self.commands.submit(
            device,
            &[],
            &[sync.image_available],
            &frame.sync.wait_stages,
            &[],
            Some(sync.in_flight),
        );
        if let Err(e) = released {
            tracing::error!("Failed to release acquire signal of slot {slot}: {e}");
            self.restore_fence(device, slot);
            return Err(e);
        }
        Ok(())
    }

    /// Move to the next slot.
    pub fn advance(&mut self) {
        self.clock.advance();
    }

    /// Copy `bytes` into `dst` at `dst_offset` and wait for the copy.
    pub fn upload_to_buffer(
        &mut self,
        device: &dyn GpuDevice,
        bytes: &[u8],
        dst: &GpuBuffer,
        dst_offset: u64,
    ) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        check_range(dst.size, dst_offset, bytes.len() as u64)?;

        self.staging.upload(device, bytes)?;
        let staging = &self.staging;
        self.commands
            .run_transient(device, |cmd| staging.copy_to(device, cmd, dst, dst_offset))
    }

    /// Copy texels into `image` and leave it in `final_layout`.
    ///
    /// `bytes` must hold every texel of the extent for each layer in
    /// `subresource`.
    pub fn upload_to_image(
        &mut self,
        device: &dyn GpuDevice,
        bytes: &[u8],
        image: &GpuImage,
        final_layout: vk::ImageLayout,
        subresource: vk::ImageSubresourceLayers,
    ) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        image.check_copy_source(bytes.len() as u64, subresource.layer_count)?;

        let range = vk::ImageSubresourceRange::default()
            .aspect_mask(subresource.aspect_mask)
            .base_mip_level(subresource.mip_level)
            .level_count(1)
            .base_array_layer(subresource.base_array_layer)
            .layer_count(subresource.layer_count);

        self.staging.upload(device, bytes)?;
        let staging = &self.staging;
        self.commands.run_transient(device, |cmd| {
            command::transition_image_layout(
                device,
                cmd,
                image,
                &LayoutTransition::to_transfer_dst(range),
            );
            staging.copy_to_image(
                device,
                cmd,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                subresource,
            )?;
            command::transition_image_layout(
                device,
                cmd,
                image,
                &LayoutTransition::from_transfer_dst(final_layout, range),
            );
            Ok(())
        })
    }

    /// Block until every slot's last frame completed.
    pub fn wait_idle(&self, device: &dyn GpuDevice) -> Result<()> {
        self.sync.wait_all(device)
    }

    /// Destroy all frame resources. The GPU must be idle.
    pub fn destroy(&mut self, device: &dyn GpuDevice) -> Result<()> {
        self.commands.destroy(device);
        self.sync.destroy(device);
        self.staging.destroy(device)?;
        tracing::info!("Frame context destroyed");
        Ok(())
    }
}
