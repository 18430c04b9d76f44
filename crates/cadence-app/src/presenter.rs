//! Presentation seam.

use ash::vk;

/// Source of images to render into and sink for finished frames.
///
/// Usually a swapchain. Surface and swapchain management live with the
/// implementor.
pub trait Presenter {
    /// Number of images the presenter cycles through.
    fn image_count(&self) -> usize;

    /// Acquire the next image, signaling `signal` when it is ready.
    ///
    /// Returns `Ok(None)` when the presenter is out of date and the frame
    /// should be skipped; `signal` must then stay unsignaled.
    fn acquire_next_image(&mut self, signal: vk::Semaphore) -> anyhow::Result<Option<u32>>;

    /// Queue `image_index` for display once every semaphore in `wait` is signaled.
    fn present(&mut self, image_index: u32, wait: &[vk::Semaphore]) -> anyhow::Result<()>;
}
