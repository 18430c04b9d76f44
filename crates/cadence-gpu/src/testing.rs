//! In-memory [`GpuDevice`] for tests.
//!
//! [`RecordingDevice`] hands out synthetic handles, keeps buffer contents in
//! host memory and logs every call as a [`DeviceCall`]. Queue submissions
//! complete immediately: recorded buffer copies are applied and the fence is
//! signaled before `queue_submit` returns.

use crate::device::{GpuDevice, IndexedDraw, QueueSubmit};
use crate::error::{GpuError, Result};
use crate::memory::{check_range, GpuBuffer};
use ash::vk::{self, Handle};
use gpu_allocator::MemoryLocation;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;

/// A device call observed by [`RecordingDevice`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceCall {
    CreateFence { fence: vk::Fence, signaled: bool },
    DestroyFence(vk::Fence),
    WaitForFence(vk::Fence),
    ResetFence(vk::Fence),
    CreateSemaphore(vk::Semaphore),
    DestroySemaphore(vk::Semaphore),
    CreateCommandPool(vk::CommandPool),
    DestroyCommandPool(vk::CommandPool),
    AllocateCommandBuffers(Vec<vk::CommandBuffer>),
    FreeCommandBuffers(Vec<vk::CommandBuffer>),
    ResetCommandBuffer(vk::CommandBuffer),
    BeginCommandBuffer {
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    },
    EndCommandBuffer(vk::CommandBuffer),
    Submit {
        command_buffers: Vec<vk::CommandBuffer>,
        wait_semaphores: Vec<vk::Semaphore>,
        wait_stages: Vec<vk::PipelineStageFlags>,
        signal_semaphores: Vec<vk::Semaphore>,
        fence: Option<vk::Fence>,
    },
    CopyBuffer {
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        /// `(src_offset, dst_offset, size)` per region.
        regions: Vec<(u64, u64, u64)>,
    },
    CopyBufferToImage {
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
    },
    PipelineBarrier {
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        /// `(image, old_layout, new_layout)` per image barrier.
        image_transitions: Vec<(vk::Image, vk::ImageLayout, vk::ImageLayout)>,
    },
    BindPipeline {
        cmd: vk::CommandBuffer,
        pipeline: vk::Pipeline,
    },
    BindVertexBuffer {
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
    },
    BindIndexBuffer {
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
    },
    BindDescriptorSet {
        cmd: vk::CommandBuffer,
        set_index: u32,
        set: vk::DescriptorSet,
    },
    DrawIndexed {
        cmd: vk::CommandBuffer,
        draw: IndexedDraw,
    },
    CreateBuffer {
        buffer: vk::Buffer,
        size: u64,
        location: MemoryLocation,
    },
    FreeBuffer(vk::Buffer),
    WriteBuffer {
        buffer: vk::Buffer,
        offset: u64,
        len: u64,
    },
    CreateDescriptorSetLayout(vk::DescriptorSetLayout),
    DestroyDescriptorSetLayout(vk::DescriptorSetLayout),
    CreateDescriptorPool {
        pool: vk::DescriptorPool,
        max_sets: u32,
    },
    DestroyDescriptorPool(vk::DescriptorPool),
    AllocateDescriptorSets {
        pool: vk::DescriptorPool,
        sets: Vec<vk::DescriptorSet>,
    },
    WriteBufferDescriptor {
        set: vk::DescriptorSet,
        binding: u32,
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    WriteImageDescriptor {
        set: vk::DescriptorSet,
        binding: u32,
    },
}

struct BufferMemory {
    host_visible: bool,
    bytes: Vec<u8>,
}

struct PendingCopy {
    src: vk::Buffer,
    dst: vk::Buffer,
    region: vk::BufferCopy,
}

struct DescriptorPoolState {
    max_sets: u32,
    allocated: u32,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    calls: Vec<DeviceCall>,
    fences: HashMap<vk::Fence, bool>,
    semaphores: HashSet<vk::Semaphore>,
    command_pools: HashSet<vk::CommandPool>,
    command_buffers: HashSet<vk::CommandBuffer>,
    pending_copies: HashMap<vk::CommandBuffer, Vec<PendingCopy>>,
    buffers: HashMap<vk::Buffer, BufferMemory>,
    set_layouts: HashSet<vk::DescriptorSetLayout>,
    descriptor_pools: HashMap<vk::DescriptorPool, DescriptorPoolState>,
    fail_submits: bool,
}

impl State {
    fn next<H: Handle>(&mut self) -> H {
        self.next_handle += 1;
        H::from_raw(self.next_handle)
    }
}

/// In-memory device that records every call.
pub struct RecordingDevice {
    min_uniform_offset_alignment: u64,
    state: Mutex<State>,
}

impl RecordingDevice {
    /// Create a device with a 256-byte uniform offset alignment.
    pub fn new() -> Self {
        Self::with_uniform_alignment(256)
    }

    /// Create a device reporting the given uniform offset alignment.
    pub fn with_uniform_alignment(alignment: u64) -> Self {
        Self {
            min_uniform_offset_alignment: alignment,
            state: Mutex::new(State::default()),
        }
    }

    /// Every call observed so far, in order.
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.state.lock().calls.clone()
    }

    /// Forget the calls observed so far.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Make every following `queue_submit` fail with `ERROR_DEVICE_LOST`.
    pub fn fail_submits(&self, fail: bool) {
        self.state.lock().fail_submits = fail;
    }

    /// Current contents of a live buffer.
    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.state
            .lock()
            .buffers
            .get(&buffer)
            .map(|memory| memory.bytes.clone())
    }

    /// Whether a live fence is signaled.
    pub fn is_fence_signaled(&self, fence: vk::Fence) -> Option<bool> {
        self.state.lock().fences.get(&fence).copied()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_fences(&self) -> usize {
        self.state.lock().fences.len()
    }

    pub fn live_semaphores(&self) -> usize {
        self.state.lock().semaphores.len()
    }

    pub fn live_command_buffers(&self) -> usize {
        self.state.lock().command_buffers.len()
    }

    pub fn live_descriptor_pools(&self) -> usize {
        self.state.lock().descriptor_pools.len()
    }
}

impl Default for RecordingDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for RecordingDevice {
    fn min_uniform_buffer_offset_alignment(&self) -> u64 {
        self.min_uniform_offset_alignment
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let mut state = self.state.lock();
        let fence = state.next();
        state.fences.insert(fence, signaled);
        state.calls.push(DeviceCall::CreateFence { fence, signaled });
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        state.fences.remove(&fence);
        state.calls.push(DeviceCall::DestroyFence(fence));
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::WaitForFence(fence));
        match state.fences.get(&fence) {
            Some(true) => Ok(()),
            Some(false) => Err(GpuError::Vulkan(vk::Result::TIMEOUT)),
            None => Err(GpuError::InvalidState(format!("Unknown fence {fence:?}"))),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::ResetFence(fence));
        let signaled = state
            .fences
            .get_mut(&fence)
            .ok_or_else(|| GpuError::InvalidState(format!("Unknown fence {fence:?}")))?;
        *signaled = false;
        Ok(())
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let mut state = self.state.lock();
        let semaphore = state.next();
        state.semaphores.insert(semaphore);
        state.calls.push(DeviceCall::CreateSemaphore(semaphore));
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        state.semaphores.remove(&semaphore);
        state.calls.push(DeviceCall::DestroySemaphore(semaphore));
    }

    fn create_command_pool(&self, _flags: vk::CommandPoolCreateFlags) -> Result<vk::CommandPool> {
        let mut state = self.state.lock();
        let pool = state.next();
        state.command_pools.insert(pool);
        state.calls.push(DeviceCall::CreateCommandPool(pool));
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        state.command_pools.remove(&pool);
        state.calls.push(DeviceCall::DestroyCommandPool(pool));
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        if !state.command_pools.contains(&pool) {
            return Err(GpuError::InvalidState(format!("Unknown command pool {pool:?}")));
        }
        let buffers: Vec<vk::CommandBuffer> = (0..count).map(|_| state.next()).collect();
        state.command_buffers.extend(buffers.iter().copied());
        state
            .calls
            .push(DeviceCall::AllocateCommandBuffers(buffers.clone()));
        Ok(buffers)
    }

    fn free_command_buffers(&self, _pool: vk::CommandPool, command_buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.lock();
        for cmd in command_buffers {
            state.command_buffers.remove(cmd);
            state.pending_copies.remove(cmd);
        }
        state
            .calls
            .push(DeviceCall::FreeCommandBuffers(command_buffers.to_vec()));
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        state.pending_copies.remove(&cmd);
        state.calls.push(DeviceCall::ResetCommandBuffer(cmd));
        Ok(())
    }

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if !state.command_buffers.contains(&cmd) {
            return Err(GpuError::InvalidState(format!("Unknown command buffer {cmd:?}")));
        }
        state.calls.push(DeviceCall::BeginCommandBuffer { cmd, flags });
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        self.state.lock().calls.push(DeviceCall::EndCommandBuffer(cmd));
        Ok(())
    }

    fn queue_submit(&self, submit: &QueueSubmit<'_>) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::Submit {
            command_buffers: submit.command_buffers.to_vec(),
            wait_semaphores: submit.wait_semaphores.to_vec(),
            wait_stages: submit.wait_stages.to_vec(),
            signal_semaphores: submit.signal_semaphores.to_vec(),
            fence: submit.fence,
        });

        if state.fail_submits {
            return Err(GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST));
        }

        for cmd in submit.command_buffers {
            let copies = state.pending_copies.remove(cmd).unwrap_or_default();
            for copy in copies {
                let src = state
                    .buffers
                    .get(&copy.src)
                    .ok_or_else(|| GpuError::InvalidState("Copy from freed buffer".to_string()))?;
                let start = copy.region.src_offset as usize;
                let bytes = src.bytes[start..start + copy.region.size as usize].to_vec();
                let dst = state
                    .buffers
                    .get_mut(&copy.dst)
                    .ok_or_else(|| GpuError::InvalidState("Copy into freed buffer".to_string()))?;
                let start = copy.region.dst_offset as usize;
                dst.bytes[start..start + bytes.len()].copy_from_slice(&bytes);
            }
        }

        if let Some(fence) = submit.fence {
            state.fences.insert(fence, true);
        }
        Ok(())
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::CopyBuffer {
            cmd,
            src,
            dst,
            regions: regions
                .iter()
                .map(|r| (r.src_offset, r.dst_offset, r.size))
                .collect(),
        });
        let pending = state.pending_copies.entry(cmd).or_default();
        pending.extend(regions.iter().map(|&region| PendingCopy { src, dst, region }));
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        _regions: &[vk::BufferImageCopy],
    ) {
        self.state.lock().calls.push(DeviceCall::CopyBufferToImage {
            cmd,
            src,
            dst,
            layout: dst_layout,
        });
    }

    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        _memory_barriers: &[vk::MemoryBarrier<'_>],
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        self.state.lock().calls.push(DeviceCall::PipelineBarrier {
            cmd,
            src_stage,
            dst_stage,
            image_transitions: image_barriers
                .iter()
                .map(|b| (b.image, b.old_layout, b.new_layout))
                .collect(),
        });
    }

    fn cmd_bind_pipeline(
        &self,
        cmd: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        self.state
            .lock()
            .calls
            .push(DeviceCall::BindPipeline { cmd, pipeline });
    }

    fn cmd_bind_vertex_buffer(&self, cmd: vk::CommandBuffer, buffer: vk::Buffer, _offset: u64) {
        self.state
            .lock()
            .calls
            .push(DeviceCall::BindVertexBuffer { cmd, buffer });
    }

    fn cmd_bind_index_buffer(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        _offset: u64,
        _index_type: vk::IndexType,
    ) {
        self.state
            .lock()
            .calls
            .push(DeviceCall::BindIndexBuffer { cmd, buffer });
    }

    fn cmd_bind_descriptor_set(
        &self,
        cmd: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        set_index: u32,
        set: vk::DescriptorSet,
    ) {
        self.state.lock().calls.push(DeviceCall::BindDescriptorSet {
            cmd,
            set_index,
            set,
        });
    }

    fn cmd_draw_indexed(&self, cmd: vk::CommandBuffer, draw: &IndexedDraw) {
        self.state
            .lock()
            .calls
            .push(DeviceCall::DrawIndexed { cmd, draw: *draw });
    }

    fn create_buffer(
        &self,
        size: u64,
        _usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer> {
        if size == 0 {
            return Err(GpuError::InvalidState(format!(
                "Buffer '{name}' requested with zero size"
            )));
        }

        let mut state = self.state.lock();
        let buffer = state.next();
        let gpu_buffer = GpuBuffer {
            buffer,
            allocation: None,
            size,
            location,
        };
        state.buffers.insert(
            buffer,
            BufferMemory {
                host_visible: gpu_buffer.is_host_visible(),
                bytes: vec![0; size as usize],
            },
        );
        state.calls.push(DeviceCall::CreateBuffer {
            buffer,
            size,
            location,
        });
        Ok(gpu_buffer)
    }

    fn free_buffer(&self, buffer: &mut GpuBuffer) -> Result<()> {
        let mut state = self.state.lock();
        if buffer.buffer != vk::Buffer::null() {
            state.buffers.remove(&buffer.buffer);
            state.calls.push(DeviceCall::FreeBuffer(buffer.buffer));
        }
        buffer.buffer = vk::Buffer::null();
        Ok(())
    }

    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let memory = state
            .buffers
            .get_mut(&buffer.buffer)
            .ok_or_else(|| GpuError::InvalidState("Write to freed buffer".to_string()))?;
        if !memory.host_visible {
            return Err(GpuError::InvalidState("Buffer not mapped".to_string()));
        }
        check_range(memory.bytes.len() as u64, offset, data.len() as u64)?;
        let start = offset as usize;
        memory.bytes[start..start + data.len()].copy_from_slice(data);
        state.calls.push(DeviceCall::WriteBuffer {
            buffer: buffer.buffer,
            offset,
            len: data.len() as u64,
        });
        Ok(())
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[vk::DescriptorSetLayoutBinding<'_>],
        _binding_flags: &[vk::DescriptorBindingFlags],
    ) -> Result<vk::DescriptorSetLayout> {
        let mut state = self.state.lock();
        let layout = state.next();
        state.set_layouts.insert(layout);
        state.calls.push(DeviceCall::CreateDescriptorSetLayout(layout));
        Ok(layout)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        let mut state = self.state.lock();
        state.set_layouts.remove(&layout);
        state.calls.push(DeviceCall::DestroyDescriptorSetLayout(layout));
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        _pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool> {
        let mut state = self.state.lock();
        let pool = state.next();
        state.descriptor_pools.insert(
            pool,
            DescriptorPoolState {
                max_sets,
                allocated: 0,
            },
        );
        state
            .calls
            .push(DeviceCall::CreateDescriptorPool { pool, max_sets });
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.state.lock();
        state.descriptor_pools.remove(&pool);
        state.calls.push(DeviceCall::DestroyDescriptorPool(pool));
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        let mut state = self.state.lock();
        let pool_state = state
            .descriptor_pools
            .get_mut(&pool)
            .ok_or_else(|| GpuError::InvalidState(format!("Unknown descriptor pool {pool:?}")))?;
        let requested = layouts.len() as u32;
        if pool_state.allocated + requested > pool_state.max_sets {
            return Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
        }
        pool_state.allocated += requested;

        let sets: Vec<vk::DescriptorSet> = layouts.iter().map(|_| state.next()).collect();
        state.calls.push(DeviceCall::AllocateDescriptorSets {
            pool,
            sets: sets.clone(),
        });
        Ok(sets)
    }

    fn write_buffer_descriptor(
        &self,
        set: vk::DescriptorSet,
        binding: u32,
        _descriptor_type: vk::DescriptorType,
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    ) {
        self.state.lock().calls.push(DeviceCall::WriteBufferDescriptor {
            set,
            binding,
            buffer,
            offset,
            range,
        });
    }

    fn write_image_descriptor(
        &self,
        set: vk::DescriptorSet,
        binding: u32,
        _image_info: vk::DescriptorImageInfo,
    ) {
        self.state
            .lock()
            .calls
            .push(DeviceCall::WriteImageDescriptor { set, binding });
    }
}
