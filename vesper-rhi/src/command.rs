//! Command buffer pool and recorder.

use ash::{vk, Device};
use vesper_core::collections::SmallVec;
use vesper_rhi_derive::DeviceObject;

use crate::device::Queue;
use crate::error::{Result, RhiError};
use crate::synchronization::Fence;
use crate::MAX_SWAPCHAIN_IMAGES;

/// Command buffer pool for allocating command buffers.
#[DeviceObject]
pub struct CommandPool {
    pool: vk::CommandPool,
}

impl CommandPool {
    pub fn new(device: &Device, queue_family: u32, flags: vk::CommandPoolCreateFlags) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = unsafe { device.create_command_pool(&create_info, None) }
            .map_err(RhiError::device("create_command_pool"))?;

        Ok(Self { pool, device: device.clone() })
    }

    pub fn allocate(&self, count: u32) -> Result<SmallVec<[vk::CommandBuffer; MAX_SWAPCHAIN_IMAGES]>> {
        if count == 0 {
            return Ok(SmallVec::new());
        }

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(RhiError::device("allocate_command_buffers"))?;
        Ok(buffers.into_iter().collect())
    }

    pub fn free(&self, buffers: &[vk::CommandBuffer]) {
        if !buffers.is_empty() {
            unsafe { self.device.free_command_buffers(self.pool, buffers) }
        }
    }

    pub fn reset(&self) -> Result<()> {
        unsafe { self.device.reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty()) }
            .map_err(RhiError::device("reset_command_pool"))
    }

    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_command_pool(self.pool, None);
        }
    }
}

/// Command encoder wrapping a command buffer with common graphics commands.
pub struct CommandEncoder<'a> {
    device: &'a Device,
    cmd: vk::CommandBuffer,
}

impl<'a> CommandEncoder<'a> {
    pub fn new(device: &'a Device, cmd: vk::CommandBuffer) -> Self {
        Self { device, cmd }
    }

    pub fn begin(&self, flags: vk::CommandBufferUsageFlags) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
        unsafe { self.device.begin_command_buffer(self.cmd, &begin_info) }
            .map_err(RhiError::device("begin_command_buffer"))
    }

    pub fn end(&self) -> Result<()> {
        unsafe { self.device.end_command_buffer(self.cmd) }.map_err(RhiError::device("end_command_buffer"))
    }

    pub fn reset(&self) -> Result<()> {
        unsafe { self.device.reset_command_buffer(self.cmd, vk::CommandBufferResetFlags::empty()) }
            .map_err(RhiError::device("reset_command_buffer"))
    }

    pub fn handle(&self) -> vk::CommandBuffer {
        self.cmd
    }

    // Render pass
    pub fn begin_render_pass(&self, info: &vk::RenderPassBeginInfo) {
        unsafe { self.device.cmd_begin_render_pass(self.cmd, info, vk::SubpassContents::INLINE) }
    }

    pub fn end_render_pass(&self) {
        unsafe { self.device.cmd_end_render_pass(self.cmd) }
    }

    // Pipeline commands
    pub fn bind_graphics_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.cmd_bind_pipeline(self.cmd, vk::PipelineBindPoint::GRAPHICS, pipeline) }
    }

    pub fn bind_graphics_descriptor_sets(&self, layout: vk::PipelineLayout, first_set: u32, descriptor_sets: &[vk::DescriptorSet]) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                self.cmd,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                first_set,
                descriptor_sets,
                &[],
            )
        }
    }

    // Vertex/Index buffer commands
    pub fn bind_vertex_buffers(&self, first_binding: u32, buffers: &[vk::Buffer], offsets: &[vk::DeviceSize]) {
        unsafe { self.device.cmd_bind_vertex_buffers(self.cmd, first_binding, buffers, offsets) }
    }

    pub fn bind_index_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, index_type: vk::IndexType) {
        unsafe { self.device.cmd_bind_index_buffer(self.cmd, buffer, offset, index_type) }
    }

    // Draw commands
    pub fn draw(&self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        unsafe { self.device.cmd_draw(self.cmd, vertex_count, instance_count, first_vertex, first_instance) }
    }

    pub fn draw_indexed(&self, index_count: u32, instance_count: u32, first_index: u32, vertex_offset: i32, first_instance: u32) {
        unsafe {
            self.device
                .cmd_draw_indexed(self.cmd, index_count, instance_count, first_index, vertex_offset, first_instance)
        }
    }

    // Dynamic state commands
    pub fn set_viewport(&self, first: u32, viewports: &[vk::Viewport]) {
        unsafe { self.device.cmd_set_viewport(self.cmd, first, viewports) }
    }

    pub fn set_scissor(&self, first: u32, scissors: &[vk::Rect2D]) {
        unsafe { self.device.cmd_set_scissor(self.cmd, first, scissors) }
    }

    pub fn buffer_barriers(&self, barriers: &[vk::BufferMemoryBarrier2]) {
        if barriers.is_empty() {
            return;
        }
        let dep = vk::DependencyInfo::default().buffer_memory_barriers(barriers);
        unsafe { self.device.cmd_pipeline_barrier2(self.cmd, &dep) }
    }

    pub fn image_barriers(&self, barriers: &[vk::ImageMemoryBarrier2]) {
        if barriers.is_empty() {
            return;
        }
        let dep = vk::DependencyInfo::default().image_memory_barriers(barriers);
        unsafe { self.device.cmd_pipeline_barrier2(self.cmd, &dep) }
    }

    // Copy commands
    pub fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        unsafe { self.device.cmd_copy_buffer(self.cmd, src, dst, regions) }
    }

    pub fn copy_buffer_to_image(&self, src: vk::Buffer, dst: vk::Image, layout: vk::ImageLayout, regions: &[vk::BufferImageCopy]) {
        unsafe { self.device.cmd_copy_buffer_to_image(self.cmd, src, dst, layout, regions) }
    }
}

/// An immediate encoder that can submit commands to a queue at any time and
/// block on a fence until completion.
pub struct ImmediateCommandEncoder {
    device: Device,
    queue: Queue,
    pool: CommandPool,
    fence: Fence,
}

impl ImmediateCommandEncoder {
    pub fn new(device: &Device, queue: Queue) -> Result<Self> {
        let pool = CommandPool::new(device, queue.family_index(), vk::CommandPoolCreateFlags::TRANSIENT)?;
        let fence = Fence::new(device, false)?;

        Ok(Self {
            device: device.clone(),
            queue,
            pool,
            fence,
        })
    }

    /// Record commands and submit immediately, blocking until the GPU finishes.
    #[profiling::function]
    pub fn submit_and_wait<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&CommandEncoder),
    {
        self.pool.reset()?;
        let buffers = self.pool.allocate(1)?;

        let result = self.record_and_submit(buffers[0], record);
        self.pool.free(&buffers);
        result
    }

    fn record_and_submit<F>(&self, cmd: vk::CommandBuffer, record: F) -> Result<()>
    where
        F: FnOnce(&CommandEncoder),
    {
        let encoder = CommandEncoder::new(&self.device, cmd);
        encoder.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        record(&encoder);
        encoder.end()?;

        let cmd_info = vk::CommandBufferSubmitInfo::default().command_buffer(cmd);
        let submit_info = vk::SubmitInfo2::default().command_buffer_infos(std::slice::from_ref(&cmd_info));

        unsafe { self.device.queue_submit2(self.queue.handle(), &[submit_info], self.fence.handle()) }
            .map_err(RhiError::device("queue_submit2"))?;
        self.fence.wait()?;
        self.fence.reset()
    }

    pub fn queue(&self) -> Queue {
        self.queue
    }
}
