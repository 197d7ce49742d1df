//! Command pools and command buffers.
//!
//! # Overview
//!
//! - [`CommandPool`] is the Vulkan form of a command allocator. Resetting it
//!   recycles the memory of every buffer allocated from it.
//! - [`CommandBuffer`] is the Vulkan form of a command list. It remembers the
//!   pool it was allocated from: a list re-opened against a different
//!   allocator is freed and allocated again from the new pool, because a
//!   Vulkan command buffer cannot move between pools.

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::error::RhiResult;

use super::device::Device;

/// Vulkan command pool wrapper.
///
/// # Thread Safety
///
/// Command pools are externally synchronised; the backend only touches a pool
/// under its object lock.
pub struct CommandPool {
    device: Arc<Device>,
    pool: vk::CommandPool,
}

impl CommandPool {
    /// Creates a pool for the direct queue family.
    ///
    /// Buffers are reset together with the pool, so the pool is created
    /// without `RESET_COMMAND_BUFFER`.
    pub fn new(device: Arc<Device>) -> RhiResult<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(device.info().queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe { device.handle().create_command_pool(&create_info, None)? };
        debug!("Command pool created");
        Ok(Self { device, pool })
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Recycles every command buffer allocated from this pool.
    pub fn reset(&self) -> RhiResult<()> {
        unsafe {
            self.device
                .handle()
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())?;
        }
        Ok(())
    }

    fn allocate(&self) -> RhiResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.handle().allocate_command_buffers(&alloc_info)? };
        Ok(buffers[0])
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        // Destroying the pool frees its command buffers.
        unsafe {
            self.device.handle().destroy_command_pool(self.pool, None);
        }
        debug!("Command pool destroyed");
    }
}

/// A primary command buffer plus the pool it belongs to.
pub struct CommandBuffer {
    device: Arc<Device>,
    buffer: vk::CommandBuffer,
    pool: vk::CommandPool,
}

impl CommandBuffer {
    /// Allocates a buffer from `pool` and begins recording.
    pub fn new(device: Arc<Device>, pool: &CommandPool) -> RhiResult<Self> {
        let buffer = pool.allocate()?;
        let command_buffer = Self {
            device,
            buffer,
            pool: pool.handle(),
        };
        command_buffer.begin()?;
        Ok(command_buffer)
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    /// Pool the buffer was allocated from.
    #[inline]
    pub fn pool(&self) -> vk::CommandPool {
        self.pool
    }

    /// Returns the buffer to its pool.
    ///
    /// Buffers whose pool was already destroyed were freed with it and must
    /// simply be dropped instead.
    pub fn free(self) {
        unsafe {
            self.device
                .handle()
                .free_command_buffers(self.pool, &[self.buffer]);
        }
    }

    /// Re-opens the buffer for recording from `pool`. The pool must have been
    /// reset since the buffer's last submission.
    pub fn reset(&mut self, pool: &CommandPool) -> RhiResult<()> {
        if pool.handle() != self.pool {
            let buffer = pool.allocate()?;
            unsafe {
                self.device
                    .handle()
                    .free_command_buffers(self.pool, &[self.buffer]);
            }
            self.buffer = buffer;
            self.pool = pool.handle();
        }
        self.begin()
    }

    fn begin(&self) -> RhiResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .handle()
                .begin_command_buffer(self.buffer, &begin_info)?;
        }
        Ok(())
    }

    /// Ends recording.
    pub fn end(&self) -> RhiResult<()> {
        unsafe {
            self.device.handle().end_command_buffer(self.buffer)?;
        }
        Ok(())
    }

    // =========================================================================
    // Synchronization
    // =========================================================================

    /// Records one `vkCmdPipelineBarrier2` with the given barriers.
    pub fn pipeline_barrier2(
        &self,
        buffer_barriers: &[vk::BufferMemoryBarrier2],
        image_barriers: &[vk::ImageMemoryBarrier2],
    ) {
        if buffer_barriers.is_empty() && image_barriers.is_empty() {
            return;
        }
        let dependency = vk::DependencyInfo::default()
            .buffer_memory_barriers(buffer_barriers)
            .image_memory_barriers(image_barriers);
        unsafe {
            self.device
                .handle()
                .cmd_pipeline_barrier2(self.buffer, &dependency);
        }
    }

    // =========================================================================
    // Binding
    // =========================================================================

    pub fn bind_pipeline(&self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        unsafe {
            self.device
                .handle()
                .cmd_bind_pipeline(self.buffer, bind_point, pipeline);
        }
    }

    pub fn bind_descriptor_set(
        &self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set_index: u32,
        set: vk::DescriptorSet,
    ) {
        unsafe {
            self.device.handle().cmd_bind_descriptor_sets(
                self.buffer,
                bind_point,
                layout,
                set_index,
                &[set],
                &[],
            );
        }
    }

    pub fn push_constants(&self, layout: vk::PipelineLayout, offset: u32, bytes: &[u8]) {
        unsafe {
            self.device.handle().cmd_push_constants(
                self.buffer,
                layout,
                vk::ShaderStageFlags::ALL,
                offset,
                bytes,
            );
        }
    }

    pub fn bind_index_buffer(&self, buffer: vk::Buffer, offset: u64, index_type: vk::IndexType) {
        unsafe {
            self.device
                .handle()
                .cmd_bind_index_buffer(self.buffer, buffer, offset, index_type);
        }
    }

    // =========================================================================
    // Rendering
    // =========================================================================

    /// Begins dynamic rendering and sets viewport and scissor to the full area.
    pub fn begin_rendering(&self, rendering_info: &vk::RenderingInfo) {
        let area = rendering_info.render_area;
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: area.extent.width as f32,
            height: area.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        unsafe {
            let device = self.device.handle();
            device.cmd_begin_rendering(self.buffer, rendering_info);
            device.cmd_set_viewport(self.buffer, 0, &[viewport]);
            device.cmd_set_scissor(self.buffer, 0, &[area]);
        }
    }

    pub fn end_rendering(&self) {
        unsafe {
            self.device.handle().cmd_end_rendering(self.buffer);
        }
    }

    pub fn draw(&self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        unsafe {
            self.device.handle().cmd_draw(
                self.buffer,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            );
        }
    }

    pub fn draw_indexed(
        &self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.handle().cmd_draw_indexed(
                self.buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
    }

    pub fn dispatch(&self, x: u32, y: u32, z: u32) {
        unsafe {
            self.device.handle().cmd_dispatch(self.buffer, x, y, z);
        }
    }

    // =========================================================================
    // Copy Commands
    // =========================================================================

    pub fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, region: vk::BufferCopy) {
        unsafe {
            self.device
                .handle()
                .cmd_copy_buffer(self.buffer, src, dst, &[region]);
        }
    }
}

// Safety: command buffers are plain handles; recording happens under the
// backend's object lock.
unsafe impl Send for CommandBuffer {}
unsafe impl Send for CommandPool {}
unsafe impl Sync for CommandPool {}
