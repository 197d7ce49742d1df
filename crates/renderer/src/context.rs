//! Process-wide owner of the lifecycle managers.
//!
//! # Overview
//!
//! [`GpuContext`] creates one of each manager on a shared device and fence
//! timeline:
//! - the [`CommandQueue`] and its recycling pools
//! - the [`ResourceLayoutTracker`]
//! - one [`DescriptorAllocator`] per descriptor heap type
//!
//! # Frame pacing
//!
//! The CPU may run `frames_in_flight` frames ahead of the GPU.
//! [`begin_frame`](GpuContext::begin_frame) waits for the fence that ended
//! the frame `frames_in_flight` frames ago, then reclaims descriptors and
//! destroys released resources whose fences have completed.
//!
//! ```no_run
//! use lumen_core::RendererConfig;
//! use lumen_renderer::GpuContext;
//!
//! # fn example() -> lumen_renderer::RendererResult<()> {
//! let mut context = GpuContext::from_config(&RendererConfig::default())?;
//! loop {
//!     context.begin_frame()?;
//!     let list = context.get_command_list()?;
//!     // record...
//!     context.submit(list)?;
//!     context.end_frame();
//!     # break;
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use lumen_core::{BackendKind, RendererConfig};
use lumen_rhi::headless::HeadlessDevice;
use lumen_rhi::vulkan::VulkanDevice;
use lumen_rhi::{
    BufferDesc, DescriptorHandle, DescriptorHeapType, DescriptorWrite, GpuDevice, ResourceId,
    ResourceLayout, TextureDesc,
};
use tracing::{debug, error, info};

use crate::command_list::CommandList;
use crate::command_queue::{CommandQueue, QueueConfig};
use crate::descriptor::{DescriptorAllocation, DescriptorAllocator};
use crate::error::RendererResult;
use crate::fence::FenceTimeline;
use crate::fence_pool::FencePool;
use crate::layout_tracker::{ResourceLayoutTracker, SubresourceDesc};

/// Device, queue, tracker and descriptor allocators for one GPU.
pub struct GpuContext {
    device: Arc<dyn GpuDevice>,
    timeline: Arc<FenceTimeline>,
    tracker: Arc<ResourceLayoutTracker>,
    queue: CommandQueue,
    allocators: [DescriptorAllocator; 4],
    frame_fences: Vec<u64>,
    frame_index: u64,
    released: FencePool<ResourceId>,
}

impl GpuContext {
    /// Creates the managers on an existing device.
    pub fn new(device: Arc<dyn GpuDevice>, config: &RendererConfig) -> RendererResult<Self> {
        config.validate()?;

        let timeline = Arc::new(FenceTimeline::new());
        let tracker = Arc::new(ResourceLayoutTracker::new());
        let queue = CommandQueue::new(
            device.clone(),
            tracker.clone(),
            timeline.clone(),
            QueueConfig {
                upload_page_size: config.upload_page_size,
                descriptors_per_heap: config.dynamic_descriptors_per_heap,
            },
        );
        let allocators = DescriptorHeapType::ALL.map(|heap_type| {
            DescriptorAllocator::new(
                device.clone(),
                heap_type,
                config.descriptors_per_page,
                timeline.clone(),
            )
        });

        info!(
            "GPU context ready on {} ({} frames in flight)",
            device.name(),
            config.frames_in_flight
        );

        Ok(Self {
            device,
            timeline,
            tracker,
            queue,
            allocators,
            frame_fences: vec![0; config.frames_in_flight as usize],
            frame_index: 0,
            released: FencePool::new(),
        })
    }

    /// Creates the configured backend and the managers on it.
    pub fn from_config(config: &RendererConfig) -> RendererResult<Self> {
        let device: Arc<dyn GpuDevice> = match config.backend {
            BackendKind::Headless => Arc::new(HeadlessDevice::new()),
            BackendKind::Vulkan => Arc::new(VulkanDevice::new(config.validation)?),
        };
        Self::new(device, config)
    }

    #[inline]
    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    #[inline]
    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    #[inline]
    pub fn tracker(&self) -> &Arc<ResourceLayoutTracker> {
        &self.tracker
    }

    #[inline]
    pub fn timeline(&self) -> &Arc<FenceTimeline> {
        &self.timeline
    }

    /// The CPU descriptor allocator of `heap_type`.
    #[inline]
    pub fn descriptor_allocator(&self, heap_type: DescriptorHeapType) -> &DescriptorAllocator {
        &self.allocators[heap_type.index()]
    }

    /// Number of frames started so far.
    #[inline]
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.frame_fences.len()
    }

    // --- Resources ---

    pub fn allocate_descriptors(
        &self,
        heap_type: DescriptorHeapType,
        count: u32,
    ) -> RendererResult<DescriptorAllocation> {
        self.descriptor_allocator(heap_type).allocate(count)
    }

    /// Writes a view into a CPU descriptor slot.
    pub fn write_descriptor(
        &self,
        handle: DescriptorHandle,
        write: &DescriptorWrite,
    ) -> RendererResult<()> {
        self.device.write_descriptor(handle, write)?;
        Ok(())
    }

    /// Creates a texture and registers it with the tracker in the
    /// `Undefined` layout.
    pub fn create_texture(&self, desc: &TextureDesc) -> RendererResult<ResourceId> {
        let resource = self.device.create_texture(desc)?;
        self.tracker.register_resource(
            resource,
            ResourceLayout::Undefined,
            SubresourceDesc::from(desc),
        );
        Ok(resource)
    }

    pub fn create_buffer(&self, desc: &BufferDesc) -> RendererResult<ResourceId> {
        Ok(self.device.create_buffer(desc)?)
    }

    /// Stops tracking a resource and destroys it once every submission that
    /// may use it has completed.
    ///
    /// Lists recorded but not yet submitted must not touch the resource
    /// afterwards.
    pub fn release_resource(&mut self, resource: ResourceId) {
        self.tracker.unregister_resource(resource);
        self.released.push(self.timeline.next_value(), resource);
    }

    /// Replaces a texture with a new one of a different size. The queue is
    /// drained first, so the old texture is destroyed immediately.
    pub fn resize_texture(
        &mut self,
        resource: ResourceId,
        desc: &TextureDesc,
    ) -> RendererResult<ResourceId> {
        self.flush()?;
        self.tracker.unregister_resource(resource);
        self.device.destroy_resource(resource);
        let resized = self.create_texture(desc)?;
        debug!(
            "Resized {:?} -> {:?}: {}x{}",
            resource, resized, desc.width, desc.height
        );
        Ok(resized)
    }

    // --- Frames ---

    /// Waits until the frame slot about to be reused has retired and reclaims
    /// everything that completed.
    pub fn begin_frame(&mut self) -> RendererResult<u64> {
        let slot = (self.frame_index % self.frame_fences.len() as u64) as usize;
        self.queue.wait_for_fence_value(self.frame_fences[slot])?;
        self.reclaim()?;
        Ok(self.frame_index)
    }

    pub fn get_command_list(&self) -> RendererResult<CommandList> {
        self.queue.get_available_command_list()
    }

    /// Submits a list and reclaims descriptors that have since retired.
    pub fn submit(&mut self, list: CommandList) -> RendererResult<u64> {
        self.submit_all(vec![list])
    }

    pub fn submit_all(&mut self, lists: Vec<CommandList>) -> RendererResult<u64> {
        let fence = self.queue.execute_command_lists(lists)?;
        let completed = self.queue.completed_fence_value()?;
        for allocator in &self.allocators {
            allocator.release_stale_descriptors(completed);
        }
        Ok(fence)
    }

    /// Records the fence that ends the current frame and advances the frame
    /// index.
    pub fn end_frame(&mut self) -> u64 {
        let slot = (self.frame_index % self.frame_fences.len() as u64) as usize;
        let fence = self.timeline.last_signaled();
        self.frame_fences[slot] = fence;
        self.frame_index += 1;
        fence
    }

    /// Drains the queue and reclaims everything.
    pub fn flush(&mut self) -> RendererResult<()> {
        self.queue.flush()?;
        self.reclaim()
    }

    fn reclaim(&mut self) -> RendererResult<()> {
        let completed = self.queue.completed_fence_value()?;
        for allocator in &self.allocators {
            allocator.release_stale_descriptors(completed);
        }
        for resource in self.released.drain_ready(completed) {
            self.device.destroy_resource(resource);
        }
        Ok(())
    }

    /// Resources released but not yet destroyed.
    pub fn pending_release_count(&self) -> usize {
        self.released.len()
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            error!("Failed to flush GPU context during drop: {:?}", e);
        }
    }
}

impl std::fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuContext")
            .field("device", &self.device.name())
            .field("frame_index", &self.frame_index)
            .field("frame_fences", &self.frame_fences)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use lumen_rhi::headless::FenceMode;
    use lumen_rhi::{TextureFormat, TextureUsage};

    use super::*;
    use crate::command_list::SubresourceSelection;
    use crate::error::RendererError;

    fn config() -> RendererConfig {
        RendererConfig {
            descriptors_per_page: 16,
            upload_page_size: 4096,
            dynamic_descriptors_per_heap: 64,
            ..RendererConfig::default()
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = RendererConfig {
            frames_in_flight: 0,
            ..config()
        };
        assert!(matches!(
            GpuContext::from_config(&config),
            Err(RendererError::Config(_))
        ));
    }

    #[test]
    fn test_create_texture_registers_layouts() {
        let context = GpuContext::from_config(&config()).unwrap();
        let desc = TextureDesc::new_2d(64, 64, TextureFormat::Rgba8Unorm, TextureUsage::SAMPLED)
            .with_mip_levels(3);
        let texture = context.create_texture(&desc).unwrap();
        assert_eq!(
            context.tracker().layouts(texture).unwrap(),
            vec![ResourceLayout::Undefined; 3]
        );
    }

    #[test]
    fn test_frame_loop_reclaims_descriptors() {
        let mut context = GpuContext::from_config(&config()).unwrap();
        for _ in 0..4 {
            context.begin_frame().unwrap();
            let allocation = context
                .allocate_descriptors(DescriptorHeapType::CbvSrvUav, 16)
                .unwrap();
            drop(allocation);
            let list = context.get_command_list().unwrap();
            context.submit(list).unwrap();
            context.end_frame();
        }
        // every frame fit in the first page once its fence retired
        assert_eq!(
            context
                .descriptor_allocator(DescriptorHeapType::CbvSrvUav)
                .num_pages(),
            1
        );
        assert_eq!(context.frame_index(), 4);
    }

    #[test]
    fn test_released_texture_destroyed_after_fence() {
        let device = Arc::new(HeadlessDevice::new());
        let mut context = GpuContext::new(device.clone(), &config()).unwrap();
        let desc = TextureDesc::new_2d(8, 8, TextureFormat::Rgba8Unorm, TextureUsage::SAMPLED);
        let texture = context.create_texture(&desc).unwrap();

        let mut list = context.get_command_list().unwrap();
        list.transition_texture(texture, SubresourceSelection::All, ResourceLayout::ShaderResource)
            .unwrap();
        context.release_resource(texture);
        assert!(!context.tracker().is_registered(texture));
        drop(list);

        assert_eq!(context.pending_release_count(), 1);
        context.flush().unwrap();
        assert_eq!(context.pending_release_count(), 0);
        assert!(device.texture_desc(texture).is_none());
    }

    #[test]
    fn test_resize_reregisters() {
        let mut context = GpuContext::from_config(&config()).unwrap();
        let small = TextureDesc::new_2d(
            8,
            8,
            TextureFormat::Bgra8Unorm,
            TextureUsage::RENDER_TARGET,
        );
        let texture = context.create_texture(&small).unwrap();
        let resized = context
            .resize_texture(texture, &small.with_mip_levels(2))
            .unwrap();
        assert!(!context.tracker().is_registered(texture));
        assert_eq!(context.tracker().layouts(resized).unwrap().len(), 2);
    }

    #[test]
    fn test_begin_frame_waits_for_oldest_frame() {
        let device = Arc::new(HeadlessDevice::with_fence_mode(FenceMode::Manual));
        let mut context = GpuContext::new(device.clone(), &config()).unwrap();

        for _ in 0..2 {
            context.begin_frame().unwrap();
            let list = context.get_command_list().unwrap();
            context.submit(list).unwrap();
            context.end_frame();
        }
        assert_eq!(device.fence_wait_count(), 0);

        let gpu = device.clone();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            gpu.complete_fence(1);
        });
        context.begin_frame().unwrap();
        worker.join().unwrap();
        assert_eq!(device.fence_wait_count(), 1);
        assert_eq!(device.completed_fence_value().unwrap(), 1);

        device.complete_all();
        // dropping the context flushes, which signals fence 3
        let finisher = device.clone();
        let worker = thread::spawn(move || {
            while finisher.last_signaled() < 3 {
                thread::yield_now();
            }
            finisher.complete_all();
        });
        drop(context);
        worker.join().unwrap();
    }
}
