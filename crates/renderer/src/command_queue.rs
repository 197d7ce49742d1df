//! Submission, fencing and recycling of command lists.
//!
//! # Overview
//!
//! The queue owns every command allocator and command list that is not
//! currently recording. Each object is stamped with the fence value of the
//! submission that last used it and reused only once the GPU has reached
//! that value.
//!
//! # Submission
//!
//! [`CommandQueue::execute_command_lists`] holds the layout tracker lock for
//! the whole batch and closes each list, then:
//! 1. resolves the list's pending transitions against the tracked layouts,
//!    as left by earlier lists of the same batch
//! 2. stages the list's final layouts for the lists after it
//!
//! Resolved barriers are recorded into a fresh synchronization list that runs
//! right before the list. The whole batch `[sync, list, sync, list, ...]` is
//! submitted in one call and followed by a single fence signal. Staged
//! layouts reach the tracker only after both succeed, so a batch that fails
//! part way leaves the tracker as it was.

use std::sync::{Arc, Mutex};

use lumen_rhi::{CommandAllocatorId, CommandListId, DescriptorHeapType, GpuDevice};
use tracing::{debug, error, trace};

use crate::command_list::{CommandList, ListContext};
use crate::error::RendererResult;
use crate::fence::FenceTimeline;
use crate::fence_pool::FencePool;
use crate::layout_tracker::{ResourceLayoutTracker, StagedLayouts};
use crate::lock;

/// Owned backend command allocator.
pub struct CommandAllocator {
    device: Arc<dyn GpuDevice>,
    id: CommandAllocatorId,
}

impl CommandAllocator {
    pub(crate) fn new(device: Arc<dyn GpuDevice>) -> RendererResult<Self> {
        let id = device.create_command_allocator()?;
        Ok(Self { device, id })
    }

    #[inline]
    pub fn id(&self) -> CommandAllocatorId {
        self.id
    }

    fn reset(&self) -> RendererResult<()> {
        self.device.reset_command_allocator(self.id)?;
        Ok(())
    }
}

impl Drop for CommandAllocator {
    fn drop(&mut self) {
        self.device.destroy_command_allocator(self.id);
    }
}

impl std::fmt::Debug for CommandAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CommandAllocator").field(&self.id).finish()
    }
}

/// Sizes used when the queue creates per-list resources.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueConfig {
    pub upload_page_size: u64,
    pub descriptors_per_heap: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            upload_page_size: 2 * 1024 * 1024,
            descriptors_per_heap: 1024,
        }
    }
}

/// The direct queue.
pub struct CommandQueue {
    device: Arc<dyn GpuDevice>,
    tracker: Arc<ResourceLayoutTracker>,
    timeline: Arc<FenceTimeline>,
    context: ListContext,
    allocators: Mutex<FencePool<CommandAllocator>>,
    lists: Mutex<FencePool<CommandList>>,
}

impl CommandQueue {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        tracker: Arc<ResourceLayoutTracker>,
        timeline: Arc<FenceTimeline>,
        config: QueueConfig,
    ) -> Self {
        let context = ListContext {
            device: device.clone(),
            tracker: tracker.clone(),
            upload_pool: FencePool::shared(),
            heap_pools: [FencePool::shared(), FencePool::shared()],
            upload_page_size: config.upload_page_size,
            descriptors_per_heap: config.descriptors_per_heap,
        };
        debug!("Command queue created on {} device", device.name());
        Self {
            device,
            tracker,
            timeline,
            context,
            allocators: Mutex::new(FencePool::new()),
            lists: Mutex::new(FencePool::new()),
        }
    }

    #[inline]
    pub fn timeline(&self) -> &Arc<FenceTimeline> {
        &self.timeline
    }

    #[inline]
    pub fn tracker(&self) -> &Arc<ResourceLayoutTracker> {
        &self.tracker
    }

    /// A list open for recording, reusing a retired allocator and list when
    /// their fences have completed.
    pub fn get_available_command_list(&self) -> RendererResult<CommandList> {
        let completed = self.device.completed_fence_value()?;

        let pooled = lock(&self.allocators).pop_ready(completed);
        let allocator = match pooled {
            Some(allocator) => {
                allocator.reset()?;
                allocator
            }
            None => CommandAllocator::new(self.device.clone())?,
        };

        let pooled = lock(&self.lists).pop_ready(completed);
        match pooled {
            Some(mut list) => {
                list.reset(allocator)?;
                trace!("Reusing {:?}", list.id());
                Ok(list)
            }
            None => CommandList::new(&self.context, allocator),
        }
    }

    /// Submits one list. Returns the fence value that marks its completion.
    pub fn execute_command_list(&self, list: CommandList) -> RendererResult<u64> {
        self.execute_command_lists(vec![list])
    }

    /// Submits lists in order as one batch. Returns the fence value that
    /// marks completion of the whole batch.
    pub fn execute_command_lists(&self, lists: Vec<CommandList>) -> RendererResult<u64> {
        let mut submitted: Vec<CommandList> = Vec::with_capacity(lists.len() * 2);
        let mut batch: Vec<CommandListId> = Vec::with_capacity(lists.len() * 2);

        let mut table = self.tracker.lock();
        let mut staged = StagedLayouts::new();

        for mut list in lists {
            list.close()?;
            let pending = list.take_pending();
            let mut barriers = Vec::with_capacity(pending.len());
            for transition in &pending {
                let before = staged.layout(&table, transition.resource, transition.subresource)?;
                barriers.extend(transition.resolve(before));
            }
            for (resource, finals) in list.take_final_layouts() {
                staged.merge(&table, resource, &finals)?;
            }

            if !barriers.is_empty() {
                let mut sync = self.get_available_command_list()?;
                sync.record_barriers(&barriers)?;
                sync.close()?;
                trace!(
                    "{:?}: {} resolved barriers before {:?}",
                    sync.id(),
                    barriers.len(),
                    list.id()
                );
                batch.push(sync.id());
                submitted.push(sync);
            }
            batch.push(list.id());
            submitted.push(list);
        }

        self.device.execute_command_lists(&batch)?;
        let fence = self.signal()?;
        trace!("Committing layouts of {} resources", staged.len());
        staged.commit(&mut table);
        drop(table);

        let mut allocators = lock(&self.allocators);
        let mut pool = lock(&self.lists);
        let mut uploads = lock(&self.context.upload_pool);
        for mut list in submitted {
            if let Some(allocator) = list.take_allocator() {
                allocators.push(fence, allocator);
            }
            for page in list.take_retired_pages() {
                uploads.push(fence, page);
            }
            let [cbv_srv_uav, sampler] = list.take_retired_heaps();
            for (heaps, heap_type) in [
                (cbv_srv_uav, DescriptorHeapType::CbvSrvUav),
                (sampler, DescriptorHeapType::Sampler),
            ] {
                let mut heap_pool = lock(&self.context.heap_pools[heap_type.index()]);
                for heap in heaps {
                    heap_pool.push(fence, heap);
                }
            }
            pool.push(fence, list);
        }

        debug!("Submitted {} lists, fence {}", batch.len(), fence);
        Ok(fence)
    }

    /// Signals the next fence value after all submitted work.
    pub fn signal(&self) -> RendererResult<u64> {
        let value = self.timeline.advance();
        self.device.signal(value)?;
        Ok(value)
    }

    pub fn is_fence_complete(&self, value: u64) -> RendererResult<bool> {
        Ok(self.device.completed_fence_value()? >= value)
    }

    /// Blocks until the GPU reaches `value`. Returns at once if it already has.
    pub fn wait_for_fence_value(&self, value: u64) -> RendererResult<()> {
        if self.is_fence_complete(value)? {
            return Ok(());
        }
        self.device.wait_for_fence_value(value)?;
        Ok(())
    }

    /// Signals and waits, draining all submitted work.
    pub fn flush(&self) -> RendererResult<()> {
        let value = self.signal()?;
        self.wait_for_fence_value(value)
    }

    pub fn completed_fence_value(&self) -> RendererResult<u64> {
        Ok(self.device.completed_fence_value()?)
    }

    #[inline]
    pub fn last_signaled_fence_value(&self) -> u64 {
        self.timeline.last_signaled()
    }

    /// Allocators waiting in the pool.
    pub fn pooled_allocator_count(&self) -> usize {
        lock(&self.allocators).len()
    }

    /// Lists waiting in the pool.
    pub fn pooled_list_count(&self) -> usize {
        lock(&self.lists).len()
    }

    pub fn pooled_upload_page_count(&self) -> usize {
        lock(&self.context.upload_pool).len()
    }

    pub fn pooled_heap_count(&self, heap_type: DescriptorHeapType) -> usize {
        match heap_type {
            DescriptorHeapType::CbvSrvUav | DescriptorHeapType::Sampler => {
                lock(&self.context.heap_pools[heap_type.index()]).len()
            }
            DescriptorHeapType::Rtv | DescriptorHeapType::Dsv => 0,
        }
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        let last = self.last_signaled_fence_value();
        if let Err(e) = self.wait_for_fence_value(last) {
            error!("Failed to drain command queue during drop: {:?}", e);
        }
    }
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("device", &self.device.name())
            .field("last_signaled", &self.timeline.last_signaled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use lumen_rhi::headless::{FenceMode, HeadlessDevice};
    use lumen_rhi::{Barrier, ResourceId, ResourceLayout, TextureFormat};

    use super::*;
    use crate::command_list::SubresourceSelection;
    use crate::error::RendererError;
    use crate::layout_tracker::SubresourceDesc;

    fn queue(device: &Arc<HeadlessDevice>) -> CommandQueue {
        CommandQueue::new(
            device.clone(),
            Arc::new(ResourceLayoutTracker::new()),
            Arc::new(FenceTimeline::new()),
            QueueConfig {
                upload_page_size: 4096,
                descriptors_per_heap: 64,
            },
        )
    }

    #[test]
    fn test_execute_returns_increasing_fences() {
        let device = Arc::new(HeadlessDevice::new());
        let queue = queue(&device);
        let a = queue
            .execute_command_list(queue.get_available_command_list().unwrap())
            .unwrap();
        let b = queue
            .execute_command_list(queue.get_available_command_list().unwrap())
            .unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(queue.last_signaled_fence_value(), 2);
        assert_eq!(device.last_signaled(), 2);
    }

    #[test]
    fn test_allocator_reused_after_fence() {
        let device = Arc::new(HeadlessDevice::with_fence_mode(FenceMode::Manual));
        let queue = queue(&device);
        let list = queue.get_available_command_list().unwrap();
        let first_allocator = list.allocator_id().unwrap();
        let first_list = list.id();
        let fence = queue.execute_command_list(list).unwrap();

        let second = queue.get_available_command_list().unwrap();
        assert_ne!(second.allocator_id(), Some(first_allocator));
        assert_ne!(second.id(), first_list);
        drop(second);

        device.complete_fence(fence);
        let third = queue.get_available_command_list().unwrap();
        assert_eq!(third.allocator_id(), Some(first_allocator));
        assert_eq!(third.id(), first_list);
        assert_eq!(device.allocator_reset_count(first_allocator), Some(1));
        device.complete_all();
    }

    #[test]
    fn test_pending_barrier_gets_sync_list() {
        let device = Arc::new(HeadlessDevice::new());
        let queue = queue(&device);
        let texture = ResourceId::from_raw(500);
        queue.tracker().register_resource(
            texture,
            ResourceLayout::Common,
            SubresourceDesc::new(1, 1, TextureFormat::Rgba8Unorm),
        );

        let mut list = queue.get_available_command_list().unwrap();
        let main = list.id();
        list.transition_texture(texture, SubresourceSelection::All, ResourceLayout::RenderTarget)
            .unwrap();
        queue.execute_command_list(list).unwrap();

        let submission = device.last_submission().unwrap();
        assert_eq!(submission.lists.len(), 2);
        assert_eq!(submission.lists[1].list, main);
        assert_eq!(
            submission.lists[0].commands,
            vec![lumen_rhi::headless::RecordedCommand::Barriers(vec![
                Barrier::Texture {
                    resource: texture,
                    subresource: 0,
                    before: ResourceLayout::Common,
                    after: ResourceLayout::RenderTarget,
                }
            ])]
        );
        assert_eq!(
            queue.tracker().layout(texture, 0).unwrap(),
            ResourceLayout::RenderTarget
        );
    }

    #[test]
    fn test_no_sync_list_when_layout_matches() {
        let device = Arc::new(HeadlessDevice::new());
        let queue = queue(&device);
        let texture = ResourceId::from_raw(500);
        queue.tracker().register_resource(
            texture,
            ResourceLayout::ShaderResource,
            SubresourceDesc::new(1, 1, TextureFormat::Rgba8Unorm),
        );

        let mut list = queue.get_available_command_list().unwrap();
        list.transition_texture(texture, SubresourceSelection::All, ResourceLayout::ShaderResource)
            .unwrap();
        queue.execute_command_list(list).unwrap();
        assert_eq!(device.last_submission().unwrap().lists.len(), 1);
    }

    #[test]
    fn test_wait_skips_completed_fence() {
        let device = Arc::new(HeadlessDevice::new());
        let queue = queue(&device);
        let fence = queue.signal().unwrap();
        queue.wait_for_fence_value(fence).unwrap();
        queue.wait_for_fence_value(fence).unwrap();
        assert_eq!(device.fence_wait_count(), 0);
        assert!(queue.is_fence_complete(fence).unwrap());
    }

    #[test]
    fn test_retired_resources_are_pooled() {
        let device = Arc::new(HeadlessDevice::new());
        let queue = queue(&device);
        let mut list = queue.get_available_command_list().unwrap();
        list.allocate_upload(128, 16).unwrap();
        queue.execute_command_list(list).unwrap();
        assert_eq!(queue.pooled_allocator_count(), 1);
        assert_eq!(queue.pooled_list_count(), 1);
        assert_eq!(queue.pooled_upload_page_count(), 1);
        assert_eq!(queue.pooled_heap_count(DescriptorHeapType::CbvSrvUav), 0);
    }

    #[test]
    fn test_failed_batch_leaves_tracker_untouched() {
        let device = Arc::new(HeadlessDevice::new());
        let queue = queue(&device);
        let kept = ResourceId::from_raw(501);
        let dropped = ResourceId::from_raw(502);
        for texture in [kept, dropped] {
            queue.tracker().register_resource(
                texture,
                ResourceLayout::Common,
                SubresourceDesc::new(1, 1, TextureFormat::Rgba8Unorm),
            );
        }

        let mut a = queue.get_available_command_list().unwrap();
        a.transition_texture(kept, SubresourceSelection::All, ResourceLayout::RenderTarget)
            .unwrap();
        let mut b = queue.get_available_command_list().unwrap();
        b.transition_texture(dropped, SubresourceSelection::All, ResourceLayout::RenderTarget)
            .unwrap();
        queue.tracker().unregister_resource(dropped);

        assert!(matches!(
            queue.execute_command_lists(vec![a, b]),
            Err(RendererError::ResourceNotRegistered(r)) if r == dropped
        ));
        assert!(device.last_submission().is_none());
        assert_eq!(device.last_signaled(), 0);
        assert_eq!(
            queue.tracker().layout(kept, 0).unwrap(),
            ResourceLayout::Common
        );
    }

    #[test]
    fn test_batch_lists_resolve_against_each_other() {
        let device = Arc::new(HeadlessDevice::new());
        let queue = queue(&device);
        let texture = ResourceId::from_raw(503);
        queue.tracker().register_resource(
            texture,
            ResourceLayout::Common,
            SubresourceDesc::new(1, 1, TextureFormat::Rgba8Unorm),
        );

        let mut a = queue.get_available_command_list().unwrap();
        a.transition_texture(texture, SubresourceSelection::All, ResourceLayout::CopyDest)
            .unwrap();
        let mut b = queue.get_available_command_list().unwrap();
        b.transition_texture(texture, SubresourceSelection::All, ResourceLayout::ShaderResource)
            .unwrap();
        queue.execute_command_lists(vec![a, b]).unwrap();

        let submission = device.last_submission().unwrap();
        assert_eq!(submission.lists.len(), 4);
        assert_eq!(
            submission.lists[2].commands,
            vec![lumen_rhi::headless::RecordedCommand::Barriers(vec![
                Barrier::Texture {
                    resource: texture,
                    subresource: 0,
                    before: ResourceLayout::CopyDest,
                    after: ResourceLayout::ShaderResource,
                }
            ])]
        );
        assert_eq!(
            queue.tracker().layout(texture, 0).unwrap(),
            ResourceLayout::ShaderResource
        );
    }
}
