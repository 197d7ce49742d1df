//! Command recording with deferred barrier resolution.
//!
//! # Barriers
//!
//! A list does not know the layout a texture will be in when it starts
//! executing: lists are recorded in parallel and submitted in any order.
//! The first time a list touches a subresource it records a
//! [`Transition::Pending`] with only the target layout. Later touches of the
//! same subresource know the previous layout from the list's own state and
//! are recorded immediately as [`Transition::Resolved`] barriers.
//!
//! At submission the queue resolves pending transitions against the global
//! [`ResourceLayoutTracker`] and records them into a small synchronization
//! list executed right before this one.
//!
//! # Descriptors
//!
//! Descriptor tables are staged into one [`DynamicDescriptorHeap`] per
//! shader-visible heap type and committed before each draw or dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use bytemuck::Pod;
use lumen_rhi::{
    Barrier, BufferAccess, CommandListId, DepthStencilBinding, DescriptorHandle,
    DescriptorHeapType, GpuDevice, IndexFormat, InlineDescriptorKind, PipelineBindPoint,
    PipelineId, RenderTargetBinding, ResourceId, ResourceLayout, RhiError, RootSignatureId,
    SubresourceRange, subresource_index,
};
use tracing::trace;

use crate::command_queue::CommandAllocator;
use crate::descriptor::DescriptorAllocation;
use crate::dynamic_descriptor_heap::{DynamicDescriptorHeap, ShaderVisibleHeap};
use crate::error::{RendererError, RendererResult};
use crate::fence_pool::SharedFencePool;
use crate::layout_tracker::{ResourceLayoutTracker, SubresourceDesc};
use crate::root_signature::RootSignature;
use crate::upload_buffer::{UploadAllocation, UploadBuffer, UploadPage};

/// Resolved barriers are batched up to this many before being recorded.
pub const BARRIER_BATCH_LIMIT: usize = 16;

/// Alignment of dynamic constant buffer data.
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

/// Heap types staged through a dynamic descriptor heap.
const DYNAMIC_HEAP_TYPES: [DescriptorHeapType; 2] =
    [DescriptorHeapType::CbvSrvUav, DescriptorHeapType::Sampler];

/// Which subresources of a texture a transition applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubresourceSelection {
    All,
    /// One flat subresource index.
    Single(u32),
    Range(SubresourceRange),
}

/// Outcome of touching a subresource inside a list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// First touch: the layout before it is known only at submission.
    Pending { after: ResourceLayout },
    /// The list already moved the subresource to `before`.
    Resolved {
        before: ResourceLayout,
        after: ResourceLayout,
    },
}

/// A first-touch transition waiting for the global layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingTransition {
    pub resource: ResourceId,
    pub subresource: u32,
    pub after: ResourceLayout,
}

impl PendingTransition {
    /// The barrier to record given the layout at submission time, or `None`
    /// if the subresource is already there.
    pub fn resolve(&self, before: ResourceLayout) -> Option<Barrier> {
        (before != self.after).then_some(Barrier::Texture {
            resource: self.resource,
            subresource: self.subresource,
            before,
            after: self.after,
        })
    }
}

/// Layouts a list has moved a texture's subresources to.
#[derive(Debug, Clone)]
struct ListLayouts {
    desc: SubresourceDesc,
    layouts: Vec<Option<ResourceLayout>>,
}

/// Everything a command list borrows from its queue.
#[derive(Clone)]
pub(crate) struct ListContext {
    pub device: Arc<dyn GpuDevice>,
    pub tracker: Arc<ResourceLayoutTracker>,
    pub upload_pool: SharedFencePool<UploadPage>,
    pub heap_pools: [SharedFencePool<ShaderVisibleHeap>; 2],
    pub upload_page_size: u64,
    pub descriptors_per_heap: u32,
}

/// A recording command list.
///
/// Obtained from the queue with
/// [`get_available_command_list`](crate::CommandQueue::get_available_command_list)
/// and handed back through
/// [`execute_command_list`](crate::CommandQueue::execute_command_list).
pub struct CommandList {
    device: Arc<dyn GpuDevice>,
    tracker: Arc<ResourceLayoutTracker>,
    id: CommandListId,
    allocator: Option<CommandAllocator>,
    layouts: HashMap<ResourceId, ListLayouts>,
    pending: Vec<PendingTransition>,
    barriers: Vec<Barrier>,
    upload: UploadBuffer,
    dynamic_heaps: [DynamicDescriptorHeap; 2],
    root_signatures: [Option<RootSignatureId>; 2],
    /// Signature the dynamic heaps' tables were last parsed from.
    parsed_root_signature: Option<RootSignatureId>,
    closed: bool,
}

impl CommandList {
    pub(crate) fn new(context: &ListContext, allocator: CommandAllocator) -> RendererResult<Self> {
        let id = context.device.create_command_list(allocator.id())?;
        let dynamic_heaps = DYNAMIC_HEAP_TYPES.map(|heap_type| {
            DynamicDescriptorHeap::new(
                context.device.clone(),
                heap_type,
                context.descriptors_per_heap,
                context.heap_pools[heap_type.index()].clone(),
            )
        });
        Ok(Self {
            device: context.device.clone(),
            tracker: context.tracker.clone(),
            id,
            allocator: Some(allocator),
            layouts: HashMap::new(),
            pending: Vec::new(),
            barriers: Vec::with_capacity(BARRIER_BATCH_LIMIT),
            upload: UploadBuffer::new(
                context.device.clone(),
                context.upload_pool.clone(),
                context.upload_page_size,
            ),
            dynamic_heaps,
            root_signatures: [None; 2],
            parsed_root_signature: None,
            closed: false,
        })
    }

    #[inline]
    pub fn id(&self) -> CommandListId {
        self.id
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Allocator the list is currently recording from.
    pub fn allocator_id(&self) -> Option<lumen_rhi::CommandAllocatorId> {
        self.allocator.as_ref().map(CommandAllocator::id)
    }

    // --- Barriers ---

    /// Records a layout change for some or all subresources of a texture.
    pub fn transition_texture(
        &mut self,
        resource: ResourceId,
        selection: SubresourceSelection,
        after: ResourceLayout,
    ) -> RendererResult<()> {
        let indices = self.selected_subresources(resource, selection)?;
        for subresource in indices {
            match self.track(resource, subresource, after) {
                Some(Transition::Pending { after }) => self.pending.push(PendingTransition {
                    resource,
                    subresource,
                    after,
                }),
                Some(Transition::Resolved { before, after }) => {
                    self.push_barrier(Barrier::Texture {
                        resource,
                        subresource,
                        before,
                        after,
                    })?;
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Records a buffer access change. Buffers carry no layout, so the
    /// barrier is never deferred.
    pub fn buffer_barrier(
        &mut self,
        resource: ResourceId,
        before: BufferAccess,
        after: BufferAccess,
    ) -> RendererResult<()> {
        self.push_barrier(Barrier::Buffer {
            resource,
            before,
            after,
        })
    }

    /// Records every batched barrier.
    pub fn flush_resource_barriers(&mut self) -> RendererResult<()> {
        if self.barriers.is_empty() {
            return Ok(());
        }
        self.device.record_barriers(self.id, &self.barriers)?;
        trace!("{:?}: flushed {} barriers", self.id, self.barriers.len());
        self.barriers.clear();
        Ok(())
    }

    fn push_barrier(&mut self, barrier: Barrier) -> RendererResult<()> {
        self.barriers.push(barrier);
        if self.barriers.len() >= BARRIER_BATCH_LIMIT {
            self.flush_resource_barriers()?;
        }
        Ok(())
    }

    /// Moves one subresource to `after` in the list's own state.
    fn track(
        &mut self,
        resource: ResourceId,
        subresource: u32,
        after: ResourceLayout,
    ) -> Option<Transition> {
        let entry = self.layouts.get_mut(&resource)?;
        let slot = entry.layouts.get_mut(subresource as usize)?;
        let transition = match *slot {
            None => Transition::Pending { after },
            Some(before) if before == after => return None,
            Some(before) => Transition::Resolved { before, after },
        };
        *slot = Some(after);
        Some(transition)
    }

    /// Flat indices of the selected subresources. Registers the texture in
    /// the list's state on first use.
    fn selected_subresources(
        &mut self,
        resource: ResourceId,
        selection: SubresourceSelection,
    ) -> RendererResult<Vec<u32>> {
        let desc = match self.layouts.get(&resource) {
            Some(entry) => entry.desc,
            None => {
                let desc = self.tracker.subresource_desc(resource)?;
                self.layouts.insert(
                    resource,
                    ListLayouts {
                        desc,
                        layouts: vec![None; desc.subresource_count() as usize],
                    },
                );
                desc
            }
        };

        let count = desc.subresource_count();
        match selection {
            SubresourceSelection::All => Ok((0..count).collect()),
            SubresourceSelection::Single(index) if index < count => Ok(vec![index]),
            SubresourceSelection::Single(index) => Err(RendererError::SubresourceOutOfRange {
                resource,
                index,
                count,
            }),
            SubresourceSelection::Range(range) => {
                let fits = range.base_mip + range.mip_count <= desc.mip_levels
                    && range.base_array + range.array_count <= desc.array_size
                    && range.base_plane + range.plane_count <= desc.plane_count();
                if !fits {
                    return Err(RendererError::SubresourceOutOfRange {
                        resource,
                        index: subresource_index(
                            (range.base_mip + range.mip_count).saturating_sub(1),
                            (range.base_array + range.array_count).saturating_sub(1),
                            (range.base_plane + range.plane_count).saturating_sub(1),
                            desc.mip_levels,
                            desc.array_size,
                        ),
                        count,
                    });
                }
                Ok(range.indices(desc.mip_levels, desc.array_size).collect())
            }
        }
    }

    /// First-touch transitions recorded so far.
    pub fn pending_transitions(&self) -> &[PendingTransition] {
        &self.pending
    }

    /// Layout each touched subresource is left in. Untouched subresources
    /// are `None`.
    pub fn final_layouts(&self) -> HashMap<ResourceId, Vec<Option<ResourceLayout>>> {
        self.layouts
            .iter()
            .map(|(resource, entry)| (*resource, entry.layouts.clone()))
            .collect()
    }

    // --- Pipeline state and descriptors ---

    pub fn set_pipeline_state(
        &mut self,
        bind_point: PipelineBindPoint,
        pipeline: PipelineId,
    ) -> RendererResult<()> {
        self.device.set_pipeline_state(self.id, bind_point, pipeline)?;
        Ok(())
    }

    /// Binds a root signature and re-parses its tables. Binding the
    /// signature the tables were last parsed from keeps everything staged.
    ///
    /// The dynamic heaps are shared by both bind points, so switching bind
    /// point to another signature and back parses again.
    pub fn set_root_signature(
        &mut self,
        bind_point: PipelineBindPoint,
        root_signature: &RootSignature,
    ) -> RendererResult<()> {
        let slot = bind_point_index(bind_point);
        let id = root_signature.id();
        if self.parsed_root_signature != Some(id) {
            self.parsed_root_signature = None;
            for heap in &mut self.dynamic_heaps {
                heap.parse_root_signature(root_signature.desc())?;
            }
            self.parsed_root_signature = Some(id);
        }
        if self.root_signatures[slot] != Some(id) {
            self.device.set_root_signature(self.id, bind_point, id)?;
            self.root_signatures[slot] = Some(id);
        }
        Ok(())
    }

    fn require_root_signature(&self) -> RendererResult<()> {
        if self.root_signatures.iter().all(Option::is_none) {
            return Err(RendererError::NoRootSignature);
        }
        Ok(())
    }

    fn dynamic_heap(
        &mut self,
        heap_type: DescriptorHeapType,
    ) -> RendererResult<&mut DynamicDescriptorHeap> {
        match heap_type {
            DescriptorHeapType::CbvSrvUav | DescriptorHeapType::Sampler => {
                Ok(&mut self.dynamic_heaps[heap_type.index()])
            }
            DescriptorHeapType::Rtv | DescriptorHeapType::Dsv => Err(RhiError::Unsupported(
                format!("{} descriptors cannot be bound to shaders", heap_type.name()),
            )
            .into()),
        }
    }

    /// Stages CPU descriptors into a descriptor table.
    pub fn stage_descriptors(
        &mut self,
        heap_type: DescriptorHeapType,
        root_index: u32,
        offset: u32,
        handles: &[DescriptorHandle],
    ) -> RendererResult<()> {
        self.require_root_signature()?;
        self.dynamic_heap(heap_type)?
            .stage_descriptors(root_index, offset, handles)
    }

    /// Stages every descriptor of an allocation into a table. A null
    /// allocation stages nothing.
    pub fn set_descriptor_table(
        &mut self,
        root_index: u32,
        offset: u32,
        allocation: &DescriptorAllocation,
    ) -> RendererResult<()> {
        let Some(heap_type) = allocation.heap_type() else {
            return Ok(());
        };
        let handles: Vec<DescriptorHandle> = allocation.handles().collect();
        self.stage_descriptors(heap_type, root_index, offset, &handles)
    }

    /// Binds a buffer address to an inline root descriptor.
    pub fn set_inline_descriptor(
        &mut self,
        root_index: u32,
        kind: InlineDescriptorKind,
        gpu_address: u64,
    ) -> RendererResult<()> {
        self.require_root_signature()?;
        self.dynamic_heaps[DescriptorHeapType::CbvSrvUav.index()]
            .stage_inline(root_index, kind, gpu_address)
    }

    /// Copies `data` into upload memory and binds it as an inline constant
    /// buffer.
    pub fn set_dynamic_constant_buffer(
        &mut self,
        root_index: u32,
        data: &[u8],
    ) -> RendererResult<()> {
        self.require_root_signature()?;
        let allocation = self
            .upload
            .allocate(data.len() as u64, CONSTANT_BUFFER_ALIGNMENT)?;
        allocation.write(data)?;
        self.dynamic_heaps[DescriptorHeapType::CbvSrvUav.index()]
            .stage_inline_cbv(root_index, allocation.gpu_address())
    }

    pub fn set_dynamic_constant<T: Pod>(
        &mut self,
        root_index: u32,
        value: &T,
    ) -> RendererResult<()> {
        self.set_dynamic_constant_buffer(root_index, bytemuck::bytes_of(value))
    }

    /// Copies one CPU descriptor into the shader-visible heap, for commands
    /// that need a shader-visible handle outside a table.
    pub fn copy_descriptor(&mut self, src: DescriptorHandle) -> RendererResult<DescriptorHandle> {
        let id = self.id;
        self.dynamic_heap(DescriptorHeapType::CbvSrvUav)?
            .copy_descriptor(id, src)
    }

    fn commit_staged_descriptors(&mut self, bind_point: PipelineBindPoint) -> RendererResult<()> {
        if !self.dynamic_heaps.iter().any(DynamicDescriptorHeap::has_stale) {
            return Ok(());
        }
        if self.root_signatures[bind_point_index(bind_point)].is_none() {
            return Err(RendererError::NoRootSignature);
        }
        let id = self.id;
        for heap in &mut self.dynamic_heaps {
            heap.commit_staged_descriptors(id, bind_point)?;
        }
        Ok(())
    }

    // --- Upload ---

    /// Allocates per-frame upload memory owned by this list.
    pub fn allocate_upload(
        &mut self,
        size: u64,
        alignment: u64,
    ) -> RendererResult<UploadAllocation> {
        self.upload.allocate(size, alignment)
    }

    /// Copies `data` into `dst` through upload memory.
    pub fn upload_to_buffer(
        &mut self,
        dst: ResourceId,
        dst_offset: u64,
        data: &[u8],
    ) -> RendererResult<()> {
        let allocation = self.upload.allocate(data.len() as u64, 4)?;
        allocation.write(data)?;
        self.copy_buffer(
            dst,
            dst_offset,
            allocation.resource(),
            allocation.offset(),
            data.len() as u64,
        )
    }

    // --- Commands ---

    pub fn copy_buffer(
        &mut self,
        dst: ResourceId,
        dst_offset: u64,
        src: ResourceId,
        src_offset: u64,
        size: u64,
    ) -> RendererResult<()> {
        self.flush_resource_barriers()?;
        self.device
            .copy_buffer_region(self.id, dst, dst_offset, src, src_offset, size)?;
        Ok(())
    }

    pub fn set_index_buffer(
        &mut self,
        resource: ResourceId,
        offset: u64,
        format: IndexFormat,
    ) -> RendererResult<()> {
        self.device
            .set_index_buffer(self.id, resource, offset, format)?;
        Ok(())
    }

    pub fn begin_render_pass(
        &mut self,
        color_targets: &[RenderTargetBinding],
        depth_stencil: Option<&DepthStencilBinding>,
    ) -> RendererResult<()> {
        self.flush_resource_barriers()?;
        self.device
            .begin_render_pass(self.id, color_targets, depth_stencil)?;
        Ok(())
    }

    pub fn end_render_pass(&mut self) -> RendererResult<()> {
        self.device.end_render_pass(self.id)?;
        Ok(())
    }

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> RendererResult<()> {
        self.flush_resource_barriers()?;
        self.commit_staged_descriptors(PipelineBindPoint::Graphics)?;
        self.device.draw(
            self.id,
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        )?;
        Ok(())
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    ) -> RendererResult<()> {
        self.flush_resource_barriers()?;
        self.commit_staged_descriptors(PipelineBindPoint::Graphics)?;
        self.device.draw_indexed(
            self.id,
            index_count,
            instance_count,
            first_index,
            base_vertex,
            first_instance,
        )?;
        Ok(())
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> RendererResult<()> {
        self.flush_resource_barriers()?;
        self.commit_staged_descriptors(PipelineBindPoint::Compute)?;
        self.device.dispatch(self.id, x, y, z)?;
        Ok(())
    }

    /// Flushes batched barriers and closes the list. Closing twice is a
    /// no-op.
    pub fn close(&mut self) -> RendererResult<()> {
        if self.closed {
            return Ok(());
        }
        self.flush_resource_barriers()?;
        self.device.close_command_list(self.id)?;
        self.closed = true;
        Ok(())
    }

    // --- Queue side ---

    /// Re-opens the list against `allocator` with all state cleared.
    pub(crate) fn reset(&mut self, allocator: CommandAllocator) -> RendererResult<()> {
        self.device.reset_command_list(self.id, allocator.id())?;
        self.allocator = Some(allocator);
        self.layouts.clear();
        self.pending.clear();
        self.barriers.clear();
        for heap in &mut self.dynamic_heaps {
            heap.reset();
        }
        self.root_signatures = [None; 2];
        self.parsed_root_signature = None;
        self.closed = false;
        Ok(())
    }

    /// Records already-resolved barriers directly, bypassing the batch.
    pub(crate) fn record_barriers(&mut self, barriers: &[Barrier]) -> RendererResult<()> {
        self.device.record_barriers(self.id, barriers)?;
        Ok(())
    }

    pub(crate) fn take_pending(&mut self) -> Vec<PendingTransition> {
        std::mem::take(&mut self.pending)
    }

    /// Final layouts per resource, consuming the list's state.
    pub(crate) fn take_final_layouts(
        &mut self,
    ) -> impl Iterator<Item = (ResourceId, Vec<Option<ResourceLayout>>)> {
        self.layouts
            .drain()
            .map(|(resource, entry)| (resource, entry.layouts))
    }

    pub(crate) fn take_allocator(&mut self) -> Option<CommandAllocator> {
        self.allocator.take()
    }

    pub(crate) fn take_retired_pages(&mut self) -> Vec<UploadPage> {
        self.upload.take_retired_pages()
    }

    pub(crate) fn take_retired_heaps(&mut self) -> [Vec<ShaderVisibleHeap>; 2] {
        let [cbv_srv_uav, sampler] = &mut self.dynamic_heaps;
        [cbv_srv_uav.take_retired_heaps(), sampler.take_retired_heaps()]
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        self.device.destroy_command_list(self.id);
    }
}

impl std::fmt::Debug for CommandList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandList")
            .field("id", &self.id)
            .field("allocator", &self.allocator_id())
            .field("pending", &self.pending.len())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[inline]
fn bind_point_index(bind_point: PipelineBindPoint) -> usize {
    match bind_point {
        PipelineBindPoint::Graphics => 0,
        PipelineBindPoint::Compute => 1,
    }
}

#[cfg(test)]
mod tests {
    use lumen_rhi::headless::{HeadlessDevice, RecordedCommand};
    use lumen_rhi::{
        BufferDesc, BufferUsage, DescriptorRange, DescriptorRangeKind, RootSignatureDesc,
        TextureFormat,
    };

    use super::*;
    use crate::fence_pool::FencePool;

    struct Fixture {
        device: Arc<HeadlessDevice>,
        tracker: Arc<ResourceLayoutTracker>,
        context: ListContext,
    }

    fn fixture() -> Fixture {
        let device = Arc::new(HeadlessDevice::new());
        let tracker = Arc::new(ResourceLayoutTracker::new());
        let context = ListContext {
            device: device.clone(),
            tracker: tracker.clone(),
            upload_pool: FencePool::shared(),
            heap_pools: [FencePool::shared(), FencePool::shared()],
            upload_page_size: 4096,
            descriptors_per_heap: 64,
        };
        Fixture {
            device,
            tracker,
            context,
        }
    }

    fn list(fixture: &Fixture) -> CommandList {
        let allocator = CommandAllocator::new(fixture.context.device.clone()).unwrap();
        CommandList::new(&fixture.context, allocator).unwrap()
    }

    fn texture(fixture: &Fixture, raw: u64, mips: u32) -> ResourceId {
        let resource = ResourceId::from_raw(raw);
        fixture.tracker.register_resource(
            resource,
            ResourceLayout::Common,
            SubresourceDesc::new(mips, 1, TextureFormat::Rgba8Unorm),
        );
        resource
    }

    fn submitted_commands(fixture: &Fixture, list: &mut CommandList) -> Vec<RecordedCommand> {
        list.close().unwrap();
        fixture.device.execute_command_lists(&[list.id()]).unwrap();
        fixture
            .device
            .last_submission()
            .map(|submission| submission.lists[0].commands.clone())
            .unwrap_or_default()
    }

    #[test]
    fn test_first_touch_is_pending() {
        let fixture = fixture();
        let texture = texture(&fixture, 100, 1);
        let mut list = list(&fixture);

        list.transition_texture(texture, SubresourceSelection::All, ResourceLayout::CopyDest)
            .unwrap();
        assert_eq!(
            list.pending_transitions(),
            &[PendingTransition {
                resource: texture,
                subresource: 0,
                after: ResourceLayout::CopyDest,
            }]
        );
        assert!(list.barriers.is_empty());
    }

    #[test]
    fn test_second_touch_is_resolved() {
        let fixture = fixture();
        let texture = texture(&fixture, 100, 2);
        let mut list = list(&fixture);

        list.transition_texture(texture, SubresourceSelection::All, ResourceLayout::CopyDest)
            .unwrap();
        list.transition_texture(
            texture,
            SubresourceSelection::Single(1),
            ResourceLayout::ShaderResource,
        )
        .unwrap();
        // same layout again records nothing
        list.transition_texture(
            texture,
            SubresourceSelection::Single(1),
            ResourceLayout::ShaderResource,
        )
        .unwrap();

        assert_eq!(list.pending_transitions().len(), 2);
        assert_eq!(
            list.barriers,
            vec![Barrier::Texture {
                resource: texture,
                subresource: 1,
                before: ResourceLayout::CopyDest,
                after: ResourceLayout::ShaderResource,
            }]
        );
        assert_eq!(
            list.final_layouts()[&texture],
            vec![
                Some(ResourceLayout::CopyDest),
                Some(ResourceLayout::ShaderResource)
            ]
        );
    }

    #[test]
    fn test_range_selection_and_bounds() {
        let fixture = fixture();
        let texture = texture(&fixture, 100, 4);
        let mut list = list(&fixture);

        list.transition_texture(
            texture,
            SubresourceSelection::Range(SubresourceRange {
                base_mip: 1,
                mip_count: 2,
                base_array: 0,
                array_count: 1,
                base_plane: 0,
                plane_count: 1,
            }),
            ResourceLayout::UnorderedAccess,
        )
        .unwrap();
        let subresources: Vec<u32> = list
            .pending_transitions()
            .iter()
            .map(|pending| pending.subresource)
            .collect();
        assert_eq!(subresources, vec![1, 2]);

        assert!(matches!(
            list.transition_texture(
                texture,
                SubresourceSelection::Range(SubresourceRange::mip(4)),
                ResourceLayout::Common,
            ),
            Err(RendererError::SubresourceOutOfRange { count: 4, .. })
        ));
        assert!(matches!(
            list.transition_texture(
                texture,
                SubresourceSelection::Single(4),
                ResourceLayout::Common,
            ),
            Err(RendererError::SubresourceOutOfRange { index: 4, .. })
        ));
    }

    #[test]
    fn test_unregistered_texture_rejected() {
        let fixture = fixture();
        let mut list = list(&fixture);
        let unknown = ResourceId::from_raw(77);
        assert!(matches!(
            list.transition_texture(unknown, SubresourceSelection::All, ResourceLayout::Common),
            Err(RendererError::ResourceNotRegistered(r)) if r == unknown
        ));
    }

    #[test]
    fn test_barrier_batch_flushes_at_limit() {
        let fixture = fixture();
        let mut list = list(&fixture);
        let buffer = ResourceId::from_raw(5);
        for _ in 0..BARRIER_BATCH_LIMIT + 1 {
            list.buffer_barrier(buffer, BufferAccess::CopyDest, BufferAccess::ShaderResource)
                .unwrap();
        }
        assert_eq!(list.barriers.len(), 1);

        let commands = submitted_commands(&fixture, &mut list);
        let sizes: Vec<usize> = commands
            .iter()
            .filter_map(|command| match command {
                RecordedCommand::Barriers(barriers) => Some(barriers.len()),
                _ => None,
            })
            .collect();
        assert_eq!(sizes, vec![BARRIER_BATCH_LIMIT, 1]);
    }

    #[test]
    fn test_staging_requires_root_signature() {
        let fixture = fixture();
        let mut list = list(&fixture);
        let handle = DescriptorHandle::new(lumen_rhi::DescriptorHeapId::from_raw(1), 0);
        assert!(matches!(
            list.stage_descriptors(DescriptorHeapType::CbvSrvUav, 0, 0, &[handle]),
            Err(RendererError::NoRootSignature)
        ));
        assert!(matches!(
            list.set_dynamic_constant_buffer(0, &[0; 16]),
            Err(RendererError::NoRootSignature)
        ));
    }

    #[test]
    fn test_draw_commits_dynamic_constants() {
        let fixture = fixture();
        let mut list = list(&fixture);
        let root = RootSignature::new(
            fixture.context.device.clone(),
            RootSignatureDesc::new()
                .with_inline(InlineDescriptorKind::Cbv, 0)
                .with_table([DescriptorRange::new(DescriptorRangeKind::Srv, 2, 0)]),
        )
        .unwrap();

        list.set_root_signature(PipelineBindPoint::Graphics, &root)
            .unwrap();
        list.set_dynamic_constant(0, &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        list.draw(3, 1, 0, 0).unwrap();

        let commands = submitted_commands(&fixture, &mut list);
        let inline = commands.iter().find_map(|command| match command {
            RecordedCommand::SetInlineDescriptor {
                root_index,
                gpu_address,
                ..
            } => Some((*root_index, *gpu_address)),
            _ => None,
        });
        let (root_index, gpu_address) = inline.unwrap();
        assert_eq!(root_index, 0);
        assert_eq!(gpu_address % CONSTANT_BUFFER_ALIGNMENT, 0);
        assert!(matches!(
            commands.last(),
            Some(RecordedCommand::Draw { vertex_count: 3, .. })
        ));
        assert_eq!(list.take_retired_pages().len(), 1);
    }

    #[test]
    fn test_upload_to_buffer_copies_data() {
        let fixture = fixture();
        let mut list = list(&fixture);
        let dst = fixture
            .device
            .create_buffer(&BufferDesc::new(64, BufferUsage::COPY_DST))
            .unwrap();
        list.upload_to_buffer(dst, 8, &[9, 8, 7, 6]).unwrap();
        submitted_commands(&fixture, &mut list);
        assert_eq!(fixture.device.read_buffer(dst, 8, 4), Some(vec![9, 8, 7, 6]));
    }

    #[test]
    fn test_close_is_idempotent() {
        let fixture = fixture();
        let mut list = list(&fixture);
        list.close().unwrap();
        list.close().unwrap();
        assert!(list.is_closed());
    }

    #[test]
    fn test_rebinding_after_other_bind_point_reparses() {
        let fixture = fixture();
        let mut list = list(&fixture);
        let device = fixture.context.device.clone();
        let wide = RootSignature::new(
            device.clone(),
            RootSignatureDesc::new().with_table([DescriptorRange::new(
                DescriptorRangeKind::Srv,
                4,
                0,
            )]),
        )
        .unwrap();
        let narrow = RootSignature::new(
            device,
            RootSignatureDesc::new().with_table([DescriptorRange::new(
                DescriptorRangeKind::Uav,
                1,
                0,
            )]),
        )
        .unwrap();
        let heap = lumen_rhi::DescriptorHeapId::from_raw(1);
        let handles: Vec<_> = (0..4).map(|i| DescriptorHandle::new(heap, i)).collect();

        list.set_root_signature(PipelineBindPoint::Graphics, &wide)
            .unwrap();
        list.set_root_signature(PipelineBindPoint::Compute, &narrow)
            .unwrap();
        assert!(matches!(
            list.stage_descriptors(DescriptorHeapType::CbvSrvUav, 0, 0, &handles),
            Err(RendererError::DescriptorTableOverflow { .. })
        ));

        list.set_root_signature(PipelineBindPoint::Graphics, &wide)
            .unwrap();
        list.stage_descriptors(DescriptorHeapType::CbvSrvUav, 0, 0, &handles)
            .unwrap();

        let binds = submitted_commands(&fixture, &mut list)
            .into_iter()
            .filter(|command| matches!(command, RecordedCommand::SetRootSignature { .. }))
            .count();
        assert_eq!(binds, 2);
    }

    #[test]
    fn test_inline_descriptor_binds_on_draw() {
        let fixture = fixture();
        let mut list = list(&fixture);
        let root = RootSignature::new(
            fixture.context.device.clone(),
            RootSignatureDesc::new().with_inline(InlineDescriptorKind::Srv, 0),
        )
        .unwrap();

        list.set_root_signature(PipelineBindPoint::Graphics, &root)
            .unwrap();
        list.set_inline_descriptor(0, InlineDescriptorKind::Srv, 0x4000)
            .unwrap();
        list.draw(3, 1, 0, 0).unwrap();

        let commands = submitted_commands(&fixture, &mut list);
        assert!(commands.iter().any(|command| matches!(
            command,
            RecordedCommand::SetInlineDescriptor {
                root_index: 0,
                gpu_address: 0x4000,
                ..
            }
        )));
    }

    #[test]
    fn test_upload_allocation_outlives_list() {
        let fixture = fixture();
        let mut list = list(&fixture);
        let allocation = list.allocate_upload(16, 16).unwrap();
        drop(list);

        allocation.write(&[0xAB; 16]).unwrap();
        assert_eq!(
            fixture
                .device
                .read_buffer(allocation.resource(), allocation.offset(), 16),
            Some(vec![0xAB; 16])
        );
    }
}
