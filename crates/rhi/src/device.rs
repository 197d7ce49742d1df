//! The [`GpuDevice`] trait: everything the lifecycle core needs from a GPU.
//!
//! # Overview
//!
//! The trait is object safe and used as `Arc<dyn GpuDevice>`. Objects are
//! referred to by opaque ids; the backend owns the API handles behind them.
//!
//! The trait models one direct queue with a monotonic fence:
//! [`signal`](GpuDevice::signal) enqueues a fence value after all previously
//! submitted work, [`completed_fence_value`](GpuDevice::completed_fence_value)
//! reports the highest value the GPU has reached.
//!
//! Recording methods take a [`CommandListId`]; the list must have been reset
//! against an allocator and not yet closed.

use std::fmt;
use std::ptr::NonNull;

use crate::descriptor::{
    DescriptorCopy, DescriptorHandle, DescriptorHeapId, DescriptorHeapType, DescriptorWrite,
    InlineDescriptorKind, RootSignatureDesc, RootSignatureId,
};
use crate::error::RhiResult;
use crate::resource::{Barrier, BufferDesc, PipelineBindPoint, ResourceId, TextureDesc};

crate::define_id!(
    /// Opaque id of a command allocator (Vulkan command pool).
    CommandAllocatorId
);

crate::define_id!(
    /// Opaque id of a command list (Vulkan command buffer).
    CommandListId
);

crate::define_id!(
    /// Opaque id of an externally created pipeline state object.
    PipelineId
);

/// Persistently mapped CPU pointer into an upload page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MappedPtr(NonNull<u8>);

impl MappedPtr {
    #[inline]
    pub fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    #[inline]
    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Pointer `offset` bytes further into the mapping.
    ///
    /// # Safety
    ///
    /// `offset` must stay within the mapped allocation.
    #[inline]
    pub unsafe fn add(self, offset: usize) -> Self {
        // Safety: in-bounds offsets of a non-null mapping are non-null.
        Self(unsafe { self.0.add(offset) })
    }
}

// Safety: the pointer refers to mapped memory owned by the backend for the
// lifetime of the page. Callers write disjoint sub-ranges handed out by the
// upload buffer, so sharing the address across threads is sound.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

/// A CPU-write / GPU-read buffer created for the upload allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UploadPageInfo {
    /// Buffer resource; destroyed with [`GpuDevice::destroy_resource`].
    pub resource: ResourceId,
    /// Size in bytes.
    pub size: u64,
    /// GPU virtual address of byte 0.
    pub gpu_address: u64,
    /// CPU address of byte 0.
    pub mapped: MappedPtr,
}

/// Width of indices in an index buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U16,
    U32,
}

/// Colour attachment of a render pass, addressed by an RTV handle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderTargetBinding {
    pub view: DescriptorHandle,
    /// Clear colour, or `None` to load existing contents.
    pub clear: Option<[f32; 4]>,
}

/// Depth/stencil attachment of a render pass, addressed by a DSV handle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DepthStencilBinding {
    pub view: DescriptorHandle,
    pub clear_depth: Option<f32>,
    pub clear_stencil: Option<u32>,
}

/// Backend interface used by the lifecycle core.
///
/// All methods take `&self`; backends synchronise internally.
pub trait GpuDevice: Send + Sync + fmt::Debug {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    // --- Resources ---

    fn create_texture(&self, desc: &TextureDesc) -> RhiResult<ResourceId>;

    fn create_buffer(&self, desc: &BufferDesc) -> RhiResult<ResourceId>;

    /// Destroys a texture, buffer or upload page. Unknown ids are ignored.
    fn destroy_resource(&self, resource: ResourceId);

    /// GPU virtual address of a buffer.
    fn buffer_gpu_address(&self, resource: ResourceId) -> RhiResult<u64>;

    // --- Descriptors ---

    /// Distance in bytes between two adjacent slots of a heap of this type.
    fn descriptor_stride(&self, heap_type: DescriptorHeapType) -> u32;

    /// Creates a heap of `capacity` slots. Only CBV/SRV/UAV and sampler heaps
    /// may be shader visible.
    fn create_descriptor_heap(
        &self,
        heap_type: DescriptorHeapType,
        capacity: u32,
        shader_visible: bool,
    ) -> RhiResult<DescriptorHeapId>;

    fn destroy_descriptor_heap(&self, heap: DescriptorHeapId);

    /// Writes a view into one slot.
    fn write_descriptor(&self, dst: DescriptorHandle, write: &DescriptorWrite) -> RhiResult<()>;

    /// Copies contiguous runs of descriptors, in order.
    fn copy_descriptors(&self, copies: &[DescriptorCopy]) -> RhiResult<()>;

    // --- Upload pages ---

    /// Creates a persistently mapped buffer of `size` bytes.
    fn create_upload_page(&self, size: u64) -> RhiResult<UploadPageInfo>;

    // --- Root signatures ---

    fn create_root_signature(&self, desc: &RootSignatureDesc) -> RhiResult<RootSignatureId>;

    fn destroy_root_signature(&self, root_signature: RootSignatureId);

    // --- Command allocators and lists ---

    fn create_command_allocator(&self) -> RhiResult<CommandAllocatorId>;

    /// Resets an allocator. The GPU must have finished every list recorded from it.
    fn reset_command_allocator(&self, allocator: CommandAllocatorId) -> RhiResult<()>;

    fn destroy_command_allocator(&self, allocator: CommandAllocatorId);

    /// Creates a list recording from `allocator`, open for recording.
    fn create_command_list(&self, allocator: CommandAllocatorId) -> RhiResult<CommandListId>;

    /// Re-opens a closed list against `allocator`.
    fn reset_command_list(
        &self,
        list: CommandListId,
        allocator: CommandAllocatorId,
    ) -> RhiResult<()>;

    fn close_command_list(&self, list: CommandListId) -> RhiResult<()>;

    fn destroy_command_list(&self, list: CommandListId);

    // --- Recording ---

    fn record_barriers(&self, list: CommandListId, barriers: &[Barrier]) -> RhiResult<()>;

    fn set_pipeline_state(
        &self,
        list: CommandListId,
        bind_point: PipelineBindPoint,
        pipeline: PipelineId,
    ) -> RhiResult<()>;

    fn set_root_signature(
        &self,
        list: CommandListId,
        bind_point: PipelineBindPoint,
        root_signature: RootSignatureId,
    ) -> RhiResult<()>;

    /// Binds a shader-visible heap for its heap type.
    fn set_descriptor_heap(&self, list: CommandListId, heap: DescriptorHeapId) -> RhiResult<()>;

    /// Points a descriptor table parameter at `base` in a bound heap.
    fn set_root_descriptor_table(
        &self,
        list: CommandListId,
        bind_point: PipelineBindPoint,
        root_index: u32,
        base: DescriptorHandle,
    ) -> RhiResult<()>;

    /// Binds a buffer by GPU address to an inline descriptor parameter.
    fn set_root_inline_descriptor(
        &self,
        list: CommandListId,
        bind_point: PipelineBindPoint,
        root_index: u32,
        kind: InlineDescriptorKind,
        gpu_address: u64,
    ) -> RhiResult<()>;

    fn set_index_buffer(
        &self,
        list: CommandListId,
        resource: ResourceId,
        offset: u64,
        format: IndexFormat,
    ) -> RhiResult<()>;

    #[allow(clippy::too_many_arguments)]
    fn copy_buffer_region(
        &self,
        list: CommandListId,
        dst: ResourceId,
        dst_offset: u64,
        src: ResourceId,
        src_offset: u64,
        size: u64,
    ) -> RhiResult<()>;

    fn begin_render_pass(
        &self,
        list: CommandListId,
        color_targets: &[RenderTargetBinding],
        depth_stencil: Option<&DepthStencilBinding>,
    ) -> RhiResult<()>;

    fn end_render_pass(&self, list: CommandListId) -> RhiResult<()>;

    fn draw(
        &self,
        list: CommandListId,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> RhiResult<()>;

    #[allow(clippy::too_many_arguments)]
    fn draw_indexed(
        &self,
        list: CommandListId,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    ) -> RhiResult<()>;

    fn dispatch(&self, list: CommandListId, x: u32, y: u32, z: u32) -> RhiResult<()>;

    // --- Queue ---

    /// Submits closed lists in order as one batch.
    fn execute_command_lists(&self, lists: &[CommandListId]) -> RhiResult<()>;

    /// Enqueues a fence signal of `value` after all submitted work.
    fn signal(&self, value: u64) -> RhiResult<()>;

    /// Highest fence value the GPU has reached.
    fn completed_fence_value(&self) -> RhiResult<u64>;

    /// Blocks until the fence reaches `value`.
    fn wait_for_fence_value(&self, value: u64) -> RhiResult<()>;

    /// Blocks until all submitted work has finished.
    fn wait_idle(&self) -> RhiResult<()>;
}
