//! Software GPU backend.
//!
//! [`HeadlessDevice`] implements [`GpuDevice`] without a GPU. It keeps every
//! object in memory, records each command into its list and snapshots the
//! lists on submission, so tests can inspect exactly what reached the queue.
//!
//! # Fence modes
//!
//! - [`FenceMode::Immediate`] - the GPU finishes instantly: a signal is
//!   complete as soon as it is enqueued.
//! - [`FenceMode::Manual`] - the fence only advances when the test calls
//!   [`HeadlessDevice::complete_fence`]. Waits block until then.
//!
//! The backend also checks the rules a real driver would punish: recording
//! into a closed list, submitting an open one, resetting an allocator whose
//! lists the GPU has not finished, and writing descriptors outside a heap.
//!
//! Buffer copies are executed on submission, so data written through an
//! upload page can be read back from the destination buffer.

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Condvar, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::descriptor::{
    DescriptorCopy, DescriptorHandle, DescriptorHeapId, DescriptorHeapType, DescriptorWrite,
    InlineDescriptorKind, RootSignatureDesc, RootSignatureId,
};
use crate::device::{
    CommandAllocatorId, CommandListId, DepthStencilBinding, GpuDevice, IndexFormat, MappedPtr,
    PipelineId, RenderTargetBinding, UploadPageInfo,
};
use crate::error::{RhiError, RhiResult};
use crate::resource::{Barrier, BufferDesc, PipelineBindPoint, ResourceId, TextureDesc};

/// First GPU virtual address handed out to buffers.
const GPU_ADDRESS_BASE: u64 = 0x1_0000_0000;
/// Buffers are placed on 64 KiB boundaries in the fake address space.
const GPU_ADDRESS_ALIGNMENT: u64 = 64 * 1024;

/// How the simulated fence advances.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FenceMode {
    #[default]
    Immediate,
    Manual,
}

/// A command as recorded into a headless list.
#[derive(Clone, Debug, PartialEq)]
pub enum RecordedCommand {
    Barriers(Vec<Barrier>),
    SetPipelineState {
        bind_point: PipelineBindPoint,
        pipeline: PipelineId,
    },
    SetRootSignature {
        bind_point: PipelineBindPoint,
        root_signature: RootSignatureId,
    },
    SetDescriptorHeap(DescriptorHeapId),
    SetDescriptorTable {
        bind_point: PipelineBindPoint,
        root_index: u32,
        base: DescriptorHandle,
    },
    SetInlineDescriptor {
        bind_point: PipelineBindPoint,
        root_index: u32,
        kind: InlineDescriptorKind,
        gpu_address: u64,
    },
    SetIndexBuffer {
        resource: ResourceId,
        offset: u64,
        format: IndexFormat,
    },
    CopyBuffer {
        dst: ResourceId,
        dst_offset: u64,
        src: ResourceId,
        src_offset: u64,
        size: u64,
    },
    BeginRenderPass {
        color_targets: Vec<RenderTargetBinding>,
        depth_stencil: Option<DepthStencilBinding>,
    },
    EndRenderPass,
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
}

/// One list as it was when submitted.
#[derive(Clone, Debug, PartialEq)]
pub struct SubmittedList {
    pub list: CommandListId,
    pub allocator: CommandAllocatorId,
    pub commands: Vec<RecordedCommand>,
}

/// One call to [`GpuDevice::execute_command_lists`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Submission {
    pub lists: Vec<SubmittedList>,
    /// Fence value signaled right after this batch, if any.
    pub signaled: Option<u64>,
}

impl Submission {
    /// All barriers of the batch, flattened in execution order.
    pub fn barriers(&self) -> Vec<Barrier> {
        self.lists
            .iter()
            .flat_map(|list| list.commands.iter())
            .filter_map(|command| match command {
                RecordedCommand::Barriers(barriers) => Some(barriers.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

/// Zeroed host allocation standing in for buffer memory.
struct HostMemory {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl HostMemory {
    fn zeroed(size: u64) -> RhiResult<Self> {
        let size = usize::try_from(size)
            .map_err(|_| RhiError::Unsupported(format!("buffer of {} bytes", size)))?;
        if size == 0 {
            return Err(RhiError::InvalidHandle(
                "Buffer size must be greater than 0".to_string(),
            ));
        }
        let layout = Layout::from_size_align(size, 256)
            .map_err(|e| RhiError::Unsupported(e.to_string()))?;
        // Safety: layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr)
            .ok_or_else(|| RhiError::Unsupported("out of host memory".to_string()))?;
        Ok(Self { ptr, layout })
    }

    #[inline]
    fn len(&self) -> u64 {
        self.layout.size() as u64
    }

    fn read(&self, offset: u64, len: u64) -> Option<Vec<u8>> {
        if offset.checked_add(len)? > self.len() {
            return None;
        }
        // Safety: bounds checked above; the allocation lives as long as self.
        let bytes = unsafe {
            std::slice::from_raw_parts(self.ptr.as_ptr().add(offset as usize), len as usize)
        };
        Some(bytes.to_vec())
    }

    fn write(&self, offset: u64, data: &[u8]) -> bool {
        if offset.saturating_add(data.len() as u64) > self.len() {
            return false;
        }
        // Safety: bounds checked above; `data` never aliases this allocation
        // because callers pass a copy.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.ptr.as_ptr().add(offset as usize),
                data.len(),
            );
        }
        true
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        // Safety: allocated in `zeroed` with the same layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// Safety: HostMemory owns its allocation exclusively; concurrent CPU writes
// through mapped pointers target disjoint ranges.
unsafe impl Send for HostMemory {}
unsafe impl Sync for HostMemory {}

enum ResourceRecord {
    Texture(TextureDesc),
    Buffer {
        desc: BufferDesc,
        gpu_address: u64,
        memory: HostMemory,
    },
}

struct HeapRecord {
    heap_type: DescriptorHeapType,
    shader_visible: bool,
    slots: Vec<Option<DescriptorWrite>>,
}

#[derive(Default)]
struct AllocatorRecord {
    /// Submitted but not yet covered by a signal.
    pending_submission: bool,
    /// Fence value that must complete before the next reset.
    retire_fence: u64,
    reset_count: u64,
}

struct ListRecord {
    allocator: CommandAllocatorId,
    open: bool,
    commands: Vec<RecordedCommand>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    next_gpu_address: u64,
    resources: HashMap<ResourceId, ResourceRecord>,
    heaps: HashMap<DescriptorHeapId, HeapRecord>,
    root_signatures: HashMap<RootSignatureId, RootSignatureDesc>,
    allocators: HashMap<CommandAllocatorId, AllocatorRecord>,
    lists: HashMap<CommandListId, ListRecord>,
    submissions: Vec<Submission>,
    heaps_created: u64,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn open_list(&mut self, list: CommandListId) -> RhiResult<&mut ListRecord> {
        let record = self
            .lists
            .get_mut(&list)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", list)))?;
        if !record.open {
            return Err(RhiError::InvalidState(format!(
                "{:?} is closed and cannot record",
                list
            )));
        }
        Ok(record)
    }

    fn record(&mut self, list: CommandListId, command: RecordedCommand) -> RhiResult<()> {
        self.open_list(list)?.commands.push(command);
        Ok(())
    }

    fn check_slot(&self, handle: DescriptorHandle, count: u32) -> RhiResult<&HeapRecord> {
        let heap = self
            .heaps
            .get(&handle.heap)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", handle.heap)))?;
        let end = handle.index as u64 + count as u64;
        if end > heap.slots.len() as u64 {
            return Err(RhiError::InvalidDescriptor(format!(
                "slots {}..{} outside heap of {}",
                handle.index,
                end,
                heap.slots.len()
            )));
        }
        Ok(heap)
    }

    fn buffer(&self, resource: ResourceId) -> RhiResult<(&BufferDesc, u64, &HostMemory)> {
        match self.resources.get(&resource) {
            Some(ResourceRecord::Buffer {
                desc,
                gpu_address,
                memory,
            }) => Ok((desc, *gpu_address, memory)),
            _ => Err(RhiError::InvalidHandle(format!(
                "{:?} is not a buffer",
                resource
            ))),
        }
    }

    fn add_buffer(&mut self, desc: BufferDesc) -> RhiResult<(ResourceId, u64, NonNull<u8>)> {
        let memory = HostMemory::zeroed(desc.size)?;
        let ptr = memory.ptr;
        let gpu_address = GPU_ADDRESS_BASE + self.next_gpu_address;
        self.next_gpu_address += desc.size.div_ceil(GPU_ADDRESS_ALIGNMENT) * GPU_ADDRESS_ALIGNMENT;
        let id = ResourceId::from_raw(self.next_id());
        self.resources.insert(
            id,
            ResourceRecord::Buffer {
                desc,
                gpu_address,
                memory,
            },
        );
        Ok((id, gpu_address, ptr))
    }

    /// Runs the buffer copies of a submitted list.
    fn execute_copies(&self, commands: &[RecordedCommand]) -> RhiResult<()> {
        for command in commands {
            if let RecordedCommand::CopyBuffer {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            } = *command
            {
                let (_, _, src_memory) = self.buffer(src)?;
                let (_, _, dst_memory) = self.buffer(dst)?;
                let bytes = src_memory.read(src_offset, size).ok_or_else(|| {
                    RhiError::InvalidState(format!("copy reads past the end of {:?}", src))
                })?;
                if !dst_memory.write(dst_offset, &bytes) {
                    return Err(RhiError::InvalidState(format!(
                        "copy writes past the end of {:?}",
                        dst
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FenceState {
    signaled: u64,
    completed: u64,
    waits: u64,
}

/// Software implementation of [`GpuDevice`].
pub struct HeadlessDevice {
    mode: FenceMode,
    state: Mutex<State>,
    fence: Mutex<FenceState>,
    fence_advanced: Condvar,
}

impl HeadlessDevice {
    /// Creates a device whose fence completes immediately.
    pub fn new() -> Self {
        Self::with_fence_mode(FenceMode::Immediate)
    }

    pub fn with_fence_mode(mode: FenceMode) -> Self {
        debug!("Headless device created ({:?} fence)", mode);
        Self {
            mode,
            state: Mutex::new(State::default()),
            fence: Mutex::new(FenceState::default()),
            fence_advanced: Condvar::new(),
        }
    }

    #[inline]
    pub fn fence_mode(&self) -> FenceMode {
        self.mode
    }

    fn state(&self) -> RhiResult<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| RhiError::DeviceLost)
    }

    fn fence_state(&self) -> RhiResult<MutexGuard<'_, FenceState>> {
        self.fence.lock().map_err(|_| RhiError::DeviceLost)
    }

    /// Advances the simulated GPU to `value` (clamped to the last signal).
    pub fn complete_fence(&self, value: u64) {
        let Ok(mut fence) = self.fence.lock() else {
            return;
        };
        let value = value.min(fence.signaled);
        if value > fence.completed {
            fence.completed = value;
            self.fence_advanced.notify_all();
        }
    }

    /// Completes every signal enqueued so far.
    pub fn complete_all(&self) {
        let signaled = self.fence.lock().map(|fence| fence.signaled).unwrap_or(0);
        self.complete_fence(signaled);
    }

    /// Last value passed to [`GpuDevice::signal`].
    pub fn last_signaled(&self) -> u64 {
        self.fence.lock().map(|fence| fence.signaled).unwrap_or(0)
    }

    /// How many times [`GpuDevice::wait_for_fence_value`] was called.
    pub fn fence_wait_count(&self) -> u64 {
        self.fence.lock().map(|fence| fence.waits).unwrap_or(0)
    }

    /// Every submission so far, in order.
    pub fn submissions(&self) -> Vec<Submission> {
        self.state
            .lock()
            .map(|state| state.submissions.clone())
            .unwrap_or_default()
    }

    pub fn last_submission(&self) -> Option<Submission> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.submissions.last().cloned())
    }

    /// Contents of a descriptor slot.
    pub fn descriptor(&self, handle: DescriptorHandle) -> Option<DescriptorWrite> {
        let state = self.state.lock().ok()?;
        let heap = state.heaps.get(&handle.heap)?;
        heap.slots.get(handle.index as usize).copied().flatten()
    }

    /// Number of live descriptor heaps.
    pub fn descriptor_heap_count(&self) -> usize {
        self.state.lock().map(|state| state.heaps.len()).unwrap_or(0)
    }

    /// Number of descriptor heaps ever created.
    pub fn descriptor_heaps_created(&self) -> u64 {
        self.state.lock().map(|state| state.heaps_created).unwrap_or(0)
    }

    /// Whether a live heap is shader visible.
    pub fn is_shader_visible(&self, heap: DescriptorHeapId) -> Option<bool> {
        let state = self.state.lock().ok()?;
        state.heaps.get(&heap).map(|heap| heap.shader_visible)
    }

    pub fn command_allocator_count(&self) -> usize {
        self.state.lock().map(|state| state.allocators.len()).unwrap_or(0)
    }

    pub fn command_list_count(&self) -> usize {
        self.state.lock().map(|state| state.lists.len()).unwrap_or(0)
    }

    /// How many times an allocator has been reset.
    pub fn allocator_reset_count(&self, allocator: CommandAllocatorId) -> Option<u64> {
        let state = self.state.lock().ok()?;
        state.allocators.get(&allocator).map(|record| record.reset_count)
    }

    /// Number of live textures, buffers and upload pages.
    pub fn resource_count(&self) -> usize {
        self.state.lock().map(|state| state.resources.len()).unwrap_or(0)
    }

    pub fn texture_desc(&self, resource: ResourceId) -> Option<TextureDesc> {
        let state = self.state.lock().ok()?;
        match state.resources.get(&resource) {
            Some(ResourceRecord::Texture(desc)) => Some(*desc),
            _ => None,
        }
    }

    /// Reads back bytes of a buffer or upload page.
    pub fn read_buffer(&self, resource: ResourceId, offset: u64, len: u64) -> Option<Vec<u8>> {
        let state = self.state.lock().ok()?;
        let (_, _, memory) = state.buffer(resource).ok()?;
        memory.read(offset, len)
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HeadlessDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessDevice")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl GpuDevice for HeadlessDevice {
    fn name(&self) -> &str {
        "headless"
    }

    fn create_texture(&self, desc: &TextureDesc) -> RhiResult<ResourceId> {
        if desc.width == 0 || desc.height == 0 || desc.mip_levels == 0 || desc.array_size == 0 {
            return Err(RhiError::Unsupported(format!(
                "texture with zero extent: {:?}",
                desc
            )));
        }
        let mut state = self.state()?;
        let id = ResourceId::from_raw(state.next_id());
        state.resources.insert(id, ResourceRecord::Texture(*desc));
        debug!(
            "Created texture {:?}: {}x{} {:?}, {} mips",
            id, desc.width, desc.height, desc.format, desc.mip_levels
        );
        Ok(id)
    }

    fn create_buffer(&self, desc: &BufferDesc) -> RhiResult<ResourceId> {
        let (id, _, _) = self.state()?.add_buffer(*desc)?;
        debug!("Created buffer {:?}: {} bytes", id, desc.size);
        Ok(id)
    }

    fn destroy_resource(&self, resource: ResourceId) {
        let Ok(mut state) = self.state() else {
            return;
        };
        if state.resources.remove(&resource).is_none() {
            warn!("Destroying unknown resource {:?}", resource);
        }
    }

    fn buffer_gpu_address(&self, resource: ResourceId) -> RhiResult<u64> {
        let state = self.state()?;
        let (_, gpu_address, _) = state.buffer(resource)?;
        Ok(gpu_address)
    }

    fn descriptor_stride(&self, heap_type: DescriptorHeapType) -> u32 {
        match heap_type {
            DescriptorHeapType::CbvSrvUav => 32,
            DescriptorHeapType::Sampler => 16,
            DescriptorHeapType::Rtv | DescriptorHeapType::Dsv => 8,
        }
    }

    fn create_descriptor_heap(
        &self,
        heap_type: DescriptorHeapType,
        capacity: u32,
        shader_visible: bool,
    ) -> RhiResult<DescriptorHeapId> {
        if capacity == 0 {
            return Err(RhiError::InvalidDescriptor(
                "descriptor heap capacity must be greater than 0".to_string(),
            ));
        }
        if shader_visible && !heap_type.can_be_shader_visible() {
            return Err(RhiError::Unsupported(format!(
                "{} heaps cannot be shader visible",
                heap_type.name()
            )));
        }
        let mut state = self.state()?;
        let id = DescriptorHeapId::from_raw(state.next_id());
        state.heaps.insert(
            id,
            HeapRecord {
                heap_type,
                shader_visible,
                slots: vec![None; capacity as usize],
            },
        );
        state.heaps_created += 1;
        debug!(
            "Created {} descriptor heap {:?}: {} slots{}",
            heap_type.name(),
            id,
            capacity,
            if shader_visible { ", shader visible" } else { "" }
        );
        Ok(id)
    }

    fn destroy_descriptor_heap(&self, heap: DescriptorHeapId) {
        let Ok(mut state) = self.state() else {
            return;
        };
        if state.heaps.remove(&heap).is_none() {
            warn!("Destroying unknown descriptor heap {:?}", heap);
        }
    }

    fn write_descriptor(&self, dst: DescriptorHandle, write: &DescriptorWrite) -> RhiResult<()> {
        let mut state = self.state()?;
        let heap_type = state.check_slot(dst, 1)?.heap_type;
        if write.heap_type() != heap_type {
            return Err(RhiError::InvalidDescriptor(format!(
                "{:?} written into a {} heap",
                write,
                heap_type.name()
            )));
        }
        if let Some(resource) = write.resource() {
            if !state.resources.contains_key(&resource) {
                return Err(RhiError::InvalidHandle(format!("{:?}", resource)));
            }
        }
        if let Some(heap) = state.heaps.get_mut(&dst.heap) {
            heap.slots[dst.index as usize] = Some(*write);
        }
        Ok(())
    }

    fn copy_descriptors(&self, copies: &[DescriptorCopy]) -> RhiResult<()> {
        let mut state = self.state()?;
        for copy in copies {
            let src_type = state.check_slot(copy.src, copy.count)?.heap_type;
            let dst_type = state.check_slot(copy.dst, copy.count)?.heap_type;
            if src_type != dst_type {
                return Err(RhiError::InvalidDescriptor(format!(
                    "copy from {} heap into {} heap",
                    src_type.name(),
                    dst_type.name()
                )));
            }
            let start = copy.src.index as usize;
            let values: Vec<Option<DescriptorWrite>> = state.heaps[&copy.src.heap].slots
                [start..start + copy.count as usize]
                .to_vec();
            if let Some(heap) = state.heaps.get_mut(&copy.dst.heap) {
                let dst_start = copy.dst.index as usize;
                heap.slots[dst_start..dst_start + values.len()].copy_from_slice(&values);
            }
        }
        Ok(())
    }

    fn create_upload_page(&self, size: u64) -> RhiResult<UploadPageInfo> {
        let desc = BufferDesc {
            size,
            usage: crate::resource::BufferUsage::COPY_SRC | crate::resource::BufferUsage::CONSTANT,
            host_visible: true,
        };
        let (resource, gpu_address, ptr) = self.state()?.add_buffer(desc)?;
        debug!("Created upload page {:?}: {} bytes", resource, size);
        Ok(UploadPageInfo {
            resource,
            size,
            gpu_address,
            mapped: MappedPtr::new(ptr),
        })
    }

    fn create_root_signature(&self, desc: &RootSignatureDesc) -> RhiResult<RootSignatureId> {
        desc.validate().map_err(RhiError::Unsupported)?;
        let mut state = self.state()?;
        let id = RootSignatureId::from_raw(state.next_id());
        state.root_signatures.insert(id, desc.clone());
        debug!(
            "Created root signature {:?} with {} parameters",
            id,
            desc.parameters.len()
        );
        Ok(id)
    }

    fn destroy_root_signature(&self, root_signature: RootSignatureId) {
        let Ok(mut state) = self.state() else {
            return;
        };
        state.root_signatures.remove(&root_signature);
    }

    fn create_command_allocator(&self) -> RhiResult<CommandAllocatorId> {
        let mut state = self.state()?;
        let id = CommandAllocatorId::from_raw(state.next_id());
        state.allocators.insert(id, AllocatorRecord::default());
        debug!("Created command allocator {:?}", id);
        Ok(id)
    }

    fn reset_command_allocator(&self, allocator: CommandAllocatorId) -> RhiResult<()> {
        let completed = self.fence_state()?.completed;
        let mut state = self.state()?;
        let record = state
            .allocators
            .get_mut(&allocator)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", allocator)))?;
        if record.pending_submission || record.retire_fence > completed {
            return Err(RhiError::InvalidState(format!(
                "{:?} reset while the GPU may still use it (needs fence {}, completed {})",
                allocator, record.retire_fence, completed
            )));
        }
        record.reset_count += 1;
        Ok(())
    }

    fn destroy_command_allocator(&self, allocator: CommandAllocatorId) {
        let Ok(mut state) = self.state() else {
            return;
        };
        state.allocators.remove(&allocator);
    }

    fn create_command_list(&self, allocator: CommandAllocatorId) -> RhiResult<CommandListId> {
        let mut state = self.state()?;
        if !state.allocators.contains_key(&allocator) {
            return Err(RhiError::InvalidHandle(format!("{:?}", allocator)));
        }
        let id = CommandListId::from_raw(state.next_id());
        state.lists.insert(
            id,
            ListRecord {
                allocator,
                open: true,
                commands: Vec::new(),
            },
        );
        debug!("Created command list {:?}", id);
        Ok(id)
    }

    fn reset_command_list(
        &self,
        list: CommandListId,
        allocator: CommandAllocatorId,
    ) -> RhiResult<()> {
        let mut state = self.state()?;
        if !state.allocators.contains_key(&allocator) {
            return Err(RhiError::InvalidHandle(format!("{:?}", allocator)));
        }
        let record = state
            .lists
            .get_mut(&list)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", list)))?;
        if record.open {
            return Err(RhiError::InvalidState(format!(
                "{:?} reset while still recording",
                list
            )));
        }
        record.allocator = allocator;
        record.open = true;
        record.commands.clear();
        Ok(())
    }

    fn close_command_list(&self, list: CommandListId) -> RhiResult<()> {
        let mut state = self.state()?;
        state.open_list(list)?.open = false;
        Ok(())
    }

    fn destroy_command_list(&self, list: CommandListId) {
        let Ok(mut state) = self.state() else {
            return;
        };
        state.lists.remove(&list);
    }

    fn record_barriers(&self, list: CommandListId, barriers: &[Barrier]) -> RhiResult<()> {
        if barriers.is_empty() {
            return Ok(());
        }
        self.state()?
            .record(list, RecordedCommand::Barriers(barriers.to_vec()))
    }

    fn set_pipeline_state(
        &self,
        list: CommandListId,
        bind_point: PipelineBindPoint,
        pipeline: PipelineId,
    ) -> RhiResult<()> {
        self.state()?.record(
            list,
            RecordedCommand::SetPipelineState {
                bind_point,
                pipeline,
            },
        )
    }

    fn set_root_signature(
        &self,
        list: CommandListId,
        bind_point: PipelineBindPoint,
        root_signature: RootSignatureId,
    ) -> RhiResult<()> {
        let mut state = self.state()?;
        if !state.root_signatures.contains_key(&root_signature) {
            return Err(RhiError::InvalidHandle(format!("{:?}", root_signature)));
        }
        state.record(
            list,
            RecordedCommand::SetRootSignature {
                bind_point,
                root_signature,
            },
        )
    }

    fn set_descriptor_heap(&self, list: CommandListId, heap: DescriptorHeapId) -> RhiResult<()> {
        let mut state = self.state()?;
        match state.heaps.get(&heap) {
            Some(record) if record.shader_visible => {}
            Some(_) => {
                return Err(RhiError::InvalidState(format!(
                    "{:?} is not shader visible",
                    heap
                )));
            }
            None => return Err(RhiError::InvalidHandle(format!("{:?}", heap))),
        }
        state.record(list, RecordedCommand::SetDescriptorHeap(heap))
    }

    fn set_root_descriptor_table(
        &self,
        list: CommandListId,
        bind_point: PipelineBindPoint,
        root_index: u32,
        base: DescriptorHandle,
    ) -> RhiResult<()> {
        let mut state = self.state()?;
        state.check_slot(base, 0)?;
        state.record(
            list,
            RecordedCommand::SetDescriptorTable {
                bind_point,
                root_index,
                base,
            },
        )
    }

    fn set_root_inline_descriptor(
        &self,
        list: CommandListId,
        bind_point: PipelineBindPoint,
        root_index: u32,
        kind: InlineDescriptorKind,
        gpu_address: u64,
    ) -> RhiResult<()> {
        self.state()?.record(
            list,
            RecordedCommand::SetInlineDescriptor {
                bind_point,
                root_index,
                kind,
                gpu_address,
            },
        )
    }

    fn set_index_buffer(
        &self,
        list: CommandListId,
        resource: ResourceId,
        offset: u64,
        format: IndexFormat,
    ) -> RhiResult<()> {
        let mut state = self.state()?;
        state.buffer(resource)?;
        state.record(
            list,
            RecordedCommand::SetIndexBuffer {
                resource,
                offset,
                format,
            },
        )
    }

    fn copy_buffer_region(
        &self,
        list: CommandListId,
        dst: ResourceId,
        dst_offset: u64,
        src: ResourceId,
        src_offset: u64,
        size: u64,
    ) -> RhiResult<()> {
        let mut state = self.state()?;
        state.buffer(dst)?;
        state.buffer(src)?;
        state.record(
            list,
            RecordedCommand::CopyBuffer {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            },
        )
    }

    fn begin_render_pass(
        &self,
        list: CommandListId,
        color_targets: &[RenderTargetBinding],
        depth_stencil: Option<&DepthStencilBinding>,
    ) -> RhiResult<()> {
        let mut state = self.state()?;
        for target in color_targets {
            state.check_slot(target.view, 1)?;
        }
        if let Some(depth) = depth_stencil {
            state.check_slot(depth.view, 1)?;
        }
        state.record(
            list,
            RecordedCommand::BeginRenderPass {
                color_targets: color_targets.to_vec(),
                depth_stencil: depth_stencil.copied(),
            },
        )
    }

    fn end_render_pass(&self, list: CommandListId) -> RhiResult<()> {
        self.state()?.record(list, RecordedCommand::EndRenderPass)
    }

    fn draw(
        &self,
        list: CommandListId,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> RhiResult<()> {
        self.state()?.record(
            list,
            RecordedCommand::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            },
        )
    }

    fn draw_indexed(
        &self,
        list: CommandListId,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    ) -> RhiResult<()> {
        self.state()?.record(
            list,
            RecordedCommand::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                base_vertex,
                first_instance,
            },
        )
    }

    fn dispatch(&self, list: CommandListId, x: u32, y: u32, z: u32) -> RhiResult<()> {
        self.state()?
            .record(list, RecordedCommand::Dispatch { x, y, z })
    }

    fn execute_command_lists(&self, lists: &[CommandListId]) -> RhiResult<()> {
        let mut state = self.state()?;
        let mut submission = Submission::default();
        for &list in lists {
            let record = state
                .lists
                .get(&list)
                .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", list)))?;
            if record.open {
                return Err(RhiError::InvalidState(format!(
                    "{:?} submitted without being closed",
                    list
                )));
            }
            submission.lists.push(SubmittedList {
                list,
                allocator: record.allocator,
                commands: record.commands.clone(),
            });
        }
        for submitted in &submission.lists {
            state.execute_copies(&submitted.commands)?;
            if let Some(allocator) = state.allocators.get_mut(&submitted.allocator) {
                allocator.pending_submission = true;
            }
        }
        state.submissions.push(submission);
        Ok(())
    }

    fn signal(&self, value: u64) -> RhiResult<()> {
        {
            let mut state = self.state()?;
            for allocator in state.allocators.values_mut() {
                if allocator.pending_submission {
                    allocator.pending_submission = false;
                    allocator.retire_fence = value;
                }
            }
            if let Some(last) = state.submissions.last_mut() {
                if last.signaled.is_none() {
                    last.signaled = Some(value);
                }
            }
        }
        let mut fence = self.fence_state()?;
        if value < fence.signaled {
            return Err(RhiError::InvalidState(format!(
                "fence signaled backwards: {} after {}",
                value, fence.signaled
            )));
        }
        fence.signaled = value;
        if self.mode == FenceMode::Immediate {
            fence.completed = value;
            self.fence_advanced.notify_all();
        }
        Ok(())
    }

    fn completed_fence_value(&self) -> RhiResult<u64> {
        Ok(self.fence_state()?.completed)
    }

    fn wait_for_fence_value(&self, value: u64) -> RhiResult<()> {
        let mut fence = self.fence_state()?;
        fence.waits += 1;
        if value > fence.signaled {
            return Err(RhiError::InvalidState(format!(
                "waiting for fence {} which was never signaled (last {})",
                value, fence.signaled
            )));
        }
        while fence.completed < value {
            fence = self
                .fence_advanced
                .wait(fence)
                .map_err(|_| RhiError::DeviceLost)?;
        }
        Ok(())
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let signaled = self.fence_state()?.signaled;
        self.wait_for_fence_value(signaled)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::resource::{BufferUsage, ResourceLayout, TextureFormat, TextureUsage};

    fn open_list(device: &HeadlessDevice) -> (CommandAllocatorId, CommandListId) {
        let allocator = device.create_command_allocator().unwrap();
        let list = device.create_command_list(allocator).unwrap();
        (allocator, list)
    }

    #[test]
    fn test_headless_device_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HeadlessDevice>();
    }

    #[test]
    fn test_immediate_fence_completes_on_signal() {
        let device = HeadlessDevice::new();
        device.signal(3).unwrap();
        assert_eq!(device.completed_fence_value().unwrap(), 3);
        device.wait_for_fence_value(3).unwrap();
    }

    #[test]
    fn test_manual_fence_waits_for_completion() {
        let device = Arc::new(HeadlessDevice::with_fence_mode(FenceMode::Manual));
        device.signal(1).unwrap();
        assert_eq!(device.completed_fence_value().unwrap(), 0);

        let gpu = {
            let device = Arc::clone(&device);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                device.complete_fence(1);
            })
        };
        device.wait_for_fence_value(1).unwrap();
        assert_eq!(device.completed_fence_value().unwrap(), 1);
        gpu.join().unwrap();
    }

    #[test]
    fn test_wait_for_unsignaled_value_fails() {
        let device = HeadlessDevice::with_fence_mode(FenceMode::Manual);
        assert!(matches!(
            device.wait_for_fence_value(1),
            Err(RhiError::InvalidState(_))
        ));
    }

    #[test]
    fn test_complete_fence_is_clamped_to_signal() {
        let device = HeadlessDevice::with_fence_mode(FenceMode::Manual);
        device.signal(2).unwrap();
        device.complete_fence(10);
        assert_eq!(device.completed_fence_value().unwrap(), 2);
    }

    #[test]
    fn test_recording_into_closed_list_fails() {
        let device = HeadlessDevice::new();
        let (_, list) = open_list(&device);
        device.close_command_list(list).unwrap();
        assert!(matches!(
            device.dispatch(list, 1, 1, 1),
            Err(RhiError::InvalidState(_))
        ));
    }

    #[test]
    fn test_submitting_open_list_fails() {
        let device = HeadlessDevice::new();
        let (_, list) = open_list(&device);
        assert!(device.execute_command_lists(&[list]).is_err());
    }

    #[test]
    fn test_allocator_reset_requires_retired_fence() {
        let device = HeadlessDevice::with_fence_mode(FenceMode::Manual);
        let (allocator, list) = open_list(&device);
        device.close_command_list(list).unwrap();
        device.execute_command_lists(&[list]).unwrap();
        device.signal(1).unwrap();

        assert!(device.reset_command_allocator(allocator).is_err());
        device.complete_fence(1);
        device.reset_command_allocator(allocator).unwrap();
        assert_eq!(device.allocator_reset_count(allocator), Some(1));
    }

    #[test]
    fn test_submission_snapshot() {
        let device = HeadlessDevice::new();
        let texture = device
            .create_texture(&TextureDesc::new_2d(
                4,
                4,
                TextureFormat::Rgba8Unorm,
                TextureUsage::SAMPLED,
            ))
            .unwrap();
        let (_, list) = open_list(&device);
        let barrier = Barrier::Texture {
            resource: texture,
            subresource: 0,
            before: ResourceLayout::Common,
            after: ResourceLayout::ShaderResource,
        };
        device.record_barriers(list, &[barrier]).unwrap();
        device.draw(list, 3, 1, 0, 0).unwrap();
        device.close_command_list(list).unwrap();
        device.execute_command_lists(&[list]).unwrap();
        device.signal(1).unwrap();

        let submission = device.last_submission().unwrap();
        assert_eq!(submission.signaled, Some(1));
        assert_eq!(submission.barriers(), vec![barrier]);
        assert_eq!(submission.lists[0].commands.len(), 2);
    }

    #[test]
    fn test_descriptor_write_and_copy() {
        let device = HeadlessDevice::new();
        let texture = device
            .create_texture(&TextureDesc::new_2d(
                4,
                4,
                TextureFormat::Rgba8Unorm,
                TextureUsage::SAMPLED,
            ))
            .unwrap();
        let staging = device
            .create_descriptor_heap(DescriptorHeapType::CbvSrvUav, 4, false)
            .unwrap();
        let visible = device
            .create_descriptor_heap(DescriptorHeapType::CbvSrvUav, 8, true)
            .unwrap();
        let write = DescriptorWrite::ShaderResource { resource: texture };
        device
            .write_descriptor(DescriptorHandle::new(staging, 1), &write)
            .unwrap();
        device
            .copy_descriptors(&[DescriptorCopy {
                src: DescriptorHandle::new(staging, 1),
                dst: DescriptorHandle::new(visible, 6),
                count: 1,
            }])
            .unwrap();
        assert_eq!(
            device.descriptor(DescriptorHandle::new(visible, 6)),
            Some(write)
        );

        let overflow = DescriptorCopy {
            src: DescriptorHandle::new(staging, 0),
            dst: DescriptorHandle::new(visible, 6),
            count: 4,
        };
        assert!(matches!(
            device.copy_descriptors(&[overflow]),
            Err(RhiError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn test_wrong_heap_type_rejected() {
        let device = HeadlessDevice::new();
        let heap = device
            .create_descriptor_heap(DescriptorHeapType::Sampler, 4, false)
            .unwrap();
        let buffer = device
            .create_buffer(&BufferDesc::new(256, BufferUsage::CONSTANT))
            .unwrap();
        let write = DescriptorWrite::ConstantBuffer {
            resource: buffer,
            offset: 0,
            size: 256,
        };
        assert!(
            device
                .write_descriptor(DescriptorHandle::new(heap, 0), &write)
                .is_err()
        );
        assert!(
            device
                .create_descriptor_heap(DescriptorHeapType::Rtv, 4, true)
                .is_err()
        );
    }

    #[test]
    fn test_copy_executes_on_submission() {
        let device = HeadlessDevice::new();
        let page = device.create_upload_page(1024).unwrap();
        let dst = device
            .create_buffer(&BufferDesc::new(64, BufferUsage::COPY_DST))
            .unwrap();
        // Safety: the page is 1024 bytes and nothing else writes to it.
        unsafe {
            std::ptr::copy_nonoverlapping([7u8, 8, 9].as_ptr(), page.mapped.as_ptr().add(16), 3);
        }
        let (_, list) = open_list(&device);
        device
            .copy_buffer_region(list, dst, 4, page.resource, 16, 3)
            .unwrap();
        device.close_command_list(list).unwrap();
        device.execute_command_lists(&[list]).unwrap();

        assert_eq!(device.read_buffer(dst, 4, 3), Some(vec![7, 8, 9]));
    }

    #[test]
    fn test_buffer_addresses_do_not_overlap() {
        let device = HeadlessDevice::new();
        let a = device.create_upload_page(100_000).unwrap();
        let b = device.create_upload_page(16).unwrap();
        assert!(b.gpu_address >= a.gpu_address + a.size);
        assert_eq!(device.buffer_gpu_address(a.resource).unwrap(), a.gpu_address);
    }
}
