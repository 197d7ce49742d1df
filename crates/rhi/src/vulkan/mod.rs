//! Vulkan 1.3 implementation of [`GpuDevice`].
//!
//! # Overview
//!
//! [`VulkanDevice`] maps the lifecycle core's D3D12-shaped model onto Vulkan:
//!
//! | model | Vulkan |
//! |---|---|
//! | queue fence | timeline semaphore ([`sync::TimelineFence`]) |
//! | command allocator | transient command pool |
//! | command list | primary command buffer |
//! | CBV/SRV/UAV and sampler heaps | update-after-bind descriptor sets |
//! | RTV/DSV heaps | host arrays of image views |
//! | root signature | push-constant offsets in one shared pipeline layout |
//!
//! Every root signature maps to the same `VkPipelineLayout`, so switching
//! root signatures never disturbs bound descriptor sets. Pipelines are
//! created outside this crate against [`VulkanDevice::pipeline_layout`] and
//! registered with [`VulkanDevice::import_pipeline`].
//!
//! # Thread Safety
//!
//! All objects live behind a single mutex; recording, descriptor updates and
//! submission take it for the duration of the call.

mod buffer;
mod command;
mod descriptor;
mod device;
mod instance;
mod physical_device;
mod sync;
mod texture;

pub use physical_device::PhysicalDeviceInfo;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use ash::vk;
use tracing::{debug, info, warn};

use crate::descriptor::{
    DescriptorCopy, DescriptorHandle, DescriptorHeapId, DescriptorHeapType, DescriptorWrite,
    InlineDescriptorKind, RootSignatureDesc, RootSignatureId,
};
use crate::device::{
    CommandAllocatorId, CommandListId, DepthStencilBinding, GpuDevice, IndexFormat, MappedPtr,
    PipelineId, RenderTargetBinding, UploadPageInfo,
};
use crate::error::{RhiError, RhiResult};
use crate::resource::{
    Barrier, BufferDesc, PipelineBindPoint, ResourceId, ResourceLayout, TextureDesc,
    split_subresource_index,
};

use buffer::Buffer;
use command::{CommandBuffer, CommandPool};
use descriptor::{
    AttachmentView, DescriptorHeap, DescriptorPayload, DescriptorSetLayout, HostHeap,
    PipelineLayout, RESOURCE_SET, RootLayout, SAMPLER_SET, SamplerCache, SetHeap, SlotKind,
};
use device::Device;
use instance::Instance;
use sync::TimelineFence;
use texture::{Texture, ViewKind};

/// Upper bound on slots of a shader-visible CBV/SRV/UAV heap.
const MAX_RESOURCE_SLOTS: u32 = 16384;
/// Upper bound on slots of a shader-visible sampler heap.
const MAX_SAMPLER_SLOTS: u32 = 2048;
/// Upper bound on the root parameter push-constant block.
const MAX_ROOT_BYTES: u32 = 256;

enum Resource {
    Buffer(Buffer),
    Texture(Texture),
}

struct ListState {
    /// `None` after the allocator it came from was destroyed.
    buffer: Option<CommandBuffer>,
    allocator: CommandAllocatorId,
    open: bool,
    /// Root signature per bind point (graphics, compute).
    root: [Option<RootSignatureId>; 2],
}

#[derive(Default)]
struct Objects {
    next_id: u64,
    resources: HashMap<ResourceId, Resource>,
    heaps: HashMap<DescriptorHeapId, DescriptorHeap>,
    root_signatures: HashMap<RootSignatureId, RootLayout>,
    pools: HashMap<CommandAllocatorId, CommandPool>,
    lists: HashMap<CommandListId, ListState>,
    pipelines: HashMap<PipelineId, vk::Pipeline>,
}

impl Objects {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn buffer(&self, resource: ResourceId) -> RhiResult<&Buffer> {
        match self.resources.get(&resource) {
            Some(Resource::Buffer(buffer)) => Ok(buffer),
            _ => Err(RhiError::InvalidHandle(format!(
                "{:?} is not a buffer",
                resource
            ))),
        }
    }

    fn texture(&self, resource: ResourceId) -> RhiResult<&Texture> {
        match self.resources.get(&resource) {
            Some(Resource::Texture(texture)) => Ok(texture),
            _ => Err(RhiError::InvalidHandle(format!(
                "{:?} is not a texture",
                resource
            ))),
        }
    }

    fn open_list(&self, list: CommandListId) -> RhiResult<(&ListState, &CommandBuffer)> {
        let state = self
            .lists
            .get(&list)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", list)))?;
        match (&state.buffer, state.open) {
            (Some(buffer), true) => Ok((state, buffer)),
            _ => Err(RhiError::InvalidState(format!(
                "{:?} is closed and cannot record",
                list
            ))),
        }
    }

    fn attachment(
        &self,
        handle: DescriptorHandle,
        heap_type: DescriptorHeapType,
    ) -> RhiResult<AttachmentView> {
        match self.heaps.get(&handle.heap) {
            Some(DescriptorHeap::Host(heap)) if heap.heap_type == heap_type => {
                heap.get(handle.index)
            }
            Some(_) => Err(RhiError::InvalidDescriptor(format!(
                "{:?} is not a {} heap",
                handle.heap,
                heap_type.name()
            ))),
            None => Err(RhiError::InvalidHandle(format!("{:?}", handle.heap))),
        }
    }

    /// Push-constant offset of a root parameter of the bound root signature.
    fn root_offset(
        &self,
        state: &ListState,
        bind_point: PipelineBindPoint,
        root_index: u32,
    ) -> RhiResult<u32> {
        let root_signature = state.root[bind_point_index(bind_point)].ok_or_else(|| {
            RhiError::InvalidState(format!("no {:?} root signature bound", bind_point))
        })?;
        let layout = self
            .root_signatures
            .get(&root_signature)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", root_signature)))?;
        layout
            .offsets
            .get(root_index as usize)
            .copied()
            .ok_or_else(|| {
                RhiError::InvalidState(format!(
                    "root parameter {} outside {:?} of {} parameters",
                    root_index,
                    root_signature,
                    layout.offsets.len()
                ))
            })
    }
}

#[inline]
fn bind_point_index(bind_point: PipelineBindPoint) -> usize {
    match bind_point {
        PipelineBindPoint::Graphics => 0,
        PipelineBindPoint::Compute => 1,
    }
}

/// Resolves a descriptor write into what a set slot stores.
fn resolve_payload(
    objects: &Objects,
    samplers: &mut SamplerCache,
    write: &DescriptorWrite,
) -> RhiResult<DescriptorPayload> {
    match *write {
        DescriptorWrite::ConstantBuffer {
            resource,
            offset,
            size,
        }
        | DescriptorWrite::StructuredBuffer {
            resource,
            offset,
            size,
        }
        | DescriptorWrite::UnorderedAccessBuffer {
            resource,
            offset,
            size,
        } => {
            let buffer = objects.buffer(resource)?;
            if offset.saturating_add(size) > buffer.size() {
                return Err(RhiError::InvalidDescriptor(format!(
                    "view {}..{} outside {:?} of {} bytes",
                    offset,
                    offset.saturating_add(size),
                    resource,
                    buffer.size()
                )));
            }
            Ok(DescriptorPayload::Buffer {
                buffer: buffer.handle(),
                offset,
                range: size,
            })
        }
        DescriptorWrite::ShaderResource { resource } => {
            let texture = objects.texture(resource)?;
            Ok(DescriptorPayload::Image {
                kind: SlotKind::SampledImage,
                view: texture.view(ViewKind::Sampled)?,
                layout: ResourceLayout::ShaderResource.to_vk(),
            })
        }
        DescriptorWrite::UnorderedAccess {
            resource,
            mip_slice,
        } => {
            let texture = objects.texture(resource)?;
            Ok(DescriptorPayload::Image {
                kind: SlotKind::StorageImage,
                view: texture.view(ViewKind::Storage { mip: mip_slice })?,
                layout: ResourceLayout::UnorderedAccess.to_vk(),
            })
        }
        DescriptorWrite::Sampler(desc) => Ok(DescriptorPayload::Sampler(samplers.get(&desc)?)),
        DescriptorWrite::RenderTarget { .. } | DescriptorWrite::DepthStencil { .. } => {
            Err(RhiError::InvalidDescriptor(format!(
                "{:?} cannot be stored in a descriptor set",
                write
            )))
        }
    }
}

fn attachment_view(
    objects: &Objects,
    resource: ResourceId,
    mip_slice: u32,
    array_slice: u32,
) -> RhiResult<AttachmentView> {
    let texture = objects.texture(resource)?;
    let view = texture.view(ViewKind::Attachment {
        mip: mip_slice,
        slice: array_slice,
    })?;
    let extent = texture.extent();
    Ok(AttachmentView {
        resource,
        view,
        format: texture.desc().format,
        extent: vk::Extent2D {
            width: (extent.width >> mip_slice).max(1),
            height: (extent.height >> mip_slice).max(1),
        },
    })
}

fn attachment_info(
    view: &AttachmentView,
    layout: vk::ImageLayout,
    clear: Option<vk::ClearValue>,
) -> vk::RenderingAttachmentInfo<'static> {
    let info = vk::RenderingAttachmentInfo::default()
        .image_view(view.view)
        .image_layout(layout)
        .store_op(vk::AttachmentStoreOp::STORE);
    match clear {
        Some(value) => info.load_op(vk::AttachmentLoadOp::CLEAR).clear_value(value),
        None => info.load_op(vk::AttachmentLoadOp::LOAD),
    }
}

/// Vulkan backend.
pub struct VulkanDevice {
    /// Dropped before the layouts and the device.
    objects: Mutex<Objects>,
    /// Locked after `objects` when both are needed.
    samplers: Mutex<SamplerCache>,
    fence: TimelineFence,
    pipeline_layout: PipelineLayout,
    resource_layout: Arc<DescriptorSetLayout>,
    sampler_layout: Arc<DescriptorSetLayout>,
    device: Arc<Device>,
}

impl VulkanDevice {
    /// Creates an instance, picks the best GPU and opens its direct queue.
    ///
    /// # Errors
    ///
    /// [`RhiError::LoadingError`] without a Vulkan loader,
    /// [`RhiError::NoSuitableGpu`] when no device supports the required
    /// features.
    pub fn new(enable_validation: bool) -> RhiResult<Self> {
        let instance = Arc::new(Instance::new(enable_validation)?);
        let info = physical_device::select_physical_device(instance.handle())?;
        let device = Device::new(instance, info)?;

        let resource_slots = MAX_RESOURCE_SLOTS.min(info.max_update_after_bind_resources);
        let sampler_slots = MAX_SAMPLER_SLOTS.min(info.max_update_after_bind_samplers);
        let resource_layout = Arc::new(DescriptorSetLayout::new(
            device.clone(),
            DescriptorHeapType::CbvSrvUav,
            resource_slots,
        )?);
        let sampler_layout = Arc::new(DescriptorSetLayout::new(
            device.clone(),
            DescriptorHeapType::Sampler,
            sampler_slots,
        )?);
        let pipeline_layout = PipelineLayout::new(
            device.clone(),
            &resource_layout,
            &sampler_layout,
            MAX_ROOT_BYTES.min(info.max_push_constants_size()),
        )?;
        let fence = TimelineFence::new(device.clone(), 0)?;

        info!(
            "Vulkan device ready: {} resource slots, {} sampler slots per visible heap",
            resource_slots, sampler_slots
        );

        Ok(Self {
            objects: Mutex::new(Objects::default()),
            samplers: Mutex::new(SamplerCache::new(device.clone())),
            fence,
            pipeline_layout,
            resource_layout,
            sampler_layout,
            device,
        })
    }

    /// Capabilities of the selected GPU.
    pub fn info(&self) -> &PhysicalDeviceInfo {
        self.device.info()
    }

    /// The layout every pipeline bound through this device must be created with.
    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout.handle()
    }

    /// Raw device handle for creating pipelines.
    pub fn raw_device(&self) -> &ash::Device {
        self.device.handle()
    }

    /// Registers an externally created pipeline. The pipeline stays owned
    /// by the caller and must outlive every list that binds it.
    pub fn import_pipeline(&self, pipeline: vk::Pipeline) -> RhiResult<PipelineId> {
        let mut objects = self.objects()?;
        let id = PipelineId::from_raw(objects.next_id());
        objects.pipelines.insert(id, pipeline);
        Ok(id)
    }

    /// Forgets an imported pipeline.
    pub fn release_pipeline(&self, pipeline: PipelineId) -> Option<vk::Pipeline> {
        self.objects().ok()?.pipelines.remove(&pipeline)
    }

    fn objects(&self) -> RhiResult<MutexGuard<'_, Objects>> {
        self.objects.lock().map_err(|_| RhiError::DeviceLost)
    }

    fn image_barrier(
        objects: &Objects,
        resource: ResourceId,
        subresource: u32,
        before: ResourceLayout,
        after: ResourceLayout,
    ) -> RhiResult<vk::ImageMemoryBarrier2<'static>> {
        let texture = objects.texture(resource)?;
        let desc = texture.desc();
        if subresource >= desc.subresource_count() {
            return Err(RhiError::InvalidState(format!(
                "subresource {} of {:?} with {} subresources",
                subresource,
                resource,
                desc.subresource_count()
            )));
        }
        let (mip, array, plane) =
            split_subresource_index(subresource, desc.mip_levels, desc.array_size);
        let (src_stage, src_access) = before.to_vk_sync();
        let (dst_stage, dst_access) = after.to_vk_sync();
        Ok(vk::ImageMemoryBarrier2::default()
            .src_stage_mask(src_stage)
            .src_access_mask(src_access)
            .dst_stage_mask(dst_stage)
            .dst_access_mask(dst_access)
            .old_layout(before.to_vk_plane(desc.format, plane))
            .new_layout(after.to_vk_plane(desc.format, plane))
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(texture.handle())
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: desc.format.plane_aspect(plane),
                base_mip_level: mip,
                level_count: 1,
                base_array_layer: array,
                layer_count: 1,
            }))
    }
}

impl std::fmt::Debug for VulkanDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanDevice")
            .field("gpu", self.device.info())
            .finish_non_exhaustive()
    }
}

impl GpuDevice for VulkanDevice {
    fn name(&self) -> &str {
        "vulkan"
    }

    // =========================================================================
    // Resources
    // =========================================================================

    fn create_texture(&self, desc: &TextureDesc) -> RhiResult<ResourceId> {
        let texture = Texture::new(self.device.clone(), *desc)?;
        let mut objects = self.objects()?;
        let id = ResourceId::from_raw(objects.next_id());
        objects.resources.insert(id, Resource::Texture(texture));
        Ok(id)
    }

    fn create_buffer(&self, desc: &BufferDesc) -> RhiResult<ResourceId> {
        let buffer = Buffer::new(self.device.clone(), *desc, "buffer")?;
        let mut objects = self.objects()?;
        let id = ResourceId::from_raw(objects.next_id());
        objects.resources.insert(id, Resource::Buffer(buffer));
        Ok(id)
    }

    fn destroy_resource(&self, resource: ResourceId) {
        let Ok(mut objects) = self.objects() else {
            return;
        };
        if objects.resources.remove(&resource).is_none() {
            warn!("Destroying unknown resource {:?}", resource);
        }
    }

    fn buffer_gpu_address(&self, resource: ResourceId) -> RhiResult<u64> {
        Ok(self.objects()?.buffer(resource)?.gpu_address())
    }

    // =========================================================================
    // Descriptors
    // =========================================================================

    fn descriptor_stride(&self, heap_type: DescriptorHeapType) -> u32 {
        // Host-side size of one slot's contents; sets are addressed by index.
        let size = match heap_type {
            DescriptorHeapType::CbvSrvUav => std::mem::size_of::<vk::DescriptorImageInfo>()
                .max(std::mem::size_of::<vk::DescriptorBufferInfo>()),
            DescriptorHeapType::Sampler => std::mem::size_of::<vk::Sampler>(),
            DescriptorHeapType::Rtv | DescriptorHeapType::Dsv => {
                std::mem::size_of::<AttachmentView>()
            }
        };
        size as u32
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

        let heap = match heap_type {
            DescriptorHeapType::Rtv | DescriptorHeapType::Dsv => {
                DescriptorHeap::Host(HostHeap::new(heap_type, capacity))
            }
            DescriptorHeapType::CbvSrvUav | DescriptorHeapType::Sampler => {
                let layout = match (shader_visible, heap_type) {
                    (true, DescriptorHeapType::Sampler) => self.sampler_layout.clone(),
                    (true, _) => self.resource_layout.clone(),
                    (false, _) => Arc::new(DescriptorSetLayout::new(
                        self.device.clone(),
                        heap_type,
                        capacity,
                    )?),
                };
                DescriptorHeap::Set(SetHeap::new(
                    self.device.clone(),
                    heap_type,
                    layout,
                    capacity,
                    shader_visible,
                )?)
            }
        };

        let mut objects = self.objects()?;
        let id = DescriptorHeapId::from_raw(objects.next_id());
        objects.heaps.insert(id, heap);
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
        let Ok(mut objects) = self.objects() else {
            return;
        };
        if objects.heaps.remove(&heap).is_none() {
            warn!("Destroying unknown descriptor heap {:?}", heap);
        }
    }

    fn write_descriptor(&self, dst: DescriptorHandle, write: &DescriptorWrite) -> RhiResult<()> {
        let mut guard = self.objects()?;
        let objects = &mut *guard;
        let heap_type = objects
            .heaps
            .get(&dst.heap)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", dst.heap)))?
            .heap_type();
        if write.heap_type() != heap_type {
            return Err(RhiError::InvalidDescriptor(format!(
                "{:?} written into a {} heap",
                write,
                heap_type.name()
            )));
        }

        match *write {
            DescriptorWrite::RenderTarget {
                resource,
                mip_slice,
                array_slice,
            }
            | DescriptorWrite::DepthStencil {
                resource,
                mip_slice,
                array_slice,
            } => {
                let view = attachment_view(objects, resource, mip_slice, array_slice)?;
                if let Some(DescriptorHeap::Host(heap)) = objects.heaps.get_mut(&dst.heap) {
                    heap.check_range(dst.index, 1)?;
                    heap.slots[dst.index as usize] = Some(view);
                }
                Ok(())
            }
            _ => {
                let payload = {
                    let mut samplers = self.samplers.lock().map_err(|_| RhiError::DeviceLost)?;
                    resolve_payload(objects, &mut samplers, write)?
                };
                match objects.heaps.get_mut(&dst.heap) {
                    Some(DescriptorHeap::Set(heap)) => heap.write(dst.index, payload),
                    _ => Err(RhiError::InvalidHandle(format!("{:?}", dst.heap))),
                }
            }
        }
    }

    fn copy_descriptors(&self, copies: &[DescriptorCopy]) -> RhiResult<()> {
        let mut guard = self.objects()?;
        let objects = &mut *guard;
        for copy in copies {
            let src = objects
                .heaps
                .get(&copy.src.heap)
                .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", copy.src.heap)))?;
            let src_type = src.heap_type();
            match src {
                DescriptorHeap::Set(src) => {
                    let src_set = src.set();
                    let kinds = src.slot_kinds(copy.src.index, copy.count)?.to_vec();
                    match objects.heaps.get_mut(&copy.dst.heap) {
                        Some(DescriptorHeap::Set(dst)) if dst.heap_type() == src_type => {
                            dst.copy_from(src_set, copy.src.index, &kinds, copy.dst.index)?;
                        }
                        Some(dst) => {
                            return Err(RhiError::InvalidDescriptor(format!(
                                "copy from {} heap into {} heap",
                                src_type.name(),
                                dst.heap_type().name()
                            )));
                        }
                        None => {
                            return Err(RhiError::InvalidHandle(format!("{:?}", copy.dst.heap)));
                        }
                    }
                }
                DescriptorHeap::Host(src) => {
                    src.check_range(copy.src.index, copy.count)?;
                    let start = copy.src.index as usize;
                    let views = src.slots[start..start + copy.count as usize].to_vec();
                    match objects.heaps.get_mut(&copy.dst.heap) {
                        Some(DescriptorHeap::Host(dst)) if dst.heap_type == src_type => {
                            dst.check_range(copy.dst.index, copy.count)?;
                            let dst_start = copy.dst.index as usize;
                            dst.slots[dst_start..dst_start + views.len()].copy_from_slice(&views);
                        }
                        Some(dst) => {
                            return Err(RhiError::InvalidDescriptor(format!(
                                "copy from {} heap into {} heap",
                                src_type.name(),
                                dst.heap_type().name()
                            )));
                        }
                        None => {
                            return Err(RhiError::InvalidHandle(format!("{:?}", copy.dst.heap)));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Upload pages and root signatures
    // =========================================================================

    fn create_upload_page(&self, size: u64) -> RhiResult<UploadPageInfo> {
        let page = Buffer::new_upload_page(self.device.clone(), size)?;
        let mapped = page.mapped_ptr().ok_or_else(|| {
            RhiError::Unsupported("upload page memory is not host mappable".to_string())
        })?;
        let gpu_address = page.gpu_address();
        let mut objects = self.objects()?;
        let resource = ResourceId::from_raw(objects.next_id());
        objects.resources.insert(resource, Resource::Buffer(page));
        debug!("Created upload page {:?}: {} bytes", resource, size);
        Ok(UploadPageInfo {
            resource,
            size,
            gpu_address,
            mapped: MappedPtr::new(mapped),
        })
    }

    fn create_root_signature(&self, desc: &RootSignatureDesc) -> RhiResult<RootSignatureId> {
        let layout = RootLayout::new(desc, self.pipeline_layout.push_constant_size())?;
        let mut objects = self.objects()?;
        let id = RootSignatureId::from_raw(objects.next_id());
        debug!(
            "Created root signature {:?}: {} parameters, {} bytes",
            id,
            desc.parameters.len(),
            layout.size
        );
        objects.root_signatures.insert(id, layout);
        Ok(id)
    }

    fn destroy_root_signature(&self, root_signature: RootSignatureId) {
        if let Ok(mut objects) = self.objects() {
            objects.root_signatures.remove(&root_signature);
        }
    }

    // =========================================================================
    // Command allocators and lists
    // =========================================================================

    fn create_command_allocator(&self) -> RhiResult<CommandAllocatorId> {
        let pool = CommandPool::new(self.device.clone())?;
        let mut objects = self.objects()?;
        let id = CommandAllocatorId::from_raw(objects.next_id());
        objects.pools.insert(id, pool);
        Ok(id)
    }

    fn reset_command_allocator(&self, allocator: CommandAllocatorId) -> RhiResult<()> {
        let objects = self.objects()?;
        objects
            .pools
            .get(&allocator)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", allocator)))?
            .reset()
    }

    fn destroy_command_allocator(&self, allocator: CommandAllocatorId) {
        let Ok(mut objects) = self.objects() else {
            return;
        };
        if objects.pools.remove(&allocator).is_some() {
            // The pool freed its buffers; lists from it start over on reset.
            for list in objects.lists.values_mut() {
                if list.allocator == allocator {
                    list.buffer = None;
                    list.open = false;
                }
            }
        }
    }

    fn create_command_list(&self, allocator: CommandAllocatorId) -> RhiResult<CommandListId> {
        let mut objects = self.objects()?;
        let pool = objects
            .pools
            .get(&allocator)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", allocator)))?;
        let buffer = CommandBuffer::new(self.device.clone(), pool)?;
        let id = CommandListId::from_raw(objects.next_id());
        objects.lists.insert(
            id,
            ListState {
                buffer: Some(buffer),
                allocator,
                open: true,
                root: [None; 2],
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
        let mut guard = self.objects()?;
        let objects = &mut *guard;
        let pool = objects
            .pools
            .get(&allocator)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", allocator)))?;
        let state = objects
            .lists
            .get_mut(&list)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", list)))?;
        if state.open {
            return Err(RhiError::InvalidState(format!(
                "{:?} reset while still recording",
                list
            )));
        }
        match state.buffer.as_mut() {
            Some(buffer) => buffer.reset(pool)?,
            None => state.buffer = Some(CommandBuffer::new(self.device.clone(), pool)?),
        }
        state.allocator = allocator;
        state.open = true;
        state.root = [None; 2];
        Ok(())
    }

    fn close_command_list(&self, list: CommandListId) -> RhiResult<()> {
        let mut objects = self.objects()?;
        objects.open_list(list)?.1.end()?;
        if let Some(state) = objects.lists.get_mut(&list) {
            state.open = false;
        }
        Ok(())
    }

    fn destroy_command_list(&self, list: CommandListId) {
        let Ok(mut objects) = self.objects() else {
            return;
        };
        if let Some(state) = objects.lists.remove(&list) {
            if let Some(buffer) = state.buffer {
                if objects.pools.contains_key(&state.allocator) {
                    buffer.free();
                }
            }
        }
    }

    // =========================================================================
    // Recording
    // =========================================================================

    fn record_barriers(&self, list: CommandListId, barriers: &[Barrier]) -> RhiResult<()> {
        if barriers.is_empty() {
            return Ok(());
        }
        let objects = self.objects()?;
        let (_, buffer) = objects.open_list(list)?;

        let mut image_barriers = Vec::new();
        let mut buffer_barriers = Vec::new();
        for barrier in barriers {
            match *barrier {
                Barrier::Texture {
                    resource,
                    subresource,
                    before,
                    after,
                } => {
                    image_barriers.push(Self::image_barrier(
                        &objects,
                        resource,
                        subresource,
                        before,
                        after,
                    )?);
                }
                Barrier::Buffer {
                    resource,
                    before,
                    after,
                } => {
                    let target = objects.buffer(resource)?;
                    let (src_stage, src_access) = before.to_vk_sync();
                    let (dst_stage, dst_access) = after.to_vk_sync();
                    buffer_barriers.push(
                        vk::BufferMemoryBarrier2::default()
                            .src_stage_mask(src_stage)
                            .src_access_mask(src_access)
                            .dst_stage_mask(dst_stage)
                            .dst_access_mask(dst_access)
                            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                            .buffer(target.handle())
                            .offset(0)
                            .size(vk::WHOLE_SIZE),
                    );
                }
            }
        }
        buffer.pipeline_barrier2(&buffer_barriers, &image_barriers);
        Ok(())
    }

    fn set_pipeline_state(
        &self,
        list: CommandListId,
        bind_point: PipelineBindPoint,
        pipeline: PipelineId,
    ) -> RhiResult<()> {
        let objects = self.objects()?;
        let (_, buffer) = objects.open_list(list)?;
        let pipeline = objects
            .pipelines
            .get(&pipeline)
            .copied()
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", pipeline)))?;
        buffer.bind_pipeline(bind_point.to_vk(), pipeline);
        Ok(())
    }

    fn set_root_signature(
        &self,
        list: CommandListId,
        bind_point: PipelineBindPoint,
        root_signature: RootSignatureId,
    ) -> RhiResult<()> {
        let mut objects = self.objects()?;
        if !objects.root_signatures.contains_key(&root_signature) {
            return Err(RhiError::InvalidHandle(format!("{:?}", root_signature)));
        }
        objects.open_list(list)?;
        if let Some(state) = objects.lists.get_mut(&list) {
            state.root[bind_point_index(bind_point)] = Some(root_signature);
        }
        Ok(())
    }

    fn set_descriptor_heap(&self, list: CommandListId, heap: DescriptorHeapId) -> RhiResult<()> {
        let objects = self.objects()?;
        let (_, buffer) = objects.open_list(list)?;
        let (set, set_index) = match objects.heaps.get(&heap) {
            Some(DescriptorHeap::Set(set_heap)) if set_heap.is_shader_visible() => {
                let set_index = match set_heap.heap_type() {
                    DescriptorHeapType::Sampler => SAMPLER_SET,
                    _ => RESOURCE_SET,
                };
                (set_heap.set(), set_index)
            }
            Some(_) => {
                return Err(RhiError::InvalidState(format!(
                    "{:?} is not shader visible",
                    heap
                )));
            }
            None => return Err(RhiError::InvalidHandle(format!("{:?}", heap))),
        };
        for bind_point in [vk::PipelineBindPoint::GRAPHICS, vk::PipelineBindPoint::COMPUTE] {
            buffer.bind_descriptor_set(bind_point, self.pipeline_layout.handle(), set_index, set);
        }
        Ok(())
    }

    fn set_root_descriptor_table(
        &self,
        list: CommandListId,
        bind_point: PipelineBindPoint,
        root_index: u32,
        base: DescriptorHandle,
    ) -> RhiResult<()> {
        let objects = self.objects()?;
        let (state, buffer) = objects.open_list(list)?;
        let offset = objects.root_offset(state, bind_point, root_index)?;
        if !objects.heaps.contains_key(&base.heap) {
            return Err(RhiError::InvalidHandle(format!("{:?}", base.heap)));
        }
        buffer.push_constants(
            self.pipeline_layout.handle(),
            offset,
            &base.index.to_ne_bytes(),
        );
        Ok(())
    }

    fn set_root_inline_descriptor(
        &self,
        list: CommandListId,
        bind_point: PipelineBindPoint,
        root_index: u32,
        _kind: InlineDescriptorKind,
        gpu_address: u64,
    ) -> RhiResult<()> {
        let objects = self.objects()?;
        let (state, buffer) = objects.open_list(list)?;
        let offset = objects.root_offset(state, bind_point, root_index)?;
        buffer.push_constants(
            self.pipeline_layout.handle(),
            offset,
            &gpu_address.to_ne_bytes(),
        );
        Ok(())
    }

    fn set_index_buffer(
        &self,
        list: CommandListId,
        resource: ResourceId,
        offset: u64,
        format: IndexFormat,
    ) -> RhiResult<()> {
        let objects = self.objects()?;
        let (_, buffer) = objects.open_list(list)?;
        let index_buffer = objects.buffer(resource)?;
        let index_type = match format {
            IndexFormat::U16 => vk::IndexType::UINT16,
            IndexFormat::U32 => vk::IndexType::UINT32,
        };
        buffer.bind_index_buffer(index_buffer.handle(), offset, index_type);
        Ok(())
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
        let objects = self.objects()?;
        let (_, buffer) = objects.open_list(list)?;
        let dst_buffer = objects.buffer(dst)?;
        let src_buffer = objects.buffer(src)?;
        if src_offset.saturating_add(size) > src_buffer.size()
            || dst_offset.saturating_add(size) > dst_buffer.size()
        {
            return Err(RhiError::InvalidState(format!(
                "copy of {} bytes outside {:?} or {:?}",
                size, src, dst
            )));
        }
        buffer.copy_buffer(
            src_buffer.handle(),
            dst_buffer.handle(),
            vk::BufferCopy {
                src_offset,
                dst_offset,
                size,
            },
        );
        Ok(())
    }

    fn begin_render_pass(
        &self,
        list: CommandListId,
        color_targets: &[RenderTargetBinding],
        depth_stencil: Option<&DepthStencilBinding>,
    ) -> RhiResult<()> {
        let objects = self.objects()?;
        let (_, buffer) = objects.open_list(list)?;

        let mut extent: Option<vk::Extent2D> = None;
        let mut fit = |view: &AttachmentView| {
            extent = Some(match extent {
                Some(e) => vk::Extent2D {
                    width: e.width.min(view.extent.width),
                    height: e.height.min(view.extent.height),
                },
                None => view.extent,
            });
        };

        let mut colors = Vec::with_capacity(color_targets.len());
        for target in color_targets {
            let view = objects.attachment(target.view, DescriptorHeapType::Rtv)?;
            fit(&view);
            let clear = target.clear.map(|float32| vk::ClearValue {
                color: vk::ClearColorValue { float32 },
            });
            colors.push(attachment_info(
                &view,
                ResourceLayout::RenderTarget.to_vk(),
                clear,
            ));
        }

        let mut depth = None;
        let mut stencil = None;
        if let Some(binding) = depth_stencil {
            let view = objects.attachment(binding.view, DescriptorHeapType::Dsv)?;
            fit(&view);
            let clear = |depth: f32, stencil: u32| vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
            };
            let layout = ResourceLayout::DepthStencilWrite.to_vk();
            depth = Some(attachment_info(
                &view,
                layout,
                binding.clear_depth.map(|d| clear(d, 0)),
            ));
            if view.format.has_stencil() {
                stencil = Some(attachment_info(
                    &view,
                    layout,
                    binding.clear_stencil.map(|s| clear(1.0, s)),
                ));
            }
        }

        let extent = extent.ok_or_else(|| {
            RhiError::InvalidState("render pass without attachments".to_string())
        })?;
        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .layer_count(1)
            .color_attachments(&colors);
        if let Some(depth) = depth.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth);
        }
        if let Some(stencil) = stencil.as_ref() {
            rendering_info = rendering_info.stencil_attachment(stencil);
        }
        buffer.begin_rendering(&rendering_info);
        Ok(())
    }

    fn end_render_pass(&self, list: CommandListId) -> RhiResult<()> {
        self.objects()?.open_list(list)?.1.end_rendering();
        Ok(())
    }

    fn draw(
        &self,
        list: CommandListId,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> RhiResult<()> {
        self.objects()?.open_list(list)?.1.draw(
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        );
        Ok(())
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
        self.objects()?.open_list(list)?.1.draw_indexed(
            index_count,
            instance_count,
            first_index,
            base_vertex,
            first_instance,
        );
        Ok(())
    }

    fn dispatch(&self, list: CommandListId, x: u32, y: u32, z: u32) -> RhiResult<()> {
        self.objects()?.open_list(list)?.1.dispatch(x, y, z);
        Ok(())
    }

    // =========================================================================
    // Queue
    // =========================================================================

    fn execute_command_lists(&self, lists: &[CommandListId]) -> RhiResult<()> {
        let objects = self.objects()?;
        let mut buffers = Vec::with_capacity(lists.len());
        for &list in lists {
            let state = objects
                .lists
                .get(&list)
                .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", list)))?;
            match (&state.buffer, state.open) {
                (Some(buffer), false) => buffers
                    .push(vk::CommandBufferSubmitInfo::default().command_buffer(buffer.handle())),
                _ => {
                    return Err(RhiError::InvalidState(format!(
                        "{:?} submitted without being closed",
                        list
                    )));
                }
            }
        }
        if buffers.is_empty() {
            return Ok(());
        }
        let submit = [vk::SubmitInfo2::default().command_buffer_infos(&buffers)];
        // Safety: every buffer is closed and the objects lock keeps them alive
        // through the call; the caller keeps them alive until the fence passes.
        unsafe { self.device.submit(&submit) }
    }

    fn signal(&self, value: u64) -> RhiResult<()> {
        self.fence.signal(value)
    }

    fn completed_fence_value(&self) -> RhiResult<u64> {
        self.fence.completed_value()
    }

    fn wait_for_fence_value(&self, value: u64) -> RhiResult<()> {
        self.fence.wait(value)
    }

    fn wait_idle(&self) -> RhiResult<()> {
        self.device.wait_idle()
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            warn!("Failed to wait for device idle during drop: {:?}", e);
        }
        if let Ok(objects) = self.objects.get_mut() {
            // Return buffers to live pools before the pools go.
            for (_, state) in objects.lists.drain() {
                if let Some(buffer) = state.buffer {
                    if objects.pools.contains_key(&state.allocator) {
                        buffer.free();
                    }
                }
            }
        }
        debug!("Vulkan device shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{DescriptorRange, DescriptorRangeKind};
    use crate::resource::{BufferUsage, TextureFormat, TextureUsage};

    fn device() -> Option<VulkanDevice> {
        match VulkanDevice::new(false) {
            Ok(device) => Some(device),
            Err(RhiError::LoadingError(_) | RhiError::NoSuitableGpu | RhiError::VulkanError(_)) => {
                eprintln!("Skipping test: no Vulkan 1.3 device");
                None
            }
            Err(e) => panic!("Unexpected error: {:?}", e),
        }
    }

    #[test]
    fn test_vulkan_device_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<VulkanDevice>();
    }

    #[test]
    fn test_fence_signal_and_wait() {
        let Some(device) = device() else { return };
        let allocator = device.create_command_allocator().unwrap();
        let list = device.create_command_list(allocator).unwrap();
        device.close_command_list(list).unwrap();
        device.execute_command_lists(&[list]).unwrap();
        device.signal(1).unwrap();
        device.wait_for_fence_value(1).unwrap();
        assert!(device.completed_fence_value().unwrap() >= 1);

        device.reset_command_allocator(allocator).unwrap();
        device.reset_command_list(list, allocator).unwrap();
        device.close_command_list(list).unwrap();
        device.destroy_command_list(list);
        device.destroy_command_allocator(allocator);
    }

    #[test]
    fn test_descriptor_write_and_copy() {
        let Some(device) = device() else { return };
        let buffer = device
            .create_buffer(&BufferDesc::new(256, BufferUsage::CONSTANT))
            .unwrap();
        let staging = device
            .create_descriptor_heap(DescriptorHeapType::CbvSrvUav, 4, false)
            .unwrap();
        let visible = device
            .create_descriptor_heap(DescriptorHeapType::CbvSrvUav, 4, true)
            .unwrap();
        device
            .write_descriptor(
                DescriptorHandle::new(staging, 1),
                &DescriptorWrite::ConstantBuffer {
                    resource: buffer,
                    offset: 0,
                    size: 256,
                },
            )
            .unwrap();
        device
            .copy_descriptors(&[DescriptorCopy {
                src: DescriptorHandle::new(staging, 0),
                dst: DescriptorHandle::new(visible, 0),
                count: 4,
            }])
            .unwrap();

        let out_of_range = device.copy_descriptors(&[DescriptorCopy {
            src: DescriptorHandle::new(staging, 2),
            dst: DescriptorHandle::new(visible, 0),
            count: 4,
        }]);
        assert!(matches!(out_of_range, Err(RhiError::InvalidDescriptor(_))));
    }

    #[test]
    fn test_render_target_heap_rejects_shader_visibility() {
        let Some(device) = device() else { return };
        let result = device.create_descriptor_heap(DescriptorHeapType::Rtv, 8, true);
        assert!(matches!(result, Err(RhiError::Unsupported(_))));
    }

    #[test]
    fn test_texture_barrier_and_render_pass() {
        let Some(device) = device() else { return };
        let texture = device
            .create_texture(&TextureDesc::new_2d(
                64,
                64,
                TextureFormat::Rgba8Unorm,
                TextureUsage::RENDER_TARGET | TextureUsage::SAMPLED,
            ))
            .unwrap();
        let rtv = device
            .create_descriptor_heap(DescriptorHeapType::Rtv, 1, false)
            .unwrap();
        let view = DescriptorHandle::new(rtv, 0);
        device
            .write_descriptor(
                view,
                &DescriptorWrite::RenderTarget {
                    resource: texture,
                    mip_slice: 0,
                    array_slice: 0,
                },
            )
            .unwrap();

        let allocator = device.create_command_allocator().unwrap();
        let list = device.create_command_list(allocator).unwrap();
        device
            .record_barriers(
                list,
                &[Barrier::Texture {
                    resource: texture,
                    subresource: 0,
                    before: ResourceLayout::Undefined,
                    after: ResourceLayout::RenderTarget,
                }],
            )
            .unwrap();
        device
            .begin_render_pass(
                list,
                &[RenderTargetBinding {
                    view,
                    clear: Some([0.0, 0.0, 0.0, 1.0]),
                }],
                None,
            )
            .unwrap();
        device.end_render_pass(list).unwrap();
        device.close_command_list(list).unwrap();
        device.execute_command_lists(&[list]).unwrap();
        device.signal(1).unwrap();
        device.wait_for_fence_value(1).unwrap();
    }

    #[test]
    fn test_root_table_requires_root_signature() {
        let Some(device) = device() else { return };
        let heap = device
            .create_descriptor_heap(DescriptorHeapType::CbvSrvUav, 8, true)
            .unwrap();
        let root_signature = device
            .create_root_signature(
                &RootSignatureDesc::new()
                    .with_table([DescriptorRange::new(DescriptorRangeKind::Srv, 8, 0)]),
            )
            .unwrap();
        let allocator = device.create_command_allocator().unwrap();
        let list = device.create_command_list(allocator).unwrap();
        let base = DescriptorHandle::new(heap, 0);

        let unbound =
            device.set_root_descriptor_table(list, PipelineBindPoint::Graphics, 0, base);
        assert!(matches!(unbound, Err(RhiError::InvalidState(_))));

        device
            .set_root_signature(list, PipelineBindPoint::Graphics, root_signature)
            .unwrap();
        device.set_descriptor_heap(list, heap).unwrap();
        device
            .set_root_descriptor_table(list, PipelineBindPoint::Graphics, 0, base)
            .unwrap();
        device.close_command_list(list).unwrap();
    }
}
