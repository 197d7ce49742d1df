//! Descriptor heaps expressed with Vulkan descriptor sets.
//!
//! # Overview
//!
//! A CBV/SRV/UAV heap of `N` slots is one descriptor set with three aliased
//! arrays of `N` elements:
//!
//! | binding | type | holds |
//! |---|---|---|
//! | 0 | `SAMPLED_IMAGE` | shader resource views of textures |
//! | 1 | `STORAGE_IMAGE` | unordered access views of textures |
//! | 2 | `STORAGE_BUFFER` | constant, structured and UAV buffers |
//!
//! Slot `i` lives at element `i` of whichever binding matches what was last
//! written there; the heap remembers that per slot so copies target the right
//! binding. A sampler heap is a single `SAMPLER` array.
//!
//! Every set is created with update-after-bind and partially-bound flags, so
//! slots can be rewritten while other slots of the same set are in use.
//!
//! Shader-visible heaps of one type share a single [`DescriptorSetLayout`] so
//! one pipeline layout fits all of them. RTV and DSV heaps never reach a
//! shader; they are host arrays of image views ([`HostHeap`]).
//!
//! Descriptor tables and inline descriptors become push constants in the
//! shared [`PipelineLayout`]: 4 bytes (the table's first slot) per table,
//! 8 bytes (a buffer device address) per inline descriptor.

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::descriptor::{
    DescriptorHeapType, RootParameter, RootSignatureDesc, SamplerAddressMode, SamplerDesc,
    SamplerFilter,
};
use crate::error::{RhiError, RhiResult};
use crate::resource::{ResourceId, TextureFormat};

use super::device::Device;

/// Binding of sampled images in a CBV/SRV/UAV set.
pub const SAMPLED_IMAGE_BINDING: u32 = 0;
/// Binding of storage images in a CBV/SRV/UAV set.
pub const STORAGE_IMAGE_BINDING: u32 = 1;
/// Binding of storage buffers in a CBV/SRV/UAV set.
pub const STORAGE_BUFFER_BINDING: u32 = 2;
/// Binding of samplers in a sampler set.
pub const SAMPLER_BINDING: u32 = 0;

/// Set index of the resource heap in every pipeline layout.
pub const RESOURCE_SET: u32 = 0;
/// Set index of the sampler heap in every pipeline layout.
pub const SAMPLER_SET: u32 = 1;

/// What a descriptor slot currently holds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SlotKind {
    #[default]
    Empty,
    SampledImage,
    StorageImage,
    StorageBuffer,
    Sampler,
}

impl SlotKind {
    /// Binding that stores this kind, `None` for an empty slot.
    pub fn binding(self) -> Option<u32> {
        match self {
            Self::Empty => None,
            Self::SampledImage => Some(SAMPLED_IMAGE_BINDING),
            Self::StorageImage => Some(STORAGE_IMAGE_BINDING),
            Self::StorageBuffer => Some(STORAGE_BUFFER_BINDING),
            Self::Sampler => Some(SAMPLER_BINDING),
        }
    }
}

/// Resolved contents of one descriptor write.
#[derive(Clone, Copy, Debug)]
pub enum DescriptorPayload {
    Image {
        kind: SlotKind,
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
    Buffer {
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    Sampler(vk::Sampler),
}

/// Update-after-bind descriptor set layout for one heap type.
pub struct DescriptorSetLayout {
    device: Arc<Device>,
    layout: vk::DescriptorSetLayout,
    heap_type: DescriptorHeapType,
    capacity: u32,
}

impl DescriptorSetLayout {
    /// Creates the layout of a `heap_type` heap with `capacity` slots.
    pub fn new(
        device: Arc<Device>,
        heap_type: DescriptorHeapType,
        capacity: u32,
    ) -> RhiResult<Self> {
        let types: &[(u32, vk::DescriptorType)] = match heap_type {
            DescriptorHeapType::CbvSrvUav => &[
                (SAMPLED_IMAGE_BINDING, vk::DescriptorType::SAMPLED_IMAGE),
                (STORAGE_IMAGE_BINDING, vk::DescriptorType::STORAGE_IMAGE),
                (STORAGE_BUFFER_BINDING, vk::DescriptorType::STORAGE_BUFFER),
            ],
            DescriptorHeapType::Sampler => &[(SAMPLER_BINDING, vk::DescriptorType::SAMPLER)],
            DescriptorHeapType::Rtv | DescriptorHeapType::Dsv => {
                return Err(RhiError::Unsupported(format!(
                    "{} heaps have no descriptor set layout",
                    heap_type.name()
                )));
            }
        };

        let bindings: Vec<vk::DescriptorSetLayoutBinding> = types
            .iter()
            .map(|&(binding, descriptor_type)| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(descriptor_type)
                    .descriptor_count(capacity)
                    .stage_flags(vk::ShaderStageFlags::ALL)
            })
            .collect();
        let flags = vec![
            vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
                | vk::DescriptorBindingFlags::PARTIALLY_BOUND
                | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING;
            bindings.len()
        ];
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&flags);
        let create_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(&bindings)
            .push_next(&mut flags_info);

        let layout = unsafe {
            device
                .handle()
                .create_descriptor_set_layout(&create_info, None)?
        };
        debug!(
            "Created {} descriptor set layout: {} slots",
            heap_type.name(),
            capacity
        );
        Ok(Self {
            device,
            layout,
            heap_type,
            capacity,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Pool sizes for one set of this layout.
    fn pool_sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        let types: &[vk::DescriptorType] = match self.heap_type {
            DescriptorHeapType::Sampler => &[vk::DescriptorType::SAMPLER],
            _ => &[
                vk::DescriptorType::SAMPLED_IMAGE,
                vk::DescriptorType::STORAGE_IMAGE,
                vk::DescriptorType::STORAGE_BUFFER,
            ],
        };
        types
            .iter()
            .map(|&ty| {
                vk::DescriptorPoolSize::default()
                    .ty(ty)
                    .descriptor_count(self.capacity)
            })
            .collect()
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_descriptor_set_layout(self.layout, None);
        }
        debug!("Destroyed {} descriptor set layout", self.heap_type.name());
    }
}

/// A CBV/SRV/UAV or sampler heap: one descriptor set in its own pool.
pub struct SetHeap {
    device: Arc<Device>,
    heap_type: DescriptorHeapType,
    /// Keeps the layout alive as long as the set.
    layout: Arc<DescriptorSetLayout>,
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
    slots: Vec<SlotKind>,
    shader_visible: bool,
}

impl SetHeap {
    /// Allocates a set of `layout`. Only the first `capacity` slots are
    /// addressable even when the layout is larger.
    pub fn new(
        device: Arc<Device>,
        heap_type: DescriptorHeapType,
        layout: Arc<DescriptorSetLayout>,
        capacity: u32,
        shader_visible: bool,
    ) -> RhiResult<Self> {
        if capacity > layout.capacity() {
            return Err(RhiError::Unsupported(format!(
                "{} heap of {} slots exceeds the layout's {}",
                heap_type.name(),
                capacity,
                layout.capacity()
            )));
        }
        let pool_sizes = layout.pool_sizes();
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let pool = unsafe { device.handle().create_descriptor_pool(&pool_info, None)? };

        let set_layouts = [layout.handle()];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&set_layouts);
        let set = match unsafe { device.handle().allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => sets[0],
            Err(e) => {
                unsafe { device.handle().destroy_descriptor_pool(pool, None) };
                return Err(e.into());
            }
        };

        Ok(Self {
            device,
            heap_type,
            layout,
            pool,
            set,
            slots: vec![SlotKind::Empty; capacity as usize],
            shader_visible,
        })
    }

    #[inline]
    pub fn heap_type(&self) -> DescriptorHeapType {
        self.heap_type
    }

    #[inline]
    pub fn set(&self) -> vk::DescriptorSet {
        self.set
    }

    #[inline]
    pub fn is_shader_visible(&self) -> bool {
        self.shader_visible
    }

    #[inline]
    pub fn layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.layout
    }

    fn check_range(&self, index: u32, count: u32) -> RhiResult<()> {
        if index as u64 + count as u64 > self.slots.len() as u64 {
            return Err(RhiError::InvalidDescriptor(format!(
                "slots {}..{} outside {} heap of {}",
                index,
                index as u64 + count as u64,
                self.heap_type.name(),
                self.slots.len()
            )));
        }
        Ok(())
    }

    /// Writes one slot.
    pub fn write(&mut self, index: u32, payload: DescriptorPayload) -> RhiResult<()> {
        self.check_range(index, 1)?;
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_array_element(index);
        let kind = match payload {
            DescriptorPayload::Image { kind, view, layout } => {
                let info = [vk::DescriptorImageInfo::default()
                    .image_view(view)
                    .image_layout(layout)];
                let descriptor_type = if kind == SlotKind::StorageImage {
                    vk::DescriptorType::STORAGE_IMAGE
                } else {
                    vk::DescriptorType::SAMPLED_IMAGE
                };
                let binding = kind.binding().unwrap_or(SAMPLED_IMAGE_BINDING);
                let write = write
                    .dst_binding(binding)
                    .descriptor_type(descriptor_type)
                    .image_info(&info);
                unsafe { self.device.handle().update_descriptor_sets(&[write], &[]) };
                kind
            }
            DescriptorPayload::Buffer {
                buffer,
                offset,
                range,
            } => {
                let info = [vk::DescriptorBufferInfo::default()
                    .buffer(buffer)
                    .offset(offset)
                    .range(range)];
                let write = write
                    .dst_binding(STORAGE_BUFFER_BINDING)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(&info);
                unsafe { self.device.handle().update_descriptor_sets(&[write], &[]) };
                SlotKind::StorageBuffer
            }
            DescriptorPayload::Sampler(sampler) => {
                let info = [vk::DescriptorImageInfo::default().sampler(sampler)];
                let write = write
                    .dst_binding(SAMPLER_BINDING)
                    .descriptor_type(vk::DescriptorType::SAMPLER)
                    .image_info(&info);
                unsafe { self.device.handle().update_descriptor_sets(&[write], &[]) };
                SlotKind::Sampler
            }
        };
        self.slots[index as usize] = kind;
        Ok(())
    }

    /// Kinds of `count` slots starting at `index`.
    pub fn slot_kinds(&self, index: u32, count: u32) -> RhiResult<&[SlotKind]> {
        self.check_range(index, count)?;
        Ok(&self.slots[index as usize..(index + count) as usize])
    }

    /// Copies `kinds.len()` slots from `src_set` into this heap at `dst_index`.
    ///
    /// Runs of equal kind become one `VkCopyDescriptorSet` each; empty source
    /// slots leave the destination empty.
    pub fn copy_from(
        &mut self,
        src_set: vk::DescriptorSet,
        src_index: u32,
        kinds: &[SlotKind],
        dst_index: u32,
    ) -> RhiResult<()> {
        self.check_range(dst_index, kinds.len() as u32)?;
        let mut copies = Vec::new();
        let mut start = 0;
        while start < kinds.len() {
            let kind = kinds[start];
            let run = kinds[start..]
                .iter()
                .take_while(|&&other| other == kind)
                .count();
            if let Some(binding) = kind.binding() {
                copies.push(
                    vk::CopyDescriptorSet::default()
                        .src_set(src_set)
                        .src_binding(binding)
                        .src_array_element(src_index + start as u32)
                        .dst_set(self.set)
                        .dst_binding(binding)
                        .dst_array_element(dst_index + start as u32)
                        .descriptor_count(run as u32),
                );
            }
            start += run;
        }
        if !copies.is_empty() {
            unsafe { self.device.handle().update_descriptor_sets(&[], &copies) };
        }
        let dst = dst_index as usize;
        self.slots[dst..dst + kinds.len()].copy_from_slice(kinds);
        Ok(())
    }
}

impl Drop for SetHeap {
    fn drop(&mut self) {
        // Destroying the pool frees the set.
        unsafe {
            self.device
                .handle()
                .destroy_descriptor_pool(self.pool, None);
        }
        debug!(
            "Destroyed {} descriptor heap of {} slots",
            self.heap_type.name(),
            self.slots.len()
        );
    }
}

/// Attachment view stored in an RTV or DSV slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttachmentView {
    pub resource: ResourceId,
    pub view: vk::ImageView,
    pub format: TextureFormat,
    pub extent: vk::Extent2D,
}

/// An RTV or DSV heap. Never shader visible.
pub struct HostHeap {
    pub heap_type: DescriptorHeapType,
    pub slots: Vec<Option<AttachmentView>>,
}

impl HostHeap {
    pub fn new(heap_type: DescriptorHeapType, capacity: u32) -> Self {
        Self {
            heap_type,
            slots: vec![None; capacity as usize],
        }
    }

    pub fn check_range(&self, index: u32, count: u32) -> RhiResult<()> {
        if index as u64 + count as u64 > self.slots.len() as u64 {
            return Err(RhiError::InvalidDescriptor(format!(
                "slots {}..{} outside {} heap of {}",
                index,
                index as u64 + count as u64,
                self.heap_type.name(),
                self.slots.len()
            )));
        }
        Ok(())
    }

    pub fn get(&self, index: u32) -> RhiResult<AttachmentView> {
        self.check_range(index, 1)?;
        self.slots[index as usize].ok_or_else(|| {
            RhiError::InvalidDescriptor(format!(
                "{} slot {} was never written",
                self.heap_type.name(),
                index
            ))
        })
    }
}

/// A descriptor heap of any type.
pub enum DescriptorHeap {
    Set(SetHeap),
    Host(HostHeap),
}

impl DescriptorHeap {
    pub fn heap_type(&self) -> DescriptorHeapType {
        match self {
            Self::Set(heap) => heap.heap_type,
            Self::Host(heap) => heap.heap_type,
        }
    }
}

/// Samplers created on demand and shared by equal descriptions.
pub struct SamplerCache {
    device: Arc<Device>,
    samplers: HashMap<SamplerDesc, vk::Sampler>,
}

impl SamplerCache {
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            samplers: HashMap::new(),
        }
    }

    pub fn get(&mut self, desc: &SamplerDesc) -> RhiResult<vk::Sampler> {
        if let Some(sampler) = self.samplers.get(desc) {
            return Ok(*sampler);
        }

        let filter = match desc.filter {
            SamplerFilter::Nearest => vk::Filter::NEAREST,
            SamplerFilter::Linear => vk::Filter::LINEAR,
        };
        let mipmap_mode = match desc.filter {
            SamplerFilter::Nearest => vk::SamplerMipmapMode::NEAREST,
            SamplerFilter::Linear => vk::SamplerMipmapMode::LINEAR,
        };
        let address_mode = match desc.address_mode {
            SamplerAddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
            SamplerAddressMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
            SamplerAddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
            SamplerAddressMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
        };
        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(filter)
            .min_filter(filter)
            .mipmap_mode(mipmap_mode)
            .address_mode_u(address_mode)
            .address_mode_v(address_mode)
            .address_mode_w(address_mode)
            .anisotropy_enable(desc.max_anisotropy > 0)
            .max_anisotropy(desc.max_anisotropy.max(1) as f32)
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK);
        let sampler = unsafe { self.device.handle().create_sampler(&sampler_info, None)? };
        debug!("Created sampler {:?}", desc);
        self.samplers.insert(*desc, sampler);
        Ok(sampler)
    }
}

impl Drop for SamplerCache {
    fn drop(&mut self) {
        for (_, sampler) in self.samplers.drain() {
            unsafe { self.device.handle().destroy_sampler(sampler, None) };
        }
    }
}

/// Push-constant offsets of each root parameter of a root signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootLayout {
    pub offsets: Vec<u32>,
    pub size: u32,
}

impl RootLayout {
    /// Assigns push-constant offsets: 4 bytes per table, 8 (aligned) per
    /// inline descriptor.
    pub fn new(desc: &RootSignatureDesc, max_size: u32) -> RhiResult<Self> {
        desc.validate().map_err(RhiError::Unsupported)?;
        let mut offsets = Vec::with_capacity(desc.parameters.len());
        let mut size = 0u32;
        for parameter in &desc.parameters {
            let width = match parameter {
                RootParameter::DescriptorTable(_) => 4,
                RootParameter::InlineDescriptor { .. } => {
                    size = size.next_multiple_of(8);
                    8
                }
            };
            offsets.push(size);
            size += width;
        }
        if size > max_size {
            return Err(RhiError::Unsupported(format!(
                "root signature needs {} bytes of push constants, device allows {}",
                size, max_size
            )));
        }
        Ok(Self { offsets, size })
    }
}

/// The one pipeline layout every root signature maps to: resource heap at
/// set 0, sampler heap at set 1, a push constant block for root parameters.
pub struct PipelineLayout {
    device: Arc<Device>,
    layout: vk::PipelineLayout,
    push_constant_size: u32,
}

impl PipelineLayout {
    pub fn new(
        device: Arc<Device>,
        resource_layout: &DescriptorSetLayout,
        sampler_layout: &DescriptorSetLayout,
        push_constant_size: u32,
    ) -> RhiResult<Self> {
        let set_layouts = [resource_layout.handle(), sampler_layout.handle()];
        let ranges = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::ALL)
            .offset(0)
            .size(push_constant_size)];
        let create_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&ranges);
        let layout = unsafe { device.handle().create_pipeline_layout(&create_info, None)? };
        debug!(
            "Created pipeline layout with {} bytes of root parameters",
            push_constant_size
        );
        Ok(Self {
            device,
            layout,
            push_constant_size,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::PipelineLayout {
        self.layout
    }

    #[inline]
    pub fn push_constant_size(&self) -> u32 {
        self.push_constant_size
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_pipeline_layout(self.layout, None);
        }
    }
}
