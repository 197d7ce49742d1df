//! Backend-neutral GPU resource types.
//!
//! These describe textures, buffers, their layouts and the barriers that move
//! them between layouts. Backends translate them into API objects.
//!
//! # Subresource indexing
//!
//! A texture with `M` mips, `A` array slices and `P` planes has `M * A * P`
//! subresources. The flat index of `(mip, array, plane)` is
//! `mip + array * M + plane * M * A`, see [`subresource_index`].

use ash::vk;
use bitflags::bitflags;

crate::define_id!(
    /// Opaque id of a texture or buffer owned by a backend.
    ResourceId
);

/// Texture formats the core knows about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    Bgra8Srgb,
    Rgba16Float,
    Rgba32Float,
    R32Float,
    D32Float,
    D24UnormS8Uint,
    D32FloatS8Uint,
}

impl TextureFormat {
    /// Number of planes. Combined depth/stencil formats have two (depth, stencil).
    #[inline]
    pub fn plane_count(self) -> u32 {
        if self.has_stencil() { 2 } else { 1 }
    }

    /// Returns true for formats with a depth component.
    #[inline]
    pub fn is_depth(self) -> bool {
        matches!(
            self,
            Self::D32Float | Self::D24UnormS8Uint | Self::D32FloatS8Uint
        )
    }

    /// Returns true for formats with a stencil component.
    #[inline]
    pub fn has_stencil(self) -> bool {
        matches!(self, Self::D24UnormS8Uint | Self::D32FloatS8Uint)
    }

    /// Bytes per texel of the first plane.
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            Self::Rgba8Unorm | Self::Rgba8Srgb | Self::Bgra8Unorm | Self::Bgra8Srgb => 4,
            Self::Rgba16Float => 8,
            Self::Rgba32Float => 16,
            Self::R32Float | Self::D32Float | Self::D24UnormS8Uint => 4,
            Self::D32FloatS8Uint => 8,
        }
    }

    /// Converts to the Vulkan format.
    pub fn to_vk(self) -> vk::Format {
        match self {
            Self::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
            Self::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
            Self::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
            Self::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
            Self::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
            Self::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
            Self::R32Float => vk::Format::R32_SFLOAT,
            Self::D32Float => vk::Format::D32_SFLOAT,
            Self::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
            Self::D32FloatS8Uint => vk::Format::D32_SFLOAT_S8_UINT,
        }
    }

    /// Image aspect of a single plane.
    pub fn plane_aspect(self, plane: u32) -> vk::ImageAspectFlags {
        if !self.is_depth() {
            vk::ImageAspectFlags::COLOR
        } else if plane == 0 {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::STENCIL
        }
    }

    /// Image aspect covering every plane.
    pub fn full_aspect(self) -> vk::ImageAspectFlags {
        match (self.is_depth(), self.has_stencil()) {
            (false, _) => vk::ImageAspectFlags::COLOR,
            (true, false) => vk::ImageAspectFlags::DEPTH,
            (true, true) => vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
        }
    }
}

bitflags! {
    /// How a texture may be used.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct TextureUsage: u32 {
        const SAMPLED = 1 << 0;
        const STORAGE = 1 << 1;
        const RENDER_TARGET = 1 << 2;
        const DEPTH_STENCIL = 1 << 3;
        const COPY_SRC = 1 << 4;
        const COPY_DST = 1 << 5;
    }
}

impl TextureUsage {
    /// Converts to Vulkan image usage flags.
    pub fn to_vk(self) -> vk::ImageUsageFlags {
        let mut flags = vk::ImageUsageFlags::empty();
        if self.contains(Self::SAMPLED) {
            flags |= vk::ImageUsageFlags::SAMPLED;
        }
        if self.contains(Self::STORAGE) {
            flags |= vk::ImageUsageFlags::STORAGE;
        }
        if self.contains(Self::RENDER_TARGET) {
            flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
        if self.contains(Self::DEPTH_STENCIL) {
            flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        }
        if self.contains(Self::COPY_SRC) {
            flags |= vk::ImageUsageFlags::TRANSFER_SRC;
        }
        if self.contains(Self::COPY_DST) {
            flags |= vk::ImageUsageFlags::TRANSFER_DST;
        }
        flags
    }
}

bitflags! {
    /// How a buffer may be used.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct BufferUsage: u32 {
        const CONSTANT = 1 << 0;
        const STORAGE = 1 << 1;
        const VERTEX = 1 << 2;
        const INDEX = 1 << 3;
        const INDIRECT = 1 << 4;
        const COPY_SRC = 1 << 5;
        const COPY_DST = 1 << 6;
    }
}

impl BufferUsage {
    /// Converts to Vulkan buffer usage flags.
    ///
    /// Every buffer gets a device address so it can be bound inline.
    /// Constant buffers are read through storage buffer descriptors.
    pub fn to_vk(self) -> vk::BufferUsageFlags {
        let mut flags = vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        if self.intersects(Self::CONSTANT | Self::STORAGE) {
            flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
        }
        if self.contains(Self::VERTEX) {
            flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
        }
        if self.contains(Self::INDEX) {
            flags |= vk::BufferUsageFlags::INDEX_BUFFER;
        }
        if self.contains(Self::INDIRECT) {
            flags |= vk::BufferUsageFlags::INDIRECT_BUFFER;
        }
        if self.contains(Self::COPY_SRC) {
            flags |= vk::BufferUsageFlags::TRANSFER_SRC;
        }
        if self.contains(Self::COPY_DST) {
            flags |= vk::BufferUsageFlags::TRANSFER_DST;
        }
        flags
    }
}

/// Description of a 2D texture (optionally arrayed and mipmapped).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub array_size: u32,
    pub mip_levels: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

impl TextureDesc {
    /// Single-mip, single-slice 2D texture.
    pub fn new_2d(width: u32, height: u32, format: TextureFormat, usage: TextureUsage) -> Self {
        Self {
            width,
            height,
            array_size: 1,
            mip_levels: 1,
            format,
            usage,
        }
    }

    /// Sets the mip count.
    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    /// Sets the array slice count.
    pub fn with_array_size(mut self, array_size: u32) -> Self {
        self.array_size = array_size;
        self
    }

    /// Total subresource count (`mips * slices * planes`).
    #[inline]
    pub fn subresource_count(&self) -> u32 {
        self.mip_levels * self.array_size * self.format.plane_count()
    }
}

/// Description of a linear buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: BufferUsage,
    /// Place the buffer in CPU-visible memory.
    pub host_visible: bool,
}

impl BufferDesc {
    /// Device-local buffer.
    pub fn new(size: u64, usage: BufferUsage) -> Self {
        Self {
            size,
            usage,
            host_visible: false,
        }
    }
}

/// Layout (state) of a texture subresource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceLayout {
    Undefined,
    Common,
    Present,
    GenericRead,
    RenderTarget,
    UnorderedAccess,
    DepthStencilWrite,
    DepthStencilRead,
    ShaderResource,
    CopySource,
    CopyDest,
}

impl ResourceLayout {
    /// Converts to a Vulkan image layout.
    pub fn to_vk(self) -> vk::ImageLayout {
        match self {
            Self::Undefined => vk::ImageLayout::UNDEFINED,
            Self::Common | Self::GenericRead | Self::UnorderedAccess => vk::ImageLayout::GENERAL,
            Self::Present => vk::ImageLayout::PRESENT_SRC_KHR,
            Self::RenderTarget => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            Self::DepthStencilWrite => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            Self::DepthStencilRead => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            Self::ShaderResource => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Self::CopySource => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            Self::CopyDest => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        }
    }

    /// Layout of a single plane of a depth/stencil image.
    ///
    /// Per-plane barriers need the separate depth/stencil layouts.
    pub fn to_vk_plane(self, format: TextureFormat, plane: u32) -> vk::ImageLayout {
        if !format.has_stencil() {
            return self.to_vk();
        }
        match (self, plane) {
            (Self::DepthStencilWrite, 0) => vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            (Self::DepthStencilWrite, _) => vk::ImageLayout::STENCIL_ATTACHMENT_OPTIMAL,
            (Self::DepthStencilRead, 0) => vk::ImageLayout::DEPTH_READ_ONLY_OPTIMAL,
            (Self::DepthStencilRead, _) => vk::ImageLayout::STENCIL_READ_ONLY_OPTIMAL,
            _ => self.to_vk(),
        }
    }

    /// Pipeline stages and access that touch a subresource in this layout.
    pub fn to_vk_sync(self) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
        use vk::{AccessFlags2 as A, PipelineStageFlags2 as S};
        match self {
            Self::Undefined => (S::TOP_OF_PIPE, A::NONE),
            Self::Common => (S::ALL_COMMANDS, A::MEMORY_READ | A::MEMORY_WRITE),
            Self::Present => (S::BOTTOM_OF_PIPE, A::NONE),
            Self::GenericRead => (S::ALL_COMMANDS, A::MEMORY_READ),
            Self::RenderTarget => (
                S::COLOR_ATTACHMENT_OUTPUT,
                A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
            ),
            Self::UnorderedAccess => (
                S::ALL_COMMANDS,
                A::SHADER_STORAGE_READ | A::SHADER_STORAGE_WRITE,
            ),
            Self::DepthStencilWrite => (
                S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS,
                A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
            ),
            Self::DepthStencilRead => (
                S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS | S::FRAGMENT_SHADER,
                A::DEPTH_STENCIL_ATTACHMENT_READ | A::SHADER_SAMPLED_READ,
            ),
            Self::ShaderResource => (S::ALL_COMMANDS, A::SHADER_SAMPLED_READ),
            Self::CopySource => (S::ALL_TRANSFER, A::TRANSFER_READ),
            Self::CopyDest => (S::ALL_TRANSFER, A::TRANSFER_WRITE),
        }
    }
}

/// Access state of a buffer, for buffer barriers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferAccess {
    Common,
    VertexOrConstant,
    Index,
    IndirectArgument,
    ShaderResource,
    UnorderedAccess,
    CopySource,
    CopyDest,
    GenericRead,
}

impl BufferAccess {
    /// Pipeline stages and access for this state.
    pub fn to_vk_sync(self) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
        use vk::{AccessFlags2 as A, PipelineStageFlags2 as S};
        match self {
            Self::Common => (S::ALL_COMMANDS, A::MEMORY_READ | A::MEMORY_WRITE),
            Self::VertexOrConstant => (
                S::VERTEX_ATTRIBUTE_INPUT | S::ALL_COMMANDS,
                A::VERTEX_ATTRIBUTE_READ | A::SHADER_STORAGE_READ,
            ),
            Self::Index => (S::INDEX_INPUT, A::INDEX_READ),
            Self::IndirectArgument => (S::DRAW_INDIRECT, A::INDIRECT_COMMAND_READ),
            Self::ShaderResource => (S::ALL_COMMANDS, A::SHADER_STORAGE_READ),
            Self::UnorderedAccess => (
                S::ALL_COMMANDS,
                A::SHADER_STORAGE_READ | A::SHADER_STORAGE_WRITE,
            ),
            Self::CopySource => (S::ALL_TRANSFER, A::TRANSFER_READ),
            Self::CopyDest => (S::ALL_TRANSFER, A::TRANSFER_WRITE),
            Self::GenericRead => (S::ALL_COMMANDS, A::MEMORY_READ),
        }
    }
}

/// A rectangular block of subresources: mips x array slices x planes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubresourceRange {
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_array: u32,
    pub array_count: u32,
    pub base_plane: u32,
    pub plane_count: u32,
}

impl SubresourceRange {
    /// A single mip of slice 0, plane 0.
    pub fn mip(mip: u32) -> Self {
        Self {
            base_mip: mip,
            mip_count: 1,
            base_array: 0,
            array_count: 1,
            base_plane: 0,
            plane_count: 1,
        }
    }

    /// Flat indices of every subresource in the range, for a resource with
    /// the given mip and array counts.
    pub fn indices(self, mip_levels: u32, array_size: u32) -> impl Iterator<Item = u32> {
        let planes = self.base_plane..self.base_plane + self.plane_count;
        planes.flat_map(move |plane| {
            (self.base_array..self.base_array + self.array_count).flat_map(move |array| {
                (self.base_mip..self.base_mip + self.mip_count)
                    .map(move |mip| subresource_index(mip, array, plane, mip_levels, array_size))
            })
        })
    }
}

/// Flat subresource index of `(mip, array, plane)`.
#[inline]
pub const fn subresource_index(
    mip: u32,
    array: u32,
    plane: u32,
    mip_levels: u32,
    array_size: u32,
) -> u32 {
    mip + array * mip_levels + plane * mip_levels * array_size
}

/// Splits a flat subresource index back into `(mip, array, plane)`.
#[inline]
pub const fn split_subresource_index(
    index: u32,
    mip_levels: u32,
    array_size: u32,
) -> (u32, u32, u32) {
    let mip = index % mip_levels;
    let array = (index / mip_levels) % array_size;
    let plane = index / (mip_levels * array_size);
    (mip, array, plane)
}

/// A single resource transition recorded into a command list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Barrier {
    /// Layout change of one texture subresource.
    Texture {
        resource: ResourceId,
        subresource: u32,
        before: ResourceLayout,
        after: ResourceLayout,
    },
    /// Access change of a whole buffer.
    Buffer {
        resource: ResourceId,
        before: BufferAccess,
        after: BufferAccess,
    },
}

impl Barrier {
    /// The resource the barrier applies to.
    #[inline]
    pub fn resource(&self) -> ResourceId {
        match *self {
            Self::Texture { resource, .. } | Self::Buffer { resource, .. } => resource,
        }
    }
}

/// Pipeline a root signature and descriptor tables are bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineBindPoint {
    Graphics,
    Compute,
}

impl PipelineBindPoint {
    pub fn to_vk(self) -> vk::PipelineBindPoint {
        match self {
            Self::Graphics => vk::PipelineBindPoint::GRAPHICS,
            Self::Compute => vk::PipelineBindPoint::COMPUTE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plane_count() {
        assert_eq!(TextureFormat::Rgba8Unorm.plane_count(), 1);
        assert_eq!(TextureFormat::D32Float.plane_count(), 1);
        assert_eq!(TextureFormat::D24UnormS8Uint.plane_count(), 2);
        assert_eq!(TextureFormat::D32FloatS8Uint.plane_count(), 2);
    }

    #[test]
    fn test_subresource_index_formula() {
        // 4 mips, 3 slices
        assert_eq!(subresource_index(0, 0, 0, 4, 3), 0);
        assert_eq!(subresource_index(2, 1, 0, 4, 3), 6);
        assert_eq!(subresource_index(1, 2, 1, 4, 3), 1 + 8 + 12);
        assert_eq!(split_subresource_index(21, 4, 3), (1, 2, 1));
    }

    #[test]
    fn test_range_indices() {
        let range = SubresourceRange {
            base_mip: 1,
            mip_count: 2,
            base_array: 0,
            array_count: 2,
            base_plane: 0,
            plane_count: 1,
        };
        let indices: Vec<u32> = range.indices(4, 2).collect();
        assert_eq!(indices, vec![1, 2, 5, 6]);
    }

    #[test]
    fn test_subresource_count() {
        let desc = TextureDesc::new_2d(
            64,
            64,
            TextureFormat::D24UnormS8Uint,
            TextureUsage::DEPTH_STENCIL,
        )
        .with_mip_levels(3);
        assert_eq!(desc.subresource_count(), 6);
    }

    #[test]
    fn test_depth_stencil_plane_layouts() {
        let format = TextureFormat::D24UnormS8Uint;
        assert_eq!(
            ResourceLayout::DepthStencilWrite.to_vk_plane(format, 1),
            vk::ImageLayout::STENCIL_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            ResourceLayout::ShaderResource.to_vk_plane(format, 0),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
    }

    #[test]
    fn test_constant_buffers_are_storage_buffers() {
        let flags = BufferUsage::CONSTANT.to_vk();
        assert!(flags.contains(vk::BufferUsageFlags::STORAGE_BUFFER));
        assert!(flags.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));
    }
}
