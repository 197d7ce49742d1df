//! Descriptor heaps, handles and root signature descriptions.
//!
//! A descriptor heap is a linear array of slots of one [`DescriptorHeapType`].
//! Slots are addressed by [`DescriptorHandle`] (heap + index). The byte address
//! of a slot is `base + index * stride`, where the stride comes from
//! [`GpuDevice::descriptor_stride`](crate::GpuDevice::descriptor_stride).
//!
//! Root signatures are described as data ([`RootSignatureDesc`]); the
//! backend turns them into pipeline layouts.

use crate::resource::ResourceId;

crate::define_id!(
    /// Opaque id of a descriptor heap.
    DescriptorHeapId
);

crate::define_id!(
    /// Opaque id of a backend root signature (pipeline layout).
    RootSignatureId
);

/// Maximum number of root parameters in a root signature.
pub const MAX_ROOT_PARAMETERS: usize = 32;

/// Kind of descriptor a heap stores.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescriptorHeapType {
    /// Constant buffers, shader resources and unordered access views.
    CbvSrvUav,
    Sampler,
    /// Render target views. Never shader visible.
    Rtv,
    /// Depth stencil views. Never shader visible.
    Dsv,
}

impl DescriptorHeapType {
    pub const ALL: [Self; 4] = [Self::CbvSrvUav, Self::Sampler, Self::Rtv, Self::Dsv];

    /// Returns true if heaps of this type can be bound to shaders.
    #[inline]
    pub fn can_be_shader_visible(self) -> bool {
        matches!(self, Self::CbvSrvUav | Self::Sampler)
    }

    /// Dense index, usable for per-type arrays.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::CbvSrvUav => "cbv_srv_uav",
            Self::Sampler => "sampler",
            Self::Rtv => "rtv",
            Self::Dsv => "dsv",
        }
    }
}

/// Address of one descriptor slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorHandle {
    pub heap: DescriptorHeapId,
    pub index: u32,
}

impl DescriptorHandle {
    #[inline]
    pub fn new(heap: DescriptorHeapId, index: u32) -> Self {
        Self { heap, index }
    }

    /// Handle `n` slots further into the same heap.
    #[inline]
    pub fn offset(self, n: u32) -> Self {
        Self {
            heap: self.heap,
            index: self.index + n,
        }
    }
}

/// A contiguous copy of descriptors between two heaps of the same type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorCopy {
    pub src: DescriptorHandle,
    pub dst: DescriptorHandle,
    pub count: u32,
}

/// Filtering mode of a sampler.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SamplerFilter {
    Nearest,
    #[default]
    Linear,
}

/// Addressing mode of a sampler, applied on all axes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SamplerAddressMode {
    #[default]
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
}

/// Sampler state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SamplerDesc {
    pub filter: SamplerFilter,
    pub address_mode: SamplerAddressMode,
    /// 0 disables anisotropic filtering.
    pub max_anisotropy: u32,
}

/// Contents to write into one descriptor slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorWrite {
    /// Constant buffer view over a byte range of a buffer.
    ConstantBuffer {
        resource: ResourceId,
        offset: u64,
        size: u64,
    },
    /// Shader resource view of every mip and slice of a texture.
    ShaderResource { resource: ResourceId },
    /// Read-only view over a byte range of a buffer.
    StructuredBuffer {
        resource: ResourceId,
        offset: u64,
        size: u64,
    },
    /// Unordered access view of a single texture mip.
    UnorderedAccess { resource: ResourceId, mip_slice: u32 },
    /// Read/write view over a byte range of a buffer.
    UnorderedAccessBuffer {
        resource: ResourceId,
        offset: u64,
        size: u64,
    },
    Sampler(SamplerDesc),
    /// Render target view of one mip and slice.
    RenderTarget {
        resource: ResourceId,
        mip_slice: u32,
        array_slice: u32,
    },
    /// Depth stencil view of one mip and slice.
    DepthStencil {
        resource: ResourceId,
        mip_slice: u32,
        array_slice: u32,
    },
}

impl DescriptorWrite {
    /// Heap type this write may be stored in.
    pub fn heap_type(&self) -> DescriptorHeapType {
        match self {
            Self::ConstantBuffer { .. }
            | Self::ShaderResource { .. }
            | Self::StructuredBuffer { .. }
            | Self::UnorderedAccess { .. }
            | Self::UnorderedAccessBuffer { .. } => DescriptorHeapType::CbvSrvUav,
            Self::Sampler(_) => DescriptorHeapType::Sampler,
            Self::RenderTarget { .. } => DescriptorHeapType::Rtv,
            Self::DepthStencil { .. } => DescriptorHeapType::Dsv,
        }
    }

    /// Resource referenced by the view, if any.
    pub fn resource(&self) -> Option<ResourceId> {
        match *self {
            Self::ConstantBuffer { resource, .. }
            | Self::ShaderResource { resource }
            | Self::StructuredBuffer { resource, .. }
            | Self::UnorderedAccess { resource, .. }
            | Self::UnorderedAccessBuffer { resource, .. }
            | Self::RenderTarget { resource, .. }
            | Self::DepthStencil { resource, .. } => Some(resource),
            Self::Sampler(_) => None,
        }
    }
}

/// Kind of descriptors in a descriptor table range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorRangeKind {
    Cbv,
    Srv,
    Uav,
    Sampler,
}

impl DescriptorRangeKind {
    #[inline]
    pub fn heap_type(self) -> DescriptorHeapType {
        match self {
            Self::Sampler => DescriptorHeapType::Sampler,
            Self::Cbv | Self::Srv | Self::Uav => DescriptorHeapType::CbvSrvUav,
        }
    }
}

/// One range of a descriptor table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorRange {
    pub kind: DescriptorRangeKind,
    pub count: u32,
    pub base_register: u32,
}

impl DescriptorRange {
    pub fn new(kind: DescriptorRangeKind, count: u32, base_register: u32) -> Self {
        Self {
            kind,
            count,
            base_register,
        }
    }
}

/// Kind of an inline (root) descriptor, bound by GPU address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InlineDescriptorKind {
    Cbv,
    Srv,
    Uav,
}

/// One root parameter.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RootParameter {
    /// A table of contiguous descriptors from one heap type.
    DescriptorTable(Vec<DescriptorRange>),
    /// A single buffer bound by GPU address.
    InlineDescriptor {
        kind: InlineDescriptorKind,
        register: u32,
    },
}

impl RootParameter {
    /// Heap type of a descriptor table; `None` for inline descriptors and
    /// empty tables.
    pub fn table_heap_type(&self) -> Option<DescriptorHeapType> {
        match self {
            Self::DescriptorTable(ranges) => ranges.first().map(|range| range.kind.heap_type()),
            Self::InlineDescriptor { .. } => None,
        }
    }

    /// Total descriptors in a table (sum of range counts); 0 for inline descriptors.
    pub fn table_size(&self) -> u32 {
        match self {
            Self::DescriptorTable(ranges) => ranges.iter().map(|range| range.count).sum(),
            Self::InlineDescriptor { .. } => 0,
        }
    }
}

/// Data-only description of a root signature.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct RootSignatureDesc {
    pub parameters: Vec<RootParameter>,
}

impl RootSignatureDesc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a descriptor table parameter.
    pub fn with_table(mut self, ranges: impl Into<Vec<DescriptorRange>>) -> Self {
        self.parameters
            .push(RootParameter::DescriptorTable(ranges.into()));
        self
    }

    /// Appends an inline descriptor parameter.
    pub fn with_inline(mut self, kind: InlineDescriptorKind, register: u32) -> Self {
        self.parameters
            .push(RootParameter::InlineDescriptor { kind, register });
        self
    }

    /// Checks the parameter count and that no table mixes sampler and
    /// non-sampler ranges. Returns a description of the first problem.
    pub fn validate(&self) -> Result<(), String> {
        if self.parameters.len() > MAX_ROOT_PARAMETERS {
            return Err(format!(
                "{} root parameters, at most {} supported",
                self.parameters.len(),
                MAX_ROOT_PARAMETERS
            ));
        }
        for (index, parameter) in self.parameters.iter().enumerate() {
            if let RootParameter::DescriptorTable(ranges) = parameter {
                let Some(heap_type) = parameter.table_heap_type() else {
                    continue;
                };
                if ranges.iter().any(|range| range.kind.heap_type() != heap_type) {
                    return Err(format!(
                        "root parameter {} mixes sampler and non-sampler ranges",
                        index
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_size_and_heap_type() {
        let param = RootParameter::DescriptorTable(vec![
            DescriptorRange::new(DescriptorRangeKind::Srv, 4, 0),
            DescriptorRange::new(DescriptorRangeKind::Uav, 2, 0),
        ]);
        assert_eq!(param.table_size(), 6);
        assert_eq!(param.table_heap_type(), Some(DescriptorHeapType::CbvSrvUav));

        let inline = RootParameter::InlineDescriptor {
            kind: InlineDescriptorKind::Cbv,
            register: 0,
        };
        assert_eq!(inline.table_size(), 0);
        assert_eq!(inline.table_heap_type(), None);
    }

    #[test]
    fn test_mixed_table_rejected() {
        let desc = RootSignatureDesc::new().with_table([
            DescriptorRange::new(DescriptorRangeKind::Srv, 1, 0),
            DescriptorRange::new(DescriptorRangeKind::Sampler, 1, 0),
        ]);
        assert!(desc.validate().is_err());
    }

    #[test]
    fn test_too_many_parameters_rejected() {
        let mut desc = RootSignatureDesc::new();
        for register in 0..=MAX_ROOT_PARAMETERS as u32 {
            desc = desc.with_inline(InlineDescriptorKind::Cbv, register);
        }
        assert!(desc.validate().is_err());
    }

    #[test]
    fn test_handle_offset() {
        let handle = DescriptorHandle::new(DescriptorHeapId::from_raw(3), 10);
        assert_eq!(handle.offset(5).index, 15);
        assert_eq!(handle.offset(5).heap, handle.heap);
    }

    #[test]
    fn test_write_heap_types() {
        let resource = ResourceId::from_raw(1);
        assert_eq!(
            DescriptorWrite::ShaderResource { resource }.heap_type(),
            DescriptorHeapType::CbvSrvUav
        );
        assert_eq!(
            DescriptorWrite::Sampler(SamplerDesc::default()).heap_type(),
            DescriptorHeapType::Sampler
        );
        assert_eq!(
            DescriptorWrite::DepthStencil {
                resource,
                mip_slice: 0,
                array_slice: 0
            }
            .heap_type(),
            DescriptorHeapType::Dsv
        );
    }
}
