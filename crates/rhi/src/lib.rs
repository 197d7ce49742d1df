//! GPU device seam (Render Hardware Interface).
//!
//! The lifecycle core in `lumen-renderer` talks to the GPU exclusively through
//! the object-safe [`GpuDevice`] trait. Two implementations live here:
//! - [`vulkan::VulkanDevice`] - Vulkan 1.3 through `ash` and `gpu-allocator`
//! - [`headless::HeadlessDevice`] - software timeline that records every
//!   command, used by tests and GPU-less runs
//!
//! Objects on the GPU side are referred to by small copyable ids
//! ([`ResourceId`], [`DescriptorHeapId`], ...). The backend owns the real
//! handles.

/// Declares a copyable opaque id wrapping a `u64`.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl $name {
            /// Wraps a raw backend value.
            #[inline]
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// Returns the raw backend value.
            #[inline]
            pub const fn raw(self) -> u64 {
                self.0
            }
        }
    };
}
pub(crate) use define_id;

mod error;

pub mod descriptor;
pub mod device;
pub mod headless;
pub mod resource;
pub mod vulkan;

pub use descriptor::{
    DescriptorCopy, DescriptorHandle, DescriptorHeapId, DescriptorHeapType, DescriptorRange,
    DescriptorRangeKind, DescriptorWrite, InlineDescriptorKind, MAX_ROOT_PARAMETERS,
    RootParameter, RootSignatureDesc, RootSignatureId, SamplerAddressMode, SamplerDesc,
    SamplerFilter,
};
pub use device::{
    CommandAllocatorId, CommandListId, DepthStencilBinding, GpuDevice, IndexFormat, MappedPtr,
    PipelineId, RenderTargetBinding, UploadPageInfo,
};
pub use error::{RhiError, RhiResult};
pub use resource::{
    Barrier, BufferAccess, BufferDesc, BufferUsage, PipelineBindPoint, ResourceId, ResourceLayout,
    SubresourceRange, TextureDesc, TextureFormat, TextureUsage, split_subresource_index,
    subresource_index,
};

// Re-export ash types that backend users might need
pub use ash::vk;
