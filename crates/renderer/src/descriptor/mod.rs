//! CPU-side descriptor allocation.
//!
//! Descriptors are created in non-shader-visible heaps and copied into a
//! shader-visible heap by the [`DynamicDescriptorHeap`](crate::DynamicDescriptorHeap)
//! when a draw or dispatch needs them.
//!
//! - [`DescriptorAllocator`] - pages of one heap type, grown on demand
//! - [`DescriptorAllocatorPage`] - one heap with a best-fit free list
//! - [`DescriptorAllocation`] - an owned range, freed on drop

mod allocation;
mod allocator;
mod page;

pub use allocation::DescriptorAllocation;
pub use allocator::DescriptorAllocator;
pub use page::DescriptorAllocatorPage;
