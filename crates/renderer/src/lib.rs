//! GPU resource lifecycle management.
//!
//! This crate sits on top of [`lumen_rhi`] and keeps track of what the GPU
//! may still be using:
//! - CPU descriptor allocation with fence-deferred reuse
//! - Per-subresource layout tracking across command lists
//! - Linear upload memory recycled by fence
//! - Shader-visible descriptor staging and commit
//! - Fenced submission with recycled allocators and lists

mod error;

pub mod command_list;
pub mod command_queue;
pub mod context;
pub mod descriptor;
pub mod dynamic_descriptor_heap;
pub mod fence;
pub mod fence_pool;
pub mod layout_tracker;
pub mod root_signature;
pub mod upload_buffer;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use command_list::{
    BARRIER_BATCH_LIMIT, CONSTANT_BUFFER_ALIGNMENT, CommandList, PendingTransition,
    SubresourceSelection, Transition,
};
pub use command_queue::{CommandAllocator, CommandQueue, QueueConfig};
pub use context::GpuContext;
pub use descriptor::{DescriptorAllocation, DescriptorAllocator, DescriptorAllocatorPage};
pub use dynamic_descriptor_heap::{DynamicDescriptorHeap, ShaderVisibleHeap};
pub use error::{RendererError, RendererResult};
pub use fence::FenceTimeline;
pub use fence_pool::{FencePool, SharedFencePool};
pub use layout_tracker::{LayoutTable, ResourceLayoutTracker, StagedLayouts, SubresourceDesc};
pub use root_signature::RootSignature;
pub use upload_buffer::{UploadAllocation, UploadBuffer, UploadPage};

/// Locks a mutex, ignoring poisoning. Every guarded structure here is left
/// consistent between statements, so a panic elsewhere does not corrupt it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
