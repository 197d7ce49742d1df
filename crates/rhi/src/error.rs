//! RHI-specific error types.

use thiserror::Error;

/// RHI-specific error type.
///
/// Every variant is treated as fatal by the lifecycle core: GPU submission
/// and descriptor bookkeeping are not retried.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    VulkanError(#[from] ash::vk::Result),

    /// Failed to load Vulkan
    #[error("Failed to load Vulkan: {0}")]
    LoadingError(#[from] ash::LoadingError),

    /// GPU allocator error
    #[error("Allocator error: {0}")]
    AllocatorError(#[from] gpu_allocator::AllocationError),

    /// No suitable GPU found
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// The device was lost or removed
    #[error("Device lost")]
    DeviceLost,

    /// An id that the backend does not know about
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// A descriptor write or copy that does not fit its heap
    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// An object used in a state that does not allow it
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A request outside what this backend can express
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;
