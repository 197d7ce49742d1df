//! Renderer error types.

use lumen_rhi::{DescriptorHeapType, ResourceId, RhiError};
use thiserror::Error;

/// Errors raised by the lifecycle core.
///
/// [`RendererError::Rhi`] wraps backend failures, which callers treat as
/// fatal. Every other variant is a broken contract on the caller's side.
/// Running out of descriptors or upload memory is never an error: pages and
/// heaps grow or switch instead.
#[derive(Error, Debug)]
pub enum RendererError {
    /// GPU backend failure
    #[error("GPU error: {0}")]
    Rhi(#[from] RhiError),

    /// Unusable renderer configuration
    #[error("Configuration error: {0}")]
    Config(#[from] lumen_core::Error),

    /// Descriptor request of zero slots
    #[error("Invalid descriptor count: {0}")]
    InvalidDescriptorCount(u32),

    /// Root parameter index past the root signature
    #[error("Root parameter {index} out of range (limit {limit})")]
    RootParameterOutOfRange { index: u32, limit: u32 },

    /// Staged descriptors past the end of a descriptor table
    #[error(
        "Descriptor table {root_index} overflow: {offset} + {count} exceeds table size {table_size}"
    )]
    DescriptorTableOverflow {
        root_index: u32,
        offset: u32,
        count: u32,
        table_size: u32,
    },

    /// A descriptor table that can never fit in one shader-visible heap
    #[error("Descriptor table of {size} {heap_type:?} slots exceeds heap capacity {capacity}")]
    DescriptorTableTooLarge {
        heap_type: DescriptorHeapType,
        size: u32,
        capacity: u32,
    },

    /// Layout query or barrier for a resource the tracker does not know
    #[error("Resource {0:?} is not registered with the layout tracker")]
    ResourceNotRegistered(ResourceId),

    /// Subresource index past the resource's subresource count
    #[error("Subresource {index} out of range for {resource:?} ({count} subresources)")]
    SubresourceOutOfRange {
        resource: ResourceId,
        index: u32,
        count: u32,
    },

    /// Upload alignment that is not a power of two
    #[error("Alignment {0} is not a power of two")]
    InvalidAlignment(u64),

    /// Write larger than the upload allocation
    #[error("Write of {len} bytes into an upload allocation of {size}")]
    UploadOverflow { len: usize, size: u64 },

    /// Write through an allocation whose page was recycled for later work
    #[error("Upload allocation in {0:?} was recycled")]
    UploadRecycled(ResourceId),

    /// Layout snapshot whose shape no longer matches the tracked resource
    #[error("Layout snapshot of {actual} subresources for {resource:?} ({expected} tracked)")]
    SubresourceCountMismatch {
        resource: ResourceId,
        expected: u32,
        actual: u32,
    },

    /// Descriptor binding before a root signature was set
    #[error("No root signature bound")]
    NoRootSignature,
}

/// Result type alias for renderer operations.
pub type RendererResult<T> = std::result::Result<T, RendererError>;
