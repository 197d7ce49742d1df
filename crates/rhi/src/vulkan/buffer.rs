//! GPU buffers with `gpu-allocator` managed memory.
//!
//! # Overview
//!
//! - [`Buffer`] wraps a `VkBuffer` and its allocation. Every buffer carries a
//!   device address so it can be bound as an inline root descriptor.
//! - Upload pages are host-visible buffers whose memory stays mapped for
//!   their whole life; [`Buffer::mapped_ptr`] exposes the mapping.

use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use tracing::{debug, error};

use crate::error::{RhiError, RhiResult};
use crate::resource::{BufferDesc, BufferUsage};

use super::device::Device;

/// GPU buffer wrapper with managed memory.
pub struct Buffer {
    /// Reference to the logical device.
    device: Arc<Device>,
    /// Vulkan buffer handle.
    buffer: vk::Buffer,
    /// Memory allocation; taken on drop.
    allocation: Option<Allocation>,
    /// Creation parameters.
    desc: BufferDesc,
    /// Device address of byte 0.
    gpu_address: u64,
}

impl Buffer {
    /// Creates a buffer. Host-visible buffers are placed in `CpuToGpu` memory
    /// and stay mapped.
    ///
    /// # Errors
    ///
    /// Returns an error for a zero size or if creation or allocation fails.
    pub fn new(device: Arc<Device>, desc: BufferDesc, name: &str) -> RhiResult<Self> {
        if desc.size == 0 {
            return Err(RhiError::InvalidHandle(
                "Buffer size must be greater than 0".to_string(),
            ));
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage.to_vk())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.handle().create_buffer(&buffer_info, None)? };
        let requirements = unsafe { device.handle().get_buffer_memory_requirements(buffer) };

        let location = if desc.host_visible {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };

        let allocation = device.allocator().and_then(|mut allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name,
                    requirements,
                    location,
                    linear: true,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(RhiError::from)
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.handle().destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            device
                .handle()
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            Self::release(&device, buffer, allocation);
            return Err(e.into());
        }

        let address_info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
        let gpu_address = unsafe { device.handle().get_buffer_device_address(&address_info) };

        debug!("Created {} buffer: {} bytes", name, desc.size);

        Ok(Self {
            device,
            buffer,
            allocation: Some(allocation),
            desc,
            gpu_address,
        })
    }

    /// Creates a persistently mapped buffer for the upload allocator.
    pub fn new_upload_page(device: Arc<Device>, size: u64) -> RhiResult<Self> {
        let desc = BufferDesc {
            size,
            usage: BufferUsage::COPY_SRC | BufferUsage::CONSTANT,
            host_visible: true,
        };
        let page = Self::new(device, desc, "upload page")?;
        if page.mapped_ptr().is_none() {
            return Err(RhiError::Unsupported(
                "upload page memory is not host mappable".to_string(),
            ));
        }
        Ok(page)
    }

    fn release(device: &Device, buffer: vk::Buffer, allocation: Allocation) {
        match device.allocator() {
            Ok(mut allocator) => {
                if let Err(e) = allocator.free(allocation) {
                    error!("Failed to free buffer allocation: {:?}", e);
                }
            }
            Err(e) => error!("Failed to lock allocator: {:?}", e),
        }
        unsafe { device.handle().destroy_buffer(buffer, None) };
    }

    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    #[inline]
    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.desc.size
    }

    #[inline]
    pub fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    /// CPU address of byte 0 when the memory is mapped.
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.allocation
            .as_ref()?
            .mapped_ptr()
            .map(|ptr| ptr.cast::<u8>())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            Self::release(&self.device, self.buffer, allocation);
        }
        debug!("Destroyed buffer of {} bytes", self.desc.size);
    }
}

// Safety: the Vulkan handle is plain data and the allocation is only touched
// on drop, under the allocator mutex.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Buffer>();
    }

    #[test]
    fn test_upload_usage_is_copy_source() {
        let flags = (BufferUsage::COPY_SRC | BufferUsage::CONSTANT).to_vk();
        assert!(flags.contains(vk::BufferUsageFlags::TRANSFER_SRC));
        assert!(flags.contains(vk::BufferUsageFlags::STORAGE_BUFFER));
    }
}
