//! Vulkan logical device, direct queue and memory allocator.
//!
//! # Overview
//!
//! [`Device`] owns the `VkDevice` with every feature the backend relies on
//! enabled, the single direct queue, and a `gpu-allocator` allocator. It keeps
//! the [`Instance`] alive for as long as the device exists.
//!
//! The queue is externally synchronised in Vulkan, so submission goes through
//! [`Device::submit`], which holds the queue lock.

use std::mem::ManuallyDrop;
use std::sync::{Arc, Mutex, MutexGuard};

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use tracing::{debug, error, info};

use crate::error::{RhiError, RhiResult};

use super::instance::Instance;
use super::physical_device::PhysicalDeviceInfo;

/// Vulkan logical device wrapper.
///
/// # Thread Safety
///
/// Shared as `Arc<Device>`. The allocator and the queue are behind mutexes.
pub struct Device {
    /// Logical device handle.
    device: ash::Device,
    /// Capabilities of the GPU the device was created on.
    info: PhysicalDeviceInfo,
    /// The direct queue; locked for every submission.
    queue: Mutex<vk::Queue>,
    /// Dropped before the device is destroyed.
    allocator: ManuallyDrop<Mutex<Allocator>>,
    /// Kept alive until the device is gone.
    instance: Arc<Instance>,
}

impl Device {
    /// Creates the logical device on `info.device` with one direct queue.
    ///
    /// # Errors
    ///
    /// Returns an error if device creation or allocator initialisation fails.
    pub fn new(instance: Arc<Instance>, info: PhysicalDeviceInfo) -> RhiResult<Arc<Self>> {
        let priorities = [1.0f32];
        let queue_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(info.queue_family)
            .queue_priorities(&priorities)];

        let mut features12 = vk::PhysicalDeviceVulkan12Features::default()
            .timeline_semaphore(true)
            .buffer_device_address(true)
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_update_unused_while_pending(true)
            .descriptor_binding_sampled_image_update_after_bind(true)
            .descriptor_binding_storage_image_update_after_bind(true)
            .descriptor_binding_storage_buffer_update_after_bind(true)
            .shader_sampled_image_array_non_uniform_indexing(true)
            .shader_storage_buffer_array_non_uniform_indexing(true)
            .separate_depth_stencil_layouts(true);
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default()
            .synchronization2(true)
            .dynamic_rendering(true);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .push_next(&mut features12)
            .push_next(&mut features13);

        let device = unsafe {
            instance
                .handle()
                .create_device(info.device, &create_info, None)?
        };
        let queue = unsafe { device.get_device_queue(info.queue_family, 0) };
        debug!("Direct queue retrieved from family {}", info.queue_family);

        let allocator = match Allocator::new(&AllocatorCreateDesc {
            instance: instance.handle().clone(),
            device: device.clone(),
            physical_device: info.device,
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        }) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e.into());
            }
        };

        info!("Logical device created on '{}'", info.device_name());

        Ok(Arc::new(Self {
            device,
            info,
            queue: Mutex::new(queue),
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            instance,
        }))
    }

    #[inline]
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    #[inline]
    pub fn info(&self) -> &PhysicalDeviceInfo {
        &self.info
    }

    #[inline]
    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    /// Locks the memory allocator.
    pub fn allocator(&self) -> RhiResult<MutexGuard<'_, Allocator>> {
        self.allocator.lock().map_err(|_| RhiError::DeviceLost)
    }

    /// Submits batches to the direct queue.
    ///
    /// # Safety
    ///
    /// Every command buffer in `submits` must be fully recorded and every
    /// referenced object must outlive the GPU work.
    pub unsafe fn submit(&self, submits: &[vk::SubmitInfo2]) -> RhiResult<()> {
        let queue = self.queue.lock().map_err(|_| RhiError::DeviceLost)?;
        unsafe {
            self.device
                .queue_submit2(*queue, submits, vk::Fence::null())?;
        }
        Ok(())
    }

    /// Waits for the device to become idle.
    pub fn wait_idle(&self) -> RhiResult<()> {
        let _queue = self.queue.lock().map_err(|_| RhiError::DeviceLost)?;
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                error!("Failed to wait for device idle during drop: {:?}", e);
            }
            // The allocator frees its memory blocks through the device.
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
        info!("Logical device destroyed");
    }
}

// Safety: ash::Device is Send + Sync; the queue and the allocator are behind
// mutexes; PhysicalDeviceInfo is plain data.
unsafe impl Send for Device {}
unsafe impl Sync for Device {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Device>();
    }
}
