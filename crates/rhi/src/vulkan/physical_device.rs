//! Physical device selection.
//!
//! The lifecycle core needs one queue family that supports graphics and
//! compute (the direct queue) and a Vulkan 1.3 device with:
//! - timeline semaphores (the queue fence)
//! - synchronization2 (barriers)
//! - dynamic rendering
//! - descriptor indexing with update-after-bind (descriptor heaps)
//! - buffer device address (inline root descriptors, upload pages)
//! - separate depth/stencil layouts (per-plane barriers)
//!
//! Devices are ranked by type, then by device-local memory.

use ash::vk;
use tracing::{debug, info};

use crate::error::{RhiError, RhiResult};

/// Capabilities of the selected GPU that the backend sizes itself by.
#[derive(Clone, Copy)]
pub struct PhysicalDeviceInfo {
    pub device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Family of the single direct queue.
    pub queue_family: u32,
    /// Update-after-bind limit for sampled images, storage images and storage buffers.
    pub max_update_after_bind_resources: u32,
    /// Update-after-bind limit for samplers.
    pub max_update_after_bind_samplers: u32,
}

impl PhysicalDeviceInfo {
    pub fn device_name(&self) -> String {
        self.properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "Unknown Device".to_string())
    }

    pub fn device_type_name(&self) -> &'static str {
        match self.properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => "Discrete GPU",
            vk::PhysicalDeviceType::INTEGRATED_GPU => "Integrated GPU",
            vk::PhysicalDeviceType::VIRTUAL_GPU => "Virtual GPU",
            vk::PhysicalDeviceType::CPU => "CPU",
            _ => "Other",
        }
    }

    #[inline]
    pub fn max_push_constants_size(&self) -> u32 {
        self.properties.limits.max_push_constants_size
    }

    pub fn device_local_memory(&self) -> u64 {
        self.memory_properties
            .memory_heaps_as_slice()
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum()
    }

    fn score(&self) -> u64 {
        let type_score: u64 = match self.properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 3,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 2,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 1,
            _ => 0,
        };
        // Memory in MiB breaks ties between devices of the same type.
        (type_score << 40) + (self.device_local_memory() >> 20)
    }
}

impl std::fmt::Debug for PhysicalDeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalDeviceInfo")
            .field("name", &self.device_name())
            .field("type", &self.device_type_name())
            .field("queue_family", &self.queue_family)
            .finish_non_exhaustive()
    }
}

/// Picks the highest-ranked device that supports everything the backend uses.
pub fn select_physical_device(instance: &ash::Instance) -> RhiResult<PhysicalDeviceInfo> {
    let devices = unsafe { instance.enumerate_physical_devices()? };
    info!("Found {} GPU(s)", devices.len());

    let best = devices
        .into_iter()
        .filter_map(|device| inspect_device(instance, device))
        .max_by_key(PhysicalDeviceInfo::score)
        .ok_or(RhiError::NoSuitableGpu)?;

    info!(
        "Selected GPU '{}' ({}), queue family {}",
        best.device_name(),
        best.device_type_name(),
        best.queue_family
    );
    Ok(best)
}

fn inspect_device(instance: &ash::Instance, device: vk::PhysicalDevice) -> Option<PhysicalDeviceInfo> {
    let properties = unsafe { instance.get_physical_device_properties(device) };
    let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };
    let name = properties
        .device_name_as_c_str()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    if properties.api_version < vk::API_VERSION_1_3 {
        debug!("GPU '{}' skipped: Vulkan 1.3 not supported", name);
        return None;
    }

    let Some(queue_family) = find_direct_queue_family(instance, device) else {
        debug!("GPU '{}' skipped: no graphics+compute queue family", name);
        return None;
    };

    if let Err(missing) = check_features(instance, device) {
        debug!("GPU '{}' skipped: missing feature {}", name, missing);
        return None;
    }

    let mut indexing = vk::PhysicalDeviceDescriptorIndexingProperties::default();
    let mut properties2 = vk::PhysicalDeviceProperties2::default().push_next(&mut indexing);
    unsafe { instance.get_physical_device_properties2(device, &mut properties2) };

    let max_update_after_bind_resources = indexing
        .max_descriptor_set_update_after_bind_sampled_images
        .min(indexing.max_descriptor_set_update_after_bind_storage_images)
        .min(indexing.max_descriptor_set_update_after_bind_storage_buffers)
        // Three aliased arrays share the per-stage budget.
        .min(indexing.max_per_stage_update_after_bind_resources / 3);

    Some(PhysicalDeviceInfo {
        device,
        properties,
        memory_properties,
        queue_family,
        max_update_after_bind_resources,
        max_update_after_bind_samplers: indexing.max_descriptor_set_update_after_bind_samplers,
    })
}

fn find_direct_queue_family(instance: &ash::Instance, device: vk::PhysicalDevice) -> Option<u32> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
    let direct = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;
    families
        .iter()
        .position(|family| family.queue_count > 0 && family.queue_flags.contains(direct))
        .map(|index| index as u32)
}

/// Returns the name of the first missing feature.
fn check_features(instance: &ash::Instance, device: vk::PhysicalDevice) -> Result<(), &'static str> {
    let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut features12)
        .push_next(&mut features13);
    unsafe { instance.get_physical_device_features2(device, &mut features2) };

    let required = [
        (features12.timeline_semaphore, "timelineSemaphore"),
        (features12.buffer_device_address, "bufferDeviceAddress"),
        (features12.descriptor_binding_partially_bound, "descriptorBindingPartiallyBound"),
        (
            features12.descriptor_binding_update_unused_while_pending,
            "descriptorBindingUpdateUnusedWhilePending",
        ),
        (
            features12.descriptor_binding_sampled_image_update_after_bind,
            "descriptorBindingSampledImageUpdateAfterBind",
        ),
        (
            features12.descriptor_binding_storage_image_update_after_bind,
            "descriptorBindingStorageImageUpdateAfterBind",
        ),
        (
            features12.descriptor_binding_storage_buffer_update_after_bind,
            "descriptorBindingStorageBufferUpdateAfterBind",
        ),
        (features12.separate_depth_stencil_layouts, "separateDepthStencilLayouts"),
        (features13.synchronization2, "synchronization2"),
        (features13.dynamic_rendering, "dynamicRendering"),
    ];

    match required.iter().find(|(supported, _)| *supported == vk::FALSE) {
        Some((_, name)) => Err(name),
        None => Ok(()),
    }
}
