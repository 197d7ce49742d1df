//! Vulkan instance creation.
//!
//! The lifecycle core never presents, so the instance enables no surface
//! extensions. Validation is optional and falls back silently when the
//! Khronos layer is not installed.

use std::borrow::Cow;
use std::ffi::{CStr, c_void};

use ash::{Entry, vk};
use tracing::{debug, error, info, warn};

use crate::error::RhiResult;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Owns the loader, the `VkInstance` and an optional debug messenger.
pub struct Instance {
    entry: Entry,
    instance: ash::Instance,
    /// Present only when validation was requested and available.
    debug: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl Instance {
    /// Loads Vulkan and creates a 1.3 instance.
    ///
    /// # Errors
    ///
    /// [`RhiError::LoadingError`](crate::RhiError::LoadingError) when no
    /// Vulkan loader is installed; tests use it to skip.
    pub fn new(enable_validation: bool) -> RhiResult<Self> {
        let entry = unsafe { Entry::load()? };

        let validation = enable_validation && Self::has_layer(&entry, VALIDATION_LAYER)?;
        if enable_validation && !validation {
            warn!("Validation requested but {:?} is not installed", VALIDATION_LAYER);
        }

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"lumen")
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"lumen")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let extensions: Vec<*const std::ffi::c_char> = if validation {
            vec![ash::ext::debug_utils::NAME.as_ptr()]
        } else {
            Vec::new()
        };
        let layers: Vec<*const std::ffi::c_char> = if validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            Vec::new()
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);
        let instance = unsafe { entry.create_instance(&create_info, None)? };

        let debug = if validation {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &instance);
            let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(debug_callback));
            match unsafe { loader.create_debug_utils_messenger(&messenger_info, None) } {
                Ok(messenger) => Some((loader, messenger)),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        let instance = Self {
            entry,
            instance,
            debug,
        };
        let label = if instance.has_validation() { "on" } else { "off" };
        info!("Vulkan instance created (validation {})", label);
        Ok(instance)
    }

    #[inline]
    pub fn handle(&self) -> &ash::Instance {
        &self.instance
    }

    #[inline]
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    #[inline]
    pub fn has_validation(&self) -> bool {
        self.debug.is_some()
    }

    fn has_layer(entry: &Entry, name: &CStr) -> RhiResult<bool> {
        let layers = unsafe { entry.enumerate_instance_layer_properties()? };
        Ok(layers
            .iter()
            .any(|layer| layer.layer_name_as_c_str().is_ok_and(|layer| layer == name)))
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        debug!("Vulkan instance destroyed");
    }
}

/// Forwards validation messages to `tracing`.
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    // Safety: the driver passes a valid pointer or null.
    let Some(data) = (unsafe { callback_data.as_ref() }) else {
        return vk::FALSE;
    };
    let message = if data.p_message.is_null() {
        Cow::Borrowed("(no message)")
    } else {
        // Safety: p_message is a NUL-terminated string owned by the driver.
        unsafe { CStr::from_ptr(data.p_message) }.to_string_lossy()
    };

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "lumen::vulkan", "[{:?}] {}", message_type, message);
    } else {
        warn!(target: "lumen::vulkan", "[{:?}] {}", message_type, message);
    }
    vk::FALSE
}
