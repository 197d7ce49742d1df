//! Queue fence backed by a timeline semaphore.
//!
//! A timeline semaphore carries a monotonically increasing 64-bit counter,
//! which is exactly the fence model the lifecycle core uses:
//! - signal: a `queue_submit2` whose only effect is to signal `value`
//! - completed value: `vkGetSemaphoreCounterValue`
//! - wait: `vkWaitSemaphores` on the host

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::error::{RhiError, RhiResult};

use super::device::Device;

/// Timeline semaphore wrapper.
///
/// # Thread Safety
///
/// Counter queries and host waits are thread-safe in Vulkan. Signals go
/// through [`Device::submit`], which serialises queue access.
pub struct TimelineFence {
    device: Arc<Device>,
    semaphore: vk::Semaphore,
}

impl TimelineFence {
    /// Creates a timeline semaphore starting at `initial_value`.
    pub fn new(device: Arc<Device>, initial_value: u64) -> RhiResult<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let semaphore = unsafe { device.handle().create_semaphore(&create_info, None)? };
        debug!("Created timeline fence at {}", initial_value);
        Ok(Self { device, semaphore })
    }

    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Enqueues a signal of `value` after all work already submitted.
    pub fn signal(&self, value: u64) -> RhiResult<()> {
        let signal_info = [vk::SemaphoreSubmitInfo::default()
            .semaphore(self.semaphore)
            .value(value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let submit = [vk::SubmitInfo2::default().signal_semaphore_infos(&signal_info)];
        // Safety: the submit references only the semaphore owned by self.
        unsafe { self.device.submit(&submit) }
    }

    /// Highest value the GPU has reached.
    pub fn completed_value(&self) -> RhiResult<u64> {
        let value = unsafe {
            self.device
                .handle()
                .get_semaphore_counter_value(self.semaphore)?
        };
        Ok(value)
    }

    /// Blocks until the counter reaches `value`.
    pub fn wait(&self, value: u64) -> RhiResult<()> {
        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        match unsafe { self.device.handle().wait_semaphores(&wait_info, u64::MAX) } {
            Ok(()) => Ok(()),
            Err(vk::Result::ERROR_DEVICE_LOST) => Err(RhiError::DeviceLost),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for TimelineFence {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_semaphore(self.semaphore, None);
        }
        debug!("Destroyed timeline fence");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeline_fence_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TimelineFence>();
    }
}
