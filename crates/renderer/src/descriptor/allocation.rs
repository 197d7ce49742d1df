//! Owning handle for a range of descriptor slots.

use std::sync::Arc;

use lumen_rhi::{DescriptorHandle, DescriptorHeapType};

use super::page::DescriptorAllocatorPage;

/// A contiguous run of descriptor slots owned by exactly one holder.
///
/// Not `Clone`: two owners would free the same range twice. Dropping the
/// allocation hands the range back to its page, stamped with the fence of
/// the next submission; the slots become allocatable again once that fence
/// retires.
///
/// The null allocation ([`DescriptorAllocation::null`]) owns nothing and
/// frees nothing.
#[derive(Debug)]
pub struct DescriptorAllocation {
    base: Option<DescriptorHandle>,
    count: u32,
    stride: u32,
    page: Option<Arc<DescriptorAllocatorPage>>,
}

impl DescriptorAllocation {
    pub(crate) fn new(
        base: DescriptorHandle,
        count: u32,
        stride: u32,
        page: Arc<DescriptorAllocatorPage>,
    ) -> Self {
        Self {
            base: Some(base),
            count,
            stride,
            page: Some(page),
        }
    }

    /// An allocation that owns no slots.
    pub const fn null() -> Self {
        Self {
            base: None,
            count: 0,
            stride: 0,
            page: None,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.page.is_none()
    }

    /// Number of slots owned.
    #[inline]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Byte distance between adjacent slots in the backend heap.
    #[inline]
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Offset of the first slot within its page.
    #[inline]
    pub fn offset(&self) -> u32 {
        self.base.map_or(0, |base| base.index)
    }

    pub fn heap_type(&self) -> Option<DescriptorHeapType> {
        self.page.as_ref().map(|page| page.heap_type())
    }

    /// Handle of slot `offset` within this allocation.
    pub fn handle(&self, offset: u32) -> Option<DescriptorHandle> {
        match self.base {
            Some(base) if offset < self.count => Some(base.offset(offset)),
            _ => None,
        }
    }

    /// Handles of every owned slot, in order.
    pub fn handles(&self) -> impl Iterator<Item = DescriptorHandle> + '_ {
        (0..self.count).filter_map(|offset| self.handle(offset))
    }

    /// Frees the range stamped with an explicit fence value instead of the
    /// next submission's.
    pub fn free_at(mut self, fence: u64) {
        if let (Some(page), Some(base)) = (self.page.take(), self.base) {
            page.free_at(base.index, self.count, fence);
        }
    }
}

impl Default for DescriptorAllocation {
    fn default() -> Self {
        Self::null()
    }
}

impl Drop for DescriptorAllocation {
    fn drop(&mut self) {
        if let (Some(page), Some(base)) = (self.page.take(), self.base) {
            page.free(base.index, self.count);
        }
    }
}

#[cfg(test)]
mod tests {
    use lumen_rhi::GpuDevice;
    use lumen_rhi::headless::HeadlessDevice;

    use super::*;
    use crate::fence::FenceTimeline;

    #[test]
    fn test_null_allocation() {
        let allocation = DescriptorAllocation::null();
        assert!(allocation.is_null());
        assert_eq!(allocation.count(), 0);
        assert_eq!(allocation.handle(0), None);
        assert_eq!(allocation.handles().count(), 0);
    }

    #[test]
    fn test_handles_cover_the_range() {
        let device: Arc<dyn GpuDevice> = Arc::new(HeadlessDevice::new());
        let page = DescriptorAllocatorPage::new(
            device,
            DescriptorHeapType::Sampler,
            16,
            Arc::new(FenceTimeline::new()),
        )
        .unwrap();
        let _skip = page.allocate(3).unwrap();
        let allocation = page.allocate(4).unwrap();

        assert_eq!(allocation.heap_type(), Some(DescriptorHeapType::Sampler));
        assert_eq!(allocation.handle(0).map(|h| h.index), Some(3));
        assert_eq!(allocation.handle(3).map(|h| h.index), Some(6));
        assert_eq!(allocation.handle(4), None);
        let indices: Vec<u32> = allocation.handles().map(|h| h.index).collect();
        assert_eq!(indices, vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_move_transfers_ownership() {
        let device: Arc<dyn GpuDevice> = Arc::new(HeadlessDevice::new());
        let page = DescriptorAllocatorPage::new(
            device,
            DescriptorHeapType::CbvSrvUav,
            8,
            Arc::new(FenceTimeline::new()),
        )
        .unwrap();
        let first = page.allocate(2).unwrap();
        let moved = first;
        assert_eq!(page.stale_count(), 0);
        drop(moved);
        assert_eq!(page.stale_count(), 1);
    }
}
