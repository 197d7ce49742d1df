//! One fixed-capacity descriptor heap and its free space.
//!
//! # Free list
//!
//! Free blocks are indexed twice:
//! - by offset (`BTreeMap<offset, size>`) to find neighbours when a block
//!   is returned
//! - by size (`BTreeSet<(size, offset)>`) for best-fit allocation
//!
//! Best fit takes the smallest block that is large enough; among blocks of
//! that size the lowest offset wins because the set orders by
//! `(size, offset)`.
//!
//! # Deferred frees
//!
//! A freed range may still be referenced by GPU work that has not been
//! submitted yet. It goes into a stale queue stamped with a fence value and
//! only rejoins the free list in
//! [`release_stale_descriptors`](DescriptorAllocatorPage::release_stale_descriptors)
//! once that fence has completed.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};

use lumen_rhi::{DescriptorHandle, DescriptorHeapId, DescriptorHeapType, GpuDevice};
use tracing::{debug, trace};

use crate::descriptor::DescriptorAllocation;
use crate::error::RendererResult;
use crate::fence::FenceTimeline;
use crate::lock;

/// Free blocks of a page, indexed by offset and by size.
#[derive(Debug, Default)]
struct FreeList {
    by_offset: BTreeMap<u32, u32>,
    by_size: BTreeSet<(u32, u32)>,
}

impl FreeList {
    fn insert(&mut self, offset: u32, size: u32) {
        self.by_offset.insert(offset, size);
        self.by_size.insert((size, offset));
    }

    fn remove(&mut self, offset: u32, size: u32) {
        self.by_offset.remove(&offset);
        self.by_size.remove(&(size, offset));
    }

    /// Smallest block of at least `n` slots, lowest offset first.
    fn best_fit(&self, n: u32) -> Option<(u32, u32)> {
        self.by_size
            .range((n, 0)..)
            .next()
            .map(|&(size, offset)| (offset, size))
    }

    /// Returns a block, merging it with the blocks directly before and after.
    fn insert_coalesced(&mut self, mut offset: u32, mut size: u32) {
        let previous = self
            .by_offset
            .range(..offset)
            .next_back()
            .map(|(&o, &s)| (o, s));
        if let Some((prev_offset, prev_size)) = previous {
            if prev_offset + prev_size == offset {
                self.remove(prev_offset, prev_size);
                offset = prev_offset;
                size += prev_size;
            }
        }

        let next = self.by_offset.get(&(offset + size)).copied();
        if let Some(next_size) = next {
            self.remove(offset + size, next_size);
            size += next_size;
        }

        self.insert(offset, size);
    }
}

#[derive(Debug, Clone, Copy)]
struct StaleBlock {
    offset: u32,
    size: u32,
    fence: u64,
}

#[derive(Debug)]
struct PageState {
    free: FreeList,
    stale: VecDeque<StaleBlock>,
    num_free: u32,
}

/// A CPU-only descriptor heap carved into contiguous ranges.
pub struct DescriptorAllocatorPage {
    device: Arc<dyn GpuDevice>,
    heap: DescriptorHeapId,
    heap_type: DescriptorHeapType,
    capacity: u32,
    stride: u32,
    timeline: Arc<FenceTimeline>,
    state: Mutex<PageState>,
}

impl DescriptorAllocatorPage {
    /// Creates a non-shader-visible heap of `capacity` slots, entirely free.
    pub fn new(
        device: Arc<dyn GpuDevice>,
        heap_type: DescriptorHeapType,
        capacity: u32,
        timeline: Arc<FenceTimeline>,
    ) -> RendererResult<Arc<Self>> {
        let heap = device.create_descriptor_heap(heap_type, capacity, false)?;
        let stride = device.descriptor_stride(heap_type);

        let mut free = FreeList::default();
        free.insert(0, capacity);

        debug!(
            "Descriptor page {:?} created: {} {} slots",
            heap,
            capacity,
            heap_type.name()
        );

        Ok(Arc::new(Self {
            device,
            heap,
            heap_type,
            capacity,
            stride,
            timeline,
            state: Mutex::new(PageState {
                free,
                stale: VecDeque::new(),
                num_free: capacity,
            }),
        }))
    }

    #[inline]
    pub fn heap(&self) -> DescriptorHeapId {
        self.heap
    }

    #[inline]
    pub fn heap_type(&self) -> DescriptorHeapType {
        self.heap_type
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Slots currently on the free list. Stale slots are not counted.
    pub fn num_free_handles(&self) -> u32 {
        lock(&self.state).num_free
    }

    /// Returns true if at least `n` slots are free in total. A contiguous
    /// run of `n` may still be missing.
    pub fn has_space(&self, n: u32) -> bool {
        self.num_free_handles() >= n
    }

    /// Free blocks as `(offset, size)`, ordered by offset.
    pub fn free_blocks(&self) -> Vec<(u32, u32)> {
        lock(&self.state)
            .free
            .by_offset
            .iter()
            .map(|(&offset, &size)| (offset, size))
            .collect()
    }

    /// Number of freed ranges still waiting for their fence.
    pub fn stale_count(&self) -> usize {
        lock(&self.state).stale.len()
    }

    /// Allocates `n` contiguous slots.
    ///
    /// Returns `None` when fewer than `n` slots are free, or when no single
    /// free block is large enough.
    pub fn allocate(self: &Arc<Self>, n: u32) -> Option<DescriptorAllocation> {
        let mut state = lock(&self.state);
        if n == 0 || n > state.num_free {
            return None;
        }

        let (offset, size) = state.free.best_fit(n)?;
        state.free.remove(offset, size);
        if size > n {
            state.free.insert(offset + n, size - n);
        }
        state.num_free -= n;

        trace!(
            "Page {:?}: allocated {}..{} ({} free)",
            self.heap,
            offset,
            offset + n,
            state.num_free
        );

        Some(DescriptorAllocation::new(
            DescriptorHandle::new(self.heap, offset),
            n,
            self.stride,
            self.clone(),
        ))
    }

    /// Queues a range for reclamation after the next submission retires.
    pub(crate) fn free(&self, offset: u32, size: u32) {
        self.free_at(offset, size, self.timeline.next_value());
    }

    /// Queues a range for reclamation after `fence` retires.
    pub(crate) fn free_at(&self, offset: u32, size: u32, fence: u64) {
        let mut state = lock(&self.state);
        debug_assert!(
            state.stale.back().is_none_or(|last| last.fence <= fence),
            "stale fences must not decrease"
        );
        state.stale.push_back(StaleBlock {
            offset,
            size,
            fence,
        });
    }

    /// Returns every stale range whose fence is at or below `completed` to
    /// the free list.
    pub fn release_stale_descriptors(&self, completed: u64) {
        let mut state = lock(&self.state);
        while let Some(block) = state.stale.front().copied() {
            if block.fence > completed {
                break;
            }
            state.stale.pop_front();
            state.free.insert_coalesced(block.offset, block.size);
            state.num_free += block.size;
        }
    }
}

impl Drop for DescriptorAllocatorPage {
    fn drop(&mut self) {
        self.device.destroy_descriptor_heap(self.heap);
        debug!("Descriptor page {:?} destroyed", self.heap);
    }
}

impl std::fmt::Debug for DescriptorAllocatorPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorAllocatorPage")
            .field("heap", &self.heap)
            .field("heap_type", &self.heap_type)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use lumen_rhi::headless::HeadlessDevice;

    use super::*;

    fn page(capacity: u32) -> (Arc<DescriptorAllocatorPage>, Arc<FenceTimeline>) {
        let device: Arc<dyn GpuDevice> = Arc::new(HeadlessDevice::new());
        let timeline = Arc::new(FenceTimeline::new());
        let page = DescriptorAllocatorPage::new(
            device,
            DescriptorHeapType::CbvSrvUav,
            capacity,
            timeline.clone(),
        )
        .unwrap();
        (page, timeline)
    }

    #[test]
    fn test_free_list_best_fit_prefers_smallest_then_lowest_offset() {
        let mut free = FreeList::default();
        free.insert(0, 8);
        free.insert(20, 4);
        free.insert(40, 4);
        free.insert(60, 16);
        assert_eq!(free.best_fit(3), Some((20, 4)));
        assert_eq!(free.best_fit(5), Some((0, 8)));
        assert_eq!(free.best_fit(17), None);
    }

    #[test]
    fn test_free_list_coalesces_both_sides() {
        let mut free = FreeList::default();
        free.insert(0, 10);
        free.insert(20, 5);
        free.insert_coalesced(10, 10);
        assert_eq!(free.by_offset.len(), 1);
        assert_eq!(free.by_offset.get(&0), Some(&25));
        assert_eq!(free.by_size.len(), 1);
    }

    #[test]
    fn test_allocation_is_contiguous_from_start() {
        let (page, _) = page(64);
        let a = page.allocate(10).unwrap();
        let b = page.allocate(5).unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 10);
        assert_eq!(page.num_free_handles(), 49);
        assert_eq!(page.free_blocks(), vec![(15, 49)]);
    }

    #[test]
    fn test_request_larger_than_free_count_fails() {
        let (page, _) = page(16);
        let _a = page.allocate(10).unwrap();
        assert!(page.allocate(7).is_none());
        assert!(page.allocate(0).is_none());
    }

    #[test]
    fn test_fragmentation_fails_despite_total_space() {
        let (page, _) = page(30);
        let a = page.allocate(10).unwrap();
        let _b = page.allocate(10).unwrap();
        let c = page.allocate(10).unwrap();
        a.free_at(0);
        c.free_at(0);
        page.release_stale_descriptors(0);
        assert_eq!(page.num_free_handles(), 20);
        assert!(page.allocate(15).is_none());
    }

    #[test]
    fn test_drop_stamps_next_fence_value() {
        let (page, timeline) = page(32);
        let a = page.allocate(8).unwrap();
        drop(a);
        assert_eq!(page.stale_count(), 1);

        page.release_stale_descriptors(timeline.last_signaled());
        assert_eq!(page.stale_count(), 1);
        assert_eq!(page.num_free_handles(), 24);

        page.release_stale_descriptors(timeline.next_value());
        assert_eq!(page.stale_count(), 0);
        assert_eq!(page.free_blocks(), vec![(0, 32)]);
    }
}
