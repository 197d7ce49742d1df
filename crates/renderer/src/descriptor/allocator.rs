//! Growable pool of descriptor pages for one heap type.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use lumen_rhi::{DescriptorHeapType, GpuDevice};
use tracing::{debug, info};

use super::{DescriptorAllocation, DescriptorAllocatorPage};
use crate::error::{RendererError, RendererResult};
use crate::fence::FenceTimeline;
use crate::lock;

#[derive(Debug, Default)]
struct AllocatorState {
    pages: Vec<Arc<DescriptorAllocatorPage>>,
    /// Indices into `pages` with at least one free slot.
    available: BTreeSet<usize>,
}

/// Hands out CPU-side descriptor ranges of one heap type.
///
/// Pages are created on demand and never destroyed while the allocator
/// lives. Requests larger than the configured page size get a page of
/// exactly their size.
pub struct DescriptorAllocator {
    device: Arc<dyn GpuDevice>,
    heap_type: DescriptorHeapType,
    descriptors_per_page: u32,
    timeline: Arc<FenceTimeline>,
    state: Mutex<AllocatorState>,
}

impl DescriptorAllocator {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        heap_type: DescriptorHeapType,
        descriptors_per_page: u32,
        timeline: Arc<FenceTimeline>,
    ) -> Self {
        Self {
            device,
            heap_type,
            descriptors_per_page,
            timeline,
            state: Mutex::new(AllocatorState::default()),
        }
    }

    #[inline]
    pub fn heap_type(&self) -> DescriptorHeapType {
        self.heap_type
    }

    #[inline]
    pub fn descriptors_per_page(&self) -> u32 {
        self.descriptors_per_page
    }

    pub fn num_pages(&self) -> usize {
        lock(&self.state).pages.len()
    }

    /// Pages in creation order.
    pub fn pages(&self) -> Vec<Arc<DescriptorAllocatorPage>> {
        lock(&self.state).pages.clone()
    }

    /// Allocates `n` contiguous descriptors.
    ///
    /// Available pages are tried in creation order; if none can satisfy the
    /// request a new page of `max(descriptors_per_page, n)` slots is created.
    pub fn allocate(&self, n: u32) -> RendererResult<DescriptorAllocation> {
        if n == 0 {
            return Err(RendererError::InvalidDescriptorCount(n));
        }

        let mut state = lock(&self.state);
        let AllocatorState { pages, available } = &mut *state;

        let mut found = None;
        let mut exhausted = Vec::new();
        for &index in available.iter() {
            let page = &pages[index];
            if let Some(allocation) = page.allocate(n) {
                if page.num_free_handles() == 0 {
                    exhausted.push(index);
                }
                found = Some(allocation);
                break;
            }
        }
        for index in exhausted {
            available.remove(&index);
        }
        if let Some(allocation) = found {
            return Ok(allocation);
        }

        let capacity = self.descriptors_per_page.max(n);
        let page = DescriptorAllocatorPage::new(
            self.device.clone(),
            self.heap_type,
            capacity,
            self.timeline.clone(),
        )?;
        if capacity > self.descriptors_per_page {
            info!(
                "Oversized {} descriptor page of {} slots",
                self.heap_type.name(),
                capacity
            );
        }

        let allocation = page.allocate(n).ok_or(RendererError::InvalidDescriptorCount(n))?;
        let index = pages.len();
        if page.num_free_handles() > 0 {
            available.insert(index);
        }
        pages.push(page);
        debug!(
            "{} descriptor allocator grew to {} pages",
            self.heap_type.name(),
            pages.len()
        );

        Ok(allocation)
    }

    /// Reclaims every stale range whose fence is at or below `completed`.
    pub fn release_stale_descriptors(&self, completed: u64) {
        let mut state = lock(&self.state);
        let AllocatorState { pages, available } = &mut *state;
        for (index, page) in pages.iter().enumerate() {
            page.release_stale_descriptors(completed);
            if page.num_free_handles() > 0 {
                available.insert(index);
            }
        }
    }
}

impl std::fmt::Debug for DescriptorAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorAllocator")
            .field("heap_type", &self.heap_type)
            .field("descriptors_per_page", &self.descriptors_per_page)
            .field("pages", &self.num_pages())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use lumen_rhi::headless::HeadlessDevice;

    use super::*;

    fn allocator(per_page: u32) -> (DescriptorAllocator, Arc<HeadlessDevice>) {
        let device = Arc::new(HeadlessDevice::new());
        let allocator = DescriptorAllocator::new(
            device.clone(),
            DescriptorHeapType::CbvSrvUav,
            per_page,
            Arc::new(FenceTimeline::new()),
        );
        (allocator, device)
    }

    #[test]
    fn test_zero_count_rejected() {
        let (allocator, _) = allocator(16);
        assert!(matches!(
            allocator.allocate(0),
            Err(RendererError::InvalidDescriptorCount(0))
        ));
        assert_eq!(allocator.num_pages(), 0);
    }

    #[test]
    fn test_first_allocation_creates_a_page() {
        let (allocator, device) = allocator(16);
        let allocation = allocator.allocate(4).unwrap();
        assert_eq!(allocation.count(), 4);
        assert_eq!(allocator.num_pages(), 1);
        assert_eq!(device.descriptor_heap_count(), 1);
    }

    #[test]
    fn test_full_page_leaves_the_available_set() {
        let (allocator, _) = allocator(8);
        let _a = allocator.allocate(8).unwrap();
        assert!(lock(&allocator.state).available.is_empty());
        let _b = allocator.allocate(1).unwrap();
        assert_eq!(allocator.num_pages(), 2);
    }

    #[test]
    fn test_oversized_request_gets_its_own_page() {
        let (allocator, _) = allocator(8);
        let allocation = allocator.allocate(20).unwrap();
        assert_eq!(allocation.count(), 20);
        let pages = allocator.pages();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].capacity(), 20);
    }

    #[test]
    fn test_release_restores_availability() {
        let (allocator, _) = allocator(4);
        let allocation = allocator.allocate(4).unwrap();
        allocation.free_at(1);
        allocator.release_stale_descriptors(0);
        assert!(lock(&allocator.state).available.is_empty());
        allocator.release_stale_descriptors(1);
        assert!(lock(&allocator.state).available.contains(&0));

        let again = allocator.allocate(4).unwrap();
        assert_eq!(again.offset(), 0);
        assert_eq!(allocator.num_pages(), 1);
    }

    #[test]
    fn test_concurrent_allocate_and_release_keep_pages_tiled() {
        let (allocator, _) = allocator(64);
        let fence = std::sync::atomic::AtomicU64::new(0);

        let live: Vec<DescriptorAllocation> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8u32)
                .map(|thread| {
                    let allocator = &allocator;
                    let fence = &fence;
                    scope.spawn(move || {
                        let mut held = Vec::new();
                        for step in 0..150u32 {
                            let count = 1 + (thread + step) % 7;
                            held.push(allocator.allocate(count).unwrap());
                            match step % 5 {
                                0 => drop(held.swap_remove(0)),
                                1 | 2 => {
                                    let value = fence.fetch_add(1, Ordering::AcqRel) + 1;
                                    held.swap_remove(held.len() / 2).free_at(value);
                                }
                                _ => {}
                            }
                            if step % 10 == 0 {
                                allocator.release_stale_descriptors(fence.load(Ordering::Acquire));
                            }
                        }
                        held
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|worker| worker.join().unwrap())
                .collect()
        });

        allocator.release_stale_descriptors(u64::MAX);
        for page in allocator.pages() {
            assert_eq!(page.stale_count(), 0);
            let mut ranges = page.free_blocks();
            ranges.extend(
                live.iter()
                    .filter(|a| a.handle(0).is_some_and(|h| h.heap == page.heap()))
                    .map(|a| (a.offset(), a.count())),
            );
            ranges.sort_unstable();
            let mut cursor = 0;
            for (offset, size) in ranges {
                assert_eq!(offset, cursor, "gap or overlap at slot {}", cursor);
                cursor += size;
            }
            assert_eq!(cursor, page.capacity());
        }

        drop(live);
        allocator.release_stale_descriptors(u64::MAX);
        for page in allocator.pages() {
            assert_eq!(page.free_blocks(), vec![(0, page.capacity())]);
        }
    }
}
