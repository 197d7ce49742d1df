//! Linear allocator for per-frame CPU-to-GPU data.
//!
//! Each command list owns an [`UploadBuffer`]. Allocations are bumped out of
//! a persistently mapped page; when the page runs out it is retired and a
//! fresh one is taken from the shared pool (or created). Retired pages go to
//! the queue at submission and come back to the pool once the submission's
//! fence has completed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytemuck::Pod;
use lumen_rhi::{GpuDevice, MappedPtr, ResourceId, UploadPageInfo};
use tracing::{debug, trace};

use crate::error::{RendererError, RendererResult};
use crate::fence_pool::SharedFencePool;
use crate::lock;

/// The mapped buffer behind a page. Shared by the page and every allocation
/// made from it, so the mapping outlives whichever is dropped last.
struct PageBacking {
    device: Arc<dyn GpuDevice>,
    info: UploadPageInfo,
    /// Bumped each time the page is reset for reuse.
    generation: AtomicU64,
}

impl Drop for PageBacking {
    fn drop(&mut self) {
        self.device.destroy_resource(self.info.resource);
        debug!("Upload page {:?} destroyed", self.info.resource);
    }
}

/// One mapped page of upload memory.
pub struct UploadPage {
    backing: Arc<PageBacking>,
    offset: u64,
}

impl UploadPage {
    fn new(device: Arc<dyn GpuDevice>, size: u64) -> RendererResult<Self> {
        let info = device.create_upload_page(size)?;
        Ok(Self {
            backing: Arc::new(PageBacking {
                device,
                info,
                generation: AtomicU64::new(0),
            }),
            offset: 0,
        })
    }

    #[inline]
    pub fn resource(&self) -> ResourceId {
        self.backing.info.resource
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.backing.info.size
    }

    /// Bytes handed out so far.
    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn has_space(&self, size: u64, alignment: u64) -> bool {
        align_up(self.offset, alignment)
            .checked_add(size)
            .is_some_and(|end| end <= self.size())
    }

    fn allocate(&mut self, size: u64, alignment: u64) -> UploadAllocation {
        let offset = align_up(self.offset, alignment);
        self.offset = offset + size;
        let info = &self.backing.info;
        // Safety: `has_space` guarantees `offset + size` lies inside the page.
        let cpu = unsafe { info.mapped.add(offset as usize) };
        UploadAllocation {
            backing: self.backing.clone(),
            generation: self.backing.generation.load(Ordering::Acquire),
            offset,
            size,
            gpu_address: info.gpu_address + offset,
            cpu,
        }
    }

    /// Makes the page empty again. Allocations made before the reset can no
    /// longer write.
    fn reset(&mut self) {
        self.backing.generation.fetch_add(1, Ordering::AcqRel);
        self.offset = 0;
    }
}

impl std::fmt::Debug for UploadPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadPage")
            .field("resource", &self.resource())
            .field("size", &self.size())
            .field("offset", &self.offset)
            .finish()
    }
}

/// A sub-range of an upload page.
///
/// Keeps the page's mapping alive. Writing fails with
/// [`RendererError::UploadRecycled`] once the page has been reset for a
/// later list, which can only happen after the owning list was submitted
/// and its fence completed.
pub struct UploadAllocation {
    backing: Arc<PageBacking>,
    generation: u64,
    offset: u64,
    size: u64,
    gpu_address: u64,
    cpu: MappedPtr,
}

impl UploadAllocation {
    /// Page buffer the bytes live in.
    #[inline]
    pub fn resource(&self) -> ResourceId {
        self.backing.info.resource
    }

    /// Byte offset within the page buffer.
    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    #[inline]
    pub fn cpu_ptr(&self) -> MappedPtr {
        self.cpu
    }

    /// Returns false once the page has been handed to another list.
    pub fn is_current(&self) -> bool {
        self.backing.generation.load(Ordering::Acquire) == self.generation
    }

    /// Copies `data` to the start of the allocation.
    pub fn write(&self, data: &[u8]) -> RendererResult<()> {
        if data.len() as u64 > self.size {
            return Err(RendererError::UploadOverflow {
                len: data.len(),
                size: self.size,
            });
        }
        if !self.is_current() {
            return Err(RendererError::UploadRecycled(self.resource()));
        }
        // Safety: the destination range lies within this allocation and the
        // mapping is kept alive by `backing`.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.cpu.as_ptr(), data.len());
        }
        Ok(())
    }

    /// Copies a plain-old-data value to the start of the allocation.
    pub fn write_pod<T: Pod>(&self, value: &T) -> RendererResult<()> {
        self.write(bytemuck::bytes_of(value))
    }
}

impl std::fmt::Debug for UploadAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadAllocation")
            .field("resource", &self.resource())
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Per-list upload allocator.
pub struct UploadBuffer {
    device: Arc<dyn GpuDevice>,
    pool: SharedFencePool<UploadPage>,
    page_size: u64,
    current: Option<UploadPage>,
    retired: Vec<UploadPage>,
}

impl UploadBuffer {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        pool: SharedFencePool<UploadPage>,
        page_size: u64,
    ) -> Self {
        Self {
            device,
            pool,
            page_size,
            current: None,
            retired: Vec::new(),
        }
    }

    #[inline]
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Allocates `size` bytes aligned to `alignment`.
    ///
    /// Requests larger than the page size get a dedicated page that is
    /// retired straight away; the current page is left untouched.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> RendererResult<UploadAllocation> {
        if !alignment.is_power_of_two() {
            return Err(RendererError::InvalidAlignment(alignment));
        }

        if size > self.page_size {
            let mut page = UploadPage::new(self.device.clone(), size)?;
            debug!("Oversized upload page of {} bytes", size);
            let allocation = page.allocate(size, alignment);
            self.retired.push(page);
            return Ok(allocation);
        }

        let mut page = match self.current.take() {
            Some(page) if page.has_space(size, alignment) => page,
            full => {
                if let Some(full) = full {
                    trace!(
                        "Upload page {:?} retired at {} bytes",
                        full.resource(),
                        full.offset()
                    );
                    self.retired.push(full);
                }
                self.acquire_page()?
            }
        };
        let allocation = page.allocate(size, alignment);
        self.current = Some(page);
        Ok(allocation)
    }

    /// Takes a retired page from the pool, or creates one.
    ///
    /// Oversized pages that come back from the pool are dropped.
    fn acquire_page(&self) -> RendererResult<UploadPage> {
        let completed = self.device.completed_fence_value()?;
        {
            let mut pool = lock(&self.pool);
            while let Some(mut page) = pool.pop_ready(completed) {
                if page.size() == self.page_size {
                    page.reset();
                    return Ok(page);
                }
            }
        }
        UploadPage::new(self.device.clone(), self.page_size)
    }

    /// Pages the GPU may read once the owning list is submitted, including
    /// the current one.
    pub fn take_retired_pages(&mut self) -> Vec<UploadPage> {
        let mut pages = std::mem::take(&mut self.retired);
        pages.extend(self.current.take());
        pages
    }

    /// The page allocations currently come from.
    pub fn current_page(&self) -> Option<&UploadPage> {
        self.current.as_ref()
    }

    pub fn retired_page_count(&self) -> usize {
        self.retired.len()
    }
}

impl std::fmt::Debug for UploadBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadBuffer")
            .field("page_size", &self.page_size)
            .field("current", &self.current)
            .field("retired", &self.retired.len())
            .finish()
    }
}

#[inline]
fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use lumen_rhi::headless::{FenceMode, HeadlessDevice};

    use super::*;
    use crate::fence_pool::FencePool;

    const KIB: u64 = 1024;

    fn upload(device: &Arc<HeadlessDevice>, page_size: u64) -> UploadBuffer {
        UploadBuffer::new(device.clone(), FencePool::shared(), page_size)
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(300, 4), 300);
    }

    #[test]
    fn test_allocations_bump_and_align() {
        let device = Arc::new(HeadlessDevice::new());
        let mut upload = upload(&device, 4 * KIB);
        let a = upload.allocate(10, 4).unwrap();
        let b = upload.allocate(16, 256).unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 256);
        assert_eq!(a.resource(), b.resource());
        assert_eq!(b.gpu_address(), a.gpu_address() + 256);
    }

    #[test]
    fn test_non_power_of_two_alignment_rejected() {
        let device = Arc::new(HeadlessDevice::new());
        let mut upload = upload(&device, 4 * KIB);
        assert!(matches!(
            upload.allocate(8, 3),
            Err(RendererError::InvalidAlignment(3))
        ));
        assert!(matches!(
            upload.allocate(8, 0),
            Err(RendererError::InvalidAlignment(0))
        ));
    }

    #[test]
    fn test_oversized_request_leaves_current_page() {
        let device = Arc::new(HeadlessDevice::new());
        let mut upload = upload(&device, 4 * KIB);
        let small = upload.allocate(64, 16).unwrap();
        let big = upload.allocate(10 * KIB, 16).unwrap();
        assert_eq!(big.offset(), 0);
        assert_ne!(big.resource(), small.resource());
        assert_eq!(upload.current_page().map(UploadPage::offset), Some(64));
        assert_eq!(upload.retired_page_count(), 1);
        assert_eq!(upload.page_size(), 4 * KIB);
    }

    #[test]
    fn test_write_is_bounds_checked() {
        let device = Arc::new(HeadlessDevice::new());
        let mut upload = upload(&device, KIB);
        let allocation = upload.allocate(4, 4).unwrap();
        allocation.write(&[1, 2, 3, 4]).unwrap();
        assert!(matches!(
            allocation.write(&[0; 5]),
            Err(RendererError::UploadOverflow { len: 5, size: 4 })
        ));
        allocation.write_pod(&0xAABB_CCDDu32).unwrap();
        assert_eq!(
            device.read_buffer(allocation.resource(), 0, 4),
            Some(0xAABB_CCDDu32.to_ne_bytes().to_vec())
        );
    }

    #[test]
    fn test_pool_page_reused_only_after_fence() {
        let device = Arc::new(HeadlessDevice::with_fence_mode(FenceMode::Manual));
        let pool = FencePool::shared();
        let mut upload = UploadBuffer::new(device.clone(), pool.clone(), KIB);
        let first = upload.allocate(512, 4).unwrap();

        device.signal(1).unwrap();
        for page in upload.take_retired_pages() {
            lock(&pool).push(1, page);
        }

        let second = upload.allocate(512, 4).unwrap();
        assert_ne!(second.resource(), first.resource());

        device.complete_fence(1);
        let _ = upload.take_retired_pages();
        let third = upload.allocate(512, 4).unwrap();
        assert_eq!(third.resource(), first.resource());
        assert_eq!(third.offset(), 0);
    }

    #[test]
    fn test_allocation_outlives_its_buffer() {
        let device = Arc::new(HeadlessDevice::new());
        let mut upload = upload(&device, KIB);
        let allocation = upload.allocate(4, 4).unwrap();
        drop(upload);

        allocation.write(&[0xAB; 4]).unwrap();
        assert_eq!(
            device.read_buffer(allocation.resource(), allocation.offset(), 4),
            Some(vec![0xAB; 4])
        );

        let resource = allocation.resource();
        drop(allocation);
        assert_eq!(device.read_buffer(resource, 0, 4), None);
    }

    #[test]
    fn test_write_after_page_recycled_fails() {
        let device = Arc::new(HeadlessDevice::new());
        let pool = FencePool::shared();
        let mut upload = UploadBuffer::new(device.clone(), pool.clone(), KIB);
        let stale = upload.allocate(16, 4).unwrap();

        device.signal(1).unwrap();
        for page in upload.take_retired_pages() {
            lock(&pool).push(1, page);
        }

        let fresh = upload.allocate(16, 4).unwrap();
        assert_eq!(fresh.resource(), stale.resource());
        assert!(fresh.is_current());
        assert!(!stale.is_current());

        fresh.write(&[7; 16]).unwrap();
        assert!(matches!(
            stale.write(&[9; 16]),
            Err(RendererError::UploadRecycled(resource)) if resource == stale.resource()
        ));
        assert_eq!(
            device.read_buffer(fresh.resource(), 0, 16),
            Some(vec![7; 16])
        );
    }
}
