//! Staging of CPU descriptors into shader-visible heaps.
//!
//! Shaders can only read descriptors from a shader-visible heap, while the
//! [`DescriptorAllocator`](crate::DescriptorAllocator) creates them in
//! CPU-only pages. A [`DynamicDescriptorHeap`] bridges the two for one
//! command list and one heap type:
//!
//! 1. [`parse_root_signature`](DynamicDescriptorHeap::parse_root_signature)
//!    learns the size of every descriptor table of its heap type.
//! 2. [`stage_descriptors`](DynamicDescriptorHeap::stage_descriptors) records
//!    CPU handles per table and marks the table stale.
//! 3. [`commit_staged_descriptors`](DynamicDescriptorHeap::commit_staged_descriptors)
//!    copies every stale table into the current shader-visible heap in one
//!    backend call and binds the tables.
//!
//! When the stale tables do not fit the rest of the current heap, a new heap
//! is taken from the shared pool (or created), bound, and every table is
//! copied again because the old heap is no longer bound.

use std::sync::Arc;

use lumen_rhi::{
    CommandListId, DescriptorCopy, DescriptorHandle, DescriptorHeapId, DescriptorHeapType,
    GpuDevice, InlineDescriptorKind, MAX_ROOT_PARAMETERS, PipelineBindPoint, RootParameter,
    RootSignatureDesc,
};
use tracing::{debug, trace};

use crate::error::{RendererError, RendererResult};
use crate::fence_pool::SharedFencePool;
use crate::lock;

const MAX_TABLES: u32 = MAX_ROOT_PARAMETERS as u32;

/// A shader-visible descriptor heap owned by the dynamic heap or its pool.
pub struct ShaderVisibleHeap {
    device: Arc<dyn GpuDevice>,
    id: DescriptorHeapId,
    capacity: u32,
}

impl ShaderVisibleHeap {
    fn new(
        device: Arc<dyn GpuDevice>,
        heap_type: DescriptorHeapType,
        capacity: u32,
    ) -> RendererResult<Self> {
        let id = device.create_descriptor_heap(heap_type, capacity, true)?;
        debug!(
            "Shader-visible {} heap {:?}: {} slots",
            heap_type.name(),
            id,
            capacity
        );
        Ok(Self {
            device,
            id,
            capacity,
        })
    }

    #[inline]
    pub fn id(&self) -> DescriptorHeapId {
        self.id
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

impl Drop for ShaderVisibleHeap {
    fn drop(&mut self) {
        self.device.destroy_descriptor_heap(self.id);
    }
}

impl std::fmt::Debug for ShaderVisibleHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderVisibleHeap")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Staged CPU handles of one descriptor table.
#[derive(Debug, Clone, Default)]
struct TableCache {
    handles: Vec<Option<DescriptorHandle>>,
}

impl TableCache {
    #[inline]
    fn size(&self) -> u32 {
        self.handles.len() as u32
    }

    /// Contiguous copies of the staged handles into `dst`. Runs are merged
    /// while both source and destination stay consecutive.
    fn copies_into(&self, dst: DescriptorHandle, copies: &mut Vec<DescriptorCopy>) {
        let mut run: Option<DescriptorCopy> = None;
        for (offset, handle) in self.handles.iter().enumerate() {
            let Some(src) = *handle else {
                copies.extend(run.take());
                continue;
            };
            let target = dst.offset(offset as u32);
            match run.as_mut() {
                Some(current) if current.src.offset(current.count) == src => current.count += 1,
                _ => {
                    copies.extend(run.take());
                    run = Some(DescriptorCopy {
                        src,
                        dst: target,
                        count: 1,
                    });
                }
            }
        }
        copies.extend(run);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InlineDescriptor {
    kind: InlineDescriptorKind,
    gpu_address: u64,
}

/// Iterates the set bits of a root parameter mask, lowest first.
fn set_bits(mut mask: u32) -> impl Iterator<Item = u32> {
    std::iter::from_fn(move || {
        if mask == 0 {
            return None;
        }
        let index = mask.trailing_zeros();
        mask &= mask - 1;
        Some(index)
    })
}

/// Per-list committer of staged descriptors for one heap type.
pub struct DynamicDescriptorHeap {
    device: Arc<dyn GpuDevice>,
    heap_type: DescriptorHeapType,
    descriptors_per_heap: u32,
    pool: SharedFencePool<ShaderVisibleHeap>,
    current: Option<ShaderVisibleHeap>,
    /// First unused slot of `current`.
    next_free: u32,
    retired: Vec<ShaderVisibleHeap>,
    tables: Vec<TableCache>,
    /// Root parameters that are tables of this heap type.
    table_mask: u32,
    stale_tables: u32,
    inline: Vec<Option<InlineDescriptor>>,
    stale_inline: u32,
}

impl DynamicDescriptorHeap {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        heap_type: DescriptorHeapType,
        descriptors_per_heap: u32,
        pool: SharedFencePool<ShaderVisibleHeap>,
    ) -> Self {
        Self {
            device,
            heap_type,
            descriptors_per_heap,
            pool,
            current: None,
            next_free: 0,
            retired: Vec::new(),
            tables: vec![TableCache::default(); MAX_TABLES as usize],
            table_mask: 0,
            stale_tables: 0,
            inline: vec![None; MAX_TABLES as usize],
            stale_inline: 0,
        }
    }

    #[inline]
    pub fn heap_type(&self) -> DescriptorHeapType {
        self.heap_type
    }

    #[inline]
    pub fn descriptors_per_heap(&self) -> u32 {
        self.descriptors_per_heap
    }

    /// Id of the heap descriptors are currently copied into.
    pub fn current_heap(&self) -> Option<DescriptorHeapId> {
        self.current.as_ref().map(ShaderVisibleHeap::id)
    }

    /// Slots left in the current heap.
    pub fn num_free_handles(&self) -> u32 {
        self.current
            .as_ref()
            .map_or(0, |heap| heap.capacity - self.next_free)
    }

    /// Size of the table at `root_index`, 0 if it is not a table of this
    /// heap type.
    pub fn table_size(&self, root_index: u32) -> u32 {
        self.tables
            .get(root_index as usize)
            .map_or(0, TableCache::size)
    }

    /// Learns the table layout of a root signature and drops everything
    /// staged so far. A rejected signature leaves the previous layout and
    /// staged state in place.
    pub fn parse_root_signature(&mut self, desc: &RootSignatureDesc) -> RendererResult<()> {
        let count = desc.parameters.len() as u32;
        if count > MAX_TABLES {
            return Err(RendererError::RootParameterOutOfRange {
                index: count - 1,
                limit: MAX_TABLES,
            });
        }

        let sizes: Vec<u32> = desc
            .parameters
            .iter()
            .map(|parameter| match parameter {
                RootParameter::DescriptorTable(_)
                    if parameter.table_heap_type() == Some(self.heap_type) =>
                {
                    parameter.table_size()
                }
                _ => 0,
            })
            .collect();
        let total: u32 = sizes.iter().sum();
        if total > self.descriptors_per_heap {
            return Err(RendererError::DescriptorTableTooLarge {
                heap_type: self.heap_type,
                size: total,
                capacity: self.descriptors_per_heap,
            });
        }

        self.table_mask = 0;
        self.stale_tables = 0;
        self.stale_inline = 0;
        self.inline.fill(None);
        for (index, table) in self.tables.iter_mut().enumerate() {
            let size = sizes.get(index).copied().unwrap_or(0);
            table.handles = vec![None; size as usize];
            if size > 0 {
                self.table_mask |= 1 << index;
            }
        }
        Ok(())
    }

    /// Stages CPU handles into table `root_index` starting at `offset`.
    pub fn stage_descriptors(
        &mut self,
        root_index: u32,
        offset: u32,
        handles: &[DescriptorHandle],
    ) -> RendererResult<()> {
        if root_index >= MAX_TABLES {
            return Err(RendererError::RootParameterOutOfRange {
                index: root_index,
                limit: MAX_TABLES,
            });
        }
        let table = &mut self.tables[root_index as usize];
        let count = handles.len() as u32;
        if offset as u64 + count as u64 > table.size() as u64 {
            return Err(RendererError::DescriptorTableOverflow {
                root_index,
                offset,
                count,
                table_size: table.size(),
            });
        }

        let start = offset as usize;
        for (slot, handle) in table.handles[start..start + handles.len()]
            .iter_mut()
            .zip(handles)
        {
            *slot = Some(*handle);
        }
        self.stale_tables |= 1 << root_index;
        Ok(())
    }

    /// Stages a buffer address for an inline root descriptor.
    pub fn stage_inline(
        &mut self,
        root_index: u32,
        kind: InlineDescriptorKind,
        gpu_address: u64,
    ) -> RendererResult<()> {
        if root_index >= MAX_TABLES {
            return Err(RendererError::RootParameterOutOfRange {
                index: root_index,
                limit: MAX_TABLES,
            });
        }
        self.inline[root_index as usize] = Some(InlineDescriptor { kind, gpu_address });
        self.stale_inline |= 1 << root_index;
        Ok(())
    }

    pub fn stage_inline_cbv(&mut self, root_index: u32, gpu_address: u64) -> RendererResult<()> {
        self.stage_inline(root_index, InlineDescriptorKind::Cbv, gpu_address)
    }

    pub fn stage_inline_srv(&mut self, root_index: u32, gpu_address: u64) -> RendererResult<()> {
        self.stage_inline(root_index, InlineDescriptorKind::Srv, gpu_address)
    }

    pub fn stage_inline_uav(&mut self, root_index: u32, gpu_address: u64) -> RendererResult<()> {
        self.stage_inline(root_index, InlineDescriptorKind::Uav, gpu_address)
    }

    /// Number of descriptors the stale tables need.
    pub fn stale_descriptor_count(&self) -> u32 {
        set_bits(self.stale_tables)
            .map(|index| self.tables[index as usize].size())
            .sum()
    }

    /// Returns true if anything is staged but not yet bound.
    pub fn has_stale(&self) -> bool {
        self.stale_tables != 0 || self.stale_inline != 0
    }

    /// Copies stale tables into the shader-visible heap and binds them,
    /// then binds stale inline descriptors.
    pub fn commit_staged_descriptors(
        &mut self,
        list: CommandListId,
        bind_point: PipelineBindPoint,
    ) -> RendererResult<()> {
        if self.stale_tables != 0 {
            let needed = self.stale_descriptor_count();
            let heap = match self.current.as_ref() {
                Some(heap) if needed <= heap.capacity - self.next_free => heap.id,
                _ => self.switch_heap(list)?,
            };

            let mut copies = Vec::new();
            let mut bindings = Vec::new();
            for root_index in set_bits(self.stale_tables) {
                let table = &self.tables[root_index as usize];
                let base = DescriptorHandle::new(heap, self.next_free);
                table.copies_into(base, &mut copies);
                bindings.push((root_index, base));
                self.next_free += table.size();
            }

            if !copies.is_empty() {
                self.device.copy_descriptors(&copies)?;
            }
            for (root_index, base) in bindings {
                self.device
                    .set_root_descriptor_table(list, bind_point, root_index, base)?;
            }
            trace!(
                "Committed {} {} copies ({} slots left)",
                copies.len(),
                self.heap_type.name(),
                self.num_free_handles()
            );
            self.stale_tables = 0;
        }

        for root_index in set_bits(self.stale_inline) {
            if let Some(inline) = self.inline[root_index as usize] {
                self.device.set_root_inline_descriptor(
                    list,
                    bind_point,
                    root_index,
                    inline.kind,
                    inline.gpu_address,
                )?;
            }
        }
        self.stale_inline = 0;

        Ok(())
    }

    /// Copies a single CPU descriptor into the shader-visible heap and
    /// returns its shader-visible handle.
    pub fn copy_descriptor(
        &mut self,
        list: CommandListId,
        src: DescriptorHandle,
    ) -> RendererResult<DescriptorHandle> {
        let heap = match self.current.as_ref() {
            Some(heap) if self.next_free < heap.capacity => heap.id,
            _ => self.switch_heap(list)?,
        };
        let dst = DescriptorHandle::new(heap, self.next_free);
        self.device
            .copy_descriptors(&[DescriptorCopy { src, dst, count: 1 }])?;
        self.next_free += 1;
        Ok(dst)
    }

    /// Retires the current heap, binds a fresh one and marks every table
    /// stale.
    fn switch_heap(&mut self, list: CommandListId) -> RendererResult<DescriptorHeapId> {
        let heap = self.acquire_heap()?;
        let id = heap.id;
        if let Some(previous) = self.current.replace(heap) {
            self.retired.push(previous);
        }
        self.next_free = 0;
        self.device.set_descriptor_heap(list, id)?;
        self.stale_tables = self.table_mask;
        debug!("{} dynamic heap switched to {:?}", self.heap_type.name(), id);
        Ok(id)
    }

    fn acquire_heap(&self) -> RendererResult<ShaderVisibleHeap> {
        let completed = self.device.completed_fence_value()?;
        let pooled = lock(&self.pool).pop_ready(completed);
        match pooled {
            Some(heap) => Ok(heap),
            None => ShaderVisibleHeap::new(
                self.device.clone(),
                self.heap_type,
                self.descriptors_per_heap,
            ),
        }
    }

    /// Clears all staged state. The table layout is kept.
    pub fn reset(&mut self) {
        for table in &mut self.tables {
            table.handles.fill(None);
        }
        self.inline.fill(None);
        self.stale_tables = 0;
        self.stale_inline = 0;
    }

    /// Heaps the GPU may read once the owning list is submitted, including
    /// the current one.
    pub fn take_retired_heaps(&mut self) -> Vec<ShaderVisibleHeap> {
        let mut heaps = std::mem::take(&mut self.retired);
        heaps.extend(self.current.take());
        self.next_free = 0;
        heaps
    }
}

impl std::fmt::Debug for DynamicDescriptorHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicDescriptorHeap")
            .field("heap_type", &self.heap_type)
            .field("current", &self.current)
            .field("next_free", &self.next_free)
            .field("table_mask", &format_args!("{:#034b}", self.table_mask))
            .field("stale_tables", &format_args!("{:#034b}", self.stale_tables))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use lumen_rhi::headless::{HeadlessDevice, RecordedCommand};
    use lumen_rhi::{
        BufferDesc, BufferUsage, DescriptorRange, DescriptorRangeKind, DescriptorWrite,
    };

    use super::*;
    use crate::fence_pool::FencePool;

    struct Fixture {
        device: Arc<HeadlessDevice>,
        list: CommandListId,
        cpu_heap: DescriptorHeapId,
    }

    fn fixture() -> Fixture {
        let device = Arc::new(HeadlessDevice::new());
        let allocator = device.create_command_allocator().unwrap();
        let list = device.create_command_list(allocator).unwrap();
        let cpu_heap = device
            .create_descriptor_heap(DescriptorHeapType::CbvSrvUav, 64, false)
            .unwrap();
        let buffer = device
            .create_buffer(&BufferDesc::new(256, BufferUsage::STORAGE))
            .unwrap();
        for index in 0..64 {
            device
                .write_descriptor(
                    DescriptorHandle::new(cpu_heap, index),
                    &DescriptorWrite::StructuredBuffer {
                        resource: buffer,
                        offset: index as u64,
                        size: 4,
                    },
                )
                .unwrap();
        }
        Fixture {
            device,
            list,
            cpu_heap,
        }
    }

    fn heap(fixture: &Fixture, per_heap: u32) -> DynamicDescriptorHeap {
        DynamicDescriptorHeap::new(
            fixture.device.clone(),
            DescriptorHeapType::CbvSrvUav,
            per_heap,
            FencePool::shared(),
        )
    }

    fn two_tables() -> RootSignatureDesc {
        RootSignatureDesc::new()
            .with_inline(InlineDescriptorKind::Cbv, 0)
            .with_table([DescriptorRange::new(DescriptorRangeKind::Srv, 4, 0)])
            .with_table([DescriptorRange::new(DescriptorRangeKind::Sampler, 2, 0)])
            .with_table([
                DescriptorRange::new(DescriptorRangeKind::Cbv, 1, 1),
                DescriptorRange::new(DescriptorRangeKind::Uav, 2, 0),
            ])
    }

    fn recorded(fixture: &Fixture) -> Vec<RecordedCommand> {
        fixture.device.close_command_list(fixture.list).unwrap();
        fixture
            .device
            .execute_command_lists(&[fixture.list])
            .unwrap();
        fixture
            .device
            .last_submission()
            .map(|submission| submission.lists[0].commands.clone())
            .unwrap_or_default()
    }

    #[test]
    fn test_set_bits() {
        assert_eq!(set_bits(0b1010_0001).collect::<Vec<_>>(), vec![0, 5, 7]);
        assert_eq!(set_bits(0).count(), 0);
    }

    #[test]
    fn test_parse_only_tracks_matching_tables() {
        let fixture = fixture();
        let mut heap = heap(&fixture, 64);
        heap.parse_root_signature(&two_tables()).unwrap();
        assert_eq!(heap.table_mask, 0b1010);
        assert_eq!(heap.table_size(1), 4);
        assert_eq!(heap.table_size(2), 0);
        assert_eq!(heap.table_size(3), 3);
    }

    #[test]
    fn test_stage_errors() {
        let fixture = fixture();
        let mut heap = heap(&fixture, 64);
        heap.parse_root_signature(&two_tables()).unwrap();
        let handle = DescriptorHandle::new(fixture.cpu_heap, 0);

        assert!(matches!(
            heap.stage_descriptors(32, 0, &[handle]),
            Err(RendererError::RootParameterOutOfRange { index: 32, limit: 32 })
        ));
        assert!(matches!(
            heap.stage_descriptors(1, 3, &[handle, handle]),
            Err(RendererError::DescriptorTableOverflow {
                root_index: 1,
                offset: 3,
                count: 2,
                table_size: 4
            })
        ));
        assert!(heap.stage_descriptors(1, 2, &[handle, handle]).is_ok());
    }

    #[test]
    fn test_table_larger_than_heap_rejected() {
        let fixture = fixture();
        let mut heap = heap(&fixture, 4);
        assert!(matches!(
            heap.parse_root_signature(&two_tables()),
            Err(RendererError::DescriptorTableTooLarge {
                size: 7,
                capacity: 4,
                ..
            })
        ));
        assert_eq!(heap.table_mask, 0);
        assert_eq!(heap.table_size(1), 0);
    }

    #[test]
    fn test_rejected_signature_keeps_previous_tables() {
        let fixture = fixture();
        let mut heap = heap(&fixture, 4);
        let small = RootSignatureDesc::new()
            .with_table([DescriptorRange::new(DescriptorRangeKind::Srv, 2, 0)]);
        heap.parse_root_signature(&small).unwrap();
        let src = DescriptorHandle::new(fixture.cpu_heap, 0);
        heap.stage_descriptors(0, 0, &[src, src.offset(1)]).unwrap();

        assert!(heap.parse_root_signature(&two_tables()).is_err());
        assert_eq!(heap.table_mask, 0b1);
        assert_eq!(heap.table_size(0), 2);
        assert_eq!(heap.table_size(1), 0);
        assert!(heap.has_stale());

        // Several heap switches must never overrun the heap.
        for round in 0..3 {
            heap.stage_descriptors(0, 0, &[src.offset(round)]).unwrap();
            heap.commit_staged_descriptors(fixture.list, PipelineBindPoint::Graphics)
                .unwrap();
            assert!(heap.num_free_handles() <= 4);
        }
    }

    #[test]
    fn test_commit_copies_and_binds() {
        let fixture = fixture();
        let mut heap = heap(&fixture, 64);
        heap.parse_root_signature(&two_tables()).unwrap();

        let src = DescriptorHandle::new(fixture.cpu_heap, 10);
        heap.stage_descriptors(1, 0, &[src, src.offset(1), src.offset(2), src.offset(3)])
            .unwrap();
        heap.stage_inline_cbv(0, 0x1000).unwrap();
        heap.commit_staged_descriptors(fixture.list, PipelineBindPoint::Graphics)
            .unwrap();
        assert!(!heap.has_stale());

        let visible = heap.current_heap().unwrap();
        assert_eq!(fixture.device.is_shader_visible(visible), Some(true));
        for offset in 0..4 {
            assert_eq!(
                fixture.device.descriptor(DescriptorHandle::new(visible, offset)),
                fixture.device.descriptor(src.offset(offset))
            );
        }

        let commands = recorded(&fixture);
        assert_eq!(
            commands,
            vec![
                RecordedCommand::SetDescriptorHeap(visible),
                RecordedCommand::SetDescriptorTable {
                    bind_point: PipelineBindPoint::Graphics,
                    root_index: 1,
                    base: DescriptorHandle::new(visible, 0),
                },
                RecordedCommand::SetInlineDescriptor {
                    bind_point: PipelineBindPoint::Graphics,
                    root_index: 0,
                    kind: InlineDescriptorKind::Cbv,
                    gpu_address: 0x1000,
                },
            ]
        );
    }

    #[test]
    fn test_contiguous_sources_merge_into_one_copy() {
        let mut cache = TableCache {
            handles: vec![None; 5],
        };
        let heap = DescriptorHeapId::from_raw(1);
        cache.handles[0] = Some(DescriptorHandle::new(heap, 4));
        cache.handles[1] = Some(DescriptorHandle::new(heap, 5));
        cache.handles[2] = Some(DescriptorHandle::new(heap, 9));
        cache.handles[4] = Some(DescriptorHandle::new(heap, 10));

        let dst = DescriptorHandle::new(DescriptorHeapId::from_raw(2), 0);
        let mut copies = Vec::new();
        cache.copies_into(dst, &mut copies);
        assert_eq!(copies.len(), 3);
        assert_eq!(copies[0].count, 2);
        assert_eq!(copies[1].dst.index, 2);
        assert_eq!(copies[2].dst.index, 4);
    }

    #[test]
    fn test_full_heap_switches_and_restages_every_table() {
        let fixture = fixture();
        let mut heap = heap(&fixture, 8);
        heap.parse_root_signature(&two_tables()).unwrap();
        let src = DescriptorHandle::new(fixture.cpu_heap, 0);

        heap.stage_descriptors(1, 0, &[src]).unwrap();
        heap.stage_descriptors(3, 0, &[src]).unwrap();
        heap.commit_staged_descriptors(fixture.list, PipelineBindPoint::Compute)
            .unwrap();
        let first = heap.current_heap().unwrap();
        assert_eq!(heap.num_free_handles(), 1);

        heap.stage_descriptors(1, 0, &[src.offset(1)]).unwrap();
        heap.commit_staged_descriptors(fixture.list, PipelineBindPoint::Compute)
            .unwrap();
        let second = heap.current_heap().unwrap();
        assert_ne!(first, second);
        // both tables were copied into the new heap
        assert_eq!(heap.num_free_handles(), 1);

        let retired = heap.take_retired_heaps();
        assert_eq!(retired.len(), 2);
        assert!(heap.current_heap().is_none());
    }

    #[test]
    fn test_copy_descriptor_returns_visible_handle() {
        let fixture = fixture();
        let mut heap = heap(&fixture, 2);
        let src = DescriptorHandle::new(fixture.cpu_heap, 7);
        let a = heap.copy_descriptor(fixture.list, src).unwrap();
        let b = heap.copy_descriptor(fixture.list, src).unwrap();
        let c = heap.copy_descriptor(fixture.list, src).unwrap();
        assert_eq!(a.heap, b.heap);
        assert_eq!(b.index, 1);
        assert_ne!(c.heap, a.heap);
        assert_eq!(c.index, 0);
        assert_eq!(fixture.device.descriptor(c), fixture.device.descriptor(src));
    }

    #[test]
    fn test_pooled_heap_reused() {
        let fixture = fixture();
        let pool = FencePool::shared();
        let mut heap = DynamicDescriptorHeap::new(
            fixture.device.clone(),
            DescriptorHeapType::CbvSrvUav,
            16,
            pool.clone(),
        );
        let src = DescriptorHandle::new(fixture.cpu_heap, 0);
        let first = heap.copy_descriptor(fixture.list, src).unwrap().heap;
        for retired in heap.take_retired_heaps() {
            lock(&pool).push(0, retired);
        }
        let second = heap.copy_descriptor(fixture.list, src).unwrap().heap;
        assert_eq!(first, second);
    }
}
