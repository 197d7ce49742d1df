//! Global per-subresource layout state.
//!
//! The tracker holds the layout every registered texture subresource is in
//! once all submitted work has executed. Command lists never read it while
//! recording; the queue reads and updates it under one lock when a list is
//! submitted, which keeps the state consistent across lists recorded in
//! parallel.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use lumen_rhi::{ResourceId, ResourceLayout, TextureDesc, TextureFormat};
use tracing::{debug, trace};

use crate::error::{RendererError, RendererResult};
use crate::lock;

/// Shape of a texture's subresource array.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubresourceDesc {
    pub mip_levels: u32,
    pub array_size: u32,
    pub format: TextureFormat,
}

impl SubresourceDesc {
    pub fn new(mip_levels: u32, array_size: u32, format: TextureFormat) -> Self {
        Self {
            mip_levels,
            array_size,
            format,
        }
    }

    #[inline]
    pub fn plane_count(&self) -> u32 {
        self.format.plane_count()
    }

    /// `mips * slices * planes`.
    #[inline]
    pub fn subresource_count(&self) -> u32 {
        self.mip_levels * self.array_size * self.plane_count()
    }
}

impl From<&TextureDesc> for SubresourceDesc {
    fn from(desc: &TextureDesc) -> Self {
        Self::new(desc.mip_levels, desc.array_size, desc.format)
    }
}

#[derive(Debug)]
struct TrackedResource {
    desc: SubresourceDesc,
    layouts: Vec<ResourceLayout>,
}

/// Layout state of every registered resource.
///
/// Obtained through [`ResourceLayoutTracker::lock`] when several reads and
/// writes must happen atomically.
#[derive(Debug, Default)]
pub struct LayoutTable {
    resources: HashMap<ResourceId, TrackedResource>,
}

impl LayoutTable {
    fn tracked(&self, resource: ResourceId) -> RendererResult<&TrackedResource> {
        self.resources
            .get(&resource)
            .ok_or(RendererError::ResourceNotRegistered(resource))
    }

    fn check_index(
        resource: ResourceId,
        tracked: &TrackedResource,
        subresource: u32,
    ) -> RendererResult<usize> {
        let count = tracked.layouts.len() as u32;
        if subresource >= count {
            return Err(RendererError::SubresourceOutOfRange {
                resource,
                index: subresource,
                count,
            });
        }
        Ok(subresource as usize)
    }

    /// Registers a resource with every subresource in `initial`. Replaces
    /// any previous registration of the same id.
    pub fn register(
        &mut self,
        resource: ResourceId,
        initial: ResourceLayout,
        desc: SubresourceDesc,
    ) {
        let count = desc.subresource_count() as usize;
        let previous = self.resources.insert(
            resource,
            TrackedResource {
                desc,
                layouts: vec![initial; count],
            },
        );
        if previous.is_some() {
            debug!("Re-registered {:?} ({} subresources)", resource, count);
        } else {
            trace!("Registered {:?} ({} subresources)", resource, count);
        }
    }

    /// Forgets a resource. Returns false if it was not registered.
    pub fn unregister(&mut self, resource: ResourceId) -> bool {
        self.resources.remove(&resource).is_some()
    }

    pub fn is_registered(&self, resource: ResourceId) -> bool {
        self.resources.contains_key(&resource)
    }

    pub fn subresource_desc(&self, resource: ResourceId) -> RendererResult<SubresourceDesc> {
        Ok(self.tracked(resource)?.desc)
    }

    pub fn layout(&self, resource: ResourceId, subresource: u32) -> RendererResult<ResourceLayout> {
        let tracked = self.tracked(resource)?;
        let index = Self::check_index(resource, tracked, subresource)?;
        Ok(tracked.layouts[index])
    }

    /// Layouts of all subresources in flat index order.
    pub fn layouts(&self, resource: ResourceId) -> RendererResult<&[ResourceLayout]> {
        Ok(&self.tracked(resource)?.layouts)
    }

    pub fn set_layout(
        &mut self,
        resource: ResourceId,
        subresource: u32,
        layout: ResourceLayout,
    ) -> RendererResult<()> {
        let tracked = self
            .resources
            .get_mut(&resource)
            .ok_or(RendererError::ResourceNotRegistered(resource))?;
        let index = Self::check_index(resource, tracked, subresource)?;
        tracked.layouts[index] = layout;
        Ok(())
    }

    /// Writes back the layouts a list left behind. `None` entries were not
    /// touched by the list and keep their current value.
    pub fn merge(
        &mut self,
        resource: ResourceId,
        finals: &[Option<ResourceLayout>],
    ) -> RendererResult<()> {
        let tracked = self
            .resources
            .get_mut(&resource)
            .ok_or(RendererError::ResourceNotRegistered(resource))?;
        check_shape(resource, tracked.layouts.len(), finals.len())?;
        apply_finals(&mut tracked.layouts, finals);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

fn check_shape(resource: ResourceId, expected: usize, actual: usize) -> RendererResult<()> {
    if expected != actual {
        return Err(RendererError::SubresourceCountMismatch {
            resource,
            expected: expected as u32,
            actual: actual as u32,
        });
    }
    Ok(())
}

fn apply_finals(layouts: &mut [ResourceLayout], finals: &[Option<ResourceLayout>]) {
    for (slot, layout) in layouts.iter_mut().zip(finals) {
        if let Some(layout) = layout {
            *slot = *layout;
        }
    }
}

/// Layouts a batch of lists will leave behind, held apart from the
/// [`LayoutTable`] until the batch has actually been submitted.
///
/// Later lists of the batch resolve against the staged state of earlier
/// ones. Nothing reaches the table unless [`StagedLayouts::commit`] runs.
#[derive(Debug, Default)]
pub struct StagedLayouts {
    resources: HashMap<ResourceId, Vec<ResourceLayout>>,
}

impl StagedLayouts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Layout of a subresource as seen by the next list of the batch.
    pub fn layout(
        &self,
        table: &LayoutTable,
        resource: ResourceId,
        subresource: u32,
    ) -> RendererResult<ResourceLayout> {
        match self.resources.get(&resource) {
            Some(layouts) => layouts.get(subresource as usize).copied().ok_or(
                RendererError::SubresourceOutOfRange {
                    resource,
                    index: subresource,
                    count: layouts.len() as u32,
                },
            ),
            None => table.layout(resource, subresource),
        }
    }

    /// Stages the final layouts of one list.
    pub fn merge(
        &mut self,
        table: &LayoutTable,
        resource: ResourceId,
        finals: &[Option<ResourceLayout>],
    ) -> RendererResult<()> {
        let current = table.layouts(resource)?;
        check_shape(resource, current.len(), finals.len())?;
        let layouts = self
            .resources
            .entry(resource)
            .or_insert_with(|| current.to_vec());
        apply_finals(layouts, finals);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Writes the staged layouts into the table.
    ///
    /// Resources unregistered or re-registered with another shape since
    /// staging are left alone.
    pub fn commit(self, table: &mut LayoutTable) {
        for (resource, layouts) in self.resources {
            match table.resources.get_mut(&resource) {
                Some(tracked) if tracked.layouts.len() == layouts.len() => {
                    tracked.layouts = layouts;
                }
                _ => debug!("Dropped staged layouts of {:?}", resource),
            }
        }
    }
}

/// Thread-safe owner of the [`LayoutTable`].
#[derive(Debug, Default)]
pub struct ResourceLayoutTracker {
    table: Mutex<LayoutTable>,
}

impl ResourceLayoutTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the table for a sequence of reads and writes.
    pub fn lock(&self) -> MutexGuard<'_, LayoutTable> {
        lock(&self.table)
    }

    pub fn register_resource(
        &self,
        resource: ResourceId,
        initial: ResourceLayout,
        desc: SubresourceDesc,
    ) {
        self.lock().register(resource, initial, desc);
    }

    pub fn unregister_resource(&self, resource: ResourceId) -> bool {
        self.lock().unregister(resource)
    }

    pub fn is_registered(&self, resource: ResourceId) -> bool {
        self.lock().is_registered(resource)
    }

    pub fn subresource_desc(&self, resource: ResourceId) -> RendererResult<SubresourceDesc> {
        self.lock().subresource_desc(resource)
    }

    pub fn layout(&self, resource: ResourceId, subresource: u32) -> RendererResult<ResourceLayout> {
        self.lock().layout(resource, subresource)
    }

    /// Copy of all subresource layouts.
    pub fn layouts(&self, resource: ResourceId) -> RendererResult<Vec<ResourceLayout>> {
        self.lock().layouts(resource).map(<[_]>::to_vec)
    }

    pub fn set_layout(
        &self,
        resource: ResourceId,
        subresource: u32,
        layout: ResourceLayout,
    ) -> RendererResult<()> {
        self.lock().set_layout(resource, subresource, layout)
    }
}

#[cfg(test)]
mod tests {
    use lumen_rhi::subresource_index;

    use super::*;

    fn id(raw: u64) -> ResourceId {
        ResourceId::from_raw(raw)
    }

    #[test]
    fn test_register_sets_every_subresource() {
        let tracker = ResourceLayoutTracker::new();
        tracker.register_resource(
            id(1),
            ResourceLayout::CopyDest,
            SubresourceDesc::new(3, 2, TextureFormat::Rgba8Unorm),
        );
        let layouts = tracker.layouts(id(1)).unwrap();
        assert_eq!(layouts.len(), 6);
        assert!(layouts.iter().all(|l| *l == ResourceLayout::CopyDest));
    }

    #[test]
    fn test_depth_stencil_has_two_planes() {
        let tracker = ResourceLayoutTracker::new();
        tracker.register_resource(
            id(1),
            ResourceLayout::DepthStencilWrite,
            SubresourceDesc::new(1, 1, TextureFormat::D24UnormS8Uint),
        );
        let stencil = subresource_index(0, 0, 1, 1, 1);
        tracker
            .set_layout(id(1), stencil, ResourceLayout::DepthStencilRead)
            .unwrap();
        assert_eq!(
            tracker.layouts(id(1)).unwrap(),
            vec![
                ResourceLayout::DepthStencilWrite,
                ResourceLayout::DepthStencilRead
            ]
        );
    }

    #[test]
    fn test_unknown_resource_errors() {
        let tracker = ResourceLayoutTracker::new();
        assert!(matches!(
            tracker.layout(id(9), 0),
            Err(RendererError::ResourceNotRegistered(r)) if r == id(9)
        ));
        assert!(!tracker.unregister_resource(id(9)));
    }

    #[test]
    fn test_out_of_range_subresource_errors() {
        let tracker = ResourceLayoutTracker::new();
        tracker.register_resource(
            id(1),
            ResourceLayout::Common,
            SubresourceDesc::new(2, 1, TextureFormat::Rgba8Unorm),
        );
        assert!(matches!(
            tracker.set_layout(id(1), 2, ResourceLayout::CopyDest),
            Err(RendererError::SubresourceOutOfRange { index: 2, count: 2, .. })
        ));
    }

    #[test]
    fn test_reregister_replaces_state() {
        let tracker = ResourceLayoutTracker::new();
        tracker.register_resource(
            id(1),
            ResourceLayout::RenderTarget,
            SubresourceDesc::new(1, 1, TextureFormat::Bgra8Unorm),
        );
        tracker.register_resource(
            id(1),
            ResourceLayout::Present,
            SubresourceDesc::new(4, 1, TextureFormat::Bgra8Unorm),
        );
        assert_eq!(tracker.layouts(id(1)).unwrap().len(), 4);
        assert_eq!(tracker.layout(id(1), 3).unwrap(), ResourceLayout::Present);
    }

    #[test]
    fn test_merge_skips_untouched() {
        let tracker = ResourceLayoutTracker::new();
        tracker.register_resource(
            id(1),
            ResourceLayout::Common,
            SubresourceDesc::new(3, 1, TextureFormat::Rgba8Unorm),
        );
        tracker
            .lock()
            .merge(id(1), &[None, Some(ResourceLayout::ShaderResource), None])
            .unwrap();
        assert_eq!(
            tracker.layouts(id(1)).unwrap(),
            vec![
                ResourceLayout::Common,
                ResourceLayout::ShaderResource,
                ResourceLayout::Common
            ]
        );
    }

    #[test]
    fn test_merge_rejects_snapshot_of_other_shape() {
        let tracker = ResourceLayoutTracker::new();
        tracker.register_resource(
            id(1),
            ResourceLayout::Common,
            SubresourceDesc::new(4, 1, TextureFormat::Rgba8Unorm),
        );
        let finals = vec![Some(ResourceLayout::CopyDest); 4];

        // Resized between recording and submission.
        tracker.register_resource(
            id(1),
            ResourceLayout::Common,
            SubresourceDesc::new(2, 1, TextureFormat::Rgba8Unorm),
        );
        assert!(matches!(
            tracker.lock().merge(id(1), &finals),
            Err(RendererError::SubresourceCountMismatch {
                expected: 2,
                actual: 4,
                ..
            })
        ));
        assert_eq!(
            tracker.layouts(id(1)).unwrap(),
            vec![ResourceLayout::Common; 2]
        );
    }

    #[test]
    fn test_staged_layouts_apply_only_on_commit() {
        let tracker = ResourceLayoutTracker::new();
        tracker.register_resource(
            id(1),
            ResourceLayout::Common,
            SubresourceDesc::new(2, 1, TextureFormat::Rgba8Unorm),
        );
        let mut table = tracker.lock();
        let mut staged = StagedLayouts::new();
        staged
            .merge(&table, id(1), &[Some(ResourceLayout::RenderTarget), None])
            .unwrap();

        assert_eq!(
            staged.layout(&table, id(1), 0).unwrap(),
            ResourceLayout::RenderTarget
        );
        assert_eq!(staged.layout(&table, id(1), 1).unwrap(), ResourceLayout::Common);
        assert_eq!(table.layout(id(1), 0).unwrap(), ResourceLayout::Common);
        assert!(matches!(
            staged.merge(&table, id(1), &[None]),
            Err(RendererError::SubresourceCountMismatch { .. })
        ));

        staged.commit(&mut table);
        assert_eq!(table.layout(id(1), 0).unwrap(), ResourceLayout::RenderTarget);
    }

    #[test]
    fn test_concurrent_updates_stay_consistent() {
        let tracker = ResourceLayoutTracker::new();
        let threads = 8u64;
        for raw in 0..threads {
            tracker.register_resource(
                id(raw),
                ResourceLayout::Common,
                SubresourceDesc::new(16, 1, TextureFormat::Rgba8Unorm),
            );
        }

        std::thread::scope(|scope| {
            for raw in 0..threads {
                let tracker = &tracker;
                scope.spawn(move || {
                    for round in 0..200u32 {
                        let mip = round % 16;
                        let layout = if round % 2 == 0 {
                            ResourceLayout::RenderTarget
                        } else {
                            ResourceLayout::ShaderResource
                        };
                        tracker.set_layout(id(raw), mip, layout).unwrap();
                        assert_eq!(tracker.layout(id(raw), mip).unwrap(), layout);
                        // Shared resource read by every thread.
                        assert_eq!(tracker.layouts(id(0)).unwrap().len(), 16);
                    }
                });
            }
        });

        for raw in 0..threads {
            let layouts = tracker.layouts(id(raw)).unwrap();
            for (mip, layout) in layouts.iter().enumerate() {
                let expected = if mip % 2 == 0 {
                    ResourceLayout::RenderTarget
                } else {
                    ResourceLayout::ShaderResource
                };
                assert_eq!(*layout, expected, "resource {} mip {}", raw, mip);
            }
        }
    }
}
