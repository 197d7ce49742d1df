//! GPU textures and their cached image views.
//!
//! Descriptor writes never hand out image views directly; a [`Texture`]
//! creates each view on first use, caches it by [`ViewKind`] and destroys
//! all of them with the image.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use tracing::{debug, error};

use crate::error::{RhiError, RhiResult};
use crate::resource::TextureDesc;

use super::device::Device;

/// The views a descriptor can ask for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ViewKind {
    /// Every mip and slice, all aspects a shader may sample.
    Sampled,
    /// One mip, every slice.
    Storage { mip: u32 },
    /// One mip and slice, for render or depth attachments.
    Attachment { mip: u32, slice: u32 },
}

/// 2D (array) image with managed memory.
pub struct Texture {
    device: Arc<Device>,
    image: vk::Image,
    allocation: Option<Allocation>,
    desc: TextureDesc,
    views: Mutex<HashMap<ViewKind, vk::ImageView>>,
}

impl Texture {
    /// Creates an optimally tiled device-local image.
    pub fn new(device: Arc<Device>, desc: TextureDesc) -> RhiResult<Self> {
        if desc.width == 0 || desc.height == 0 || desc.mip_levels == 0 || desc.array_size == 0 {
            return Err(RhiError::Unsupported(format!(
                "texture with zero extent: {:?}",
                desc
            )));
        }

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format.to_vk())
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_size)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage.to_vk())
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { device.handle().create_image(&image_info, None)? };
        let requirements = unsafe { device.handle().get_image_memory_requirements(image) };

        let allocation = device.allocator().and_then(|mut allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name: "texture",
                    requirements,
                    location: MemoryLocation::GpuOnly,
                    linear: false,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(RhiError::from)
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.handle().destroy_image(image, None) };
                return Err(e);
            }
        };

        let texture = Self {
            device,
            image,
            allocation: Some(allocation),
            desc,
            views: Mutex::new(HashMap::new()),
        };
        if let Some(allocation) = texture.allocation.as_ref() {
            unsafe {
                texture.device.handle().bind_image_memory(
                    image,
                    allocation.memory(),
                    allocation.offset(),
                )?;
            }
        }

        debug!(
            "Created texture {}x{} {:?}, {} mips, {} slices",
            desc.width, desc.height, desc.format, desc.mip_levels, desc.array_size
        );
        Ok(texture)
    }

    #[inline]
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    #[inline]
    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.desc.width,
            height: self.desc.height,
        }
    }

    /// Returns the cached view of this kind, creating it on first use.
    pub fn view(&self, kind: ViewKind) -> RhiResult<vk::ImageView> {
        let mut views = self.views.lock().map_err(|_| RhiError::DeviceLost)?;
        if let Some(view) = views.get(&kind) {
            return Ok(*view);
        }

        let format = self.desc.format;
        let (aspect, range) = match kind {
            ViewKind::Sampled => (
                // A sampled depth/stencil view may only select one aspect.
                format.plane_aspect(0),
                (0, self.desc.mip_levels, 0, self.desc.array_size),
            ),
            ViewKind::Storage { mip } => {
                self.check_mip(mip)?;
                (format.plane_aspect(0), (mip, 1, 0, self.desc.array_size))
            }
            ViewKind::Attachment { mip, slice } => {
                self.check_mip(mip)?;
                if slice >= self.desc.array_size {
                    return Err(RhiError::InvalidDescriptor(format!(
                        "array slice {} of a {}-slice texture",
                        slice, self.desc.array_size
                    )));
                }
                (format.full_aspect(), (mip, 1, slice, 1))
            }
        };
        let (base_mip, mip_count, base_layer, layer_count) = range;

        let view_type = if self.desc.array_size > 1 && layer_count > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };
        let view_info = vk::ImageViewCreateInfo::default()
            .image(self.image)
            .view_type(view_type)
            .format(format.to_vk())
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: base_mip,
                level_count: mip_count,
                base_array_layer: base_layer,
                layer_count,
            });
        let view = unsafe { self.device.handle().create_image_view(&view_info, None)? };
        views.insert(kind, view);
        Ok(view)
    }

    fn check_mip(&self, mip: u32) -> RhiResult<()> {
        if mip >= self.desc.mip_levels {
            return Err(RhiError::InvalidDescriptor(format!(
                "mip {} of a {}-mip texture",
                mip, self.desc.mip_levels
            )));
        }
        Ok(())
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe {
            if let Ok(views) = self.views.get_mut() {
                for (_, view) in views.drain() {
                    self.device.handle().destroy_image_view(view, None);
                }
            }
            if let Some(allocation) = self.allocation.take() {
                match self.device.allocator() {
                    Ok(mut allocator) => {
                        if let Err(e) = allocator.free(allocation) {
                            error!("Failed to free texture allocation: {:?}", e);
                        }
                    }
                    Err(e) => error!("Failed to lock allocator: {:?}", e),
                }
            }
            self.device.handle().destroy_image(self.image, None);
        }
        debug!("Destroyed texture {}x{}", self.desc.width, self.desc.height);
    }
}

// Safety: handles are plain data; the view cache is behind a mutex and the
// allocation is only touched on drop.
unsafe impl Send for Texture {}
unsafe impl Sync for Texture {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_texture_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Texture>();
    }
}
