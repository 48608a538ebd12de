use std::sync::Arc;

use ash::vk;

use crate::device::device::DeviceContext;
use crate::objects::allocator::{Allocation, AllocationError, AllocationStrategy};

#[derive(Debug)]
pub enum MultisampleError {
    Vulkan(vk::Result),
    Allocation(AllocationError),
}

impl From<vk::Result> for MultisampleError {
    fn from(result: vk::Result) -> Self {
        MultisampleError::Vulkan(result)
    }
}

impl From<AllocationError> for MultisampleError {
    fn from(err: AllocationError) -> Self {
        MultisampleError::Allocation(err)
    }
}

struct TargetImage {
    image: vk::Image,
    view: vk::ImageView,
    allocation: Allocation,
}

/// Auxiliary render targets sized to the swapchain.
///
/// Holds the multisampled color target (only when multisampling is enabled)
/// and the depth target. Recreated on every resize.
pub struct MultisampleTarget {
    device: Arc<DeviceContext>,
    color_format: vk::Format,
    depth_format: vk::Format,
    color: Option<TargetImage>,
    depth: Option<TargetImage>,
}

impl MultisampleTarget {
    pub fn create(
        device: Arc<DeviceContext>,
        color_format: vk::Format,
        depth_format: vk::Format,
        width: u32,
        height: u32,
    ) -> Result<Self, MultisampleError> {
        let mut target = Self {
            device,
            color_format,
            depth_format,
            color: None,
            depth: None,
        };

        target.recreate(width, height)?;
        Ok(target)
    }

    pub fn get_color_view(&self) -> Option<vk::ImageView> {
        self.color.as_ref().map(|target| target.view)
    }

    pub fn get_depth_view(&self) -> vk::ImageView {
        self.depth.as_ref().map(|target| target.view).unwrap()
    }

    /// Destroys and rebuilds the targets at the new extent.
    pub fn recreate(&mut self, width: u32, height: u32) -> Result<(), MultisampleError> {
        log::debug!("Recreating multisample target at {}x{}", width, height);

        self.destroy();

        let samples = self.device.get_sample_count();

        if self.device.is_multisampling_enabled() {
            let color = self.create_target(
                self.color_format,
                samples,
                vk::ImageUsageFlags::TRANSIENT_ATTACHMENT | vk::ImageUsageFlags::COLOR_ATTACHMENT,
                vk::ImageAspectFlags::COLOR,
                width,
                height,
            )?;
            self.color = Some(color);
        }

        let depth_aspect = if has_stencil_component(self.depth_format) {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        } else {
            vk::ImageAspectFlags::DEPTH
        };

        let depth = self.create_target(
            self.depth_format,
            samples,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            depth_aspect,
            width,
            height,
        )?;
        self.depth = Some(depth);

        Ok(())
    }

    fn create_target(
        &self,
        format: vk::Format,
        samples: vk::SampleCountFlags,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
        width: u32,
        height: u32,
    ) -> Result<TargetImage, MultisampleError> {
        let info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D { width, height, depth: 1 })
            .mip_levels(1)
            .array_layers(1)
            .samples(samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe {
            self.device.vk().create_image(&info, None)
        }?;

        let allocation = match self.device.get_allocator().allocate_image_memory(image, &AllocationStrategy::AutoGpuOnly) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { self.device.vk().destroy_image(image, None) };
                return Err(err.into());
            }
        };

        if let Err(err) = unsafe {
            self.device.vk().bind_image_memory(image, allocation.memory(), allocation.offset())
        } {
            self.device.get_allocator().free(allocation);
            unsafe { self.device.vk().destroy_image(image, None) };
            return Err(err.into());
        }

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = match unsafe { self.device.vk().create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(err) => {
                self.device.get_allocator().free(allocation);
                unsafe { self.device.vk().destroy_image(image, None) };
                return Err(err.into());
            }
        };

        Ok(TargetImage {
            image,
            view,
            allocation,
        })
    }

    pub fn destroy(&mut self) {
        for target in self.color.take().into_iter().chain(self.depth.take()) {
            unsafe {
                self.device.vk().destroy_image_view(target.view, None);
                self.device.vk().destroy_image(target.image, None);
            }
            self.device.get_allocator().free(target.allocation);
        }
    }
}

impl Drop for MultisampleTarget {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn has_stencil_component(format: vk::Format) -> bool {
    matches!(format,
        vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D16_UNORM_S8_UINT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stencil_detection() {
        assert!(has_stencil_component(vk::Format::D32_SFLOAT_S8_UINT));
        assert!(has_stencil_component(vk::Format::D24_UNORM_S8_UINT));
        assert!(!has_stencil_component(vk::Format::D32_SFLOAT));
        assert!(!has_stencil_component(vk::Format::D16_UNORM));
    }
}
