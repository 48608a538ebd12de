use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use ash::vk;

use crate::device::device::DeviceContext;
use crate::prelude::Vec2u32;

/// Sentinel extent reported by platforms that let the swapchain decide its
/// own size (e.g. Wayland).
const UNDEFINED_EXTENT: u32 = u32::MAX;

/// Preference order used when the surface does not support opaque composite.
const COMPOSITE_ALPHA_PREFERENCE: [vk::CompositeAlphaFlagsKHR; 4] = [
    vk::CompositeAlphaFlagsKHR::OPAQUE,
    vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
    vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
    vk::CompositeAlphaFlagsKHR::INHERIT,
];

#[derive(Debug)]
pub enum SwapchainError {
    Vulkan(vk::Result),
    /// The platform reported a fixed extent different from the caller's. The
    /// platform extent is authoritative so the request is rejected.
    ExtentMismatch {
        surface: vk::Extent2D,
        requested: vk::Extent2D,
    },
    /// No supported depth format was found.
    NoDepthFormat,
    /// The surface reported no usable color format.
    NoColorFormat,
    /// The driver reported zero presentable images.
    NoImages,
}

impl From<vk::Result> for SwapchainError {
    fn from(result: vk::Result) -> Self {
        SwapchainError::Vulkan(result)
    }
}

/// One presentable image and its view.
#[derive(Copy, Clone)]
pub struct SwapchainBuffer {
    pub image: vk::Image,
    pub view: vk::ImageView,
}

/// Ring of presentable images bound to a platform surface.
///
/// Formats are resolved at construction, before any native swapchain exists.
/// [`Swapchain::re_setup`] recreates the ring in place and is safe to call
/// repeatedly; it never leaves the surface without a registered swapchain
/// unless it fails, in which case the object is torn down and the owner must
/// treat the failure as fatal.
pub struct Swapchain {
    device: Arc<DeviceContext>,
    surface: vk::SurfaceKHR,
    handle: vk::SwapchainKHR,
    color_format: vk::Format,
    color_space: vk::ColorSpaceKHR,
    depth_format: vk::Format,
    present_mode: vk::PresentModeKHR,
    vsync: bool,
    buffers: Vec<SwapchainBuffer>,
    surface_extent: Vec2u32,
}

impl Swapchain {
    /// Resolves formats and creates the initial swapchain.
    pub fn create(
        device: Arc<DeviceContext>,
        surface: vk::SurfaceKHR,
        vsync: bool,
        width: u32,
        height: u32,
        image_count: u32,
    ) -> Result<Self, SwapchainError> {
        log::info!("Creating swapchain for surface {:?}", surface);

        let mut swapchain = Self::new(device, surface, vsync)?;

        if let Err(err) = swapchain.re_setup(width, height, image_count) {
            log::error!("Initial swapchain setup failed: {:?}", err);
            swapchain.destroy();
            return Err(err);
        }

        Ok(swapchain)
    }

    fn new(device: Arc<DeviceContext>, surface: vk::SurfaceKHR, vsync: bool) -> Result<Self, SwapchainError> {
        let depth_format = find_depth_format(&device).ok_or(SwapchainError::NoDepthFormat)?;
        let (color_format, color_space) = find_color_format(&device, surface)?;

        log::debug!("Resolved swapchain formats: color {:?}, depth {:?}", color_format, depth_format);

        Ok(Self {
            device,
            surface,
            handle: vk::SwapchainKHR::null(),
            color_format,
            color_space,
            depth_format,
            present_mode: vk::PresentModeKHR::FIFO,
            vsync,
            buffers: Vec::new(),
            surface_extent: Vec2u32::new(0, 0),
        })
    }

    pub fn is_ready(&self) -> bool {
        self.handle != vk::SwapchainKHR::null()
            && self.color_format != vk::Format::UNDEFINED
            && self.depth_format != vk::Format::UNDEFINED
            && !self.buffers.is_empty()
    }

    pub fn get_color_format(&self) -> vk::Format {
        self.color_format
    }

    pub fn get_color_space(&self) -> vk::ColorSpaceKHR {
        self.color_space
    }

    pub fn get_depth_format(&self) -> vk::Format {
        self.depth_format
    }

    pub fn get_present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn get_image_count(&self) -> u32 {
        self.buffers.len() as u32
    }

    pub fn get_buffers(&self) -> &[SwapchainBuffer] {
        self.buffers.as_slice()
    }

    pub fn get_surface_extent(&self) -> Vec2u32 {
        self.surface_extent
    }

    /// Queries the surface capabilities. Used by the resize protocol to learn
    /// the authoritative platform extent.
    pub fn query_surface_capabilities(&self) -> Result<vk::SurfaceCapabilitiesKHR, SwapchainError> {
        let surface_fn = self.device.get_instance().surface_khr().unwrap();
        let capabilities = unsafe {
            surface_fn.get_physical_device_surface_capabilities(self.device.get_physical_device(), self.surface)
        }?;
        Ok(capabilities)
    }

    /// Recreates the swapchain for the given extent and image count.
    ///
    /// The old native swapchain is passed as a recycling hint so images that
    /// are already acquired stay valid until the driver retires them, and it
    /// is destroyed only after the new one exists.
    pub fn re_setup(&mut self, width: u32, height: u32, image_count: u32) -> Result<(), SwapchainError> {
        log::debug!("Re-setup swapchain: {}x{}, {} images requested", width, height, image_count);

        let capabilities = self.query_surface_capabilities()?;

        let extent = match reconcile_extent(&capabilities, width, height) {
            Ok(extent) => extent,
            Err(err) => {
                log::error!("Surface extent disagrees with request: {:?}", err);
                return Err(err);
            }
        };

        let present_modes = {
            let surface_fn = self.device.get_instance().surface_khr().unwrap();
            unsafe {
                surface_fn.get_physical_device_surface_present_modes(self.device.get_physical_device(), self.surface)
            }?
        };
        self.present_mode = choose_present_mode(&present_modes, self.vsync);

        let pre_transform = choose_pre_transform(&capabilities);
        let composite_alpha = choose_composite_alpha(&capabilities);
        let min_image_count = clamp_image_count(&capabilities, image_count);

        let mut usage = vk::ImageUsageFlags::COLOR_ATTACHMENT;
        if capabilities.supported_usage_flags.contains(vk::ImageUsageFlags::TRANSFER_SRC) {
            usage |= vk::ImageUsageFlags::TRANSFER_SRC;
        }
        if capabilities.supported_usage_flags.contains(vk::ImageUsageFlags::TRANSFER_DST) {
            usage |= vk::ImageUsageFlags::TRANSFER_DST;
        }

        let old_swapchain = self.handle;

        let info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(min_image_count)
            .image_format(self.color_format)
            .image_color_space(self.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(pre_transform)
            .composite_alpha(composite_alpha)
            .present_mode(self.present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let new_swapchain = unsafe {
            self.device.swapchain_khr().create_swapchain(&info, None)
        }?;

        // Never leave the surface without a valid presentation target: the
        // old swapchain dies only after the new one exists.
        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe {
                self.device.swapchain_khr().destroy_swapchain(old_swapchain, None);
            }
        }
        self.handle = new_swapchain;
        self.surface_extent = Vec2u32::new(extent.width, extent.height);

        if let Err(err) = self.recreate_buffers() {
            log::error!("Swapchain buffer creation failed: {:?}", err);
            self.destroy();
            return Err(err);
        }

        log::debug!("Swapchain ready with {} images at {}x{}", self.buffers.len(), extent.width, extent.height);

        Ok(())
    }

    fn recreate_buffers(&mut self) -> Result<(), SwapchainError> {
        self.destroy_buffers();

        let images = unsafe {
            self.device.swapchain_khr().get_swapchain_images(self.handle)
        }?;

        if images.is_empty() {
            return Err(SwapchainError::NoImages);
        }

        self.buffers.reserve(images.len());
        for image in images {
            let info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.color_format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            let view = unsafe {
                self.device.vk().create_image_view(&info, None)
            }?;

            self.buffers.push(SwapchainBuffer { image, view });
        }

        Ok(())
    }

    fn destroy_buffers(&mut self) {
        for buffer in self.buffers.drain(..) {
            unsafe {
                self.device.vk().destroy_image_view(buffer.view, None);
            }
        }
    }

    /// Blocks with unbounded wait until the next image is available.
    ///
    /// Returns the image index and a suboptimal flag. An out-of-date result
    /// surfaces as `Err(vk::Result::ERROR_OUT_OF_DATE_KHR)` and must be
    /// treated as a recreation trigger by the caller, not a hard error.
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<(u32, bool), vk::Result> {
        unsafe {
            self.device.swapchain_khr().acquire_next_image(self.handle, u64::MAX, semaphore, vk::Fence::null())
        }
    }

    /// Queues the image for presentation.
    ///
    /// A panic escaping the platform call is converted into the ordinary
    /// failure channel so the frame loop's control flow stays uniform.
    pub fn queue_present(&self, queue: vk::Queue, image_index: u32, wait_semaphore: vk::Semaphore) -> Result<bool, vk::Result> {
        let swapchains = [self.handle];
        let image_indices = [image_index];
        let wait_semaphores = [wait_semaphore];

        let mut info = vk::PresentInfoKHR::builder()
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        if wait_semaphore != vk::Semaphore::null() {
            info = info.wait_semaphores(&wait_semaphores);
        }

        std::panic::catch_unwind(AssertUnwindSafe(|| unsafe {
            self.device.swapchain_khr().queue_present(queue, &info)
        })).unwrap_or_else(|_| {
            log::error!("Presentation engine panicked");
            Err(vk::Result::ERROR_UNKNOWN)
        })
    }

    /// Destroys the image views and the native swapchain.
    pub fn destroy(&mut self) {
        log::debug!("Destroying swapchain {:?}", self.handle);

        self.destroy_buffers();

        if self.handle != vk::SwapchainKHR::null() {
            unsafe {
                self.device.swapchain_khr().destroy_swapchain(self.handle, None);
            }
            self.handle = vk::SwapchainKHR::null();
        }
        self.surface_extent = Vec2u32::new(0, 0);
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn find_depth_format(device: &DeviceContext) -> Option<vk::Format> {
    const CANDIDATES: [vk::Format; 5] = [
        vk::Format::D32_SFLOAT_S8_UINT,
        vk::Format::D32_SFLOAT,
        vk::Format::D24_UNORM_S8_UINT,
        vk::Format::D16_UNORM_S8_UINT,
        vk::Format::D16_UNORM,
    ];

    let instance = device.get_instance();
    CANDIDATES.into_iter().find(|format| {
        let properties = unsafe {
            instance.vk().get_physical_device_format_properties(device.get_physical_device(), *format)
        };
        properties.optimal_tiling_features.contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    })
}

fn find_color_format(device: &DeviceContext, surface: vk::SurfaceKHR) -> Result<(vk::Format, vk::ColorSpaceKHR), SwapchainError> {
    let surface_fn = device.get_instance().surface_khr().unwrap();
    let formats = unsafe {
        surface_fn.get_physical_device_surface_formats(device.get_physical_device(), surface)
    }?;

    if formats.is_empty() {
        return Err(SwapchainError::NoColorFormat);
    }

    // A single undefined entry means the surface has no preferred format
    let format = if formats.len() == 1 && formats[0].format == vk::Format::UNDEFINED {
        vk::Format::B8G8R8A8_UNORM
    } else {
        formats[0].format
    };

    if format == vk::Format::UNDEFINED {
        return Err(SwapchainError::NoColorFormat);
    }

    Ok((format, formats[0].color_space))
}

/// The platform extent is authoritative: a fixed extent that disagrees with
/// the caller's is rejected. Platforms reporting the undefined sentinel let
/// the caller decide within the supported bounds.
fn reconcile_extent(capabilities: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> Result<vk::Extent2D, SwapchainError> {
    let current = capabilities.current_extent;

    if current.width == UNDEFINED_EXTENT && current.height == UNDEFINED_EXTENT {
        return Ok(vk::Extent2D {
            width: width.clamp(capabilities.min_image_extent.width, capabilities.max_image_extent.width),
            height: height.clamp(capabilities.min_image_extent.height, capabilities.max_image_extent.height),
        });
    }

    if current.width != width || current.height != height {
        return Err(SwapchainError::ExtentMismatch {
            surface: current,
            requested: vk::Extent2D { width, height },
        });
    }

    Ok(current)
}

fn choose_present_mode(supported: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }

    if supported.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else if supported.contains(&vk::PresentModeKHR::IMMEDIATE) {
        vk::PresentModeKHR::IMMEDIATE
    } else {
        vk::PresentModeKHR::FIFO
    }
}

fn choose_pre_transform(capabilities: &vk::SurfaceCapabilitiesKHR) -> vk::SurfaceTransformFlagsKHR {
    // A non rotated transform is preferred
    if capabilities.supported_transforms.contains(vk::SurfaceTransformFlagsKHR::IDENTITY) {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        capabilities.current_transform
    }
}

fn choose_composite_alpha(capabilities: &vk::SurfaceCapabilitiesKHR) -> vk::CompositeAlphaFlagsKHR {
    COMPOSITE_ALPHA_PREFERENCE.into_iter()
        .find(|flag| capabilities.supported_composite_alpha.contains(*flag))
        .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

/// Clamps the desired image count into the platform's supported range. A max
/// of zero means the platform imposes no upper bound.
fn clamp_image_count(capabilities: &vk::SurfaceCapabilitiesKHR, desired: u32) -> u32 {
    let mut count = std::cmp::max(capabilities.min_image_count, desired);
    if capabilities.max_image_count > 0 {
        count = std::cmp::min(count, capabilities.max_image_count);
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(current: (u32, u32), min_images: u32, max_images: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min_images,
            max_image_count: max_images,
            current_extent: vk::Extent2D { width: current.0, height: current.1 },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D { width: 8192, height: 8192 },
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            ..Default::default()
        }
    }

    #[test]
    fn matching_extent_is_accepted() {
        let caps = capabilities((800, 600), 2, 8);
        let extent = reconcile_extent(&caps, 800, 600).unwrap();
        assert_eq!(extent.width, 800);
        assert_eq!(extent.height, 600);
    }

    #[test]
    fn mismatched_extent_fails() {
        let caps = capabilities((800, 600), 2, 8);
        match reconcile_extent(&caps, 1024, 768) {
            Err(SwapchainError::ExtentMismatch { surface, requested }) => {
                assert_eq!(surface.width, 800);
                assert_eq!(requested.width, 1024);
            }
            other => panic!("Expected ExtentMismatch, got {:?}", other),
        }
    }

    #[test]
    fn undefined_extent_uses_caller_values() {
        let caps = capabilities((UNDEFINED_EXTENT, UNDEFINED_EXTENT), 2, 8);
        let extent = reconcile_extent(&caps, 1024, 768).unwrap();
        assert_eq!(extent.width, 1024);
        assert_eq!(extent.height, 768);
    }

    #[test]
    fn image_count_clamps_into_supported_range() {
        let caps = capabilities((800, 600), 2, 3);
        assert_eq!(clamp_image_count(&caps, 1), 2);
        assert_eq!(clamp_image_count(&caps, 3), 3);
        assert_eq!(clamp_image_count(&caps, 8), 3);
    }

    #[test]
    fn unbounded_max_image_count_only_clamps_from_below() {
        let caps = capabilities((800, 600), 2, 0);
        assert_eq!(clamp_image_count(&caps, 1), 2);
        assert_eq!(clamp_image_count(&caps, 16), 16);
    }

    #[test]
    fn present_mode_honors_vsync() {
        let supported = vec![
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::FIFO,
        ];

        assert_eq!(choose_present_mode(&supported, true), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(&supported, false), vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn present_mode_falls_back_without_mailbox() {
        let supported = vec![vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO];
        assert_eq!(choose_present_mode(&supported, false), vk::PresentModeKHR::IMMEDIATE);

        let fifo_only = vec![vk::PresentModeKHR::FIFO];
        assert_eq!(choose_present_mode(&fifo_only, false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn composite_alpha_picks_first_supported() {
        let mut caps = capabilities((800, 600), 2, 8);
        caps.supported_composite_alpha = vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED | vk::CompositeAlphaFlagsKHR::INHERIT;
        assert_eq!(choose_composite_alpha(&caps), vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED);
    }

    #[test]
    fn pre_transform_prefers_identity() {
        let mut caps = capabilities((800, 600), 2, 8);
        caps.supported_transforms = vk::SurfaceTransformFlagsKHR::IDENTITY | vk::SurfaceTransformFlagsKHR::ROTATE_90;
        caps.current_transform = vk::SurfaceTransformFlagsKHR::ROTATE_90;
        assert_eq!(choose_pre_transform(&caps), vk::SurfaceTransformFlagsKHR::IDENTITY);

        caps.supported_transforms = vk::SurfaceTransformFlagsKHR::ROTATE_90;
        assert_eq!(choose_pre_transform(&caps), vk::SurfaceTransformFlagsKHR::ROTATE_90);
    }
}
