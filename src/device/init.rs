use std::ffi::{CStr, CString};
use std::sync::Arc;

use ash::vk;
use ash::vk::PhysicalDeviceType;

use crate::device::device::{DeviceContext, Queue};
use crate::instance::instance::InstanceContext;

const SWAPCHAIN_EXTENSION_NAME: &[u8] = b"VK_KHR_swapchain\0";

pub type DeviceRatingFn = dyn Fn(&InstanceContext, vk::PhysicalDevice) -> Option<f32>;

/// Configuration for the logical device creation phase.
pub struct DeviceCreateConfig {
    required_extensions: Vec<CString>,
    sample_count: u32,
    sample_shading: bool,
    rating_fn: Box<DeviceRatingFn>,
}

impl DeviceCreateConfig {
    pub fn new() -> Self {
        let mut required_extensions = Vec::new();
        required_extensions.push(CString::from(CStr::from_bytes_with_nul(SWAPCHAIN_EXTENSION_NAME).unwrap()));

        Self {
            required_extensions,
            sample_count: 1,
            sample_shading: false,
            rating_fn: Box::new(Self::default_rating),
        }
    }

    pub fn add_required_extension(&mut self, extension: &CStr) {
        let extension = CString::from(extension);
        if !self.required_extensions.contains(&extension) {
            self.required_extensions.push(extension);
        }
    }

    /// Requests a multisample count. The value is clamped against the device
    /// limits during creation.
    pub fn set_sample_count(&mut self, sample_count: u32) {
        self.sample_count = sample_count;
    }

    pub fn enable_sample_shading(&mut self) {
        self.sample_shading = true;
    }

    pub fn set_rating_fn(&mut self, rating_fn: Box<DeviceRatingFn>) {
        self.rating_fn = rating_fn;
    }

    fn default_rating(instance: &InstanceContext, device: vk::PhysicalDevice) -> Option<f32> {
        let properties = unsafe { instance.vk().get_physical_device_properties(device) };
        Some(match properties.device_type {
            PhysicalDeviceType::DISCRETE_GPU => 10.0f32,
            PhysicalDeviceType::INTEGRATED_GPU => 5.0f32,
            _ => 0.0f32,
        })
    }
}

impl Default for DeviceCreateConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub enum DeviceCreateError {
    Vulkan(vk::Result),
    /// No physical device supports the required extensions and presentation
    /// to the target surface.
    NoSupportedDevice,
    /// The instance was created without the surface extension.
    SurfaceUnsupported,
}

impl From<vk::Result> for DeviceCreateError {
    fn from(result: vk::Result) -> Self {
        DeviceCreateError::Vulkan(result)
    }
}

struct SelectedDevice {
    device: vk::PhysicalDevice,
    graphics_family: u32,
    present_family: u32,
}

/// Selects a physical device that can present to `surface` and creates the
/// logical device, queues and memory allocator.
pub fn create_device(
    config: DeviceCreateConfig,
    instance: Arc<InstanceContext>,
    surface: vk::SurfaceKHR,
) -> Result<Arc<DeviceContext>, DeviceCreateError> {
    if instance.surface_khr().is_none() {
        return Err(DeviceCreateError::SurfaceUnsupported);
    }

    let physical_devices = unsafe { instance.vk().enumerate_physical_devices()? };
    let selected = select_device(&instance, &config, surface, &physical_devices)?;

    let properties = unsafe { instance.vk().get_physical_device_properties(selected.device) };
    log::info!("Selected physical device: {:?}", unsafe { CStr::from_ptr(properties.device_name.as_ptr()) });

    let sample_count = clamp_sample_count(
        config.sample_count,
        properties.limits.framebuffer_color_sample_counts & properties.limits.framebuffer_depth_sample_counts,
    );
    log::info!("Using sample count {:?}", sample_count);

    let queue_priorities = [1.0f32];
    let mut queue_create_infos = vec![
        vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(selected.graphics_family)
            .queue_priorities(&queue_priorities)
            .build()
    ];
    if selected.present_family != selected.graphics_family {
        queue_create_infos.push(
            vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(selected.present_family)
                .queue_priorities(&queue_priorities)
                .build()
        );
    }

    let required_extensions_ptr: Vec<_> = config.required_extensions.iter()
        .map(|ext| ext.as_c_str().as_ptr())
        .collect();

    let features = vk::PhysicalDeviceFeatures::builder()
        .sample_rate_shading(config.sample_shading);

    let device_create_info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(queue_create_infos.as_slice())
        .enabled_extension_names(required_extensions_ptr.as_slice())
        .enabled_features(&features);

    let device = unsafe {
        instance.vk().create_device(selected.device, &device_create_info, None)
    }?;

    let graphics_queue = Queue::new(selected.graphics_family, unsafe {
        device.get_device_queue(selected.graphics_family, 0)
    });
    let present_queue = Queue::new(selected.present_family, unsafe {
        device.get_device_queue(selected.present_family, 0)
    });

    let swapchain_khr = ash::extensions::khr::Swapchain::new(instance.vk(), &device);

    let memory_properties = unsafe {
        instance.vk().get_physical_device_memory_properties(selected.device)
    };

    Ok(DeviceContext::new(
        instance,
        selected.device,
        device,
        swapchain_khr,
        graphics_queue,
        present_queue,
        memory_properties,
        sample_count,
        config.sample_shading,
    ))
}

fn select_device(
    instance: &InstanceContext,
    config: &DeviceCreateConfig,
    surface: vk::SurfaceKHR,
    physical_devices: &[vk::PhysicalDevice],
) -> Result<SelectedDevice, DeviceCreateError> {
    let mut best: Option<(f32, SelectedDevice)> = None;

    for &physical_device in physical_devices {
        if !supports_extensions(instance, physical_device, &config.required_extensions) {
            continue;
        }

        let families = match find_queue_families(instance, physical_device, surface) {
            Some(families) => families,
            None => continue,
        };

        let rating = match (config.rating_fn)(instance, physical_device) {
            Some(rating) => rating,
            None => continue,
        };

        let selected = SelectedDevice {
            device: physical_device,
            graphics_family: families.0,
            present_family: families.1,
        };

        match &best {
            Some((best_rating, _)) if *best_rating >= rating => {}
            _ => best = Some((rating, selected)),
        }
    }

    best.map(|(_, selected)| selected).ok_or(DeviceCreateError::NoSupportedDevice)
}

fn supports_extensions(instance: &InstanceContext, device: vk::PhysicalDevice, required: &[CString]) -> bool {
    let available: Vec<CString> = match unsafe { instance.vk().enumerate_device_extension_properties(device) } {
        Ok(extensions) => extensions.into_iter().map(|ext| {
            CString::from(unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) })
        }).collect(),
        Err(_) => return false,
    };

    required.iter().all(|ext| available.contains(ext))
}

/// Finds the first queue family with graphics support and the first with
/// present support for the surface. They may be the same family.
fn find_queue_families(instance: &InstanceContext, device: vk::PhysicalDevice, surface: vk::SurfaceKHR) -> Option<(u32, u32)> {
    let surface_fn = instance.surface_khr()?;
    let families = unsafe {
        instance.vk().get_physical_device_queue_family_properties(device)
    };

    let mut graphics = None;
    let mut present = None;

    for (index, family) in families.iter().enumerate() {
        let index = index as u32;

        if graphics.is_none() && family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            graphics = Some(index);
        }

        if present.is_none() {
            let supported = unsafe {
                surface_fn.get_physical_device_surface_support(device, index, surface)
            }.unwrap_or(false);
            if supported {
                present = Some(index);
            }
        }

        if let (Some(graphics), Some(present)) = (graphics, present) {
            return Some((graphics, present));
        }
    }

    None
}

/// Picks the highest supported sample count that does not exceed the request.
pub(crate) fn clamp_sample_count(requested: u32, supported: vk::SampleCountFlags) -> vk::SampleCountFlags {
    let requested = match requested {
        64.. => vk::SampleCountFlags::TYPE_64,
        32.. => vk::SampleCountFlags::TYPE_32,
        16.. => vk::SampleCountFlags::TYPE_16,
        8.. => vk::SampleCountFlags::TYPE_8,
        4.. => vk::SampleCountFlags::TYPE_4,
        2.. => vk::SampleCountFlags::TYPE_2,
        _ => vk::SampleCountFlags::TYPE_1,
    };

    let mut current = requested.as_raw();
    while current > vk::SampleCountFlags::TYPE_1.as_raw() {
        let flags = vk::SampleCountFlags::from_raw(current);
        if supported.contains(flags) {
            return flags;
        }
        current >>= 1;
    }

    vk::SampleCountFlags::TYPE_1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_count_clamps_to_supported() {
        let supported = vk::SampleCountFlags::TYPE_1 | vk::SampleCountFlags::TYPE_2 | vk::SampleCountFlags::TYPE_4;

        assert_eq!(clamp_sample_count(8, supported), vk::SampleCountFlags::TYPE_4);
        assert_eq!(clamp_sample_count(4, supported), vk::SampleCountFlags::TYPE_4);
        assert_eq!(clamp_sample_count(2, supported), vk::SampleCountFlags::TYPE_2);
        assert_eq!(clamp_sample_count(1, supported), vk::SampleCountFlags::TYPE_1);
        assert_eq!(clamp_sample_count(0, supported), vk::SampleCountFlags::TYPE_1);
    }

    #[test]
    fn sample_count_falls_back_when_unsupported() {
        let supported = vk::SampleCountFlags::TYPE_1;
        assert_eq!(clamp_sample_count(64, supported), vk::SampleCountFlags::TYPE_1);
    }

    #[test]
    fn default_config_requires_swapchain() {
        let config = DeviceCreateConfig::new();
        let swapchain = CString::from(CStr::from_bytes_with_nul(b"VK_KHR_swapchain\0").unwrap());
        assert!(config.required_extensions.contains(&swapchain));
    }
}
