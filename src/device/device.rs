use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use ash::prelude::VkResult;
use ash::vk;

use crate::instance::instance::InstanceContext;
use crate::objects::allocator::Allocator;
use crate::util::id::UUID;

/// A queue retrieved from the logical device.
#[derive(Copy, Clone)]
pub struct Queue {
    family: u32,
    handle: vk::Queue,
}

impl Queue {
    pub(super) fn new(family: u32, handle: vk::Queue) -> Self {
        Self { family, handle }
    }

    pub fn get_family(&self) -> u32 {
        self.family
    }

    pub fn get_handle(&self) -> vk::Queue {
        self.handle
    }
}

/// Owns the logical device, its queues and the device memory allocator.
///
/// All components of the kernel hold this behind an [`Arc`] so the device is
/// destroyed only after every native object created from it has been released.
pub struct DeviceContext {
    id: UUID,
    instance: Arc<InstanceContext>,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    swapchain_khr: ash::extensions::khr::Swapchain,
    graphics_queue: Queue,
    present_queue: Queue,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    sample_count: vk::SampleCountFlags,
    sample_shading: bool,
    allocator: Option<Allocator>,
}

impl DeviceContext {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        instance: Arc<InstanceContext>,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        swapchain_khr: ash::extensions::khr::Swapchain,
        graphics_queue: Queue,
        present_queue: Queue,
        memory_properties: vk::PhysicalDeviceMemoryProperties,
        sample_count: vk::SampleCountFlags,
        sample_shading: bool,
    ) -> Arc<Self> {
        let allocator = Allocator::new(instance.vk().clone(), device.clone(), physical_device);

        Arc::new(Self {
            id: UUID::new(),
            instance,
            physical_device,
            device,
            swapchain_khr,
            graphics_queue,
            present_queue,
            memory_properties,
            sample_count,
            sample_shading,
            allocator: Some(allocator),
        })
    }

    pub fn get_uuid(&self) -> UUID {
        self.id
    }

    pub fn get_instance(&self) -> &Arc<InstanceContext> {
        &self.instance
    }

    pub fn get_physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn vk(&self) -> &ash::Device {
        &self.device
    }

    pub fn swapchain_khr(&self) -> &ash::extensions::khr::Swapchain {
        &self.swapchain_khr
    }

    pub fn get_graphics_queue(&self) -> Queue {
        self.graphics_queue
    }

    pub fn get_present_queue(&self) -> Queue {
        self.present_queue
    }

    pub fn get_memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /// The multisample count resolved against the device limits at creation.
    pub fn get_sample_count(&self) -> vk::SampleCountFlags {
        self.sample_count
    }

    pub fn is_multisampling_enabled(&self) -> bool {
        self.sample_count != vk::SampleCountFlags::TYPE_1
    }

    pub fn is_sample_shading_enabled(&self) -> bool {
        self.sample_shading
    }

    pub fn get_allocator(&self) -> &Allocator {
        self.allocator.as_ref().unwrap()
    }

    /// Blocks until the device is idle. Used by the resize protocol and the
    /// teardown path.
    pub fn wait_idle(&self) -> VkResult<()> {
        unsafe { self.device.device_wait_idle() }
    }
}

impl Debug for DeviceContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("DeviceContext({:?})", self.id))
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        // The allocator must release its memory blocks before the device dies
        drop(self.allocator.take());
        unsafe {
            self.device.destroy_device(None);
        }
    }
}
