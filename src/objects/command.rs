use std::sync::Arc;

use ash::prelude::VkResult;
use ash::vk;

use crate::device::device::DeviceContext;

/// Command pool for the graphics queue family with the per frame draw
/// command buffers allocated from it.
pub struct CommandPool {
    device: Arc<DeviceContext>,
    pool: vk::CommandPool,
    buffers: Vec<vk::CommandBuffer>,
}

impl CommandPool {
    pub fn create(device: Arc<DeviceContext>) -> VkResult<Self> {
        let info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(device.get_graphics_queue().get_family());

        let pool = unsafe {
            device.vk().create_command_pool(&info, None)
        }?;

        Ok(Self {
            device,
            pool,
            buffers: Vec::new(),
        })
    }

    pub fn get_handle(&self) -> vk::CommandPool {
        self.pool
    }

    pub fn get_buffers(&self) -> &[vk::CommandBuffer] {
        self.buffers.as_slice()
    }

    /// (Re)allocates `count` primary command buffers, freeing any previous
    /// allocation first.
    pub fn allocate_buffers(&mut self, count: u32) -> VkResult<&[vk::CommandBuffer]> {
        self.free_buffers();

        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        self.buffers = unsafe {
            self.device.vk().allocate_command_buffers(&info)
        }?;

        Ok(self.buffers.as_slice())
    }

    pub fn free_buffers(&mut self) {
        if !self.buffers.is_empty() {
            unsafe {
                self.device.vk().free_command_buffers(self.pool, self.buffers.as_slice());
            }
            self.buffers.clear();
        }
    }

    pub fn destroy(&mut self) {
        self.free_buffers();
        if self.pool != vk::CommandPool::null() {
            unsafe {
                self.device.vk().destroy_command_pool(self.pool, None);
            }
            self.pool = vk::CommandPool::null();
        }
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        self.destroy();
    }
}
