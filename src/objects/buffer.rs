use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;

use crate::device::device::DeviceContext;
use crate::objects::allocator::{Allocation, AllocationError, AllocationStrategy};

#[derive(Debug)]
pub enum BufferError {
    Vulkan(vk::Result),
    Allocation(AllocationError),
    /// [`Buffer::map`] was called while a mapping is active.
    AlreadyMapped,
    /// [`Buffer::copy_to`] was called without an active mapping.
    NotMapped,
    /// The backing memory is not host visible.
    NotHostVisible,
    /// The copy source is larger than the buffer.
    OutOfRange,
}

impl From<vk::Result> for BufferError {
    fn from(result: vk::Result) -> Self {
        BufferError::Vulkan(result)
    }
}

impl From<AllocationError> for BufferError {
    fn from(err: AllocationError) -> Self {
        BufferError::Allocation(err)
    }
}

/// A linear buffer backed by device memory with optional host mapping.
///
/// The mapped pointer is non null only strictly between [`Buffer::map`] and
/// [`Buffer::unmap`]. Buffers are destroyed explicitly; [`Drop`] releases the
/// native objects if the owner did not.
pub struct Buffer {
    device: Arc<DeviceContext>,
    handle: vk::Buffer,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
    alignment: vk::DeviceSize,
    usage_flags: vk::BufferUsageFlags,
    memory_properties: vk::MemoryPropertyFlags,
    mapped: Option<NonNull<u8>>,
    descriptor: vk::DescriptorBufferInfo,
}

impl Buffer {
    /// Creates the buffer, allocates and binds its memory and optionally
    /// uploads `initial_data` through a scoped map/copy/flush/unmap cycle.
    pub fn create(
        device: Arc<DeviceContext>,
        usage_flags: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
        size: vk::DeviceSize,
        initial_data: Option<&[u8]>,
    ) -> Result<Self, BufferError> {
        log::debug!("Creating buffer of {} bytes, usage {:?}", size, usage_flags);

        let info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage_flags)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = unsafe {
            device.vk().create_buffer(&info, None)
        }?;

        let strategy = AllocationStrategy::from_memory_properties(memory_properties);
        let allocation = match device.get_allocator().allocate_buffer_memory(handle, &strategy) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { device.vk().destroy_buffer(handle, None) };
                return Err(err.into());
            }
        };

        if let Err(err) = unsafe {
            device.vk().bind_buffer_memory(handle, allocation.memory(), allocation.offset())
        } {
            device.get_allocator().free(allocation);
            unsafe { device.vk().destroy_buffer(handle, None) };
            return Err(err.into());
        }

        let alignment = allocation.alignment();
        let mut buffer = Self {
            device,
            handle,
            allocation: Some(allocation),
            size,
            alignment,
            usage_flags,
            memory_properties,
            mapped: None,
            descriptor: vk::DescriptorBufferInfo {
                buffer: handle,
                offset: 0,
                range: vk::WHOLE_SIZE,
            },
        };

        if let Some(data) = initial_data {
            buffer.copy_to_device(data)?;
        }

        Ok(buffer)
    }

    pub fn get_handle(&self) -> vk::Buffer {
        self.handle
    }

    pub fn get_size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn get_alignment(&self) -> vk::DeviceSize {
        self.alignment
    }

    pub fn get_usage_flags(&self) -> vk::BufferUsageFlags {
        self.usage_flags
    }

    pub fn get_memory_properties(&self) -> vk::MemoryPropertyFlags {
        self.memory_properties
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    fn is_host_coherent(&self) -> bool {
        self.memory_properties.contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    /// Maps `size` bytes starting at `offset` and returns a pointer valid
    /// until [`Buffer::unmap`]. Pass [`vk::WHOLE_SIZE`] to map everything.
    ///
    /// Fails if a mapping is already active or the memory is not host
    /// visible.
    pub fn map(&mut self, size: vk::DeviceSize, offset: vk::DeviceSize) -> Result<NonNull<u8>, BufferError> {
        if self.mapped.is_some() {
            return Err(BufferError::AlreadyMapped);
        }
        if !self.memory_properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(BufferError::NotHostVisible);
        }
        if size != vk::WHOLE_SIZE && offset + size > self.size {
            return Err(BufferError::OutOfRange);
        }

        let ptr = self.allocation.as_ref()
            .and_then(|allocation| allocation.mapped_ptr())
            .ok_or(BufferError::NotHostVisible)?;

        let ptr = unsafe {
            NonNull::new_unchecked(ptr.cast::<u8>().as_ptr().add(offset as usize))
        };
        self.mapped = Some(ptr);
        Ok(ptr)
    }

    pub fn unmap(&mut self) {
        // The allocator keeps host visible memory persistently mapped, only
        // the bookkeeping window is closed here.
        self.mapped = None;
    }

    /// Flushes a byte range of the mapping to make host writes visible to the
    /// device. A no-op success for host coherent memory.
    pub fn flush(&self, size: vk::DeviceSize, offset: vk::DeviceSize) -> Result<(), BufferError> {
        if self.is_host_coherent() {
            return Ok(());
        }

        let range = self.memory_range(size, offset);
        unsafe {
            self.device.vk().flush_mapped_memory_ranges(std::slice::from_ref(&range))
        }?;
        Ok(())
    }

    /// Invalidates a byte range of the mapping to make device writes visible
    /// to the host. A no-op success for host coherent memory.
    pub fn invalidate(&self, size: vk::DeviceSize, offset: vk::DeviceSize) -> Result<(), BufferError> {
        if self.is_host_coherent() {
            return Ok(());
        }

        let range = self.memory_range(size, offset);
        unsafe {
            self.device.vk().invalidate_mapped_memory_ranges(std::slice::from_ref(&range))
        }?;
        Ok(())
    }

    fn memory_range(&self, size: vk::DeviceSize, offset: vk::DeviceSize) -> vk::MappedMemoryRange {
        let allocation = self.allocation.as_ref().unwrap();
        vk::MappedMemoryRange::builder()
            .memory(allocation.memory())
            .offset(allocation.offset() + offset)
            .size(size)
            .build()
    }

    /// Writes `data` through an active mapping without flushing.
    pub fn copy_to(&mut self, data: &[u8]) -> Result<(), BufferError> {
        if data.len() as vk::DeviceSize > self.size {
            return Err(BufferError::OutOfRange);
        }
        let ptr = match self.mapped {
            Some(ptr) => ptr,
            None => return Err(BufferError::NotMapped),
        };

        unsafe {
            std::slice::from_raw_parts_mut(ptr.as_ptr(), data.len())
        }.copy_from_slice(data);
        Ok(())
    }

    /// Uploads `data` as one atomic update from the caller's perspective:
    /// maps if unmapped, copies, flushes and unmaps again.
    pub fn copy_to_device(&mut self, data: &[u8]) -> Result<(), BufferError> {
        if data.len() as vk::DeviceSize > self.size {
            return Err(BufferError::OutOfRange);
        }

        let was_mapped = self.mapped.is_some();
        if !was_mapped {
            self.map(vk::WHOLE_SIZE, 0)?;
        }

        let result = self.copy_to(data)
            .and_then(|_| self.flush(vk::WHOLE_SIZE, 0));

        if !was_mapped {
            self.unmap();
        }

        result
    }

    /// Typed variant of [`Buffer::copy_to_device`] for plain-old-data slices.
    pub fn copy_pod_to_device<T: bytemuck::Pod>(&mut self, data: &[T]) -> Result<(), BufferError> {
        self.copy_to_device(bytemuck::cast_slice(data))
    }

    /// Configures the range reported by [`Buffer::get_descriptor`].
    pub fn setup_descriptor(&mut self, size: vk::DeviceSize, offset: vk::DeviceSize) {
        self.descriptor = vk::DescriptorBufferInfo {
            buffer: self.handle,
            offset,
            range: size,
        };
    }

    /// Returns buffer info for descriptor set writes.
    pub fn get_descriptor(&self) -> vk::DescriptorBufferInfo {
        self.descriptor
    }

    /// Destroys the buffer and frees its memory. Safe to call more than once;
    /// stale owners hitting an already destroyed buffer are a no-op.
    pub fn destroy(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            self.mapped = None;
            unsafe {
                self.device.vk().destroy_buffer(self.handle, None);
            }
            self.device.get_allocator().free(allocation);
            self.handle = vk::Buffer::null();
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.destroy();
    }
}
