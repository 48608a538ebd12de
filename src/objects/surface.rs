use std::ffi::CString;

use ash::vk;

#[derive(Debug)]
pub enum SurfaceInitError {
    /// A vulkan error
    Vulkan(vk::Result),
    /// The platform returned a null surface handle
    NullHandle,
    /// A generic error with attached message
    Message(String),
}

impl From<vk::Result> for SurfaceInitError {
    fn from(result: vk::Result) -> Self {
        SurfaceInitError::Vulkan(result)
    }
}

/// Factory mapping a native instance to a platform drawable surface.
///
/// Injected into the kernel so the windowing system stays an external
/// collaborator. A provider returning a null handle aborts initialization.
pub trait SurfaceProvider {
    /// Instance extensions the platform needs for surface creation.
    fn get_required_instance_extensions(&self) -> Vec<CString>;

    /// Creates the surface. Must return [`SurfaceInitError::NullHandle`]
    /// instead of a null handle.
    fn init(&mut self, entry: &ash::Entry, instance: &ash::Instance) -> Result<vk::SurfaceKHR, SurfaceInitError>;

    /// Destroys the surface if it was created.
    fn destroy(&mut self);

    fn get_handle(&self) -> Option<vk::SurfaceKHR>;

    /// The platform's current drawable size in pixels.
    fn get_current_extent(&self) -> (u32, u32);
}
