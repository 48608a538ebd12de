use std::ffi::CString;

use ash::vk;
use winit::dpi::LogicalSize;
use winit::event_loop::EventLoop;
use winit::window::WindowBuilder;

use crate::objects::surface::{SurfaceInitError, SurfaceProvider};

/// [`SurfaceProvider`] backed by a winit window.
pub struct WinitWindow {
    handle: winit::window::Window,
    surface_fn: Option<ash::extensions::khr::Surface>,
    surface: Option<vk::SurfaceKHR>,
}

impl WinitWindow {
    pub fn new<E>(title: &str, width: f64, height: f64, event_loop: &EventLoop<E>) -> Self {
        let window = WindowBuilder::new()
            .with_title(title)
            .with_inner_size(LogicalSize::new(width, height))
            .build(event_loop)
            .unwrap();
        window.set_visible(true);

        Self {
            handle: window,
            surface_fn: None,
            surface: None,
        }
    }

    pub fn get_window(&self) -> &winit::window::Window {
        &self.handle
    }
}

impl SurfaceProvider for WinitWindow {
    fn get_required_instance_extensions(&self) -> Vec<CString> {
        ash_window::enumerate_required_extensions(&self.handle).unwrap().into_iter()
            .map(CString::from)
            .collect()
    }

    fn init(&mut self, entry: &ash::Entry, instance: &ash::Instance) -> Result<vk::SurfaceKHR, SurfaceInitError> {
        let surface = unsafe {
            ash_window::create_surface(entry, instance, &self.handle, None)
        }?;

        if surface == vk::SurfaceKHR::null() {
            return Err(SurfaceInitError::NullHandle);
        }

        self.surface = Some(surface);
        self.surface_fn = Some(ash::extensions::khr::Surface::new(entry, instance));

        Ok(surface)
    }

    fn destroy(&mut self) {
        if let Some(surface) = self.surface.take() {
            let surface_fn = self.surface_fn.take().unwrap();
            unsafe {
                surface_fn.destroy_surface(surface, None);
            }
        }
    }

    fn get_handle(&self) -> Option<vk::SurfaceKHR> {
        self.surface
    }

    fn get_current_extent(&self) -> (u32, u32) {
        let size = self.handle.inner_size();
        (size.width, size.height)
    }
}
