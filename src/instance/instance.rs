use std::fmt::{Debug, Formatter};

use ash::vk;

use crate::instance::init::DebugUtilsMessengerWrapper;
use crate::util::id::UUID;

/// Owns the vulkan entry, instance and the debug messengers registered at
/// creation time.
///
/// The debug messengers must outlive the instance since the driver may call
/// into them until the messenger is destroyed, hence they are stored here and
/// torn down first in [`Drop`].
pub struct InstanceContext {
    id: UUID,
    entry: ash::Entry,
    instance: ash::Instance,
    surface_khr: Option<ash::extensions::khr::Surface>,
    debug_utils: Option<ash::extensions::ext::DebugUtils>,
    debug_messengers: Vec<vk::DebugUtilsMessengerEXT>,
    _debug_callbacks: Box<[DebugUtilsMessengerWrapper]>,
}

impl InstanceContext {
    pub(super) fn new(
        entry: ash::Entry,
        instance: ash::Instance,
        surface_khr: Option<ash::extensions::khr::Surface>,
        debug_utils: Option<ash::extensions::ext::DebugUtils>,
        debug_messengers: Vec<vk::DebugUtilsMessengerEXT>,
        debug_callbacks: Box<[DebugUtilsMessengerWrapper]>,
    ) -> Self {
        Self {
            id: UUID::new(),
            entry,
            instance,
            surface_khr,
            debug_utils,
            debug_messengers,
            _debug_callbacks: debug_callbacks,
        }
    }

    pub fn get_uuid(&self) -> UUID {
        self.id
    }

    pub fn get_entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn vk(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn surface_khr(&self) -> Option<&ash::extensions::khr::Surface> {
        self.surface_khr.as_ref()
    }

    pub fn is_debug_enabled(&self) -> bool {
        !self.debug_messengers.is_empty()
    }
}

impl Debug for InstanceContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("InstanceContext({:?})", self.id))
    }
}

impl Drop for InstanceContext {
    fn drop(&mut self) {
        unsafe {
            if let Some(debug_utils) = &self.debug_utils {
                for messenger in self.debug_messengers.drain(..) {
                    debug_utils.destroy_debug_utils_messenger(messenger, None);
                }
            }
            self.instance.destroy_instance(None);
        }
    }
}
