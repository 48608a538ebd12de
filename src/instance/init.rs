use std::ffi::{c_void, CStr, CString};
use std::sync::Arc;

use ash::vk;

use crate::instance::debug_messenger::DebugMessengerCallback;
use crate::instance::instance::InstanceContext;

const SURFACE_EXTENSION_NAME: &[u8] = b"VK_KHR_surface\0";
const DEBUG_UTILS_EXTENSION_NAME: &[u8] = b"VK_EXT_debug_utils\0";

/// Configuration for the instance creation phase.
///
/// The application and engine identity, instance extensions and validation
/// layers are all explicit parameters. Nothing is read from the environment.
#[derive(Debug)]
pub struct InstanceCreateConfig {
    application_name: CString,
    application_version: u32,
    engine_name: CString,
    required_extensions: Vec<CString>,
    validation_layers: Vec<CString>,
    enable_validation: bool,
    debug_messengers: Vec<DebugUtilsMessengerWrapper>,
}

impl InstanceCreateConfig {
    pub fn new(application_name: CString, application_version: u32, engine_name: CString) -> Self {
        Self {
            application_name,
            application_version,
            engine_name,
            required_extensions: Vec::new(),
            validation_layers: Vec::new(),
            enable_validation: false,
            debug_messengers: Vec::new(),
        }
    }

    pub fn add_required_extension(&mut self, extension: &CStr) {
        let extension = CString::from(extension);
        if !self.required_extensions.contains(&extension) {
            self.required_extensions.push(extension);
        }
    }

    pub fn add_validation_layer(&mut self, layer: &CStr) {
        let layer = CString::from(layer);
        if !self.validation_layers.contains(&layer) {
            self.validation_layers.push(layer);
        }
    }

    pub fn enable_validation(&mut self) {
        self.enable_validation = true;
    }

    pub fn add_debug_messenger(&mut self, messenger: Box<dyn DebugMessengerCallback>) {
        self.debug_messengers.push(DebugUtilsMessengerWrapper { callback: messenger });
    }

    pub fn is_validation_enabled(&self) -> bool {
        self.enable_validation
    }
}

#[derive(Debug)]
pub enum InstanceCreateError {
    /// The application or engine name is empty.
    EmptyName,
    /// No instance extensions were requested. A presentation capable instance
    /// always needs at least the surface extensions so an empty list is a
    /// configuration error.
    NoExtensions,
    /// Validation was requested but no layer names were supplied.
    NoValidationLayers,
    /// A requested extension is not available on this system.
    MissingExtension(CString),
    Vulkan(vk::Result),
}

impl From<vk::Result> for InstanceCreateError {
    fn from(result: vk::Result) -> Self {
        InstanceCreateError::Vulkan(result)
    }
}

/// Validates the configuration and creates the vulkan instance together with
/// the debug messengers.
///
/// Configuration errors are detected before any native resource is created.
pub fn create_instance(config: InstanceCreateConfig) -> Result<Arc<InstanceContext>, InstanceCreateError> {
    log::info!("Creating vulkan instance with config: {:?}", config);

    if config.application_name.as_bytes().is_empty() || config.engine_name.as_bytes().is_empty() {
        log::error!("Application or engine name is empty");
        return Err(InstanceCreateError::EmptyName);
    }

    if config.required_extensions.is_empty() {
        log::error!("Instance extension list is empty");
        return Err(InstanceCreateError::NoExtensions);
    }

    if config.enable_validation && config.validation_layers.is_empty() {
        log::error!("Validation requested without validation layers");
        return Err(InstanceCreateError::NoValidationLayers);
    }

    let entry = ash::Entry::linked();

    let mut required_extensions = config.required_extensions;
    let needs_debug_utils = config.enable_validation || !config.debug_messengers.is_empty();
    if needs_debug_utils {
        let debug_utils = CString::from(CStr::from_bytes_with_nul(DEBUG_UTILS_EXTENSION_NAME).unwrap());
        if !required_extensions.contains(&debug_utils) {
            required_extensions.push(debug_utils);
        }
    }

    let available_extensions: Vec<CString> = entry.enumerate_instance_extension_properties(None)?
        .into_iter().map(|ext| {
            CString::from(unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) })
        }).collect();

    let mut required_extensions_ptr = Vec::with_capacity(required_extensions.len());
    for name in &required_extensions {
        if available_extensions.contains(name) {
            required_extensions_ptr.push(name.as_c_str().as_ptr());
        } else {
            return Err(InstanceCreateError::MissingExtension(name.clone()));
        }
    }

    let required_layers: Vec<_> = if config.enable_validation {
        log::info!("Validation layers enabled");
        config.validation_layers.iter().map(|layer| layer.as_c_str().as_ptr()).collect()
    } else {
        Vec::new()
    };

    let application_info = vk::ApplicationInfo::builder()
        .application_name(config.application_name.as_c_str())
        .application_version(config.application_version)
        .engine_name(config.engine_name.as_c_str())
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_2);

    let mut instance_create_info = vk::InstanceCreateInfo::builder()
        .application_info(&application_info)
        .enabled_layer_names(required_layers.as_slice())
        .enabled_extension_names(required_extensions_ptr.as_slice());

    let debug_callbacks = config.debug_messengers.into_boxed_slice();
    let mut debug_messenger_create_infos: Vec<_> = debug_callbacks.iter().map(|messenger| {
        make_messenger_create_info(messenger)
    }).collect();
    for create_info in debug_messenger_create_infos.iter_mut() {
        instance_create_info = instance_create_info.push_next(create_info);
    }

    let instance = unsafe { entry.create_instance(&instance_create_info, None) }?;

    let surface_extension = CStr::from_bytes_with_nul(SURFACE_EXTENSION_NAME).unwrap();
    let surface_khr = if required_extensions.iter().any(|ext| ext.as_c_str() == surface_extension) {
        Some(ash::extensions::khr::Surface::new(&entry, &instance))
    } else {
        None
    };

    let mut debug_utils = None;
    let mut debug_messengers = Vec::new();
    if needs_debug_utils {
        let debug_utils_fn = ash::extensions::ext::DebugUtils::new(&entry, &instance);
        for messenger in debug_callbacks.iter() {
            let create_info = make_messenger_create_info(messenger);
            let handle = unsafe {
                debug_utils_fn.create_debug_utils_messenger(&create_info, None)
            }.map_err(|err| {
                unsafe { instance.destroy_instance(None) };
                InstanceCreateError::Vulkan(err)
            })?;
            debug_messengers.push(handle);
        }
        debug_utils = Some(debug_utils_fn);
    }

    log::info!("Vulkan instance successfully created");

    Ok(Arc::new(InstanceContext::new(
        entry,
        instance,
        surface_khr,
        debug_utils,
        debug_messengers,
        debug_callbacks,
    )))
}

fn make_messenger_create_info(messenger: &DebugUtilsMessengerWrapper) -> vk::DebugUtilsMessengerCreateInfoEXTBuilder<'static> {
    vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(vk::DebugUtilsMessageSeverityFlagsEXT::INFO | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR)
        .message_type(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE | vk::DebugUtilsMessageTypeFlagsEXT::GENERAL)
        .pfn_user_callback(Some(debug_utils_messenger_callback_wrapper))
        .user_data(messenger as *const DebugUtilsMessengerWrapper as *mut DebugUtilsMessengerWrapper as *mut c_void)
}

pub struct DebugUtilsMessengerWrapper {
    callback: Box<dyn DebugMessengerCallback>,
}

impl std::fmt::Debug for DebugUtilsMessengerWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("DebugUtilsMessengerWrapper({:?})", self.callback))
    }
}

extern "system" fn debug_utils_messenger_callback_wrapper(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    p_user_data: *mut c_void
) -> vk::Bool32 {
    std::panic::catch_unwind(|| {
        if let Some(wrapper) = unsafe { (p_user_data as *const DebugUtilsMessengerWrapper).as_ref() } {
            let data = unsafe {
                p_callback_data.as_ref().unwrap_or_else(|| std::process::abort())
            };
            let message = unsafe { CStr::from_ptr(data.p_message) };

            // This is called by c code so we must catch any panics
            wrapper.callback.on_message(message_severity, message_types, message, data);
        } else {
            log::warn!("Wrapped debug utils messenger was called with null user data!");
        }
    }).unwrap_or_else(|_| {
        log::error!("Debug utils messenger panicked! Aborting...");
        std::process::exit(1);
    });

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::debug_messenger::RustLogDebugMessenger;

    fn base_config() -> InstanceCreateConfig {
        InstanceCreateConfig::new(
            CString::new("VermilionTest").unwrap(),
            1,
            CString::new("Vermilion").unwrap(),
        )
    }

    #[test]
    fn empty_identity_is_a_configuration_error() {
        let mut config = InstanceCreateConfig::new(
            CString::new("").unwrap(),
            1,
            CString::new("Vermilion").unwrap(),
        );
        config.add_required_extension(CStr::from_bytes_with_nul(b"VK_KHR_surface\0").unwrap());
        match create_instance(config) {
            Err(InstanceCreateError::EmptyName) => {}
            other => panic!("Expected EmptyName, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn empty_extensions_is_a_configuration_error() {
        let config = base_config();
        match create_instance(config) {
            Err(InstanceCreateError::NoExtensions) => {}
            other => panic!("Expected NoExtensions, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn validation_without_layers_is_a_configuration_error() {
        let mut config = base_config();
        config.add_required_extension(CStr::from_bytes_with_nul(b"VK_KHR_surface\0").unwrap());
        config.enable_validation();
        match create_instance(config) {
            Err(InstanceCreateError::NoValidationLayers) => {}
            other => panic!("Expected NoValidationLayers, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn extension_and_layer_lists_deduplicate() {
        let mut config = base_config();
        let ext = CStr::from_bytes_with_nul(b"VK_KHR_surface\0").unwrap();
        config.add_required_extension(ext);
        config.add_required_extension(ext);
        assert_eq!(config.required_extensions.len(), 1);

        let layer = CStr::from_bytes_with_nul(b"VK_LAYER_KHRONOS_validation\0").unwrap();
        config.add_validation_layer(layer);
        config.add_validation_layer(layer);
        assert_eq!(config.validation_layers.len(), 1);
    }

    #[test]
    fn debug_messenger_registration_is_tracked() {
        let mut config = base_config();
        assert!(config.debug_messengers.is_empty());
        config.add_debug_messenger(Box::new(RustLogDebugMessenger::new()));
        assert_eq!(config.debug_messengers.len(), 1);
    }
}
