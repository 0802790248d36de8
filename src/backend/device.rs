// GPU Context - instance, device and the single render queue
//
// Responsibilities:
// - Instance creation with optional validation layer
// - Physical device selection (first enumerated device, no ranking)
// - Queue family selection (first family with graphics + transfer)
// - Logical device + queue creation
//
// Teardown order is the reverse of creation: device, debug messenger, instance.

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::Swapchain as SwapchainLoader;
use ash::{vk, Entry};
use parking_lot::Mutex;
use std::ffi::{c_char, CStr, CString};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{RenderError, RenderResult, VkResultExt};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
const PORTABILITY_ENUMERATION: &CStr = c"VK_KHR_portability_enumeration";
const PORTABILITY_SUBSET: &CStr = c"VK_KHR_portability_subset";

/// Error-severity messages collected from the validation layer.
///
/// The driver may invoke the callback from any thread, so the record is
/// shared through atomics and a mutex rather than through `&mut`.
#[derive(Default)]
pub struct ValidationLog {
    errors: AtomicUsize,
    first_error: Mutex<Option<String>>,
}

impl ValidationLog {
    pub fn record_error(&self, message: &str) {
        if self.errors.fetch_add(1, Ordering::SeqCst) == 0 {
            *self.first_error.lock() = Some(message.to_owned());
        }
    }

    pub fn error_count(&self) -> usize {
        self.errors.load(Ordering::SeqCst)
    }

    /// Fail if any error-severity message has been reported
    pub fn check(&self) -> RenderResult<()> {
        if self.error_count() == 0 {
            return Ok(());
        }
        let message = self
            .first_error
            .lock()
            .clone()
            .unwrap_or_else(|| "unknown validation error".to_string());
        Err(RenderError::Validation(message))
    }
}

/// Vulkan context with automatic cleanup
pub struct GpuContext {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    pub entry: Entry,

    /// The single graphics + transfer queue
    pub queue: vk::Queue,
    pub queue_family: u32,

    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    // Boxed so the pointer handed to the messenger stays put
    validation: Box<ValidationLog>,

    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Valid bits of timestamps written on `queue`; 0 = unsupported
    pub timestamp_valid_bits: u32,
}

impl GpuContext {
    /// Create the GPU context.
    ///
    /// `surface_extensions` are the instance extensions the windowing layer
    /// needs to create a presentable surface (empty for headless use).
    pub fn new(
        app_name: &str,
        surface_extensions: &[*const c_char],
        enable_validation: bool,
    ) -> RenderResult<Arc<Self>> {
        log::info!("Creating GPU context: {}", app_name);

        let entry = unsafe { Entry::load() }?;

        let enable_validation = enable_validation && Self::validation_layer_available(&entry)?;

        let (instance, portability) =
            Self::create_instance(&entry, app_name, surface_extensions, enable_validation)?;

        let validation = Box::<ValidationLog>::default();
        let debug_utils = if enable_validation {
            match Self::setup_debug_messenger(&entry, &instance, &validation) {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        let mut context = Self::create_device(entry, instance, debug_utils, validation)?;
        if portability {
            log::debug!("Instance created with portability enumeration");
        }

        let name = unsafe { CStr::from_ptr(context.properties.device_name.as_ptr()) };
        log::info!("Selected GPU: {}", name.to_string_lossy());
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(context.properties.api_version),
            vk::api_version_minor(context.properties.api_version),
            vk::api_version_patch(context.properties.api_version)
        );
        log::info!("Render queue family: {}", context.queue_family);

        context.timestamp_valid_bits = context.timestamp_valid_bits.min(64);
        Ok(Arc::new(context))
    }

    fn validation_layer_available(entry: &Entry) -> RenderResult<bool> {
        let layers = entry
            .enumerate_instance_layer_properties()
            .call("vkEnumerateInstanceLayerProperties")?;
        let found = layers
            .iter()
            .any(|layer| name_matches(&layer.layer_name, VALIDATION_LAYER));
        if !found {
            log::warn!("Validation layer not installed, continuing without it");
        }
        Ok(found)
    }

    /// Returns the instance and whether portability enumeration was enabled
    fn create_instance(
        entry: &Entry,
        app_name: &str,
        surface_extensions: &[*const c_char],
        enable_validation: bool,
    ) -> RenderResult<(ash::Instance, bool)> {
        let app_name_cstr = CString::new(app_name).unwrap_or_else(|_| c"render-box".to_owned());

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"render-box")
            .api_version(vk::API_VERSION_1_1);

        let available = entry
            .enumerate_instance_extension_properties(None)
            .call("vkEnumerateInstanceExtensionProperties")?;

        let mut extensions: Vec<*const c_char> = surface_extensions.to_vec();
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let mut flags = vk::InstanceCreateFlags::empty();
        let portability = has_extension(&available, PORTABILITY_ENUMERATION);
        if portability {
            extensions.push(PORTABILITY_ENUMERATION.as_ptr());
            flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
        }

        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .flags(flags)
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance =
            unsafe { entry.create_instance(&create_info, None) }.call("vkCreateInstance")?;

        Ok((instance, portability))
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
        validation: &ValidationLog,
    ) -> RenderResult<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback))
            .user_data(validation as *const ValidationLog as *mut std::ffi::c_void);

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .call("vkCreateDebugUtilsMessengerEXT")?;

        Ok((debug_utils, messenger))
    }

    fn create_device(
        entry: Entry,
        instance: ash::Instance,
        debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
        validation: Box<ValidationLog>,
    ) -> RenderResult<Self> {
        // Partially built: destroy what exists if anything below fails
        let cleanup = |instance: &ash::Instance,
                       debug_utils: &Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>| unsafe {
            if let Some((utils, messenger)) = debug_utils {
                utils.destroy_debug_utils_messenger(*messenger, None);
            }
            instance.destroy_instance(None);
        };

        let result = Self::open_device(&instance);
        let (physical_device, queue_family, device) = match result {
            Ok(parts) => parts,
            Err(e) => {
                cleanup(&instance, &debug_utils);
                return Err(e);
            }
        };

        let queue = unsafe { device.get_device_queue(queue_family, 0) };
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let timestamp_valid_bits = families
            .get(queue_family as usize)
            .map_or(0, |family| family.timestamp_valid_bits);

        Ok(Self {
            device,
            physical_device,
            instance,
            entry,
            queue,
            queue_family,
            debug_utils,
            validation,
            properties,
            memory_properties,
            timestamp_valid_bits,
        })
    }

    fn open_device(
        instance: &ash::Instance,
    ) -> RenderResult<(vk::PhysicalDevice, u32, ash::Device)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .call("vkEnumeratePhysicalDevices")?;

        // No scoring: the first enumerated device is used
        let physical_device = *devices.first().ok_or(RenderError::DeviceNotFound)?;

        let families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let queue_family =
            select_queue_family(&families).ok_or(RenderError::NoSuitableQueueFamily)?;

        let available = unsafe { instance.enumerate_device_extension_properties(physical_device) }
            .call("vkEnumerateDeviceExtensionProperties")?;
        let extensions = device_extensions(&available)?;
        let extension_ptrs: Vec<*const c_char> = extensions.iter().map(|e| e.as_ptr()).collect();

        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extension_ptrs);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .call("vkCreateDevice")?;

        Ok((physical_device, queue_family, device))
    }

    /// Loader for the swapchain device extension
    pub fn swapchain_loader(&self) -> SwapchainLoader {
        SwapchainLoader::new(&self.instance, &self.device)
    }

    pub fn validation(&self) -> &ValidationLog {
        &self.validation
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> RenderResult<()> {
        unsafe { self.device.device_wait_idle() }.call("vkDeviceWaitIdle")
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        log::info!("Destroying GPU context...");

        if let Err(e) = self.wait_idle() {
            log::error!("Device did not go idle before teardown: {}", e);
        }

        unsafe {
            self.device.destroy_device(None);
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// First queue family advertising both graphics and transfer
pub fn select_queue_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    let required = vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER;
    families
        .iter()
        .position(|family| family.queue_count > 0 && family.queue_flags.contains(required))
        .and_then(|index| u32::try_from(index).ok())
}

/// Device extensions to enable: swapchain always, portability subset when
/// the device advertises it (such devices require it to be enabled).
pub fn device_extensions(available: &[vk::ExtensionProperties]) -> RenderResult<Vec<&'static CStr>> {
    let swapchain = SwapchainLoader::name();
    if !has_extension(available, swapchain) {
        return Err(RenderError::ExtensionUnsupported(
            swapchain.to_string_lossy().into_owned(),
        ));
    }

    let mut extensions = vec![swapchain];
    if has_extension(available, PORTABILITY_SUBSET) {
        extensions.push(PORTABILITY_SUBSET);
    }
    Ok(extensions)
}

pub fn has_extension(available: &[vk::ExtensionProperties], name: &CStr) -> bool {
    available
        .iter()
        .any(|ext| name_matches(&ext.extension_name, name))
}

fn name_matches(raw: &[c_char], name: &CStr) -> bool {
    let bytes = name.to_bytes();
    raw.len() > bytes.len()
        && raw.iter().zip(bytes).all(|(&a, &b)| a as u8 == b)
        && raw[bytes.len()] == 0
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message).to_string_lossy();

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message);
            if let Some(validation) = (p_user_data as *const ValidationLog).as_ref() {
                validation.record_error(&message);
            }
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            log::info!("[Vulkan] {}", message);
        }
        _ => {
            log::trace!("[Vulkan] {}", message);
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn extension(name: &CStr) -> vk::ExtensionProperties {
        let mut props = vk::ExtensionProperties::default();
        for (dst, &src) in props.extension_name.iter_mut().zip(name.to_bytes()) {
            *dst = src as c_char;
        }
        props
    }

    #[test]
    fn picks_first_graphics_transfer_family() {
        let families = [
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER | vk::QueueFlags::COMPUTE),
        ];
        assert_eq!(select_queue_family(&families), Some(2));
    }

    #[test]
    fn no_graphics_transfer_family_is_none() {
        let families = [
            family(vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::TRANSFER),
        ];
        assert_eq!(select_queue_family(&families), None);
        assert_eq!(select_queue_family(&[]), None);
    }

    #[test]
    fn swapchain_extension_is_mandatory() {
        let err = device_extensions(&[extension(PORTABILITY_SUBSET)]).unwrap_err();
        assert!(matches!(err, RenderError::ExtensionUnsupported(name) if name == "VK_KHR_swapchain"));
    }

    #[test]
    fn portability_subset_enabled_only_when_advertised() {
        let plain = device_extensions(&[extension(SwapchainLoader::name())]).unwrap();
        assert_eq!(plain, vec![SwapchainLoader::name()]);

        let portable = device_extensions(&[
            extension(PORTABILITY_SUBSET),
            extension(SwapchainLoader::name()),
        ])
        .unwrap();
        assert_eq!(portable, vec![SwapchainLoader::name(), PORTABILITY_SUBSET]);
    }

    #[test]
    fn extension_names_match_exactly() {
        let available = [extension(c"VK_KHR_swapchain_mutable_format")];
        assert!(!has_extension(&available, SwapchainLoader::name()));
    }

    #[test]
    fn validation_log_keeps_first_error() {
        let log = ValidationLog::default();
        assert!(log.check().is_ok());

        log.record_error("first");
        log.record_error("second");

        assert_eq!(log.error_count(), 2);
        assert!(matches!(log.check(), Err(RenderError::Validation(msg)) if msg == "first"));
    }
}
