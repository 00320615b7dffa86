//! Vulkan Core - instance and physical device selection.

use std::ffi::{CStr, CString};

use ash::{vk, Entry, Instance};
use raw_window_handle::RawDisplayHandle;
use vesper_core::log;

use crate::config::RendererConfig;
use crate::error::{Result, RhiError};
use crate::swapchain::SwapchainWindow;

#[cfg(feature = "validation")]
const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Scoring weights for physical device selection.
const SCORE_LARGE_POINTS: u32 = 1;
const SCORE_WIDE_LINES: u32 = 3;
const SCORE_TESSELLATION: u32 = 4;
const SCORE_GEOMETRY: u32 = 5;
const SCORE_DISCRETE_GPU: u32 = 15;
const SCORE_INTEGRATED_GPU: u32 = 3;
const SCORE_OTHER_GPU: u32 = 1;
const UNIFORM_RANGE_DIVISOR: u32 = 16;

#[derive(Clone)]
pub struct PhysicalDevice {
    handle: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    features: vk::PhysicalDeviceFeatures,
    update_after_bind: bool,

    graphics_queue_family: u32,
    present_queue_family: u32,
}

impl PhysicalDevice {
    /// Get the physical device.
    pub fn handle(&self) -> vk::PhysicalDevice {
        self.handle
    }

    /// Get the physical device properties.
    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    /// Get the physical device memory properties.
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn features(&self) -> &vk::PhysicalDeviceFeatures {
        &self.features
    }

    /// Sampled image descriptors may be rewritten while referenced by recorded command buffers.
    pub fn supports_update_after_bind(&self) -> bool {
        self.update_after_bind
    }

    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    pub fn present_queue_family(&self) -> u32 {
        self.present_queue_family
    }

    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

/// The subset of device properties that device selection looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub large_points: bool,
    pub wide_lines: bool,
    pub tessellation_shader: bool,
    pub geometry_shader: bool,
    pub max_uniform_buffer_range: u32,
    pub max_vertex_input_bindings: u32,
    pub has_required_queues: bool,
}

impl DeviceCapabilities {
    pub fn new(
        properties: &vk::PhysicalDeviceProperties,
        features: &vk::PhysicalDeviceFeatures,
        has_required_queues: bool,
    ) -> Self {
        Self {
            device_type: properties.device_type,
            api_version: properties.api_version,
            large_points: features.large_points == vk::TRUE,
            wide_lines: features.wide_lines == vk::TRUE,
            tessellation_shader: features.tessellation_shader == vk::TRUE,
            geometry_shader: features.geometry_shader == vk::TRUE,
            max_uniform_buffer_range: properties.limits.max_uniform_buffer_range,
            max_vertex_input_bindings: properties.limits.max_vertex_input_bindings,
            has_required_queues,
        }
    }
}

/// Calculate a score for the physical device (higher is better, 0 is unusable).
pub fn score_device(caps: &DeviceCapabilities) -> u32 {
    if !caps.has_required_queues || caps.api_version < vk::API_VERSION_1_3 {
        return 0;
    }

    let mut score = 0u32;

    if caps.large_points {
        score += SCORE_LARGE_POINTS;
    }
    if caps.wide_lines {
        score += SCORE_WIDE_LINES;
    }
    if caps.tessellation_shader {
        score += SCORE_TESSELLATION;
    }
    if caps.geometry_shader {
        score += SCORE_GEOMETRY;
    }

    score += match caps.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => SCORE_DISCRETE_GPU,
        vk::PhysicalDeviceType::INTEGRATED_GPU => SCORE_INTEGRATED_GPU,
        _ => SCORE_OTHER_GPU,
    };

    score
        .saturating_add(caps.max_uniform_buffer_range / UNIFORM_RANGE_DIVISOR)
        .saturating_add(caps.max_vertex_input_bindings)
}

/// Pick the highest scoring candidate; ties keep the earlier one.
pub fn select_best<T>(candidates: impl IntoIterator<Item = (T, u32)>) -> Result<T> {
    let mut best = None;
    let mut best_score = 0u32;

    for (candidate, score) in candidates {
        if score > best_score {
            best = Some(candidate);
            best_score = score;
        }
    }

    best.ok_or(RhiError::NoSuitableDevice)
}

/// Highest supported sample count not above `requested`.
pub fn choose_sample_count(supported: vk::SampleCountFlags, requested: u32) -> vk::SampleCountFlags {
    [
        vk::SampleCountFlags::TYPE_64,
        vk::SampleCountFlags::TYPE_32,
        vk::SampleCountFlags::TYPE_16,
        vk::SampleCountFlags::TYPE_8,
        vk::SampleCountFlags::TYPE_4,
        vk::SampleCountFlags::TYPE_2,
    ]
    .into_iter()
    .find(|&count| count.as_raw() <= requested && supported.contains(count))
    .unwrap_or(vk::SampleCountFlags::TYPE_1)
}

/// This is the global entry point for Vulkan initialization.
pub struct RhiCore {
    entry: Entry,
    instance: Instance,

    #[cfg(feature = "validation")]
    debug_messenger: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl RhiCore {
    #[profiling::function]
    pub fn new(display_handle: RawDisplayHandle, config: &RendererConfig) -> Result<Self> {
        let entry = unsafe { Entry::load() }.map_err(|e| RhiError::Loading(e.to_string()))?;

        let validation = cfg!(feature = "validation") && config.validation && has_validation_layer(&entry);
        let instance = create_instance(&entry, display_handle, &config.application_name, validation)?;

        #[cfg(feature = "validation")]
        let debug_messenger = if validation {
            match setup_debug_messenger(&entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(err) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(err);
                }
            }
        } else {
            None
        };

        Ok(Self {
            entry,
            instance,
            #[cfg(feature = "validation")]
            debug_messenger,
        })
    }

    /// Get the entry point.
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// Get a reference to the Vulkan instance.
    pub fn instance(&self) -> &Instance {
        &self.instance
    }
}

impl Drop for RhiCore {
    fn drop(&mut self) {
        unsafe {
            #[cfg(feature = "validation")]
            if let Some((debug_utils, messenger)) = self.debug_messenger.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

#[cfg(feature = "validation")]
fn has_validation_layer(entry: &Entry) -> bool {
    let layers = unsafe { entry.enumerate_instance_layer_properties() }.unwrap_or_default();
    let found = layers
        .iter()
        .any(|layer| layer.layer_name_as_c_str().is_ok_and(|name| name == VALIDATION_LAYER));

    if !found {
        log::warn!("Validation requested but {:?} is not installed", VALIDATION_LAYER);
    }
    found
}

#[cfg(not(feature = "validation"))]
fn has_validation_layer(_entry: &Entry) -> bool {
    false
}

/// Create Vulkan instance with required extensions and validation layers.
fn create_instance(
    entry: &Entry,
    display_handle: RawDisplayHandle,
    application_name: &str,
    validation: bool,
) -> Result<Instance> {
    let app_name = CString::new(application_name)
        .map_err(|_| RhiError::invalid_argument("application name contains a NUL byte"))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 1, 0, 0))
        .engine_name(c"Vesper")
        .engine_version(vk::make_api_version(0, 1, 0, 0))
        .api_version(vk::API_VERSION_1_3);

    let mut extensions = ash_window::enumerate_required_extensions(display_handle)
        .map_err(RhiError::device("enumerate_required_extensions"))?
        .to_vec();

    let mut layers: Vec<*const std::ffi::c_char> = Vec::new();

    #[cfg(feature = "validation")]
    if validation {
        extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        layers.push(VALIDATION_LAYER.as_ptr());
    }
    #[cfg(not(feature = "validation"))]
    let _ = validation;

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layers);

    unsafe { entry.create_instance(&create_info, None) }.map_err(RhiError::device("create_instance"))
}

/// Setup debug messenger for validation layers.
#[cfg(feature = "validation")]
fn setup_debug_messenger(
    entry: &Entry,
    instance: &Instance,
) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
    let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(vulkan_debug_callback));

    let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
        .map_err(RhiError::device("create_debug_utils_messenger"))?;

    Ok((debug_utils, messenger))
}

/// Vulkan debug callback function.
#[cfg(feature = "validation")]
unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let callback_data = unsafe { *p_callback_data };
    let message = if callback_data.p_message.is_null() {
        std::borrow::Cow::Borrowed("")
    } else {
        unsafe { CStr::from_ptr(callback_data.p_message) }.to_string_lossy()
    };

    let type_str = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "[General]",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "[Validation]",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "[Performance]",
        _ => "[Unknown]",
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::error!("Vulkan {}: {}", type_str, message),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::warn!("Vulkan {}: {}", type_str, message),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => log::info!("Vulkan {}: {}", type_str, message),
        _ => log::debug!("Vulkan {}: {}", type_str, message),
    }

    vk::FALSE
}

/// Find queue families that support graphics and present, preferring one that does both.
fn find_queue_families(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    swapchain_window: &SwapchainWindow,
) -> Option<(u32, u32)> {
    let queue_families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    let mut graphics_family = None;
    let mut present_family = None;

    for (index, family) in queue_families.iter().enumerate() {
        let index = index as u32;
        let graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let present = swapchain_window.supports_present(physical_device, index);

        if graphics && present {
            return Some((index, index));
        }
        if graphics && graphics_family.is_none() {
            graphics_family = Some(index);
        }
        if present && present_family.is_none() {
            present_family = Some(index);
        }
    }

    graphics_family.zip(present_family)
}

fn supports_update_after_bind(instance: &Instance, physical_device: vk::PhysicalDevice) -> bool {
    let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan_12_features);
    unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };

    vulkan_12_features.descriptor_binding_sampled_image_update_after_bind == vk::TRUE
}

/// Select the best physical device.
#[profiling::function]
pub fn select_physical_device(instance: &Instance, swapchain_window: &SwapchainWindow) -> Result<PhysicalDevice> {
    let physical_devices = unsafe { instance.enumerate_physical_devices() }
        .map_err(RhiError::device("enumerate_physical_devices"))?;

    let candidates = physical_devices.into_iter().filter_map(|device| {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let features = unsafe { instance.get_physical_device_features(device) };
        let families = find_queue_families(instance, device, swapchain_window);

        let score = score_device(&DeviceCapabilities::new(&properties, &features, families.is_some()));
        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy();
        log::info!("Found GPU: {} (score: {}, type: {:?})", device_name, score, properties.device_type);

        let (graphics_queue_family, present_queue_family) = families?;
        let physical = PhysicalDevice {
            handle: device,
            properties,
            memory_properties: unsafe { instance.get_physical_device_memory_properties(device) },
            features,
            update_after_bind: supports_update_after_bind(instance, device),
            graphics_queue_family,
            present_queue_family,
        };
        Some((physical, score))
    });

    let best = select_best(candidates)?;
    log::info!("Selected GPU: {}", best.name());
    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(device_type: vk::PhysicalDeviceType) -> DeviceCapabilities {
        DeviceCapabilities {
            device_type,
            api_version: vk::API_VERSION_1_3,
            large_points: false,
            wide_lines: false,
            tessellation_shader: false,
            geometry_shader: false,
            max_uniform_buffer_range: 0,
            max_vertex_input_bindings: 0,
            has_required_queues: true,
        }
    }

    #[test]
    fn feature_and_type_weights_add_up() {
        let mut discrete = caps(vk::PhysicalDeviceType::DISCRETE_GPU);
        discrete.large_points = true;
        discrete.wide_lines = true;
        discrete.tessellation_shader = true;
        discrete.geometry_shader = true;
        assert_eq!(score_device(&discrete), 1 + 3 + 4 + 5 + 15);

        assert_eq!(score_device(&caps(vk::PhysicalDeviceType::INTEGRATED_GPU)), 3);
        assert_eq!(score_device(&caps(vk::PhysicalDeviceType::CPU)), 1);
    }

    #[test]
    fn limits_contribute_to_the_score() {
        let mut device = caps(vk::PhysicalDeviceType::OTHER);
        device.max_uniform_buffer_range = 65536;
        device.max_vertex_input_bindings = 32;

        assert_eq!(score_device(&device), 1 + 65536 / 16 + 32);
    }

    #[test]
    fn missing_queues_or_old_api_is_unusable() {
        let mut no_queues = caps(vk::PhysicalDeviceType::DISCRETE_GPU);
        no_queues.has_required_queues = false;
        assert_eq!(score_device(&no_queues), 0);

        let mut old = caps(vk::PhysicalDeviceType::DISCRETE_GPU);
        old.api_version = vk::API_VERSION_1_1;
        assert_eq!(score_device(&old), 0);
    }

    #[test]
    fn discrete_beats_integrated_with_equal_limits() {
        let discrete = caps(vk::PhysicalDeviceType::DISCRETE_GPU);
        let integrated = caps(vk::PhysicalDeviceType::INTEGRATED_GPU);

        let chosen = select_best([
            ("integrated", score_device(&integrated)),
            ("discrete", score_device(&discrete)),
        ])
        .unwrap();
        assert_eq!(chosen, "discrete");
    }

    #[test]
    fn ties_keep_the_first_candidate() {
        assert_eq!(select_best([("a", 7), ("b", 7), ("c", 3)]).unwrap(), "a");
    }

    #[test]
    fn nothing_above_zero_is_an_error() {
        assert_eq!(select_best([("a", 0), ("b", 0)]), Err(RhiError::NoSuitableDevice));
        assert_eq!(select_best(Vec::<(u32, u32)>::new()), Err(RhiError::NoSuitableDevice));
    }

    #[test]
    fn sample_count_is_clamped_to_support() {
        let supported = vk::SampleCountFlags::TYPE_1 | vk::SampleCountFlags::TYPE_2 | vk::SampleCountFlags::TYPE_4;

        assert_eq!(choose_sample_count(supported, 4), vk::SampleCountFlags::TYPE_4);
        assert_eq!(choose_sample_count(supported, 8), vk::SampleCountFlags::TYPE_4);
        assert_eq!(choose_sample_count(supported, 2), vk::SampleCountFlags::TYPE_2);
        assert_eq!(choose_sample_count(supported, 1), vk::SampleCountFlags::TYPE_1);
        assert_eq!(choose_sample_count(vk::SampleCountFlags::TYPE_1, 4), vk::SampleCountFlags::TYPE_1);
    }
}
