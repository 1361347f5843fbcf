//! Vulkan context: instance, physical device, logical device, and queue.

use ash::khr::{acceleration_structure, deferred_host_operations, push_descriptor, ray_tracing_pipeline};
use ash::khr::{surface, swapchain};
use ash::{vk, Device, Entry, Instance};
use std::ffi::{CStr, CString};
use std::os::raw::c_char;

use super::{APP_NAME, ENGINE_NAME, ENGINE_VERSION, REQUIRED_VK_VERSION};

/// Ray tracing capabilities of the selected physical device.
#[derive(Debug, Clone, Default)]
pub struct RtCapabilities {
    pub supported: bool,
    pub max_ray_recursion_depth: u32,
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub min_scratch_offset_alignment: u32,
    pub push_descriptor: bool,
}

/// Queue family indices.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueFamilyIndices {
    /// A family with graphics and compute, used for everything.
    pub graphics: Option<u32>,
}

impl QueueFamilyIndices {
    pub fn is_complete(&self) -> bool {
        self.graphics.is_some()
    }
}

/// Core Vulkan objects shared by the device and the swapchain.
pub struct VulkanContext {
    pub entry: Entry,
    pub instance: Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: Device,
    pub queue_families: QueueFamilyIndices,
    pub graphics_queue: vk::Queue,

    pub surface_loader: surface::Instance,
    pub swapchain_loader: swapchain::Device,
    pub accel_struct_loader: acceleration_structure::Device,
    pub rt_pipeline_loader: ray_tracing_pipeline::Device,
    pub push_descriptor_loader: push_descriptor::Device,

    pub rt_capabilities: RtCapabilities,
    pub device_properties: vk::PhysicalDeviceProperties,

    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanContext {
    /// Create a new Vulkan context on the best ray-tracing-capable GPU.
    ///
    /// # Safety
    /// `display_handle` must stay valid for the lifetime of the context.
    pub unsafe fn new(display_handle: raw_window_handle::RawDisplayHandle, enable_validation: bool) -> Result<Self, String> {
        let entry = Entry::linked();

        let api_version = match entry
            .try_enumerate_instance_version()
            .map_err(|e| format!("Failed to enumerate instance version: {:?}", e))?
        {
            Some(version) => version,
            None => vk::API_VERSION_1_0,
        };

        if api_version < REQUIRED_VK_VERSION {
            return Err(format!(
                "Vulkan 1.3 required, but only {}.{}.{} available",
                vk::api_version_major(api_version),
                vk::api_version_minor(api_version),
                vk::api_version_patch(api_version)
            ));
        }

        let instance = Self::create_instance(&entry, display_handle, enable_validation)?;

        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let surface_loader = surface::Instance::new(&entry, &instance);

        let (physical_device, queue_families, rt_capabilities) = Self::pick_physical_device(&instance)?;
        let device_properties = instance.get_physical_device_properties(physical_device);

        let graphics_family = queue_families.graphics.ok_or("No graphics queue family")?;
        let device = Self::create_logical_device(&instance, physical_device, graphics_family)?;
        let graphics_queue = device.get_device_queue(graphics_family, 0);

        let swapchain_loader = swapchain::Device::new(&instance, &device);
        let accel_struct_loader = acceleration_structure::Device::new(&instance, &device);
        let rt_pipeline_loader = ray_tracing_pipeline::Device::new(&instance, &device);
        let push_descriptor_loader = push_descriptor::Device::new(&instance, &device);

        Ok(Self {
            entry,
            instance,
            physical_device,
            device,
            queue_families,
            graphics_queue,
            surface_loader,
            swapchain_loader,
            accel_struct_loader,
            rt_pipeline_loader,
            push_descriptor_loader,
            rt_capabilities,
            device_properties,
            debug_utils,
        })
    }

    unsafe fn create_instance(
        entry: &Entry,
        display_handle: raw_window_handle::RawDisplayHandle,
        enable_validation: bool,
    ) -> Result<Instance, String> {
        let app_info = vk::ApplicationInfo::default()
            .application_name(APP_NAME)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(ENGINE_NAME)
            .engine_version(ENGINE_VERSION)
            .api_version(REQUIRED_VK_VERSION);

        let mut extensions = ash_window::enumerate_required_extensions(display_handle)
            .map_err(|e| format!("Failed to get required extensions: {:?}", e))?
            .to_vec();

        if enable_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        let layer_names: Vec<CString> = if enable_validation {
            vec![CString::from(c"VK_LAYER_KHRONOS_validation")]
        } else {
            vec![]
        };
        let layer_name_ptrs: Vec<*const c_char> = layer_names.iter().map(|n| n.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_name_ptrs);

        entry
            .create_instance(&create_info, None)
            .map_err(|e| format!("Failed to create Vulkan instance: {:?}", e))
    }

    unsafe fn setup_debug_messenger(
        entry: &Entry,
        instance: &Instance,
    ) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT), String> {
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
            .pfn_user_callback(Some(debug_callback));

        let messenger = debug_utils
            .create_debug_utils_messenger(&create_info, None)
            .map_err(|e| format!("Failed to create debug messenger: {:?}", e))?;

        Ok((debug_utils, messenger))
    }

    unsafe fn pick_physical_device(
        instance: &Instance,
    ) -> Result<(vk::PhysicalDevice, QueueFamilyIndices, RtCapabilities), String> {
        let devices = instance
            .enumerate_physical_devices()
            .map_err(|e| format!("Failed to enumerate physical devices: {:?}", e))?;

        if devices.is_empty() {
            return Err("No Vulkan-capable GPU found".to_string());
        }

        let mut scored_devices: Vec<_> = devices
            .iter()
            .filter_map(|&device| {
                let score = Self::rate_device(instance, device);
                if score > 0 {
                    Some((device, score))
                } else {
                    None
                }
            })
            .collect();

        scored_devices.sort_by(|a, b| b.1.cmp(&a.1));

        let Some(&(physical_device, _)) = scored_devices.first() else {
            return Err("No GPU with hardware ray tracing and push descriptors found".to_string());
        };

        let queue_families = Self::find_queue_families(instance, physical_device);
        let rt_caps = Self::check_rt_support(instance, physical_device);

        let props = instance.get_physical_device_properties(physical_device);
        let name = CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy();
        log::info!(
            "Selected GPU: {} (SBT handle {} bytes, base alignment {})",
            name,
            rt_caps.shader_group_handle_size,
            rt_caps.shader_group_base_alignment
        );

        Ok((physical_device, queue_families, rt_caps))
    }

    /// Rate a physical device (higher is better, zero is unusable).
    unsafe fn rate_device(instance: &Instance, device: vk::PhysicalDevice) -> u32 {
        let props = instance.get_physical_device_properties(device);
        if props.api_version < REQUIRED_VK_VERSION {
            return 0;
        }

        if !Self::find_queue_families(instance, device).is_complete() {
            return 0;
        }

        let rt_caps = Self::check_rt_support(instance, device);
        if !rt_caps.supported || !rt_caps.push_descriptor {
            return 0;
        }

        let mut score = 1u32;

        if props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += 10000;
        } else if props.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
            score += 1000;
        }

        let memory_props = instance.get_physical_device_memory_properties(device);
        for heap in &memory_props.memory_heaps[..memory_props.memory_heap_count as usize] {
            if heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) {
                score += (heap.size / (1024 * 1024)) as u32;
            }
        }

        score
    }

    unsafe fn find_queue_families(instance: &Instance, device: vk::PhysicalDevice) -> QueueFamilyIndices {
        let queue_families = instance.get_physical_device_queue_family_properties(device);

        let graphics = queue_families
            .iter()
            .position(|family| {
                family
                    .queue_flags
                    .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            })
            .map(|i| i as u32);

        QueueFamilyIndices { graphics }
    }

    unsafe fn check_rt_support(instance: &Instance, device: vk::PhysicalDevice) -> RtCapabilities {
        let extensions = match instance.enumerate_device_extension_properties(device) {
            Ok(ext) => ext,
            Err(_) => return RtCapabilities::default(),
        };

        let has_extension = |wanted: &CStr| {
            extensions
                .iter()
                .any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == wanted)
        };

        if !has_extension(acceleration_structure::NAME)
            || !has_extension(ray_tracing_pipeline::NAME)
            || !has_extension(deferred_host_operations::NAME)
        {
            return RtCapabilities::default();
        }

        let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut accel_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut props2 = vk::PhysicalDeviceProperties2::default()
            .push_next(&mut rt_props)
            .push_next(&mut accel_props);
        instance.get_physical_device_properties2(device, &mut props2);

        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut accel_features)
            .push_next(&mut rt_features);
        instance.get_physical_device_features2(device, &mut features2);

        RtCapabilities {
            supported: accel_features.acceleration_structure == vk::TRUE
                && rt_features.ray_tracing_pipeline == vk::TRUE,
            max_ray_recursion_depth: rt_props.max_ray_recursion_depth,
            shader_group_handle_size: rt_props.shader_group_handle_size,
            shader_group_handle_alignment: rt_props.shader_group_handle_alignment,
            shader_group_base_alignment: rt_props.shader_group_base_alignment,
            min_scratch_offset_alignment: accel_props.min_acceleration_structure_scratch_offset_alignment,
            push_descriptor: has_extension(push_descriptor::NAME),
        }
    }

    unsafe fn create_logical_device(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        graphics_family: u32,
    ) -> Result<Device, String> {
        let queue_priorities = [1.0f32];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(graphics_family)
            .queue_priorities(&queue_priorities)];

        let extensions: Vec<*const c_char> = vec![
            swapchain::NAME.as_ptr(),
            acceleration_structure::NAME.as_ptr(),
            ray_tracing_pipeline::NAME.as_ptr(),
            deferred_host_operations::NAME.as_ptr(),
            push_descriptor::NAME.as_ptr(),
        ];

        let mut vulkan_13_features = vk::PhysicalDeviceVulkan13Features::default()
            .synchronization2(true)
            .maintenance4(true);

        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(true)
            .timeline_semaphore(true)
            .descriptor_indexing(true);

        let mut accel_features =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default().acceleration_structure(true);

        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);

        let device_features = vk::PhysicalDeviceFeatures::default()
            .sampler_anisotropy(true)
            .shader_storage_image_write_without_format(true);

        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .features(device_features)
            .push_next(&mut vulkan_13_features)
            .push_next(&mut vulkan_12_features)
            .push_next(&mut accel_features)
            .push_next(&mut rt_features);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut features2);

        instance
            .create_device(physical_device, &create_info, None)
            .map_err(|e| format!("Failed to create logical device: {:?}", e))
    }

    /// Wait for all device operations to complete.
    pub fn wait_idle(&self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            self.wait_idle();

            if let Some((loader, messenger)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Forward validation layer messages to the log.
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _ty: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*data).p_message).to_string_lossy();

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!(target: "vulkan", "{}", message);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!(target: "vulkan", "{}", message);
    } else {
        log::debug!(target: "vulkan", "{}", message);
    }

    vk::FALSE
}
