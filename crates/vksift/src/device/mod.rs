//! Process-global Vulkan context and logical-device bootstrap.
//!
//! The Vulkan API itself is process-global in the driver model, so the
//! context lives behind an explicit [`load_vulkan`] / [`unload_vulkan`]
//! pair rather than a lazy initializer: the host program keeps control
//! over its lifetime.

pub(crate) mod utils;

use std::ffi::CStr;
use std::os::raw::c_char;
use std::sync::Mutex;

use ash::vk;
use log::{info, warn};
use once_cell::sync::Lazy;

use crate::error::{Error, Result};

pub(crate) struct VulkanContext {
    #[allow(dead_code)] // keeps the loader library alive
    entry: ash::Entry,
    pub instance: ash::Instance,
}

static CONTEXT: Lazy<Mutex<Option<VulkanContext>>> = Lazy::new(|| Mutex::new(None));

/// Loads the Vulkan runtime and creates the process-global API context.
///
/// # Errors
///
/// Fails when the Vulkan library cannot be found on the system, when
/// instance creation fails, or when a context already exists.
pub fn load_vulkan() -> Result<()> {
    let mut context = CONTEXT.lock().unwrap();
    if context.is_some() {
        return Err(Error::ApiLoad("a Vulkan context has already been created".into()));
    }

    let entry = unsafe { ash::Entry::load() }.map_err(|err| {
        Error::ApiLoad(format!(
            "the Vulkan library could not be loaded at runtime: {}",
            err
        ))
    })?;
    let instance = create_context_instance(&entry)?;
    *context = Some(VulkanContext { entry, instance });
    Ok(())
}

/// Destroys the process-global API context and releases the runtime.
///
/// Every [`Instance`](crate::Instance) must be dropped first. Subsequent
/// API calls fail until [`load_vulkan`] is called again.
pub fn unload_vulkan() {
    let mut context = CONTEXT.lock().unwrap();
    if let Some(ctx) = context.take() {
        unsafe { ctx.instance.destroy_instance(None) };
    }
}

/// Lists the names of the Vulkan-capable GPUs, in enumeration order.
///
/// The returned indices are valid values for
/// [`Config::gpu_device_index`](crate::Config::gpu_device_index).
///
/// # Errors
///
/// Fails when no context is loaded or the enumeration itself fails.
pub fn available_gpus() -> Result<Vec<String>> {
    let context = CONTEXT.lock().unwrap();
    let context = context
        .as_ref()
        .ok_or_else(|| Error::ApiLoad("no Vulkan context loaded".into()))?;

    let physical_devices = unsafe { context.instance.enumerate_physical_devices() }
        .map_err(|result| Error::ApiLoad(format!("vkEnumeratePhysicalDevices failed ({})", result)))?;
    Ok(physical_devices
        .iter()
        .map(|&physical_device| {
            let props = unsafe { context.instance.get_physical_device_properties(physical_device) };
            unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
                .to_string_lossy()
                .into_owned()
        })
        .collect())
}

fn create_context_instance(entry: &ash::Entry) -> Result<ash::Instance> {
    let application_name = unsafe { CStr::from_bytes_with_nul_unchecked(b"vksift\0") };
    let app_info = vk::ApplicationInfo::builder()
        .application_name(application_name)
        .application_version(vk::make_api_version(0, 1, 0, 0))
        .engine_name(application_name)
        .engine_version(vk::make_api_version(0, 1, 0, 0))
        .api_version(vk::API_VERSION_1_0);

    // Layers the runtime cannot provide are dropped with a warning instead
    // of failing instance creation.
    let mut enabled_layers: Vec<*const c_char> = Vec::new();
    if cfg!(feature = "validation") {
        let validation_layer =
            unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") };
        let available = entry
            .enumerate_instance_layer_properties()
            .map_err(|result| Error::ApiLoad(format!("layer enumeration failed ({})", result)))?;
        let supported = available
            .iter()
            .any(|props| unsafe { CStr::from_ptr(props.layer_name.as_ptr()) } == validation_layer);
        if supported {
            enabled_layers.push(validation_layer.as_ptr());
        } else {
            warn!(
                "the requested layer {:?} is not supported by the Vulkan runtime and will not be used",
                validation_layer
            );
        }
    }

    let create_info = vk::InstanceCreateInfo::builder()
        .application_info(&app_info)
        .enabled_layer_names(&enabled_layers);
    unsafe { entry.create_instance(&create_info, None) }
        .map_err(|result| Error::ApiLoad(format!("vkCreateInstance failed ({})", result)))
}

/// Queue and extension requirements for [`Device::new`].
pub(crate) struct DeviceConfig {
    pub extensions: Vec<&'static CStr>,
    /// Number of general-purpose (graphics+compute) queues. Device
    /// creation fails when the GPU cannot provide them.
    pub general_queue_count: u32,
    /// Number of async-compute queues. Tagged unavailable when the GPU
    /// cannot provide them.
    pub async_compute_queue_count: u32,
    /// Number of transfer-only queues. Tagged unavailable when the GPU
    /// cannot provide them.
    pub async_transfer_queue_count: u32,
    /// Negative values select the highest-scoring GPU automatically.
    pub target_device_index: i32,
}

/// A logical device together with the queues the upper layers need.
///
/// The async-compute family is discovered and exposed like the transfer
/// family even though the current pipelines only request transfer queues.
#[allow(dead_code)]
pub(crate) struct Device {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub general_queues: Vec<vk::Queue>,
    pub general_queue_family: u32,
    pub async_compute_available: bool,
    pub async_compute_queues: Vec<vk::Queue>,
    pub async_compute_queue_family: u32,
    pub async_transfer_available: bool,
    pub async_transfer_queues: Vec<vk::Queue>,
    pub async_transfer_queue_family: u32,
    /// Loaded when the driver exposes `VK_EXT_debug_marker`; recorded
    /// phases are then wrapped in named marker regions.
    pub debug_marker: Option<ash::extensions::ext::DebugMarker>,
}

impl Device {
    pub fn new(config: &DeviceConfig) -> Result<Self> {
        assert!(config.general_queue_count > 0);

        let context = CONTEXT.lock().unwrap();
        let context = context
            .as_ref()
            .ok_or_else(|| Error::ApiLoad("no Vulkan context loaded".into()))?;
        let instance = &context.instance;

        let physical_device = select_physical_device(instance, config)?;
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let general_queue_family = find_queue_family(
            instance,
            physical_device,
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
            vk::QueueFlags::empty(),
            config.general_queue_count,
        )
        .ok_or(Error::NoSuitableDevice)?;
        let async_compute_queue_family = find_queue_family(
            instance,
            physical_device,
            vk::QueueFlags::COMPUTE,
            vk::QueueFlags::GRAPHICS,
            config.async_compute_queue_count,
        );
        let async_transfer_queue_family = find_queue_family(
            instance,
            physical_device,
            vk::QueueFlags::TRANSFER,
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
            config.async_transfer_queue_count,
        );

        info!(
            "selected GPU: {} [device ID={}][vendor ID={}]",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy(),
            properties.device_id,
            properties.vendor_id
        );
        if config.async_compute_queue_count > 0 {
            info!("GPU async compute support: {}", async_compute_queue_family.is_some());
        }
        if config.async_transfer_queue_count > 0 {
            info!("GPU async transfer support: {}", async_transfer_queue_family.is_some());
        }

        let max_queue_count = config
            .general_queue_count
            .max(config.async_compute_queue_count)
            .max(config.async_transfer_queue_count);
        let priorities = vec![1.0f32; max_queue_count as usize];

        let mut queue_create_infos = vec![vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(general_queue_family)
            .queue_priorities(&priorities[..config.general_queue_count as usize])
            .build()];
        if let Some(family) = async_compute_queue_family {
            queue_create_infos.push(
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities[..config.async_compute_queue_count as usize])
                    .build(),
            );
        }
        if let Some(family) = async_transfer_queue_family {
            queue_create_infos.push(
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities[..config.async_transfer_queue_count as usize])
                    .build(),
            );
        }

        let mut extension_names: Vec<*const c_char> =
            config.extensions.iter().map(|ext| ext.as_ptr()).collect();
        let debug_marker_supported = {
            let available = unsafe { instance.enumerate_device_extension_properties(physical_device) }
                .unwrap_or_default();
            available.iter().any(|props| {
                (unsafe { CStr::from_ptr(props.extension_name.as_ptr()) })
                    == ash::extensions::ext::DebugMarker::name()
            })
        };
        if debug_marker_supported {
            extension_names.push(ash::extensions::ext::DebugMarker::name().as_ptr());
        }
        let device_create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names);
        let device = unsafe { instance.create_device(physical_device, &device_create_info, None) }
            .map_err(|result| Error::ResourceCreation {
                object: "logical device",
                result,
            })?;
        let debug_marker = debug_marker_supported
            .then(|| ash::extensions::ext::DebugMarker::new(instance, &device));

        let get_queues = |family: u32, count: u32| -> Vec<vk::Queue> {
            (0..count)
                .map(|index| unsafe { device.get_device_queue(family, index) })
                .collect()
        };

        let general_queues = get_queues(general_queue_family, config.general_queue_count);
        let async_compute_queues = async_compute_queue_family
            .map(|family| get_queues(family, config.async_compute_queue_count))
            .unwrap_or_default();
        let async_transfer_queues = async_transfer_queue_family
            .map(|family| get_queues(family, config.async_transfer_queue_count))
            .unwrap_or_default();

        Ok(Self {
            device,
            physical_device,
            properties,
            memory_properties,
            general_queues,
            general_queue_family,
            async_compute_available: async_compute_queue_family.is_some(),
            async_compute_queues,
            async_compute_queue_family: async_compute_queue_family.unwrap_or(0),
            async_transfer_available: async_transfer_queue_family.is_some(),
            async_transfer_queues,
            async_transfer_queue_family: async_transfer_queue_family.unwrap_or(0),
            debug_marker,
        })
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe { self.device.destroy_device(None) };
    }
}

fn select_physical_device(
    instance: &ash::Instance,
    config: &DeviceConfig,
) -> Result<vk::PhysicalDevice> {
    let physical_devices = unsafe { instance.enumerate_physical_devices() }
        .map_err(|result| Error::ApiLoad(format!("vkEnumeratePhysicalDevices failed ({})", result)))?;
    if physical_devices.is_empty() {
        return Err(Error::NoSuitableDevice);
    }

    if config.target_device_index < 0 {
        info!("looking for GPU candidates:");
        let mut best: Option<(f32, vk::PhysicalDevice)> = None;
        for (index, &candidate) in physical_devices.iter().enumerate() {
            let props = unsafe { instance.get_physical_device_properties(candidate) };
            let score = score_physical_device(instance, candidate, config);
            info!(
                "\t device {} ({}): score {} ({})",
                index,
                unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy(),
                score,
                if score == 0.0 { "invalid" } else { "valid" }
            );
            if score > best.map_or(0.0, |(best_score, _)| best_score) {
                best = Some((score, candidate));
            }
        }
        best.map(|(_, device)| device).ok_or(Error::NoSuitableDevice)
    } else {
        let index = config.target_device_index as usize;
        let physical_device = *physical_devices.get(index).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "GPU index {} is out of range ({} devices available)",
                index,
                physical_devices.len()
            ))
        })?;
        // The user selection still has to support the mandatory extensions
        // and the general queue family.
        if !extensions_supported(instance, physical_device, &config.extensions)
            || find_queue_family(
                instance,
                physical_device,
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
                vk::QueueFlags::empty(),
                config.general_queue_count,
            )
            .is_none()
        {
            return Err(Error::NoSuitableDevice);
        }
        Ok(physical_device)
    }
}

/// Looks for a queue family whose flags contain `present`, exclude
/// `absent`, and that exposes at least `queue_count` queues.
fn find_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    present: vk::QueueFlags,
    absent: vk::QueueFlags,
    queue_count: u32,
) -> Option<u32> {
    if queue_count == 0 {
        return None;
    }
    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    families
        .iter()
        .position(|family| {
            family.queue_flags.contains(present)
                && !family.queue_flags.intersects(absent)
                && family.queue_count >= queue_count
        })
        .map(|index| index as u32)
}

fn extensions_supported(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    required: &[&CStr],
) -> bool {
    let available = unsafe { instance.enumerate_device_extension_properties(physical_device) }
        .unwrap_or_default();
    let mut all_supported = true;
    for extension in required {
        let found = available
            .iter()
            .any(|props| unsafe { CStr::from_ptr(props.extension_name.as_ptr()) } == *extension);
        if !found {
            info!("missing required device extension {:?}", extension);
            all_supported = false;
        }
    }
    all_supported
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GpuKind {
    Discrete,
    Integrated,
    Other,
}

fn score_physical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    config: &DeviceConfig,
) -> f32 {
    let props = unsafe { instance.get_physical_device_properties(physical_device) };
    let kind = match props.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => GpuKind::Discrete,
        vk::PhysicalDeviceType::INTEGRATED_GPU => GpuKind::Integrated,
        _ => GpuKind::Other,
    };

    let has_general_queue = find_queue_family(
        instance,
        physical_device,
        vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
        vk::QueueFlags::empty(),
        config.general_queue_count,
    )
    .is_some();
    let has_async_compute = find_queue_family(
        instance,
        physical_device,
        vk::QueueFlags::COMPUTE,
        vk::QueueFlags::GRAPHICS,
        config.async_compute_queue_count,
    )
    .is_some();
    let has_async_transfer = find_queue_family(
        instance,
        physical_device,
        vk::QueueFlags::TRANSFER,
        vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
        config.async_transfer_queue_count,
    )
    .is_some();

    let memory_props = unsafe { instance.get_physical_device_memory_properties(physical_device) };
    let device_local_bytes: u64 = memory_props.memory_heaps[..memory_props.memory_heap_count as usize]
        .iter()
        .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|heap| heap.size)
        .sum();
    let heap_gigabytes = device_local_bytes as f32 / 1e9;

    capability_score(
        kind,
        has_general_queue,
        has_async_compute,
        has_async_transfer,
        extensions_supported(instance, physical_device, &config.extensions),
        heap_gigabytes,
    )
}

/// GPU capability score, by order of importance: device kind, queue family
/// support, required extensions, device-local heap size as a tie breaker.
fn capability_score(
    kind: GpuKind,
    has_general_queue: bool,
    has_async_compute: bool,
    has_async_transfer: bool,
    extensions_supported: bool,
    heap_gigabytes: f32,
) -> f32 {
    let kind_score = match kind {
        GpuKind::Discrete => 2.0,
        GpuKind::Integrated => 1.0,
        GpuKind::Other => return 0.0,
    };
    if !has_general_queue || !extensions_supported {
        return 0.0;
    }
    let queue_support = 1.0
        + if has_async_compute { 1.0 } else { 0.0 }
        + if has_async_transfer { 1.0 } else { 0.0 };
    kind_score * 1e4 + queue_support * 1e3 + heap_gigabytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discrete_gpus_beat_integrated_gpus() {
        let discrete = capability_score(GpuKind::Discrete, true, false, false, true, 4.0);
        let integrated = capability_score(GpuKind::Integrated, true, true, true, true, 64.0);
        assert!(discrete > integrated);
    }

    #[test]
    fn queue_support_beats_heap_size() {
        let with_queues = capability_score(GpuKind::Discrete, true, true, true, true, 1.0);
        let with_memory = capability_score(GpuKind::Discrete, true, false, false, true, 24.0);
        assert!(with_queues > with_memory);
    }

    #[test]
    fn unusable_candidates_score_zero() {
        assert_eq!(capability_score(GpuKind::Other, true, true, true, true, 8.0), 0.0);
        assert_eq!(capability_score(GpuKind::Discrete, false, true, true, true, 8.0), 0.0);
        assert_eq!(capability_score(GpuKind::Discrete, true, true, true, false, 8.0), 0.0);
    }

    #[test]
    fn score_combines_kind_queues_and_heap() {
        let score = capability_score(GpuKind::Discrete, true, true, true, true, 7.5);
        assert_eq!(score, 2.0 * 1e4 + 3.0 * 1e3 + 7.5);
    }
}
