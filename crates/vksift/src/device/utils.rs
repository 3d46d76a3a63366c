//! Small wrappers over raw `ash` calls shared by the memory, detector and
//! matcher subsystems: shader modules, compute pipelines, image/buffer
//! creation, barrier construction and one-shot command buffers.

use std::ffi::CStr;
use std::io::Cursor;

use ash::vk;
use log::error;

use crate::error::{Error, Result};

/// Returns the SPIR-V words of a compute module.
///
/// With the `embedded-shaders` feature the binaries are compiled into the
/// library; otherwise they are read from `shaders/<name>.comp.spv` relative
/// to the working directory.
fn shader_code(name: &'static str) -> Result<Vec<u32>> {
    #[cfg(feature = "embedded-shaders")]
    let bytes: Vec<u8> = {
        let data: &[u8] = match name {
            "GaussianBlur" => include_bytes!("../../shaders/GaussianBlur.comp.spv"),
            "GaussianBlurInterpolated" => {
                include_bytes!("../../shaders/GaussianBlurInterpolated.comp.spv")
            }
            "DifferenceOfGaussian" => include_bytes!("../../shaders/DifferenceOfGaussian.comp.spv"),
            "ExtractKeypoints" => include_bytes!("../../shaders/ExtractKeypoints.comp.spv"),
            "ComputeOrientation" => include_bytes!("../../shaders/ComputeOrientation.comp.spv"),
            "ComputeDescriptors" => include_bytes!("../../shaders/ComputeDescriptors.comp.spv"),
            "Get2NearestNeighbors" => include_bytes!("../../shaders/Get2NearestNeighbors.comp.spv"),
            _ => {
                return Err(Error::ShaderLoad {
                    name,
                    reason: "unknown embedded shader".into(),
                })
            }
        };
        data.to_vec()
    };
    #[cfg(not(feature = "embedded-shaders"))]
    let bytes = std::fs::read(format!("shaders/{}.comp.spv", name)).map_err(|err| Error::ShaderLoad {
        name,
        reason: err.to_string(),
    })?;

    ash::util::read_spv(&mut Cursor::new(&bytes)).map_err(|err| Error::ShaderLoad {
        name,
        reason: err.to_string(),
    })
}

pub(crate) fn create_shader_module(device: &ash::Device, name: &'static str) -> Result<vk::ShaderModule> {
    let code = shader_code(name)?;
    let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);
    unsafe { device.create_shader_module(&create_info, None) }.map_err(|result| {
        error!("failed to create shader module for '{}'", name);
        Error::ResourceCreation {
            object: "shader module",
            result,
        }
    })
}

/// Creates a pipeline layout and a compute pipeline around a single
/// descriptor set layout and an optional push-constant block.
pub(crate) fn create_compute_pipeline(
    device: &ash::Device,
    shader_module: vk::ShaderModule,
    descriptor_set_layout: vk::DescriptorSetLayout,
    push_constant_size: u32,
) -> Result<(vk::PipelineLayout, vk::Pipeline)> {
    let set_layouts = [descriptor_set_layout];
    let push_ranges = [vk::PushConstantRange::builder()
        .stage_flags(vk::ShaderStageFlags::COMPUTE)
        .offset(0)
        .size(push_constant_size)
        .build()];

    let mut layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
    if push_constant_size > 0 {
        layout_info = layout_info.push_constant_ranges(&push_ranges);
    }
    let pipeline_layout = unsafe { device.create_pipeline_layout(&layout_info, None) }.map_err(|result| {
        Error::ResourceCreation {
            object: "pipeline layout",
            result,
        }
    })?;

    let entry_point = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };
    let stage_info = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(shader_module)
        .name(entry_point);
    let pipeline_info = vk::ComputePipelineCreateInfo::builder()
        .stage(stage_info.build())
        .layout(pipeline_layout);

    let pipeline = unsafe {
        device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info.build()], None)
    }
    .map_err(|(_, result)| {
        unsafe { device.destroy_pipeline_layout(pipeline_layout, None) };
        Error::ResourceCreation {
            object: "compute pipeline",
            result,
        }
    })?[0];

    Ok((pipeline_layout, pipeline))
}

pub(crate) fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    requirements: vk::MemoryRequirements,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_properties.memory_type_count).find(|&index| {
        (requirements.memory_type_bits & (1 << index)) != 0
            && memory_properties.memory_types[index as usize]
                .property_flags
                .contains(flags)
    })
}

pub(crate) fn allocate_memory(
    device: &ash::Device,
    size: vk::DeviceSize,
    memory_type_index: u32,
) -> Result<vk::DeviceMemory> {
    let allocate_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(size)
        .memory_type_index(memory_type_index);
    unsafe { device.allocate_memory(&allocate_info, None) }
        .map_err(|result| Error::AllocationFailure { size, result })
}

pub(crate) fn create_image(
    device: &ash::Device,
    format: vk::Format,
    width: u32,
    height: u32,
    array_layers: u32,
    usage: vk::ImageUsageFlags,
) -> Result<vk::Image> {
    let create_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(vk::Extent3D {
            width,
            height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(array_layers)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);
    unsafe { device.create_image(&create_info, None) }.map_err(|result| Error::ResourceCreation {
        object: "image",
        result,
    })
}

pub(crate) fn create_image_view(
    device: &ash::Device,
    image: vk::Image,
    view_type: vk::ImageViewType,
    format: vk::Format,
    layer_count: u32,
) -> Result<vk::ImageView> {
    let create_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(view_type)
        .format(format)
        .subresource_range(layer_range(layer_count));
    unsafe { device.create_image_view(&create_info, None) }.map_err(|result| Error::ResourceCreation {
        object: "image view",
        result,
    })
}

pub(crate) fn create_buffer(
    device: &ash::Device,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
) -> Result<vk::Buffer> {
    let create_info = vk::BufferCreateInfo::builder()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    unsafe { device.create_buffer(&create_info, None) }.map_err(|result| Error::ResourceCreation {
        object: "buffer",
        result,
    })
}

/// Color subresource range covering `layer_count` array layers of mip 0.
pub(crate) fn layer_range(layer_count: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count,
    }
}

pub(crate) fn image_barrier(
    image: vk::Image,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    layer_count: u32,
) -> vk::ImageMemoryBarrier {
    vk::ImageMemoryBarrier::builder()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(layer_range(layer_count))
        .build()
}

pub(crate) fn buffer_barrier(
    buffer: vk::Buffer,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
    src_queue_family: u32,
    dst_queue_family: u32,
) -> vk::BufferMemoryBarrier {
    vk::BufferMemoryBarrier::builder()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .src_queue_family_index(src_queue_family)
        .dst_queue_family_index(dst_queue_family)
        .buffer(buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE)
        .build()
}

/// Allocates and begins a one-shot primary command buffer on `pool`.
pub(crate) fn begin_instant_command_buffer(
    device: &ash::Device,
    pool: vk::CommandPool,
) -> Result<vk::CommandBuffer> {
    let allocate_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let command_buffer = unsafe { device.allocate_command_buffers(&allocate_info) }
        .map_err(|result| Error::ResourceCreation {
            object: "command buffer",
            result,
        })?[0];

    let begin_info =
        vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    unsafe { device.begin_command_buffer(command_buffer, &begin_info) }.map_err(|result| {
        unsafe { device.free_command_buffers(pool, &[command_buffer]) };
        Error::ResourceCreation {
            object: "command buffer recording",
            result,
        }
    })?;
    Ok(command_buffer)
}

/// Ends, submits and waits for a command buffer started with
/// [`begin_instant_command_buffer`], then frees it.
pub(crate) fn end_instant_command_buffer(
    device: &ash::Device,
    queue: vk::Queue,
    pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
) -> Result<()> {
    let submit_result = unsafe {
        device
            .end_command_buffer(command_buffer)
            .map_err(Error::SubmitFailure)
            .and_then(|_| {
                let command_buffers = [command_buffer];
                let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
                device
                    .queue_submit(queue, &[submit_info.build()], vk::Fence::null())
                    .map_err(Error::SubmitFailure)
            })
            .and_then(|_| device.queue_wait_idle(queue).map_err(Error::SubmitFailure))
    };
    unsafe { device.free_command_buffers(pool, &[command_buffer]) };
    submit_result
}
