//! SIFT detection pipeline.
//!
//! Records one primary command buffer chaining the six compute stages over
//! every octave: separable Gaussian blur, Difference-of-Gaussian, keypoint
//! extraction, orientation assignment and descriptor computation, plus the
//! transfers that feed the pipeline and report the per-octave feature
//! counts back to the host. The command buffer is re-recorded whenever the
//! target buffer or the memory layout changes; layout changes are rare and
//! the recording cost is modest, so nothing is cached per target.

use std::ffi::CStr;
use std::mem::size_of;
use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use smallvec::SmallVec;

use crate::config::Config;
use crate::device::utils;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::memory::{SiftMemory, INDIRECT_TRIPLET_SIZE, SECTION_HEADER_SIZE};

pub(crate) const MAX_GAUSSIAN_KERNEL_SIZE: usize = 20;

/// One separable blur kernel: either plain taps, or (coefficient, offset)
/// pairs for the hardware-interpolated variant. `size` is always the
/// direct tap count; the interpolated shader derives its pair count.
#[derive(Debug, Clone)]
struct GaussianKernel {
    size: u32,
    data: [f32; MAX_GAUSSIAN_KERNEL_SIZE],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct GaussianBlurPush {
    is_vertical: u32,
    array_layer: u32,
    kernel_size: u32,
    kernel: [f32; MAX_GAUSSIAN_KERNEL_SIZE],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct ExtractKeypointsPush {
    section_offset: u32,
    octave_index: u32,
    scale_factor: f32,
    sigma_multiplier: f32,
    dog_threshold: f32,
    edge_threshold: f32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct OrientationPush {
    section_offset: u32,
    octave_index: u32,
    max_orientations: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct DescriptorPush {
    section_offset: u32,
    octave_index: u32,
}

/// Descriptor machinery and pipeline of one compute stage.
struct ComputeStage {
    descriptor_set_layout: vk::DescriptorSetLayout,
    descriptor_pool: vk::DescriptorPool,
    descriptor_sets: Vec<vk::DescriptorSet>,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
}

impl ComputeStage {
    const fn null() -> Self {
        Self {
            descriptor_set_layout: vk::DescriptorSetLayout::null(),
            descriptor_pool: vk::DescriptorPool::null(),
            descriptor_sets: Vec::new(),
            pipeline_layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
        }
    }

    fn new(
        device: &ash::Device,
        bindings: &[vk::DescriptorType],
        set_count: u32,
        shader: &'static str,
        push_constant_size: u32,
    ) -> Result<Self> {
        let layout_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .enumerate()
            .map(|(index, &descriptor_type)| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(index as u32)
                    .descriptor_type(descriptor_type)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
                    .build()
            })
            .collect();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&layout_bindings);
        let descriptor_set_layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(|result| Error::ResourceCreation {
                object: "descriptor set layout",
                result,
            })?;

        let mut stage = Self {
            descriptor_set_layout,
            descriptor_pool: vk::DescriptorPool::null(),
            descriptor_sets: Vec::new(),
            pipeline_layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
        };

        let pool_sizes: Vec<vk::DescriptorPoolSize> = bindings
            .iter()
            .map(|&descriptor_type| vk::DescriptorPoolSize {
                ty: descriptor_type,
                descriptor_count: set_count,
            })
            .collect();
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(set_count)
            .pool_sizes(&pool_sizes);
        stage.descriptor_pool = match unsafe { device.create_descriptor_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(result) => {
                stage.destroy(device);
                return Err(Error::ResourceCreation {
                    object: "descriptor pool",
                    result,
                });
            }
        };

        let set_layouts = vec![descriptor_set_layout; set_count as usize];
        let allocate_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(stage.descriptor_pool)
            .set_layouts(&set_layouts);
        stage.descriptor_sets = match unsafe { device.allocate_descriptor_sets(&allocate_info) } {
            Ok(sets) => sets,
            Err(result) => {
                stage.destroy(device);
                return Err(Error::ResourceCreation {
                    object: "descriptor sets",
                    result,
                });
            }
        };

        let shader_module = match utils::create_shader_module(device, shader) {
            Ok(module) => module,
            Err(err) => {
                stage.destroy(device);
                return Err(err);
            }
        };
        let pipeline_result =
            utils::create_compute_pipeline(device, shader_module, descriptor_set_layout, push_constant_size);
        unsafe { device.destroy_shader_module(shader_module, None) };
        match pipeline_result {
            Ok((pipeline_layout, pipeline)) => {
                stage.pipeline_layout = pipeline_layout;
                stage.pipeline = pipeline;
                Ok(stage)
            }
            Err(err) => {
                stage.destroy(device);
                Err(err)
            }
        }
    }

    fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            if self.pipeline != vk::Pipeline::null() {
                device.destroy_pipeline(self.pipeline, None);
                self.pipeline = vk::Pipeline::null();
            }
            if self.pipeline_layout != vk::PipelineLayout::null() {
                device.destroy_pipeline_layout(self.pipeline_layout, None);
                self.pipeline_layout = vk::PipelineLayout::null();
            }
            if self.descriptor_pool != vk::DescriptorPool::null() {
                device.destroy_descriptor_pool(self.descriptor_pool, None);
                self.descriptor_pool = vk::DescriptorPool::null();
            }
            if self.descriptor_set_layout != vk::DescriptorSetLayout::null() {
                device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
                self.descriptor_set_layout = vk::DescriptorSetLayout::null();
            }
        }
    }
}

pub(crate) struct SiftDetector {
    device: Arc<Device>,
    general_queue: vk::Queue,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    sampler: vk::Sampler,

    /// Sets `[0, O)` serve the horizontal passes, `[O, 2O)` the vertical.
    blur: ComputeStage,
    dog: ComputeStage,
    extract: ComputeStage,
    orientation: ComputeStage,
    descriptor: ComputeStage,

    pub end_of_detection_fence: vk::Fence,

    gaussian_kernels: Vec<GaussianKernel>,
    scale_factor_min: f32,
    seed_scale_sigma: f32,
    dog_threshold: f32,
    edge_threshold: f32,
    max_orientations: u32,
    scales_per_octave: u32,

    current_buffer_index: usize,
}

impl SiftDetector {
    pub fn new(device: Arc<Device>, memory: &SiftMemory, config: &Config) -> Result<Self> {
        let vk_device = &device.device;
        let scales_per_octave = u32::from(config.nb_scales_per_octave);

        let gaussian_kernels = build_gaussian_kernels(
            scales_per_octave,
            config.seed_scale_sigma,
            config.input_image_blur_level,
            config.use_input_upsampling,
            config.use_hardware_interpolated_blur,
        );

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(device.general_queue_family);
        let command_pool = unsafe { vk_device.create_command_pool(&pool_info, None) }.map_err(|result| {
            Error::ResourceCreation {
                object: "detector command pool",
                result,
            }
        })?;

        let mut detector = Self {
            general_queue: device.general_queues[0],
            command_pool,
            command_buffer: vk::CommandBuffer::null(),
            sampler: vk::Sampler::null(),
            blur: ComputeStage::null(),
            dog: ComputeStage::null(),
            extract: ComputeStage::null(),
            orientation: ComputeStage::null(),
            descriptor: ComputeStage::null(),
            end_of_detection_fence: vk::Fence::null(),
            gaussian_kernels,
            scale_factor_min: if config.use_input_upsampling { 0.5 } else { 1.0 },
            seed_scale_sigma: config.seed_scale_sigma,
            dog_threshold: config.intensity_threshold / scales_per_octave as f32,
            edge_threshold: config.edge_threshold,
            max_orientations: u32::from(config.max_nb_orientations_per_keypoint),
            scales_per_octave,
            current_buffer_index: 0,
            device,
        };

        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(detector.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        detector.command_buffer = unsafe { detector.device.device.allocate_command_buffers(&allocate_info) }
            .map_err(|result| Error::ResourceCreation {
                object: "detector command buffer",
                result,
            })?[0];

        detector.sampler = create_sampler(&detector.device.device)?;

        let blur_shader = if config.use_hardware_interpolated_blur {
            "GaussianBlurInterpolated"
        } else {
            "GaussianBlur"
        };
        let max_octaves = memory.max_octave_count;
        detector.blur = ComputeStage::new(
            &detector.device.device,
            &[
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::DescriptorType::STORAGE_IMAGE,
            ],
            max_octaves * 2,
            blur_shader,
            size_of::<GaussianBlurPush>() as u32,
        )?;
        detector.dog = ComputeStage::new(
            &detector.device.device,
            &[vk::DescriptorType::STORAGE_IMAGE, vk::DescriptorType::STORAGE_IMAGE],
            max_octaves,
            "DifferenceOfGaussian",
            0,
        )?;
        detector.extract = ComputeStage::new(
            &detector.device.device,
            &[
                vk::DescriptorType::STORAGE_IMAGE,
                vk::DescriptorType::STORAGE_BUFFER,
                vk::DescriptorType::STORAGE_BUFFER,
            ],
            max_octaves,
            "ExtractKeypoints",
            size_of::<ExtractKeypointsPush>() as u32,
        )?;
        detector.orientation = ComputeStage::new(
            &detector.device.device,
            &[
                vk::DescriptorType::STORAGE_IMAGE,
                vk::DescriptorType::STORAGE_BUFFER,
                vk::DescriptorType::STORAGE_BUFFER,
            ],
            max_octaves,
            "ComputeOrientation",
            size_of::<OrientationPush>() as u32,
        )?;
        detector.descriptor = ComputeStage::new(
            &detector.device.device,
            &[vk::DescriptorType::STORAGE_IMAGE, vk::DescriptorType::STORAGE_BUFFER],
            max_octaves,
            "ComputeDescriptors",
            size_of::<DescriptorPush>() as u32,
        )?;

        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
        detector.end_of_detection_fence = unsafe {
            detector.device.device.create_fence(&fence_info, None)
        }
        .map_err(|result| Error::ResourceCreation {
            object: "end-of-detection fence",
            result,
        })?;

        detector.write_descriptor_sets(memory);
        detector.record(memory)?;
        Ok(detector)
    }

    fn begin_marker(&self, command_buffer: vk::CommandBuffer, name: &CStr) {
        if let Some(marker) = &self.device.debug_marker {
            let info = vk::DebugMarkerMarkerInfoEXT::builder().marker_name(name);
            unsafe { marker.cmd_debug_marker_begin(command_buffer, &info) };
        }
    }

    fn end_marker(&self, command_buffer: vk::CommandBuffer) {
        if let Some(marker) = &self.device.debug_marker {
            unsafe { marker.cmd_debug_marker_end(command_buffer) };
        }
    }

    /// Points every per-octave descriptor set at the current pyramid
    /// images and the current target SIFT buffer. Must run again after a
    /// memory layout change or a target buffer switch.
    fn write_descriptor_sets(&self, memory: &SiftMemory) {
        let device = &self.device.device;
        let max_octaves = memory.max_octave_count as usize;
        let sift_buffer = memory.sift_buffers[self.current_buffer_index];

        for octave in 0..memory.current_octave_count as usize {
            let octave_sampled = [vk::DescriptorImageInfo {
                sampler: self.sampler,
                image_view: memory.octave_image_views[octave],
                image_layout: vk::ImageLayout::GENERAL,
            }];
            let blur_tmp_sampled = [vk::DescriptorImageInfo {
                sampler: self.sampler,
                image_view: memory.blur_tmp_image_views[octave],
                image_layout: vk::ImageLayout::GENERAL,
            }];
            let octave_storage = [vk::DescriptorImageInfo {
                sampler: vk::Sampler::null(),
                image_view: memory.octave_image_views[octave],
                image_layout: vk::ImageLayout::GENERAL,
            }];
            let blur_tmp_storage = [vk::DescriptorImageInfo {
                sampler: vk::Sampler::null(),
                image_view: memory.blur_tmp_image_views[octave],
                image_layout: vk::ImageLayout::GENERAL,
            }];
            let dog_storage = [vk::DescriptorImageInfo {
                sampler: vk::Sampler::null(),
                image_view: memory.dog_image_views[octave],
                image_layout: vk::ImageLayout::GENERAL,
            }];
            let sift_buffer_info = [vk::DescriptorBufferInfo {
                buffer: sift_buffer,
                offset: 0,
                range: vk::WHOLE_SIZE,
            }];
            let orientation_dispatch_info = [vk::DescriptorBufferInfo {
                buffer: memory.indirect_orientation_buffer,
                offset: 0,
                range: vk::WHOLE_SIZE,
            }];
            let descriptor_dispatch_info = [vk::DescriptorBufferInfo {
                buffer: memory.indirect_descriptor_buffer,
                offset: 0,
                range: vk::WHOLE_SIZE,
            }];

            let write_image = |set: vk::DescriptorSet,
                               binding: u32,
                               descriptor_type: vk::DescriptorType,
                               info: &[vk::DescriptorImageInfo; 1]| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(binding)
                    .descriptor_type(descriptor_type)
                    .image_info(info)
                    .build()
            };
            let write_buffer =
                |set: vk::DescriptorSet, binding: u32, info: &[vk::DescriptorBufferInfo; 1]| {
                    vk::WriteDescriptorSet::builder()
                        .dst_set(set)
                        .dst_binding(binding)
                        .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                        .buffer_info(info)
                        .build()
                };

            let blur_h_set = self.blur.descriptor_sets[octave];
            let blur_v_set = self.blur.descriptor_sets[max_octaves + octave];
            let writes = [
                // Horizontal pass samples the octave image, writes the temp.
                write_image(
                    blur_h_set,
                    0,
                    vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    &octave_sampled,
                ),
                write_image(blur_h_set, 1, vk::DescriptorType::STORAGE_IMAGE, &blur_tmp_storage),
                // Vertical pass samples the temp, writes the octave image.
                write_image(
                    blur_v_set,
                    0,
                    vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    &blur_tmp_sampled,
                ),
                write_image(blur_v_set, 1, vk::DescriptorType::STORAGE_IMAGE, &octave_storage),
                write_image(
                    self.dog.descriptor_sets[octave],
                    0,
                    vk::DescriptorType::STORAGE_IMAGE,
                    &octave_storage,
                ),
                write_image(
                    self.dog.descriptor_sets[octave],
                    1,
                    vk::DescriptorType::STORAGE_IMAGE,
                    &dog_storage,
                ),
                write_image(
                    self.extract.descriptor_sets[octave],
                    0,
                    vk::DescriptorType::STORAGE_IMAGE,
                    &dog_storage,
                ),
                write_buffer(self.extract.descriptor_sets[octave], 1, &sift_buffer_info),
                write_buffer(self.extract.descriptor_sets[octave], 2, &orientation_dispatch_info),
                write_image(
                    self.orientation.descriptor_sets[octave],
                    0,
                    vk::DescriptorType::STORAGE_IMAGE,
                    &octave_storage,
                ),
                write_buffer(self.orientation.descriptor_sets[octave], 1, &sift_buffer_info),
                write_buffer(self.orientation.descriptor_sets[octave], 2, &descriptor_dispatch_info),
                write_image(
                    self.descriptor.descriptor_sets[octave],
                    0,
                    vk::DescriptorType::STORAGE_IMAGE,
                    &octave_storage,
                ),
                write_buffer(self.descriptor.descriptor_sets[octave], 1, &sift_buffer_info),
            ];
            unsafe { device.update_descriptor_sets(&writes, &[]) };
        }
    }

    fn push<T: Pod>(&self, layout: vk::PipelineLayout, constants: &T) {
        unsafe {
            self.device.device.cmd_push_constants(
                self.command_buffer,
                layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                bytemuck::bytes_of(constants),
            );
        }
    }

    fn record(&mut self, memory: &SiftMemory) -> Result<()> {
        let device = &self.device.device;
        let command_buffer = self.command_buffer;
        let octave_count = memory.current_octave_count as usize;
        let scales = self.scales_per_octave;
        let target = self.current_buffer_index;
        let gaussian_layers = scales + 3;
        let dog_layers = scales + 2;

        let begin_info = vk::CommandBufferBeginInfo::builder();
        unsafe { device.begin_command_buffer(command_buffer, &begin_info) }
            .map_err(Error::SubmitFailure)?;

        // Clear phase: section headers get (0, capacity) and the x group
        // count of every indirect-dispatch triplet drops to zero while the
        // y/z components stay at one. The counter fill must come first so
        // the capacity word survives.
        self.begin_marker(command_buffer, marker::CLEAR);
        unsafe {
            device.cmd_fill_buffer(
                command_buffer,
                memory.indirect_orientation_buffer,
                0,
                vk::WHOLE_SIZE,
                1,
            );
            device.cmd_fill_buffer(
                command_buffer,
                memory.indirect_descriptor_buffer,
                0,
                vk::WHOLE_SIZE,
                1,
            );
            for octave in 0..octave_count {
                let section_offset = memory.section_offset(target, octave);
                let capacity = memory.buffer_infos[target].section_capacities[octave];
                device.cmd_fill_buffer(
                    command_buffer,
                    memory.sift_buffers[target],
                    section_offset,
                    4,
                    0,
                );
                device.cmd_fill_buffer(
                    command_buffer,
                    memory.sift_buffers[target],
                    section_offset + 4,
                    4,
                    capacity,
                );
                let triplet_offset = INDIRECT_TRIPLET_SIZE * octave as u64;
                device.cmd_fill_buffer(
                    command_buffer,
                    memory.indirect_orientation_buffer,
                    triplet_offset,
                    4,
                    0,
                );
                device.cmd_fill_buffer(
                    command_buffer,
                    memory.indirect_descriptor_buffer,
                    triplet_offset,
                    4,
                    0,
                );
            }
            let cleared = [
                utils::buffer_barrier(
                    memory.sift_buffers[target],
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                    vk::QUEUE_FAMILY_IGNORED,
                    vk::QUEUE_FAMILY_IGNORED,
                ),
                utils::buffer_barrier(
                    memory.indirect_orientation_buffer,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                    vk::QUEUE_FAMILY_IGNORED,
                    vk::QUEUE_FAMILY_IGNORED,
                ),
                utils::buffer_barrier(
                    memory.indirect_descriptor_buffer,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                    vk::QUEUE_FAMILY_IGNORED,
                    vk::QUEUE_FAMILY_IGNORED,
                ),
            ];
            device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &cleared,
                &[],
            );
        }
        self.end_marker(command_buffer);

        // Upload the input image from staging.
        self.begin_marker(command_buffer, marker::COPY_INPUT);
        unsafe {
            let to_transfer = [utils::image_barrier(
                memory.input_image,
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
                vk::ImageLayout::GENERAL,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                1,
            )];
            device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &to_transfer,
            );
            let copy = vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
                image_extent: vk::Extent3D {
                    width: memory.current_input_width,
                    height: memory.current_input_height,
                    depth: 1,
                },
            };
            device.cmd_copy_buffer_to_image(
                command_buffer,
                memory.image_staging_buffer,
                memory.input_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[copy],
            );
            let to_compute = [utils::image_barrier(
                memory.input_image,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::SHADER_READ,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::GENERAL,
                1,
            )];
            device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &to_compute,
            );
        }
        self.end_marker(command_buffer);

        // Scale-space construction.
        self.begin_marker(command_buffer, marker::SCALE_SPACE);
        unsafe {
            device.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::COMPUTE,
                self.blur.pipeline,
            );
        }
        for octave in 0..octave_count {
            let resolution = memory.octave_resolutions[octave];
            let groups_x = (resolution.width as f32 / 8.0).ceil() as u32;
            let groups_y = (resolution.height as f32 / 8.0).ceil() as u32;

            if octave == 0 {
                // Blit the input into layer 0 (converts to the pyramid
                // format and upsamples 2x when configured), then blur it
                // in place to reach the seed blur level.
                let blit = vk::ImageBlit {
                    src_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    src_offsets: [
                        vk::Offset3D { x: 0, y: 0, z: 0 },
                        vk::Offset3D {
                            x: memory.current_input_width as i32,
                            y: memory.current_input_height as i32,
                            z: 1,
                        },
                    ],
                    dst_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    dst_offsets: [
                        vk::Offset3D { x: 0, y: 0, z: 0 },
                        vk::Offset3D {
                            x: resolution.width as i32,
                            y: resolution.height as i32,
                            z: 1,
                        },
                    ],
                };
                unsafe {
                    device.cmd_blit_image(
                        command_buffer,
                        memory.input_image,
                        vk::ImageLayout::GENERAL,
                        memory.octave_images[octave],
                        vk::ImageLayout::GENERAL,
                        &[blit],
                        vk::Filter::LINEAR,
                    );
                }
                self.record_blur_pair(memory, octave, 0, groups_x, groups_y, gaussian_layers);
            } else {
                // Downsample layer `scales` of the previous octave into
                // layer 0 of this one.
                let previous = memory.octave_resolutions[octave - 1];
                let blit = vk::ImageBlit {
                    src_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: scales,
                        layer_count: 1,
                    },
                    src_offsets: [
                        vk::Offset3D { x: 0, y: 0, z: 0 },
                        vk::Offset3D {
                            x: previous.width as i32,
                            y: previous.height as i32,
                            z: 1,
                        },
                    ],
                    dst_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    dst_offsets: [
                        vk::Offset3D { x: 0, y: 0, z: 0 },
                        vk::Offset3D {
                            x: resolution.width as i32,
                            y: resolution.height as i32,
                            z: 1,
                        },
                    ],
                };
                unsafe {
                    device.cmd_blit_image(
                        command_buffer,
                        memory.octave_images[octave - 1],
                        vk::ImageLayout::GENERAL,
                        memory.octave_images[octave],
                        vk::ImageLayout::GENERAL,
                        &[blit],
                        vk::Filter::NEAREST,
                    );
                }
            }

            for scale in 1..gaussian_layers {
                self.record_blur_pair(memory, octave, scale, groups_x, groups_y, gaussian_layers);
            }

            // Leave this octave's writes visible to downstream compute.
            unsafe {
                let done = [utils::image_barrier(
                    memory.octave_images[octave],
                    vk::AccessFlags::SHADER_WRITE,
                    vk::AccessFlags::SHADER_READ,
                    vk::ImageLayout::GENERAL,
                    vk::ImageLayout::GENERAL,
                    gaussian_layers,
                )];
                device.cmd_pipeline_barrier(
                    command_buffer,
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &done,
                );
            }
        }
        self.end_marker(command_buffer);

        // Difference of Gaussian over every octave; one barrier batch on
        // each side synchronizes the full range.
        self.begin_marker(command_buffer, marker::DOG);
        unsafe {
            let mut writable: SmallVec<[vk::ImageMemoryBarrier; 8]> = SmallVec::new();
            for octave in 0..octave_count {
                writable.push(utils::image_barrier(
                    memory.dog_images[octave],
                    vk::AccessFlags::empty(),
                    vk::AccessFlags::SHADER_WRITE,
                    vk::ImageLayout::GENERAL,
                    vk::ImageLayout::GENERAL,
                    dog_layers,
                ));
            }
            device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &writable,
            );
            device.cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::COMPUTE, self.dog.pipeline);
            for octave in 0..octave_count {
                let resolution = memory.octave_resolutions[octave];
                device.cmd_bind_descriptor_sets(
                    command_buffer,
                    vk::PipelineBindPoint::COMPUTE,
                    self.dog.pipeline_layout,
                    0,
                    &[self.dog.descriptor_sets[octave]],
                    &[],
                );
                device.cmd_dispatch(
                    command_buffer,
                    (resolution.width as f32 / 8.0).ceil() as u32,
                    (resolution.height as f32 / 8.0).ceil() as u32,
                    dog_layers,
                );
            }
            let mut readable: SmallVec<[vk::ImageMemoryBarrier; 8]> = SmallVec::new();
            for octave in 0..octave_count {
                readable.push(utils::image_barrier(
                    memory.dog_images[octave],
                    vk::AccessFlags::SHADER_WRITE,
                    vk::AccessFlags::SHADER_READ,
                    vk::ImageLayout::GENERAL,
                    vk::ImageLayout::GENERAL,
                    dog_layers,
                ));
            }
            device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &readable,
            );
        }
        self.end_marker(command_buffer);

        // Extract keypoints: one invocation per DoG texel of every
        // intermediate scale.
        self.begin_marker(command_buffer, marker::EXTRACT);
        unsafe {
            device.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::COMPUTE,
                self.extract.pipeline,
            );
            for octave in 0..octave_count {
                let resolution = memory.octave_resolutions[octave];
                let push = ExtractKeypointsPush {
                    section_offset: memory.section_offset(target, octave) as u32,
                    octave_index: octave as u32,
                    scale_factor: 2f32.powi(octave as i32) * self.scale_factor_min,
                    sigma_multiplier: 2f32.powf(1.0 / scales as f32) * self.seed_scale_sigma,
                    dog_threshold: self.dog_threshold,
                    edge_threshold: self.edge_threshold,
                };
                self.push(self.extract.pipeline_layout, &push);
                device.cmd_bind_descriptor_sets(
                    command_buffer,
                    vk::PipelineBindPoint::COMPUTE,
                    self.extract.pipeline_layout,
                    0,
                    &[self.extract.descriptor_sets[octave]],
                    &[],
                );
                device.cmd_dispatch(
                    command_buffer,
                    (resolution.width as f32 / 8.0).ceil() as u32,
                    (resolution.height as f32 / 8.0).ceil() as u32,
                    scales,
                );
            }
        }
        self.end_marker(command_buffer);

        // The orientation stage needs the keypoint counts both as its own
        // indirect group counts and as the descriptor stage's; copy the
        // triplets over so neither needs a CPU round-trip.
        unsafe {
            let extracted = [
                utils::buffer_barrier(
                    memory.indirect_orientation_buffer,
                    vk::AccessFlags::SHADER_WRITE,
                    vk::AccessFlags::TRANSFER_READ,
                    vk::QUEUE_FAMILY_IGNORED,
                    vk::QUEUE_FAMILY_IGNORED,
                ),
                utils::buffer_barrier(
                    memory.sift_buffers[target],
                    vk::AccessFlags::SHADER_WRITE,
                    vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                    vk::QUEUE_FAMILY_IGNORED,
                    vk::QUEUE_FAMILY_IGNORED,
                ),
            ];
            device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::TRANSFER | vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &extracted,
                &[],
            );
            device.cmd_copy_buffer(
                command_buffer,
                memory.indirect_orientation_buffer,
                memory.indirect_descriptor_buffer,
                &[vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: INDIRECT_TRIPLET_SIZE * octave_count as u64,
                }],
            );
            let copied = [
                utils::buffer_barrier(
                    memory.indirect_orientation_buffer,
                    vk::AccessFlags::TRANSFER_READ,
                    vk::AccessFlags::INDIRECT_COMMAND_READ,
                    vk::QUEUE_FAMILY_IGNORED,
                    vk::QUEUE_FAMILY_IGNORED,
                ),
                utils::buffer_barrier(
                    memory.indirect_descriptor_buffer,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::SHADER_WRITE,
                    vk::QUEUE_FAMILY_IGNORED,
                    vk::QUEUE_FAMILY_IGNORED,
                ),
            ];
            device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::DRAW_INDIRECT | vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &copied,
                &[],
            );
        }

        self.begin_marker(command_buffer, marker::ORIENTATION);
        unsafe {
            device.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::COMPUTE,
                self.orientation.pipeline,
            );
            for octave in 0..octave_count {
                let push = OrientationPush {
                    section_offset: memory.section_offset(target, octave) as u32,
                    octave_index: octave as u32,
                    max_orientations: self.max_orientations,
                };
                self.push(self.orientation.pipeline_layout, &push);
                device.cmd_bind_descriptor_sets(
                    command_buffer,
                    vk::PipelineBindPoint::COMPUTE,
                    self.orientation.pipeline_layout,
                    0,
                    &[self.orientation.descriptor_sets[octave]],
                    &[],
                );
                device.cmd_dispatch_indirect(
                    command_buffer,
                    memory.indirect_orientation_buffer,
                    INDIRECT_TRIPLET_SIZE * octave as u64,
                );
            }
            let oriented = [
                utils::buffer_barrier(
                    memory.sift_buffers[target],
                    vk::AccessFlags::SHADER_WRITE,
                    vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                    vk::QUEUE_FAMILY_IGNORED,
                    vk::QUEUE_FAMILY_IGNORED,
                ),
                utils::buffer_barrier(
                    memory.indirect_descriptor_buffer,
                    vk::AccessFlags::SHADER_WRITE,
                    vk::AccessFlags::INDIRECT_COMMAND_READ,
                    vk::QUEUE_FAMILY_IGNORED,
                    vk::QUEUE_FAMILY_IGNORED,
                ),
            ];
            device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::DRAW_INDIRECT,
                vk::DependencyFlags::empty(),
                &[],
                &oriented,
                &[],
            );
        }
        self.end_marker(command_buffer);

        self.begin_marker(command_buffer, marker::DESCRIPTOR);
        unsafe {
            device.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::COMPUTE,
                self.descriptor.pipeline,
            );
            for octave in 0..octave_count {
                let push = DescriptorPush {
                    section_offset: memory.section_offset(target, octave) as u32,
                    octave_index: octave as u32,
                };
                self.push(self.descriptor.pipeline_layout, &push);
                device.cmd_bind_descriptor_sets(
                    command_buffer,
                    vk::PipelineBindPoint::COMPUTE,
                    self.descriptor.pipeline_layout,
                    0,
                    &[self.descriptor.descriptor_sets[octave]],
                    &[],
                );
                device.cmd_dispatch_indirect(
                    command_buffer,
                    memory.indirect_descriptor_buffer,
                    INDIRECT_TRIPLET_SIZE * octave as u64,
                );
            }
        }
        self.end_marker(command_buffer);

        // Copy the section headers into the mapped count staging region so
        // the host can query counts without downloading the buffer.
        self.begin_marker(command_buffer, marker::COPY_HEADERS);
        unsafe {
            let described = [utils::buffer_barrier(
                memory.sift_buffers[target],
                vk::AccessFlags::SHADER_WRITE,
                vk::AccessFlags::TRANSFER_READ,
                vk::QUEUE_FAMILY_IGNORED,
                vk::QUEUE_FAMILY_IGNORED,
            )];
            device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &described,
                &[],
            );
            let region_base = memory.count_region_offset(target);
            for octave in 0..octave_count {
                device.cmd_copy_buffer(
                    command_buffer,
                    memory.sift_buffers[target],
                    memory.count_staging_buffer,
                    &[vk::BufferCopy {
                        src_offset: memory.section_offset(target, octave),
                        dst_offset: region_base + SECTION_HEADER_SIZE * octave as u64,
                        size: SECTION_HEADER_SIZE,
                    }],
                );
            }
            let host_visible = [utils::buffer_barrier(
                memory.count_staging_buffer,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::HOST_READ,
                vk::QUEUE_FAMILY_IGNORED,
                vk::QUEUE_FAMILY_IGNORED,
            )];
            device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[],
                &host_visible,
                &[],
            );
        }
        self.end_marker(command_buffer);

        unsafe { device.end_command_buffer(command_buffer) }.map_err(Error::SubmitFailure)
    }

    /// Records the horizontal and vertical blur dispatches producing layer
    /// `scale` (the horizontal pass reads layer `scale - 1`, or layer 0 for
    /// the seed scale).
    fn record_blur_pair(
        &self,
        memory: &SiftMemory,
        octave: usize,
        scale: u32,
        groups_x: u32,
        groups_y: u32,
        gaussian_layers: u32,
    ) {
        let device = &self.device.device;
        let command_buffer = self.command_buffer;
        let max_octaves = memory.max_octave_count as usize;
        let kernel = &self.gaussian_kernels[scale as usize];

        let mut push = GaussianBlurPush {
            is_vertical: 0,
            array_layer: scale.saturating_sub(1),
            kernel_size: kernel.size,
            kernel: kernel.data,
        };

        unsafe {
            let horizontal = [
                utils::image_barrier(
                    memory.blur_tmp_images[octave],
                    vk::AccessFlags::SHADER_READ,
                    vk::AccessFlags::SHADER_WRITE,
                    vk::ImageLayout::GENERAL,
                    vk::ImageLayout::GENERAL,
                    1,
                ),
                utils::image_barrier(
                    memory.octave_images[octave],
                    vk::AccessFlags::empty(),
                    vk::AccessFlags::SHADER_READ,
                    vk::ImageLayout::GENERAL,
                    vk::ImageLayout::GENERAL,
                    gaussian_layers,
                ),
            ];
            device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &horizontal,
            );
            self.push(self.blur.pipeline_layout, &push);
            device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::COMPUTE,
                self.blur.pipeline_layout,
                0,
                &[self.blur.descriptor_sets[octave]],
                &[],
            );
            device.cmd_dispatch(command_buffer, groups_x, groups_y, 1);

            let vertical = [
                utils::image_barrier(
                    memory.blur_tmp_images[octave],
                    vk::AccessFlags::SHADER_WRITE,
                    vk::AccessFlags::SHADER_READ,
                    vk::ImageLayout::GENERAL,
                    vk::ImageLayout::GENERAL,
                    1,
                ),
                utils::image_barrier(
                    memory.octave_images[octave],
                    vk::AccessFlags::SHADER_READ,
                    vk::AccessFlags::SHADER_WRITE,
                    vk::ImageLayout::GENERAL,
                    vk::ImageLayout::GENERAL,
                    gaussian_layers,
                ),
            ];
            device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &vertical,
            );
            push.is_vertical = 1;
            push.array_layer = scale;
            self.push(self.blur.pipeline_layout, &push);
            device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::COMPUTE,
                self.blur.pipeline_layout,
                0,
                &[self.blur.descriptor_sets[max_octaves + octave]],
                &[],
            );
            device.cmd_dispatch(command_buffer, groups_x, groups_y, 1);
        }
    }

    /// Re-records if needed and submits the detection command buffer to
    /// the general queue. The stage fence is signalled by the detection
    /// submission, the target buffer's fence by an empty submission that
    /// follows it in queue order.
    pub fn dispatch(
        &mut self,
        memory: &SiftMemory,
        target_buffer: usize,
        memory_layout_updated: bool,
    ) -> Result<()> {
        if memory_layout_updated || self.current_buffer_index != target_buffer {
            self.current_buffer_index = target_buffer;
            self.write_descriptor_sets(memory);
            self.record(memory)?;
        }

        let device = &self.device.device;
        let buffer_fence = memory.sift_buffer_fences[target_buffer];
        unsafe {
            device
                .reset_fences(&[self.end_of_detection_fence, buffer_fence])
                .map_err(Error::SubmitFailure)?;

            let command_buffers = [self.command_buffer];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
            device
                .queue_submit(
                    self.general_queue,
                    &[submit_info.build()],
                    self.end_of_detection_fence,
                )
                .map_err(Error::SubmitFailure)?;

            let empty_submit = vk::SubmitInfo::builder();
            device
                .queue_submit(self.general_queue, &[empty_submit.build()], buffer_fence)
                .map_err(Error::SubmitFailure)?;
        }
        Ok(())
    }
}

impl Drop for SiftDetector {
    fn drop(&mut self) {
        let device = &self.device.device;
        unsafe {
            if self.end_of_detection_fence != vk::Fence::null() {
                device.destroy_fence(self.end_of_detection_fence, None);
            }
            if self.sampler != vk::Sampler::null() {
                device.destroy_sampler(self.sampler, None);
            }
        }
        self.blur.destroy(device);
        self.dog.destroy(device);
        self.extract.destroy(device);
        self.orientation.destroy(device);
        self.descriptor.destroy(device);
        unsafe {
            if self.command_pool != vk::CommandPool::null() {
                device.destroy_command_pool(self.command_pool, None);
            }
        }
    }
}

fn create_sampler(device: &ash::Device) -> Result<vk::Sampler> {
    let sampler_info = vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::MIRRORED_REPEAT)
        .address_mode_v(vk::SamplerAddressMode::MIRRORED_REPEAT)
        .address_mode_w(vk::SamplerAddressMode::MIRRORED_REPEAT)
        .compare_op(vk::CompareOp::ALWAYS)
        .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK);
    unsafe { device.create_sampler(&sampler_info, None) }.map_err(|result| Error::ResourceCreation {
        object: "image sampler",
        result,
    })
}

mod marker {
    use std::ffi::CStr;

    const fn cstr(bytes: &[u8]) -> &CStr {
        unsafe { CStr::from_bytes_with_nul_unchecked(bytes) }
    }

    pub const CLEAR: &CStr = cstr(b"Clear data\0");
    pub const COPY_INPUT: &CStr = cstr(b"CopyInputImage\0");
    pub const SCALE_SPACE: &CStr = cstr(b"Scale space construction\0");
    pub const DOG: &CStr = cstr(b"DoG computation\0");
    pub const EXTRACT: &CStr = cstr(b"ExtractKeypoints\0");
    pub const ORIENTATION: &CStr = cstr(b"ComputeOrientation\0");
    pub const DESCRIPTOR: &CStr = cstr(b"ComputeDescriptors\0");
    pub const COPY_HEADERS: &CStr = cstr(b"CopySiftHeaders\0");
}

/// Plain normalized Gaussian taps for one separable pass: the center
/// coefficient followed by one tail (the kernel is symmetric).
fn gaussian_taps(sigma: f32) -> Vec<f32> {
    let size = ((sigma * 4.0).ceil() as usize + 1).min(MAX_GAUSSIAN_KERNEL_SIZE);
    let mut taps = vec![0f32; size];
    taps[0] = 1.0;
    let mut sum = taps[0];
    for (i, tap) in taps.iter_mut().enumerate().skip(1) {
        *tap = (-0.5 * (i as f32).powi(2) / sigma.powi(2)).exp();
        sum += 2.0 * *tap;
    }
    for tap in &mut taps {
        *tap /= sum;
    }
    taps
}

/// Folds symmetric taps into (coefficient, offset) pairs so the blur
/// shader fetches through the bilinear sampler: each tap pair collapses
/// into a single fetch at the pair's weighted centroid. Halves the fetch
/// count with no quality loss.
fn interpolate_pairs(taps: &[f32]) -> Vec<f32> {
    let mut pairs = vec![taps[0], 0.0];
    let mut data_index = 1;
    while data_index + 1 < taps.len() {
        let weight = taps[data_index] + taps[data_index + 1];
        let offset = (data_index as f32 * taps[data_index]
            + (data_index + 1) as f32 * taps[data_index + 1])
            / weight;
        pairs.push(weight);
        pairs.push(offset);
        data_index += 2;
    }
    pairs
}

/// Precomputes the per-scale separable kernels.
///
/// Scale 0 lifts the (upsampling-adjusted) input blur up to the seed
/// level; every following scale applies the increment that makes scale
/// `nb_scales` exactly twice as blurred as scale 0, so downsampling it
/// seeds the next octave.
fn build_gaussian_kernels(
    scales_per_octave: u32,
    seed_sigma: f32,
    input_blur: f32,
    upsampling: bool,
    hardware_interpolated: bool,
) -> Vec<GaussianKernel> {
    let mut kernels = Vec::with_capacity(scales_per_octave as usize + 3);
    for scale in 0..scales_per_octave + 3 {
        let sigma = if scale == 0 {
            // Upsampling doubles the apparent blur of the input.
            let first_scale_blur = if upsampling { input_blur * 2.0 } else { input_blur };
            (seed_sigma * seed_sigma - first_scale_blur * first_scale_blur).sqrt()
        } else {
            let step = 2f32.powf(1.0 / scales_per_octave as f32);
            let sigma_previous = step.powi(scale as i32 - 1) * seed_sigma;
            let sigma_total = sigma_previous * step;
            (sigma_total * sigma_total - sigma_previous * sigma_previous).sqrt()
        };

        let taps = gaussian_taps(sigma);
        let size = taps.len() as u32;
        let mut data = [0f32; MAX_GAUSSIAN_KERNEL_SIZE];
        if hardware_interpolated {
            let pairs = interpolate_pairs(&taps);
            data[..pairs.len()].copy_from_slice(&pairs);
        } else {
            data[..taps.len()].copy_from_slice(&taps);
        }
        kernels.push(GaussianKernel { size, data });
    }
    kernels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_count_follows_the_four_sigma_rule() {
        assert_eq!(gaussian_taps(1.0).len(), 5);
        assert_eq!(gaussian_taps(1.6).len(), 8);
        // Large sigmas are capped at the push-constant limit.
        assert_eq!(gaussian_taps(10.0).len(), MAX_GAUSSIAN_KERNEL_SIZE);
    }

    #[test]
    fn taps_are_normalized() {
        for sigma in [0.8, 1.2487, 1.6, 3.0] {
            let taps = gaussian_taps(sigma);
            let sum: f32 = taps[0] + 2.0 * taps[1..].iter().sum::<f32>();
            assert!((sum - 1.0).abs() < 1e-6, "sigma {}: sum {}", sigma, sum);
        }
    }

    #[test]
    fn scale_chain_doubles_the_blur_over_one_octave() {
        // sigma_s = seed * 2^(s/n); the per-scale increments must compose
        // so that scale n is exactly twice as blurred as scale 0.
        let scales = 3u32;
        let seed = 1.6f32;
        let kernels = build_gaussian_kernels(scales, seed, 0.5, true, false);
        assert_eq!(kernels.len(), scales as usize + 3);

        let mut accumulated = seed * seed;
        let step = 2f32.powf(1.0 / scales as f32);
        for scale in 1..=scales {
            let sigma_previous = step.powi(scale as i32 - 1) * seed;
            let sigma_total = sigma_previous * step;
            let increment = sigma_total * sigma_total - sigma_previous * sigma_previous;
            accumulated += increment;
        }
        assert!((accumulated.sqrt() - 2.0 * seed).abs() < 1e-4);
    }

    #[test]
    fn seed_kernel_accounts_for_upsampled_input_blur() {
        let with_upsampling = build_gaussian_kernels(3, 1.6, 0.5, true, false);
        let without = build_gaussian_kernels(3, 1.6, 0.5, false, false);
        // sqrt(1.6^2 - 1.0^2) < sqrt(1.6^2 - 0.5^2) gives a smaller seed
        // kernel when upsampling.
        assert!(with_upsampling[0].size <= without[0].size);
    }

    #[test]
    fn interpolated_pairs_preserve_pair_mass_and_centroid() {
        let taps = gaussian_taps(1.0);
        let pairs = interpolate_pairs(&taps);
        assert_eq!(pairs[0], taps[0]);
        assert_eq!(pairs[1], 0.0);
        // First folded pair combines taps 1 and 2.
        assert!((pairs[2] - (taps[1] + taps[2])).abs() < 1e-7);
        let centroid = (1.0 * taps[1] + 2.0 * taps[2]) / (taps[1] + taps[2]);
        assert!((pairs[3] - centroid).abs() < 1e-6);
    }

    #[test]
    fn interpolated_kernel_matches_the_direct_kernel() {
        // Evaluate both kernels against a signal with bilinear sampling;
        // sigma chosen so the tail folds into pairs with no leftover tap.
        let taps = gaussian_taps(1.0);
        assert_eq!(taps.len() % 2, 1);
        let pairs = interpolate_pairs(&taps);

        let signal: Vec<f64> = (0..64)
            .map(|i| ((i as f64) * 0.37).sin() * 0.5 + 0.5)
            .collect();
        let sample = |position: f64| -> f64 {
            let base = position.floor();
            let frac = position - base;
            let i0 = (base as usize).min(signal.len() - 1);
            let i1 = (i0 + 1).min(signal.len() - 1);
            signal[i0] * (1.0 - frac) + signal[i1] * frac
        };

        for center in 20..40 {
            let center = center as f64;
            let mut direct = f64::from(taps[0]) * sample(center);
            for (offset, tap) in taps.iter().enumerate().skip(1) {
                direct += f64::from(*tap) * (sample(center + offset as f64) + sample(center - offset as f64));
            }

            let mut interpolated = f64::from(pairs[0]) * sample(center);
            for pair in pairs[2..].chunks(2) {
                let (weight, offset) = (f64::from(pair[0]), f64::from(pair[1]));
                interpolated += weight * (sample(center + offset) + sample(center - offset));
            }

            assert!(
                (direct - interpolated).abs() < 1e-6,
                "divergence at {}: {} vs {}",
                center,
                direct,
                interpolated
            );
        }
    }
}
