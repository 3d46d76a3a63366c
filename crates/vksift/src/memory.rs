//! GPU memory layer.
//!
//! Owns every image and buffer of the pipeline: the scale-space pyramid,
//! the SIFT feature buffers with their octave sections, the staging
//! buffers, the match output buffers and the indirect-dispatch buffers.
//! Static resources are sized once for the configured maxima; pyramid
//! images are recreated on input-resolution changes and rebound onto the
//! previously allocated memory blocks, which are only reallocated when a
//! new requirement exceeds them.

use std::mem::size_of;
use std::sync::Arc;

use ash::vk;
use log::info;

use crate::config::{Config, PyramidPrecision};
use crate::device::utils;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::feature::{Feature, Match2NN};

pub(crate) const FEATURE_SIZE: u64 = size_of::<Feature>() as u64;
pub(crate) const MATCH_SIZE: u64 = size_of::<Match2NN>() as u64;
/// Two 32-bit words in front of every octave section: (count, capacity).
pub(crate) const SECTION_HEADER_SIZE: u64 = 8;
/// One (x, y, z) group-count triplet of an indirect dispatch entry.
pub(crate) const INDIRECT_TRIPLET_SIZE: u64 = 12;

#[derive(Debug, Clone, Copy)]
pub(crate) struct OctaveResolution {
    pub width: u32,
    pub height: u32,
}

/// Host-side bookkeeping for one GPU SIFT buffer.
pub(crate) struct SiftBufferInfo {
    /// Features are contiguous behind a single front header.
    pub is_packed: bool,
    /// Number of stored features; only meaningful when `is_packed`.
    pub packed_count: u32,
    /// Input resolution the section layout was computed for.
    pub input_width: u32,
    pub input_height: u32,
    /// Per-octave section capacities, zero for unused octaves.
    pub section_capacities: Vec<u32>,
}

pub(crate) struct SiftMemory {
    device: Arc<Device>,

    general_command_pool: vk::CommandPool,
    async_transfer_command_pool: vk::CommandPool,
    transfer_command_buffer: vk::CommandBuffer,
    transfer_fence: vk::Fence,

    pub buffer_infos: Vec<SiftBufferInfo>,
    pub sift_buffers: Vec<vk::Buffer>,
    sift_buffer_memories: Vec<vk::DeviceMemory>,
    /// One fence per SIFT buffer; exactly one GPU operation may hold a
    /// buffer at a time and it signals this fence when it finishes.
    pub sift_buffer_fences: Vec<vk::Fence>,

    pub count_staging_buffer: vk::Buffer,
    count_staging_memory: vk::DeviceMemory,
    count_staging_ptr: *mut u8,

    sift_staging_buffer: vk::Buffer,
    sift_staging_memory: vk::DeviceMemory,
    sift_staging_ptr: *mut u8,

    pub image_staging_buffer: vk::Buffer,
    image_staging_memory: vk::DeviceMemory,
    image_staging_ptr: *mut u8,

    pub input_image: vk::Image,
    pub input_image_view: vk::ImageView,
    input_image_memory: vk::DeviceMemory,
    input_image_memory_size: vk::DeviceSize,

    // The debug output image is created on demand over this block and
    // destroyed right after the download.
    output_image_memory: vk::DeviceMemory,

    pub octave_images: Vec<vk::Image>,
    pub octave_image_views: Vec<vk::ImageView>,
    octave_image_memories: Vec<vk::DeviceMemory>,
    octave_image_memory_sizes: Vec<vk::DeviceSize>,

    pub blur_tmp_images: Vec<vk::Image>,
    pub blur_tmp_image_views: Vec<vk::ImageView>,
    blur_tmp_image_memories: Vec<vk::DeviceMemory>,
    blur_tmp_image_memory_sizes: Vec<vk::DeviceSize>,

    pub dog_images: Vec<vk::Image>,
    pub dog_image_views: Vec<vk::ImageView>,
    dog_image_memories: Vec<vk::DeviceMemory>,
    dog_image_memory_sizes: Vec<vk::DeviceSize>,

    pub current_input_width: u32,
    pub current_input_height: u32,
    pub current_octave_count: u32,
    pub octave_resolutions: Vec<OctaveResolution>,

    /// Updated from buffer A's feature count on every matching dispatch.
    pub current_match_count: u32,
    pub match_buffer: vk::Buffer,
    match_buffer_memory: vk::DeviceMemory,
    pub match_staging_buffer: vk::Buffer,
    match_staging_memory: vk::DeviceMemory,
    match_staging_ptr: *mut u8,

    pub indirect_orientation_buffer: vk::Buffer,
    indirect_orientation_memory: vk::DeviceMemory,
    pub indirect_descriptor_buffer: vk::Buffer,
    indirect_descriptor_memory: vk::DeviceMemory,
    pub indirect_matcher_buffer: vk::Buffer,
    indirect_matcher_memory: vk::DeviceMemory,

    general_queue: vk::Queue,
    async_transfer_queue: vk::Queue,

    pub max_image_size: u32,
    pub max_octave_count: u32,
    pub scales_per_octave: u32,
    pub buffer_count: u32,
    pub max_features_per_buffer: u32,
    pub pyramid_format: vk::Format,
    pub use_upsampling: bool,
}

impl SiftMemory {
    pub fn new(device: Arc<Device>, config: &Config) -> Result<Self> {
        // Default input resolution: the square holding the configured
        // maximum pixel count, so that every allocation below covers the
        // largest input a caller may submit.
        let default_dim = (config.input_image_max_size as f32).sqrt().ceil() as u32;
        let max_image_size = default_dim * default_dim;

        // With a square default input, the octave count is bounded by the
        // number of successive 2x downsamplings that keep the smallest
        // dimension at 16 pixels or more.
        let mut max_octave_count = ((default_dim as f32).log2().floor() as i32 - 4
            + if config.use_input_upsampling { 2 } else { 1 })
        .max(1) as u32;
        if config.nb_octaves > 0 && u32::from(config.nb_octaves) < max_octave_count {
            max_octave_count = u32::from(config.nb_octaves);
        }

        let pyramid_format = match config.pyramid_precision {
            PyramidPrecision::Float16 => vk::Format::R16_SFLOAT,
            PyramidPrecision::Float32 => vk::Format::R32_SFLOAT,
        };

        let general_queue = device.general_queues[0];
        let async_transfer_queue = if device.async_transfer_available {
            device.async_transfer_queues[0]
        } else {
            vk::Queue::null()
        };

        let buffer_count = config.sift_buffer_count;
        let mut memory = Self {
            device,
            general_command_pool: vk::CommandPool::null(),
            async_transfer_command_pool: vk::CommandPool::null(),
            transfer_command_buffer: vk::CommandBuffer::null(),
            transfer_fence: vk::Fence::null(),
            buffer_infos: Vec::new(),
            sift_buffers: vec![vk::Buffer::null(); buffer_count as usize],
            sift_buffer_memories: vec![vk::DeviceMemory::null(); buffer_count as usize],
            sift_buffer_fences: Vec::new(),
            count_staging_buffer: vk::Buffer::null(),
            count_staging_memory: vk::DeviceMemory::null(),
            count_staging_ptr: std::ptr::null_mut(),
            sift_staging_buffer: vk::Buffer::null(),
            sift_staging_memory: vk::DeviceMemory::null(),
            sift_staging_ptr: std::ptr::null_mut(),
            image_staging_buffer: vk::Buffer::null(),
            image_staging_memory: vk::DeviceMemory::null(),
            image_staging_ptr: std::ptr::null_mut(),
            input_image: vk::Image::null(),
            input_image_view: vk::ImageView::null(),
            input_image_memory: vk::DeviceMemory::null(),
            input_image_memory_size: 0,
            output_image_memory: vk::DeviceMemory::null(),
            octave_images: vec![vk::Image::null(); max_octave_count as usize],
            octave_image_views: vec![vk::ImageView::null(); max_octave_count as usize],
            octave_image_memories: vec![vk::DeviceMemory::null(); max_octave_count as usize],
            octave_image_memory_sizes: vec![0; max_octave_count as usize],
            blur_tmp_images: vec![vk::Image::null(); max_octave_count as usize],
            blur_tmp_image_views: vec![vk::ImageView::null(); max_octave_count as usize],
            blur_tmp_image_memories: vec![vk::DeviceMemory::null(); max_octave_count as usize],
            blur_tmp_image_memory_sizes: vec![0; max_octave_count as usize],
            dog_images: vec![vk::Image::null(); max_octave_count as usize],
            dog_image_views: vec![vk::ImageView::null(); max_octave_count as usize],
            dog_image_memories: vec![vk::DeviceMemory::null(); max_octave_count as usize],
            dog_image_memory_sizes: vec![0; max_octave_count as usize],
            current_input_width: default_dim,
            current_input_height: default_dim,
            current_octave_count: 0,
            octave_resolutions: Vec::new(),
            current_match_count: 0,
            match_buffer: vk::Buffer::null(),
            match_buffer_memory: vk::DeviceMemory::null(),
            match_staging_buffer: vk::Buffer::null(),
            match_staging_memory: vk::DeviceMemory::null(),
            match_staging_ptr: std::ptr::null_mut(),
            indirect_orientation_buffer: vk::Buffer::null(),
            indirect_orientation_memory: vk::DeviceMemory::null(),
            indirect_descriptor_buffer: vk::Buffer::null(),
            indirect_descriptor_memory: vk::DeviceMemory::null(),
            indirect_matcher_buffer: vk::Buffer::null(),
            indirect_matcher_memory: vk::DeviceMemory::null(),
            general_queue,
            async_transfer_queue,
            max_image_size,
            max_octave_count,
            scales_per_octave: u32::from(config.nb_scales_per_octave),
            buffer_count,
            max_features_per_buffer: config.max_nb_sift_per_buffer,
            pyramid_format,
            use_upsampling: config.use_input_upsampling,
        };

        memory.update_scale_space_info();
        for index in 0..buffer_count as usize {
            memory.buffer_infos.push(SiftBufferInfo {
                is_packed: false,
                packed_count: 0,
                input_width: 0,
                input_height: 0,
                section_capacities: vec![0; max_octave_count as usize],
            });
            memory.update_buffer_info(index);
        }

        memory.setup_command_objects()?;
        memory.setup_static_objects()?;
        memory.setup_dynamic_objects()?;
        Ok(memory)
    }

    fn vk(&self) -> &ash::Device {
        &self.device.device
    }

    fn setup_command_objects(&mut self) -> Result<()> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(self.device.general_queue_family);
        self.general_command_pool =
            unsafe { self.vk().create_command_pool(&pool_info, None) }.map_err(|result| {
                Error::ResourceCreation {
                    object: "general command pool",
                    result,
                }
            })?;

        let mut transfer_pool = self.general_command_pool;
        if self.device.async_transfer_available {
            let async_pool_info = vk::CommandPoolCreateInfo::builder()
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                .queue_family_index(self.device.async_transfer_queue_family);
            self.async_transfer_command_pool =
                unsafe { self.vk().create_command_pool(&async_pool_info, None) }.map_err(|result| {
                    Error::ResourceCreation {
                        object: "async transfer command pool",
                        result,
                    }
                })?;
            transfer_pool = self.async_transfer_command_pool;
        }

        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(transfer_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        self.transfer_command_buffer = unsafe { self.vk().allocate_command_buffers(&allocate_info) }
            .map_err(|result| Error::ResourceCreation {
                object: "transfer command buffer",
                result,
            })?[0];

        let fence_info = vk::FenceCreateInfo::builder();
        self.transfer_fence = unsafe { self.vk().create_fence(&fence_info, None) }.map_err(|result| {
            Error::ResourceCreation {
                object: "transfer fence",
                result,
            }
        })?;

        // Buffer fences start signaled: a freshly created buffer is idle.
        let signaled_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
        for _ in 0..self.buffer_count {
            let fence = unsafe { self.vk().create_fence(&signaled_info, None) }.map_err(|result| {
                Error::ResourceCreation {
                    object: "SIFT buffer fence",
                    result,
                }
            })?;
            self.sift_buffer_fences.push(fence);
        }
        Ok(())
    }

    fn build_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> Result<(vk::Buffer, vk::DeviceMemory)> {
        let buffer = utils::create_buffer(self.vk(), size, usage)?;
        let requirements = unsafe { self.vk().get_buffer_memory_requirements(buffer) };
        let memory_type = utils::find_memory_type(&self.device.memory_properties, requirements, memory_flags)
            .ok_or(Error::AllocationFailure {
                size: requirements.size,
                result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            })?;
        let memory = utils::allocate_memory(self.vk(), requirements.size, memory_type)?;
        unsafe { self.vk().bind_buffer_memory(buffer, memory, 0) }.map_err(|result| {
            Error::ResourceCreation {
                object: "buffer memory binding",
                result,
            }
        })?;
        Ok((buffer, memory))
    }

    fn map(&self, memory: vk::DeviceMemory) -> Result<*mut u8> {
        let ptr = unsafe { self.vk().map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()) }
            .map_err(|result| Error::ResourceCreation {
                object: "staging buffer mapping",
                result,
            })?;
        Ok(ptr.cast())
    }

    fn setup_static_objects(&mut self) -> Result<()> {
        let staging_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED;
        let transfer_usage = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;

        // Image staging covers the biggest download: a float32 image at the
        // (possibly upsampled) octave 0 resolution.
        let octave0 = self.octave_resolutions[0];
        let image_staging_size = 4 * u64::from(octave0.width) * u64::from(octave0.height);
        (self.image_staging_buffer, self.image_staging_memory) =
            self.build_buffer(image_staging_size, transfer_usage, staging_flags)?;
        self.image_staging_ptr = self.map(self.image_staging_memory)?;

        // Reserve memory for the debug output image. The image itself is
        // recreated over this block for every download and destroyed right
        // after, so only the allocation survives here.
        let output_usage = vk::ImageUsageFlags::STORAGE
            | vk::ImageUsageFlags::TRANSFER_SRC
            | vk::ImageUsageFlags::TRANSFER_DST;
        let probe_image = utils::create_image(
            self.vk(),
            vk::Format::R32_SFLOAT,
            octave0.width,
            octave0.height,
            1,
            output_usage,
        )?;
        let probe_requirements = unsafe { self.vk().get_image_memory_requirements(probe_image) };
        unsafe { self.vk().destroy_image(probe_image, None) };
        let output_memory_type = utils::find_memory_type(
            &self.device.memory_properties,
            probe_requirements,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .ok_or(Error::AllocationFailure {
            size: probe_requirements.size,
            result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
        })?;
        self.output_image_memory =
            utils::allocate_memory(self.vk(), probe_requirements.size, output_memory_type)?;

        // SIFT buffers: per-octave section headers plus the feature budget.
        let sift_buffer_size = SECTION_HEADER_SIZE * u64::from(self.max_octave_count)
            + u64::from(self.max_features_per_buffer) * FEATURE_SIZE;
        for index in 0..self.buffer_count as usize {
            let (buffer, buffer_memory) = self.build_buffer(
                sift_buffer_size,
                vk::BufferUsageFlags::STORAGE_BUFFER | transfer_usage,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )?;
            self.sift_buffers[index] = buffer;
            self.sift_buffer_memories[index] = buffer_memory;
        }

        let count_staging_size =
            SECTION_HEADER_SIZE * u64::from(self.max_octave_count) * u64::from(self.buffer_count);
        (self.count_staging_buffer, self.count_staging_memory) =
            self.build_buffer(count_staging_size, transfer_usage, staging_flags)?;
        self.count_staging_ptr = self.map(self.count_staging_memory)?;

        let sift_staging_size = u64::from(self.max_features_per_buffer) * FEATURE_SIZE;
        (self.sift_staging_buffer, self.sift_staging_memory) =
            self.build_buffer(sift_staging_size, transfer_usage, staging_flags)?;
        self.sift_staging_ptr = self.map(self.sift_staging_memory)?;

        let match_buffer_size = u64::from(self.max_features_per_buffer) * MATCH_SIZE;
        (self.match_buffer, self.match_buffer_memory) = self.build_buffer(
            match_buffer_size,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        (self.match_staging_buffer, self.match_staging_memory) =
            self.build_buffer(match_buffer_size, transfer_usage, staging_flags)?;
        self.match_staging_ptr = self.map(self.match_staging_memory)?;

        let indirect_usage = vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::INDIRECT_BUFFER
            | transfer_usage;
        let indirect_size = INDIRECT_TRIPLET_SIZE * u64::from(self.max_octave_count);
        (self.indirect_orientation_buffer, self.indirect_orientation_memory) = self.build_buffer(
            indirect_size,
            indirect_usage,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        (self.indirect_descriptor_buffer, self.indirect_descriptor_memory) = self.build_buffer(
            indirect_size,
            indirect_usage,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        (self.indirect_matcher_buffer, self.indirect_matcher_memory) = self.build_buffer(
            INDIRECT_TRIPLET_SIZE,
            indirect_usage,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        Ok(())
    }

    /// (Re)creates the pyramid images for the current input resolution,
    /// binding them onto the existing memory blocks. A block is only
    /// reallocated when the new image's requirement exceeds it.
    fn setup_dynamic_objects(&mut self) -> Result<()> {
        let pyramid_usage = vk::ImageUsageFlags::STORAGE
            | vk::ImageUsageFlags::TRANSFER_SRC
            | vk::ImageUsageFlags::TRANSFER_DST
            | vk::ImageUsageFlags::SAMPLED;

        // Input image.
        self.input_image = utils::create_image(
            self.vk(),
            vk::Format::R8_UNORM,
            self.current_input_width,
            self.current_input_height,
            1,
            vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST,
        )?;
        let requirements = unsafe { self.vk().get_image_memory_requirements(self.input_image) };
        if requirements.size > self.input_image_memory_size {
            if self.input_image_memory != vk::DeviceMemory::null() {
                unsafe { self.vk().free_memory(self.input_image_memory, None) };
                self.input_image_memory = vk::DeviceMemory::null();
            }
            let memory_type = utils::find_memory_type(
                &self.device.memory_properties,
                requirements,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .ok_or(Error::AllocationFailure {
                size: requirements.size,
                result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            })?;
            self.input_image_memory = utils::allocate_memory(self.vk(), requirements.size, memory_type)?;
            self.input_image_memory_size = requirements.size;
            info!(
                "input image ({}, {}) realloc",
                self.current_input_width, self.current_input_height
            );
        }
        unsafe { self.vk().bind_image_memory(self.input_image, self.input_image_memory, 0) }.map_err(
            |result| Error::ResourceCreation {
                object: "input image memory binding",
                result,
            },
        )?;
        self.input_image_view = utils::create_image_view(
            self.vk(),
            self.input_image,
            vk::ImageViewType::TYPE_2D,
            vk::Format::R8_UNORM,
            1,
        )?;

        // Per-octave images: temporary blur target, Gaussian scales, DoG.
        for octave in 0..self.current_octave_count as usize {
            let resolution = self.octave_resolutions[octave];
            for (kind, layers) in [
                (0usize, 1u32),
                (1, self.scales_per_octave + 3),
                (2, self.scales_per_octave + 2),
            ] {
                let (images, views, memories, sizes, label) = match kind {
                    0 => (
                        &mut self.blur_tmp_images,
                        &mut self.blur_tmp_image_views,
                        &mut self.blur_tmp_image_memories,
                        &mut self.blur_tmp_image_memory_sizes,
                        "blur temp image",
                    ),
                    1 => (
                        &mut self.octave_images,
                        &mut self.octave_image_views,
                        &mut self.octave_image_memories,
                        &mut self.octave_image_memory_sizes,
                        "octave image",
                    ),
                    _ => (
                        &mut self.dog_images,
                        &mut self.dog_image_views,
                        &mut self.dog_image_memories,
                        &mut self.dog_image_memory_sizes,
                        "DoG image",
                    ),
                };

                let image = utils::create_image(
                    &self.device.device,
                    self.pyramid_format,
                    resolution.width,
                    resolution.height,
                    layers,
                    pyramid_usage,
                )?;
                images[octave] = image;
                let requirements = unsafe { self.device.device.get_image_memory_requirements(image) };
                if requirements.size > sizes[octave] {
                    if memories[octave] != vk::DeviceMemory::null() {
                        unsafe { self.device.device.free_memory(memories[octave], None) };
                        memories[octave] = vk::DeviceMemory::null();
                    }
                    let memory_type = utils::find_memory_type(
                        &self.device.memory_properties,
                        requirements,
                        vk::MemoryPropertyFlags::DEVICE_LOCAL,
                    )
                    .ok_or(Error::AllocationFailure {
                        size: requirements.size,
                        result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
                    })?;
                    memories[octave] =
                        utils::allocate_memory(&self.device.device, requirements.size, memory_type)?;
                    sizes[octave] = requirements.size;
                    info!(
                        "{} (octave {}) ({}, {}) realloc",
                        label, octave, resolution.width, resolution.height
                    );
                }
                unsafe { self.device.device.bind_image_memory(image, memories[octave], 0) }.map_err(
                    |result| Error::ResourceCreation {
                        object: "pyramid image memory binding",
                        result,
                    },
                )?;
                views[octave] = utils::create_image_view(
                    &self.device.device,
                    image,
                    vk::ImageViewType::TYPE_2D_ARRAY,
                    self.pyramid_format,
                    layers,
                )?;
            }
        }

        self.apply_initial_layouts()
    }

    /// Transitions the freshly created images from undefined to general.
    /// One top-of-pipe to compute barrier covers them all.
    fn apply_initial_layouts(&self) -> Result<()> {
        let command_buffer = utils::begin_instant_command_buffer(self.vk(), self.general_command_pool)?;

        let mut barriers = Vec::with_capacity(1 + 3 * self.current_octave_count as usize);
        barriers.push(utils::image_barrier(
            self.input_image,
            vk::AccessFlags::empty(),
            vk::AccessFlags::SHADER_WRITE,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::GENERAL,
            1,
        ));
        for octave in 0..self.current_octave_count as usize {
            barriers.push(utils::image_barrier(
                self.blur_tmp_images[octave],
                vk::AccessFlags::empty(),
                vk::AccessFlags::SHADER_WRITE,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::GENERAL,
                1,
            ));
            barriers.push(utils::image_barrier(
                self.octave_images[octave],
                vk::AccessFlags::empty(),
                vk::AccessFlags::SHADER_READ,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::GENERAL,
                self.scales_per_octave + 3,
            ));
            barriers.push(utils::image_barrier(
                self.dog_images[octave],
                vk::AccessFlags::empty(),
                vk::AccessFlags::SHADER_WRITE,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::GENERAL,
                self.scales_per_octave + 2,
            ));
        }
        unsafe {
            self.vk().cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &barriers,
            );
        }

        utils::end_instant_command_buffer(
            self.vk(),
            self.general_queue,
            self.general_command_pool,
            command_buffer,
        )
    }

    /// Recomputes the octave count and per-octave resolutions for the
    /// current input resolution.
    fn update_scale_space_info(&mut self) {
        let lowest_dim = self.current_input_width.min(self.current_input_height);
        let raw_octaves = (lowest_dim as f32).log2().floor() as i32 - 4
            + if self.use_upsampling { 2 } else { 1 };
        self.current_octave_count = (raw_octaves.max(1) as u32).min(self.max_octave_count);

        let scale_factor_min: f32 = if self.use_upsampling { 0.5 } else { 1.0 };
        self.octave_resolutions.clear();
        for octave in 0..self.current_octave_count {
            let inv_scale = 1.0 / (2f32.powi(octave as i32) * scale_factor_min);
            let width = (inv_scale * self.current_input_width as f32) as u32;
            let height = (inv_scale * self.current_input_height as f32) as u32;
            self.octave_resolutions.push(OctaveResolution { width, height });
            info!("octave {} resolution: ({}, {})", octave, width, height);
        }
    }

    /// Recomputes a buffer's section layout for the current octave count.
    ///
    /// Each octave image has a quarter of the area of the octave below it,
    /// so successive sections get successive halves of the feature budget,
    /// scaled so the capacities sum back to the budget.
    fn update_buffer_info(&mut self, buffer_index: usize) {
        let current_octaves = self.current_octave_count;
        let max_features = self.max_features_per_buffer as f32;
        let info = &mut self.buffer_infos[buffer_index];
        info.is_packed = false;
        info.packed_count = 0;
        info.input_width = self.current_input_width;
        info.input_height = self.current_input_height;
        info.section_capacities = vec![0; self.max_octave_count as usize];

        // Sum of the first O halves of x is x - x/2^O.
        let halves_sum = max_features - 0.5f32.powi(current_octaves as i32) * max_features;
        let corrector = max_features / halves_sum;
        for octave in 0..current_octaves as usize {
            let capacity = (0.5f32.powi(octave as i32 + 1) * max_features * corrector).round() as u32;
            info.section_capacities[octave] = capacity;
            info!("octave {} section capacity: {}", octave, capacity);
        }
    }

    /// Byte offset of an octave's section inside a SIFT buffer.
    pub fn section_offset(&self, buffer_index: usize, octave: usize) -> vk::DeviceSize {
        let info = &self.buffer_infos[buffer_index];
        let mut offset = 0;
        for capacity in &info.section_capacities[..octave] {
            offset += SECTION_HEADER_SIZE + u64::from(*capacity) * FEATURE_SIZE;
        }
        offset
    }

    /// Byte offset of a buffer's region inside the count staging buffer.
    pub fn count_region_offset(&self, buffer_index: usize) -> vk::DeviceSize {
        SECTION_HEADER_SIZE * u64::from(self.max_octave_count) * buffer_index as u64
    }

    /// Copies the input bytes into the staging buffer and updates the
    /// memory layout for the input resolution. Returns true when the
    /// layout changed and descriptors referring to pyramid images must be
    /// rebound.
    pub fn prepare_for_detection(
        &mut self,
        image_data: &[u8],
        width: u32,
        height: u32,
        target_buffer: usize,
    ) -> Result<bool> {
        let upsample_bias = if self.use_upsampling { 2 } else { 1 };
        if (width.min(height) as f32).log2().floor() as i32 - 4 + upsample_bias < 1 {
            return Err(Error::InvalidArgument(format!(
                "input resolution ({}x{}) is too small for a 16-pixel smallest octave",
                width, height
            )));
        }
        let pixel_count = (width as usize) * (height as usize);
        if image_data.len() < pixel_count {
            return Err(Error::InvalidArgument(format!(
                "input slice holds {} bytes but the resolution needs {}",
                image_data.len(),
                pixel_count
            )));
        }

        let mut layout_updated = false;
        if self.current_input_width != width || self.current_input_height != height {
            self.current_input_width = width;
            self.current_input_height = height;
            self.update_scale_space_info();

            // Recreate the pyramid over the already-allocated blocks.
            unsafe {
                if self.input_image_view != vk::ImageView::null() {
                    self.device.device.destroy_image_view(self.input_image_view, None);
                    self.input_image_view = vk::ImageView::null();
                }
                if self.input_image != vk::Image::null() {
                    self.device.device.destroy_image(self.input_image, None);
                    self.input_image = vk::Image::null();
                }
            }
            for octave in 0..self.max_octave_count as usize {
                unsafe {
                    let device = &self.device.device;
                    for views in [
                        &mut self.blur_tmp_image_views,
                        &mut self.octave_image_views,
                        &mut self.dog_image_views,
                    ] {
                        if views[octave] != vk::ImageView::null() {
                            device.destroy_image_view(views[octave], None);
                            views[octave] = vk::ImageView::null();
                        }
                    }
                    for images in [
                        &mut self.blur_tmp_images,
                        &mut self.octave_images,
                        &mut self.dog_images,
                    ] {
                        if images[octave] != vk::Image::null() {
                            device.destroy_image(images[octave], None);
                            images[octave] = vk::Image::null();
                        }
                    }
                }
            }
            self.setup_dynamic_objects()?;
            layout_updated = true;
        }

        let info = &self.buffer_infos[target_buffer];
        if info.input_width != self.current_input_width || info.input_height != self.current_input_height {
            self.update_buffer_info(target_buffer);
            layout_updated = true;
        }

        self.invalidate(self.image_staging_memory)?;
        unsafe {
            std::ptr::copy_nonoverlapping(image_data.as_ptr(), self.image_staging_ptr, pixel_count);
        }
        self.flush(self.image_staging_memory)?;

        Ok(layout_updated)
    }

    /// Reads a buffer's feature count from the mapped count staging
    /// regions. The GPU is not involved.
    pub fn buffer_feature_count(&self, buffer_index: usize) -> Result<u32> {
        self.invalidate(self.count_staging_memory)?;
        let info = &self.buffer_infos[buffer_index];
        let region = self.count_region_offset(buffer_index) as usize;
        if info.is_packed {
            let count = self.read_count_word(region);
            Ok(count.min(self.max_features_per_buffer))
        } else {
            let mut total = 0;
            for octave in 0..self.current_octave_count as usize {
                let count = self.read_count_word(region + octave * SECTION_HEADER_SIZE as usize);
                total += count.min(info.section_capacities[octave]);
            }
            Ok(total)
        }
    }

    fn read_count_word(&self, byte_offset: usize) -> u32 {
        unsafe { (self.count_staging_ptr.add(byte_offset) as *const u32).read() }
    }

    fn write_count_region(&self, buffer_index: usize, count: u32) -> Result<()> {
        let region = self.count_region_offset(buffer_index) as usize;
        unsafe {
            (self.count_staging_ptr.add(region) as *mut u32).write(count);
            (self.count_staging_ptr.add(region + 4) as *mut u32).write(self.max_features_per_buffer);
        }
        self.flush(self.count_staging_memory)
    }

    /// Downloads the stored features of a buffer over the SIFT staging
    /// buffer. Runs on the async transfer queue when available.
    pub fn download_features(&mut self, buffer_index: usize) -> Result<Vec<Feature>> {
        self.invalidate(self.count_staging_memory)?;
        let region = self.count_region_offset(buffer_index) as usize;
        let info = &self.buffer_infos[buffer_index];
        let buffer = self.sift_buffers[buffer_index];

        let mut copies = Vec::new();
        let total: u32;
        if info.is_packed {
            total = info.packed_count;
            if total > 0 {
                copies.push(vk::BufferCopy {
                    src_offset: SECTION_HEADER_SIZE,
                    dst_offset: 0,
                    size: u64::from(total) * FEATURE_SIZE,
                });
            }
        } else {
            let mut dst_offset = 0;
            let mut sum = 0;
            for octave in 0..self.current_octave_count as usize {
                let count = self
                    .read_count_word(region + octave * SECTION_HEADER_SIZE as usize)
                    .min(info.section_capacities[octave]);
                if count > 0 {
                    copies.push(vk::BufferCopy {
                        src_offset: self.section_offset(buffer_index, octave) + SECTION_HEADER_SIZE,
                        dst_offset,
                        size: u64::from(count) * FEATURE_SIZE,
                    });
                    dst_offset += u64::from(count) * FEATURE_SIZE;
                }
                sum += count;
            }
            total = sum;
        }

        if total > 0 {
            self.record_and_run_transfer(|device, command_buffer| unsafe {
                device.cmd_copy_buffer(command_buffer, buffer, self.sift_staging_buffer, &copies);
            })?;
        }

        self.invalidate(self.sift_staging_memory)?;
        let features = unsafe {
            std::slice::from_raw_parts(self.sift_staging_ptr as *const Feature, total as usize)
        };
        Ok(features.to_vec())
    }

    /// Uploads caller features into a buffer in packed form.
    pub fn upload_features(&mut self, buffer_index: usize, features: &[Feature]) -> Result<()> {
        let count = features.len() as u32;
        let byte_len = features.len() * FEATURE_SIZE as usize;

        self.invalidate(self.sift_staging_memory)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                features.as_ptr().cast::<u8>(),
                self.sift_staging_ptr,
                byte_len,
            );
        }
        self.flush(self.sift_staging_memory)?;

        let buffer = self.sift_buffers[buffer_index];
        let header = [count, self.max_features_per_buffer];
        let staging = self.sift_staging_buffer;
        self.record_and_run_transfer(|device, command_buffer| unsafe {
            device.cmd_update_buffer(command_buffer, buffer, 0, bytemuck::cast_slice(&header));
            if count > 0 {
                device.cmd_copy_buffer(
                    command_buffer,
                    staging,
                    buffer,
                    &[vk::BufferCopy {
                        src_offset: 0,
                        dst_offset: SECTION_HEADER_SIZE,
                        size: byte_len as u64,
                    }],
                );
            }
        })?;

        let info = &mut self.buffer_infos[buffer_index];
        info.is_packed = true;
        info.packed_count = count;
        self.write_count_region(buffer_index, count)
    }

    /// Rearranges a sectioned buffer into packed form: octave sections are
    /// concatenated behind a single front header. The features bounce
    /// through the SIFT staging buffer so no copy region overlaps.
    fn pack_buffer(&mut self, buffer_index: usize) -> Result<()> {
        if self.buffer_infos[buffer_index].is_packed {
            return Ok(());
        }

        self.invalidate(self.count_staging_memory)?;
        let region = self.count_region_offset(buffer_index) as usize;
        let mut gather = Vec::new();
        let mut dst_offset = 0u64;
        let mut total = 0u32;
        for octave in 0..self.current_octave_count as usize {
            let count = self
                .read_count_word(region + octave * SECTION_HEADER_SIZE as usize)
                .min(self.buffer_infos[buffer_index].section_capacities[octave]);
            if count > 0 {
                gather.push(vk::BufferCopy {
                    src_offset: self.section_offset(buffer_index, octave) + SECTION_HEADER_SIZE,
                    dst_offset,
                    size: u64::from(count) * FEATURE_SIZE,
                });
                dst_offset += u64::from(count) * FEATURE_SIZE;
            }
            total += count;
        }

        let buffer = self.sift_buffers[buffer_index];
        let staging = self.sift_staging_buffer;
        let header = [total, self.max_features_per_buffer];
        let command_buffer = utils::begin_instant_command_buffer(self.vk(), self.general_command_pool)?;
        unsafe {
            let device = self.vk();
            if !gather.is_empty() {
                device.cmd_copy_buffer(command_buffer, buffer, staging, &gather);
            }
            let barriers = [
                utils::buffer_barrier(
                    staging,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::TRANSFER_READ,
                    vk::QUEUE_FAMILY_IGNORED,
                    vk::QUEUE_FAMILY_IGNORED,
                ),
                utils::buffer_barrier(
                    buffer,
                    vk::AccessFlags::TRANSFER_READ,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::QUEUE_FAMILY_IGNORED,
                    vk::QUEUE_FAMILY_IGNORED,
                ),
            ];
            device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &barriers,
                &[],
            );
            device.cmd_update_buffer(command_buffer, buffer, 0, bytemuck::cast_slice(&header));
            if total > 0 {
                device.cmd_copy_buffer(
                    command_buffer,
                    staging,
                    buffer,
                    &[vk::BufferCopy {
                        src_offset: 0,
                        dst_offset: SECTION_HEADER_SIZE,
                        size: u64::from(total) * FEATURE_SIZE,
                    }],
                );
            }
        }
        utils::end_instant_command_buffer(
            self.vk(),
            self.general_queue,
            self.general_command_pool,
            command_buffer,
        )?;

        let info = &mut self.buffer_infos[buffer_index];
        info.is_packed = true;
        info.packed_count = total;
        self.write_count_region(buffer_index, total)
    }

    /// Packs both operands and fills the matcher's indirect-dispatch
    /// triplet from buffer A's feature count.
    pub fn prepare_for_matching(&mut self, buffer_a: usize, buffer_b: usize) -> Result<()> {
        self.pack_buffer(buffer_a)?;
        if buffer_b != buffer_a {
            self.pack_buffer(buffer_b)?;
        }
        self.current_match_count = self.buffer_infos[buffer_a].packed_count;

        let group_counts = [(self.current_match_count + 63) / 64, 1u32, 1u32];
        let indirect_buffer = self.indirect_matcher_buffer;
        let command_buffer = utils::begin_instant_command_buffer(self.vk(), self.general_command_pool)?;
        unsafe {
            self.vk().cmd_update_buffer(
                command_buffer,
                indirect_buffer,
                0,
                bytemuck::cast_slice(&group_counts),
            );
        }
        utils::end_instant_command_buffer(
            self.vk(),
            self.general_queue,
            self.general_command_pool,
            command_buffer,
        )
    }

    /// Reads the match records the matcher left in the mapped staging
    /// buffer. The GPU is not involved.
    pub fn download_matches(&mut self) -> Result<Vec<Match2NN>> {
        self.invalidate(self.match_staging_memory)?;
        let matches = unsafe {
            std::slice::from_raw_parts(
                self.match_staging_ptr as *const Match2NN,
                self.current_match_count as usize,
            )
        };
        Ok(matches.to_vec())
    }

    /// Downloads one layer of a pyramid image as float32 texels, for
    /// debugging and visualization. An ephemeral float32 image bound to
    /// the preallocated output block converts from the pyramid format.
    pub fn download_pyramid_image(
        &mut self,
        octave: u8,
        scale: u8,
        is_dog: bool,
    ) -> Result<Vec<f32>> {
        if u32::from(octave) >= self.current_octave_count {
            return Err(Error::InvalidArgument(format!(
                "octave index {} out of range (current octave count: {})",
                octave, self.current_octave_count
            )));
        }
        let scale_count = self.scales_per_octave + if is_dog { 2 } else { 3 };
        if u32::from(scale) >= scale_count {
            return Err(Error::InvalidArgument(format!(
                "scale index {} out of range ({} {} scales)",
                scale,
                scale_count,
                if is_dog { "DoG" } else { "blurred" }
            )));
        }

        let resolution = self.octave_resolutions[octave as usize];
        let source_image = if is_dog {
            self.dog_images[octave as usize]
        } else {
            self.octave_images[octave as usize]
        };

        let output_image = utils::create_image(
            self.vk(),
            vk::Format::R32_SFLOAT,
            resolution.width,
            resolution.height,
            1,
            vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST,
        )?;
        let bind_result =
            unsafe { self.vk().bind_image_memory(output_image, self.output_image_memory, 0) };
        if let Err(result) = bind_result {
            unsafe { self.vk().destroy_image(output_image, None) };
            return Err(Error::ResourceCreation {
                object: "output image memory binding",
                result,
            });
        }

        let run = || -> Result<()> {
            let command_buffer =
                utils::begin_instant_command_buffer(self.vk(), self.general_command_pool)?;
            unsafe {
                let device = self.vk();
                let to_transfer_dst = [utils::image_barrier(
                    output_image,
                    vk::AccessFlags::empty(),
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    1,
                )];
                device.cmd_pipeline_barrier(
                    command_buffer,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &to_transfer_dst,
                );

                // Blit converts from the configured pyramid precision.
                let extent = [
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D {
                        x: resolution.width as i32,
                        y: resolution.height as i32,
                        z: 1,
                    },
                ];
                let blit = vk::ImageBlit {
                    src_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: u32::from(scale),
                        layer_count: 1,
                    },
                    src_offsets: extent,
                    dst_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    dst_offsets: extent,
                };
                device.cmd_blit_image(
                    command_buffer,
                    source_image,
                    vk::ImageLayout::GENERAL,
                    output_image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[blit],
                    vk::Filter::NEAREST,
                );

                let to_transfer_src = [utils::image_barrier(
                    output_image,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::TRANSFER_READ,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    1,
                )];
                device.cmd_pipeline_barrier(
                    command_buffer,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &to_transfer_src,
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
                        width: resolution.width,
                        height: resolution.height,
                        depth: 1,
                    },
                };
                device.cmd_copy_image_to_buffer(
                    command_buffer,
                    output_image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    self.image_staging_buffer,
                    &[copy],
                );
            }
            utils::end_instant_command_buffer(
                self.vk(),
                self.general_queue,
                self.general_command_pool,
                command_buffer,
            )
        };
        let result = run();
        unsafe { self.vk().destroy_image(output_image, None) };
        result?;

        self.invalidate(self.image_staging_memory)?;
        let texels = unsafe {
            std::slice::from_raw_parts(
                self.image_staging_ptr as *const f32,
                (resolution.width * resolution.height) as usize,
            )
        };
        Ok(texels.to_vec())
    }

    fn record_and_run_transfer<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let device = self.vk();
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(self.transfer_command_buffer, &begin_info) }
            .map_err(Error::SubmitFailure)?;
        record(device, self.transfer_command_buffer);
        unsafe { device.end_command_buffer(self.transfer_command_buffer) }.map_err(Error::SubmitFailure)?;

        let queue = if self.device.async_transfer_available {
            self.async_transfer_queue
        } else {
            self.general_queue
        };
        let command_buffers = [self.transfer_command_buffer];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
        unsafe {
            device
                .queue_submit(queue, &[submit_info.build()], self.transfer_fence)
                .map_err(Error::SubmitFailure)?;
            device
                .wait_for_fences(&[self.transfer_fence], true, u64::MAX)
                .map_err(Error::SubmitFailure)?;
            device.reset_fences(&[self.transfer_fence]).map_err(Error::SubmitFailure)?;
        }
        Ok(())
    }

    fn invalidate(&self, memory: vk::DeviceMemory) -> Result<()> {
        let range = vk::MappedMemoryRange::builder()
            .memory(memory)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build();
        unsafe { self.vk().invalidate_mapped_memory_ranges(&[range]) }.map_err(Error::SubmitFailure)
    }

    fn flush(&self, memory: vk::DeviceMemory) -> Result<()> {
        let range = vk::MappedMemoryRange::builder()
            .memory(memory)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build();
        unsafe { self.vk().flush_mapped_memory_ranges(&[range]) }.map_err(Error::SubmitFailure)
    }
}

impl Drop for SiftMemory {
    fn drop(&mut self) {
        unsafe {
            let device = &self.device.device;

            for memory in [
                self.image_staging_memory,
                self.sift_staging_memory,
                self.count_staging_memory,
                self.match_staging_memory,
            ] {
                if memory != vk::DeviceMemory::null() {
                    device.unmap_memory(memory);
                }
            }

            for index in 0..self.sift_buffers.len() {
                if self.sift_buffers[index] != vk::Buffer::null() {
                    device.destroy_buffer(self.sift_buffers[index], None);
                }
                if self.sift_buffer_memories[index] != vk::DeviceMemory::null() {
                    device.free_memory(self.sift_buffer_memories[index], None);
                }
            }
            for fence in &self.sift_buffer_fences {
                device.destroy_fence(*fence, None);
            }

            for buffer in [
                self.count_staging_buffer,
                self.sift_staging_buffer,
                self.image_staging_buffer,
                self.match_buffer,
                self.match_staging_buffer,
                self.indirect_orientation_buffer,
                self.indirect_descriptor_buffer,
                self.indirect_matcher_buffer,
            ] {
                if buffer != vk::Buffer::null() {
                    device.destroy_buffer(buffer, None);
                }
            }
            for memory in [
                self.count_staging_memory,
                self.sift_staging_memory,
                self.image_staging_memory,
                self.match_buffer_memory,
                self.match_staging_memory,
                self.indirect_orientation_memory,
                self.indirect_descriptor_memory,
                self.indirect_matcher_memory,
                self.output_image_memory,
            ] {
                if memory != vk::DeviceMemory::null() {
                    device.free_memory(memory, None);
                }
            }

            for octave in 0..self.max_octave_count as usize {
                for views in [
                    &self.blur_tmp_image_views,
                    &self.octave_image_views,
                    &self.dog_image_views,
                ] {
                    if views[octave] != vk::ImageView::null() {
                        device.destroy_image_view(views[octave], None);
                    }
                }
                for images in [&self.blur_tmp_images, &self.octave_images, &self.dog_images] {
                    if images[octave] != vk::Image::null() {
                        device.destroy_image(images[octave], None);
                    }
                }
                for memories in [
                    &self.blur_tmp_image_memories,
                    &self.octave_image_memories,
                    &self.dog_image_memories,
                ] {
                    if memories[octave] != vk::DeviceMemory::null() {
                        device.free_memory(memories[octave], None);
                    }
                }
            }
            if self.input_image_view != vk::ImageView::null() {
                device.destroy_image_view(self.input_image_view, None);
            }
            if self.input_image != vk::Image::null() {
                device.destroy_image(self.input_image, None);
            }
            if self.input_image_memory != vk::DeviceMemory::null() {
                device.free_memory(self.input_image_memory, None);
            }

            if self.transfer_fence != vk::Fence::null() {
                device.destroy_fence(self.transfer_fence, None);
            }
            if self.general_command_pool != vk::CommandPool::null() {
                device.destroy_command_pool(self.general_command_pool, None);
            }
            if self.async_transfer_command_pool != vk::CommandPool::null() {
                device.destroy_command_pool(self.async_transfer_command_pool, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // CPU mirror of update_scale_space_info's octave count rule.
    fn octave_count(width: u32, height: u32, upsample: bool, max_octaves: u32) -> u32 {
        let lowest_dim = width.min(height);
        let raw = (lowest_dim as f32).log2().floor() as i32 - 4 + if upsample { 2 } else { 1 };
        (raw.max(1) as u32).min(max_octaves)
    }

    // CPU mirror of update_buffer_info's capacity rule.
    fn section_capacities(max_features: u32, octaves: u32) -> Vec<u32> {
        let max = max_features as f32;
        let halves_sum = max - 0.5f32.powi(octaves as i32) * max;
        let corrector = max / halves_sum;
        (0..octaves)
            .map(|octave| (0.5f32.powi(octave as i32 + 1) * max * corrector).round() as u32)
            .collect()
    }

    #[test]
    fn sixteen_pixel_input_has_a_single_octave() {
        assert_eq!(octave_count(16, 16, false, 255), 1);
    }

    #[test]
    fn octave_count_scales_with_resolution() {
        // 640x480 with upsampling: floor(log2(480)) - 4 + 2 = 6.
        assert_eq!(octave_count(640, 480, true, 255), 6);
        assert_eq!(octave_count(640, 480, false, 255), 5);
        // The configured maximum caps the result.
        assert_eq!(octave_count(640, 480, true, 3), 3);
    }

    #[test]
    fn capacities_sum_back_to_the_budget() {
        for (max_features, octaves) in [(100_000, 6), (1000, 3), (12_345, 8)] {
            let capacities = section_capacities(max_features, octaves);
            let sum: u32 = capacities.iter().sum();
            let tolerance = octaves;
            assert!(
                sum + tolerance >= max_features && sum <= max_features + tolerance,
                "sum {} strays from budget {}",
                sum,
                max_features
            );
            // Successive octaves never get more than the one below.
            for pair in capacities.windows(2) {
                assert!(pair[0] >= pair[1]);
            }
        }
    }

    #[test]
    fn thousand_feature_budget_over_three_octaves() {
        // halves [500, 250, 125] scaled by 1000/875.
        assert_eq!(section_capacities(1000, 3), vec![571, 286, 143]);
    }

    #[test]
    fn single_feature_budget_goes_to_the_first_octave() {
        assert_eq!(section_capacities(1, 4), vec![1, 0, 0, 0]);
    }
}
