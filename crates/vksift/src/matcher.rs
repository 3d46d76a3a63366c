//! Brute-force 2-nearest-neighbors matching pipeline.
//!
//! One indirectly-dispatched compute stage reads two packed SIFT buffers
//! and writes one match record per query feature, then copies the records
//! into the mapped staging buffer. When the device has a transfer-only
//! queue family, buffer ownership is released from it before the compute
//! submission and acquired back afterwards, with semaphores ordering the
//! three submissions.

use std::ffi::CStr;
use std::sync::Arc;

use ash::vk;

use crate::device::utils;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::memory::{SiftMemory, MATCH_SIZE};

pub(crate) struct SiftMatcher {
    device: Arc<Device>,
    general_queue: vk::Queue,
    /// Transfer queue 1; queue 0 belongs to the memory layer.
    async_ownership_transfer_queue: vk::Queue,

    general_command_pool: vk::CommandPool,
    async_transfer_command_pool: vk::CommandPool,
    matching_command_buffer: vk::CommandBuffer,
    release_ownership_command_buffer: vk::CommandBuffer,
    acquire_ownership_command_buffer: vk::CommandBuffer,

    descriptor_set_layout: vk::DescriptorSetLayout,
    descriptor_pool: vk::DescriptorPool,
    descriptor_set: vk::DescriptorSet,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,

    end_of_matching_semaphore: vk::Semaphore,
    ownership_released_semaphore: vk::Semaphore,
    pub end_of_matching_fence: vk::Fence,

    current_buffer_a: usize,
    current_buffer_b: usize,
}

impl SiftMatcher {
    pub fn new(device: Arc<Device>, memory: &SiftMemory) -> Result<Self> {
        let mut matcher = Self {
            general_queue: device.general_queues[0],
            async_ownership_transfer_queue: if device.async_transfer_available {
                device.async_transfer_queues[1]
            } else {
                vk::Queue::null()
            },
            general_command_pool: vk::CommandPool::null(),
            async_transfer_command_pool: vk::CommandPool::null(),
            matching_command_buffer: vk::CommandBuffer::null(),
            release_ownership_command_buffer: vk::CommandBuffer::null(),
            acquire_ownership_command_buffer: vk::CommandBuffer::null(),
            descriptor_set_layout: vk::DescriptorSetLayout::null(),
            descriptor_pool: vk::DescriptorPool::null(),
            descriptor_set: vk::DescriptorSet::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            end_of_matching_semaphore: vk::Semaphore::null(),
            ownership_released_semaphore: vk::Semaphore::null(),
            end_of_matching_fence: vk::Fence::null(),
            current_buffer_a: 0,
            current_buffer_b: if memory.buffer_count > 1 { 1 } else { 0 },
            device,
        };

        matcher.setup_command_objects()?;
        matcher.setup_descriptors()?;
        matcher.setup_pipeline()?;
        matcher.setup_sync_objects()?;
        matcher.write_descriptor_set(memory);
        matcher.record_command_buffers(memory)?;
        Ok(matcher)
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
                    object: "matcher command pool",
                    result,
                }
            })?;

        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.general_command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        self.matching_command_buffer = unsafe { self.vk().allocate_command_buffers(&allocate_info) }
            .map_err(|result| Error::ResourceCreation {
                object: "matching command buffer",
                result,
            })?[0];

        // The SIFT buffers live on the transfer family between operations
        // when async transfer is available; their ownership moves through
        // command buffers recorded on that family's pool.
        if self.device.async_transfer_available {
            let async_pool_info = vk::CommandPoolCreateInfo::builder()
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                .queue_family_index(self.device.async_transfer_queue_family);
            self.async_transfer_command_pool =
                unsafe { self.vk().create_command_pool(&async_pool_info, None) }.map_err(|result| {
                    Error::ResourceCreation {
                        object: "matcher async transfer command pool",
                        result,
                    }
                })?;

            let async_allocate_info = vk::CommandBufferAllocateInfo::builder()
                .command_pool(self.async_transfer_command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(2);
            let buffers = unsafe { self.vk().allocate_command_buffers(&async_allocate_info) }
                .map_err(|result| Error::ResourceCreation {
                    object: "ownership transfer command buffers",
                    result,
                })?;
            self.release_ownership_command_buffer = buffers[0];
            self.acquire_ownership_command_buffer = buffers[1];
        }
        Ok(())
    }

    fn setup_descriptors(&mut self) -> Result<()> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = (0..3)
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(binding)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
                    .build()
            })
            .collect();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        self.descriptor_set_layout =
            unsafe { self.vk().create_descriptor_set_layout(&layout_info, None) }.map_err(|result| {
                Error::ResourceCreation {
                    object: "matching descriptor set layout",
                    result,
                }
            })?;

        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: 3,
        }];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        self.descriptor_pool = unsafe { self.vk().create_descriptor_pool(&pool_info, None) }.map_err(
            |result| Error::ResourceCreation {
                object: "matching descriptor pool",
                result,
            },
        )?;

        let set_layouts = [self.descriptor_set_layout];
        let allocate_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&set_layouts);
        self.descriptor_set = unsafe { self.vk().allocate_descriptor_sets(&allocate_info) }
            .map_err(|result| Error::ResourceCreation {
                object: "matching descriptor set",
                result,
            })?[0];
        Ok(())
    }

    fn setup_pipeline(&mut self) -> Result<()> {
        let shader_module = utils::create_shader_module(self.vk(), "Get2NearestNeighbors")?;
        let pipeline_result =
            utils::create_compute_pipeline(self.vk(), shader_module, self.descriptor_set_layout, 0);
        unsafe { self.vk().destroy_shader_module(shader_module, None) };
        let (pipeline_layout, pipeline) = pipeline_result?;
        self.pipeline_layout = pipeline_layout;
        self.pipeline = pipeline;
        Ok(())
    }

    fn setup_sync_objects(&mut self) -> Result<()> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        self.end_of_matching_semaphore = unsafe { self.vk().create_semaphore(&semaphore_info, None) }
            .map_err(|result| Error::ResourceCreation {
                object: "end-of-matching semaphore",
                result,
            })?;
        if self.device.async_transfer_available {
            self.ownership_released_semaphore =
                unsafe { self.vk().create_semaphore(&semaphore_info, None) }.map_err(|result| {
                    Error::ResourceCreation {
                        object: "ownership-released semaphore",
                        result,
                    }
                })?;
        }

        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
        self.end_of_matching_fence =
            unsafe { self.vk().create_fence(&fence_info, None) }.map_err(|result| {
                Error::ResourceCreation {
                    object: "end-of-matching fence",
                    result,
                }
            })?;
        Ok(())
    }

    fn write_descriptor_set(&self, memory: &SiftMemory) {
        let buffer_a_info = [vk::DescriptorBufferInfo {
            buffer: memory.sift_buffers[self.current_buffer_a],
            offset: 0,
            range: vk::WHOLE_SIZE,
        }];
        let buffer_b_info = [vk::DescriptorBufferInfo {
            buffer: memory.sift_buffers[self.current_buffer_b],
            offset: 0,
            range: vk::WHOLE_SIZE,
        }];
        let matches_info = [vk::DescriptorBufferInfo {
            buffer: memory.match_buffer,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }];
        let write = |binding: u32, info: &[vk::DescriptorBufferInfo; 1]| {
            vk::WriteDescriptorSet::builder()
                .dst_set(self.descriptor_set)
                .dst_binding(binding)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(info)
                .build()
        };
        let writes = [
            write(0, &buffer_a_info),
            write(1, &buffer_b_info),
            write(2, &matches_info),
        ];
        unsafe { self.vk().update_descriptor_sets(&writes, &[]) };
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

    fn record_ownership_transfer(
        &self,
        memory: &SiftMemory,
        command_buffer: vk::CommandBuffer,
        src_queue_family: u32,
        dst_queue_family: u32,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) {
        self.begin_marker(command_buffer, ownership_marker());
        let barriers = [
            utils::buffer_barrier(
                memory.sift_buffers[self.current_buffer_a],
                vk::AccessFlags::empty(),
                vk::AccessFlags::empty(),
                src_queue_family,
                dst_queue_family,
            ),
            utils::buffer_barrier(
                memory.sift_buffers[self.current_buffer_b],
                vk::AccessFlags::empty(),
                vk::AccessFlags::empty(),
                src_queue_family,
                dst_queue_family,
            ),
            utils::buffer_barrier(
                memory.match_buffer,
                vk::AccessFlags::empty(),
                vk::AccessFlags::empty(),
                src_queue_family,
                dst_queue_family,
            ),
        ];
        unsafe {
            self.vk().cmd_pipeline_barrier(
                command_buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &barriers,
                &[],
            );
        }
        self.end_marker(command_buffer);
    }

    fn record_matching_commands(&self, memory: &SiftMemory, command_buffer: vk::CommandBuffer) {
        let device = self.vk();
        self.begin_marker(command_buffer, matching_marker());
        unsafe {
            let inputs_ready = [
                utils::buffer_barrier(
                    memory.sift_buffers[self.current_buffer_a],
                    vk::AccessFlags::empty(),
                    vk::AccessFlags::SHADER_READ,
                    vk::QUEUE_FAMILY_IGNORED,
                    vk::QUEUE_FAMILY_IGNORED,
                ),
                utils::buffer_barrier(
                    memory.sift_buffers[self.current_buffer_b],
                    vk::AccessFlags::empty(),
                    vk::AccessFlags::SHADER_READ,
                    vk::QUEUE_FAMILY_IGNORED,
                    vk::QUEUE_FAMILY_IGNORED,
                ),
                utils::buffer_barrier(
                    memory.match_buffer,
                    vk::AccessFlags::empty(),
                    vk::AccessFlags::SHADER_WRITE,
                    vk::QUEUE_FAMILY_IGNORED,
                    vk::QUEUE_FAMILY_IGNORED,
                ),
                utils::buffer_barrier(
                    memory.indirect_matcher_buffer,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::INDIRECT_COMMAND_READ,
                    vk::QUEUE_FAMILY_IGNORED,
                    vk::QUEUE_FAMILY_IGNORED,
                ),
            ];
            device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::DRAW_INDIRECT,
                vk::DependencyFlags::empty(),
                &[],
                &inputs_ready,
                &[],
            );

            device.cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::COMPUTE, self.pipeline);
            device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::COMPUTE,
                self.pipeline_layout,
                0,
                &[self.descriptor_set],
                &[],
            );
            device.cmd_dispatch_indirect(command_buffer, memory.indirect_matcher_buffer, 0);

            let matches_written = [utils::buffer_barrier(
                memory.match_buffer,
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
                &matches_written,
                &[],
            );
            if memory.current_match_count > 0 {
                device.cmd_copy_buffer(
                    command_buffer,
                    memory.match_buffer,
                    memory.match_staging_buffer,
                    &[vk::BufferCopy {
                        src_offset: 0,
                        dst_offset: 0,
                        size: MATCH_SIZE * u64::from(memory.current_match_count),
                    }],
                );
            }
            let host_visible = [utils::buffer_barrier(
                memory.match_staging_buffer,
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
    }

    fn record_command_buffers(&self, memory: &SiftMemory) -> Result<()> {
        let device = self.vk();
        let begin_info = vk::CommandBufferBeginInfo::builder();

        if self.device.async_transfer_available {
            unsafe { device.begin_command_buffer(self.release_ownership_command_buffer, &begin_info) }
                .map_err(Error::SubmitFailure)?;
            self.record_ownership_transfer(
                memory,
                self.release_ownership_command_buffer,
                self.device.async_transfer_queue_family,
                self.device.general_queue_family,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            );
            unsafe { device.end_command_buffer(self.release_ownership_command_buffer) }
                .map_err(Error::SubmitFailure)?;

            unsafe { device.begin_command_buffer(self.acquire_ownership_command_buffer, &begin_info) }
                .map_err(Error::SubmitFailure)?;
            self.record_ownership_transfer(
                memory,
                self.acquire_ownership_command_buffer,
                self.device.general_queue_family,
                self.device.async_transfer_queue_family,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            );
            unsafe { device.end_command_buffer(self.acquire_ownership_command_buffer) }
                .map_err(Error::SubmitFailure)?;
        }

        unsafe { device.begin_command_buffer(self.matching_command_buffer, &begin_info) }
            .map_err(Error::SubmitFailure)?;
        if self.device.async_transfer_available {
            // Matching acquire half of the transfer-family release.
            self.record_ownership_transfer(
                memory,
                self.matching_command_buffer,
                self.device.async_transfer_queue_family,
                self.device.general_queue_family,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::COMPUTE_SHADER,
            );
        }
        self.record_matching_commands(memory, self.matching_command_buffer);
        if self.device.async_transfer_available {
            // Hand the buffers back to the transfer family.
            self.record_ownership_transfer(
                memory,
                self.matching_command_buffer,
                self.device.general_queue_family,
                self.device.async_transfer_queue_family,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            );
        }
        unsafe { device.end_command_buffer(self.matching_command_buffer) }.map_err(Error::SubmitFailure)
    }

    /// Re-records for the operand pair and chains the submissions. The
    /// matching fence is signalled by the last submission of the chain;
    /// both operand buffer fences are signalled behind the compute work in
    /// general-queue submission order.
    pub fn dispatch(&mut self, memory: &SiftMemory, buffer_a: usize, buffer_b: usize) -> Result<()> {
        self.current_buffer_a = buffer_a;
        self.current_buffer_b = buffer_b;
        // Descriptors and commands depend on the operand pair and on
        // buffer A's feature count, so both are rebuilt every time.
        self.write_descriptor_set(memory);
        self.record_command_buffers(memory)?;

        let device = self.vk();
        unsafe {
            device
                .reset_fences(&[self.end_of_matching_fence])
                .map_err(Error::SubmitFailure)?;

            if self.device.async_transfer_available {
                let release_buffers = [self.release_ownership_command_buffer];
                let release_submit = vk::SubmitInfo::builder()
                    .command_buffers(&release_buffers)
                    .signal_semaphores(std::slice::from_ref(&self.ownership_released_semaphore));
                device
                    .queue_submit(
                        self.async_ownership_transfer_queue,
                        &[release_submit.build()],
                        vk::Fence::null(),
                    )
                    .map_err(Error::SubmitFailure)?;
            }

            let wait_semaphores = [self.ownership_released_semaphore];
            let wait_stages = [vk::PipelineStageFlags::COMPUTE_SHADER];
            let matching_buffers = [self.matching_command_buffer];
            let mut matching_submit = vk::SubmitInfo::builder()
                .command_buffers(&matching_buffers)
                .signal_semaphores(std::slice::from_ref(&self.end_of_matching_semaphore));
            if self.device.async_transfer_available {
                matching_submit = matching_submit
                    .wait_semaphores(&wait_semaphores)
                    .wait_dst_stage_mask(&wait_stages);
            }
            let matching_fence = if self.device.async_transfer_available {
                vk::Fence::null()
            } else {
                self.end_of_matching_fence
            };
            device
                .queue_submit(self.general_queue, &[matching_submit.build()], matching_fence)
                .map_err(Error::SubmitFailure)?;

            // The buffer fences ride behind the matching work in
            // general-queue submission order.
            let fences = if buffer_a == buffer_b {
                vec![memory.sift_buffer_fences[buffer_a]]
            } else {
                vec![
                    memory.sift_buffer_fences[buffer_a],
                    memory.sift_buffer_fences[buffer_b],
                ]
            };
            device.reset_fences(&fences).map_err(Error::SubmitFailure)?;
            for fence in fences {
                let empty_submit = vk::SubmitInfo::builder();
                device
                    .queue_submit(self.general_queue, &[empty_submit.build()], fence)
                    .map_err(Error::SubmitFailure)?;
            }

            if self.device.async_transfer_available {
                let acquire_buffers = [self.acquire_ownership_command_buffer];
                let acquire_wait = [self.end_of_matching_semaphore];
                let acquire_stages = [vk::PipelineStageFlags::TRANSFER];
                let acquire_submit = vk::SubmitInfo::builder()
                    .command_buffers(&acquire_buffers)
                    .wait_semaphores(&acquire_wait)
                    .wait_dst_stage_mask(&acquire_stages);
                device
                    .queue_submit(
                        self.async_ownership_transfer_queue,
                        &[acquire_submit.build()],
                        self.end_of_matching_fence,
                    )
                    .map_err(Error::SubmitFailure)?;
            }
        }
        Ok(())
    }
}

impl Drop for SiftMatcher {
    fn drop(&mut self) {
        let device = &self.device.device;
        unsafe {
            if self.end_of_matching_semaphore != vk::Semaphore::null() {
                device.destroy_semaphore(self.end_of_matching_semaphore, None);
            }
            if self.ownership_released_semaphore != vk::Semaphore::null() {
                device.destroy_semaphore(self.ownership_released_semaphore, None);
            }
            if self.end_of_matching_fence != vk::Fence::null() {
                device.destroy_fence(self.end_of_matching_fence, None);
            }
            if self.pipeline != vk::Pipeline::null() {
                device.destroy_pipeline(self.pipeline, None);
            }
            if self.pipeline_layout != vk::PipelineLayout::null() {
                device.destroy_pipeline_layout(self.pipeline_layout, None);
            }
            if self.descriptor_pool != vk::DescriptorPool::null() {
                device.destroy_descriptor_pool(self.descriptor_pool, None);
            }
            if self.descriptor_set_layout != vk::DescriptorSetLayout::null() {
                device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
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

fn matching_marker() -> &'static CStr {
    unsafe { CStr::from_bytes_with_nul_unchecked(b"Matching\0") }
}

fn ownership_marker() -> &'static CStr {
    unsafe { CStr::from_bytes_with_nul_unchecked(b"BufferOwnershipTransfer\0") }
}
