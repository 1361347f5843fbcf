//! [`GraphicsDevice`] over Vulkan.
//!
//! Every handle indexes one map of live Vulkan objects. Command lists are
//! primary command buffers, fences are timeline semaphores, root signatures
//! are pipeline layouts and descriptor tables are descriptor sets. All work
//! goes to the single graphics queue.

use ash::vk;
use std::collections::HashMap;

use super::commands::{access_mask, color_range, image_layout, stage_mask};
use super::descriptors::{DescriptorTable, PipelineLayout, PUSH_SET, RAYTRACING_STAGES, TABLE_SET};
use super::memory::{buffer_usage, image_usage, vk_format, Buffer, Image};
use super::raytracing::{acceleration, pipeline, AccelerationStructure, RaytracingPipelineObject};
use super::{samplers, vk_error, CommandManager, DescriptorManager, MemoryManager, VulkanContext};
use crate::gfx::*;

struct TextureEntry {
    image: Image,
    views: Vec<ViewId>,
}

/// Semaphores the next [`GraphicsDevice::execute`] waits on and signals.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PresentSync {
    pub wait: vk::Semaphore,
    pub signal: vk::Semaphore,
}

pub struct VulkanDevice {
    buffers: HashMap<BufferId, Buffer>,
    textures: HashMap<TextureId, TextureEntry>,
    views: HashMap<ViewId, vk::ImageView>,
    samplers: HashMap<SamplerId, vk::Sampler>,
    accels: HashMap<AccelId, AccelerationStructure>,
    command_lists: HashMap<CommandListId, vk::CommandBuffer>,
    fences: HashMap<FenceId, vk::Semaphore>,
    shaders: HashMap<ShaderId, vk::ShaderModule>,
    pipelines: HashMap<PipelineId, RaytracingPipelineObject>,
    root_signatures: HashMap<RootSignatureId, PipelineLayout>,
    tables: HashMap<DescriptorTableId, DescriptorTable>,
    present_sync: Option<PresentSync>,
    next_id: usize,

    descriptors: DescriptorManager,
    commands: CommandManager,
    // Dropped before `ctx` so the allocator frees its blocks while the device lives.
    memory: MemoryManager,
    ctx: VulkanContext,
}

fn invalid(kind: &'static str, id: usize) -> GfxError {
    GfxError::InvalidHandle { kind, id }
}

impl VulkanDevice {
    pub fn new(ctx: VulkanContext) -> Result<Self, String> {
        let (memory, commands, descriptors) =
            unsafe { (MemoryManager::new(&ctx)?, CommandManager::new(&ctx)?, DescriptorManager::new(&ctx)?) };

        Ok(Self {
            buffers: HashMap::new(),
            textures: HashMap::new(),
            views: HashMap::new(),
            samplers: HashMap::new(),
            accels: HashMap::new(),
            command_lists: HashMap::new(),
            fences: HashMap::new(),
            shaders: HashMap::new(),
            pipelines: HashMap::new(),
            root_signatures: HashMap::new(),
            tables: HashMap::new(),
            present_sync: None,
            next_id: 1,
            descriptors,
            commands,
            memory,
            ctx,
        })
    }

    pub fn context(&self) -> &VulkanContext {
        &self.ctx
    }

    fn next_id(&mut self) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Make the next submission wait on `wait` and signal `signal`.
    pub(crate) fn arm_present_sync(&mut self, sync: PresentSync) {
        self.present_sync = Some(sync);
    }

    /// Track an image the device does not own, such as a swapchain image.
    pub(crate) fn import_texture(&mut self, handle: vk::Image, format: vk::Format, extent: vk::Extent2D) -> TextureId {
        let id = TextureId(self.next_id());
        self.textures.insert(
            id,
            TextureEntry {
                image: Image {
                    handle,
                    allocation: None,
                    format,
                    extent,
                },
                views: Vec::new(),
            },
        );
        id
    }

    /// Stop tracking an imported image. Its views are destroyed, the image is not.
    pub(crate) fn forget_texture(&mut self, texture: TextureId) {
        if let Some(entry) = self.textures.remove(&texture) {
            self.destroy_views(&entry.views);
        }
    }

    fn destroy_views(&mut self, views: &[ViewId]) {
        for view in views {
            if let Some(handle) = self.views.remove(view) {
                unsafe { self.ctx.device.destroy_image_view(handle, None) };
            }
        }
    }

    fn buffer(&self, id: BufferId) -> GfxResult<&Buffer> {
        self.buffers.get(&id).ok_or_else(|| invalid("buffer", id.0))
    }

    fn image(&self, id: TextureId) -> GfxResult<&Image> {
        self.textures
            .get(&id)
            .map(|entry| &entry.image)
            .ok_or_else(|| invalid("texture", id.0))
    }

    fn cmd(&self, id: CommandListId) -> GfxResult<vk::CommandBuffer> {
        self.command_lists
            .get(&id)
            .copied()
            .ok_or_else(|| invalid("command list", id.0))
    }

    fn layout(&self, id: RootSignatureId) -> GfxResult<vk::PipelineLayout> {
        self.root_signatures
            .get(&id)
            .map(|layout| layout.layout)
            .ok_or_else(|| invalid("root signature", id.0))
    }

    fn accel(&self, id: AccelId) -> GfxResult<&AccelerationStructure> {
        self.accels.get(&id).ok_or_else(|| invalid("acceleration structure", id.0))
    }

    fn min_buffer_alignment(&self, usage: BufferUsage) -> u64 {
        let caps = &self.ctx.rt_capabilities;
        let mut alignment = 1u64;
        if usage.contains(BufferUsage::SHADER_BINDING_TABLE) {
            alignment = alignment.max(caps.shader_group_base_alignment as u64);
        }
        if usage.contains(BufferUsage::STORAGE_BUFFER) {
            alignment = alignment.max(caps.min_scratch_offset_alignment as u64);
        }
        if usage.contains(BufferUsage::ACCELERATION_STRUCTURE_BUFFER) {
            alignment = alignment.max(256);
        }
        alignment
    }

    fn submit(&self, submit: vk::SubmitInfo2) -> GfxResult<()> {
        unsafe {
            self.ctx
                .device
                .queue_submit2(self.ctx.graphics_queue, &[submit], vk::Fence::null())
                .map_err(|e| vk_error("Failed to submit to the graphics queue", e))
        }
    }
}

impl GraphicsDevice for VulkanDevice {
    const SHADER_EXTENSION: &'static str = "spv";

    fn create_buffer(&mut self, desc: &BufferDesc) -> GfxResult<BufferId> {
        let location = match desc.location {
            MemoryLocation::GpuOnly => gpu_allocator::MemoryLocation::GpuOnly,
            MemoryLocation::Upload => gpu_allocator::MemoryLocation::CpuToGpu,
        };
        let buffer = unsafe {
            self.memory.create_buffer(
                desc.size,
                buffer_usage(desc.usage),
                location,
                self.min_buffer_alignment(desc.usage),
                desc.name,
            )?
        };
        let id = BufferId(self.next_id());
        self.buffers.insert(id, buffer);
        Ok(id)
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> GfxResult<()> {
        self.buffers
            .get_mut(&buffer)
            .ok_or_else(|| invalid("buffer", buffer.0))?
            .write(offset, data)
    }

    fn buffer_address(&self, buffer: BufferId) -> GfxResult<u64> {
        self.buffer(buffer)?
            .device_address
            .ok_or_else(|| GfxError::Validation(format!("buffer {} has no device address", buffer.0)))
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        match self.buffers.remove(&buffer) {
            Some(buffer) => unsafe { self.memory.destroy_buffer(buffer) },
            None => log::warn!("destroy_buffer: unknown buffer {}", buffer.0),
        }
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> GfxResult<TextureId> {
        let image = unsafe {
            self.memory.create_image(
                vk::Extent2D {
                    width: desc.extent.width,
                    height: desc.extent.height,
                },
                vk_format(desc.format),
                image_usage(desc.usage),
                desc.name,
            )?
        };
        let id = TextureId(self.next_id());
        self.textures.insert(id, TextureEntry { image, views: Vec::new() });
        Ok(id)
    }

    fn create_texture_view(&mut self, texture: TextureId, _kind: ViewKind) -> GfxResult<ViewId> {
        // Storage and sampled access differ only in descriptor type and layout.
        let image = self.image(texture)?;
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image.handle)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(image.format)
            .subresource_range(color_range());

        let handle = unsafe {
            self.ctx
                .device
                .create_image_view(&view_info, None)
                .map_err(|e| vk_error("Failed to create image view", e))?
        };

        let id = ViewId(self.next_id());
        self.views.insert(id, handle);
        if let Some(entry) = self.textures.get_mut(&texture) {
            entry.views.push(id);
        }
        Ok(id)
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        match self.textures.remove(&texture) {
            Some(entry) => {
                self.destroy_views(&entry.views);
                unsafe { self.memory.destroy_image(entry.image) };
            }
            None => log::warn!("destroy_texture: unknown texture {}", texture.0),
        }
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> GfxResult<SamplerId> {
        let limit = self.ctx.device_properties.limits.max_sampler_anisotropy;
        let info = samplers::sampler_create_info(desc, limit);
        let sampler = unsafe {
            self.ctx
                .device
                .create_sampler(&info, None)
                .map_err(|e| vk_error("Failed to create sampler", e))?
        };
        let id = SamplerId(self.next_id());
        self.samplers.insert(id, sampler);
        Ok(id)
    }

    fn destroy_sampler(&mut self, sampler: SamplerId) {
        if let Some(handle) = self.samplers.remove(&sampler) {
            unsafe { self.ctx.device.destroy_sampler(handle, None) };
        }
    }

    fn create_root_signature(&mut self, desc: &RootSignatureDesc) -> GfxResult<RootSignatureId> {
        let layout = unsafe { self.descriptors.create_pipeline_layout(desc)? };
        let id = RootSignatureId(self.next_id());
        self.root_signatures.insert(id, layout);
        Ok(id)
    }

    fn destroy_root_signature(&mut self, root: RootSignatureId) {
        if let Some(layout) = self.root_signatures.remove(&root) {
            unsafe { self.descriptors.destroy_pipeline_layout(layout) };
        }
    }

    fn create_descriptor_table(&mut self, bindings: &[DescriptorBinding]) -> GfxResult<DescriptorTableId> {
        let table = unsafe { self.descriptors.create_table(bindings)? };
        let id = DescriptorTableId(self.next_id());
        self.tables.insert(id, table);
        Ok(id)
    }

    fn write_descriptor(
        &mut self,
        table: DescriptorTableId,
        slot: u32,
        index: u32,
        resource: DescriptorResource,
    ) -> GfxResult<()> {
        let entry = self.tables.get(&table).ok_or_else(|| invalid("descriptor table", table.0))?;
        let binding = entry
            .bindings
            .get(slot as usize)
            .ok_or_else(|| GfxError::Validation(format!("descriptor table has no slot {}", slot)))?;
        if binding.kind != resource.kind() {
            return Err(GfxError::Validation(format!(
                "slot {} holds {:?}, got {:?}",
                slot,
                binding.kind,
                resource.kind()
            )));
        }
        if index >= binding.count {
            return Err(GfxError::Validation(format!(
                "index {} out of range for slot {} of {}",
                index, slot, binding.count
            )));
        }

        let write = vk::WriteDescriptorSet::default()
            .dst_set(entry.set)
            .dst_binding(slot)
            .dst_array_element(index)
            .descriptor_type(super::descriptors::descriptor_type(binding.kind));

        let view = |id: ViewId| self.views.get(&id).copied().ok_or_else(|| invalid("view", id.0));

        match resource {
            DescriptorResource::StorageTexture(id) | DescriptorResource::Texture(id) => {
                let image_layout = if matches!(resource, DescriptorResource::StorageTexture(_)) {
                    vk::ImageLayout::GENERAL
                } else {
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
                };
                let info = [vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: view(id)?,
                    image_layout,
                }];
                unsafe { self.ctx.device.update_descriptor_sets(&[write.image_info(&info)], &[]) };
            }
            DescriptorResource::Sampler(id) => {
                let sampler = self.samplers.get(&id).copied().ok_or_else(|| invalid("sampler", id.0))?;
                let info = [vk::DescriptorImageInfo {
                    sampler,
                    image_view: vk::ImageView::null(),
                    image_layout: vk::ImageLayout::UNDEFINED,
                }];
                unsafe { self.ctx.device.update_descriptor_sets(&[write.image_info(&info)], &[]) };
            }
            DescriptorResource::AccelerationStructure(id) => {
                let handles = [self.accel(id)?.handle];
                let mut accel_info =
                    vk::WriteDescriptorSetAccelerationStructureKHR::default().acceleration_structures(&handles);
                let write = write.descriptor_count(1).push_next(&mut accel_info);
                unsafe { self.ctx.device.update_descriptor_sets(&[write], &[]) };
            }
        }
        Ok(())
    }

    fn destroy_descriptor_table(&mut self, table: DescriptorTableId) {
        if let Some(table) = self.tables.remove(&table) {
            unsafe { self.descriptors.destroy_table(table) };
        }
    }

    fn create_command_list(&mut self) -> GfxResult<CommandListId> {
        let cmd = unsafe { self.commands.allocate()? };
        let id = CommandListId(self.next_id());
        self.command_lists.insert(id, cmd);
        Ok(id)
    }

    fn reset_command_list(&mut self, cmd: CommandListId) -> GfxResult<()> {
        let cmd = self.cmd(cmd)?;
        unsafe { self.commands.begin(cmd) }
    }

    fn close_command_list(&mut self, cmd: CommandListId) -> GfxResult<()> {
        let cmd = self.cmd(cmd)?;
        unsafe { self.commands.end(cmd) }
    }

    fn destroy_command_list(&mut self, cmd: CommandListId) {
        if let Some(cmd) = self.command_lists.remove(&cmd) {
            unsafe { self.commands.free(cmd) };
        }
    }

    fn execute(&mut self, lists: &[CommandListId]) -> GfxResult<()> {
        let infos = lists
            .iter()
            .map(|&id| Ok(vk::CommandBufferSubmitInfo::default().command_buffer(self.cmd(id)?)))
            .collect::<GfxResult<Vec<_>>>()?;

        let mut wait = Vec::new();
        let mut signal = Vec::new();
        if let Some(sync) = self.present_sync.take() {
            wait.push(
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(sync.wait)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
            );
            signal.push(
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(sync.signal)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
            );
        }

        self.submit(
            vk::SubmitInfo2::default()
                .wait_semaphore_infos(&wait)
                .command_buffer_infos(&infos)
                .signal_semaphore_infos(&signal),
        )
    }

    fn create_fence(&mut self) -> GfxResult<FenceId> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let semaphore = unsafe {
            self.ctx
                .device
                .create_semaphore(&info, None)
                .map_err(|e| vk_error("Failed to create timeline semaphore", e))?
        };
        let id = FenceId(self.next_id());
        self.fences.insert(id, semaphore);
        Ok(id)
    }

    fn signal_fence(&mut self, fence: FenceId, value: u64) -> GfxResult<()> {
        let semaphore = *self.fences.get(&fence).ok_or_else(|| invalid("fence", fence.0))?;
        let signal = [vk::SemaphoreSubmitInfo::default()
            .semaphore(semaphore)
            .value(value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        self.submit(vk::SubmitInfo2::default().signal_semaphore_infos(&signal))
    }

    fn wait_fence(&mut self, fence: FenceId, value: u64) -> GfxResult<()> {
        let semaphores = [*self.fences.get(&fence).ok_or_else(|| invalid("fence", fence.0))?];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::default().semaphores(&semaphores).values(&values);
        unsafe {
            self.ctx
                .device
                .wait_semaphores(&info, u64::MAX)
                .map_err(|e| vk_error("Failed to wait for timeline semaphore", e))
        }
    }

    fn destroy_fence(&mut self, fence: FenceId) {
        if let Some(semaphore) = self.fences.remove(&fence) {
            unsafe { self.ctx.device.destroy_semaphore(semaphore, None) };
        }
    }

    fn wait_idle(&mut self) -> GfxResult<()> {
        unsafe {
            self.ctx
                .device
                .queue_wait_idle(self.ctx.graphics_queue)
                .map_err(|e| vk_error("Failed to wait for queue", e))
        }
    }

    fn cmd_copy_buffer(
        &mut self,
        cmd: CommandListId,
        src: BufferId,
        dst: BufferId,
        region: BufferCopyRegion,
    ) -> GfxResult<()> {
        let cmd = self.cmd(cmd)?;
        let (src, dst) = (self.buffer(src)?.handle, self.buffer(dst)?.handle);
        let copy = vk::BufferCopy {
            src_offset: region.src_offset,
            dst_offset: region.dst_offset,
            size: region.size,
        };
        unsafe { self.ctx.device.cmd_copy_buffer(cmd, src, dst, &[copy]) };
        Ok(())
    }

    fn cmd_copy_buffer_to_texture(
        &mut self,
        cmd: CommandListId,
        src: BufferId,
        dst: TextureId,
        extent: Extent2D,
    ) -> GfxResult<()> {
        let cmd = self.cmd(cmd)?;
        let (src, dst) = (self.buffer(src)?.handle, self.image(dst)?.handle);
        let extent = vk::Extent2D {
            width: extent.width,
            height: extent.height,
        };
        unsafe { self.commands.copy_buffer_to_image(cmd, src, dst, extent) };
        Ok(())
    }

    fn cmd_copy_texture(&mut self, cmd: CommandListId, src: TextureId, dst: TextureId, extent: Extent2D) -> GfxResult<()> {
        let cmd = self.cmd(cmd)?;
        let (src, dst) = (self.image(src)?, self.image(dst)?);
        if src.format != dst.format {
            return Err(GfxError::Validation(format!(
                "texture copy between {:?} and {:?}",
                src.format, dst.format
            )));
        }
        let extent = vk::Extent2D {
            width: extent.width,
            height: extent.height,
        };
        unsafe { self.commands.copy_image(cmd, src.handle, dst.handle, extent) };
        Ok(())
    }

    fn cmd_buffer_barriers(&mut self, cmd: CommandListId, barriers: &[BufferBarrier]) -> GfxResult<()> {
        let cmd = self.cmd(cmd)?;
        let vk_barriers = barriers
            .iter()
            .map(|barrier| {
                Ok(vk::BufferMemoryBarrier2::default()
                    .src_stage_mask(stage_mask(barrier.sync_before))
                    .src_access_mask(access_mask(barrier.access_before))
                    .dst_stage_mask(stage_mask(barrier.sync_after))
                    .dst_access_mask(access_mask(barrier.access_after))
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(self.buffer(barrier.buffer)?.handle)
                    .offset(0)
                    .size(vk::WHOLE_SIZE))
            })
            .collect::<GfxResult<Vec<_>>>()?;

        let dependency = vk::DependencyInfo::default().buffer_memory_barriers(&vk_barriers);
        unsafe { self.ctx.device.cmd_pipeline_barrier2(cmd, &dependency) };
        Ok(())
    }

    fn cmd_texture_barriers(&mut self, cmd: CommandListId, barriers: &[TextureBarrier]) -> GfxResult<()> {
        let cmd = self.cmd(cmd)?;
        let vk_barriers = barriers
            .iter()
            .map(|barrier| {
                Ok(vk::ImageMemoryBarrier2::default()
                    .src_stage_mask(stage_mask(barrier.sync_before))
                    .src_access_mask(access_mask(barrier.access_before))
                    .dst_stage_mask(stage_mask(barrier.sync_after))
                    .dst_access_mask(access_mask(barrier.access_after))
                    .old_layout(image_layout(barrier.state_before))
                    .new_layout(image_layout(barrier.state_after))
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(self.image(barrier.texture)?.handle)
                    .subresource_range(color_range()))
            })
            .collect::<GfxResult<Vec<_>>>()?;

        let dependency = vk::DependencyInfo::default().image_memory_barriers(&vk_barriers);
        unsafe { self.ctx.device.cmd_pipeline_barrier2(cmd, &dependency) };
        Ok(())
    }

    fn blas_build_sizes(&self, geometry: &[TriangleGeometry]) -> GfxResult<AccelBuildSizes> {
        unsafe { acceleration::blas_build_sizes(&self.ctx.accel_struct_loader, geometry) }
    }

    fn tlas_build_sizes(&self, desc: &TlasBuildDesc) -> GfxResult<AccelBuildSizes> {
        unsafe { acceleration::tlas_build_sizes(&self.ctx.accel_struct_loader, desc) }
    }

    fn create_acceleration_structure(
        &mut self,
        buffer: BufferId,
        offset: u64,
        size: u64,
        level: AccelLevel,
    ) -> GfxResult<AccelId> {
        let handle = self.buffer(buffer)?.handle;
        let accel = unsafe { acceleration::create(&self.ctx.accel_struct_loader, handle, offset, size, level)? };
        let id = AccelId(self.next_id());
        self.accels.insert(id, accel);
        Ok(id)
    }

    fn acceleration_structure_address(&self, accel: AccelId) -> GfxResult<u64> {
        Ok(self.accel(accel)?.device_address)
    }

    fn destroy_acceleration_structure(&mut self, accel: AccelId) {
        if let Some(accel) = self.accels.remove(&accel) {
            unsafe {
                self.ctx
                    .accel_struct_loader
                    .destroy_acceleration_structure(accel.handle, None)
            };
        }
    }

    fn cmd_build_blas(
        &mut self,
        cmd: CommandListId,
        geometry: &[TriangleGeometry],
        dst: AccelId,
        scratch_address: u64,
    ) -> GfxResult<()> {
        let cmd = self.cmd(cmd)?;
        let dst = self.accel(dst)?;
        if dst.level != AccelLevel::Bottom {
            return Err(GfxError::Validation("bottom-level build into a top-level structure".to_string()));
        }
        unsafe {
            acceleration::cmd_build_blas(&self.ctx.accel_struct_loader, cmd, geometry, dst.handle, scratch_address)
        };
        Ok(())
    }

    fn cmd_build_tlas(
        &mut self,
        cmd: CommandListId,
        desc: &TlasBuildDesc,
        dst: AccelId,
        scratch_address: u64,
    ) -> GfxResult<()> {
        let cmd = self.cmd(cmd)?;
        let dst = self.accel(dst)?;
        if dst.level != AccelLevel::Top {
            return Err(GfxError::Validation("top-level build into a bottom-level structure".to_string()));
        }
        unsafe { acceleration::cmd_build_tlas(&self.ctx.accel_struct_loader, cmd, desc, dst.handle, scratch_address) };
        Ok(())
    }

    fn create_shader(&mut self, bytecode: &[u8]) -> GfxResult<ShaderId> {
        let words = ash::util::read_spv(&mut std::io::Cursor::new(bytecode))
            .map_err(|e| GfxError::Validation(format!("shader library is not SPIR-V: {}", e)))?;
        let info = vk::ShaderModuleCreateInfo::default().code(&words);
        let module = unsafe {
            self.ctx
                .device
                .create_shader_module(&info, None)
                .map_err(|e| vk_error("Failed to create shader module", e))?
        };
        let id = ShaderId(self.next_id());
        self.shaders.insert(id, module);
        Ok(id)
    }

    fn destroy_shader(&mut self, shader: ShaderId) {
        if let Some(module) = self.shaders.remove(&shader) {
            unsafe { self.ctx.device.destroy_shader_module(module, None) };
        }
    }

    fn create_raytracing_pipeline(&mut self, desc: &RaytracingPipelineDesc) -> GfxResult<PipelineId> {
        let layout = self.layout(desc.root_signature)?;
        let module = *self
            .shaders
            .get(&desc.library)
            .ok_or_else(|| invalid("shader", desc.library.0))?;
        let pipeline = unsafe {
            pipeline::create(
                &self.ctx.rt_pipeline_loader,
                layout,
                module,
                desc,
                self.ctx.rt_capabilities.max_ray_recursion_depth,
            )?
        };
        let id = PipelineId(self.next_id());
        self.pipelines.insert(id, pipeline);
        Ok(id)
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineId) {
        if let Some(pipeline) = self.pipelines.remove(&pipeline) {
            unsafe { self.ctx.device.destroy_pipeline(pipeline.handle, None) };
        }
    }

    fn shader_identifiers(&self, pipeline: PipelineId) -> GfxResult<Vec<u8>> {
        let pipeline = self.pipelines.get(&pipeline).ok_or_else(|| invalid("pipeline", pipeline.0))?;
        unsafe {
            pipeline::shader_group_handles(
                &self.ctx.rt_pipeline_loader,
                pipeline,
                self.ctx.rt_capabilities.shader_group_handle_size,
            )
        }
    }

    fn sbt_info(&self) -> SbtInfo {
        let caps = &self.ctx.rt_capabilities;
        SbtInfo {
            entry_size: caps.shader_group_handle_size,
            entry_alignment: caps.shader_group_handle_alignment,
            table_start_alignment: caps.shader_group_base_alignment,
        }
    }

    fn cmd_set_pipeline(&mut self, cmd: CommandListId, pipeline: PipelineId) -> GfxResult<()> {
        let cmd = self.cmd(cmd)?;
        let handle = self
            .pipelines
            .get(&pipeline)
            .ok_or_else(|| invalid("pipeline", pipeline.0))?
            .handle;
        unsafe {
            self.ctx
                .device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, handle)
        };
        Ok(())
    }

    fn cmd_push_constants(&mut self, cmd: CommandListId, root: RootSignatureId, data: &[u8]) -> GfxResult<()> {
        let cmd = self.cmd(cmd)?;
        let layout = self.layout(root)?;
        unsafe {
            self.ctx
                .device
                .cmd_push_constants(cmd, layout, RAYTRACING_STAGES, 0, data)
        };
        Ok(())
    }

    fn cmd_push_constant_buffer(
        &mut self,
        cmd: CommandListId,
        root: RootSignatureId,
        slot: u32,
        buffer: BufferId,
        offset: u64,
        size: u64,
    ) -> GfxResult<()> {
        let cmd = self.cmd(cmd)?;
        let layout = self.layout(root)?;
        let buffer_info = [vk::DescriptorBufferInfo {
            buffer: self.buffer(buffer)?.handle,
            offset,
            range: size,
        }];
        let write = vk::WriteDescriptorSet::default()
            .dst_binding(slot)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(&buffer_info);
        unsafe {
            self.ctx.push_descriptor_loader.cmd_push_descriptor_set(
                cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                layout,
                PUSH_SET,
                &[write],
            )
        };
        Ok(())
    }

    fn cmd_bind_descriptor_table(
        &mut self,
        cmd: CommandListId,
        root: RootSignatureId,
        table: DescriptorTableId,
    ) -> GfxResult<()> {
        let cmd = self.cmd(cmd)?;
        let layout = self.layout(root)?;
        let set = self
            .tables
            .get(&table)
            .ok_or_else(|| invalid("descriptor table", table.0))?
            .set;
        unsafe {
            self.ctx.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                layout,
                TABLE_SET,
                &[set],
                &[],
            )
        };
        Ok(())
    }

    fn cmd_dispatch_rays(&mut self, cmd: CommandListId, desc: &DispatchRaysDesc) -> GfxResult<()> {
        let cmd = self.cmd(cmd)?;
        let region = |r: StridedRegion| vk::StridedDeviceAddressRegionKHR {
            device_address: r.address,
            stride: r.stride,
            size: r.size,
        };
        unsafe {
            self.ctx.rt_pipeline_loader.cmd_trace_rays(
                cmd,
                &region(desc.raygen),
                &region(desc.miss),
                &region(desc.hit_group),
                &vk::StridedDeviceAddressRegionKHR::default(),
                desc.width,
                desc.height,
                desc.depth,
            )
        };
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        self.ctx.wait_idle();

        let leaked = self.buffers.len() + self.textures.len() + self.accels.len() + self.pipelines.len();
        if leaked > 0 {
            log::warn!("Releasing {} device objects still alive at shutdown", leaked);
        }

        let ids: Vec<_> = self.pipelines.keys().copied().collect();
        ids.into_iter().for_each(|id| self.destroy_pipeline(id));
        let ids: Vec<_> = self.shaders.keys().copied().collect();
        ids.into_iter().for_each(|id| self.destroy_shader(id));
        let ids: Vec<_> = self.tables.keys().copied().collect();
        ids.into_iter().for_each(|id| self.destroy_descriptor_table(id));
        let ids: Vec<_> = self.root_signatures.keys().copied().collect();
        ids.into_iter().for_each(|id| self.destroy_root_signature(id));
        let ids: Vec<_> = self.accels.keys().copied().collect();
        ids.into_iter().for_each(|id| self.destroy_acceleration_structure(id));
        let ids: Vec<_> = self.samplers.keys().copied().collect();
        ids.into_iter().for_each(|id| self.destroy_sampler(id));
        let ids: Vec<_> = self.textures.keys().copied().collect();
        ids.into_iter().for_each(|id| self.destroy_texture(id));
        let ids: Vec<_> = self.buffers.keys().copied().collect();
        ids.into_iter().for_each(|id| self.destroy_buffer(id));
        let ids: Vec<_> = self.fences.keys().copied().collect();
        ids.into_iter().for_each(|id| self.destroy_fence(id));
        let ids: Vec<_> = self.command_lists.keys().copied().collect();
        ids.into_iter().for_each(|id| self.destroy_command_list(id));

        unsafe {
            self.commands.destroy();
            self.descriptors.destroy();
        }
    }
}
