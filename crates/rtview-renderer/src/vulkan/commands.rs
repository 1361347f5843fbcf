//! Command buffer management and barrier translation.

use ash::vk;

use super::VulkanContext;
use crate::gfx::{BarrierSync, GfxError, ResourceAccess, TextureState};

/// Owns the command pool every command list is allocated from.
pub struct CommandManager {
    pool: vk::CommandPool,
    device: ash::Device,
}

impl CommandManager {
    pub unsafe fn new(ctx: &VulkanContext) -> Result<Self, String> {
        let graphics_family = ctx.queue_families.graphics.ok_or("No graphics queue family")?;

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(graphics_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = ctx
            .device
            .create_command_pool(&pool_info, None)
            .map_err(|e| format!("Failed to create command pool: {:?}", e))?;

        Ok(Self {
            pool,
            device: ctx.device.clone(),
        })
    }

    pub unsafe fn allocate(&self) -> Result<vk::CommandBuffer, GfxError> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = self
            .device
            .allocate_command_buffers(&alloc_info)
            .map_err(|e| super::vk_error("Failed to allocate command buffer", e))?;
        buffers
            .into_iter()
            .next()
            .ok_or_else(|| GfxError::Backend("driver returned no command buffer".to_string()))
    }

    pub unsafe fn free(&self, cmd: vk::CommandBuffer) {
        self.device.free_command_buffers(self.pool, &[cmd]);
    }

    /// Reset and begin recording a one-time-submit buffer.
    pub unsafe fn begin(&self, cmd: vk::CommandBuffer) -> Result<(), GfxError> {
        self.device
            .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
            .map_err(|e| super::vk_error("Failed to reset command buffer", e))?;

        let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        self.device
            .begin_command_buffer(cmd, &begin_info)
            .map_err(|e| super::vk_error("Failed to begin command buffer", e))
    }

    pub unsafe fn end(&self, cmd: vk::CommandBuffer) -> Result<(), GfxError> {
        self.device
            .end_command_buffer(cmd)
            .map_err(|e| super::vk_error("Failed to end command buffer", e))
    }

    /// Copy a tightly packed buffer into mip 0 of an image in `TRANSFER_DST_OPTIMAL`.
    pub unsafe fn copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        image: vk::Image,
        extent: vk::Extent2D,
    ) {
        let region = vk::BufferImageCopy::default()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(color_layers())
            .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
            .image_extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            });

        self.device
            .cmd_copy_buffer_to_image(cmd, buffer, image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, &[region]);
    }

    pub unsafe fn copy_image(&self, cmd: vk::CommandBuffer, src: vk::Image, dst: vk::Image, extent: vk::Extent2D) {
        let region = vk::ImageCopy::default()
            .src_subresource(color_layers())
            .dst_subresource(color_layers())
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            });

        self.device.cmd_copy_image(
            cmd,
            src,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );
    }

    pub unsafe fn destroy(&mut self) {
        self.device.destroy_command_pool(self.pool, None);
        self.pool = vk::CommandPool::null();
    }
}

fn color_layers() -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    }
}

pub fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: vk::REMAINING_MIP_LEVELS,
        base_array_layer: 0,
        layer_count: vk::REMAINING_ARRAY_LAYERS,
    }
}

pub fn stage_mask(sync: BarrierSync) -> vk::PipelineStageFlags2 {
    match sync {
        BarrierSync::None => vk::PipelineStageFlags2::NONE,
        BarrierSync::All => vk::PipelineStageFlags2::ALL_COMMANDS,
        BarrierSync::Copy => vk::PipelineStageFlags2::COPY,
        BarrierSync::Raytracing => vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
        BarrierSync::BuildAccelerationStructure => vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
    }
}

pub fn access_mask(access: ResourceAccess) -> vk::AccessFlags2 {
    match access {
        ResourceAccess::NoAccess => vk::AccessFlags2::NONE,
        ResourceAccess::CopySource => vk::AccessFlags2::TRANSFER_READ,
        ResourceAccess::CopyDest => vk::AccessFlags2::TRANSFER_WRITE,
        ResourceAccess::UnorderedAccess => {
            vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE
        }
        ResourceAccess::ShaderResource => vk::AccessFlags2::SHADER_READ,
        ResourceAccess::ConstantBuffer => vk::AccessFlags2::UNIFORM_READ,
        ResourceAccess::AccelerationStructureRead => vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
        ResourceAccess::AccelerationStructureWrite => vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
    }
}

pub fn image_layout(state: TextureState) -> vk::ImageLayout {
    match state {
        TextureState::Undefined => vk::ImageLayout::UNDEFINED,
        TextureState::UnorderedAccess => vk::ImageLayout::GENERAL,
        TextureState::CopySource => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        TextureState::CopyDest => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        TextureState::ShaderResource => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        TextureState::Present => vk::ImageLayout::PRESENT_SRC_KHR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_mapping() {
        assert_eq!(image_layout(TextureState::UnorderedAccess), vk::ImageLayout::GENERAL);
        assert_eq!(image_layout(TextureState::Present), vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(image_layout(TextureState::Undefined), vk::ImageLayout::UNDEFINED);
    }

    #[test]
    fn test_build_barrier_masks() {
        assert_eq!(
            stage_mask(BarrierSync::BuildAccelerationStructure),
            vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR
        );
        assert_eq!(
            access_mask(ResourceAccess::AccelerationStructureWrite),
            vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR
        );
        assert_eq!(access_mask(ResourceAccess::NoAccess), vk::AccessFlags2::NONE);
    }
}
