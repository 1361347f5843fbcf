//! GPU memory management using gpu-allocator.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::sync::Arc;

use super::VulkanContext;
use crate::gfx::{BufferUsage, Format, GfxError, TextureUsage};

/// A buffer with its backing allocation.
pub struct Buffer {
    pub handle: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub device_address: Option<vk::DeviceAddress>,
}

impl Buffer {
    /// Copy `data` into the persistently mapped range at `offset`.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), GfxError> {
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|&end| end <= self.size)
            .ok_or_else(|| {
                GfxError::Validation(format!(
                    "write of {} bytes at {} overruns a {}-byte buffer",
                    data.len(),
                    offset,
                    self.size
                ))
            })?;
        let mapped = self
            .allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .ok_or_else(|| GfxError::Validation("buffer is not host visible".to_string()))?;
        mapped[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }
}

/// A 2D image. Swapchain images carry no allocation and are never destroyed here.
pub struct Image {
    pub handle: vk::Image,
    pub allocation: Option<Allocation>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

pub fn vk_format(format: Format) -> vk::Format {
    match format {
        Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
    }
}

pub fn buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::empty();
    for (ours, theirs) in [
        (BufferUsage::COPY_SRC, vk::BufferUsageFlags::TRANSFER_SRC),
        (BufferUsage::COPY_DST, vk::BufferUsageFlags::TRANSFER_DST),
        (BufferUsage::INDEX_BUFFER, vk::BufferUsageFlags::INDEX_BUFFER),
        (BufferUsage::VERTEX_BUFFER, vk::BufferUsageFlags::VERTEX_BUFFER),
        (BufferUsage::CONSTANT_BUFFER, vk::BufferUsageFlags::UNIFORM_BUFFER),
        (BufferUsage::STORAGE_BUFFER, vk::BufferUsageFlags::STORAGE_BUFFER),
        (
            BufferUsage::ACCELERATION_STRUCTURE_INPUT,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
        ),
        (
            BufferUsage::ACCELERATION_STRUCTURE_BUFFER,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR,
        ),
        (BufferUsage::SHADER_BINDING_TABLE, vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR),
    ] {
        if usage.contains(ours) {
            flags |= theirs;
        }
    }
    if usage.intersects(BufferUsage::ADDRESSABLE) {
        flags |= vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
    }
    flags
}

pub fn image_usage(usage: TextureUsage) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();
    if usage.contains(TextureUsage::COPY_SRC) {
        flags |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(TextureUsage::COPY_DST) {
        flags |= vk::ImageUsageFlags::TRANSFER_DST;
    }
    if usage.contains(TextureUsage::SHADER_RESOURCE) {
        flags |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(TextureUsage::UNORDERED_ACCESS) {
        flags |= vk::ImageUsageFlags::STORAGE;
    }
    flags
}

fn allocation_error(what: &str, error: gpu_allocator::AllocationError) -> GfxError {
    match error {
        gpu_allocator::AllocationError::OutOfMemory => GfxError::OutOfMemory(what.to_string()),
        other => GfxError::Backend(format!("Failed to allocate {} memory: {:?}", what, other)),
    }
}

/// Memory manager wrapping gpu-allocator.
pub struct MemoryManager {
    allocator: Arc<Mutex<Allocator>>,
    device: ash::Device,
}

impl MemoryManager {
    pub unsafe fn new(ctx: &VulkanContext) -> Result<Self, String> {
        let mut debug_settings = gpu_allocator::AllocatorDebugSettings::default();
        debug_settings.log_memory_information = cfg!(debug_assertions);
        debug_settings.log_leaks_on_shutdown = true;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: ctx.instance.clone(),
            device: ctx.device.clone(),
            physical_device: ctx.physical_device,
            debug_settings,
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| format!("Failed to create allocator: {:?}", e))?;

        Ok(Self {
            allocator: Arc::new(Mutex::new(allocator)),
            device: ctx.device.clone(),
        })
    }

    /// Create a buffer. `min_alignment` raises the allocation alignment
    /// above what the driver reports.
    pub unsafe fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        min_alignment: vk::DeviceSize,
        name: &str,
    ) -> Result<Buffer, GfxError> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size.max(1))
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = self
            .device
            .create_buffer(&buffer_info, None)
            .map_err(|e| super::vk_error("Failed to create buffer", e))?;

        let mut requirements = self.device.get_buffer_memory_requirements(handle);
        requirements.alignment = requirements.alignment.max(min_alignment);

        let allocation = match self.allocator.lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                self.device.destroy_buffer(handle, None);
                return Err(allocation_error(name, e));
            }
        };

        if let Err(e) = self
            .device
            .bind_buffer_memory(handle, allocation.memory(), allocation.offset())
        {
            self.device.destroy_buffer(handle, None);
            let _ = self.allocator.lock().free(allocation);
            return Err(super::vk_error("Failed to bind buffer memory", e));
        }

        let device_address = if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            let addr_info = vk::BufferDeviceAddressInfo::default().buffer(handle);
            Some(self.device.get_buffer_device_address(&addr_info))
        } else {
            None
        };

        Ok(Buffer {
            handle,
            allocation: Some(allocation),
            size,
            usage,
            device_address,
        })
    }

    /// Create a single-mip 2D image in `UNDEFINED` layout.
    pub unsafe fn create_image(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        name: &str,
    ) -> Result<Image, GfxError> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let handle = self
            .device
            .create_image(&image_info, None)
            .map_err(|e| super::vk_error("Failed to create image", e))?;

        let requirements = self.device.get_image_memory_requirements(handle);

        let allocation = match self.allocator.lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                self.device.destroy_image(handle, None);
                return Err(allocation_error(name, e));
            }
        };

        if let Err(e) = self
            .device
            .bind_image_memory(handle, allocation.memory(), allocation.offset())
        {
            self.device.destroy_image(handle, None);
            let _ = self.allocator.lock().free(allocation);
            return Err(super::vk_error("Failed to bind image memory", e));
        }

        Ok(Image {
            handle,
            allocation: Some(allocation),
            format,
            extent,
        })
    }

    pub unsafe fn destroy_buffer(&self, buffer: Buffer) {
        self.device.destroy_buffer(buffer.handle, None);
        if let Some(allocation) = buffer.allocation {
            let _ = self.allocator.lock().free(allocation);
        }
    }

    /// Destroy an owned image. Images without an allocation are left alone.
    pub unsafe fn destroy_image(&self, image: Image) {
        if let Some(allocation) = image.allocation {
            self.device.destroy_image(image.handle, None);
            let _ = self.allocator.lock().free(allocation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addressable_usages_get_device_address() {
        let flags = buffer_usage(BufferUsage::SHADER_BINDING_TABLE);
        assert!(flags.contains(vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR));
        assert!(flags.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));

        let flags = buffer_usage(BufferUsage::COPY_SRC);
        assert_eq!(flags, vk::BufferUsageFlags::TRANSFER_SRC);
    }

    #[test]
    fn test_image_usage_mapping() {
        let flags = image_usage(TextureUsage::UNORDERED_ACCESS | TextureUsage::COPY_SRC);
        assert_eq!(flags, vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC);
    }

    #[test]
    fn test_format_mapping() {
        assert_eq!(vk_format(Format::Bgra8Unorm), vk::Format::B8G8R8A8_UNORM);
        assert_eq!(vk_format(Format::Rgba8Unorm), vk::Format::R8G8B8A8_UNORM);
    }
}
