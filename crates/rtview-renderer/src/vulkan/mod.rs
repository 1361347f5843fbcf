//! Vulkan 1.3 backend with KHR ray tracing.
//!
//! [`VulkanDevice`] implements [`GraphicsDevice`](crate::gfx::GraphicsDevice)
//! over ash and gpu-allocator, and [`Swapchain`] implements
//! [`PresentationSurface`](crate::gfx::PresentationSurface).

pub mod commands;
pub mod context;
pub mod descriptors;
pub mod device;
pub mod memory;
pub mod raytracing;
pub mod samplers;
pub mod surface;
pub mod swapchain;

pub use commands::CommandManager;
pub use context::VulkanContext;
pub use descriptors::DescriptorManager;
pub use device::VulkanDevice;
pub use memory::{Buffer, Image, MemoryManager};
pub use surface::VulkanSurface;
pub use swapchain::Swapchain;

use ash::vk;
use std::ffi::CStr;

use crate::gfx::GfxError;

/// Map a failed Vulkan call onto the device error kinds.
pub(crate) fn vk_error(what: &str, result: vk::Result) -> GfxError {
    match result {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            GfxError::OutOfMemory(format!("{}: {:?}", what, result))
        }
        _ => GfxError::Backend(format!("{}: {:?}", what, result)),
    }
}

/// Minimum Vulkan version: sync2, timeline semaphores and buffer device address are core.
pub const REQUIRED_VK_VERSION: u32 = vk::make_api_version(0, 1, 3, 0);

/// Application name for Vulkan instance.
pub const APP_NAME: &CStr = c"rtview";

/// Engine name for Vulkan instance.
pub const ENGINE_NAME: &CStr = c"rtview";

pub const ENGINE_VERSION: u32 = vk::make_api_version(0, 1, 0, 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vk_error_classifies_memory() {
        assert!(matches!(
            vk_error("alloc", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            GfxError::OutOfMemory(_)
        ));
        assert!(matches!(vk_error("submit", vk::Result::ERROR_DEVICE_LOST), GfxError::Backend(_)));
    }
}
