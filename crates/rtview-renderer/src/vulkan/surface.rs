//! Vulkan surface creation from window handles.

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};

use super::VulkanContext;
use crate::gfx::Format;

/// Wrapper around a Vulkan surface.
pub struct VulkanSurface {
    pub handle: vk::SurfaceKHR,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub capabilities: vk::SurfaceCapabilitiesKHR,
}

impl VulkanSurface {
    /// Create a new Vulkan surface from window handles.
    ///
    /// # Safety
    /// The window handles must be valid and outlive the surface.
    pub unsafe fn new(
        ctx: &VulkanContext,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        vsync: bool,
    ) -> Result<Self, String> {
        let handle = ash_window::create_surface(&ctx.entry, &ctx.instance, display_handle, window_handle, None)
            .map_err(|e| format!("Failed to create Vulkan surface: {:?}", e))?;

        let graphics_family = ctx.queue_families.graphics.ok_or("No graphics queue family")?;
        let can_present = ctx
            .surface_loader
            .get_physical_device_surface_support(ctx.physical_device, graphics_family, handle)
            .unwrap_or(false);
        if !can_present {
            ctx.surface_loader.destroy_surface(handle, None);
            return Err("Selected GPU cannot present to this window".to_string());
        }

        let capabilities = ctx
            .surface_loader
            .get_physical_device_surface_capabilities(ctx.physical_device, handle)
            .map_err(|e| format!("Failed to get surface capabilities: {:?}", e))?;

        let formats = ctx
            .surface_loader
            .get_physical_device_surface_formats(ctx.physical_device, handle)
            .map_err(|e| format!("Failed to get surface formats: {:?}", e))?;

        let format = Self::choose_surface_format(&formats)
            .ok_or("Surface supports neither B8G8R8A8_UNORM nor R8G8B8A8_UNORM")?;

        let present_modes = ctx
            .surface_loader
            .get_physical_device_surface_present_modes(ctx.physical_device, handle)
            .map_err(|e| format!("Failed to get present modes: {:?}", e))?;

        let present_mode = Self::choose_present_mode(&present_modes, vsync);
        log::debug!("Surface format {:?}, present mode {:?}", format.format, present_mode);

        Ok(Self {
            handle,
            format,
            present_mode,
            capabilities,
        })
    }

    /// Create a surface from a winit window.
    pub unsafe fn from_winit(ctx: &VulkanContext, window: &winit::window::Window, vsync: bool) -> Result<Self, String> {
        let display_handle = window
            .display_handle()
            .map_err(|e| format!("Failed to get display handle: {:?}", e))?
            .as_raw();
        let window_handle = window
            .window_handle()
            .map_err(|e| format!("Failed to get window handle: {:?}", e))?
            .as_raw();

        Self::new(ctx, display_handle, window_handle, vsync)
    }

    /// Ray dispatches write linear values, so only UNORM formats qualify.
    pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
        [vk::Format::B8G8R8A8_UNORM, vk::Format::R8G8B8A8_UNORM]
            .iter()
            .find_map(|&wanted| formats.iter().find(|f| f.format == wanted).copied())
    }

    pub fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
        if vsync {
            return vk::PresentModeKHR::FIFO;
        }

        if modes.contains(&vk::PresentModeKHR::MAILBOX) {
            return vk::PresentModeKHR::MAILBOX;
        }

        if modes.contains(&vk::PresentModeKHR::IMMEDIATE) {
            return vk::PresentModeKHR::IMMEDIATE;
        }

        vk::PresentModeKHR::FIFO
    }

    /// The surface format as seen by the scene.
    pub fn gfx_format(&self) -> Format {
        if self.format.format == vk::Format::R8G8B8A8_UNORM {
            Format::Rgba8Unorm
        } else {
            Format::Bgra8Unorm
        }
    }

    pub unsafe fn refresh_capabilities(&mut self, ctx: &VulkanContext) -> Result<(), String> {
        self.capabilities = ctx
            .surface_loader
            .get_physical_device_surface_capabilities(ctx.physical_device, self.handle)
            .map_err(|e| format!("Failed to refresh surface capabilities: {:?}", e))?;
        Ok(())
    }

    /// Get the current extent, clamped to surface capabilities.
    pub fn get_extent(&self, desired_width: u32, desired_height: u32) -> vk::Extent2D {
        if self.capabilities.current_extent.width != u32::MAX {
            self.capabilities.current_extent
        } else {
            vk::Extent2D {
                width: desired_width.clamp(
                    self.capabilities.min_image_extent.width,
                    self.capabilities.max_image_extent.width,
                ),
                height: desired_height.clamp(
                    self.capabilities.min_image_extent.height,
                    self.capabilities.max_image_extent.height,
                ),
            }
        }
    }

    pub unsafe fn destroy(&mut self, ctx: &VulkanContext) {
        ctx.surface_loader.destroy_surface(self.handle, None);
        self.handle = vk::SurfaceKHR::null();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn test_surface_format_prefers_bgra_unorm() {
        let formats = [
            format(vk::Format::B8G8R8A8_SRGB),
            format(vk::Format::R8G8B8A8_UNORM),
            format(vk::Format::B8G8R8A8_UNORM),
        ];
        assert_eq!(
            VulkanSurface::choose_surface_format(&formats).map(|f| f.format),
            Some(vk::Format::B8G8R8A8_UNORM)
        );
        assert!(VulkanSurface::choose_surface_format(&[format(vk::Format::B8G8R8A8_SRGB)]).is_none());
    }

    #[test]
    fn test_present_mode() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(VulkanSurface::choose_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
        assert_eq!(VulkanSurface::choose_present_mode(&modes, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            VulkanSurface::choose_present_mode(&[vk::PresentModeKHR::FIFO], false),
            vk::PresentModeKHR::FIFO
        );
    }
}
