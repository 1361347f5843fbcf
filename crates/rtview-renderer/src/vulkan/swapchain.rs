//! Vulkan swapchain as the viewer's presentation surface.
//!
//! Swapchain images are imported into the [`VulkanDevice`] as textures so the
//! scene can barrier and copy into them like any other image. They rest in
//! `Present` state between frames.

use ash::vk;

use super::device::PresentSync;
use super::{VulkanDevice, VulkanSurface};
use crate::gfx::immediate::transition_textures;
use crate::gfx::{
    BarrierSync, Extent2D, Format, GfxError, GfxResult, GraphicsDevice, PresentationSurface, TextureBarrier, TextureId, TextureState,
};
use crate::FLIGHT_FRAMES;

/// Per-frame synchronization primitives.
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
}

pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    surface: VulkanSurface,
    images: Vec<vk::Image>,
    textures: Vec<TextureId>,
    extent: vk::Extent2D,
    frame_sync: Vec<FrameSync>,
    /// Swapchain image acquired for each in-flight frame.
    frame_images: [u32; FLIGHT_FRAMES],
    current_frame: usize,
    frame_counter: usize,
    acquired: bool,
}

impl Swapchain {
    pub fn new(gfx: &mut VulkanDevice, surface: VulkanSurface, width: u32, height: u32) -> GfxResult<Self> {
        let frame_sync = Self::create_sync_objects(gfx)?;

        let mut swapchain = Self {
            handle: vk::SwapchainKHR::null(),
            surface,
            images: Vec::new(),
            textures: Vec::new(),
            extent: vk::Extent2D { width, height },
            frame_sync,
            frame_images: [0; FLIGHT_FRAMES],
            current_frame: 0,
            frame_counter: 0,
            acquired: false,
        };
        swapchain.create(gfx, width, height)?;
        Ok(swapchain)
    }

    /// (Re)create the swapchain, retiring the previous one.
    fn create(&mut self, gfx: &mut VulkanDevice, width: u32, height: u32) -> GfxResult<()> {
        let ctx = gfx.context();
        unsafe { self.surface.refresh_capabilities(ctx)? };
        let capabilities = self.surface.capabilities;
        let extent = self.surface.get_extent(width.max(1), height.max(1));

        let max_images = if capabilities.max_image_count == 0 {
            u32::MAX
        } else {
            capabilities.max_image_count
        };
        let image_count = (FLIGHT_FRAMES as u32)
            .max(capabilities.min_image_count)
            .min(max_images);

        let old_swapchain = self.handle;
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface.handle)
            .min_image_count(image_count)
            .image_format(self.surface.format.format)
            .image_color_space(self.surface.format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(self.surface.present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let handle = unsafe {
            ctx.swapchain_loader
                .create_swapchain(&create_info, None)
                .map_err(|e| super::vk_error("Failed to create swapchain", e))?
        };

        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe { ctx.swapchain_loader.destroy_swapchain(old_swapchain, None) };
        }

        let images = unsafe {
            ctx.swapchain_loader
                .get_swapchain_images(handle)
                .map_err(|e| super::vk_error("Failed to get swapchain images", e))?
        };

        self.handle = handle;
        self.extent = extent;
        let format = self.surface.format.format;
        self.textures = images
            .iter()
            .map(|&image| gfx.import_texture(image, format, extent))
            .collect();
        self.images = images;

        let barriers: Vec<_> = self
            .textures
            .iter()
            .map(|&texture| {
                TextureBarrier::transition(
                    texture,
                    (BarrierSync::None, TextureState::Undefined),
                    (BarrierSync::All, TextureState::Present),
                )
            })
            .collect();
        transition_textures(gfx, &barriers)?;

        log::info!(
            "Swapchain {}x{} with {} images ({:?})",
            extent.width,
            extent.height,
            self.images.len(),
            self.surface.present_mode
        );
        Ok(())
    }

    fn create_sync_objects(gfx: &VulkanDevice) -> GfxResult<Vec<FrameSync>> {
        let device = &gfx.context().device;
        let semaphore_info = vk::SemaphoreCreateInfo::default();

        (0..FLIGHT_FRAMES)
            .map(|_| unsafe {
                let image_available = device
                    .create_semaphore(&semaphore_info, None)
                    .map_err(|e| super::vk_error("Failed to create semaphore", e))?;
                let render_finished = device
                    .create_semaphore(&semaphore_info, None)
                    .map_err(|e| super::vk_error("Failed to create semaphore", e))?;

                Ok(FrameSync {
                    image_available,
                    render_finished,
                })
            })
            .collect()
    }

    fn release_textures(&mut self, gfx: &mut VulkanDevice) {
        for texture in self.textures.drain(..) {
            gfx.forget_texture(texture);
        }
        self.images.clear();
    }

    fn recreate(&mut self, gfx: &mut VulkanDevice, width: u32, height: u32) -> GfxResult<()> {
        gfx.context().wait_idle();
        self.release_textures(gfx);
        self.create(gfx, width, height)
    }

    pub fn destroy(mut self, gfx: &mut VulkanDevice) {
        gfx.context().wait_idle();
        self.release_textures(gfx);

        let ctx = gfx.context();
        unsafe {
            for sync in &self.frame_sync {
                ctx.device.destroy_semaphore(sync.image_available, None);
                ctx.device.destroy_semaphore(sync.render_finished, None);
            }
            ctx.swapchain_loader.destroy_swapchain(self.handle, None);
            self.surface.destroy(ctx);
        }
    }
}

impl PresentationSurface<VulkanDevice> for Swapchain {
    fn format(&self) -> Format {
        self.surface.gfx_format()
    }

    fn extent(&self) -> Extent2D {
        Extent2D::new(self.extent.width, self.extent.height)
    }

    fn acquire(&mut self, gfx: &mut VulkanDevice) -> GfxResult<usize> {
        if self.acquired {
            return Err(GfxError::Validation("swapchain image acquired twice".to_string()));
        }

        let frame = self.frame_counter % FLIGHT_FRAMES;
        let sync = &self.frame_sync[frame];
        let (image_available, render_finished) = (sync.image_available, sync.render_finished);

        let mut result = unsafe {
            gfx.context()
                .swapchain_loader
                .acquire_next_image(self.handle, u64::MAX, image_available, vk::Fence::null())
        };
        if result == Err(vk::Result::ERROR_OUT_OF_DATE_KHR) {
            log::debug!("Swapchain out of date on acquire, recreating");
            let (width, height) = (self.extent.width, self.extent.height);
            self.recreate(gfx, width, height)?;
            result = unsafe {
                gfx.context()
                    .swapchain_loader
                    .acquire_next_image(self.handle, u64::MAX, image_available, vk::Fence::null())
            };
        }

        let (index, suboptimal) = result.map_err(|e| super::vk_error("Failed to acquire swapchain image", e))?;
        if suboptimal {
            log::debug!("Swapchain suboptimal");
        }

        gfx.arm_present_sync(PresentSync {
            wait: image_available,
            signal: render_finished,
        });
        self.frame_images[frame] = index;
        self.current_frame = frame;
        self.acquired = true;
        Ok(frame)
    }

    fn current_frame(&self) -> usize {
        self.current_frame
    }

    fn texture(&self, frame_index: usize) -> TextureId {
        let image = self.frame_images[frame_index % FLIGHT_FRAMES] as usize;
        self.textures[image.min(self.textures.len().saturating_sub(1))]
    }

    fn present(&mut self, gfx: &mut VulkanDevice) -> GfxResult<()> {
        if !self.acquired {
            return Err(GfxError::Validation("present without acquire".to_string()));
        }

        let ctx = gfx.context();
        let swapchains = [self.handle];
        let image_indices = [self.frame_images[self.current_frame]];
        let wait_semaphores = [self.frame_sync[self.current_frame].render_finished];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { ctx.swapchain_loader.queue_present(ctx.graphics_queue, &present_info) };

        self.acquired = false;
        self.frame_counter += 1;

        match result {
            Ok(false) => Ok(()),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                let (width, height) = (self.extent.width, self.extent.height);
                self.recreate(gfx, width, height)
            }
            Err(e) => Err(super::vk_error("Failed to present", e)),
        }
    }

    fn resize(&mut self, gfx: &mut VulkanDevice, width: u32, height: u32) -> GfxResult<()> {
        self.acquired = false;
        self.frame_counter = 0;
        self.recreate(gfx, width, height)
    }

    fn throttle(&mut self, gfx: &mut VulkanDevice) -> GfxResult<()> {
        gfx.wait_idle()
    }
}
