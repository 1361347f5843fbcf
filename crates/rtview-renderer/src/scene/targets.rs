//! Off-screen output images, one per in-flight frame.

use crate::gfx::immediate::transition_textures;
use crate::gfx::{
    BarrierSync, DescriptorResource, DescriptorTableId, Extent2D, Format, GraphicsDevice, TextureBarrier, TextureDesc,
    TextureId, TextureState, TextureUsage, ViewId, ViewKind,
};
use crate::FLIGHT_FRAMES;

use super::error::{GfxResultExt, RenderResult};
use super::pipeline::OUTPUT_SLOT;

/// Clamp each dimension to at least 1.
pub fn clamp_extent(width: u32, height: u32) -> Extent2D {
    if width == 0 || height == 0 {
        log::warn!("Zero-sized extent {}x{} clamped to at least 1x1", width, height);
    }
    Extent2D::new(width.max(1), height.max(1))
}

/// Storage images written by ray dispatches and copied to the surface.
/// Outside a frame's copy they stay in `UnorderedAccess`.
pub struct FrameTargets {
    images: [TextureId; FLIGHT_FRAMES],
    views: [ViewId; FLIGHT_FRAMES],
    extent: Extent2D,
    format: Format,
}

impl FrameTargets {
    pub fn create<G: GraphicsDevice>(gfx: &mut G, extent: Extent2D, format: Format) -> RenderResult<Self> {
        let mut images = Vec::with_capacity(FLIGHT_FRAMES);
        let mut views = Vec::with_capacity(FLIGHT_FRAMES);
        for _ in 0..FLIGHT_FRAMES {
            let image = gfx
                .create_texture(&TextureDesc {
                    extent,
                    format,
                    usage: TextureUsage::UNORDERED_ACCESS | TextureUsage::COPY_SRC,
                    name: "frame target",
                })
                .creating("frame target")?;
            images.push(image);
            views.push(
                gfx.create_texture_view(image, ViewKind::UnorderedAccess)
                    .creating("frame target view")?,
            );
        }

        let barriers: Vec<TextureBarrier> = images
            .iter()
            .map(|&image| {
                TextureBarrier::transition(
                    image,
                    (BarrierSync::None, TextureState::Undefined),
                    (BarrierSync::Raytracing, TextureState::UnorderedAccess),
                )
            })
            .collect();
        transition_textures(gfx, &barriers)?;

        log::debug!("Frame targets {}x{} {:?}", extent.width, extent.height, format);
        let mut targets = Self {
            images: [TextureId(0); FLIGHT_FRAMES],
            views: [ViewId(0); FLIGHT_FRAMES],
            extent,
            format,
        };
        targets.images.copy_from_slice(&images);
        targets.views.copy_from_slice(&views);
        Ok(targets)
    }

    /// Write every target view into [`OUTPUT_SLOT`].
    pub fn bind<G: GraphicsDevice>(&self, gfx: &mut G, table: DescriptorTableId) -> RenderResult<()> {
        for (index, view) in self.views.iter().enumerate() {
            gfx.write_descriptor(table, OUTPUT_SLOT, index as u32, DescriptorResource::StorageTexture(*view))?;
        }
        Ok(())
    }

    pub fn image(&self, frame_index: usize) -> TextureId {
        self.images[frame_index % FLIGHT_FRAMES]
    }

    pub fn extent(&self) -> Extent2D {
        self.extent
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn destroy<G: GraphicsDevice>(self, gfx: &mut G) {
        for image in self.images {
            gfx.destroy_texture(image);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::mock::MockDevice;

    #[test]
    fn test_clamp_extent() {
        assert_eq!(clamp_extent(0, 0), Extent2D::new(1, 1));
        assert_eq!(clamp_extent(0, 480), Extent2D::new(1, 480));
        assert_eq!(clamp_extent(640, 480), Extent2D::new(640, 480));
    }

    #[test]
    fn test_targets_start_writable() {
        let mut gfx = MockDevice::new();
        let targets = FrameTargets::create(&mut gfx, Extent2D::new(8, 6), Format::Bgra8Unorm).unwrap();
        for frame in 0..FLIGHT_FRAMES {
            assert_eq!(gfx.texture_state(targets.image(frame)), Some(TextureState::UnorderedAccess));
            assert_eq!(gfx.texture_extent(targets.image(frame)), Some(Extent2D::new(8, 6)));
        }
        assert_ne!(targets.image(0), targets.image(1));
        targets.destroy(&mut gfx);
        assert_eq!(gfx.live_textures(), 0);
    }
}
