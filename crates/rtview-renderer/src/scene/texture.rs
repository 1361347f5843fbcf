//! Image decode and texture upload.

use std::path::Path;

use crate::gfx::immediate::submit_immediate;
use crate::gfx::{
    BarrierSync, BufferDesc, BufferUsage, Extent2D, Format, GraphicsDevice, MemoryLocation, TextureBarrier, TextureDesc,
    TextureId, TextureState, TextureUsage, ViewId, ViewKind,
};

use super::error::{GfxResultExt, RenderError, RenderResult};

/// What to do when a texture file cannot be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TexturePolicy {
    /// Fail the load with [`RenderError::Import`].
    #[default]
    Strict,
    /// Log a warning and upload [`DecodedImage::placeholder`].
    Placeholder,
}

/// Tightly packed RGBA8 pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl DecodedImage {
    /// 1x1 opaque magenta.
    pub fn placeholder() -> Self {
        Self {
            width: 1,
            height: 1,
            pixels: vec![255, 0, 255, 255],
        }
    }

    pub fn extent(&self) -> Extent2D {
        Extent2D::new(self.width, self.height)
    }
}

pub fn decode_rgba8(path: &Path) -> Result<DecodedImage, String> {
    let image = image::open(path).map_err(|e| e.to_string())?.to_rgba8();
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err("image has no pixels".to_string());
    }
    Ok(DecodedImage {
        width,
        height,
        pixels: image.into_raw(),
    })
}

/// A sampled texture and its read-only view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Texture {
    pub texture: TextureId,
    pub view: ViewId,
    pub extent: Extent2D,
}

impl Texture {
    pub fn load<G: GraphicsDevice>(gfx: &mut G, path: &Path, policy: TexturePolicy) -> RenderResult<Self> {
        let image = match (decode_rgba8(path), policy) {
            (Ok(image), _) => image,
            (Err(reason), TexturePolicy::Strict) => {
                return Err(RenderError::Import {
                    path: path.to_path_buf(),
                    reason,
                })
            }
            (Err(reason), TexturePolicy::Placeholder) => {
                log::warn!("Cannot decode {:?} ({}), using a placeholder", path, reason);
                DecodedImage::placeholder()
            }
        };
        log::debug!("Uploading {:?} ({}x{})", path, image.width, image.height);
        Self::upload(gfx, &image)
    }

    /// Upload through a staging buffer in a one-shot submission. The texture
    /// ends in `ShaderResource` state.
    pub fn upload<G: GraphicsDevice>(gfx: &mut G, image: &DecodedImage) -> RenderResult<Self> {
        let extent = image.extent();
        let texture = gfx
            .create_texture(&TextureDesc {
                extent,
                format: Format::Rgba8Unorm,
                usage: TextureUsage::COPY_DST | TextureUsage::SHADER_RESOURCE,
                name: "asset texture",
            })
            .creating("texture")?;

        let staging = match gfx
            .create_buffer(&BufferDesc {
                size: image.pixels.len() as u64,
                usage: BufferUsage::COPY_SRC,
                location: MemoryLocation::Upload,
                name: "texture staging",
            })
            .creating("texture staging buffer")
        {
            Ok(staging) => staging,
            Err(e) => {
                gfx.destroy_texture(texture);
                return Err(e);
            }
        };

        let uploaded = gfx.write_buffer(staging, 0, &image.pixels).map_err(RenderError::from).and_then(|()| {
            submit_immediate(gfx, |gfx, cmd| -> RenderResult<()> {
                gfx.cmd_texture_barriers(
                    cmd,
                    &[TextureBarrier::transition(
                        texture,
                        (BarrierSync::None, TextureState::Undefined),
                        (BarrierSync::Copy, TextureState::CopyDest),
                    )],
                )?;
                gfx.cmd_copy_buffer_to_texture(cmd, staging, texture, extent)?;
                gfx.cmd_texture_barriers(
                    cmd,
                    &[TextureBarrier::transition(
                        texture,
                        (BarrierSync::Copy, TextureState::CopyDest),
                        (BarrierSync::Raytracing, TextureState::ShaderResource),
                    )],
                )?;
                Ok(())
            })
        });
        gfx.destroy_buffer(staging);

        match uploaded.and_then(|()| {
            gfx.create_texture_view(texture, ViewKind::ShaderResource)
                .creating("texture view")
        }) {
            Ok(view) => Ok(Self { texture, view, extent }),
            Err(e) => {
                gfx.destroy_texture(texture);
                Err(e)
            }
        }
    }

    pub fn destroy<G: GraphicsDevice>(self, gfx: &mut G) {
        gfx.destroy_texture(self.texture);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::mock::MockDevice;

    fn write_png(dir: &Path, name: &str, width: u32, height: u32) -> std::path::PathBuf {
        let path = dir.join(name);
        let image = image::RgbaImage::from_fn(width, height, |x, y| image::Rgba([x as u8, y as u8, 7, 255]));
        image.save(&path).unwrap();
        path
    }

    #[test]
    fn test_decode_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "a.png", 3, 2);
        let decoded = decode_rgba8(&path).unwrap();
        assert_eq!((decoded.width, decoded.height), (3, 2));
        assert_eq!(decoded.pixels.len(), 24);
        assert_eq!(&decoded.pixels[4..8], &[1, 0, 7, 255]);
    }

    #[test]
    fn test_upload_ends_in_shader_resource() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "a.png", 4, 4);
        let mut gfx = MockDevice::new();
        let texture = Texture::load(&mut gfx, &path, TexturePolicy::Strict).unwrap();
        assert_eq!(gfx.texture_state(texture.texture), Some(TextureState::ShaderResource));
        assert_eq!(texture.extent, Extent2D::new(4, 4));
        assert_eq!(&gfx.texture_data(texture.texture).unwrap()[4..8], &[1, 0, 7, 255]);
        // Staging buffer and transient submission objects are gone.
        assert_eq!(gfx.live_buffers(), 0);
        assert_eq!(gfx.live_command_lists(), 0);
    }

    #[test]
    fn test_strict_policy_fails_on_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"not a png").unwrap();
        let mut gfx = MockDevice::new();
        let err = Texture::load(&mut gfx, &path, TexturePolicy::Strict).unwrap_err();
        assert!(matches!(err, RenderError::Import { .. }));
    }

    #[test]
    fn test_placeholder_policy_uploads_magenta() {
        let mut gfx = MockDevice::new();
        let texture = Texture::load(&mut gfx, Path::new("/missing.png"), TexturePolicy::Placeholder).unwrap();
        assert_eq!(texture.extent, Extent2D::new(1, 1));
        assert_eq!(gfx.texture_data(texture.texture).unwrap(), &[255, 0, 255, 255]);
    }

    #[test]
    fn test_allocation_failure_is_resource_creation() {
        let mut gfx = MockDevice::new();
        gfx.fail_allocations_after(0);
        let err = Texture::upload(&mut gfx, &DecodedImage::placeholder()).unwrap_err();
        assert!(matches!(err, RenderError::ResourceCreation { what: "texture", .. }));
    }

    #[test]
    fn test_staging_failure_releases_texture() {
        let mut gfx = MockDevice::new();
        gfx.fail_allocations_after(1);
        let err = Texture::upload(&mut gfx, &DecodedImage::placeholder()).unwrap_err();
        assert!(matches!(err, RenderError::ResourceCreation { what: "texture staging buffer", .. }));
        assert_eq!(gfx.live_textures(), 0);
        assert_eq!(gfx.live_buffers(), 0);
    }
}
