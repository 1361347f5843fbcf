//! Renderer core: owns the asset, pipeline, acceleration structures, frame
//! targets and camera, and records the per-frame GPU work.
//!
//! Setup order is `new` -> `create_pipelines` -> `resize` ->
//! `create_top_level_structure` -> `bind`. Steps called before their
//! prerequisite fail with [`RenderError::OutOfOrder`].

pub mod asset;
pub mod camera;
pub mod error;
pub mod mesh;
pub mod pipeline;
pub mod sbt;
pub mod slab;
pub mod targets;
pub mod texture;
pub mod tlas;

use std::path::{Path, PathBuf};

use crate::gfx::{
    BarrierSync, BufferDesc, BufferId, BufferUsage, CommandListId, DescriptorResource, Extent2D, Format,
    GraphicsDevice, MemoryLocation, TextureBarrier, TextureId, TextureState,
};
use crate::FLIGHT_FRAMES;

use asset::{Asset, TEXTURE_COUNT};
use camera::{Camera, CameraConstants, FAR_PLANE, FIELD_OF_VIEW, NEAR_PLANE};
pub use error::{RenderError, RenderResult};
use error::GfxResultExt;
use pipeline::{RaytracingPipeline, CAMERA_SLOT, TLAS_SLOT};
use slab::AlignedSlab;
use targets::{clamp_extent, FrameTargets};
use texture::TexturePolicy;
use tlas::TopLevelStructure;

/// Constant buffer placement alignment.
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

/// What the scene loads and where it renders.
#[derive(Debug, Clone)]
pub struct SceneDesc<'a> {
    pub mesh_path: &'a Path,
    pub texture_paths: &'a [PathBuf; TEXTURE_COUNT],
    pub texture_policy: TexturePolicy,
    pub output_format: Format,
}

pub struct Scene {
    asset: Asset,
    camera: Camera,
    camera_buffer: BufferId,
    camera_slab: AlignedSlab,
    /// Camera generation last written to each slot.
    slot_generations: [Option<u64>; FLIGHT_FRAMES],
    output_format: Format,
    pipeline: Option<RaytracingPipeline>,
    targets: Option<FrameTargets>,
    tlas: Option<TopLevelStructure>,
}

impl Scene {
    pub fn new<G: GraphicsDevice>(gfx: &mut G, desc: &SceneDesc) -> RenderResult<Self> {
        let asset = Asset::load(gfx, desc.mesh_path, desc.texture_paths, desc.texture_policy)?;
        Self::with_asset(gfx, asset, desc.output_format)
    }

    /// Wrap an already loaded asset and allocate the camera constant slots.
    pub fn with_asset<G: GraphicsDevice>(gfx: &mut G, asset: Asset, output_format: Format) -> RenderResult<Self> {
        let camera_slab = AlignedSlab::new(CameraConstants::SIZE as u64, CONSTANT_BUFFER_ALIGNMENT, FLIGHT_FRAMES);
        let camera_buffer = gfx
            .create_buffer(&BufferDesc {
                size: camera_slab.total_size(),
                usage: BufferUsage::CONSTANT_BUFFER,
                location: MemoryLocation::Upload,
                name: "camera constants",
            })
            .creating("camera constant buffer")?;

        Ok(Self {
            asset,
            camera: Camera::new(),
            camera_buffer,
            camera_slab,
            slot_generations: [None; FLIGHT_FRAMES],
            output_format,
            pipeline: None,
            targets: None,
            tlas: None,
        })
    }

    pub fn create_pipelines<G: GraphicsDevice>(&mut self, gfx: &mut G, shader_dir: &Path) -> RenderResult<()> {
        if self.pipeline.is_some() {
            return Err(RenderError::Build("pipelines already created".to_string()));
        }
        self.pipeline = Some(RaytracingPipeline::create(gfx, shader_dir)?);
        Ok(())
    }

    /// Reallocate the frame targets at the new size and update the projection.
    pub fn resize<G: GraphicsDevice>(&mut self, gfx: &mut G, width: u32, height: u32) -> RenderResult<()> {
        let table = self
            .pipeline
            .as_ref()
            .ok_or(RenderError::OutOfOrder("resize", "create_pipelines"))?
            .descriptor_table;
        let extent = clamp_extent(width, height);

        if let Some(old) = self.targets.take() {
            gfx.wait_idle()?;
            old.destroy(gfx);
        }

        let targets = FrameTargets::create(gfx, extent, self.output_format)?;
        targets.bind(gfx, table)?;
        self.targets = Some(targets);

        self.camera
            .set_perspective(FIELD_OF_VIEW, extent.aspect_ratio(), NEAR_PLANE, FAR_PLANE);
        log::info!("Resized to {}x{}", extent.width, extent.height);
        Ok(())
    }

    /// Build the TLAS. A scene builds it once; later calls fail and leave it alone.
    pub fn create_top_level_structure<G: GraphicsDevice>(&mut self, gfx: &mut G) -> RenderResult<()> {
        if self.tlas.is_some() {
            return Err(RenderError::Build("top-level structure already built".to_string()));
        }
        self.tlas = Some(TopLevelStructure::build(gfx, &self.asset)?);
        Ok(())
    }

    /// Write the TLAS and the asset textures into the descriptor table.
    pub fn bind<G: GraphicsDevice>(&mut self, gfx: &mut G) -> RenderResult<()> {
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or(RenderError::OutOfOrder("bind", "create_pipelines"))?;
        let tlas = self
            .tlas
            .as_ref()
            .ok_or(RenderError::OutOfOrder("bind", "create_top_level_structure"))?;

        gfx.write_descriptor(
            pipeline.descriptor_table,
            TLAS_SLOT,
            0,
            DescriptorResource::AccelerationStructure(tlas.accel()),
        )?;
        self.asset.bind(gfx, pipeline.descriptor_table)
    }

    /// Record the ray dispatch for `frame_index` into `cmd`.
    pub fn draw_frame<G: GraphicsDevice>(
        &mut self,
        gfx: &mut G,
        cmd: CommandListId,
        frame_index: usize,
    ) -> RenderResult<()> {
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or(RenderError::OutOfOrder("draw_frame", "create_pipelines"))?;
        let targets = self
            .targets
            .as_ref()
            .ok_or(RenderError::OutOfOrder("draw_frame", "resize"))?;
        if self.tlas.is_none() {
            return Err(RenderError::OutOfOrder("draw_frame", "create_top_level_structure"));
        }
        let slot = self
            .camera_slab
            .slot(frame_index)
            .ok_or_else(|| RenderError::Build(format!("frame index {} has no camera slot", frame_index)))?;

        let generation = self.camera.generation();
        if self.slot_generations[frame_index] != Some(generation) {
            let mut bytes = [0u8; CameraConstants::SIZE];
            self.camera.write_constants(&mut bytes);
            gfx.write_buffer(self.camera_buffer, slot.offset, &bytes)?;
            self.slot_generations[frame_index] = Some(generation);
        }

        gfx.cmd_set_pipeline(cmd, pipeline.pipeline)?;
        gfx.cmd_push_constants(cmd, pipeline.root_signature, &(frame_index as u32).to_le_bytes())?;
        gfx.cmd_push_constant_buffer(
            cmd,
            pipeline.root_signature,
            CAMERA_SLOT,
            self.camera_buffer,
            slot.offset,
            slot.size,
        )?;
        gfx.cmd_bind_descriptor_table(cmd, pipeline.root_signature, pipeline.descriptor_table)?;
        gfx.cmd_dispatch_rays(cmd, &pipeline.sbt.dispatch_desc(targets.extent()))?;
        Ok(())
    }

    /// Record the copy of this frame's output into the presentation image.
    /// Both images are back in their resting states when the copy is done.
    pub fn copy_to_presentation_surface<G: GraphicsDevice>(
        &self,
        gfx: &mut G,
        cmd: CommandListId,
        frame_index: usize,
        target: TextureId,
    ) -> RenderResult<()> {
        let targets = self
            .targets
            .as_ref()
            .ok_or(RenderError::OutOfOrder("copy_to_presentation_surface", "resize"))?;
        let output = targets.image(frame_index);

        gfx.cmd_texture_barriers(
            cmd,
            &[
                TextureBarrier::transition(
                    output,
                    (BarrierSync::Raytracing, TextureState::UnorderedAccess),
                    (BarrierSync::Copy, TextureState::CopySource),
                ),
                TextureBarrier::transition(
                    target,
                    (BarrierSync::None, TextureState::Present),
                    (BarrierSync::Copy, TextureState::CopyDest),
                ),
            ],
        )?;
        gfx.cmd_copy_texture(cmd, output, target, targets.extent())?;
        gfx.cmd_texture_barriers(
            cmd,
            &[
                TextureBarrier::transition(
                    output,
                    (BarrierSync::Copy, TextureState::CopySource),
                    (BarrierSync::Raytracing, TextureState::UnorderedAccess),
                ),
                TextureBarrier::transition(
                    target,
                    (BarrierSync::Copy, TextureState::CopyDest),
                    (BarrierSync::None, TextureState::Present),
                ),
            ],
        )?;
        Ok(())
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    pub fn asset(&self) -> &Asset {
        &self.asset
    }

    /// Output size, once `resize` has run.
    pub fn extent(&self) -> Option<Extent2D> {
        self.targets.as_ref().map(|t| t.extent())
    }

    pub fn frame_target(&self, frame_index: usize) -> Option<TextureId> {
        self.targets.as_ref().map(|t| t.image(frame_index))
    }

    pub fn camera_buffer(&self) -> BufferId {
        self.camera_buffer
    }

    /// Release everything in reverse creation order. The GPU must be idle.
    pub fn destroy<G: GraphicsDevice>(self, gfx: &mut G) {
        if let Some(tlas) = self.tlas {
            tlas.destroy(gfx);
        }
        if let Some(targets) = self.targets {
            targets.destroy(gfx);
        }
        if let Some(pipeline) = self.pipeline {
            pipeline.destroy(gfx);
        }
        gfx.destroy_buffer(self.camera_buffer);
        self.asset.destroy(gfx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::immediate::submit_immediate;
    use crate::gfx::mock::MockDevice;
    use asset::tests::test_asset;
    use pipeline::tests::shader_dir;

    fn ready_scene(gfx: &mut MockDevice, width: u32, height: u32) -> Scene {
        let dir = shader_dir();
        let asset = test_asset(gfx);
        let mut scene = Scene::with_asset(gfx, asset, Format::Bgra8Unorm).unwrap();
        scene.create_pipelines(gfx, dir.path()).unwrap();
        scene.resize(gfx, width, height).unwrap();
        scene.create_top_level_structure(gfx).unwrap();
        scene.bind(gfx).unwrap();
        scene
    }

    fn draw(gfx: &mut MockDevice, scene: &mut Scene, frame: usize) {
        submit_immediate(gfx, |gfx, cmd| scene.draw_frame(gfx, cmd, frame)).unwrap();
    }

    #[test]
    fn test_resize_before_pipelines_is_out_of_order() {
        let mut gfx = MockDevice::new();
        let asset = test_asset(&mut gfx);
        let mut scene = Scene::with_asset(&mut gfx, asset, Format::Bgra8Unorm).unwrap();
        assert!(matches!(
            scene.resize(&mut gfx, 10, 10),
            Err(RenderError::OutOfOrder("resize", "create_pipelines"))
        ));
    }

    #[test]
    fn test_resize_zero_clamps() {
        let mut gfx = MockDevice::new();
        let mut scene = ready_scene(&mut gfx, 0, 0);
        assert_eq!(scene.extent(), Some(Extent2D::new(1, 1)));
        scene.resize(&mut gfx, 0, 300).unwrap();
        assert_eq!(scene.extent(), Some(Extent2D::new(1, 300)));
    }

    #[test]
    fn test_resize_idempotent() {
        let mut gfx = MockDevice::new();
        let mut scene = ready_scene(&mut gfx, 640, 480);
        let before = scene.camera_mut().constants();
        let textures = gfx.live_textures();

        scene.resize(&mut gfx, 640, 480).unwrap();
        assert_eq!(scene.extent(), Some(Extent2D::new(640, 480)));
        assert_eq!(scene.camera_mut().constants(), before);
        assert_eq!(gfx.live_textures(), textures);
        let image = scene.frame_target(0).unwrap();
        assert_eq!(gfx.texture_state(image), Some(TextureState::UnorderedAccess));
    }

    #[test]
    fn test_resize_rebinds_output_slot() {
        let mut gfx = MockDevice::new();
        let mut scene = ready_scene(&mut gfx, 64, 64);
        scene.resize(&mut gfx, 32, 16).unwrap();
        let table = scene.pipeline.as_ref().unwrap().descriptor_table;
        for frame in 0..FLIGHT_FRAMES {
            let Some(DescriptorResource::StorageTexture(view)) = gfx.descriptor(table, pipeline::OUTPUT_SLOT, frame as u32)
            else {
                panic!("output slot {} empty", frame);
            };
            assert_eq!(gfx.view_texture(view), scene.frame_target(frame));
        }
    }

    #[test]
    fn test_second_tlas_rejected() {
        let mut gfx = MockDevice::new();
        let mut scene = ready_scene(&mut gfx, 16, 16);
        let first = scene.tlas.as_ref().unwrap().accel();
        let err = scene.create_top_level_structure(&mut gfx).unwrap_err();
        assert!(matches!(err, RenderError::Build(ref m) if m.contains("already built")));
        assert_eq!(scene.tlas.as_ref().unwrap().accel(), first);
        assert!(gfx.is_built(first));
    }

    #[test]
    fn test_draw_frame_dispatches_full_extent() {
        let mut gfx = MockDevice::new();
        let mut scene = ready_scene(&mut gfx, 320, 200);
        draw(&mut gfx, &mut scene, 1);
        let dispatch = gfx.dispatches().last().unwrap();
        assert_eq!((dispatch.desc.width, dispatch.desc.height, dispatch.desc.depth), (320, 200, 1));
        assert_eq!(dispatch.push_constants, 1u32.to_le_bytes());
    }

    #[test]
    fn test_camera_slots_do_not_overlap() {
        let mut gfx = MockDevice::new();
        let mut scene = ready_scene(&mut gfx, 64, 64);
        draw(&mut gfx, &mut scene, 0);
        scene.camera_mut().rotate(0.3, 0.7);
        draw(&mut gfx, &mut scene, 1);

        let dispatches = gfx.dispatches();
        let (_, offset0, size0) = dispatches[0].constant_buffer.unwrap();
        let (_, offset1, _) = dispatches[1].constant_buffer.unwrap();
        assert!(offset0 + size0 <= offset1);
        assert_eq!(offset1 % CONSTANT_BUFFER_ALIGNMENT, 0);

        // Frame 0's slot still holds the constants it was drawn with.
        let data = gfx.buffer_data(scene.camera_buffer()).unwrap();
        assert_eq!(&data[offset0 as usize..(offset0 + size0) as usize], dispatches[0].constants.as_slice());
        assert_ne!(dispatches[0].constants, dispatches[1].constants);
    }

    #[test]
    fn test_camera_write_skipped_when_unchanged() {
        let mut gfx = MockDevice::new();
        let mut scene = ready_scene(&mut gfx, 64, 64);
        draw(&mut gfx, &mut scene, 0);
        let generation = scene.slot_generations[0];
        draw(&mut gfx, &mut scene, 0);
        assert_eq!(scene.slot_generations[0], generation);
        scene.camera_mut().zoom(1.0);
        draw(&mut gfx, &mut scene, 0);
        assert_ne!(scene.slot_generations[0], generation);
    }

    #[test]
    fn test_copy_restores_resting_states() {
        let mut gfx = MockDevice::new();
        let mut scene = ready_scene(&mut gfx, 4, 4);
        let surface = crate::gfx::mock::MockSurface::new(&mut gfx, Extent2D::new(4, 4)).unwrap();
        let target = crate::gfx::PresentationSurface::texture(&surface, 0);

        submit_immediate(&mut gfx, |gfx, cmd| -> RenderResult<()> {
            scene.draw_frame(gfx, cmd, 0)?;
            scene.copy_to_presentation_surface(gfx, cmd, 0, target)
        })
        .unwrap();

        assert_eq!(gfx.texture_state(target), Some(TextureState::Present));
        assert_eq!(
            gfx.texture_state(scene.frame_target(0).unwrap()),
            Some(TextureState::UnorderedAccess)
        );
    }

    #[test]
    fn test_destroy_releases_everything() {
        let mut gfx = MockDevice::new();
        let scene = ready_scene(&mut gfx, 8, 8);
        scene.destroy(&mut gfx);
        assert_eq!(gfx.live_buffers(), 0);
        assert_eq!(gfx.live_textures(), 0);
        assert_eq!(gfx.live_acceleration_structures(), 0);
    }
}
