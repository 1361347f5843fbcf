//! Frame loop: startup sequencing, the per-frame state machine, input and
//! shutdown.

use rtview_common::config::ViewerConfig;

use crate::gfx::{CommandListId, GfxError, GraphicsDevice, PresentationSurface};
use crate::input::{Control, InputEvent, Key, PointerButtons};
use crate::scene::error::GfxResultExt;
use crate::scene::targets::clamp_extent;
use crate::scene::texture::TexturePolicy;
use crate::scene::{RenderError, RenderResult, Scene, SceneDesc};
use crate::FLIGHT_FRAMES;

/// Where the current frame is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    Idle,
    Recording,
    Submitted,
    Presented,
}

impl FramePhase {
    pub fn next(self) -> FramePhase {
        match self {
            FramePhase::Idle => FramePhase::Recording,
            FramePhase::Recording => FramePhase::Submitted,
            FramePhase::Submitted => FramePhase::Presented,
            FramePhase::Presented => FramePhase::Idle,
        }
    }

    fn advance(&mut self, to: FramePhase) -> RenderResult<()> {
        if self.next() != to {
            return Err(RenderError::Frame(GfxError::Validation(format!(
                "frame phase {:?} cannot move to {:?}",
                self, to
            ))));
        }
        *self = to;
        Ok(())
    }
}

pub struct Renderer {
    scene: Scene,
    command_lists: [CommandListId; FLIGHT_FRAMES],
    phase: FramePhase,
    sensitivity: f32,
    frames_rendered: u64,
}

impl Renderer {
    /// Load the asset and run every setup step against `surface`'s extent.
    pub fn new<G, S>(gfx: &mut G, surface: &S, config: &ViewerConfig) -> RenderResult<Self>
    where
        G: GraphicsDevice,
        S: PresentationSurface<G>,
    {
        let texture_policy = if config.strict_textures {
            TexturePolicy::Strict
        } else {
            TexturePolicy::Placeholder
        };
        let mut scene = Scene::new(
            gfx,
            &SceneDesc {
                mesh_path: &config.mesh_path,
                texture_paths: &config.texture_paths,
                texture_policy,
                output_format: surface.format(),
            },
        )?;
        scene.create_pipelines(gfx, &config.shader_dir)?;
        let extent = surface.extent();
        scene.resize(gfx, extent.width, extent.height)?;
        scene.create_top_level_structure(gfx)?;
        scene.bind(gfx)?;

        let mut command_lists = [CommandListId(0); FLIGHT_FRAMES];
        for cmd in &mut command_lists {
            *cmd = gfx.create_command_list().creating("frame command list")?;
        }

        log::info!("Renderer ready");
        Ok(Self {
            scene,
            command_lists,
            phase: FramePhase::Idle,
            sensitivity: config.sensitivity,
            frames_rendered: 0,
        })
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    /// Render, present and wait for one frame.
    pub fn render_frame<G, S>(&mut self, gfx: &mut G, surface: &mut S) -> RenderResult<()>
    where
        G: GraphicsDevice,
        S: PresentationSurface<G>,
    {
        let frame = surface.acquire(gfx)?;
        // The surface may have recreated itself at another size.
        let extent = surface.extent();
        if self.scene.extent() != Some(extent) {
            log::debug!("Surface is {}x{}, resizing scene to match", extent.width, extent.height);
            self.scene.resize(gfx, extent.width, extent.height)?;
        }
        let cmd = self.command_lists[frame % FLIGHT_FRAMES];

        self.phase.advance(FramePhase::Recording)?;
        gfx.reset_command_list(cmd)?;
        self.scene.draw_frame(gfx, cmd, frame)?;
        self.scene
            .copy_to_presentation_surface(gfx, cmd, frame, surface.texture(frame))?;
        gfx.close_command_list(cmd)?;
        gfx.execute(&[cmd])?;

        self.phase.advance(FramePhase::Submitted)?;
        surface.present(gfx)?;

        self.phase.advance(FramePhase::Presented)?;
        gfx.wait_idle()?;

        self.phase.advance(FramePhase::Idle)?;
        self.frames_rendered += 1;
        Ok(())
    }

    /// Resize the surface, then the scene to whatever extent the surface took.
    pub fn resize<G, S>(&mut self, gfx: &mut G, surface: &mut S, width: u32, height: u32) -> RenderResult<()>
    where
        G: GraphicsDevice,
        S: PresentationSurface<G>,
    {
        let requested = clamp_extent(width, height);
        gfx.wait_idle()?;
        surface.resize(gfx, requested.width, requested.height)?;
        let extent = surface.extent();
        self.scene.resize(gfx, extent.width, extent.height)
    }

    pub fn handle_event<G, S>(&mut self, gfx: &mut G, surface: &mut S, event: &InputEvent) -> RenderResult<Control>
    where
        G: GraphicsDevice,
        S: PresentationSurface<G>,
    {
        match *event {
            InputEvent::Quit | InputEvent::KeyDown(Key::Escape) => {
                surface.throttle(gfx)?;
                return Ok(Control::Exit);
            }
            InputEvent::Resized { width, height } => self.resize(gfx, surface, width, height)?,
            InputEvent::PointerMotion { dx, dy, buttons } if buttons.contains(PointerButtons::PRIMARY) => {
                self.scene
                    .camera_mut()
                    .rotate(dy * self.sensitivity, dx * self.sensitivity);
            }
            InputEvent::Wheel(delta) => self.scene.camera_mut().zoom(delta),
            InputEvent::KeyDown(Key::R) => {
                log::debug!("Camera reset");
                self.scene.camera_mut().reset_orientation();
            }
            _ => {}
        }
        Ok(Control::Continue)
    }

    /// Drain the GPU and release everything in reverse creation order.
    pub fn destroy<G, S>(self, gfx: &mut G, surface: &mut S) -> RenderResult<()>
    where
        G: GraphicsDevice,
        S: PresentationSurface<G>,
    {
        surface.throttle(gfx)?;
        gfx.wait_idle()?;
        for cmd in self.command_lists {
            gfx.destroy_command_list(cmd);
        }
        self.scene.destroy(gfx);
        log::info!("Renderer destroyed after {} frames", self.frames_rendered);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::mock::{MockDevice, MockSurface};
    use crate::gfx::{Extent2D, TextureState};
    use crate::scene::camera::{DEFAULT_PITCH, DEFAULT_RADIUS};
    use crate::scene::pipeline::{shader_path, SHADER_LIBRARY};
    use approx::assert_relative_eq;
    use std::path::Path;

    const CUBE: &str = "\
v -1 -1 -1
v 1 -1 -1
v 1 1 -1
v -1 1 -1
v -1 -1 1
v 1 -1 1
v 1 1 1
v -1 1 1
f 1 2 3 4
f 5 8 7 6
f 1 5 6 2
f 2 6 7 3
f 3 7 8 4
f 5 1 4 8
";

    struct Fixture {
        _dir: tempfile::TempDir,
        config: ViewerConfig,
    }

    fn fixture(width: u32, height: u32) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("cube.obj"), CUBE).unwrap();
        let names = ["c.png", "n.png", "s.png", "e.png"];
        for name in names {
            image::RgbaImage::from_pixel(8, 8, image::Rgba([10, 20, 30, 255]))
                .save(root.join(name))
                .unwrap();
        }
        std::fs::write(shader_path(root, MockDevice::SHADER_EXTENSION), b"lib").unwrap();
        assert!(root.join(format!("{}.spv", SHADER_LIBRARY)).exists());

        let config = ViewerConfig {
            width,
            height,
            shader_dir: root.to_path_buf(),
            mesh_path: root.join("cube.obj"),
            texture_paths: names.map(|n| root.join(n)),
            ..ViewerConfig::default()
        };
        Fixture { _dir: dir, config }
    }

    fn setup(width: u32, height: u32) -> (MockDevice, MockSurface, Renderer, Fixture) {
        let fixture = fixture(width, height);
        let mut gfx = MockDevice::new();
        let surface = MockSurface::new(&mut gfx, Extent2D::new(width, height)).unwrap();
        let renderer = Renderer::new(&mut gfx, &surface, &fixture.config).unwrap();
        (gfx, surface, renderer, fixture)
    }

    #[test]
    fn test_phase_order() {
        let mut phase = FramePhase::Idle;
        assert!(phase.advance(FramePhase::Submitted).is_err());
        phase.advance(FramePhase::Recording).unwrap();
        phase.advance(FramePhase::Submitted).unwrap();
        phase.advance(FramePhase::Presented).unwrap();
        phase.advance(FramePhase::Idle).unwrap();
        assert_eq!(phase, FramePhase::Idle);
    }

    #[test]
    fn test_frames_alternate_targets() {
        let (mut gfx, mut surface, mut renderer, _fixture) = setup(32, 24);
        for _ in 0..4 {
            renderer.render_frame(&mut gfx, &mut surface).unwrap();
            assert_eq!(renderer.phase(), FramePhase::Idle);
        }
        assert_eq!(renderer.frames_rendered(), 4);
        assert_eq!(surface.present_count(), 4);

        let frames: Vec<u32> = gfx
            .dispatches()
            .iter()
            .map(|d| u32::from_le_bytes(d.push_constants[..4].try_into().unwrap()))
            .collect();
        assert_eq!(frames, [0, 1, 0, 1]);
        for frame in 0..FLIGHT_FRAMES {
            let image = renderer.scene().frame_target(frame).unwrap();
            assert_eq!(gfx.texture_state(image), Some(TextureState::UnorderedAccess));
        }
    }

    #[test]
    fn test_resize_event_resizes_surface_then_scene() {
        let (mut gfx, mut surface, mut renderer, _fixture) = setup(32, 24);
        let control = renderer
            .handle_event(&mut gfx, &mut surface, &InputEvent::Resized { width: 0, height: 50 })
            .unwrap();
        assert_eq!(control, Control::Continue);
        assert_eq!(surface.extent(), Extent2D::new(1, 50));
        assert_eq!(renderer.scene().extent(), Some(Extent2D::new(1, 50)));
        renderer.render_frame(&mut gfx, &mut surface).unwrap();
    }

    #[test]
    fn test_resize_follows_clamped_surface() {
        let (mut gfx, mut surface, mut renderer, _fixture) = setup(32, 24);
        surface.set_max_extent(Extent2D::new(64, 64));
        renderer
            .handle_event(&mut gfx, &mut surface, &InputEvent::Resized { width: 100, height: 100 })
            .unwrap();
        assert_eq!(surface.extent(), Extent2D::new(64, 64));
        assert_eq!(renderer.scene().extent(), Some(Extent2D::new(64, 64)));
        renderer.render_frame(&mut gfx, &mut surface).unwrap();
        assert_eq!(surface.present_count(), 1);
    }

    #[test]
    fn test_surface_recreation_resizes_scene() {
        let (mut gfx, mut surface, mut renderer, _fixture) = setup(32, 24);
        renderer.render_frame(&mut gfx, &mut surface).unwrap();

        surface.invalidate(Extent2D::new(40, 30));
        renderer.render_frame(&mut gfx, &mut surface).unwrap();
        assert_eq!(surface.extent(), Extent2D::new(40, 30));
        assert_eq!(renderer.scene().extent(), Some(Extent2D::new(40, 30)));

        renderer.render_frame(&mut gfx, &mut surface).unwrap();
        assert_eq!(renderer.frames_rendered(), 3);
        assert_eq!(gfx.dispatches().last().map(|d| (d.desc.width, d.desc.height)), Some((40, 30)));
    }

    #[test]
    fn test_input_drives_camera() {
        let (mut gfx, mut surface, mut renderer, fixture) = setup(16, 16);
        let sensitivity = fixture.config.sensitivity;

        renderer
            .handle_event(
                &mut gfx,
                &mut surface,
                &InputEvent::PointerMotion { dx: 10.0, dy: 20.0, buttons: PointerButtons::empty() },
            )
            .unwrap();
        assert_relative_eq!(renderer.scene().camera().pitch(), DEFAULT_PITCH);

        renderer
            .handle_event(
                &mut gfx,
                &mut surface,
                &InputEvent::PointerMotion { dx: 10.0, dy: 20.0, buttons: PointerButtons::PRIMARY },
            )
            .unwrap();
        assert_relative_eq!(renderer.scene().camera().pitch(), DEFAULT_PITCH + 20.0 * sensitivity, epsilon = 1e-5);

        renderer
            .handle_event(&mut gfx, &mut surface, &InputEvent::Wheel(2.0))
            .unwrap();
        assert_relative_eq!(renderer.scene().camera().radius(), DEFAULT_RADIUS - 2.0);

        renderer
            .handle_event(&mut gfx, &mut surface, &InputEvent::KeyDown(Key::R))
            .unwrap();
        assert_relative_eq!(renderer.scene().camera().pitch(), DEFAULT_PITCH);
        assert_relative_eq!(renderer.scene().camera().radius(), DEFAULT_RADIUS);
    }

    #[test]
    fn test_quit_and_escape_exit() {
        let (mut gfx, mut surface, mut renderer, _fixture) = setup(16, 16);
        for event in [InputEvent::Quit, InputEvent::KeyDown(Key::Escape)] {
            assert_eq!(
                renderer.handle_event(&mut gfx, &mut surface, &event).unwrap(),
                Control::Exit
            );
        }
        assert_eq!(
            renderer
                .handle_event(&mut gfx, &mut surface, &InputEvent::KeyDown(Key::Other))
                .unwrap(),
            Control::Continue
        );
    }

    #[test]
    fn test_missing_shader_fails_setup() {
        let mut fixture = fixture(16, 16);
        fixture.config.shader_dir = Path::new("/nonexistent").to_path_buf();
        let mut gfx = MockDevice::new();
        let surface = MockSurface::new(&mut gfx, Extent2D::new(16, 16)).unwrap();
        let result = Renderer::new(&mut gfx, &surface, &fixture.config);
        assert!(matches!(result, Err(RenderError::ShaderNotFound(_))));
    }

    #[test]
    fn test_destroy_releases_resources() {
        let (mut gfx, mut surface, mut renderer, _fixture) = setup(16, 16);
        renderer.render_frame(&mut gfx, &mut surface).unwrap();
        renderer.destroy(&mut gfx, &mut surface).unwrap();
        assert_eq!(gfx.live_buffers(), 0);
        assert_eq!(gfx.live_command_lists(), 0);
        // Only the surface's own images remain.
        assert_eq!(gfx.live_textures(), MockSurface::IMAGE_COUNT);
    }
}
