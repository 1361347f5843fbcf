// app.rs: winit application driving the renderer
//
// Window and device are created on the first `resumed`; every window event is
// translated to an `InputEvent` and handed to the renderer, and a frame is
// rendered on each redraw.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use raw_window_handle::HasDisplayHandle;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{DeviceEvent, DeviceId, ElementState, MouseButton, MouseScrollDelta, WindowEvent};
use winit::event_loop::ActiveEventLoop;
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Window, WindowId};

use rtview_common::config::ViewerConfig;
use rtview_renderer::vulkan::{Swapchain, VulkanContext, VulkanDevice, VulkanSurface};
use rtview_renderer::{Control, InputEvent, Key, PointerButtons, Renderer};

/// Pixels per wheel line for touchpads reporting pixel deltas.
const PIXELS_PER_LINE: f32 = 40.0;

/// GPU objects living for as long as the window.
struct Session {
    gfx: VulkanDevice,
    swapchain: Option<Swapchain>,
    renderer: Option<Renderer>,
}

impl Session {
    fn create(window: &Window, config: &ViewerConfig) -> anyhow::Result<Self> {
        let display_handle = window
            .display_handle()
            .context("window has no display handle")?
            .as_raw();

        let ctx = unsafe { VulkanContext::new(display_handle, config.validation) }.map_err(|e| anyhow!(e))?;
        let mut gfx = VulkanDevice::new(ctx).map_err(|e| anyhow!(e))?;

        let surface = unsafe { VulkanSurface::from_winit(gfx.context(), window, config.vsync) }.map_err(|e| anyhow!(e))?;
        let size = window.inner_size();
        let mut swapchain = Swapchain::new(&mut gfx, surface, size.width.max(1), size.height.max(1))
            .context("failed to create swapchain")?;

        let renderer = match Renderer::new(&mut gfx, &swapchain, config) {
            Ok(renderer) => renderer,
            Err(e) => {
                swapchain.destroy(&mut gfx);
                return Err(e).context("renderer setup failed");
            }
        };

        Ok(Self {
            gfx,
            swapchain: Some(swapchain),
            renderer: Some(renderer),
        })
    }

    /// Pass one event to the renderer.
    fn handle(&mut self, event: &InputEvent) -> anyhow::Result<Control> {
        match (self.renderer.as_mut(), self.swapchain.as_mut()) {
            (Some(renderer), Some(swapchain)) => Ok(renderer.handle_event(&mut self.gfx, swapchain, event)?),
            _ => Ok(Control::Exit),
        }
    }

    fn render_frame(&mut self) -> anyhow::Result<()> {
        if let (Some(renderer), Some(swapchain)) = (self.renderer.as_mut(), self.swapchain.as_mut()) {
            renderer.render_frame(&mut self.gfx, swapchain)?;
        }
        Ok(())
    }

    /// Renderer first, then the swapchain and its surface; the device goes last.
    fn shutdown(mut self) {
        if let (Some(renderer), Some(swapchain)) = (self.renderer.take(), self.swapchain.as_mut()) {
            if let Err(e) = renderer.destroy(&mut self.gfx, swapchain) {
                log::error!("Renderer shutdown failed: {}", e);
            }
        }
        if let Some(swapchain) = self.swapchain.take() {
            swapchain.destroy(&mut self.gfx);
        }
    }
}

/// Application state for the winit event loop.
pub struct ViewerApp {
    config: ViewerConfig,
    session: Option<Session>,
    window: Option<Arc<Window>>,
    buttons: PointerButtons,
    minimized: bool,
    error: Option<anyhow::Error>,
}

impl ViewerApp {
    pub fn new(config: ViewerConfig) -> Self {
        Self {
            config,
            session: None,
            window: None,
            buttons: PointerButtons::empty(),
            minimized: false,
            error: None,
        }
    }

    /// The error that ended the event loop, if any.
    pub fn take_error(&mut self) -> Option<anyhow::Error> {
        self.error.take()
    }

    fn start(&mut self, event_loop: &ActiveEventLoop) -> anyhow::Result<()> {
        let attributes = Window::default_attributes()
            .with_title("rtview")
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));
        let window = Arc::new(event_loop.create_window(attributes).context("failed to create window")?);

        self.session = Some(Session::create(&window, &self.config)?);
        self.window = Some(window);
        Ok(())
    }

    fn dispatch(&mut self, event_loop: &ActiveEventLoop, event: InputEvent) {
        let result = match self.session.as_mut() {
            Some(session) => session.handle(&event),
            None => return,
        };
        match result {
            Ok(Control::Continue) => {}
            Ok(Control::Exit) => event_loop.exit(),
            Err(e) => self.fail(event_loop, e),
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        self.error.get_or_insert(error);
        event_loop.exit();
    }

    fn shutdown(&mut self) {
        if let Some(session) = self.session.take() {
            session.shutdown();
        }
        self.window = None;
    }
}

impl ApplicationHandler for ViewerApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.session.is_some() || self.error.is_some() {
            return;
        }
        if let Err(e) = self.start(event_loop) {
            self.fail(event_loop, e);
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => self.dispatch(event_loop, InputEvent::Quit),

            WindowEvent::Resized(size) => {
                self.minimized = size.width == 0 || size.height == 0;
                if !self.minimized {
                    self.dispatch(
                        event_loop,
                        InputEvent::Resized {
                            width: size.width,
                            height: size.height,
                        },
                    );
                }
            }

            WindowEvent::KeyboardInput { event, .. } if event.state == ElementState::Pressed && !event.repeat => {
                self.dispatch(event_loop, InputEvent::KeyDown(key_from(event.physical_key)));
            }

            WindowEvent::MouseInput { button, state, .. } => {
                let flag = pointer_button(button);
                self.buttons.set(flag, state == ElementState::Pressed);
            }

            WindowEvent::MouseWheel { delta, .. } => self.dispatch(event_loop, InputEvent::Wheel(wheel_lines(delta))),

            WindowEvent::Focused(false) => self.buttons = PointerButtons::empty(),

            WindowEvent::RedrawRequested => {
                if self.minimized {
                    return;
                }
                let result = match self.session.as_mut() {
                    Some(session) => session.render_frame(),
                    None => return,
                };
                if let Err(e) = result {
                    self.fail(event_loop, e);
                }
            }

            _ => {}
        }
    }

    fn device_event(&mut self, event_loop: &ActiveEventLoop, _device_id: DeviceId, event: DeviceEvent) {
        // Raw deltas keep orbiting smooth when the cursor hits the window edge.
        if let DeviceEvent::MouseMotion { delta } = event {
            if !self.buttons.is_empty() {
                self.dispatch(
                    event_loop,
                    InputEvent::PointerMotion {
                        dx: delta.0 as f32,
                        dy: delta.1 as f32,
                        buttons: self.buttons,
                    },
                );
            }
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.shutdown();
    }
}

fn key_from(key: PhysicalKey) -> Key {
    match key {
        PhysicalKey::Code(KeyCode::Escape) => Key::Escape,
        PhysicalKey::Code(KeyCode::KeyR) => Key::R,
        _ => Key::Other,
    }
}

fn pointer_button(button: MouseButton) -> PointerButtons {
    match button {
        MouseButton::Left => PointerButtons::PRIMARY,
        MouseButton::Right => PointerButtons::SECONDARY,
        MouseButton::Middle => PointerButtons::MIDDLE,
        _ => PointerButtons::empty(),
    }
}

fn wheel_lines(delta: MouseScrollDelta) -> f32 {
    match delta {
        MouseScrollDelta::LineDelta(_, y) => y,
        MouseScrollDelta::PixelDelta(position) => position.y as f32 / PIXELS_PER_LINE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use winit::dpi::PhysicalPosition;
    use winit::keyboard::NativeKeyCode;

    #[test]
    fn test_key_mapping() {
        assert_eq!(key_from(PhysicalKey::Code(KeyCode::Escape)), Key::Escape);
        assert_eq!(key_from(PhysicalKey::Code(KeyCode::KeyR)), Key::R);
        assert_eq!(key_from(PhysicalKey::Code(KeyCode::KeyW)), Key::Other);
        assert_eq!(key_from(PhysicalKey::Unidentified(NativeKeyCode::Unidentified)), Key::Other);
    }

    #[test]
    fn test_pointer_buttons() {
        assert_eq!(pointer_button(MouseButton::Left), PointerButtons::PRIMARY);
        assert_eq!(pointer_button(MouseButton::Middle), PointerButtons::MIDDLE);
        assert!(pointer_button(MouseButton::Back).is_empty());
    }

    #[test]
    fn test_wheel_lines() {
        assert_eq!(wheel_lines(MouseScrollDelta::LineDelta(0.0, -2.0)), -2.0);
        assert_eq!(wheel_lines(MouseScrollDelta::PixelDelta(PhysicalPosition::new(0.0, 80.0))), 2.0);
    }
}
