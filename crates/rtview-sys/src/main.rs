// Entry point for the rtview model viewer.
//
// Startup order: register cvars, apply `+set` overrides from the command
// line, start logging, then hand control to the winit event loop. The window,
// device and renderer are created once the loop resumes.

mod app;

use winit::event_loop::{ControlFlow, EventLoop};

use rtview_common::common::init_logging;
use rtview_common::config::{register_cvars, ViewerConfig, DEFAULT_SHADER_DIR};
use rtview_common::cvar::CvarContext;
use rtview_renderer::scene::pipeline::BUILT_SHADER_DIR;

use app::ViewerApp;

fn main() -> anyhow::Result<()> {
    let shader_dir = BUILT_SHADER_DIR.unwrap_or(DEFAULT_SHADER_DIR);

    let mut cvars = CvarContext::new();
    register_cvars(&mut cvars, shader_dir);
    cvars.apply_command_line(std::env::args().skip(1))?;
    let config = ViewerConfig::from_cvars(&cvars);

    init_logging(config.developer);
    log::info!("rtview {}", env!("CARGO_PKG_VERSION"));
    log::debug!("{:?}", config);

    let event_loop = EventLoop::new()?;
    // Render continuously.
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = ViewerApp::new(config);
    event_loop.run_app(&mut app)?;

    match app.take_error() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
