// Hardware ray traced model viewer: scene orchestration over a graphics
// device seam, with a Vulkan backend.

pub mod gfx;
pub mod input;
pub mod renderer;
pub mod scene;
pub mod vulkan;

pub use input::{Control, InputEvent, Key, PointerButtons};
pub use renderer::{FramePhase, Renderer};
pub use scene::{RenderError, RenderResult, Scene, SceneDesc};

/// Frames the viewer cycles between: output textures, camera slots and
/// command lists are all sized by this.
pub const FLIGHT_FRAMES: usize = 2;
