//! Window-system-neutral input events.

use bitflags::bitflags;

bitflags! {
    /// Pointer buttons held during a motion event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PointerButtons: u8 {
        const PRIMARY = 1 << 0;
        const SECONDARY = 1 << 1;
        const MIDDLE = 1 << 2;
    }
}

/// Keys the viewer reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Escape,
    R,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputEvent {
    Quit,
    Resized { width: u32, height: u32 },
    KeyDown(Key),
    /// Pointer movement in pixels since the last event.
    PointerMotion { dx: f32, dy: f32, buttons: PointerButtons },
    /// Wheel movement in lines, positive away from the user.
    Wheel(f32),
}

/// What the event loop should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Exit,
}
