//! Pointer Device State
//!
//! State for a raw pointer device (framebuffer-style backends that read
//! device packets themselves rather than receiving translated input
//! from a display server). Owns the current position and button mask,
//! decodes PS/2-compatible packets, and synthesizes portable events —
//! including the implicit grab: once a button goes down, all further
//! pointer events route to the press window until every button is
//! released.

use tracing::{debug, warn};

use crate::event::{Buttons, Event, Modifiers, Timestamp};
use crate::window::WindowId;

/// One decoded movement/button packet from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerPacket {
    pub dx: i32,
    pub dy: i32,
    pub buttons: Buttons,
}

impl PointerPacket {
    /// Decode a 3-byte PS/2-compatible packet.
    ///
    /// Byte 0 is `YO XO YS XS 1 M R L`; bytes 1 and 2 are the X and Y
    /// deltas, sign-extended through the XS/YS bits. Returns None for a
    /// desynchronized packet (sync bit clear) or one with an overflow
    /// flag set; the caller resynchronizes on the next sync byte.
    pub fn decode_ps2(raw: [u8; 3]) -> Option<Self> {
        if raw[0] & 0x08 == 0 {
            warn!("pointer packet out of sync: {:#04x}", raw[0]);
            return None;
        }
        if raw[0] & 0xc0 != 0 {
            debug!("pointer packet overflow, dropped");
            return None;
        }
        let mut dx = raw[1] as i32;
        if raw[0] & 0x10 != 0 {
            dx -= 256;
        }
        let mut dy = raw[2] as i32;
        if raw[0] & 0x20 != 0 {
            dy -= 256;
        }

        let mut buttons = Buttons::empty();
        if raw[0] & 0x01 != 0 {
            buttons |= Buttons::LEFT;
        }
        if raw[0] & 0x02 != 0 {
            buttons |= Buttons::RIGHT;
        }
        if raw[0] & 0x04 != 0 {
            buttons |= Buttons::MIDDLE;
        }

        // Device Y grows upward; screen Y grows downward.
        Some(Self {
            dx,
            dy: -dy,
            buttons,
        })
    }
}

/// X-style button number for a device button bit.
fn button_number(button: Buttons) -> u8 {
    if button == Buttons::LEFT {
        1
    } else if button == Buttons::MIDDLE {
        2
    } else if button == Buttons::RIGHT {
        3
    } else if button == Buttons::SIDE {
        8
    } else if button == Buttons::EXTRA {
        9
    } else {
        0
    }
}

/// Current state of one physical pointer device.
///
/// Mutated only by the thread parsing incoming packets; one instance
/// per device, created on backend init.
#[derive(Debug)]
pub struct PointerState {
    x: i32,
    y: i32,
    buttons: Buttons,
    /// Grab window and its origin, captured at press time.
    grab_window: Option<(WindowId, (i32, i32))>,
    width: i32,
    height: i32,
}

impl PointerState {
    /// Device state centered on a screen of the given size.
    pub fn new(width: i32, height: i32) -> Self {
        Self {
            x: width / 2,
            y: height / 2,
            buttons: Buttons::empty(),
            grab_window: None,
            width,
            height,
        }
    }

    pub fn position(&self) -> (i32, i32) {
        (self.x, self.y)
    }

    pub fn pressed(&self) -> Buttons {
        self.buttons
    }

    /// Window holding the implicit grab, if any button is down.
    pub fn grab(&self) -> Option<WindowId> {
        self.grab_window.map(|(id, _)| id)
    }

    /// Update screen bounds (mode switch), clamping the position.
    pub fn set_bounds(&mut self, width: i32, height: i32) {
        self.width = width;
        self.height = height;
        self.x = self.x.clamp(0, width - 1);
        self.y = self.y.clamp(0, height - 1);
    }

    /// Apply one packet, appending synthesized events to `out`.
    ///
    /// `hit` maps a root position to the window under it and that
    /// window's origin. While the implicit grab is held, events route
    /// to the grab window regardless of position.
    pub fn apply_packet(
        &mut self,
        packet: PointerPacket,
        time: Timestamp,
        hit: &dyn Fn(i32, i32) -> Option<(WindowId, (i32, i32))>,
        out: &mut Vec<Event>,
    ) {
        let old_x = self.x;
        let old_y = self.y;
        self.x = (self.x + packet.dx).clamp(0, self.width - 1);
        self.y = (self.y + packet.dy).clamp(0, self.height - 1);

        let target = match self.grab_window {
            Some(grab) => Some(grab),
            None => hit(self.x, self.y),
        };

        let moved = self.x != old_x || self.y != old_y;
        if moved {
            if let Some((window, (ox, oy))) = target {
                out.push(Event::Motion {
                    window,
                    time,
                    x: self.x - ox,
                    y: self.y - oy,
                    root_x: self.x,
                    root_y: self.y,
                    state: Modifiers::from_buttons(self.buttons),
                });
            }
        }

        let went_down = packet.buttons - self.buttons;
        let went_up = self.buttons - packet.buttons;
        self.buttons = packet.buttons;

        for button in [
            Buttons::LEFT,
            Buttons::MIDDLE,
            Buttons::RIGHT,
            Buttons::SIDE,
            Buttons::EXTRA,
        ] {
            if went_down.contains(button) {
                // First press establishes the implicit grab.
                if self.grab_window.is_none() {
                    self.grab_window = target;
                    if let Some((grab, _)) = self.grab_window {
                        debug!("implicit grab on {:?}", grab);
                    }
                }
                if let Some((window, (ox, oy))) = target {
                    out.push(Event::ButtonPress {
                        window,
                        time,
                        x: self.x - ox,
                        y: self.y - oy,
                        root_x: self.x,
                        root_y: self.y,
                        state: Modifiers::from_buttons(self.buttons),
                        button: button_number(button),
                    });
                }
            }
            if went_up.contains(button) {
                if let Some((window, (ox, oy))) = target {
                    out.push(Event::ButtonRelease {
                        window,
                        time,
                        x: self.x - ox,
                        y: self.y - oy,
                        root_x: self.x,
                        root_y: self.y,
                        state: Modifiers::from_buttons(self.buttons),
                        button: button_number(button),
                    });
                }
            }
        }

        if self.buttons.is_empty() && self.grab_window.is_some() {
            debug!("implicit grab released");
            self.grab_window = None;
        }
    }
}
