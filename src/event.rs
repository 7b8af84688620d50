//! Portable Events
//!
//! The normalized event model shared by every backend. Backends translate
//! their native event representation into these variants; the dispatch
//! source delivers them to the registered callback in FIFO order.

use bitflags::bitflags;

use crate::window::WindowId;

/// Server/event timestamp in milliseconds. Zero means "no timestamp".
pub type Timestamp = u32;

/// A rectangle in screen or window coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Whether a point (in the same coordinate space) falls inside.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x
            && y >= self.y
            && x < self.x + self.width as i32
            && y < self.y + self.height as i32
    }
}

bitflags! {
    /// Keyboard modifier and pointer button state carried by input events.
    ///
    /// Bit layout follows the X11 state mask so backend translation is a
    /// plain truncating conversion.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Modifiers: u16 {
        const SHIFT   = 1 << 0;
        const LOCK    = 1 << 1;
        const CONTROL = 1 << 2;
        const ALT     = 1 << 3;
        const MOD2    = 1 << 4;
        const MOD3    = 1 << 5;
        const SUPER   = 1 << 6;
        const MOD5    = 1 << 7;
        const BUTTON1 = 1 << 8;
        const BUTTON2 = 1 << 9;
        const BUTTON3 = 1 << 10;
        const BUTTON4 = 1 << 11;
        const BUTTON5 = 1 << 12;
    }
}

bitflags! {
    /// Pointer device button mask (device-level, before translation to
    /// X-style button numbers).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Buttons: u8 {
        const LEFT   = 1 << 0;
        const RIGHT  = 1 << 1;
        const MIDDLE = 1 << 2;
        const SIDE   = 1 << 3;
        const EXTRA  = 1 << 4;
    }
}

impl Modifiers {
    /// Build the button portion of a modifier mask from a device button
    /// mask. Left/middle/right map to BUTTON1/2/3.
    pub fn from_buttons(buttons: Buttons) -> Self {
        let mut state = Modifiers::empty();
        if buttons.contains(Buttons::LEFT) {
            state |= Modifiers::BUTTON1;
        }
        if buttons.contains(Buttons::MIDDLE) {
            state |= Modifiers::BUTTON2;
        }
        if buttons.contains(Buttons::RIGHT) {
            state |= Modifiers::BUTTON3;
        }
        state
    }
}

/// Phase of a drag-and-drop interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DragPhase {
    Enter,
    Motion,
    Drop,
    Leave,
}

/// Discriminator for [`Event`] variants, used by filter rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ButtonPress,
    ButtonRelease,
    DoubleClick,
    Motion,
    KeyPress,
    KeyRelease,
    Enter,
    Leave,
    FocusIn,
    FocusOut,
    Expose,
    Configure,
    Drag,
    CloseRequested,
    Custom,
}

/// A normalized, portable description of one unit of input or
/// window-system notification.
///
/// The target window is a weak reference: it is validated against the
/// window arena at dispatch time and the event is dropped silently if
/// the window is gone.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Pointer button pressed.
    ButtonPress {
        window: WindowId,
        time: Timestamp,
        x: i32,
        y: i32,
        root_x: i32,
        root_y: i32,
        state: Modifiers,
        button: u8,
    },

    /// Pointer button released.
    ButtonRelease {
        window: WindowId,
        time: Timestamp,
        x: i32,
        y: i32,
        root_x: i32,
        root_y: i32,
        state: Modifiers,
        button: u8,
    },

    /// Synthesized second press within the double-click thresholds.
    /// Always follows the [`Event::ButtonPress`] that triggered it.
    DoubleClick {
        window: WindowId,
        time: Timestamp,
        x: i32,
        y: i32,
        root_x: i32,
        root_y: i32,
        state: Modifiers,
        button: u8,
    },

    /// Pointer moved.
    Motion {
        window: WindowId,
        time: Timestamp,
        x: i32,
        y: i32,
        root_x: i32,
        root_y: i32,
        state: Modifiers,
    },

    /// Key pressed.
    KeyPress {
        window: WindowId,
        time: Timestamp,
        keycode: u16,
        state: Modifiers,
    },

    /// Key released.
    KeyRelease {
        window: WindowId,
        time: Timestamp,
        keycode: u16,
        state: Modifiers,
    },

    /// Pointer entered the window.
    Enter {
        window: WindowId,
        time: Timestamp,
        x: i32,
        y: i32,
    },

    /// Pointer left the window.
    Leave {
        window: WindowId,
        time: Timestamp,
        x: i32,
        y: i32,
    },

    /// Window gained keyboard focus.
    FocusIn { window: WindowId, time: Timestamp },

    /// Window lost keyboard focus.
    FocusOut { window: WindowId, time: Timestamp },

    /// Part of the window needs repainting. `remaining` counts further
    /// expose events pending for the same window.
    Expose {
        window: WindowId,
        region: Rect,
        remaining: u16,
    },

    /// Window geometry changed.
    Configure { window: WindowId, geometry: Rect },

    /// Drag-and-drop progress over the window.
    Drag {
        window: WindowId,
        time: Timestamp,
        phase: DragPhase,
        x: i32,
        y: i32,
    },

    /// The user asked the window to close (window-chrome close button,
    /// delete protocol message).
    CloseRequested { window: WindowId, time: Timestamp },

    /// Application-defined event posted into the queue.
    Custom {
        window: WindowId,
        tag: u32,
        data: [u32; 4],
    },
}

impl Event {
    /// Target window of the event.
    pub fn window(&self) -> WindowId {
        match *self {
            Event::ButtonPress { window, .. }
            | Event::ButtonRelease { window, .. }
            | Event::DoubleClick { window, .. }
            | Event::Motion { window, .. }
            | Event::KeyPress { window, .. }
            | Event::KeyRelease { window, .. }
            | Event::Enter { window, .. }
            | Event::Leave { window, .. }
            | Event::FocusIn { window, .. }
            | Event::FocusOut { window, .. }
            | Event::Expose { window, .. }
            | Event::Configure { window, .. }
            | Event::Drag { window, .. }
            | Event::CloseRequested { window, .. }
            | Event::Custom { window, .. } => window,
        }
    }

    /// Event timestamp, or zero for kinds that carry none.
    pub fn time(&self) -> Timestamp {
        match *self {
            Event::ButtonPress { time, .. }
            | Event::ButtonRelease { time, .. }
            | Event::DoubleClick { time, .. }
            | Event::Motion { time, .. }
            | Event::KeyPress { time, .. }
            | Event::KeyRelease { time, .. }
            | Event::Enter { time, .. }
            | Event::Leave { time, .. }
            | Event::FocusIn { time, .. }
            | Event::FocusOut { time, .. }
            | Event::Drag { time, .. }
            | Event::CloseRequested { time, .. } => time,
            Event::Expose { .. } | Event::Configure { .. } | Event::Custom { .. } => 0,
        }
    }

    /// Kind discriminator for filter matching.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::ButtonPress { .. } => EventKind::ButtonPress,
            Event::ButtonRelease { .. } => EventKind::ButtonRelease,
            Event::DoubleClick { .. } => EventKind::DoubleClick,
            Event::Motion { .. } => EventKind::Motion,
            Event::KeyPress { .. } => EventKind::KeyPress,
            Event::KeyRelease { .. } => EventKind::KeyRelease,
            Event::Enter { .. } => EventKind::Enter,
            Event::Leave { .. } => EventKind::Leave,
            Event::FocusIn { .. } => EventKind::FocusIn,
            Event::FocusOut { .. } => EventKind::FocusOut,
            Event::Expose { .. } => EventKind::Expose,
            Event::Configure { .. } => EventKind::Configure,
            Event::Drag { .. } => EventKind::Drag,
            Event::CloseRequested { .. } => EventKind::CloseRequested,
            Event::Custom { .. } => EventKind::Custom,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::WindowArena;

    #[test]
    fn test_event_accessors() {
        let mut arena = WindowArena::new();
        let win = arena.insert(Default::default());

        let press = Event::ButtonPress {
            window: win,
            time: 1234,
            x: 10,
            y: 20,
            root_x: 110,
            root_y: 220,
            state: Modifiers::SHIFT,
            button: 1,
        };
        assert_eq!(press.window(), win);
        assert_eq!(press.time(), 1234);
        assert_eq!(press.kind(), EventKind::ButtonPress);

        let expose = Event::Expose {
            window: win,
            region: Rect::new(0, 0, 64, 64),
            remaining: 0,
        };
        assert_eq!(expose.time(), 0);
        assert_eq!(expose.kind(), EventKind::Expose);
    }

    #[test]
    fn test_modifiers_from_buttons() {
        let state = Modifiers::from_buttons(Buttons::LEFT | Buttons::RIGHT);
        assert_eq!(state, Modifiers::BUTTON1 | Modifiers::BUTTON3);
        assert_eq!(Modifiers::from_buttons(Buttons::empty()), Modifiers::empty());
    }

    #[test]
    fn test_rect_contains() {
        let r = Rect::new(10, 10, 100, 50);
        assert!(r.contains(10, 10));
        assert!(r.contains(109, 59));
        assert!(!r.contains(110, 30));
        assert!(!r.contains(9, 30));
    }
}
