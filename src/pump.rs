//! Native Pump Adapter
//!
//! Uniform contract over the host's native event-fetch primitive: a
//! run-loop "next event" call, a wire-protocol socket read, or (for
//! embedders without a display) an in-process channel. The adapter
//! fetches raw [`NativeEvent`]s; translation into portable [`Event`]s
//! happens in the dispatch source.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::event::{DragPhase, Timestamp};
use crate::window::WindowId;

/// How long a fetch may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Return immediately if nothing is ready.
    Now,
    /// Block for at most this long.
    After(Duration),
    /// Block until any native event arrives, including a synthetic wake.
    Indefinite,
}

impl Deadline {
    /// The deadline as an optional timeout (`None` = indefinite).
    /// `Now` maps to a zero timeout.
    pub fn timeout(self) -> Option<Duration> {
        match self {
            Deadline::Now => Some(Duration::ZERO),
            Deadline::After(d) => Some(d),
            Deadline::Indefinite => None,
        }
    }
}

/// Backend-shaped raw event, prior to translation.
///
/// Coordinates are window-local (`x`, `y`) and root-relative (`root_x`,
/// `root_y`); `state_bits` is the backend's modifier mask in X11 bit
/// layout.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeEvent {
    Button {
        window: WindowId,
        time: Timestamp,
        x: i32,
        y: i32,
        root_x: i32,
        root_y: i32,
        state_bits: u16,
        button: u8,
        pressed: bool,
    },
    Motion {
        window: WindowId,
        time: Timestamp,
        x: i32,
        y: i32,
        root_x: i32,
        root_y: i32,
        state_bits: u16,
    },
    Key {
        window: WindowId,
        time: Timestamp,
        keycode: u16,
        state_bits: u16,
        pressed: bool,
    },
    Crossing {
        window: WindowId,
        time: Timestamp,
        x: i32,
        y: i32,
        entered: bool,
    },
    Focus {
        window: WindowId,
        time: Timestamp,
        gained: bool,
    },
    Expose {
        window: WindowId,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        remaining: u16,
    },
    Configure {
        window: WindowId,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    },
    Drag {
        window: WindowId,
        time: Timestamp,
        phase: DragPhase,
        x: i32,
        y: i32,
    },
    CloseRequest {
        window: WindowId,
        time: Timestamp,
    },
    ClientMessage {
        window: WindowId,
        tag: u32,
        data: [u32; 4],
    },
    /// Synthetic wake posted by the poll bridge (or any other thread)
    /// to interrupt an indefinite fetch. Never delivered to callbacks.
    Wake,
}

/// Cross-thread wake handle for a pump.
///
/// `post_wake` injects a synthetic wake event into the native stream so
/// a fetch blocked with [`Deadline::Indefinite`] returns. Callable from
/// any thread; the poll bridge holds one of these.
pub trait PumpWaker: Send + Sync {
    fn post_wake(&self);
}

/// Uniform "fetch next native event" contract over a host event system.
pub trait NativePump {
    /// Fetch the next native event, blocking no longer than `deadline`.
    ///
    /// `Deadline::Now` must not block; `Indefinite` blocks until any
    /// event is observed, including a wake posted through the waker.
    fn fetch_event(&mut self, deadline: Deadline) -> Result<Option<NativeEvent>>;

    /// Wake handle usable from other threads.
    fn waker(&self) -> Arc<dyn PumpWaker>;
}

/// In-process pump over an mpsc channel.
///
/// The reference backend: tests and headless embedders inject native
/// events through a [`ChannelInjector`]; the waker posts
/// [`NativeEvent::Wake`] into the same channel.
pub struct ChannelPump {
    rx: mpsc::Receiver<NativeEvent>,
    tx: mpsc::Sender<NativeEvent>,
}

/// Cloneable producer half of a [`ChannelPump`].
#[derive(Clone)]
pub struct ChannelInjector {
    tx: mpsc::Sender<NativeEvent>,
}

impl ChannelInjector {
    /// Queue a native event for the pump. Fails only if the pump has
    /// been dropped.
    pub fn send(&self, event: NativeEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| Error::Pump("event channel closed".into()))
    }
}

struct ChannelWaker {
    tx: Mutex<mpsc::Sender<NativeEvent>>,
}

impl PumpWaker for ChannelWaker {
    fn post_wake(&self) {
        // A closed channel means the pump is gone and nobody is left
        // to wake.
        if let Ok(tx) = self.tx.lock() {
            let _ = tx.send(NativeEvent::Wake);
        }
    }
}

impl ChannelPump {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self { rx, tx }
    }

    /// Producer handle for injecting native events.
    pub fn injector(&self) -> ChannelInjector {
        ChannelInjector {
            tx: self.tx.clone(),
        }
    }
}

impl Default for ChannelPump {
    fn default() -> Self {
        Self::new()
    }
}

impl NativePump for ChannelPump {
    fn fetch_event(&mut self, deadline: Deadline) -> Result<Option<NativeEvent>> {
        match deadline {
            Deadline::Now => match self.rx.try_recv() {
                Ok(event) => Ok(Some(event)),
                Err(mpsc::TryRecvError::Empty) => Ok(None),
                Err(mpsc::TryRecvError::Disconnected) => {
                    Err(Error::Pump("event channel closed".into()))
                }
            },
            Deadline::After(timeout) => match self.rx.recv_timeout(timeout) {
                Ok(event) => Ok(Some(event)),
                Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    Err(Error::Pump("event channel closed".into()))
                }
            },
            Deadline::Indefinite => match self.rx.recv() {
                Ok(event) => Ok(Some(event)),
                Err(_) => Err(Error::Pump("event channel closed".into())),
            },
        }
    }

    fn waker(&self) -> Arc<dyn PumpWaker> {
        Arc::new(ChannelWaker {
            tx: Mutex::new(self.tx.clone()),
        })
    }
}
