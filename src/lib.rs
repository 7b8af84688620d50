//! Portico — portable windowing event-loop core
//!
//! The event-sourcing/dispatch layer a portable GUI toolkit sits on:
//! native events are fetched from a host-specific pump, translated into
//! one normalized [`Event`] form, queued FIFO, and delivered one at a
//! time to the registered callback. A background poll bridge lets the
//! loop thread block on the native pump while arbitrary foreign file
//! descriptors are monitored on its behalf, and the request tracker
//! batches wire-protocol round trips for server-backed windowing.
//!
//! Backends implement [`NativePump`] (and, for wire-protocol hosts,
//! [`WireTransport`]); the widget layer registers a single callback and
//! drives [`EventLoopContext::iterate`].
//!
//! # Quick Start
//! ```
//! use portico::{ChannelPump, Config, Deadline, Event, EventLoopContext, WindowInfo};
//!
//! let pump = ChannelPump::new();
//! let injector = pump.injector();
//! let mut ctx = EventLoopContext::new(Box::new(pump), Config::default());
//!
//! let window = ctx.create_window(WindowInfo::default());
//! ctx.set_event_callback(Box::new(|event: &Event| {
//!     println!("event: {:?}", event.kind());
//! }));
//!
//! // A backend (here: the in-process injector) produces a native event.
//! injector
//!     .send(portico::NativeEvent::CloseRequest { window, time: 0 })
//!     .unwrap();
//!
//! // One non-blocking reactor turn translates and dispatches it.
//! while ctx.iterate(Deadline::Now).unwrap() {}
//! ctx.shutdown();
//! ```

pub mod bridge;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod pointer;
pub mod pump;
pub mod queue;
pub mod source;
pub mod tracker;
pub mod window;

#[cfg(feature = "x11")]
pub mod x11;

// Re-export primary API types at crate root
pub use bridge::{FdInterest, FdReadiness, PollBridge};
pub use config::{BridgeConfig, Config, InputConfig};
pub use context::{EventLoopContext, WatchAction, WatchCallback, WatchId};
pub use error::{Error, Result};
pub use event::{Buttons, DragPhase, Event, EventKind, Modifiers, Rect, Timestamp};
pub use pointer::{PointerPacket, PointerState};
pub use pump::{ChannelInjector, ChannelPump, Deadline, NativeEvent, NativePump, PumpWaker};
pub use queue::EventQueue;
pub use source::{DispatchSource, EventCallback, FilterRule, FilterStatus};
pub use tracker::{
    collect_child_info, ChildInfo, ReplyTracker, SeqNo, WireError, WireErrorKind, WireReply,
    WireRequest, WireTransport,
};
pub use window::{WindowArena, WindowId, WindowInfo};
