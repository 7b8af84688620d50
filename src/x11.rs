//! X11 Backend
//!
//! Native pump and wire transport over an X11 connection: the
//! connection socket is polled with mio for timed waits, cross-thread
//! wakes are ClientMessages sent to a hidden input-only window, and the
//! child-info transport issues batched requests whose replies are
//! collected in issuance order (one socket round trip per batch).

use std::collections::{HashMap, VecDeque};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, info, warn};
use x11rb::connection::Connection;
use x11rb::cookie::Cookie;
use x11rb::errors::ReplyError;
use x11rb::protocol::xproto::{
    AtomEnum, ClientMessageEvent, ConnectionExt, CreateWindowAux, EventMask, GetGeometryReply,
    GetPropertyReply, GetWindowAttributesReply, MapState, WindowClass,
};
use x11rb::protocol::{ErrorKind, Event as XEvent};
use x11rb::rust_connection::RustConnection;

use crate::error::{Error, Result};
use crate::pump::{Deadline, NativeEvent, NativePump, PumpWaker};
use crate::tracker::{SeqNo, WireError, WireErrorKind, WireReply, WireRequest, WireTransport};
use crate::window::WindowId;

/// Cap on one blocking poll of the connection socket. Bounds the window
/// between draining buffered events and re-entering the wait.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

const CONN_TOKEN: Token = Token(0);

/// Native pump over an X11 connection.
///
/// X windows are bound to portico window ids with
/// [`bind_window`](Self::bind_window); events for unbound windows are
/// skipped during translation.
pub struct X11Pump {
    conn: Arc<RustConnection>,
    poll: Poll,
    events: Events,
    fd: std::os::unix::io::RawFd,
    bindings: HashMap<u32, WindowId>,
    wake_window: u32,
    wake_atom: u32,
    wm_protocols: u32,
    wm_delete_window: u32,
}

impl X11Pump {
    /// Wrap an established connection. Creates the hidden wake window
    /// and registers the connection socket for timed waits.
    pub fn new(conn: Arc<RustConnection>, screen_num: usize) -> anyhow::Result<Self> {
        let screen = &conn.setup().roots[screen_num];
        let root = screen.root;

        let wake_atom = conn
            .intern_atom(false, b"PORTICO_WAKE")
            .context("Failed to intern wake atom")?
            .reply()
            .context("Failed to intern wake atom")?
            .atom;
        let wm_protocols = conn
            .intern_atom(false, b"WM_PROTOCOLS")?
            .reply()
            .context("Failed to intern WM_PROTOCOLS")?
            .atom;
        let wm_delete_window = conn
            .intern_atom(false, b"WM_DELETE_WINDOW")?
            .reply()
            .context("Failed to intern WM_DELETE_WINDOW")?
            .atom;

        // Hidden input-only window: wake ClientMessages are addressed
        // to it and come back to us without ever being visible.
        let wake_window = conn.generate_id().context("Failed to allocate window id")?;
        conn.create_window(
            0,
            wake_window,
            root,
            -1,
            -1,
            1,
            1,
            0,
            WindowClass::INPUT_ONLY,
            0,
            &CreateWindowAux::new(),
        )
        .context("Failed to create wake window")?;
        conn.flush().context("Failed to flush wake window setup")?;
        debug!("created wake window 0x{:x}", wake_window);

        let fd = conn.stream().as_raw_fd();
        let poll = Poll::new().context("Failed to create poller")?;
        poll.registry()
            .register(&mut SourceFd(&fd), CONN_TOKEN, Interest::READABLE)
            .context("Failed to register X11 socket")?;

        info!("X11 pump initialized on screen {screen_num}");
        Ok(Self {
            conn,
            poll,
            events: Events::with_capacity(4),
            fd,
            bindings: HashMap::new(),
            wake_window,
            wake_atom,
            wm_protocols,
            wm_delete_window,
        })
    }

    /// Associate an X window with a portico window id.
    pub fn bind_window(&mut self, xid: u32, id: WindowId) {
        self.bindings.insert(xid, id);
    }

    /// Drop the association for a destroyed X window.
    pub fn unbind_window(&mut self, xid: u32) {
        self.bindings.remove(&xid);
    }

    fn lookup(&self, xid: u32) -> Option<WindowId> {
        let id = self.bindings.get(&xid).copied();
        if id.is_none() {
            debug!("event for unbound X window 0x{:x}", xid);
        }
        id
    }

    /// Translate one X event into raw native form. Events for unbound
    /// windows and event kinds without a portable counterpart map to
    /// None.
    fn translate(&self, event: XEvent) -> Option<NativeEvent> {
        match event {
            XEvent::ButtonPress(e) => Some(NativeEvent::Button {
                window: self.lookup(e.event)?,
                time: e.time,
                x: e.event_x.into(),
                y: e.event_y.into(),
                root_x: e.root_x.into(),
                root_y: e.root_y.into(),
                state_bits: u16::from(e.state),
                button: e.detail,
                pressed: true,
            }),
            XEvent::ButtonRelease(e) => Some(NativeEvent::Button {
                window: self.lookup(e.event)?,
                time: e.time,
                x: e.event_x.into(),
                y: e.event_y.into(),
                root_x: e.root_x.into(),
                root_y: e.root_y.into(),
                state_bits: u16::from(e.state),
                button: e.detail,
                pressed: false,
            }),
            XEvent::MotionNotify(e) => Some(NativeEvent::Motion {
                window: self.lookup(e.event)?,
                time: e.time,
                x: e.event_x.into(),
                y: e.event_y.into(),
                root_x: e.root_x.into(),
                root_y: e.root_y.into(),
                state_bits: u16::from(e.state),
            }),
            XEvent::KeyPress(e) => Some(NativeEvent::Key {
                window: self.lookup(e.event)?,
                time: e.time,
                keycode: e.detail.into(),
                state_bits: u16::from(e.state),
                pressed: true,
            }),
            XEvent::KeyRelease(e) => Some(NativeEvent::Key {
                window: self.lookup(e.event)?,
                time: e.time,
                keycode: e.detail.into(),
                state_bits: u16::from(e.state),
                pressed: false,
            }),
            XEvent::EnterNotify(e) => Some(NativeEvent::Crossing {
                window: self.lookup(e.event)?,
                time: e.time,
                x: e.event_x.into(),
                y: e.event_y.into(),
                entered: true,
            }),
            XEvent::LeaveNotify(e) => Some(NativeEvent::Crossing {
                window: self.lookup(e.event)?,
                time: e.time,
                x: e.event_x.into(),
                y: e.event_y.into(),
                entered: false,
            }),
            XEvent::FocusIn(e) => Some(NativeEvent::Focus {
                window: self.lookup(e.event)?,
                time: 0,
                gained: true,
            }),
            XEvent::FocusOut(e) => Some(NativeEvent::Focus {
                window: self.lookup(e.event)?,
                time: 0,
                gained: false,
            }),
            XEvent::Expose(e) => Some(NativeEvent::Expose {
                window: self.lookup(e.window)?,
                x: e.x.into(),
                y: e.y.into(),
                width: e.width.into(),
                height: e.height.into(),
                remaining: e.count,
            }),
            XEvent::ConfigureNotify(e) => Some(NativeEvent::Configure {
                window: self.lookup(e.window)?,
                x: e.x.into(),
                y: e.y.into(),
                width: e.width.into(),
                height: e.height.into(),
            }),
            XEvent::ClientMessage(e) => {
                if e.type_ == self.wake_atom {
                    return Some(NativeEvent::Wake);
                }
                if e.type_ == self.wm_protocols && e.format == 32 {
                    let data = e.data.as_data32();
                    if data[0] == self.wm_delete_window {
                        return Some(NativeEvent::CloseRequest {
                            window: self.lookup(e.window)?,
                            time: data[1],
                        });
                    }
                }
                let data32 = e.data.as_data32();
                Some(NativeEvent::ClientMessage {
                    window: self.lookup(e.window)?,
                    tag: e.type_,
                    data: [data32[0], data32[1], data32[2], data32[3]],
                })
            }
            XEvent::Error(e) => {
                warn!(
                    "X11 error: error_code={}, request_code={}",
                    e.error_code, e.major_opcode
                );
                None
            }
            _ => None,
        }
    }
}

impl NativePump for X11Pump {
    fn fetch_event(&mut self, deadline: Deadline) -> Result<Option<NativeEvent>> {
        let wait_until = match deadline {
            Deadline::After(timeout) => Some(Instant::now() + timeout),
            _ => None,
        };
        loop {
            // Drain everything x11rb has buffered before blocking.
            while let Some(event) = self
                .conn
                .poll_for_event()
                .map_err(|e| Error::Pump(format!("X11 connection failed: {e}")))?
            {
                if let Some(native) = self.translate(event) {
                    return Ok(Some(native));
                }
            }

            let timeout = match (deadline, wait_until) {
                (Deadline::Now, _) => return Ok(None),
                (Deadline::After(_), Some(at)) => {
                    let now = Instant::now();
                    if now >= at {
                        return Ok(None);
                    }
                    (at - now).min(POLL_INTERVAL)
                }
                _ => POLL_INTERVAL,
            };
            match self.poll.poll(&mut self.events, Some(timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Pump(format!("socket poll failed: {e}"))),
            }
        }
    }

    fn waker(&self) -> Arc<dyn PumpWaker> {
        Arc::new(X11Waker {
            conn: Arc::clone(&self.conn),
            wake_window: self.wake_window,
            wake_atom: self.wake_atom,
        })
    }
}

impl Drop for X11Pump {
    fn drop(&mut self) {
        let _ = self
            .poll
            .registry()
            .deregister(&mut SourceFd(&self.fd));
        let _ = self.conn.destroy_window(self.wake_window);
        let _ = self.conn.flush();
    }
}

struct X11Waker {
    conn: Arc<RustConnection>,
    wake_window: u32,
    wake_atom: u32,
}

impl PumpWaker for X11Waker {
    fn post_wake(&self) {
        let event = ClientMessageEvent::new(32, self.wake_window, self.wake_atom, [0u32; 5]);
        match self
            .conn
            .send_event(false, self.wake_window, EventMask::NO_EVENT, event)
        {
            Ok(_) => {
                if let Err(e) = self.conn.flush() {
                    warn!("failed to flush wake event: {e}");
                }
            }
            Err(e) => warn!("failed to post wake event: {e}"),
        }
    }
}

enum PendingCookie<'c> {
    Property(Cookie<'c, RustConnection, GetPropertyReply>),
    Attributes(Cookie<'c, RustConnection, GetWindowAttributesReply>),
    Geometry(Cookie<'c, RustConnection, GetGeometryReply>),
}

/// Child-info wire transport over a live connection.
///
/// Requests are flushed as they are issued; replies stream back in
/// issuance order, so collecting them front-to-back in `wait_for`
/// costs one socket round trip for the whole batch.
pub struct X11Transport<'c> {
    conn: &'c RustConnection,
    pending: VecDeque<(SeqNo, PendingCookie<'c>)>,
}

impl<'c> X11Transport<'c> {
    pub fn new(conn: &'c RustConnection) -> Self {
        Self {
            conn,
            pending: VecDeque::new(),
        }
    }
}

fn connection_broken() -> WireError {
    WireError::new(WireErrorKind::ConnectionBroken)
}

fn map_error_kind(kind: ErrorKind) -> WireErrorKind {
    match kind {
        ErrorKind::Window => WireErrorKind::WindowGone,
        ErrorKind::Drawable => WireErrorKind::DrawableGone,
        ErrorKind::Access => WireErrorKind::Access,
        _ => WireErrorKind::Protocol,
    }
}

/// Reply outcome for one request: a per-request failure becomes a
/// `Failure` reply, a dead connection fails the transport.
fn failure_reply(error: ReplyError) -> std::result::Result<WireReply, WireError> {
    match error {
        ReplyError::X11Error(e) => Ok(WireReply::Failure {
            kind: map_error_kind(e.error_kind),
        }),
        ReplyError::ConnectionError(_) => Err(connection_broken()),
    }
}

impl WireTransport for X11Transport<'_> {
    fn query_children(&mut self, parent: u32) -> std::result::Result<Vec<u32>, WireError> {
        let cookie = self
            .conn
            .query_tree(parent)
            .map_err(|_| connection_broken())?;
        match cookie.reply() {
            Ok(reply) => Ok(reply.children),
            Err(ReplyError::X11Error(e)) => Err(WireError::new(map_error_kind(e.error_kind))),
            Err(ReplyError::ConnectionError(_)) => Err(connection_broken()),
        }
    }

    fn send_request(&mut self, request: WireRequest) -> std::result::Result<SeqNo, WireError> {
        let (seq, pending) = match request {
            WireRequest::GetProperty { window, property } => {
                let cookie = self
                    .conn
                    .get_property(false, window, property, AtomEnum::ANY, 0, 1)
                    .map_err(|_| connection_broken())?;
                (cookie.sequence_number(), PendingCookie::Property(cookie))
            }
            WireRequest::GetAttributes { window } => {
                let cookie = self
                    .conn
                    .get_window_attributes(window)
                    .map_err(|_| connection_broken())?;
                (cookie.sequence_number(), PendingCookie::Attributes(cookie))
            }
            WireRequest::GetGeometry { window } => {
                let cookie = self
                    .conn
                    .get_geometry(window)
                    .map_err(|_| connection_broken())?;
                (cookie.sequence_number(), PendingCookie::Geometry(cookie))
            }
        };
        self.pending.push_back((seq, pending));
        Ok(seq)
    }

    fn poll_replies(
        &mut self,
        _sink: &mut dyn FnMut(SeqNo, WireReply),
    ) -> std::result::Result<(), WireError> {
        // Typed cookies surface replies only on demand; the batch is
        // drained in wait_for, where buffered replies resolve without
        // further round trips.
        Ok(())
    }

    fn wait_for(
        &mut self,
        seq: SeqNo,
        sink: &mut dyn FnMut(SeqNo, WireReply),
    ) -> std::result::Result<(), WireError> {
        self.conn.flush().map_err(|_| connection_broken())?;

        loop {
            let due = matches!(self.pending.front(), Some(&(front, _)) if front <= seq);
            if !due {
                break;
            }
            let Some((front_seq, cookie)) = self.pending.pop_front() else {
                break;
            };
            let reply = match cookie {
                PendingCookie::Property(c) => match c.reply() {
                    Ok(r) => WireReply::Property {
                        present: r.type_ != u32::from(AtomEnum::NONE),
                    },
                    Err(e) => failure_reply(e)?,
                },
                PendingCookie::Attributes(c) => match c.reply() {
                    Ok(r) => WireReply::Attributes {
                        mapped: r.map_state == MapState::VIEWABLE,
                        input_only: r.class == WindowClass::INPUT_ONLY,
                        override_redirect: r.override_redirect,
                    },
                    Err(e) => failure_reply(e)?,
                },
                PendingCookie::Geometry(c) => match c.reply() {
                    Ok(r) => WireReply::Geometry {
                        x: r.x.into(),
                        y: r.y.into(),
                        width: r.width.into(),
                        height: r.height.into(),
                    },
                    Err(e) => failure_reply(e)?,
                },
            };
            sink(front_seq, reply);
        }
        Ok(())
    }
}
