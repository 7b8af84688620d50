//! Async Protocol Request Tracker
//!
//! Batches wire-protocol round trips: several non-blocking requests are
//! issued back-to-back and each callback resolves as replies stream in,
//! instead of one request/block/reply cycle per call. Replies for a
//! single connection arrive in issuance order, so sequence numbers map
//! to pending records without extra correlation ids.
//!
//! The tracker is generic over [`WireTransport`] so the batching logic
//! runs (and tests) without a display server; the `x11` feature
//! provides a transport over a live connection.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, warn};

use crate::event::Rect;

/// Monotonically increasing wire-protocol request identifier.
pub type SeqNo = u64;

/// Classification of a wire-protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireErrorKind {
    /// The referenced window no longer exists.
    WindowGone,
    /// The referenced drawable no longer exists.
    DrawableGone,
    /// The server refused the request.
    Access,
    /// Any other protocol-level failure.
    Protocol,
    /// The connection itself is unusable.
    ConnectionBroken,
}

impl WireErrorKind {
    /// Whether this error means one child vanished mid-walk — tolerated
    /// per record — as opposed to a failure that invalidates the whole
    /// batch. Exactly these two codes are benign; everything else is
    /// fatal.
    pub fn is_benign_child_loss(self) -> bool {
        matches!(self, WireErrorKind::WindowGone | WireErrorKind::DrawableGone)
    }
}

/// A wire-protocol failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("wire protocol error: {kind:?}")]
pub struct WireError {
    pub kind: WireErrorKind,
}

impl WireError {
    pub fn new(kind: WireErrorKind) -> Self {
        Self { kind }
    }
}

/// Requests the child-info walk issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireRequest {
    /// Fetch a property and report whether it is present.
    GetProperty { window: u32, property: u32 },
    /// Fetch map state and window class.
    GetAttributes { window: u32 },
    /// Fetch root-relative geometry.
    GetGeometry { window: u32 },
}

/// Replies (or per-request failures) streamed back in issuance order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireReply {
    Property {
        present: bool,
    },
    Attributes {
        mapped: bool,
        input_only: bool,
        override_redirect: bool,
    },
    Geometry {
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    },
    /// The request with this sequence number failed.
    Failure { kind: WireErrorKind },
}

/// Connection-level primitives the tracker builds on. Single-writer:
/// only the loop thread issues requests and pumps replies.
pub trait WireTransport {
    /// Enumerate the children of a window. Blocking; failure here fails
    /// the whole batch fast.
    fn query_children(&mut self, parent: u32) -> Result<Vec<u32>, WireError>;

    /// Issue one request without waiting for its reply.
    fn send_request(&mut self, request: WireRequest) -> Result<SeqNo, WireError>;

    /// Deliver any replies already buffered, in issuance order, without
    /// blocking.
    fn poll_replies(
        &mut self,
        sink: &mut dyn FnMut(SeqNo, WireReply),
    ) -> Result<(), WireError>;

    /// Block until every reply up to and including `seq` has been
    /// delivered through `sink`. The one blocking wait of a batch.
    fn wait_for(
        &mut self,
        seq: SeqNo,
        sink: &mut dyn FnMut(SeqNo, WireReply),
    ) -> Result<(), WireError>;
}

/// Pending-record table: sequence number to opaque tag, resolved
/// at-most-once as the reply interceptor observes matching sequence
/// numbers.
#[derive(Debug)]
pub struct ReplyTracker<T> {
    pending: HashMap<SeqNo, T>,
}

impl<T> ReplyTracker<T> {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    /// Record an in-flight request. Registering the same sequence
    /// number twice is a contract violation.
    pub fn register(&mut self, seq: SeqNo, tag: T) {
        let previous = self.pending.insert(seq, tag);
        debug_assert!(previous.is_none(), "sequence number {seq} registered twice");
    }

    /// Take the record for a sequence number, if it is one of ours.
    /// A second resolve of the same number returns None.
    pub fn resolve(&mut self, seq: SeqNo) -> Option<T> {
        self.pending.remove(&seq)
    }

    /// Requests still awaiting replies.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

impl<T> Default for ReplyTracker<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-child step of the three-request state machine, in issuance
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Property,
    Attributes,
    Geometry,
}

#[derive(Debug, Clone, Copy)]
struct PendingSlot {
    child: usize,
    step: Step,
}

/// Fully resolved description of one child window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildInfo {
    pub window: u32,
    pub geometry: Rect,
    pub mapped: bool,
    pub override_redirect: bool,
    /// Whether the requested tag property was present on the window.
    pub tagged: bool,
}

#[derive(Debug, Default)]
struct Partial {
    window: u32,
    tagged: Option<bool>,
    mapped: Option<bool>,
    input_only: bool,
    override_redirect: bool,
    geometry: Option<Rect>,
    failed: bool,
}

/// Describe every child of `parent`: tag-property presence, map state,
/// and geometry, with a single blocking wait regardless of child count.
///
/// Children that vanish mid-walk (their requests fail with a benign
/// error) are excluded from the result; any other per-request failure
/// aborts the batch. A failed enumeration fails fast with no partial
/// result.
pub fn collect_child_info(
    transport: &mut dyn WireTransport,
    parent: u32,
    tag_property: u32,
) -> Result<Vec<ChildInfo>, WireError> {
    let children = transport.query_children(parent)?;
    if children.is_empty() {
        return Ok(Vec::new());
    }
    debug!("collecting info for {} children of {parent}", children.len());

    let mut tracker: ReplyTracker<PendingSlot> = ReplyTracker::new();
    let mut partials: Vec<Partial> = children
        .iter()
        .map(|&window| Partial {
            window,
            ..Partial::default()
        })
        .collect();

    let mut last_seq = 0;
    for (child, &window) in children.iter().enumerate() {
        let seq = transport.send_request(WireRequest::GetProperty {
            window,
            property: tag_property,
        })?;
        tracker.register(seq, PendingSlot { child, step: Step::Property });

        let seq = transport.send_request(WireRequest::GetAttributes { window })?;
        tracker.register(seq, PendingSlot { child, step: Step::Attributes });

        let seq = transport.send_request(WireRequest::GetGeometry { window })?;
        tracker.register(seq, PendingSlot { child, step: Step::Geometry });
        last_seq = seq;
    }

    let mut fatal: Option<WireErrorKind> = None;
    {
        let mut sink = |seq: SeqNo, reply: WireReply| {
            let Some(slot) = tracker.resolve(seq) else {
                // Not one of ours; another caller's reply stream.
                return;
            };
            apply_reply(&mut partials[slot.child], slot.step, reply, &mut fatal);
        };

        // Opportunistic drain of whatever already streamed in, then the
        // single blocking wait for the final outstanding reply.
        transport.poll_replies(&mut sink)?;
        transport.wait_for(last_seq, &mut sink)?;
    }

    if let Some(kind) = fatal {
        return Err(WireError::new(kind));
    }
    debug_assert_eq!(tracker.outstanding(), 0);

    Ok(partials
        .into_iter()
        .filter_map(|partial| {
            if partial.failed || partial.input_only {
                return None;
            }
            Some(ChildInfo {
                window: partial.window,
                geometry: partial.geometry?,
                mapped: partial.mapped?,
                override_redirect: partial.override_redirect,
                tagged: partial.tagged?,
            })
        })
        .collect())
}

fn apply_reply(
    partial: &mut Partial,
    step: Step,
    reply: WireReply,
    fatal: &mut Option<WireErrorKind>,
) {
    match (step, reply) {
        (Step::Property, WireReply::Property { present }) => {
            partial.tagged = Some(present);
        }
        (
            Step::Attributes,
            WireReply::Attributes {
                mapped,
                input_only,
                override_redirect,
            },
        ) => {
            partial.mapped = Some(mapped);
            partial.input_only = input_only;
            partial.override_redirect = override_redirect;
        }
        (Step::Geometry, WireReply::Geometry { x, y, width, height }) => {
            partial.geometry = Some(Rect::new(x, y, width, height));
        }
        (_, WireReply::Failure { kind }) => {
            if kind.is_benign_child_loss() {
                debug!("child {} vanished mid-walk ({kind:?})", partial.window);
                partial.failed = true;
            } else {
                *fatal = Some(kind);
            }
        }
        (step, reply) => {
            // Reply shape does not match the request issued for this
            // sequence number.
            debug_assert!(false, "mismatched reply {reply:?} for step {step:?}");
            warn!("mismatched reply for child {}", partial.window);
            partial.failed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted transport: replies are computed at send time and
    /// delivered in issuance order. `broken` windows fail their first
    /// sub-request with the given error kind.
    struct FakeTransport {
        children: Vec<u32>,
        broken: HashMap<u32, WireErrorKind>,
        queued: VecDeque<(SeqNo, WireReply)>,
        next_seq: SeqNo,
        /// Queued replies delivered eagerly by poll_replies.
        eager: usize,
        blocking_waits: usize,
        enumeration_fails: bool,
    }

    impl FakeTransport {
        fn new(children: Vec<u32>) -> Self {
            Self {
                children,
                broken: HashMap::new(),
                queued: VecDeque::new(),
                next_seq: 100,
                eager: 0,
                blocking_waits: 0,
                enumeration_fails: false,
            }
        }

        fn reply_for(&self, request: WireRequest) -> WireReply {
            let window = match request {
                WireRequest::GetProperty { window, .. }
                | WireRequest::GetAttributes { window }
                | WireRequest::GetGeometry { window } => window,
            };
            if let Some(&kind) = self.broken.get(&window) {
                return WireReply::Failure { kind };
            }
            match request {
                WireRequest::GetProperty { .. } => WireReply::Property {
                    present: window % 2 == 0,
                },
                WireRequest::GetAttributes { .. } => WireReply::Attributes {
                    mapped: true,
                    input_only: false,
                    override_redirect: false,
                },
                WireRequest::GetGeometry { window } => WireReply::Geometry {
                    x: window as i32,
                    y: 0,
                    width: 100,
                    height: 50,
                },
            }
        }
    }

    impl WireTransport for FakeTransport {
        fn query_children(&mut self, _parent: u32) -> Result<Vec<u32>, WireError> {
            if self.enumeration_fails {
                return Err(WireError::new(WireErrorKind::WindowGone));
            }
            Ok(self.children.clone())
        }

        fn send_request(&mut self, request: WireRequest) -> Result<SeqNo, WireError> {
            let seq = self.next_seq;
            self.next_seq += 1;
            let reply = self.reply_for(request);
            self.queued.push_back((seq, reply));
            Ok(seq)
        }

        fn poll_replies(
            &mut self,
            sink: &mut dyn FnMut(SeqNo, WireReply),
        ) -> Result<(), WireError> {
            for _ in 0..self.eager.min(self.queued.len()) {
                let (seq, reply) = self.queued.pop_front().unwrap();
                sink(seq, reply);
            }
            Ok(())
        }

        fn wait_for(
            &mut self,
            seq: SeqNo,
            sink: &mut dyn FnMut(SeqNo, WireReply),
        ) -> Result<(), WireError> {
            self.blocking_waits += 1;
            while let Some(&(front, _)) = self.queued.front() {
                if front > seq {
                    break;
                }
                let (seq, reply) = self.queued.pop_front().unwrap();
                sink(seq, reply);
            }
            Ok(())
        }
    }

    #[test]
    fn test_batch_resolves_all_children() {
        let mut transport = FakeTransport::new(vec![2, 4, 6]);
        let infos = collect_child_info(&mut transport, 1, 77).unwrap();

        assert_eq!(infos.len(), 3);
        assert_eq!(infos[0].window, 2);
        assert!(infos[0].tagged);
        assert!(infos[0].mapped);
        assert_eq!(infos[0].geometry, Rect::new(2, 0, 100, 50));
    }

    #[test]
    fn test_destroyed_child_is_tolerated() {
        // Five children, one already destroyed: the other four resolve
        // fully and the batch succeeds.
        let mut transport = FakeTransport::new(vec![10, 11, 12, 13, 14]);
        transport.broken.insert(12, WireErrorKind::WindowGone);

        let infos = collect_child_info(&mut transport, 1, 77).unwrap();
        assert_eq!(infos.len(), 4);
        assert!(infos.iter().all(|i| i.window != 12));
    }

    #[test]
    fn test_fatal_error_aborts_batch() {
        let mut transport = FakeTransport::new(vec![10, 11]);
        transport.broken.insert(11, WireErrorKind::Access);

        let err = collect_child_info(&mut transport, 1, 77).unwrap_err();
        assert_eq!(err.kind, WireErrorKind::Access);
    }

    #[test]
    fn test_enumeration_failure_fails_fast() {
        let mut transport = FakeTransport::new(vec![10]);
        transport.enumeration_fails = true;

        assert!(collect_child_info(&mut transport, 1, 77).is_err());
        assert_eq!(transport.blocking_waits, 0);
    }

    #[test]
    fn test_single_blocking_wait_regardless_of_batch_size() {
        let mut transport = FakeTransport::new((0..20).collect());
        let infos = collect_child_info(&mut transport, 1, 77).unwrap();
        assert_eq!(infos.len(), 20);
        assert_eq!(transport.blocking_waits, 1);
    }

    #[test]
    fn test_opportunistic_replies_also_count_once() {
        // Half the replies stream in before the terminal wait.
        let mut transport = FakeTransport::new(vec![2, 4, 6, 8]);
        transport.eager = 6;

        let infos = collect_child_info(&mut transport, 1, 77).unwrap();
        assert_eq!(infos.len(), 4);
        assert_eq!(transport.blocking_waits, 1);
    }

    #[test]
    fn test_benign_error_classification() {
        assert!(WireErrorKind::WindowGone.is_benign_child_loss());
        assert!(WireErrorKind::DrawableGone.is_benign_child_loss());
        assert!(!WireErrorKind::Access.is_benign_child_loss());
        assert!(!WireErrorKind::Protocol.is_benign_child_loss());
        assert!(!WireErrorKind::ConnectionBroken.is_benign_child_loss());
    }

    #[test]
    fn test_reply_tracker_resolves_at_most_once() {
        let mut tracker: ReplyTracker<u32> = ReplyTracker::new();
        tracker.register(5, 42);
        assert_eq!(tracker.outstanding(), 1);
        assert_eq!(tracker.resolve(5), Some(42));
        assert_eq!(tracker.resolve(5), None);
        assert_eq!(tracker.outstanding(), 0);
    }
}
