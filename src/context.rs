//! Event Loop Context
//!
//! The explicit top-level object replacing process-wide display/queue
//! globals: it owns the window arena, the dispatch source, the lazy
//! poll bridge, and the registered fd watches, with an init/shutdown
//! lifecycle driven by the embedding application. One per process by
//! convention, not by construction.

use tracing::{debug, info, warn};

use crate::bridge::{FdInterest, FdReadiness, PollBridge};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{Event, Timestamp};
use crate::pump::{Deadline, NativePump};
use crate::source::{DispatchSource, EventCallback, FilterRule};
use crate::window::{WindowArena, WindowId, WindowInfo};

/// What a watch callback wants done with its watch afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    Keep,
    /// Tear the watch down (device gone, read error).
    Remove,
}

/// Callback invoked with the readiness of a watched descriptor.
pub type WatchCallback = Box<dyn FnMut(FdReadiness) -> WatchAction>;

/// Handle to a registered fd watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

struct FdWatch {
    id: WatchId,
    interest: FdInterest,
    callback: WatchCallback,
}

/// Top-level state of one event loop.
pub struct EventLoopContext {
    windows: WindowArena,
    source: DispatchSource,
    bridge: Option<PollBridge>,
    watches: Vec<FdWatch>,
    next_watch: u64,
    last_event_time: Timestamp,
    bridge_capacity: usize,
}

impl EventLoopContext {
    /// Initialize the loop around a native pump.
    pub fn new(pump: Box<dyn NativePump>, config: Config) -> Self {
        info!("initializing event loop context");
        Self {
            windows: WindowArena::new(),
            source: DispatchSource::new(pump, &config.input),
            bridge: None,
            watches: Vec::new(),
            next_watch: 0,
            last_event_time: 0,
            bridge_capacity: config.bridge.fd_capacity,
        }
    }

    /// Register the single widget-layer event callback.
    pub fn set_event_callback(&mut self, callback: EventCallback) {
        self.source.set_callback(callback);
    }

    /// Add an event filter rule.
    pub fn add_filter(&mut self, rule: FilterRule) {
        self.source.add_filter(rule);
    }

    pub fn windows(&self) -> &WindowArena {
        &self.windows
    }

    pub fn windows_mut(&mut self) -> &mut WindowArena {
        &mut self.windows
    }

    /// Register a window and return its id.
    pub fn create_window(&mut self, info: WindowInfo) -> WindowId {
        self.windows.insert(info)
    }

    /// Destroy a window. Queued events targeting it are dropped at
    /// dispatch.
    pub fn destroy_window(&mut self, id: WindowId) {
        if self.windows.remove(id).is_none() {
            debug!("destroy of unknown window {:?}", id);
        }
    }

    /// Append a synthetic, already-portable event to the queue tail.
    pub fn post_event(&mut self, event: Event) {
        self.source.post_event(event);
    }

    /// Timestamp of the most recently dispatched event.
    pub fn last_event_time(&self) -> Timestamp {
        self.last_event_time
    }

    /// Monitor a foreign descriptor. The callback runs on the loop
    /// thread whenever the descriptor reports readiness; returning
    /// [`WatchAction::Remove`] tears the watch down.
    pub fn watch_fd(&mut self, interest: FdInterest, callback: WatchCallback) -> WatchId {
        let id = WatchId(self.next_watch);
        self.next_watch += 1;
        self.watches.push(FdWatch {
            id,
            interest,
            callback,
        });
        debug!("watching fd {} as {:?}", interest.fd, id);
        id
    }

    /// Stop monitoring. Returns false if the watch was already gone.
    pub fn unwatch_fd(&mut self, id: WatchId) -> bool {
        let before = self.watches.len();
        self.watches.retain(|w| w.id != id);
        before != self.watches.len()
    }

    /// Run one reactor iteration: check for pending work, block up to
    /// `deadline` (handing foreign descriptors to the poll bridge so
    /// the native pump stays the only thing the loop thread blocks on),
    /// deliver fd readiness, then dispatch one event. Returns whether
    /// the source had work to dispatch this turn.
    pub fn iterate(&mut self, deadline: Deadline) -> Result<bool> {
        let (ready, _timeout_hint) = self.source.prepare()?;

        // Readiness the bridge published while this thread was busy is
        // delivered before blocking again, never silently dropped.
        let mut stale_readiness = false;
        if let Some(bridge) = self.bridge.as_mut() {
            if bridge.has_results() {
                let results = bridge.take_results();
                self.deliver_fd_readiness(results);
                stale_readiness = true;
            }
        }

        if !ready && !stale_readiness {
            if self.watches.is_empty() {
                // The native pump is the sole waitable; block on it
                // directly.
                self.source.wait_native(deadline)?;
            } else {
                self.wait_with_bridge(deadline)?;
            }
        }

        let had_work = self.source.is_ready();
        self.source.dispatch(&self.windows, &mut self.last_event_time);
        Ok(had_work)
    }

    /// Hand the blocking wait to the bridge: it blocks on the foreign
    /// descriptors while this thread blocks on the native pump, which
    /// the bridge can interrupt with a synthetic wake.
    fn wait_with_bridge(&mut self, deadline: Deadline) -> Result<()> {
        if let Deadline::Now = deadline {
            // Non-blocking turn: nothing to hand off.
            return self.source.wait_native(Deadline::Now);
        }

        if self.bridge.is_none() {
            let waker = self.source.waker();
            self.bridge = Some(PollBridge::new(waker, self.bridge_capacity));
        }
        let Some(bridge) = self.bridge.as_mut() else {
            return Err(Error::Bridge("poll bridge unavailable".into()));
        };

        let fds: Vec<FdInterest> = self.watches.iter().map(|w| w.interest).collect();
        bridge.arm(&fds, deadline.timeout())?;
        self.source.wait_native(Deadline::Indefinite)?;

        let results = bridge.take_results();
        self.deliver_fd_readiness(results);
        Ok(())
    }

    fn deliver_fd_readiness(&mut self, results: Vec<FdReadiness>) {
        for readiness in results {
            let Some(position) = self
                .watches
                .iter()
                .position(|w| w.interest.fd == readiness.fd)
            else {
                debug!("readiness for unwatched fd {}", readiness.fd);
                continue;
            };
            let action = (self.watches[position].callback)(readiness);
            if action == WatchAction::Remove {
                let watch = self.watches.remove(position);
                warn!(
                    "watch {:?} on fd {} removed by its callback",
                    watch.id, watch.interest.fd
                );
            }
        }
    }

    /// Stop the poll bridge thread and drop all watches. The context
    /// is still usable for non-blocking dispatch afterwards.
    pub fn shutdown(&mut self) {
        info!("shutting down event loop context");
        if let Some(mut bridge) = self.bridge.take() {
            bridge.shutdown();
        }
        self.watches.clear();
    }
}

impl Drop for EventLoopContext {
    fn drop(&mut self) {
        if self.bridge.is_some() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pump::{ChannelPump, NativeEvent};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn context_with_injector() -> (EventLoopContext, crate::pump::ChannelInjector) {
        let pump = ChannelPump::new();
        let injector = pump.injector();
        (
            EventLoopContext::new(Box::new(pump), Config::default()),
            injector,
        )
    }

    #[test]
    fn test_post_event_and_iterate() {
        let (mut ctx, _injector) = context_with_injector();
        let win = ctx.create_window(WindowInfo::default());

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        ctx.set_event_callback(Box::new(move |event| {
            sink.borrow_mut().push(event.clone());
        }));

        ctx.post_event(Event::FocusIn {
            window: win,
            time: 11,
        });
        assert!(ctx.iterate(Deadline::Now).unwrap());
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(ctx.last_event_time(), 11);

        // Nothing pending: a non-blocking turn delivers nothing.
        assert!(!ctx.iterate(Deadline::Now).unwrap());
    }

    #[test]
    fn test_iterate_translates_native_events() {
        let (mut ctx, injector) = context_with_injector();
        let win = ctx.create_window(WindowInfo::default());

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        ctx.set_event_callback(Box::new(move |event| {
            sink.borrow_mut().push(event.clone());
        }));

        injector
            .send(NativeEvent::CloseRequest {
                window: win,
                time: 99,
            })
            .unwrap();

        assert!(ctx.iterate(Deadline::Now).unwrap());
        assert!(matches!(
            seen.borrow()[0],
            Event::CloseRequested { time: 99, .. }
        ));
    }

    #[test]
    fn test_destroyed_window_events_dropped() {
        let (mut ctx, _injector) = context_with_injector();
        let win = ctx.create_window(WindowInfo::default());

        let seen = Rc::new(RefCell::new(0usize));
        let sink = seen.clone();
        ctx.set_event_callback(Box::new(move |_| {
            *sink.borrow_mut() += 1;
        }));

        ctx.post_event(Event::FocusIn {
            window: win,
            time: 1,
        });
        ctx.destroy_window(win);
        ctx.iterate(Deadline::Now).unwrap();
        assert_eq!(*seen.borrow(), 0);
    }

    #[test]
    fn test_unwatch_fd() {
        let (mut ctx, _injector) = context_with_injector();
        let id = ctx.watch_fd(
            FdInterest::readable(0),
            Box::new(|_| WatchAction::Keep),
        );
        assert!(ctx.unwatch_fd(id));
        assert!(!ctx.unwatch_fd(id));
    }
}
