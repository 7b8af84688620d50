//! Dispatch Source
//!
//! The adapter a generic reactor polls to learn about and consume this
//! toolkit's events: `prepare` / `is_ready` / `dispatch`. Also home to
//! native-event translation, the event filter chain, motion
//! compression, and double-click synthesis.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::config::InputConfig;
use crate::error::Result;
use crate::event::{Event, EventKind, Modifiers, Rect, Timestamp};
use crate::pump::{Deadline, NativeEvent, NativePump, PumpWaker};
use crate::queue::EventQueue;
use crate::window::{WindowArena, WindowId};

/// Callback registered by the widget layer. Receives a transient
/// borrow; the event is destroyed after delivery.
pub type EventCallback = Box<dyn FnMut(&Event)>;

/// Result of filtering one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterStatus {
    /// Pass event through.
    #[default]
    Pass,
    /// Remove/ignore event.
    Remove,
}

/// Filter rule consulted before an event is enqueued.
#[derive(Debug, Clone)]
pub struct FilterRule {
    /// Window to match (None = all windows).
    pub window: Option<WindowId>,

    /// Event kind to match (None = all kinds).
    pub kind: Option<EventKind>,

    /// Action when both match.
    pub action: FilterStatus,
}

/// Tracks the previous button press for double-click synthesis.
#[derive(Debug, Default)]
struct ClickTracker {
    last: Option<(WindowId, u8, Timestamp, i32, i32)>,
}

impl ClickTracker {
    /// Whether this press completes a double click, updating state
    /// either way.
    fn observe(
        &mut self,
        window: WindowId,
        button: u8,
        time: Timestamp,
        x: i32,
        y: i32,
        max_delay: u32,
        max_distance: i32,
    ) -> bool {
        let double = match self.last {
            Some((w, b, t, px, py)) => {
                w == window
                    && b == button
                    && time.wrapping_sub(t) <= max_delay
                    && (x - px).abs() <= max_distance
                    && (y - py).abs() <= max_distance
            }
            None => false,
        };
        // A completed double click resets the chain so a third press
        // starts over instead of pairing with the second.
        self.last = if double {
            None
        } else {
            Some((window, button, time, x, y))
        };
        double
    }
}

/// The reactor-facing event source: owns the event queue and the
/// native pump, translates and enqueues on demand, and delivers one
/// event per dispatch.
pub struct DispatchSource {
    queue: EventQueue,
    pump: Box<dyn NativePump>,

    /// Native event fetched but not yet translated.
    buffered: Option<NativeEvent>,

    callback: Option<EventCallback>,
    filters: Vec<FilterRule>,

    compress_motion: bool,
    double_click_time: u32,
    double_click_distance: i32,
    clicks: ClickTracker,

    /// Events removed by the filter chain since creation.
    filtered_out: u64,
}

impl DispatchSource {
    pub fn new(pump: Box<dyn NativePump>, input: &InputConfig) -> Self {
        Self {
            queue: EventQueue::new(),
            pump,
            buffered: None,
            callback: None,
            filters: Vec::new(),
            compress_motion: input.compress_motion,
            double_click_time: input.double_click_time_ms,
            double_click_distance: input.double_click_distance,
            clicks: ClickTracker::default(),
            filtered_out: 0,
        }
    }

    /// Register the single widget-layer callback.
    pub fn set_callback(&mut self, callback: EventCallback) {
        self.callback = Some(callback);
    }

    /// Cross-thread wake handle of the underlying pump.
    pub fn waker(&self) -> Arc<dyn PumpWaker> {
        self.pump.waker()
    }

    /// Add a filter rule. Rules are consulted in insertion order;
    /// the first match wins.
    pub fn add_filter(&mut self, rule: FilterRule) {
        self.filters.push(rule);
    }

    pub fn clear_filters(&mut self) {
        self.filters.clear();
    }

    /// Events removed by filters so far.
    pub fn filtered_count(&self) -> u64 {
        self.filtered_out
    }

    /// Append an already-portable event to the queue tail. Widgets may
    /// enqueue synthetic events during dispatch.
    pub fn post_event(&mut self, event: Event) {
        self.queue.push(event);
    }

    /// True if the queue is non-empty or a fetched native event awaits
    /// translation.
    pub fn is_ready(&self) -> bool {
        self.queue.has_pending() || self.buffered.is_some()
    }

    /// Proactively attempt a non-blocking native fetch. Returns whether
    /// work is available now and, if not, the timeout the reactor
    /// should use (`None` = the reactor may block indefinitely).
    pub fn prepare(&mut self) -> Result<(bool, Option<Duration>)> {
        if self.is_ready() {
            return Ok((true, Some(Duration::ZERO)));
        }
        self.fetch_into_buffer(Deadline::Now)?;
        if self.is_ready() {
            Ok((true, Some(Duration::ZERO)))
        } else {
            Ok((false, None))
        }
    }

    /// Block on the native pump up to `deadline`, buffering at most one
    /// real native event. Synthetic wakes are swallowed: their only job
    /// is to end the wait.
    pub fn wait_native(&mut self, deadline: Deadline) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }
        self.fetch_into_buffer(deadline)
    }

    fn fetch_into_buffer(&mut self, deadline: Deadline) -> Result<()> {
        // After a wake is swallowed only a non-blocking re-check runs,
        // so a wake ends an indefinite wait instead of restarting it.
        let mut next = deadline;
        loop {
            match self.pump.fetch_event(next)? {
                Some(NativeEvent::Wake) => {
                    trace!("synthetic wake consumed");
                    next = Deadline::Now;
                }
                Some(native) => {
                    self.buffered = Some(native);
                    return Ok(());
                }
                None => return Ok(()),
            }
        }
    }

    /// Drain what became ready since the last call: translate any
    /// buffered native event into portable form, enqueue it, then pop
    /// and deliver one event to the registered callback. Events whose
    /// target window is gone are dropped silently. Always returns true;
    /// this source is never auto-removed.
    pub fn dispatch(&mut self, windows: &WindowArena, last_event_time: &mut Timestamp) -> bool {
        if let Some(native) = self.buffered.take() {
            if let Some(event) = translate(native) {
                self.enqueue(event);
            }
        }

        while let Some(event) = self.queue.pop() {
            if !windows.contains(event.window()) {
                debug!("dropping event for stale window {:?}", event.window());
                continue;
            }
            let time = event.time();
            if time != 0 {
                *last_event_time = time;
            }
            if let Some(callback) = self.callback.as_mut() {
                callback(&event);
            }
            break;
        }
        true
    }

    /// Filter, coalesce, and enqueue one translated event, synthesizing
    /// a double click when the press thresholds are met.
    fn enqueue(&mut self, event: Event) {
        if self.filter_event(&event) == FilterStatus::Remove {
            self.filtered_out += 1;
            debug!("event filtered out: {:?}", event.kind());
            return;
        }

        let double = if let Event::ButtonPress {
            window,
            button,
            time,
            x,
            y,
            root_x,
            root_y,
            state,
        } = &event
        {
            self.clicks
                .observe(
                    *window,
                    *button,
                    *time,
                    *root_x,
                    *root_y,
                    self.double_click_time,
                    self.double_click_distance,
                )
                .then_some(Event::DoubleClick {
                    window: *window,
                    time: *time,
                    x: *x,
                    y: *y,
                    root_x: *root_x,
                    root_y: *root_y,
                    state: *state,
                    button: *button,
                })
        } else {
            None
        };

        if self.compress_motion {
            self.queue.push_coalesced(event);
        } else {
            self.queue.push(event);
        }
        if let Some(double) = double {
            self.queue.push(double);
        }
    }

    fn filter_event(&self, event: &Event) -> FilterStatus {
        for rule in &self.filters {
            if let Some(window) = rule.window {
                if window != event.window() {
                    continue;
                }
            }
            if let Some(kind) = rule.kind {
                if kind != event.kind() {
                    continue;
                }
            }
            return rule.action;
        }
        FilterStatus::Pass
    }

    /// Number of queued events awaiting dispatch.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

/// Translate one raw native event into portable form. Returns None for
/// events with no portable counterpart (synthetic wakes).
pub fn translate(native: NativeEvent) -> Option<Event> {
    match native {
        NativeEvent::Button {
            window,
            time,
            x,
            y,
            root_x,
            root_y,
            state_bits,
            button,
            pressed,
        } => {
            let state = Modifiers::from_bits_truncate(state_bits);
            Some(if pressed {
                Event::ButtonPress {
                    window,
                    time,
                    x,
                    y,
                    root_x,
                    root_y,
                    state,
                    button,
                }
            } else {
                Event::ButtonRelease {
                    window,
                    time,
                    x,
                    y,
                    root_x,
                    root_y,
                    state,
                    button,
                }
            })
        }
        NativeEvent::Motion {
            window,
            time,
            x,
            y,
            root_x,
            root_y,
            state_bits,
        } => Some(Event::Motion {
            window,
            time,
            x,
            y,
            root_x,
            root_y,
            state: Modifiers::from_bits_truncate(state_bits),
        }),
        NativeEvent::Key {
            window,
            time,
            keycode,
            state_bits,
            pressed,
        } => {
            let state = Modifiers::from_bits_truncate(state_bits);
            Some(if pressed {
                Event::KeyPress {
                    window,
                    time,
                    keycode,
                    state,
                }
            } else {
                Event::KeyRelease {
                    window,
                    time,
                    keycode,
                    state,
                }
            })
        }
        NativeEvent::Crossing {
            window,
            time,
            x,
            y,
            entered,
        } => Some(if entered {
            Event::Enter { window, time, x, y }
        } else {
            Event::Leave { window, time, x, y }
        }),
        NativeEvent::Focus {
            window,
            time,
            gained,
        } => Some(if gained {
            Event::FocusIn { window, time }
        } else {
            Event::FocusOut { window, time }
        }),
        NativeEvent::Expose {
            window,
            x,
            y,
            width,
            height,
            remaining,
        } => Some(Event::Expose {
            window,
            region: Rect::new(x, y, width, height),
            remaining,
        }),
        NativeEvent::Configure {
            window,
            x,
            y,
            width,
            height,
        } => Some(Event::Configure {
            window,
            geometry: Rect::new(x, y, width, height),
        }),
        NativeEvent::Drag {
            window,
            time,
            phase,
            x,
            y,
        } => Some(Event::Drag {
            window,
            time,
            phase,
            x,
            y,
        }),
        NativeEvent::CloseRequest { window, time } => {
            Some(Event::CloseRequested { window, time })
        }
        NativeEvent::ClientMessage { window, tag, data } => {
            Some(Event::Custom { window, tag, data })
        }
        NativeEvent::Wake => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InputConfig;
    use crate::pump::{ChannelInjector, ChannelPump};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn source_with_pump(input: &InputConfig) -> (DispatchSource, ChannelInjector) {
        let pump = ChannelPump::new();
        let injector = pump.injector();
        (DispatchSource::new(Box::new(pump), input), injector)
    }

    fn collect(source: &mut DispatchSource) -> Rc<RefCell<Vec<Event>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        source.set_callback(Box::new(move |event| {
            sink.borrow_mut().push(event.clone());
        }));
        seen
    }

    fn native_button(window: WindowId, time: u32, x: i32, y: i32, pressed: bool) -> NativeEvent {
        NativeEvent::Button {
            window,
            time,
            x,
            y,
            root_x: x + 100,
            root_y: y + 200,
            state_bits: 0,
            button: 1,
            pressed,
        }
    }

    #[test]
    fn test_dispatch_delivers_in_fifo_order() {
        let mut arena = WindowArena::new();
        let win = arena.insert(crate::window::WindowInfo::default());
        let (mut source, injector) = source_with_pump(&InputConfig::default());
        let seen = collect(&mut source);
        let mut last_time = 0;

        // The concrete press/motion/release scenario.
        injector.send(native_button(win, 1000, 10, 20, true)).unwrap();
        injector
            .send(NativeEvent::Motion {
                window: win,
                time: 1001,
                x: 12,
                y: 21,
                root_x: 112,
                root_y: 221,
                state_bits: Modifiers::BUTTON1.bits(),
            })
            .unwrap();
        injector.send(native_button(win, 1002, 12, 21, false)).unwrap();

        for _ in 0..3 {
            let (ready, _) = source.prepare().unwrap();
            assert!(ready);
            assert!(source.dispatch(&arena, &mut last_time));
        }

        let seen = seen.borrow();
        assert_eq!(seen.len(), 3);
        match &seen[0] {
            Event::ButtonPress { x, y, button, .. } => {
                assert_eq!((*x, *y, *button), (10, 20, 1));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(&seen[1], Event::Motion { x: 12, y: 21, .. }));
        assert!(matches!(
            &seen[2],
            Event::ButtonRelease { x: 12, y: 21, button: 1, .. }
        ));
        assert_eq!(last_time, 1002);
    }

    #[test]
    fn test_stale_window_events_are_dropped() {
        let mut arena = WindowArena::new();
        let win = arena.insert(crate::window::WindowInfo::default());
        let (mut source, injector) = source_with_pump(&InputConfig::default());
        let seen = collect(&mut source);
        let mut last_time = 0;

        injector.send(native_button(win, 1, 0, 0, true)).unwrap();
        arena.remove(win);

        let (ready, _) = source.prepare().unwrap();
        assert!(ready);
        assert!(source.dispatch(&arena, &mut last_time));
        assert!(seen.borrow().is_empty());
        assert_eq!(last_time, 0);
    }

    #[test]
    fn test_filter_removes_matching_events() {
        let mut arena = WindowArena::new();
        let win = arena.insert(crate::window::WindowInfo::default());
        let (mut source, injector) = source_with_pump(&InputConfig::default());
        let seen = collect(&mut source);
        let mut last_time = 0;

        source.add_filter(FilterRule {
            window: Some(win),
            kind: Some(EventKind::KeyPress),
            action: FilterStatus::Remove,
        });

        injector
            .send(NativeEvent::Key {
                window: win,
                time: 5,
                keycode: 38,
                state_bits: 0,
                pressed: true,
            })
            .unwrap();
        injector
            .send(NativeEvent::Key {
                window: win,
                time: 6,
                keycode: 38,
                state_bits: 0,
                pressed: false,
            })
            .unwrap();

        for _ in 0..2 {
            source.prepare().unwrap();
            source.dispatch(&arena, &mut last_time);
        }

        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert!(matches!(&seen[0], Event::KeyRelease { .. }));
        assert_eq!(source.filtered_count(), 1);
    }

    #[test]
    fn test_double_click_synthesis() {
        let mut arena = WindowArena::new();
        let win = arena.insert(crate::window::WindowInfo::default());
        let (mut source, injector) = source_with_pump(&InputConfig::default());
        let seen = collect(&mut source);
        let mut last_time = 0;

        injector.send(native_button(win, 1000, 5, 5, true)).unwrap();
        injector.send(native_button(win, 1010, 5, 5, false)).unwrap();
        injector.send(native_button(win, 1200, 6, 6, true)).unwrap();

        // Three native events; the second press also enqueues the
        // synthesized double click.
        for _ in 0..4 {
            source.prepare().unwrap();
            source.dispatch(&arena, &mut last_time);
        }

        let seen = seen.borrow();
        assert_eq!(seen.len(), 4);
        assert!(matches!(&seen[2], Event::ButtonPress { time: 1200, .. }));
        assert!(matches!(
            &seen[3],
            Event::DoubleClick { time: 1200, button: 1, .. }
        ));
    }

    #[test]
    fn test_double_click_respects_thresholds() {
        let mut arena = WindowArena::new();
        let win = arena.insert(crate::window::WindowInfo::default());
        let (mut source, injector) = source_with_pump(&InputConfig::default());
        let seen = collect(&mut source);
        let mut last_time = 0;

        // Too late for the 400ms default.
        injector.send(native_button(win, 1000, 5, 5, true)).unwrap();
        injector.send(native_button(win, 1500, 5, 5, true)).unwrap();

        for _ in 0..2 {
            source.prepare().unwrap();
            source.dispatch(&arena, &mut last_time);
        }
        assert_eq!(seen.borrow().len(), 2);
        assert!(seen
            .borrow()
            .iter()
            .all(|e| e.kind() == EventKind::ButtonPress));
    }

    #[test]
    fn test_prepare_reports_pending_work() {
        let mut arena = WindowArena::new();
        let win = arena.insert(crate::window::WindowInfo::default());
        let (mut source, injector) = source_with_pump(&InputConfig::default());
        let _seen = collect(&mut source);
        let mut last_time = 0;

        let (ready, timeout) = source.prepare().unwrap();
        assert!(!ready);
        assert_eq!(timeout, None);
        assert!(!source.is_ready());

        injector.send(native_button(win, 1, 0, 0, true)).unwrap();
        let (ready, timeout) = source.prepare().unwrap();
        assert!(ready);
        assert_eq!(timeout, Some(Duration::ZERO));
        assert!(source.is_ready());

        source.dispatch(&arena, &mut last_time);
        assert!(!source.is_ready());
    }

    #[test]
    fn test_wake_is_swallowed() {
        let mut arena = WindowArena::new();
        let _win = arena.insert(crate::window::WindowInfo::default());
        let (mut source, injector) = source_with_pump(&InputConfig::default());
        let seen = collect(&mut source);
        let mut last_time = 0;

        injector.send(NativeEvent::Wake).unwrap();
        source.wait_native(Deadline::Indefinite).unwrap();
        assert!(!source.is_ready());
        source.dispatch(&arena, &mut last_time);
        assert!(seen.borrow().is_empty());
    }
}
