//! Event Queue
//!
//! Process-wide FIFO of portable events. Insertion order is delivery
//! order. The queue itself provides no locking; only the loop thread
//! that owns the context touches it.

use std::collections::VecDeque;

use crate::event::Event;

/// Ordered queue of translated events awaiting dispatch.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            events: VecDeque::new(),
        }
    }

    /// Append an event to the tail.
    pub fn push(&mut self, event: Event) {
        self.events.push_back(event);
    }

    /// Append a motion event, replacing a pending tail motion for the
    /// same window instead of accumulating. Non-motion events always
    /// append. Returns true if an existing event was replaced.
    pub fn push_coalesced(&mut self, event: Event) -> bool {
        if let Event::Motion { window, .. } = event {
            if let Some(tail) = self.events.back_mut() {
                if matches!(tail, Event::Motion { .. }) && tail.window() == window {
                    *tail = event;
                    return true;
                }
            }
        }
        self.events.push_back(event);
        false
    }

    /// Head of the queue without removing it.
    pub fn peek_first(&self) -> Option<&Event> {
        self.events.front()
    }

    /// Remove and return the head.
    pub fn pop(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Whether a dequeue would succeed without blocking.
    pub fn has_pending(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
