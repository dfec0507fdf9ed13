//! Per-connection event buffering.
//!
//! The main process polls the runtime and replays relevant events into
//! one bounded queue per overlay connection. On overflow the oldest
//! non-critical event is dropped; session-state and loss events are
//! preserved. Dropped events surface to the overlay as one
//! events-lost record.

use std::collections::VecDeque;

use crate::api::EventData;

#[derive(Debug)]
pub struct EventQueue {
    queue: VecDeque<EventData>,
    max: usize,
    lost: u32,
}

impl EventQueue {
    pub fn new(max: usize) -> Self {
        EventQueue {
            queue: VecDeque::new(),
            max,
            lost: 0,
        }
    }

    pub fn push(&mut self, event: EventData) {
        if self.queue.len() >= self.max {
            // Prefer to evict the oldest non-critical entry.
            if let Some(pos) = self.queue.iter().position(|e| !e.is_critical()) {
                self.queue.remove(pos);
                self.lost += 1;
            } else if !event.is_critical() {
                // Everything buffered outranks the newcomer.
                self.lost += 1;
                return;
            } else {
                // All critical: bounded memory wins, the oldest goes.
                self.queue.pop_front();
                self.lost += 1;
            }
        }
        self.queue.push_back(event);
    }

    pub fn pop(&mut self) -> Option<EventData> {
        if self.lost > 0 {
            let count = self.lost;
            self.lost = 0;
            return Some(EventData::EventsLost { count });
        }
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.lost == 0
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.lost = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{SessionState};
    use crate::types::SessionHandle;

    fn state_event(n: i64) -> EventData {
        EventData::SessionStateChanged {
            session: SessionHandle::from_raw(1),
            state: SessionState::Visible,
            time: n,
        }
    }

    fn boring_event(n: u32) -> EventData {
        EventData::EventsLost { count: n }
    }

    #[test]
    fn overflow_drops_oldest_non_critical_first() {
        let mut q = EventQueue::new(3);
        q.push(boring_event(1));
        q.push(state_event(2));
        q.push(boring_event(3));
        q.push(state_event(4));

        // First pop reports the loss, then the three survivors, with
        // both critical events intact.
        assert_eq!(q.pop(), Some(EventData::EventsLost { count: 1 }));
        assert_eq!(q.pop(), Some(state_event(2)));
        assert_eq!(q.pop(), Some(boring_event(3)));
        assert_eq!(q.pop(), Some(state_event(4)));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn critical_events_survive_a_critical_flood() {
        let mut q = EventQueue::new(2);
        q.push(state_event(1));
        q.push(state_event(2));
        q.push(state_event(3));
        assert_eq!(q.pop(), Some(EventData::EventsLost { count: 1 }));
        assert_eq!(q.pop(), Some(state_event(2)));
        assert_eq!(q.pop(), Some(state_event(3)));
    }

    #[test]
    fn non_critical_newcomer_is_dropped_when_full_of_critical() {
        let mut q = EventQueue::new(2);
        q.push(state_event(1));
        q.push(state_event(2));
        q.push(boring_event(9));
        assert_eq!(q.pop(), Some(EventData::EventsLost { count: 1 }));
        assert_eq!(q.pop(), Some(state_event(1)));
        assert_eq!(q.pop(), Some(state_event(2)));
        assert_eq!(q.pop(), None);
    }
}
