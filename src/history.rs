//! Tag activation history
//!
//! Registered tags have bounded operational lifetimes. The history is the
//! time-ordered sequence of activation and deactivation events derived
//! from those lifetimes; the driver drains it as the data timestamp
//! advances and applies each event to the matching graph of the tag's
//! nominal frequency. Events are drained monotonically, so a flat sorted
//! vector walked by a cursor is all the structure needed.

use serde::{Deserialize, Serialize};

use crate::tag::TagDatabase;
use crate::types::{TagId, Timestamp};

/// Activation state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    Activate,
    Deactivate,
}

/// One scheduled activation change for one tag.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub ts: Timestamp,
    pub tag_id: TagId,
    pub kind: EventKind,
}

impl Event {
    fn key(&self) -> (Timestamp, TagId, EventKind) {
        (self.ts, self.tag_id, self.kind)
    }
}

/// Sorted activation events with a draining cursor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct History {
    events: Vec<Event>,
    cursor: usize,
}

impl History {
    /// Build the history from tag lifetimes. Ties order by tag id, with
    /// activations ahead of deactivations so a zero-length lifetime still
    /// nets out to inactive.
    pub fn from_database(db: &TagDatabase) -> Self {
        let mut events = Vec::with_capacity(db.len() * 2);
        for tag in db.iter() {
            events.push(Event {
                ts: tag.active_from,
                tag_id: tag.id,
                kind: EventKind::Activate,
            });
            events.push(Event {
                ts: tag.active_until,
                tag_id: tag.id,
                kind: EventKind::Deactivate,
            });
        }
        events.sort_by(|a, b| a.key().partial_cmp(&b.key()).unwrap());
        Self { events, cursor: 0 }
    }

    /// Events with `ts <= up_to` not yet drained, in order.
    pub fn drain_until(&mut self, up_to: Timestamp) -> &[Event] {
        let start = self.cursor;
        while self.cursor < self.events.len() && self.events[self.cursor].ts <= up_to {
            self.cursor += 1;
        }
        &self.events[start..self.cursor]
    }

    /// Events not yet drained.
    pub fn remaining(&self) -> usize {
        self.events.len() - self.cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::Tag;

    fn tag(id: TagId, from: Timestamp, until: Timestamp) -> Tag {
        Tag {
            id,
            nominal_khz: 166_380,
            gaps: vec![3.0, 5.0],
            period: 20.0,
            active_from: from,
            active_until: until,
        }
    }

    #[test]
    fn test_events_sorted_with_tag_id_ties() {
        let db = TagDatabase::new(vec![
            tag(2, 100.0, 300.0),
            tag(1, 100.0, 200.0),
        ])
        .unwrap();
        let mut h = History::from_database(&db);
        let drained: Vec<_> = h.drain_until(100.0).to_vec();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].tag_id, 1);
        assert_eq!(drained[1].tag_id, 2);
        assert!(drained.iter().all(|e| e.kind == EventKind::Activate));
    }

    #[test]
    fn test_cursor_drains_monotonically() {
        let db = TagDatabase::new(vec![tag(1, 100.0, 200.0), tag(2, 150.0, 250.0)]).unwrap();
        let mut h = History::from_database(&db);
        assert_eq!(h.drain_until(99.0).len(), 0);
        assert_eq!(h.drain_until(149.0).len(), 1);
        assert_eq!(h.drain_until(149.0).len(), 0, "already drained");
        assert_eq!(h.drain_until(1e9).len(), 3);
        assert_eq!(h.remaining(), 0);
    }

    #[test]
    fn test_zero_length_lifetime_orders_activate_first() {
        let db = TagDatabase::new(vec![tag(1, 100.0, 100.0)]).unwrap();
        let mut h = History::from_database(&db);
        let drained = h.drain_until(100.0);
        assert_eq!(drained[0].kind, EventKind::Activate);
        assert_eq!(drained[1].kind, EventKind::Deactivate);
    }
}
