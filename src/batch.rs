//! Size-bounded batch packing
//!
//! Events arrive here already encoded to their wire JSON. A [`BatchBuilder`]
//! accepts them in queue order while the request body stays under the
//! ceiling, so packing is one pass that stops at the first event that does
//! not fit. Events that could never fit on their own are detected with
//! [`fits_alone`] and must be evicted by the caller instead of packed.

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

const ENVELOPE_OPEN: &[u8] = br#"{"events":["#;
const ENVELOPE_CLOSE: &[u8] = b"]}";

/// Bytes taken by `{"events":[]}` around the event list
pub const ENVELOPE_OVERHEAD: usize = ENVELOPE_OPEN.len() + ENVELOPE_CLOSE.len();

/// Event rendered to its wire JSON
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedEvent {
    pub id: Uuid,
    pub event_name: String,
    pub json: String,
}

impl EncodedEvent {
    pub fn size(&self) -> usize {
        self.json.len()
    }
}

/// Whether a single event of `size` bytes can be sent in a request of at most
/// `ceiling` bytes
pub fn fits_alone(size: usize, ceiling: usize) -> bool {
    ENVELOPE_OVERHEAD + size <= ceiling
}

/// One request worth of events
#[derive(Debug, Clone)]
pub struct Batch {
    /// Ids in send order
    pub ids: Vec<Uuid>,
    /// Complete `{"events":[...]}` request body
    pub body: Bytes,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Greedy packer for a single request
#[derive(Debug)]
pub struct BatchBuilder {
    ceiling: usize,
    size: usize,
    events: Vec<EncodedEvent>,
}

impl BatchBuilder {
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            size: ENVELOPE_OVERHEAD,
            events: Vec::new(),
        }
    }

    fn cost(&self, event: &EncodedEvent) -> usize {
        // Comma separator for every event after the first
        event.size() + usize::from(!self.events.is_empty())
    }

    pub fn has_room_for(&self, event: &EncodedEvent) -> bool {
        self.size + self.cost(event) <= self.ceiling
    }

    /// Append `event`; returns it back when the body would exceed the ceiling
    pub fn try_push(&mut self, event: EncodedEvent) -> Option<EncodedEvent> {
        if !self.has_room_for(&event) {
            return Some(event);
        }
        self.size += self.cost(&event);
        self.events.push(event);
        None
    }

    /// Body size so far, envelope included
    pub fn body_size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Finished batch, `None` if nothing was packed
    pub fn finish(self) -> Option<Batch> {
        if self.events.is_empty() {
            return None;
        }

        let mut body = BytesMut::with_capacity(self.size);
        body.put_slice(ENVELOPE_OPEN);
        for (i, event) in self.events.iter().enumerate() {
            if i > 0 {
                body.put_u8(b',');
            }
            body.put_slice(event.json.as_bytes());
        }
        body.put_slice(ENVELOPE_CLOSE);

        Some(Batch {
            ids: self.events.into_iter().map(|e| e.id).collect(),
            body: body.freeze(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encoded(name: &str, payload_len: usize) -> EncodedEvent {
        let json = format!(r#"{{"event_name":"{}","p":"{}"}}"#, name, "x".repeat(payload_len));
        EncodedEvent {
            id: Uuid::new_v4(),
            event_name: name.to_string(),
            json,
        }
    }

    /// Pack `events` front to back the way the tracker drains its queue
    fn pack_all(events: &[EncodedEvent], ceiling: usize) -> Vec<Batch> {
        let mut batches = Vec::new();
        let mut pending = events
            .iter()
            .filter(|e| fits_alone(e.size(), ceiling))
            .cloned()
            .peekable();

        while pending.peek().is_some() {
            let mut builder = BatchBuilder::new(ceiling);
            while let Some(event) = pending.next_if(|e| builder.has_room_for(e)) {
                assert!(builder.try_push(event).is_none());
            }
            batches.extend(builder.finish());
        }
        batches
    }

    #[test]
    fn test_envelope_overhead_matches_empty_body() {
        assert_eq!(ENVELOPE_OVERHEAD, r#"{"events":[]}"#.len());
        assert!(BatchBuilder::new(100).finish().is_none());
    }

    #[test]
    fn test_body_is_valid_json_in_order() {
        let mut builder = BatchBuilder::new(10_000);
        for name in ["a", "b", "c"] {
            assert!(builder.try_push(encoded(name, 2)).is_none());
        }
        let expected_size = builder.body_size();
        let batch = builder.finish().unwrap();
        assert_eq!(batch.body.len(), expected_size);

        let parsed: serde_json::Value = serde_json::from_slice(&batch.body).unwrap();
        let names: Vec<_> = parsed["events"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["event_name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_exact_fit_is_accepted() {
        let event = encoded("a", 10);
        let ceiling = ENVELOPE_OVERHEAD + event.size();

        assert!(fits_alone(event.size(), ceiling));
        assert!(!fits_alone(event.size(), ceiling - 1));

        let mut builder = BatchBuilder::new(ceiling);
        assert!(builder.try_push(event).is_none());
        assert_eq!(builder.finish().unwrap().body.len(), ceiling);
    }

    #[test]
    fn test_rejects_event_that_would_overflow() {
        let events = [encoded("a", 100), encoded("b", 100), encoded("c", 100)];
        // Room for two events plus one separator
        let ceiling = ENVELOPE_OVERHEAD + events[0].size() * 2 + 1;

        let mut builder = BatchBuilder::new(ceiling);
        assert!(builder.try_push(events[0].clone()).is_none());
        assert!(builder.try_push(events[1].clone()).is_none());
        let rejected = builder.try_push(events[2].clone()).unwrap();

        assert_eq!(rejected.id, events[2].id);
        assert_eq!(builder.len(), 2);
        assert_eq!(builder.body_size(), ceiling);
    }

    #[test]
    fn test_separator_is_counted() {
        let events = [encoded("a", 100), encoded("b", 100)];
        let ceiling = ENVELOPE_OVERHEAD + events[0].size() * 2;

        let mut builder = BatchBuilder::new(ceiling);
        assert!(builder.try_push(events[0].clone()).is_none());
        assert!(!builder.has_room_for(&events[1]));
    }

    #[test]
    fn test_oversized_events_are_skipped_not_blocking() {
        let events = vec![encoded("a", 10), encoded("huge", 1_000), encoded("b", 10)];
        let batches = pack_all(&events, 200);

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].ids, vec![events[0].id, events[2].id]);
    }

    proptest! {
        #[test]
        fn prop_batches_cover_queue_exactly_once(
            sizes in prop::collection::vec(0usize..400, 1..60),
            ceiling in 120usize..2_000,
        ) {
            let events: Vec<_> = sizes
                .iter()
                .enumerate()
                .map(|(i, len)| encoded(&format!("e{}", i), *len))
                .collect();
            let expected: Vec<Uuid> = events
                .iter()
                .filter(|e| fits_alone(e.size(), ceiling))
                .map(|e| e.id)
                .collect();

            let batches = pack_all(&events, ceiling);
            for batch in &batches {
                prop_assert!(!batch.is_empty());
                prop_assert!(batch.body.len() <= ceiling);
                prop_assert!(serde_json::from_slice::<serde_json::Value>(&batch.body).is_ok());
            }

            let sent: Vec<Uuid> = batches.into_iter().flat_map(|b| b.ids).collect();
            prop_assert_eq!(sent, expected);
        }

        #[test]
        fn prop_batches_are_maximal(
            sizes in prop::collection::vec(0usize..200, 1..40),
            ceiling in 100usize..1_500,
        ) {
            let events: Vec<_> = sizes
                .iter()
                .map(|len| encoded("e", *len))
                .filter(|e| fits_alone(e.size(), ceiling))
                .collect();
            let batches = pack_all(&events, ceiling);

            // Each batch was closed only because the next event did not fit
            let mut offset = 0;
            for batch in &batches {
                offset += batch.len();
                if let Some(next) = events.get(offset) {
                    prop_assert!(batch.body.len() + 1 + next.size() > ceiling);
                }
            }
        }
    }
}
