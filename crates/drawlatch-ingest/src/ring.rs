//! Bounded FIFO event storage with overwrite-on-push eviction.

use drawlatch_proto::IngestedEventRecord;

pub const MIN_CAPACITY: usize = 1;
pub const MAX_CAPACITY: usize = 1_000;

/// Fixed-capacity circular buffer over ingested events. The oldest element is
/// overwritten in place once the buffer is full; iteration yields items
/// oldest-first. Clearing drops elements but never touches the ID counter
/// held by the owning ingestor.
#[derive(Debug)]
pub struct RingBuffer {
    slots: Vec<Option<IngestedEventRecord>>,
    /// Next write position.
    head: usize,
    len: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(MIN_CAPACITY, MAX_CAPACITY);
        Self {
            slots: vec![None; capacity],
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, event: IngestedEventRecord) {
        let capacity = self.slots.len();
        self.slots[self.head] = Some(event);
        self.head = (self.head + 1) % capacity;
        self.len = (self.len + 1).min(capacity);
    }

    /// Buffered events in chronological order.
    pub fn to_vec(&self) -> Vec<IngestedEventRecord> {
        let capacity = self.slots.len();
        let start = (self.head + capacity - self.len) % capacity;
        (0..self.len)
            .filter_map(|offset| self.slots[(start + offset) % capacity].clone())
            .collect()
    }

    /// Events with `id > after_id`, ascending. O(n) over stored elements.
    pub fn since(&self, after_id: i64) -> Vec<IngestedEventRecord> {
        self.to_vec()
            .into_iter()
            .filter(|event| (event.id as i64) > after_id)
            .collect()
    }

    /// Drops all buffered elements.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.head = 0;
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: u64) -> IngestedEventRecord {
        IngestedEventRecord {
            id,
            received_at: format!("2026-01-01T00:00:{:02}.000Z", id % 60),
            source: "test".to_string(),
            event_type: "tick".to_string(),
            data: serde_json::json!({ "n": id }),
        }
    }

    fn ids(events: &[IngestedEventRecord]) -> Vec<u64> {
        events.iter().map(|event| event.id).collect()
    }

    #[test]
    fn unit_push_below_capacity_keeps_everything_in_order() {
        let mut ring = RingBuffer::new(4);
        for id in 0..3 {
            ring.push(event(id));
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ids(&ring.to_vec()), vec![0, 1, 2]);
    }

    #[test]
    fn functional_eviction_keeps_the_newest_capacity_items() {
        let mut ring = RingBuffer::new(3);
        for id in 0..7 {
            ring.push(event(id));
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ids(&ring.to_vec()), vec![4, 5, 6]);
    }

    #[test]
    fn unit_since_filters_strictly_greater_ids_in_order() {
        let mut ring = RingBuffer::new(5);
        for id in 0..5 {
            ring.push(event(id));
        }
        assert_eq!(ids(&ring.since(2)), vec![3, 4]);
        assert_eq!(ids(&ring.since(-1)), vec![0, 1, 2, 3, 4]);
        assert!(ring.since(4).is_empty());
        assert!(ring.since(99).is_empty());
    }

    #[test]
    fn unit_since_respects_eviction_window() {
        let mut ring = RingBuffer::new(2);
        for id in 0..5 {
            ring.push(event(id));
        }
        // Only ids 3 and 4 remain; the cursor may point below the window.
        assert_eq!(ids(&ring.since(0)), vec![3, 4]);
    }

    #[test]
    fn unit_clear_empties_the_buffer() {
        let mut ring = RingBuffer::new(3);
        ring.push(event(0));
        ring.push(event(1));
        ring.clear();
        assert!(ring.is_empty());
        assert!(ring.to_vec().is_empty());
        ring.push(event(2));
        assert_eq!(ids(&ring.to_vec()), vec![2]);
    }

    #[test]
    fn regression_capacity_is_clamped_to_supported_range() {
        assert_eq!(RingBuffer::new(0).capacity(), MIN_CAPACITY);
        assert_eq!(RingBuffer::new(5_000).capacity(), MAX_CAPACITY);
    }
}
