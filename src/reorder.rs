//! Serial-order reassembly for parallel stage groups.
//!
//! When a worker group runs as several threads draining one queue, items
//! complete out of arrival order. Each member tags the items it pops with
//! the queue's pop ordinal, and the group funnels results through a shared
//! `ReorderBuffer` that releases them strictly in ordinal order. A worker
//! that drops an item still inserts a gap marker so the serial stream stays
//! contiguous and later serials are not stuck behind the dropped one.

use std::collections::VecDeque;

/// A buffer that releases items in sequence order.
///
/// Items can be inserted with any sequence number at or beyond the current
/// base; they are released only once every prior sequence number has been
/// released. Backed by a sparse `VecDeque` for O(1) insert and pop.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    /// Sparse window: index `(seq - base_seq)` maps to the pending entry.
    window: VecDeque<Option<T>>,
    /// Sequence number corresponding to `window[0]`.
    base_seq: u64,
    /// Number of entries currently stored.
    count: usize,
}

impl<T> ReorderBuffer<T> {
    /// Create an empty buffer expecting sequence 0 first.
    #[must_use]
    pub fn new() -> Self {
        Self { window: VecDeque::new(), base_seq: 0, count: 0 }
    }

    /// Insert an entry for `seq`.
    ///
    /// # Panics
    ///
    /// Panics in debug mode on a duplicate sequence number or a sequence
    /// number before the released prefix.
    pub fn insert(&mut self, seq: u64, item: T) {
        debug_assert!(seq >= self.base_seq, "sequence {seq} is before base {}", self.base_seq);

        #[allow(clippy::cast_possible_truncation)]
        let index = (seq - self.base_seq) as usize;
        while self.window.len() <= index {
            self.window.push_back(None);
        }
        debug_assert!(self.window[index].is_none(), "duplicate sequence number {seq}");
        self.window[index] = Some(item);
        self.count += 1;
    }

    /// Pop the next in-sequence entry if it has arrived.
    #[must_use]
    pub fn try_pop_next(&mut self) -> Option<T> {
        if self.window.front()?.is_none() {
            return None;
        }
        let item = self.window.pop_front().flatten();
        self.base_seq += 1;
        self.count -= 1;
        item
    }

    /// Drain every consecutive ready entry, stopping at the first gap.
    pub fn drain_ready(&mut self) -> DrainReady<'_, T> {
        DrainReady { buffer: self }
    }

    /// The next sequence number that can be released.
    #[must_use]
    pub fn next_seq(&self) -> u64 {
        self.base_seq
    }

    /// Whether the next in-sequence entry is ready.
    #[must_use]
    pub fn can_pop(&self) -> bool {
        self.window.front().is_some_and(Option::is_some)
    }

    /// Number of entries waiting in the buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether the buffer holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator draining consecutive ready entries from a [`ReorderBuffer`].
pub struct DrainReady<'a, T> {
    buffer: &'a mut ReorderBuffer<T>,
}

impl<T> Iterator for DrainReady<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        self.buffer.try_pop_next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_insertion() {
        let mut buffer = ReorderBuffer::new();
        buffer.insert(0, 100);
        buffer.insert(1, 200);
        buffer.insert(2, 300);

        assert_eq!(buffer.try_pop_next(), Some(100));
        assert_eq!(buffer.try_pop_next(), Some(200));
        assert_eq!(buffer.try_pop_next(), Some(300));
        assert_eq!(buffer.try_pop_next(), None);
    }

    #[test]
    fn test_out_of_order_insertion() {
        let mut buffer = ReorderBuffer::new();
        buffer.insert(2, 300);
        buffer.insert(0, 100);
        buffer.insert(1, 200);

        assert_eq!(buffer.try_pop_next(), Some(100));
        assert_eq!(buffer.try_pop_next(), Some(200));
        assert_eq!(buffer.try_pop_next(), Some(300));
    }

    #[test]
    fn test_gap_blocks_progress() {
        let mut buffer = ReorderBuffer::new();
        buffer.insert(0, 100);
        buffer.insert(2, 300); // gap at 1

        assert_eq!(buffer.try_pop_next(), Some(100));
        assert_eq!(buffer.try_pop_next(), None);
        assert_eq!(buffer.next_seq(), 1);

        buffer.insert(1, 200);
        assert_eq!(buffer.try_pop_next(), Some(200));
        assert_eq!(buffer.try_pop_next(), Some(300));
    }

    #[test]
    fn test_drain_ready_stops_at_gap() {
        let mut buffer = ReorderBuffer::new();
        buffer.insert(0, 10);
        buffer.insert(1, 20);
        buffer.insert(3, 40);

        let ready: Vec<_> = buffer.drain_ready().collect();
        assert_eq!(ready, vec![10, 20]);
        assert_eq!(buffer.len(), 1);

        buffer.insert(2, 30);
        let rest: Vec<_> = buffer.drain_ready().collect();
        assert_eq!(rest, vec![30, 40]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_dropped_item_markers_keep_stream_contiguous() {
        // The stage layer inserts None for items a worker dropped.
        let mut buffer: ReorderBuffer<Option<i32>> = ReorderBuffer::new();
        buffer.insert(1, None);
        buffer.insert(0, Some(10));
        buffer.insert(2, Some(30));

        let released: Vec<_> = buffer.drain_ready().collect();
        assert_eq!(released, vec![Some(10), None, Some(30)]);
    }

    #[test]
    fn test_can_pop_tracking() {
        let mut buffer = ReorderBuffer::new();
        assert!(!buffer.can_pop());

        buffer.insert(1, 20);
        assert!(!buffer.can_pop());

        buffer.insert(0, 10);
        assert!(buffer.can_pop());

        assert_eq!(buffer.try_pop_next(), Some(10));
        assert!(buffer.can_pop());
        assert_eq!(buffer.try_pop_next(), Some(20));
        assert!(!buffer.can_pop());
    }
}
