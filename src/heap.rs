//! The global ordering heap.
//!
//! Each stream with pending data has one entry keyed by the ordinal timestamp
//! of its next event. Popping always yields the globally smallest ordinal, so
//! driving the popped stream first keeps the merged event sequence
//! non-decreasing in timestamp.

use std::{cmp::Reverse, collections::BinaryHeap};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct HeapEntry {
    pub ordinal: u64,
    pub queue_nr: u32,
}

pub struct OrderingHeap {
    heap: BinaryHeap<Reverse<HeapEntry>>,
}

impl OrderingHeap {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    pub fn push(&mut self, queue_nr: u32, ordinal: u64) {
        self.heap.push(Reverse(HeapEntry { ordinal, queue_nr }));
    }

    /// Remove and return the entry with the smallest ordinal.
    pub fn pop(&mut self) -> Option<HeapEntry> {
        self.heap.pop().map(|Reverse(e)| e)
    }

    /// The smallest ordinal currently on the heap.
    pub fn min_ordinal(&self) -> Option<u64> {
        self.heap.peek().map(|Reverse(e)| e.ordinal)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::OrderingHeap;

    #[test]
    fn pops_smallest_ordinal_first() {
        let mut h = OrderingHeap::new();
        h.push(0, 30);
        h.push(1, 20);
        h.push(2, 50);
        h.push(3, 10);
        h.push(4, 40);

        let mut out = Vec::new();
        while let Some(e) = h.pop() {
            out.push((e.ordinal, e.queue_nr));
        }
        assert_eq!(out, vec![(10, 3), (20, 1), (30, 0), (40, 4), (50, 2)]);
    }

    #[test]
    fn min_ordinal_tracks_the_top() {
        let mut h = OrderingHeap::new();
        assert_eq!(h.min_ordinal(), None);
        h.push(0, 7);
        h.push(1, 3);
        assert_eq!(h.min_ordinal(), Some(3));
        h.pop();
        assert_eq!(h.min_ordinal(), Some(7));
    }

    #[test]
    fn equal_ordinals_are_all_delivered() {
        let mut h = OrderingHeap::new();
        h.push(0, 5);
        h.push(1, 5);
        assert!(h.pop().is_some());
        assert!(h.pop().is_some());
        assert!(h.is_empty());
    }
}
