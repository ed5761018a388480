//! Restores frame order between the recognition pool and the merger.

use std::collections::{BTreeMap, HashSet, VecDeque};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReorderError {
    #[error("frame {0} is not part of this run")]
    Unexpected(u64),
    #[error("frame {0} was delivered twice")]
    Duplicate(u64),
    #[error("frame {frame} is more than {capacity} frame(s) ahead of the next expected one")]
    BeyondWindow { frame: u64, capacity: usize },
}

/// Holds out-of-order items until every earlier frame has arrived.
///
/// Built from the exact, ascending list of frame indices the run will
/// produce; [`insert`](ReorderBuffer::insert) returns whatever became
/// releasable, already in order. Only the `capacity` frames starting at
/// [`next_expected`](ReorderBuffer::next_expected) are accepted, so the
/// buffer never holds more than `capacity` items.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    capacity: usize,
    released: usize,
    expected: VecDeque<u64>,
    known: HashSet<u64>,
    outstanding: HashSet<u64>,
    pending: BTreeMap<u64, T>,
    high_water: usize,
}

impl<T> ReorderBuffer<T> {
    pub fn new(expected: impl IntoIterator<Item = u64>, capacity: usize) -> Self {
        let expected: VecDeque<u64> = expected.into_iter().collect();
        let known: HashSet<u64> = expected.iter().copied().collect();
        Self {
            capacity: capacity.max(1),
            released: 0,
            expected,
            outstanding: known.clone(),
            known,
            pending: BTreeMap::new(),
            high_water: 0,
        }
    }

    pub fn insert(&mut self, frame_index: u64, item: T) -> Result<Vec<(u64, T)>, ReorderError> {
        if !self.outstanding.contains(&frame_index) {
            return Err(if self.known.contains(&frame_index) {
                ReorderError::Duplicate(frame_index)
            } else {
                ReorderError::Unexpected(frame_index)
            });
        }
        let offset = self.expected.partition_point(|&index| index < frame_index);
        if offset >= self.capacity {
            return Err(ReorderError::BeyondWindow {
                frame: frame_index,
                capacity: self.capacity,
            });
        }
        self.outstanding.remove(&frame_index);
        self.pending.insert(frame_index, item);
        self.high_water = self.high_water.max(self.pending.len());

        let mut ready = Vec::new();
        while let Some(&next) = self.expected.front() {
            let Some(item) = self.pending.remove(&next) else {
                break;
            };
            self.expected.pop_front();
            ready.push((next, item));
        }
        self.released += ready.len();
        Ok(ready)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames handed out so far.
    pub fn released(&self) -> usize {
        self.released
    }

    pub fn next_expected(&self) -> Option<u64> {
        self.expected.front().copied()
    }

    /// Items waiting for an earlier frame.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Largest number of items ever held at once.
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn is_complete(&self) -> bool {
        self.expected.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn releases_in_expected_order() {
        let mut buffer = ReorderBuffer::new([0, 2, 4, 6], 4);
        assert!(buffer.insert(4, "c").unwrap().is_empty());
        assert!(buffer.insert(2, "b").unwrap().is_empty());
        assert_eq!(buffer.buffered(), 2);
        assert_eq!(
            buffer.insert(0, "a").unwrap(),
            vec![(0, "a"), (2, "b"), (4, "c")]
        );
        assert_eq!(buffer.next_expected(), Some(6));
        assert_eq!(buffer.insert(6, "d").unwrap(), vec![(6, "d")]);
        assert!(buffer.is_complete());
        assert_eq!(buffer.high_water(), 3);
    }

    #[test]
    fn rejects_unknown_and_repeated_frames() {
        let mut buffer = ReorderBuffer::new([10, 11, 12], 8);
        assert_eq!(buffer.insert(3, ()), Err(ReorderError::Unexpected(3)));
        buffer.insert(10, ()).unwrap();
        assert_eq!(buffer.insert(10, ()), Err(ReorderError::Duplicate(10)));
        buffer.insert(12, ()).unwrap();
        assert_eq!(buffer.insert(12, ()), Err(ReorderError::Duplicate(12)));
    }

    #[test]
    fn window_limits_what_can_be_held() {
        let mut buffer = ReorderBuffer::new(0..10, 3);
        assert!(buffer.insert(2, 'c').unwrap().is_empty());
        assert_eq!(
            buffer.insert(3, 'd'),
            Err(ReorderError::BeyondWindow { frame: 3, capacity: 3 })
        );
        assert!(buffer.insert(1, 'b').unwrap().is_empty());
        assert_eq!(buffer.released(), 0);

        assert_eq!(buffer.insert(0, 'a').unwrap().len(), 3);
        assert_eq!(buffer.released(), 3);
        assert_eq!(
            buffer.insert(6, 'g'),
            Err(ReorderError::BeyondWindow { frame: 6, capacity: 3 })
        );
        assert!(buffer.insert(5, 'f').unwrap().is_empty());
        assert!(buffer.high_water() <= buffer.capacity());
        assert_eq!(buffer.insert(3, 'd').unwrap().len(), 1);
        assert_eq!(buffer.next_expected(), Some(4));
    }
}
