//! Fence-gated recycling.
//!
//! Command allocators, command lists, upload pages and shader-visible
//! descriptor heaps are all reused the same way: when the GPU may still read
//! an object it is pushed with the fence value of its last submission, and
//! it comes back out only once that value has completed.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A pool shared between the queue (which stamps) and command lists
/// (which acquire).
pub type SharedFencePool<T> = Arc<Mutex<FencePool<T>>>;

/// FIFO of objects waiting for a fence value.
///
/// Objects are pushed in submission order, so fence values never decrease
/// from front to back and only the front needs checking.
#[derive(Debug)]
pub struct FencePool<T> {
    entries: VecDeque<(u64, T)>,
}

impl<T> FencePool<T> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Creates an empty pool wrapped for sharing.
    pub fn shared() -> SharedFencePool<T> {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Queues `item` until `fence` completes.
    pub fn push(&mut self, fence: u64, item: T) {
        debug_assert!(
            self.entries.back().is_none_or(|(last, _)| *last <= fence),
            "fence values must not decrease"
        );
        self.entries.push_back((fence, item));
    }

    /// Takes the oldest item whose fence is at or below `completed`.
    pub fn pop_ready(&mut self, completed: u64) -> Option<T> {
        match self.entries.front() {
            Some((fence, _)) if *fence <= completed => {
                self.entries.pop_front().map(|(_, item)| item)
            }
            _ => None,
        }
    }

    /// Takes every item whose fence is at or below `completed`.
    pub fn drain_ready(&mut self, completed: u64) -> Vec<T> {
        let ready = self
            .entries
            .iter()
            .take_while(|(fence, _)| *fence <= completed)
            .count();
        self.entries.drain(..ready).map(|(_, item)| item).collect()
    }

    /// Fence of the oldest waiting item.
    pub fn front_fence(&self) -> Option<u64> {
        self.entries.front().map(|(fence, _)| *fence)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for FencePool<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_waits_for_fence() {
        let mut pool = FencePool::new();
        pool.push(3, "a");
        assert_eq!(pool.pop_ready(2), None);
        assert_eq!(pool.pop_ready(3), Some("a"));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_pop_is_fifo() {
        let mut pool = FencePool::new();
        pool.push(1, 10);
        pool.push(1, 11);
        pool.push(2, 12);
        assert_eq!(pool.pop_ready(5), Some(10));
        assert_eq!(pool.pop_ready(5), Some(11));
        assert_eq!(pool.front_fence(), Some(2));
    }

    #[test]
    fn test_drain_ready_stops_at_first_pending() {
        let mut pool = FencePool::new();
        pool.push(1, 'x');
        pool.push(2, 'y');
        pool.push(4, 'z');
        assert_eq!(pool.drain_ready(2), vec!['x', 'y']);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.drain_ready(3), Vec::<char>::new());
    }
}
