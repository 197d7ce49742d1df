//! The queue's fence timeline.

use std::sync::atomic::{AtomicU64, Ordering};

/// Last fence value signaled on the queue, shared with everything that
/// stamps work against it.
///
/// Descriptor frees happen during recording, before the submission that
/// uses them has a fence value. They are stamped with
/// [`next_value`](Self::next_value), the value the next submission will
/// signal, so slots stay stale until that submission retires.
#[derive(Debug, Default)]
pub struct FenceTimeline {
    last_signaled: AtomicU64,
}

impl FenceTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last value handed to the queue's signal.
    #[inline]
    pub fn last_signaled(&self) -> u64 {
        self.last_signaled.load(Ordering::Acquire)
    }

    /// Value the next signal will use.
    #[inline]
    pub fn next_value(&self) -> u64 {
        self.last_signaled() + 1
    }

    /// Reserves the next value. Only the queue signals.
    pub(crate) fn advance(&self) -> u64 {
        self.last_signaled.fetch_add(1, Ordering::AcqRel) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeline_starts_at_zero() {
        let timeline = FenceTimeline::new();
        assert_eq!(timeline.last_signaled(), 0);
        assert_eq!(timeline.next_value(), 1);
    }

    #[test]
    fn test_advance_is_monotonic() {
        let timeline = FenceTimeline::new();
        assert_eq!(timeline.advance(), 1);
        assert_eq!(timeline.advance(), 2);
        assert_eq!(timeline.last_signaled(), 2);
        assert_eq!(timeline.next_value(), 3);
    }
}
