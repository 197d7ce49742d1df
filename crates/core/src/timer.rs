//! Frame timing for the submission loop.

use std::time::{Duration, Instant};

/// Number of frames averaged by [`FrameTimer::average_frame_time`].
const HISTORY_LEN: usize = 64;

/// Measures CPU frame time across a run of the frame loop.
///
/// Call [`tick`](FrameTimer::tick) once per frame; the timer keeps a small
/// ring of recent frame durations for averaging.
#[derive(Debug)]
pub struct FrameTimer {
    start: Instant,
    last_tick: Instant,
    frame_count: u64,
    history: [Duration; HISTORY_LEN],
}

impl FrameTimer {
    /// Create a new timer, starting from now.
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_tick: now,
            frame_count: 0,
            history: [Duration::ZERO; HISTORY_LEN],
        }
    }

    /// Total elapsed time since the timer was created or reset.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Marks the end of a frame and returns its duration.
    pub fn tick(&mut self) -> Duration {
        let now = Instant::now();
        let delta = now - self.last_tick;
        self.last_tick = now;
        self.history[(self.frame_count % HISTORY_LEN as u64) as usize] = delta;
        self.frame_count += 1;
        delta
    }

    /// Number of frames ticked so far.
    #[inline]
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Average of the most recent frame durations (up to 64).
    pub fn average_frame_time(&self) -> Duration {
        let samples = self.frame_count.min(HISTORY_LEN as u64) as usize;
        if samples == 0 {
            return Duration::ZERO;
        }
        let total: Duration = self.history[..samples].iter().sum();
        total / samples as u32
    }

    /// Reset the timer to the current time and clear history.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self::new()
    }
}
