// src/time.rs
//! Frame timing for the main loop.
//!
//! [`FrameTimer`] turns wall-clock time into a per-frame delta in seconds.
//! The delta is clamped so a stall (window drag, breakpoint, minimize) does not
//! spin the cube by a huge angle or fling the camera on the next frame.

use std::time::{Duration, Instant};

/// Largest delta a single frame may report.
pub const MAX_DELTA: f32 = 0.25;

#[derive(Debug)]
pub struct FrameTimer {
    start: Instant,
    last: Instant,
    delta: f32,
    frame: u64,
    max_delta: f32,
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameTimer {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last: now,
            delta: 0.0,
            frame: 0,
            max_delta: MAX_DELTA,
        }
    }

    /// Advances to `now` and returns the clamped delta in seconds.
    #[inline]
    pub fn tick_at(&mut self, now: Instant) -> f32 {
        let elapsed = now.saturating_duration_since(self.last);
        self.last = now;
        self.frame += 1;
        self.delta = elapsed.as_secs_f32().min(self.max_delta);
        self.delta
    }

    /// Advances to the current instant.
    #[inline]
    pub fn tick(&mut self) -> f32 {
        self.tick_at(Instant::now())
    }

    #[inline]
    pub fn delta(&self) -> f32 {
        self.delta
    }

    #[inline]
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn elapsed(&self) -> Duration {
        self.last.saturating_duration_since(self.start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_is_measured_between_ticks() {
        let mut timer = FrameTimer::new();
        let t0 = timer.start;
        assert!((timer.tick_at(t0 + Duration::from_millis(16)) - 0.016).abs() < 1e-6);
        assert!((timer.tick_at(t0 + Duration::from_millis(48)) - 0.032).abs() < 1e-6);
        assert_eq!(timer.frame(), 2);
        assert_eq!(timer.elapsed(), Duration::from_millis(48));
    }

    #[test]
    fn long_stalls_are_clamped() {
        let mut timer = FrameTimer::new();
        let dt = timer.tick_at(timer.start + Duration::from_secs(3));
        assert_eq!(dt, MAX_DELTA);
    }

    #[test]
    fn time_going_backwards_yields_zero() {
        let mut timer = FrameTimer::new();
        let later = timer.start + Duration::from_millis(10);
        timer.tick_at(later);
        assert_eq!(timer.tick_at(timer.start), 0.0);
    }
}
