// src/fps_counter.rs
use log::debug;

const HISTORY: usize = 128;

/// Rolling frame-time average for the stats panel.
pub struct FpsCounter {
    frame_times: [f32; HISTORY], // last N frame times (ms)
    index: usize,
    frames: u64,
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl FpsCounter {
    pub fn new() -> Self {
        Self {
            frame_times: [0.0; HISTORY],
            index: 0,
            frames: 0,
        }
    }

    /// Records one frame that took `dt` seconds.
    pub fn record(&mut self, dt: f32) {
        self.frame_times[self.index] = dt * 1000.0;
        self.index = (self.index + 1) % HISTORY;
        self.frames += 1;
    }

    /// Returns averaged FPS and frame time in ms over the buffer.
    pub fn averaged(&self) -> (f32, f32) {
        let (sum, count) = self
            .frame_times
            .iter()
            .filter(|ms| **ms > 0.0)
            .fold((0.0f32, 0u32), |(sum, count), ms| (sum + ms, count + 1));
        if count == 0 {
            return (0.0, 0.0);
        }
        let avg_ms = sum / count as f32;
        (1000.0 / avg_ms, avg_ms)
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Logs the average every `every` frames.
    pub fn log_every(&self, every: u64) {
        if every > 0 && self.frames % every == 0 {
            let (fps, ms) = self.averaged();
            debug!("FPS: {:.1}, frame time: {:.3} ms", fps, ms);
        }
    }
}
