//! Audio clock
//!
//! Monotonic time reference derived from the number of frames the engine has
//! rendered. Every scheduling decision (loop restarts, gate steps, recording
//! start and bar counting) is expressed in clock frames, never wall time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Frame counter owned by the engine
///
/// Only the engine advances it, once per tick, after the tick has been
/// rendered. Other threads observe it through a [`ClockReader`].
#[derive(Debug)]
pub struct AudioClock {
    frames: Arc<AtomicU64>,
    sample_rate: u32,
}

impl AudioClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            frames: Arc::new(AtomicU64::new(0)),
            sample_rate: sample_rate.max(1),
        }
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frames rendered since the engine was created
    #[inline]
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Current clock time in seconds
    #[inline]
    pub fn now(&self) -> f64 {
        self.frame_to_seconds(self.frames())
    }

    #[inline]
    pub fn frame_to_seconds(&self, frame: u64) -> f64 {
        frame as f64 / self.sample_rate as f64
    }

    pub(crate) fn advance(&self, frames: usize) {
        self.frames.fetch_add(frames as u64, Ordering::Relaxed);
    }

    /// Read-only handle for UI and worker threads
    pub fn reader(&self) -> ClockReader {
        ClockReader {
            frames: Arc::clone(&self.frames),
            sample_rate: self.sample_rate,
        }
    }
}

/// Read-only view of an [`AudioClock`]
#[derive(Debug, Clone)]
pub struct ClockReader {
    frames: Arc<AtomicU64>,
    sample_rate: u32,
}

impl ClockReader {
    #[inline]
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn now(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances_by_frames() {
        let clock = AudioClock::new(48000);
        assert_eq!(clock.frames(), 0);
        clock.advance(24000);
        clock.advance(24000);
        assert_eq!(clock.frames(), 48000);
        assert!((clock.now() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_reader_tracks_clock() {
        let clock = AudioClock::new(8000);
        let reader = clock.reader();
        clock.advance(4000);
        assert_eq!(reader.frames(), 4000);
        assert!((reader.now() - 0.5).abs() < 1e-12);
    }
}
