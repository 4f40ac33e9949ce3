//! Precise looper
//!
//! Owns one deck's loop region in bars and decides, frame by frame, when the
//! playhead has reached the loop end. The deck renders audio; the looper only
//! moves the playhead and reports each wrap so the deck can publish a
//! [`LoopRestart`](super::LoopRestart).
//!
//! Region changes requested while looping take effect at the next boundary,
//! so a phrase is never cut mid-way. While looping is disabled a new region
//! applies immediately and is used on the next enable.

use crate::config::LooperConfig;
use crate::types::seconds_per_bar;

/// A loop region in bars
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopRegion {
    pub start_bar: f64,
    pub length_bars: f64,
}

impl LoopRegion {
    pub fn new(start_bar: f64, length_bars: f64) -> Self {
        Self { start_bar, length_bars }
    }

    #[inline]
    pub fn end_bar(&self) -> f64 {
        self.start_bar + self.length_bars
    }
}

/// Resolved loop boundaries, as reported to callers
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopBoundaries {
    pub start_bar: f64,
    pub length_bars: f64,
    /// Source frame where the loop starts
    pub start_frame: f64,
    /// Source frame where the loop ends (exclusive)
    pub end_frame: f64,
    /// Playback seconds at the deck's effective tempo
    pub start_seconds: f64,
    pub end_seconds: f64,
    /// The request was shortened or moved to fit the track
    pub clamped: bool,
    /// The region waits for the next boundary before it applies
    pub pending: bool,
}

/// A wrap performed by [`PreciseLooper::advance`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Wrap {
    /// New playhead position in source frames
    pub position: f64,
    /// Restart counter after this wrap
    pub cycle: u64,
    /// Whole frames the boundary was passed by before it was noticed
    pub late_frames: u64,
}

#[derive(Debug, Clone, Copy)]
struct TrackGrid {
    frames_per_bar: f64,
    duration_frames: f64,
}

impl TrackGrid {
    fn duration_bars(&self) -> f64 {
        self.duration_frames / self.frames_per_bar
    }
}

/// Loop region state and boundary detection for one deck
#[derive(Debug, Clone)]
pub struct PreciseLooper {
    enabled: bool,
    /// Last region asked for, before clamping to a track
    requested: LoopRegion,
    active: LoopRegion,
    active_clamped: bool,
    pending: Option<(LoopRegion, bool)>,
    grid: Option<TrackGrid>,
    /// Source frame at which the next wrap happens
    next_boundary: f64,
    cycle: u64,
    min_bars: f64,
    start_quantum: f64,
    epsilon: f64,
}

impl PreciseLooper {
    pub fn new(config: &LooperConfig) -> Self {
        let mut looper = Self {
            enabled: false,
            requested: LoopRegion::new(0.0, config.default_bars),
            active: LoopRegion::new(0.0, config.default_bars),
            active_clamped: false,
            pending: None,
            grid: None,
            next_boundary: f64::INFINITY,
            cycle: 0,
            min_bars: config.min_bars.max(f64::EPSILON),
            start_quantum: config.start_quantum_bars.max(0.0),
            epsilon: config.boundary_epsilon_frames.max(0.0),
        };
        let (region, _) = looper.normalize(0.0, config.default_bars);
        looper.requested = region;
        looper.active = region;
        looper
    }

    /// Bind the looper to a newly loaded track
    ///
    /// The last requested region is re-clamped to the new track, any pending
    /// change is dropped and the cycle counter restarts.
    pub fn attach(&mut self, frames_per_bar: f64, duration_frames: f64, position: f64) {
        self.grid = (frames_per_bar.is_finite() && frames_per_bar > 0.0 && duration_frames > 0.0).then_some(
            TrackGrid {
                frames_per_bar,
                duration_frames,
            },
        );
        let (region, clamped) = self.clamp(self.requested);
        self.active = region;
        self.active_clamped = clamped;
        self.pending = None;
        self.cycle = 0;
        self.reposition(position);
    }

    pub fn detach(&mut self) {
        self.grid = None;
        self.pending = None;
        self.cycle = 0;
        self.next_boundary = f64::INFINITY;
    }

    /// Whether a track with a usable bar grid is attached
    pub fn has_grid(&self) -> bool {
        self.grid.is_some()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The region currently being looped
    pub fn region(&self) -> LoopRegion {
        self.active
    }

    /// A region waiting for the next boundary, if any
    pub fn pending_region(&self) -> Option<LoopRegion> {
        self.pending.map(|(region, _)| region)
    }

    /// Restarts since the track was attached
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Request a new loop region
    ///
    /// Out-of-range values are corrected rather than rejected: a negative or
    /// non-finite start becomes 0, a non-positive length becomes the minimum,
    /// the start snaps to the quantum grid and the region is clamped to the
    /// track.
    pub fn set_loop(&mut self, start_bar: f64, length_bars: f64, effective_bpm: f64) -> LoopBoundaries {
        let (normalized, corrected) = self.normalize(start_bar, length_bars);
        self.requested = normalized;
        let (region, clamped) = self.clamp(normalized);
        let clamped = clamped || corrected;

        let deferred = self.enabled && self.grid.is_some() && self.cycle_in_progress();
        if deferred {
            if region == self.active {
                self.pending = None;
            } else {
                log::debug!(
                    "Loop change to {:.3}+{:.3} bars deferred to next boundary",
                    region.start_bar,
                    region.length_bars
                );
                self.pending = Some((region, clamped));
            }
        } else {
            self.pending = None;
            self.active = region;
            self.active_clamped = clamped;
        }

        let mut boundaries = self.resolve(region, clamped, effective_bpm);
        boundaries.pending = deferred && self.pending.is_some();
        boundaries
    }

    /// Enable or disable looping at the current playhead
    ///
    /// Enabling never moves the playhead. If it is already past the loop
    /// end, the wrap happens at the next multiple of the loop length so the
    /// bar phase is kept.
    pub fn set_enabled(&mut self, enabled: bool, position: f64) {
        if enabled == self.enabled {
            return;
        }
        self.enabled = enabled;
        if enabled {
            self.reposition(position);
        } else if let Some((region, clamped)) = self.pending.take() {
            self.active = region;
            self.active_clamped = clamped;
        }
    }

    /// Recompute the next boundary after the playhead moved without playing
    pub fn reposition(&mut self, position: f64) {
        self.next_boundary = match self.grid {
            Some(grid) => self.next_boundary_from(position, grid),
            None => f64::INFINITY,
        };
    }

    /// Check the playhead after it advanced by `step` frames
    ///
    /// Returns the wrap when the loop end was reached. The overshoot past the
    /// boundary is carried into the new cycle so no fractional frame is lost.
    pub fn advance(&mut self, position: f64, step: f64) -> Option<Wrap> {
        if !self.enabled || position < self.next_boundary - self.epsilon {
            return None;
        }
        let grid = self.grid?;

        let overshoot = (position - self.next_boundary).max(0.0);
        if let Some((region, clamped)) = self.pending.take() {
            log::debug!(
                "Applying loop region {:.3}+{:.3} bars at boundary",
                region.start_bar,
                region.length_bars
            );
            self.active = region;
            self.active_clamped = clamped;
        }

        let start = self.active.start_bar * grid.frames_per_bar;
        let end = self.end_frame(grid);
        let length = (end - start).max(f64::EPSILON);

        let late_frames = if step > 0.0 { (overshoot / step).floor() as u64 } else { 0 };
        if late_frames > 0 {
            log::warn!(
                "Late loop boundary: wrapped {} frames after the loop end (cycle {})",
                late_frames,
                self.cycle + 1
            );
        }

        self.cycle += 1;
        self.next_boundary = end;
        Some(Wrap {
            position: start + overshoot % length,
            cycle: self.cycle,
            late_frames,
        })
    }

    /// Boundaries of the active region at `effective_bpm`
    pub fn boundaries(&self, effective_bpm: f64) -> LoopBoundaries {
        self.resolve(self.active, self.active_clamped, effective_bpm)
    }

    fn cycle_in_progress(&self) -> bool {
        self.next_boundary.is_finite()
    }

    fn end_frame(&self, grid: TrackGrid) -> f64 {
        (self.active.end_bar() * grid.frames_per_bar).min(grid.duration_frames)
    }

    fn next_boundary_from(&self, position: f64, grid: TrackGrid) -> f64 {
        let start = self.active.start_bar * grid.frames_per_bar;
        let end = self.end_frame(grid);
        let length = end - start;
        if position < end - self.epsilon || length <= 0.0 {
            return end;
        }
        let periods = ((position - start) / length).floor() + 1.0;
        (start + periods * length).min(grid.duration_frames)
    }

    fn normalize(&self, start_bar: f64, length_bars: f64) -> (LoopRegion, bool) {
        let mut corrected = false;

        let mut start = start_bar;
        if !start.is_finite() || start < 0.0 {
            start = 0.0;
            corrected = true;
        }
        if self.start_quantum > 0.0 {
            start = (start / self.start_quantum).round() * self.start_quantum;
        }

        let mut length = length_bars;
        if !length.is_finite() || length <= 0.0 {
            length = self.min_bars;
            corrected = true;
        } else if length < self.min_bars {
            length = self.min_bars;
            corrected = true;
        }

        (LoopRegion::new(start, length), corrected)
    }

    fn clamp(&self, region: LoopRegion) -> (LoopRegion, bool) {
        let Some(grid) = self.grid else {
            return (region, false);
        };
        let duration_bars = grid.duration_bars();
        let mut clamped = false;
        let mut start = region.start_bar;
        let mut length = region.length_bars;

        if start >= duration_bars {
            let last = (duration_bars - self.min_bars).max(0.0);
            start = if self.start_quantum > 0.0 {
                (last / self.start_quantum).floor() * self.start_quantum
            } else {
                last
            };
            clamped = true;
        }
        if start + length > duration_bars {
            length = duration_bars - start;
            clamped = true;
        }
        if clamped {
            log::debug!(
                "Loop {:.3}+{:.3} bars clamped to {:.3}+{:.3} (track is {:.3} bars)",
                region.start_bar,
                region.length_bars,
                start,
                length,
                duration_bars
            );
        }
        (LoopRegion::new(start, length), clamped)
    }

    fn resolve(&self, region: LoopRegion, clamped: bool, effective_bpm: f64) -> LoopBoundaries {
        let (start_frame, end_frame) = match self.grid {
            Some(grid) => (
                region.start_bar * grid.frames_per_bar,
                (region.end_bar() * grid.frames_per_bar).min(grid.duration_frames),
            ),
            None => (0.0, 0.0),
        };
        let spb = if effective_bpm.is_finite() && effective_bpm > 0.0 {
            seconds_per_bar(effective_bpm)
        } else {
            0.0
        };
        LoopBoundaries {
            start_bar: region.start_bar,
            length_bars: region.length_bars,
            start_frame,
            end_frame,
            start_seconds: region.start_bar * spb,
            end_seconds: region.end_bar() * spb,
            clamped,
            pending: false,
        }
    }
}
