//! Gate effect
//!
//! Rhythmic amplitude gating on a deck's signal. Steps are derived from a
//! beat position that is extrapolated from the engine clock, so the pattern
//! stays on the grid no matter how the audio is buffered. Every loop restart
//! on the deck re-anchors beat 0 to the restart frame.
//!
//! Gain changes are ramped over a couple of milliseconds to avoid clicks.

use crate::config::GateConfig;
use crate::types::StereoSample;

use super::events::{LoopEventBus, Subscription};

/// An immutable gate pattern
#[derive(Debug)]
pub struct GatePattern {
    pub name: &'static str,
    /// Pattern steps per beat
    pub steps_per_beat: u32,
    /// `true` = open, `false` = closed; repeats after the last step
    pub steps: &'static [bool],
}

impl GatePattern {
    /// Whether the step covering `beats` is open
    #[inline]
    pub fn is_open_at(&self, beats: f64) -> bool {
        let step = (beats * self.steps_per_beat as f64).floor() as i64;
        self.steps[step.rem_euclid(self.steps.len() as i64) as usize]
    }
}

const X: bool = true;
const O: bool = false;

/// Built-in patterns, selected by index
pub static GATE_PATTERNS: [GatePattern; 8] = [
    GatePattern {
        name: "Eighth chop",
        steps_per_beat: 2,
        steps: &[X, O],
    },
    GatePattern {
        name: "Sixteenth stutter",
        steps_per_beat: 4,
        steps: &[X, O],
    },
    GatePattern {
        name: "Offbeat",
        steps_per_beat: 2,
        steps: &[O, X],
    },
    GatePattern {
        name: "Triplet",
        steps_per_beat: 3,
        steps: &[X, X, O],
    },
    GatePattern {
        name: "Tresillo",
        steps_per_beat: 4,
        steps: &[X, O, O, X, O, O, X, O],
    },
    GatePattern {
        name: "Gallop",
        steps_per_beat: 4,
        steps: &[X, O, X, X],
    },
    GatePattern {
        name: "Half bar",
        steps_per_beat: 1,
        steps: &[X, X, O, O],
    },
    GatePattern {
        name: "Trance gate",
        steps_per_beat: 4,
        steps: &[X, X, O, X, X, O, X, X, O, X, X, O, X, X, O, X],
    },
];

#[derive(Debug, Clone, Copy)]
struct ActiveGate {
    pattern: usize,
    bpm: f64,
    anchor_frame: u64,
    anchor_beats: f64,
}

impl ActiveGate {
    fn beats_at(&self, frame: u64, sample_rate: u32) -> f64 {
        let elapsed = frame as i64 - self.anchor_frame as i64;
        self.anchor_beats + elapsed as f64 / sample_rate as f64 * self.bpm / 60.0
    }
}

/// Gate effect for one deck
#[derive(Debug)]
pub struct GateEffect {
    active: Option<ActiveGate>,
    gain: f32,
    ramp_step: f32,
    depth: f32,
    sample_rate: u32,
    restarts: Option<Subscription>,
}

impl GateEffect {
    pub fn new(config: &GateConfig, sample_rate: u32) -> Self {
        let ramp_frames = config.ramp_ms * sample_rate as f64 / 1000.0;
        Self {
            active: None,
            gain: 1.0,
            ramp_step: if ramp_frames >= 1.0 { (1.0 / ramp_frames) as f32 } else { 1.0 },
            depth: config.duck_depth.clamp(0.0, 1.0),
            sample_rate: sample_rate.max(1),
            restarts: None,
        }
    }

    /// Receive this deck's loop restarts for phase alignment
    pub fn attach(&mut self, restarts: Subscription) {
        self.restarts = Some(restarts);
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Index of the running pattern
    pub fn pattern(&self) -> Option<usize> {
        self.active.map(|gate| gate.pattern)
    }

    pub fn bpm(&self) -> Option<f64> {
        self.active.map(|gate| gate.bpm)
    }

    /// Current applied gain
    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Start `pattern` at `bpm`, with the beat position at `frame` given by `beats`
    ///
    /// Returns false (and leaves the gate untouched) for an unknown pattern
    /// or an unusable tempo.
    pub fn start(&mut self, pattern: usize, bpm: f64, frame: u64, beats: f64) -> bool {
        if pattern >= GATE_PATTERNS.len() {
            log::warn!("Gate pattern {} does not exist", pattern);
            return false;
        }
        if !bpm.is_finite() || bpm <= 0.0 {
            log::warn!("Gate start ignored: invalid BPM {}", bpm);
            return false;
        }
        self.active = Some(ActiveGate {
            pattern,
            bpm,
            anchor_frame: frame,
            anchor_beats: if beats.is_finite() { beats } else { 0.0 },
        });
        log::info!("Gate '{}' started at {:.2} BPM", GATE_PATTERNS[pattern].name, bpm);
        true
    }

    /// Change tempo without jumping back to the first step
    pub fn update_bpm(&mut self, bpm: f64, frame: u64) {
        if !bpm.is_finite() || bpm <= 0.0 {
            return;
        }
        let sample_rate = self.sample_rate;
        if let Some(gate) = self.active.as_mut() {
            gate.anchor_beats = gate.beats_at(frame, sample_rate);
            gate.anchor_frame = frame;
            gate.bpm = bpm;
        }
    }

    /// Full pass-through from the next frame on
    pub fn stop(&mut self) {
        if self.active.take().is_some() {
            log::info!("Gate stopped");
        }
        self.gain = 1.0;
    }

    /// Stop and release the restart subscription
    pub fn dispose(&mut self, bus: &mut LoopEventBus) {
        self.stop();
        if let Some(restarts) = self.restarts.take() {
            bus.unsubscribe(restarts.id());
        }
    }

    /// Apply the gate to one tick of deck audio starting at clock frame `tick_start`
    ///
    /// A restart inside the tick only re-anchors the frames from its clock
    /// frame on; the frames before it keep the previous phase.
    pub fn process(&mut self, frames: &mut [StereoSample], tick_start: u64) {
        let mut done = 0;
        if let Some(restarts) = self.restarts.take() {
            for restart in restarts.drain() {
                let at = (restart.clock_frame.saturating_sub(tick_start) as usize).clamp(done, frames.len());
                self.render(&mut frames[done..at], tick_start + done as u64);
                done = at;
                if let Some(gate) = self.active.as_mut() {
                    gate.anchor_frame = restart.clock_frame;
                    gate.anchor_beats = 0.0;
                }
            }
            self.restarts = Some(restarts);
        }
        self.render(&mut frames[done..], tick_start + done as u64);
    }

    fn render(&mut self, frames: &mut [StereoSample], start_frame: u64) {
        let Some(gate) = self.active else {
            return;
        };
        let pattern = &GATE_PATTERNS[gate.pattern];

        for (i, frame) in frames.iter_mut().enumerate() {
            let beats = gate.beats_at(start_frame + i as u64, self.sample_rate);
            let target = if pattern.is_open_at(beats) { 1.0 } else { self.depth };
            if self.gain < target {
                self.gain = (self.gain + self.ramp_step).min(target);
            } else if self.gain > target {
                self.gain = (self.gain - self.ramp_step).max(target);
            }
            *frame *= self.gain;
        }
    }
}
