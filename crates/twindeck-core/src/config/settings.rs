//! Engine settings
//!
//! Stored as YAML, default location `~/.config/twindeck/config.yaml`.
//! Every section is `#[serde(default)]`, so a partial file only overrides
//! what it names.

use serde::{Deserialize, Serialize};

use crate::audio::AudioConfig;
use crate::engine::InterpolationMethod;

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub audio: AudioConfig,
    pub looper: LooperConfig,
    pub sync: SyncConfig,
    pub gate: GateConfig,
    pub recording: RecordingConfig,
    pub mixer: MixerConfig,
}

impl EngineConfig {
    /// Copy with out-of-range values pulled back into range
    pub fn sanitized(&self) -> Self {
        let mut config = self.clone();

        let looper = &mut config.looper;
        looper.min_bars = finite_or(looper.min_bars, 0.125).clamp(1.0 / 64.0, 64.0);
        looper.default_bars = finite_or(looper.default_bars, 4.0).max(looper.min_bars);
        looper.start_quantum_bars = finite_or(looper.start_quantum_bars, 0.25).clamp(0.0, 4.0);
        looper.boundary_epsilon_frames = finite_or(looper.boundary_epsilon_frames, 1e-6).clamp(0.0, 0.5);

        let sync = &mut config.sync;
        sync.settle_ms = finite_or(sync.settle_ms, 20.0).clamp(0.0, 1000.0);
        sync.drift_tolerance_bars = finite_or(sync.drift_tolerance_bars, 0.002).clamp(0.0, 0.25);
        sync.max_correction = finite_or(sync.max_correction, 0.01).clamp(0.0, 0.1);

        let gate = &mut config.gate;
        gate.ramp_ms = finite_or(gate.ramp_ms, 2.0).clamp(0.0, 50.0);
        gate.duck_depth = finite_or(gate.duck_depth as f64, 0.0).clamp(0.0, 1.0) as f32;

        let recording = &mut config.recording;
        recording.max_bars = recording.max_bars.max(1);
        recording.count_in_cycles = recording.count_in_cycles.min(16);
        recording.chunk_frames = recording.chunk_frames.clamp(1024, 1 << 20);

        let mixer = &mut config.mixer;
        mixer.crossfader = finite_or(mixer.crossfader as f64, 50.0).clamp(0.0, 100.0) as f32;
        mixer.master_volume = finite_or(mixer.master_volume as f64, 1.0).clamp(0.0, 2.0) as f32;

        config
    }
}

fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

/// Loop region defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LooperConfig {
    /// Loop length used before the first `set_loop` (bars)
    pub default_bars: f64,
    /// Shortest loop accepted (bars)
    pub min_bars: f64,
    /// Grid the loop start snaps to (bars)
    pub start_quantum_bars: f64,
    /// Slack when comparing the playhead with the loop end (source frames)
    pub boundary_epsilon_frames: f64,
    /// Varispeed read quality
    pub interpolation: InterpolationMethod,
}

impl Default for LooperConfig {
    fn default() -> Self {
        Self {
            default_bars: 4.0,
            min_bars: 0.125,
            start_quantum_bars: 0.25,
            boundary_epsilon_frames: 1e-6,
            interpolation: InterpolationMethod::Cubic,
        }
    }
}

/// Cross-deck sync tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Both transports hold this long after sync is enabled
    pub settle_ms: f64,
    /// Phase error below which no correction is applied (bars)
    pub drift_tolerance_bars: f64,
    /// Largest fractional rate nudge per master cycle (0.01 = 1 %)
    pub max_correction: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            settle_ms: 20.0,
            drift_tolerance_bars: 0.002,
            max_correction: 0.01,
        }
    }
}

/// Gate effect shaping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Gain ramp between open and closed steps
    pub ramp_ms: f64,
    /// Gain of a closed step (0.0 mutes, 0.5 ducks by half)
    pub duck_depth: f32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            ramp_ms: 2.0,
            duck_depth: 0.0,
        }
    }
}

/// Recording capture limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Safety ceiling; a recording auto-stops here
    pub max_bars: u32,
    /// Extra loop cycles between rehearsal and capture
    pub count_in_cycles: u32,
    /// Frames per captured chunk
    pub chunk_frames: usize,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            max_bars: 120,
            count_in_cycles: 0,
            chunk_frames: 65536,
        }
    }
}

/// Initial mixer state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerConfig {
    /// Crossfader position, 0 = deck A only, 100 = deck B only
    pub crossfader: f32,
    pub master_volume: f32,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            crossfader: 50.0,
            master_volume: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_keeps_other_defaults() {
        let yaml = "recording:\n  max_bars: 32\ngate:\n  duck_depth: 0.25\n";
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.recording.max_bars, 32);
        assert_eq!(config.recording.count_in_cycles, 0);
        assert_eq!(config.gate.duck_depth, 0.25);
        assert_eq!(config.looper, LooperConfig::default());
        assert_eq!(config.mixer.crossfader, 50.0);
    }

    #[test]
    fn test_sanitized_clamps_nonsense() {
        let mut config = EngineConfig::default();
        config.looper.min_bars = -1.0;
        config.sync.settle_ms = f64::NAN;
        config.gate.duck_depth = 3.0;
        config.recording.max_bars = 0;
        config.mixer.crossfader = 250.0;

        let clean = config.sanitized();
        assert_eq!(clean.looper.min_bars, 1.0 / 64.0);
        assert_eq!(clean.sync.settle_ms, 20.0);
        assert_eq!(clean.gate.duck_depth, 1.0);
        assert_eq!(clean.recording.max_bars, 1);
        assert_eq!(clean.mixer.crossfader, 100.0);
    }

    #[test]
    fn test_defaults_survive_sanitize() {
        let config = EngineConfig::default();
        assert_eq!(config.sanitized(), config);
    }
}
