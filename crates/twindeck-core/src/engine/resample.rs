//! Varispeed reads at fractional source positions
//!
//! Decks advance through their track by `rate * track_rate / engine_rate`
//! frames per output frame. Tempo and pitch move together; there is no
//! pitch-preserving stretch.

use serde::{Deserialize, Serialize};

use crate::types::StereoSample;

/// Interpolation used when the read position falls between frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpolationMethod {
    /// 2-point linear
    Linear,
    /// 4-point Catmull-Rom
    #[default]
    Cubic,
}

#[inline]
fn lerp_sample(s0: StereoSample, s1: StereoSample, t: f32) -> StereoSample {
    StereoSample {
        left: s0.left + (s1.left - s0.left) * t,
        right: s0.right + (s1.right - s0.right) * t,
    }
}

/// Catmull-Rom spline through s1..s2 (tension 0.5)
#[inline]
fn catmull_rom(s0: StereoSample, s1: StereoSample, s2: StereoSample, s3: StereoSample, t: f32) -> StereoSample {
    let t2 = t * t;
    let t3 = t2 * t;

    let c0 = -0.5 * t3 + t2 - 0.5 * t;
    let c1 = 1.5 * t3 - 2.5 * t2 + 1.0;
    let c2 = -1.5 * t3 + 2.0 * t2 + 0.5 * t;
    let c3 = 0.5 * t3 - 0.5 * t2;

    StereoSample {
        left: s0.left * c0 + s1.left * c1 + s2.left * c2 + s3.left * c3,
        right: s0.right * c0 + s1.right * c1 + s2.right * c2 + s3.right * c3,
    }
}

/// Frame at `index`, silent outside the track
#[inline]
fn frame_at(data: &[StereoSample], index: i64) -> StereoSample {
    if index < 0 || index >= data.len() as i64 {
        StereoSample::silence()
    } else {
        data[index as usize]
    }
}

/// Read `data` at a fractional frame position
pub fn read_interpolated(data: &[StereoSample], position: f64, method: InterpolationMethod) -> StereoSample {
    if data.is_empty() || !position.is_finite() {
        return StereoSample::silence();
    }

    let base = position.floor();
    let index = base as i64;
    let frac = (position - base) as f32;

    if frac == 0.0 {
        return frame_at(data, index);
    }

    match method {
        InterpolationMethod::Linear => lerp_sample(frame_at(data, index), frame_at(data, index + 1), frac),
        InterpolationMethod::Cubic => catmull_rom(
            frame_at(data, index - 1),
            frame_at(data, index),
            frame_at(data, index + 1),
            frame_at(data, index + 2),
            frac,
        ),
    }
}
