//! Common types for Twindeck
//!
//! Sample and buffer types shared by the engine, plus the small vocabulary
//! of deck identifiers and bar/tempo helpers everything else is built on.

use std::fmt;
use std::ops::{Index, IndexMut};

/// Default engine sample rate; the device rate wins when one is available
pub const SAMPLE_RATE: u32 = 48000;

/// Number of decks in the mixer
pub const NUM_DECKS: usize = 2;

/// Beats in one bar; loop lengths and positions are expressed in bars
pub const BEATS_PER_BAR: f64 = 4.0;

/// Audio sample type
pub type Sample = f32;

/// Seconds covered by one bar at `bpm`
#[inline]
pub fn seconds_per_bar(bpm: f64) -> f64 {
    BEATS_PER_BAR * 60.0 / bpm
}

/// Frames covered by one bar at `bpm` and `sample_rate`
#[inline]
pub fn frames_per_bar(bpm: f64, sample_rate: u32) -> f64 {
    seconds_per_bar(bpm) * sample_rate as f64
}

/// A single stereo frame
///
/// `#[repr(C)]` keeps the layout [left, right] so a `&[StereoSample]` can be
/// viewed as interleaved `&[f32]` through bytemuck without copying.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct StereoSample {
    pub left: Sample,
    pub right: Sample,
}

impl StereoSample {
    #[inline]
    pub fn new(left: Sample, right: Sample) -> Self {
        Self { left, right }
    }

    #[inline]
    pub fn silence() -> Self {
        Self::default()
    }

    /// Same value in both channels
    #[inline]
    pub fn mono(value: Sample) -> Self {
        Self { left: value, right: value }
    }

    /// Largest absolute channel value
    #[inline]
    pub fn peak(&self) -> Sample {
        self.left.abs().max(self.right.abs())
    }
}

impl std::ops::Add for StereoSample {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Self::new(self.left + other.left, self.right + other.right)
    }
}

impl std::ops::AddAssign for StereoSample {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.left += other.left;
        self.right += other.right;
    }
}

impl std::ops::Mul<Sample> for StereoSample {
    type Output = Self;

    #[inline]
    fn mul(self, gain: Sample) -> Self {
        Self::new(self.left * gain, self.right * gain)
    }
}

impl std::ops::MulAssign<Sample> for StereoSample {
    #[inline]
    fn mul_assign(&mut self, gain: Sample) {
        self.left *= gain;
        self.right *= gain;
    }
}

/// A buffer of stereo frames
///
/// Engine-side buffers are allocated once at `MAX_BUFFER_SIZE` capacity and
/// then resized per tick with [`StereoBuffer::set_len_from_capacity`], which
/// never reallocates on the audio thread.
#[derive(Debug, Clone, Default)]
pub struct StereoBuffer {
    samples: Vec<StereoSample>,
}

impl StereoBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
        }
    }

    pub fn silence(len: usize) -> Self {
        Self {
            samples: vec![StereoSample::silence(); len],
        }
    }

    /// Build from interleaved [L, R, L, R, ...] data; a trailing odd sample is dropped
    pub fn from_interleaved(interleaved: &[Sample]) -> Self {
        let samples = interleaved
            .chunks_exact(2)
            .map(|pair| StereoSample::new(pair[0], pair[1]))
            .collect();
        Self { samples }
    }

    pub fn from_vec(samples: Vec<StereoSample>) -> Self {
        Self { samples }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Set the working length of a pre-allocated buffer
    ///
    /// Newly exposed frames are silent. Must stay within capacity to keep
    /// the call allocation-free.
    #[inline]
    pub fn set_len_from_capacity(&mut self, new_len: usize) {
        debug_assert!(
            new_len <= self.samples.capacity(),
            "set_len_from_capacity called with len > capacity"
        );
        if new_len > self.samples.len() {
            self.samples.resize(new_len, StereoSample::silence());
        } else {
            self.samples.truncate(new_len);
        }
    }

    pub fn fill_silence(&mut self) {
        self.samples.fill(StereoSample::silence());
    }

    #[inline]
    pub fn as_slice(&self) -> &[StereoSample] {
        &self.samples
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [StereoSample] {
        &mut self.samples
    }

    /// Zero-copy interleaved view
    #[inline]
    pub fn as_interleaved(&self) -> &[Sample] {
        bytemuck::cast_slice(&self.samples)
    }

    /// Sum `other` into this buffer frame by frame, scaled by `gain`
    pub fn mix_from(&mut self, other: &StereoBuffer, gain: Sample) {
        debug_assert_eq!(self.len(), other.len(), "Buffer lengths must match");
        for (dst, src) in self.samples.iter_mut().zip(other.samples.iter()) {
            *dst += *src * gain;
        }
    }

    pub fn scale(&mut self, gain: Sample) {
        for sample in &mut self.samples {
            *sample *= gain;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &StereoSample> {
        self.samples.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut StereoSample> {
        self.samples.iter_mut()
    }

    pub fn peak(&self) -> Sample {
        self.samples.iter().map(|s| s.peak()).fold(0.0, Sample::max)
    }

    pub fn into_vec(self) -> Vec<StereoSample> {
        self.samples
    }
}

impl Index<usize> for StereoBuffer {
    type Output = StereoSample;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.samples[index]
    }
}

impl IndexMut<usize> for StereoBuffer {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.samples[index]
    }
}

/// Deck identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeckId {
    A,
    B,
}

impl DeckId {
    pub const ALL: [DeckId; NUM_DECKS] = [DeckId::A, DeckId::B];

    /// Array index of this deck
    #[inline]
    pub fn index(self) -> usize {
        match self {
            DeckId::A => 0,
            DeckId::B => 1,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(DeckId::A),
            1 => Some(DeckId::B),
            _ => None,
        }
    }

    /// The opposite deck
    #[inline]
    pub fn other(self) -> Self {
        match self {
            DeckId::A => DeckId::B,
            DeckId::B => DeckId::A,
        }
    }
}

impl fmt::Display for DeckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeckId::A => f.write_str("A"),
            DeckId::B => f.write_str("B"),
        }
    }
}

/// Playback state for a deck
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayState {
    #[default]
    Stopped,
    Playing,
}
