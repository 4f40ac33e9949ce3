//! Decoded tracks
//!
//! A [`Track`] is a ready-to-play stereo buffer plus the metadata the loop
//! engine needs: its sample rate, native tempo and whether it is
//! loop-quantized material. Decoding happens before a deck ever sees the
//! track; the audio thread only reads frames.

use std::path::Path;

use basedrop::{Handle, Shared};
use thiserror::Error;

use crate::types::{frames_per_bar, Sample, StereoSample};

/// Timing model of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackKind {
    /// Loop-quantized material with a fixed native tempo
    #[default]
    Loop,
    /// Continuously streamed material with no reliable bar grid
    Stream,
}

/// Errors raised while preparing a track
#[derive(Debug, Error)]
pub enum TrackError {
    #[error("Failed to read WAV file: {0}")]
    Wav(#[from] hound::Error),

    #[error("Unsupported WAV layout: {0}")]
    UnsupportedFormat(String),

    #[error("Track contains no audio frames")]
    Empty,
}

/// Decoded audio and its metadata, before it is handed to the engine
#[derive(Debug, Clone)]
pub struct TrackData {
    pub name: String,
    pub frames: Vec<StereoSample>,
    pub sample_rate: u32,
    /// Native tempo in BPM; zero or non-finite means unknown
    pub bpm: f64,
    pub kind: TrackKind,
}

impl TrackData {
    pub fn new(
        name: impl Into<String>,
        frames: Vec<StereoSample>,
        sample_rate: u32,
        bpm: f64,
        kind: TrackKind,
    ) -> Self {
        Self {
            name: name.into(),
            frames,
            sample_rate: sample_rate.max(1),
            bpm,
            kind,
        }
    }

    /// Whether the native tempo can be used for bar math
    pub fn has_tempo(&self) -> bool {
        self.bpm.is_finite() && self.bpm > 0.0
    }
}

/// A loaded track, shared between the controller and the audio thread
///
/// Cloning is a reference-count bump. The last drop is deferred to the
/// engine's reclaimer thread.
#[derive(Clone)]
pub struct Track {
    data: Shared<TrackData>,
}

impl Track {
    pub fn new(handle: &Handle, data: TrackData) -> Self {
        Self {
            data: Shared::new(handle, data),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.data.name
    }

    #[inline]
    pub fn frames(&self) -> &[StereoSample] {
        &self.data.frames
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.data.sample_rate
    }

    #[inline]
    pub fn bpm(&self) -> f64 {
        self.data.bpm
    }

    #[inline]
    pub fn kind(&self) -> TrackKind {
        self.data.kind
    }

    pub fn has_tempo(&self) -> bool {
        self.data.has_tempo()
    }

    #[inline]
    pub fn duration_frames(&self) -> usize {
        self.data.frames.len()
    }

    pub fn duration_seconds(&self) -> f64 {
        self.duration_frames() as f64 / self.sample_rate() as f64
    }

    /// Source frames per bar at the native tempo, or `None` without a tempo
    pub fn frames_per_bar(&self) -> Option<f64> {
        self.has_tempo()
            .then(|| frames_per_bar(self.bpm(), self.sample_rate()))
    }

    /// Track length in bars at the native tempo
    pub fn duration_bars(&self) -> Option<f64> {
        self.frames_per_bar()
            .map(|fpb| self.duration_frames() as f64 / fpb)
    }
}

impl std::fmt::Debug for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Track")
            .field("name", &self.name())
            .field("frames", &self.duration_frames())
            .field("sample_rate", &self.sample_rate())
            .field("bpm", &self.bpm())
            .field("kind", &self.kind())
            .finish()
    }
}

/// Load a WAV file into a [`TrackData`]
///
/// Accepts 8/16/24/32-bit integer and 32-bit float PCM. Mono is duplicated
/// into both channels; channels beyond the first two are ignored.
pub fn load_wav(path: &Path, bpm: f64, kind: TrackKind) -> Result<TrackData, TrackError> {
    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let channels = spec.channels as usize;
    if channels == 0 {
        return Err(TrackError::UnsupportedFormat("zero channels".to_string()));
    }

    let samples: Vec<Sample> = match spec.sample_format {
        hound::SampleFormat::Float => {
            if spec.bits_per_sample != 32 {
                return Err(TrackError::UnsupportedFormat(format!(
                    "{}-bit float",
                    spec.bits_per_sample
                )));
            }
            reader.into_samples::<f32>().collect::<Result<_, _>>()?
        }
        hound::SampleFormat::Int => {
            if !(1..=32).contains(&spec.bits_per_sample) {
                return Err(TrackError::UnsupportedFormat(format!(
                    "{}-bit integer",
                    spec.bits_per_sample
                )));
            }
            let scale = 1.0 / (1u64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<_, _>>()?
        }
    };

    let frames: Vec<StereoSample> = samples
        .chunks_exact(channels)
        .map(|frame| {
            if channels == 1 {
                StereoSample::mono(frame[0])
            } else {
                StereoSample::new(frame[0], frame[1])
            }
        })
        .collect();

    if frames.is_empty() {
        return Err(TrackError::Empty);
    }

    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    log::info!(
        "Loaded '{}': {} frames @ {} Hz, {} ch, {:.2} BPM",
        name,
        frames.len(),
        spec.sample_rate,
        channels,
        bpm
    );

    Ok(TrackData::new(name, frames, spec.sample_rate, bpm, kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Reclaimer;

    fn write_test_wav(path: &Path, channels: u16, frames: usize) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..frames {
            for ch in 0..channels {
                let value = if ch == 0 { i as i16 } else { -(i as i16) };
                writer.write_sample(value).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_load_stereo_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beat.wav");
        write_test_wav(&path, 2, 100);

        let data = load_wav(&path, 120.0, TrackKind::Loop).unwrap();
        assert_eq!(data.name, "beat");
        assert_eq!(data.frames.len(), 100);
        assert_eq!(data.sample_rate, 8000);
        let expected = 10.0 / 32768.0;
        assert!((data.frames[10].left - expected).abs() < 1e-7);
        assert!((data.frames[10].right + expected).abs() < 1e-7);
    }

    #[test]
    fn test_load_mono_wav_duplicates_channel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.wav");
        write_test_wav(&path, 1, 50);

        let data = load_wav(&path, 90.0, TrackKind::Loop).unwrap();
        assert_eq!(data.frames.len(), 50);
        assert_eq!(data.frames[7].left, data.frames[7].right);
    }

    #[test]
    fn test_load_missing_file_errors() {
        let result = load_wav(Path::new("/nonexistent/track.wav"), 120.0, TrackKind::Loop);
        assert!(matches!(result, Err(TrackError::Wav(_))));
    }

    #[test]
    fn test_track_bar_math() {
        let reclaimer = Reclaimer::start().unwrap();
        let data = TrackData::new(
            "loop",
            vec![StereoSample::silence(); 16000 * 8],
            8000,
            120.0,
            TrackKind::Loop,
        );
        let track = Track::new(&reclaimer.handle(), data);
        assert_eq!(track.frames_per_bar(), Some(16000.0));
        assert_eq!(track.duration_bars(), Some(8.0));
        assert!((track.duration_seconds() - 16.0).abs() < 1e-12);
    }

    #[test]
    fn test_track_without_tempo_has_no_bar_grid() {
        let reclaimer = Reclaimer::start().unwrap();
        let data = TrackData::new("drone", vec![StereoSample::silence(); 10], 8000, 0.0, TrackKind::Stream);
        let track = Track::new(&reclaimer.handle(), data);
        assert!(!track.has_tempo());
        assert_eq!(track.frames_per_bar(), None);
    }
}
