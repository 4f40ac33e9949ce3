//! Mixer - channel strips, equal-power crossfader and master bus

use std::f32::consts::FRAC_PI_2;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::MixerConfig;
use crate::types::{DeckId, StereoBuffer, NUM_DECKS};

/// Deck gains for a crossfader position in 0..=100
///
/// `x = position / 100`, gain A = cos(x·π/2), gain B = sin(x·π/2), so
/// A² + B² = 1 everywhere and the centre sits at -3 dB per deck.
pub fn equal_power_gains(position: f32) -> (f32, f32) {
    let x = position / 100.0;
    let angle = x * FRAC_PI_2;
    (angle.cos(), angle.sin())
}

/// Equal-power crossfader between deck A (0) and deck B (100)
#[derive(Debug, Clone)]
pub struct Crossfader {
    position: f32,
    /// Gains reached at the end of the last processed tick
    applied: (f32, f32),
}

impl Crossfader {
    pub fn new(position: f32) -> Self {
        let mut crossfader = Self {
            position: 50.0,
            applied: (0.0, 0.0),
        };
        crossfader.set_position(position);
        crossfader.applied = crossfader.gains();
        crossfader
    }

    /// Move the fader; out-of-range values are clamped, NaN centres it
    pub fn set_position(&mut self, position: f32) {
        self.position = if position.is_nan() { 50.0 } else { position.clamp(0.0, 100.0) };
    }

    pub fn position(&self) -> f32 {
        self.position
    }

    /// Target gains (deck A, deck B) for the current position
    pub fn gains(&self) -> (f32, f32) {
        equal_power_gains(self.position)
    }

    pub fn gain(&self, deck: DeckId) -> f32 {
        let (a, b) = self.gains();
        match deck {
            DeckId::A => a,
            DeckId::B => b,
        }
    }
}

impl Default for Crossfader {
    fn default() -> Self {
        Self::new(50.0)
    }
}

/// Per-deck gain stage ahead of the crossfader
#[derive(Debug, Clone)]
pub struct ChannelStrip {
    /// Trim as a linear multiplier (-24 to +12 dB)
    pub trim: f32,
    /// Channel fader (0.0 to 1.0)
    pub volume: f32,
}

impl Default for ChannelStrip {
    fn default() -> Self {
        Self { trim: 1.0, volume: 1.0 }
    }
}

impl ChannelStrip {
    pub fn set_trim_db(&mut self, db: f32) {
        self.trim = 10.0_f32.powf(db.clamp(-24.0, 12.0) / 20.0);
    }

    pub fn trim_db(&self) -> f32 {
        20.0 * self.trim.log10()
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };
    }

    #[inline]
    fn gain(&self) -> f32 {
        self.trim * self.volume
    }
}

/// Two-deck mixer
pub struct Mixer {
    channels: [ChannelStrip; NUM_DECKS],
    crossfader: Crossfader,
    master_volume: f32,
    clip: Arc<AtomicBool>,
}

impl Mixer {
    pub fn new(config: &MixerConfig) -> Self {
        Self {
            channels: Default::default(),
            crossfader: Crossfader::new(config.crossfader),
            master_volume: config.master_volume.clamp(0.0, 2.0),
            clip: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn channel(&self, deck: DeckId) -> &ChannelStrip {
        &self.channels[deck.index()]
    }

    pub fn channel_mut(&mut self, deck: DeckId) -> &mut ChannelStrip {
        &mut self.channels[deck.index()]
    }

    pub fn crossfader(&self) -> &Crossfader {
        &self.crossfader
    }

    pub fn crossfader_mut(&mut self) -> &mut Crossfader {
        &mut self.crossfader
    }

    pub fn set_master_volume(&mut self, volume: f32) {
        self.master_volume = if volume.is_nan() { 1.0 } else { volume.clamp(0.0, 2.0) };
    }

    pub fn master_volume(&self) -> f32 {
        self.master_volume
    }

    /// Set when a master sample exceeded full scale since the last read
    pub fn clip_indicator(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.clip)
    }

    /// Mix both deck buffers into `master_out`
    ///
    /// Crossfader moves are ramped across the tick so a jump in position
    /// does not produce a step in gain.
    pub fn process(&mut self, deck_buffers: &[StereoBuffer; NUM_DECKS], master_out: &mut StereoBuffer) {
        let len = master_out.len();
        master_out.fill_silence();
        if len == 0 {
            return;
        }

        let from = self.crossfader.applied;
        let to = self.crossfader.gains();
        let fade = [(from.0, to.0), (from.1, to.1)];

        for (deck, buffer) in deck_buffers.iter().enumerate() {
            let channel_gain = self.channels[deck].gain() * self.master_volume;
            let (start, end) = fade[deck];
            let step = (end - start) / len as f32;
            let out = master_out.as_mut_slice();
            for (i, sample) in buffer.iter().take(len).enumerate() {
                let xfade = start + step * (i + 1) as f32;
                out[i] += *sample * (xfade * channel_gain);
            }
        }
        self.crossfader.applied = to;

        if master_out.peak() > 1.0 {
            self.clip.store(true, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StereoSample;

    #[test]
    fn test_equal_power_law() {
        let (a, b) = equal_power_gains(0.0);
        assert!((a - 1.0).abs() < 1e-6 && b.abs() < 1e-6);

        let (a, b) = equal_power_gains(100.0);
        assert!(a.abs() < 1e-6 && (b - 1.0).abs() < 1e-6);

        let (a, b) = equal_power_gains(50.0);
        assert!((a - b).abs() < 1e-6);
        assert!((a - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);

        for p in [10.0, 25.0, 62.5, 90.0] {
            let (a, b) = equal_power_gains(p);
            assert!((a * a + b * b - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_crossfader_clamps() {
        let mut xf = Crossfader::default();
        xf.set_position(150.0);
        assert_eq!(xf.position(), 100.0);
        xf.set_position(-5.0);
        assert_eq!(xf.position(), 0.0);
        xf.set_position(f32::NAN);
        assert_eq!(xf.position(), 50.0);
    }

    #[test]
    fn test_trim_db_conversion() {
        let mut strip = ChannelStrip::default();
        strip.set_trim_db(6.0);
        assert!((strip.trim - 2.0).abs() < 0.01);
        strip.set_trim_db(-6.0);
        assert!((strip.trim_db() + 6.0).abs() < 0.001);
        strip.set_trim_db(40.0);
        assert!((strip.trim_db() - 12.0).abs() < 0.001);
    }

    #[test]
    fn test_hard_left_passes_only_deck_a() {
        let mut mixer = Mixer::new(&MixerConfig {
            crossfader: 0.0,
            master_volume: 1.0,
        });
        let buffers = [
            StereoBuffer::from_vec(vec![StereoSample::mono(0.5); 64]),
            StereoBuffer::from_vec(vec![StereoSample::mono(0.25); 64]),
        ];
        let mut master = StereoBuffer::silence(64);
        mixer.process(&buffers, &mut master);
        assert!(master.iter().all(|s| (s.left - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_crossfader_move_is_ramped() {
        let mut mixer = Mixer::new(&MixerConfig::default());
        let buffers = [
            StereoBuffer::from_vec(vec![StereoSample::mono(1.0); 100]),
            StereoBuffer::silence(100),
        ];
        let mut master = StereoBuffer::silence(100);
        mixer.crossfader_mut().set_position(100.0);
        mixer.process(&buffers, &mut master);

        // Deck A fades from -3 dB to silence across the tick
        assert!(master[0].left > 0.69 && master[0].left < 0.71);
        assert!(master[50].left > 0.3 && master[50].left < 0.4);
        assert!(master[99].left.abs() < 1e-6);

        mixer.process(&buffers, &mut master);
        assert!(master.iter().all(|s| s.left.abs() < 1e-6));
    }

    #[test]
    fn test_clip_indicator() {
        let mut mixer = Mixer::new(&MixerConfig {
            crossfader: 0.0,
            master_volume: 2.0,
        });
        let clip = mixer.clip_indicator();
        let buffers = [
            StereoBuffer::from_vec(vec![StereoSample::mono(0.9); 8]),
            StereoBuffer::silence(8),
        ];
        let mut master = StereoBuffer::silence(8);
        mixer.process(&buffers, &mut master);
        assert!(clip.load(Ordering::Relaxed));
    }
}
