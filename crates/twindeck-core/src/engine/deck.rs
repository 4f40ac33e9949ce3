//! Deck - one track player with its looper and gate

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::track::{Track, TrackKind};
use crate::types::{seconds_per_bar, DeckId, PlayState, StereoBuffer, BEATS_PER_BAR};

use super::events::{LoopEventBus, LoopRestart};
use super::gate::GateEffect;
use super::looper::{LoopBoundaries, LoopRegion, PreciseLooper};
use super::resample::{read_interpolated, InterpolationMethod};

/// Slowest playback rate a deck accepts
pub const MIN_PLAYBACK_RATE: f64 = 0.25;
/// Fastest playback rate a deck accepts
pub const MAX_PLAYBACK_RATE: f64 = 4.0;

const NO_GATE: u8 = u8::MAX;

#[inline]
fn load_f64(atomic: &AtomicU64) -> f64 {
    f64::from_bits(atomic.load(Ordering::Relaxed))
}

#[inline]
fn store_f64(atomic: &AtomicU64, value: f64) {
    atomic.store(value.to_bits(), Ordering::Relaxed);
}

/// Lock-free deck state for UI and controller threads
///
/// The audio thread writes these after every tick and after every command;
/// readers only need visibility, so everything is `Ordering::Relaxed`.
/// Floats are stored as their bit patterns.
pub struct DeckAtomics {
    position: AtomicU64,
    state: AtomicU8,
    loaded: AtomicBool,
    loop_source: AtomicBool,
    track_sample_rate: AtomicU32,
    native_bpm: AtomicU64,
    playback_rate: AtomicU64,
    frames_per_bar: AtomicU64,
    loop_enabled: AtomicBool,
    loop_start_bar: AtomicU64,
    loop_length_bars: AtomicU64,
    loop_start_frame: AtomicU64,
    loop_end_frame: AtomicU64,
    loop_clamped: AtomicBool,
    loop_pending: AtomicBool,
    loop_cycle: AtomicU64,
    gate_pattern: AtomicU8,
}

impl DeckAtomics {
    pub fn new() -> Self {
        Self {
            position: AtomicU64::new(0f64.to_bits()),
            state: AtomicU8::new(0),
            loaded: AtomicBool::new(false),
            loop_source: AtomicBool::new(false),
            track_sample_rate: AtomicU32::new(0),
            native_bpm: AtomicU64::new(0f64.to_bits()),
            playback_rate: AtomicU64::new(1f64.to_bits()),
            frames_per_bar: AtomicU64::new(0f64.to_bits()),
            loop_enabled: AtomicBool::new(false),
            loop_start_bar: AtomicU64::new(0f64.to_bits()),
            loop_length_bars: AtomicU64::new(0f64.to_bits()),
            loop_start_frame: AtomicU64::new(0f64.to_bits()),
            loop_end_frame: AtomicU64::new(0f64.to_bits()),
            loop_clamped: AtomicBool::new(false),
            loop_pending: AtomicBool::new(false),
            loop_cycle: AtomicU64::new(0),
            gate_pattern: AtomicU8::new(NO_GATE),
        }
    }

    /// Playhead in source frames
    #[inline]
    pub fn position(&self) -> f64 {
        load_f64(&self.position)
    }

    #[inline]
    pub fn is_playing(&self) -> bool {
        self.state.load(Ordering::Relaxed) == 1
    }

    pub fn play_state(&self) -> PlayState {
        match self.state.load(Ordering::Relaxed) {
            1 => PlayState::Playing,
            _ => PlayState::Stopped,
        }
    }

    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Relaxed)
    }

    /// Loaded track is loop-quantized material with a known tempo
    #[inline]
    pub fn is_loop_source(&self) -> bool {
        self.loop_source.load(Ordering::Relaxed)
    }

    pub fn native_bpm(&self) -> f64 {
        load_f64(&self.native_bpm)
    }

    pub fn playback_rate(&self) -> f64 {
        load_f64(&self.playback_rate)
    }

    pub fn effective_bpm(&self) -> f64 {
        self.native_bpm() * self.playback_rate()
    }

    /// Playhead in bars from the start of the track (0 without a tempo)
    pub fn position_bars(&self) -> f64 {
        let fpb = load_f64(&self.frames_per_bar);
        if fpb > 0.0 {
            self.position() / fpb
        } else {
            0.0
        }
    }

    /// Playhead in seconds of source audio
    pub fn position_seconds(&self) -> f64 {
        match self.track_sample_rate.load(Ordering::Relaxed) {
            0 => 0.0,
            rate => self.position() / rate as f64,
        }
    }

    pub fn loop_enabled(&self) -> bool {
        self.loop_enabled.load(Ordering::Relaxed)
    }

    pub fn loop_region(&self) -> LoopRegion {
        LoopRegion::new(load_f64(&self.loop_start_bar), load_f64(&self.loop_length_bars))
    }

    /// Active loop boundaries at the current effective tempo
    pub fn loop_boundaries(&self) -> LoopBoundaries {
        let region = self.loop_region();
        let bpm = self.effective_bpm();
        let spb = if bpm > 0.0 { seconds_per_bar(bpm) } else { 0.0 };
        LoopBoundaries {
            start_bar: region.start_bar,
            length_bars: region.length_bars,
            start_frame: load_f64(&self.loop_start_frame),
            end_frame: load_f64(&self.loop_end_frame),
            start_seconds: region.start_bar * spb,
            end_seconds: region.end_bar() * spb,
            clamped: self.loop_clamped.load(Ordering::Relaxed),
            pending: self.loop_pending.load(Ordering::Relaxed),
        }
    }

    /// Restarts since the track was loaded
    pub fn loop_cycle(&self) -> u64 {
        self.loop_cycle.load(Ordering::Relaxed)
    }

    pub fn gate_pattern(&self) -> Option<usize> {
        match self.gate_pattern.load(Ordering::Relaxed) {
            NO_GATE => None,
            index => Some(index as usize),
        }
    }

    /// Consistent-enough copy of everything above for display
    pub fn snapshot(&self) -> DeckSnapshot {
        DeckSnapshot {
            state: self.play_state(),
            loaded: self.is_loaded(),
            position_frames: self.position(),
            position_seconds: self.position_seconds(),
            position_bars: self.position_bars(),
            native_bpm: self.native_bpm(),
            playback_rate: self.playback_rate(),
            loop_enabled: self.loop_enabled(),
            loop_region: self.loop_region(),
            loop_cycle: self.loop_cycle(),
            gate_pattern: self.gate_pattern(),
        }
    }
}

impl Default for DeckAtomics {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only copy of a deck's state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeckSnapshot {
    pub state: PlayState,
    pub loaded: bool,
    pub position_frames: f64,
    pub position_seconds: f64,
    pub position_bars: f64,
    pub native_bpm: f64,
    pub playback_rate: f64,
    pub loop_enabled: bool,
    pub loop_region: LoopRegion,
    pub loop_cycle: u64,
    pub gate_pattern: Option<usize>,
}

/// A single deck
pub struct Deck {
    id: DeckId,
    track: Option<Track>,
    /// Playhead in source frames (fractional under varispeed)
    position: f64,
    state: PlayState,
    playback_rate: f64,
    looper: PreciseLooper,
    gate: GateEffect,
    interpolation: InterpolationMethod,
    sample_rate: u32,
    atomics: Arc<DeckAtomics>,
}

impl Deck {
    pub fn new(id: DeckId, config: &EngineConfig, sample_rate: u32) -> Self {
        let deck = Self {
            id,
            track: None,
            position: 0.0,
            state: PlayState::Stopped,
            playback_rate: 1.0,
            looper: PreciseLooper::new(&config.looper),
            gate: GateEffect::new(&config.gate, sample_rate),
            interpolation: config.looper.interpolation,
            sample_rate: sample_rate.max(1),
            atomics: Arc::new(DeckAtomics::new()),
        };
        deck.sync_atomics();
        deck
    }

    pub fn id(&self) -> DeckId {
        self.id
    }

    pub fn atomics(&self) -> Arc<DeckAtomics> {
        Arc::clone(&self.atomics)
    }

    /// Load a track, replacing any previous one
    ///
    /// The playhead returns to 0, the deck stops, the rate resets to 1.0 and
    /// the gate stops. The previous track is returned so the caller decides
    /// where it is dropped.
    pub fn load_track(&mut self, track: Track) -> Option<Track> {
        log::info!(
            "Deck {}: loading '{}' ({:.2} BPM, {:.2}s)",
            self.id,
            track.name(),
            track.bpm(),
            track.duration_seconds()
        );
        self.position = 0.0;
        self.state = PlayState::Stopped;
        self.playback_rate = 1.0;
        self.looper.attach(
            track.frames_per_bar().unwrap_or(0.0),
            track.duration_frames() as f64,
            0.0,
        );
        self.gate.stop();
        let previous = self.track.replace(track);
        self.sync_atomics();
        previous
    }

    pub fn unload_track(&mut self) -> Option<Track> {
        let previous = self.track.take();
        if previous.is_some() {
            log::info!("Deck {}: unloaded", self.id);
        }
        self.position = 0.0;
        self.state = PlayState::Stopped;
        self.playback_rate = 1.0;
        self.looper.detach();
        self.gate.stop();
        self.sync_atomics();
        previous
    }

    pub fn track(&self) -> Option<&Track> {
        self.track.as_ref()
    }

    pub fn has_track(&self) -> bool {
        self.track.is_some()
    }

    /// Loop-quantized material with a usable tempo
    pub fn is_loop_source(&self) -> bool {
        self.track
            .as_ref()
            .is_some_and(|t| t.kind() == TrackKind::Loop && t.has_tempo())
    }

    pub fn state(&self) -> PlayState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state == PlayState::Playing
    }

    /// Start playback; returns false when there is nothing to play
    pub fn play(&mut self) -> bool {
        let Some(track) = &self.track else {
            log::warn!("Deck {}: play ignored, no track loaded", self.id);
            return false;
        };
        if self.position >= track.duration_frames() as f64 && !self.looper.is_enabled() {
            log::debug!("Deck {}: play ignored, playhead is at the end", self.id);
            return false;
        }
        if self.state != PlayState::Playing {
            self.state = PlayState::Playing;
            log::info!("Deck {}: play", self.id);
            self.sync_atomics();
        }
        true
    }

    pub fn pause(&mut self) {
        if self.state == PlayState::Playing {
            self.state = PlayState::Stopped;
            log::info!("Deck {}: pause", self.id);
            self.sync_atomics();
        }
    }

    pub fn toggle_play(&mut self) {
        if self.is_playing() {
            self.pause();
        } else {
            self.play();
        }
    }

    /// Playhead in source frames
    pub fn position(&self) -> f64 {
        self.position
    }

    /// Playhead in bars from the start of the track
    pub fn position_bars(&self) -> Option<f64> {
        let fpb = self.track.as_ref()?.frames_per_bar()?;
        Some(self.position / fpb)
    }

    /// Move the playhead to `position` source frames, clamped to the track
    pub fn seek(&mut self, position: f64) {
        let Some(track) = &self.track else {
            return;
        };
        let duration = track.duration_frames() as f64;
        self.position = if position.is_finite() { position.clamp(0.0, duration) } else { 0.0 };
        self.looper.reposition(self.position);
        self.sync_atomics();
    }

    /// Move the playhead to a bar position
    pub fn seek_bars(&mut self, bars: f64) {
        if let Some(fpb) = self.track.as_ref().and_then(|t| t.frames_per_bar()) {
            self.seek(bars * fpb);
        }
    }

    pub fn playback_rate(&self) -> f64 {
        self.playback_rate
    }

    /// Set the varispeed rate, clamped to the supported range; returns the applied rate
    pub fn set_playback_rate(&mut self, rate: f64) -> f64 {
        let rate = if rate.is_finite() {
            rate.clamp(MIN_PLAYBACK_RATE, MAX_PLAYBACK_RATE)
        } else {
            1.0
        };
        self.playback_rate = rate;
        self.atomics.playback_rate.store(rate.to_bits(), Ordering::Relaxed);
        rate
    }

    /// Native tempo of the loaded track (0 without one)
    pub fn native_bpm(&self) -> f64 {
        self.track.as_ref().filter(|t| t.has_tempo()).map_or(0.0, |t| t.bpm())
    }

    /// Tempo heard at the current rate
    pub fn effective_bpm(&self) -> f64 {
        self.native_bpm() * self.playback_rate
    }

    /// Source frames consumed per output frame
    pub fn step(&self) -> f64 {
        match &self.track {
            Some(track) => self.playback_rate * track.sample_rate() as f64 / self.sample_rate as f64,
            None => 0.0,
        }
    }

    pub fn set_interpolation(&mut self, method: InterpolationMethod) {
        self.interpolation = method;
    }

    pub fn looper(&self) -> &PreciseLooper {
        &self.looper
    }

    pub fn set_loop(&mut self, start_bar: f64, length_bars: f64) -> LoopBoundaries {
        let boundaries = self.looper.set_loop(start_bar, length_bars, self.effective_bpm());
        self.sync_atomics();
        boundaries
    }

    pub fn set_loop_enabled(&mut self, enabled: bool) {
        self.looper.set_enabled(enabled, self.position);
        log::info!(
            "Deck {}: loop {}",
            self.id,
            if enabled { "enabled" } else { "disabled" }
        );
        self.sync_atomics();
    }

    pub fn loop_boundaries(&self) -> LoopBoundaries {
        self.looper.boundaries(self.effective_bpm())
    }

    pub fn gate(&self) -> &GateEffect {
        &self.gate
    }

    pub fn gate_mut(&mut self) -> &mut GateEffect {
        &mut self.gate
    }

    /// Start the gate phase-locked to this deck's beat position at `clock_frame`
    pub fn start_gate(&mut self, pattern: usize, bpm: f64, clock_frame: u64) -> bool {
        let beats = self.position_bars().unwrap_or(0.0) * BEATS_PER_BAR;
        let started = self.gate.start(pattern, bpm, clock_frame, beats);
        self.sync_atomics();
        started
    }

    pub fn stop_gate(&mut self) {
        self.gate.stop();
        self.sync_atomics();
    }

    /// Render one tick into `output`
    ///
    /// `tick_start` is the clock frame of `output[0]`. Loop wraps are
    /// published on `bus` as they happen, stamped with the clock frame of
    /// the first frame of the new cycle.
    pub fn process(&mut self, output: &mut StereoBuffer, tick_start: u64, bus: &mut LoopEventBus) {
        let out = output.as_mut_slice();

        match &self.track {
            Some(track) if self.state == PlayState::Playing => {
                let frames = track.frames();
                let duration = frames.len() as f64;
                let step = self.playback_rate * track.sample_rate() as f64 / self.sample_rate as f64;
                let mut ended_at = None;

                for (i, frame) in out.iter_mut().enumerate() {
                    *frame = read_interpolated(frames, self.position, self.interpolation);
                    self.position += step;

                    if let Some(wrap) = self.looper.advance(self.position, step) {
                        self.position = wrap.position;
                        let clock_frame = tick_start + i as u64 + 1;
                        log::debug!("Deck {}: loop restart #{} at frame {}", self.id, wrap.cycle, clock_frame);
                        bus.publish(LoopRestart {
                            deck: self.id,
                            cycle: wrap.cycle,
                            clock_frame,
                            clock_time: clock_frame as f64 / self.sample_rate as f64,
                            late_frames: wrap.late_frames,
                        });
                    } else if self.position >= duration {
                        self.position = duration;
                        ended_at = Some(i + 1);
                        break;
                    }
                }

                if let Some(end) = ended_at {
                    out[end..].iter_mut().for_each(|s| *s = Default::default());
                    self.state = PlayState::Stopped;
                    log::info!("Deck {}: reached end of track", self.id);
                }
            }
            _ => out.iter_mut().for_each(|s| *s = Default::default()),
        }

        self.gate.process(out, tick_start);
        self.sync_atomics();
    }

    fn sync_atomics(&self) {
        let a = &self.atomics;
        store_f64(&a.position, self.position);
        a.state.store(
            match self.state {
                PlayState::Stopped => 0,
                PlayState::Playing => 1,
            },
            Ordering::Relaxed,
        );
        a.loaded.store(self.track.is_some(), Ordering::Relaxed);
        a.loop_source.store(self.is_loop_source(), Ordering::Relaxed);
        a.track_sample_rate.store(
            self.track.as_ref().map_or(0, |t| t.sample_rate()),
            Ordering::Relaxed,
        );
        store_f64(&a.native_bpm, self.native_bpm());
        store_f64(&a.playback_rate, self.playback_rate);
        store_f64(
            &a.frames_per_bar,
            self.track.as_ref().and_then(|t| t.frames_per_bar()).unwrap_or(0.0),
        );
        let boundaries = self.looper.boundaries(self.effective_bpm());
        a.loop_enabled.store(self.looper.is_enabled(), Ordering::Relaxed);
        store_f64(&a.loop_start_bar, boundaries.start_bar);
        store_f64(&a.loop_length_bars, boundaries.length_bars);
        store_f64(&a.loop_start_frame, boundaries.start_frame);
        store_f64(&a.loop_end_frame, boundaries.end_frame);
        a.loop_clamped.store(boundaries.clamped, Ordering::Relaxed);
        a.loop_pending.store(self.looper.pending_region().is_some(), Ordering::Relaxed);
        a.loop_cycle.store(self.looper.cycle(), Ordering::Relaxed);
        a.gate_pattern.store(
            self.gate.pattern().map_or(NO_GATE, |p| p as u8),
            Ordering::Relaxed,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Reclaimer;
    use crate::track::TrackData;
    use crate::types::StereoSample;

    const SR: u32 = 8000;

    /// Track whose frame `i` holds the value `i`, so reads reveal the playhead
    fn ramp_track(reclaimer: &Reclaimer, bars: f64, bpm: f64, sample_rate: u32) -> Track {
        let frames = (bars * crate::types::frames_per_bar(bpm, sample_rate)) as usize;
        let data = (0..frames).map(|i| StereoSample::mono(i as f32)).collect();
        Track::new(&reclaimer.handle(), TrackData::new("ramp", data, sample_rate, bpm, TrackKind::Loop))
    }

    fn render(deck: &mut Deck, bus: &mut LoopEventBus, clock: &mut u64, frames: usize) -> Vec<StereoSample> {
        let mut rendered = Vec::with_capacity(frames);
        let mut buffer = StereoBuffer::with_capacity(512);
        let mut remaining = frames;
        while remaining > 0 {
            let n = remaining.min(512);
            buffer.set_len_from_capacity(n);
            deck.process(&mut buffer, *clock, bus);
            rendered.extend_from_slice(buffer.as_slice());
            *clock += n as u64;
            remaining -= n;
        }
        rendered
    }

    fn new_deck() -> Deck {
        Deck::new(DeckId::A, &EngineConfig::default(), SR)
    }

    #[test]
    fn test_play_requires_track() {
        let mut deck = new_deck();
        assert!(!deck.play());
        assert_eq!(deck.state(), PlayState::Stopped);
        assert!(!deck.atomics().is_loaded());
    }

    #[test]
    fn test_eight_bar_loop_restarts_once_in_sixteen_seconds() {
        let reclaimer = Reclaimer::start().unwrap();
        let mut deck = new_deck();
        let mut bus = LoopEventBus::new();
        let restarts = bus.subscribe(None);
        let mut clock = 0;

        deck.load_track(ramp_track(&reclaimer, 16.0, 120.0, SR));
        let boundaries = deck.set_loop(0.0, 8.0);
        assert!((boundaries.end_seconds - 16.0).abs() < 1e-9);
        deck.set_loop_enabled(true);
        deck.play();

        render(&mut deck, &mut bus, &mut clock, 16 * SR as usize);
        let events: Vec<LoopRestart> = restarts.drain().collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].cycle, 1);
        assert_eq!(events[0].clock_frame, 16 * SR as u64);
        assert!((events[0].clock_time - 16.0).abs() < 1e-9);
    }

    #[test]
    fn test_wrap_is_seamless() {
        let reclaimer = Reclaimer::start().unwrap();
        let mut deck = new_deck();
        let mut bus = LoopEventBus::new();
        let mut clock = 0;

        // 120 BPM at 8 kHz: one bar = 16000 frames
        deck.load_track(ramp_track(&reclaimer, 8.0, 120.0, SR));
        deck.set_loop(1.0, 1.0);
        deck.seek_bars(1.0);
        deck.set_loop_enabled(true);
        deck.play();

        let audio = render(&mut deck, &mut bus, &mut clock, 40000);
        assert_eq!(audio[15999].left, 31999.0);
        assert_eq!(audio[16000].left, 16000.0);
        assert_eq!(audio[32000].left, 16000.0);
        assert_eq!(deck.atomics().loop_cycle(), 2);
    }

    #[test]
    fn test_playback_stops_at_track_end_without_loop() {
        let reclaimer = Reclaimer::start().unwrap();
        let mut deck = new_deck();
        let mut bus = LoopEventBus::new();
        let mut clock = 0;

        deck.load_track(ramp_track(&reclaimer, 0.25, 120.0, SR));
        deck.play();
        let audio = render(&mut deck, &mut bus, &mut clock, 5000);

        assert_eq!(deck.state(), PlayState::Stopped);
        assert_eq!(audio[3999].left, 3999.0);
        assert!(audio[4000..].iter().all(|s| *s == StereoSample::silence()));
        assert!(!deck.play());
    }

    #[test]
    fn test_track_sample_rate_is_compensated() {
        let reclaimer = Reclaimer::start().unwrap();
        let mut deck = new_deck();
        let mut bus = LoopEventBus::new();
        let mut clock = 0;

        deck.load_track(ramp_track(&reclaimer, 2.0, 120.0, SR * 2));
        deck.play();
        let audio = render(&mut deck, &mut bus, &mut clock, 100);
        assert_eq!(audio[10].left, 20.0);
        assert!((deck.step() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_rate_is_clamped() {
        let mut deck = new_deck();
        assert_eq!(deck.set_playback_rate(10.0), MAX_PLAYBACK_RATE);
        assert_eq!(deck.set_playback_rate(0.0), MIN_PLAYBACK_RATE);
        assert_eq!(deck.set_playback_rate(f64::NAN), 1.0);
        assert_eq!(deck.atomics().playback_rate(), 1.0);
    }

    #[test]
    fn test_load_resets_transport() {
        let reclaimer = Reclaimer::start().unwrap();
        let mut deck = new_deck();
        deck.load_track(ramp_track(&reclaimer, 4.0, 100.0, SR));
        deck.set_playback_rate(1.2);
        deck.seek(1000.0);
        deck.play();

        let previous = deck.load_track(ramp_track(&reclaimer, 4.0, 90.0, SR));
        assert!(previous.is_some());
        assert_eq!(deck.playback_rate(), 1.0);
        assert_eq!(deck.position(), 0.0);
        assert_eq!(deck.state(), PlayState::Stopped);
        assert_eq!(deck.atomics().native_bpm(), 90.0);
    }

    #[test]
    fn test_snapshot_reflects_loop_state() {
        let reclaimer = Reclaimer::start().unwrap();
        let mut deck = new_deck();
        deck.load_track(ramp_track(&reclaimer, 8.0, 120.0, SR));
        deck.set_loop(2.0, 2.0);
        deck.set_loop_enabled(true);
        deck.seek_bars(3.0);

        let snapshot = deck.atomics().snapshot();
        assert!(snapshot.loaded);
        assert!(snapshot.loop_enabled);
        assert_eq!(snapshot.loop_region, LoopRegion::new(2.0, 2.0));
        assert!((snapshot.position_bars - 3.0).abs() < 1e-12);
        assert!((snapshot.position_seconds - 6.0).abs() < 1e-12);

        let boundaries = deck.atomics().loop_boundaries();
        assert_eq!(boundaries, deck.loop_boundaries());
        assert_eq!(boundaries.start_frame, 32000.0);
        assert!((boundaries.end_seconds - 8.0).abs() < 1e-12);
    }
}
