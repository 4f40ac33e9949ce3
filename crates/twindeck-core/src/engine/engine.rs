//! Audio engine - the explicit context object that owns every component
//!
//! One `AudioEngine` is constructed per audio system and lives on the audio
//! thread. Each call to [`AudioEngine::process`] is one scheduling tick:
//!
//! 1. the sync settle window may hold both transports,
//! 2. each deck renders (looper wraps publish restarts, gate applies),
//! 3. sync measures slave drift against master restarts,
//! 4. the mixer crossfades into the master buffer,
//! 5. the recorder acts on restarts and taps the master buffer,
//! 6. the clock advances by the tick length.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use basedrop::Handle;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};

use crate::audio::MAX_BUFFER_SIZE;
use crate::clock::{AudioClock, ClockReader};
use crate::config::EngineConfig;
use crate::track::Track;
use crate::types::{DeckId, StereoBuffer, StereoSample, NUM_DECKS};

use super::command::EngineCommand;
use super::deck::{Deck, DeckAtomics};
use super::events::{LoopEventBus, Subscription, SubscriptionId};
use super::gc::Reclaimer;
use super::looper::LoopBoundaries;
use super::mixer::Mixer;
use super::recorder::{
    CaptureReservation, CaptureSink, CapturedAudio, MemorySink, RecordError, Recorder,
    RecorderAtomics, RecordingEvent, CAPTURE_QUEUE_CAPACITY,
};
use super::resample::InterpolationMethod;
use super::sync::{SyncAtomics, SyncEngine, SyncError, SyncRelationship};

/// Queue depth for engine and recording notifications
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Notifications about changes applied on the audio thread
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    TrackLoaded { deck: DeckId },
    TrackUnloaded { deck: DeckId },
    LoopChanged { deck: DeckId, boundaries: LoopBoundaries },
    SyncEnabled(SyncRelationship),
    SyncDisabled,
    MasterSwitched(SyncRelationship),
    MasterTempoChanged { bpm: f64, slave_rate: f64 },
    /// A queued command failed its precondition when it was applied
    Rejected { command: &'static str, reason: String },
}

/// The mixer core
pub struct AudioEngine {
    sample_rate: u32,
    clock: AudioClock,
    decks: [Deck; NUM_DECKS],
    /// Pre-allocated per-deck render buffers
    deck_buffers: [StereoBuffer; NUM_DECKS],
    mixer: Mixer,
    sync: SyncEngine,
    sync_atomics: Arc<SyncAtomics>,
    recorder: Recorder,
    recording_rx: Receiver<RecordingEvent>,
    /// Until [`AudioEngine::take_captures`] hands it out
    captures_rx: Option<Receiver<CapturedAudio>>,
    bus: LoopEventBus,
    events: Sender<EngineEvent>,
    events_rx: Receiver<EngineEvent>,
    /// Declared last: its final sweep must run after the decks dropped their tracks
    reclaimer: Reclaimer,
}

impl AudioEngine {
    /// Create an engine running at `sample_rate`
    ///
    /// Out-of-range configuration values are corrected, never rejected.
    pub fn new(config: &EngineConfig, sample_rate: u32) -> Self {
        let config = config.sanitized();
        let sample_rate = sample_rate.max(1);
        let reclaimer = Reclaimer::start().expect("Failed to spawn audio reclaimer thread");

        let mut bus = LoopEventBus::new();
        let mut decks = DeckId::ALL.map(|id| Deck::new(id, &config, sample_rate));
        for deck in &mut decks {
            let restarts = bus.subscribe(Some(deck.id()));
            deck.gate_mut().attach(restarts);
        }

        let (recording_tx, recording_rx) = channel::bounded(EVENT_QUEUE_CAPACITY);
        let (captures_tx, captures_rx) = channel::bounded(CAPTURE_QUEUE_CAPACITY);
        let recorder = Recorder::new(
            &config.recording,
            sample_rate,
            Box::new(MemorySink::new()),
            recording_tx,
            captures_tx,
            reclaimer.handle(),
        );
        let (events, events_rx) = channel::bounded(EVENT_QUEUE_CAPACITY);

        log::info!("Audio engine created at {} Hz", sample_rate);

        Self {
            sample_rate,
            clock: AudioClock::new(sample_rate),
            decks,
            deck_buffers: [
                StereoBuffer::with_capacity(MAX_BUFFER_SIZE),
                StereoBuffer::with_capacity(MAX_BUFFER_SIZE),
            ],
            mixer: Mixer::new(&config.mixer),
            sync: SyncEngine::new(&config.sync, sample_rate),
            sync_atomics: Arc::new(SyncAtomics::new()),
            recorder,
            recording_rx,
            captures_rx: Some(captures_rx),
            bus,
            events,
            events_rx,
            reclaimer,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn clock(&self) -> &AudioClock {
        &self.clock
    }

    pub fn clock_reader(&self) -> ClockReader {
        self.clock.reader()
    }

    /// Handle for wrapping decoded audio into a [`Track`]
    pub fn track_handle(&self) -> Handle {
        self.reclaimer.handle()
    }

    pub fn deck(&self, deck: DeckId) -> &Deck {
        &self.decks[deck.index()]
    }

    pub fn deck_atomics(&self) -> [Arc<DeckAtomics>; NUM_DECKS] {
        [self.decks[0].atomics(), self.decks[1].atomics()]
    }

    pub fn sync_atomics(&self) -> Arc<SyncAtomics> {
        Arc::clone(&self.sync_atomics)
    }

    pub fn recorder_atomics(&self) -> Arc<RecorderAtomics> {
        self.recorder.atomics()
    }

    pub fn clip_indicator(&self) -> Arc<AtomicBool> {
        self.mixer.clip_indicator()
    }

    pub fn mixer(&self) -> &Mixer {
        &self.mixer
    }

    pub fn sync(&self) -> &SyncEngine {
        &self.sync
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// Receiver for engine notifications (clones share one queue)
    pub fn engine_events(&self) -> Receiver<EngineEvent> {
        self.events_rx.clone()
    }

    /// Receiver for recording state and progress (clones share one queue)
    pub fn recording_events(&self) -> Receiver<RecordingEvent> {
        self.recording_rx.clone()
    }

    /// Receiver for finished captures
    ///
    /// Handed out once; afterwards the engine holds no reader of its own.
    pub fn take_captures(&mut self) -> Option<Receiver<CapturedAudio>> {
        self.captures_rx.take()
    }

    /// Observe loop restarts of one deck (or both with `None`)
    pub fn subscribe_restarts(&mut self, deck: Option<DeckId>) -> Subscription {
        self.bus.subscribe(deck)
    }

    pub fn unsubscribe_restarts(&mut self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    /// Replace the capture sink; refused while a recording is active
    pub fn set_capture_sink(&mut self, sink: Box<dyn CaptureSink>) -> bool {
        self.recorder.set_sink(sink)
    }

    // ─────────────────────────────────────────────────────────────
    // Track management
    // ─────────────────────────────────────────────────────────────

    /// Load a track on `deck`, returning the one it replaces
    ///
    /// A new track on either deck ends sync and cancels a recording that is
    /// still waiting on this deck.
    pub fn load_track(&mut self, deck: DeckId, track: Track) -> Option<Track> {
        self.end_sync_for_reload();
        self.cancel_pending_recording_on(deck);
        let previous = self.decks[deck.index()].load_track(track);
        self.emit(EngineEvent::TrackLoaded { deck });
        previous
    }

    pub fn unload_track(&mut self, deck: DeckId) -> Option<Track> {
        self.end_sync_for_reload();
        self.cancel_pending_recording_on(deck);
        let previous = self.decks[deck.index()].unload_track();
        self.emit(EngineEvent::TrackUnloaded { deck });
        previous
    }

    // ─────────────────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────────────────

    pub fn play(&mut self, deck: DeckId) -> bool {
        self.decks[deck.index()].play()
    }

    pub fn pause(&mut self, deck: DeckId) {
        self.decks[deck.index()].pause();
    }

    pub fn toggle_play(&mut self, deck: DeckId) {
        self.decks[deck.index()].toggle_play();
    }

    pub fn seek(&mut self, deck: DeckId, position: f64) {
        self.decks[deck.index()].seek(position);
    }

    /// Set a deck's varispeed rate
    ///
    /// Under sync the slave's rate belongs to the sync engine and the master's
    /// rate is a master tempo change.
    pub fn set_playback_rate(&mut self, deck: DeckId, rate: f64) -> Result<f64, SyncError> {
        match self.sync.relationship() {
            Some(relationship) if relationship.slave == deck => Err(SyncError::RateLocked(deck)),
            Some(relationship) if relationship.master == deck => {
                let bpm = self.decks[deck.index()].native_bpm() * rate;
                self.update_master_bpm(bpm)?;
                Ok(self.decks[deck.index()].playback_rate())
            }
            _ => Ok(self.decks[deck.index()].set_playback_rate(rate)),
        }
    }

    pub fn set_interpolation(&mut self, deck: DeckId, method: InterpolationMethod) {
        self.decks[deck.index()].set_interpolation(method);
    }

    // ─────────────────────────────────────────────────────────────
    // Looper
    // ─────────────────────────────────────────────────────────────

    pub fn set_loop(&mut self, deck: DeckId, start_bar: f64, length_bars: f64) -> LoopBoundaries {
        let boundaries = self.decks[deck.index()].set_loop(start_bar, length_bars);
        if boundaries.clamped {
            log::info!(
                "Deck {}: loop clamped to {:.3}+{:.3} bars",
                deck,
                boundaries.start_bar,
                boundaries.length_bars
            );
        }
        self.emit(EngineEvent::LoopChanged { deck, boundaries });
        boundaries
    }

    pub fn set_loop_enabled(&mut self, deck: DeckId, enabled: bool) {
        self.decks[deck.index()].set_loop_enabled(enabled);
    }

    pub fn loop_boundaries(&self, deck: DeckId) -> LoopBoundaries {
        self.decks[deck.index()].loop_boundaries()
    }

    // ─────────────────────────────────────────────────────────────
    // Sync
    // ─────────────────────────────────────────────────────────────

    pub fn enable_sync(&mut self, master: DeckId) -> Result<SyncRelationship, SyncError> {
        let result = self.sync.enable(master, &mut self.decks, &mut self.bus);
        self.sync_atomics.store(self.sync.relationship());
        let relationship = result?;
        self.emit(EngineEvent::SyncEnabled(relationship));
        Ok(relationship)
    }

    pub fn disable_sync(&mut self) -> Result<(), SyncError> {
        self.sync.disable(&mut self.decks, &mut self.bus)?;
        self.sync_atomics.store(None);
        self.emit(EngineEvent::SyncDisabled);
        Ok(())
    }

    pub fn switch_master(&mut self, master: DeckId) -> Result<SyncRelationship, SyncError> {
        let result = self.sync.switch_master(master, &mut self.decks, &mut self.bus);
        self.sync_atomics.store(self.sync.relationship());
        let relationship = result?;
        self.emit(EngineEvent::MasterSwitched(relationship));
        Ok(relationship)
    }

    /// Retempo the master; returns the slave's new rate
    pub fn update_master_bpm(&mut self, bpm: f64) -> Result<f64, SyncError> {
        let slave_rate = self.sync.update_master_bpm(bpm, &mut self.decks)?;
        let bpm = self
            .sync
            .master()
            .map_or(bpm, |master| self.decks[master.index()].effective_bpm());
        self.emit(EngineEvent::MasterTempoChanged { bpm, slave_rate });
        Ok(slave_rate)
    }

    // ─────────────────────────────────────────────────────────────
    // Gate
    // ─────────────────────────────────────────────────────────────

    /// Start a gate pattern on `deck`, phase-locked to its beat position now
    pub fn gate_start(&mut self, deck: DeckId, pattern: usize, bpm: f64) -> bool {
        let now = self.clock.frames();
        self.decks[deck.index()].start_gate(pattern, bpm, now)
    }

    pub fn gate_stop(&mut self, deck: DeckId) {
        self.decks[deck.index()].stop_gate();
    }

    pub fn gate_update_bpm(&mut self, deck: DeckId, bpm: f64) {
        let now = self.clock.frames();
        self.decks[deck.index()].gate_mut().update_bpm(bpm, now);
    }

    // ─────────────────────────────────────────────────────────────
    // Recording
    // ─────────────────────────────────────────────────────────────

    /// Deck whose loop restarts drive the recorder: the sync master, else deck A
    pub fn monitored_deck(&self) -> DeckId {
        self.sync.master().unwrap_or(DeckId::A)
    }

    /// Arm a recording, allocating its capture buffer on the calling thread
    ///
    /// Queued requests arrive with a buffer the controller already allocated.
    pub fn arm_recording(&mut self, bpm: f64, target_bars: Option<u32>) -> Result<(), RecordError> {
        let buffer = self.recorder.layout().buffer(bpm, target_bars)?;
        let buffer = CaptureReservation::new(&self.reclaimer.handle(), buffer);
        self.arm_recording_into(bpm, target_bars, buffer)
    }

    pub fn arm_recording_into(
        &mut self,
        bpm: f64,
        target_bars: Option<u32>,
        buffer: CaptureReservation,
    ) -> Result<(), RecordError> {
        let monitored = self.monitored_deck();
        self.recorder
            .arm(&self.decks[monitored.index()], bpm, target_bars, buffer, &mut self.bus)
    }

    pub fn cancel_recording(&mut self) -> bool {
        self.recorder.cancel(&mut self.bus)
    }

    /// Finalize a running capture, or cancel one that has not started
    pub fn stop_recording(&mut self) -> bool {
        self.recorder.stop(&mut self.bus)
    }

    // ─────────────────────────────────────────────────────────────
    // Mixer
    // ─────────────────────────────────────────────────────────────

    pub fn set_crossfader(&mut self, position: f32) {
        self.mixer.crossfader_mut().set_position(position);
    }

    pub fn set_volume(&mut self, deck: DeckId, volume: f32) {
        self.mixer.channel_mut(deck).set_volume(volume);
    }

    pub fn set_trim(&mut self, deck: DeckId, db: f32) {
        self.mixer.channel_mut(deck).set_trim_db(db);
    }

    pub fn set_master_volume(&mut self, volume: f32) {
        self.mixer.set_master_volume(volume);
    }

    // ─────────────────────────────────────────────────────────────
    // Processing
    // ─────────────────────────────────────────────────────────────

    /// Apply every queued command
    pub fn process_commands(&mut self, commands: &mut rtrb::Consumer<EngineCommand>) {
        while let Ok(command) = commands.pop() {
            self.apply(command);
        }
    }

    /// Apply one command, reporting failed preconditions as [`EngineEvent::Rejected`]
    pub fn apply(&mut self, command: EngineCommand) {
        let name = command.name();
        let result: Result<(), String> = match command {
            EngineCommand::LoadTrack { deck, track } => {
                // The replaced track is reclaimed off this thread
                drop(self.load_track(deck, track));
                Ok(())
            }
            EngineCommand::UnloadTrack { deck } => {
                drop(self.unload_track(deck));
                Ok(())
            }
            EngineCommand::Play { deck } => {
                if self.play(deck) {
                    Ok(())
                } else {
                    Err(format!("deck {} has nothing to play", deck))
                }
            }
            EngineCommand::Pause { deck } => {
                self.pause(deck);
                Ok(())
            }
            EngineCommand::TogglePlay { deck } => {
                self.toggle_play(deck);
                Ok(())
            }
            EngineCommand::Seek { deck, position } => {
                self.seek(deck, position);
                Ok(())
            }
            EngineCommand::SetPlaybackRate { deck, rate } => {
                self.set_playback_rate(deck, rate).map(drop).map_err(|e| e.to_string())
            }
            EngineCommand::SetInterpolation { deck, method } => {
                self.set_interpolation(deck, method);
                Ok(())
            }
            EngineCommand::SetLoop {
                deck,
                start_bar,
                length_bars,
            } => {
                self.set_loop(deck, start_bar, length_bars);
                Ok(())
            }
            EngineCommand::SetLoopEnabled { deck, enabled } => {
                self.set_loop_enabled(deck, enabled);
                Ok(())
            }
            EngineCommand::EnableSync { master } => self.enable_sync(master).map(drop).map_err(|e| e.to_string()),
            EngineCommand::DisableSync => self.disable_sync().map_err(|e| e.to_string()),
            EngineCommand::SwitchMaster { master } => {
                self.switch_master(master).map(drop).map_err(|e| e.to_string())
            }
            EngineCommand::UpdateMasterBpm(bpm) => {
                self.update_master_bpm(bpm).map(drop).map_err(|e| e.to_string())
            }
            EngineCommand::GateStart { deck, pattern, bpm } => {
                if self.gate_start(deck, pattern, bpm) {
                    Ok(())
                } else {
                    Err(format!("gate pattern {} at {} BPM is not playable", pattern, bpm))
                }
            }
            EngineCommand::GateStop { deck } => {
                self.gate_stop(deck);
                Ok(())
            }
            EngineCommand::GateUpdateBpm { deck, bpm } => {
                self.gate_update_bpm(deck, bpm);
                Ok(())
            }
            EngineCommand::ArmRecording {
                bpm,
                target_bars,
                buffer,
            } => self
                .arm_recording_into(bpm, target_bars, buffer)
                .map_err(|e| e.to_string()),
            EngineCommand::CancelRecording => {
                self.cancel_recording();
                Ok(())
            }
            EngineCommand::StopRecording => {
                self.stop_recording();
                Ok(())
            }
            EngineCommand::SetCrossfader { position } => {
                self.set_crossfader(position);
                Ok(())
            }
            EngineCommand::SetVolume { deck, volume } => {
                self.set_volume(deck, volume);
                Ok(())
            }
            EngineCommand::SetTrim { deck, db } => {
                self.set_trim(deck, db);
                Ok(())
            }
            EngineCommand::SetMasterVolume(volume) => {
                self.set_master_volume(volume);
                Ok(())
            }
        };

        if let Err(reason) = result {
            log::warn!("Command {} rejected: {}", name, reason);
            self.emit(EngineEvent::Rejected { command: name, reason });
        }
    }

    /// Render one tick into `master_out`
    ///
    /// The tick length is `master_out.len()`, capped at [`MAX_BUFFER_SIZE`].
    pub fn process(&mut self, master_out: &mut StereoBuffer) {
        let n = master_out.len().min(MAX_BUFFER_SIZE);
        master_out.set_len_from_capacity(n);
        let tick_start = self.clock.frames();

        let hold = self.sync.hold_transport(n);
        for (deck, buffer) in self.decks.iter_mut().zip(self.deck_buffers.iter_mut()) {
            buffer.set_len_from_capacity(n);
            if hold {
                buffer.fill_silence();
            } else {
                deck.process(buffer, tick_start, &mut self.bus);
            }
        }

        self.sync.on_tick(&mut self.decks, tick_start + n as u64);
        self.mixer.process(&self.deck_buffers, master_out);
        self.recorder
            .on_tick(tick_start, master_out.as_slice(), &self.decks, &mut self.bus);
        self.clock.advance(n);
    }

    /// Run the engine for `frames` frames in ticks of `block` and return the output
    pub fn render_offline(&mut self, frames: usize, block: usize) -> Vec<StereoSample> {
        let mut rendered = Vec::with_capacity(frames);
        self.run_blocks(frames, block, |out| rendered.extend_from_slice(out));
        rendered
    }

    /// Run the engine for `frames` frames in ticks of `block`, discarding the output
    pub fn advance(&mut self, frames: usize, block: usize) {
        self.run_blocks(frames, block, |_| {});
    }

    fn run_blocks(&mut self, frames: usize, block: usize, mut sink: impl FnMut(&[StereoSample])) {
        let block = block.clamp(1, MAX_BUFFER_SIZE);
        let mut master = StereoBuffer::with_capacity(block);
        let mut remaining = frames;
        while remaining > 0 {
            let n = remaining.min(block);
            master.set_len_from_capacity(n);
            self.process(&mut master);
            sink(master.as_slice());
            remaining -= n;
        }
    }

    /// Stop everything and release subscriptions and tracks
    pub fn shutdown(&mut self) {
        self.recorder.cancel(&mut self.bus);
        self.sync.teardown(&mut self.decks, &mut self.bus);
        self.sync_atomics.store(None);
        for deck in &mut self.decks {
            deck.gate_mut().dispose(&mut self.bus);
            drop(deck.unload_track());
        }
        self.reclaimer.shutdown();
        log::info!("Audio engine shut down at clock {:.3}s", self.clock.now());
    }

    fn end_sync_for_reload(&mut self) {
        if self.sync.is_active() {
            self.sync.teardown(&mut self.decks, &mut self.bus);
            self.sync_atomics.store(None);
            self.emit(EngineEvent::SyncDisabled);
        }
    }

    fn cancel_pending_recording_on(&mut self, deck: DeckId) {
        let waiting_on_deck = self
            .recorder
            .session()
            .is_some_and(|session| session.monitored == deck && session.start_clock_frame.is_none());
        if waiting_on_deck {
            log::info!("Deck {} changed track before capture started", deck);
            self.recorder.cancel(&mut self.bus);
        }
    }

    fn emit(&self, event: EngineEvent) {
        match self.events.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => log::debug!("Engine event queue full, event dropped"),
        }
    }
}
