//! UI-facing control surface
//!
//! `MixerController` is the only thing a UI thread needs: it pushes
//! [`EngineCommand`]s into the lock-free queue and reads engine state back
//! through atomics. Preconditions that can be checked from the atomics
//! (sync while playing, unloaded decks, a recording already running) are
//! rejected synchronously with an `Err`; anything that only fails once the
//! audio thread applies it is reported as an `EngineEvent::Rejected`.

use std::sync::Arc;

use basedrop::Handle;
use thiserror::Error;

use crate::clock::ClockReader;
use crate::engine::{
    AudioEngine, CaptureLayout, CaptureReservation, DeckAtomics, DeckSnapshot, EngineCommand,
    InterpolationMethod, LoopBoundaries, RecordError, RecorderAtomics, RecordingState,
    SyncAtomics, SyncError, GATE_PATTERNS, MAX_BPM, MIN_BPM,
};
use crate::track::{Track, TrackData};
use crate::types::{DeckId, NUM_DECKS};

/// Why a control request was refused
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ControlError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error("deck {0} has no track loaded")]
    DeckNotLoaded(DeckId),

    #[error("invalid tempo {0}")]
    InvalidBpm(f64),

    #[error("gate pattern {0} does not exist")]
    UnknownPattern(usize),

    #[error("command queue is full")]
    QueueFull,
}

pub type ControlResult<T> = Result<T, ControlError>;

/// Command sender plus read-only engine state
pub struct MixerController {
    commands: rtrb::Producer<EngineCommand>,
    decks: [Arc<DeckAtomics>; NUM_DECKS],
    sync: Arc<SyncAtomics>,
    recorder: Arc<RecorderAtomics>,
    clock: ClockReader,
    /// Deferred-drop handle for tracks and capture buffers
    handle: Handle,
    capture_layout: CaptureLayout,
}

impl MixerController {
    /// Wire a controller to `engine` before the engine moves to the audio thread
    pub fn new(commands: rtrb::Producer<EngineCommand>, engine: &AudioEngine) -> Self {
        Self {
            commands,
            decks: engine.deck_atomics(),
            sync: engine.sync_atomics(),
            recorder: engine.recorder_atomics(),
            clock: engine.clock_reader(),
            handle: engine.track_handle(),
            capture_layout: engine.recorder().layout(),
        }
    }

    // ─────────────────────────────────────────────────────────────
    // State
    // ─────────────────────────────────────────────────────────────

    pub fn deck(&self, deck: DeckId) -> &DeckAtomics {
        &self.decks[deck.index()]
    }

    pub fn snapshot(&self, deck: DeckId) -> DeckSnapshot {
        self.decks[deck.index()].snapshot()
    }

    pub fn clock(&self) -> &ClockReader {
        &self.clock
    }

    pub fn is_sync_active(&self) -> bool {
        self.sync.is_active()
    }

    pub fn sync_master(&self) -> Option<DeckId> {
        self.sync.master()
    }

    pub fn recording_state(&self) -> RecordingState {
        self.recorder.state()
    }

    pub fn bars_recorded(&self) -> f64 {
        self.recorder.bars_recorded()
    }

    /// Whether the command queue has room
    pub fn has_space(&self) -> bool {
        self.commands.slots() > 0
    }

    // ─────────────────────────────────────────────────────────────
    // Tracks and transport
    // ─────────────────────────────────────────────────────────────

    /// Hand decoded audio to `deck`
    pub fn load_track(&mut self, deck: DeckId, data: TrackData) -> ControlResult<()> {
        log::info!("Loading '{}' on deck {}", data.name, deck);
        let track = Track::new(&self.handle, data);
        self.send(EngineCommand::LoadTrack { deck, track })
    }

    pub fn unload_track(&mut self, deck: DeckId) -> ControlResult<()> {
        self.send(EngineCommand::UnloadTrack { deck })
    }

    pub fn play(&mut self, deck: DeckId) -> ControlResult<()> {
        self.require_loaded(deck)?;
        self.send(EngineCommand::Play { deck })
    }

    pub fn pause(&mut self, deck: DeckId) -> ControlResult<()> {
        self.send(EngineCommand::Pause { deck })
    }

    pub fn toggle_play(&mut self, deck: DeckId) -> ControlResult<()> {
        self.require_loaded(deck)?;
        self.send(EngineCommand::TogglePlay { deck })
    }

    /// Move the playhead to `position` source frames
    pub fn seek(&mut self, deck: DeckId, position: f64) -> ControlResult<()> {
        self.require_loaded(deck)?;
        self.send(EngineCommand::Seek { deck, position })
    }

    /// Varispeed a deck; the sync slave's rate cannot be set directly
    pub fn set_playback_rate(&mut self, deck: DeckId, rate: f64) -> ControlResult<()> {
        if self.sync.slave() == Some(deck) {
            log::warn!("Rate change on deck {} rejected: slaved to sync", deck);
            return Err(SyncError::RateLocked(deck).into());
        }
        self.send(EngineCommand::SetPlaybackRate { deck, rate })
    }

    pub fn set_interpolation(&mut self, deck: DeckId, method: InterpolationMethod) -> ControlResult<()> {
        self.send(EngineCommand::SetInterpolation { deck, method })
    }

    // ─────────────────────────────────────────────────────────────
    // Looper
    // ─────────────────────────────────────────────────────────────

    /// Request a loop region; invalid values are corrected on the audio thread
    pub fn set_loop(&mut self, deck: DeckId, start_bar: f64, length_bars: f64) -> ControlResult<()> {
        self.send(EngineCommand::SetLoop {
            deck,
            start_bar,
            length_bars,
        })
    }

    pub fn set_loop_enabled(&mut self, deck: DeckId, enabled: bool) -> ControlResult<()> {
        self.send(EngineCommand::SetLoopEnabled { deck, enabled })
    }

    /// Active loop boundaries as last published by the audio thread
    pub fn loop_boundaries(&self, deck: DeckId) -> LoopBoundaries {
        self.decks[deck.index()].loop_boundaries()
    }

    // ─────────────────────────────────────────────────────────────
    // Sync
    // ─────────────────────────────────────────────────────────────

    pub fn enable_sync(&mut self, master: DeckId) -> ControlResult<()> {
        for deck in [master, master.other()] {
            let atomics = &self.decks[deck.index()];
            if !atomics.is_loaded() {
                log::warn!("Sync rejected: deck {} has no track loaded", deck);
                return Err(SyncError::DeckNotLoaded(deck).into());
            }
            if !atomics.is_loop_source() {
                log::warn!("Sync rejected: deck {} is not loop material", deck);
                return Err(SyncError::IncompatibleSource(deck).into());
            }
        }
        self.require_paused()?;
        self.send(EngineCommand::EnableSync { master })
    }

    pub fn disable_sync(&mut self) -> ControlResult<()> {
        if !self.sync.is_active() {
            return Err(SyncError::NotActive.into());
        }
        self.require_paused()?;
        self.send(EngineCommand::DisableSync)
    }

    pub fn switch_master(&mut self, master: DeckId) -> ControlResult<()> {
        if !self.sync.is_active() {
            return Err(SyncError::NotActive.into());
        }
        self.require_paused()?;
        self.send(EngineCommand::SwitchMaster { master })
    }

    /// Retempo the master deck; the slave follows without a transport reset
    pub fn update_master_bpm(&mut self, bpm: f64) -> ControlResult<()> {
        if !self.sync.is_active() {
            return Err(SyncError::NotActive.into());
        }
        if !bpm.is_finite() {
            return Err(ControlError::InvalidBpm(bpm));
        }
        self.send(EngineCommand::UpdateMasterBpm(bpm.clamp(MIN_BPM, MAX_BPM)))
    }

    // ─────────────────────────────────────────────────────────────
    // Gate
    // ─────────────────────────────────────────────────────────────

    pub fn gate_start(&mut self, deck: DeckId, pattern: usize, bpm: f64) -> ControlResult<()> {
        if pattern >= GATE_PATTERNS.len() {
            return Err(ControlError::UnknownPattern(pattern));
        }
        self.send(EngineCommand::GateStart { deck, pattern, bpm })
    }

    pub fn gate_stop(&mut self, deck: DeckId) -> ControlResult<()> {
        self.send(EngineCommand::GateStop { deck })
    }

    pub fn gate_update_bpm(&mut self, deck: DeckId, bpm: f64) -> ControlResult<()> {
        self.send(EngineCommand::GateUpdateBpm { deck, bpm })
    }

    // ─────────────────────────────────────────────────────────────
    // Recording
    // ─────────────────────────────────────────────────────────────

    /// Arm a bar-aligned recording at `bpm`, up to the configured ceiling
    pub fn arm_recording(&mut self, bpm: f64) -> ControlResult<()> {
        self.arm_recording_bars(bpm, None)
    }

    /// Arm a recording of `target_bars` (capped at the ceiling)
    ///
    /// The capture buffer for the whole take is allocated here, so the audio
    /// thread only ever copies into it.
    pub fn arm_recording_bars(&mut self, bpm: f64, target_bars: Option<u32>) -> ControlResult<()> {
        let state = self.recorder.state();
        if state != RecordingState::Idle {
            return Err(RecordError::Busy(state).into());
        }
        let buffer = self.capture_layout.buffer(bpm, target_bars)?;
        let buffer = CaptureReservation::new(&self.handle, buffer);
        self.send(EngineCommand::ArmRecording {
            bpm,
            target_bars,
            buffer,
        })
    }

    /// Cancel a pending or running recording
    ///
    /// The cancellation flag is raised before the command is queued, so the
    /// recorder refuses to act on any further loop crossing even if the
    /// queue is backed up.
    pub fn cancel_recording(&mut self) -> ControlResult<()> {
        self.recorder.request_cancel();
        self.send(EngineCommand::CancelRecording)
    }

    /// Finish a running capture (a pending one is cancelled)
    pub fn stop_recording(&mut self) -> ControlResult<()> {
        self.send(EngineCommand::StopRecording)
    }

    // ─────────────────────────────────────────────────────────────
    // Mixer
    // ─────────────────────────────────────────────────────────────

    /// Crossfader position from 0 (deck A) to 100 (deck B)
    pub fn set_crossfader(&mut self, position: f32) -> ControlResult<()> {
        self.send(EngineCommand::SetCrossfader { position })
    }

    pub fn set_volume(&mut self, deck: DeckId, volume: f32) -> ControlResult<()> {
        self.send(EngineCommand::SetVolume { deck, volume })
    }

    pub fn set_trim(&mut self, deck: DeckId, db: f32) -> ControlResult<()> {
        self.send(EngineCommand::SetTrim { deck, db })
    }

    pub fn set_master_volume(&mut self, volume: f32) -> ControlResult<()> {
        self.send(EngineCommand::SetMasterVolume(volume))
    }

    fn require_loaded(&self, deck: DeckId) -> ControlResult<()> {
        if self.decks[deck.index()].is_loaded() {
            Ok(())
        } else {
            Err(ControlError::DeckNotLoaded(deck))
        }
    }

    fn require_paused(&self) -> ControlResult<()> {
        if self.decks.iter().any(|deck| deck.is_playing()) {
            log::warn!("Sync change rejected: playback is active");
            return Err(SyncError::PlaybackActive.into());
        }
        Ok(())
    }

    fn send(&mut self, command: EngineCommand) -> ControlResult<()> {
        let name = command.name();
        self.commands.push(command).map_err(|_| {
            log::warn!("Command queue full, {} dropped", name);
            ControlError::QueueFull
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::command_channel;
    use crate::track::TrackKind;
    use crate::types::{frames_per_bar, StereoSample};

    const SR: u32 = 8000;

    fn rig() -> (AudioEngine, rtrb::Consumer<EngineCommand>, MixerController) {
        let engine = AudioEngine::new(&EngineConfig::default(), SR);
        let (tx, rx) = command_channel();
        let controller = MixerController::new(tx, &engine);
        (engine, rx, controller)
    }

    fn data(bpm: f64, kind: TrackKind) -> TrackData {
        let frames = (4.0 * frames_per_bar(bpm, SR)) as usize;
        TrackData::new("t", vec![StereoSample::mono(0.2); frames], SR, bpm, kind)
    }

    #[test]
    fn test_sync_rejected_without_tracks() {
        let (_engine, _rx, mut controller) = rig();
        assert_eq!(
            controller.enable_sync(DeckId::A),
            Err(ControlError::Sync(SyncError::DeckNotLoaded(DeckId::A)))
        );
        assert_eq!(controller.disable_sync(), Err(ControlError::Sync(SyncError::NotActive)));
    }

    #[test]
    fn test_sync_rejected_while_playing() {
        let (mut engine, mut rx, mut controller) = rig();
        controller.load_track(DeckId::A, data(120.0, TrackKind::Loop)).unwrap();
        controller.load_track(DeckId::B, data(100.0, TrackKind::Loop)).unwrap();
        engine.process_commands(&mut rx);
        controller.play(DeckId::B).unwrap();
        engine.process_commands(&mut rx);

        assert_eq!(
            controller.enable_sync(DeckId::A),
            Err(ControlError::Sync(SyncError::PlaybackActive))
        );

        controller.pause(DeckId::B).unwrap();
        engine.process_commands(&mut rx);
        controller.enable_sync(DeckId::A).unwrap();
        engine.process_commands(&mut rx);
        assert_eq!(controller.sync_master(), Some(DeckId::A));
        assert!((controller.deck(DeckId::B).playback_rate() - 1.2).abs() < 1e-6);

        assert_eq!(
            controller.set_playback_rate(DeckId::B, 1.0),
            Err(ControlError::Sync(SyncError::RateLocked(DeckId::B)))
        );
    }

    #[test]
    fn test_stream_source_cannot_sync() {
        let (mut engine, mut rx, mut controller) = rig();
        controller.load_track(DeckId::A, data(120.0, TrackKind::Loop)).unwrap();
        controller.load_track(DeckId::B, data(120.0, TrackKind::Stream)).unwrap();
        engine.process_commands(&mut rx);
        assert_eq!(
            controller.enable_sync(DeckId::A),
            Err(ControlError::Sync(SyncError::IncompatibleSource(DeckId::B)))
        );
    }

    #[test]
    fn test_play_requires_track() {
        let (_engine, _rx, mut controller) = rig();
        assert_eq!(controller.play(DeckId::A), Err(ControlError::DeckNotLoaded(DeckId::A)));
    }

    #[test]
    fn test_arm_twice_is_busy() {
        let (mut engine, mut rx, mut controller) = rig();
        controller.load_track(DeckId::A, data(120.0, TrackKind::Loop)).unwrap();
        controller.arm_recording(120.0).unwrap();
        engine.process_commands(&mut rx);
        assert_eq!(controller.recording_state(), RecordingState::Armed);
        assert_eq!(
            controller.arm_recording(120.0),
            Err(ControlError::Record(RecordError::Busy(RecordingState::Armed)))
        );

        controller.cancel_recording().unwrap();
        engine.process_commands(&mut rx);
        assert_eq!(controller.recording_state(), RecordingState::Idle);
    }

    #[test]
    fn test_arm_sends_buffer_for_whole_capture() {
        let (_engine, mut rx, mut controller) = rig();
        assert_eq!(
            controller.arm_recording(0.5),
            Err(ControlError::Record(RecordError::InvalidBpm(0.5)))
        );
        assert!(rx.pop().is_err());

        controller.arm_recording_bars(120.0, Some(2)).unwrap();
        match rx.pop().unwrap() {
            EngineCommand::ArmRecording { buffer, .. } => {
                // Two bars at 120 BPM and 8 kHz
                assert!(buffer.capacity_frames() >= 32000);
                assert_eq!(buffer.chunk_count(), 0);
            }
            other => panic!("unexpected command {}", other.name()),
        }
    }

    #[test]
    fn test_loop_boundaries_visible_after_tick() {
        let (mut engine, mut rx, mut controller) = rig();
        controller.load_track(DeckId::A, data(120.0, TrackKind::Loop)).unwrap();
        controller.set_loop(DeckId::A, 1.0, 2.0).unwrap();
        engine.process_commands(&mut rx);

        let boundaries = controller.loop_boundaries(DeckId::A);
        assert_eq!(boundaries.start_bar, 1.0);
        assert!((boundaries.start_seconds - 2.0).abs() < 1e-12);
        assert!((boundaries.end_seconds - 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_full_queue_is_reported() {
        let (_engine, _rx, mut controller) = rig();
        while controller.has_space() {
            controller.set_crossfader(10.0).unwrap();
        }
        assert_eq!(controller.set_crossfader(20.0), Err(ControlError::QueueFull));
    }

    #[test]
    fn test_unknown_gate_pattern() {
        let (_engine, _rx, mut controller) = rig();
        assert_eq!(
            controller.gate_start(DeckId::A, GATE_PATTERNS.len(), 120.0),
            Err(ControlError::UnknownPattern(GATE_PATTERNS.len()))
        );
    }
}
