//! Lock-free command queue for real-time engine control
//!
//! Control threads push commands into an `rtrb` single-producer
//! single-consumer ring; the audio thread pops them at the start of each
//! tick, so deck, sync, gate and recorder state only ever changes between
//! buffers.
//!
//! ```ignore
//! let (mut tx, mut rx) = command_channel();
//!
//! // Control thread: never blocks
//! tx.push(EngineCommand::Play { deck: DeckId::A });
//!
//! // Audio thread: apply everything that is pending
//! engine.process_commands(&mut rx);
//! ```

use crate::track::Track;
use crate::types::DeckId;

use super::recorder::CaptureReservation;
use super::resample::InterpolationMethod;

/// Commands sent from control threads to the audio thread
///
/// Every variant is applied atomically at a tick boundary. Variants stay
/// small (a `Track` or a capture buffer is a single pointer) so the ring
/// stays compact.
#[derive(Debug)]
pub enum EngineCommand {
    // ─────────────────────────────────────────────────────────────
    // Track Management
    // ─────────────────────────────────────────────────────────────
    /// Load a decoded track; the previous one is dropped off the audio thread
    LoadTrack { deck: DeckId, track: Track },
    UnloadTrack { deck: DeckId },

    // ─────────────────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────────────────
    Play { deck: DeckId },
    Pause { deck: DeckId },
    TogglePlay { deck: DeckId },
    /// Move the playhead (source frames)
    Seek { deck: DeckId, position: f64 },
    /// Varispeed rate; rejected on a deck slaved by sync
    SetPlaybackRate { deck: DeckId, rate: f64 },
    SetInterpolation { deck: DeckId, method: InterpolationMethod },

    // ─────────────────────────────────────────────────────────────
    // Looper
    // ─────────────────────────────────────────────────────────────
    SetLoop { deck: DeckId, start_bar: f64, length_bars: f64 },
    SetLoopEnabled { deck: DeckId, enabled: bool },

    // ─────────────────────────────────────────────────────────────
    // Sync
    // ─────────────────────────────────────────────────────────────
    EnableSync { master: DeckId },
    DisableSync,
    SwitchMaster { master: DeckId },
    UpdateMasterBpm(f64),

    // ─────────────────────────────────────────────────────────────
    // Gate
    // ─────────────────────────────────────────────────────────────
    GateStart { deck: DeckId, pattern: usize, bpm: f64 },
    GateStop { deck: DeckId },
    GateUpdateBpm { deck: DeckId, bpm: f64 },

    // ─────────────────────────────────────────────────────────────
    // Recording
    // ─────────────────────────────────────────────────────────────
    /// Arm a bar-aligned capture; `None` records up to the bar ceiling
    ///
    /// `buffer` holds the whole capture, allocated by the sender.
    ArmRecording {
        bpm: f64,
        target_bars: Option<u32>,
        buffer: CaptureReservation,
    },
    CancelRecording,
    StopRecording,

    // ─────────────────────────────────────────────────────────────
    // Mixer
    // ─────────────────────────────────────────────────────────────
    /// Crossfader position, 0 (deck A) to 100 (deck B)
    SetCrossfader { position: f32 },
    SetVolume { deck: DeckId, volume: f32 },
    SetTrim { deck: DeckId, db: f32 },
    SetMasterVolume(f32),
}

impl EngineCommand {
    /// Short name used in logs and rejection events
    pub fn name(&self) -> &'static str {
        match self {
            EngineCommand::LoadTrack { .. } => "load_track",
            EngineCommand::UnloadTrack { .. } => "unload_track",
            EngineCommand::Play { .. } => "play",
            EngineCommand::Pause { .. } => "pause",
            EngineCommand::TogglePlay { .. } => "toggle_play",
            EngineCommand::Seek { .. } => "seek",
            EngineCommand::SetPlaybackRate { .. } => "set_playback_rate",
            EngineCommand::SetInterpolation { .. } => "set_interpolation",
            EngineCommand::SetLoop { .. } => "set_loop",
            EngineCommand::SetLoopEnabled { .. } => "set_loop_enabled",
            EngineCommand::EnableSync { .. } => "enable_sync",
            EngineCommand::DisableSync => "disable_sync",
            EngineCommand::SwitchMaster { .. } => "switch_master",
            EngineCommand::UpdateMasterBpm(_) => "update_master_bpm",
            EngineCommand::GateStart { .. } => "gate_start",
            EngineCommand::GateStop { .. } => "gate_stop",
            EngineCommand::GateUpdateBpm { .. } => "gate_update_bpm",
            EngineCommand::ArmRecording { .. } => "arm_recording",
            EngineCommand::CancelRecording => "cancel_recording",
            EngineCommand::StopRecording => "stop_recording",
            EngineCommand::SetCrossfader { .. } => "set_crossfader",
            EngineCommand::SetVolume { .. } => "set_volume",
            EngineCommand::SetTrim { .. } => "set_trim",
            EngineCommand::SetMasterVolume(_) => "set_master_volume",
        }
    }
}

/// Capacity of the command queue
///
/// Control traffic is a handful of commands per user gesture; 256 leaves
/// room for scripted bursts (loading two decks and setting up a loop).
pub const COMMAND_QUEUE_CAPACITY: usize = 256;

/// Create a new command channel (producer/consumer pair)
///
/// The producer goes to the control thread, the consumer to the thread
/// that owns the [`AudioEngine`](super::AudioEngine).
pub fn command_channel() -> (rtrb::Producer<EngineCommand>, rtrb::Consumer<EngineCommand>) {
    rtrb::RingBuffer::new(COMMAND_QUEUE_CAPACITY)
}
