//! Audio system startup shared by the device and headless backends
//!
//! Both backends use the same lock-free architecture:
//! - the control side gets a [`MixerController`] (command ring + atomics)
//! - the audio thread owns the [`AudioEngine`] exclusively
//! - notifications come back over bounded crossbeam channels

use crossbeam::channel::{self, Receiver};

use crate::config::EngineConfig;
use crate::controller::MixerController;
use crate::engine::{
    command_channel, AudioEngine, CapturedAudio, EngineCommand, EngineEvent, RecordingEvent,
};

use super::error::AudioResult;
use super::ticker::Ticker;

/// Result of starting the audio system
///
/// Contains everything the control thread needs.
pub struct AudioSystemResult {
    /// Handle to keep audio alive (drop to stop)
    pub handle: AudioHandle,
    /// Lock-free control surface
    pub controller: MixerController,
    /// Applied changes and rejected commands
    pub engine_events: Receiver<EngineEvent>,
    /// Recorder state changes and progress
    pub recording_events: Receiver<RecordingEvent>,
    /// Finished captures
    pub captures: Receiver<CapturedAudio>,
    /// Sample rate of the audio system
    pub sample_rate: u32,
    /// Actual buffer size in frames
    pub buffer_size: u32,
    /// Audio latency in milliseconds (one-way, output only)
    pub latency_ms: f32,
}

/// Handle to the active audio system
///
/// Keeps the stream or ticker thread alive. Drop this to stop audio.
pub enum AudioHandle {
    /// Device output through CPAL
    #[cfg(feature = "cpal-backend")]
    Cpal(super::cpal_backend::CpalAudioHandle),

    /// Engine driven by a plain thread, no device
    Headless(Ticker),
}

impl AudioHandle {
    pub fn sample_rate(&self) -> u32 {
        match self {
            #[cfg(feature = "cpal-backend")]
            AudioHandle::Cpal(h) => h.sample_rate(),
            AudioHandle::Headless(t) => t.sample_rate(),
        }
    }

    pub fn buffer_size(&self) -> u32 {
        match self {
            #[cfg(feature = "cpal-backend")]
            AudioHandle::Cpal(h) => h.buffer_size(),
            AudioHandle::Headless(t) => t.buffer_size(),
        }
    }

    pub fn latency_ms(&self) -> f32 {
        match self {
            #[cfg(feature = "cpal-backend")]
            AudioHandle::Cpal(h) => h.latency_ms(),
            AudioHandle::Headless(t) => t.latency_ms(),
        }
    }
}

/// Engine plus the control-side ends of its channels, before the engine moves threads
pub(crate) struct EngineParts {
    pub engine: AudioEngine,
    pub commands: rtrb::Consumer<EngineCommand>,
    pub controller: MixerController,
    pub engine_events: Receiver<EngineEvent>,
    pub recording_events: Receiver<RecordingEvent>,
    pub captures: Receiver<CapturedAudio>,
}

pub(crate) fn build_engine(config: &EngineConfig, sample_rate: u32) -> EngineParts {
    let mut engine = AudioEngine::new(config, sample_rate);
    let (command_tx, commands) = command_channel();
    let controller = MixerController::new(command_tx, &engine);
    EngineParts {
        engine_events: engine.engine_events(),
        recording_events: engine.recording_events(),
        captures: engine.take_captures().unwrap_or_else(channel::never),
        engine,
        commands,
        controller,
    }
}

/// Start the audio system with the given configuration
///
/// Uses the output device when the CPAL backend is compiled in, otherwise
/// falls back to the headless ticker.
pub fn start_audio_system(config: &EngineConfig) -> AudioResult<AudioSystemResult> {
    #[cfg(feature = "cpal-backend")]
    {
        super::cpal_backend::start_audio_system(config)
    }

    #[cfg(not(feature = "cpal-backend"))]
    {
        start_headless(config)
    }
}

/// Start the engine on a headless ticker thread at the configured rate and block size
pub fn start_headless(config: &EngineConfig) -> AudioResult<AudioSystemResult> {
    let sample_rate = config.audio.engine_sample_rate();
    let block = config.audio.block_frames();
    let parts = build_engine(config, sample_rate);

    let ticker = Ticker::spawn(parts.engine, parts.commands, block)?;
    let buffer_size = ticker.buffer_size();
    let latency_ms = ticker.latency_ms();

    log::info!(
        "Headless audio system started: {}Hz, {} frames (~{:.1}ms per tick)",
        sample_rate,
        buffer_size,
        latency_ms
    );

    Ok(AudioSystemResult {
        handle: AudioHandle::Headless(ticker),
        controller: parts.controller,
        engine_events: parts.engine_events,
        recording_events: parts.recording_events,
        captures: parts.captures,
        sample_rate,
        buffer_size,
        latency_ms,
    })
}
