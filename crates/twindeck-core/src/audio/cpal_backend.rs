//! CPAL audio backend implementation
//!
//! ```text
//! ┌──────────────────┐                     ┌─────────────────────┐
//! │  Control Thread  │───push()───────────►│   Command Queue     │
//! │ (MixerController)│                     │  (lock-free SPSC)   │
//! └──────────────────┘                     └──────────┬──────────┘
//!         │                                           │
//!         │ Relaxed atomics                           │ pop()
//!         ▼                                           ▼
//! ┌──────────────────┐                     ┌─────────────────────┐
//! │ Deck/Sync/Record │◄────────────────────│  CPAL Audio Thread  │
//! │     Atomics      │     sync writes     │  (owns AudioEngine) │
//! └──────────────────┘                     └─────────────────────┘
//! ```
//!
//! The stream callback owns the engine outright; nothing is shared behind a
//! lock. Device buffers larger than [`MAX_BUFFER_SIZE`] are rendered in
//! several engine ticks.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize as CpalBufferSize, SampleFormat, Stream, StreamConfig};

use crate::config::EngineConfig;
use crate::engine::{AudioEngine, EngineCommand};
use crate::types::StereoBuffer;

use super::backend::{build_engine, AudioHandle, AudioSystemResult};
use super::config::{AudioConfig, DEFAULT_BUFFER_SIZE, DEFAULT_SAMPLE_RATE, MAX_BUFFER_SIZE};
use super::error::{AudioError, AudioResult};

/// CPAL-specific audio handle
///
/// Keeps the output stream alive. Drop this to stop audio.
pub struct CpalAudioHandle {
    _stream: Stream,
    sample_rate: u32,
    /// Actual buffer size in frames (as negotiated with the device)
    buffer_size: u32,
}

impl CpalAudioHandle {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    /// One-way output latency in milliseconds
    pub fn latency_ms(&self) -> f32 {
        (self.buffer_size as f32 / self.sample_rate as f32) * 1000.0
    }
}

/// Open the configured output device and start the engine on its callback
pub fn start_audio_system(config: &EngineConfig) -> AudioResult<AudioSystemResult> {
    let device = match &config.audio.device {
        Some(name) => find_device(name)?,
        None => default_device()?,
    };

    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    log::info!("Using audio device: {}", device_name);

    let (supported_config, buffer_size) = get_output_config(&device, &config.audio)?;
    let sample_rate = supported_config.sample_rate().0;

    let stream_config = StreamConfig {
        channels: supported_config.channels(),
        sample_rate: supported_config.sample_rate(),
        buffer_size: match buffer_size {
            Some(frames) => CpalBufferSize::Fixed(frames),
            None => CpalBufferSize::Default,
        },
    };
    let buffer_size = buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
    let latency_ms = (buffer_size as f32 / sample_rate as f32) * 1000.0;

    log::info!(
        "Audio config: {} channels, {}Hz, {} frames (~{:.1}ms latency)",
        stream_config.channels,
        sample_rate,
        buffer_size,
        latency_ms
    );

    let parts = build_engine(config, sample_rate);
    let state = AudioCallbackState::new(parts.engine, parts.commands);

    let stream = build_output_stream(&device, &stream_config, state)?;
    stream
        .play()
        .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

    log::info!("Audio stream started");

    Ok(AudioSystemResult {
        handle: AudioHandle::Cpal(CpalAudioHandle {
            _stream: stream,
            sample_rate,
            buffer_size,
        }),
        controller: parts.controller,
        engine_events: parts.engine_events,
        recording_events: parts.recording_events,
        captures: parts.captures,
        sample_rate,
        buffer_size,
        latency_ms,
    })
}

fn default_device() -> AudioResult<cpal::Device> {
    cpal::default_host()
        .default_output_device()
        .ok_or_else(|| AudioError::NoDefaultDevice("host reports no default output".to_string()))
}

fn find_device(name: &str) -> AudioResult<cpal::Device> {
    let mut devices = cpal::default_host()
        .output_devices()
        .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?
        .peekable();
    if devices.peek().is_none() {
        return Err(AudioError::NoDevices);
    }
    devices
        .find(|d| d.name().is_ok_and(|n| n == name))
        .ok_or_else(|| AudioError::DeviceNotFound(name.to_string()))
}

/// State owned by the stream callback
struct AudioCallbackState {
    /// The audio engine (owned exclusively by audio thread)
    engine: AudioEngine,
    command_rx: rtrb::Consumer<EngineCommand>,
    /// Pre-allocated master buffer
    master_buffer: StereoBuffer,
}

impl AudioCallbackState {
    fn new(engine: AudioEngine, command_rx: rtrb::Consumer<EngineCommand>) -> Self {
        Self {
            engine,
            command_rx,
            master_buffer: StereoBuffer::silence(MAX_BUFFER_SIZE),
        }
    }

    /// Fill an interleaved device buffer, one engine tick per chunk
    fn render(&mut self, data: &mut [f32], channels: usize) {
        for chunk in data.chunks_mut(MAX_BUFFER_SIZE * channels) {
            let n_frames = chunk.len() / channels;

            // Set working buffer length (RT-safe: no allocation)
            self.master_buffer.set_len_from_capacity(n_frames);
            self.engine.process_commands(&mut self.command_rx);
            self.engine.process(&mut self.master_buffer);

            let samples = self.master_buffer.as_slice();
            for (frame, sample) in chunk.chunks_mut(channels).zip(samples) {
                frame[0] = sample.left;
                if channels > 1 {
                    frame[1] = sample.right;
                }
                // Fill additional channels with silence
                for ch in frame.iter_mut().skip(2) {
                    *ch = 0.0;
                }
            }
        }
    }
}

/// Pick a stereo f32 config at the preferred sample rate
///
/// Returns the config and the buffer size to request (None = device default).
fn get_output_config(
    device: &cpal::Device,
    config: &AudioConfig,
) -> AudioResult<(cpal::SupportedStreamConfig, Option<u32>)> {
    let supported_configs: Vec<_> = device
        .supported_output_configs()
        .map_err(|e| AudioError::ConfigError(e.to_string()))?
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .collect();

    if supported_configs.is_empty() {
        return Err(AudioError::UnsupportedFormat(
            "device offers no f32 output configuration".to_string(),
        ));
    }

    let target_sample_rate = config.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE);
    let in_range = |c: &cpal::SupportedStreamConfigRange| {
        target_sample_rate >= c.min_sample_rate().0 && target_sample_rate <= c.max_sample_rate().0
    };

    let best_config = supported_configs
        .iter()
        .find(|c| c.channels() >= 2 && in_range(c))
        .or_else(|| supported_configs.iter().find(|c| c.channels() >= 2))
        .or_else(|| supported_configs.first())
        .ok_or_else(|| {
            AudioError::ConfigError("No suitable output configuration found".to_string())
        })?;

    let sample_rate = if in_range(best_config) {
        cpal::SampleRate(target_sample_rate)
    } else {
        let fallback = best_config.max_sample_rate();
        log::warn!(
            "Audio device doesn't support {}Hz, falling back to {}Hz",
            target_sample_rate,
            fallback.0
        );
        fallback
    };

    let buffer_size = config.buffer_size.as_frames();
    log::debug!("Requested buffer size: {:?}", buffer_size);

    Ok((best_config.clone().with_sample_rate(sample_rate), buffer_size))
}

fn build_output_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    mut state: AudioCallbackState,
) -> AudioResult<Stream> {
    let channels = config.channels as usize;

    device
        .build_output_stream(
            config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                state.render(data, channels);
            },
            move |err| {
                log::error!("Audio stream error: {}", err);
            },
            None,
        )
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::command_channel;
    use crate::types::DeckId;

    #[test]
    fn test_render_chunks_large_device_buffers() {
        let engine = AudioEngine::new(&EngineConfig::default(), 8000);
        let clock = engine.clock_reader();
        let (_tx, rx) = command_channel();
        let mut state = AudioCallbackState::new(engine, rx);

        // Three channels, more frames than one engine tick holds
        let frames = MAX_BUFFER_SIZE + 100;
        let mut data = vec![1.0f32; frames * 3];
        state.render(&mut data, 3);

        assert_eq!(clock.frames(), frames as u64);
        assert!(data.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_render_applies_queued_commands() {
        let engine = AudioEngine::new(&EngineConfig::default(), 8000);
        let events = engine.engine_events();
        let (mut tx, rx) = command_channel();
        let mut state = AudioCallbackState::new(engine, rx);

        tx.push(EngineCommand::SetLoop { deck: DeckId::B, start_bar: 0.0, length_bars: 2.0 })
            .unwrap();
        let mut data = vec![0.0f32; 256 * 2];
        state.render(&mut data, 2);

        assert!(events
            .try_iter()
            .any(|e| matches!(e, crate::engine::EngineEvent::LoopChanged { deck: DeckId::B, .. })));
    }
}
