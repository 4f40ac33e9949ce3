//! Audio backend configuration

use serde::{Deserialize, Serialize};

/// Largest block the engine pre-allocates for; device buffers above this are split
pub const MAX_BUFFER_SIZE: usize = 8192;

/// Block size used when nothing else is specified (frames)
///
/// 512 frames at 48 kHz is a tick of about 10.7 ms.
pub const DEFAULT_BUFFER_SIZE: u32 = 512;

/// Preferred sample rate when the device leaves the choice open
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// Preferred buffer size for the output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BufferSize {
    /// Let the device choose
    #[default]
    Default,
    /// Request a specific size in frames (the device may adjust it)
    Fixed(u32),
}

impl BufferSize {
    /// Requested size in frames, or `None` for the device default
    pub fn as_frames(&self) -> Option<u32> {
        match self {
            BufferSize::Default => None,
            BufferSize::Fixed(frames) => Some((*frames).clamp(16, MAX_BUFFER_SIZE as u32)),
        }
    }

    /// Tick length in milliseconds at `sample_rate`
    pub fn latency_ms(&self, sample_rate: u32) -> f32 {
        let frames = self.as_frames().unwrap_or(DEFAULT_BUFFER_SIZE);
        frames as f32 / sample_rate.max(1) as f32 * 1000.0
    }
}

/// Output device settings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Output device name as reported by the host (None = system default)
    pub device: Option<String>,
    pub buffer_size: BufferSize,
    /// Preferred sample rate (None = device default)
    pub sample_rate: Option<u32>,
}

impl AudioConfig {
    /// Sample rate the engine runs at when no device dictates one
    pub fn engine_sample_rate(&self) -> u32 {
        self.sample_rate.filter(|&r| r > 0).unwrap_or(DEFAULT_SAMPLE_RATE)
    }

    /// Block size for the headless ticker
    pub fn block_frames(&self) -> usize {
        self.buffer_size.as_frames().unwrap_or(DEFAULT_BUFFER_SIZE) as usize
    }
}
