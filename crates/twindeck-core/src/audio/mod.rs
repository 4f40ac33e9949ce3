//! Audio output for Twindeck
//!
//! Two ways to drive the engine, same lock-free design:
//! - **CPAL** (`cpal-backend` feature): the device callback owns the engine
//! - **Headless**: a [`Ticker`] thread renders blocks on a wall-clock schedule
//!
//! ```ignore
//! use twindeck_core::audio::start_audio_system;
//!
//! let mut system = start_audio_system(&config)?;
//! system.controller.play(DeckId::A)?;
//! ```

mod backend;
mod config;
mod error;
mod ticker;

#[cfg(feature = "cpal-backend")]
mod cpal_backend;

pub use backend::{start_audio_system, start_headless, AudioHandle, AudioSystemResult};
pub use config::{AudioConfig, BufferSize, DEFAULT_BUFFER_SIZE, DEFAULT_SAMPLE_RATE, MAX_BUFFER_SIZE};
pub use error::{AudioError, AudioResult};
pub use ticker::Ticker;
