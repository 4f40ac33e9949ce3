//! Twindeck Core - Two-deck loop mixer engine
//!
//! Loop playback, cross-deck tempo sync, gate effects, crossfading and
//! bar-aligned capture, driven by a single audio thread.

pub mod audio;
pub mod clock;
pub mod config;
pub mod controller;
pub mod engine;
pub mod track;
pub mod types;

pub use types::*;
