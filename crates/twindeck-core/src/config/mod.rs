//! Engine configuration
//!
//! YAML settings for the engine and the small generic load/save layer they
//! go through. Missing or malformed files fall back to defaults; values that
//! make no sense are clamped rather than rejected.
//!
//! ```ignore
//! use twindeck_core::config::{default_config_path, load_config, EngineConfig};
//!
//! let config: EngineConfig = load_config(&default_config_path());
//! ```

mod io;
mod paths;
mod settings;

pub use io::{load_config, read_config, save_config};
pub use paths::{default_capture_dir, default_config_dir, default_config_path};
pub use settings::{EngineConfig, GateConfig, LooperConfig, MixerConfig, RecordingConfig, SyncConfig};
