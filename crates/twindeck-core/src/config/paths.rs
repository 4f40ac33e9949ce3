//! Standard locations for twindeck files

use std::path::PathBuf;

/// `~/.config/twindeck` (platform config dir), or `./twindeck` without one
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("twindeck")
}

/// `~/.config/twindeck/config.yaml`
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.yaml")
}

/// `~/Music/twindeck-captures`, where the player writes recordings
pub fn default_capture_dir() -> PathBuf {
    dirs::audio_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("twindeck-captures")
}
