//! Standard locations of pulselink files

use std::path::PathBuf;

/// Per-user pulselink config directory
///
/// Returns: `{config_dir}/pulselink` (e.g. `~/.config/pulselink` on Linux)
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pulselink")
}

/// Path of a file inside the pulselink config directory
pub fn default_config_path(filename: &str) -> PathBuf {
    default_config_dir().join(filename)
}

/// Where the settings UI stores the user's choices
pub fn default_settings_path() -> PathBuf {
    default_config_path("settings.yaml")
}
