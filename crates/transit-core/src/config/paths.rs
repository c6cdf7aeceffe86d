//! Standard locations for Transit configuration files

use std::path::PathBuf;

/// Directory holding Transit configuration
///
/// Returns: `~/.config/transit` (platform config dir), or `./transit` when
/// the platform has none.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("transit")
}

/// Default path for a config file
///
/// Returns: `{config_dir}/{filename}`
pub fn default_config_path(filename: &str) -> PathBuf {
    config_dir().join(filename)
}
