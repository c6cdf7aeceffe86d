//! YAML load/save for the config structs

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
}

/// Read a YAML config, falling back to `T::default()`
///
/// A missing file is not an error. A file that can't be read or parsed is
/// reported with a warning.
///
/// ```ignore
/// let config: TransitConfig = load_config(&default_config_path("transit.yaml"));
/// ```
pub fn load_config<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        log::info!("No config at {}, using defaults", path.display());
        return T::default();
    }

    match read_yaml(path) {
        Ok(config) => {
            log::info!("Loaded config from {}", path.display());
            config
        }
        Err(e) => {
            log::warn!("Ignoring config: {:#}", e);
            T::default()
        }
    }
}

/// Write `config` as YAML, creating missing parent directories
pub fn save_config<T: Serialize>(config: &T, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating config directory {}", dir.display()))?;
    }

    let yaml = serde_yaml::to_string(config).context("serializing config")?;
    std::fs::write(path, yaml).with_context(|| format!("writing {}", path.display()))?;
    log::info!("Saved config to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AudioBackend, TransitConfig};

    #[test]
    fn test_load_nonexistent_returns_default() {
        let config: TransitConfig = load_config(Path::new("/nonexistent/path/transit.yaml"));
        assert_eq!(config, TransitConfig::default());
    }

    #[test]
    fn test_invalid_yaml_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transit.yaml");
        std::fs::write(&path, "engine: [not, a, map").unwrap();
        let config: TransitConfig = load_config(&path);
        assert_eq!(config, TransitConfig::default());
    }

    #[test]
    fn test_roundtrip_in_nested_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("transit.yaml");

        let mut config = TransitConfig::default();
        config.engine.look_ahead_cycles = 4;
        config.engine.precount.enabled = true;
        config.audio.backend = AudioBackend::Dummy;
        config.audio.buffer_size = 256;

        save_config(&config, &path).unwrap();
        let loaded: TransitConfig = load_config(&path);
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transit.yaml");
        std::fs::write(&path, "engine:\n  aux_buses: 4\n").unwrap();
        let loaded: TransitConfig = load_config(&path);
        assert_eq!(loaded.engine.aux_buses, 4);
        assert_eq!(loaded.engine.look_ahead_cycles, 3);
        assert_eq!(loaded.audio, TransitConfig::default().audio);
    }
}
