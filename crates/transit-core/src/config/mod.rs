//! Configuration for Transit
//!
//! - Generic YAML config loading/saving
//! - Standard config paths
//! - Engine tuning ([`EngineConfig`]) and the audio backend ([`AudioConfig`])
//!
//! ```ignore
//! use transit_core::config::{default_config_path, load_config, TransitConfig};
//!
//! let config: TransitConfig = load_config(&default_config_path("transit.yaml"));
//! ```

mod engine;
mod io;
mod paths;

pub use crate::audio::{AudioBackend, AudioConfig};
pub use engine::{EngineConfig, PreCountConfig};
pub use io::{load_config, save_config};
pub use paths::{config_dir, default_config_path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default config file name
pub const CONFIG_FILE: &str = "transit.yaml";

/// Top-level config file layout
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransitConfig {
    pub engine: EngineConfig,
    pub audio: AudioConfig,
}

/// Settings that load fine but can't work together
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("engine.look_ahead_cycles must be at least 1")]
    NoLookAhead,

    #[error(
        "audio.relocate_cycles = {relocate} needs engine.look_ahead_cycles >= {needed} (is {look_ahead})"
    )]
    RelocationTooSlow {
        relocate: u32,
        look_ahead: u32,
        needed: u32,
    },
}

impl TransitConfig {
    /// Check the settings that span engine and backend
    ///
    /// A loop jump is exact only if the device finishes relocating within
    /// the look-ahead window. JACK relocates on the server's schedule, so
    /// only the internal transport's latency is checked.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let look_ahead = self.engine.look_ahead_cycles;
        if look_ahead == 0 {
            return Err(ConfigError::NoLookAhead);
        }
        let relocate = self.audio.relocate_cycles;
        if self.audio.backend != AudioBackend::Jack && relocate >= look_ahead {
            return Err(ConfigError::RelocationTooSlow {
                relocate,
                look_ahead,
                needed: relocate + 1,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert_eq!(TransitConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_relocation_must_fit_look_ahead() {
        let mut config = TransitConfig::default();
        config.audio.relocate_cycles = 3;
        assert_eq!(
            config.validate(),
            Err(ConfigError::RelocationTooSlow {
                relocate: 3,
                look_ahead: 3,
                needed: 4,
            })
        );

        config.engine.look_ahead_cycles = 4;
        assert_eq!(config.validate(), Ok(()));

        config.engine.look_ahead_cycles = 0;
        assert_eq!(config.validate(), Err(ConfigError::NoLookAhead));
    }

    #[test]
    fn test_jack_relocation_setting_ignored() {
        let mut config = TransitConfig::default();
        config.audio.backend = AudioBackend::Jack;
        config.audio.relocate_cycles = 10;
        assert_eq!(config.validate(), Ok(()));
    }
}
