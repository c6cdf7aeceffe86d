//! Engine tuning
//!
//! Loaded once at startup; nothing here is changed while the audio thread
//! runs.

use serde::{Deserialize, Serialize};

use crate::engine::TransportOptions;

/// Count-in before a recording roll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreCountConfig {
    /// Off by default: rolls start immediately
    pub enabled: bool,
    /// Whole measures to count
    pub measures: u32,
    /// Take the measure length from the tempo map instead of the fields below
    pub signature_from_tempo_map: bool,
    pub numerator: u8,
    pub denominator: u8,
}

impl Default for PreCountConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            measures: 1,
            signature_from_tempo_map: true,
            numerator: 4,
            denominator: 4,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Cycles of look-ahead when arming a loop
    pub look_ahead_cycles: u32,
    /// Acknowledgment ring capacity
    pub ack_capacity: usize,
    /// Notification ring capacity
    pub event_capacity: usize,
    /// MIDI output ports the host opens
    pub midi_ports: usize,
    /// Aux send buses cleared every cycle
    pub aux_buses: usize,
    pub precount: PreCountConfig,
    /// Take ticks from the device timebase when it offers one
    pub follow_device_timebase: bool,
    /// Stop and locate the device transport before the first cycle
    pub prepare_on_start: bool,
    /// Per-attempt wait for a command acknowledgment
    pub command_timeout_ms: u64,
    /// Retries for a command rejected because another is pending
    pub command_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            look_ahead_cycles: 3,
            ack_capacity: 64,
            event_capacity: 256,
            midi_ports: 1,
            aux_buses: 2,
            precount: PreCountConfig::default(),
            follow_device_timebase: false,
            prepare_on_start: true,
            command_timeout_ms: 500,
            command_retries: 8,
        }
    }
}

impl EngineConfig {
    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            look_ahead_cycles: self.look_ahead_cycles,
            precount: self.precount,
            follow_timebase: self.follow_device_timebase,
        }
    }

    pub fn command_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.command_timeout_ms)
    }
}
