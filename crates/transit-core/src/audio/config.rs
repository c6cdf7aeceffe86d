//! Audio backend configuration

use serde::{Deserialize, Serialize};

use crate::types::{MAX_BUFFER_SIZE, SAMPLE_RATE};

/// Default period size in frames when the backend doesn't dictate one
pub const DEFAULT_BUFFER_SIZE: u32 = 512;

/// Which driver runs the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioBackend {
    /// Timer thread, no audio output; always available
    #[default]
    Dummy,
    /// CPAL output stream (`cpal-backend` feature)
    Cpal,
    /// JACK client following the JACK transport (`jack-backend` feature, Linux)
    Jack,
}

impl AudioBackend {
    pub fn name(self) -> &'static str {
        match self {
            AudioBackend::Dummy => "dummy",
            AudioBackend::Cpal => "cpal",
            AudioBackend::Jack => "jack",
        }
    }
}

/// Configuration for the audio backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub backend: AudioBackend,

    /// Period size in frames (dummy and CPAL; JACK uses the server's)
    pub buffer_size: u32,

    /// Sample rate in Hz (dummy and CPAL; JACK uses the server's)
    pub sample_rate: u32,

    /// Output device name for CPAL (None = system default)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    /// JACK client name
    pub client_name: String,

    /// Connect the JACK outputs to the first system playback pair
    pub auto_connect: bool,

    /// Cycles the internal transport reports `Starting` after a relocation
    ///
    /// Must be below the engine's loop look-ahead (see
    /// [`TransitConfig::validate`](crate::config::TransitConfig::validate)).
    pub relocate_cycles: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            backend: AudioBackend::default(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            sample_rate: SAMPLE_RATE,
            device: None,
            client_name: "transit".to_string(),
            auto_connect: true,
            relocate_cycles: 2,
        }
    }
}

impl AudioConfig {
    pub fn with_backend(mut self, backend: AudioBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_buffer_size(mut self, frames: u32) -> Self {
        self.buffer_size = frames;
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_device(mut self, name: impl Into<String>) -> Self {
        self.device = Some(name.into());
        self
    }

    /// Period size clamped to what the engine pre-allocates
    pub fn period_frames(&self) -> u32 {
        self.buffer_size.clamp(16, MAX_BUFFER_SIZE as u32)
    }

    /// One-way output latency of one period in milliseconds
    pub fn latency_ms(&self) -> f32 {
        (self.period_frames() as f32 / self.sample_rate.max(1) as f32) * 1000.0
    }
}
