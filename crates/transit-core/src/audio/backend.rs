//! Backend selection and the handle that keeps a driver running
//!
//! Every backend follows the same lock-free design:
//! - The engine moves into the audio callback/thread and is owned there
//! - Control threads use the [`EngineHandles`](crate::engine::EngineHandles)
//!   returned by `Engine::new`
//! - Stopping a backend posts the `Shutdown` sync event

use crate::engine::Engine;

use super::config::{AudioBackend, AudioConfig};
use super::dummy_backend::DummyAudioHandle;
use super::error::AudioResult;

/// Result of starting the audio system
pub struct AudioSystemResult {
    /// Handle to keep audio alive (drop to stop)
    pub handle: AudioHandle,
    /// Sample rate the driver runs at
    pub sample_rate: u32,
    /// Period size in frames
    pub buffer_size: u32,
    /// Output latency of one period in milliseconds
    pub latency_ms: f32,
}

/// Handle to the active audio driver
pub enum AudioHandle {
    Dummy(DummyAudioHandle),

    #[cfg(feature = "cpal-backend")]
    Cpal(super::cpal_backend::CpalAudioHandle),

    #[cfg(all(target_os = "linux", feature = "jack-backend"))]
    Jack(super::jack_backend::JackAudioHandle),
}

impl AudioHandle {
    pub fn sample_rate(&self) -> u32 {
        match self {
            AudioHandle::Dummy(h) => h.sample_rate(),
            #[cfg(feature = "cpal-backend")]
            AudioHandle::Cpal(h) => h.sample_rate(),
            #[cfg(all(target_os = "linux", feature = "jack-backend"))]
            AudioHandle::Jack(h) => h.sample_rate(),
        }
    }

    pub fn buffer_size(&self) -> u32 {
        match self {
            AudioHandle::Dummy(h) => h.buffer_size(),
            #[cfg(feature = "cpal-backend")]
            AudioHandle::Cpal(h) => h.buffer_size(),
            #[cfg(all(target_os = "linux", feature = "jack-backend"))]
            AudioHandle::Jack(h) => h.buffer_size(),
        }
    }

    pub fn latency_ms(&self) -> f32 {
        (self.buffer_size() as f32 / self.sample_rate().max(1) as f32) * 1000.0
    }

    /// Stop the driver; the engine posts `Shutdown` on its way out
    pub fn stop(&mut self) {
        match self {
            AudioHandle::Dummy(h) => h.stop(),
            #[cfg(feature = "cpal-backend")]
            AudioHandle::Cpal(h) => h.stop(),
            #[cfg(all(target_os = "linux", feature = "jack-backend"))]
            AudioHandle::Jack(h) => h.stop(),
        }
    }
}

/// Start the configured backend with `engine`
///
/// Fails with `BackendUnavailable` if the backend was not compiled in.
pub fn start_audio_system(config: &AudioConfig, engine: Engine) -> AudioResult<AudioSystemResult> {
    log::info!("Starting {} audio backend", config.backend.name());
    match config.backend {
        AudioBackend::Dummy => super::dummy_backend::start_audio_system(config, engine),

        #[cfg(feature = "cpal-backend")]
        AudioBackend::Cpal => super::cpal_backend::start_audio_system(config, engine),
        #[cfg(not(feature = "cpal-backend"))]
        AudioBackend::Cpal => {
            drop(engine);
            Err(super::error::AudioError::BackendUnavailable("cpal"))
        }

        #[cfg(all(target_os = "linux", feature = "jack-backend"))]
        AudioBackend::Jack => super::jack_backend::start_audio_system(config, engine),
        #[cfg(not(all(target_os = "linux", feature = "jack-backend")))]
        AudioBackend::Jack => {
            drop(engine);
            Err(super::error::AudioError::BackendUnavailable("jack"))
        }
    }
}
