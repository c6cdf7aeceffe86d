//! Backend startup errors

use thiserror::Error;

/// Why a backend could not be brought up
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Audio backend '{0}' is not compiled into this build")]
    BackendUnavailable(&'static str),

    #[error("No audio output devices found")]
    NoDevices,

    /// Named output device is not present
    #[error("No output device named '{0}'")]
    DeviceNotFound(String),

    /// Driver or client refused the requested configuration
    #[error("Audio driver error: {0}")]
    Driver(String),

    #[error("Could not build output stream: {0}")]
    StreamBuild(String),

    #[error("Could not start output stream: {0}")]
    StreamStart(String),

    /// Cycle thread could not be spawned (dummy backend)
    #[error("Could not spawn audio thread: {0}")]
    Spawn(String),
}

pub type AudioResult<T> = Result<T, AudioError>;
