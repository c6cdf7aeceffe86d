//! Audio drivers for the transport engine
//!
//! - **dummy**: timer thread, always built
//! - **cpal** (`cpal-backend`): cross-platform output stream
//! - **jack** (`jack-backend`, Linux): JACK client following the JACK transport
//!
//! CPAL and the dummy driver have no transport of their own and run the
//! engine against a [`FreeRunningTransport`].
//!
//! ```ignore
//! use transit_core::audio::{start_audio_system, AudioConfig};
//!
//! let (engine, handles) = Engine::new(&engine_config, collaborators, tempo)?;
//! let mut system = start_audio_system(&AudioConfig::default(), engine)?;
//! handles.control.send_and_wait(Command::Play(true), timeout, retries)?;
//! system.handle.stop();
//! ```

mod backend;
mod config;
mod dummy_backend;
mod error;
mod free_run;

#[cfg(feature = "cpal-backend")]
mod cpal_backend;

#[cfg(all(target_os = "linux", feature = "jack-backend"))]
mod jack_backend;

pub use backend::{start_audio_system, AudioHandle, AudioSystemResult};
pub use config::{AudioBackend, AudioConfig, DEFAULT_BUFFER_SIZE};
pub use dummy_backend::DummyAudioHandle;
pub use error::{AudioError, AudioResult};
pub use free_run::FreeRunningTransport;
