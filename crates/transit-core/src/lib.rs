//! Transit Core - realtime transport and synchronization engine

pub mod audio;
pub mod config;
pub mod engine;
pub mod tempo;
pub mod types;

pub use types::*;
