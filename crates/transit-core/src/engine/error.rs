//! Engine error types

use thiserror::Error;

use super::command::CommandSerial;

/// Errors surfaced to control threads
#[derive(Error, Debug)]
pub enum EngineError {
    /// Another command is still waiting to be taken by the audio thread
    #[error("Command {0} rejected: another command is still pending")]
    CommandRejected(&'static str),

    /// The audio thread didn't acknowledge a command in time
    #[error("Timed out after {waited_ms}ms waiting for command {serial}")]
    AckTimeout { serial: CommandSerial, waited_ms: u64 },

    /// Command/ack/notification rings could not be created
    #[error("Failed to set up engine channels: {0}")]
    ChannelSetup(String),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
