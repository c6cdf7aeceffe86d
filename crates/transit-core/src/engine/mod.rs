//! Realtime transport engine
//!
//! - Transport: state machine reconciling engine and device transport state
//! - Command channel: one command in flight, acknowledged by serial
//! - Sync events: single-byte notifications to control threads
//! - Atomics: lock-free state published once per cycle
//! - Engine: the per-cycle driver tying everything together

mod atomics;
mod collab;
mod command;
mod control;
mod engine;
mod error;
pub mod gc;
mod sync;
mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use atomics::*;
pub use collab::*;
pub use command::*;
pub use control::*;
pub use engine::*;
pub use error::*;
pub use sync::*;
pub use transport::*;
