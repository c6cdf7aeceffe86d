//! Interfaces to the engine's collaborators
//!
//! The transport drives, but does not own, the audio device, the track graph,
//! the MIDI outputs, the disk prefetch worker and the MIDI sequencer. Each is
//! reached through a trait object injected at construction. Every method here
//! is called from the audio thread and must be realtime-safe in the
//! implementation: no blocking, no allocation, no locks shared with other
//! threads.

use crate::types::{MidiPortId, StereoBuffer};

use super::command::{MidiEvent, SessionOp};

/// Transport state reported by the audio device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    /// Transport stopped
    Stopped,
    /// Transport relocating or waiting for clients before rolling
    Starting,
    /// Transport rolling
    Playing,
}

/// Tick position supplied by a device acting as timebase master
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimebaseTicks {
    /// Tick at the start of this cycle
    pub current: u64,
    /// Ticks spanned by this cycle
    pub delta: u64,
}

/// The audio device whose periodic callback drives the engine
///
/// Passed by reference to each cycle rather than stored in the engine, since
/// the backend owns it (JACK client, free-running clock, test double).
pub trait AudioDevice {
    /// Whether the device is healthy enough to run a cycle
    fn is_available(&self) -> bool;

    /// Hardware transport state
    fn state(&self) -> DeviceState;

    /// Position of the device transport, in frames
    fn transport_frame(&self) -> u64;

    /// Free-running device clock, in frames
    fn frame_pos(&self) -> u64;

    /// Device clock at the start of the current cycle
    fn frames_at_cycle_start(&self) -> u64;

    /// Relocate the device transport
    fn seek_transport(&mut self, frame: u64);

    /// Ask the device transport to start rolling
    fn start_transport(&mut self);

    /// Ask the device transport to stop
    fn stop_transport(&mut self);

    /// Current tick and cycle tick delta when the device is timebase master
    fn timebase(&self, _frames: u32) -> Option<TimebaseTicks> {
        None
    }
}

/// Per-cycle data handed to the track processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleInfo {
    /// First frame of the cycle
    pub frame: u64,
    /// Cycle length in frames
    pub frames: u32,
    /// First tick of the cycle (inclusive)
    pub tick: u64,
    /// First tick of the next cycle (exclusive)
    pub next_tick: u64,
    /// Whether the transport is advancing this cycle
    pub rolling: bool,
    pub recording: bool,
    pub freewheel: bool,
}

/// The track graph: audio and MIDI processing for one cycle
pub trait TrackProcessor: Send {
    /// Write `frames` of silence to every output
    fn silence(&mut self, frames: u32);

    /// Process the cycle's frame range into `output`
    ///
    /// `aux` holds the cleared aux send buffers for this cycle.
    fn process(&mut self, cycle: &CycleInfo, aux: &mut [StereoBuffer], output: &mut StereoBuffer);

    /// Apply a session graph edit
    fn apply(&mut self, op: &SessionOp);

    /// Re-enable automation on controllers the user touched while stopped
    fn reenable_touched_controllers(&mut self);

    /// Reset record/level meters
    fn reset_meters(&mut self);
}

/// MIDI output ports
pub trait MidiOutputs: Send {
    fn port_count(&self) -> usize;

    /// Whether a device is attached to `port`
    fn has_device(&self, port: MidiPortId) -> bool;

    /// Hardware state of a controller, if known
    fn hw_ctrl_state(&self, port: MidiPortId, channel: u8, controller: u8) -> Option<i32>;

    fn set_hw_ctrl_state(&mut self, port: MidiPortId, channel: u8, controller: u8, value: i32);

    /// Set the hardware state and last valid value of a controller
    fn set_hw_ctrl_states(
        &mut self,
        port: MidiPortId,
        channel: u8,
        controller: u8,
        value: i32,
        _last_value: i32,
    ) {
        self.set_hw_ctrl_state(port, channel, controller, value);
    }

    /// Queue an event for immediate output; false if the port queue is full
    fn put_event(&mut self, event: MidiEvent) -> bool;

    fn reset(&mut self);

    fn init(&mut self);

    /// MIDI transport start (`resume == false`) or continue on synced ports
    fn send_transport_start(&mut self, resume: bool);
}

/// Disk prefetch/writeback worker
pub trait DiskWorker: Send {
    /// Per-cycle tick while rolling (`is_play`) or on stop
    fn msg_tick(&mut self, recording: bool, is_play: bool);

    /// Re-seek the read-ahead buffers
    fn msg_seek(&mut self, frame: u64, force: bool);

    /// Whether the last seek has been fully realized
    fn seek_done(&self) -> bool;
}

/// MIDI sequencer thread
pub trait MidiSequencer: Send {
    fn msg_seek(&mut self);

    fn msg_stop(&mut self);

    fn msg_idle(&mut self, idle: bool);
}

/// Every collaborator the engine drives
pub struct Collaborators {
    pub tracks: Box<dyn TrackProcessor>,
    pub midi: Box<dyn MidiOutputs>,
    pub prefetch: Box<dyn DiskWorker>,
    pub sequencer: Box<dyn MidiSequencer>,
}
