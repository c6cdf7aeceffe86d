//! Control-plane commands for the realtime transport
//!
//! Control threads (UI, disk workers, MIDI clock) never touch engine state
//! directly. They build a [`Command`], wrap it in an [`Envelope`] carrying a
//! serial number and push it into the command ring. The audio thread takes at
//! most one envelope per cycle, applies it and writes the serial back on the
//! acknowledgment ring.
//!
//! # One command in flight
//!
//! The command ring has a capacity of exactly one. A push while a command is
//! still waiting to be taken fails and the command is handed back to the
//! caller; nothing is ever queued behind it. Callers serialize their own sends
//! and retry on rejection.
//!
//! # Real-time safety
//!
//! - The ring is allocated once at startup (`rtrb`, wait-free push/pop)
//! - Every variant is applied in bounded time
//! - Heap payloads travel as `basedrop::Owned<T>`, so dropping them on the
//!   audio thread only enqueues a pointer for the GC thread

use basedrop::Owned;

use crate::tempo::TempoMap;
use crate::types::{MidiPortId, Timeline, TrackId};

/// Capacity of the command ring (one command in flight)
pub const COMMAND_QUEUE_CAPACITY: usize = 1;

/// Serial number attached to every submitted command
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CommandSerial(pub u64);

impl std::fmt::Display for CommandSerial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Short MIDI channel message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiMessage {
    NoteOn { note: u8, velocity: u8 },
    NoteOff { note: u8, velocity: u8 },
    Controller { controller: u8, value: u8 },
    ProgramChange { program: u8 },
    /// 14-bit bend centred on zero
    PitchBend { value: i16 },
}

/// A MIDI event addressed to an output port and channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiEvent {
    pub port: MidiPortId,
    pub channel: u8,
    pub message: MidiMessage,
}

impl MidiEvent {
    pub fn controller(port: MidiPortId, channel: u8, controller: u8, value: u8) -> Self {
        Self {
            port,
            channel,
            message: MidiMessage::Controller { controller, value },
        }
    }
}

/// Audio/MIDI route between two tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub source: TrackId,
    pub destination: TrackId,
    /// Number of channels carried by the route
    pub channels: u8,
}

/// Automation playback mode of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutomationMode {
    #[default]
    Off,
    Read,
    Touch,
    Write,
}

/// Session graph edit applied by the track processor
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionOp {
    AddRoute(Route),
    RemoveRoute(Route),
    RemoveAllRoutes { track: TrackId },
    SetMute { track: TrackId, on: bool },
    SetSolo { track: TrackId, on: bool },
    SetOff { track: TrackId, on: bool },
    SetAuxSend { track: TrackId, aux: usize, level: f32 },
    SetPrefader { track: TrackId, on: bool },
    SetChannels { track: TrackId, channels: u8 },
    SetAutomationMode { track: TrackId, mode: AutomationMode },
    SetRecordArm { track: TrackId, on: bool },
    SetSendMetronome { track: TrackId, on: bool },
}

/// A batch of session edits prepared off the audio thread
///
/// Applied in order within one cycle.
#[derive(Debug, Clone, Default)]
pub struct OperationGroup {
    ops: Vec<SessionOp>,
}

impl OperationGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: SessionOp) {
        self.ops.push(op);
    }

    pub fn with(mut self, op: SessionOp) -> Self {
        self.ops.push(op);
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SessionOp> {
        self.ops.iter()
    }
}

/// Commands sent from control threads to the audio thread
pub enum Command {
    // ─────────────────────────────────────────────────────────────
    // Devices
    // ─────────────────────────────────────────────────────────────
    /// Reset every MIDI output device
    ResetDevices,
    /// Initialize every MIDI output device
    InitDevices,

    // ─────────────────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────────────────
    /// Locate the engine (and the device transport) to a frame
    Seek { frame: u64 },
    /// Ask the device transport to start (`true`) or stop rolling
    Play(bool),
    /// Re-derive position after the tempo map or markers changed
    ReSync,
    /// New song/timeline snapshot (length, loop, record arm, click)
    UpdateTimeline(Timeline),
    /// Swap the tempo map; the old one is released on the GC thread
    ReplaceTempoMap(Owned<Box<dyn TempoMap>>),
    /// Freewheel (non-realtime render) mode
    SetFreewheel(bool),
    /// Bounce-to-file mode: stop at the right marker
    SetBounce(bool),
    /// Follow an external MIDI clock for tick advancement
    SetExternalSync(bool),
    /// Deliver silence and skip all processing
    SetIdle(bool),

    // ─────────────────────────────────────────────────────────────
    // MIDI
    // ─────────────────────────────────────────────────────────────
    /// Record the hardware state of one controller
    SetHwCtrlState {
        port: MidiPortId,
        channel: u8,
        controller: u8,
        value: i32,
    },
    /// Record the hardware state and the last valid value of one controller
    SetHwCtrlStates {
        port: MidiPortId,
        channel: u8,
        controller: u8,
        value: i32,
        last_value: i32,
    },
    /// Send one event immediately
    PlayMidiEvent(MidiEvent),
    /// All sound off and controller reset on every channel of every port
    Panic,
    /// Local control off on every channel of every port
    MidiLocalOff,
    /// Clear the MIDI learn slot so the next incoming controller is captured
    StartMidiLearn,

    // ─────────────────────────────────────────────────────────────
    // Session graph
    // ─────────────────────────────────────────────────────────────
    /// A single session edit (route, mute, solo, aux send, ...)
    Session(SessionOp),
    /// A batch of session edits prepared off the audio thread
    ApplyOperations(Owned<OperationGroup>),

    /// No-op; used to wait for one full cycle
    Wait,
}

impl Command {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Command::ResetDevices => "ResetDevices",
            Command::InitDevices => "InitDevices",
            Command::Seek { .. } => "Seek",
            Command::Play(_) => "Play",
            Command::ReSync => "ReSync",
            Command::UpdateTimeline(_) => "UpdateTimeline",
            Command::ReplaceTempoMap(_) => "ReplaceTempoMap",
            Command::SetFreewheel(_) => "SetFreewheel",
            Command::SetBounce(_) => "SetBounce",
            Command::SetExternalSync(_) => "SetExternalSync",
            Command::SetIdle(_) => "SetIdle",
            Command::SetHwCtrlState { .. } => "SetHwCtrlState",
            Command::SetHwCtrlStates { .. } => "SetHwCtrlStates",
            Command::PlayMidiEvent(_) => "PlayMidiEvent",
            Command::Panic => "Panic",
            Command::MidiLocalOff => "MidiLocalOff",
            Command::StartMidiLearn => "StartMidiLearn",
            Command::Session(_) => "Session",
            Command::ApplyOperations(_) => "ApplyOperations",
            Command::Wait => "Wait",
        }
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Seek { frame } => write!(f, "Seek({})", frame),
            Command::Session(op) => write!(f, "Session({:?})", op),
            Command::ApplyOperations(group) => write!(f, "ApplyOperations({} ops)", group.len()),
            other => f.write_str(other.name()),
        }
    }
}

/// A command tagged with its serial number
#[derive(Debug)]
pub struct Envelope {
    pub serial: CommandSerial,
    pub command: Command,
}

/// Create the command ring (capacity one)
pub fn command_channel() -> (rtrb::Producer<Envelope>, rtrb::Consumer<Envelope>) {
    rtrb::RingBuffer::new(COMMAND_QUEUE_CAPACITY)
}
