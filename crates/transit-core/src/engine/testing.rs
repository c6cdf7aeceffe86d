//! Recording collaborators and a scriptable device for engine tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::collab::{
    AudioDevice, Collaborators, CycleInfo, DeviceState, DiskWorker, MidiOutputs, MidiSequencer,
    TimebaseTicks, TrackProcessor,
};
use super::command::{MidiEvent, SessionOp};
use super::engine::{Engine, EngineHandles};
use crate::config::EngineConfig;
use crate::tempo::{owned_tempo_map, TempoSegments};
use crate::types::{MidiPortId, StereoBuffer, StereoSample};

/// Everything the collaborators were asked to do
#[derive(Debug, Default)]
pub struct TestLog {
    pub processed: Vec<CycleInfo>,
    pub silenced: usize,
    pub ops: Vec<SessionOp>,
    pub reenabled: usize,
    pub meter_resets: usize,
    pub midi_events: Vec<MidiEvent>,
    pub transport_starts: Vec<bool>,
    pub midi_resets: usize,
    pub midi_inits: usize,
    pub disk_ticks: Vec<(bool, bool)>,
    pub disk_seeks: Vec<(u64, bool)>,
    pub seq_seeks: usize,
    pub seq_stops: usize,
    pub seq_idle: Vec<bool>,
}

pub type SharedLog = Arc<Mutex<TestLog>>;

pub struct MockTracks {
    log: SharedLog,
}

impl TrackProcessor for MockTracks {
    fn silence(&mut self, _frames: u32) {
        self.log.lock().unwrap().silenced += 1;
    }

    fn process(&mut self, cycle: &CycleInfo, aux: &mut [StereoBuffer], output: &mut StereoBuffer) {
        // Aux sends must arrive cleared
        for bus in aux.iter() {
            assert_eq!(bus.peak(), 0.0);
        }
        for bus in aux.iter_mut() {
            if !bus.is_empty() {
                bus[0] = StereoSample::mono(1.0);
            }
        }
        if cycle.rolling && !output.is_empty() {
            output[0] = StereoSample::mono(0.25);
        }
        self.log.lock().unwrap().processed.push(*cycle);
    }

    fn apply(&mut self, op: &SessionOp) {
        self.log.lock().unwrap().ops.push(*op);
    }

    fn reenable_touched_controllers(&mut self) {
        self.log.lock().unwrap().reenabled += 1;
    }

    fn reset_meters(&mut self) {
        self.log.lock().unwrap().meter_resets += 1;
    }
}

pub struct MockMidi {
    log: SharedLog,
    ports: usize,
    hw: HashMap<(MidiPortId, u8, u8), i32>,
}

impl MidiOutputs for MockMidi {
    fn port_count(&self) -> usize {
        self.ports
    }

    fn has_device(&self, port: MidiPortId) -> bool {
        port < self.ports
    }

    fn hw_ctrl_state(&self, port: MidiPortId, channel: u8, controller: u8) -> Option<i32> {
        self.hw.get(&(port, channel, controller)).copied()
    }

    fn set_hw_ctrl_state(&mut self, port: MidiPortId, channel: u8, controller: u8, value: i32) {
        self.hw.insert((port, channel, controller), value);
    }

    fn put_event(&mut self, event: MidiEvent) -> bool {
        self.log.lock().unwrap().midi_events.push(event);
        true
    }

    fn reset(&mut self) {
        self.log.lock().unwrap().midi_resets += 1;
    }

    fn init(&mut self) {
        self.log.lock().unwrap().midi_inits += 1;
    }

    fn send_transport_start(&mut self, resume: bool) {
        self.log.lock().unwrap().transport_starts.push(resume);
    }
}

pub struct MockDisk {
    log: SharedLog,
    seek_done: Arc<AtomicBool>,
}

impl DiskWorker for MockDisk {
    fn msg_tick(&mut self, recording: bool, is_play: bool) {
        self.log.lock().unwrap().disk_ticks.push((recording, is_play));
    }

    fn msg_seek(&mut self, frame: u64, force: bool) {
        self.log.lock().unwrap().disk_seeks.push((frame, force));
    }

    fn seek_done(&self) -> bool {
        self.seek_done.load(Ordering::Relaxed)
    }
}

pub struct MockSequencer {
    log: SharedLog,
}

impl MidiSequencer for MockSequencer {
    fn msg_seek(&mut self) {
        self.log.lock().unwrap().seq_seeks += 1;
    }

    fn msg_stop(&mut self) {
        self.log.lock().unwrap().seq_stops += 1;
    }

    fn msg_idle(&mut self, idle: bool) {
        self.log.lock().unwrap().seq_idle.push(idle);
    }
}

/// Device whose state is set directly by the test
#[derive(Debug)]
pub struct MockDevice {
    pub available: bool,
    pub state: DeviceState,
    pub transport_frame: u64,
    pub clock: u64,
    pub seeks: Vec<u64>,
    pub starts: usize,
    pub stops: usize,
    pub timebase: Option<TimebaseTicks>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self {
            available: true,
            state: DeviceState::Stopped,
            transport_frame: 0,
            clock: 0,
            seeks: Vec::new(),
            starts: 0,
            stops: 0,
            timebase: None,
        }
    }
}

impl MockDevice {
    pub fn playing() -> Self {
        Self {
            state: DeviceState::Playing,
            ..Default::default()
        }
    }
}

impl AudioDevice for MockDevice {
    fn is_available(&self) -> bool {
        self.available
    }

    fn state(&self) -> DeviceState {
        self.state
    }

    fn transport_frame(&self) -> u64 {
        self.transport_frame
    }

    fn frame_pos(&self) -> u64 {
        self.clock
    }

    fn frames_at_cycle_start(&self) -> u64 {
        self.clock
    }

    fn seek_transport(&mut self, frame: u64) {
        self.transport_frame = frame;
        self.seeks.push(frame);
    }

    fn start_transport(&mut self) {
        self.starts += 1;
    }

    fn stop_transport(&mut self) {
        self.stops += 1;
    }

    fn timebase(&self, _frames: u32) -> Option<TimebaseTicks> {
        self.timebase
    }
}

/// 48 kHz, 24 ticks per quarter, 120 BPM: one tick every 1000 frames
pub fn tempo_120() -> TempoSegments {
    TempoSegments::constant(48000, 24, 120.0).unwrap()
}

/// Recording collaborators plus the log they share and the prefetch
/// worker's seek-done flag (initially set)
pub fn mock_collaborators(midi_ports: usize) -> (Collaborators, SharedLog, Arc<AtomicBool>) {
    let log = SharedLog::default();
    let seek_done = Arc::new(AtomicBool::new(true));
    let collab = Collaborators {
        tracks: Box::new(MockTracks { log: log.clone() }),
        midi: Box::new(MockMidi {
            log: log.clone(),
            ports: midi_ports,
            hw: HashMap::new(),
        }),
        prefetch: Box::new(MockDisk {
            log: log.clone(),
            seek_done: seek_done.clone(),
        }),
        sequencer: Box::new(MockSequencer { log: log.clone() }),
    };
    (collab, log, seek_done)
}

/// Everything a test needs to drive and inspect an engine
pub struct Harness {
    pub engine: Engine,
    pub handles: EngineHandles,
    pub log: SharedLog,
    pub seek_done: Arc<AtomicBool>,
}

impl Harness {
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_ports(config, 2)
    }

    pub fn with_ports(config: &EngineConfig, midi_ports: usize) -> Self {
        let (collab, log, seek_done) = mock_collaborators(midi_ports);
        let (engine, handles) = Engine::new(config, collab, owned_tempo_map(tempo_120())).unwrap();
        Self {
            engine,
            handles,
            log,
            seek_done,
        }
    }

    pub fn log(&self) -> std::sync::MutexGuard<'_, TestLog> {
        self.log.lock().unwrap()
    }

    /// Drain every pending notification
    pub fn events(&mut self) -> Vec<super::sync::SyncEvent> {
        let mut out = Vec::new();
        self.handles.events.drain_into(&mut out);
        out
    }
}
