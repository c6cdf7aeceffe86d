//! The realtime engine driver
//!
//! [`Engine`] is owned exclusively by the audio thread. The backend calls
//! [`Engine::on_cycle`] once per device period; everything the control side
//! needs comes back through [`EngineHandles`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use basedrop::Owned;

use super::atomics::{ExternalClock, MidiLearn, TransportAtomics};
use super::collab::{AudioDevice, Collaborators};
use super::command::{command_channel, Command, CommandSerial, Envelope, MidiEvent};
use super::control::TransportControl;
use super::error::{EngineError, EngineResult};
use super::sync::{sync_channel, SyncEvent, SyncEvents, SyncNotifier};
use super::transport::{Boundary, Transport, TransportIo};
use crate::config::EngineConfig;
use crate::tempo::{PositionTranslator, TempoMap};
use crate::types::{StereoBuffer, MAX_BUFFER_SIZE, MIDI_CHANNELS};

/// All sound off
const CTRL_ALL_SOUND_OFF: u8 = 120;
/// Reset all controllers
const CTRL_RESET_ALL: u8 = 121;
/// Local control on/off
const CTRL_LOCAL_CONTROL: u8 = 122;

/// Control-side ends of the engine's channels
pub struct EngineHandles {
    pub control: TransportControl,
    pub events: SyncEvents,
    pub atomics: Arc<TransportAtomics>,
    /// Feed MIDI clock ticks here while external sync is on
    pub external_clock: Arc<ExternalClock>,
    pub midi_learn: Arc<MidiLearn>,
}

/// Realtime transport engine
///
/// # Lock-Free Design
///
/// Commands arrive on a capacity-1 `rtrb` ring and are acknowledged on a
/// second ring. Notifications go out as single bytes. State is published
/// through relaxed atomics. The audio thread never blocks on any of them.
pub struct Engine {
    transport: Transport,
    collab: Collaborators,
    notifier: SyncNotifier,
    commands: rtrb::Consumer<Envelope>,
    acks: rtrb::Producer<CommandSerial>,
    dropped_acks: Arc<AtomicU64>,
    atomics: Arc<TransportAtomics>,
    midi_learn: Arc<MidiLearn>,
    /// Aux send buses, cleared every cycle
    aux: Vec<StereoBuffer>,
    output: StereoBuffer,
    idle: bool,
    prepare_on_start: bool,
}

impl Engine {
    /// Build the engine and its control handles
    ///
    /// All buffers and rings are allocated here; nothing allocates once the
    /// engine is running.
    pub fn new(
        config: &EngineConfig,
        collab: Collaborators,
        tempo: Owned<Box<dyn TempoMap>>,
    ) -> EngineResult<(Self, EngineHandles)> {
        if config.ack_capacity == 0 {
            return Err(EngineError::ChannelSetup(
                "acknowledgment ring needs a capacity of at least 1".into(),
            ));
        }
        if config.event_capacity == 0 {
            return Err(EngineError::ChannelSetup(
                "notification ring needs a capacity of at least 1".into(),
            ));
        }

        let (command_tx, command_rx) = command_channel();
        let (ack_tx, ack_rx) = rtrb::RingBuffer::new(config.ack_capacity);
        let (notifier, events) = sync_channel(config.event_capacity);
        let dropped_acks = Arc::new(AtomicU64::new(0));
        let atomics = Arc::new(TransportAtomics::new());
        let external_clock = Arc::new(ExternalClock::new());
        let midi_learn = Arc::new(MidiLearn::new());

        let transport = Transport::new(
            config.transport_options(),
            PositionTranslator::new(tempo),
            Arc::clone(&external_clock),
        );

        log::info!(
            "Engine: look-ahead {} cycles, {} aux buses, precount {}",
            config.look_ahead_cycles,
            config.aux_buses,
            if config.precount.enabled { "on" } else { "off" }
        );

        let engine = Self {
            transport,
            collab,
            notifier,
            commands: command_rx,
            acks: ack_tx,
            dropped_acks: Arc::clone(&dropped_acks),
            atomics: Arc::clone(&atomics),
            midi_learn: Arc::clone(&midi_learn),
            aux: (0..config.aux_buses)
                .map(|_| StereoBuffer::silence(MAX_BUFFER_SIZE))
                .collect(),
            output: StereoBuffer::silence(MAX_BUFFER_SIZE),
            idle: false,
            prepare_on_start: config.prepare_on_start,
        };
        let handles = EngineHandles {
            control: TransportControl::new(command_tx, ack_rx, dropped_acks),
            events,
            atomics,
            external_clock,
            midi_learn,
        };
        Ok((engine, handles))
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Mixed output of the last cycle
    pub fn output(&self) -> &StereoBuffer {
        &self.output
    }

    pub fn is_idle(&self) -> bool {
        self.idle
    }

    /// Put the device transport where the engine is before the first cycle
    pub fn prepare(&mut self, device: &mut dyn AudioDevice) {
        if !self.prepare_on_start {
            return;
        }
        let frame = self.transport.frame();
        device.stop_transport();
        device.seek_transport(frame);
        log::info!("Engine: device transport stopped and located to frame {}", frame);
    }

    /// Post the backend shutdown notification
    pub fn shutdown(&mut self) {
        self.notifier.notify(SyncEvent::Shutdown);
    }

    /// Process one device period (realtime-safe)
    ///
    /// Periods longer than [`MAX_BUFFER_SIZE`] run as several engine cycles;
    /// [`Engine::output`] then holds the last one. Use
    /// [`Engine::run_period`] to receive every chunk.
    pub fn on_cycle(&mut self, device: &mut dyn AudioDevice, frames: u32) {
        self.run_period(device, frames, |_, _| {});
    }

    /// Process one device period, handing each rendered chunk to `sink`
    /// along with its frame offset in the period
    pub fn run_period<F>(&mut self, device: &mut dyn AudioDevice, frames: u32, mut sink: F)
    where
        F: FnMut(usize, &StereoBuffer),
    {
        let mut offset = 0;
        let mut remaining = frames;
        loop {
            let chunk = remaining.min(MAX_BUFFER_SIZE as u32);
            self.run_cycle(device, chunk);
            sink(offset, &self.output);
            offset += chunk as usize;
            remaining -= chunk;
            if remaining == 0 {
                break;
            }
        }
    }

    fn run_cycle(&mut self, device: &mut dyn AudioDevice, frames: u32) {
        let len = frames as usize;
        self.output.set_len_from_capacity(len);
        for bus in &mut self.aux {
            bus.set_len_from_capacity(len);
        }

        // Leave any pending command for a cycle with a device
        if !device.is_available() {
            self.collab.tracks.silence(frames);
            self.output.fill_silence();
            return;
        }

        self.atomics.mark_cycle_start();

        if let Ok(envelope) = self.commands.pop() {
            self.apply_command(device, envelope.command);
            if self.acks.push(envelope.serial).is_err() {
                self.dropped_acks.fetch_add(1, Ordering::Relaxed);
            }
        }

        let boundary = {
            let mut io = TransportIo {
                device: &mut *device,
                collab: &mut self.collab,
                notifier: &mut self.notifier,
            };
            self.transport.poll_seek_ack(&mut io);

            if self.idle {
                Boundary::Halt
            } else {
                if !self.transport.step(&mut io, frames) {
                    self.atomics.count_unexpected_transition();
                }
                self.transport.prepare_cycle(&mut io, frames)
            }
        };

        for bus in &mut self.aux {
            bus.fill_silence();
        }
        self.output.fill_silence();

        if boundary == Boundary::Halt {
            self.collab.tracks.silence(frames);
            self.publish();
            return;
        }

        let cycle = self.transport.cycle_info(frames);
        self.collab
            .tracks
            .process(&cycle, &mut self.aux, &mut self.output);

        self.transport.advance(frames);
        self.publish();
    }

    fn apply_command(&mut self, device: &mut dyn AudioDevice, command: Command) {
        let mut io = TransportIo {
            device,
            collab: &mut self.collab,
            notifier: &mut self.notifier,
        };

        match command {
            Command::ResetDevices => io.collab.midi.reset(),
            Command::InitDevices => io.collab.midi.init(),

            // Seeking to the current frame leaves an armed loop alone
            Command::Seek { frame } if frame != self.transport.frame() => {
                self.transport.cancel_loop();
                self.transport.seek(&mut io, frame);
                if io.device.transport_frame() != frame {
                    io.device.seek_transport(frame);
                }
            }
            Command::Seek { .. } => {}
            Command::Play(true) => {
                let frame = self.transport.frame();
                if io.device.transport_frame() != frame {
                    io.device.seek_transport(frame);
                }
                io.device.start_transport();
            }
            Command::Play(false) => {
                self.transport.set_bounce(false);
                io.device.stop_transport();
            }
            Command::ReSync => self.transport.re_sync(&mut io),
            Command::UpdateTimeline(timeline) => self.transport.set_timeline(timeline),
            Command::ReplaceTempoMap(map) => self.transport.replace_tempo_map(&mut io, map),
            Command::SetFreewheel(on) => self.transport.set_freewheel(on),
            Command::SetBounce(on) => self.transport.set_bounce(on),
            Command::SetExternalSync(on) => self.transport.set_external_sync(on),
            Command::SetIdle(on) => {
                self.idle = on;
                io.collab.sequencer.msg_idle(on);
            }

            Command::SetHwCtrlState {
                port,
                channel,
                controller,
                value,
            } => io
                .collab
                .midi
                .set_hw_ctrl_state(port, channel, controller, value),
            Command::SetHwCtrlStates {
                port,
                channel,
                controller,
                value,
                last_value,
            } => io
                .collab
                .midi
                .set_hw_ctrl_states(port, channel, controller, value, last_value),
            Command::PlayMidiEvent(event) => {
                // A full port queue drops the event
                let _ = io.collab.midi.put_event(event);
            }
            Command::Panic => {
                send_controller_to_all(&mut io, CTRL_ALL_SOUND_OFF, 0);
                send_controller_to_all(&mut io, CTRL_RESET_ALL, 0);
            }
            Command::MidiLocalOff => send_controller_to_all(&mut io, CTRL_LOCAL_CONTROL, 0),
            Command::StartMidiLearn => self.midi_learn.reset(),

            Command::Session(op) => io.collab.tracks.apply(&op),
            Command::ApplyOperations(group) => {
                for op in group.iter() {
                    io.collab.tracks.apply(op);
                }
            }

            Command::Wait => {}
        }
    }

    fn publish(&self) {
        let t = &self.transport;
        self.atomics.set_position(t.frame(), t.tick());
        self.atomics.set_state(t.state());
        self.atomics.set_loop_count(t.loop_count());
        self.atomics.set_sync(t.sync_frame(), t.frame_offset());
        self.atomics.set_recording(t.recording());
        self.atomics.set_record_window(&t.record_window());
        self.atomics
            .set_modes(self.idle, t.freewheel(), t.bounce(), t.external_sync());
    }
}

fn send_controller_to_all(io: &mut TransportIo<'_>, controller: u8, value: u8) {
    let midi = &mut io.collab.midi;
    for port in 0..midi.port_count() {
        if !midi.has_device(port) {
            continue;
        }
        for channel in 0..MIDI_CHANNELS as u8 {
            midi.put_event(MidiEvent::controller(port, channel, controller, value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::FreeRunningTransport;
    use crate::engine::collab::{CycleInfo, DeviceState};
    use crate::engine::command::{OperationGroup, SessionOp};
    use crate::engine::gc::gc_handle;
    use crate::engine::testing::{mock_collaborators, tempo_120, Harness, MockDevice};
    use crate::engine::transport::TransportState;
    use crate::tempo::{owned_tempo_map, TempoSegments};
    use crate::types::{LoopBounds, Timeline, CTRL_SUSTAIN};

    const FRAMES: u32 = 512;

    fn harness() -> Harness {
        Harness::new(&EngineConfig::default())
    }

    /// Send one command and run the cycle that applies it
    fn apply(h: &mut Harness, device: &mut MockDevice, command: Command) {
        h.handles.control.send(command).unwrap();
        h.engine.on_cycle(device, FRAMES);
    }

    fn looping(left: u64, right: u64) -> Timeline {
        Timeline {
            loop_enabled: true,
            loop_bounds: LoopBounds::new(left, right),
            ..Default::default()
        }
    }

    #[test]
    fn test_zero_capacity_rings_rejected() {
        let config = EngineConfig {
            ack_capacity: 0,
            ..Default::default()
        };
        let (collab, _, _) = mock_collaborators(1);
        let result = Engine::new(&config, collab, owned_tempo_map(tempo_120()));
        assert!(matches!(result, Err(EngineError::ChannelSetup(_))));
    }

    #[test]
    fn test_seek_while_stopped() {
        let mut h = harness();
        let mut device = MockDevice::default();
        apply(&mut h, &mut device, Command::Seek { frame: 3000 });

        let t = h.engine.transport();
        assert_eq!(t.frame(), 3000);
        assert_eq!(t.tick(), 3);
        assert_eq!(t.state(), TransportState::Stopped);
        assert_eq!(device.seeks, vec![3000]);
        assert_eq!(h.handles.control.poll_acks(), Some(CommandSerial(1)));
        assert_eq!(h.events(), vec![SyncEvent::SeekCompleted]);
        assert_eq!(h.log().disk_seeks, vec![(3000, true)]);
        assert_eq!(h.log().seq_seeks, 1);

        h.engine.on_cycle(&mut device, FRAMES);
        assert_eq!(h.engine.transport().frame(), 3000);
        assert_eq!(h.handles.atomics.frame(), 3000);
    }

    #[test]
    fn test_seek_to_current_frame_is_silent() {
        let mut h = harness();
        let mut device = MockDevice::default();
        apply(&mut h, &mut device, Command::Seek { frame: 3000 });
        apply(&mut h, &mut device, Command::Seek { frame: 3000 });

        assert_eq!(h.events(), vec![SyncEvent::SeekCompleted]);
        assert_eq!(device.seeks, vec![3000]);
        assert_eq!(h.handles.control.poll_acks(), Some(CommandSerial(2)));
    }

    #[test]
    fn test_second_seek_rejected_first_applied() {
        let mut h = harness();
        let mut device = MockDevice::default();
        h.handles.control.send(Command::Seek { frame: 3000 }).unwrap();
        let rejected = h.handles.control.send(Command::Seek { frame: 5000 });
        assert!(matches!(rejected, Err(Command::Seek { frame: 5000 })));

        h.engine.on_cycle(&mut device, FRAMES);
        assert_eq!(h.engine.transport().frame(), 3000);
        assert!(!h.handles.control.is_pending());
    }

    #[test]
    fn test_first_cycle_at_120_bpm() {
        let mut h = harness();
        let mut device = MockDevice::playing();
        h.engine.on_cycle(&mut device, FRAMES);

        assert_eq!(h.engine.transport().frame(), 512);
        assert_eq!(h.engine.transport().tick(), 1);
        assert_eq!(h.events(), vec![SyncEvent::RollStarted]);

        let log = h.log();
        assert_eq!(
            log.processed[0],
            CycleInfo {
                frame: 0,
                frames: FRAMES,
                tick: 0,
                next_tick: 1,
                rolling: true,
                recording: false,
                freewheel: false,
            }
        );
        assert_eq!(log.transport_starts, vec![false]);
        assert_eq!(log.reenabled, 1);
        assert_eq!(log.disk_ticks, vec![(false, true)]);
        drop(log);

        assert_eq!(h.handles.atomics.frame(), 512);
        assert_eq!(h.handles.atomics.tick(), 1);
        assert_eq!(h.handles.atomics.state(), TransportState::Playing);
        assert_eq!(h.engine.output()[0].left, 0.25);
    }

    #[test]
    fn test_position_monotone_while_playing() {
        let mut h = harness();
        let mut device = MockDevice::playing();
        let mut last_tick = 0;
        for cycle in 1..=20u64 {
            h.engine.on_cycle(&mut device, FRAMES);
            let t = h.engine.transport();
            assert_eq!(t.frame(), cycle * u64::from(FRAMES));
            assert!(t.tick() >= last_tick);
            last_tick = t.tick();
        }
        // Consecutive cycles share their tick boundary
        let log = h.log();
        for pair in log.processed.windows(2) {
            assert_eq!(pair[0].next_tick, pair[1].tick);
        }
    }

    #[test]
    fn test_loop_arms_within_look_ahead() {
        let mut h = harness();
        let mut device = MockDevice::default();
        apply(&mut h, &mut device, Command::UpdateTimeline(looping(1000, 2000)));

        device.state = DeviceState::Playing;
        h.engine.on_cycle(&mut device, FRAMES);
        // n = 2000 - 0 - 3 * 512 = 464, restart at 1000 - 464
        assert_eq!(h.engine.transport().state(), TransportState::LoopArmed);
        assert_eq!(h.engine.transport().loop_frame(), 536);
        assert_eq!(h.engine.transport().loop_jump(), 1536);
        assert_eq!(device.seeks, vec![536]);

        device.state = DeviceState::Starting;
        h.engine.on_cycle(&mut device, FRAMES);
        assert_eq!(h.engine.transport().state(), TransportState::LoopConfirmed);

        // Relocated one cycle early: keep playing up to the jump point
        device.state = DeviceState::Playing;
        h.events();
        h.engine.on_cycle(&mut device, FRAMES);
        let t = h.engine.transport();
        assert_eq!(t.state(), TransportState::LoopConfirmed);
        assert_eq!(t.frame(), 1536);
        assert_eq!(t.loop_count(), 0);

        h.engine.on_cycle(&mut device, FRAMES);
        let t = h.engine.transport();
        assert_eq!(t.state(), TransportState::Playing);
        assert_eq!(t.loop_count(), 1);
        assert_eq!(t.frame(), 536 + 512);
        assert_eq!(
            h.events(),
            vec![SyncEvent::SeekCompleted, SyncEvent::RollStarted]
        );
        // Looping doesn't re-seek the prefetch worker
        assert!(h.log().disk_seeks.is_empty());
    }

    /// Run a 1000..20000 loop against a free-running device and return the
    /// number of restarts and every frame the engine rendered from
    fn run_loop(look_ahead_cycles: u32, relocate_cycles: u32) -> (u32, Vec<u64>) {
        let config = EngineConfig {
            look_ahead_cycles,
            ..Default::default()
        };
        let mut h = Harness::new(&config);
        let mut device = FreeRunningTransport::new(relocate_cycles);
        h.engine.prepare(&mut device);

        let steps = [
            Command::UpdateTimeline(looping(1000, 20000)),
            Command::Play(true),
        ];
        for command in steps {
            h.handles.control.send(command).unwrap();
            device.begin_cycle();
            h.engine.on_cycle(&mut device, FRAMES);
            device.end_cycle(FRAMES);
        }

        let mut restarts = 0;
        for _ in 0..300 {
            let before = h.engine.transport().frame();
            let loops_before = h.engine.transport().loop_count();
            let was_rolling = h.engine.transport().state().is_rolling();

            device.begin_cycle();
            h.engine.on_cycle(&mut device, FRAMES);
            device.end_cycle(FRAMES);

            let t = h.engine.transport();
            if t.loop_count() > loops_before {
                let jumped_to = t.frame() - u64::from(FRAMES);
                assert_eq!(
                    before - jumped_to,
                    19000,
                    "relocate {} / look-ahead {}",
                    relocate_cycles,
                    look_ahead_cycles
                );
                restarts += 1;
            } else if was_rolling && t.frame() != before {
                assert_eq!(t.frame(), before + u64::from(FRAMES));
            }
            assert!(t.frame() <= 20000);
        }
        assert_eq!(h.handles.atomics.unexpected_transitions(), 0);

        let frames = h.log().processed.iter().filter(|c| c.rolling).map(|c| c.frame).collect();
        (restarts, frames)
    }

    #[test]
    fn test_loop_length_is_exact_over_restarts() {
        let (restarts, _) = run_loop(3, 2);
        assert!(restarts >= 5, "only {} restarts", restarts);
    }

    #[test]
    fn test_loop_length_exact_for_any_relocation_latency() {
        for (look_ahead, relocate) in [(3, 0), (3, 1), (3, 2), (4, 3)] {
            let (restarts, frames) = run_loop(look_ahead, relocate);
            assert!(restarts >= 5, "relocate {}: only {} restarts", relocate, restarts);
            // Nothing rendered from the right marker onwards
            assert!(frames.iter().all(|&f| f + u64::from(FRAMES) <= 20000));
        }
    }

    #[test]
    fn test_slow_relocation_holds_at_jump_point() {
        // The device needs one cycle more than the look-ahead covers
        let (restarts, frames) = run_loop(3, 3);
        assert!(restarts >= 5, "only {} restarts", restarts);
        assert!(frames.iter().all(|&f| f + u64::from(FRAMES) <= 20000));
    }

    #[test]
    fn test_seek_to_current_frame_keeps_armed_loop() {
        let mut h = harness();
        let mut device = MockDevice::default();
        apply(&mut h, &mut device, Command::UpdateTimeline(looping(1000, 2000)));

        device.state = DeviceState::Playing;
        h.engine.on_cycle(&mut device, FRAMES);
        assert_eq!(h.engine.transport().state(), TransportState::LoopArmed);

        device.state = DeviceState::Starting;
        let current = h.engine.transport().frame();
        apply(&mut h, &mut device, Command::Seek { frame: current });
        assert_eq!(h.engine.transport().state(), TransportState::LoopConfirmed);
        assert_eq!(device.seeks, vec![536]);

        h.engine.on_cycle(&mut device, FRAMES);
        device.state = DeviceState::Playing;
        h.engine.on_cycle(&mut device, FRAMES);
        let t = h.engine.transport();
        assert_eq!(t.state(), TransportState::Playing);
        assert_eq!(t.loop_count(), 1);
        assert_eq!(t.frame(), 536 + 512);
        assert_eq!(t.record_window().start.frame, 0);
    }

    #[test]
    fn test_long_period_runs_in_chunks() {
        let mut h = harness();
        let mut device = MockDevice::playing();
        let mut chunks = Vec::new();
        h.engine
            .run_period(&mut device, 10_000, |offset, out| chunks.push((offset, out.len())));

        assert_eq!(h.engine.transport().frame(), 10_000);
        assert_eq!(
            chunks,
            vec![(0, MAX_BUFFER_SIZE), (MAX_BUFFER_SIZE, 10_000 - MAX_BUFFER_SIZE)]
        );

        h.engine.on_cycle(&mut device, 10_000);
        assert_eq!(h.engine.transport().frame(), 20_000);
        assert_eq!(h.handles.atomics.frame(), 20_000);
    }

    #[test]
    fn test_recording_stop_flushes_disk_and_freezes_window() {
        let mut h = harness();
        let mut device = MockDevice::default();
        let timeline = Timeline {
            record: true,
            ..Default::default()
        };
        apply(&mut h, &mut device, Command::UpdateTimeline(timeline));

        device.state = DeviceState::Playing;
        for _ in 0..3 {
            h.engine.on_cycle(&mut device, FRAMES);
        }
        assert!(h.engine.transport().recording());
        assert_eq!(h.log().disk_ticks.last(), Some(&(true, true)));

        device.state = DeviceState::Stopped;
        h.engine.on_cycle(&mut device, FRAMES);

        let t = h.engine.transport();
        assert!(!t.recording());
        let window = t.record_window();
        assert_eq!(window.start.frame, 0);
        assert_eq!(window.end.frame, 1536);
        assert_eq!(h.log().disk_ticks.last(), Some(&(true, false)));
        assert_eq!(h.handles.atomics.record_window().end.frame, 1536);
    }

    #[test]
    fn test_new_roll_resets_record_window_end() {
        let mut h = harness();
        let mut device = MockDevice::playing();
        for _ in 0..3 {
            h.engine.on_cycle(&mut device, FRAMES);
        }
        device.state = DeviceState::Stopped;
        h.engine.on_cycle(&mut device, FRAMES);
        assert_eq!(h.engine.transport().record_window().end.frame, 1536);

        apply(&mut h, &mut device, Command::Seek { frame: 5000 });
        device.state = DeviceState::Playing;
        h.engine.on_cycle(&mut device, FRAMES);

        let window = h.engine.transport().record_window();
        assert_eq!(window.start.frame, 5000);
        assert_eq!(window.end, window.start);
        let published = h.handles.atomics.record_window();
        assert!(published.end.frame >= published.start.frame);
    }

    #[test]
    fn test_resync_while_rolling_keeps_tick() {
        let mut h = harness();
        let mut device = MockDevice::playing();
        h.engine.on_cycle(&mut device, FRAMES);
        h.engine.on_cycle(&mut device, FRAMES);
        assert_eq!(h.engine.transport().frame(), 1024);
        assert_eq!(h.engine.transport().tick(), 2);

        apply(&mut h, &mut device, Command::ReSync);
        // Tick 2 starts at frame 2000
        assert_eq!(h.log().processed.last().unwrap().frame, 2000);
        assert_eq!(h.engine.transport().frame(), 2512);
    }

    #[test]
    fn test_resync_while_stopped_keeps_frame() {
        let mut h = harness();
        let mut device = MockDevice::default();
        apply(&mut h, &mut device, Command::SetExternalSync(true));

        // Clock ticks run ahead of the tempo map
        h.handles.external_clock.add_ticks(5);
        device.state = DeviceState::Playing;
        h.engine.on_cycle(&mut device, FRAMES);
        device.state = DeviceState::Stopped;
        h.engine.on_cycle(&mut device, FRAMES);
        assert_eq!(h.engine.transport().tick(), 5);

        apply(&mut h, &mut device, Command::ReSync);
        let t = h.engine.transport();
        assert_eq!(t.frame(), 512);
        assert_eq!(t.tick(), 1);
    }

    #[test]
    fn test_sustain_released_before_loop_jump() {
        let mut h = harness();
        let mut device = MockDevice::default();
        apply(
            &mut h,
            &mut device,
            Command::SetHwCtrlState {
                port: 0,
                channel: 3,
                controller: CTRL_SUSTAIN,
                value: 127,
            },
        );
        apply(&mut h, &mut device, Command::UpdateTimeline(looping(1000, 2000)));

        device.state = DeviceState::Playing;
        h.engine.on_cycle(&mut device, FRAMES);
        assert_eq!(
            h.log().midi_events,
            vec![
                MidiEvent::controller(0, 3, CTRL_SUSTAIN, 127),
                MidiEvent::controller(0, 3, CTRL_SUSTAIN, 0),
            ]
        );
    }

    #[test]
    fn test_end_of_song_stops_device() {
        let mut h = harness();
        let mut device = MockDevice::default();
        let timeline = Timeline {
            length_ticks: 1,
            ..Default::default()
        };
        apply(&mut h, &mut device, Command::UpdateTimeline(timeline));

        device.state = DeviceState::Playing;
        h.engine.on_cycle(&mut device, FRAMES);
        assert_eq!(h.engine.transport().tick(), 1);

        h.engine.on_cycle(&mut device, FRAMES);
        assert_eq!(device.stops, 1);
        assert_eq!(h.engine.transport().frame(), 512);
        assert_eq!(h.engine.output().peak(), 0.0);

        device.state = DeviceState::Stopped;
        h.events();
        h.engine.on_cycle(&mut device, FRAMES);
        assert_eq!(h.events(), vec![SyncEvent::RollStopped]);
        assert_eq!(h.log().seq_stops, 1);
        assert_eq!(h.engine.transport().record_window().end.frame, 512);
    }

    #[test]
    fn test_looping_song_runs_past_its_end() {
        let mut h = harness();
        let mut device = MockDevice::default();
        let timeline = Timeline {
            length_ticks: 1,
            ..looping(100_000, 200_000)
        };
        apply(&mut h, &mut device, Command::UpdateTimeline(timeline));

        device.state = DeviceState::Playing;
        for _ in 0..4 {
            h.engine.on_cycle(&mut device, FRAMES);
        }
        assert_eq!(device.stops, 0);
        assert_eq!(h.engine.transport().frame(), 4 * 512);
    }

    #[test]
    fn test_bounce_finishes_at_right_marker() {
        let mut h = harness();
        let mut device = MockDevice::default();
        let timeline = Timeline {
            loop_bounds: LoopBounds::new(0, 1024),
            ..Default::default()
        };
        apply(&mut h, &mut device, Command::UpdateTimeline(timeline));
        apply(&mut h, &mut device, Command::SetBounce(true));

        device.state = DeviceState::Playing;
        h.engine.on_cycle(&mut device, FRAMES);
        assert_eq!(
            h.events(),
            vec![SyncEvent::RollStarted, SyncEvent::BounceStarted]
        );

        h.engine.on_cycle(&mut device, FRAMES);
        h.engine.on_cycle(&mut device, FRAMES);
        assert_eq!(h.events(), vec![SyncEvent::BounceFinished]);
        assert!(!h.engine.transport().bounce());
        assert_eq!(h.engine.transport().frame(), 1024);
        assert!(!h.handles.atomics.bounce());
    }

    #[test]
    fn test_bounce_restarts_aborted_start() {
        let mut h = harness();
        let mut device = MockDevice::default();
        apply(&mut h, &mut device, Command::SetBounce(true));

        device.state = DeviceState::Starting;
        h.engine.on_cycle(&mut device, FRAMES);
        assert_eq!(h.engine.transport().state(), TransportState::StartingPlay);

        device.state = DeviceState::Stopped;
        h.engine.on_cycle(&mut device, FRAMES);
        assert_eq!(device.starts, 1);
        assert!(!h.events().contains(&SyncEvent::RollAborted));
    }

    #[test]
    fn test_aborted_start_posts_roll_aborted() {
        let mut h = harness();
        let mut device = MockDevice {
            state: DeviceState::Starting,
            ..Default::default()
        };
        h.engine.on_cycle(&mut device, FRAMES);
        assert_eq!(h.engine.transport().state(), TransportState::StartingPlay);

        device.state = DeviceState::Stopped;
        h.engine.on_cycle(&mut device, FRAMES);
        assert_eq!(h.engine.transport().state(), TransportState::Stopped);
        assert_eq!(h.events(), vec![SyncEvent::RollAborted]);
    }

    #[test]
    fn test_relocation_waits_for_prefetch() {
        let mut h = harness();
        let mut device = MockDevice {
            state: DeviceState::Starting,
            transport_frame: 8000,
            ..Default::default()
        };
        h.seek_done.store(false, Ordering::Relaxed);
        h.engine.on_cycle(&mut device, FRAMES);
        assert_eq!(h.engine.transport().state(), TransportState::Syncing);
        assert_eq!(h.engine.transport().frame(), 8000);

        h.engine.on_cycle(&mut device, FRAMES);
        assert_eq!(h.engine.transport().state(), TransportState::Syncing);

        h.seek_done.store(true, Ordering::Relaxed);
        h.engine.on_cycle(&mut device, FRAMES);
        assert_eq!(h.engine.transport().state(), TransportState::StartingPlay);

        device.state = DeviceState::Playing;
        h.engine.on_cycle(&mut device, FRAMES);
        assert_eq!(h.engine.transport().state(), TransportState::Playing);
        assert_eq!(h.engine.transport().frame(), 8000 + 512);
        // Resuming mid-song sends continue, not start
        assert_eq!(h.log().transport_starts, vec![true]);
    }

    #[test]
    fn test_external_sync_takes_clock_ticks() {
        let mut h = harness();
        let mut device = MockDevice::default();
        h.handles.external_clock.add_ticks(9);
        apply(&mut h, &mut device, Command::SetExternalSync(true));
        assert_eq!(h.handles.external_clock.pending(), 0);

        h.handles.external_clock.add_ticks(5);
        device.state = DeviceState::Playing;
        h.engine.on_cycle(&mut device, FRAMES);

        assert_eq!(h.engine.transport().tick(), 5);
        assert_eq!(h.engine.transport().frame(), 512);
        assert!(h.log().transport_starts.is_empty());
        assert!(h.handles.atomics.external_sync());
    }

    #[test]
    fn test_device_timebase_drives_ticks() {
        let config = EngineConfig {
            follow_device_timebase: true,
            ..Default::default()
        };
        let mut h = Harness::new(&config);
        let mut device = MockDevice {
            timebase: Some(crate::engine::collab::TimebaseTicks {
                current: 40,
                delta: 2,
            }),
            ..MockDevice::playing()
        };
        h.engine.on_cycle(&mut device, FRAMES);
        assert_eq!(h.log().processed[0].tick, 40);
        assert_eq!(h.engine.transport().tick(), 42);
    }

    #[test]
    fn test_replace_tempo_map_while_stopped_keeps_frame() {
        let mut h = harness();
        let mut device = MockDevice::default();
        apply(&mut h, &mut device, Command::Seek { frame: 3000 });

        let faster = TempoSegments::constant(48000, 24, 240.0).unwrap();
        apply(
            &mut h,
            &mut device,
            Command::ReplaceTempoMap(owned_tempo_map(faster)),
        );
        assert_eq!(h.engine.transport().frame(), 3000);
        assert_eq!(h.engine.transport().tick(), 6);
    }

    #[test]
    fn test_replace_tempo_map_while_rolling_keeps_tick() {
        let mut h = harness();
        let mut device = MockDevice::playing();
        h.engine.on_cycle(&mut device, FRAMES);
        h.engine.on_cycle(&mut device, FRAMES);
        assert_eq!(h.engine.transport().tick(), 2);

        // 500 frames per tick: tick 2 sits at frame 1000
        let faster = TempoSegments::constant(48000, 24, 240.0).unwrap();
        apply(
            &mut h,
            &mut device,
            Command::ReplaceTempoMap(owned_tempo_map(faster)),
        );
        assert_eq!(h.log().processed.last().map(|c| c.frame), Some(1000));
        assert_eq!(h.engine.transport().frame(), 1512);
        assert_eq!(h.engine.transport().tick(), 4);
    }

    #[test]
    fn test_recording_defers_seek_notification() {
        let mut h = harness();
        let mut device = MockDevice::default();
        let timeline = Timeline {
            record: true,
            ..Default::default()
        };
        apply(&mut h, &mut device, Command::UpdateTimeline(timeline));

        device.state = DeviceState::Playing;
        h.engine.on_cycle(&mut device, FRAMES);
        assert!(h.engine.transport().recording());
        assert_eq!(h.log().meter_resets, 1);
        h.events();

        h.seek_done.store(false, Ordering::Relaxed);
        apply(&mut h, &mut device, Command::Seek { frame: 5000 });
        assert!(h.events().is_empty());
        assert!(h.engine.transport().seek_ack_pending());

        h.seek_done.store(true, Ordering::Relaxed);
        h.engine.on_cycle(&mut device, FRAMES);
        assert_eq!(h.events(), vec![SyncEvent::SeekCompleted]);
        assert_eq!(h.engine.transport().record_window().start.frame, 0);
    }

    #[test]
    fn test_precount_delays_roll() {
        let mut config = EngineConfig::default();
        config.precount.enabled = true;
        config.precount.signature_from_tempo_map = false;
        config.precount.numerator = 1;
        config.precount.denominator = 4;
        let mut h = Harness::new(&config);
        let mut device = MockDevice::default();
        let timeline = Timeline {
            record: true,
            click: true,
            ..Default::default()
        };
        apply(&mut h, &mut device, Command::UpdateTimeline(timeline));

        // One quarter at 120 BPM: 24000 frames, six cycles of 4000
        device.state = DeviceState::Playing;
        for _ in 0..6 {
            h.engine.on_cycle(&mut device, 4000);
            assert_eq!(h.engine.transport().state(), TransportState::PreCount);
            assert_eq!(h.engine.transport().frame(), 0);
        }
        assert!(h.events().is_empty());

        h.engine.on_cycle(&mut device, 4000);
        assert_eq!(h.engine.transport().state(), TransportState::Playing);
        assert_eq!(h.engine.transport().frame(), 4000);
        assert!(h.engine.transport().recording());
        assert_eq!(h.events(), vec![SyncEvent::RollStarted]);
    }

    #[test]
    fn test_unexpected_transition_is_counted() {
        let mut config = EngineConfig::default();
        config.precount.enabled = true;
        let mut h = Harness::new(&config);
        let mut device = MockDevice::default();
        let timeline = Timeline {
            record: true,
            click: true,
            ..Default::default()
        };
        apply(&mut h, &mut device, Command::UpdateTimeline(timeline));
        device.state = DeviceState::Playing;
        h.engine.on_cycle(&mut device, FRAMES);
        assert_eq!(h.engine.transport().state(), TransportState::PreCount);

        device.state = DeviceState::Starting;
        h.engine.on_cycle(&mut device, FRAMES);
        h.engine.on_cycle(&mut device, FRAMES);
        assert_eq!(h.handles.atomics.unexpected_transitions(), 2);
        assert_eq!(h.engine.transport().state(), TransportState::PreCount);
    }

    #[test]
    fn test_idle_outputs_silence() {
        let mut h = harness();
        let mut device = MockDevice::default();
        apply(&mut h, &mut device, Command::SetIdle(true));
        assert_eq!(h.log().seq_idle, vec![true]);

        device.state = DeviceState::Playing;
        h.engine.on_cycle(&mut device, FRAMES);
        assert!(h.log().processed.is_empty());
        assert_eq!(h.engine.transport().frame(), 0);
        assert_eq!(h.engine.output().peak(), 0.0);
        assert!(h.handles.atomics.idle());

        apply(&mut h, &mut device, Command::SetIdle(false));
        assert_eq!(h.engine.transport().state(), TransportState::Playing);
    }

    #[test]
    fn test_unavailable_device_keeps_command_pending() {
        let mut h = harness();
        let mut device = MockDevice {
            available: false,
            ..Default::default()
        };
        h.handles.control.send(Command::Seek { frame: 3000 }).unwrap();
        h.engine.on_cycle(&mut device, FRAMES);
        assert_eq!(h.engine.transport().frame(), 0);
        assert_eq!(h.log().silenced, 1);
        assert!(h.handles.control.is_pending());

        device.available = true;
        h.engine.on_cycle(&mut device, FRAMES);
        assert_eq!(h.engine.transport().frame(), 3000);
    }

    #[test]
    fn test_panic_and_local_off_reach_every_channel() {
        let mut h = Harness::with_ports(&EngineConfig::default(), 2);
        let mut device = MockDevice::default();
        apply(&mut h, &mut device, Command::Panic);
        assert_eq!(h.log().midi_events.len(), 2 * MIDI_CHANNELS * 2);

        apply(&mut h, &mut device, Command::MidiLocalOff);
        let log = h.log();
        let last = log.midi_events.last().copied();
        assert_eq!(log.midi_events.len(), 2 * MIDI_CHANNELS * 3);
        assert_eq!(last, Some(MidiEvent::controller(1, 15, CTRL_LOCAL_CONTROL, 0)));
    }

    #[test]
    fn test_session_operations_applied_in_order() {
        let mut h = harness();
        let mut device = MockDevice::default();
        let group = OperationGroup::new()
            .with(SessionOp::SetMute { track: 1, on: true })
            .with(SessionOp::SetSolo { track: 2, on: true });
        apply(
            &mut h,
            &mut device,
            Command::ApplyOperations(Owned::new(&gc_handle(), group)),
        );
        apply(
            &mut h,
            &mut device,
            Command::Session(SessionOp::RemoveAllRoutes { track: 1 }),
        );
        assert_eq!(
            h.log().ops,
            vec![
                SessionOp::SetMute { track: 1, on: true },
                SessionOp::SetSolo { track: 2, on: true },
                SessionOp::RemoveAllRoutes { track: 1 },
            ]
        );
    }

    #[test]
    fn test_midi_learn_reset() {
        let mut h = harness();
        let mut device = MockDevice::default();
        h.handles.midi_learn.capture(0, 1, 7);
        apply(&mut h, &mut device, Command::StartMidiLearn);
        assert_eq!(h.handles.midi_learn.captured(), None);
    }

    #[test]
    fn test_aux_buses_cleared_every_cycle() {
        let config = EngineConfig {
            aux_buses: 3,
            ..Default::default()
        };
        let mut h = Harness::new(&config);
        let mut device = MockDevice::playing();
        // The mock tracks assert the buses arrive silent, then dirty them
        for _ in 0..3 {
            h.engine.on_cycle(&mut device, FRAMES);
        }
        assert_eq!(h.log().processed.len(), 3);
    }

    #[test]
    fn test_prepare_locates_device() {
        let mut h = harness();
        let mut device = MockDevice::playing();
        h.engine.prepare(&mut device);
        assert_eq!(device.stops, 1);
        assert_eq!(device.seeks, vec![0]);
    }

    #[test]
    fn test_play_locates_device_first() {
        let mut h = harness();
        let mut device = MockDevice::default();
        apply(&mut h, &mut device, Command::Seek { frame: 3000 });
        device.transport_frame = 0;
        apply(&mut h, &mut device, Command::Play(true));
        assert_eq!(device.seeks, vec![3000, 3000]);
        assert_eq!(device.starts, 1);

        apply(&mut h, &mut device, Command::Play(false));
        assert_eq!(device.stops, 1);
    }

    #[test]
    fn test_shutdown_posts_event() {
        let mut h = harness();
        h.engine.shutdown();
        assert_eq!(h.events(), vec![SyncEvent::Shutdown]);
    }
}
