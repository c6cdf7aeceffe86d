//! Transport state machine
//!
//! Owns the engine's idea of where playback is (frame, tick), what it is
//! doing ([`TransportState`]), the loop restart point and the record window.
//! Once per cycle the driver compares the engine state with the state the
//! audio device reports and applies the resulting [`Transition`]; the device
//! is always treated as ground truth.
//!
//! # Transition table
//!
//! ```text
//! engine \ device   Stopped         Starting        Playing
//! ──────────────────────────────────────────────────────────────
//! Stopped           Steady          Relocate        BeginRoll
//! StartingPlay      AbortStart      FollowSeek      BeginRoll
//! Playing           StopRoll        Relocate        Steady
//! LoopArmed         StopRoll        ConfirmLoop     ConfirmLoop
//! LoopConfirmed     StopRoll        SyncCycle       RestartLoop
//! Syncing           SettleStopped   AwaitSeek       BeginRoll
//! PreCount          StopRoll        Unexpected      CountIn
//! ```
//!
//! # Loop arming
//!
//! Looping is decided [`TransportOptions::look_ahead_cycles`] cycles ahead so
//! the device has time to relocate. With `n = right - pos - N * frames`, the
//! loop arms once `0 <= n < frames` and the restart frame is `left - n`: the
//! audio that would have played past `right - n` continues from `left - n`,
//! which keeps the loop length at exactly `right - left` frames. The restart
//! happens when the engine reaches `right - n` ([`Transport::loop_jump`]);
//! a device that has not finished relocating by then holds the engine at
//! the jump point in silence.

use std::sync::Arc;

use basedrop::Owned;

use super::atomics::ExternalClock;
use super::collab::{AudioDevice, Collaborators, CycleInfo, DeviceState};
use super::command::MidiEvent;
use super::sync::{SyncEvent, SyncNotifier};
use crate::config::PreCountConfig;
use crate::tempo::{PositionTranslator, TempoMap, TimeSignature};
use crate::types::{Position, PositionKind, RecordWindow, Timeline, CTRL_SUSTAIN, MIDI_CHANNELS};

/// Engine transport state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransportState {
    Stopped = 0,
    /// Waiting for the device to finish starting
    StartingPlay = 1,
    Playing = 2,
    /// Loop end is within the look-ahead window, device asked to relocate
    LoopArmed = 3,
    /// Device acknowledged the loop relocation
    LoopConfirmed = 4,
    /// Device relocated; waiting for the prefetch worker to catch up
    Syncing = 5,
    /// Count-in before a recording roll
    PreCount = 6,
}

impl TransportState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => TransportState::StartingPlay,
            2 => TransportState::Playing,
            3 => TransportState::LoopArmed,
            4 => TransportState::LoopConfirmed,
            5 => TransportState::Syncing,
            6 => TransportState::PreCount,
            _ => TransportState::Stopped,
        }
    }

    /// Position advances in these states
    #[inline]
    pub fn is_rolling(self) -> bool {
        matches!(
            self,
            TransportState::Playing | TransportState::LoopArmed | TransportState::LoopConfirmed
        )
    }

    /// Rolling or counting in
    #[inline]
    pub fn is_active(self) -> bool {
        self.is_rolling() || self == TransportState::PreCount
    }

    pub fn name(self) -> &'static str {
        match self {
            TransportState::Stopped => "Stopped",
            TransportState::StartingPlay => "StartingPlay",
            TransportState::Playing => "Playing",
            TransportState::LoopArmed => "LoopArmed",
            TransportState::LoopConfirmed => "LoopConfirmed",
            TransportState::Syncing => "Syncing",
            TransportState::PreCount => "PreCount",
        }
    }
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Action selected by comparing engine and device state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// States agree, nothing to do
    Steady,
    /// Reset loop counter, re-arm touched controllers, start rolling
    BeginRoll,
    /// Count the loop, seek to the loop frame, start rolling
    RestartLoop,
    /// Flush the disk tick, freeze the record window, stop rolling
    StopRoll,
    /// Device stopped before it started rolling
    AbortStart,
    /// Device took the loop relocation
    ConfirmLoop,
    /// Device still relocating for the loop
    SyncCycle,
    /// Device relocating its transport: follow it
    Relocate,
    /// Waiting for the prefetch worker after a relocation
    AwaitSeek,
    /// Device still starting; follow any further relocation
    FollowSeek,
    /// Relocation finished while stopped
    SettleStopped,
    /// Count-in running
    CountIn,
    /// Combination the table does not model
    Unexpected,
}

/// Exhaustive transition table
pub fn transition(state: TransportState, device: DeviceState) -> Transition {
    use DeviceState as D;
    use TransportState as S;

    match (state, device) {
        (S::Stopped, D::Stopped) => Transition::Steady,
        (S::Stopped, D::Starting) => Transition::Relocate,
        (S::Stopped, D::Playing) => Transition::BeginRoll,

        (S::StartingPlay, D::Stopped) => Transition::AbortStart,
        (S::StartingPlay, D::Starting) => Transition::FollowSeek,
        (S::StartingPlay, D::Playing) => Transition::BeginRoll,

        (S::Playing, D::Stopped) => Transition::StopRoll,
        (S::Playing, D::Starting) => Transition::Relocate,
        (S::Playing, D::Playing) => Transition::Steady,

        (S::LoopArmed, D::Stopped) => Transition::StopRoll,
        (S::LoopArmed, D::Starting) => Transition::ConfirmLoop,
        (S::LoopArmed, D::Playing) => Transition::ConfirmLoop,

        (S::LoopConfirmed, D::Stopped) => Transition::StopRoll,
        (S::LoopConfirmed, D::Starting) => Transition::SyncCycle,
        (S::LoopConfirmed, D::Playing) => Transition::RestartLoop,

        (S::Syncing, D::Stopped) => Transition::SettleStopped,
        (S::Syncing, D::Starting) => Transition::AwaitSeek,
        (S::Syncing, D::Playing) => Transition::BeginRoll,

        (S::PreCount, D::Stopped) => Transition::StopRoll,
        (S::PreCount, D::Starting) => Transition::Unexpected,
        (S::PreCount, D::Playing) => Transition::CountIn,
    }
}

/// Whether the driver should go on to process the cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// Process `[pos, pos + frames)` and advance
    Run,
    /// Stop here: deliver silence, don't advance
    Halt,
}

/// Static transport tuning, taken from `EngineConfig`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportOptions {
    /// Cycles of look-ahead used when arming a loop
    pub look_ahead_cycles: u32,
    /// Count-in before recording
    pub precount: PreCountConfig,
    /// Take the tick from the device timebase when it offers one
    pub follow_timebase: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            look_ahead_cycles: 3,
            precount: PreCountConfig::default(),
            follow_timebase: false,
        }
    }
}

/// Everything a transport action may touch during a cycle
pub struct TransportIo<'a> {
    pub device: &'a mut dyn AudioDevice,
    pub collab: &'a mut Collaborators,
    pub notifier: &'a mut SyncNotifier,
}

/// The transport state machine
pub struct Transport {
    state: TransportState,
    /// Current frame (start of the next cycle)
    pos: u64,
    cur_tick: u64,
    next_tick: u64,
    kind: PositionKind,
    loop_frame: u64,
    /// Frame at which an armed loop jumps back to `loop_frame`
    loop_jump: u64,
    loop_count: u32,
    sync_frame: u64,
    frame_offset: i64,
    record: RecordWindow,
    recording: bool,
    timeline: Timeline,
    translator: PositionTranslator,
    external_clock: Arc<ExternalClock>,
    freewheel: bool,
    bounce: bool,
    external_sync: bool,
    /// A seek notification is waiting on the prefetch worker
    seek_ack_pending: bool,
    precount_remaining: u64,
    last_unexpected: Option<(TransportState, DeviceState)>,
    options: TransportOptions,
}

impl Transport {
    pub fn new(
        options: TransportOptions,
        translator: PositionTranslator,
        external_clock: Arc<ExternalClock>,
    ) -> Self {
        Self {
            state: TransportState::Stopped,
            pos: 0,
            cur_tick: 0,
            next_tick: 0,
            kind: PositionKind::Frames,
            loop_frame: 0,
            loop_jump: 0,
            loop_count: 0,
            sync_frame: 0,
            frame_offset: 0,
            record: RecordWindow::default(),
            recording: false,
            timeline: Timeline::default(),
            translator,
            external_clock,
            freewheel: false,
            bounce: false,
            external_sync: false,
            seek_ack_pending: false,
            precount_remaining: 0,
            last_unexpected: None,
            options,
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────

    #[inline]
    pub fn state(&self) -> TransportState {
        self.state
    }

    #[inline]
    pub fn frame(&self) -> u64 {
        self.pos
    }

    #[inline]
    pub fn tick(&self) -> u64 {
        self.cur_tick
    }

    /// Tick boundary computed for the current cycle
    #[inline]
    pub fn next_tick(&self) -> u64 {
        self.next_tick
    }

    pub fn position(&self) -> Position {
        Position {
            frame: self.pos,
            tick: self.cur_tick,
            kind: self.kind,
        }
    }

    pub fn loop_frame(&self) -> u64 {
        self.loop_frame
    }

    pub fn loop_jump(&self) -> u64 {
        self.loop_jump
    }

    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }

    pub fn sync_frame(&self) -> u64 {
        self.sync_frame
    }

    pub fn frame_offset(&self) -> i64 {
        self.frame_offset
    }

    pub fn record_window(&self) -> RecordWindow {
        self.record
    }

    pub fn recording(&self) -> bool {
        self.recording
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn translator(&self) -> &PositionTranslator {
        &self.translator
    }

    pub fn freewheel(&self) -> bool {
        self.freewheel
    }

    pub fn bounce(&self) -> bool {
        self.bounce
    }

    pub fn external_sync(&self) -> bool {
        self.external_sync
    }

    pub fn seek_ack_pending(&self) -> bool {
        self.seek_ack_pending
    }

    pub fn precount_remaining(&self) -> u64 {
        self.precount_remaining
    }

    pub fn cycle_info(&self, frames: u32) -> CycleInfo {
        CycleInfo {
            frame: self.pos,
            frames,
            tick: self.cur_tick,
            next_tick: self.next_tick,
            rolling: self.state.is_rolling(),
            recording: self.recording,
            freewheel: self.freewheel,
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Mode setters (applied from commands)
    // ─────────────────────────────────────────────────────────────

    pub fn set_timeline(&mut self, timeline: Timeline) {
        self.timeline = timeline;
    }

    pub fn set_freewheel(&mut self, on: bool) {
        self.freewheel = on;
    }

    pub fn set_bounce(&mut self, on: bool) {
        self.bounce = on;
    }

    pub fn set_external_sync(&mut self, on: bool) {
        if on && !self.external_sync {
            // Ticks counted before slaving belong to no cycle
            self.external_clock.take_ticks();
        }
        self.external_sync = on;
    }

    /// Drop an armed loop so an explicit seek isn't overridden by the restart
    pub fn cancel_loop(&mut self) {
        if matches!(
            self.state,
            TransportState::LoopArmed | TransportState::LoopConfirmed
        ) {
            self.state = TransportState::Playing;
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Seek / re-sync
    // ─────────────────────────────────────────────────────────────

    /// Device clock vs engine frame skew
    fn resync_clock(&mut self, device: &dyn AudioDevice) {
        self.sync_frame = device.frame_pos();
        self.frame_offset = self.sync_frame as i64 - self.pos as i64;
    }

    /// Locate to `frame`
    ///
    /// Returns false when `frame` is already the current frame (no-op, no
    /// notification). Seek completion is posted immediately unless recording
    /// or freewheeling, in which case it waits for the prefetch worker.
    pub fn seek(&mut self, io: &mut TransportIo<'_>, frame: u64) -> bool {
        if frame == self.pos {
            return false;
        }
        self.pos = frame;
        self.kind = PositionKind::Frames;
        self.resync_clock(io.device);
        self.cur_tick = self.translator.frame_to_tick_ceil(frame);
        self.next_tick = self.cur_tick;

        io.collab.sequencer.msg_seek();
        if self.state != TransportState::LoopConfirmed && !self.freewheel {
            io.collab.prefetch.msg_seek(frame, true);
        }

        if self.recording || self.freewheel {
            self.seek_ack_pending = true;
        } else {
            self.seek_ack_pending = false;
            io.notifier.notify(SyncEvent::SeekCompleted);
        }
        true
    }

    /// Post a deferred seek completion once the prefetch worker is done
    pub fn poll_seek_ack(&mut self, io: &mut TransportIo<'_>) {
        if self.seek_ack_pending && io.collab.prefetch.seek_done() {
            self.seek_ack_pending = false;
            io.notifier.notify(SyncEvent::SeekCompleted);
        }
    }

    /// Re-derive position after a tempo map or marker change
    ///
    /// While rolling the tick stays put and the frame follows; while stopped
    /// the frame stays put and the tick follows.
    pub fn re_sync(&mut self, io: &mut TransportIo<'_>) {
        if self.state.is_rolling() {
            self.pos = self.translator.tick_to_frame(self.cur_tick);
            self.kind = PositionKind::Ticks;
        } else {
            self.cur_tick = self.translator.frame_to_tick_ceil(self.pos);
            self.kind = PositionKind::Frames;
        }
        self.next_tick = self.cur_tick;
        self.resync_clock(io.device);
    }

    /// Install a new tempo map; the old one goes to the GC thread
    pub fn replace_tempo_map(&mut self, io: &mut TransportIo<'_>, map: Owned<Box<dyn TempoMap>>) {
        drop(self.translator.replace(map));
        self.re_sync(io);
    }

    // ─────────────────────────────────────────────────────────────
    // State transitions
    // ─────────────────────────────────────────────────────────────

    fn prefetch_ready(&self, io: &TransportIo<'_>) -> bool {
        self.freewheel || io.collab.prefetch.seek_done()
    }

    /// Apply the transition for this cycle
    ///
    /// Returns false if the engine/device combination was unexpected.
    pub fn step(&mut self, io: &mut TransportIo<'_>, frames: u32) -> bool {
        let device_state = io.device.state();
        let action = transition(self.state, device_state);

        if action != Transition::Unexpected {
            self.last_unexpected = None;
        }

        match action {
            Transition::Steady | Transition::SyncCycle => {}
            Transition::BeginRoll => self.begin_roll(io),
            Transition::RestartLoop => {
                // A device that relocated early waits for the jump point
                if self.pos >= self.loop_jump {
                    self.restart_loop(io);
                }
            }
            Transition::StopRoll => self.stop_rolling(io),
            Transition::AbortStart => {
                self.state = TransportState::Stopped;
                if self.bounce {
                    io.device.start_transport();
                } else {
                    io.notifier.notify(SyncEvent::RollAborted);
                }
            }
            Transition::ConfirmLoop => {
                self.state = TransportState::LoopConfirmed;
                if device_state == DeviceState::Playing && self.pos >= self.loop_jump {
                    self.restart_loop(io);
                }
            }
            Transition::Relocate => {
                let frame = io.device.transport_frame();
                self.seek(io, frame);
                self.state = if self.prefetch_ready(io) {
                    TransportState::StartingPlay
                } else {
                    TransportState::Syncing
                };
            }
            Transition::AwaitSeek => {
                if self.prefetch_ready(io) {
                    self.state = TransportState::StartingPlay;
                }
            }
            Transition::FollowSeek => {
                let frame = io.device.transport_frame();
                if frame != self.pos {
                    self.seek(io, frame);
                }
            }
            Transition::SettleStopped => self.state = TransportState::Stopped,
            Transition::CountIn => {
                self.precount_remaining = self.precount_remaining.saturating_sub(u64::from(frames));
                if self.precount_remaining == 0 {
                    self.start_rolling(io);
                }
            }
            Transition::Unexpected => {
                let pair = (self.state, device_state);
                if self.last_unexpected != Some(pair) {
                    log::warn!(
                        "Unexpected transport transition {} -> {:?}",
                        self.state,
                        device_state
                    );
                    self.last_unexpected = Some(pair);
                }
                return false;
            }
        }
        true
    }

    /// Jump back into the loop, carrying any overshoot past the jump point
    fn restart_loop(&mut self, io: &mut TransportIo<'_>) {
        self.loop_count += 1;
        let frame = self.loop_frame + (self.pos - self.loop_jump);
        self.seek(io, frame);
        self.start_rolling(io);
    }

    fn begin_roll(&mut self, io: &mut TransportIo<'_>) {
        self.loop_count = 0;
        io.collab.tracks.reenable_touched_controllers();

        let precount = self.options.precount;
        if precount.enabled && self.timeline.click && !self.external_sync && self.timeline.record {
            let sig = if precount.signature_from_tempo_map {
                self.translator.time_signature(self.cur_tick)
            } else {
                TimeSignature::new(precount.numerator, precount.denominator)
            };
            let beats = u64::from(sig.numerator) * u64::from(precount.measures);
            let ticks = sig.beat_ticks(self.translator.ticks_per_quarter()) * beats;
            self.precount_remaining = self.translator.span_frames(self.cur_tick, ticks);
        } else {
            self.precount_remaining = 0;
        }

        if self.precount_remaining > 0 {
            self.state = TransportState::PreCount;
        } else {
            self.start_rolling(io);
        }

        if self.bounce {
            io.notifier.notify(SyncEvent::BounceStarted);
        }
    }

    fn start_rolling(&mut self, io: &mut TransportIo<'_>) {
        if self.loop_count == 0 {
            self.record.start = Position::from_frame(self.pos, self.cur_tick);
            self.record.end = self.record.start;
        }
        if self.timeline.record {
            self.recording = true;
            io.collab.tracks.reset_meters();
        }
        self.state = TransportState::Playing;
        self.precount_remaining = 0;
        io.notifier.notify(SyncEvent::RollStarted);

        // With external sync the clock master drives MIDI transport
        if !self.external_sync {
            io.collab.midi.send_transport_start(self.cur_tick != 0);
        }

        self.send_sustain(io, 127);
    }

    fn stop_rolling(&mut self, io: &mut TransportIo<'_>) {
        self.state = TransportState::Stopped;
        self.precount_remaining = 0;
        io.collab.sequencer.msg_stop();
        if !self.freewheel {
            io.collab.prefetch.msg_tick(self.recording, false);
        }
        io.collab.tracks.reset_meters();
        self.recording = false;
        self.record.end = Position::from_frame(self.pos, self.cur_tick);
        io.notifier.notify(SyncEvent::RollStopped);
    }

    /// Send `value` on the sustain controller of every channel whose
    /// hardware sustain is held down
    fn send_sustain(&mut self, io: &mut TransportIo<'_>, value: u8) {
        let midi = &mut io.collab.midi;
        for port in 0..midi.port_count() {
            if !midi.has_device(port) {
                continue;
            }
            for channel in 0..MIDI_CHANNELS as u8 {
                if midi.hw_ctrl_state(port, channel, CTRL_SUSTAIN) == Some(127) {
                    midi.put_event(MidiEvent::controller(port, channel, CTRL_SUSTAIN, value));
                }
            }
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Per-cycle boundary
    // ─────────────────────────────────────────────────────────────

    /// Compute the tick boundary of this cycle and run end/loop checks
    pub fn prepare_cycle(&mut self, io: &mut TransportIo<'_>, frames: u32) -> Boundary {
        let span = u64::from(frames);

        if !self.state.is_rolling() {
            self.next_tick = self.cur_tick;
            self.resync_clock(io.device);
            return Boundary::Run;
        }

        if !self.freewheel {
            io.collab.prefetch.msg_tick(self.recording, true);
        }

        if self.bounce && self.pos >= self.timeline.loop_bounds.right {
            self.bounce = false;
            io.notifier.notify(SyncEvent::BounceFinished);
            return Boundary::Halt;
        }

        // Device still relocating at the jump point: hold rather than play
        // past the right marker
        if matches!(
            self.state,
            TransportState::LoopArmed | TransportState::LoopConfirmed
        ) && self.pos >= self.loop_jump
        {
            self.next_tick = self.cur_tick;
            return Boundary::Halt;
        }

        let timebase = if self.options.follow_timebase && !self.external_sync {
            io.device.timebase(frames)
        } else {
            None
        };
        if let Some(tb) = timebase {
            self.cur_tick = tb.current;
        }

        if self.cur_tick >= self.timeline.length_ticks
            && !(self.timeline.record || self.bounce || self.timeline.loop_enabled)
        {
            io.device.stop_transport();
            return Boundary::Halt;
        }

        if self.state == TransportState::Playing
            && self.timeline.loop_active()
            && !self.bounce
            && !self.external_sync
        {
            self.arm_loop(io, span);
        }

        self.next_tick = if self.external_sync {
            self.cur_tick + self.external_clock.take_ticks()
        } else if let Some(tb) = timebase {
            self.cur_tick + tb.delta
        } else {
            self.translator.frame_to_tick_ceil(self.pos + span)
        };

        self.resync_clock(io.device);
        Boundary::Run
    }

    fn arm_loop(&mut self, io: &mut TransportIo<'_>, frames: u64) {
        let bounds = self.timeline.loop_bounds;
        let look_ahead = u64::from(self.options.look_ahead_cycles) * frames;
        let Some(n) = bounds
            .right
            .checked_sub(self.pos)
            .and_then(|d| d.checked_sub(look_ahead))
        else {
            return;
        };
        if n >= frames {
            return;
        }

        self.loop_jump = bounds.right - n;
        let n = if n > bounds.left { 0 } else { n };
        self.state = TransportState::LoopArmed;
        self.loop_frame = bounds.left - n;

        // Release held notes before the jump
        self.send_sustain(io, 0);

        io.device.seek_transport(self.loop_frame);
    }

    /// Advance after processing: `pos += frames`, `tick = next_tick`
    pub fn advance(&mut self, frames: u32) {
        if self.state.is_rolling() {
            self.pos += u64::from(frames);
            self.cur_tick = self.next_tick;
            self.kind = PositionKind::Frames;
        }
    }
}
