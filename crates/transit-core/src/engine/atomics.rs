//! Lock-free state shared between the audio thread and control threads
//!
//! The audio thread is the only writer of [`TransportAtomics`]; control threads
//! read with relaxed ordering. [`ExternalClock`] and [`MidiLearn`] go the other
//! way: MIDI input threads write, the audio thread reads.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

use crossbeam::utils::CachePadded;

use super::transport::TransportState;
use crate::types::{MidiPortId, Position, RecordWindow};

/// Transport state published once per cycle
pub struct TransportAtomics {
    /// Engine frame at the start of the next cycle
    frame: CachePadded<AtomicU64>,
    /// Engine tick at the start of the next cycle
    tick: AtomicU64,
    state: AtomicU8,
    loop_count: AtomicU32,
    /// Device clock at the last cycle start
    sync_frame: AtomicU64,
    /// Device clock minus engine frame
    frame_offset: AtomicI64,
    /// Nanoseconds since `epoch` at the last cycle start
    cycle_start_ns: AtomicU64,
    epoch: Instant,
    record_start_frame: AtomicU64,
    record_start_tick: AtomicU64,
    record_end_frame: AtomicU64,
    record_end_tick: AtomicU64,
    recording: AtomicBool,
    idle: AtomicBool,
    freewheel: AtomicBool,
    bounce: AtomicBool,
    external_sync: AtomicBool,
    /// Device/engine state combinations the transition table does not model
    unexpected_transitions: AtomicU64,
}

impl Default for TransportAtomics {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportAtomics {
    pub fn new() -> Self {
        Self {
            frame: CachePadded::new(AtomicU64::new(0)),
            tick: AtomicU64::new(0),
            state: AtomicU8::new(TransportState::Stopped as u8),
            loop_count: AtomicU32::new(0),
            sync_frame: AtomicU64::new(0),
            frame_offset: AtomicI64::new(0),
            cycle_start_ns: AtomicU64::new(0),
            epoch: Instant::now(),
            record_start_frame: AtomicU64::new(0),
            record_start_tick: AtomicU64::new(0),
            record_end_frame: AtomicU64::new(0),
            record_end_tick: AtomicU64::new(0),
            recording: AtomicBool::new(false),
            idle: AtomicBool::new(false),
            freewheel: AtomicBool::new(false),
            bounce: AtomicBool::new(false),
            external_sync: AtomicBool::new(false),
            unexpected_transitions: AtomicU64::new(0),
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Readers (control threads)
    // ─────────────────────────────────────────────────────────────

    #[inline]
    pub fn frame(&self) -> u64 {
        self.frame.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn tick(&self) -> u64 {
        self.tick.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn state(&self) -> TransportState {
        TransportState::from_u8(self.state.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn is_rolling(&self) -> bool {
        self.state().is_rolling()
    }

    #[inline]
    pub fn loop_count(&self) -> u32 {
        self.loop_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn sync_frame(&self) -> u64 {
        self.sync_frame.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn frame_offset(&self) -> i64 {
        self.frame_offset.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn recording(&self) -> bool {
        self.recording.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn idle(&self) -> bool {
        self.idle.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn freewheel(&self) -> bool {
        self.freewheel.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bounce(&self) -> bool {
        self.bounce.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn external_sync(&self) -> bool {
        self.external_sync.load(Ordering::Relaxed)
    }

    pub fn unexpected_transitions(&self) -> u64 {
        self.unexpected_transitions.load(Ordering::Relaxed)
    }

    /// Record window of the last roll
    pub fn record_window(&self) -> RecordWindow {
        RecordWindow {
            start: Position::from_frame(
                self.record_start_frame.load(Ordering::Relaxed),
                self.record_start_tick.load(Ordering::Relaxed),
            ),
            end: Position::from_frame(
                self.record_end_frame.load(Ordering::Relaxed),
                self.record_end_tick.load(Ordering::Relaxed),
            ),
        }
    }

    /// Frames elapsed since the last cycle start, capped at `max_frames`
    pub fn frames_since_cycle_start(&self, sample_rate: u32, max_frames: u32) -> u64 {
        let now = self.epoch.elapsed().as_nanos() as u64;
        let start = self.cycle_start_ns.load(Ordering::Relaxed);
        let elapsed_ns = now.saturating_sub(start);
        let frames = (u128::from(elapsed_ns) * u128::from(sample_rate) / 1_000_000_000) as u64;
        frames.min(u64::from(max_frames))
    }

    /// Current playback frame estimated at sub-cycle resolution
    ///
    /// While stopped this is the published frame.
    pub fn estimated_frame(&self, sample_rate: u32, max_frames: u32) -> u64 {
        let frame = self.frame();
        if self.is_rolling() {
            frame + self.frames_since_cycle_start(sample_rate, max_frames)
        } else {
            frame
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Writers (audio thread)
    // ─────────────────────────────────────────────────────────────

    #[inline]
    pub(crate) fn set_position(&self, frame: u64, tick: u64) {
        self.frame.store(frame, Ordering::Relaxed);
        self.tick.store(tick, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn set_state(&self, state: TransportState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn set_loop_count(&self, count: u32) {
        self.loop_count.store(count, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn set_sync(&self, sync_frame: u64, frame_offset: i64) {
        self.sync_frame.store(sync_frame, Ordering::Relaxed);
        self.frame_offset.store(frame_offset, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn mark_cycle_start(&self) {
        let now = self.epoch.elapsed().as_nanos() as u64;
        self.cycle_start_ns.store(now, Ordering::Relaxed);
    }

    pub(crate) fn set_record_window(&self, window: &RecordWindow) {
        self.record_start_frame.store(window.start.frame, Ordering::Relaxed);
        self.record_start_tick.store(window.start.tick, Ordering::Relaxed);
        self.record_end_frame.store(window.end.frame, Ordering::Relaxed);
        self.record_end_tick.store(window.end.tick, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn set_recording(&self, on: bool) {
        self.recording.store(on, Ordering::Relaxed);
    }

    pub(crate) fn set_modes(&self, idle: bool, freewheel: bool, bounce: bool, external_sync: bool) {
        self.idle.store(idle, Ordering::Relaxed);
        self.freewheel.store(freewheel, Ordering::Relaxed);
        self.bounce.store(bounce, Ordering::Relaxed);
        self.external_sync.store(external_sync, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn count_unexpected_transition(&self) {
        self.unexpected_transitions.fetch_add(1, Ordering::Relaxed);
    }
}

/// Tick accumulator fed by an external MIDI clock
///
/// The MIDI input thread adds ticks as clock pulses arrive; the audio thread
/// takes them all at once per cycle.
#[derive(Default)]
pub struct ExternalClock {
    pending_ticks: AtomicU64,
}

impl ExternalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add ticks received from the external clock source
    pub fn add_ticks(&self, ticks: u64) {
        self.pending_ticks.fetch_add(ticks, Ordering::Relaxed);
    }

    /// Take every tick accumulated since the last call
    #[inline]
    pub fn take_ticks(&self) -> u64 {
        self.pending_ticks.swap(0, Ordering::Relaxed)
    }

    pub fn pending(&self) -> u64 {
        self.pending_ticks.load(Ordering::Relaxed)
    }
}

/// Last controller seen while MIDI learn is armed
///
/// `-1` in any slot means nothing has been captured yet.
pub struct MidiLearn {
    port: AtomicI32,
    channel: AtomicI32,
    controller: AtomicI32,
}

impl Default for MidiLearn {
    fn default() -> Self {
        Self {
            port: AtomicI32::new(-1),
            channel: AtomicI32::new(-1),
            controller: AtomicI32::new(-1),
        }
    }
}

impl MidiLearn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the slot (audio thread, on `StartMidiLearn`)
    pub fn reset(&self) {
        self.port.store(-1, Ordering::Relaxed);
        self.channel.store(-1, Ordering::Relaxed);
        self.controller.store(-1, Ordering::Relaxed);
    }

    /// Store a captured controller (MIDI input thread)
    pub fn capture(&self, port: MidiPortId, channel: u8, controller: u8) {
        self.port.store(port as i32, Ordering::Relaxed);
        self.channel.store(i32::from(channel), Ordering::Relaxed);
        self.controller.store(i32::from(controller), Ordering::Relaxed);
    }

    /// Captured (port, channel, controller), if complete
    pub fn captured(&self) -> Option<(MidiPortId, u8, u8)> {
        let port = self.port.load(Ordering::Relaxed);
        let channel = self.channel.load(Ordering::Relaxed);
        let controller = self.controller.load(Ordering::Relaxed);
        if port < 0 || channel < 0 || controller < 0 {
            return None;
        }
        Some((port as MidiPortId, channel as u8, controller as u8))
    }
}
