//! Internal transport for backends without one
//!
//! CPAL and the dummy driver only deliver periods. [`FreeRunningTransport`]
//! gives the engine a device transport to follow: a frame counter that
//! advances while playing, and a relocation that reports `Starting` for a
//! fixed number of cycles, the way a JACK transport does while clients
//! catch up.

use crate::engine::{AudioDevice, DeviceState};

/// Free-running device transport driven by the backend's period callback
///
/// The backend calls [`begin_cycle`](Self::begin_cycle) before handing the
/// period to the engine and [`end_cycle`](Self::end_cycle) after.
#[derive(Debug, Clone)]
pub struct FreeRunningTransport {
    state: DeviceState,
    /// Playback requested; `Starting` resolves to `Playing` only when set
    rolling: bool,
    transport_frame: u64,
    /// Frames processed since start
    clock: u64,
    cycle_start: u64,
    /// Cycles a relocation reports `Starting`
    relocate_cycles: u32,
    pending: u32,
}

impl FreeRunningTransport {
    pub fn new(relocate_cycles: u32) -> Self {
        Self {
            state: DeviceState::Stopped,
            rolling: false,
            transport_frame: 0,
            clock: 0,
            cycle_start: 0,
            relocate_cycles,
            pending: 0,
        }
    }

    pub fn begin_cycle(&mut self) {
        self.cycle_start = self.clock;
        if self.pending > 0 {
            self.pending -= 1;
        } else if self.state == DeviceState::Starting && self.rolling {
            self.state = DeviceState::Playing;
        }
    }

    pub fn end_cycle(&mut self, frames: u32) {
        self.clock += u64::from(frames);
        if self.state == DeviceState::Playing {
            self.transport_frame += u64::from(frames);
        }
    }

    fn relocate(&mut self) {
        if self.relocate_cycles == 0 {
            self.state = DeviceState::Playing;
        } else {
            self.state = DeviceState::Starting;
            self.pending = self.relocate_cycles;
        }
    }
}

impl AudioDevice for FreeRunningTransport {
    fn is_available(&self) -> bool {
        true
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
        self.cycle_start
    }

    fn seek_transport(&mut self, frame: u64) {
        self.transport_frame = frame;
        if self.rolling {
            self.relocate();
        }
    }

    fn start_transport(&mut self) {
        if self.rolling {
            return;
        }
        self.rolling = true;
        self.relocate();
    }

    fn stop_transport(&mut self) {
        self.rolling = false;
        self.pending = 0;
        self.state = DeviceState::Stopped;
    }
}
