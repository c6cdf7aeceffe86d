//! Common types for Transit
//!
//! Fundamental audio buffer types plus the timeline value types the engine
//! reads (positions, loop markers, record window, timeline snapshot).

use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};

/// Default sample rate when the backend doesn't dictate one
pub const SAMPLE_RATE: u32 = 48000;

/// Maximum buffer size to pre-allocate (covers all JACK/CPAL configurations)
pub const MAX_BUFFER_SIZE: usize = 8192;

/// MIDI channels per output port
pub const MIDI_CHANNELS: usize = 16;

/// Sustain pedal controller number
pub const CTRL_SUSTAIN: u8 = 64;

/// Audio sample type
pub type Sample = f32;

/// Track identifier inside the session graph
pub type TrackId = u32;

/// MIDI output port index
pub type MidiPortId = usize;

/// A stereo sample pair (left, right)
///
/// Uses `#[repr(C)]` so a slice can be viewed as interleaved [L, R, L, R, ...].
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct StereoSample {
    pub left: Sample,
    pub right: Sample,
}

impl StereoSample {
    #[inline]
    pub fn new(left: Sample, right: Sample) -> Self {
        Self { left, right }
    }

    #[inline]
    pub fn silence() -> Self {
        Self::default()
    }

    #[inline]
    pub fn mono(value: Sample) -> Self {
        Self::new(value, value)
    }
}

impl std::ops::AddAssign for StereoSample {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.left += other.left;
        self.right += other.right;
    }
}

/// A buffer of stereo samples
///
/// Pre-allocate with [`StereoBuffer::silence`] at `MAX_BUFFER_SIZE` and use
/// [`StereoBuffer::set_len_from_capacity`] per cycle; neither allocates once
/// the capacity exists.
#[derive(Debug, Clone, Default)]
pub struct StereoBuffer {
    samples: Vec<StereoSample>,
}

impl StereoBuffer {
    /// Create a buffer filled with silence
    pub fn silence(len: usize) -> Self {
        Self {
            samples: vec![StereoSample::silence(); len],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Set the working length of a pre-allocated buffer (real-time safe)
    ///
    /// Newly exposed elements are silent.
    #[inline]
    pub fn set_len_from_capacity(&mut self, new_len: usize) {
        let current_len = self.samples.len();
        if new_len > current_len {
            debug_assert!(
                new_len <= self.samples.capacity(),
                "set_len_from_capacity called with len > capacity"
            );
            self.samples.resize(new_len, StereoSample::silence());
        } else {
            self.samples.truncate(new_len);
        }
    }

    /// Fill the buffer with silence
    pub fn fill_silence(&mut self) {
        self.samples.fill(StereoSample::silence());
    }

    #[inline]
    pub fn as_slice(&self) -> &[StereoSample] {
        &self.samples
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [StereoSample] {
        &mut self.samples
    }

    /// View as interleaved samples [L, R, L, R, ...] without copying
    #[inline]
    pub fn as_interleaved(&self) -> &[Sample] {
        bytemuck::cast_slice(&self.samples)
    }

    /// Peak absolute level across both channels
    pub fn peak(&self) -> Sample {
        self.samples
            .iter()
            .map(|s| s.left.abs().max(s.right.abs()))
            .fold(0.0, Sample::max)
    }
}

impl Index<usize> for StereoBuffer {
    type Output = StereoSample;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.samples[index]
    }
}

impl IndexMut<usize> for StereoBuffer {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.samples[index]
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Timeline value types
// ═══════════════════════════════════════════════════════════════════════════════

/// Which half of a [`Position`] was set last and is therefore authoritative
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PositionKind {
    #[default]
    Frames,
    Ticks,
}

/// A timeline position expressed both in frames and ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Position {
    pub frame: u64,
    pub tick: u64,
    pub kind: PositionKind,
}

impl Position {
    /// Position whose frame is authoritative
    pub fn from_frame(frame: u64, tick: u64) -> Self {
        Self {
            frame,
            tick,
            kind: PositionKind::Frames,
        }
    }

    /// Position whose tick is authoritative
    pub fn from_tick(tick: u64, frame: u64) -> Self {
        Self {
            frame,
            tick,
            kind: PositionKind::Ticks,
        }
    }
}

/// Left/right loop markers in frames
///
/// Looping is only possible while `left < right`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoopBounds {
    pub left: u64,
    pub right: u64,
}

impl LoopBounds {
    pub fn new(left: u64, right: u64) -> Self {
        Self { left, right }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.left < self.right
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.right.saturating_sub(self.left)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.is_valid()
    }
}

/// Start/end positions of the last roll, consumed by the record commit path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordWindow {
    pub start: Position,
    pub end: Position,
}

/// Snapshot of the song/timeline state the engine reads each cycle
///
/// Owned by the timeline; the engine only sees it through `UpdateTimeline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeline {
    /// Song length in ticks (end-of-song detection)
    pub length_ticks: u64,
    /// Loop toggle
    pub loop_enabled: bool,
    /// Loop markers
    pub loop_bounds: LoopBounds,
    /// Record arm
    pub record: bool,
    /// Metronome click enabled
    pub click: bool,
}

impl Default for Timeline {
    fn default() -> Self {
        Self {
            // No song loaded: never hit end-of-song
            length_ticks: u64::MAX,
            loop_enabled: false,
            loop_bounds: LoopBounds::default(),
            record: false,
            click: false,
        }
    }
}

impl Timeline {
    /// Whether the loop should be honored this cycle
    #[inline]
    pub fn loop_active(&self) -> bool {
        self.loop_enabled && self.loop_bounds.is_valid()
    }
}
