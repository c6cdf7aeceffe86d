//! Frame ↔ tick position translation
//!
//! The engine never owns tempo data. It sees the song's tempo map through the
//! [`TempoMap`] trait and keeps a [`PositionTranslator`] around it. Replacing
//! the map is done with a `ReplaceTempoMap` command; the previous map is handed
//! to the GC thread so the audio thread never frees it.
//!
//! # Rounding
//!
//! Per-cycle tick ranges are half-open `[cur_tick, next_tick)`. The boundary of
//! a cycle is converted with ceiling semantics so a tick that lands exactly on,
//! or just after, a cycle boundary is processed by exactly one cycle.

mod segments;

pub use segments::{TempoError, TempoSegments};

use basedrop::Owned;

use crate::engine::gc::gc_handle;

/// Musical time signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSignature {
    pub numerator: u8,
    pub denominator: u8,
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self {
            numerator: 4,
            denominator: 4,
        }
    }
}

impl TimeSignature {
    pub fn new(numerator: u8, denominator: u8) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Length of one beat in ticks at the given quarter-note resolution
    pub fn beat_ticks(&self, ticks_per_quarter: u32) -> u64 {
        let denominator = u64::from(self.denominator.max(1));
        u64::from(ticks_per_quarter) * 4 / denominator
    }
}

/// Black-box frame ↔ tick converter owned by the timeline
///
/// Implementations must be cheap and must not allocate: every method may be
/// called from the audio thread.
pub trait TempoMap: Send + 'static {
    /// Fractional tick at `frame`
    fn frame_to_tick(&self, frame: u64) -> f64;

    /// Smallest whole tick not before `frame`
    fn frame_to_tick_ceil(&self, frame: u64) -> u64 {
        self.frame_to_tick(frame).ceil() as u64
    }

    /// Frame at which `tick` starts
    fn tick_to_frame(&self, tick: u64) -> u64;

    /// Tick resolution (ticks per quarter note)
    fn ticks_per_quarter(&self) -> u32;

    /// Time signature in effect at `tick`
    fn time_signature(&self, _tick: u64) -> TimeSignature {
        TimeSignature::default()
    }
}

/// Box a tempo map for handoff to the audio thread
///
/// The allocation is released on the GC thread once the engine drops it.
pub fn owned_tempo_map<M: TempoMap>(map: M) -> Owned<Box<dyn TempoMap>> {
    let boxed: Box<dyn TempoMap> = Box::new(map);
    Owned::new(&gc_handle(), boxed)
}

/// Owned frame ↔ tick translator used by the transport
pub struct PositionTranslator {
    map: Owned<Box<dyn TempoMap>>,
}

impl PositionTranslator {
    pub fn new(map: Owned<Box<dyn TempoMap>>) -> Self {
        Self { map }
    }

    #[inline]
    pub fn frame_to_tick(&self, frame: u64) -> f64 {
        self.map.frame_to_tick(frame)
    }

    #[inline]
    pub fn frame_to_tick_ceil(&self, frame: u64) -> u64 {
        self.map.frame_to_tick_ceil(frame)
    }

    #[inline]
    pub fn tick_to_frame(&self, tick: u64) -> u64 {
        self.map.tick_to_frame(tick)
    }

    #[inline]
    pub fn ticks_per_quarter(&self) -> u32 {
        self.map.ticks_per_quarter()
    }

    #[inline]
    pub fn time_signature(&self, tick: u64) -> TimeSignature {
        self.map.time_signature(tick)
    }

    /// Frames spanned by `ticks` ticks starting at `tick`
    pub fn span_frames(&self, tick: u64, ticks: u64) -> u64 {
        self.tick_to_frame(tick + ticks)
            .saturating_sub(self.tick_to_frame(tick))
    }

    /// Swap in a new map, returning the previous one
    ///
    /// Dropping the returned value on the audio thread is fine: `Owned`
    /// defers the deallocation to the collector.
    pub fn replace(&mut self, map: Owned<Box<dyn TempoMap>>) -> Owned<Box<dyn TempoMap>> {
        std::mem::replace(&mut self.map, map)
    }
}
