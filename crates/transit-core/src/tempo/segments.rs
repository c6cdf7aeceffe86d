//! Piecewise-constant tempo map
//!
//! A list of tempo segments, each starting at a tick with a tempo in
//! microseconds per quarter note. Segment start frames are precomputed when
//! the map is built so lookups are a binary search plus integer math.

use thiserror::Error;

use super::{TempoMap, TimeSignature};

/// Errors raised while building a tempo map
#[derive(Error, Debug, PartialEq)]
pub enum TempoError {
    #[error("Sample rate must be non-zero")]
    InvalidSampleRate,

    #[error("Tick resolution must be non-zero")]
    InvalidResolution,

    #[error("Invalid tempo: {0} BPM")]
    InvalidTempo(f64),

    #[error("Tempo map entries must be added in increasing tick order (got tick {tick})")]
    OutOfOrder { tick: u64 },
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    tick: u64,
    frame: u64,
    /// Microseconds per quarter note
    tempo_us: u64,
}

/// Tempo map with non-uniform tempo segments and time signature changes
#[derive(Debug, Clone)]
pub struct TempoSegments {
    sample_rate: u32,
    ticks_per_quarter: u32,
    segments: Vec<Segment>,
    signatures: Vec<(u64, TimeSignature)>,
}

fn bpm_to_tempo_us(bpm: f64) -> Result<u64, TempoError> {
    if !bpm.is_finite() || bpm <= 0.0 {
        return Err(TempoError::InvalidTempo(bpm));
    }
    let tempo = (60_000_000.0 / bpm).round();
    if tempo < 1.0 {
        return Err(TempoError::InvalidTempo(bpm));
    }
    Ok(tempo as u64)
}

impl TempoSegments {
    /// Create a map with a single tempo starting at tick 0 (4/4)
    pub fn new(sample_rate: u32, ticks_per_quarter: u32, bpm: f64) -> Result<Self, TempoError> {
        if sample_rate == 0 {
            return Err(TempoError::InvalidSampleRate);
        }
        if ticks_per_quarter == 0 {
            return Err(TempoError::InvalidResolution);
        }
        Ok(Self {
            sample_rate,
            ticks_per_quarter,
            segments: vec![Segment {
                tick: 0,
                frame: 0,
                tempo_us: bpm_to_tempo_us(bpm)?,
            }],
            signatures: vec![(0, TimeSignature::default())],
        })
    }

    /// Alias for a map that never changes tempo
    pub fn constant(sample_rate: u32, ticks_per_quarter: u32, bpm: f64) -> Result<Self, TempoError> {
        Self::new(sample_rate, ticks_per_quarter, bpm)
    }

    /// Append a tempo change at `tick`
    pub fn with_tempo_change(mut self, tick: u64, bpm: f64) -> Result<Self, TempoError> {
        let tempo_us = bpm_to_tempo_us(bpm)?;
        let last_tick = self.segments.last().map(|s| s.tick).unwrap_or(0);
        if tick <= last_tick {
            return Err(TempoError::OutOfOrder { tick });
        }
        let frame = self.tick_to_frame(tick);
        self.segments.push(Segment {
            tick,
            frame,
            tempo_us,
        });
        Ok(self)
    }

    /// Append (or at tick 0, replace) a time signature change
    pub fn with_signature(mut self, tick: u64, signature: TimeSignature) -> Result<Self, TempoError> {
        if tick == 0 {
            self.signatures[0] = (0, signature);
            return Ok(self);
        }
        let last_tick = self.signatures.last().map(|(t, _)| *t).unwrap_or(0);
        if tick <= last_tick {
            return Err(TempoError::OutOfOrder { tick });
        }
        self.signatures.push((tick, signature));
        Ok(self)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn segment_at_frame(&self, frame: u64) -> &Segment {
        let idx = self.segments.partition_point(|s| s.frame <= frame);
        &self.segments[idx.saturating_sub(1)]
    }

    fn segment_at_tick(&self, tick: u64) -> &Segment {
        let idx = self.segments.partition_point(|s| s.tick <= tick);
        &self.segments[idx.saturating_sub(1)]
    }

    /// (numerator, denominator) of ticks-per-frame inside a segment
    fn tick_rate(&self, seg: &Segment) -> (u128, u128) {
        (
            u128::from(self.ticks_per_quarter) * 1_000_000,
            u128::from(seg.tempo_us) * u128::from(self.sample_rate),
        )
    }
}

impl TempoMap for TempoSegments {
    fn frame_to_tick(&self, frame: u64) -> f64 {
        let seg = self.segment_at_frame(frame);
        let (num, den) = self.tick_rate(seg);
        seg.tick as f64 + (frame - seg.frame) as f64 * num as f64 / den as f64
    }

    fn frame_to_tick_ceil(&self, frame: u64) -> u64 {
        let seg = self.segment_at_frame(frame);
        let (num, den) = self.tick_rate(seg);
        let scaled = u128::from(frame - seg.frame) * num;
        seg.tick + scaled.div_ceil(den) as u64
    }

    fn tick_to_frame(&self, tick: u64) -> u64 {
        let seg = self.segment_at_tick(tick);
        let (num, den) = self.tick_rate(seg);
        let scaled = u128::from(tick - seg.tick) * den;
        // Round to nearest frame
        seg.frame + ((scaled + num / 2) / num) as u64
    }

    fn ticks_per_quarter(&self) -> u32 {
        self.ticks_per_quarter
    }

    fn time_signature(&self, tick: u64) -> TimeSignature {
        let idx = self.signatures.partition_point(|(t, _)| *t <= tick);
        self.signatures[idx.saturating_sub(1)].1
    }
}
