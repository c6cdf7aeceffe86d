//! Stand-in collaborators for running the engine from the console
//!
//! A metronome track, a prefetch worker thread that takes a little while to
//! re-seek, a MIDI output that logs from a side thread, and a sequencer
//! that only counts what it was told.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam::utils::Backoff;

use transit_core::engine::{
    Collaborators, CycleInfo, DiskWorker, MidiEvent, MidiOutputs, MidiSequencer, SessionOp,
    TrackProcessor,
};
use transit_core::{MidiPortId, StereoBuffer, StereoSample, TrackId, MIDI_CHANNELS};

/// Track id of the metronome
pub const CLICK_TRACK: TrackId = 0;

/// Frames a click lasts
const CLICK_FRAMES: u32 = 240;

/// Queue depth towards the side threads
const SIDE_QUEUE: usize = 1024;

/// Values shared with the console for `status`
#[derive(Default)]
pub struct SessionStats {
    /// Output peak since the last meter reset (f32 bits)
    peak: AtomicU32,
    pub midi_events: AtomicU64,
    pub sequencer_seeks: AtomicU64,
    pub sequencer_stops: AtomicU64,
    pub prefetch_seeks: AtomicU64,
}

impl SessionStats {
    pub fn peak(&self) -> f32 {
        f32::from_bits(self.peak.load(Ordering::Relaxed))
    }

    fn hold_peak(&self, level: f32) {
        if level > self.peak() {
            self.peak.store(level.to_bits(), Ordering::Relaxed);
        }
    }
}

/// Metronome: a short click on every beat at `ticks_per_beat`
pub struct ClickTrack {
    ticks_per_beat: u64,
    muted: bool,
    /// Frames left of a click that started in an earlier cycle
    ringing: u32,
    stats: Arc<SessionStats>,
}

impl ClickTrack {
    pub fn new(ticks_per_beat: u64, stats: Arc<SessionStats>) -> Self {
        Self {
            ticks_per_beat: ticks_per_beat.max(1),
            muted: false,
            ringing: 0,
            stats,
        }
    }

    fn write_click(output: &mut StereoBuffer, start: usize, frames: u32) -> u32 {
        let end = (start + frames as usize).min(output.len()).max(start);
        for i in start..end {
            output[i] += StereoSample::mono(0.3);
        }
        frames - (end - start) as u32
    }
}

impl TrackProcessor for ClickTrack {
    fn silence(&mut self, _frames: u32) {
        self.ringing = 0;
    }

    fn process(&mut self, cycle: &CycleInfo, _aux: &mut [StereoBuffer], output: &mut StereoBuffer) {
        if self.ringing > 0 {
            self.ringing = Self::write_click(output, 0, self.ringing);
        }

        if cycle.rolling && !self.muted && cycle.next_tick > cycle.tick {
            let span = cycle.next_tick - cycle.tick;
            let first_beat = cycle.tick.div_ceil(self.ticks_per_beat) * self.ticks_per_beat;
            let mut beat = first_beat;
            while beat < cycle.next_tick {
                // Ticks spread linearly over the cycle
                let offset = (beat - cycle.tick) * u64::from(cycle.frames) / span;
                self.ringing = Self::write_click(output, offset as usize, CLICK_FRAMES);
                beat += self.ticks_per_beat;
            }
        }

        self.stats.hold_peak(output.peak());
    }

    fn apply(&mut self, op: &SessionOp) {
        if let SessionOp::SetMute { track, on } = *op {
            if track == CLICK_TRACK {
                self.muted = on;
            }
        }
    }

    fn reenable_touched_controllers(&mut self) {}

    fn reset_meters(&mut self) {
        self.stats.peak.store(0f32.to_bits(), Ordering::Relaxed);
    }
}

/// Messages from the audio thread to the MIDI printer
#[derive(Debug, Clone, Copy)]
enum MidiOut {
    Event(MidiEvent),
    Start,
    Continue,
    Reset,
    Init,
}

/// MIDI outputs backed by a logging thread
pub struct LoggedMidiOutputs {
    ports: usize,
    /// Hardware controller state per port, `channel * 128 + controller`
    hw: Vec<Box<[i32]>>,
    queue: rtrb::Producer<MidiOut>,
    stats: Arc<SessionStats>,
}

impl MidiOutputs for LoggedMidiOutputs {
    fn port_count(&self) -> usize {
        self.ports
    }

    fn has_device(&self, port: MidiPortId) -> bool {
        port < self.ports
    }

    fn hw_ctrl_state(&self, port: MidiPortId, channel: u8, controller: u8) -> Option<i32> {
        let value = *self
            .hw
            .get(port)?
            .get(usize::from(channel) * 128 + usize::from(controller))?;
        (value >= 0).then_some(value)
    }

    fn set_hw_ctrl_state(&mut self, port: MidiPortId, channel: u8, controller: u8, value: i32) {
        let index = usize::from(channel) * 128 + usize::from(controller);
        if let Some(slot) = self.hw.get_mut(port).and_then(|p| p.get_mut(index)) {
            *slot = value;
        }
    }

    fn put_event(&mut self, event: MidiEvent) -> bool {
        self.stats.midi_events.fetch_add(1, Ordering::Relaxed);
        self.queue.push(MidiOut::Event(event)).is_ok()
    }

    fn reset(&mut self) {
        let _ = self.queue.push(MidiOut::Reset);
    }

    fn init(&mut self) {
        let _ = self.queue.push(MidiOut::Init);
    }

    fn send_transport_start(&mut self, resume: bool) {
        let _ = self
            .queue
            .push(if resume { MidiOut::Continue } else { MidiOut::Start });
    }
}

#[derive(Debug, Clone, Copy)]
enum PrefetchMsg {
    Seek { frame: u64, force: bool },
    Tick { recording: bool, is_play: bool },
}

/// Disk worker whose seeks complete on its own thread
pub struct PrefetchWorker {
    queue: rtrb::Producer<PrefetchMsg>,
    seek_done: Arc<AtomicBool>,
    stats: Arc<SessionStats>,
}

impl DiskWorker for PrefetchWorker {
    fn msg_tick(&mut self, recording: bool, is_play: bool) {
        let _ = self.queue.push(PrefetchMsg::Tick { recording, is_play });
    }

    fn msg_seek(&mut self, frame: u64, force: bool) {
        self.stats.prefetch_seeks.fetch_add(1, Ordering::Relaxed);
        self.seek_done.store(false, Ordering::Relaxed);
        if self.queue.push(PrefetchMsg::Seek { frame, force }).is_err() {
            // Nothing will complete this seek
            self.seek_done.store(true, Ordering::Relaxed);
        }
    }

    fn seek_done(&self) -> bool {
        self.seek_done.load(Ordering::Relaxed)
    }
}

/// Sequencer that only records what it was asked to do
pub struct CountingSequencer {
    stats: Arc<SessionStats>,
}

impl MidiSequencer for CountingSequencer {
    fn msg_seek(&mut self) {
        self.stats.sequencer_seeks.fetch_add(1, Ordering::Relaxed);
    }

    fn msg_stop(&mut self) {
        self.stats.sequencer_stops.fetch_add(1, Ordering::Relaxed);
    }

    fn msg_idle(&mut self, idle: bool) {
        log::debug!("sequencer idle: {}", idle);
    }
}

/// Side threads serving the collaborators; stopped on drop
pub struct SessionThreads {
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl Drop for SessionThreads {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

fn spawn_loop<T, F>(
    name: &str,
    running: &Arc<AtomicBool>,
    mut queue: rtrb::Consumer<T>,
    mut handle: F,
) -> Result<JoinHandle<()>>
where
    T: Send + 'static,
    F: FnMut(T) + Send + 'static,
{
    let running = Arc::clone(running);
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let backoff = Backoff::new();
            while running.load(Ordering::Relaxed) {
                match queue.pop() {
                    Ok(msg) => {
                        handle(msg);
                        backoff.reset();
                    }
                    Err(_) if backoff.is_completed() => thread::sleep(Duration::from_millis(1)),
                    Err(_) => backoff.snooze(),
                }
            }
        })
        .with_context(|| format!("Failed to spawn {} thread", name))
}

/// Build the collaborators and start their side threads
pub fn build(
    midi_ports: usize,
    ticks_per_beat: u64,
    seek_latency: Duration,
) -> Result<(Collaborators, Arc<SessionStats>, SessionThreads)> {
    let stats = Arc::new(SessionStats::default());
    let running = Arc::new(AtomicBool::new(true));

    let (midi_tx, midi_rx) = rtrb::RingBuffer::new(SIDE_QUEUE);
    let (prefetch_tx, prefetch_rx) = rtrb::RingBuffer::new(SIDE_QUEUE);
    let seek_done = Arc::new(AtomicBool::new(true));

    let midi_thread = spawn_loop("transit-midi-out", &running, midi_rx, |msg: MidiOut| {
        log::debug!("midi out: {:?}", msg);
    })?;

    let worker_done = Arc::clone(&seek_done);
    let prefetch_thread = spawn_loop(
        "transit-prefetch",
        &running,
        prefetch_rx,
        move |msg: PrefetchMsg| match msg {
            PrefetchMsg::Seek { frame, force } => {
                thread::sleep(seek_latency);
                log::debug!("prefetch: seeked to {} (force: {})", frame, force);
                worker_done.store(true, Ordering::Relaxed);
            }
            PrefetchMsg::Tick { recording, is_play } => {
                if !is_play {
                    log::debug!("prefetch: flush (recording: {})", recording);
                }
            }
        },
    )?;

    let collab = Collaborators {
        tracks: Box::new(ClickTrack::new(ticks_per_beat, Arc::clone(&stats))),
        midi: Box::new(LoggedMidiOutputs {
            ports: midi_ports,
            hw: (0..midi_ports)
                .map(|_| vec![-1; MIDI_CHANNELS * 128].into_boxed_slice())
                .collect(),
            queue: midi_tx,
            stats: Arc::clone(&stats),
        }),
        prefetch: Box::new(PrefetchWorker {
            queue: prefetch_tx,
            seek_done,
            stats: Arc::clone(&stats),
        }),
        sequencer: Box::new(CountingSequencer {
            stats: Arc::clone(&stats),
        }),
    };

    Ok((
        collab,
        stats,
        SessionThreads {
            running,
            threads: vec![midi_thread, prefetch_thread],
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cycle(frame: u64, tick: u64, next_tick: u64) -> CycleInfo {
        CycleInfo {
            frame,
            frames: 512,
            tick,
            next_tick,
            rolling: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_click_on_beat_boundaries_only() {
        let stats = Arc::new(SessionStats::default());
        let mut click = ClickTrack::new(24, Arc::clone(&stats));
        let mut out = StereoBuffer::silence(512);

        // Ticks 1..3 hold no beat
        click.process(&cycle(512, 1, 3), &mut [], &mut out);
        assert_eq!(out.peak(), 0.0);

        // Tick 24 starts halfway through ticks 23..25
        click.process(&cycle(23 * 512, 23, 25), &mut [], &mut out);
        assert_eq!(out[255].left, 0.0);
        assert!(out[256].left > 0.0);
        assert!(stats.peak() > 0.0);

        click.reset_meters();
        assert_eq!(stats.peak(), 0.0);
    }

    #[test]
    fn test_click_rings_into_next_cycle() {
        let stats = Arc::new(SessionStats::default());
        let mut click = ClickTrack::new(24, stats);
        let mut out = StereoBuffer::silence(512);
        // Beat at tick 24 lands 103 frames before the cycle ends
        click.process(&cycle(0, 0, 1), &mut [], &mut out);
        out.fill_silence();
        click.process(&cycle(0, 20, 25), &mut [], &mut out);
        out.fill_silence();
        click.process(&cycle(0, 25, 26), &mut [], &mut out);
        assert!(out[0].left > 0.0);
        assert_eq!(out[200].left, 0.0);
    }

    #[test]
    fn test_muted_click_is_silent() {
        let mut click = ClickTrack::new(24, Arc::new(SessionStats::default()));
        click.apply(&SessionOp::SetMute {
            track: CLICK_TRACK,
            on: true,
        });
        let mut out = StereoBuffer::silence(512);
        click.process(&cycle(0, 0, 1), &mut [], &mut out);
        assert_eq!(out.peak(), 0.0);
    }

    #[test]
    fn test_hw_ctrl_state_unknown_until_set() {
        let (mut collab, _stats, _threads) = build(1, 24, Duration::ZERO).unwrap();
        assert_eq!(collab.midi.hw_ctrl_state(0, 0, 64), None);
        collab.midi.set_hw_ctrl_state(0, 0, 64, 127);
        assert_eq!(collab.midi.hw_ctrl_state(0, 0, 64), Some(127));
        assert_eq!(collab.midi.hw_ctrl_state(3, 0, 64), None);
    }

    #[test]
    fn test_prefetch_seek_completes_on_worker() {
        let (mut collab, stats, _threads) = build(1, 24, Duration::from_millis(2)).unwrap();
        collab.prefetch.msg_seek(4800, true);
        assert!(!collab.prefetch.seek_done());
        let started = std::time::Instant::now();
        while !collab.prefetch.seek_done() {
            assert!(started.elapsed() < Duration::from_secs(2));
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(stats.prefetch_seeks.load(Ordering::Relaxed), 1);
    }
}
