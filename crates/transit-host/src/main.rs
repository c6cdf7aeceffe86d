//! transit-host - drive the transport engine from a console
//!
//! Starts the configured audio backend with a metronome session and reads
//! transport commands from stdin. Sync notifications from the audio thread
//! are printed as they arrive.
//!
//! ## Command line flags
//!
//! - `--config <path>`: Read configuration from `path` instead of the default
//! - `--write-config`: Save the effective configuration and exit

mod repl;
mod session;

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use crossbeam::channel::{self, select};

use repl::{Action, HELP};
use session::{SessionStats, CLICK_TRACK};
use transit_core::audio::{start_audio_system, AudioHandle};
use transit_core::config::{
    default_config_path, load_config, save_config, TransitConfig, CONFIG_FILE,
};
use transit_core::engine::{Command, Engine, EngineHandles, SessionOp, SyncEvent};
use transit_core::tempo::{owned_tempo_map, TempoSegments};
use transit_core::{LoopBounds, Timeline};

/// Tick resolution of the host's tempo maps
const TICKS_PER_QUARTER: u32 = 96;

const DEFAULT_BPM: f64 = 120.0;

/// Simulated prefetch seek latency
const PREFETCH_SEEK_LATENCY: Duration = Duration::from_millis(5);

struct Args {
    config_path: PathBuf,
    write_config: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = std::env::args().skip(1);
    let mut parsed = Args {
        config_path: default_config_path(CONFIG_FILE),
        write_config: false,
    };
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                parsed.config_path = args.next().context("--config needs a path")?.into();
            }
            "--write-config" => parsed.write_config = true,
            other => bail!("unknown argument '{}'", other),
        }
    }
    Ok(parsed)
}

/// Control-side state of a running session
struct Host {
    handles: EngineHandles,
    stats: Arc<SessionStats>,
    timeline: Timeline,
    sample_rate: u32,
    buffer_size: u32,
    timeout: Duration,
    retries: u32,
}

impl Host {
    fn send(&mut self, command: Command) -> Result<()> {
        let name = command.name();
        self.handles
            .control
            .send_and_wait(command, self.timeout, self.retries)
            .with_context(|| format!("{} failed", name))?;
        Ok(())
    }

    fn update_timeline(&mut self) -> Result<()> {
        self.send(Command::UpdateTimeline(self.timeline))
    }

    fn set_tempo(&mut self, bpm: f64) -> Result<()> {
        let map = TempoSegments::constant(self.sample_rate, TICKS_PER_QUARTER, bpm)?;
        // The engine re-derives its position when the map is swapped
        self.send(Command::ReplaceTempoMap(owned_tempo_map(map)))
    }

    /// Returns false once the user asked to quit
    fn run(&mut self, action: Action) -> Result<bool> {
        match action {
            Action::Play => self.send(Command::Play(true))?,
            Action::Stop => self.send(Command::Play(false))?,
            Action::Seek(frame) => self.send(Command::Seek { frame })?,
            Action::Loop(bounds) => {
                match bounds {
                    Some((left, right)) => {
                        self.timeline.loop_bounds = LoopBounds::new(left, right);
                        self.timeline.loop_enabled = true;
                    }
                    None => self.timeline.loop_enabled = false,
                }
                self.update_timeline()?;
            }
            Action::Record(on) => {
                self.timeline.record = on;
                self.update_timeline()?;
            }
            Action::Click(on) => {
                self.timeline.click = on;
                self.update_timeline()?;
            }
            Action::Length(ticks) => {
                self.timeline.length_ticks = ticks;
                self.update_timeline()?;
            }
            Action::Tempo(bpm) => self.set_tempo(bpm)?,
            Action::Bounce(on) => self.send(Command::SetBounce(on))?,
            Action::Freewheel(on) => self.send(Command::SetFreewheel(on))?,
            Action::Idle(on) => self.send(Command::SetIdle(on))?,
            Action::ReSync => self.send(Command::ReSync)?,
            Action::Panic => self.send(Command::Panic)?,
            Action::LocalOff => self.send(Command::MidiLocalOff)?,
            Action::Learn => self.send(Command::StartMidiLearn)?,
            Action::Mute(on) => self.send(Command::Session(SessionOp::SetMute {
                track: CLICK_TRACK,
                on,
            }))?,
            Action::Status => self.print_status(),
            Action::Help => println!("{}", HELP),
            Action::Quit => return Ok(false),
        }
        Ok(true)
    }

    fn print_status(&self) {
        let atomics = &self.handles.atomics;
        println!(
            "state {:?}  frame {} (est. {})  tick {}  loops {}",
            atomics.state(),
            atomics.frame(),
            atomics.estimated_frame(self.sample_rate, self.buffer_size),
            atomics.tick(),
            atomics.loop_count(),
        );
        println!(
            "record {}  freewheel {}  bounce {}  idle {}  unexpected transitions {}",
            atomics.recording(),
            atomics.freewheel(),
            atomics.bounce(),
            atomics.idle(),
            atomics.unexpected_transitions(),
        );
        println!(
            "peak {:.2}  midi events {}  prefetch seeks {}  sequencer seeks/stops {}/{}",
            self.stats.peak(),
            self.stats.midi_events.load(std::sync::atomic::Ordering::Relaxed),
            self.stats.prefetch_seeks.load(std::sync::atomic::Ordering::Relaxed),
            self.stats.sequencer_seeks.load(std::sync::atomic::Ordering::Relaxed),
            self.stats.sequencer_stops.load(std::sync::atomic::Ordering::Relaxed),
        );
        if let Some((port, channel, controller)) = self.handles.midi_learn.captured() {
            println!("learned: port {} channel {} controller {}", port, channel, controller);
        }
    }

    fn print_events(&mut self) {
        while let Some(event) = self.handles.events.try_recv() {
            match describe_event(event, self.handles.atomics.frame()) {
                Some(line) => println!("{}", line),
                None => log::info!("Audio thread finished"),
            }
        }
    }
}

/// Console line for a sync notification; `None` for shutdown
fn describe_event(event: SyncEvent, frame: u64) -> Option<String> {
    let line = match event {
        SyncEvent::RollStarted => "> rolling".to_string(),
        SyncEvent::RollStopped => format!("> stopped at {}", frame),
        SyncEvent::SeekCompleted => format!("> located {}", frame),
        SyncEvent::BounceStarted => "> bounce started".to_string(),
        SyncEvent::BounceFinished => "> bounce finished".to_string(),
        SyncEvent::RollAborted => "> start aborted".to_string(),
        SyncEvent::Shutdown => return None,
    };
    Some(line)
}

fn spawn_stdin_reader() -> Result<channel::Receiver<String>> {
    let (tx, rx) = channel::unbounded();
    thread::Builder::new()
        .name("transit-stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    return;
                }
            }
            let _ = tx.send("quit".to_string());
        })
        .context("Failed to spawn stdin reader")?;
    Ok(rx)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args = parse_args()?;
    let config: TransitConfig = load_config(&args.config_path);
    log::info!("Using configuration {:?}", args.config_path);
    config
        .validate()
        .with_context(|| format!("Invalid configuration {}", args.config_path.display()))?;

    if args.write_config {
        save_config(&config, &args.config_path)?;
        println!("Wrote {}", args.config_path.display());
        return Ok(());
    }

    let (collab, stats, _session_threads) = session::build(
        config.engine.midi_ports,
        u64::from(TICKS_PER_QUARTER),
        PREFETCH_SEEK_LATENCY,
    )?;
    let tempo = TempoSegments::constant(config.audio.sample_rate, TICKS_PER_QUARTER, DEFAULT_BPM)?;
    let (engine, handles) = Engine::new(&config.engine, collab, owned_tempo_map(tempo))?;

    let audio = start_audio_system(&config.audio, engine)
        .with_context(|| format!("Failed to start {} backend", config.audio.backend.name()))?;
    let mut handle: AudioHandle = audio.handle;
    println!(
        "{} backend running: {} Hz, {} frames ({:.1} ms)",
        config.audio.backend.name(),
        audio.sample_rate,
        audio.buffer_size,
        audio.latency_ms
    );

    let mut host = Host {
        handles,
        stats,
        timeline: Timeline::default(),
        sample_rate: audio.sample_rate,
        buffer_size: audio.buffer_size,
        timeout: config.engine.command_timeout(),
        retries: config.engine.command_retries,
    };

    if audio.sample_rate != config.audio.sample_rate {
        log::info!(
            "Driver runs at {} Hz, rebuilding tempo map",
            audio.sample_rate
        );
        if let Err(e) = host.set_tempo(DEFAULT_BPM) {
            log::error!("{:#}", e);
        }
    }

    println!("{}", HELP);
    let lines = spawn_stdin_reader()?;
    let ticker = channel::tick(Duration::from_millis(50));

    loop {
        select! {
            recv(lines) -> line => {
                let Ok(line) = line else { break };
                match repl::parse(&line) {
                    Ok(Some(action)) => match host.run(action) {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => eprintln!("error: {:#}", e),
                    },
                    Ok(None) => {}
                    Err(e) => eprintln!("{}", e),
                }
            }
            recv(ticker) -> _ => host.print_events(),
        }
    }

    handle.stop();
    host.print_events();
    log::info!("transit-host shut down");
    Ok(())
}
