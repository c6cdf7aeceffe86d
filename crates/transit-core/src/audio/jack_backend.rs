//! Native JACK backend for Linux
//!
//! The JACK transport is the device transport: the engine follows its
//! rolling state and position, and seeks, starts and stops go to the JACK
//! server so every transport-aware client moves together.
//!
//! Each process callback:
//!
//! ```text
//! transport.query() ──► JackTransport (state, frame, cycle clock)
//!                            │
//!                            ▼
//!                  Engine::on_cycle(frames)
//!                            │ seek/start/stop
//!                            ▼
//!              jack_transport_locate/start/stop
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jack::{AudioOut, Client, ClientOptions, Control, Port, ProcessScope};

use super::backend::{AudioHandle, AudioSystemResult};
use super::config::AudioConfig;
use super::error::{AudioError, AudioResult};
use crate::engine::{AudioDevice, DeviceState, Engine};

/// JACK output port names
const OUT_LEFT: &str = "out_left";
const OUT_RIGHT: &str = "out_right";

/// JACK-specific audio handle
///
/// Keeps the JACK client active. Drop this to disconnect from JACK.
pub struct JackAudioHandle {
    client: Option<jack::AsyncClient<JackNotifications, JackProcessor>>,
    stopping: Arc<AtomicBool>,
    sample_rate: u32,
    buffer_size: u32,
}

impl JackAudioHandle {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    /// Let the process callback post its shutdown event, then deactivate
    pub fn stop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        self.stopping.store(true, Ordering::Relaxed);
        let period_ms = u64::from(self.buffer_size) * 1000 / u64::from(self.sample_rate.max(1));
        std::thread::sleep(Duration::from_millis(2 * period_ms + 1));
        if let Err(e) = client.deactivate() {
            log::error!("Failed to deactivate JACK client: {}", e);
        } else {
            log::info!("JACK client deactivated");
        }
    }
}

impl Drop for JackAudioHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The JACK transport seen as the engine's audio device
///
/// Queried once at the top of every process cycle.
struct JackTransport {
    transport: jack::Transport,
    state: DeviceState,
    frame: u64,
    cycle_start: u64,
    /// Device clock when the callback ran
    clock: u64,
    available: bool,
}

impl JackTransport {
    fn new(transport: jack::Transport) -> Self {
        Self {
            transport,
            state: DeviceState::Stopped,
            frame: 0,
            cycle_start: 0,
            clock: 0,
            available: false,
        }
    }

    fn refresh(&mut self, client: &Client, ps: &ProcessScope) {
        self.cycle_start = u64::from(ps.last_frame_time());
        self.clock = u64::from(client.frame_time());
        match self.transport.query() {
            Ok(status) => {
                self.available = true;
                self.frame = u64::from(status.pos.frame());
                self.state = match status.state {
                    jack::TransportState::Rolling => DeviceState::Playing,
                    jack::TransportState::Starting => DeviceState::Starting,
                    _ => DeviceState::Stopped,
                };
            }
            Err(_) => self.available = false,
        }
    }
}

impl AudioDevice for JackTransport {
    fn is_available(&self) -> bool {
        self.available
    }

    fn state(&self) -> DeviceState {
        self.state
    }

    fn transport_frame(&self) -> u64 {
        self.frame
    }

    fn frame_pos(&self) -> u64 {
        self.clock
    }

    fn frames_at_cycle_start(&self) -> u64 {
        self.cycle_start
    }

    fn seek_transport(&mut self, frame: u64) {
        let frame = frame.min(u64::from(jack::Frames::MAX)) as jack::Frames;
        if self.transport.locate(frame).is_err() {
            self.available = false;
        }
    }

    fn start_transport(&mut self) {
        if let Err(e) = self.transport.start() {
            log::warn!("JACK transport start failed: {}", e);
        }
    }

    fn stop_transport(&mut self) {
        if let Err(e) = self.transport.stop() {
            log::warn!("JACK transport stop failed: {}", e);
        }
    }
}

/// JACK process handler
///
/// Owns the engine exclusively; no mutex needed.
struct JackProcessor {
    out_left: Port<AudioOut>,
    out_right: Port<AudioOut>,
    engine: Engine,
    device: JackTransport,
    stopping: Arc<AtomicBool>,
    shut_down: bool,
}

impl jack::ProcessHandler for JackProcessor {
    fn process(&mut self, client: &Client, ps: &ProcessScope) -> Control {
        let left = self.out_left.as_mut_slice(ps);
        let right = self.out_right.as_mut_slice(ps);
        left.fill(0.0);
        right.fill(0.0);

        if self.shut_down || self.stopping.load(Ordering::Relaxed) {
            if !self.shut_down {
                self.engine.shutdown();
                self.shut_down = true;
            }
            return Control::Continue;
        }

        self.device.refresh(client, ps);
        // Server periods may exceed the engine's buffer size
        self.engine
            .run_period(&mut self.device, ps.n_frames(), |offset, output| {
                let outs = left[offset..].iter_mut().zip(right[offset..].iter_mut());
                for ((l, r), sample) in outs.zip(output.as_slice()) {
                    *l = sample.left;
                    *r = sample.right;
                }
            });

        Control::Continue
    }
}

/// JACK notification handler
struct JackNotifications;

impl jack::NotificationHandler for JackNotifications {
    fn sample_rate(&mut self, _client: &Client, srate: jack::Frames) -> Control {
        log::info!("JACK sample rate changed to: {}", srate);
        Control::Continue
    }

    fn xrun(&mut self, _client: &Client) -> Control {
        log::warn!("JACK xrun detected");
        Control::Continue
    }
}

pub fn start_audio_system(config: &AudioConfig, mut engine: Engine) -> AudioResult<AudioSystemResult> {
    // JACK may rename the client if the name is taken
    let (client, _status) = Client::new(&config.client_name, ClientOptions::NO_START_SERVER)
        .map_err(|e| AudioError::Driver(format!("Failed to create JACK client: {}", e)))?;
    let client_name = client.name().to_string();

    let sample_rate = client.sample_rate() as u32;
    let buffer_size = client.buffer_size();
    let latency_ms = (buffer_size as f32 / sample_rate as f32) * 1000.0;

    log::info!(
        "JACK client '{}' created (sample rate: {}Hz, buffer: {} frames, latency: {:.1}ms)",
        client_name,
        sample_rate,
        buffer_size,
        latency_ms
    );
    if sample_rate != config.sample_rate {
        log::warn!(
            "JACK runs at {}Hz but the tempo map was built for {}Hz",
            sample_rate,
            config.sample_rate
        );
    }

    let out_left = client
        .register_port(OUT_LEFT, AudioOut::default())
        .map_err(|e| AudioError::Driver(format!("Failed to register port: {}", e)))?;
    let out_right = client
        .register_port(OUT_RIGHT, AudioOut::default())
        .map_err(|e| AudioError::Driver(format!("Failed to register port: {}", e)))?;

    let mut device = JackTransport::new(client.transport());
    engine.prepare(&mut device);

    let stopping = Arc::new(AtomicBool::new(false));
    let processor = JackProcessor {
        out_left,
        out_right,
        engine,
        device,
        stopping: Arc::clone(&stopping),
        shut_down: false,
    };

    let async_client = client
        .activate_async(JackNotifications, processor)
        .map_err(|e| AudioError::Driver(format!("Failed to activate JACK client: {}", e)))?;

    log::info!("JACK client activated");

    if config.auto_connect {
        connect_playback(async_client.as_client(), &client_name);
    }

    Ok(AudioSystemResult {
        handle: AudioHandle::Jack(JackAudioHandle {
            client: Some(async_client),
            stopping,
            sample_rate,
            buffer_size,
        }),
        sample_rate,
        buffer_size,
        latency_ms,
    })
}

/// Connect our outputs to the first physical playback pair
fn connect_playback(client: &Client, client_name: &str) {
    let mut playback = client.ports(
        Some(".*:playback_.*"),
        None,
        jack::PortFlags::IS_INPUT | jack::PortFlags::IS_PHYSICAL,
    );
    playback.sort();
    if playback.len() < 2 {
        log::warn!("No JACK playback pair found for auto-connect");
        return;
    }

    let ours = [
        format!("{}:{}", client_name, OUT_LEFT),
        format!("{}:{}", client_name, OUT_RIGHT),
    ];
    for (source, destination) in ours.iter().zip(&playback) {
        match client.connect_ports_by_name(source, destination) {
            Ok(()) => log::info!("Connected {} -> {}", source, destination),
            Err(e) => log::warn!("Failed to connect {} -> {}: {}", source, destination, e),
        }
    }
}
