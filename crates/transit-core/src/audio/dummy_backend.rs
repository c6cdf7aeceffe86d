//! Timer-driven backend without audio output
//!
//! A dedicated thread wakes once per period and runs the engine against a
//! [`FreeRunningTransport`]. Useful for headless runs and for exercising the
//! transport without a sound card.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::backend::{AudioHandle, AudioSystemResult};
use super::config::AudioConfig;
use super::error::{AudioError, AudioResult};
use super::free_run::FreeRunningTransport;
use crate::engine::Engine;

/// Dummy driver handle; dropping it stops the driver thread
pub struct DummyAudioHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    sample_rate: u32,
    buffer_size: u32,
}

impl DummyAudioHandle {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    /// Stop the driver thread and wait for it to post its shutdown event
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Dummy audio thread panicked");
            }
        }
    }
}

impl Drop for DummyAudioHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

pub fn start_audio_system(config: &AudioConfig, mut engine: Engine) -> AudioResult<AudioSystemResult> {
    let sample_rate = config.sample_rate.max(1);
    let frames = config.period_frames();
    let period = Duration::from_nanos(u64::from(frames) * 1_000_000_000 / u64::from(sample_rate));

    let mut device = FreeRunningTransport::new(config.relocate_cycles);
    engine.prepare(&mut device);

    let running = Arc::new(AtomicBool::new(true));
    let thread_running = Arc::clone(&running);

    let thread = thread::Builder::new()
        .name("transit-dummy".to_string())
        .spawn(move || {
            let mut deadline = Instant::now();
            while thread_running.load(Ordering::Relaxed) {
                device.begin_cycle();
                engine.on_cycle(&mut device, frames);
                device.end_cycle(frames);

                deadline += period;
                let now = Instant::now();
                if deadline > now {
                    thread::sleep(deadline - now);
                } else {
                    // Overran: don't try to catch up
                    deadline = now;
                }
            }
            engine.shutdown();
            log::info!("Dummy audio thread stopped");
        })
        .map_err(|e| AudioError::Spawn(e.to_string()))?;

    let latency_ms = config.latency_ms();
    log::info!(
        "Dummy driver started: {}Hz, {} frames (~{:.1}ms period)",
        sample_rate,
        frames,
        latency_ms
    );

    Ok(AudioSystemResult {
        handle: AudioHandle::Dummy(DummyAudioHandle {
            running,
            thread: Some(thread),
            sample_rate,
            buffer_size: frames,
        }),
        sample_rate,
        buffer_size: frames,
        latency_ms,
    })
}
