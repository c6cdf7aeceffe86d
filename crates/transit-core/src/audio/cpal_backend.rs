//! CPAL audio backend
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐                     ┌─────────────────────┐
//! │  Control Thread  │───send()───────────►│   Command Ring      │
//! │                  │                     │   (capacity 1)      │
//! └──────────────────┘                     └──────────┬──────────┘
//!         ▲                                           │ pop()
//!         │ acks, sync events, atomics                ▼
//! ┌──────────────────┐                     ┌─────────────────────┐
//! │  EngineHandles   │◄────────────────────│  CPAL Audio Thread  │
//! │   (lock-free)    │                     │  (owns Engine)      │
//! └──────────────────┘                     └─────────────────────┘
//! ```
//!
//! CPAL has no transport of its own, so the callback drives a
//! [`FreeRunningTransport`]. The engine and the transport move into the
//! stream callback; no mutex is involved.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize as CpalBufferSize, SampleFormat, Stream, StreamConfig};

use super::backend::{AudioHandle, AudioSystemResult};
use super::config::AudioConfig;
use super::error::{AudioError, AudioResult};
use super::free_run::FreeRunningTransport;
use crate::engine::Engine;
use crate::types::MAX_BUFFER_SIZE;

/// CPAL-specific audio handle
///
/// Keeps the output stream alive. Drop this to stop audio.
pub struct CpalAudioHandle {
    stream: Option<Stream>,
    stopping: Arc<AtomicBool>,
    sample_rate: u32,
    buffer_size: u32,
}

impl CpalAudioHandle {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    /// Let the callback post its shutdown event, then close the stream
    pub fn stop(&mut self) {
        if self.stream.is_none() {
            return;
        }
        self.stopping.store(true, Ordering::Relaxed);
        // Two periods is enough for the callback to see the flag
        let period_ms = u64::from(self.buffer_size) * 1000 / u64::from(self.sample_rate.max(1));
        std::thread::sleep(Duration::from_millis(2 * period_ms + 1));
        self.stream = None;
        log::info!("CPAL stream closed");
    }
}

impl Drop for CpalAudioHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn find_device(config: &AudioConfig) -> AudioResult<cpal::Device> {
    let host = cpal::default_host();
    match &config.device {
        None => host.default_output_device().ok_or(AudioError::NoDevices),
        Some(name) => host
            .output_devices()
            .map_err(|e| AudioError::Driver(e.to_string()))?
            .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
            .ok_or_else(|| AudioError::DeviceNotFound(name.clone())),
    }
}

/// Pick an f32 stereo config at the requested rate, falling back to the
/// device's maximum rate
fn get_output_config(
    device: &cpal::Device,
    config: &AudioConfig,
) -> AudioResult<cpal::SupportedStreamConfig> {
    let supported: Vec<_> = device
        .supported_output_configs()
        .map_err(|e| AudioError::Driver(e.to_string()))?
        .collect();

    let target = config.sample_rate;
    let in_range = |c: &&cpal::SupportedStreamConfigRange| {
        target >= c.min_sample_rate().0 && target <= c.max_sample_rate().0
    };

    let best = supported
        .iter()
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .filter(|c| c.channels() >= 2)
        .find(in_range)
        .or_else(|| {
            supported
                .iter()
                .filter(|c| c.sample_format() == SampleFormat::F32)
                .find(|c| c.channels() >= 2)
        })
        .ok_or_else(|| {
            AudioError::Driver("No f32 stereo output configuration".to_string())
        })?;

    let sample_rate = if in_range(&best) {
        cpal::SampleRate(target)
    } else {
        let fallback = best.max_sample_rate();
        log::warn!(
            "Audio device doesn't support {}Hz, falling back to {}Hz",
            target,
            fallback.0
        );
        fallback
    };
    Ok(best.clone().with_sample_rate(sample_rate))
}

pub fn start_audio_system(config: &AudioConfig, mut engine: Engine) -> AudioResult<AudioSystemResult> {
    let device = find_device(config)?;
    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    log::info!("Using audio device: {}", device_name);

    let supported = get_output_config(&device, config)?;
    let sample_rate = supported.sample_rate().0;
    let buffer_size = config.period_frames();
    let stream_config = StreamConfig {
        channels: supported.channels(),
        sample_rate: supported.sample_rate(),
        buffer_size: CpalBufferSize::Fixed(buffer_size),
    };
    let latency_ms = (buffer_size as f32 / sample_rate as f32) * 1000.0;

    log::info!(
        "Audio config: {} channels, {}Hz, {} frames (~{:.1}ms latency)",
        stream_config.channels,
        sample_rate,
        buffer_size,
        latency_ms
    );

    let mut transport = FreeRunningTransport::new(config.relocate_cycles);
    engine.prepare(&mut transport);

    let stopping = Arc::new(AtomicBool::new(false));
    let stream = build_output_stream(
        &device,
        &stream_config,
        engine,
        transport,
        Arc::clone(&stopping),
    )?;
    stream
        .play()
        .map_err(|e| AudioError::StreamStart(e.to_string()))?;

    log::info!("Audio stream started");

    Ok(AudioSystemResult {
        handle: AudioHandle::Cpal(CpalAudioHandle {
            stream: Some(stream),
            stopping,
            sample_rate,
            buffer_size,
        }),
        sample_rate,
        buffer_size,
        latency_ms,
    })
}

fn build_output_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    mut engine: Engine,
    mut transport: FreeRunningTransport,
    stopping: Arc<AtomicBool>,
) -> AudioResult<Stream> {
    let channels = config.channels as usize;
    let mut shut_down = false;

    device
        .build_output_stream(
            config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                if shut_down || stopping.load(Ordering::Relaxed) {
                    if !shut_down {
                        engine.shutdown();
                        shut_down = true;
                    }
                    data.fill(0.0);
                    return;
                }

                // CPAL may hand out more than one engine period at once
                for chunk in data.chunks_mut(MAX_BUFFER_SIZE * channels) {
                    let frames = (chunk.len() / channels) as u32;
                    transport.begin_cycle();
                    engine.on_cycle(&mut transport, frames);
                    transport.end_cycle(frames);

                    let output = engine.output().as_slice();
                    for (frame, sample) in chunk.chunks_mut(channels).zip(output) {
                        frame[0] = sample.left;
                        if channels > 1 {
                            frame[1] = sample.right;
                        }
                        for ch in frame.iter_mut().skip(2) {
                            *ch = 0.0;
                        }
                    }
                }
            },
            move |err| {
                log::error!("Audio stream error: {}", err);
            },
            None,
        )
        .map_err(|e| AudioError::StreamBuild(e.to_string()))
}
