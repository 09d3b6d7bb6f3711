//! Audio capture via cpal backend.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not**:
//! - Block on a mutex, condvar, or disk I/O
//! - Allocate heap memory in steady state
//!
//! This module satisfies that contract by leasing sample buffers from the
//! block ring's recycle pool and handing whole [`AudioBlock`]s to a
//! non-blocking `push` whose overrun policy is drop-oldest-and-count.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio
//! on macOS). `AudioCapture` therefore must be created and dropped on the
//! same thread. The engine accomplishes this by calling `open` inside
//! `spawn_blocking`.

pub mod device;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig,
};

#[cfg(feature = "audio-cpal")]
use crate::buffering::block::AudioBlock;
use crate::{
    buffering::BlockProducer,
    error::{RecorderError, Result},
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

/// Requested capture parameters. `None` fields use the device default.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureRequest {
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
}

/// Handle to an active capture stream.
///
/// **Not `Send`** — `cpal::Stream` is bound to its creation thread on
/// Windows/macOS. Create and drop this type on the same OS thread.
pub struct AudioCapture {
    /// Kept alive so the stream is not dropped prematurely.
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    /// Shared flag — set to `false` to signal the callback to no-op.
    running: Arc<AtomicBool>,
    /// Actual capture sample rate (Hz).
    pub sample_rate: u32,
    /// Actual interleaved channel count.
    pub channels: u16,
}

impl AudioCapture {
    /// Open an input device by preferred name, otherwise fall back to the
    /// default input device and then the first available one. Pushes
    /// interleaved f32 blocks into `producer` until `running` goes false.
    ///
    /// `stream_failed` is raised from the cpal error callback when the
    /// stream dies; the writer pipeline treats that as fatal.
    ///
    /// # Errors
    /// `RecorderError::NoDefaultInputDevice` when no input exists,
    /// `RecorderError::AudioDevice`/`AudioStream` on cpal failures.
    #[cfg(feature = "audio-cpal")]
    pub fn open(
        producer: BlockProducer,
        running: Arc<AtomicBool>,
        stream_failed: Arc<AtomicBool>,
        preferred_device_name: Option<&str>,
        request: CaptureRequest,
    ) -> Result<Self> {
        use cpal::traits::HostTrait;

        let host = cpal::default_host();
        let mut selected_device = None;

        if let Some(preferred_name) = preferred_device_name {
            match host.input_devices() {
                Ok(mut devices) => {
                    selected_device = devices.find(|device| {
                        device
                            .name()
                            .map(|name| name == preferred_name)
                            .unwrap_or(false)
                    });
                    if selected_device.is_none() {
                        warn!(
                            "preferred input device '{}' not found, falling back",
                            preferred_name
                        );
                    }
                }
                Err(e) => {
                    warn!("failed to list input devices while resolving preference: {e}");
                }
            }
        }

        let device = if let Some(device) = selected_device {
            device
        } else if let Some(default) = host.default_input_device() {
            default
        } else {
            let mut devices = host
                .input_devices()
                .map_err(|e| RecorderError::AudioDevice(e.to_string()))?;
            let fallback = devices
                .next()
                .ok_or(RecorderError::NoDefaultInputDevice)?;
            warn!("no default input device, falling back to first available input");
            fallback
        };

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| RecorderError::AudioDevice(e.to_string()))?;

        let sample_rate = request.sample_rate.unwrap_or(supported.sample_rate().0);
        let channels = request.channels.unwrap_or(supported.channels());

        info!(sample_rate, channels, "capture config selected");

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        // Pre-clone one flag set per sample format branch so each closure
        // owns its state.
        let running_f32 = Arc::clone(&running);
        let running_i16 = Arc::clone(&running);
        let failed_f32 = Arc::clone(&stream_failed);
        let failed_i16 = Arc::clone(&stream_failed);

        let stream = match supported.sample_format() {
            SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _info| {
                    if !running_f32.load(Ordering::Relaxed) {
                        return;
                    }
                    let mut buf = producer.lease();
                    buf.extend_from_slice(data);
                    producer.push(AudioBlock::new(buf, channels, sample_rate));
                },
                move |err| {
                    failed_f32.store(true, Ordering::Release);
                    error!("audio stream error: {err}");
                },
                None,
            ),

            SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _info| {
                    if !running_i16.load(Ordering::Relaxed) {
                        return;
                    }
                    let mut buf = producer.lease();
                    buf.extend(data.iter().map(|s| *s as f32 / 32768.0));
                    producer.push(AudioBlock::new(buf, channels, sample_rate));
                },
                move |err| {
                    failed_i16.store(true, Ordering::Release);
                    error!("audio stream error: {err}");
                },
                None,
            ),

            fmt => {
                return Err(RecorderError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| RecorderError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| RecorderError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            sample_rate,
            channels,
        })
    }

    /// Stop: signal the callback to no-op on its next invocation.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl AudioCapture {
    pub fn open(
        _producer: BlockProducer,
        _running: Arc<AtomicBool>,
        _stream_failed: Arc<AtomicBool>,
        _preferred_device_name: Option<&str>,
        _request: CaptureRequest,
    ) -> Result<Self> {
        Err(RecorderError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}
