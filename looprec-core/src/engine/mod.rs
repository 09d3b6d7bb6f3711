//! `RecorderEngine` — top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! RecorderEngine::new()
//!     └─► start()    → device open, pipeline + gain worker spawned, Running
//!         └─► stop() → running=false, writer drains, segments closed, Stopped
//! ```
//!
//! `stop()` is idempotent: on an already-stopped (or failed) recorder it is
//! a no-op, so shutdown paths can always call it unconditionally.
//!
//! ## Threading
//!
//! `cpal::Stream` is `!Send` on Windows/macOS (COM / CoreAudio thread
//! affinity). `AudioCapture` is therefore created *inside* the
//! `spawn_blocking` closure so it never crosses a thread boundary. A sync
//! oneshot channel propagates any open-device error back to the `start()`
//! caller, and a second one lets `stop()` wait for the writer to finish
//! draining before it reports Stopped.

pub mod pipeline;

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    mpsc as std_mpsc, Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::info;

use crate::{
    audio::{AudioCapture, CaptureRequest},
    buffering::{create_block_ring, DEFAULT_RING_BLOCKS},
    error::{RecorderError, Result},
    gain,
    ipc::events::{LevelEvent, RecorderState, RecorderStatusEvent, SegmentEvent, StatusSnapshot},
    split::{SilenceMetric, SplitDetector},
    writer::{encoder::EncoderFactory, encoder::StreamSpec, AudioFormat, SegmentWriter, WriterSettings},
};

/// Broadcast channel capacity. Level events arrive at block rate; slow
/// consumers drop from the tail rather than stalling the pipeline.
const BROADCAST_CAP: usize = 1024;

/// Configuration for `RecorderEngine`.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Capture device name; `None` uses default input selection.
    pub preferred_device: Option<String>,
    /// Requested capture sample rate. `None` takes the device default.
    pub sample_rate: Option<u32>,
    /// Requested channel count. `None` takes the device default.
    pub channels: Option<u16>,
    /// Directory segments are written into (created on `start()`).
    pub out_dir: PathBuf,
    /// Filename template; `{timestamp}` and `{index}` are substituted.
    pub template: String,
    pub format: AudioFormat,
    /// Close the segment every interval. `None` disables time splits.
    pub split_interval: Option<Duration>,
    /// Silence threshold in dBFS; `None` disables silence splits.
    pub silence_threshold_dbfs: Option<f32>,
    /// How long levels must stay below the threshold before a split.
    pub silence_duration: Duration,
    pub silence_metric: SilenceMetric,
    /// Blocks with a pre-gate peak below this are written as digital
    /// silence. `None` disables the gate.
    pub noise_gate_dbfs: Option<f32>,
    /// Post-close gain pass in dB. 0.0 skips the pass entirely.
    pub gain_db: f32,
    /// Block ring capacity; overruns drop the oldest block.
    pub ring_blocks: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            preferred_device: None,
            sample_rate: None,
            channels: None,
            out_dir: PathBuf::from("recordings"),
            template: "recording_{timestamp}_{index}".into(),
            format: AudioFormat::Wav,
            split_interval: None,
            silence_threshold_dbfs: None,
            silence_duration: Duration::from_secs(2),
            silence_metric: SilenceMetric::Peak,
            noise_gate_dbfs: None,
            gain_db: 0.0,
            ring_blocks: DEFAULT_RING_BLOCKS,
        }
    }
}

/// The top-level recorder handle.
///
/// `RecorderEngine` is `Send + Sync` — all fields use interior mutability.
/// Wrap in `Arc<RecorderEngine>` to share between commands and
/// event-forwarding async tasks.
pub struct RecorderEngine {
    config: RecorderConfig,
    /// Externally registered encoders (FLAC, MP3). WAV is built in.
    encoder_factories: Vec<Arc<dyn EncoderFactory>>,
    /// `true` while capture + pipeline are active.
    running: Arc<AtomicBool>,
    /// Raised by the cpal error callback when the stream dies.
    stream_failed: Arc<AtomicBool>,
    /// Canonical status snapshot, updated by the pipeline per block.
    status: Arc<Mutex<StatusSnapshot>>,
    level_tx: broadcast::Sender<LevelEvent>,
    status_tx: broadcast::Sender<RecorderStatusEvent>,
    segment_tx: broadcast::Sender<SegmentEvent>,
    /// Monotonically increasing event sequence counter.
    seq: Arc<AtomicU64>,
    /// Shared pipeline diagnostics counters.
    diagnostics: Arc<pipeline::PipelineDiagnostics>,
    /// Signalled when the writer pipeline exits; `stop()` joins on it.
    done_rx: Mutex<Option<std_mpsc::Receiver<()>>>,
}

impl RecorderEngine {
    /// Create a new engine. Does not open the device — call `start()`.
    pub fn new(config: RecorderConfig) -> Self {
        let (level_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (segment_tx, _) = broadcast::channel(BROADCAST_CAP);

        Self {
            config,
            encoder_factories: Vec::new(),
            running: Arc::new(AtomicBool::new(false)),
            stream_failed: Arc::new(AtomicBool::new(false)),
            status: Arc::new(Mutex::new(StatusSnapshot::idle())),
            level_tx,
            status_tx,
            segment_tx,
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::new(pipeline::PipelineDiagnostics::default()),
            done_rx: Mutex::new(None),
        }
    }

    /// Register an encoder factory for a non-WAV format. Must be called
    /// before `start()`; later registrations apply to the next run.
    pub fn register_encoder(&mut self, factory: Arc<dyn EncoderFactory>) {
        self.encoder_factories.push(factory);
    }

    /// Start capture and the writer pipeline.
    ///
    /// Blocks until the audio device is confirmed open (or fails), then
    /// returns; the pipeline keeps running on a background blocking thread.
    ///
    /// # Errors
    /// - `RecorderError::AlreadyRunning` if already started.
    /// - `RecorderError::NoDefaultInputDevice` / `AudioStream` on device
    ///   errors; the engine parks in `Failed`.
    pub fn start(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(RecorderError::AlreadyRunning);
        }

        std::fs::create_dir_all(&self.config.out_dir)?;

        self.diagnostics.reset();
        self.stream_failed.store(false, Ordering::SeqCst);
        *self.status.lock() = StatusSnapshot::idle();
        self.set_state(RecorderState::Starting, None);
        self.running.store(true, Ordering::SeqCst);

        let (producer, consumer, ring_counters) = create_block_ring(self.config.ring_blocks);

        // Closed segments flow to the gain worker over an unbounded channel;
        // disk rewrites there must never backpressure the writer.
        let gain_tx = if self.config.gain_db != 0.0 {
            let (tx, rx) = crossbeam_channel::unbounded();
            tokio::task::spawn_blocking({
                let ctx = gain::GainContext {
                    rx,
                    gain_db: self.config.gain_db,
                    segment_tx: self.segment_tx.clone(),
                    seq: Arc::clone(&self.seq),
                    diagnostics: Arc::clone(&self.diagnostics),
                };
                move || gain::run(ctx)
            });
            Some(tx)
        } else {
            None
        };

        // Clone all Arc-wrapped state before moving into the closure.
        let config = self.config.clone();
        let encoder_factories = self.encoder_factories.clone();
        let running = Arc::clone(&self.running);
        let stream_failed = Arc::clone(&self.stream_failed);
        let level_tx = self.level_tx.clone();
        let status_tx = self.status_tx.clone();
        let segment_tx = self.segment_tx.clone();
        let status = Arc::clone(&self.status);
        let seq = Arc::clone(&self.seq);
        let diagnostics = Arc::clone(&self.diagnostics);

        // Sync oneshot: pipeline thread signals open success/failure back.
        let (open_tx, open_rx) = std_mpsc::channel::<Result<(u32, u16)>>();
        let (done_tx, done_rx) = std_mpsc::channel::<()>();
        *self.done_rx.lock() = Some(done_rx);

        tokio::task::spawn_blocking(move || {
            // Open the device on THIS thread — cpal::Stream is !Send.
            let capture = match AudioCapture::open(
                producer,
                Arc::clone(&running),
                Arc::clone(&stream_failed),
                config.preferred_device.as_deref(),
                CaptureRequest {
                    sample_rate: config.sample_rate,
                    channels: config.channels,
                },
            ) {
                Ok(c) => {
                    let _ = open_tx.send(Ok((c.sample_rate, c.channels)));
                    c
                }
                Err(e) => {
                    let _ = open_tx.send(Err(e));
                    running.store(false, Ordering::SeqCst);
                    let _ = done_tx.send(());
                    return;
                }
            };

            let writer = SegmentWriter::new(
                WriterSettings {
                    out_dir: config.out_dir.clone(),
                    template: config.template.clone(),
                    format: config.format,
                    noise_gate_dbfs: config.noise_gate_dbfs,
                },
                StreamSpec {
                    sample_rate: capture.sample_rate,
                    channels: capture.channels,
                },
                encoder_factories,
            );
            let detector = SplitDetector::new(
                capture.sample_rate,
                config.split_interval,
                config.silence_threshold_dbfs,
                config.silence_duration,
                config.silence_metric,
            );

            pipeline::run(pipeline::PipelineContext {
                writer,
                detector,
                consumer,
                running,
                stream_failed,
                level_tx,
                status_tx,
                segment_tx,
                gain_tx,
                status,
                seq,
                ring_counters,
                diagnostics,
                sample_rate: capture.sample_rate,
            });

            // Stream drops here, releasing the audio device on this thread.
            // The gain sender dropped with the context, so the worker drains
            // its queue and exits.
            drop(capture);
            let _ = done_tx.send(());
        });

        // Block start() until device open is confirmed.
        match open_rx.recv() {
            Ok(Ok((sample_rate, channels))) => {
                info!(sample_rate, channels, "recorder started");
                self.set_state(RecorderState::Running, None);
                Ok(())
            }
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                self.set_state(RecorderState::Failed, Some(e.to_string()));
                Err(e)
            }
            Err(_) => {
                // Channel closed before a message — spawn_blocking panicked?
                self.running.store(false, Ordering::SeqCst);
                self.set_state(RecorderState::Failed, Some("pipeline failed to start".into()));
                Err(RecorderError::Other(anyhow::anyhow!(
                    "pipeline task died unexpectedly"
                )))
            }
        }
    }

    /// Stop capture and wait for the writer to drain and close the open
    /// segment. A no-op when the recorder is not running (including after
    /// a failure, which stops capture on its own).
    pub fn stop(&self) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        info!("recorder stop requested");
        self.set_state(RecorderState::Stopping, None);
        self.running.store(false, Ordering::SeqCst);

        // Wait for the pipeline to flush buffered blocks and finalize the
        // segment before reporting Stopped.
        let done_rx = self.done_rx.lock().take();
        if let Some(done_rx) = done_rx {
            let _ = done_rx.recv();
        }

        // A failure racing the stop wins; don't mask it with Stopped.
        if self.status.lock().state != RecorderState::Failed {
            self.set_state(RecorderState::Stopped, None);
        }
        info!("recorder stopped");
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RecorderState {
        self.status.lock().state
    }

    /// Pull-based status snapshot, safe to poll at UI rate.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.status.lock().clone()
    }

    /// Subscribe to live per-block level events.
    pub fn subscribe_levels(&self) -> broadcast::Receiver<LevelEvent> {
        self.level_tx.subscribe()
    }

    /// Subscribe to lifecycle and warning events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<RecorderStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Subscribe to segment close / gain events.
    pub fn subscribe_segments(&self) -> broadcast::Receiver<SegmentEvent> {
        self.segment_tx.subscribe()
    }

    /// Snapshot of pipeline counters for observability.
    pub fn diagnostics_snapshot(&self) -> pipeline::DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    fn set_state(&self, state: RecorderState, detail: Option<String>) {
        self.status.lock().state = state;
        let _ = self.status_tx.send(RecorderStatusEvent { state, detail });
    }
}
