//! Blocking writer pipeline.
//!
//! ## Stages (per drained block)
//!
//! ```text
//! 1. Pop one AudioBlock from the block ring (FIFO)
//! 2. Meter pre-gate levels → LevelReading, broadcast LevelEvent
//! 3. SplitDetector::observe → Continue | SplitNow(reason)
//! 4. On SplitNow: close segment, dispatch to gain worker, open next
//! 5. Write the block (noise gate applied against pre-gate peak)
//! 6. Recycle the sample buffer back to the capture callback
//! ```
//!
//! The boundary block is always written to the *new* segment, so rotation
//! never drops queued audio. The loop runs inside `spawn_blocking`,
//! keeping disk I/O off both the audio callback and the async executor.
//!
//! A fatal write error or a dead device stream drains whatever the ring
//! still holds, closes the open segment with those frames, and parks the
//! recorder in `Failed`.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    buffering::{BlockConsumer, RingCounters},
    error::WriteError,
    ipc::events::{LevelEvent, RecorderState, RecorderStatusEvent, SegmentEvent, SegmentStage, StatusSnapshot},
    meter::{measure_into, LevelReading},
    split::{SplitDecision, SplitDetector},
    writer::{AudioFormat, CloseReason, ClosedSegment, SegmentWriter},
};

/// Shared pipeline counters, observable while running.
#[derive(Debug, Default)]
pub struct PipelineDiagnostics {
    pub blocks_in: AtomicU64,
    pub frames_in: AtomicU64,
    pub frames_written: AtomicU64,
    pub segments_closed: AtomicU64,
    pub format_fallbacks: AtomicU64,
    pub gain_applied: AtomicU64,
    pub gain_failed: AtomicU64,
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        self.blocks_in.store(0, Ordering::Relaxed);
        self.frames_in.store(0, Ordering::Relaxed);
        self.frames_written.store(0, Ordering::Relaxed);
        self.segments_closed.store(0, Ordering::Relaxed);
        self.format_fallbacks.store(0, Ordering::Relaxed);
        self.gain_applied.store(0, Ordering::Relaxed);
        self.gain_failed.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            blocks_in: self.blocks_in.load(Ordering::Relaxed),
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            segments_closed: self.segments_closed.load(Ordering::Relaxed),
            format_fallbacks: self.format_fallbacks.load(Ordering::Relaxed),
            gain_applied: self.gain_applied.load(Ordering::Relaxed),
            gain_failed: self.gain_failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsSnapshot {
    pub blocks_in: u64,
    pub frames_in: u64,
    pub frames_written: u64,
    pub segments_closed: u64,
    pub format_fallbacks: u64,
    pub gain_applied: u64,
    pub gain_failed: u64,
}

/// All context the pipeline needs, passed as one struct so the blocking
/// closure stays tidy.
pub struct PipelineContext {
    pub writer: SegmentWriter,
    pub detector: SplitDetector,
    pub consumer: BlockConsumer,
    pub running: Arc<AtomicBool>,
    pub stream_failed: Arc<AtomicBool>,
    pub level_tx: broadcast::Sender<LevelEvent>,
    pub status_tx: broadcast::Sender<RecorderStatusEvent>,
    pub segment_tx: broadcast::Sender<SegmentEvent>,
    /// Closed segments queued for the gain worker. `None` when the gain is
    /// 0 dB and no worker was spawned.
    pub gain_tx: Option<Sender<ClosedSegment>>,
    pub status: Arc<Mutex<StatusSnapshot>>,
    pub seq: Arc<AtomicU64>,
    pub ring_counters: Arc<RingCounters>,
    pub diagnostics: Arc<PipelineDiagnostics>,
    pub sample_rate: u32,
}

/// Wait per drain attempt when the ring is empty (avoids busy-wait).
const POP_TIMEOUT: Duration = Duration::from_millis(10);

/// Run the blocking pipeline until `running` goes false or a fatal error
/// occurs. Remaining buffered blocks are always flushed before the open
/// segment closes.
pub fn run(mut ctx: PipelineContext) {
    info!(sample_rate = ctx.sample_rate, "writer pipeline started");

    if let Err(e) = open_segment(&mut ctx) {
        fail(&mut ctx, format!("could not open first segment: {e}"));
        return;
    }

    let mut reading = LevelReading::default();
    let mut total_frames: u64 = 0;
    let mut fatal: Option<String> = None;

    loop {
        let device_down = ctx.stream_failed.load(Ordering::Acquire);
        let keep_running = ctx.running.load(Ordering::Relaxed) && !device_down;

        // While live, wait for blocks; during shutdown only drain what is
        // already buffered so enqueued audio is never lost.
        let block = if keep_running {
            match ctx.consumer.pop_timeout(POP_TIMEOUT) {
                Some(b) => b,
                None => continue,
            }
        } else {
            match ctx.consumer.try_pop() {
                Some(b) => b,
                None => {
                    if device_down {
                        fatal = Some("audio stream reported a fatal error".into());
                    }
                    break;
                }
            }
        };

        let frames = block.frames();
        ctx.diagnostics.blocks_in.fetch_add(1, Ordering::Relaxed);
        ctx.diagnostics.frames_in.fetch_add(frames, Ordering::Relaxed);

        // Pre-gate levels feed both the detector and the UI.
        measure_into(&block, ctx.writer.frames_written(), &mut reading);
        emit_level(&mut ctx, &reading);

        match ctx.detector.observe(&reading, frames) {
            SplitDecision::SplitNow(reason) => {
                debug!(?reason, "split decision");
                if let Err(e) = rotate(&mut ctx, CloseReason::Split(reason)) {
                    fatal = Some(format!("segment rotation failed: {e}"));
                    break;
                }
            }
            SplitDecision::Continue => {}
        }

        if let Err(e) = ctx.writer.write(&block, reading.peak_dbfs()) {
            fatal = Some(format!("segment write failed: {e}"));
            break;
        }
        total_frames += frames;
        ctx.diagnostics
            .frames_written
            .fetch_add(frames, Ordering::Relaxed);
        ctx.consumer.recycle(block.samples);

        update_status(&mut ctx, &reading, total_frames);
    }

    // Close whatever is open; on a fatal path the file keeps every frame
    // that made it to the writer.
    let close_reason = if fatal.is_some() {
        CloseReason::Error
    } else {
        CloseReason::Stop
    };
    if let Err(e) = close_and_dispatch(&mut ctx, close_reason) {
        warn!("final segment close failed: {e}");
        if fatal.is_none() {
            fatal = Some(format!("final segment close failed: {e}"));
        }
    }

    if let Some(detail) = fatal {
        fail(&mut ctx, detail);
    } else {
        update_status(&mut ctx, &reading, total_frames);
    }

    let snap = ctx.diagnostics.snapshot();
    info!(
        blocks_in = snap.blocks_in,
        frames_in = snap.frames_in,
        frames_written = snap.frames_written,
        segments_closed = snap.segments_closed,
        format_fallbacks = snap.format_fallbacks,
        overrun_blocks = ctx.ring_counters.dropped_blocks(),
        overrun_frames = ctx.ring_counters.dropped_frames(),
        "writer pipeline stopped — diagnostics"
    );
}

/// Open the next segment, degrading to WAV when the configured codec has
/// no encoder registered at runtime.
fn open_segment(ctx: &mut PipelineContext) -> Result<(), WriteError> {
    match ctx.writer.open() {
        Ok(_) => Ok(()),
        Err(WriteError::UnsupportedFormat(format)) => {
            ctx.diagnostics
                .format_fallbacks
                .fetch_add(1, Ordering::Relaxed);
            warn!(?format, "no encoder for configured format, falling back to WAV");
            let _ = ctx.status_tx.send(RecorderStatusEvent {
                state: RecorderState::Running,
                detail: Some(format!(
                    "no encoder available for {format:?}; recording uncompressed WAV instead"
                )),
            });
            ctx.writer.set_format(AudioFormat::Wav);
            ctx.writer.open().map(|_| ())
        }
        Err(e) => Err(e),
    }
}

/// Close the open segment (if any), broadcast the close, and queue it for
/// the gain worker.
fn close_and_dispatch(ctx: &mut PipelineContext, reason: CloseReason) -> Result<(), WriteError> {
    let Some(closed) = ctx.writer.close(reason)? else {
        return Ok(());
    };

    ctx.diagnostics
        .segments_closed
        .fetch_add(1, Ordering::Relaxed);

    let seq = ctx.seq.fetch_add(1, Ordering::Relaxed);
    let duration_secs = if closed.sample_rate == 0 {
        0.0
    } else {
        closed.frames as f64 / closed.sample_rate as f64
    };
    let _ = ctx.segment_tx.send(SegmentEvent {
        seq,
        path: closed.path.clone(),
        stage: SegmentStage::Closed,
        close_reason: closed.close_reason,
        frames: closed.frames,
        duration_secs,
    });

    if let Some(gain_tx) = &ctx.gain_tx {
        if gain_tx.send(closed).is_err() {
            warn!("gain worker unavailable; segment left un-boosted");
        }
    }
    Ok(())
}

fn rotate(ctx: &mut PipelineContext, reason: CloseReason) -> Result<(), WriteError> {
    close_and_dispatch(ctx, reason)?;
    open_segment(ctx)
}

fn emit_level(ctx: &mut PipelineContext, reading: &LevelReading) {
    let seq = ctx.seq.fetch_add(1, Ordering::Relaxed);
    let _ = ctx.level_tx.send(LevelEvent {
        seq,
        frame_offset: reading.frame_offset,
        channels: reading.channels().to_vec(),
    });
}

fn update_status(ctx: &mut PipelineContext, reading: &LevelReading, total_frames: u64) {
    let mut status = ctx.status.lock();
    status.elapsed_secs = if ctx.sample_rate == 0 {
        0.0
    } else {
        total_frames as f64 / ctx.sample_rate as f64
    };
    status.levels.clear();
    status.levels.extend_from_slice(reading.channels());
    status.overrun_blocks = ctx.ring_counters.dropped_blocks();
    status.overrun_frames = ctx.ring_counters.dropped_frames();
    status.frames_written = ctx.diagnostics.frames_written.load(Ordering::Relaxed);
    status.segments_closed = ctx.diagnostics.segments_closed.load(Ordering::Relaxed);
    status.current_segment = ctx.writer.current_path().map(|p| p.to_path_buf());
}

/// Park the recorder in `Failed`: capture stops, the partial segment stays
/// on disk, and the UI gets the detail.
fn fail(ctx: &mut PipelineContext, detail: String) {
    error!(detail = detail.as_str(), "pipeline failed");
    ctx.running.store(false, Ordering::SeqCst);
    {
        let mut status = ctx.status.lock();
        status.state = RecorderState::Failed;
        status.current_segment = None;
    }
    let _ = ctx.status_tx.send(RecorderStatusEvent {
        state: RecorderState::Failed,
        detail: Some(detail),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;
    use std::thread;
    use std::time::Instant;

    use crate::buffering::{block::AudioBlock, create_block_ring, BlockProducer};
    use crate::engine::RecorderConfig;
    use crate::split::{SilenceMetric, SplitReason};
    use crate::writer::{SegmentWriter, WriterSettings};

    const SR: u32 = 8_000;
    const BLOCK_FRAMES: usize = 80; // 10 ms

    fn test_config(dir: &Path) -> RecorderConfig {
        RecorderConfig {
            out_dir: dir.to_path_buf(),
            template: "test_{timestamp}_{index}".into(),
            ..RecorderConfig::default()
        }
    }

    fn make_writer(config: &RecorderConfig, format: AudioFormat) -> SegmentWriter {
        SegmentWriter::new(
            WriterSettings {
                out_dir: config.out_dir.clone(),
                template: config.template.clone(),
                format,
                noise_gate_dbfs: config.noise_gate_dbfs,
            },
            crate::writer::encoder::StreamSpec {
                sample_rate: SR,
                channels: 1,
            },
            vec![],
        )
    }

    struct Harness {
        producer: BlockProducer,
        running: Arc<AtomicBool>,
        stream_failed: Arc<AtomicBool>,
        status: Arc<Mutex<StatusSnapshot>>,
        diagnostics: Arc<PipelineDiagnostics>,
        segment_rx: broadcast::Receiver<SegmentEvent>,
        level_rx: broadcast::Receiver<LevelEvent>,
        gain_rx: Option<crossbeam_channel::Receiver<ClosedSegment>>,
        handle: thread::JoinHandle<()>,
    }

    fn spawn_pipeline(
        config: RecorderConfig,
        format: AudioFormat,
        detector: SplitDetector,
        with_gain: bool,
    ) -> Harness {
        let writer = make_writer(&config, format);
        let (producer, consumer, ring_counters) = create_block_ring(1024);
        let running = Arc::new(AtomicBool::new(true));
        let stream_failed = Arc::new(AtomicBool::new(false));
        let status = Arc::new(Mutex::new(StatusSnapshot::idle()));
        let diagnostics = Arc::new(PipelineDiagnostics::default());
        let (level_tx, level_rx) = broadcast::channel(4096);
        let (status_tx, _) = broadcast::channel(64);
        let (segment_tx, segment_rx) = broadcast::channel(64);
        let (gain_tx, gain_rx) = if with_gain {
            let (tx, rx) = crossbeam_channel::unbounded();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let ctx = PipelineContext {
            writer,
            detector,
            consumer,
            running: Arc::clone(&running),
            stream_failed: Arc::clone(&stream_failed),
            level_tx,
            status_tx,
            segment_tx,
            gain_tx,
            status: Arc::clone(&status),
            seq: Arc::new(AtomicU64::new(0)),
            ring_counters,
            diagnostics: Arc::clone(&diagnostics),
            sample_rate: SR,
        };

        let handle = thread::spawn(move || run(ctx));
        Harness {
            producer,
            running,
            stream_failed,
            status,
            diagnostics,
            segment_rx,
            level_rx,
            gain_rx,
            handle,
        }
    }

    fn push_blocks(producer: &BlockProducer, amplitude: f32, count: usize) {
        for _ in 0..count {
            producer.push(AudioBlock::new(vec![amplitude; BLOCK_FRAMES], 1, SR));
        }
    }

    fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) {
        let start = Instant::now();
        while !cond() {
            if start.elapsed() > timeout {
                panic!("timed out waiting for pipeline condition");
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn no_split_detector() -> SplitDetector {
        SplitDetector::new(SR, None, None, Duration::from_secs(1), SilenceMetric::Peak)
    }

    #[test]
    fn writes_all_blocks_and_flushes_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = spawn_pipeline(
            test_config(dir.path()),
            AudioFormat::Wav,
            no_split_detector(),
            false,
        );

        push_blocks(&h.producer, 0.3, 20);
        let diag = Arc::clone(&h.diagnostics);
        wait_for(
            || diag.blocks_in.load(Ordering::Relaxed) >= 10,
            Duration::from_secs(2),
        );

        // Queue more, then stop immediately: the tail must still be flushed.
        push_blocks(&h.producer, 0.3, 20);
        h.running.store(false, Ordering::SeqCst);
        h.handle.join().unwrap();

        let event = h.segment_rx.try_recv().unwrap();
        assert_eq!(event.stage, SegmentStage::Closed);
        assert_eq!(event.close_reason, CloseReason::Stop);
        assert_eq!(event.frames, 40 * BLOCK_FRAMES as u64);

        let samples: Vec<i16> = hound::WavReader::open(&event.path)
            .unwrap()
            .samples::<i16>()
            .map(|s| s.unwrap())
            .collect();
        assert_eq!(samples.len(), 40 * BLOCK_FRAMES);
    }

    #[test]
    fn silence_timeout_rotates_and_routes_boundary_block_to_new_segment() {
        let dir = tempfile::tempdir().unwrap();
        // 100 ms of silence below -40 dBFS closes the segment.
        let detector = SplitDetector::new(
            SR,
            None,
            Some(-40.0),
            Duration::from_millis(100),
            SilenceMetric::Peak,
        );
        let mut h = spawn_pipeline(test_config(dir.path()), AudioFormat::Wav, detector, false);

        push_blocks(&h.producer, 0.5, 10); // 100 ms tone
        push_blocks(&h.producer, 0.0, 10); // 100 ms silence → split on 10th
        push_blocks(&h.producer, 0.5, 10); // tone lands in segment 2

        let diag = Arc::clone(&h.diagnostics);
        wait_for(
            || diag.segments_closed.load(Ordering::Relaxed) >= 1,
            Duration::from_secs(2),
        );
        h.running.store(false, Ordering::SeqCst);
        h.handle.join().unwrap();

        let first = h.segment_rx.try_recv().unwrap();
        assert_eq!(
            first.close_reason,
            CloseReason::Split(SplitReason::SilenceTimeout)
        );
        // 10 tone + 9 silence blocks; the boundary block opens segment 2.
        assert_eq!(first.frames, 19 * BLOCK_FRAMES as u64);

        let second = h.segment_rx.try_recv().unwrap();
        assert_eq!(second.close_reason, CloseReason::Stop);
        assert_eq!(second.frames, 11 * BLOCK_FRAMES as u64);
        assert_ne!(first.path, second.path);
    }

    #[test]
    fn time_split_rotates_at_interval_boundary() {
        let dir = tempfile::tempdir().unwrap();
        // Split every 200 ms = 20 blocks.
        let detector = SplitDetector::new(
            SR,
            Some(Duration::from_millis(200)),
            None,
            Duration::from_secs(1),
            SilenceMetric::Peak,
        );
        let mut h = spawn_pipeline(test_config(dir.path()), AudioFormat::Wav, detector, false);

        push_blocks(&h.producer, 0.4, 45);
        let diag = Arc::clone(&h.diagnostics);
        wait_for(
            || diag.segments_closed.load(Ordering::Relaxed) >= 2,
            Duration::from_secs(2),
        );
        h.running.store(false, Ordering::SeqCst);
        h.handle.join().unwrap();

        let first = h.segment_rx.try_recv().unwrap();
        let second = h.segment_rx.try_recv().unwrap();
        let third = h.segment_rx.try_recv().unwrap();
        assert_eq!(
            first.close_reason,
            CloseReason::Split(SplitReason::TimeElapsed)
        );
        assert_eq!(first.frames, 19 * BLOCK_FRAMES as u64);
        assert_eq!(second.frames, 20 * BLOCK_FRAMES as u64);
        assert_eq!(third.close_reason, CloseReason::Stop);

        let total: u64 = first.frames + second.frames + third.frames;
        assert_eq!(total, 45 * BLOCK_FRAMES as u64);
    }

    #[test]
    fn unsupported_format_falls_back_to_wav_and_keeps_recording() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = spawn_pipeline(
            test_config(dir.path()),
            AudioFormat::Flac, // no FLAC factory registered
            no_split_detector(),
            false,
        );

        push_blocks(&h.producer, 0.3, 5);
        let diag = Arc::clone(&h.diagnostics);
        wait_for(
            || diag.blocks_in.load(Ordering::Relaxed) >= 5,
            Duration::from_secs(2),
        );
        h.running.store(false, Ordering::SeqCst);
        h.handle.join().unwrap();

        assert_eq!(h.diagnostics.format_fallbacks.load(Ordering::Relaxed), 1);
        let event = h.segment_rx.try_recv().unwrap();
        assert_eq!(event.path.extension().unwrap(), "wav");
        assert!(hound::WavReader::open(&event.path).is_ok());
    }

    #[test]
    fn dead_stream_fails_pipeline_but_flushes_buffered_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = spawn_pipeline(
            test_config(dir.path()),
            AudioFormat::Wav,
            no_split_detector(),
            false,
        );

        push_blocks(&h.producer, 0.3, 8);
        // Device dies with blocks still queued.
        h.stream_failed.store(true, Ordering::Release);
        h.handle.join().unwrap();

        assert_eq!(h.status.lock().state, RecorderState::Failed);
        assert!(!h.running.load(Ordering::SeqCst));

        let event = h.segment_rx.try_recv().unwrap();
        assert_eq!(event.close_reason, CloseReason::Error);
        assert_eq!(event.frames, 8 * BLOCK_FRAMES as u64, "no buffered data lost");
    }

    #[test]
    fn closed_segments_are_queued_for_the_gain_worker() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = spawn_pipeline(
            test_config(dir.path()),
            AudioFormat::Wav,
            no_split_detector(),
            true,
        );

        push_blocks(&h.producer, 0.3, 4);
        let diag = Arc::clone(&h.diagnostics);
        wait_for(
            || diag.blocks_in.load(Ordering::Relaxed) >= 4,
            Duration::from_secs(2),
        );
        h.running.store(false, Ordering::SeqCst);
        h.handle.join().unwrap();

        let gain_rx = h.gain_rx.take().unwrap();
        let closed = gain_rx.try_recv().unwrap();
        assert_eq!(closed.frames, 4 * BLOCK_FRAMES as u64);
        assert_eq!(closed.close_reason, CloseReason::Stop);
    }

    #[test]
    fn level_events_carry_pre_gate_levels() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        // Gate everything: levels must still reflect the un-gated signal.
        config.noise_gate_dbfs = Some(0.0);
        let mut h = spawn_pipeline(config, AudioFormat::Wav, no_split_detector(), false);

        push_blocks(&h.producer, 0.5, 3);
        let diag = Arc::clone(&h.diagnostics);
        wait_for(
            || diag.blocks_in.load(Ordering::Relaxed) >= 3,
            Duration::from_secs(2),
        );
        h.running.store(false, Ordering::SeqCst);
        h.handle.join().unwrap();

        let level = h.level_rx.try_recv().unwrap();
        assert!(level.channels[0].peak_dbfs > -7.0, "pre-gate peak ~ -6 dBFS");

        // The written audio itself was gated to silence.
        let event = h.segment_rx.try_recv().unwrap();
        let samples: Vec<i16> = hound::WavReader::open(&event.path)
            .unwrap()
            .samples::<i16>()
            .map(|s| s.unwrap())
            .collect();
        assert!(samples.iter().all(|s| *s == 0));
    }
}
