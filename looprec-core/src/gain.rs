//! Post-close gain pass.
//!
//! Runs entirely off the real-time path: the writer pipeline hands
//! [`ClosedSegment`]s over a channel and a dedicated worker rewrites each
//! file with the configured boost. Samples are scaled by `10^(dB/20)` and
//! hard-clipped to the 16-bit range — documented lossy behavior, no
//! soft-knee. The rewrite goes to a sibling temp file followed by an atomic
//! rename, so a failed pass always leaves the original un-boosted file
//! intact.
//!
//! Ordering across segments is best-effort; a slow pass never stalls
//! capture or other segments.

use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crossbeam_channel::Receiver;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::engine::pipeline::PipelineDiagnostics;
use crate::error::GainError;
use crate::ipc::events::{SegmentEvent, SegmentStage};
use crate::writer::{AudioFormat, ClosedSegment};

/// Convert a dB value to a linear factor.
pub fn db_to_factor(gain_db: f32) -> f32 {
    10f32.powf(gain_db / 20.0)
}

/// Apply `gain_db` to a finalized segment, rewriting it in place.
///
/// A gain of 0 dB is a no-op and leaves the file byte-for-byte unchanged.
/// Only WAV segments can be re-encoded; other formats return
/// `GainError::UnsupportedFormat` without touching the file.
pub fn apply(segment: &ClosedSegment, gain_db: f32) -> Result<(), GainError> {
    if gain_db == 0.0 {
        return Ok(());
    }
    if segment.format != AudioFormat::Wav {
        return Err(GainError::UnsupportedFormat(segment.format));
    }

    let tmp_path = sibling_tmp_path(&segment.path);
    let result = rewrite_scaled(&segment.path, &tmp_path, db_to_factor(gain_db));

    match result {
        Ok(()) => {
            std::fs::rename(&tmp_path, &segment.path)?;
            Ok(())
        }
        Err(e) => {
            // Original stays intact; drop the partial temp file.
            let _ = std::fs::remove_file(&tmp_path);
            Err(e)
        }
    }
}

fn sibling_tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "segment".into());
    name.push_str(".gain-tmp");
    path.with_file_name(name)
}

fn rewrite_scaled(src: &Path, dst: &Path, factor: f32) -> Result<(), GainError> {
    let mut reader = hound::WavReader::open(src)?;
    let spec = reader.spec();

    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(GainError::Decode(format!(
            "unsupported WAV subformat: {:?} {} bit",
            spec.sample_format, spec.bits_per_sample
        )));
    }

    let mut writer = hound::WavWriter::create(dst, spec)?;
    for sample in reader.samples::<i16>() {
        let s = sample?;
        let scaled = (s as f32 * factor)
            .round()
            .clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        writer.write_sample(scaled).map_err(GainError::from)?;
    }
    writer.finalize()?;
    Ok(())
}

/// All context the gain worker needs.
pub struct GainContext {
    pub rx: Receiver<ClosedSegment>,
    pub gain_db: f32,
    pub segment_tx: broadcast::Sender<SegmentEvent>,
    pub seq: Arc<AtomicU64>,
    pub diagnostics: Arc<PipelineDiagnostics>,
}

/// Run the gain worker until the sending side hangs up. Queued segments are
/// drained even after stop — an in-flight pass is allowed to complete or
/// fail on its own.
pub fn run(ctx: GainContext) {
    for closed in ctx.rx.iter() {
        let stage = match apply(&closed, ctx.gain_db) {
            Ok(()) => {
                ctx.diagnostics.gain_applied.fetch_add(1, Ordering::Relaxed);
                info!(
                    path = %closed.path.display(),
                    gain_db = ctx.gain_db,
                    "gain applied"
                );
                SegmentStage::GainApplied
            }
            Err(e) => {
                ctx.diagnostics.gain_failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    path = %closed.path.display(),
                    error = %e,
                    "gain pass failed — original file preserved"
                );
                SegmentStage::GainFailed
            }
        };

        let seq = ctx.seq.fetch_add(1, Ordering::Relaxed);
        let duration_secs = if closed.sample_rate == 0 {
            0.0
        } else {
            closed.frames as f64 / closed.sample_rate as f64
        };
        let _ = ctx.segment_tx.send(SegmentEvent {
            seq,
            path: closed.path.clone(),
            stage,
            close_reason: closed.close_reason,
            frames: closed.frames,
            duration_secs,
        });
    }
}
