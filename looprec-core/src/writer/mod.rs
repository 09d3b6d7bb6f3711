//! Segment writer: owns the current output file, applies the noise gate,
//! and rotates files on split signals.
//!
//! Exactly one segment is open at a time. Rotation is frame-aligned: the
//! pipeline closes the active segment, opens the next, and only then writes
//! the boundary block, so blocks queued during a close land in the new
//! segment and none are dropped.

pub mod encoder;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::buffering::block::AudioBlock;
use crate::error::WriteError;
use crate::split::SplitReason;
use encoder::{EncoderFactory, SegmentEncoder, StreamSpec, WavEncoderFactory};

/// Output container/codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    /// Uncompressed 16-bit PCM WAV — always available.
    Wav,
    /// FLAC, requires an externally registered encoder.
    Flac,
    /// MP3, requires an externally registered encoder.
    Mp3,
}

impl AudioFormat {
    pub fn extension(self) -> &'static str {
        match self {
            AudioFormat::Wav => "wav",
            AudioFormat::Flac => "flac",
            AudioFormat::Mp3 => "mp3",
        }
    }
}

/// Lifecycle state of one output file. Transitions are forward-only:
/// Open → Finalizing → Closed → GainApplied, with Failed terminal from any
/// earlier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentState {
    Open,
    Finalizing,
    Closed,
    GainApplied,
    Failed,
}

/// Why the segment writer closed a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloseReason {
    /// A split decision (time or silence).
    Split(SplitReason),
    /// Explicit stop.
    Stop,
    /// Pipeline error; the file keeps whatever frames were flushed.
    Error,
}

/// One output file's lifecycle record. Mutated only by the segment writer
/// (frame counts, state) until close, then by the gain pass
/// (Closed → GainApplied).
#[derive(Debug, Clone)]
pub struct Segment {
    pub path: PathBuf,
    pub format: AudioFormat,
    pub start_time: DateTime<Local>,
    pub sample_rate: u32,
    pub channels: u16,
    pub frames_written: u64,
    pub state: SegmentState,
}

/// Handoff record for a finalized segment, consumed by the gain worker.
#[derive(Debug, Clone)]
pub struct ClosedSegment {
    pub path: PathBuf,
    pub format: AudioFormat,
    pub sample_rate: u32,
    pub channels: u16,
    pub frames: u64,
    pub close_reason: CloseReason,
}

/// Writer-facing slice of the recorder configuration.
#[derive(Debug, Clone)]
pub struct WriterSettings {
    pub out_dir: PathBuf,
    /// Filename template. `{timestamp}` is replaced with the run stamp,
    /// `{index}` with the zero-padded segment number. A template without
    /// `{index}` gets the index appended so rotated files never collide.
    pub template: String,
    pub format: AudioFormat,
    /// Blocks whose pre-gate peak is below this are zeroed wholesale.
    pub noise_gate_dbfs: Option<f32>,
}

pub struct SegmentWriter {
    settings: WriterSettings,
    spec: StreamSpec,
    factories: HashMap<AudioFormat, Arc<dyn EncoderFactory>>,
    /// Stamp shared by every segment of this run; segments differ by index.
    run_stamp: String,
    next_index: u32,
    current: Option<(Segment, Box<dyn SegmentEncoder>)>,
    /// Reused zero buffer for gated blocks.
    gate_scratch: Vec<f32>,
}

impl SegmentWriter {
    /// Build a writer with the built-in WAV factory plus any external
    /// encoder factories.
    pub fn new(
        settings: WriterSettings,
        spec: StreamSpec,
        external_factories: Vec<Arc<dyn EncoderFactory>>,
    ) -> Self {
        let mut factories: HashMap<AudioFormat, Arc<dyn EncoderFactory>> = HashMap::new();
        factories.insert(AudioFormat::Wav, Arc::new(WavEncoderFactory));
        for factory in external_factories {
            factories.insert(factory.format(), factory);
        }

        Self {
            settings,
            spec,
            factories,
            run_stamp: Local::now().format("%Y%m%d_%H%M%S").to_string(),
            next_index: 1,
            current: None,
            gate_scratch: Vec::new(),
        }
    }

    /// Active output format (may differ from the configured one after a
    /// fallback).
    pub fn format(&self) -> AudioFormat {
        self.settings.format
    }

    /// Swap the active format. Used by the coordinator to degrade to WAV
    /// when the configured codec has no encoder at runtime.
    pub fn set_format(&mut self, format: AudioFormat) {
        self.settings.format = format;
    }

    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|(seg, _)| seg.path.as_path())
    }

    pub fn frames_written(&self) -> u64 {
        self.current.as_ref().map_or(0, |(seg, _)| seg.frames_written)
    }

    /// Open the next segment file. Fails with `UnsupportedFormat` when the
    /// active format has no registered encoder — the file is not created in
    /// that case.
    ///
    /// # Panics
    /// Never opens over an existing open segment; callers must close first.
    pub fn open(&mut self) -> Result<&Segment, WriteError> {
        assert!(self.current.is_none(), "segment already open");

        let format = self.settings.format;
        let factory = self
            .factories
            .get(&format)
            .ok_or(WriteError::UnsupportedFormat(format))?;

        let path = segment_path(
            &self.settings.out_dir,
            &self.settings.template,
            &self.run_stamp,
            self.next_index,
            format,
        );
        let encoder = factory.open(&path, self.spec)?;

        let segment = Segment {
            path: path.clone(),
            format,
            start_time: Local::now(),
            sample_rate: self.spec.sample_rate,
            channels: self.spec.channels,
            frames_written: 0,
            state: SegmentState::Open,
        };
        info!(path = %path.display(), index = self.next_index, "segment opened");

        self.next_index += 1;
        let (segment, _) = self.current.insert((segment, encoder));
        Ok(segment)
    }

    /// Append one block, gating it first when its pre-gate peak is below
    /// the noise-gate threshold.
    pub fn write(&mut self, block: &AudioBlock, pre_gate_peak_dbfs: f32) -> Result<(), WriteError> {
        let (segment, encoder) = self
            .current
            .as_mut()
            .ok_or_else(|| WriteError::Io("write with no open segment".into()))?;

        let gated = self
            .settings
            .noise_gate_dbfs
            .is_some_and(|gate| pre_gate_peak_dbfs < gate);

        if gated {
            // Keep the timeline: gated blocks are written as digital silence.
            self.gate_scratch.clear();
            self.gate_scratch.resize(block.samples.len(), 0.0);
            encoder.write_samples(&self.gate_scratch)?;
        } else {
            encoder.write_samples(&block.samples)?;
        }

        segment.frames_written += block.frames();
        debug!(
            frames = segment.frames_written,
            gated, "block written to segment"
        );
        Ok(())
    }

    /// Finalize the open segment. Returns `None` when nothing is open
    /// (stop with no data ever written).
    pub fn close(&mut self, reason: CloseReason) -> Result<Option<ClosedSegment>, WriteError> {
        let Some((mut segment, encoder)) = self.current.take() else {
            return Ok(None);
        };

        segment.state = SegmentState::Finalizing;
        if let Err(e) = encoder.finish() {
            segment.state = SegmentState::Failed;
            return Err(e);
        }
        segment.state = SegmentState::Closed;

        info!(
            path = %segment.path.display(),
            frames = segment.frames_written,
            ?reason,
            "segment closed"
        );

        Ok(Some(ClosedSegment {
            path: segment.path,
            format: segment.format,
            sample_rate: segment.sample_rate,
            channels: segment.channels,
            frames: segment.frames_written,
            close_reason: reason,
        }))
    }
}

/// Resolve a segment path from the naming template.
fn segment_path(
    out_dir: &Path,
    template: &str,
    stamp: &str,
    index: u32,
    format: AudioFormat,
) -> PathBuf {
    let mut name = template.replace("{timestamp}", stamp);
    let index_str = format!("{index:03}");
    if name.contains("{index}") {
        name = name.replace("{index}", &index_str);
    } else {
        name.push('_');
        name.push_str(&index_str);
    }
    out_dir.join(format!("{name}.{}", format.extension()))
}
