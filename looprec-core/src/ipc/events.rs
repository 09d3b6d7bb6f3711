//! Events broadcast to the UI collaborator, plus the pull-based status
//! snapshot.
//!
//! ## Channels
//!
//! | Event | Purpose |
//! |-------|---------|
//! | `LevelEvent` | live per-channel RMS/peak for meters |
//! | `RecorderStatusEvent` | lifecycle transitions and warnings |
//! | `SegmentEvent` | a segment closed / gain finished |
//!
//! Level events are emitted per processed block; a UI should coalesce them
//! to its own frame rate rather than rendering each one.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::meter::ChannelLevel;
use crate::writer::CloseReason;

// ---------------------------------------------------------------------------
// Recorder state
// ---------------------------------------------------------------------------

/// Coordinator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecorderState {
    /// No capture active; `start()` may be called.
    Stopped,
    /// Device opening, workers spinning up.
    Starting,
    /// Actively capturing and writing.
    Running,
    /// Stop requested; writer draining and closing.
    Stopping,
    /// Unrecoverable error — capture ended, open segment preserved.
    Failed,
}

/// Emitted when the recorder state changes or a recoverable condition is
/// worth surfacing (format fallback, gain failure).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderStatusEvent {
    pub state: RecorderState,
    /// Optional human-readable detail (e.g. error message or warning).
    pub detail: Option<String>,
}

// ---------------------------------------------------------------------------
// Level events
// ---------------------------------------------------------------------------

/// Emitted for each processed block with pre-gate levels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Frames since segment start at the beginning of the measured block.
    pub frame_offset: u64,
    pub channels: Vec<ChannelLevel>,
}

// ---------------------------------------------------------------------------
// Segment events
// ---------------------------------------------------------------------------

/// Stage a segment event reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentStage {
    /// Container finalized; file is valid on disk.
    Closed,
    /// Gain pass rewrote the file in place.
    GainApplied,
    /// Gain pass failed; the un-boosted file is intact.
    GainFailed,
}

/// Emitted when a segment closes and again when its gain pass finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub path: PathBuf,
    pub stage: SegmentStage,
    pub close_reason: CloseReason,
    pub frames: u64,
    pub duration_secs: f64,
}

// ---------------------------------------------------------------------------
// Status snapshot
// ---------------------------------------------------------------------------

/// Pull-based status, safe to poll at UI rate (≤ 30 Hz) regardless of the
/// audio block rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub state: RecorderState,
    /// Recorded time derived from frame counts, not wall clock.
    pub elapsed_secs: f64,
    /// Most recent pre-gate levels, one entry per channel.
    pub levels: Vec<ChannelLevel>,
    /// Blocks lost to ring overruns since start.
    pub overrun_blocks: u64,
    /// Frames lost to ring overruns since start.
    pub overrun_frames: u64,
    /// Frames written across all segments of this run.
    pub frames_written: u64,
    /// Segments closed so far in this run.
    pub segments_closed: u64,
    /// Path of the currently open segment file, if any.
    pub current_segment: Option<PathBuf>,
}

impl StatusSnapshot {
    pub fn idle() -> Self {
        Self {
            state: RecorderState::Stopped,
            elapsed_secs: 0.0,
            levels: Vec::new(),
            overrun_blocks: 0,
            overrun_frames: 0,
            frames_written: 0,
            segments_closed: 0,
            current_segment: None,
        }
    }
}
