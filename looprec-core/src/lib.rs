//! # looprec-core
//!
//! Loopback audio recorder engine: capture, segmentation, and persistence.
//!
//! ## Architecture
//!
//! ```text
//! Loopback device → AudioCapture → block ring (drop-oldest) → Pipeline(spawn_blocking)
//!                                                                  │
//!                                                     meter → SplitDetector
//!                                                                  │
//!                                                  SegmentWriter (gate, rotate)
//!                                                                  │
//!                                            gain worker ← ClosedSegment queue
//! ```
//!
//! The audio callback is alloc-free in steady state (buffer pool). All file
//! I/O happens on the writer thread; the gain pass runs on its own worker so
//! rewrites never stall capture.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod engine;
pub mod error;
pub mod gain;
pub mod ipc;
pub mod meter;
pub mod split;
pub mod tag;
pub mod writer;

// Convenience re-exports for downstream crates
pub use engine::{RecorderConfig, RecorderEngine};
pub use error::{GainError, RecorderError, WriteError};
pub use ipc::events::{
    LevelEvent, RecorderState, RecorderStatusEvent, SegmentEvent, SegmentStage, StatusSnapshot,
};
pub use meter::ChannelLevel;
pub use split::{SilenceMetric, SplitReason};
pub use tag::TrackTags;
pub use writer::{AudioFormat, CloseReason};
