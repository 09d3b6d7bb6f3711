use thiserror::Error;

use crate::writer::AudioFormat;

/// All errors produced by looprec-core.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("recorder is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Gain(#[from] GainError),

    #[error("tag error: {0}")]
    Tag(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the segment writer path.
///
/// `Io` is fatal to the pipeline (disk full, permission); the partial
/// segment on disk is preserved as-is. `UnsupportedFormat` is recoverable:
/// the coordinator falls back to WAV and keeps recording.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("segment IO error: {0}")]
    Io(String),

    #[error("no encoder available for {0:?}")]
    UnsupportedFormat(AudioFormat),
}

impl From<hound::Error> for WriteError {
    fn from(e: hound::Error) -> Self {
        WriteError::Io(e.to_string())
    }
}

impl From<std::io::Error> for WriteError {
    fn from(e: std::io::Error) -> Self {
        WriteError::Io(e.to_string())
    }
}

/// Errors from the post-close gain pass. Always isolated to one segment;
/// the un-boosted file is left intact.
#[derive(Debug, Error)]
pub enum GainError {
    #[error("gain IO error: {0}")]
    Io(String),

    #[error("gain pass cannot re-encode {0:?}")]
    UnsupportedFormat(AudioFormat),

    #[error("could not decode segment: {0}")]
    Decode(String),
}

impl From<hound::Error> for GainError {
    fn from(e: hound::Error) -> Self {
        GainError::Decode(e.to_string())
    }
}

impl From<std::io::Error> for GainError {
    fn from(e: std::io::Error) -> Self {
        GainError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RecorderError>;
