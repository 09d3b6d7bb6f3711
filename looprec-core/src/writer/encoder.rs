//! Encoder seam between the segment writer and concrete containers.
//!
//! The `SegmentEncoder`/`EncoderFactory` traits are the extensibility
//! point: WAV (16-bit PCM via `hound`) ships built in, while compressed
//! formats are supplied by an external collaborator. When no factory is
//! registered for the configured format the writer reports
//! `WriteError::UnsupportedFormat` and the coordinator degrades to WAV.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use crate::error::WriteError;
use crate::writer::AudioFormat;

/// Stream parameters fixed for the lifetime of one recording run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSpec {
    pub sample_rate: u32,
    pub channels: u16,
}

/// An open encoder bound to one segment file.
///
/// Implementations own the file handle; `finish` consumes the encoder and
/// must leave a fully valid container on disk (trailers, length fields).
pub trait SegmentEncoder: Send {
    /// Append interleaved f32 frames in [-1.0, 1.0].
    fn write_samples(&mut self, interleaved: &[f32]) -> Result<(), WriteError>;

    /// Finalize the container. The file is unreadable as its format until
    /// this has run.
    fn finish(self: Box<Self>) -> Result<(), WriteError>;
}

/// Creates encoders for one [`AudioFormat`].
pub trait EncoderFactory: Send + Sync {
    fn format(&self) -> AudioFormat;

    fn open(&self, path: &Path, spec: StreamSpec) -> Result<Box<dyn SegmentEncoder>, WriteError>;
}

/// Built-in 16-bit PCM WAV encoder factory.
pub struct WavEncoderFactory;

impl EncoderFactory for WavEncoderFactory {
    fn format(&self) -> AudioFormat {
        AudioFormat::Wav
    }

    fn open(&self, path: &Path, spec: StreamSpec) -> Result<Box<dyn SegmentEncoder>, WriteError> {
        let wav_spec = hound::WavSpec {
            channels: spec.channels,
            sample_rate: spec.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(path, wav_spec)?;
        Ok(Box::new(WavEncoder { writer }))
    }
}

struct WavEncoder {
    writer: hound::WavWriter<BufWriter<File>>,
}

impl SegmentEncoder for WavEncoder {
    fn write_samples(&mut self, interleaved: &[f32]) -> Result<(), WriteError> {
        for sample in interleaved {
            self.writer.write_sample(f32_to_i16(*sample))?;
        }
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), WriteError> {
        self.writer.finalize()?;
        Ok(())
    }
}

/// Convert a float sample to 16-bit PCM with hard clamping.
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}
