//! Level metering: per-channel RMS and peak in dBFS.
//!
//! Pure computation over one block; the only state lives in the
//! caller-provided [`LevelReading`], which doubles as scratch space so the
//! hot path never allocates.

use serde::{Deserialize, Serialize};

use crate::buffering::block::AudioBlock;

/// Floor substituted when a computed level would be -inf (all-zero input).
pub const DBFS_FLOOR: f32 = -96.0;

/// Most channels a reading can carry. Interleaved input with more channels
/// is metered on the first `MAX_METER_CHANNELS` only.
pub const MAX_METER_CHANNELS: usize = 8;

/// RMS + peak level of one channel, in dBFS.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelLevel {
    pub rms_dbfs: f32,
    pub peak_dbfs: f32,
}

impl ChannelLevel {
    pub const SILENT: ChannelLevel = ChannelLevel {
        rms_dbfs: DBFS_FLOOR,
        peak_dbfs: DBFS_FLOOR,
    };
}

/// Per-channel levels of one block, timestamped by frame offset since the
/// start of the current segment. Ephemeral — consumed by the split detector
/// and the status reporter, never persisted.
#[derive(Debug, Clone, Copy)]
pub struct LevelReading {
    channels: [ChannelLevel; MAX_METER_CHANNELS],
    channel_count: usize,
    /// Frames since segment start at the *beginning* of the measured block.
    pub frame_offset: u64,
}

impl Default for LevelReading {
    fn default() -> Self {
        Self {
            channels: [ChannelLevel::SILENT; MAX_METER_CHANNELS],
            channel_count: 0,
            frame_offset: 0,
        }
    }
}

impl LevelReading {
    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub fn channels(&self) -> &[ChannelLevel] {
        &self.channels[..self.channel_count]
    }

    /// Loudest instantaneous peak across channels.
    pub fn peak_dbfs(&self) -> f32 {
        self.channels()
            .iter()
            .map(|c| c.peak_dbfs)
            .fold(DBFS_FLOOR, f32::max)
    }

    /// Loudest RMS across channels.
    pub fn rms_dbfs(&self) -> f32 {
        self.channels()
            .iter()
            .map(|c| c.rms_dbfs)
            .fold(DBFS_FLOOR, f32::max)
    }
}

/// Convert a linear amplitude in [0, 1] to dBFS with the floor applied.
pub fn amplitude_to_dbfs(amplitude: f32) -> f32 {
    if amplitude <= 0.0 {
        return DBFS_FLOOR;
    }
    (20.0 * amplitude.log10()).max(DBFS_FLOOR)
}

/// Measure an interleaved block into `reading`.
///
/// `frame_offset` is the frame count written to the current segment before
/// this block. Reuses `reading` as scratch — no allocation.
pub fn measure_into(block: &AudioBlock, frame_offset: u64, reading: &mut LevelReading) {
    let ch = (block.channels as usize).min(MAX_METER_CHANNELS).max(1);
    reading.channel_count = if block.channels == 0 { 0 } else { ch };
    reading.frame_offset = frame_offset;
    reading.channels = [ChannelLevel::SILENT; MAX_METER_CHANNELS];

    if block.is_empty() || block.channels == 0 {
        return;
    }

    let stride = block.channels as usize;
    let frames = block.samples.len() / stride;
    if frames == 0 {
        return;
    }

    let mut sum_sq = [0f64; MAX_METER_CHANNELS];
    let mut peak = [0f32; MAX_METER_CHANNELS];

    for frame in block.samples.chunks_exact(stride) {
        for (c, sample) in frame.iter().take(ch).enumerate() {
            let s = *sample;
            sum_sq[c] += (s as f64) * (s as f64);
            let abs = s.abs();
            if abs > peak[c] {
                peak[c] = abs;
            }
        }
    }

    for c in 0..ch {
        let rms = (sum_sq[c] / frames as f64).sqrt() as f32;
        reading.channels[c] = ChannelLevel {
            rms_dbfs: amplitude_to_dbfs(rms),
            peak_dbfs: amplitude_to_dbfs(peak[c]),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn mono_block(samples: Vec<f32>) -> AudioBlock {
        AudioBlock::new(samples, 1, 48_000)
    }

    #[test]
    fn all_zero_block_reads_at_floor() {
        let mut reading = LevelReading::default();
        measure_into(&mono_block(vec![0.0; 480]), 0, &mut reading);
        assert_eq!(reading.channel_count(), 1);
        assert_eq!(reading.channels()[0].rms_dbfs, DBFS_FLOOR);
        assert_eq!(reading.channels()[0].peak_dbfs, DBFS_FLOOR);
    }

    #[test]
    fn full_scale_square_wave_reads_zero_dbfs() {
        let samples: Vec<f32> = (0..480)
            .map(|i| if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        let mut reading = LevelReading::default();
        measure_into(&mono_block(samples), 0, &mut reading);
        assert_relative_eq!(reading.channels()[0].rms_dbfs, 0.0, epsilon = 1e-4);
        assert_relative_eq!(reading.channels()[0].peak_dbfs, 0.0, epsilon = 1e-4);
    }

    #[test]
    fn half_scale_peak_is_about_minus_six_dbfs() {
        let mut reading = LevelReading::default();
        measure_into(&mono_block(vec![0.5; 480]), 0, &mut reading);
        assert_relative_eq!(reading.channels()[0].peak_dbfs, -6.0206, epsilon = 1e-3);
        assert_relative_eq!(reading.channels()[0].rms_dbfs, -6.0206, epsilon = 1e-3);
    }

    #[test]
    fn stereo_channels_are_metered_independently() {
        // L = silence, R = full scale.
        let mut samples = Vec::with_capacity(960);
        for _ in 0..480 {
            samples.push(0.0);
            samples.push(1.0);
        }
        let block = AudioBlock::new(samples, 2, 48_000);
        let mut reading = LevelReading::default();
        measure_into(&block, 123, &mut reading);

        assert_eq!(reading.channel_count(), 2);
        assert_eq!(reading.frame_offset, 123);
        assert_eq!(reading.channels()[0].peak_dbfs, DBFS_FLOOR);
        assert_relative_eq!(reading.channels()[1].peak_dbfs, 0.0, epsilon = 1e-4);
        assert_relative_eq!(reading.peak_dbfs(), 0.0, epsilon = 1e-4);
    }

    #[test]
    fn reading_is_overwritten_not_accumulated() {
        let mut reading = LevelReading::default();
        measure_into(&mono_block(vec![1.0; 100]), 0, &mut reading);
        measure_into(&mono_block(vec![0.0; 100]), 100, &mut reading);
        assert_eq!(reading.channels()[0].peak_dbfs, DBFS_FLOOR);
        assert_eq!(reading.frame_offset, 100);
    }
}
