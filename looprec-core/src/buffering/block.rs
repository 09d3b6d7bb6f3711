//! Typed audio block passed from the capture callback to the writer thread.

/// A contiguous block of interleaved PCM samples at a known sample rate.
///
/// Produced once per device callback invocation and never mutated after
/// creation. The backing `Vec` is leased from the ring's recycle pool so the
/// callback does not allocate in steady state.
#[derive(Debug, Clone)]
pub struct AudioBlock {
    /// Interleaved f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Interleaved channel count (1 = mono, 2 = stereo).
    pub channels: u16,
    /// Sample rate in Hz (e.g. 44100, 48000).
    pub sample_rate: u32,
}

impl AudioBlock {
    pub fn new(samples: Vec<f32>, channels: u16, sample_rate: u32) -> Self {
        Self {
            samples,
            channels,
            sample_rate,
        }
    }

    /// Number of frames (one sample per channel) in this block.
    pub fn frames(&self) -> u64 {
        if self.channels == 0 {
            return 0;
        }
        (self.samples.len() / self.channels as usize) as u64
    }

    /// Returns the duration of this block in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_counts_interleaved_samples_per_channel() {
        let block = AudioBlock::new(vec![0.0; 960], 2, 48_000);
        assert_eq!(block.frames(), 480);
        assert!((block.duration_secs() - 0.01).abs() < 1e-9);
    }

    #[test]
    fn zero_channels_yields_zero_frames() {
        let block = AudioBlock::new(vec![0.0; 16], 0, 48_000);
        assert_eq!(block.frames(), 0);
    }
}
