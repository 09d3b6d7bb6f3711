//! Silence/time segmentation policy.
//!
//! ## Algorithm (per observed block)
//!
//! 1. Advance the segment timer by the block's frame count.
//! 2. If a split interval is configured and the timer has reached it →
//!    `SplitNow(TimeElapsed)`, all accumulators reset.
//! 3. Else, if a silence threshold is configured and the block's level is
//!    below it, advance the silence accumulator; at the configured silence
//!    duration → `SplitNow(SilenceTimeout)`, all accumulators reset.
//! 4. A block at or above the threshold zeroes the silence accumulator
//!    outright — no partial credit survives a loud block.
//!
//! Time-based splits win the tie when both conditions land on the same
//! block. All timing is derived from frame counts at the capture sample
//! rate, never from wall-clock reads, so decisions are deterministic.
//!
//! The detector observes *pre-gate* levels: true silence remains detectable
//! whether or not the noise gate is enabled.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::meter::LevelReading;

/// Why a segment was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitReason {
    /// The configured split interval elapsed.
    TimeElapsed,
    /// Levels stayed below the silence threshold for the configured duration.
    SilenceTimeout,
}

/// Outcome of observing one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitDecision {
    Continue,
    SplitNow(SplitReason),
}

/// Which level metric the silence comparison uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SilenceMetric {
    /// Instantaneous peak (default — matches the block gate).
    Peak,
    /// RMS, less sensitive to single-sample clicks.
    Rms,
}

/// Detector phase, exposed for status/introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorMode {
    /// Fresh segment, nothing accumulated yet.
    Armed,
    /// Segment timer running, signal currently above threshold.
    TimerRunning { elapsed_frames: u64 },
    /// Below threshold; counting toward a silence split.
    SilenceRunning { silent_frames: u64 },
}

/// Stateful split policy. One instance per pipeline run; reset on every
/// split so each segment starts Armed.
#[derive(Debug, Clone)]
pub struct SplitDetector {
    split_interval_frames: Option<u64>,
    silence_threshold_dbfs: Option<f32>,
    silence_duration_frames: u64,
    metric: SilenceMetric,
    frames_since_split: u64,
    silent_frames: u64,
}

impl SplitDetector {
    pub fn new(
        sample_rate: u32,
        split_interval: Option<Duration>,
        silence_threshold_dbfs: Option<f32>,
        silence_duration: Duration,
        metric: SilenceMetric,
    ) -> Self {
        let to_frames = |d: Duration| (d.as_secs_f64() * sample_rate as f64).round() as u64;
        Self {
            split_interval_frames: split_interval.map(to_frames).map(|f| f.max(1)),
            silence_threshold_dbfs,
            silence_duration_frames: to_frames(silence_duration).max(1),
            metric,
            frames_since_split: 0,
            silent_frames: 0,
        }
    }

    /// Observe one block's levels and decide whether the active segment
    /// must close. `frames` is the block's frame count.
    pub fn observe(&mut self, reading: &LevelReading, frames: u64) -> SplitDecision {
        self.frames_since_split = self.frames_since_split.saturating_add(frames);

        // Time split takes priority — deterministic tie-break.
        if let Some(interval) = self.split_interval_frames {
            if self.frames_since_split >= interval {
                self.rearm();
                return SplitDecision::SplitNow(SplitReason::TimeElapsed);
            }
        }

        if let Some(threshold) = self.silence_threshold_dbfs {
            let level = match self.metric {
                SilenceMetric::Peak => reading.peak_dbfs(),
                SilenceMetric::Rms => reading.rms_dbfs(),
            };
            if level < threshold {
                self.silent_frames = self.silent_frames.saturating_add(frames);
                if self.silent_frames >= self.silence_duration_frames {
                    self.rearm();
                    return SplitDecision::SplitNow(SplitReason::SilenceTimeout);
                }
            } else {
                self.silent_frames = 0;
            }
        }

        SplitDecision::Continue
    }

    /// Current phase, for diagnostics.
    pub fn mode(&self) -> DetectorMode {
        if self.silent_frames > 0 {
            DetectorMode::SilenceRunning {
                silent_frames: self.silent_frames,
            }
        } else if self.frames_since_split > 0 {
            DetectorMode::TimerRunning {
                elapsed_frames: self.frames_since_split,
            }
        } else {
            DetectorMode::Armed
        }
    }

    /// Zero all accumulators (Armed). Called internally on each split;
    /// available to callers that rotate a segment outside the split path.
    pub fn rearm(&mut self) {
        self.frames_since_split = 0;
        self.silent_frames = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::block::AudioBlock;
    use crate::meter::{measure_into, LevelReading};

    const SR: u32 = 48_000;
    const BLOCK: u64 = 480; // 10 ms

    fn reading_for(amplitude: f32) -> LevelReading {
        let block = AudioBlock::new(vec![amplitude; BLOCK as usize], 1, SR);
        let mut reading = LevelReading::default();
        measure_into(&block, 0, &mut reading);
        reading
    }

    fn silence_detector(duration_ms: u64) -> SplitDetector {
        SplitDetector::new(
            SR,
            None,
            Some(-40.0),
            Duration::from_millis(duration_ms),
            SilenceMetric::Peak,
        )
    }

    #[test]
    fn sustained_silence_fires_exactly_once_then_rearms() {
        // 2 s silence window = 200 blocks of 10 ms.
        let mut det = silence_detector(2_000);
        let silent = reading_for(0.0);

        let mut fired = 0;
        for _ in 0..200 {
            if det.observe(&silent, BLOCK) == SplitDecision::SplitNow(SplitReason::SilenceTimeout) {
                fired += 1;
            }
        }
        assert_eq!(fired, 1);
        assert_eq!(det.mode(), DetectorMode::Armed);

        // Still silent: the accumulator starts over and fires again only
        // after another full window.
        for i in 0..199 {
            assert_eq!(det.observe(&silent, BLOCK), SplitDecision::Continue, "block {i}");
        }
        assert_eq!(
            det.observe(&silent, BLOCK),
            SplitDecision::SplitNow(SplitReason::SilenceTimeout)
        );
    }

    #[test]
    fn loud_block_resets_silence_accumulator_with_no_partial_credit() {
        let mut det = silence_detector(1_000); // 100 blocks
        let silent = reading_for(0.0);
        let loud = reading_for(0.5);

        for _ in 0..99 {
            assert_eq!(det.observe(&silent, BLOCK), SplitDecision::Continue);
        }
        // One block shy of the timeout; a loud block must zero the count.
        assert_eq!(det.observe(&loud, BLOCK), SplitDecision::Continue);
        for _ in 0..99 {
            assert_eq!(det.observe(&silent, BLOCK), SplitDecision::Continue);
        }
        assert_eq!(
            det.observe(&silent, BLOCK),
            SplitDecision::SplitNow(SplitReason::SilenceTimeout)
        );
    }

    #[test]
    fn time_split_fires_within_one_block_of_interval() {
        let mut det = SplitDetector::new(
            SR,
            Some(Duration::from_secs(1)),
            None,
            Duration::from_secs(2),
            SilenceMetric::Peak,
        );
        let loud = reading_for(0.5);

        // 1 s = 100 blocks; decision must land on block 100 exactly.
        for i in 0..99 {
            assert_eq!(det.observe(&loud, BLOCK), SplitDecision::Continue, "block {i}");
        }
        assert_eq!(
            det.observe(&loud, BLOCK),
            SplitDecision::SplitNow(SplitReason::TimeElapsed)
        );
    }

    #[test]
    fn time_split_wins_the_tie_against_silence() {
        // Interval and silence window both equal one block.
        let mut det = SplitDetector::new(
            SR,
            Some(Duration::from_millis(10)),
            Some(-40.0),
            Duration::from_millis(10),
            SilenceMetric::Peak,
        );
        assert_eq!(
            det.observe(&reading_for(0.0), BLOCK),
            SplitDecision::SplitNow(SplitReason::TimeElapsed)
        );
    }

    #[test]
    fn silence_never_closes_early_under_continuous_tone() {
        let mut det = silence_detector(500);
        let loud = reading_for(0.5);
        for _ in 0..1_000 {
            assert_eq!(det.observe(&loud, BLOCK), SplitDecision::Continue);
        }
    }

    #[test]
    fn disabled_thresholds_never_split() {
        let mut det = SplitDetector::new(
            SR,
            None,
            None,
            Duration::from_secs(1),
            SilenceMetric::Peak,
        );
        let silent = reading_for(0.0);
        for _ in 0..10_000 {
            assert_eq!(det.observe(&silent, BLOCK), SplitDecision::Continue);
        }
    }

    #[test]
    fn rms_metric_uses_rms_level() {
        // Peak above threshold but RMS below it: one hot sample in an
        // otherwise quiet block (peak ~ -6 dBFS, RMS ~ -33 dBFS).
        let mut samples = vec![0.0f32; BLOCK as usize];
        samples[0] = 0.5;
        let block = AudioBlock::new(samples, 1, SR);
        let mut reading = LevelReading::default();
        measure_into(&block, 0, &mut reading);

        let mut peak_det = SplitDetector::new(
            SR,
            None,
            Some(-30.0),
            Duration::from_millis(10),
            SilenceMetric::Peak,
        );
        let mut rms_det = SplitDetector::new(
            SR,
            None,
            Some(-30.0),
            Duration::from_millis(10),
            SilenceMetric::Rms,
        );

        assert_eq!(peak_det.observe(&reading, BLOCK), SplitDecision::Continue);
        assert_eq!(
            rms_det.observe(&reading, BLOCK),
            SplitDecision::SplitNow(SplitReason::SilenceTimeout)
        );
    }
}
