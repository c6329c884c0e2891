//! Walk-forward split generation.
//!
//! Produces ordered (train, test) windows over a time index. Lengths are
//! measured in periods (records), so the generator works for any bar size.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::data::Timestamp;
use crate::error::{EngineError, EngineResult};

/// How the train window moves between splits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowMode {
    /// Fixed-length train window that slides with the step.
    #[default]
    Rolling,
    /// Train window anchored at the span start, growing with each step.
    Anchored,
}

/// Configuration for split generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitConfig {
    /// Training window length in periods.
    pub train_len: usize,
    /// Test window length in periods.
    pub test_len: usize,
    /// Advance by this many periods between splits.
    pub step: usize,
    /// Periods dropped between train end and test start.
    #[serde(default)]
    pub purge_gap: usize,
    #[serde(default)]
    pub mode: WindowMode,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            train_len: 252,
            test_len: 21,
            step: 21,
            purge_gap: 1,
            mode: WindowMode::Rolling,
        }
    }
}

impl SplitConfig {
    /// Check the lengths themselves, independent of any span.
    pub fn validate(&self) -> EngineResult<()> {
        if self.train_len == 0 {
            return Err(EngineError::config("train_len must be positive"));
        }
        if self.test_len == 0 {
            return Err(EngineError::config("test_len must be positive"));
        }
        if self.step == 0 {
            return Err(EngineError::config("step must be positive"));
        }
        Ok(())
    }

    /// Periods consumed by the first split.
    pub fn required_periods(&self) -> usize {
        self.train_len + self.purge_gap + self.test_len
    }
}

/// A contiguous, inclusive timestamp range and the index range it covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub start: Timestamp,
    pub end: Timestamp,
    pub range: Range<usize>,
}

impl Window {
    fn over(timestamps: &[Timestamp], range: Range<usize>) -> Self {
        Self {
            start: timestamps[range.start],
            end: timestamps[range.end - 1],
            range,
        }
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// One train/test pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Split {
    /// Split number (1-indexed).
    pub split_num: usize,
    pub train: Window,
    pub test: Window,
}

/// Generator for walk-forward splits.
///
/// Validates eagerly on construction; iteration is lazy and can be restarted
/// with [`WalkForwardSplits::iter`].
#[derive(Debug, Clone)]
pub struct WalkForwardSplits {
    config: SplitConfig,
    timestamps: Vec<Timestamp>,
}

impl WalkForwardSplits {
    pub fn new(config: SplitConfig, timestamps: &[Timestamp]) -> EngineResult<Self> {
        config.validate()?;

        if config.required_periods() > timestamps.len() {
            return Err(EngineError::config(format!(
                "train ({}) + purge gap ({}) + test ({}) exceeds span of {} periods",
                config.train_len,
                config.purge_gap,
                config.test_len,
                timestamps.len()
            )));
        }

        Ok(Self {
            config,
            timestamps: timestamps.to_vec(),
        })
    }

    pub fn config(&self) -> &SplitConfig {
        &self.config
    }

    /// Fresh iterator from the first split.
    pub fn iter(&self) -> SplitIter<'_> {
        SplitIter {
            generator: self,
            offset: 0,
            split_num: 1,
        }
    }

    /// Number of splits the iterator yields.
    pub fn expected_splits(&self) -> usize {
        let available = self.timestamps.len() - self.config.required_periods();
        available / self.config.step + 1
    }

    fn split_at(&self, offset: usize, split_num: usize) -> Option<Split> {
        let train_start = match self.config.mode {
            WindowMode::Rolling => offset,
            WindowMode::Anchored => 0,
        };
        let train_end = offset + self.config.train_len;
        let test_start = train_end + self.config.purge_gap;
        let test_end = test_start + self.config.test_len;

        if test_end > self.timestamps.len() {
            return None;
        }

        Some(Split {
            split_num,
            train: Window::over(&self.timestamps, train_start..train_end),
            test: Window::over(&self.timestamps, test_start..test_end),
        })
    }
}

impl<'a> IntoIterator for &'a WalkForwardSplits {
    type Item = Split;
    type IntoIter = SplitIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Lazy iterator over splits.
pub struct SplitIter<'a> {
    generator: &'a WalkForwardSplits,
    offset: usize,
    split_num: usize,
}

impl Iterator for SplitIter<'_> {
    type Item = Split;

    fn next(&mut self) -> Option<Split> {
        let split = self.generator.split_at(self.offset, self.split_num)?;
        self.offset += self.generator.config.step;
        self.split_num += 1;
        Some(split)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn index(n: usize) -> Vec<Timestamp> {
        let base = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        (0..n).map(|i| base + Duration::days(i as i64)).collect()
    }

    fn config(train_len: usize, test_len: usize, step: usize, purge_gap: usize) -> SplitConfig {
        SplitConfig {
            train_len,
            test_len,
            step,
            purge_gap,
            mode: WindowMode::Rolling,
        }
    }

    #[test]
    fn test_hundred_period_scenario() {
        let ts = index(100);
        let splits = WalkForwardSplits::new(config(60, 10, 10, 0), &ts).unwrap();
        let all: Vec<_> = splits.iter().collect();

        assert_eq!(all.len(), 4);
        assert_eq!(splits.expected_splits(), 4);
        let last = all.last().unwrap();
        assert_eq!(last.test.range.end, 100);
        assert_eq!(last.test.end, ts[99]);
        assert_eq!(all[0].train.range, 0..60);
        assert_eq!(all[0].test.range, 60..70);
    }

    #[test]
    fn test_no_overlap_and_ordering() {
        let ts = index(250);
        for gap in [0, 1, 5] {
            let splits = WalkForwardSplits::new(config(50, 20, 15, gap), &ts).unwrap();
            let mut prev_test_start = None;
            for split in &splits {
                assert!(split.train.end < split.test.start);
                assert!(split.train.range.end - 1 + gap < split.test.range.start);
                assert_eq!(split.test.range.start - split.train.range.end, gap);
                if let Some(prev) = prev_test_start {
                    assert!(split.test.start > prev);
                }
                prev_test_start = Some(split.test.start);
            }
        }
    }

    #[test]
    fn test_restartable() {
        let ts = index(120);
        let splits = WalkForwardSplits::new(config(60, 10, 10, 2), &ts).unwrap();
        let first: Vec<_> = splits.iter().map(|s| s.test.range).collect();
        let second: Vec<_> = splits.iter().map(|s| s.test.range).collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), splits.expected_splits());
    }

    #[test]
    fn test_anchored_mode() {
        let ts = index(100);
        let cfg = SplitConfig {
            mode: WindowMode::Anchored,
            ..config(60, 10, 10, 0)
        };
        let splits = WalkForwardSplits::new(cfg, &ts).unwrap();
        let all: Vec<_> = splits.iter().collect();
        assert_eq!(all.len(), 4);
        assert!(all.iter().all(|s| s.train.range.start == 0));
        assert_eq!(all[3].train.range, 0..90);
    }

    #[test]
    fn test_span_too_short() {
        let ts = index(69);
        let result = WalkForwardSplits::new(config(60, 10, 10, 0), &ts);
        assert!(matches!(result, Err(EngineError::Configuration(_))));

        let result = WalkForwardSplits::new(config(60, 9, 10, 1), &ts);
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }

    #[test]
    fn test_zero_lengths_rejected() {
        let ts = index(100);
        assert!(WalkForwardSplits::new(config(0, 10, 10, 0), &ts).is_err());
        assert!(WalkForwardSplits::new(config(60, 0, 10, 0), &ts).is_err());
        assert!(WalkForwardSplits::new(config(60, 10, 0, 0), &ts).is_err());
    }

    #[test]
    fn test_exact_fit_single_split() {
        let ts = index(70);
        let splits = WalkForwardSplits::new(config(60, 10, 10, 0), &ts).unwrap();
        assert_eq!(splits.iter().count(), 1);
    }
}
