//! Network quality classification.
//!
//! The transport reports raw uplink/downlink quality samples on a small
//! ordinal scale (0 = best .. 5 = worst). [`QualityClassifier`] damps those
//! through a short rolling window and produces a discrete [`QualityLevel`]
//! the fallback machinery gates mode eligibility on.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

/// Worst raw quality value on the transport's ordinal scale.
pub const RAW_QUALITY_WORST: u8 = 5;

/// Default rolling window length for jitter damping.
pub const DEFAULT_QUALITY_WINDOW: usize = 5;

/// A raw quality report from the transport.
#[derive(Debug, Clone, Copy)]
pub struct QualitySample {
    /// Uplink quality, 0 = best .. 5 = worst.
    pub uplink: u8,
    /// Downlink quality, 0 = best .. 5 = worst.
    pub downlink: u8,
    pub timestamp: DateTime<Utc>,
}

impl QualitySample {
    #[must_use]
    pub fn new(uplink: u8, downlink: u8) -> Self {
        Self {
            uplink,
            downlink,
            timestamp: Utc::now(),
        }
    }

    /// The worse of the two directions; the session is only as good as its
    /// weaker leg.
    #[must_use]
    pub fn worst(&self) -> u8 {
        self.uplink.max(self.downlink).min(RAW_QUALITY_WORST)
    }
}

/// Discrete network quality level, ordered best to worst.
///
/// The derived ordering means `a < b` reads as "a is better than b".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    Excellent,
    Good,
    Fair,
    Poor,
    Bad,
    Unusable,
}

impl QualityLevel {
    /// Map a raw ordinal value to a level. Values past the scale clamp to
    /// `Unusable`.
    #[must_use]
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => QualityLevel::Excellent,
            1 => QualityLevel::Good,
            2 => QualityLevel::Fair,
            3 => QualityLevel::Poor,
            4 => QualityLevel::Bad,
            _ => QualityLevel::Unusable,
        }
    }

    #[must_use]
    pub fn as_raw(self) -> u8 {
        match self {
            QualityLevel::Excellent => 0,
            QualityLevel::Good => 1,
            QualityLevel::Fair => 2,
            QualityLevel::Poor => 3,
            QualityLevel::Bad => 4,
            QualityLevel::Unusable => 5,
        }
    }

    /// Whether this level meets a required minimum (at-or-above rule).
    #[must_use]
    pub fn meets(self, minimum: QualityLevel) -> bool {
        self <= minimum
    }
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QualityLevel::Excellent => "excellent",
            QualityLevel::Good => "good",
            QualityLevel::Fair => "fair",
            QualityLevel::Poor => "poor",
            QualityLevel::Bad => "bad",
            QualityLevel::Unusable => "unusable",
        };
        write!(f, "{s}")
    }
}

/// Converts raw quality samples into damped discrete levels.
///
/// Pure aside from the window buffer: the classified level is the rounded
/// mean of the last `window` samples' worst leg.
#[derive(Debug)]
pub struct QualityClassifier {
    window: VecDeque<u8>,
    capacity: usize,
}

impl QualityClassifier {
    /// Create a classifier with the given window length (minimum 1).
    #[must_use]
    pub fn new(window: usize) -> Self {
        let capacity = window.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Feed a sample and return the damped level.
    pub fn classify(&mut self, sample: QualitySample) -> QualityLevel {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(sample.worst());

        let len = self.window.len() as u32;
        let sum: u32 = self.window.iter().map(|&v| u32::from(v)).sum();
        // Rounded mean; len is never zero after the push above.
        let mean = (sum + len / 2) / len;
        QualityLevel::from_raw(mean.min(u32::from(RAW_QUALITY_WORST)) as u8)
    }

    /// Drop all buffered samples (e.g. after rejoining the transport).
    pub fn reset(&mut self) {
        self.window.clear();
    }
}

impl Default for QualityClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_QUALITY_WINDOW)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering_best_to_worst() {
        assert!(QualityLevel::Excellent < QualityLevel::Good);
        assert!(QualityLevel::Good < QualityLevel::Fair);
        assert!(QualityLevel::Poor < QualityLevel::Unusable);
    }

    #[test]
    fn test_from_raw_round_trip_and_clamp() {
        for raw in 0..=5u8 {
            assert_eq!(QualityLevel::from_raw(raw).as_raw(), raw);
        }
        assert_eq!(QualityLevel::from_raw(17), QualityLevel::Unusable);
    }

    #[test]
    fn test_meets_is_at_or_above() {
        // Exactly at the minimum is eligible
        assert!(QualityLevel::Fair.meets(QualityLevel::Fair));
        // Better than the minimum is eligible
        assert!(QualityLevel::Good.meets(QualityLevel::Fair));
        // One unit below the minimum is not
        assert!(!QualityLevel::Poor.meets(QualityLevel::Fair));
    }

    #[test]
    fn test_sample_worst_leg_wins() {
        assert_eq!(QualitySample::new(0, 4).worst(), 4);
        assert_eq!(QualitySample::new(3, 1).worst(), 3);
        // Out-of-scale raw values clamp
        assert_eq!(QualitySample::new(9, 0).worst(), RAW_QUALITY_WORST);
    }

    #[test]
    fn test_classifier_single_sample() {
        let mut classifier = QualityClassifier::new(5);
        assert_eq!(
            classifier.classify(QualitySample::new(3, 3)),
            QualityLevel::Poor
        );
    }

    #[test]
    fn test_classifier_damps_single_spike() {
        let mut classifier = QualityClassifier::new(5);
        for _ in 0..4 {
            classifier.classify(QualitySample::new(1, 1));
        }
        // One bad sample among four good ones must not swing the level
        // to the spike's value.
        let level = classifier.classify(QualitySample::new(5, 5));
        assert_eq!(level, QualityLevel::Fair);
    }

    #[test]
    fn test_classifier_follows_sustained_degradation() {
        let mut classifier = QualityClassifier::new(3);
        classifier.classify(QualitySample::new(1, 1));
        let mut level = QualityLevel::Excellent;
        for _ in 0..3 {
            level = classifier.classify(QualitySample::new(5, 5));
        }
        assert_eq!(level, QualityLevel::Unusable);
    }

    #[test]
    fn test_classifier_reset_clears_window() {
        let mut classifier = QualityClassifier::new(5);
        for _ in 0..5 {
            classifier.classify(QualitySample::new(5, 5));
        }
        classifier.reset();
        assert_eq!(
            classifier.classify(QualitySample::new(0, 0)),
            QualityLevel::Excellent
        );
    }

    #[test]
    fn test_zero_window_is_clamped_to_one() {
        let mut classifier = QualityClassifier::new(0);
        assert_eq!(
            classifier.classify(QualitySample::new(2, 2)),
            QualityLevel::Fair
        );
    }
}
