//! Rolling framerate over the most recent multi-frames

use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use serde::{Deserialize, Serialize};

/// Frame durations averaged over when reporting.
pub const DEFAULT_FRAMERATE_WINDOW: usize = 30;

/// Published upstream every few multi-frames.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FramerateSample {
    pub multi_frame_number: u64,
    pub mean_framerate: f64,
    pub mean_frame_duration_ms: f64,
    /// Durations the mean was taken over.
    pub samples: usize,
}

pub struct FramerateTracker {
    durations: HeapRb<u64>,
    last_ns: Option<u64>,
}

impl FramerateTracker {
    pub fn new(window: usize) -> Self {
        Self {
            durations: HeapRb::new(window.max(1)),
            last_ns: None,
        }
    }

    /// Record a frame at `timestamp_ns`; returns the duration since the previous one.
    pub fn record(&mut self, timestamp_ns: u64) -> Option<u64> {
        let duration = self.last_ns.map(|last| timestamp_ns.saturating_sub(last));
        self.last_ns = Some(timestamp_ns);
        if let Some(duration) = duration {
            self.durations.push_overwrite(duration);
        }
        duration
    }

    pub fn len(&self) -> usize {
        self.durations.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.durations.is_empty()
    }

    pub fn mean_frame_duration_ns(&self) -> Option<f64> {
        if self.durations.is_empty() {
            return None;
        }
        let sum: u64 = self.durations.iter().sum();
        Some(sum as f64 / self.len() as f64)
    }

    pub fn mean_framerate(&self) -> Option<f64> {
        self.mean_frame_duration_ns()
            .filter(|&ns| ns > 0.0)
            .map(|ns| 1e9 / ns)
    }

    pub fn sample(&self, multi_frame_number: u64) -> Option<FramerateSample> {
        let duration_ns = self.mean_frame_duration_ns()?;
        Some(FramerateSample {
            multi_frame_number,
            mean_framerate: self.mean_framerate().unwrap_or(0.0),
            mean_frame_duration_ms: duration_ns / 1e6,
            samples: self.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_over_window() {
        let mut tracker = FramerateTracker::new(3);
        assert_eq!(tracker.record(0), None);
        assert!(tracker.sample(0).is_none());

        // 10ms, then three 20ms frames; the 10ms one falls out of the window
        for (i, ts) in [10_000_000u64, 30_000_000, 50_000_000, 70_000_000].into_iter().enumerate() {
            tracker.record(ts);
            assert_eq!(tracker.len(), (i + 1).min(3));
        }
        let sample = tracker.sample(4).unwrap();
        assert_eq!(sample.samples, 3);
        assert!((sample.mean_frame_duration_ms - 20.0).abs() < 1e-9);
        assert!((sample.mean_framerate - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_durations_have_no_framerate() {
        let mut tracker = FramerateTracker::new(4);
        tracker.record(5);
        tracker.record(5);
        assert_eq!(tracker.mean_frame_duration_ns(), Some(0.0));
        assert_eq!(tracker.mean_framerate(), None);
    }
}
