//! Bounded per-device position history

use chrono::{DateTime, Utc};
use std::collections::VecDeque;

use crate::core::PositionSample;

/// Fixed-capacity, timestamp-ordered sample buffer with FIFO eviction
#[derive(Debug, Clone)]
pub struct PositionHistory {
    samples: VecDeque<PositionSample>,
    capacity: usize,
}

impl PositionHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, evicting the oldest when full. Returns the evicted sample.
    ///
    /// Callers keep timestamps non-decreasing; the registry raises a sample's
    /// timestamp to the previous one before pushing.
    pub fn push(&mut self, sample: PositionSample) -> Option<PositionSample> {
        let evicted = if self.samples.len() >= self.capacity {
            self.samples.pop_front()
        } else {
            None
        };
        self.samples.push_back(sample);
        evicted
    }

    pub fn latest(&self) -> Option<&PositionSample> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &PositionSample> {
        self.samples.iter()
    }

    /// Samples with `start <= timestamp <= end`; open bounds are unbounded
    pub fn range(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Vec<PositionSample> {
        self.samples
            .iter()
            .filter(|s| start.map_or(true, |t| s.timestamp >= t))
            .filter(|s| end.map_or(true, |t| s.timestamp <= t))
            .cloned()
            .collect()
    }

    /// Speed between consecutive samples (m/s); zero where no time elapsed
    pub fn speeds(&self) -> Vec<f64> {
        self.samples
            .iter()
            .zip(self.samples.iter().skip(1))
            .map(|(a, b)| {
                let dt = (b.timestamp - a.timestamp).num_milliseconds() as f64 / 1000.0;
                if dt <= 0.0 {
                    0.0
                } else {
                    (b.point() - a.point()).norm() / dt
                }
            })
            .collect()
    }

    /// Path length across the retained samples (metres)
    pub fn distance_travelled(&self) -> f64 {
        self.samples
            .iter()
            .zip(self.samples.iter().skip(1))
            .map(|(a, b)| (b.point() - a.point()).norm())
            .sum()
    }
}
