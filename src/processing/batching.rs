//! Window grouping of the raw detection feed
//!
//! The feed is unordered and at-least-once. Detections for one address are
//! collected for `window` after the first one arrives; a receiver heard more
//! than once keeps its most recent reading (the stronger one on a timestamp
//! tie). A detection timestamped past the window closes the batch and opens
//! the next cycle.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::core::{RawDetection, SignalReading};
use crate::privacy::normalize_address;

/// All readings for one address within one window
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionBatch {
    /// Normalized raw address; dropped once the batch is registered
    pub raw_address: String,
    /// First non-empty advertised name in the window; dropped with the address
    pub device_name: Option<String>,
    pub readings: Vec<SignalReading>,
}

#[derive(Debug)]
struct OpenBatch {
    opened_at: DateTime<Utc>,
    device_name: Option<String>,
    readings: HashMap<String, SignalReading>,
}

impl OpenBatch {
    fn new(opened_at: DateTime<Utc>) -> Self {
        Self {
            opened_at,
            device_name: None,
            readings: HashMap::new(),
        }
    }

    fn name(&mut self, name: Option<String>) {
        if self.device_name.is_none() {
            self.device_name = name.filter(|n| !n.trim().is_empty());
        }
    }

    fn insert(&mut self, reading: SignalReading) {
        match self.readings.get(&reading.receiver_id) {
            Some(existing) if !supersedes(&reading, existing) => {}
            _ => {
                self.readings.insert(reading.receiver_id.clone(), reading);
            }
        }
    }

    fn close(self, raw_address: String) -> DetectionBatch {
        let mut readings: Vec<SignalReading> = self.readings.into_values().collect();
        readings.sort_by(|a, b| a.receiver_id.cmp(&b.receiver_id));
        DetectionBatch {
            raw_address,
            device_name: self.device_name,
            readings,
        }
    }
}

fn supersedes(candidate: &SignalReading, existing: &SignalReading) -> bool {
    if candidate.timestamp != existing.timestamp {
        return candidate.timestamp > existing.timestamp;
    }
    let strength = |r: &SignalReading| r.signal_strength.unwrap_or(f64::NEG_INFINITY);
    strength(candidate) > strength(existing)
}

#[derive(Debug)]
pub struct DetectionBatcher {
    window: Duration,
    open: HashMap<String, OpenBatch>,
    closed: Vec<DetectionBatch>,
}

impl DetectionBatcher {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            open: HashMap::new(),
            closed: Vec::new(),
        }
    }

    pub fn push(&mut self, detection: RawDetection) {
        let address = normalize_address(&detection.raw_address);
        if address.is_empty() {
            return;
        }
        let reading = detection.reading();
        let device_name = detection.device_name;

        let expired = self
            .open
            .get(&address)
            .is_some_and(|batch| reading.timestamp >= batch.opened_at + self.window);
        if expired {
            if let Some(batch) = self.open.remove(&address) {
                self.closed.push(batch.close(address.clone()));
            }
        }

        let batch = self
            .open
            .entry(address)
            .or_insert_with(|| OpenBatch::new(reading.timestamp));
        batch.name(device_name);
        batch.insert(reading);
    }

    /// Close every batch whose window has elapsed at `now` and return all closed batches
    pub fn flush(&mut self, now: DateTime<Utc>) -> Vec<DetectionBatch> {
        let due: Vec<String> = self
            .open
            .iter()
            .filter(|(_, batch)| now >= batch.opened_at + self.window)
            .map(|(address, _)| address.clone())
            .collect();

        for address in due {
            if let Some(batch) = self.open.remove(&address) {
                self.closed.push(batch.close(address));
            }
        }
        std::mem::take(&mut self.closed)
    }

    /// Close everything regardless of window
    pub fn drain(&mut self) -> Vec<DetectionBatch> {
        let open: Vec<(String, OpenBatch)> = self.open.drain().collect();
        for (address, batch) in open {
            self.closed.push(batch.close(address));
        }
        std::mem::take(&mut self.closed)
    }

    /// Addresses with an open window
    pub fn pending(&self) -> usize {
        self.open.len()
    }
}
