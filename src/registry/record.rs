use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::core::{DeviceId, DeviceType, PositionSample, ZoneId};
use crate::processing::{FilterPhase, PositionHistory, TrackFilter};
use crate::utils::config::FilterParams;

/// All mutable state owned for one device id
///
/// The filter and the history are created and dropped together with the record.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    device_id: DeviceId,
    device_type: DeviceType,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    history: PositionHistory,
    filter: TrackFilter,
    current_zone: ZoneId,
    total_detections: u64,
    zones_visited: BTreeSet<ZoneId>,
}

impl DeviceRecord {
    pub(crate) fn new(
        device_id: DeviceId,
        now: DateTime<Utc>,
        history_capacity: usize,
        filter_params: FilterParams,
    ) -> Self {
        Self {
            device_id,
            device_type: DeviceType::Unknown,
            first_seen: now,
            last_seen: now,
            history: PositionHistory::with_capacity(history_capacity),
            filter: TrackFilter::new(filter_params),
            current_zone: ZoneId::unknown(),
            total_detections: 0,
            zones_visited: BTreeSet::new(),
        }
    }

    pub(crate) fn touch(&mut self, now: DateTime<Utc>, detections: usize) {
        self.last_seen = self.last_seen.max(now);
        self.total_detections += detections as u64;
    }

    /// Classify from an advertised name unless a type is already known
    pub(crate) fn classify(&mut self, device_name: Option<&str>) -> bool {
        if !self.device_type.is_unknown() {
            return false;
        }
        match device_name.map(DeviceType::from_name) {
            Some(device_type) if !device_type.is_unknown() => {
                self.device_type = device_type;
                true
            }
            _ => false,
        }
    }

    /// Smooth a raw point observed at `timestamp`
    pub(crate) fn observe(
        &mut self,
        raw: nalgebra::Point2<f64>,
        timestamp: DateTime<Utc>,
    ) -> nalgebra::Point2<f64> {
        self.filter.observe(raw, timestamp)
    }

    /// Append a sample and move the device into its zone in one step
    pub(crate) fn record_sample(&mut self, sample: PositionSample) {
        if !sample.zone_id.is_unknown() {
            self.zones_visited.insert(sample.zone_id.clone());
        }
        self.current_zone = sample.zone_id.clone();
        self.history.push(sample);
    }

    /// Earliest timestamp the next sample may carry
    pub(crate) fn next_sample_floor(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.history.latest() {
            Some(latest) => now.max(latest.timestamp),
            None => now,
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn first_seen(&self) -> DateTime<Utc> {
        self.first_seen
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    pub fn history(&self) -> &PositionHistory {
        &self.history
    }

    pub fn filter(&self) -> &TrackFilter {
        &self.filter
    }

    pub fn current_zone(&self) -> &ZoneId {
        &self.current_zone
    }

    pub fn total_detections(&self) -> u64 {
        self.total_detections
    }

    pub fn zones_visited(&self) -> &BTreeSet<ZoneId> {
        &self.zones_visited
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        let velocity = match self.filter.phase() {
            FilterPhase::Tracking => {
                let v = self.filter.velocity();
                Some([v.x, v.y])
            }
            FilterPhase::Uninitialized => None,
        };

        DeviceSnapshot {
            device_id: self.device_id.clone(),
            device_type: self.device_type,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            current_zone: self.current_zone.clone(),
            last_position: self.history.latest().cloned(),
            velocity,
            total_detections: self.total_detections,
            zones_visited: self.zones_visited.iter().cloned().collect(),
            samples: self.history.len(),
            distance_travelled: self.history.distance_travelled(),
        }
    }
}

/// Read-only copy of a device record, safe to hand outward
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub device_id: DeviceId,
    pub device_type: DeviceType,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub current_zone: ZoneId,
    pub last_position: Option<PositionSample>,
    /// Filter velocity estimate (m/s)
    pub velocity: Option<[f64; 2]>,
    pub total_detections: u64,
    pub zones_visited: Vec<ZoneId>,
    /// Samples currently retained
    pub samples: usize,
    /// Path length over the retained samples (metres)
    pub distance_travelled: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_new_record_starts_unknown() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
        let record = DeviceRecord::new(DeviceId::from_hex("ab".into()), now, 100, FilterParams::default());

        let snapshot = record.snapshot();
        assert!(snapshot.current_zone.is_unknown());
        assert!(snapshot.last_position.is_none());
        assert!(snapshot.velocity.is_none());
        assert_eq!(snapshot.device_type, DeviceType::Unknown);
        assert_eq!(record.filter().phase(), FilterPhase::Uninitialized);
    }

    #[test]
    fn test_type_is_set_once_from_a_recognised_name() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
        let mut record = DeviceRecord::new(DeviceId::from_hex("ab".into()), now, 100, FilterParams::default());

        assert!(!record.classify(None));
        assert!(!record.classify(Some("Unknown Device")));
        assert_eq!(record.device_type(), DeviceType::Unknown);

        assert!(record.classify(Some("Mi Band 8")));
        assert!(!record.classify(Some("iPhone 15")));
        assert_eq!(record.device_type(), DeviceType::Wearable);
        assert_eq!(record.snapshot().device_type, DeviceType::Wearable);
    }

    #[test]
    fn test_unknown_zone_not_counted_as_visited() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap();
        let mut record = DeviceRecord::new(DeviceId::from_hex("ab".into()), now, 100, FilterParams::default());

        for zone in [ZoneId::new("lobby"), ZoneId::unknown(), ZoneId::new("lobby"), ZoneId::new("cafe")] {
            record.record_sample(PositionSample {
                x: 1.0,
                y: 1.0,
                timestamp: now,
                zone_id: zone,
            });
        }

        assert_eq!(record.zones_visited().len(), 2);
        assert_eq!(record.current_zone(), &ZoneId::new("cafe"));
        assert_eq!(record.history().len(), 4);
    }
}
