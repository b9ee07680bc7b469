//! Per-device state: identity, filter, bounded history and zone membership
//!
//! The registry is the single point of mutation. Every operation takes
//! `&mut self` or `&self`, so whoever owns it (the engine worker) serializes
//! access and no caller can observe a half-applied update.

pub mod record;

pub use record::{DeviceRecord, DeviceSnapshot};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::algorithms::{DistanceEstimator, PositionSolver, ZoneIndex};
use crate::core::{DeviceId, DeviceType, PositionSample, Range, SignalReading, ZoneId};
use crate::privacy::IdentityAnonymizer;
use crate::utils::config::{EngineConfig, FilterParams};
use crate::validation::error::{ConfigError, RegistryError, SensorError};

/// Aggregate view over the registry at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryStatistics {
    /// Records created since startup, including expired ones
    pub total_registered: u64,
    pub tracked_devices: usize,
    pub active_devices: usize,
    /// Records first seen on the current calendar day
    pub new_today: usize,
    pub zone_occupancy: BTreeMap<ZoneId, usize>,
    /// Active devices per device type
    pub device_types: BTreeMap<DeviceType, usize>,
    pub average_zones_visited: f64,
}

/// Anonymized dump of every tracked device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnonymizedExport {
    pub exported_at: DateTime<Utc>,
    pub salt_day: NaiveDate,
    pub devices: Vec<DeviceSnapshot>,
}

pub struct DeviceRegistry {
    records: HashMap<DeviceId, DeviceRecord>,
    anonymizer: IdentityAnonymizer,
    estimator: DistanceEstimator,
    solver: PositionSolver,
    zones: Arc<ZoneIndex>,
    filter_params: FilterParams,
    history_capacity: usize,
    total_registered: u64,
}

impl DeviceRegistry {
    pub fn new(config: &EngineConfig, zones: Arc<ZoneIndex>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            records: HashMap::new(),
            anonymizer: IdentityAnonymizer::new(&config.identity)?,
            estimator: DistanceEstimator::new(config.signal.clone()),
            solver: PositionSolver::new(Arc::clone(&zones), config.solver.clone()),
            zones,
            filter_params: config.filter.clone(),
            history_capacity: config.registry.history_capacity,
            total_registered: 0,
        })
    }

    /// Resolve the address for `now`'s day and create or refresh its record
    ///
    /// Returns the device id and whether a record was created. Neither the raw
    /// address nor the advertised name is retained; the name only sets the
    /// device type while it is still unknown.
    pub fn register_or_update(
        &mut self,
        raw_address: &str,
        device_name: Option<&str>,
        readings: &[SignalReading],
        now: DateTime<Utc>,
    ) -> (DeviceId, bool) {
        let device_id = self.anonymizer.resolve(raw_address, now);

        if let Some(record) = self.records.get_mut(&device_id) {
            record.touch(now, readings.len());
            if record.classify(device_name) {
                debug!(device = %device_id, device_type = %record.device_type(), "device type identified");
            }
            return (device_id, false);
        }

        let mut record = DeviceRecord::new(
            device_id.clone(),
            now,
            self.history_capacity,
            self.filter_params.clone(),
        );
        record.touch(now, readings.len());
        record.classify(device_name);
        let device_type = record.device_type();
        self.records.insert(device_id.clone(), record);
        self.total_registered += 1;

        info!(device = %device_id, device_type = %device_type, "registered new device");
        (device_id, true)
    }

    /// Run one positioning cycle for a registered device
    ///
    /// `Ok(None)` means no reading was usable; the record is left untouched.
    pub fn compute_position(
        &mut self,
        device_id: &DeviceId,
        readings: &[SignalReading],
        now: DateTime<Utc>,
    ) -> Result<Option<PositionSample>, RegistryError> {
        if !self.records.contains_key(device_id) {
            return Err(RegistryError::UnknownDevice(device_id.clone()));
        }

        let ranges = self.ranges(device_id, readings);
        if ranges.is_empty() {
            debug!(device = %device_id, readings = readings.len(), "no usable readings this cycle");
            return Ok(None);
        }

        let solution = match self.solver.solve(device_id, &ranges, now) {
            Ok(solution) => solution,
            Err(err) => {
                warn!(device = %device_id, error = %err, "position computation skipped");
                return Ok(None);
            }
        };

        let envelope = self.zones.envelope();
        let record = self
            .records
            .get_mut(device_id)
            .ok_or_else(|| RegistryError::UnknownDevice(device_id.clone()))?;

        let timestamp = record.next_sample_floor(now);
        let smoothed = envelope.clamp(&record.observe(solution.point, timestamp));
        let zone_id = self.zones.classify(&smoothed);

        let sample = PositionSample {
            x: smoothed.x,
            y: smoothed.y,
            timestamp,
            zone_id,
        };
        record.record_sample(sample.clone());

        debug!(
            device = %device_id,
            x = sample.x,
            y = sample.y,
            zone = %sample.zone_id,
            method = ?solution.method,
            "position updated"
        );
        Ok(Some(sample))
    }

    fn ranges(&self, device_id: &DeviceId, readings: &[SignalReading]) -> Vec<Range> {
        readings
            .iter()
            .filter_map(|reading| {
                let checked = if self.zones.receiver(&reading.receiver_id).is_none() {
                    Err(SensorError::UnknownReceiver(reading.receiver_id.clone()))
                } else {
                    self.estimator.validate(reading)
                };
                match checked {
                    Ok(distance) => Some(Range::new(reading.receiver_id.clone(), distance)),
                    Err(err) => {
                        debug!(device = %device_id, error = %err, "dropping reading");
                        None
                    }
                }
            })
            .collect()
    }

    /// Remove every record unseen for longer than `timeout`
    pub fn expire_stale(&mut self, now: DateTime<Utc>, timeout: Duration) -> Vec<DeviceId> {
        let stale: Vec<DeviceId> = self
            .records
            .values()
            .filter(|r| now - r.last_seen() > timeout)
            .map(|r| r.device_id().clone())
            .collect();

        for id in &stale {
            self.records.remove(id);
        }

        if !stale.is_empty() {
            info!(expired = stale.len(), remaining = self.records.len(), "expired stale devices");
        }
        stale
    }

    /// Snapshots of records seen within `window` of `now`, ordered by id
    pub fn active_devices(&self, now: DateTime<Utc>, window: Duration) -> Vec<DeviceSnapshot> {
        let mut active: Vec<DeviceSnapshot> = self
            .records
            .values()
            .filter(|r| is_active(r, now, window))
            .map(DeviceRecord::snapshot)
            .collect();
        active.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        active
    }

    /// Device count per current zone; configured zones are always present
    pub fn zone_occupancy(&self) -> BTreeMap<ZoneId, usize> {
        let mut occupancy: BTreeMap<ZoneId, usize> =
            self.zones.zones().iter().map(|z| (z.id.clone(), 0)).collect();
        for record in self.records.values() {
            *occupancy.entry(record.current_zone().clone()).or_insert(0) += 1;
        }
        occupancy
    }

    pub fn devices_in_zone(&self, zone_id: &ZoneId, now: DateTime<Utc>, window: Duration) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self
            .records
            .values()
            .filter(|r| r.current_zone() == zone_id && is_active(r, now, window))
            .map(|r| r.device_id().clone())
            .collect();
        ids.sort();
        ids
    }

    /// History samples with `start <= timestamp <= end`
    pub fn trajectory(
        &self,
        device_id: &DeviceId,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<PositionSample>, RegistryError> {
        self.records
            .get(device_id)
            .map(|r| r.history().range(start, end))
            .ok_or_else(|| RegistryError::UnknownDevice(device_id.clone()))
    }

    pub fn device(&self, device_id: &DeviceId) -> Option<DeviceSnapshot> {
        self.records.get(device_id).map(DeviceRecord::snapshot)
    }

    pub fn record(&self, device_id: &DeviceId) -> Option<&DeviceRecord> {
        self.records.get(device_id)
    }

    pub fn statistics(&self, now: DateTime<Utc>, window: Duration) -> RegistryStatistics {
        let today = self.anonymizer.local_day(now);
        let tracked = self.records.len();

        let average_zones_visited = if tracked == 0 {
            0.0
        } else {
            self.records.values().map(|r| r.zones_visited().len()).sum::<usize>() as f64 / tracked as f64
        };

        let mut device_types: BTreeMap<DeviceType, usize> = BTreeMap::new();
        let mut active_devices = 0;
        for record in self.records.values().filter(|r| is_active(r, now, window)) {
            active_devices += 1;
            *device_types.entry(record.device_type()).or_insert(0) += 1;
        }

        RegistryStatistics {
            total_registered: self.total_registered,
            tracked_devices: tracked,
            active_devices,
            new_today: self
                .records
                .values()
                .filter(|r| self.anonymizer.local_day(r.first_seen()) == today)
                .count(),
            zone_occupancy: self.zone_occupancy(),
            device_types,
            average_zones_visited,
        }
    }

    pub fn export(&self, now: DateTime<Utc>) -> AnonymizedExport {
        let mut devices: Vec<DeviceSnapshot> = self.records.values().map(DeviceRecord::snapshot).collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        AnonymizedExport {
            exported_at: now,
            salt_day: self.anonymizer.local_day(now),
            devices,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn zones(&self) -> &Arc<ZoneIndex> {
        &self.zones
    }
}

fn is_active(record: &DeviceRecord, now: DateTime<Utc>, window: Duration) -> bool {
    now - record.last_seen() <= window
}
