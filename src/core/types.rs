//! Core data types for the positioning engine

use chrono::{DateTime, Utc};
use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::constants::UNKNOWN_ZONE;

/// Opaque, day-scoped device identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub(crate) fn from_hex(hex: String) -> Self {
        DeviceId(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Zone identifier; either a configured zone or the `unknown` sentinel
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoneId(String);

impl ZoneId {
    pub fn new(id: impl Into<String>) -> Self {
        ZoneId(id.into())
    }

    pub fn unknown() -> Self {
        ZoneId(UNKNOWN_ZONE.to_string())
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN_ZONE
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ZoneId {
    fn default() -> Self {
        ZoneId::unknown()
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One detection event as delivered by the scanning driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    /// Hardware address of the beacon; never stored past one cycle
    #[serde(alias = "mac_address")]
    pub raw_address: String,
    /// Receiver that heard the beacon
    pub receiver_id: String,
    /// Received signal strength (dBm); `None` when the driver had no reading
    #[serde(alias = "rssi", default)]
    pub signal_strength: Option<f64>,
    /// Detection time
    pub timestamp: DateTime<Utc>,
    /// Advertised name, if any; only used to classify the device type
    #[serde(alias = "name", default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
}

impl RawDetection {
    pub fn new(
        raw_address: impl Into<String>,
        receiver_id: impl Into<String>,
        signal_strength: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            raw_address: raw_address.into(),
            receiver_id: receiver_id.into(),
            signal_strength: Some(signal_strength),
            timestamp,
            device_name: None,
        }
    }

    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = Some(name.into());
        self
    }

    /// Strip the address, keeping only what positioning needs
    pub fn reading(&self) -> SignalReading {
        SignalReading {
            receiver_id: self.receiver_id.clone(),
            signal_strength: self.signal_strength,
            timestamp: self.timestamp,
        }
    }
}

/// Signal strength heard by one receiver during a cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalReading {
    pub receiver_id: String,
    pub signal_strength: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl SignalReading {
    pub fn new(receiver_id: impl Into<String>, signal_strength: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            receiver_id: receiver_id.into(),
            signal_strength: Some(signal_strength),
            timestamp,
        }
    }

    pub fn category(&self) -> Option<SignalCategory> {
        self.signal_strength.map(SignalCategory::from_dbm)
    }
}

/// Coarse signal strength classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalCategory {
    VeryStrong,
    Strong,
    Medium,
    Weak,
}

impl SignalCategory {
    pub fn from_dbm(dbm: f64) -> Self {
        if dbm > -50.0 {
            SignalCategory::VeryStrong
        } else if dbm > -70.0 {
            SignalCategory::Strong
        } else if dbm > -85.0 {
            SignalCategory::Medium
        } else {
            SignalCategory::Weak
        }
    }
}

/// Coarse device class guessed from the advertised name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Smartphone,
    Wearable,
    Beacon,
    Laptop,
    Tablet,
    #[default]
    Unknown,
}

/// Name fragments per type, matched case-insensitively in this order
const DEVICE_NAME_PATTERNS: [(DeviceType, &[&str]); 5] = [
    (DeviceType::Smartphone, &["iphone", "android", "phone"]),
    (DeviceType::Wearable, &["watch", "band", "fitbit"]),
    (DeviceType::Beacon, &["beacon", "ibeacon", "eddystone"]),
    (DeviceType::Laptop, &["macbook", "thinkpad", "laptop"]),
    (DeviceType::Tablet, &["ipad", "tab", "tablet"]),
];

impl DeviceType {
    pub fn from_name(name: &str) -> Self {
        let name = name.to_lowercase();
        DEVICE_NAME_PATTERNS
            .iter()
            .find(|(_, patterns)| patterns.iter().any(|p| name.contains(p)))
            .map_or(DeviceType::Unknown, |(device_type, _)| *device_type)
    }

    pub fn is_unknown(&self) -> bool {
        *self == DeviceType::Unknown
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceType::Smartphone => "smartphone",
            DeviceType::Wearable => "wearable",
            DeviceType::Beacon => "beacon",
            DeviceType::Laptop => "laptop",
            DeviceType::Tablet => "tablet",
            DeviceType::Unknown => "unknown",
        })
    }
}

/// Fixed receiver with known facility coordinates
#[derive(Debug, Clone, PartialEq)]
pub struct Receiver {
    pub id: String,
    pub position: Point2<f64>,
}

impl Receiver {
    pub fn new(id: impl Into<String>, x: f64, y: f64) -> Self {
        Self {
            id: id.into(),
            position: Point2::new(x, y),
        }
    }
}

/// Named polygonal region of the facility
#[derive(Debug, Clone, PartialEq)]
pub struct Zone {
    pub id: ZoneId,
    pub name: Option<String>,
    /// Vertices in order; the closing edge is implicit
    pub polygon: Vec<Point2<f64>>,
}

/// Estimated distance from one receiver
#[derive(Debug, Clone, PartialEq)]
pub struct Range {
    pub receiver_id: String,
    pub distance: f64,
}

impl Range {
    pub fn new(receiver_id: impl Into<String>, distance: f64) -> Self {
        Self {
            receiver_id: receiver_id.into(),
            distance,
        }
    }
}

/// Smoothed, zone-classified position of one device at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub x: f64,
    pub y: f64,
    pub timestamp: DateTime<Utc>,
    pub zone_id: ZoneId,
}

impl PositionSample {
    pub fn point(&self) -> Point2<f64> {
        Point2::new(self.x, self.y)
    }
}

/// Event emitted for every successful position computation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub device_id: DeviceId,
    pub x: f64,
    pub y: f64,
    pub zone_id: ZoneId,
    pub timestamp: DateTime<Utc>,
}

impl PositionUpdate {
    pub fn from_sample(device_id: DeviceId, sample: &PositionSample) -> Self {
        Self {
            device_id,
            x: sample.x,
            y: sample.y,
            zone_id: sample.zone_id.clone(),
            timestamp: sample.timestamp,
        }
    }
}
