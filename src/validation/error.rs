//! Error classification for the positioning engine
//!
//! Configuration errors are fatal at startup. Sensor and computation errors
//! are recoverable per device and per cycle; the registry keeps the device's
//! prior state when they occur.

use crate::core::DeviceId;
use std::path::PathBuf;
use thiserror::Error;

/// Invalid or unreadable facility geometry / engine parameters
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid parameter {parameter} = {value}: {reason}")]
    InvalidParameter {
        parameter: String,
        value: String,
        reason: String,
    },

    #[error("duplicate receiver id '{0}'")]
    DuplicateReceiver(String),

    #[error("duplicate zone id '{0}'")]
    DuplicateZone(String),

    #[error("zone id '{0}' is reserved")]
    ReservedZoneId(String),

    #[error("malformed polygon for zone '{zone}': {reason}")]
    MalformedPolygon { zone: String, reason: String },

    #[error("invalid receiver '{receiver}': {reason}")]
    InvalidReceiver { receiver: String, reason: String },

    #[error("facility layout has no receivers")]
    NoReceivers,
}

impl ConfigError {
    pub fn invalid(parameter: &str, value: impl ToString, reason: &str) -> Self {
        ConfigError::InvalidParameter {
            parameter: parameter.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn polygon(zone: &str, reason: impl Into<String>) -> Self {
        ConfigError::MalformedPolygon {
            zone: zone.to_string(),
            reason: reason.into(),
        }
    }
}

/// A reading that cannot be used this cycle
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SensorError {
    #[error("receiver '{receiver}' reported no signal strength")]
    MissingSignal { receiver: String },

    #[error("receiver '{receiver}' reported {dbm} dBm, outside [{min}, {max})")]
    SignalOutOfRange {
        receiver: String,
        dbm: f64,
        min: f64,
        max: f64,
    },

    #[error("receiver '{receiver}' reported {dbm} dBm, below the {floor} dBm floor")]
    BelowFloor { receiver: String, dbm: f64, floor: f64 },

    #[error("unknown receiver '{0}'")]
    UnknownReceiver(String),
}

/// Failure to turn ranges into a coordinate
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ComputationError {
    #[error("no usable ranges")]
    NoRanges,

    #[error("ill-conditioned multilateration system (condition number {condition_number:.3e})")]
    IllConditioned { condition_number: f64 },

    #[error("solution is not finite")]
    NonFinite,
}

/// Registry operation on a device it does not hold
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("device {0} is not registered")]
    UnknownDevice(DeviceId),
}

/// Errors surfaced by the running engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("registry worker is no longer running")]
    WorkerUnavailable,
}

pub type EngineResult<T> = Result<T, EngineError>;
