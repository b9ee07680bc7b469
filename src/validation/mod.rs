//! Error taxonomy

pub mod error;

pub use error::{ComputationError, ConfigError, EngineError, EngineResult, RegistryError, SensorError};
