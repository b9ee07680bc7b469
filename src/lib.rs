//! Beacon Positioning Engine
//!
//! Turns noisy signal-strength detections from fixed receivers into smoothed,
//! zone-classified positions per anonymized device, with bounded per-device
//! history and day-scoped identity rotation.

pub mod algorithms;
pub mod api;
pub mod core;
pub mod privacy;
pub mod processing;
pub mod registry;
pub mod utils;
pub mod validation;

// Re-export commonly used types
pub use algorithms::{DistanceEstimator, PositionSolver, ZoneIndex};
pub use api::{Engine, EngineHandle, OutputFormat, PositionFormatter};
pub use crate::core::{DeviceId, DeviceType, PositionSample, PositionUpdate, RawDetection, SignalReading, ZoneId};
pub use privacy::IdentityAnonymizer;
pub use processing::TrackFilter;
pub use registry::{DeviceRegistry, DeviceSnapshot, RegistryStatistics};
pub use utils::{Clock, EngineConfig, FacilityLayout, ManualClock, SystemClock};
pub use validation::error::{ComputationError, ConfigError, EngineError, RegistryError, SensorError};
