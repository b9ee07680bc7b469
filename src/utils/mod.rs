//! Configuration and clock utilities

pub mod config;
pub mod clock;

pub use config::{EngineConfig, FacilityLayout};
pub use clock::{Clock, ManualClock, SystemClock};
