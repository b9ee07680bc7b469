//! Per-device signal processing: smoothing, bounded history, feed batching

pub mod batching;
pub mod history;
pub mod kalman;

pub use batching::{DetectionBatch, DetectionBatcher};
pub use history::PositionHistory;
pub use kalman::{FilterPhase, TrackFilter};
