//! Core positioning algorithms

pub mod distance;
pub mod multilateration;
pub mod zones;

pub use distance::DistanceEstimator;
pub use multilateration::{PositionSolver, SolveMethod, Solution};
pub use zones::{point_in_polygon, FacilityEnvelope, ZoneIndex};
