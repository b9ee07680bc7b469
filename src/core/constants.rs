//! Engine-wide constants

/// Golden angle in radians, `π(3 − √5)`
pub const GOLDEN_ANGLE_RAD: f64 = 2.399_963_229_728_653;

/// Sentinel zone id for points outside every configured polygon
pub const UNKNOWN_ZONE: &str = "unknown";

/// Maximum number of samples retained per device
pub const HISTORY_CAPACITY: usize = 100;

/// Number of hex characters kept from the identity hash
pub const DEVICE_ID_HEX_LEN: usize = 16;
