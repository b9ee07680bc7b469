use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::HISTORY_CAPACITY;

/// Upper bound on every configured period, timeout and window (one year)
pub const MAX_CONFIGURED_SECS: u64 = 365 * 24 * 60 * 60;
use crate::validation::error::ConfigError;

/// Engine-wide configuration parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Signal validation and distance model
    pub signal: SignalConfig,
    /// Position solver tuning
    pub solver: SolverConfig,
    /// Track filter noise parameters
    pub filter: FilterParams,
    /// Per-device state limits and timeouts
    pub registry: RegistryConfig,
    /// Identity anonymization
    pub identity: IdentityConfig,
    /// Periods of the intake, compute and expiry activities
    pub schedule: ScheduleConfig,
    /// Facility layout file, relative paths resolved against the config file
    pub layout_file: Option<PathBuf>,
}

/// Attenuation model used to turn dBm into metres
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttenuationModel {
    /// `d = 10^((tx_power - rssi) / (10 n))`
    LogDistance {
        /// Expected signal strength at 1 m (dBm)
        tx_power_dbm: f64,
        /// Path loss exponent, typically 2 to 4 indoors
        path_loss_exponent: f64,
    },
    /// Log-linear interpolation between the distance bounds across the clamp range
    #[default]
    LogInterpolated,
}

/// Signal strength handling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Lower clamp bound applied before the distance model (dBm)
    pub clamp_min_dbm: f64,
    /// Upper clamp bound applied before the distance model (dBm)
    pub clamp_max_dbm: f64,
    /// Readings below this are physically implausible (dBm, inclusive)
    pub valid_min_dbm: f64,
    /// Readings at or above this are physically implausible (dBm, exclusive)
    pub valid_max_dbm: f64,
    /// Readings weaker than this are treated as noise (dBm)
    pub floor_dbm: f64,
    /// Distance at `clamp_max_dbm` (metres); lower bound for every model
    pub min_distance_m: f64,
    /// Distance at `clamp_min_dbm` (metres); upper bound for every model
    pub max_distance_m: f64,
    pub model: AttenuationModel,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            clamp_min_dbm: -90.0,
            clamp_max_dbm: -30.0,
            valid_min_dbm: -120.0,
            valid_max_dbm: 0.0,
            floor_dbm: -100.0,
            min_distance_m: 0.5,
            max_distance_m: 50.0,
            model: AttenuationModel::default(),
        }
    }
}

/// Position solver tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Number of distinct golden-angle slots (K)
    pub angular_slots: u64,
    /// Arc length of the time-seeded drift along the placement circle (metres); 0 disables it
    pub jitter_m: f64,
    /// Normal-matrix condition number above which multilateration falls back
    pub max_condition_number: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            angular_slots: 360,
            jitter_m: 0.25,
            max_condition_number: 1e6,
        }
    }
}

/// Constant-velocity filter noise parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterParams {
    /// Position process noise per second (m²/s)
    pub process_noise_position: f64,
    /// Velocity process noise per second (m²/s³)
    pub process_noise_velocity: f64,
    /// Measurement noise variance (m²)
    pub measurement_noise: f64,
    /// Position variance right after initialization (m²)
    pub initial_position_variance: f64,
    /// Velocity variance right after initialization (m²/s²)
    pub initial_velocity_variance: f64,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            process_noise_position: 0.1,
            process_noise_velocity: 0.01,
            measurement_noise: 1.0,
            initial_position_variance: 1.0,
            initial_velocity_variance: 0.1,
        }
    }
}

/// Per-device state limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Samples retained per device
    pub history_capacity: usize,
    /// Devices unseen for longer than this are removed by the expiry sweep
    pub expiry_timeout_secs: u64,
    /// Default look-back window for active-device queries
    pub active_window_secs: u64,
}

impl RegistryConfig {
    pub fn expiry_timeout(&self) -> chrono::Duration {
        seconds(self.expiry_timeout_secs)
    }

    pub fn active_window(&self) -> chrono::Duration {
        seconds(self.active_window_secs)
    }
}

/// Saturates instead of panicking on values `validate` would reject
fn seconds(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or_else(chrono::Duration::max_value)
}

fn milliseconds(ms: u64) -> chrono::Duration {
    i64::try_from(ms)
        .ok()
        .and_then(chrono::Duration::try_milliseconds)
        .unwrap_or_else(chrono::Duration::max_value)
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            history_capacity: HISTORY_CAPACITY,
            expiry_timeout_secs: 1800,
            active_window_secs: 300,
        }
    }
}

/// Identity anonymization
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Site secret mixed into the daily salt
    pub salt_secret: Option<String>,
    /// Offset from UTC of the facility's local calendar day (minutes)
    pub utc_offset_minutes: i32,
}

/// Periods of the engine's scheduled activities
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub intake_interval_ms: u64,
    pub compute_interval_ms: u64,
    pub expiry_interval_ms: u64,
    /// Grouping window for one device's detections
    pub detection_window_ms: u64,
    pub feed_channel_capacity: usize,
    pub command_channel_capacity: usize,
    pub update_channel_capacity: usize,
}

impl ScheduleConfig {
    pub fn intake_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.intake_interval_ms)
    }

    pub fn compute_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.compute_interval_ms)
    }

    pub fn expiry_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.expiry_interval_ms)
    }

    pub fn detection_window(&self) -> chrono::Duration {
        milliseconds(self.detection_window_ms)
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            intake_interval_ms: 1000,
            compute_interval_ms: 2000,
            expiry_interval_ms: 60_000,
            detection_window_ms: 5000,
            feed_channel_capacity: 4096,
            command_channel_capacity: 256,
            update_channel_capacity: 1024,
        }
    }
}

/// Facility geometry, loaded once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacilityLayout {
    pub facility: FacilityDimensions,
    pub receivers: Vec<ReceiverConfig>,
    /// Zones in priority order; the first containing polygon wins
    #[serde(default)]
    pub zones: Vec<ZoneConfig>,
}

/// Facility envelope with its origin at (0, 0)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FacilityDimensions {
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    pub id: String,
    pub position: [f64; 2],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub polygon: Vec<[f64; 2]>,
}

impl EngineConfig {
    /// Load and validate an engine configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config: EngineConfig = load_json(path)?;

        if let Some(layout) = config.layout_file.as_mut() {
            if layout.is_relative() {
                if let Some(dir) = path.parent() {
                    *layout = dir.join(&*layout);
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject parameter combinations the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.signal;
        if !(s.clamp_min_dbm < s.clamp_max_dbm) {
            return Err(ConfigError::invalid(
                "signal.clamp_min_dbm",
                s.clamp_min_dbm,
                "must be below clamp_max_dbm",
            ));
        }
        if !(s.valid_min_dbm < s.valid_max_dbm) {
            return Err(ConfigError::invalid(
                "signal.valid_min_dbm",
                s.valid_min_dbm,
                "must be below valid_max_dbm",
            ));
        }
        if !(s.min_distance_m > 0.0 && s.min_distance_m < s.max_distance_m) {
            return Err(ConfigError::invalid(
                "signal.min_distance_m",
                s.min_distance_m,
                "must be positive and below max_distance_m",
            ));
        }
        if let AttenuationModel::LogDistance { path_loss_exponent, .. } = s.model {
            if !(path_loss_exponent > 0.0) {
                return Err(ConfigError::invalid(
                    "signal.model.path_loss_exponent",
                    path_loss_exponent,
                    "must be positive",
                ));
            }
        }

        if self.solver.angular_slots == 0 {
            return Err(ConfigError::invalid("solver.angular_slots", 0, "must be at least 1"));
        }
        if !(self.solver.jitter_m >= 0.0) {
            return Err(ConfigError::invalid("solver.jitter_m", self.solver.jitter_m, "must not be negative"));
        }
        if !(self.solver.max_condition_number > 1.0) {
            return Err(ConfigError::invalid(
                "solver.max_condition_number",
                self.solver.max_condition_number,
                "must be greater than 1",
            ));
        }

        let f = &self.filter;
        for (name, value) in [
            ("filter.process_noise_position", f.process_noise_position),
            ("filter.process_noise_velocity", f.process_noise_velocity),
            ("filter.measurement_noise", f.measurement_noise),
            ("filter.initial_position_variance", f.initial_position_variance),
            ("filter.initial_velocity_variance", f.initial_velocity_variance),
        ] {
            if !(value > 0.0) || !value.is_finite() {
                return Err(ConfigError::invalid(name, value, "must be positive"));
            }
        }

        if self.registry.history_capacity == 0 {
            return Err(ConfigError::invalid("registry.history_capacity", 0, "must be at least 1"));
        }
        if self.registry.expiry_timeout_secs == 0 {
            return Err(ConfigError::invalid("registry.expiry_timeout_secs", 0, "must be at least 1"));
        }
        for (name, value) in [
            ("registry.expiry_timeout_secs", self.registry.expiry_timeout_secs),
            ("registry.active_window_secs", self.registry.active_window_secs),
        ] {
            if value > MAX_CONFIGURED_SECS {
                return Err(ConfigError::invalid(name, value, "must not exceed one year"));
            }
        }

        let sch = &self.schedule;
        for (name, value) in [
            ("schedule.intake_interval_ms", sch.intake_interval_ms),
            ("schedule.compute_interval_ms", sch.compute_interval_ms),
            ("schedule.expiry_interval_ms", sch.expiry_interval_ms),
            ("schedule.detection_window_ms", sch.detection_window_ms),
            ("schedule.feed_channel_capacity", sch.feed_channel_capacity as u64),
            ("schedule.command_channel_capacity", sch.command_channel_capacity as u64),
            ("schedule.update_channel_capacity", sch.update_channel_capacity as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(name, value, "must be non-zero"));
            }
        }
        for (name, value) in [
            ("schedule.intake_interval_ms", sch.intake_interval_ms),
            ("schedule.compute_interval_ms", sch.compute_interval_ms),
            ("schedule.expiry_interval_ms", sch.expiry_interval_ms),
            ("schedule.detection_window_ms", sch.detection_window_ms),
        ] {
            if value / 1000 > MAX_CONFIGURED_SECS {
                return Err(ConfigError::invalid(name, value, "must not exceed one year"));
            }
        }

        if self.identity.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(ConfigError::invalid(
                "identity.utc_offset_minutes",
                self.identity.utc_offset_minutes,
                "must be within one day",
            ));
        }

        Ok(())
    }
}

impl FacilityLayout {
    /// Load a layout file; geometry is validated when the zone index is built
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        load_json(path.as_ref())
    }
}

/// Read a JSON file, substituting `"${VAR}"` strings from the environment
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut value: Value = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    substitute_env_vars(&mut value);

    serde_json::from_value(value).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Replace `"${VAR}"` string values with the variable's value, coercing
/// booleans and numbers. Unset variables leave the placeholder untouched.
pub fn substitute_env_vars(value: &mut Value) {
    match value {
        Value::String(s) => {
            let Some(name) = s.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) else {
                return;
            };
            let Ok(env_value) = std::env::var(name) else {
                return;
            };
            *value = coerce_env_value(env_value);
        }
        Value::Array(items) => items.iter_mut().for_each(substitute_env_vars),
        Value::Object(map) => map.values_mut().for_each(substitute_env_vars),
        _ => {}
    }
}

fn coerce_env_value(raw: String) -> Value {
    match raw.to_ascii_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.registry.history_capacity, 100);
        assert_eq!(config.solver.angular_slots, 360);
    }

    #[test]
    fn test_rejects_non_positive_noise() {
        let mut config = EngineConfig::default();
        config.filter.measurement_noise = 0.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("filter.measurement_noise"));
    }

    #[test]
    fn test_rejects_unbounded_durations() {
        let mut config = EngineConfig::default();
        config.registry.expiry_timeout_secs = u64::MAX / 2;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("registry.expiry_timeout_secs"));
        // Accessors saturate rather than panic on an unvalidated value
        assert_eq!(config.registry.expiry_timeout(), chrono::Duration::max_value());

        let mut config = EngineConfig::default();
        config.registry.active_window_secs = u64::MAX;
        assert!(config.validate().is_err());
        assert_eq!(config.registry.active_window(), chrono::Duration::max_value());

        let mut config = EngineConfig::default();
        config.schedule.detection_window_ms = u64::MAX;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("schedule.detection_window_ms"));
        assert_eq!(config.schedule.detection_window(), chrono::Duration::max_value());

        let mut config = EngineConfig::default();
        config.registry.expiry_timeout_secs = MAX_CONFIGURED_SECS;
        config.schedule.expiry_interval_ms = MAX_CONFIGURED_SECS * 1000;
        assert!(config.validate().is_ok());
        assert_eq!(config.registry.expiry_timeout(), chrono::Duration::days(365));
    }

    #[test]
    fn test_rejects_inverted_clamp() {
        let mut config = EngineConfig::default();
        config.signal.clamp_min_dbm = -20.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        let mut file = fs::File::create(&path).unwrap();
        write!(file, r#"{{"registry": {{"expiry_timeout_secs": 60}}, "layout_file": "layout.json"}}"#).unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.registry.expiry_timeout_secs, 60);
        assert_eq!(config.registry.history_capacity, 100);
        assert_eq!(config.layout_file, Some(dir.path().join("layout.json")));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = EngineConfig::from_file("/nonexistent/engine.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            FacilityLayout::from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_env_substitution() {
        std::env::set_var("BEACON_TEST_EXPIRY", "42");
        std::env::set_var("BEACON_TEST_SECRET", "site-7");

        let mut value = json!({
            "registry": {"expiry_timeout_secs": "${BEACON_TEST_EXPIRY}"},
            "identity": {"salt_secret": "${BEACON_TEST_SECRET}"},
            "nested": ["${BEACON_TEST_UNSET_VARIABLE}"]
        });
        substitute_env_vars(&mut value);

        assert_eq!(value["registry"]["expiry_timeout_secs"], json!(42));
        assert_eq!(value["identity"]["salt_secret"], json!("site-7"));
        assert_eq!(value["nested"][0], json!("${BEACON_TEST_UNSET_VARIABLE}"));
    }

    #[test]
    fn test_layout_roundtrip_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layout.json");
        let layout = json!({
            "facility": {"width": 20.0, "height": 15.0},
            "receivers": [{"id": "r1", "position": [0.0, 0.0]}],
            "zones": [{"id": "entrance", "polygon": [[0,0],[5,0],[5,5],[0,5]]}]
        });
        fs::write(&path, layout.to_string()).unwrap();

        let loaded = FacilityLayout::from_file(&path).unwrap();
        assert_eq!(loaded.receivers.len(), 1);
        assert_eq!(loaded.zones[0].polygon.len(), 4);
        assert!(loaded.zones[0].name.is_none());
    }
}
