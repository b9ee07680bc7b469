//! Signal strength to distance conversion

use crate::core::SignalReading;
use crate::utils::config::{AttenuationModel, SignalConfig};
use crate::validation::error::SensorError;

/// Stateless attenuation model mapping dBm to metres
///
/// The input is clamped to `[clamp_min_dbm, clamp_max_dbm]` first, so values
/// outside the clamp saturate at the distance bounds instead of extrapolating.
#[derive(Debug, Clone)]
pub struct DistanceEstimator {
    config: SignalConfig,
}

impl DistanceEstimator {
    pub fn new(config: SignalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    /// Estimated distance (metres) for a signal strength (dBm)
    pub fn estimate(&self, dbm: f64) -> f64 {
        let c = &self.config;
        let clamped = dbm.clamp(c.clamp_min_dbm, c.clamp_max_dbm);

        let distance = match c.model {
            AttenuationModel::LogDistance {
                tx_power_dbm,
                path_loss_exponent,
            } => 10_f64.powf((tx_power_dbm - clamped) / (10.0 * path_loss_exponent)),
            AttenuationModel::LogInterpolated => {
                // Strongest clamp bound maps to min_distance, weakest to max_distance
                let t = (c.clamp_max_dbm - clamped) / (c.clamp_max_dbm - c.clamp_min_dbm);
                c.min_distance_m * (c.max_distance_m / c.min_distance_m).powf(t)
            }
        };

        distance.clamp(c.min_distance_m, c.max_distance_m)
    }

    /// Check a reading and return its distance, or the reason it is unusable
    pub fn validate(&self, reading: &SignalReading) -> Result<f64, SensorError> {
        let c = &self.config;
        let dbm = match reading.signal_strength {
            // 0 dBm is what the scanner reports when it has no measurement
            Some(v) if v.is_finite() && v != 0.0 => v,
            _ => {
                return Err(SensorError::MissingSignal {
                    receiver: reading.receiver_id.clone(),
                })
            }
        };

        if dbm < c.valid_min_dbm || dbm >= c.valid_max_dbm {
            return Err(SensorError::SignalOutOfRange {
                receiver: reading.receiver_id.clone(),
                dbm,
                min: c.valid_min_dbm,
                max: c.valid_max_dbm,
            });
        }

        if dbm < c.floor_dbm {
            return Err(SensorError::BelowFloor {
                receiver: reading.receiver_id.clone(),
                dbm,
                floor: c.floor_dbm,
            });
        }

        Ok(self.estimate(dbm))
    }
}

impl Default for DistanceEstimator {
    fn default() -> Self {
        Self::new(SignalConfig::default())
    }
}
