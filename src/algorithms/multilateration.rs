use chrono::{DateTime, Utc};
use nalgebra::{DMatrix, DVector, Point2, Vector2};
use sha2::{Digest, Sha256};
use std::f64::consts::TAU;
use std::sync::Arc;
use tracing::debug;

use crate::algorithms::zones::ZoneIndex;
use crate::core::{DeviceId, Range, GOLDEN_ANGLE_RAD};
use crate::utils::config::SolverConfig;
use crate::validation::error::ComputationError;

/// Period of the time-seeded perturbation (seconds)
const JITTER_PERIOD_SECS: f64 = 100.0;

/// Radius below which the perturbation arc is capped at `jitter_m` radians
const MIN_ARC_RADIUS: f64 = 1.0;

/// Floor on distances used as inverse weights (metres)
const MIN_WEIGHT_DISTANCE: f64 = 0.1;

/// How a raw coordinate was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveMethod {
    /// Weighted least squares over three or more receivers
    Multilateration,
    /// Golden-angle placement around the strongest receiver
    AngularPlacement,
}

/// Raw coordinate produced for one device and cycle
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub point: Point2<f64>,
    pub method: SolveMethod,
    /// Ranges that referenced a known receiver
    pub ranges_used: usize,
}

/// Converts per-receiver ranges into a raw facility coordinate
///
/// Three or more ranges are solved by inverse-distance weighted least squares
/// over the linearized circle equations. Fewer ranges, or an ill-conditioned
/// system, place the device on a circle around the strongest receiver at a
/// per-device golden-angle offset. The placement radius equals the estimated
/// distance; the time-seeded perturbation only slides the point along that
/// circle. Every result is clamped to the facility envelope.
#[derive(Debug, Clone)]
pub struct PositionSolver {
    zones: Arc<ZoneIndex>,
    config: SolverConfig,
}

impl PositionSolver {
    pub fn new(zones: Arc<ZoneIndex>, config: SolverConfig) -> Self {
        Self { zones, config }
    }

    pub fn solve(
        &self,
        device_id: &DeviceId,
        ranges: &[Range],
        now: DateTime<Utc>,
    ) -> Result<Solution, ComputationError> {
        let located: Vec<(Point2<f64>, f64)> = ranges
            .iter()
            .filter(|r| r.distance.is_finite() && r.distance >= 0.0)
            .filter_map(|r| match self.zones.receiver(&r.receiver_id) {
                Some(receiver) => Some((receiver.position, r.distance)),
                None => {
                    debug!(receiver = %r.receiver_id, "ignoring range from unknown receiver");
                    None
                }
            })
            .collect();

        if located.is_empty() {
            return Err(ComputationError::NoRanges);
        }

        let envelope = self.zones.envelope();

        if located.len() >= 3 {
            match self.multilaterate(&located) {
                Ok(point) => {
                    return Ok(Solution {
                        point: envelope.clamp(&point),
                        method: SolveMethod::Multilateration,
                        ranges_used: located.len(),
                    })
                }
                Err(err) => {
                    debug!(device = %device_id, error = %err, "multilateration fell back to angular placement");
                }
            }
        }

        let point = self.angular_placement(device_id, &located, now)?;
        Ok(Solution {
            point: envelope.clamp(&point),
            method: SolveMethod::AngularPlacement,
            ranges_used: located.len(),
        })
    }

    /// Weighted least squares over `(receiver position, distance)` pairs
    pub fn multilaterate(&self, located: &[(Point2<f64>, f64)]) -> Result<Point2<f64>, ComputationError> {
        if located.len() < 3 {
            return Err(ComputationError::NoRanges);
        }

        // Linearize against the nearest receiver
        let reference = located
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let (p1, r1) = located[reference];

        let rows = located.len() - 1;
        let mut a_matrix = DMatrix::zeros(rows, 2);
        let mut b_vector = DVector::zeros(rows);
        let mut weight_matrix = DMatrix::zeros(rows, rows);

        for (row, &(pi, ri)) in located
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != reference)
            .map(|(_, m)| m)
            .enumerate()
        {
            a_matrix[(row, 0)] = 2.0 * (pi.x - p1.x);
            a_matrix[(row, 1)] = 2.0 * (pi.y - p1.y);

            b_vector[row] = r1.powi(2) - ri.powi(2)
                + pi.x.powi(2) - p1.x.powi(2)
                + pi.y.powi(2) - p1.y.powi(2);

            weight_matrix[(row, row)] = 1.0 / ri.max(MIN_WEIGHT_DISTANCE);
        }

        // (A^T W A) x = A^T W b
        let at_w = a_matrix.transpose() * &weight_matrix;
        let normal = &at_w * &a_matrix;
        let rhs = &at_w * &b_vector;

        let singular_values = normal.singular_values();
        let (max_sv, min_sv) = (singular_values.max(), singular_values.min());
        let condition_number = if min_sv > f64::EPSILON * max_sv.max(1.0) {
            max_sv / min_sv
        } else {
            f64::INFINITY
        };
        if condition_number > self.config.max_condition_number {
            return Err(ComputationError::IllConditioned { condition_number });
        }

        let solution = normal
            .lu()
            .solve(&rhs)
            .ok_or(ComputationError::IllConditioned { condition_number })?;

        let point = Point2::new(solution[0], solution[1]);
        if !point.x.is_finite() || !point.y.is_finite() {
            return Err(ComputationError::NonFinite);
        }
        Ok(point)
    }

    /// Stable angular offset for a device, in `[0, 2π)`
    pub fn placement_angle(&self, device_id: &DeviceId) -> f64 {
        let slot = stable_hash(device_id) % self.config.angular_slots.max(1);
        (slot as f64 * GOLDEN_ANGLE_RAD).rem_euclid(TAU)
    }

    fn angular_placement(
        &self,
        device_id: &DeviceId,
        located: &[(Point2<f64>, f64)],
        now: DateTime<Utc>,
    ) -> Result<Point2<f64>, ComputationError> {
        // Distance is monotone in signal strength, so the nearest is the strongest
        let &(anchor, distance) = located
            .iter()
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .ok_or(ComputationError::NoRanges)?;

        let swing = self.jitter(now) / distance.max(MIN_ARC_RADIUS);
        let theta = self.placement_angle(device_id) + swing;
        let point = anchor + Vector2::new(theta.cos(), theta.sin()) * distance;

        if !point.x.is_finite() || !point.y.is_finite() {
            return Err(ComputationError::NonFinite);
        }
        Ok(point)
    }

    /// Arc length (metres, at most `jitter_m`) a stationary device drifts along its circle
    fn jitter(&self, now: DateTime<Utc>) -> f64 {
        if self.config.jitter_m <= 0.0 {
            return 0.0;
        }
        let secs = now.timestamp_millis() as f64 / 1000.0;
        let phase = (secs / JITTER_PERIOD_SECS).fract();
        self.config.jitter_m * (phase * TAU).sin()
    }
}

/// First 8 bytes of SHA-256 over the device id
fn stable_hash(device_id: &DeviceId) -> u64 {
    let digest = Sha256::digest(device_id.as_str().as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::config::{FacilityDimensions, FacilityLayout, ReceiverConfig};
    use chrono::{Duration, TimeZone};

    fn solver_with(receivers: &[(&str, [f64; 2])], config: SolverConfig) -> PositionSolver {
        let layout = FacilityLayout {
            facility: FacilityDimensions { width: 20.0, height: 15.0 },
            receivers: receivers
                .iter()
                .map(|(id, position)| ReceiverConfig {
                    id: id.to_string(),
                    position: *position,
                })
                .collect(),
            zones: vec![],
        };
        PositionSolver::new(Arc::new(ZoneIndex::from_layout(&layout).unwrap()), config)
    }

    fn device(id: &str) -> DeviceId {
        DeviceId::from_hex(id.to_string())
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_three_receivers_recover_true_point() {
        let solver = solver_with(
            &[("a", [0.0, 0.0]), ("b", [10.0, 0.0]), ("c", [5.0, 10.0])],
            SolverConfig::default(),
        );
        let truth = Point2::new(5.0, 5.0);
        let ranges: Vec<Range> = [("a", [0.0, 0.0]), ("b", [10.0, 0.0]), ("c", [5.0, 10.0])]
            .iter()
            .map(|(id, [x, y])| Range::new(*id, (truth - Point2::new(*x, *y)).norm()))
            .collect();

        let solution = solver.solve(&device("d1"), &ranges, t0()).unwrap();
        assert_eq!(solution.method, SolveMethod::Multilateration);
        assert_eq!(solution.ranges_used, 3);
        assert!((solution.point - truth).norm() < 0.5);
    }

    #[test]
    fn test_overdetermined_with_noise() {
        let receivers = [
            ("a", [0.0, 0.0]),
            ("b", [20.0, 0.0]),
            ("c", [20.0, 15.0]),
            ("d", [0.0, 15.0]),
        ];
        let solver = solver_with(&receivers, SolverConfig::default());
        let truth = Point2::new(8.0, 6.0);
        let noise = [0.1, -0.1, 0.05, -0.05];
        let ranges: Vec<Range> = receivers
            .iter()
            .zip(noise)
            .map(|((id, [x, y]), n)| Range::new(*id, (truth - Point2::new(*x, *y)).norm() + n))
            .collect();

        let solution = solver.solve(&device("d1"), &ranges, t0()).unwrap();
        assert_eq!(solution.method, SolveMethod::Multilateration);
        assert!((solution.point - truth).norm() < 0.5);
    }

    #[test]
    fn test_collinear_receivers_fall_back() {
        let solver = solver_with(
            &[("a", [2.0, 7.0]), ("b", [10.0, 7.0]), ("c", [18.0, 7.0])],
            SolverConfig::default(),
        );
        let ranges = vec![Range::new("a", 8.0), Range::new("b", 1.0), Range::new("c", 8.0)];

        let solution = solver.solve(&device("d1"), &ranges, t0()).unwrap();
        assert_eq!(solution.method, SolveMethod::AngularPlacement);
        assert!(solution.point.x.is_finite() && solution.point.y.is_finite());
        // Placed around the strongest receiver (b)
        assert!(((solution.point - Point2::new(10.0, 7.0)).norm() - 1.0).abs() < 1e-9);
    }

    fn still() -> SolverConfig {
        SolverConfig {
            jitter_m: 0.0,
            ..SolverConfig::default()
        }
    }

    fn angle_between(a: f64, b: f64) -> f64 {
        let diff = (a - b).rem_euclid(TAU);
        diff.min(TAU - diff)
    }

    #[test]
    fn test_single_receiver_angle_is_stable() {
        let solver = solver_with(&[("center", [10.0, 7.5])], still());
        let id = device("3f9a0c17d2e4b851");
        let center = Point2::new(10.0, 7.5);

        let near = solver.solve(&id, &[Range::new("center", 1.5)], t0()).unwrap();
        let far = solver
            .solve(&id, &[Range::new("center", 4.0)], t0() + Duration::seconds(37))
            .unwrap();
        assert_eq!(near.method, SolveMethod::AngularPlacement);

        let offset_near = near.point - center;
        let offset_far = far.point - center;
        let angle_near = offset_near.y.atan2(offset_near.x).rem_euclid(TAU);
        let angle_far = offset_far.y.atan2(offset_far.x).rem_euclid(TAU);

        assert!((angle_near - angle_far).abs() < 1e-9);
        assert!((angle_near - solver.placement_angle(&id)).abs() < 1e-9);
        assert!(offset_far.norm() > offset_near.norm());
    }

    #[test]
    fn test_radius_tracks_distance_without_jitter() {
        let solver = solver_with(&[("center", [10.0, 7.5])], still());
        let id = device("aa");
        let center = Point2::new(10.0, 7.5);

        let mut previous = 0.0;
        for distance in [0.5, 1.0, 2.0, 3.5, 5.0] {
            let solution = solver.solve(&id, &[Range::new("center", distance)], t0()).unwrap();
            let radius = (solution.point - center).norm();
            assert!((radius - distance).abs() < 1e-9);
            assert!(radius > previous);
            previous = radius;
        }
    }

    #[test]
    fn test_jitter_keeps_radius_ordered() {
        let solver = solver_with(&[("center", [10.0, 7.5])], SolverConfig::default());
        let id = device("3f9a0c17d2e4b851");
        let center = Point2::new(10.0, 7.5);
        let slot = solver.placement_angle(&id);

        // Close distance pairs observed at unrelated points of the jitter period
        for step in 0..40 {
            let near_distance = 0.6 + step as f64 * 0.1;
            let far_distance = near_distance + 0.01;
            let near_at = t0() + Duration::milliseconds(step * 2_345);
            let far_at = t0() + Duration::milliseconds(65_000 + step * 7_919);

            let near = solver.solve(&id, &[Range::new("center", near_distance)], near_at).unwrap();
            let far = solver.solve(&id, &[Range::new("center", far_distance)], far_at).unwrap();

            let (rn, rf) = ((near.point - center).norm(), (far.point - center).norm());
            assert!((rn - near_distance).abs() < 1e-9);
            assert!((rf - far_distance).abs() < 1e-9);
            assert!(rf > rn);

            for (solution, distance) in [(&near, near_distance), (&far, far_distance)] {
                let offset = solution.point - center;
                let angle = offset.y.atan2(offset.x).rem_euclid(TAU);
                let bound = 0.25 / distance.max(1.0) + 1e-9;
                assert!(angle_between(angle, slot) <= bound);
            }
        }
    }

    #[test]
    fn test_different_devices_spread_out() {
        let solver = solver_with(&[("center", [10.0, 7.5])], SolverConfig::default());
        let a = solver.placement_angle(&device("device-a"));
        let b = solver.placement_angle(&device("device-b"));
        assert!((0.0..TAU).contains(&a));
        assert!((a - b).abs() > 1e-6);
    }

    #[test]
    fn test_output_clamped_to_envelope() {
        let solver = solver_with(&[("corner", [0.0, 0.0])], SolverConfig::default());
        for i in 0..20 {
            let id = device(&format!("device-{i}"));
            let solution = solver.solve(&id, &[Range::new("corner", 30.0)], t0()).unwrap();
            assert!(solution.point.x >= 0.0 && solution.point.x <= 20.0);
            assert!(solution.point.y >= 0.0 && solution.point.y <= 15.0);
        }
    }

    #[test]
    fn test_unknown_receivers_only_is_error() {
        let solver = solver_with(&[("a", [0.0, 0.0])], SolverConfig::default());
        let result = solver.solve(&device("d"), &[Range::new("ghost", 2.0)], t0());
        assert_eq!(result, Err(ComputationError::NoRanges));
        assert_eq!(solver.solve(&device("d"), &[], t0()), Err(ComputationError::NoRanges));
    }
}
