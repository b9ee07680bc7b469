use chrono::{DateTime, Utc};
use nalgebra::{Matrix2, Matrix2x4, Matrix4, Point2, Vector2, Vector4};

use crate::utils::config::FilterParams;

/// Lifecycle of a track filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterPhase {
    /// No observation yet
    Uninitialized,
    /// Estimate initialized from the first observation and updated since
    Tracking,
}

/// Constant-velocity Kalman filter for one device's planar trajectory
/// State vector: [x, y, vx, vy]
#[derive(Debug, Clone)]
pub struct TrackFilter {
    /// Current state estimate [position, velocity]
    state: Vector4<f64>,
    /// State covariance matrix
    covariance: Matrix4<f64>,
    /// Process noise per second of elapsed time
    process_noise: Matrix4<f64>,
    /// Measurement noise covariance matrix
    measurement_noise: Matrix2<f64>,
    /// Time of the last observation; `None` while uninitialized
    last_update: Option<DateTime<Utc>>,
    params: FilterParams,
}

impl TrackFilter {
    pub fn new(params: FilterParams) -> Self {
        Self {
            state: Vector4::zeros(),
            covariance: Matrix4::identity() * 100.0,
            process_noise: Self::create_process_noise(
                params.process_noise_position,
                params.process_noise_velocity,
            ),
            measurement_noise: Matrix2::identity() * params.measurement_noise,
            last_update: None,
            params,
        }
    }

    pub fn phase(&self) -> FilterPhase {
        match self.last_update {
            None => FilterPhase::Uninitialized,
            Some(_) => FilterPhase::Tracking,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.last_update.is_some()
    }

    /// Fuse a raw coordinate observed at `at` and return the smoothed coordinate
    ///
    /// The first observation initializes the estimate directly. Later ones
    /// predict forward by the elapsed time, then correct. A non-positive
    /// elapsed time skips the prediction.
    pub fn observe(&mut self, raw: Point2<f64>, at: DateTime<Utc>) -> Point2<f64> {
        let Some(last) = self.last_update else {
            self.initialize(raw, at);
            return raw;
        };

        let dt = (at - last).num_milliseconds() as f64 / 1000.0;
        self.predict(dt);
        let smoothed = self.update(raw);
        self.last_update = Some(at.max(last));
        smoothed
    }

    /// Initialize with a first position and zero velocity
    pub fn initialize(&mut self, position: Point2<f64>, at: DateTime<Utc>) {
        self.state = Vector4::new(position.x, position.y, 0.0, 0.0);

        self.covariance = Matrix4::zeros();
        self.covariance[(0, 0)] = self.params.initial_position_variance;
        self.covariance[(1, 1)] = self.params.initial_position_variance;
        self.covariance[(2, 2)] = self.params.initial_velocity_variance;
        self.covariance[(3, 3)] = self.params.initial_velocity_variance;

        self.last_update = Some(at);
    }

    /// Propagate the estimate `dt` seconds under the constant-velocity model
    pub fn predict(&mut self, dt: f64) -> Point2<f64> {
        if dt <= 0.0 {
            return self.position();
        }

        let f = Self::create_state_transition_matrix(dt);

        // x_k = F * x_{k-1}
        self.state = f * self.state;

        // P_k = F * P_{k-1} * F^T + Q dt
        self.covariance = f * self.covariance * f.transpose() + self.process_noise * dt;

        self.position()
    }

    /// Correct the estimate with a position measurement
    pub fn update(&mut self, measurement: Point2<f64>) -> Point2<f64> {
        // We observe position directly
        let h = Matrix2x4::new(
            1.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
        );
        let r = self.measurement_noise;

        let innovation = measurement.coords - h * self.state;
        let s = h * self.covariance * h.transpose() + r;

        if let Some(s_inv) = s.try_inverse() {
            let k = self.covariance * h.transpose() * s_inv;

            self.state += k * innovation;

            // Joseph form keeps P symmetric positive definite
            let i_kh = Matrix4::identity() - k * h;
            self.covariance = i_kh * self.covariance * i_kh.transpose() + k * r * k.transpose();
        }

        self.position()
    }

    pub fn position(&self) -> Point2<f64> {
        Point2::new(self.state[0], self.state[1])
    }

    pub fn velocity(&self) -> Vector2<f64> {
        Vector2::new(self.state[2], self.state[3])
    }

    /// Position standard deviations
    pub fn position_uncertainty(&self) -> Vector2<f64> {
        Vector2::new(self.covariance[(0, 0)].sqrt(), self.covariance[(1, 1)].sqrt())
    }

    /// Constant-velocity look-ahead, without touching the state
    pub fn predict_future_position(&self, future_dt: f64) -> Point2<f64> {
        if future_dt <= 0.0 {
            return self.position();
        }
        self.position() + self.velocity() * future_dt
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    fn create_state_transition_matrix(dt: f64) -> Matrix4<f64> {
        Matrix4::new(
            1.0, 0.0, dt,  0.0,
            0.0, 1.0, 0.0, dt,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        )
    }

    fn create_process_noise(position_noise: f64, velocity_noise: f64) -> Matrix4<f64> {
        Matrix4::from_diagonal(&Vector4::new(
            position_noise,
            position_noise,
            velocity_noise,
            velocity_noise,
        ))
    }
}

impl Default for TrackFilter {
    fn default() -> Self {
        Self::new(FilterParams::default())
    }
}
