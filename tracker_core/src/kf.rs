//! Kalman filter: predict and update steps.
//!
//! # Design choices
//! - We use a **linear KF** with a constant-velocity (CV) motion model.
//! - All math is done in `f64` via `nalgebra` fixed-size matrices.
//! - The `KalmanFilter` trait keeps the pipeline independent of the model.
//!
//! ## State vector
//! x = [px, py, vx, vy]ᵀ  (4-dimensional)
//!
//! ## CV Transition model
//! F = I₄ + dt * [[0₂ I₂]; [0₂ 0₂]]
//! i.e. px += vx*dt, py += vy*dt
//!
//! ## Process noise
//! Q = diag(q) * dt, with `q` the per-second diagonal from [`KfConfig`].
//!
//! ## Measurement noise
//! R = σ² I₂ · s(quality), s = q_ref / (q_ref + quality) when quality scaling
//! is enabled, so stronger detections pull the estimate harder.

use crate::types::{Position, StateCov, StateVec};
use nalgebra::{Matrix2, Matrix2x4, Matrix4x2, SymmetricEigen, Vector4};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Trait for a Kalman filter model (predict + update).
pub trait KalmanFilter {
    /// Predict state and covariance forward by `dt` seconds.
    fn predict(&self, state: &StateVec, cov: &StateCov, dt: f64) -> (StateVec, StateCov);

    /// Correct the state with a position measurement `z` of the given
    /// signal quality. `None` if the innovation covariance is singular.
    fn update(
        &self,
        state: &StateVec,
        cov: &StateCov,
        z: &Position,
        quality: f64,
    ) -> Option<KfUpdateResult>;
}

/// Result of a KF update step.
#[derive(Clone, Debug)]
pub struct KfUpdateResult {
    pub state: StateVec,
    pub cov: StateCov,
    /// Innovation ν = z − H·x
    pub innovation: Position,
    /// Innovation covariance S = H·P·Hᵀ + R
    pub innovation_cov: Matrix2<f64>,
    /// Kalman gain K
    pub kalman_gain: Matrix4x2<f64>,
}

// ---------------------------------------------------------------------------
// Constant Velocity model
// ---------------------------------------------------------------------------

/// Configuration for the CV Kalman filter.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct KfConfig {
    /// Additive process noise per second: [x, y, vx, vy] variances
    pub process_noise: [f64; 4],
    /// Measurement noise standard deviation (meters)
    pub measurement_noise_std: f64,
    /// Reference quality for measurement-noise scaling; `None` disables it
    pub quality_scaling: Option<f64>,
    /// Eigenvalue floor applied to every covariance
    pub min_variance: f64,
    /// Diagonal used to replace a covariance that went non-finite
    pub reset_variance: f64,
}

impl Default for KfConfig {
    fn default() -> Self {
        Self {
            process_noise: [0.25, 0.25, 1.0, 1.0],
            measurement_noise_std: 1.0,
            quality_scaling: None,
            min_variance: 1e-9,
            reset_variance: 1e4,
        }
    }
}

/// Constant-Velocity Kalman filter (4-state, linear).
#[derive(Clone, Debug)]
pub struct CvKalmanFilter {
    pub config: KfConfig,
}

impl CvKalmanFilter {
    pub fn new(config: KfConfig) -> Self {
        Self { config }
    }

    /// Build state transition matrix F for timestep dt.
    pub fn transition_matrix(dt: f64) -> StateCov {
        let mut f = StateCov::identity();
        // position += velocity * dt
        f[(0, 2)] = dt;
        f[(1, 3)] = dt;
        f
    }

    /// Observation matrix H: picks [x, y] out of the state.
    pub fn observation_matrix() -> Matrix2x4<f64> {
        Matrix2x4::new(1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0)
    }

    fn process_noise(&self, dt: f64) -> StateCov {
        StateCov::from_diagonal(&Vector4::from(self.config.process_noise)) * dt
    }

    /// Measurement noise R for a detection of the given quality.
    pub fn measurement_noise(&self, quality: f64) -> Matrix2<f64> {
        let sigma2 = self.config.measurement_noise_std * self.config.measurement_noise_std;
        let scale = match self.config.quality_scaling {
            Some(q_ref) if q_ref > 0.0 => q_ref / (q_ref + quality.max(0.0)),
            _ => 1.0,
        };
        Matrix2::identity() * (sigma2 * scale)
    }

    /// Project the covariance back onto the PSD cone.
    pub fn condition(&self, cov: &StateCov) -> StateCov {
        condition_covariance(
            cov,
            self.config.min_variance,
            &(StateCov::identity() * self.config.reset_variance),
        )
    }
}

impl KalmanFilter for CvKalmanFilter {
    fn predict(&self, state: &StateVec, cov: &StateCov, dt: f64) -> (StateVec, StateCov) {
        if dt <= 0.0 || !dt.is_finite() {
            return (*state, *cov);
        }
        let f = Self::transition_matrix(dt);
        let q = self.process_noise(dt);
        let predicted_state = f * state;
        let predicted_cov = f * cov * f.transpose() + q;
        (predicted_state, self.condition(&predicted_cov))
    }

    fn update(
        &self,
        state: &StateVec,
        cov: &StateCov,
        z: &Position,
        quality: f64,
    ) -> Option<KfUpdateResult> {
        let h = Self::observation_matrix();
        let r = self.measurement_noise(quality);

        // Innovation: ν = z − H·x
        let innovation = z - h * state;

        // Innovation covariance: S = H·P·Hᵀ + R
        let s = h * cov * h.transpose() + r;
        let s_inv = s.try_inverse()?;

        // Kalman gain: K = P·Hᵀ·S⁻¹
        let k = cov * h.transpose() * s_inv;

        let new_state = state + k * innovation;

        // Updated covariance: Joseph form P' = (I−KH)·P·(I−KH)ᵀ + K·R·Kᵀ
        let i_kh = StateCov::identity() - k * h;
        let new_cov = i_kh * cov * i_kh.transpose() + k * r * k.transpose();

        Some(KfUpdateResult {
            state: new_state,
            cov: self.condition(&new_cov),
            innovation,
            innovation_cov: s,
            kalman_gain: k,
        })
    }
}

/// Symmetrise `cov` and clamp its eigenvalues to `floor`. A matrix holding
/// NaN or infinity is replaced by `fallback`.
pub fn condition_covariance(cov: &StateCov, floor: f64, fallback: &StateCov) -> StateCov {
    if cov.iter().any(|v| !v.is_finite()) {
        return *fallback;
    }
    let sym = (cov + cov.transpose()) * 0.5;
    let eig = SymmetricEigen::new(sym);
    if eig.eigenvalues.iter().all(|&l| l >= floor) {
        return sym;
    }
    let clamped = eig.eigenvalues.map(|l| if l.is_finite() { l.max(floor) } else { floor });
    let rebuilt = eig.eigenvectors * StateCov::from_diagonal(&clamped) * eig.eigenvectors.transpose();
    (rebuilt + rebuilt.transpose()) * 0.5
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
