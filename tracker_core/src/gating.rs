//! Gating: determines whether a detection is "close enough" to a predicted
//! track to be considered as a potential association.
//!
//! # Gating criterion
//! - Euclidean: d = ‖z − H·x̂_pred‖
//! - Mahalanobis: d = √(νᵀ S⁻¹ ν), ν = z − H·x̂_pred, S = H·P_pred·Hᵀ + R
//!
//! A pair is a candidate when d ≤ gate distance. The same d is the
//! assignment cost.

use crate::kf::CvKalmanFilter;
use crate::types::{Position, StateCov, StateVec};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Distance used for gating and assignment cost.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    #[default]
    Euclidean,
    Mahalanobis,
}

/// Distance between a predicted track and a detection position.
/// Returns `f64::INFINITY` for a degenerate innovation covariance.
pub fn gate_distance(
    metric: DistanceMetric,
    state: &StateVec,
    cov: &StateCov,
    z: &Position,
    kf: &CvKalmanFilter,
    quality: f64,
) -> f64 {
    let predicted = Position::new(state[0], state[1]);
    let innovation = z - predicted;
    match metric {
        DistanceMetric::Euclidean => innovation.norm(),
        DistanceMetric::Mahalanobis => {
            let h = CvKalmanFilter::observation_matrix();
            let s = h * cov * h.transpose() + kf.measurement_noise(quality);
            match s.try_inverse() {
                Some(s_inv) => innovation.dot(&(s_inv * innovation)).max(0.0).sqrt(),
                None => f64::INFINITY, // degenerate case, reject
            }
        }
    }
}

/// A Uniform Grid spatial index for 2D points.
/// Used to accelerate gating by only checking detections in nearby cells.
pub struct SpatialGrid {
    cell_size: f64,
    /// Maps cell key (ix, iy) to a list of detection indices.
    cells: HashMap<(i64, i64), Vec<usize>>,
}

impl SpatialGrid {
    /// `cell_size` should be at least the Euclidean gate so a 3×3 cell query
    /// never misses a candidate.
    pub fn new(cell_size: f64) -> Self {
        Self {
            cell_size: cell_size.max(f64::MIN_POSITIVE),
            cells: HashMap::new(),
        }
    }

    fn key(&self, x: f64, y: f64) -> (i64, i64) {
        (
            (x / self.cell_size).floor() as i64,
            (y / self.cell_size).floor() as i64,
        )
    }

    /// Insert a detection into the grid at position (x, y).
    pub fn insert(&mut self, idx: usize, x: f64, y: f64) {
        let key = self.key(x, y);
        self.cells.entry(key).or_default().push(idx);
    }

    /// Query detection indices in the cell containing (x, y) and its 8
    /// direct neighbors.
    pub fn query_nearby(&self, x: f64, y: f64) -> Vec<usize> {
        let (ix, iy) = self.key(x, y);

        let mut results = Vec::new();
        for dx in -1..=1 {
            for dy in -1..=1 {
                if let Some(indices) = self.cells.get(&(ix + dx, iy + dy)) {
                    results.extend_from_slice(indices);
                }
            }
        }
        results.sort_unstable();
        results
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kf::KfConfig;
    use approx::assert_abs_diff_eq;
    use nalgebra::Vector4;

    #[test]
    fn euclidean_distance_from_prediction() {
        let kf = CvKalmanFilter::new(KfConfig::default());
        let state = Vector4::new(10.0, 10.0, 0.0, 0.0);
        let d = gate_distance(
            DistanceMetric::Euclidean,
            &state,
            &StateCov::identity(),
            &Position::new(13.0, 14.0),
            &kf,
            0.0,
        );
        assert_abs_diff_eq!(d, 5.0, epsilon = 1e-12);
    }

    #[test]
    fn mahalanobis_shrinks_with_uncertainty() {
        let kf = CvKalmanFilter::new(KfConfig::default());
        let state = Vector4::zeros();
        let z = Position::new(10.0, 0.0);
        let tight = gate_distance(
            DistanceMetric::Mahalanobis,
            &state,
            &(StateCov::identity() * 0.01),
            &z,
            &kf,
            0.0,
        );
        let loose = gate_distance(
            DistanceMetric::Mahalanobis,
            &state,
            &(StateCov::identity() * 100.0),
            &z,
            &kf,
            0.0,
        );
        assert!(loose < tight);
    }

    #[test]
    fn grid_finds_neighbours_only() {
        let mut grid = SpatialGrid::new(10.0);
        grid.insert(0, 1.0, 1.0);
        grid.insert(1, 12.0, 3.0);
        grid.insert(2, 500.0, 500.0);
        let near = grid.query_nearby(0.0, 0.0);
        assert_eq!(near, vec![0, 1]);
    }
}
