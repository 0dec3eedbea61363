//! Fundamental types used across the entire workspace.
//!
//! All geometry lives in one shared 2-D Cartesian frame (meters). Producers
//! convert range/bearing or range/Doppler into this frame before emission.

use crate::error::ValidationError;
use crate::track::TrackStatus;
use nalgebra::{Matrix4, Vector2, Vector4};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

// ---------------------------------------------------------------------------
// Scalar type: use f64 throughout for numerical precision in Kalman filter.
// ---------------------------------------------------------------------------

/// 4-DOF state vector: [x, y, vx, vy]
pub type StateVec = Vector4<f64>;

/// 4×4 state covariance matrix
pub type StateCov = Matrix4<f64>;

/// 2-D position or velocity in the shared frame
pub type Position = Vector2<f64>;

// ---------------------------------------------------------------------------
// Identifier types: newtype wrappers so IDs are never confused at compile time
// ---------------------------------------------------------------------------

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TrackId(pub u64);

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DetectionId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FusedId(pub u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.0)
    }
}

impl fmt::Display for DetectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "D{}", self.0)
    }
}

impl fmt::Display for FusedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "F{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Validation limits
// ---------------------------------------------------------------------------

/// Range checks applied to every inbound batch before it enters the core.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct InputLimits {
    /// Largest accepted |x| or |y| (meters)
    pub max_abs_coordinate: f64,
    /// Largest accepted signal quality (dB)
    pub max_signal_quality: f64,
}

impl Default for InputLimits {
    fn default() -> Self {
        Self {
            max_abs_coordinate: 1.0e7,
            max_signal_quality: 1.0e3,
        }
    }
}

fn check_position(position: [f64; 2], limits: &InputLimits) -> Result<(), ValidationError> {
    for v in position {
        if !v.is_finite() {
            return Err(ValidationError::NonFinite("position"));
        }
        if v.abs() > limits.max_abs_coordinate {
            return Err(ValidationError::OutOfRange {
                field: "position",
                value: v,
            });
        }
    }
    Ok(())
}

fn check_quality(quality: f64, limits: &InputLimits) -> Result<(), ValidationError> {
    if !quality.is_finite() {
        return Err(ValidationError::NonFinite("signal_quality"));
    }
    if quality < 0.0 || quality > limits.max_signal_quality {
        return Err(ValidationError::OutOfRange {
            field: "signal_quality",
            value: quality,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// A single observation produced by one sensor node's detector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Unique per node per cycle
    pub detection_id: DetectionId,
    /// Which node produced this detection
    pub source_node_id: NodeId,
    /// [x, y] in the shared metric frame
    pub position: [f64; 2],
    /// Non-negative strength, e.g. SNR in dB
    pub signal_quality: f64,
    /// Monotonic observation time (seconds)
    pub observed_at: f64,
}

impl Detection {
    pub fn pos(&self) -> Position {
        Position::new(self.position[0], self.position[1])
    }

    pub fn validate(&self, limits: &InputLimits) -> Result<(), ValidationError> {
        check_position(self.position, limits)?;
        check_quality(self.signal_quality, limits)?;
        if !self.observed_at.is_finite() {
            return Err(ValidationError::NonFinite("observed_at"));
        }
        Ok(())
    }
}

/// All detections one node produced for one tick.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionBatch {
    pub node_id: NodeId,
    /// Tick time (seconds, node monotonic clock)
    pub timestamp: f64,
    pub detections: Vec<Detection>,
}

impl DetectionBatch {
    pub fn new(node_id: NodeId, timestamp: f64, detections: Vec<Detection>) -> Self {
        Self {
            node_id,
            timestamp,
            detections,
        }
    }

    /// Schema and range checks. Does not look at tracker state.
    pub fn validate(&self, limits: &InputLimits) -> Result<(), ValidationError> {
        if !self.timestamp.is_finite() {
            return Err(ValidationError::NonFinite("timestamp"));
        }
        let mut seen = HashSet::with_capacity(self.detections.len());
        for det in &self.detections {
            if det.source_node_id != self.node_id {
                return Err(ValidationError::NodeMismatch {
                    expected: self.node_id,
                    found: det.source_node_id,
                });
            }
            if !seen.insert(det.detection_id) {
                return Err(ValidationError::DuplicateDetectionId(det.detection_id));
            }
            det.validate(limits)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Track stream (node → fusion)
// ---------------------------------------------------------------------------

/// Wire form of one live track, as published by a node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackReport {
    pub track_id: TrackId,
    pub status: TrackStatus,
    pub position: [f64; 2],
    #[serde(default)]
    pub velocity: Option<[f64; 2]>,
    pub signal_quality: f64,
}

impl TrackReport {
    pub fn pos(&self) -> Position {
        Position::new(self.position[0], self.position[1])
    }

    pub fn validate(&self, limits: &InputLimits) -> Result<(), ValidationError> {
        check_position(self.position, limits)?;
        if let Some(v) = self.velocity {
            if !v[0].is_finite() || !v[1].is_finite() {
                return Err(ValidationError::NonFinite("velocity"));
            }
        }
        if self.status == TrackStatus::Dead {
            return Err(ValidationError::DeadTrackReported(self.track_id));
        }
        check_quality(self.signal_quality, limits)
    }
}

/// Consistent node-stamped set of live tracks after one tick.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackSnapshot {
    pub node_id: NodeId,
    pub timestamp: f64,
    pub tracks: Vec<TrackReport>,
}

impl TrackSnapshot {
    pub fn empty(node_id: NodeId, timestamp: f64) -> Self {
        Self {
            node_id,
            timestamp,
            tracks: Vec::new(),
        }
    }

    pub fn validate(&self, limits: &InputLimits) -> Result<(), ValidationError> {
        if !self.timestamp.is_finite() {
            return Err(ValidationError::NonFinite("timestamp"));
        }
        let mut seen = HashSet::with_capacity(self.tracks.len());
        for t in &self.tracks {
            if !seen.insert(t.track_id) {
                return Err(ValidationError::DuplicateTrackId(t.track_id));
            }
            t.validate(limits)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
