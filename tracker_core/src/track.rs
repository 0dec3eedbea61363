//! Track: state, covariance, status, association counters and history.

use crate::types::{Position, StateCov, StateVec, TrackId, TrackReport};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Corrected positions kept per track; older points fall off the front.
pub const HISTORY_LEN: usize = 256;

/// One corrected position on a track's trajectory.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub time: f64,
    pub position: [f64; 2],
}

/// Lifecycle status of a track.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackStatus {
    /// Born from an unmatched detection, not yet confirmed
    Tentative,
    /// Seen on `confirm_hits` consecutive ticks
    Confirmed,
    /// Confirmed track predicting without correction
    Coasting,
    /// Terminal; removed at the end of the tick
    Dead,
}

impl TrackStatus {
    pub fn is_live(self) -> bool {
        self != TrackStatus::Dead
    }
}

/// A single target hypothesis, owned by one node's pipeline.
#[derive(Clone, Debug)]
pub struct Track {
    /// Unique identifier, never reused within a pipeline
    pub id: TrackId,
    /// Estimated state vector [x, y, vx, vy]
    pub state: StateVec,
    /// State estimation covariance
    pub cov: StateCov,
    /// Lifecycle status
    pub status: TrackStatus,
    /// Consecutive successful associations
    pub hit_count: u32,
    /// Consecutive ticks without an associated detection
    pub miss_count: u32,
    /// Total number of updates (for confidence display)
    pub total_hits: u32,
    /// Time of the last corrective update
    pub last_update_time: f64,
    /// Time the current state estimate refers to
    pub state_time: f64,
    /// Time of birth
    pub created_at: f64,
    /// Quality of the most recently associated detection
    pub signal_quality: f64,
    /// Position after birth and after every corrective update
    pub history: VecDeque<HistoryPoint>,
}

impl Track {
    /// Create a new tentative track from an initial state estimate.
    /// Birth counts as the first hit.
    pub fn new(id: TrackId, state: StateVec, cov: StateCov, birth_time: f64) -> Self {
        let mut history = VecDeque::with_capacity(16);
        history.push_back(HistoryPoint {
            time: birth_time,
            position: [state[0], state[1]],
        });
        Self {
            id,
            state,
            cov,
            status: TrackStatus::Tentative,
            hit_count: 1,
            miss_count: 0,
            total_hits: 1,
            last_update_time: birth_time,
            state_time: birth_time,
            created_at: birth_time,
            signal_quality: 0.0,
            history,
        }
    }

    /// Append the current position to the history ring buffer.
    pub fn push_history(&mut self, time: f64) {
        if self.history.len() >= HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(HistoryPoint {
            time,
            position: [self.state[0], self.state[1]],
        });
    }

    /// Distance travelled along the recorded history.
    pub fn path_length(&self) -> f64 {
        self.history
            .iter()
            .zip(self.history.iter().skip(1))
            .map(|(a, b)| (b.position[0] - a.position[0]).hypot(b.position[1] - a.position[1]))
            .sum()
    }

    pub fn position(&self) -> Position {
        Position::new(self.state[0], self.state[1])
    }

    pub fn velocity(&self) -> Position {
        Position::new(self.state[2], self.state[3])
    }

    /// Wire form for the node's track stream.
    pub fn report(&self) -> TrackReport {
        TrackReport {
            track_id: self.id,
            status: self.status,
            position: [self.state[0], self.state[1]],
            velocity: Some([self.state[2], self.state[3]]),
            signal_quality: self.signal_quality,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector4;

    #[test]
    fn history_is_bounded() {
        let mut track = Track::new(TrackId(0), Vector4::zeros(), StateCov::identity(), 0.0);
        for i in 1..=(HISTORY_LEN + 10) {
            track.state[0] = i as f64;
            track.push_history(i as f64);
        }
        assert_eq!(track.history.len(), HISTORY_LEN);
        assert_eq!(track.history.front().map(|p| p.time), Some(11.0));
        assert_eq!(track.history.back().map(|p| p.position), Some([(HISTORY_LEN + 10) as f64, 0.0]));
        assert!((track.path_length() - (HISTORY_LEN - 1) as f64).abs() < 1e-9);
    }
}
