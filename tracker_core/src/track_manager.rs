//! Track lifecycle management: birth, confirmation, coasting, death.
//!
//! # Track Management Policy
//! - **Birth**: each unmatched detection spawns a tentative track, unless it
//!   lies within `spawn_merge_radius` of a track already born this tick.
//! - **Confirmation**: a tentative track is confirmed once
//!   `hit_count >= confirm_hits`.
//! - **Tentative miss**: a single miss kills an unconfirmed track.
//! - **Coasting**: a confirmed track that misses starts coasting and goes
//!   back to confirmed on its next hit.
//! - **Death**: a coasting track dies once `miss_count > max_coast`.

use crate::{
    track::{Track, TrackStatus},
    types::{Detection, StateCov, TrackId},
};
use nalgebra::Vector4;
use serde::{Deserialize, Serialize};

/// Configuration for track management policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackManagerConfig {
    /// Consecutive hits required for confirmation (`N_confirm`)
    pub confirm_hits: u32,
    /// Consecutive misses a coasting track survives (`N_coast_max`)
    pub max_coast: u32,
    /// Initial position uncertainty (1σ in meters)
    pub init_pos_std: f64,
    /// Initial velocity uncertainty (1σ in m/s)
    pub init_vel_std: f64,
    /// Unmatched detections this close to a fresh birth are not spawned
    pub spawn_merge_radius: f64,
    /// Upper bound on live tracks per node
    pub max_tracks: usize,
}

impl Default for TrackManagerConfig {
    fn default() -> Self {
        Self {
            confirm_hits: 3,
            max_coast: 5,
            init_pos_std: 1.0,
            init_vel_std: 100.0,
            spawn_merge_radius: 0.5,
            max_tracks: 256,
        }
    }
}

/// Outcome of registering a hit or miss, for per-tick counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    None,
    Confirmed,
    StartedCoasting,
    Recovered,
    Died,
}

/// Owns the track id sequence and applies the lifecycle state machine.
#[derive(Clone, Debug)]
pub struct TrackManager {
    pub config: TrackManagerConfig,
    next_id: u64,
}

impl TrackManager {
    pub fn new(config: TrackManagerConfig) -> Self {
        Self { config, next_id: 0 }
    }

    fn next_track_id(&mut self) -> TrackId {
        let id = TrackId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Create a new track from an unmatched detection at zero velocity.
    pub fn birth_track(&mut self, det: &Detection, current_time: f64) -> Track {
        let id = self.next_track_id();
        let state = Vector4::new(det.position[0], det.position[1], 0.0, 0.0);
        let ps = self.config.init_pos_std * self.config.init_pos_std;
        let vs = self.config.init_vel_std * self.config.init_vel_std;
        let cov = StateCov::from_diagonal(&Vector4::new(ps, ps, vs, vs));

        let mut track = Track::new(id, state, cov, current_time);
        track.signal_quality = det.signal_quality;
        if track.hit_count >= self.config.confirm_hits {
            track.status = TrackStatus::Confirmed;
        }
        track
    }

    /// Call after a track received an update (hit). Update status if needed.
    pub fn register_hit(&self, track: &mut Track) -> Transition {
        track.miss_count = 0;
        track.hit_count = track.hit_count.saturating_add(1);
        track.total_hits = track.total_hits.saturating_add(1);
        match track.status {
            TrackStatus::Tentative if track.hit_count >= self.config.confirm_hits => {
                track.status = TrackStatus::Confirmed;
                Transition::Confirmed
            }
            TrackStatus::Coasting => {
                track.status = TrackStatus::Confirmed;
                Transition::Recovered
            }
            _ => Transition::None,
        }
    }

    /// Call after a track received no update (miss).
    pub fn register_miss(&self, track: &mut Track) -> Transition {
        track.miss_count = track.miss_count.saturating_add(1);
        track.hit_count = 0;
        match track.status {
            TrackStatus::Tentative => {
                track.status = TrackStatus::Dead;
                Transition::Died
            }
            TrackStatus::Confirmed | TrackStatus::Coasting => {
                if track.miss_count > self.config.max_coast {
                    track.status = TrackStatus::Dead;
                    Transition::Died
                } else if track.status == TrackStatus::Confirmed {
                    track.status = TrackStatus::Coasting;
                    Transition::StartedCoasting
                } else {
                    Transition::None
                }
            }
            TrackStatus::Dead => Transition::None,
        }
    }

    /// Remove all dead tracks. Returns count of removed tracks.
    pub fn prune_dead(tracks: &mut Vec<Track>) -> usize {
        let before = tracks.len();
        tracks.retain(|t| t.status != TrackStatus::Dead);
        before - tracks.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
