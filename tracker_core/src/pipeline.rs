//! Pipeline orchestrator: the full tracking cycle for one node.
//!
//! # Processing steps per tick
//! 1. Validate the batch (schema, ranges, ordering)
//! 2. Cap the detection count, dropping lowest quality first
//! 3. Predict all live tracks to the batch timestamp
//! 4. Associate (gating + Hungarian per component)
//! 5. KF update for matched pairs, register hits
//! 6. Register misses for unmatched tracks
//! 7. Birth tentative tracks for unmatched detections
//! 8. Prune dead tracks
//! 9. Check invariants; on failure restore the pre-tick checkpoint
//!
//! The order is fixed: lifecycle decisions always see this tick's
//! association result.

use crate::{
    association::{associate, AssociationConfig},
    error::{TrackerError, ValidationError},
    kf::{CvKalmanFilter, KalmanFilter, KfConfig},
    metrics::TickStats,
    track::{Track, TrackStatus},
    track_manager::{TrackManager, TrackManagerConfig, Transition},
    types::{Detection, DetectionBatch, InputLimits, NodeId, Position, TrackSnapshot},
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, collections::HashSet, time::Instant};
use tracing::{debug, error};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Detections kept per tick unless configured otherwise.
pub const DEFAULT_MAX_DETECTIONS_PER_TICK: usize = 512;

/// Configuration for the tracking pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// KF motion / measurement model
    pub kf: KfConfig,
    /// Gating and assignment
    pub association: AssociationConfig,
    /// Track management config
    pub track_manager: TrackManagerConfig,
    /// Cap on detections per tick; `None` = unbounded
    pub max_detections_per_tick: Option<usize>,
    /// Range checks for inbound batches
    pub limits: InputLimits,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            kf: KfConfig::default(),
            association: AssociationConfig::default(),
            track_manager: TrackManagerConfig::default(),
            max_detections_per_tick: Some(DEFAULT_MAX_DETECTIONS_PER_TICK),
            limits: InputLimits::default(),
        }
    }
}

/// Outputs of one pipeline tick.
#[derive(Clone, Debug)]
pub struct PipelineOutput {
    /// All live tracks after this tick, ascending id
    pub tracks: Vec<Track>,
    /// Number of tracks born this tick
    pub births: usize,
    /// Number of tracks confirmed this tick
    pub confirmations: usize,
    /// Number of tracks that died this tick
    pub deletions: usize,
    /// Detections discarded by the per-tick cap
    pub dropped_detections: usize,
    /// Births refused because `max_tracks` was reached
    pub dropped_births: usize,
    /// Wall-clock time of processing
    pub total_time_us: u64,
}

/// Pre-tick state restored on rollback. The id counter is not part of it:
/// ids handed out by an aborted tick stay consumed.
struct Checkpoint {
    tracks: Vec<Track>,
    last_tick_time: Option<f64>,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// One node's tracker: the track arena plus the filter that drives it.
pub struct Pipeline {
    pub config: PipelineConfig,
    node_id: NodeId,
    tracks: Vec<Track>,
    track_manager: TrackManager,
    kf: CvKalmanFilter,
    last_tick_time: Option<f64>,
    stats: TickStats,
}

impl Pipeline {
    /// Create a new pipeline for `node_id`.
    pub fn new(node_id: NodeId, config: PipelineConfig) -> Self {
        let kf = CvKalmanFilter::new(config.kf.clone());
        let track_manager = TrackManager::new(config.track_manager.clone());
        Self {
            config,
            node_id,
            tracks: Vec::new(),
            track_manager,
            kf,
            last_tick_time: None,
            stats: TickStats::default(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Live tracks, ascending id.
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn stats(&self) -> &TickStats {
        &self.stats
    }

    /// Node-stamped wire snapshot of the current live tracks.
    pub fn snapshot(&self) -> TrackSnapshot {
        TrackSnapshot {
            node_id: self.node_id,
            timestamp: self.last_tick_time.unwrap_or(0.0),
            tracks: self.tracks.iter().map(Track::report).collect(),
        }
    }

    /// Process one detection batch. On error the track table is exactly as
    /// it was before the call.
    pub fn tick(&mut self, batch: &DetectionBatch) -> Result<PipelineOutput, TrackerError> {
        if let Err(e) = self.validate(batch) {
            self.stats.rejected_batches += 1;
            return Err(e.into());
        }

        let checkpoint = Checkpoint {
            tracks: self.tracks.clone(),
            last_tick_time: self.last_tick_time,
        };

        match self.run_tick(batch) {
            Ok(out) => {
                self.stats.record(&out);
                Ok(out)
            }
            Err(e) => {
                error!(node = %self.node_id, error = %e, "tick aborted, restoring previous track table");
                self.tracks = checkpoint.tracks;
                self.last_tick_time = checkpoint.last_tick_time;
                self.stats.rollbacks += 1;
                Err(e)
            }
        }
    }

    fn validate(&self, batch: &DetectionBatch) -> Result<(), ValidationError> {
        if batch.node_id != self.node_id {
            return Err(ValidationError::NodeMismatch {
                expected: self.node_id,
                found: batch.node_id,
            });
        }
        batch.validate(&self.config.limits)?;
        if let Some(last) = self.last_tick_time {
            if batch.timestamp < last {
                return Err(ValidationError::OutOfOrder {
                    last,
                    got: batch.timestamp,
                });
            }
        }
        Ok(())
    }

    fn run_tick(&mut self, batch: &DetectionBatch) -> Result<PipelineOutput, TrackerError> {
        let start = Instant::now();
        let batch_time = batch.timestamp;
        self.last_tick_time = Some(batch_time);

        // ----------------------------------------------------------------
        // Cap detections
        // ----------------------------------------------------------------
        let (detections, dropped_detections) =
            cap_detections(&batch.detections, self.config.max_detections_per_tick);
        if dropped_detections > 0 {
            debug!(node = %self.node_id, dropped = dropped_detections, "detection cap exceeded");
        }

        // ----------------------------------------------------------------
        // Predict all tracks to batch_time (Parallel)
        // ----------------------------------------------------------------
        let kf = &self.kf;
        self.tracks.par_iter_mut().for_each(|track| {
            let dt = batch_time - track.state_time;
            if dt > 0.0 {
                let (new_state, new_cov) = kf.predict(&track.state, &track.cov, dt);
                track.state = new_state;
                track.cov = new_cov;
                track.state_time = batch_time;
            }
        });
        self.tracks.sort_by_key(|t| t.id);

        // ----------------------------------------------------------------
        // Association
        // ----------------------------------------------------------------
        let assignment = associate(&self.tracks, &detections, &self.config.association, kf);

        // ----------------------------------------------------------------
        // KF update + hits
        // ----------------------------------------------------------------
        let mut confirmations = 0;
        let mut deletions = 0;
        let mut missed = assignment.unmatched_tracks.clone();

        for &(ti, mi) in &assignment.pairs {
            let det = &detections[mi];
            let track = &mut self.tracks[ti];
            match self.kf.update(&track.state, &track.cov, &det.pos(), det.signal_quality) {
                Some(res) => {
                    track.state = res.state;
                    track.cov = res.cov;
                    track.last_update_time = batch_time;
                    track.signal_quality = det.signal_quality;
                    track.push_history(batch_time);
                    if self.track_manager.register_hit(track) == Transition::Confirmed {
                        confirmations += 1;
                    }
                }
                None => missed.push(ti),
            }
        }

        // ----------------------------------------------------------------
        // Misses
        // ----------------------------------------------------------------
        for &ti in &missed {
            if self.track_manager.register_miss(&mut self.tracks[ti]) == Transition::Died {
                deletions += 1;
            }
        }

        // ----------------------------------------------------------------
        // Births for unmatched detections
        // ----------------------------------------------------------------
        let mut unmatched: Vec<&Detection> =
            assignment.unmatched_meas.iter().map(|&mi| &detections[mi]).collect();
        unmatched.sort_by(|a, b| by_quality_desc(a, b));

        let mut live = self.tracks.iter().filter(|t| t.status.is_live()).count();
        let merge_radius = self.config.track_manager.spawn_merge_radius;
        let mut spawned: Vec<Position> = Vec::new();
        let mut births = 0;
        let mut dropped_births = 0;

        for det in unmatched {
            let pos = det.pos();
            if spawned.iter().any(|p| (p - pos).norm() <= merge_radius) {
                continue;
            }
            if live >= self.config.track_manager.max_tracks {
                dropped_births += 1;
                continue;
            }
            let track = self.track_manager.birth_track(det, batch_time);
            if track.status == TrackStatus::Confirmed {
                confirmations += 1;
            }
            spawned.push(pos);
            self.tracks.push(track);
            live += 1;
            births += 1;
        }
        if dropped_births > 0 {
            debug!(node = %self.node_id, dropped = dropped_births, "track table full");
        }

        // ----------------------------------------------------------------
        // Prune dead tracks
        // ----------------------------------------------------------------
        TrackManager::prune_dead(&mut self.tracks);

        self.check_invariants()?;

        Ok(PipelineOutput {
            tracks: self.tracks.clone(),
            births,
            confirmations,
            deletions,
            dropped_detections,
            dropped_births,
            total_time_us: start.elapsed().as_micros() as u64,
        })
    }

    fn check_invariants(&self) -> Result<(), TrackerError> {
        let mut ids = HashSet::with_capacity(self.tracks.len());
        for t in &self.tracks {
            if !ids.insert(t.id) {
                return Err(TrackerError::DuplicateTrackId(t.id));
            }
            if t.state.iter().any(|v| !v.is_finite()) {
                return Err(TrackerError::NonFiniteState(t.id));
            }
        }
        Ok(())
    }

    /// Reset: clear all tracks. Ids keep increasing.
    pub fn reset(&mut self) {
        self.tracks.clear();
        self.last_tick_time = None;
    }

    #[cfg(test)]
    pub(crate) fn tracks_mut(&mut self) -> &mut Vec<Track> {
        &mut self.tracks
    }
}

/// Higher quality first; among equals the newer observation, then the lower id.
fn by_quality_desc(a: &Detection, b: &Detection) -> Ordering {
    b.signal_quality
        .total_cmp(&a.signal_quality)
        .then(b.observed_at.total_cmp(&a.observed_at))
        .then(a.detection_id.cmp(&b.detection_id))
}

/// Keep at most `cap` detections, dropping lowest quality first (oldest
/// first among equal quality). Output is ascending by detection id.
fn cap_detections(detections: &[Detection], cap: Option<usize>) -> (Vec<Detection>, usize) {
    let mut kept: Vec<Detection> = detections.to_vec();
    let mut dropped = 0;
    if let Some(cap) = cap {
        if kept.len() > cap {
            kept.sort_by(by_quality_desc);
            dropped = kept.len() - cap;
            kept.truncate(cap);
        }
    }
    kept.sort_by_key(|d| d.detection_id);
    (kept, dropped)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DetectionId, TrackId};
    use approx::assert_abs_diff_eq;

    fn det(id: u64, x: f64, y: f64, q: f64, t: f64) -> Detection {
        Detection {
            detection_id: DetectionId(id),
            source_node_id: NodeId(1),
            position: [x, y],
            signal_quality: q,
            observed_at: t,
        }
    }

    fn batch(t: f64, points: &[(f64, f64, f64)]) -> DetectionBatch {
        let detections = points
            .iter()
            .enumerate()
            .map(|(i, &(x, y, q))| det(i as u64, x, y, q, t))
            .collect();
        DetectionBatch::new(NodeId(1), t, detections)
    }

    fn pipeline(confirm_hits: u32, max_coast: u32, gate: f64) -> Pipeline {
        Pipeline::new(
            NodeId(1),
            PipelineConfig {
                kf: KfConfig {
                    process_noise: [0.01, 0.01, 0.01, 0.01],
                    measurement_noise_std: 0.1,
                    ..Default::default()
                },
                association: AssociationConfig {
                    gate_distance: gate,
                    ..Default::default()
                },
                track_manager: TrackManagerConfig {
                    confirm_hits,
                    max_coast,
                    init_pos_std: 0.1,
                    init_vel_std: 100.0,
                    ..Default::default()
                },
                ..Default::default()
            },
        )
    }

    #[test]
    fn two_detection_velocity_estimate() {
        let mut p = pipeline(3, 2, 5.0);
        p.tick(&batch(0.0, &[(10.0, 20.0, 20.0)])).unwrap();
        let out = p.tick(&batch(1.0, &[(11.0, 20.1, 25.0)])).unwrap();

        assert_eq!(out.tracks.len(), 1);
        let track = &out.tracks[0];
        assert_eq!(track.status, TrackStatus::Tentative);
        assert_eq!(track.hit_count, 2);
        assert_abs_diff_eq!(track.velocity()[0], 1.0, epsilon = 0.05);
        assert_abs_diff_eq!(track.velocity()[1], 0.1, epsilon = 0.05);
        assert_abs_diff_eq!(track.position()[0], 11.0, epsilon = 0.05);
    }

    #[test]
    fn confirm_then_coast_then_die() {
        let mut p = pipeline(3, 2, 5.0);
        for t in 0..3 {
            p.tick(&batch(t as f64, &[(t as f64, 0.0, 10.0)])).unwrap();
        }
        assert_eq!(p.tracks()[0].status, TrackStatus::Confirmed);

        // Two misses coast, the third kills (max_coast = 2).
        p.tick(&batch(3.0, &[])).unwrap();
        assert_eq!(p.tracks()[0].status, TrackStatus::Coasting);
        p.tick(&batch(4.0, &[])).unwrap();
        assert_eq!(p.tracks()[0].miss_count, 2);
        let out = p.tick(&batch(5.0, &[])).unwrap();
        assert_eq!(out.deletions, 1);
        assert!(out.tracks.is_empty());
        assert!(p.snapshot().tracks.is_empty());
    }

    #[test]
    fn history_records_corrected_positions_only() {
        let mut p = pipeline(2, 5, 5.0);
        p.tick(&batch(0.0, &[(0.0, 0.0, 10.0)])).unwrap();
        p.tick(&batch(1.0, &[(1.0, 0.0, 10.0)])).unwrap();
        p.tick(&batch(2.0, &[])).unwrap();
        p.tick(&batch(3.0, &[(3.0, 0.0, 10.0)])).unwrap();

        let times: Vec<f64> = p.tracks()[0].history.iter().map(|h| h.time).collect();
        assert_eq!(times, vec![0.0, 1.0, 3.0]);
        assert_abs_diff_eq!(p.tracks()[0].path_length(), 3.0, epsilon = 0.1);
    }

    #[test]
    fn coasting_track_predicts_forward() {
        let mut p = pipeline(2, 5, 5.0);
        p.tick(&batch(0.0, &[(0.0, 0.0, 10.0)])).unwrap();
        p.tick(&batch(1.0, &[(2.0, 0.0, 10.0)])).unwrap();
        p.tick(&batch(2.0, &[])).unwrap();
        let t = &p.tracks()[0];
        assert_eq!(t.status, TrackStatus::Coasting);
        assert!(t.position()[0] > 2.5, "coasting keeps moving: {}", t.position()[0]);
        assert_eq!(t.last_update_time, 1.0);
    }

    #[test]
    fn tentative_track_dies_on_miss() {
        let mut p = pipeline(3, 5, 5.0);
        p.tick(&batch(0.0, &[(0.0, 0.0, 10.0)])).unwrap();
        let out = p.tick(&batch(1.0, &[(100.0, 100.0, 10.0)])).unwrap();
        // Old tentative died, far detection spawned a new one.
        assert_eq!(out.deletions, 1);
        assert_eq!(out.births, 1);
        assert_eq!(out.tracks.len(), 1);
        assert_eq!(out.tracks[0].id, TrackId(1));
    }

    #[test]
    fn jittered_duplicates_spawn_once() {
        let mut p = pipeline(3, 5, 5.0);
        let out = p
            .tick(&batch(0.0, &[(5.0, 5.0, 10.0), (5.2, 5.1, 12.0), (40.0, 0.0, 3.0)]))
            .unwrap();
        assert_eq!(out.births, 2);
        // The stronger of the two jittered detections seeds the track.
        assert_abs_diff_eq!(out.tracks[0].position()[0], 5.2, epsilon = 1e-9);
    }

    #[test]
    fn detection_cap_drops_lowest_quality() {
        let mut p = pipeline(3, 5, 5.0);
        p.config.max_detections_per_tick = Some(2);
        let out = p
            .tick(&batch(0.0, &[(0.0, 0.0, 1.0), (10.0, 0.0, 9.0), (20.0, 0.0, 5.0)]))
            .unwrap();
        assert_eq!(out.dropped_detections, 1);
        let xs: Vec<f64> = out.tracks.iter().map(|t| t.position()[0]).collect();
        assert_eq!(xs, vec![10.0, 20.0]);
        assert_eq!(p.stats().dropped_detections, 1);
    }

    #[test]
    fn track_cap_refuses_births() {
        let mut p = pipeline(3, 5, 5.0);
        p.config.track_manager.max_tracks = 1;
        let out = p.tick(&batch(0.0, &[(0.0, 0.0, 1.0), (50.0, 0.0, 9.0)])).unwrap();
        assert_eq!(out.births, 1);
        assert_eq!(out.dropped_births, 1);
    }

    #[test]
    fn out_of_order_batch_is_rejected_without_mutation() {
        let mut p = pipeline(3, 5, 5.0);
        p.tick(&batch(5.0, &[(0.0, 0.0, 1.0)])).unwrap();
        let err = p.tick(&batch(4.0, &[(0.0, 0.0, 1.0)])).unwrap_err();
        assert!(matches!(
            err,
            TrackerError::Validation(ValidationError::OutOfOrder { .. })
        ));
        assert!(!err.is_fatal());
        assert_eq!(p.tracks()[0].hit_count, 1);
        assert_eq!(p.stats().rejected_batches, 1);
    }

    #[test]
    fn invariant_violation_rolls_back() {
        let mut p = pipeline(3, 5, 5.0);
        p.tick(&batch(0.0, &[(0.0, 0.0, 1.0)])).unwrap();
        let dup = p.tracks()[0].clone();
        let mut far = dup.clone();
        far.state[0] = 500.0;
        far.status = TrackStatus::Confirmed;
        p.tracks_mut().push(far);
        let before: Vec<(TrackId, f64)> = p.tracks().iter().map(|t| (t.id, t.state[0])).collect();

        let err = p.tick(&batch(1.0, &[(0.0, 0.0, 1.0), (200.0, 0.0, 1.0)])).unwrap_err();
        assert_eq!(err, TrackerError::DuplicateTrackId(dup.id));
        assert!(err.is_fatal());

        let after: Vec<(TrackId, f64)> = p.tracks().iter().map(|t| (t.id, t.state[0])).collect();
        assert_eq!(before, after);
        assert_eq!(p.stats().rollbacks, 1);

        // The aborted birth used id 1; it is never handed out again.
        p.tracks_mut().truncate(1);
        let out = p.tick(&batch(1.0, &[(0.0, 0.0, 1.0), (200.0, 0.0, 1.0)])).unwrap();
        assert_eq!(out.tracks.last().map(|t| t.id), Some(TrackId(2)));
        assert!(out.tracks.iter().all(|t| t.id != TrackId(1)));
    }

    #[test]
    fn default_config_caps_detections() {
        let mut p = Pipeline::new(NodeId(1), PipelineConfig::default());
        let n = DEFAULT_MAX_DETECTIONS_PER_TICK + 100;
        let points: Vec<(f64, f64, f64)> = (0..n)
            .map(|i| ((i % 50) as f64 * 20.0, (i / 50) as f64 * 20.0, 1.0 + (i % 7) as f64))
            .collect();
        let out = p.tick(&batch(0.0, &points)).unwrap();
        assert_eq!(out.dropped_detections, 100);
        assert!(out.births <= DEFAULT_MAX_DETECTIONS_PER_TICK);
        assert_eq!(p.stats().dropped_detections, 100);
    }

    #[test]
    fn empty_batch_is_a_valid_tick() {
        let mut p = pipeline(1, 1, 5.0);
        p.tick(&batch(0.0, &[(1.0, 1.0, 1.0)])).unwrap();
        let out = p.tick(&batch(1.0, &[])).unwrap();
        assert_eq!(out.tracks[0].status, TrackStatus::Coasting);
    }
}
