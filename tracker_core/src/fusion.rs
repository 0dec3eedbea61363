//! Multi-node fusion: groups same-target tracks reported by different nodes
//! and publishes one quality-weighted fused track per group.
//!
//! # Per-tick steps
//! 1. Flatten the node snapshots into members ordered by (node, track)
//! 2. Union tracks from different nodes within `fusion_distance`
//!    (transitive, so chains merge)
//! 3. Carry fused ids over from the previous tick by contributor overlap
//! 4. Weighted position / velocity and confidence per group

use crate::{
    association::UnionFind,
    gating::SpatialGrid,
    track::TrackStatus,
    types::{FusedId, NodeId, Position, TrackId, TrackReport, TrackSnapshot},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

/// Configuration for the fusion step.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Tracks from different nodes closer than this are the same target
    pub fusion_distance: f64,
    /// Fuse tentative tracks as well as confirmed / coasting ones
    pub include_tentative: bool,
    /// Mean quality at which the quality factor of confidence is 0.5
    pub confidence_quality_ref: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            fusion_distance: 1.0,
            include_tentative: false,
            confidence_quality_ref: 10.0,
        }
    }
}

/// One node track that fed a fused track.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Contributor {
    pub node_id: NodeId,
    pub track_id: TrackId,
    pub signal_quality: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FusedTrack {
    pub fused_id: FusedId,
    pub position: [f64; 2],
    /// `None` when no contributor reported a velocity
    pub velocity: Option<[f64; 2]>,
    /// In `[0, 1)`; grows with the number of nodes and their mean quality
    pub confidence: f64,
    /// Ordered by (node, track)
    pub contributing: Vec<Contributor>,
    pub updated_at: f64,
}

/// Complete fused picture for one tick. Never a delta.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FusedTrackSnapshot {
    pub seq: u64,
    pub timestamp: f64,
    pub tracks: Vec<FusedTrack>,
}

struct Member<'a> {
    node_id: NodeId,
    report: &'a TrackReport,
}

impl Member<'_> {
    fn key(&self) -> (NodeId, TrackId) {
        (self.node_id, self.report.track_id)
    }
}

/// Stateful across ticks only through the fused-id bookkeeping.
#[derive(Debug)]
pub struct FusionAggregator {
    pub config: FusionConfig,
    next_id: u64,
    seq: u64,
    previous: HashMap<(NodeId, TrackId), FusedId>,
}

impl FusionAggregator {
    pub fn new(config: FusionConfig) -> Self {
        Self {
            config,
            next_id: 0,
            seq: 0,
            previous: HashMap::new(),
        }
    }

    /// Fuse and wrap the result in a sequenced snapshot.
    pub fn snapshot(&mut self, snapshots: &[TrackSnapshot], now: f64) -> FusedTrackSnapshot {
        let tracks = self.fuse(snapshots, now);
        self.seq += 1;
        FusedTrackSnapshot {
            seq: self.seq,
            timestamp: now,
            tracks,
        }
    }

    /// Fuse the latest snapshot of every live node. Output is ascending by
    /// fused id.
    pub fn fuse(&mut self, snapshots: &[TrackSnapshot], now: f64) -> Vec<FusedTrack> {
        let members = self.collect_members(snapshots);
        let groups = self.group(&members);
        let ids = self.assign_ids(&members, &groups);

        let mut previous = HashMap::with_capacity(members.len());
        let mut fused: Vec<FusedTrack> = groups
            .iter()
            .zip(ids)
            .map(|(group, fused_id)| {
                for &m in group {
                    previous.insert(members[m].key(), fused_id);
                }
                self.combine(fused_id, group, &members, now)
            })
            .collect();
        self.previous = previous;

        fused.sort_by_key(|f| f.fused_id);
        debug!(members = members.len(), fused = fused.len(), "fusion tick");
        fused
    }

    fn collect_members<'a>(&self, snapshots: &'a [TrackSnapshot]) -> Vec<Member<'a>> {
        let mut members: Vec<Member<'a>> = snapshots
            .iter()
            .flat_map(|snap| {
                snap.tracks.iter().map(move |report| Member {
                    node_id: snap.node_id,
                    report,
                })
            })
            .filter(|m| match m.report.status {
                TrackStatus::Confirmed | TrackStatus::Coasting => true,
                TrackStatus::Tentative => self.config.include_tentative,
                TrackStatus::Dead => false,
            })
            .collect();
        members.sort_by_key(|m| m.key());
        members.dedup_by_key(|m| m.key());
        members
    }

    /// Transitive grouping; groups are ordered by their first member.
    fn group(&self, members: &[Member<'_>]) -> Vec<Vec<usize>> {
        let radius = self.config.fusion_distance;
        let mut uf = UnionFind::new(members.len());

        if radius.is_finite() && radius >= 0.0 {
            // A zero radius still fuses exact coincidences.
            let cell = if radius > 0.0 { radius } else { 1.0 };
            let mut grid = SpatialGrid::new(cell);
            for (i, m) in members.iter().enumerate() {
                grid.insert(i, m.report.position[0], m.report.position[1]);
            }
            for (i, a) in members.iter().enumerate() {
                let pa = a.report.pos();
                for j in grid.query_nearby(pa[0], pa[1]) {
                    let b = &members[j];
                    if j > i && a.node_id != b.node_id && (b.report.pos() - pa).norm() <= radius {
                        uf.union(i, j);
                    }
                }
            }
        }

        let mut slot_of_root: HashMap<usize, usize> = HashMap::new();
        let mut groups: Vec<Vec<usize>> = Vec::new();
        for i in 0..members.len() {
            let root = uf.find(i);
            let slot = *slot_of_root.entry(root).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[slot].push(i);
        }
        groups
    }

    /// Greedy max-overlap carry-over of previous fused ids.
    fn assign_ids(&mut self, members: &[Member<'_>], groups: &[Vec<usize>]) -> Vec<FusedId> {
        // (overlap, fused id, group) candidates
        let mut candidates: Vec<(usize, FusedId, usize)> = Vec::new();
        for (g, group) in groups.iter().enumerate() {
            let mut overlap: HashMap<FusedId, usize> = HashMap::new();
            for &m in group {
                if let Some(&id) = self.previous.get(&members[m].key()) {
                    *overlap.entry(id).or_default() += 1;
                }
            }
            candidates.extend(overlap.into_iter().map(|(id, n)| (n, id, g)));
        }
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        let mut ids: Vec<Option<FusedId>> = vec![None; groups.len()];
        let mut taken: HashSet<FusedId> = HashSet::new();
        for (_, id, g) in candidates {
            if ids[g].is_none() && !taken.contains(&id) {
                ids[g] = Some(id);
                taken.insert(id);
            }
        }

        ids.into_iter()
            .map(|id| {
                id.unwrap_or_else(|| {
                    let id = FusedId(self.next_id);
                    self.next_id += 1;
                    id
                })
            })
            .collect()
    }

    fn combine(
        &self,
        fused_id: FusedId,
        group: &[usize],
        members: &[Member<'_>],
        now: f64,
    ) -> FusedTrack {
        let reports: Vec<&TrackReport> = group.iter().map(|&m| members[m].report).collect();

        let position = weighted_mean(reports.iter().map(|r| (r.signal_quality, r.pos())))
            .unwrap_or_else(Position::zeros);
        let velocity = weighted_mean(reports.iter().filter_map(|r| {
            r.velocity
                .map(|v| (r.signal_quality, Position::new(v[0], v[1])))
        }));

        let nodes: BTreeSet<NodeId> = group.iter().map(|&m| members[m].node_id).collect();
        let mean_quality =
            reports.iter().map(|r| r.signal_quality).sum::<f64>() / reports.len().max(1) as f64;

        FusedTrack {
            fused_id,
            position: [position[0], position[1]],
            velocity: velocity.map(|v| [v[0], v[1]]),
            confidence: confidence(
                nodes.len(),
                mean_quality,
                self.config.confidence_quality_ref,
            ),
            contributing: group
                .iter()
                .map(|&m| Contributor {
                    node_id: members[m].node_id,
                    track_id: members[m].report.track_id,
                    signal_quality: members[m].report.signal_quality,
                })
                .collect(),
            updated_at: now,
        }
    }
}

/// `Σ qᵢ·xᵢ / Σ qᵢ`, or the plain mean when every weight is zero.
fn weighted_mean(items: impl Iterator<Item = (f64, Position)>) -> Option<Position> {
    let mut weighted = Position::zeros();
    let mut plain = Position::zeros();
    let mut total = 0.0;
    let mut n = 0usize;
    for (q, x) in items {
        weighted += x * q;
        plain += x;
        total += q;
        n += 1;
    }
    if n == 0 {
        None
    } else if total > 0.0 {
        Some(weighted / total)
    } else {
        Some(plain / n as f64)
    }
}

/// `(1 − 0.5^nodes) · q̄ / (q̄ + q_ref)`.
pub fn confidence(n_nodes: usize, mean_quality: f64, quality_ref: f64) -> f64 {
    let coverage = 1.0 - 0.5f64.powi(n_nodes.min(i32::MAX as usize) as i32);
    let q = mean_quality.max(0.0);
    let quality = if quality_ref > 0.0 {
        q / (q + quality_ref)
    } else if q > 0.0 {
        1.0
    } else {
        0.0
    };
    (coverage * quality).clamp(0.0, 1.0 - f64::EPSILON)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
