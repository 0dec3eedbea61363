//! Data association: bipartite graph construction, connected-component
//! partitioning (union-find), and Hungarian assignment.
//!
//! # Algorithm pipeline
//! 1. For each (track, detection) pair that passed gating, add an edge
//!    to the sparse bipartite graph.
//! 2. Partition the graph into **connected components** using union-find.
//!    Components are independent and are solved one by one.
//! 3. Solve each component with the **Hungarian algorithm** (Jonker-Volgenant
//!    style O(n³) implementation).
//!
//! Tracks and detections are indexed in ascending `track_id` /
//! `detection_id` order; the solver prefers lower row and column indices on
//! equal cost, so ties resolve toward the lowest ids.

use crate::{
    gating::{gate_distance, DistanceMetric, SpatialGrid},
    kf::CvKalmanFilter,
    track::Track,
    types::Detection,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Configuration for the association step.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AssociationConfig {
    /// Pairs further apart than this are never matched (metric units)
    pub gate_distance: f64,
    /// Euclidean (meters) or Mahalanobis (σ) distance
    pub metric: DistanceMetric,
    /// Cost of leaving a row or column unassigned. Must exceed any gated
    /// cost so that the solver maximises the number of matches first.
    pub dummy_cost: f64,
}

impl Default for AssociationConfig {
    fn default() -> Self {
        Self {
            gate_distance: 5.0,
            metric: DistanceMetric::Euclidean,
            dummy_cost: 1.0e6,
        }
    }
}

// ---------------------------------------------------------------------------
// Bipartite graph
// ---------------------------------------------------------------------------

/// An edge in the dense assignment cost matrix.
#[derive(Clone, Debug)]
pub struct AssignEdge {
    pub track_idx: usize,
    pub meas_idx: usize,
    /// Gate distance (used as cost)
    pub cost: f64,
}

/// Sparse bipartite graph: edges between track indices and detection indices.
#[derive(Clone, Debug, Default)]
pub struct BipartiteGraph {
    pub edges: Vec<AssignEdge>,
    pub n_tracks: usize,
    pub n_meas: usize,
}

impl BipartiteGraph {
    pub fn new(n_tracks: usize, n_meas: usize) -> Self {
        Self {
            edges: Vec::new(),
            n_tracks,
            n_meas,
        }
    }

    /// Add an edge (gate-passed association candidate).
    pub fn add_edge(&mut self, track_idx: usize, meas_idx: usize, cost: f64) {
        self.edges.push(AssignEdge {
            track_idx,
            meas_idx,
            cost,
        });
    }
}

// ---------------------------------------------------------------------------
// Union-Find (path halving + union by rank)
// ---------------------------------------------------------------------------

pub(crate) struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    pub(crate) fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    pub(crate) fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]]; // path halving
            x = self.parent[x];
        }
        x
    }

    pub(crate) fn union(&mut self, x: usize, y: usize) {
        let rx = self.find(x);
        let ry = self.find(y);
        if rx == ry {
            return;
        }
        match self.rank[rx].cmp(&self.rank[ry]) {
            std::cmp::Ordering::Less => self.parent[rx] = ry,
            std::cmp::Ordering::Greater => self.parent[ry] = rx,
            std::cmp::Ordering::Equal => {
                self.parent[ry] = rx;
                self.rank[rx] += 1;
            }
        }
    }
}

/// A single connected component in the bipartite graph.
#[derive(Clone, Debug)]
pub struct Component {
    pub track_indices: Vec<usize>,
    pub meas_indices: Vec<usize>,
    pub edges: Vec<AssignEdge>,
}

/// Partition the bipartite graph into connected components, ordered by
/// their smallest track index.
///
/// We treat tracks and detections as nodes in a combined graph:
/// - Track i     → node i
/// - Detection j → node n_tracks + j
pub fn partition_components(graph: &BipartiteGraph) -> Vec<Component> {
    let n_total = graph.n_tracks + graph.n_meas;
    let mut uf = UnionFind::new(n_total);

    for e in &graph.edges {
        uf.union(e.track_idx, graph.n_tracks + e.meas_idx);
    }

    // Group edges by component root
    let mut comp_map: BTreeMap<usize, Component> = BTreeMap::new();
    for e in &graph.edges {
        let root = uf.find(e.track_idx);
        let comp = comp_map.entry(root).or_insert_with(|| Component {
            track_indices: Vec::new(),
            meas_indices: Vec::new(),
            edges: Vec::new(),
        });
        comp.edges.push(e.clone());
    }

    // Fill track and detection index lists (deduplicated)
    for comp in comp_map.values_mut() {
        comp.track_indices = comp.edges.iter().map(|e| e.track_idx).collect();
        comp.track_indices.sort_unstable();
        comp.track_indices.dedup();
        comp.meas_indices = comp.edges.iter().map(|e| e.meas_idx).collect();
        comp.meas_indices.sort_unstable();
        comp.meas_indices.dedup();
    }

    let mut comps: Vec<Component> = comp_map.into_values().collect();
    comps.sort_by_key(|c| c.track_indices[0]);
    comps
}

// ---------------------------------------------------------------------------
// Hungarian algorithm, O(n³) Kuhn-Munkres
// ---------------------------------------------------------------------------

/// Assignment result: (track_idx, meas_idx) matched pairs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Assignment {
    pub pairs: Vec<(usize, usize)>,
    /// Track indices that were NOT matched (missed detections)
    pub unmatched_tracks: Vec<usize>,
    /// Detection indices not matched (new targets or clutter)
    pub unmatched_meas: Vec<usize>,
}

/// Solve the assignment problem for a single component using the Hungarian
/// algorithm on a padded square cost matrix.
///
/// Missing edges and padding cells cost `dummy_cost`; a row that lands on
/// such a cell is reported unmatched.
pub fn hungarian_solve(component: &Component, dummy_cost: f64) -> Assignment {
    let nt = component.track_indices.len();
    let nm = component.meas_indices.len();

    if nt == 0 || nm == 0 {
        return Assignment {
            pairs: vec![],
            unmatched_tracks: component.track_indices.clone(),
            unmatched_meas: component.meas_indices.clone(),
        };
    }

    let n = nt.max(nm);
    let mut cost = vec![dummy_cost; n * n];
    let mut real = vec![false; n * n];

    for e in &component.edges {
        // Index lists are sorted, so binary search gives the local row/col.
        if let (Ok(ri), Ok(ci)) = (
            component.track_indices.binary_search(&e.track_idx),
            component.meas_indices.binary_search(&e.meas_idx),
        ) {
            cost[ri * n + ci] = e.cost;
            real[ri * n + ci] = true;
        }
    }

    let row_assign = run_hungarian(&cost, n);

    let mut pairs = Vec::new();
    let mut unmatched_tracks = Vec::new();
    let mut matched_meas = vec![false; nm];

    for (ri, &ci) in row_assign.iter().enumerate().take(nt) {
        if ci < nm && real[ri * n + ci] {
            pairs.push((component.track_indices[ri], component.meas_indices[ci]));
            matched_meas[ci] = true;
        } else {
            unmatched_tracks.push(component.track_indices[ri]);
        }
    }

    let unmatched_meas: Vec<usize> = (0..nm)
        .filter(|&j| !matched_meas[j])
        .map(|j| component.meas_indices[j])
        .collect();

    Assignment {
        pairs,
        unmatched_tracks,
        unmatched_meas,
    }
}

/// Core Hungarian algorithm on a square n×n cost matrix (row-major).
/// Returns row_assignment[row] = assigned_column.
fn run_hungarian(cost: &[f64], n: usize) -> Vec<usize> {
    // Potentials for rows (u) and columns (v)
    let mut u = vec![0.0f64; n + 1];
    let mut v = vec![0.0f64; n + 1];
    // p[j] = row assigned to column j (1-indexed, 0 = none)
    let mut p = vec![0usize; n + 1];
    // way[j] = previous column in augmenting path
    let mut way = vec![0usize; n + 1];

    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0usize;
        let mut minv = vec![f64::INFINITY; n + 1];
        let mut used = vec![false; n + 1];

        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0;
            for j in 1..=n {
                if !used[j] {
                    let val = cost[(i0 - 1) * n + (j - 1)] - u[i0] - v[j];
                    if val < minv[j] {
                        minv[j] = val;
                        way[j] = j0;
                    }
                    if minv[j] < delta {
                        delta = minv[j];
                        j1 = j;
                    }
                }
            }
            for j in 0..=n {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }
            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }

        // Augment
        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut row_assign = vec![0usize; n];
    for j in 1..=n {
        if p[j] != 0 {
            row_assign[p[j] - 1] = j - 1;
        }
    }
    row_assign
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Match predicted `tracks` against `detections`.
///
/// Both slices must already be sorted by id; returned indices refer to them.
pub fn associate(
    tracks: &[Track],
    detections: &[Detection],
    config: &AssociationConfig,
    kf: &CvKalmanFilter,
) -> Assignment {
    let n_tracks = tracks.len();
    let n_meas = detections.len();

    // Euclidean gates are in meters, so a grid with gate-sized cells bounds
    // the candidate search. Mahalanobis gates are not, so check every pair.
    let grid = if config.metric == DistanceMetric::Euclidean && config.gate_distance.is_finite() {
        let mut grid = SpatialGrid::new(config.gate_distance);
        for (mi, det) in detections.iter().enumerate() {
            grid.insert(mi, det.position[0], det.position[1]);
        }
        Some(grid)
    } else {
        None
    };

    let per_track: Vec<Vec<(usize, usize, f64)>> = tracks
        .par_iter()
        .enumerate()
        .map(|(ti, track)| {
            let candidates = match &grid {
                Some(g) => g.query_nearby(track.state[0], track.state[1]),
                None => (0..n_meas).collect(),
            };
            candidates
                .into_iter()
                .filter_map(|mi| {
                    let det = &detections[mi];
                    let d = gate_distance(
                        config.metric,
                        &track.state,
                        &track.cov,
                        &det.pos(),
                        kf,
                        det.signal_quality,
                    );
                    (d.is_finite() && d <= config.gate_distance).then_some((ti, mi, d))
                })
                .collect()
        })
        .collect();

    let mut graph = BipartiteGraph::new(n_tracks, n_meas);
    for (ti, mi, d) in per_track.into_iter().flatten() {
        graph.add_edge(ti, mi, d);
    }

    let mut pairs = Vec::new();
    for comp in partition_components(&graph) {
        pairs.extend(hungarian_solve(&comp, config.dummy_cost).pairs);
    }
    pairs.sort_unstable();

    let mut track_matched = vec![false; n_tracks];
    let mut meas_matched = vec![false; n_meas];
    for &(ti, mi) in &pairs {
        track_matched[ti] = true;
        meas_matched[mi] = true;
    }

    Assignment {
        pairs,
        unmatched_tracks: (0..n_tracks).filter(|&i| !track_matched[i]).collect(),
        unmatched_meas: (0..n_meas).filter(|&j| !meas_matched[j]).collect(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
