//! Latest track snapshot per connected node.
//!
//! The outer lock only guards slot insertion and removal. Each slot has its
//! own mutex, so a session writing node A never contends with one writing
//! node B, and the fusion tick copies each slot out whole.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{info, warn};
use tracker_core::{metrics::TickStats, NodeId, TrackSnapshot};

#[derive(Debug, Clone)]
pub struct NodeSlot {
    pub snapshot: TrackSnapshot,
    pub last_seen: Instant,
    pub stale: bool,
    /// Tracker counters for nodes the server tracks on their behalf
    pub stats: Option<TickStats>,
}

/// Externally visible state of one node, served on `/api/v1/nodes`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    /// Timestamp of the latest stored snapshot
    pub timestamp: f64,
    pub tracks: usize,
    pub stale: bool,
    pub silent_ms: u64,
    pub stats: Option<TickStats>,
}

#[derive(Debug, Default)]
pub struct SnapshotTable {
    slots: RwLock<HashMap<NodeId, Arc<Mutex<NodeSlot>>>>,
}

impl SnapshotTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a slot for `node`. Returns false if one is already active.
    pub fn register(&self, node: NodeId) -> bool {
        let mut slots = self.slots.write();
        if slots.contains_key(&node) {
            return false;
        }
        slots.insert(
            node,
            Arc::new(Mutex::new(NodeSlot {
                snapshot: TrackSnapshot::empty(node, 0.0),
                last_seen: Instant::now(),
                stale: false,
                stats: None,
            })),
        );
        true
    }

    fn slot(&self, node: NodeId) -> Option<Arc<Mutex<NodeSlot>>> {
        self.slots.read().get(&node).cloned()
    }

    /// Replace the node's snapshot. Returns false if the node has no slot.
    pub fn publish(&self, node: NodeId, snapshot: TrackSnapshot) -> bool {
        self.publish_with_stats(node, snapshot, None)
    }

    pub fn publish_with_stats(
        &self,
        node: NodeId,
        snapshot: TrackSnapshot,
        stats: Option<TickStats>,
    ) -> bool {
        let Some(slot) = self.slot(node) else {
            return false;
        };
        let mut slot = slot.lock();
        if slot.stale {
            info!(node = %node, "node resumed");
        }
        slot.snapshot = snapshot;
        slot.last_seen = Instant::now();
        slot.stale = false;
        if stats.is_some() {
            slot.stats = stats;
        }
        true
    }

    /// Replace the tracker counters without touching the snapshot, e.g.
    /// after a rejected or rolled-back tick.
    pub fn set_stats(&self, node: NodeId, stats: TickStats) {
        if let Some(slot) = self.slot(node) {
            slot.lock().stats = Some(stats);
        }
    }

    /// Mark the node as heard from without changing its tracks.
    pub fn touch(&self, node: NodeId) {
        if let Some(slot) = self.slot(node) {
            slot.lock().last_seen = Instant::now();
        }
    }

    pub fn remove(&self, node: NodeId) -> bool {
        self.slots.write().remove(&node).is_some()
    }

    /// Snapshots of every node heard from within `timeout`, ascending node id.
    pub fn collect_live(&self, timeout: Duration) -> Vec<TrackSnapshot> {
        self.collect_live_at(Instant::now(), timeout)
    }

    pub fn collect_live_at(&self, now: Instant, timeout: Duration) -> Vec<TrackSnapshot> {
        let slots: Vec<(NodeId, Arc<Mutex<NodeSlot>>)> = self
            .slots
            .read()
            .iter()
            .map(|(id, slot)| (*id, Arc::clone(slot)))
            .collect();

        let mut live = Vec::with_capacity(slots.len());
        for (node, slot) in slots {
            let mut slot = slot.lock();
            let silent = now.saturating_duration_since(slot.last_seen);
            if silent > timeout {
                if !slot.stale {
                    warn!(node = %node, silent_ms = silent.as_millis() as u64, "node stale, excluded from fusion");
                    slot.stale = true;
                }
                continue;
            }
            slot.stale = false;
            live.push(slot.snapshot.clone());
        }
        live.sort_by_key(|s| s.node_id);
        live
    }

    /// Per-node status, ascending node id.
    pub fn status(&self) -> Vec<NodeStatus> {
        let now = Instant::now();
        let slots: Vec<(NodeId, Arc<Mutex<NodeSlot>>)> = self
            .slots
            .read()
            .iter()
            .map(|(id, slot)| (*id, Arc::clone(slot)))
            .collect();
        let mut status: Vec<NodeStatus> = slots
            .into_iter()
            .map(|(node_id, slot)| {
                let slot = slot.lock();
                NodeStatus {
                    node_id,
                    timestamp: slot.snapshot.timestamp,
                    tracks: slot.snapshot.tracks.len(),
                    stale: slot.stale,
                    silent_ms: now.saturating_duration_since(slot.last_seen).as_millis() as u64,
                    stats: slot.stats.clone(),
                }
            })
            .collect();
        status.sort_by_key(|s| s.node_id);
        status
    }

    /// Detections dropped by the per-tick cap, summed over all nodes.
    pub fn dropped_detections(&self) -> u64 {
        self.status()
            .iter()
            .filter_map(|s| s.stats.as_ref())
            .map(|s| s.dropped_detections)
            .sum()
    }

    pub fn get(&self, node: NodeId) -> Option<NodeSlot> {
        self.slot(node).map(|slot| slot.lock().clone())
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.slots.read().keys().copied().collect();
        nodes.sort();
        nodes
    }
}
