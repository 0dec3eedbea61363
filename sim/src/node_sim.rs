//! Sensor-node detection simulator.
//!
//! Generates one `DetectionBatch` per node per tick with:
//! - Gaussian position noise
//! - Miss probability (1 - P_D)
//! - Poisson clutter spread uniformly over the node's coverage disc
//! - Signal quality falling off with range from the node

use crate::target::Target;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Normal, Poisson};
use serde::{Deserialize, Serialize};
use tracker_core::{Detection, DetectionBatch, DetectionId, NodeId};

/// Physical parameters of one simulated node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeParams {
    /// Node position in the shared frame
    pub position: [f64; 2],
    /// Targets beyond this range are never detected
    pub max_range: f64,
    /// 1σ position noise per axis
    pub noise_std: f64,
    /// Probability of detecting an in-range target
    pub p_detection: f64,
    /// Mean false alarms per tick
    pub clutter_rate: f64,
    /// Quality reported for a target at the node itself
    pub peak_quality: f64,
    /// Range at which quality has halved
    pub quality_range: f64,
}

impl Default for NodeParams {
    fn default() -> Self {
        Self {
            position: [0.0, 0.0],
            max_range: 200.0,
            noise_std: 0.5,
            p_detection: 0.95,
            clutter_rate: 0.2,
            peak_quality: 40.0,
            quality_range: 100.0,
        }
    }
}

impl NodeParams {
    /// Signal quality for a return at `range`.
    pub fn quality_at(&self, range: f64) -> f64 {
        let r = range / self.quality_range.max(f64::MIN_POSITIVE);
        self.peak_quality / (1.0 + r * r)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimNode {
    pub id: NodeId,
    pub params: NodeParams,
}

/// Generates detection batches from a set of targets.
pub struct NodeSimulator {
    pub nodes: Vec<SimNode>,
    rng: ChaCha8Rng,
    next_detection_id: u64,
}

impl NodeSimulator {
    pub fn new(nodes: Vec<SimNode>, seed: u64) -> Self {
        Self {
            nodes,
            rng: ChaCha8Rng::seed_from_u64(seed),
            next_detection_id: 0,
        }
    }

    /// One batch per node, stamped `t`.
    pub fn generate(&mut self, targets: &[Target], t: f64) -> Vec<DetectionBatch> {
        let mut batches = Vec::with_capacity(self.nodes.len());
        for i in 0..self.nodes.len() {
            let node = self.nodes[i].clone();
            batches.push(self.generate_for(&node, targets, t));
        }
        batches
    }

    /// One batch for a single node.
    pub fn generate_for(&mut self, node: &SimNode, targets: &[Target], t: f64) -> DetectionBatch {
        let p = &node.params;
        let noise = Normal::new(0.0, p.noise_std.max(0.0)).ok();
        let mut detections = Vec::new();

        // True detections
        for target in targets {
            if !target.is_active(t) {
                continue;
            }
            let [tx, ty] = target.position();
            let range = (tx - p.position[0]).hypot(ty - p.position[1]);
            if range > p.max_range {
                continue;
            }
            if self.rng.gen::<f64>() > p.p_detection {
                continue;
            }
            let (nx, ny) = match &noise {
                Some(n) => (n.sample(&mut self.rng), n.sample(&mut self.rng)),
                None => (0.0, 0.0),
            };
            let quality = p.quality_at(range);
            detections.push(self.detection(node.id, [tx + nx, ty + ny], quality, t));
        }

        // Clutter
        let n_clutter = match Poisson::new(p.clutter_rate) {
            Ok(poisson) => poisson.sample(&mut self.rng) as usize,
            Err(_) => 0,
        };
        for _ in 0..n_clutter {
            let r = p.max_range * self.rng.gen::<f64>().sqrt();
            let az = self.rng.gen::<f64>() * std::f64::consts::TAU;
            let pos = [p.position[0] + r * az.cos(), p.position[1] + r * az.sin()];
            // Clutter is weak: a fraction of what a real return at that range gives.
            let quality = p.quality_at(r) * self.rng.gen::<f64>() * 0.3;
            detections.push(self.detection(node.id, pos, quality, t));
        }

        DetectionBatch::new(node.id, t, detections)
    }

    fn detection(&mut self, node: NodeId, position: [f64; 2], quality: f64, t: f64) -> Detection {
        let id = DetectionId(self.next_detection_id);
        self.next_detection_id += 1;
        Detection {
            detection_id: id,
            source_node_id: node,
            position,
            signal_quality: quality,
            observed_at: t,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::MotionSpec;
    use tracker_core::types::InputLimits;

    fn ideal_node(id: u32, position: [f64; 2]) -> SimNode {
        SimNode {
            id: NodeId(id),
            params: NodeParams {
                position,
                noise_std: 0.0,
                p_detection: 1.0,
                clutter_rate: 0.0,
                ..Default::default()
            },
        }
    }

    #[test]
    fn ideal_node_reports_truth() {
        let targets = vec![
            Target::new(0, [10.0, 0.0], [0.0, 0.0], MotionSpec::ConstantVelocity),
            Target::new(1, [50.0, 0.0], [0.0, 0.0], MotionSpec::ConstantVelocity),
            Target::new(2, [500.0, 0.0], [0.0, 0.0], MotionSpec::ConstantVelocity),
        ];
        let mut sim = NodeSimulator::new(vec![ideal_node(1, [0.0, 0.0])], 7);
        let batches = sim.generate(&targets, 1.0);
        assert_eq!(batches.len(), 1);
        let dets = &batches[0].detections;
        assert_eq!(dets.len(), 2, "out-of-range target is not seen");
        assert_eq!(dets[0].position, [10.0, 0.0]);
        assert!(dets[0].signal_quality > dets[1].signal_quality);
        assert!(batches[0].validate(&InputLimits::default()).is_ok());
    }

    #[test]
    fn same_seed_same_batches() {
        let targets = vec![Target::new(0, [20.0, 5.0], [1.0, 0.0], MotionSpec::ConstantVelocity)];
        let node = SimNode {
            id: NodeId(2),
            params: NodeParams {
                clutter_rate: 3.0,
                ..Default::default()
            },
        };
        let run = || {
            let mut sim = NodeSimulator::new(vec![node.clone()], 42);
            (0..5).flat_map(|i| sim.generate(&targets, i as f64)).collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn detection_ids_are_unique_per_simulator() {
        let targets = vec![Target::new(0, [1.0, 1.0], [0.0, 0.0], MotionSpec::ConstantVelocity)];
        let mut sim = NodeSimulator::new(vec![ideal_node(1, [0.0, 0.0]), ideal_node(2, [5.0, 0.0])], 1);
        let batches = sim.generate(&targets, 0.0);
        assert_ne!(
            batches[0].detections[0].detection_id,
            batches[1].detections[0].detection_id
        );
    }
}
